/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Clone engine. Picks a strategy through the [`planner`], creates the
//! intermediate artifacts and the target claim, and reports which phase the
//! copy is in. Host-assisted copies are handed to the claim-level host clone
//! controller through the clone request annotation.

pub mod csi;
pub mod host;
pub mod planner;
pub mod snapshot;

use super::events::{EventRecorder, CLONE_SUCCEEDED};
use super::reconcile::ReconcileError;
use crate::cdi::api::annotations::{
    ANN_CLONE_OF, ANN_CLONE_TOKEN, ANN_CLONE_TYPE, ANN_EXTENDED_CLONE_TOKEN, ANN_POD_PHASE,
};
use crate::cdi::api::datavolume::{DataVolume, DataVolumePhase};
use crate::cdi::api::storageprofile::CloneStrategy;
use crate::cdi::client::{Api, ClientError, ClusterClient};
use crate::cdi::k8s::pod::POD_SUCCEEDED;
use crate::cdi::k8s::resource::Resource;
use crate::cdi::k8s::storage::VolumeSnapshot;
use crate::cdi::k8s::volume::{PersistentVolumeClaim, PersistentVolumeClaimSpec};
use crate::cdi::logger::log_info;
use crate::cdi::storage::ProfileRegistry;
use crate::cdi::token::keys::KeyStore;
use crate::cdi::token::{TokenError, PARAM_UID};
use planner::{plan, CloneSource, ClonePlan, PlanError, PlanInput};
use std::sync::Arc;

const COMPONENT: &str = "clone-engine";

/// Size the target must reach once provisioning and expansion are done.
pub const ANN_DESIRED_SIZE: &str = "cdi.kubevirt.io/storage.clone.desiredSize";

/// Where a clone reads from, as named by the intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloneRef {
    Claim { namespace: String, name: String },
    Snapshot { namespace: String, name: String },
}

impl CloneRef {
    pub fn namespace(&self) -> &str {
        match self {
            CloneRef::Claim { namespace, .. } | CloneRef::Snapshot { namespace, .. } => namespace,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            CloneRef::Claim { name, .. } | CloneRef::Snapshot { name, .. } => name,
        }
    }
}

/// Where a clone stands after one pass.
#[derive(Debug, Clone)]
pub struct CloneProgress {
    pub phase: DataVolumePhase,
    pub claim: Option<PersistentVolumeClaim>,
}

impl CloneProgress {
    fn new(phase: DataVolumePhase, claim: Option<PersistentVolumeClaim>) -> Self {
        CloneProgress { phase, claim }
    }
}

pub struct CloneEngine {
    claims: Api<PersistentVolumeClaim>,
    snapshots: Api<VolumeSnapshot>,
    profiles: Arc<ProfileRegistry>,
    keys: Arc<KeyStore>,
    recorder: EventRecorder,
}

impl CloneEngine {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        profiles: Arc<ProfileRegistry>,
        keys: Arc<KeyStore>,
        recorder: EventRecorder,
    ) -> Self {
        CloneEngine {
            claims: Api::new(Arc::clone(&client)),
            snapshots: Api::new(client),
            profiles,
            keys,
            recorder,
        }
    }

    pub async fn source(&self, reference: &CloneRef) -> Result<Option<CloneSource>, ClientError> {
        Ok(match reference {
            CloneRef::Claim { namespace, name } => self
                .claims
                .get_opt(namespace, name)
                .await?
                .map(CloneSource::Claim),
            CloneRef::Snapshot { namespace, name } => self
                .snapshots
                .get_opt(namespace, name)
                .await?
                .map(CloneSource::Snapshot),
        })
    }

    /// A source is usable once it is bound (or ready) and any population
    /// it is undergoing has finished.
    pub fn source_ready(source: &CloneSource) -> bool {
        match source {
            CloneSource::Claim(claim) => {
                claim.is_bound()
                    && claim
                        .metadata
                        .annotation(ANN_POD_PHASE)
                        .map(|phase| phase == POD_SUCCEEDED)
                        .unwrap_or(true)
            }
            CloneSource::Snapshot(snapshot) => snapshot.is_ready(),
        }
    }

    /// Cross-namespace clones carry a token minted at admission; it is
    /// checked again here so a stale or swapped annotation cannot pass.
    /// Once the controller has extended it, only the extended token counts.
    pub async fn validate_token(&self, dv: &DataVolume, reference: &CloneRef) -> Result<(), TokenError> {
        let meta = &dv.metadata;
        if reference.namespace() == meta.namespace() {
            return Ok(());
        }
        let payload = match meta.annotation(ANN_EXTENDED_CLONE_TOKEN) {
            Some(token) => {
                let payload = self.keys.extended_clone_token_validator().await?.validate(token)?;
                if payload.params.get(PARAM_UID).map(String::as_str) != Some(meta.uid()) {
                    return Err(TokenError::Mismatch(
                        "extended token is not bound to this DataVolume".to_string(),
                    ));
                }
                payload
            }
            None => {
                let token = meta
                    .annotation(ANN_CLONE_TOKEN)
                    .ok_or_else(|| TokenError::Invalid("clone token missing".to_string()))?;
                self.keys.clone_token_validator().await?.validate(token)?
            }
        };
        payload.verify_clone(
            reference.namespace(),
            reference.name(),
            meta.namespace(),
            meta.name(),
            Some(meta.uid()),
        )
    }

    /// Trades a valid admission token for a long-lived one bound to the
    /// DataVolume uid. `None` when there is nothing to extend.
    pub async fn extend_token(
        &self,
        dv: &DataVolume,
        reference: &CloneRef,
    ) -> Result<Option<String>, TokenError> {
        let meta = &dv.metadata;
        if reference.namespace() == meta.namespace()
            || meta.annotation(ANN_EXTENDED_CLONE_TOKEN).is_some()
        {
            return Ok(None);
        }
        let Some(token) = meta.annotation(ANN_CLONE_TOKEN) else {
            return Ok(None);
        };
        let payload = self.keys.clone_token_validator().await?.validate(token)?;
        payload.verify_clone(
            reference.namespace(),
            reference.name(),
            meta.namespace(),
            meta.name(),
            Some(meta.uid()),
        )?;
        let extended = payload.with_param(PARAM_UID, meta.uid());
        self.keys
            .extended_clone_token_generator()
            .await?
            .generate(&extended)
            .map(Some)
    }

    pub async fn plan(
        &self,
        dv: &DataVolume,
        source: &CloneSource,
        target: &PersistentVolumeClaimSpec,
        forced: Option<CloneStrategy>,
    ) -> Result<Result<ClonePlan, PlanError>, ClientError> {
        let source_volume_mode = match source {
            CloneSource::Claim(claim) => claim.volume_mode().to_string(),
            CloneSource::Snapshot(snapshot) => self.snapshot_volume_mode(snapshot, target).await?,
        };
        let source_class = match source {
            CloneSource::Claim(claim) => claim.storage_class().map(str::to_string),
            CloneSource::Snapshot(_) => target.storage_class_name.clone(),
        };
        let source_profile = match &source_class {
            Some(class) => self.profiles.lookup(Some(class)).await?,
            None => None,
        };
        let target_profile = self
            .profiles
            .lookup(target.storage_class_name.as_deref())
            .await?;
        Ok(plan(&PlanInput {
            source,
            source_volume_mode: &source_volume_mode,
            source_profile: source_profile.as_deref(),
            target,
            target_namespace: dv.metadata.namespace(),
            target_profile: target_profile.as_deref(),
            content_type: dv.spec.content_type(),
            forced,
        }))
    }

    /// Snapshots do not record a volume mode; the source claim does when it
    /// is still around.
    async fn snapshot_volume_mode(
        &self,
        snapshot: &VolumeSnapshot,
        target: &PersistentVolumeClaimSpec,
    ) -> Result<String, ClientError> {
        if let Some(name) = &snapshot.spec.source.persistent_volume_claim_name {
            if let Some(claim) = self
                .claims
                .get_opt(snapshot.metadata.namespace(), name)
                .await?
            {
                return Ok(claim.volume_mode().to_string());
            }
        }
        Ok(target.volume_mode_or_default().to_string())
    }

    /// Creates whatever the plan needs first and, once possible, the target
    /// claim built from `base`.
    pub async fn start(
        &self,
        dv: &DataVolume,
        clone_plan: &ClonePlan,
        source: &CloneSource,
        base: PersistentVolumeClaim,
    ) -> Result<CloneProgress, ReconcileError> {
        log_info(
            COMPONENT,
            "Starting clone",
            &[
                ("namespace", dv.metadata.namespace()),
                ("datavolume", dv.metadata.name()),
                ("strategy", clone_plan.strategy.as_str()),
                ("source", source.name()),
            ],
        );
        match clone_plan.strategy {
            CloneStrategy::Snapshot => self.start_snapshot(dv, clone_plan, source, base).await,
            CloneStrategy::CsiClone => self.start_csi(source, base).await,
            CloneStrategy::HostAssisted => self.start_host(dv, clone_plan, source, base).await,
        }
    }

    /// Advances a clone whose target claim exists.
    pub async fn progress(
        &self,
        dv: &DataVolume,
        claim: PersistentVolumeClaim,
    ) -> Result<CloneProgress, ReconcileError> {
        let strategy = claim
            .metadata
            .annotation(ANN_CLONE_TYPE)
            .and_then(|value| value.parse::<CloneStrategy>().ok())
            .unwrap_or(CloneStrategy::HostAssisted);
        match strategy {
            CloneStrategy::Snapshot => self.progress_snapshot(dv, claim).await,
            CloneStrategy::CsiClone => self.progress_csi(dv, claim).await,
            CloneStrategy::HostAssisted => self.progress_host(dv, claim).await,
        }
    }

    async fn create_target(&self, claim: PersistentVolumeClaim) -> Result<PersistentVolumeClaim, ClientError> {
        match self.claims.create(&claim).await {
            Ok(created) => Ok(created),
            Err(ClientError::AlreadyExists) => {
                self.claims
                    .get(claim.metadata.namespace(), claim.metadata.name())
                    .await
            }
            Err(err) => Err(err),
        }
    }

    /// Records a storage-level clone as populated on the target claim.
    async fn mark_populated(
        &self,
        mut claim: PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, ClientError> {
        let mut changed = claim.metadata.set_annotation(ANN_POD_PHASE, POD_SUCCEEDED);
        changed |= claim.metadata.set_annotation(ANN_CLONE_OF, "true");
        if !changed {
            return Ok(claim);
        }
        let updated = self.claims.update(&claim).await?;
        self.recorder
            .normal(&updated, CLONE_SUCCEEDED, "Clone Successful")
            .await;
        Ok(updated)
    }
}

/// Target claim size recorded at creation, falling back to the request.
fn desired_size(claim: &PersistentVolumeClaim) -> Option<i64> {
    claim
        .metadata
        .annotation(ANN_DESIRED_SIZE)
        .and_then(|value| crate::cdi::util::quantity::parse_quantity(value).ok())
        .or_else(|| claim.requested_storage())
}

fn claim_owner(dv: &DataVolume, namespace: &str) -> Vec<crate::cdi::k8s::meta::OwnerReference> {
    if dv.metadata.namespace() == namespace {
        vec![dv.owner_reference(false)]
    } else {
        Vec::new()
    }
}
