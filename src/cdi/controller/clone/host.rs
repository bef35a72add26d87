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

//! Host-assisted copy. The target claim gets a clone request; the host clone
//! controller pairs the reader and writer pods. Snapshot sources are first
//! restored into a temporary claim the reader can mount.

use super::planner::{CloneSource, ClonePlan};
use super::{claim_owner, CloneEngine, CloneProgress};
use crate::cdi::api::annotations::{
    ANN_CLONE_REQUEST, ANN_CLONE_TYPE, ANN_POD_PHASE, LABEL_APP, LABEL_APP_VALUE,
};
use crate::cdi::api::datavolume::{DataVolume, DataVolumePhase};
use crate::cdi::api::storageprofile::CloneStrategy;
use crate::cdi::client::ClientError;
use crate::cdi::controller::events::CLONE_SCHEDULED;
use crate::cdi::controller::hostclone::parse_clone_request;
use crate::cdi::controller::pods::{worker_restarts, WORKER_RETRY_LIMIT};
use crate::cdi::controller::reconcile::ReconcileError;
use crate::cdi::k8s::meta::ObjectMeta;
use crate::cdi::k8s::pod::{POD_FAILED, POD_RUNNING, POD_SUCCEEDED};
use crate::cdi::k8s::storage::VolumeSnapshot;
use crate::cdi::k8s::volume::{PersistentVolumeClaim, PersistentVolumeClaimSpec};
use crate::cdi::logger::log_info;
use crate::cdi::util::quantity::format_quantity;

const COMPONENT: &str = "clone-engine";

/// Claim a snapshot is restored into for a host copy.
pub fn temporary_claim_name(target: &str) -> String {
    format!("tmp-source-pvc-{target}")
}

impl CloneEngine {
    pub(super) async fn start_host(
        &self,
        dv: &DataVolume,
        plan: &ClonePlan,
        source: &CloneSource,
        mut base: PersistentVolumeClaim,
    ) -> Result<CloneProgress, ReconcileError> {
        let request = match source {
            CloneSource::Claim(claim) => {
                format!("{}/{}", claim.metadata.namespace(), claim.metadata.name())
            }
            CloneSource::Snapshot(snapshot) => {
                if !plan.temporary_source {
                    return Err(ReconcileError::Invalid(
                        "host copies from a snapshot need a temporary claim".to_string(),
                    ));
                }
                let temporary = self.ensure_temporary_claim(dv, snapshot, &base).await?;
                format!(
                    "{}/{}",
                    temporary.metadata.namespace(),
                    temporary.metadata.name()
                )
            }
        };
        base.metadata.set_annotation(ANN_CLONE_REQUEST, request);
        base.metadata
            .set_annotation(ANN_CLONE_TYPE, CloneStrategy::HostAssisted.as_str());
        let claim = self.create_target(base).await?;
        self.recorder
            .normal(dv, CLONE_SCHEDULED, "Cloning from the source volume scheduled")
            .await;
        Ok(CloneProgress::new(DataVolumePhase::CloneScheduled, Some(claim)))
    }

    async fn ensure_temporary_claim(
        &self,
        dv: &DataVolume,
        snapshot: &VolumeSnapshot,
        target: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, ClientError> {
        let namespace = snapshot.metadata.namespace();
        let name = temporary_claim_name(target.metadata.name());
        if let Some(existing) = self.claims.get_opt(namespace, &name).await? {
            return Ok(existing);
        }
        let mut metadata = ObjectMeta::named(Some(namespace), &name);
        metadata
            .labels
            .insert(LABEL_APP.to_string(), LABEL_APP_VALUE.to_string());
        metadata.owner_references = claim_owner(dv, namespace);
        let mut spec = PersistentVolumeClaimSpec {
            access_modes: target.spec.access_modes.clone(),
            storage_class_name: target.spec.storage_class_name.clone(),
            volume_mode: target.spec.volume_mode.clone(),
            data_source: Some(super::snapshot::snapshot_data_source(
                snapshot.metadata.name(),
            )),
            ..Default::default()
        };
        if let Some(size) = snapshot.restore_size().or_else(|| target.requested_storage()) {
            spec.resources
                .requests
                .insert("storage".to_string(), format_quantity(size));
        }
        log_info(
            COMPONENT,
            "Restoring snapshot into temporary source claim",
            &[
                ("namespace", namespace),
                ("claim", name.as_str()),
                ("snapshot", snapshot.metadata.name()),
            ],
        );
        let claim = PersistentVolumeClaim {
            metadata,
            spec,
            status: None,
        };
        match self.claims.create(&claim).await {
            Ok(created) => Ok(created),
            Err(ClientError::AlreadyExists) => self.claims.get(namespace, &name).await,
            Err(err) => Err(err),
        }
    }

    pub(super) async fn progress_host(
        &self,
        _dv: &DataVolume,
        claim: PersistentVolumeClaim,
    ) -> Result<CloneProgress, ReconcileError> {
        let phase = host_copy_phase(&claim);
        if phase.is_succeeded() {
            self.remove_temporary_claim(&claim).await?;
        }
        Ok(CloneProgress::new(phase, Some(claim)))
    }

    async fn remove_temporary_claim(&self, claim: &PersistentVolumeClaim) -> Result<(), ClientError> {
        let Some((namespace, name)) = claim
            .metadata
            .annotation(ANN_CLONE_REQUEST)
            .and_then(parse_clone_request)
        else {
            return Ok(());
        };
        if name != temporary_claim_name(claim.metadata.name()) {
            return Ok(());
        }
        if self.claims.delete_opt(namespace, name).await? {
            log_info(
                COMPONENT,
                "Removed temporary source claim",
                &[("namespace", namespace), ("claim", name)],
            );
        }
        Ok(())
    }
}

/// A failed pod pair only fails the copy once the host clone controller has
/// no retries left; until then the copy stays in progress.
fn host_copy_phase(claim: &PersistentVolumeClaim) -> DataVolumePhase {
    match claim.metadata.annotation(ANN_POD_PHASE) {
        Some(POD_SUCCEEDED) => DataVolumePhase::Succeeded,
        Some(POD_RUNNING) => DataVolumePhase::CloneInProgress,
        Some(POD_FAILED) if worker_restarts(claim) >= WORKER_RETRY_LIMIT => DataVolumePhase::Failed,
        Some(POD_FAILED) => DataVolumePhase::CloneInProgress,
        Some(_) if worker_restarts(claim) > 0 => DataVolumePhase::CloneInProgress,
        _ => DataVolumePhase::CloneScheduled,
    }
}
