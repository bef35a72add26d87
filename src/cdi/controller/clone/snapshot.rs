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

//! Smart clone: snapshot the source (unless it already is one), restore the
//! target from the snapshot, then grow it to the requested size.

use super::planner::{CloneSource, ClonePlan};
use super::{claim_owner, desired_size, CloneEngine, CloneProgress, ANN_DESIRED_SIZE};
use crate::cdi::api::annotations::{ANN_CLONE_TYPE, LABEL_APP, LABEL_APP_VALUE};
use crate::cdi::api::datavolume::{DataVolume, DataVolumePhase};
use crate::cdi::api::storageprofile::CloneStrategy;
use crate::cdi::client::ClientError;
use crate::cdi::controller::events::{EXPANSION_IN_PROGRESS, SNAPSHOT_FOR_SMART_CLONE_IN_PROGRESS};
use crate::cdi::controller::reconcile::ReconcileError;
use crate::cdi::k8s::meta::ObjectMeta;
use crate::cdi::k8s::storage::{VolumeSnapshot, VolumeSnapshotSource, VolumeSnapshotSpec};
use crate::cdi::k8s::volume::{PersistentVolumeClaim, TypedLocalObjectReference};
use crate::cdi::logger::log_debug;
use crate::cdi::util::quantity::format_quantity;

const COMPONENT: &str = "clone-engine";

pub const SNAPSHOT_API_GROUP: &str = "snapshot.storage.k8s.io";

/// Name of the snapshot taken on behalf of a DataVolume.
pub fn snapshot_name(dv: &DataVolume) -> String {
    format!("cdi-tmp-{}", dv.metadata.uid())
}

pub fn snapshot_data_source(name: &str) -> TypedLocalObjectReference {
    TypedLocalObjectReference {
        api_group: Some(SNAPSHOT_API_GROUP.to_string()),
        kind: "VolumeSnapshot".to_string(),
        name: name.to_string(),
    }
}

impl CloneEngine {
    pub(super) async fn start_snapshot(
        &self,
        dv: &DataVolume,
        plan: &ClonePlan,
        source: &CloneSource,
        mut base: PersistentVolumeClaim,
    ) -> Result<CloneProgress, ReconcileError> {
        let (snapshot, phase) = match source {
            CloneSource::Snapshot(snapshot) => (
                snapshot.clone(),
                DataVolumePhase::CloneFromSnapshotSourceInProgress,
            ),
            CloneSource::Claim(claim) => {
                let snapshot = self.ensure_snapshot(dv, claim).await?;
                (snapshot, DataVolumePhase::SmartClonePVCInProgress)
            }
        };
        if !snapshot.is_ready() {
            log_debug(
                COMPONENT,
                "Waiting for snapshot",
                &[("snapshot", snapshot.metadata.name())],
            );
            return Ok(CloneProgress::new(
                DataVolumePhase::SnapshotForSmartCloneInProgress,
                None,
            ));
        }

        let desired = base.requested_storage();
        if plan.expand {
            if let Some(restore) = snapshot.restore_size() {
                base.spec
                    .resources
                    .requests
                    .insert("storage".to_string(), format_quantity(restore));
            }
        }
        if let Some(desired) = desired {
            base.metadata
                .set_annotation(ANN_DESIRED_SIZE, format_quantity(desired));
        }
        base.metadata
            .set_annotation(ANN_CLONE_TYPE, CloneStrategy::Snapshot.as_str());
        base.spec.data_source = Some(snapshot_data_source(snapshot.metadata.name()));
        let claim = self.create_target(base).await?;
        Ok(CloneProgress::new(phase, Some(claim)))
    }

    async fn ensure_snapshot(
        &self,
        dv: &DataVolume,
        source: &PersistentVolumeClaim,
    ) -> Result<VolumeSnapshot, ClientError> {
        let namespace = source.metadata.namespace();
        let name = snapshot_name(dv);
        if let Some(existing) = self.snapshots.get_opt(namespace, &name).await? {
            return Ok(existing);
        }
        let class = self
            .profiles
            .lookup(source.storage_class())
            .await?
            .and_then(|profile| profile.snapshot_class.clone());
        let mut metadata = ObjectMeta::named(Some(namespace), &name);
        metadata
            .labels
            .insert(LABEL_APP.to_string(), LABEL_APP_VALUE.to_string());
        metadata.owner_references = claim_owner(dv, namespace);
        let snapshot = VolumeSnapshot {
            metadata,
            spec: VolumeSnapshotSpec {
                source: VolumeSnapshotSource {
                    persistent_volume_claim_name: Some(source.metadata.name().to_string()),
                    volume_snapshot_content_name: None,
                },
                volume_snapshot_class_name: class,
            },
            status: None,
        };
        let created = match self.snapshots.create(&snapshot).await {
            Ok(created) => created,
            Err(ClientError::AlreadyExists) => self.snapshots.get(namespace, &name).await?,
            Err(err) => return Err(err),
        };
        self.recorder
            .normal(
                dv,
                SNAPSHOT_FOR_SMART_CLONE_IN_PROGRESS,
                &format!(
                    "Creating snapshot for smart-clone is in progress (for pvc {}/{})",
                    namespace,
                    source.metadata.name()
                ),
            )
            .await;
        Ok(created)
    }

    pub(super) async fn progress_snapshot(
        &self,
        dv: &DataVolume,
        mut claim: PersistentVolumeClaim,
    ) -> Result<CloneProgress, ReconcileError> {
        let restoring = if claim
            .spec
            .data_source
            .as_ref()
            .map(|source| source.name == snapshot_name(dv))
            .unwrap_or(false)
        {
            DataVolumePhase::SmartClonePVCInProgress
        } else {
            DataVolumePhase::CloneFromSnapshotSourceInProgress
        };
        if !claim.is_bound() {
            return Ok(CloneProgress::new(restoring, Some(claim)));
        }

        let desired = desired_size(&claim);
        let capacity = claim.capacity();
        if let (Some(desired), Some(capacity)) = (desired, capacity) {
            if capacity < desired {
                if claim.requested_storage().unwrap_or(0) < desired {
                    claim
                        .spec
                        .resources
                        .requests
                        .insert("storage".to_string(), format_quantity(desired));
                    claim = self.claims.update(&claim).await?;
                    self.recorder
                        .normal(dv, EXPANSION_IN_PROGRESS, "Expanding the cloned volume")
                        .await;
                }
                return Ok(CloneProgress::new(
                    DataVolumePhase::ExpansionInProgress,
                    Some(claim),
                ));
            }
        }

        if restoring == DataVolumePhase::SmartClonePVCInProgress {
            self.snapshots
                .delete_opt(dv.metadata.namespace(), &snapshot_name(dv))
                .await?;
        }
        let claim = self.mark_populated(claim).await?;
        Ok(CloneProgress::new(DataVolumePhase::Succeeded, Some(claim)))
    }
}
