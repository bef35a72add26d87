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

//! ObjectTransfer controller: moves a bound claim to another namespace or
//! name by parking its volume, deleting the source and re-binding the volume
//! to a recreated claim.

use super::events::{EventRecorder, TRANSFER_ERROR};
use super::informer::{Controller, ControllerOptions, WatchSpec};
use super::reconcile::{
    ReconcileContext, ReconcileError, ReconcileFuture, ReconcileOutcome, ReconcileResult,
    Reconciler,
};
use super::runtime::ObjectKey;
use crate::cdi::api::annotations::{ANN_BIND_COMPLETED, ANN_OBJECT_TRANSFER_NAME};
use crate::cdi::api::conditions::{set_condition, CONDITION_COMPLETE, STATUS_FALSE, STATUS_TRUE};
use crate::cdi::api::transfer::{
    ObjectTransfer, TransferPhase, DATA_PV_NAME, DATA_PV_RECLAIM, DATA_SOURCE,
};
use crate::cdi::client::Api;
use crate::cdi::k8s::meta::ObjectReference;
use crate::cdi::k8s::pod::Pod;
use crate::cdi::k8s::resource::ResourceKind;
use crate::cdi::k8s::volume::{PersistentVolume, PersistentVolumeClaim, RECLAIM_DELETE, RECLAIM_RETAIN};
use crate::cdi::logger::{log_debug, log_info};
use std::sync::Arc;
use std::time::Duration;

const NAME: &str = "objecttransfer-controller";

pub const FINALIZER: &str = "cdi.kubevirt.io/objectTransfer";

const CLONE_PROTECTION: &str = "provisioner.storage.kubernetes.io/cloning-protection";
const SNAPSHOT_PROTECTION: &str = "snapshot.storage.kubernetes.io/pvc-as-source-protection";

const POD_RECHECK: Duration = Duration::from_secs(2);

fn set_complete(transfer: &mut ObjectTransfer, status: &str, reason: &str, message: &str) {
    set_condition(
        &mut transfer.status_mut().conditions,
        CONDITION_COMPLETE,
        status,
        reason,
        message,
    );
}

/// Parks the transfer in its current phase with an explanation.
fn blocked(transfer: &mut ObjectTransfer, message: &str) {
    set_complete(transfer, STATUS_FALSE, "", message);
}

fn mark_running(transfer: &mut ObjectTransfer, message: &str) {
    transfer.status_mut().phase = TransferPhase::Running;
    set_complete(transfer, STATUS_FALSE, "", message);
}

fn mark_failed(transfer: &mut ObjectTransfer, message: &str) {
    transfer.status_mut().phase = TransferPhase::Error;
    set_complete(transfer, STATUS_FALSE, "", message);
}

fn is_claim_kind(kind: &str) -> bool {
    kind.eq_ignore_ascii_case("PersistentVolumeClaim")
}

fn has_required_annotations(transfer: &ObjectTransfer, claim: &PersistentVolumeClaim) -> bool {
    transfer
        .spec
        .source
        .required_annotations
        .iter()
        .all(|(key, value)| claim.metadata.annotation(key) == Some(value.as_str()))
}

/// Rebuilds the recorded source claim under the target's identity.
pub fn target_claim(transfer: &ObjectTransfer) -> Result<PersistentVolumeClaim, ReconcileError> {
    let recorded = transfer
        .status
        .as_ref()
        .and_then(|status| status.data.get(DATA_SOURCE))
        .ok_or_else(|| ReconcileError::Invalid("source spec missing".to_string()))?;
    let mut claim: PersistentVolumeClaim = serde_json::from_str(recorded)
        .map_err(|err| ReconcileError::Invalid(format!("recorded source is unreadable: {err}")))?;

    let meta = &mut claim.metadata;
    meta.namespace = Some(transfer.target_namespace().to_string());
    meta.name = Some(transfer.target_name().to_string());
    meta.generate_name = None;
    meta.uid = None;
    meta.resource_version = None;
    meta.generation = None;
    meta.creation_timestamp = None;
    meta.deletion_timestamp = None;
    if transfer.target_namespace() != transfer.spec.source.namespace {
        meta.owner_references.clear();
    }
    meta.remove_annotation(ANN_OBJECT_TRANSFER_NAME);
    meta.remove_annotation(ANN_BIND_COMPLETED);
    claim.status = None;
    Ok(claim)
}

pub struct ObjectTransferReconciler {
    transfers: Api<ObjectTransfer>,
    claims: Api<PersistentVolumeClaim>,
    volumes: Api<PersistentVolume>,
    pods: Api<Pod>,
    recorder: EventRecorder,
}

impl ObjectTransferReconciler {
    pub fn new(ctx: &ReconcileContext) -> Result<Self, ReconcileError> {
        let client = ctx.client()?;
        Ok(ObjectTransferReconciler {
            transfers: Api::new(Arc::clone(&client)),
            claims: Api::new(Arc::clone(&client)),
            volumes: Api::new(Arc::clone(&client)),
            pods: Api::new(Arc::clone(&client)),
            recorder: EventRecorder::new(client, NAME),
        })
    }

    pub fn controller(ctx: &ReconcileContext, options: ControllerOptions) -> Result<Controller, ReconcileError> {
        Ok(Controller::new(Arc::new(Self::new(ctx)?), options)
            .watch(WatchSpec::primary(ResourceKind::ObjectTransfer))
            .watch(WatchSpec::all_of(
                ResourceKind::PersistentVolumeClaim,
                ResourceKind::ObjectTransfer,
            ))
            .watch(WatchSpec::all_of(
                ResourceKind::PersistentVolume,
                ResourceKind::ObjectTransfer,
            )))
    }

    async fn sync(&self, key: &ObjectKey) -> ReconcileResult {
        let Some(original) = self.transfers.get_opt("", &key.name).await? else {
            return Ok(ReconcileOutcome::Done);
        };
        log_debug(
            NAME,
            "Handling transfer",
            &[
                ("transfer", key.name.as_str()),
                ("phase", original.phase().as_str()),
                ("source", original.spec.source.name.as_str()),
                ("targetNamespace", original.target_namespace()),
                ("targetName", original.target_name()),
            ],
        );

        let mut transfer = original.clone();
        let deleting = transfer.metadata.is_deleting();
        let result = match transfer.phase() {
            TransferPhase::Empty => self.initialize(&mut transfer).await,
            TransferPhase::Pending if deleting => return self.release(transfer).await,
            TransferPhase::Pending => self.pending(&mut transfer).await,
            TransferPhase::Error if deleting => return self.release(transfer).await,
            TransferPhase::Running => self.running(&mut transfer).await,
            TransferPhase::Error => Ok(ReconcileOutcome::Done),
            TransferPhase::Complete => return self.release(transfer).await,
        };

        match result {
            Ok(outcome) => {
                self.persist(&original, &transfer).await?;
                Ok(outcome)
            }
            Err(err) if err.is_conflict() => Err(err),
            Err(err) => {
                let message = err.to_string();
                if transfer.phase() == TransferPhase::Running {
                    transfer.status_mut().phase = TransferPhase::Error;
                }
                set_complete(&mut transfer, STATUS_FALSE, "Error", &message);
                self.persist(&original, &transfer).await?;
                self.recorder.warning(&transfer, TRANSFER_ERROR, &message).await;
                Err(err)
            }
        }
    }

    async fn persist(&self, original: &ObjectTransfer, transfer: &ObjectTransfer) -> Result<(), ReconcileError> {
        if transfer.status != original.status {
            self.transfers.update_status(transfer).await?;
        }
        Ok(())
    }

    async fn initialize(&self, transfer: &mut ObjectTransfer) -> ReconcileResult {
        if transfer.metadata.add_finalizer(FINALIZER) {
            let updated = self.transfers.update(transfer).await?;
            transfer.metadata = updated.metadata;
        }
        transfer.status_mut().phase = TransferPhase::Pending;
        blocked(transfer, "Initializing");
        Ok(ReconcileOutcome::Done)
    }

    async fn release(&self, mut transfer: ObjectTransfer) -> ReconcileResult {
        if transfer.metadata.remove_finalizer(FINALIZER) {
            self.transfers.update(&transfer).await?;
        }
        Ok(ReconcileOutcome::Done)
    }

    async fn pending(&self, transfer: &mut ObjectTransfer) -> ReconcileResult {
        let source = transfer.spec.source.clone();
        if !is_claim_kind(&source.kind) {
            mark_failed(transfer, &format!("invalid kind {:?}", source.kind));
            return Ok(ReconcileOutcome::Done);
        }
        let Some(mut claim) = self.claims.get_opt(&source.namespace, &source.name).await? else {
            blocked(transfer, "No source");
            return Ok(ReconcileOutcome::Done);
        };
        let Some(volume_name) = claim.spec.volume_name.clone().filter(|_| claim.is_bound()) else {
            blocked(transfer, "PVC not bound");
            return Ok(ReconcileOutcome::Done);
        };
        for finalizer in [CLONE_PROTECTION, SNAPSHOT_PROTECTION] {
            if claim.metadata.has_finalizer(finalizer) {
                blocked(transfer, &format!("PVC has finalizer: {finalizer}"));
                return Ok(ReconcileOutcome::Done);
            }
        }
        let volume = self.volumes.get("", &volume_name).await?;
        if !volume.is_claimed_by(&source.namespace, &source.name) {
            blocked(transfer, "PV not bound");
            return Ok(ReconcileOutcome::Done);
        }
        let in_use = self
            .pods
            .list(Some(&source.namespace), None)
            .await?
            .iter()
            .any(|pod| !pod.is_terminal() && pod.uses_claim(&source.name));
        if in_use {
            blocked(transfer, "Pods using PVC");
            return Ok(ReconcileOutcome::RequeueAfter(POD_RECHECK));
        }
        if !has_required_annotations(transfer, &claim) {
            blocked(transfer, "Required annotation missing");
            return Ok(ReconcileOutcome::Done);
        }

        let name = transfer.metadata.name().to_string();
        match claim.metadata.annotation(ANN_OBJECT_TRANSFER_NAME) {
            Some(owner) if owner != name => {
                let owner = owner.to_string();
                set_complete(transfer, STATUS_FALSE, &owner, "Source in use by another transfer");
                return Ok(ReconcileOutcome::Done);
            }
            Some(_) => {}
            None => {
                claim.metadata.set_annotation(ANN_OBJECT_TRANSFER_NAME, name.as_str());
                claim = self.claims.update(&claim).await?;
            }
        }

        claim.status = None;
        let recorded = serde_json::to_string(&claim)
            .map_err(|err| ReconcileError::Internal(format!("failed to record source claim: {err}")))?;
        let data = &mut transfer.status_mut().data;
        data.clear();
        data.insert(DATA_SOURCE.to_string(), recorded);
        data.insert(DATA_PV_NAME.to_string(), volume_name);
        log_info(
            NAME,
            "Transfer source claimed",
            &[("transfer", name.as_str()), ("claim", source.name.as_str())],
        );
        mark_running(transfer, "Running");
        Ok(ReconcileOutcome::Done)
    }

    async fn running(&self, transfer: &mut ObjectTransfer) -> ReconcileResult {
        let data = transfer
            .status
            .as_ref()
            .map(|status| status.data.clone())
            .unwrap_or_default();
        let Some(volume_name) = data.get(DATA_PV_NAME) else {
            mark_failed(transfer, "PV name missing");
            return Ok(ReconcileOutcome::Done);
        };
        let mut volume = self.volumes.get("", volume_name).await?;
        let reclaim = match data.get(DATA_PV_RECLAIM) {
            Some(reclaim) => reclaim.clone(),
            None => {
                let reclaim = volume
                    .spec
                    .persistent_volume_reclaim_policy
                    .clone()
                    .unwrap_or_else(|| RECLAIM_DELETE.to_string());
                transfer
                    .status_mut()
                    .data
                    .insert(DATA_PV_RECLAIM.to_string(), reclaim.clone());
                reclaim
            }
        };

        let source = transfer.spec.source.clone();
        if let Some(claim) = self.claims.get_opt(&source.namespace, &source.name).await? {
            if volume.spec.persistent_volume_reclaim_policy.as_deref() != Some(RECLAIM_RETAIN) {
                volume.spec.persistent_volume_reclaim_policy = Some(RECLAIM_RETAIN.to_string());
                volume = self.volumes.update(&volume).await?;
            }
            if !claim.metadata.is_deleting() {
                self.claims.delete(&source.namespace, &source.name).await?;
            }
            if self.claims.get_opt(&source.namespace, &source.name).await?.is_some() {
                mark_running(transfer, "Running");
                return Ok(ReconcileOutcome::Done);
            }
        }

        let target_namespace = transfer.target_namespace().to_string();
        let target_name = transfer.target_name().to_string();
        let parked = volume
            .spec
            .claim_ref
            .as_ref()
            .map(|claim| {
                claim.namespace.as_deref() == Some(source.namespace.as_str())
                    && claim.name.as_deref() == Some(source.name.as_str())
            })
            .unwrap_or(true);
        if parked {
            volume.spec.claim_ref = Some(ObjectReference {
                kind: Some("PersistentVolumeClaim".to_string()),
                namespace: Some(target_namespace.clone()),
                name: Some(target_name.clone()),
                ..Default::default()
            });
            volume = self.volumes.update(&volume).await?;
        }
        if !volume.is_claimed_by(&target_namespace, &target_name) {
            mark_failed(transfer, "PV bound to wrong PVC");
            let message = format!("PersistentVolume {volume_name} is bound to another claim");
            self.recorder.warning(&*transfer, TRANSFER_ERROR, &message).await;
            return Ok(ReconcileOutcome::Done);
        }

        match self.claims.get_opt(&target_namespace, &target_name).await? {
            None => {
                self.claims.create(&target_claim(transfer)?).await?;
                mark_running(transfer, "Running");
                return Ok(ReconcileOutcome::Done);
            }
            Some(target) if !target.is_bound() => {
                mark_running(transfer, "Waiting for target to be bound");
                return Ok(ReconcileOutcome::Done);
            }
            Some(_) => {}
        }

        if volume.spec.persistent_volume_reclaim_policy.as_deref() != Some(reclaim.as_str()) {
            volume.spec.persistent_volume_reclaim_policy = Some(reclaim);
            self.volumes.update(&volume).await?;
        }
        let status = transfer.status_mut();
        status.phase = TransferPhase::Complete;
        status.data.clear();
        set_complete(transfer, STATUS_TRUE, "", "Transfer complete");
        log_info(
            NAME,
            "Transfer complete",
            &[
                ("transfer", transfer.metadata.name()),
                ("namespace", target_namespace.as_str()),
                ("claim", target_name.as_str()),
            ],
        );
        Ok(ReconcileOutcome::Done)
    }
}

impl Reconciler for ObjectTransferReconciler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn reconcile<'a>(&'a self, key: &'a ObjectKey) -> ReconcileFuture<'a> {
        Box::pin(self.sync(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdi::api::transfer::{ObjectTransferSpec, ObjectTransferStatus, TransferSource, TransferTarget};
    use crate::cdi::k8s::meta::{ObjectMeta, OwnerReference};

    fn transfer(target_namespace: &str) -> ObjectTransfer {
        ObjectTransfer {
            metadata: ObjectMeta::named(None, "move-disk"),
            spec: ObjectTransferSpec {
                source: TransferSource {
                    kind: "PersistentVolumeClaim".to_string(),
                    namespace: "src".to_string(),
                    name: "disk".to_string(),
                    ..Default::default()
                },
                target: TransferTarget {
                    namespace: Some(target_namespace.to_string()),
                    name: Some("moved".to_string()),
                },
                parent_name: None,
            },
            status: None,
        }
    }

    fn recorded_claim() -> PersistentVolumeClaim {
        let mut claim = PersistentVolumeClaim {
            metadata: ObjectMeta::named(Some("src"), "disk"),
            ..Default::default()
        };
        claim.metadata.uid = Some("uid-1".to_string());
        claim.metadata.resource_version = Some("7".to_string());
        claim.metadata.set_annotation(ANN_OBJECT_TRANSFER_NAME, "move-disk");
        claim.metadata.set_annotation(ANN_BIND_COMPLETED, "yes");
        claim.metadata.set_annotation("keep", "me");
        claim.metadata.owner_references.push(OwnerReference {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            name: "owner".to_string(),
            uid: "owner-uid".to_string(),
            controller: None,
            block_owner_deletion: None,
        });
        claim.spec.volume_name = Some("pv-1".to_string());
        claim
    }

    fn with_recorded(mut transfer: ObjectTransfer) -> ObjectTransfer {
        let mut status = ObjectTransferStatus::default();
        status.data.insert(
            DATA_SOURCE.to_string(),
            serde_json::to_string(&recorded_claim()).unwrap(),
        );
        transfer.status = Some(status);
        transfer
    }

    #[test]
    fn target_claim_takes_the_target_identity() {
        let claim = target_claim(&with_recorded(transfer("dst"))).unwrap();
        assert_eq!(claim.metadata.namespace(), "dst");
        assert_eq!(claim.metadata.name(), "moved");
        assert!(claim.metadata.uid.is_none());
        assert!(claim.metadata.resource_version.is_none());
        assert!(claim.metadata.owner_references.is_empty());
        assert!(claim.metadata.annotation(ANN_OBJECT_TRANSFER_NAME).is_none());
        assert!(claim.metadata.annotation(ANN_BIND_COMPLETED).is_none());
        assert_eq!(claim.metadata.annotation("keep"), Some("me"));
        assert_eq!(claim.spec.volume_name.as_deref(), Some("pv-1"));
    }

    #[test]
    fn renames_in_place_keep_owner_references() {
        let claim = target_claim(&with_recorded(transfer("src"))).unwrap();
        assert_eq!(claim.metadata.owner_references.len(), 1);
    }

    #[test]
    fn missing_recorded_source_is_invalid() {
        assert!(matches!(
            target_claim(&transfer("dst")),
            Err(ReconcileError::Invalid(_))
        ));
    }

    #[test]
    fn required_annotations_must_match_exactly() {
        let mut spec = transfer("dst");
        spec.spec
            .source
            .required_annotations
            .insert("keep".to_string(), "me".to_string());
        assert!(has_required_annotations(&spec, &recorded_claim()));
        spec.spec
            .source
            .required_annotations
            .insert("keep".to_string(), "other".to_string());
        assert!(!has_required_annotations(&spec, &recorded_claim()));
    }
}
