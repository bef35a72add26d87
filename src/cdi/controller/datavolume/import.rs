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

//! Import flow: the claim carries the source description as annotations and
//! the claim-level import controller runs the importer. Warm imports walk the
//! checkpoint list one importer run at a time.

use super::{DataVolumeReconciler, Step};
use crate::cdi::api::annotations::*;
use crate::cdi::api::cdiconfig::CdiConfig;
use crate::cdi::api::datavolume::{
    DataVolume, DataVolumeCheckpoint, DataVolumePhase, DataVolumeSource, SourceKind,
};
use crate::cdi::controller::pods::{worker_pod_name, WorkerRole};
use crate::cdi::controller::reconcile::ReconcileError;
use crate::cdi::k8s::meta::ObjectMeta;
use crate::cdi::k8s::pod::{POD_FAILED, POD_RUNNING, POD_SUCCEEDED};
use crate::cdi::k8s::volume::PersistentVolumeClaim;
use crate::cdi::logger::log_info;

pub(super) async fn start(
    reconciler: &DataVolumeReconciler,
    dv: &DataVolume,
    kind: SourceKind,
    mut claim: PersistentVolumeClaim,
) -> Result<Step, ReconcileError> {
    let meta = &mut claim.metadata;
    meta.set_annotation(ANN_SOURCE, kind.importer_source());
    if let Some(source) = &dv.spec.source {
        annotate_source(meta, source);
    }
    if let Some(checkpoint) = next_checkpoint(dv, &claim.metadata) {
        set_checkpoint(&mut claim.metadata, dv, checkpoint);
    }
    let claim = reconciler.create_claim(claim).await?;
    Ok(Step::new(DataVolumePhase::ImportScheduled, Some(claim)))
}

/// Copies the source arm into the importer's annotation contract.
fn annotate_source(meta: &mut ObjectMeta, source: &DataVolumeSource) {
    if let Some(endpoint) = source.endpoint() {
        meta.set_annotation(ANN_ENDPOINT, endpoint);
    }
    if let Some(secret) = source.secret_ref() {
        meta.set_annotation(ANN_SECRET, secret);
    }
    if let Some(config_map) = source.cert_config_map() {
        meta.set_annotation(ANN_CERT_CONFIG_MAP, config_map);
    }
    if let Some(http) = &source.http {
        if !http.extra_headers.is_empty() {
            meta.set_annotation(ANN_EXTRA_HEADERS, http.extra_headers.join("\n"));
        }
        if !http.secret_extra_headers.is_empty() {
            meta.set_annotation(ANN_SECRET_EXTRA_HEADERS, http.secret_extra_headers.join("\n"));
        }
    }
    if let Some(method) = source.registry.as_ref().and_then(|r| r.pull_method.as_deref()) {
        meta.set_annotation(ANN_PULL_METHOD, method);
    }
    if let Some(imageio) = &source.imageio {
        meta.set_annotation(ANN_DISK_ID, imageio.disk_id.clone());
    }
    if let Some(vddk) = &source.vddk {
        meta.set_annotation(ANN_UUID, vddk.uuid.clone());
        meta.set_annotation(ANN_BACKING_FILE, vddk.backing_file.clone());
        if let Some(thumbprint) = &vddk.thumbprint {
            meta.set_annotation(ANN_THUMBPRINT, thumbprint.clone());
        }
        if let Some(image) = &vddk.init_image_url {
            meta.set_annotation(ANN_VDDK_INIT_IMAGE_URL, image.clone());
        }
    }
}

/// First checkpoint the claim has not copied yet.
fn next_checkpoint<'a>(dv: &'a DataVolume, meta: &ObjectMeta) -> Option<(usize, &'a DataVolumeCheckpoint)> {
    dv.spec
        .checkpoints
        .iter()
        .enumerate()
        .find(|(_, checkpoint)| meta.annotation(&checkpoint_copied_key(&checkpoint.current)).is_none())
}

fn set_checkpoint(meta: &mut ObjectMeta, dv: &DataVolume, (index, checkpoint): (usize, &DataVolumeCheckpoint)) -> bool {
    let last = index + 1 == dv.spec.checkpoints.len();
    let is_final = dv.spec.final_checkpoint.unwrap_or(false) && last;
    let mut changed = meta.set_annotation(ANN_PREVIOUS_CHECKPOINT, checkpoint.previous.clone());
    changed |= meta.set_annotation(ANN_CURRENT_CHECKPOINT, checkpoint.current.clone());
    changed |= meta.set_annotation(ANN_FINAL_CHECKPOINT, is_final.to_string());
    changed
}

pub(super) async fn progress(
    reconciler: &DataVolumeReconciler,
    dv: &DataVolume,
    claim: PersistentVolumeClaim,
    config: &CdiConfig,
) -> Result<Step, ReconcileError> {
    if reconciler.waits_for_first_consumer(&claim, config).await? {
        return Ok(Step::new(DataVolumePhase::WaitForFirstConsumer, Some(claim)));
    }
    let claim = if dv.is_multi_stage() {
        advance_checkpoint(reconciler, dv, claim).await?
    } else {
        claim
    };
    let phase = import_phase(dv, &claim);
    Ok(Step::new(phase, Some(claim)))
}

fn import_phase(dv: &DataVolume, claim: &PersistentVolumeClaim) -> DataVolumePhase {
    match claim.metadata.annotation(ANN_POD_PHASE) {
        Some(POD_RUNNING) => DataVolumePhase::ImportInProgress,
        Some(POD_FAILED) => DataVolumePhase::Failed,
        Some(POD_SUCCEEDED) => {
            if dv.is_multi_stage() && !claim.metadata.is_annotation_true(ANN_MULTI_STAGE_IMPORT_DONE) {
                DataVolumePhase::Paused
            } else {
                DataVolumePhase::Succeeded
            }
        }
        _ => DataVolumePhase::ImportScheduled,
    }
}

/// Once the importer for the current checkpoint is gone, points the claim at
/// the next one, or marks the import done when the final checkpoint is in.
async fn advance_checkpoint(
    reconciler: &DataVolumeReconciler,
    dv: &DataVolume,
    mut claim: PersistentVolumeClaim,
) -> Result<PersistentVolumeClaim, ReconcileError> {
    if claim.metadata.is_annotation_true(ANN_MULTI_STAGE_IMPORT_DONE) {
        return Ok(claim);
    }
    let Some(current) = claim.metadata.annotation(ANN_CURRENT_CHECKPOINT).map(str::to_string) else {
        return Ok(claim);
    };
    if claim.metadata.annotation(&checkpoint_copied_key(&current)).is_none() {
        return Ok(claim);
    }
    let importer = worker_pod_name(claim.metadata.uid(), WorkerRole::Importer);
    if reconciler
        .pods
        .get_opt(claim.metadata.namespace(), &importer)
        .await?
        .is_some()
    {
        return Ok(claim);
    }

    let changed = match next_checkpoint(dv, &claim.metadata) {
        Some(next) => {
            log_info(
                super::NAME,
                "Advancing multi-stage import",
                &[
                    ("claim", claim.metadata.name()),
                    ("previous", next.1.previous.as_str()),
                    ("current", next.1.current.as_str()),
                ],
            );
            let mut changed = set_checkpoint(&mut claim.metadata, dv, next);
            changed |= claim.metadata.remove_annotation(ANN_POD_PHASE);
            changed
        }
        None if dv.spec.final_checkpoint.unwrap_or(false) => {
            claim.metadata.set_annotation(ANN_MULTI_STAGE_IMPORT_DONE, "true")
        }
        None => false,
    };
    if !changed {
        return Ok(claim);
    }
    Ok(reconciler.claims.update(&claim).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdi::api::datavolume::{DataVolumeSpec, HttpSource, VddkSource};

    fn warm_dv(final_checkpoint: bool) -> DataVolume {
        DataVolume {
            metadata: ObjectMeta::named(Some("ns"), "warm"),
            spec: DataVolumeSpec {
                source: Some(DataVolumeSource {
                    vddk: Some(VddkSource {
                        url: "https://vcenter/sdk".to_string(),
                        uuid: "vm-uuid".to_string(),
                        backing_file: "[store] vm/disk.vmdk".to_string(),
                        thumbprint: Some("AA:BB".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                checkpoints: vec![
                    DataVolumeCheckpoint {
                        previous: String::new(),
                        current: "snap-1".to_string(),
                    },
                    DataVolumeCheckpoint {
                        previous: "snap-1".to_string(),
                        current: "snap-2".to_string(),
                    },
                ],
                final_checkpoint: Some(final_checkpoint),
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn vddk_source_is_carried_in_annotations() {
        let dv = warm_dv(false);
        let mut meta = ObjectMeta::default();
        annotate_source(&mut meta, dv.spec.source.as_ref().unwrap());
        assert_eq!(meta.annotation(ANN_ENDPOINT), Some("https://vcenter/sdk"));
        assert_eq!(meta.annotation(ANN_UUID), Some("vm-uuid"));
        assert_eq!(meta.annotation(ANN_THUMBPRINT), Some("AA:BB"));
    }

    #[test]
    fn extra_headers_are_newline_joined() {
        let source = DataVolumeSource {
            http: Some(HttpSource {
                url: "http://images/disk.img".to_string(),
                extra_headers: vec!["X-First: 1".to_string(), "X-Second: 2".to_string()],
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut meta = ObjectMeta::default();
        annotate_source(&mut meta, &source);
        assert_eq!(meta.annotation(ANN_EXTRA_HEADERS), Some("X-First: 1\nX-Second: 2"));
    }

    #[test]
    fn checkpoints_advance_in_order() {
        let dv = warm_dv(true);
        let mut meta = ObjectMeta::default();
        let first = next_checkpoint(&dv, &meta).unwrap();
        assert_eq!(first.1.current, "snap-1");
        set_checkpoint(&mut meta, &dv, first);
        assert_eq!(meta.annotation(ANN_FINAL_CHECKPOINT), Some("false"));

        meta.set_annotation(&checkpoint_copied_key("snap-1"), "pod-uid");
        let second = next_checkpoint(&dv, &meta).unwrap();
        set_checkpoint(&mut meta, &dv, second);
        assert_eq!(meta.annotation(ANN_PREVIOUS_CHECKPOINT), Some("snap-1"));
        assert_eq!(meta.annotation(ANN_CURRENT_CHECKPOINT), Some("snap-2"));
        assert_eq!(meta.annotation(ANN_FINAL_CHECKPOINT), Some("true"));

        meta.set_annotation(&checkpoint_copied_key("snap-2"), "pod-uid-2");
        assert!(next_checkpoint(&dv, &meta).is_none());
    }

    #[test]
    fn multi_stage_success_pauses_until_done() {
        let dv = warm_dv(false);
        let mut claim = PersistentVolumeClaim::default();
        claim.metadata.set_annotation(ANN_POD_PHASE, POD_SUCCEEDED);
        assert_eq!(import_phase(&dv, &claim), DataVolumePhase::Paused);
        claim.metadata.set_annotation(ANN_MULTI_STAGE_IMPORT_DONE, "true");
        assert_eq!(import_phase(&dv, &claim), DataVolumePhase::Succeeded);
    }
}
