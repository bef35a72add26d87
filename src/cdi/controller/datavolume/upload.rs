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

//! Upload flow: the claim is marked as an upload target and the claim-level
//! upload controller runs the upload server until the client is done.

use super::{DataVolumeReconciler, Step};
use crate::cdi::api::annotations::{ANN_POD_PHASE, ANN_POD_READY, ANN_UPLOAD_REQUEST};
use crate::cdi::api::cdiconfig::CdiConfig;
use crate::cdi::api::datavolume::DataVolumePhase;
use crate::cdi::controller::reconcile::ReconcileError;
use crate::cdi::k8s::pod::{POD_FAILED, POD_RUNNING, POD_SUCCEEDED};
use crate::cdi::k8s::volume::PersistentVolumeClaim;

pub(super) async fn start(
    reconciler: &DataVolumeReconciler,
    mut claim: PersistentVolumeClaim,
) -> Result<Step, ReconcileError> {
    claim.metadata.set_annotation(ANN_UPLOAD_REQUEST, "");
    let claim = reconciler.create_claim(claim).await?;
    Ok(Step::new(DataVolumePhase::UploadScheduled, Some(claim)))
}

pub(super) async fn progress(
    reconciler: &DataVolumeReconciler,
    claim: PersistentVolumeClaim,
    config: &CdiConfig,
) -> Result<Step, ReconcileError> {
    if reconciler.waits_for_first_consumer(&claim, config).await? {
        return Ok(Step::new(DataVolumePhase::WaitForFirstConsumer, Some(claim)));
    }
    let phase = upload_phase(&claim);
    Ok(Step::new(phase, Some(claim)))
}

pub(crate) fn upload_phase(claim: &PersistentVolumeClaim) -> DataVolumePhase {
    let meta = &claim.metadata;
    match meta.annotation(ANN_POD_PHASE) {
        Some(POD_SUCCEEDED) => DataVolumePhase::Succeeded,
        Some(POD_FAILED) => DataVolumePhase::Failed,
        Some(POD_RUNNING) if meta.is_annotation_true(ANN_POD_READY) => DataVolumePhase::UploadReady,
        _ => DataVolumePhase::UploadScheduled,
    }
}
