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

//! Clone flow: validates the cross-namespace token, waits for the source,
//! asks the planner for a strategy and lets the clone engine drive it.

use super::{DataVolumeReconciler, Step, NAME};
use crate::cdi::api::annotations::{ANN_CLONE_TYPE, ANN_EXTENDED_CLONE_TOKEN};
use crate::cdi::api::cdiconfig::CdiConfig;
use crate::cdi::api::datavolume::{DataVolume, DataVolumePhase};
use crate::cdi::api::storageprofile::CloneStrategy;
use crate::cdi::controller::clone::planner::PlanError;
use crate::cdi::controller::clone::{CloneEngine, CloneRef};
use crate::cdi::controller::events::{
    CLONE_VALIDATION_FAILED, ERR_INCOMPATIBLE_PVC, ERR_UNABLE_TO_CLONE,
};
use crate::cdi::controller::reconcile::ReconcileError;
use crate::cdi::k8s::volume::PersistentVolumeClaim;
use crate::cdi::logger::{log_info, log_warn};

/// Stores an extended token on a cross-namespace clone while its admission
/// token is still good, so a late source does not strand the clone.
pub(super) async fn extend_token(
    reconciler: &DataVolumeReconciler,
    mut dv: DataVolume,
    reference: &CloneRef,
) -> Result<DataVolume, ReconcileError> {
    let token = match reconciler.engine.extend_token(&dv, reference).await {
        Ok(Some(token)) => token,
        Ok(None) => return Ok(dv),
        Err(err) => {
            // Rejection is reported by the token check in `start`.
            let error = err.to_string();
            log_warn(
                NAME,
                "Clone token not extended",
                &[
                    ("namespace", dv.metadata.namespace()),
                    ("datavolume", dv.metadata.name()),
                    ("error", error.as_str()),
                ],
            );
            return Ok(dv);
        }
    };
    dv.metadata.set_annotation(ANN_EXTENDED_CLONE_TOKEN, token);
    let dv = reconciler.dvs.update(&dv).await?;
    log_info(
        NAME,
        "Extended clone token",
        &[
            ("namespace", dv.metadata.namespace()),
            ("datavolume", dv.metadata.name()),
        ],
    );
    Ok(dv)
}

pub(super) async fn start(
    reconciler: &DataVolumeReconciler,
    dv: &DataVolume,
    reference: &CloneRef,
    config: &CdiConfig,
) -> Result<Step, ReconcileError> {
    let engine = &reconciler.engine;
    if let Err(err) = engine.validate_token(dv, reference).await {
        reconciler
            .recorder
            .warning(dv, CLONE_VALIDATION_FAILED, &format!("clone token rejected: {err}"))
            .await;
        return Ok(Step::new(DataVolumePhase::CloneScheduled, None));
    }
    let Some(source) = engine.source(reference).await? else {
        return Ok(Step::new(DataVolumePhase::CloneScheduled, None));
    };
    if !CloneEngine::source_ready(&source) {
        return Ok(Step::new(DataVolumePhase::CloneScheduled, None));
    }
    let Some(base) = reconciler.base_claim(dv, config, source.size()).await? else {
        return Ok(Step::pending());
    };
    let forced = dv
        .metadata
        .annotation(ANN_CLONE_TYPE)
        .and_then(|value| value.parse::<CloneStrategy>().ok());

    let plan = match engine.plan(dv, &source, &base.spec, forced).await? {
        Ok(plan) => plan,
        Err(err @ PlanError::Infeasible(..)) => {
            reconciler
                .recorder
                .warning(dv, ERR_UNABLE_TO_CLONE, &err.to_string())
                .await;
            return Ok(Step::new(DataVolumePhase::CloneScheduled, None));
        }
        Err(err) => {
            reconciler
                .recorder
                .warning(dv, ERR_INCOMPATIBLE_PVC, &err.to_string())
                .await;
            return Ok(Step::new(DataVolumePhase::Failed, None));
        }
    };
    if let Some((skipped, reason)) = plan.fallback {
        reconciler
            .recorder
            .normal(
                dv,
                reason.as_str(),
                &format!(
                    "{} clone not possible, {}; falling back to {}",
                    skipped.as_str(),
                    reason.message(),
                    plan.strategy.as_str()
                ),
            )
            .await;
    }
    let progress = engine.start(dv, &plan, &source, base).await?;
    Ok(Step::new(progress.phase, progress.claim))
}

pub(super) async fn progress(
    reconciler: &DataVolumeReconciler,
    dv: &DataVolume,
    claim: PersistentVolumeClaim,
    config: &CdiConfig,
) -> Result<Step, ReconcileError> {
    let host_copy = claim
        .metadata
        .annotation(ANN_CLONE_TYPE)
        .map(|value| value == CloneStrategy::HostAssisted.as_str())
        .unwrap_or(true);
    if host_copy && reconciler.waits_for_first_consumer(&claim, config).await? {
        return Ok(Step::new(DataVolumePhase::WaitForFirstConsumer, Some(claim)));
    }
    let progress = reconciler.engine.progress(dv, claim).await?;
    Ok(Step::new(progress.phase, progress.claim))
}
