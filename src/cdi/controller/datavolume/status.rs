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

//! DataVolume status: phase, progress, restart count and the Bound, Running
//! and Ready conditions, all derived from the claim.

use super::{DataVolumeReconciler, Flow, Step};
use crate::cdi::api::annotations::*;
use crate::cdi::api::conditions::{
    set_condition, Condition, CONDITION_BOUND, CONDITION_READY, CONDITION_RUNNING, STATUS_FALSE,
    STATUS_TRUE, STATUS_UNKNOWN,
};
use crate::cdi::api::datavolume::{DataVolume, DataVolumePhase, PROGRESS_UNKNOWN};
use crate::cdi::controller::events::{ERR_CLAIM_LOST, IMPORT_PAUSED};
use crate::cdi::controller::reconcile::{ReconcileOutcome, ReconcileResult};
use crate::cdi::k8s::volume::{PersistentVolumeClaim, CLAIM_BOUND, CLAIM_LOST, CLAIM_PENDING};
use crate::cdi::logger::log_info;
use crate::cdi::observability::metrics::record_datavolume_phase_transition;

const TRANSFER_RUNNING: &str = "TransferRunning";
const PROGRESS_COMPLETE: &str = "100.0%";

/// Writes `step` into the DataVolume status when it changes anything.
pub(super) async fn lift(
    reconciler: &DataVolumeReconciler,
    mut dv: DataVolume,
    flow: Option<&Flow>,
    step: Step,
) -> ReconcileResult {
    let outcome = match step.requeue {
        Some(delay) => ReconcileOutcome::RequeueAfter(delay),
        None => ReconcileOutcome::Done,
    };
    let previous = dv.phase();
    let original = dv.status.clone();
    let claim = step.claim.as_ref();
    {
        let status = dv.status_mut();
        status.phase = step.phase;
        if let Some(claim) = claim {
            status.claim_name = Some(claim.metadata.name().to_string());
            if let Some(restarts) = claim
                .metadata
                .annotation(ANN_POD_RESTARTS)
                .and_then(|value| value.parse::<i32>().ok())
            {
                status.restart_count = restarts;
            }
        }
        status.progress = progress(step.phase, claim, &status.progress);
        update_conditions(&mut status.conditions, claim, step.phase);
    }
    if dv.status == original {
        return Ok(outcome);
    }
    let updated = reconciler.dvs.update_status(&dv).await?;
    if previous != step.phase {
        record_datavolume_phase_transition(Some(previous.as_str()), Some(step.phase.as_str()));
        log_info(
            super::NAME,
            "DataVolume phase changed",
            &[
                ("namespace", updated.metadata.namespace()),
                ("datavolume", updated.metadata.name()),
                ("from", previous.as_str()),
                ("to", step.phase.as_str()),
            ],
        );
        if let Some((warning, reason, message)) = phase_event(step.phase, &updated, flow) {
            if warning {
                reconciler.recorder.warning(&updated, reason, &message).await;
            } else {
                reconciler.recorder.normal(&updated, reason, &message).await;
            }
        }
    }
    Ok(outcome)
}

fn progress(phase: DataVolumePhase, claim: Option<&PersistentVolumeClaim>, current: &str) -> String {
    if phase.is_succeeded() {
        return PROGRESS_COMPLETE.to_string();
    }
    if let Some(reported) = claim.and_then(|claim| claim.metadata.annotation(ANN_POPULATOR_PROGRESS)) {
        return reported.to_string();
    }
    if current.is_empty() {
        PROGRESS_UNKNOWN.to_string()
    } else {
        current.to_string()
    }
}

fn phase_event(
    phase: DataVolumePhase,
    dv: &DataVolume,
    flow: Option<&Flow>,
) -> Option<(bool, &'static str, String)> {
    let name = dv.metadata.name();
    let event = match phase {
        DataVolumePhase::Unset => return None,
        DataVolumePhase::Succeeded => {
            let (reason, verb) = flow?.succeeded_event();
            (false, reason, format!("Successfully {verb} into PVC {name}"))
        }
        DataVolumePhase::Failed => (true, phase.as_str(), format!("DataVolume {name} failed")),
        DataVolumePhase::Paused => (
            false,
            IMPORT_PAUSED,
            format!("Multistage import into PVC {name} is paused"),
        ),
        DataVolumePhase::ImportScheduled => (false, phase.as_str(), format!("Import into {name} scheduled")),
        DataVolumePhase::ImportInProgress => (false, phase.as_str(), format!("Import into {name} in progress")),
        DataVolumePhase::CloneScheduled => (false, phase.as_str(), format!("Cloning into {name} scheduled")),
        DataVolumePhase::CloneInProgress => (false, phase.as_str(), format!("Cloning into {name} in progress")),
        DataVolumePhase::UploadScheduled => (false, phase.as_str(), format!("Upload into {name} scheduled")),
        DataVolumePhase::UploadReady => (false, phase.as_str(), format!("Upload into {name} ready")),
        DataVolumePhase::Pending => (false, phase.as_str(), format!("PVC {name} Pending")),
        _ => (false, phase.as_str(), format!("DataVolume {name} is {phase}")),
    };
    Some(event)
}

/// Bound condition recorded on the claim by a worker controller, if any.
fn claim_bound_condition(claim: &PersistentVolumeClaim) -> Option<(String, &str, &str)> {
    let meta = &claim.metadata;
    let value = meta.annotation(ANN_BOUND_CONDITION)?;
    let status = match value.to_ascii_lowercase().as_str() {
        "true" => STATUS_TRUE,
        "false" => STATUS_FALSE,
        _ => STATUS_UNKNOWN,
    };
    Some((
        status.to_string(),
        meta.annotation(ANN_BOUND_CONDITION_REASON).unwrap_or_default(),
        meta.annotation(ANN_BOUND_CONDITION_MESSAGE).unwrap_or_default(),
    ))
}

/// Recomputes Bound, Running and Ready. Ready is written once per pass so a
/// steady state never moves its transition time.
pub(super) fn update_conditions(
    conditions: &mut Vec<Condition>,
    claim: Option<&PersistentVolumeClaim>,
    phase: DataVolumePhase,
) {
    match claim {
        None => {
            set_condition(conditions, CONDITION_BOUND, STATUS_UNKNOWN, "NotFound", "No PVC found");
        }
        Some(claim) => {
            let name = claim.metadata.name();
            let recorded = claim_bound_condition(claim);
            let healthy = recorded
                .as_ref()
                .map(|(status, _, _)| status == STATUS_TRUE)
                .unwrap_or(true);
            match claim.phase() {
                CLAIM_BOUND if healthy => {
                    set_condition(conditions, CONDITION_BOUND, STATUS_TRUE, "Bound", &format!("PVC {name} Bound"));
                }
                CLAIM_BOUND => {
                    let (_, reason, message) = recorded.unwrap_or_default();
                    set_condition(conditions, CONDITION_BOUND, STATUS_FALSE, reason, message);
                }
                CLAIM_PENDING if healthy => {
                    set_condition(conditions, CONDITION_BOUND, STATUS_FALSE, "Pending", &format!("PVC {name} Pending"));
                }
                CLAIM_PENDING => {
                    let (_, reason, message) = recorded.unwrap_or_default();
                    set_condition(
                        conditions,
                        CONDITION_BOUND,
                        STATUS_FALSE,
                        reason,
                        &format!("target PVC {name} Pending and {message}"),
                    );
                }
                CLAIM_LOST => {
                    set_condition(conditions, CONDITION_BOUND, STATUS_FALSE, ERR_CLAIM_LOST, "Claim Lost");
                }
                _ => {
                    set_condition(
                        conditions,
                        CONDITION_BOUND,
                        STATUS_UNKNOWN,
                        STATUS_UNKNOWN,
                        &format!("PVC {name} phase unknown"),
                    );
                }
            }
        }
    }

    let annotations = claim.map(|claim| &claim.metadata);
    let reason = annotations
        .and_then(|meta| meta.annotation(ANN_RUNNING_CONDITION_REASON))
        .unwrap_or_default();
    let message = annotations
        .and_then(|meta| meta.annotation(ANN_RUNNING_CONDITION_MESSAGE))
        .unwrap_or_default();
    let running = match annotations.and_then(|meta| meta.annotation(ANN_RUNNING_CONDITION)) {
        Some(value) if value.eq_ignore_ascii_case("true") => STATUS_TRUE,
        Some(value) if value.eq_ignore_ascii_case("false") => STATUS_FALSE,
        Some(_) => STATUS_UNKNOWN,
        None => STATUS_FALSE,
    };
    set_condition(conditions, CONDITION_RUNNING, running, reason, message);

    if running == STATUS_TRUE {
        set_condition(conditions, CONDITION_READY, STATUS_FALSE, TRANSFER_RUNNING, "");
    } else if phase.is_succeeded() {
        set_condition(conditions, CONDITION_READY, STATUS_TRUE, "", "");
    } else {
        set_condition(conditions, CONDITION_READY, STATUS_FALSE, "", "");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdi::api::conditions::find_condition;
    use crate::cdi::k8s::meta::ObjectMeta;
    use crate::cdi::k8s::volume::PersistentVolumeClaimStatus;

    fn claim(phase: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta::named(Some("ns"), "dv"),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn condition<'a>(conditions: &'a [Condition], kind: &str) -> &'a Condition {
        find_condition(conditions, kind).expect("condition present")
    }

    #[test]
    fn missing_claim_reports_unknown_bound() {
        let mut conditions = Vec::new();
        update_conditions(&mut conditions, None, DataVolumePhase::Pending);
        let bound = condition(&conditions, CONDITION_BOUND);
        assert_eq!(bound.status, STATUS_UNKNOWN);
        assert_eq!(bound.message, "No PVC found");
        assert_eq!(condition(&conditions, CONDITION_READY).status, STATUS_FALSE);
    }

    #[test]
    fn succeeded_bound_claim_is_ready() {
        let mut conditions = Vec::new();
        update_conditions(&mut conditions, Some(&claim(CLAIM_BOUND)), DataVolumePhase::Succeeded);
        assert_eq!(condition(&conditions, CONDITION_BOUND).reason, "Bound");
        assert!(condition(&conditions, CONDITION_READY).is_true());
        assert_eq!(condition(&conditions, CONDITION_RUNNING).status, STATUS_FALSE);
    }

    #[test]
    fn quota_failure_surfaces_on_pending_claim() {
        let mut pending = claim(CLAIM_PENDING);
        pending.metadata.set_annotation(ANN_BOUND_CONDITION, "false");
        pending
            .metadata
            .set_annotation(ANN_BOUND_CONDITION_REASON, "ErrExceededQuota");
        pending
            .metadata
            .set_annotation(ANN_BOUND_CONDITION_MESSAGE, "exceeded quota");
        let mut conditions = Vec::new();
        update_conditions(&mut conditions, Some(&pending), DataVolumePhase::ImportScheduled);
        let bound = condition(&conditions, CONDITION_BOUND);
        assert_eq!(bound.reason, "ErrExceededQuota");
        assert_eq!(bound.message, "target PVC dv Pending and exceeded quota");
    }

    #[test]
    fn running_transfer_holds_ready_false() {
        let mut running = claim(CLAIM_BOUND);
        running.metadata.set_annotation(ANN_RUNNING_CONDITION, "true");
        running
            .metadata
            .set_annotation(ANN_RUNNING_CONDITION_REASON, "Pod is running");
        let mut conditions = Vec::new();
        update_conditions(&mut conditions, Some(&running), DataVolumePhase::ImportInProgress);
        assert!(condition(&conditions, CONDITION_RUNNING).is_true());
        assert_eq!(condition(&conditions, CONDITION_READY).reason, TRANSFER_RUNNING);
    }

    #[test]
    fn steady_state_keeps_transition_time() {
        let bound = claim(CLAIM_BOUND);
        let mut conditions = Vec::new();
        update_conditions(&mut conditions, Some(&bound), DataVolumePhase::Succeeded);
        let first = conditions.clone();
        update_conditions(&mut conditions, Some(&bound), DataVolumePhase::Succeeded);
        assert_eq!(first, conditions);
    }

    #[test]
    fn progress_is_complete_on_success() {
        assert_eq!(progress(DataVolumePhase::Succeeded, None, "42%"), PROGRESS_COMPLETE);
        assert_eq!(progress(DataVolumePhase::ImportScheduled, None, ""), PROGRESS_UNKNOWN);
        assert_eq!(progress(DataVolumePhase::ImportInProgress, None, "42%"), "42%");
    }
}
