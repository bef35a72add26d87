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

//! DataSource controller: reports whether the claim or snapshot a DataSource
//! points at can be consumed.

use super::informer::{Controller, ControllerOptions, WatchSpec};
use super::reconcile::{
    ReconcileContext, ReconcileError, ReconcileFuture, ReconcileOutcome, ReconcileResult,
    Reconciler,
};
use super::runtime::ObjectKey;
use crate::cdi::api::conditions::{set_condition, CONDITION_READY, STATUS_FALSE, STATUS_TRUE};
use crate::cdi::api::datasource::{
    DataSource, REASON_NOT_FOUND, REASON_NO_PVC, REASON_NO_SOURCE, REASON_READY,
};
use crate::cdi::api::datavolume::{DataVolume, DataVolumePhase};
use crate::cdi::client::Api;
use crate::cdi::k8s::resource::ResourceKind;
use crate::cdi::k8s::storage::VolumeSnapshot;
use crate::cdi::k8s::volume::PersistentVolumeClaim;
use crate::cdi::logger::log_debug;
use std::sync::Arc;

const NAME: &str = "datasource-controller";

/// Ready condition as (status, reason, message).
type Readiness = (&'static str, String, String);

fn ready() -> Readiness {
    (
        STATUS_TRUE,
        REASON_READY.to_string(),
        "DataSource is ready to be consumed".to_string(),
    )
}

fn not_ready(reason: &str, message: String) -> Readiness {
    (STATUS_FALSE, reason.to_string(), message)
}

/// A DataVolume of the claim's name decides readiness; otherwise the claim does.
fn claim_readiness(dv: Option<&DataVolume>, claim: Option<&PersistentVolumeClaim>, name: &str) -> Readiness {
    match (dv, claim) {
        (Some(dv), _) if dv.phase() == DataVolumePhase::Succeeded => ready(),
        (Some(dv), _) => {
            let phase = dv.phase();
            not_ready(phase.as_str(), format!("Import DataVolume phase {phase}"))
        }
        (None, Some(claim)) if claim.is_bound() => ready(),
        (None, Some(claim)) => not_ready(
            claim.phase(),
            format!("PersistentVolumeClaim {name} is {}", claim.phase()),
        ),
        (None, None) => not_ready(REASON_NOT_FOUND, format!("PersistentVolumeClaim {name} not found")),
    }
}

pub struct DataSourceReconciler {
    sources: Api<DataSource>,
    dvs: Api<DataVolume>,
    claims: Api<PersistentVolumeClaim>,
    snapshots: Api<VolumeSnapshot>,
}

impl DataSourceReconciler {
    pub fn new(ctx: &ReconcileContext) -> Result<Self, ReconcileError> {
        let client = ctx.client()?;
        Ok(DataSourceReconciler {
            sources: Api::new(Arc::clone(&client)),
            dvs: Api::new(Arc::clone(&client)),
            claims: Api::new(Arc::clone(&client)),
            snapshots: Api::new(client),
        })
    }

    /// Sources may point across namespaces, so every DataSource is
    /// re-evaluated when a DataVolume, claim or snapshot changes.
    pub fn controller(ctx: &ReconcileContext, options: ControllerOptions) -> Result<Controller, ReconcileError> {
        Ok(Controller::new(Arc::new(Self::new(ctx)?), options)
            .watch(WatchSpec::primary(ResourceKind::DataSource))
            .watch(WatchSpec::all_of(ResourceKind::DataVolume, ResourceKind::DataSource))
            .watch(WatchSpec::all_of(
                ResourceKind::PersistentVolumeClaim,
                ResourceKind::DataSource,
            ))
            .watch(WatchSpec::all_of(ResourceKind::VolumeSnapshot, ResourceKind::DataSource)))
    }

    async fn sync(&self, key: &ObjectKey) -> ReconcileResult {
        let Some(source) = self.sources.get_opt(&key.namespace, &key.name).await? else {
            return Ok(ReconcileOutcome::Done);
        };
        let (status, reason, message) = self.readiness(&source).await?;

        let mut updated = source.clone();
        let current = updated.status.get_or_insert_with(Default::default);
        current.source = source.spec.source.clone();
        set_condition(&mut current.conditions, CONDITION_READY, status, &reason, &message);
        if updated.status != source.status {
            log_debug(
                NAME,
                "DataSource readiness changed",
                &[
                    ("namespace", key.namespace.as_str()),
                    ("datasource", key.name.as_str()),
                    ("reason", reason.as_str()),
                ],
            );
            self.sources.update_status(&updated).await?;
        }
        Ok(ReconcileOutcome::Done)
    }

    async fn readiness(&self, source: &DataSource) -> Result<Readiness, ReconcileError> {
        if let Some(pvc) = source.pvc_source() {
            let dv = self.dvs.get_opt(&pvc.namespace, &pvc.name).await?;
            let claim = match dv {
                Some(_) => None,
                None => self.claims.get_opt(&pvc.namespace, &pvc.name).await?,
            };
            return Ok(claim_readiness(dv.as_ref(), claim.as_ref(), &pvc.name));
        }
        if let Some(snapshot) = source.snapshot_source() {
            return Ok(match self.snapshots.get_opt(&snapshot.namespace, &snapshot.name).await? {
                Some(found) if found.is_ready() => ready(),
                Some(_) => not_ready(
                    REASON_NO_SOURCE,
                    format!("VolumeSnapshot {} is not ready", snapshot.name),
                ),
                None => not_ready(
                    REASON_NOT_FOUND,
                    format!("VolumeSnapshot {} not found", snapshot.name),
                ),
            });
        }
        Ok(not_ready(REASON_NO_PVC, "No source PVC set".to_string()))
    }
}

impl Reconciler for DataSourceReconciler {
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
    use crate::cdi::api::datavolume::DataVolumeStatus;
    use crate::cdi::k8s::meta::ObjectMeta;
    use crate::cdi::k8s::volume::{PersistentVolumeClaimStatus, CLAIM_BOUND};

    fn dv(phase: DataVolumePhase) -> DataVolume {
        DataVolume {
            metadata: ObjectMeta::named(Some("ns"), "golden"),
            status: Some(DataVolumeStatus {
                phase,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn data_volume_phase_decides_readiness() {
        let (status, reason, _) = claim_readiness(Some(&dv(DataVolumePhase::Succeeded)), None, "golden");
        assert_eq!((status, reason.as_str()), (STATUS_TRUE, REASON_READY));
        let (status, reason, message) =
            claim_readiness(Some(&dv(DataVolumePhase::ImportInProgress)), None, "golden");
        assert_eq!(status, STATUS_FALSE);
        assert_eq!(reason, "ImportInProgress");
        assert_eq!(message, "Import DataVolume phase ImportInProgress");
    }

    #[test]
    fn bare_claims_are_ready_once_bound() {
        let mut claim = PersistentVolumeClaim {
            metadata: ObjectMeta::named(Some("ns"), "golden"),
            ..Default::default()
        };
        assert_eq!(claim_readiness(None, Some(&claim), "golden").0, STATUS_FALSE);
        claim.status = Some(PersistentVolumeClaimStatus {
            phase: Some(CLAIM_BOUND.to_string()),
            ..Default::default()
        });
        assert_eq!(claim_readiness(None, Some(&claim), "golden").0, STATUS_TRUE);
        let (_, reason, _) = claim_readiness(None, None, "golden");
        assert_eq!(reason, REASON_NOT_FOUND);
    }
}
