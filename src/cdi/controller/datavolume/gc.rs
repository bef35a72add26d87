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

//! Removal of completed DataVolumes once the configured TTL has elapsed.
//! The claim outlives its DataVolume and is marked as populated for it.

use super::DataVolumeReconciler;
use crate::cdi::api::annotations::{ANN_DELETE_AFTER_COMPLETION, ANN_POPULATED_FOR};
use crate::cdi::api::cdiconfig::CdiConfig;
use crate::cdi::api::conditions::{find_condition, CONDITION_READY};
use crate::cdi::api::datavolume::{DataVolume, DataVolumePhase};
use crate::cdi::controller::events::DATA_VOLUME_GARBAGE_COLLECTED;
use crate::cdi::controller::reconcile::ReconcileError;
use crate::cdi::k8s::volume::PersistentVolumeClaim;
use crate::cdi::logger::log_info;
use crate::cdi::util::time::parse_rfc3339;
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, PartialEq)]
pub(super) enum Collection {
    Skip,
    Wait(Duration),
    Collected,
}

/// Time left before a DataVolume that became ready at `ready_since` expires.
fn remaining(ready_since: Option<DateTime<Utc>>, ttl: i32, now: DateTime<Utc>) -> Duration {
    let Some(since) = ready_since else {
        return Duration::ZERO;
    };
    let expires = since + chrono::Duration::seconds(i64::from(ttl));
    (expires - now).to_std().unwrap_or(Duration::ZERO)
}

pub(super) async fn collect(
    reconciler: &DataVolumeReconciler,
    dv: &DataVolume,
    claim: Option<&PersistentVolumeClaim>,
    config: &CdiConfig,
) -> Result<Collection, ReconcileError> {
    if dv.phase() != DataVolumePhase::Succeeded
        || dv.metadata.annotation(ANN_DELETE_AFTER_COMPLETION) == Some("false")
    {
        return Ok(Collection::Skip);
    }
    let Some(ttl) = config.data_volume_ttl() else {
        return Ok(Collection::Skip);
    };
    let Some(claim) = claim.filter(|claim| claim.metadata.is_controlled_by(dv.metadata.uid())) else {
        return Ok(Collection::Skip);
    };
    let ready_since = dv
        .status
        .as_ref()
        .and_then(|status| find_condition(&status.conditions, CONDITION_READY))
        .and_then(|condition| condition.last_transition_time.as_deref())
        .and_then(parse_rfc3339);
    let left = remaining(ready_since, ttl, Utc::now());
    if !left.is_zero() {
        return Ok(Collection::Wait(left));
    }

    let mut detached = claim.clone();
    detached
        .metadata
        .owner_references
        .retain(|owner| owner.uid != dv.metadata.uid());
    detached
        .metadata
        .owner_references
        .extend(dv.metadata.owner_references.iter().cloned());
    detached
        .metadata
        .set_annotation(ANN_POPULATED_FOR, dv.metadata.name());
    let detached = reconciler.claims.update(&detached).await?;
    reconciler
        .dvs
        .delete_opt(dv.metadata.namespace(), dv.metadata.name())
        .await?;

    log_info(
        super::NAME,
        "Garbage collected completed DataVolume",
        &[
            ("namespace", dv.metadata.namespace()),
            ("datavolume", dv.metadata.name()),
        ],
    );
    reconciler
        .recorder
        .normal(
            &detached,
            DATA_VOLUME_GARBAGE_COLLECTED,
            &format!("DataVolume {} garbage collected", dv.metadata.name()),
        )
        .await;
    Ok(Collection::Collected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_counts_down_from_ready_transition() {
        let now = Utc::now();
        let since = now - chrono::Duration::seconds(40);
        assert_eq!(remaining(Some(since), 60, now), Duration::from_secs(20));
        assert_eq!(remaining(Some(since), 30, now), Duration::ZERO);
        assert_eq!(remaining(Some(since), 0, now), Duration::ZERO);
    }

    #[test]
    fn unknown_transition_time_expires_immediately() {
        assert_eq!(remaining(None, 600, Utc::now()), Duration::ZERO);
    }
}
