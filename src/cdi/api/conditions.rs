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

use crate::cdi::util::time::now_rfc3339;
use serde::{Deserialize, Serialize};

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_BOUND: &str = "Bound";
pub const CONDITION_RUNNING: &str = "Running";
pub const CONDITION_UP_TO_DATE: &str = "UpToDate";
pub const CONDITION_PROGRESSING: &str = "Progressing";
pub const CONDITION_COMPLETE: &str = "Complete";

pub const STATUS_TRUE: &str = "True";
pub const STATUS_FALSE: &str = "False";
pub const STATUS_UNKNOWN: &str = "Unknown";

/// Condition shape shared by the CDI custom resources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_time: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Condition {
    pub fn is_true(&self) -> bool {
        self.status == STATUS_TRUE
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions
        .iter()
        .find(|condition| condition.condition_type == condition_type)
}

pub fn is_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    find_condition(conditions, condition_type)
        .map(Condition::is_true)
        .unwrap_or(false)
}

/// Upserts a condition; the transition time only moves when the status changes.
/// Returns true when anything other than the heartbeat changed.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> bool {
    let now = now_rfc3339();
    match conditions
        .iter_mut()
        .find(|condition| condition.condition_type == condition_type)
    {
        Some(existing) => {
            let changed = existing.status != status
                || existing.reason != reason
                || existing.message != message;
            if existing.status != status {
                existing.last_transition_time = Some(now.clone());
            }
            if changed {
                existing.status = status.to_string();
                existing.reason = reason.to_string();
                existing.message = message.to_string();
                existing.last_heartbeat_time = Some(now);
            }
            changed
        }
        None => {
            conditions.push(Condition {
                condition_type: condition_type.to_string(),
                status: status.to_string(),
                last_transition_time: Some(now.clone()),
                last_heartbeat_time: Some(now),
                reason: reason.to_string(),
                message: message.to_string(),
            });
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_time_is_stable_for_same_status() {
        let mut conditions = Vec::new();
        assert!(set_condition(&mut conditions, CONDITION_READY, STATUS_FALSE, "Pending", ""));
        let first = conditions[0].last_transition_time.clone();
        assert!(!set_condition(&mut conditions, CONDITION_READY, STATUS_FALSE, "Pending", ""));
        assert!(set_condition(&mut conditions, CONDITION_READY, STATUS_FALSE, "Other", "msg"));
        assert_eq!(conditions[0].last_transition_time, first);
        assert_eq!(conditions.len(), 1);
        assert!(!is_condition_true(&conditions, CONDITION_READY));
    }
}
