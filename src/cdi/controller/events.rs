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

//! Event recorder. Events with the same involved object, reason and message
//! are folded into one object whose `count` is bumped.

use crate::cdi::client::{Api, ClientError, ClusterClient};
use crate::cdi::k8s::event::{Event, EventSource, EVENT_NORMAL, EVENT_WARNING};
use crate::cdi::k8s::meta::ObjectMeta;
use crate::cdi::k8s::resource::Resource;
use crate::cdi::logger::log_debug;
use crate::cdi::util::time::now_rfc3339;
use sha2::{Digest, Sha256};
use std::sync::Arc;

const COMPONENT: &str = "events";

pub const ERR_STARTING_POD: &str = "ErrStartingPod";
pub const ERR_EXCEEDED_QUOTA: &str = "ErrExceededQuota";
pub const ERR_CLAIM_NOT_VALID: &str = "ErrClaimNotValid";
pub const ERR_INCOMPATIBLE_PVC: &str = "ErrIncompatiblePVC";
pub const ERR_UNABLE_TO_CLONE: &str = "ErrUnableToClone";
pub const CLONE_VALIDATION_FAILED: &str = "CloneValidationFailed";
pub const ERR_CLAIM_LOST: &str = "ClaimLost";
pub const ERR_IMPORT_FAILED: &str = "Error";

pub const EXTERNAL_POPULATION_SUCCEEDED: &str = "ExternalPopulationSucceeded";
pub const NO_ANY_VOLUME_DATA_SOURCE: &str = "NoAnyVolumeDataSource";
pub const NO_CSI_DRIVER_FOR_EXTERNAL_POPULATION: &str = "NoCSIDriverForExternalPopulation";

pub const CSI_CLONE_IN_PROGRESS: &str = "CSICloneInProgress";
pub const SNAPSHOT_FOR_SMART_CLONE_IN_PROGRESS: &str = "SnapshotForSmartCloneInProgress";
pub const CLONE_SCHEDULED: &str = "CloneScheduled";
pub const CLONE_SUCCEEDED: &str = "CloneSucceeded";
pub const CLONE_FAILED: &str = "CloneFailed";
pub const CLONE_SOURCE_IN_USE: &str = "CloneSourceInUse";
pub const EXPANSION_IN_PROGRESS: &str = "ExpansionInProgress";

pub const IMPORT_SUCCEEDED: &str = "ImportSucceeded";
pub const IMPORT_TARGET_IN_USE: &str = "ImportTargetInUse";
pub const IMPORT_PAUSED: &str = "ImportPaused";
pub const UPLOAD_SUCCEEDED: &str = "UploadSucceeded";
pub const CLAIM_ADOPTED: &str = "ClaimAdopted";
pub const ERR_STATIC_BINDING: &str = "ErrStaticVolumeBinding";
pub const DATA_VOLUME_GARBAGE_COLLECTED: &str = "GarbageCollected";

pub const ERR_DATA_SOURCE_ALREADY_MANAGED: &str = "ErrDataSourceAlreadyManaged";
pub const ERR_INVALID_SCHEDULE: &str = "ErrInvalidSchedule";
pub const DIGEST_NOT_FOUND: &str = "DigestNotFound";

pub const TRANSFER_ERROR: &str = "TransferError";

/// Writes core `Event` objects on behalf of one controller component.
#[derive(Clone)]
pub struct EventRecorder {
    events: Api<Event>,
    component: String,
}

impl EventRecorder {
    pub fn new(client: Arc<dyn ClusterClient>, component: impl Into<String>) -> Self {
        EventRecorder {
            events: Api::new(client),
            component: component.into(),
        }
    }

    pub async fn normal<T: Resource>(&self, object: &T, reason: &str, message: &str) {
        self.record(object, EVENT_NORMAL, reason, message).await;
    }

    pub async fn warning<T: Resource>(&self, object: &T, reason: &str, message: &str) {
        self.record(object, EVENT_WARNING, reason, message).await;
    }

    /// Best effort: failures are logged and never fail the caller's reconcile.
    pub async fn record<T: Resource>(&self, object: &T, event_type: &str, reason: &str, message: &str) {
        if let Err(err) = self.try_record(object, event_type, reason, message).await {
            let error = err.to_string();
            log_debug(
                COMPONENT,
                "Failed to record event",
                &[
                    ("object", object.name()),
                    ("reason", reason),
                    ("error", error.as_str()),
                ],
            );
        }
    }

    async fn try_record<T: Resource>(
        &self,
        object: &T,
        event_type: &str,
        reason: &str,
        message: &str,
    ) -> Result<(), ClientError> {
        let namespace = match object.namespace() {
            "" => "default",
            namespace => namespace,
        };
        let name = event_name(object, reason, message);
        let now = now_rfc3339();

        for _ in 0..3 {
            match self.events.get_opt(namespace, &name).await? {
                Some(mut existing) => {
                    existing.count = Some(existing.count.unwrap_or(1) + 1);
                    existing.last_timestamp = Some(now.clone());
                    match self.events.update(&existing).await {
                        Err(ClientError::Conflict) => continue,
                        other => return other.map(|_| ()),
                    }
                }
                None => {
                    let event = Event {
                        metadata: ObjectMeta::named(Some(namespace), &name),
                        involved_object: object.object_reference(),
                        reason: Some(reason.to_string()),
                        message: Some(message.to_string()),
                        event_type: Some(event_type.to_string()),
                        first_timestamp: Some(now.clone()),
                        last_timestamp: Some(now.clone()),
                        count: Some(1),
                        source: Some(EventSource {
                            component: Some(self.component.clone()),
                            host: None,
                        }),
                    };
                    match self.events.create(&event).await {
                        Err(ClientError::AlreadyExists) => continue,
                        other => return other.map(|_| ()),
                    }
                }
            }
        }
        Err(ClientError::Conflict)
    }
}

fn event_name<T: Resource>(object: &T, reason: &str, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(object.uid().as_bytes());
    hasher.update([0]);
    hasher.update(reason.as_bytes());
    hasher.update([0]);
    hasher.update(message.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}.{}", object.name(), &digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdi::client::InMemoryCluster;
    use crate::cdi::k8s::volume::{PersistentVolumeClaim, CLAIM_BOUND as BOUND};

    #[tokio::test]
    async fn identical_events_are_aggregated() {
        let cluster = InMemoryCluster::new();
        let recorder = EventRecorder::new(cluster.clone(), "test");
        let claims: Api<PersistentVolumeClaim> = Api::new(cluster.clone());
        let claim = claims
            .create(&PersistentVolumeClaim {
                metadata: ObjectMeta::named(Some("ns"), "target"),
                ..Default::default()
            })
            .await
            .expect("claim");

        recorder.warning(&claim, ERR_STARTING_POD, "failed to start pod").await;
        recorder.warning(&claim, ERR_STARTING_POD, "failed to start pod").await;
        recorder.normal(&claim, BOUND, "claim bound").await;

        let events: Vec<Event> = Api::<Event>::new(cluster.clone())
            .list(Some("ns"), None)
            .await
            .expect("events");
        assert_eq!(events.len(), 2);
        let starting = events
            .iter()
            .find(|event| event.reason() == ERR_STARTING_POD)
            .expect("aggregated event");
        assert_eq!(starting.count, Some(2));
        assert!(starting.is_about("PersistentVolumeClaim", "ns", "target"));
        assert_eq!(starting.event_type.as_deref(), Some(EVENT_WARNING));
    }
}
