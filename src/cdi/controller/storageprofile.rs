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

//! Publishes one `StorageProfile` per storage class and keeps the in-process
//! profile registry in step with it.

use super::cdiconfig::current_config;
use super::informer::{Controller, ControllerOptions, WatchSpec};
use super::reconcile::{
    ReconcileContext, ReconcileError, ReconcileFuture, ReconcileOutcome, ReconcileResult,
    Reconciler,
};
use super::runtime::ObjectKey;
use crate::cdi::api::annotations::{LABEL_APP, LABEL_APP_VALUE};
use crate::cdi::api::storageprofile::{StorageProfile, StorageProfileStatus};
use crate::cdi::client::{Api, ClientError, ClusterClient};
use crate::cdi::k8s::meta::ObjectMeta;
use crate::cdi::k8s::resource::{Resource, ResourceKind};
use crate::cdi::k8s::storage::StorageClass;
use crate::cdi::logger::{log_info, log_warn};
use crate::cdi::observability::metrics::set_incomplete_storage_profiles;
use crate::cdi::storage::profile::resolve;
use crate::cdi::storage::ProfileRegistry;
use serde_json::Value;
use std::sync::Arc;

const NAME: &str = "storageprofile-controller";

pub struct StorageProfileReconciler {
    classes: Api<StorageClass>,
    profiles: Api<StorageProfile>,
    client: Arc<dyn ClusterClient>,
    registry: Arc<ProfileRegistry>,
}

impl StorageProfileReconciler {
    pub fn new(ctx: &ReconcileContext) -> Result<Self, ReconcileError> {
        let client = ctx.client()?;
        Ok(StorageProfileReconciler {
            classes: Api::new(Arc::clone(&client)),
            profiles: Api::new(Arc::clone(&client)),
            registry: ctx.require::<ProfileRegistry>()?,
            client,
        })
    }

    pub fn controller(ctx: &ReconcileContext, options: ControllerOptions) -> Result<Controller, ReconcileError> {
        Ok(Controller::new(Arc::new(Self::new(ctx)?), options)
            .watch(WatchSpec::primary(ResourceKind::StorageClass))
            .watch(WatchSpec::primary(ResourceKind::StorageProfile))
            .watch(WatchSpec::all_of(
                ResourceKind::VolumeSnapshotClass,
                ResourceKind::StorageClass,
            ))
            .watch(WatchSpec::all_of(ResourceKind::CsiDriver, ResourceKind::StorageClass))
            .watch(WatchSpec::all_of(ResourceKind::CdiConfig, ResourceKind::StorageClass))
            .watch(WatchSpec::mapped(ResourceKind::PersistentVolume, |volume: &Value| {
                volume
                    .pointer("/spec/storageClassName")
                    .and_then(Value::as_str)
                    .map(ObjectKey::cluster)
                    .into_iter()
                    .collect()
            })))
    }

    async fn sync(&self, key: &ObjectKey) -> ReconcileResult {
        let Some(class) = self.classes.get_opt("", &key.name).await? else {
            self.registry.forget(&key.name);
            self.profiles.delete_opt("", &key.name).await?;
            set_incomplete_storage_profiles(self.registry.incomplete_count());
            return Ok(ReconcileOutcome::Done);
        };
        let profile = match self.profiles.get_opt("", &key.name).await? {
            Some(profile) => profile,
            None => self.create_profile(&class).await?,
        };

        let resolved = resolve(&self.client, &class, &profile.spec).await?;
        let config = current_config(&self.client).await?;
        let status = StorageProfileStatus {
            storage_class: Some(resolved.storage_class.clone()),
            provisioner: Some(resolved.provisioner.clone()),
            clone_strategy: Some(resolved.effective_clone_strategy()),
            claim_property_sets: resolved.claim_property_sets.clone(),
            snapshot_class: resolved.snapshot_class.clone(),
            filesystem_overhead: Some(
                config
                    .filesystem_overhead(Some(&resolved.storage_class))
                    .to_string(),
            ),
            allow_volume_expansion: Some(resolved.allow_volume_expansion),
            csi_clone_supported: Some(resolved.csi_clone_supported),
            default_class: resolved.default_class,
        };
        let complete = resolved.is_complete();
        self.registry.store(resolved);
        set_incomplete_storage_profiles(self.registry.incomplete_count());
        if !complete {
            log_warn(
                NAME,
                "Storage profile is incomplete; claims on this class need explicit access modes",
                &[("storageClass", class.metadata.name())],
            );
        }

        if profile.status.as_ref() != Some(&status) {
            let mut updated = profile;
            updated.status = Some(status);
            self.profiles.update_status(&updated).await?;
        }
        Ok(ReconcileOutcome::Done)
    }

    async fn create_profile(&self, class: &StorageClass) -> Result<StorageProfile, ClientError> {
        let mut metadata = ObjectMeta::named(None, class.metadata.name());
        metadata
            .labels
            .insert(LABEL_APP.to_string(), LABEL_APP_VALUE.to_string());
        metadata.owner_references.push(class.owner_reference(false));
        let profile = StorageProfile {
            metadata,
            ..Default::default()
        };
        match self.profiles.create(&profile).await {
            Ok(created) => {
                log_info(
                    NAME,
                    "Created storage profile",
                    &[("storageClass", class.metadata.name())],
                );
                Ok(created)
            }
            Err(ClientError::AlreadyExists) => self.profiles.get("", class.metadata.name()).await,
            Err(err) => Err(err),
        }
    }
}

impl Reconciler for StorageProfileReconciler {
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
    use crate::cdi::api::storageprofile::CloneStrategy;
    use crate::cdi::k8s::volume::{ACCESS_RWO, VOLUME_MODE_BLOCK};
    use crate::cdi::test_support::{add_csi_driver, add_storage_class, context_for};
    use crate::cdi::client::InMemoryCluster;

    async fn reconcile(cluster: &Arc<InMemoryCluster>, class: &str) -> StorageProfile {
        let reconciler = StorageProfileReconciler::new(&context_for(cluster)).unwrap();
        reconciler
            .reconcile(&ObjectKey::cluster(class))
            .await
            .unwrap();
        Api::<StorageProfile>::new(cluster.clone())
            .get("", class)
            .await
            .expect("profile")
    }

    #[tokio::test]
    async fn snapshot_capable_class_prefers_snapshot_clone() {
        let cluster = InMemoryCluster::new();
        add_storage_class(&cluster, "ceph", "rbd.csi.ceph.com", true).await;
        add_csi_driver(&cluster, "rbd.csi.ceph.com", true).await;

        let profile = reconcile(&cluster, "ceph").await;
        let status = profile.status.expect("status");
        assert_eq!(status.clone_strategy, Some(CloneStrategy::Snapshot));
        assert_eq!(status.snapshot_class.as_deref(), Some("rbd.csi.ceph.com-snapclass"));
        assert_eq!(status.claim_property_sets[0].volume_mode.as_deref(), Some(VOLUME_MODE_BLOCK));
        assert!(status.default_class);
    }

    #[tokio::test]
    async fn unknown_provisioner_leaves_profile_incomplete() {
        let cluster = InMemoryCluster::new();
        add_storage_class(&cluster, "mystery", "example.com/unknown", false).await;
        let profile = reconcile(&cluster, "mystery").await;
        let status = profile.status.expect("status");
        assert!(status.claim_property_sets.is_empty());
        assert_eq!(status.clone_strategy, Some(CloneStrategy::HostAssisted));
    }

    #[tokio::test]
    async fn spec_property_sets_win() {
        let cluster = InMemoryCluster::new();
        add_storage_class(&cluster, "mystery", "example.com/unknown", false).await;
        reconcile(&cluster, "mystery").await;
        let profiles = Api::<StorageProfile>::new(cluster.clone());
        let mut profile = profiles.get("", "mystery").await.unwrap();
        profile.spec.claim_property_sets = vec![crate::cdi::api::storageprofile::ClaimPropertySet {
            access_modes: vec![ACCESS_RWO.to_string()],
            volume_mode: None,
        }];
        profiles.update(&profile).await.unwrap();
        let profile = reconcile(&cluster, "mystery").await;
        assert_eq!(profile.status.unwrap().claim_property_sets.len(), 1);
    }
}
