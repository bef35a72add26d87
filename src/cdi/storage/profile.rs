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

//! Resolved per-class storage knowledge. The storage profile controller keeps
//! the registry current; readers fall back to resolving on demand so a
//! reconcile never waits on the profile controller.

use super::capabilities;
use crate::cdi::api::storageprofile::{
    ClaimPropertySet, CloneStrategy, StorageProfile, StorageProfileSpec,
};
use crate::cdi::client::{Api, ClientError, ClusterClient};
use crate::cdi::k8s::storage::{
    CsiDriver, StorageClass, VolumeSnapshotClass, ANN_DEFAULT_SNAPSHOT_CLASS,
};
use crate::cdi::k8s::volume::{PersistentVolume, PersistentVolumeClaimSpec, VOLUME_MODE_FILESYSTEM};
use crate::cdi::util::quantity::format_quantity;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Everything the reconcilers need to know about one storage class.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedProfile {
    pub storage_class: String,
    pub provisioner: String,
    pub claim_property_sets: Vec<ClaimPropertySet>,
    pub clone_strategy: Option<CloneStrategy>,
    pub snapshot_class: Option<String>,
    pub csi_clone_supported: bool,
    pub allow_volume_expansion: bool,
    pub wait_for_first_consumer: bool,
    pub default_class: bool,
}

impl ResolvedProfile {
    pub fn is_complete(&self) -> bool {
        self.claim_property_sets
            .iter()
            .any(|set| !set.access_modes.is_empty())
    }

    /// Strategy in preference order: explicit choice, snapshots, CSI clone, copy.
    pub fn effective_clone_strategy(&self) -> CloneStrategy {
        if let Some(strategy) = self.clone_strategy {
            return strategy;
        }
        if self.snapshot_class.is_some() {
            CloneStrategy::Snapshot
        } else if self.csi_clone_supported {
            CloneStrategy::CsiClone
        } else {
            CloneStrategy::HostAssisted
        }
    }

    /// First property set compatible with an optional requested volume mode.
    pub fn property_set_for(&self, volume_mode: Option<&str>) -> Option<&ClaimPropertySet> {
        self.claim_property_sets.iter().find(|set| {
            !set.access_modes.is_empty()
                && match volume_mode {
                    Some(mode) => set.volume_mode.as_deref().unwrap_or(VOLUME_MODE_FILESYSTEM) == mode,
                    None => true,
                }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    NoStorageClass,
    NoAccessModes(String),
    MissingSize,
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderError::NoStorageClass => write!(f, "no default storage class is configured"),
            RenderError::NoAccessModes(class) => write!(
                f,
                "no accessMode defined on StorageProfile for {class} StorageClass"
            ),
            RenderError::MissingSize => write!(f, "PVC size is missing"),
        }
    }
}

impl std::error::Error for RenderError {}

pub struct ProfileRegistry {
    client: Arc<dyn ClusterClient>,
    profiles: RwLock<HashMap<String, Arc<ResolvedProfile>>>,
}

impl ProfileRegistry {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        ProfileRegistry {
            client,
            profiles: RwLock::new(HashMap::new()),
        }
    }

    pub fn cached(&self, storage_class: &str) -> Option<Arc<ResolvedProfile>> {
        self.profiles
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(storage_class)
            .cloned()
    }

    pub fn store(&self, profile: ResolvedProfile) -> Arc<ResolvedProfile> {
        let profile = Arc::new(profile);
        self.profiles
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(profile.storage_class.clone(), Arc::clone(&profile));
        profile
    }

    pub fn forget(&self, storage_class: &str) {
        self.profiles
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(storage_class);
    }

    pub fn incomplete_count(&self) -> usize {
        self.profiles
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter(|profile| !profile.is_complete())
            .count()
    }

    /// Profile for a class; `None` selects the cluster default class.
    /// Returns `Ok(None)` when the class does not exist.
    pub async fn lookup(
        &self,
        storage_class: Option<&str>,
    ) -> Result<Option<Arc<ResolvedProfile>>, ClientError> {
        let name = match storage_class {
            Some(name) => name.to_string(),
            None => match self.default_storage_class().await? {
                Some(class) => class.metadata.name().to_string(),
                None => return Ok(None),
            },
        };
        if let Some(profile) = self.cached(&name) {
            return Ok(Some(profile));
        }
        self.refresh(&name).await
    }

    /// Re-resolves a class from the cluster and caches the result.
    pub async fn refresh(&self, storage_class: &str) -> Result<Option<Arc<ResolvedProfile>>, ClientError> {
        let classes: Api<StorageClass> = Api::new(Arc::clone(&self.client));
        let Some(class) = classes.get_opt("", storage_class).await? else {
            self.forget(storage_class);
            return Ok(None);
        };
        let profiles: Api<StorageProfile> = Api::new(Arc::clone(&self.client));
        let spec = profiles
            .get_opt("", storage_class)
            .await?
            .map(|profile| profile.spec)
            .unwrap_or_default();
        let resolved = resolve(&self.client, &class, &spec).await?;
        Ok(Some(self.store(resolved)))
    }

    pub async fn default_storage_class(&self) -> Result<Option<StorageClass>, ClientError> {
        let classes: Api<StorageClass> = Api::new(Arc::clone(&self.client));
        Ok(classes
            .list(None, None)
            .await?
            .into_iter()
            .find(StorageClass::is_default))
    }

    /// Completes a storage template into a claim spec: class, access modes,
    /// volume mode, and a size grown by the filesystem overhead.
    pub async fn render_claim_spec(
        &self,
        template: &PersistentVolumeClaimSpec,
        filesystem_overhead: impl Fn(Option<&str>) -> f64,
    ) -> Result<PersistentVolumeClaimSpec, RenderError> {
        let profile = self
            .lookup(template.storage_class_name.as_deref())
            .await
            .ok()
            .flatten();
        render_with_profile(template, profile.as_deref(), filesystem_overhead)
    }
}

/// Rendering against an already resolved profile.
pub fn render_with_profile(
    template: &PersistentVolumeClaimSpec,
    profile: Option<&ResolvedProfile>,
    filesystem_overhead: impl Fn(Option<&str>) -> f64,
) -> Result<PersistentVolumeClaimSpec, RenderError> {
    let mut spec = template.clone();
    if spec.storage_class_name.is_none() {
        spec.storage_class_name = profile.map(|profile| profile.storage_class.clone());
    }
    if spec.access_modes.is_empty() {
        let profile = profile.ok_or(RenderError::NoStorageClass)?;
        let set = profile
            .property_set_for(template.volume_mode.as_deref())
            .ok_or_else(|| RenderError::NoAccessModes(profile.storage_class.clone()))?;
        spec.access_modes = set.access_modes.clone();
        if spec.volume_mode.is_none() {
            spec.volume_mode = set.volume_mode.clone();
        }
    } else if spec.volume_mode.is_none() {
        spec.volume_mode = profile
            .and_then(|profile| profile.property_set_for(None))
            .and_then(|set| set.volume_mode.clone());
    }
    let requested = spec.requested_storage().ok_or(RenderError::MissingSize)?;
    if spec.volume_mode_or_default() == VOLUME_MODE_FILESYSTEM {
        let overhead = filesystem_overhead(spec.storage_class_name.as_deref());
        if overhead > 0.0 && overhead < 1.0 {
            let grown = (requested as f64 / (1.0 - overhead)).ceil() as i64;
            spec.resources
                .requests
                .insert("storage".to_string(), format_quantity(grown));
        }
    }
    Ok(spec)
}

/// Discovers a class' capabilities; explicit profile spec values win.
pub async fn resolve(
    client: &Arc<dyn ClusterClient>,
    class: &StorageClass,
    spec: &StorageProfileSpec,
) -> Result<ResolvedProfile, ClientError> {
    let name = class.metadata.name().to_string();
    let claim_property_sets = if !spec.claim_property_sets.is_empty() {
        spec.claim_property_sets.clone()
    } else if let Some(found) = capabilities::lookup(class) {
        vec![found.claim_property_set()]
    } else if capabilities::is_no_provisioner(class) {
        let volumes: Api<PersistentVolume> = Api::new(Arc::clone(client));
        capabilities::from_volumes(&name, &volumes.list(None, None).await?)
    } else {
        Vec::new()
    };

    let snapshot_class = match &spec.snapshot_class {
        Some(explicit) => Some(explicit.clone()),
        None => snapshot_class_for(client, &class.provisioner).await?,
    };
    let drivers: Api<CsiDriver> = Api::new(Arc::clone(client));
    let csi_clone_supported = drivers.get_opt("", &class.provisioner).await?.is_some();

    Ok(ResolvedProfile {
        storage_class: name,
        provisioner: class.provisioner.clone(),
        claim_property_sets,
        clone_strategy: spec.clone_strategy,
        snapshot_class,
        csi_clone_supported,
        allow_volume_expansion: class.allows_expansion(),
        wait_for_first_consumer: class.waits_for_first_consumer(),
        default_class: class.is_default(),
    })
}

/// A snapshot class whose driver matches the provisioner, preferring the
/// annotated default.
async fn snapshot_class_for(
    client: &Arc<dyn ClusterClient>,
    provisioner: &str,
) -> Result<Option<String>, ClientError> {
    let classes: Api<VolumeSnapshotClass> = Api::new(Arc::clone(client));
    let mut matching: Vec<VolumeSnapshotClass> = classes
        .list(None, None)
        .await?
        .into_iter()
        .filter(|class| class.driver == provisioner)
        .collect();
    matching.sort_by_key(|class| !class.metadata.is_annotation_true(ANN_DEFAULT_SNAPSHOT_CLASS));
    Ok(matching
        .into_iter()
        .next()
        .map(|class| class.metadata.name().to_string()))
}
