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

use super::meta::{ObjectMeta, ObjectReference};
use super::pod::ResourceRequirements;
use super::resource::{impl_resource, ResourceKind};
use crate::cdi::util::quantity::parse_quantity;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const VOLUME_MODE_FILESYSTEM: &str = "Filesystem";
pub const VOLUME_MODE_BLOCK: &str = "Block";

pub const ACCESS_RWO: &str = "ReadWriteOnce";
pub const ACCESS_ROX: &str = "ReadOnlyMany";
pub const ACCESS_RWX: &str = "ReadWriteMany";

pub const CLAIM_PENDING: &str = "Pending";
pub const CLAIM_BOUND: &str = "Bound";
pub const CLAIM_LOST: &str = "Lost";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct TypedLocalObjectReference {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct TypedObjectReference {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    pub kind: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_source: Option<TypedLocalObjectReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_source_ref: Option<TypedObjectReference>,
}

impl PersistentVolumeClaimSpec {
    pub fn requested_storage(&self) -> Option<i64> {
        self.resources
            .requests
            .get("storage")
            .and_then(|value| parse_quantity(value).ok())
    }

    pub fn volume_mode_or_default(&self) -> &str {
        self.volume_mode.as_deref().unwrap_or(VOLUME_MODE_FILESYSTEM)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub capacity: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct PersistentVolumeClaim {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PersistentVolumeClaimSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PersistentVolumeClaimStatus>,
}

impl_resource!(PersistentVolumeClaim, ResourceKind::PersistentVolumeClaim);

impl PersistentVolumeClaim {
    pub fn phase(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            .unwrap_or(CLAIM_PENDING)
    }

    pub fn is_bound(&self) -> bool {
        self.phase() == CLAIM_BOUND
    }

    pub fn requested_storage(&self) -> Option<i64> {
        self.spec.requested_storage()
    }

    /// Size actually provisioned, falling back to the request while unbound.
    pub fn capacity(&self) -> Option<i64> {
        self.status
            .as_ref()
            .and_then(|status| status.capacity.get("storage"))
            .and_then(|value| parse_quantity(value).ok())
            .or_else(|| self.requested_storage())
    }

    pub fn volume_mode(&self) -> &str {
        self.spec.volume_mode_or_default()
    }

    pub fn is_block(&self) -> bool {
        self.volume_mode() == VOLUME_MODE_BLOCK
    }

    pub fn storage_class(&self) -> Option<&str> {
        self.spec.storage_class_name.as_deref()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct CsiPersistentVolumeSource {
    pub driver: String,
    pub volume_handle: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeSpec {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub capacity: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_ref: Option<ObjectReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent_volume_reclaim_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csi: Option<CsiPersistentVolumeSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct PersistentVolumeStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct PersistentVolume {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PersistentVolumeSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PersistentVolumeStatus>,
}

impl_resource!(PersistentVolume, ResourceKind::PersistentVolume);

pub const RECLAIM_RETAIN: &str = "Retain";
pub const RECLAIM_DELETE: &str = "Delete";
pub const VOLUME_AVAILABLE: &str = "Available";
pub const VOLUME_BOUND: &str = "Bound";
pub const VOLUME_RELEASED: &str = "Released";

impl PersistentVolume {
    pub fn phase(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            .unwrap_or(VOLUME_AVAILABLE)
    }

    pub fn volume_mode(&self) -> &str {
        self.spec.volume_mode.as_deref().unwrap_or(VOLUME_MODE_FILESYSTEM)
    }

    pub fn capacity(&self) -> Option<i64> {
        self.spec
            .capacity
            .get("storage")
            .and_then(|value| parse_quantity(value).ok())
    }

    pub fn is_claimed_by(&self, namespace: &str, name: &str) -> bool {
        self.spec
            .claim_ref
            .as_ref()
            .map(|claim| {
                claim.namespace.as_deref() == Some(namespace) && claim.name.as_deref() == Some(name)
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_prefers_status_over_request() {
        let mut claim = PersistentVolumeClaim::default();
        claim
            .spec
            .resources
            .requests
            .insert("storage".to_string(), "1Gi".to_string());
        assert_eq!(claim.capacity(), Some(1 << 30));
        claim.status = Some(PersistentVolumeClaimStatus {
            phase: Some(CLAIM_BOUND.to_string()),
            capacity: HashMap::from([("storage".to_string(), "2Gi".to_string())]),
            ..Default::default()
        });
        assert_eq!(claim.capacity(), Some(2 << 30));
        assert!(claim.is_bound());
        assert_eq!(claim.volume_mode(), VOLUME_MODE_FILESYSTEM);
    }
}
