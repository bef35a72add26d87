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

use crate::cdi::k8s::meta::ObjectMeta;
use crate::cdi::k8s::resource::{impl_resource, ResourceKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a clone is carried out for a storage class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum CloneStrategy {
    #[serde(rename = "copy")]
    HostAssisted,
    #[serde(rename = "snapshot")]
    Snapshot,
    #[serde(rename = "csi-clone")]
    CsiClone,
}

impl CloneStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            CloneStrategy::HostAssisted => "copy",
            CloneStrategy::Snapshot => "snapshot",
            CloneStrategy::CsiClone => "csi-clone",
        }
    }
}

impl fmt::Display for CloneStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloneStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "copy" => Ok(CloneStrategy::HostAssisted),
            "snapshot" => Ok(CloneStrategy::Snapshot),
            "csi-clone" => Ok(CloneStrategy::CsiClone),
            other => Err(format!("unknown clone strategy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ClaimPropertySet {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct StorageProfileSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clone_strategy: Option<CloneStrategy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub claim_property_sets: Vec<ClaimPropertySet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_class: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct StorageProfileStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clone_strategy: Option<CloneStrategy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub claim_property_sets: Vec<ClaimPropertySet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesystem_overhead: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_volume_expansion: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csi_clone_supported: Option<bool>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub default_class: bool,
}

/// Cluster-scoped, named after its storage class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct StorageProfile {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: StorageProfileSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StorageProfileStatus>,
}

impl_resource!(StorageProfile, ResourceKind::StorageProfile);

impl StorageProfile {
    /// Spec entries win over discovered ones.
    pub fn claim_property_sets(&self) -> &[ClaimPropertySet] {
        if !self.spec.claim_property_sets.is_empty() {
            return &self.spec.claim_property_sets;
        }
        self.status
            .as_ref()
            .map(|status| status.claim_property_sets.as_slice())
            .unwrap_or_default()
    }

    pub fn clone_strategy(&self) -> Option<CloneStrategy> {
        self.spec
            .clone_strategy
            .or_else(|| self.status.as_ref().and_then(|status| status.clone_strategy))
    }

    pub fn snapshot_class(&self) -> Option<&str> {
        self.spec.snapshot_class.as_deref().or_else(|| {
            self.status
                .as_ref()
                .and_then(|status| status.snapshot_class.as_deref())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_overrides_status() {
        let profile = StorageProfile {
            spec: StorageProfileSpec {
                clone_strategy: Some(CloneStrategy::HostAssisted),
                ..Default::default()
            },
            status: Some(StorageProfileStatus {
                clone_strategy: Some(CloneStrategy::Snapshot),
                claim_property_sets: vec![ClaimPropertySet {
                    access_modes: vec!["ReadWriteOnce".into()],
                    volume_mode: Some("Block".into()),
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(profile.clone_strategy(), Some(CloneStrategy::HostAssisted));
        assert_eq!(profile.claim_property_sets().len(), 1);
        assert_eq!("csi-clone".parse::<CloneStrategy>(), Ok(CloneStrategy::CsiClone));
    }
}
