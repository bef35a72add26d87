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
use crate::cdi::k8s::pod::ResourceRequirements;
use crate::cdi::k8s::resource::{impl_resource, ResourceKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Name of the singleton CDIConfig object.
pub const CDI_CONFIG_NAME: &str = "config";

pub const DEFAULT_FILESYSTEM_OVERHEAD: &str = "0.055";

pub const FEATURE_DATA_VOLUME_CLAIM_ADOPTION: &str = "DataVolumeClaimAdoption";
pub const FEATURE_HONOR_WAIT_FOR_FIRST_CONSUMER: &str = "HonorWaitForFirstConsumer";
pub const FEATURE_WEBHOOK_PVC_RENDERING: &str = "WebhookPvcRendering";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ImportProxy {
    #[serde(rename = "HTTPProxy", skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,
    #[serde(rename = "HTTPSProxy", skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<String>,
    #[serde(rename = "noProxy", skip_serializing_if = "Option::is_none")]
    pub no_proxy: Option<String>,
    #[serde(rename = "trustedCAProxy", skip_serializing_if = "Option::is_none")]
    pub trusted_ca_proxy: Option<String>,
}

impl ImportProxy {
    pub fn is_empty(&self) -> bool {
        self.http_proxy.is_none() && self.https_proxy.is_none() && self.no_proxy.is_none()
    }
}

/// Fractions of a filesystem volume reserved for metadata, as decimal strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct FilesystemOverhead {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub global: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub storage_class: HashMap<String, String>,
}

impl FilesystemOverhead {
    /// Overhead for a class, falling back to the global value and then the default.
    pub fn for_class(&self, storage_class: Option<&str>) -> f64 {
        storage_class
            .and_then(|class| self.storage_class.get(class))
            .and_then(|value| value.parse::<f64>().ok())
            .or_else(|| self.global.parse::<f64>().ok())
            .unwrap_or(0.055)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct CdiConfigSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_proxy_url_override: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_proxy: Option<ImportProxy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_space_storage_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_resource_requirements: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feature_gates: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesystem_overhead: Option<FilesystemOverhead>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub insecure_registries: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_volume_ttl_seconds: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preallocation: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct CdiConfigStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_proxy_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_proxy: Option<ImportProxy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_space_storage_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_pod_resource_requirements: Option<ResourceRequirements>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesystem_overhead: Option<FilesystemOverhead>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preallocation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_volume_ttl_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feature_gates: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct CdiConfig {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: CdiConfigSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CdiConfigStatus>,
}

impl_resource!(CdiConfig, ResourceKind::CdiConfig);

impl CdiConfig {
    pub fn feature_gate_enabled(&self, gate: &str) -> bool {
        self.spec.feature_gates.iter().any(|enabled| enabled == gate)
    }

    pub fn filesystem_overhead(&self, storage_class: Option<&str>) -> f64 {
        self.status
            .as_ref()
            .and_then(|status| status.filesystem_overhead.as_ref())
            .or(self.spec.filesystem_overhead.as_ref())
            .map(|overhead| overhead.for_class(storage_class))
            .unwrap_or(0.055)
    }

    pub fn import_proxy(&self) -> Option<&ImportProxy> {
        self.status
            .as_ref()
            .and_then(|status| status.import_proxy.as_ref())
            .filter(|proxy| !proxy.is_empty())
    }

    pub fn data_volume_ttl(&self) -> Option<i32> {
        self.spec.data_volume_ttl_seconds.filter(|ttl| *ttl >= 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overhead_prefers_class_value() {
        let overhead = FilesystemOverhead {
            global: "0.1".into(),
            storage_class: HashMap::from([("fast".to_string(), "0.2".to_string())]),
        };
        assert_eq!(overhead.for_class(Some("fast")), 0.2);
        assert_eq!(overhead.for_class(Some("slow")), 0.1);
        assert_eq!(FilesystemOverhead::default().for_class(None), 0.055);
    }
}
