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

use super::conditions::Condition;
use super::datavolume::NamespacedSource;
use crate::cdi::k8s::meta::ObjectMeta;
use crate::cdi::k8s::resource::{impl_resource, ResourceKind};
use serde::{Deserialize, Serialize};

pub const REASON_READY: &str = "Ready";
pub const REASON_NOT_FOUND: &str = "NotFound";
pub const REASON_NO_PVC: &str = "NoPvc";
pub const REASON_NO_SOURCE: &str = "NoSource";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct DataSourceSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pvc: Option<NamespacedSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<NamespacedSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct DataSourceSpec {
    #[serde(default)]
    pub source: DataSourceSource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct DataSourceStatus {
    #[serde(default)]
    pub source: DataSourceSource,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Stable handle to the latest usable import.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DataSourceSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DataSourceStatus>,
}

impl_resource!(DataSource, ResourceKind::DataSource);

impl DataSource {
    /// The claim this source points at, with the namespace defaulted to its own.
    pub fn pvc_source(&self) -> Option<NamespacedSource> {
        self.spec.source.pvc.as_ref().map(|pvc| NamespacedSource {
            namespace: if pvc.namespace.is_empty() {
                self.metadata.namespace().to_string()
            } else {
                pvc.namespace.clone()
            },
            name: pvc.name.clone(),
        })
    }

    pub fn snapshot_source(&self) -> Option<NamespacedSource> {
        self.spec.source.snapshot.as_ref().map(|snap| NamespacedSource {
            namespace: if snap.namespace.is_empty() {
                self.metadata.namespace().to_string()
            } else {
                snap.namespace.clone()
            },
            name: snap.name.clone(),
        })
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|status| status.conditions.as_slice())
            .unwrap_or_default()
    }
}
