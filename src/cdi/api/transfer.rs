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
use crate::cdi::k8s::meta::ObjectMeta;
use crate::cdi::k8s::resource::{impl_resource, ResourceKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DATA_PV_NAME: &str = "pvName";
pub const DATA_PV_RECLAIM: &str = "pvReclaim";
pub const DATA_SOURCE: &str = "source";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum TransferPhase {
    #[default]
    #[serde(rename = "")]
    Empty,
    Pending,
    Running,
    Complete,
    Error,
}

impl TransferPhase {
    pub fn is_empty(&self) -> bool {
        *self == TransferPhase::Empty
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferPhase::Empty => "",
            TransferPhase::Pending => "Pending",
            TransferPhase::Running => "Running",
            TransferPhase::Complete => "Complete",
            TransferPhase::Error => "Error",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct TransferSource {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub required_annotations: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct TransferTarget {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ObjectTransferSpec {
    pub source: TransferSource,
    #[serde(default)]
    pub target: TransferTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ObjectTransferStatus {
    #[serde(default, skip_serializing_if = "TransferPhase::is_empty")]
    pub phase: TransferPhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, String>,
}

/// Cluster-scoped move of a claim between namespaces. The spec is immutable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ObjectTransfer {
    pub metadata: ObjectMeta,
    pub spec: ObjectTransferSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ObjectTransferStatus>,
}

impl_resource!(ObjectTransfer, ResourceKind::ObjectTransfer);

impl ObjectTransfer {
    pub fn phase(&self) -> TransferPhase {
        self.status
            .as_ref()
            .map(|status| status.phase)
            .unwrap_or_default()
    }

    pub fn target_namespace(&self) -> &str {
        self.spec
            .target
            .namespace
            .as_deref()
            .unwrap_or(&self.spec.source.namespace)
    }

    pub fn target_name(&self) -> &str {
        self.spec
            .target
            .name
            .as_deref()
            .unwrap_or(&self.spec.source.name)
    }

    pub fn status_mut(&mut self) -> &mut ObjectTransferStatus {
        self.status.get_or_insert_with(ObjectTransferStatus::default)
    }
}
