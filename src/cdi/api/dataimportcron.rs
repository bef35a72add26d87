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
use super::datavolume::{DataVolumeTemplate, NamespacedSource};
use crate::cdi::k8s::meta::ObjectMeta;
use crate::cdi::k8s::resource::{impl_resource, ResourceKind};
use serde::{Deserialize, Serialize};

pub const GARBAGE_COLLECT_OUTDATED: &str = "Outdated";
pub const GARBAGE_COLLECT_NEVER: &str = "Never";

pub const RETAIN_ALL: &str = "RetainAll";
pub const RETAIN_LATEST: &str = "RetainLatest";
pub const RETAIN_NONE: &str = "RetainNone";

pub const DEFAULT_IMPORTS_TO_KEEP: i32 = 3;

pub const REASON_UP_TO_DATE: &str = "UpToDate";
pub const REASON_OUTDATED: &str = "Outdated";
pub const REASON_NO_DIGEST: &str = "NoDigest";
pub const REASON_IMPORT_IN_PROGRESS: &str = "ImportProgressing";
pub const REASON_NO_IMPORT: &str = "NoImport";
pub const REASON_DIGEST_NOT_FOUND: &str = "DigestNotFound";
pub const REASON_IMPORT_SCHEDULED: &str = "ImportScheduled";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct DataImportCronSpec {
    pub template: DataVolumeTemplate,
    pub schedule: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub garbage_collect: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imports_to_keep: Option<i32>,
    pub managed_data_source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_policy: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ImportStatus {
    pub data_volume_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct DataImportCronStatus {
    /// Newest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub current_imports: Vec<ImportStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_import_timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_execution_timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_imported_pvc: Option<NamespacedSource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct DataImportCron {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DataImportCronSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DataImportCronStatus>,
}

impl_resource!(DataImportCron, ResourceKind::DataImportCron);

impl DataImportCron {
    pub fn imports_to_keep(&self) -> usize {
        self.spec
            .imports_to_keep
            .unwrap_or(DEFAULT_IMPORTS_TO_KEEP)
            .max(0) as usize
    }

    pub fn garbage_collects_outdated(&self) -> bool {
        self.spec.garbage_collect.as_deref().unwrap_or(GARBAGE_COLLECT_OUTDATED)
            == GARBAGE_COLLECT_OUTDATED
    }

    pub fn retention_policy(&self) -> &str {
        self.spec.retention_policy.as_deref().unwrap_or(RETAIN_ALL)
    }

    pub fn status_mut(&mut self) -> &mut DataImportCronStatus {
        self.status.get_or_insert_with(DataImportCronStatus::default)
    }
}
