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
use crate::cdi::k8s::volume::PersistentVolumeClaimSpec;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const CONTENT_TYPE_KUBEVIRT: &str = "kubevirt";
pub const CONTENT_TYPE_ARCHIVE: &str = "archive";

pub const PULL_METHOD_POD: &str = "pod";
pub const PULL_METHOD_NODE: &str = "node";

/// Name of the progress value reported before a worker publishes one.
pub const PROGRESS_UNKNOWN: &str = "N/A";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct HttpSource {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_config_map: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_headers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_extra_headers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct S3Source {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_config_map: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct RegistrySource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_stream: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_config_map: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ImageIoSource {
    pub url: String,
    pub disk_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_config_map: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct VddkSource {
    pub url: String,
    pub uuid: String,
    pub backing_file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_image_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EmptySource {}

/// Namespaced reference to an existing claim or snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct NamespacedSource {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

/// One-of source descriptor; admission rejects zero or several arms.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Source>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistrySource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload: Option<EmptySource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blank: Option<EmptySource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pvc: Option<NamespacedSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<NamespacedSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imageio: Option<ImageIoSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vddk: Option<VddkSource>,
}

/// Which arm of [`DataVolumeSource`] is populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Http,
    S3,
    Registry,
    Upload,
    Blank,
    Pvc,
    Snapshot,
    ImageIo,
    Vddk,
}

impl SourceKind {
    /// Value handed to the importer in `IMPORTER_SOURCE`.
    pub fn importer_source(self) -> &'static str {
        match self {
            SourceKind::Http => "http",
            SourceKind::S3 => "s3",
            SourceKind::Registry => "registry",
            SourceKind::ImageIo => "imageio",
            SourceKind::Vddk => "vddk",
            SourceKind::Blank => "none",
            SourceKind::Upload => "upload",
            SourceKind::Pvc => "pvc",
            SourceKind::Snapshot => "snapshot",
        }
    }
}

impl DataVolumeSource {
    /// Every populated arm, in declaration order.
    pub fn kinds(&self) -> Vec<SourceKind> {
        let mut kinds = Vec::new();
        let mut push = |present: bool, kind| {
            if present {
                kinds.push(kind);
            }
        };
        push(self.http.is_some(), SourceKind::Http);
        push(self.s3.is_some(), SourceKind::S3);
        push(self.registry.is_some(), SourceKind::Registry);
        push(self.upload.is_some(), SourceKind::Upload);
        push(self.blank.is_some(), SourceKind::Blank);
        push(self.pvc.is_some(), SourceKind::Pvc);
        push(self.snapshot.is_some(), SourceKind::Snapshot);
        push(self.imageio.is_some(), SourceKind::ImageIo);
        push(self.vddk.is_some(), SourceKind::Vddk);
        kinds
    }

    pub fn kind(&self) -> Option<SourceKind> {
        match self.kinds().as_slice() {
            [single] => Some(*single),
            _ => None,
        }
    }

    pub fn endpoint(&self) -> Option<&str> {
        if let Some(http) = &self.http {
            return Some(&http.url);
        }
        if let Some(s3) = &self.s3 {
            return Some(&s3.url);
        }
        if let Some(registry) = &self.registry {
            return registry.url.as_deref().or(registry.image_stream.as_deref());
        }
        if let Some(imageio) = &self.imageio {
            return Some(&imageio.url);
        }
        self.vddk.as_ref().map(|vddk| vddk.url.as_str())
    }

    pub fn secret_ref(&self) -> Option<&str> {
        self.http
            .as_ref()
            .and_then(|s| s.secret_ref.as_deref())
            .or_else(|| self.s3.as_ref().and_then(|s| s.secret_ref.as_deref()))
            .or_else(|| self.registry.as_ref().and_then(|s| s.secret_ref.as_deref()))
            .or_else(|| self.imageio.as_ref().and_then(|s| s.secret_ref.as_deref()))
            .or_else(|| self.vddk.as_ref().and_then(|s| s.secret_ref.as_deref()))
    }

    pub fn cert_config_map(&self) -> Option<&str> {
        self.http
            .as_ref()
            .and_then(|s| s.cert_config_map.as_deref())
            .or_else(|| self.s3.as_ref().and_then(|s| s.cert_config_map.as_deref()))
            .or_else(|| {
                self.registry
                    .as_ref()
                    .and_then(|s| s.cert_config_map.as_deref())
            })
            .or_else(|| {
                self.imageio
                    .as_ref()
                    .and_then(|s| s.cert_config_map.as_deref())
            })
    }
}

/// Points a DataVolume at a DataSource instead of an inline source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSourceRef {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeCheckpoint {
    pub previous: String,
    pub current: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<DataVolumeSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<DataVolumeSourceRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pvc: Option<PersistentVolumeClaimSpec>,
    /// Storage template; access and volume modes may be left for the profile to fill.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<PersistentVolumeClaimSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checkpoints: Vec<DataVolumeCheckpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_checkpoint: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preallocation: Option<bool>,
}

impl DataVolumeSpec {
    pub fn source_kind(&self) -> Option<SourceKind> {
        self.source.as_ref().and_then(DataVolumeSource::kind)
    }

    pub fn claim_template(&self) -> Option<&PersistentVolumeClaimSpec> {
        self.pvc.as_ref().or(self.storage.as_ref())
    }

    pub fn content_type(&self) -> &str {
        match self.content_type.as_deref() {
            Some(value) if !value.is_empty() => value,
            _ => CONTENT_TYPE_KUBEVIRT,
        }
    }

    pub fn is_archive(&self) -> bool {
        self.content_type() == CONTENT_TYPE_ARCHIVE
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum DataVolumePhase {
    #[default]
    #[serde(rename = "")]
    Unset,
    Pending,
    #[serde(rename = "PVCBound")]
    PvcBound,
    ImportScheduled,
    ImportInProgress,
    CloneScheduled,
    CloneInProgress,
    SnapshotForSmartCloneInProgress,
    CloneFromSnapshotSourceInProgress,
    SmartClonePVCInProgress,
    #[serde(rename = "CSICloneInProgress")]
    CsiCloneInProgress,
    ExpansionInProgress,
    NamespaceTransferInProgress,
    UploadScheduled,
    UploadReady,
    WaitForFirstConsumer,
    PendingPopulation,
    Succeeded,
    Failed,
    Paused,
    Unknown,
}

impl DataVolumePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            DataVolumePhase::Unset => "",
            DataVolumePhase::Pending => "Pending",
            DataVolumePhase::PvcBound => "PVCBound",
            DataVolumePhase::ImportScheduled => "ImportScheduled",
            DataVolumePhase::ImportInProgress => "ImportInProgress",
            DataVolumePhase::CloneScheduled => "CloneScheduled",
            DataVolumePhase::CloneInProgress => "CloneInProgress",
            DataVolumePhase::SnapshotForSmartCloneInProgress => "SnapshotForSmartCloneInProgress",
            DataVolumePhase::CloneFromSnapshotSourceInProgress => {
                "CloneFromSnapshotSourceInProgress"
            }
            DataVolumePhase::SmartClonePVCInProgress => "SmartClonePVCInProgress",
            DataVolumePhase::CsiCloneInProgress => "CSICloneInProgress",
            DataVolumePhase::ExpansionInProgress => "ExpansionInProgress",
            DataVolumePhase::NamespaceTransferInProgress => "NamespaceTransferInProgress",
            DataVolumePhase::UploadScheduled => "UploadScheduled",
            DataVolumePhase::UploadReady => "UploadReady",
            DataVolumePhase::WaitForFirstConsumer => "WaitForFirstConsumer",
            DataVolumePhase::PendingPopulation => "PendingPopulation",
            DataVolumePhase::Succeeded => "Succeeded",
            DataVolumePhase::Failed => "Failed",
            DataVolumePhase::Paused => "Paused",
            DataVolumePhase::Unknown => "Unknown",
        }
    }

    pub fn is_unset(&self) -> bool {
        *self == DataVolumePhase::Unset
    }

    pub fn is_succeeded(self) -> bool {
        self == DataVolumePhase::Succeeded
    }
}

impl fmt::Display for DataVolumePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeStatus {
    #[serde(default, skip_serializing_if = "DataVolumePhase::is_unset")]
    pub phase: DataVolumePhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub progress: String,
    #[serde(default)]
    pub restart_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct DataVolume {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DataVolumeSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DataVolumeStatus>,
}

impl_resource!(DataVolume, ResourceKind::DataVolume);

impl DataVolume {
    pub fn phase(&self) -> DataVolumePhase {
        self.status
            .as_ref()
            .map(|status| status.phase)
            .unwrap_or_default()
    }

    pub fn status_mut(&mut self) -> &mut DataVolumeStatus {
        self.status.get_or_insert_with(DataVolumeStatus::default)
    }

    /// Multi-stage imports list checkpoints; they finish only on the final one.
    pub fn is_multi_stage(&self) -> bool {
        !self.spec.checkpoints.is_empty()
    }
}

/// DataVolume embedded in a DataImportCron.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeTemplate {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DataVolumeSpec,
}
