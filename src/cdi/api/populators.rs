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

use super::datavolume::{
    DataVolumeCheckpoint, EmptySource, HttpSource, ImageIoSource, RegistrySource, S3Source,
    VddkSource,
};
use crate::cdi::k8s::meta::ObjectMeta;
use crate::cdi::k8s::resource::{impl_resource, ResourceKind};
use crate::cdi::k8s::volume::TypedLocalObjectReference;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ImportSourceType {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Source>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistrySource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imageio: Option<ImageIoSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vddk: Option<VddkSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blank: Option<EmptySource>,
}

impl ImportSourceType {
    pub fn populated_arms(&self) -> usize {
        [
            self.http.is_some(),
            self.s3.is_some(),
            self.registry.is_some(),
            self.imageio.is_some(),
            self.vddk.is_some(),
            self.blank.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct VolumeImportSourceSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ImportSourceType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preallocation: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checkpoints: Vec<DataVolumeCheckpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_checkpoint: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct VolumeImportSource {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: VolumeImportSourceSpec,
}

impl_resource!(VolumeImportSource, ResourceKind::VolumeImportSource);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct VolumeCloneSourceSpec {
    pub source: TypedLocalObjectReference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preallocation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct VolumeCloneSource {
    pub metadata: ObjectMeta,
    pub spec: VolumeCloneSourceSpec,
}

impl_resource!(VolumeCloneSource, ResourceKind::VolumeCloneSource);
