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

use crate::cdi::k8s::discovery::{UPLOAD_GROUP, UPLOAD_PREFERRED_VERSION};
use crate::cdi::k8s::meta::ObjectMeta;
use serde::{Deserialize, Serialize};

pub const UPLOAD_TOKEN_REQUEST_KIND: &str = "UploadTokenRequest";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct UploadTokenRequestSpec {
    pub pvc_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct UploadTokenRequestStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
}

/// Request for a short-lived token authorizing one upload into a claim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct UploadTokenRequest {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: UploadTokenRequestSpec,
    #[serde(default)]
    pub status: UploadTokenRequestStatus,
}

impl UploadTokenRequest {
    pub fn with_token(mut self, version: &str, token: String) -> Self {
        self.api_version = format!("{UPLOAD_GROUP}/{version}");
        self.kind = UPLOAD_TOKEN_REQUEST_KIND.to_string();
        self.status.token = token;
        self
    }

    pub fn preferred_api_version() -> String {
        format!("{UPLOAD_GROUP}/{UPLOAD_PREFERRED_VERSION}")
    }
}
