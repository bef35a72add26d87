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

use serde::{Deserialize, Serialize};

pub const UPLOAD_GROUP: &str = "upload.cdi.kubevirt.io";
pub const UPLOAD_VERSIONS: [&str; 2] = ["v1beta1", "v1alpha1"];
pub const UPLOAD_PREFERRED_VERSION: &str = "v1beta1";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ServerAddressByClientCIDR {
    #[serde(rename = "clientCIDR")]
    pub client_cidr: String,
    #[serde(rename = "serverAddress")]
    pub server_address: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct GroupVersion {
    #[serde(rename = "groupVersion")]
    pub group_version: String,
    pub version: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct APIGroup {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub versions: Vec<GroupVersion>,
    #[serde(rename = "preferredVersion")]
    pub preferred_version: GroupVersion,
    #[serde(
        rename = "serverAddressByClientCIDRs",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub server_address_by_client_cidrs: Vec<ServerAddressByClientCIDR>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct APIGroupList {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub groups: Vec<APIGroup>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct APIResource {
    pub name: String,
    #[serde(rename = "singularName")]
    pub singular_name: String,
    pub namespaced: bool,
    pub kind: String,
    pub verbs: Vec<String>,
    #[serde(rename = "shortNames", default, skip_serializing_if = "Vec::is_empty")]
    pub short_names: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct APIResourceList {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    #[serde(rename = "groupVersion")]
    pub group_version: String,
    pub resources: Vec<APIResource>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct RootPaths {
    pub paths: Vec<String>,
}

fn group_version(version: &str) -> GroupVersion {
    GroupVersion {
        group_version: format!("{UPLOAD_GROUP}/{version}"),
        version: version.to_string(),
    }
}

impl APIGroup {
    /// Discovery document for the upload group.
    pub fn upload() -> Self {
        APIGroup {
            api_version: "v1".to_string(),
            kind: "APIGroup".to_string(),
            name: UPLOAD_GROUP.to_string(),
            versions: UPLOAD_VERSIONS.iter().map(|v| group_version(v)).collect(),
            preferred_version: group_version(UPLOAD_PREFERRED_VERSION),
            server_address_by_client_cidrs: vec![ServerAddressByClientCIDR {
                client_cidr: "0.0.0.0/0".to_string(),
                server_address: String::new(),
            }],
        }
    }
}

impl APIGroupList {
    pub fn upload() -> Self {
        APIGroupList {
            api_version: "v1".to_string(),
            kind: "APIGroupList".to_string(),
            groups: vec![APIGroup::upload()],
        }
    }
}

impl APIResourceList {
    pub fn upload(version: &str) -> Self {
        APIResourceList {
            api_version: "v1".to_string(),
            kind: "APIResourceList".to_string(),
            group_version: format!("{UPLOAD_GROUP}/{version}"),
            resources: vec![APIResource {
                name: "uploadtokenrequests".to_string(),
                singular_name: "uploadtokenrequest".to_string(),
                namespaced: true,
                kind: "UploadTokenRequest".to_string(),
                verbs: vec!["create".to_string()],
                short_names: vec!["utr".to_string(), "utrs".to_string()],
            }],
        }
    }
}

impl RootPaths {
    pub fn upload() -> Self {
        let mut paths = vec![
            "/apis".to_string(),
            format!("/apis/{UPLOAD_GROUP}"),
        ];
        paths.extend(
            UPLOAD_VERSIONS
                .iter()
                .map(|version| format!("/apis/{UPLOAD_GROUP}/{version}")),
        );
        paths.push("/healthz".to_string());
        paths.push("/openapi/v2".to_string());
        RootPaths { paths }
    }
}
