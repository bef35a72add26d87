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

//! Static discovery documents for the upload API group.

use axum::extract::Path;
use axum::Json;

use super::error::ApiError;
use crate::cdi::k8s::discovery::{APIGroup, APIGroupList, APIResourceList, RootPaths, UPLOAD_VERSIONS};

#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/",
    responses((status = 200, description = "Paths served by this API server", body = RootPaths)),
    tag = "discovery"
))]
pub async fn root_paths() -> Json<RootPaths> {
    Json(RootPaths::upload())
}

#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/apis",
    responses((status = 200, description = "API groups served by this API server", body = APIGroupList)),
    tag = "discovery"
))]
pub async fn api_groups() -> Json<APIGroupList> {
    Json(APIGroupList::upload())
}

#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/apis/upload.cdi.kubevirt.io",
    responses((status = 200, description = "Upload API group", body = APIGroup)),
    tag = "discovery"
))]
pub async fn upload_group() -> Json<APIGroup> {
    Json(APIGroup::upload())
}

#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/apis/upload.cdi.kubevirt.io/{version}",
    params(("version" = String, Path, description = "Group version")),
    responses(
        (status = 200, description = "Resources of the upload API group", body = APIResourceList),
        (status = 404, description = "Unknown version", body = super::error::ErrorBody)
    ),
    tag = "discovery"
))]
pub async fn upload_resources(Path(version): Path<String>) -> Result<Json<APIResourceList>, ApiError> {
    if !UPLOAD_VERSIONS.contains(&version.as_str()) {
        return Err(ApiError::not_found(format!("version {version} is not served")));
    }
    Ok(Json(APIResourceList::upload(&version)))
}
