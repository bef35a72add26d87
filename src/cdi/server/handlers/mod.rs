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

pub mod admission;
pub mod discovery;
pub mod error;
pub mod upload;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;

use crate::cdi::observability::{health, metrics};
use crate::cdi::server::AppState;

#[cfg(feature = "openapi")]
use utoipa::OpenApi;

pub(super) async fn healthz(State(state): State<AppState>) -> Response {
    let report = health::readiness_report(&state.client, &state.keys, &state.namespace).await;
    let status = if report.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

pub(super) async fn livez() -> Response {
    (StatusCode::OK, Json(health::liveness_report())).into_response()
}

pub(super) async fn metrics_text() -> Response {
    match metrics::gather() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => error::ApiError::internal(err.to_string()).into_response(),
    }
}

pub(super) async fn openapi_spec() -> Result<Json<Value>, StatusCode> {
    #[cfg(feature = "openapi")]
    {
        serde_json::to_value(ApiDoc::openapi())
            .map(Json)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    }
    #[cfg(not(feature = "openapi"))]
    {
        Err(StatusCode::NOT_FOUND)
    }
}

#[cfg(feature = "openapi")]
#[derive(OpenApi)]
#[openapi(
    paths(
        discovery::root_paths,
        discovery::api_groups,
        discovery::upload_group,
        discovery::upload_resources,
        upload::create_upload_token,
    ),
    components(schemas(
        crate::cdi::api::upload::UploadTokenRequest,
        crate::cdi::api::upload::UploadTokenRequestSpec,
        crate::cdi::api::upload::UploadTokenRequestStatus,
        crate::cdi::k8s::discovery::RootPaths,
        crate::cdi::k8s::discovery::APIGroup,
        crate::cdi::k8s::discovery::APIGroupList,
        crate::cdi::k8s::discovery::APIResource,
        crate::cdi::k8s::discovery::APIResourceList,
        crate::cdi::k8s::discovery::GroupVersion,
        crate::cdi::k8s::discovery::ServerAddressByClientCIDR,
        error::ErrorBody,
    )),
    tags(
        (name = "discovery", description = "API discovery"),
        (name = "upload", description = "Upload token issuance")
    )
)]
pub(super) struct ApiDoc;
