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

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::{Extension, Json};

use super::error::ApiError;
use crate::cdi::api::annotations::ANN_UPLOAD_REQUEST;
use crate::cdi::api::datavolume::DataVolumePhase;
use crate::cdi::api::upload::UploadTokenRequest;
use crate::cdi::client::Api;
use crate::cdi::controller::datavolume::upload::upload_phase;
use crate::cdi::k8s::authorization::ResourceAttributes;
use crate::cdi::k8s::discovery::{UPLOAD_GROUP, UPLOAD_VERSIONS};
use crate::cdi::k8s::volume::PersistentVolumeClaim;
use crate::cdi::logger::{log_info, log_warn};
use crate::cdi::observability::metrics;
use crate::cdi::server::auth::{authenticate, PeerCertificate};
use crate::cdi::server::AppState;
use crate::cdi::token::{jwe, Payload, UPLOAD_TOKEN_LIFETIME};

const COMPONENT: &str = "upload-token-api";

/// Issues an encrypted upload token for a claim whose upload server is ready.
#[cfg_attr(feature = "openapi", utoipa::path(
    post,
    path = "/apis/upload.cdi.kubevirt.io/{version}/namespaces/{namespace}/uploadtokenrequests",
    params(
        ("version" = String, Path, description = "Group version"),
        ("namespace" = String, Path, description = "Namespace of the target claim")
    ),
    request_body = UploadTokenRequest,
    responses(
        (status = 200, description = "Token issued", body = UploadTokenRequest),
        (status = 400, description = "Claim is not ready for upload", body = super::error::ErrorBody),
        (status = 401, description = "Caller could not be authenticated", body = super::error::ErrorBody),
        (status = 403, description = "Caller may not request upload tokens", body = super::error::ErrorBody)
    ),
    tag = "upload"
))]
pub async fn create_upload_token(
    State(state): State<AppState>,
    Path((version, namespace)): Path<(String, String)>,
    peer: Option<Extension<PeerCertificate>>,
    headers: HeaderMap,
    Json(request): Json<UploadTokenRequest>,
) -> Result<(StatusCode, Json<UploadTokenRequest>), ApiError> {
    let result = issue(&state, &version, &namespace, peer.as_ref().map(|Extension(peer)| peer), &headers, request).await;
    let label = match &result {
        Ok(_) => "issued",
        Err(err) if err.status() == StatusCode::UNAUTHORIZED || err.status() == StatusCode::FORBIDDEN => "denied",
        Err(_) => "failed",
    };
    metrics::record_upload_token(label);
    result.map(|issued| (StatusCode::OK, Json(issued)))
}

async fn issue(
    state: &AppState,
    version: &str,
    namespace: &str,
    peer: Option<&PeerCertificate>,
    headers: &HeaderMap,
    request: UploadTokenRequest,
) -> Result<UploadTokenRequest, ApiError> {
    if !UPLOAD_VERSIONS.contains(&version) {
        return Err(ApiError::not_found(format!("version {version} is not served")));
    }
    let config = state.gate.config();
    let user = authenticate(&config, peer, headers)?;
    state
        .gate
        .authorize(
            &user,
            ResourceAttributes {
                namespace: Some(namespace.to_string()),
                verb: "create".to_string(),
                group: Some(UPLOAD_GROUP.to_string()),
                version: Some(version.to_string()),
                resource: "uploadtokenrequests".to_string(),
                ..Default::default()
            },
        )
        .await
        .inspect_err(|err| {
            let error = err.to_string();
            log_warn(
                COMPONENT,
                "Upload token request rejected",
                &[("user", user.username.as_str()), ("namespace", namespace), ("error", error.as_str())],
            );
        })?;

    let claim_name = request.spec.pvc_name.as_str();
    if claim_name.is_empty() {
        return Err(ApiError::bad_request("spec.pvcName is required"));
    }
    let claims: Api<PersistentVolumeClaim> = Api::new(state.client.clone());
    let Some(claim) = claims.get_opt(namespace, claim_name).await? else {
        return Err(ApiError::bad_request(format!("PersistentVolumeClaim {namespace}/{claim_name} not found")));
    };
    if claim.metadata.annotation(ANN_UPLOAD_REQUEST).is_none() {
        return Err(ApiError::bad_request(format!(
            "PersistentVolumeClaim {namespace}/{claim_name} is not an upload target"
        )));
    }
    if upload_phase(&claim) != DataVolumePhase::UploadReady {
        return Err(ApiError::bad_request(format!(
            "PersistentVolumeClaim {namespace}/{claim_name} is not ready for upload"
        )));
    }

    let signed = state
        .keys
        .generator(UPLOAD_TOKEN_LIFETIME)?
        .generate(&Payload::upload(namespace, claim_name))?;
    let proxy_key = state.keys.proxy_public_key().await?;
    let token = jwe::encrypt(&signed, &proxy_key)?;

    log_info(
        COMPONENT,
        "Upload token issued",
        &[("user", user.username.as_str()), ("namespace", namespace), ("claim", claim_name)],
    );
    Ok(request.with_token(version, token))
}
