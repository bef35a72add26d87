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

//! DataVolume admission: structural validation of the spec, immutability on
//! update, and clone-token minting for cross-namespace clones.

use reqwest::Url;

use super::admission::{self, StatusCause, OPERATION_CREATE, OPERATION_UPDATE};
use super::{client_failure, AdmissionContext, CDI_GROUP};
use crate::cdi::api::annotations::{ANN_CLONE_TOKEN, ANN_CONTENT_TYPE, ANN_DELETE_AFTER_COMPLETION};
use crate::cdi::api::cdiconfig::{CdiConfig, FEATURE_WEBHOOK_PVC_RENDERING};
use crate::cdi::api::datasource::DataSource;
use crate::cdi::api::datavolume::{
    DataVolume, DataVolumeSource, DataVolumeSpec, RegistrySource, CONTENT_TYPE_ARCHIVE, CONTENT_TYPE_KUBEVIRT,
    PULL_METHOD_NODE, PULL_METHOD_POD,
};
use crate::cdi::controller::clone::CloneRef;
use crate::cdi::controller::datavolume::adoption::adoptable;
use crate::cdi::k8s::admission::{AdmissionRequest, AdmissionResponse};
use crate::cdi::k8s::authorization::{ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec};
use crate::cdi::k8s::volume::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, ACCESS_ROX, ACCESS_RWO, ACCESS_RWX, VOLUME_MODE_BLOCK,
};
use crate::cdi::storage::RenderError;
use crate::cdi::token::{Payload, CLONE_TOKEN_LIFETIME};

const RESOURCE: &str = "datavolumes";
const ACCESS_RWOP: &str = "ReadWriteOncePod";
const REGISTRY_SCHEMES: [&str; 2] = ["docker", "oci-archive"];

fn invalid(field: &str, message: impl Into<String>) -> Vec<StatusCause> {
    vec![StatusCause::new(field, message)]
}

fn check_url(url: &str, field: &str) -> Option<StatusCause> {
    if url.is_empty() {
        return Some(StatusCause::new(field, "spec.source source URL is empty"));
    }
    match Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => None,
        Ok(_) => Some(StatusCause::new(field, format!("spec.source Invalid source URL scheme: {url}"))),
        Err(_) => Some(StatusCause::new(field, format!("spec.source Invalid source URL: {url}"))),
    }
}

fn check_registry(registry: &RegistrySource, content_type: &str) -> Vec<StatusCause> {
    const FIELD: &str = "spec.source.registry";
    if content_type != CONTENT_TYPE_KUBEVIRT {
        return invalid(
            "spec.contentType",
            format!("ContentType must be {CONTENT_TYPE_KUBEVIRT} when Source is Registry"),
        );
    }
    match (&registry.url, &registry.image_stream) {
        (Some(_), Some(_)) | (None, None) => {
            return invalid(FIELD, "Source registry should have either URL or ImageStream")
        }
        (Some(url), None) => match Url::parse(url) {
            Ok(parsed) if REGISTRY_SCHEMES.contains(&parsed.scheme()) => {}
            Ok(_) => return invalid(FIELD, format!("Illegal registry source URL scheme {url}")),
            Err(_) => return invalid(FIELD, format!("Illegal registry source URL {url}")),
        },
        (None, Some(stream)) if stream.is_empty() => {
            return invalid(FIELD, "Source registry ImageStream is not valid")
        }
        (None, Some(_)) => {}
    }
    if let Some(method) = registry.pull_method.as_deref() {
        if method != PULL_METHOD_POD && method != PULL_METHOD_NODE {
            return invalid(
                FIELD,
                format!("ImportMethod {method} is neither {PULL_METHOD_POD}, {PULL_METHOD_NODE} or \"\""),
            );
        }
    }
    if registry.image_stream.is_some() && registry.pull_method.as_deref() != Some(PULL_METHOD_NODE) {
        return invalid(FIELD, "Source registry ImageStream is supported only with node pull import method");
    }
    Vec::new()
}

/// Rules that need only the source itself.
pub(crate) fn check_source(source: &DataVolumeSource, content_type: Option<&str>) -> Vec<StatusCause> {
    let kinds = source.kinds();
    if kinds.is_empty() {
        return invalid("spec.source", "Missing Data volume source");
    }
    if kinds.len() > 1 {
        return invalid("spec.source", "Multiple Data volume sources");
    }
    let content_type = match content_type {
        None | Some("") => CONTENT_TYPE_KUBEVIRT,
        Some(value) if value == CONTENT_TYPE_KUBEVIRT || value == CONTENT_TYPE_ARCHIVE => value,
        Some(_) => {
            return invalid(
                "spec.contentType",
                format!("ContentType not one of: {CONTENT_TYPE_KUBEVIRT}, {CONTENT_TYPE_ARCHIVE}"),
            )
        }
    };
    if let Some(http) = &source.http {
        return check_url(&http.url, "spec.source.http.url").into_iter().collect();
    }
    if let Some(s3) = &source.s3 {
        return check_url(&s3.url, "spec.source.s3.url").into_iter().collect();
    }
    if let Some(registry) = &source.registry {
        return check_registry(registry, content_type);
    }
    if source.blank.is_some() && content_type == CONTENT_TYPE_ARCHIVE {
        return invalid("spec.contentType", "SourceType cannot be blank and the contentType be archive");
    }
    if let Some(imageio) = &source.imageio {
        if imageio.secret_ref.as_deref().unwrap_or_default().is_empty()
            || imageio.cert_config_map.as_deref().unwrap_or_default().is_empty()
            || imageio.disk_id.is_empty()
        {
            return invalid("spec.source.imageio", "spec.source.imageio source Imageio is not valid");
        }
        return check_url(&imageio.url, "spec.source.imageio.url").into_iter().collect();
    }
    if let Some(vddk) = &source.vddk {
        if vddk.secret_ref.as_deref().unwrap_or_default().is_empty()
            || vddk.uuid.is_empty()
            || vddk.backing_file.is_empty()
            || vddk.thumbprint.as_deref().unwrap_or_default().is_empty()
        {
            return invalid("spec.source.vddk", "spec.source.vddk source VDDK is not valid");
        }
        return check_url(&vddk.url, "spec.source.vddk.url").into_iter().collect();
    }
    if let Some(pvc) = &source.pvc {
        if pvc.name.is_empty() {
            return invalid("spec.source.pvc", "spec.source.pvc source PVC is not valid");
        }
    }
    if let Some(snapshot) = &source.snapshot {
        if snapshot.name.is_empty() {
            return invalid("spec.source.snapshot", "spec.source.snapshot source snapshot is not valid");
        }
    }
    Vec::new()
}

fn check_access_modes(modes: &[String], field: &str) -> Vec<StatusCause> {
    for mode in modes {
        if ![ACCESS_RWO, ACCESS_ROX, ACCESS_RWX, ACCESS_RWOP].contains(&mode.as_str()) {
            return invalid(
                field,
                format!(
                    "Unsupported value: \"{mode}\": supported values: \"ReadOnlyMany\", \"ReadWriteMany\", \"ReadWriteOnce\", \"ReadWriteOncePod\""
                ),
            );
        }
    }
    Vec::new()
}

fn check_size(template: &PersistentVolumeClaimSpec, field: &str, required: bool) -> Vec<StatusCause> {
    match template.resources.requests.get("storage") {
        None if required => invalid(field, "PVC size is missing"),
        None => Vec::new(),
        Some(_) => match template.requested_storage() {
            Some(size) if size > 0 => Vec::new(),
            _ => invalid(field, "PVC size can't be equal or less than zero"),
        },
    }
}

/// Rules on the claim template. A `storage` template may leave access modes
/// and size for the profile and the clone source to supply.
pub(crate) fn check_template(spec: &DataVolumeSpec) -> Vec<StatusCause> {
    let causes = match (&spec.pvc, &spec.storage) {
        (None, None) => return invalid("spec.pvc", "Missing Data volume PVC"),
        (Some(_), Some(_)) => {
            return invalid("spec", "Duplicate storage definition, both target storage and target pvc defined")
        }
        (Some(pvc), None) => {
            let mut causes = check_size(pvc, "spec.pvc.resources.requests.size", true);
            if causes.is_empty() && pvc.access_modes.is_empty() {
                causes = invalid("spec.pvc.accessModes", "Required value: at least 1 access mode is required");
            }
            if causes.is_empty() {
                causes = check_access_modes(&pvc.access_modes, "spec.pvc.accessModes");
            }
            causes
        }
        (None, Some(storage)) => {
            let mut causes = check_size(storage, "spec.storage.resources.requests.size", false);
            if causes.is_empty() {
                causes = check_access_modes(&storage.access_modes, "spec.storage.accessModes");
            }
            causes
        }
    };
    if !causes.is_empty() {
        return causes;
    }
    let block = spec
        .claim_template()
        .and_then(|template| template.volume_mode.as_deref())
        == Some(VOLUME_MODE_BLOCK);
    if block && spec.is_archive() {
        return invalid("spec.contentType", "ContentType archive cannot be used with Block volume mode");
    }
    Vec::new()
}

/// The clone a DataVolume asks for, resolving a DataSource reference.
/// `Err` carries a rejection.
async fn clone_source(ctx: &AdmissionContext, dv: &DataVolume) -> Result<Option<CloneRef>, AdmissionResponse> {
    let namespace = dv.metadata.namespace();
    let or_own = |candidate: &str| {
        if candidate.is_empty() {
            namespace.to_string()
        } else {
            candidate.to_string()
        }
    };
    if let Some(reference) = &dv.spec.source_ref {
        let source_namespace = reference.namespace.as_deref().unwrap_or(namespace);
        let found = ctx
            .api::<DataSource>()
            .get_opt(source_namespace, &reference.name)
            .await
            .map_err(client_failure)?;
        let Some(found) = found else {
            return Ok(None);
        };
        if let Some(pvc) = found.pvc_source() {
            return Ok(Some(CloneRef::Claim {
                namespace: or_own(&pvc.namespace),
                name: pvc.name,
            }));
        }
        return Ok(found.snapshot_source().map(|snapshot| CloneRef::Snapshot {
            namespace: or_own(&snapshot.namespace),
            name: snapshot.name,
        }));
    }
    let Some(source) = &dv.spec.source else {
        return Ok(None);
    };
    if let Some(pvc) = &source.pvc {
        return Ok(Some(CloneRef::Claim {
            namespace: or_own(&pvc.namespace),
            name: pvc.name.clone(),
        }));
    }
    Ok(source.snapshot.as_ref().map(|snapshot| CloneRef::Snapshot {
        namespace: or_own(&snapshot.namespace),
        name: snapshot.name.clone(),
    }))
}

fn multi_stage_edit(old: &DataVolumeSpec, new: &DataVolumeSpec) -> bool {
    let is_vddk = new.source.as_ref().map(|source| source.vddk.is_some()).unwrap_or(false);
    if !is_vddk || new.checkpoints.is_empty() {
        return false;
    }
    let strip = |spec: &DataVolumeSpec| DataVolumeSpec {
        checkpoints: Vec::new(),
        final_checkpoint: None,
        ..spec.clone()
    };
    strip(old) == strip(new)
}

/// An existing claim of the same name is acceptable only when the
/// DataVolume can take it over.
async fn check_existing_claim(
    ctx: &AdmissionContext,
    dv: &DataVolume,
    config: &CdiConfig,
) -> Result<Vec<StatusCause>, AdmissionResponse> {
    let claim = ctx
        .api::<PersistentVolumeClaim>()
        .get_opt(dv.metadata.namespace(), dv.metadata.name())
        .await
        .map_err(client_failure)?;
    let Some(claim) = claim else {
        return Ok(Vec::new());
    };
    let owned_by_data_volume = claim
        .metadata
        .controller_ref()
        .map(|owner| owner.kind == "DataVolume")
        .unwrap_or(false);
    if owned_by_data_volume || adoptable(dv, &claim, config) {
        return Ok(Vec::new());
    }
    Ok(invalid(
        "DataVolume.Name",
        format!(
            "Destination PVC {}/{} already exists",
            dv.metadata.namespace(),
            dv.metadata.name()
        ),
    ))
}

async fn check_clone_source(ctx: &AdmissionContext, dv: &DataVolume, reference: &CloneRef) -> Result<Vec<StatusCause>, AdmissionResponse> {
    let CloneRef::Claim { namespace, name } = reference else {
        return Ok(Vec::new());
    };
    let claim = ctx
        .api::<PersistentVolumeClaim>()
        .get_opt(namespace, name)
        .await
        .map_err(client_failure)?;
    let Some(claim) = claim else {
        // A DataSource may point at a claim that is still being populated.
        if dv.spec.source_ref.is_some() {
            return Ok(Vec::new());
        }
        return Ok(invalid(
            "spec.source.pvc",
            format!("Source PVC {namespace}/{name} doesn't exist"),
        ));
    };
    let source_content = claim
        .metadata
        .annotation(ANN_CONTENT_TYPE)
        .filter(|value| !value.is_empty())
        .unwrap_or(CONTENT_TYPE_KUBEVIRT);
    let target_content = dv.spec.content_type();
    if source_content != target_content {
        return Ok(invalid(
            "spec.pvc",
            format!("Source contentType ({source_content}) and target contentType ({target_content}) do not match"),
        ));
    }
    Ok(Vec::new())
}

/// A cross-namespace clone must carry a token minted for exactly this pair.
async fn check_clone_token(ctx: &AdmissionContext, dv: &DataVolume, reference: &CloneRef) -> Vec<StatusCause> {
    const FIELD: &str = "metadata.annotations";
    if reference.namespace() == dv.metadata.namespace() {
        return Vec::new();
    }
    let Some(token) = dv.metadata.annotation(ANN_CLONE_TOKEN) else {
        return invalid(FIELD, "Clone token is missing for a cross-namespace clone");
    };
    let verified = match ctx.keys.clone_token_validator().await {
        Ok(validator) => validator.validate(token).and_then(|payload| {
            payload.verify_clone(
                reference.namespace(),
                reference.name(),
                dv.metadata.namespace(),
                dv.metadata.name(),
                None,
            )
        }),
        Err(err) => Err(err),
    };
    match verified {
        Ok(()) => Vec::new(),
        Err(err) => invalid(FIELD, format!("Invalid clone token: {err}")),
    }
}

/// Without webhook-side rendering, a storage template lacking access modes
/// needs a profile that can supply them.
async fn check_profile_access_modes(ctx: &AdmissionContext, spec: &DataVolumeSpec, config: &CdiConfig) -> Vec<StatusCause> {
    let Some(storage) = &spec.storage else {
        return Vec::new();
    };
    if !storage.access_modes.is_empty() || config.feature_gate_enabled(FEATURE_WEBHOOK_PVC_RENDERING) {
        return Vec::new();
    }
    match ctx
        .profiles
        .render_claim_spec(storage, |class| config.filesystem_overhead(class))
        .await
    {
        Err(err @ RenderError::NoAccessModes(_)) => invalid("spec.storage.accessModes", err.to_string()),
        _ => Vec::new(),
    }
}

pub async fn validate(ctx: &AdmissionContext, request: &AdmissionRequest) -> AdmissionResponse {
    if let Err(err) = admission::expect_resource(request, CDI_GROUP, &[RESOURCE]) {
        return admission::errored(err);
    }
    let dv: DataVolume = match admission::decode(request, false) {
        Ok(dv) => dv,
        Err(err) => return admission::errored(err),
    };

    if request.operation == OPERATION_UPDATE {
        let old: DataVolume = match admission::decode(request, true) {
            Ok(old) => old,
            Err(err) => return admission::errored(err),
        };
        if old.spec != dv.spec && !multi_stage_edit(&old.spec, &dv.spec) {
            return admission::rejected(&invalid("DataVolume.Spec", "Cannot update DataVolume Spec"));
        }
        return admission::allowed();
    }
    if let Some(cause) = admission::name_length(dv.metadata.name(), "metadata.name") {
        return admission::rejected(&[cause]);
    }
    if request.operation != OPERATION_CREATE {
        return admission::allowed();
    }

    let causes = match (&dv.spec.source, &dv.spec.source_ref) {
        (Some(_), Some(_)) => invalid("spec", "Data volume should have either Source or SourceRef, not both"),
        (Some(source), None) => check_source(source, dv.spec.content_type.as_deref()),
        (None, Some(reference)) if reference.kind != "DataSource" => {
            invalid("spec.sourceRef.kind", format!("Unsupported sourceRef kind {}", reference.kind))
        }
        (None, Some(reference)) if reference.name.is_empty() => {
            invalid("spec.sourceRef.name", "SourceRef name is missing")
        }
        (None, Some(_)) => Vec::new(),
        (None, None) => {
            let external = dv
                .spec
                .claim_template()
                .map(|template| template.data_source_ref.is_some())
                .unwrap_or(false);
            if external {
                Vec::new()
            } else {
                invalid("spec.source", "Missing Data volume source")
            }
        }
    };
    if !causes.is_empty() {
        return admission::rejected(&causes);
    }
    let causes = check_template(&dv.spec);
    if !causes.is_empty() {
        return admission::rejected(&causes);
    }

    let config = match ctx.config().await {
        Ok(config) => config,
        Err(err) => return client_failure(err),
    };
    match check_existing_claim(ctx, &dv, &config).await {
        Ok(causes) if !causes.is_empty() => return admission::rejected(&causes),
        Ok(_) => {}
        Err(response) => return response,
    }
    let causes = check_profile_access_modes(ctx, &dv.spec, &config).await;
    if !causes.is_empty() {
        return admission::rejected(&causes);
    }
    let reference = match clone_source(ctx, &dv).await {
        Ok(reference) => reference,
        Err(response) => return response,
    };
    if let Some(reference) = reference {
        match check_clone_source(ctx, &dv, &reference).await {
            Ok(causes) if !causes.is_empty() => return admission::rejected(&causes),
            Ok(_) => {}
            Err(response) => return response,
        }
        let causes = check_clone_token(ctx, &dv, &reference).await;
        if !causes.is_empty() {
            return admission::rejected(&causes);
        }
    }
    admission::allowed()
}

/// Asks whether the requesting user may read `reference` for cloning.
async fn authorize_clone(
    ctx: &AdmissionContext,
    request: &AdmissionRequest,
    reference: &CloneRef,
) -> Result<Result<(), String>, AdmissionResponse> {
    let user = &request.user_info;
    let review = SubjectAccessReview::new(SubjectAccessReviewSpec {
        user: Some(user.username.clone()),
        groups: user.groups.clone(),
        extra: user.extra.clone(),
        uid: user.uid.clone(),
        resource_attributes: Some(ResourceAttributes {
            namespace: Some(reference.namespace().to_string()),
            verb: "create".to_string(),
            group: Some(CDI_GROUP.to_string()),
            version: None,
            resource: RESOURCE.to_string(),
            subresource: Some("source".to_string()),
            name: None,
        }),
    });
    let review = ctx
        .client
        .create_subject_access_review(review)
        .await
        .map_err(client_failure)?;
    if review.allowed() {
        return Ok(Ok(()));
    }
    let reason = review
        .status
        .and_then(|status| status.reason)
        .unwrap_or_else(|| format!("user {} may not clone from {}", user.username, reference.namespace()));
    Ok(Err(reason))
}

/// Fills access and volume modes of a storage template from its profile.
async fn render_storage(ctx: &AdmissionContext, dv: &mut DataVolume, config: &CdiConfig) {
    let Some(storage) = dv.spec.storage.as_mut() else {
        return;
    };
    if !storage.access_modes.is_empty() {
        return;
    }
    if let Ok(rendered) = ctx
        .profiles
        .render_claim_spec(storage, |class| config.filesystem_overhead(class))
        .await
    {
        storage.access_modes = rendered.access_modes;
        if storage.volume_mode.is_none() {
            storage.volume_mode = rendered.volume_mode;
        }
    }
}

pub async fn mutate(ctx: &AdmissionContext, request: &AdmissionRequest) -> AdmissionResponse {
    if let Err(err) = admission::expect_resource(request, CDI_GROUP, &[RESOURCE]) {
        return admission::errored(err);
    }
    let mut original: DataVolume = match admission::decode(request, false) {
        Ok(dv) => dv,
        Err(err) => return admission::errored(err),
    };
    if original.metadata.is_deleting() {
        return admission::allowed();
    }
    if original.metadata.namespace.as_deref().unwrap_or_default().is_empty() {
        original.metadata.namespace = Some(request.namespace.clone());
    }
    if original.metadata.name.as_deref().unwrap_or_default().is_empty() {
        original.metadata.name = Some(request.name.clone());
    }
    let mut modified = original.clone();
    let creating = request.operation == OPERATION_CREATE;

    if creating {
        let config = match ctx.config().await {
            Ok(config) => config,
            Err(err) => return client_failure(err),
        };
        if config.data_volume_ttl().is_some() && modified.metadata.annotation(ANN_DELETE_AFTER_COMPLETION) != Some("false") {
            modified.metadata.set_annotation(ANN_DELETE_AFTER_COMPLETION, "true");
        }
        if config.feature_gate_enabled(FEATURE_WEBHOOK_PVC_RENDERING) {
            render_storage(ctx, &mut modified, &config).await;
        }
    }

    let reference = match clone_source(ctx, &modified).await {
        Ok(Some(reference)) if reference.namespace() != modified.metadata.namespace() => reference,
        Ok(_) => return admission::patched(&original, &modified),
        Err(response) => return response,
    };
    match authorize_clone(ctx, request, &reference).await {
        Ok(Ok(())) => {}
        Ok(Err(reason)) => return admission::rejected(&invalid("spec.source.PVC.namespace", reason)),
        Err(response) => return response,
    }
    if !creating {
        return admission::patched(&original, &modified);
    }

    let payload = Payload::clone_source(
        reference.namespace(),
        reference.name(),
        modified.metadata.namespace(),
        modified.metadata.name(),
    );
    let token = match ctx
        .keys
        .generator(CLONE_TOKEN_LIFETIME)
        .and_then(|generator| generator.generate(&payload))
    {
        Ok(token) => token,
        Err(err) => return admission::errored(err),
    };
    modified.metadata.set_annotation(ANN_CLONE_TOKEN, &token);
    admission::patched(&original, &modified)
}
