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

//! Admission for the populator source objects a claim's `dataSourceRef`
//! may name.

use super::admission::{self, StatusCause, OPERATION_CREATE, OPERATION_UPDATE};
use super::datavolume::check_source;
use super::CDI_GROUP;
use crate::cdi::api::datavolume::DataVolumeSource;
use crate::cdi::api::populators::{ImportSourceType, VolumeCloneSource, VolumeImportSource, VolumeImportSourceSpec};
use crate::cdi::k8s::admission::{AdmissionRequest, AdmissionResponse};

const IMPORT_SOURCES: &str = "volumeimportsources";
const CLONE_SOURCES: &str = "volumeclonesources";

fn as_data_volume_source(source: &ImportSourceType) -> DataVolumeSource {
    DataVolumeSource {
        http: source.http.clone(),
        s3: source.s3.clone(),
        registry: source.registry.clone(),
        imageio: source.imageio.clone(),
        vddk: source.vddk.clone(),
        blank: source.blank.clone(),
        ..Default::default()
    }
}

fn check_import(spec: &VolumeImportSourceSpec) -> Vec<StatusCause> {
    let Some(source) = &spec.source else {
        return vec![StatusCause::new("spec.source", "Missing import source")];
    };
    if source.populated_arms() != 1 {
        return vec![StatusCause::new("spec.source", "Import source must have exactly one source type")];
    }
    if !spec.checkpoints.is_empty() && source.vddk.is_none() && source.imageio.is_none() {
        return vec![StatusCause::new(
            "spec.checkpoints",
            "Checkpoints are only supported for VDDK and ImageIO sources",
        )];
    }
    check_source(&as_data_volume_source(source), spec.content_type.as_deref())
}

/// Only the checkpoint list of a multi-stage import may change.
fn import_update_allowed(old: &VolumeImportSourceSpec, new: &VolumeImportSourceSpec) -> bool {
    if old == new {
        return true;
    }
    let strip = |spec: &VolumeImportSourceSpec| VolumeImportSourceSpec {
        checkpoints: Vec::new(),
        final_checkpoint: None,
        ..spec.clone()
    };
    !old.checkpoints.is_empty() && strip(old) == strip(new)
}

fn check_clone(source: &VolumeCloneSource) -> Vec<StatusCause> {
    let reference = &source.spec.source;
    if reference.kind != "PersistentVolumeClaim" && reference.kind != "VolumeSnapshot" {
        return vec![StatusCause::new(
            "spec.source.kind",
            format!("Unsupported clone source kind {}", reference.kind),
        )];
    }
    if reference.name.is_empty() {
        return vec![StatusCause::new("spec.source.name", "Clone source name is missing")];
    }
    Vec::new()
}

fn verdict(causes: Vec<StatusCause>) -> AdmissionResponse {
    if causes.is_empty() {
        admission::allowed()
    } else {
        admission::rejected(&causes)
    }
}

fn validate_import(request: &AdmissionRequest) -> AdmissionResponse {
    let source: VolumeImportSource = match admission::decode(request, false) {
        Ok(source) => source,
        Err(err) => return admission::errored(err),
    };
    if request.operation == OPERATION_UPDATE {
        let old: VolumeImportSource = match admission::decode(request, true) {
            Ok(old) => old,
            Err(err) => return admission::errored(err),
        };
        if !import_update_allowed(&old.spec, &source.spec) {
            return admission::rejected(&[StatusCause::new(
                "spec",
                "Cannot update VolumeImportSource spec other than checkpoints",
            )]);
        }
    }
    if let Some(cause) = admission::name_length(source.metadata.name(), "metadata.name") {
        return admission::rejected(&[cause]);
    }
    verdict(check_import(&source.spec))
}

fn validate_clone(request: &AdmissionRequest) -> AdmissionResponse {
    let source: VolumeCloneSource = match admission::decode(request, false) {
        Ok(source) => source,
        Err(err) => return admission::errored(err),
    };
    if request.operation == OPERATION_UPDATE {
        let old: VolumeCloneSource = match admission::decode(request, true) {
            Ok(old) => old,
            Err(err) => return admission::errored(err),
        };
        if old.spec != source.spec {
            return admission::rejected(&[StatusCause::new("spec", "Cannot update VolumeCloneSource spec")]);
        }
    }
    if let Some(cause) = admission::name_length(source.metadata.name(), "metadata.name") {
        return admission::rejected(&[cause]);
    }
    verdict(check_clone(&source))
}

pub fn validate(request: &AdmissionRequest) -> AdmissionResponse {
    if let Err(err) = admission::expect_resource(request, CDI_GROUP, &[IMPORT_SOURCES, CLONE_SOURCES]) {
        return admission::errored(err);
    }
    if request.operation != OPERATION_CREATE && request.operation != OPERATION_UPDATE {
        return admission::allowed();
    }
    if request.resource.resource == IMPORT_SOURCES {
        validate_import(request)
    } else {
        validate_clone(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdi::api::datavolume::{DataVolumeCheckpoint, EmptySource, HttpSource, VddkSource};
    use crate::cdi::k8s::volume::TypedLocalObjectReference;

    fn http_spec() -> VolumeImportSourceSpec {
        VolumeImportSourceSpec {
            source: Some(ImportSourceType {
                http: Some(HttpSource {
                    url: "http://images.example.com/cirros.img".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn import_sources_need_exactly_one_arm() {
        assert!(check_import(&http_spec()).is_empty());
        let mut two = http_spec();
        if let Some(source) = two.source.as_mut() {
            source.blank = Some(EmptySource {});
        }
        assert_eq!(check_import(&two)[0].field, "spec.source");
        assert!(!check_import(&VolumeImportSourceSpec::default()).is_empty());
    }

    #[test]
    fn checkpoints_need_a_multi_stage_source() {
        let mut spec = http_spec();
        spec.checkpoints.push(DataVolumeCheckpoint {
            previous: String::new(),
            current: "one".to_string(),
        });
        assert_eq!(check_import(&spec)[0].field, "spec.checkpoints");
    }

    #[test]
    fn only_checkpoints_may_change() {
        let old = VolumeImportSourceSpec {
            source: Some(ImportSourceType {
                vddk: Some(VddkSource::default()),
                ..Default::default()
            }),
            checkpoints: vec![DataVolumeCheckpoint {
                previous: String::new(),
                current: "one".to_string(),
            }],
            ..Default::default()
        };
        let mut new = old.clone();
        new.final_checkpoint = Some(true);
        assert!(import_update_allowed(&old, &new));
        new.content_type = Some("archive".to_string());
        assert!(!import_update_allowed(&old, &new));
    }

    #[test]
    fn clone_sources_name_a_claim_or_snapshot() {
        let source = |kind: &str, name: &str| VolumeCloneSource {
            spec: crate::cdi::api::populators::VolumeCloneSourceSpec {
                source: TypedLocalObjectReference {
                    api_group: None,
                    kind: kind.to_string(),
                    name: name.to_string(),
                },
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(check_clone(&source("PersistentVolumeClaim", "golden")).is_empty());
        assert!(check_clone(&source("VolumeSnapshot", "snap")).is_empty());
        assert!(!check_clone(&source("Pod", "golden")).is_empty());
        assert!(!check_clone(&source("VolumeSnapshot", "")).is_empty());
    }
}
