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

use super::admission::{self, StatusCause, MAX_NAME_LENGTH, OPERATION_CREATE, OPERATION_UPDATE};
use super::datavolume::{check_source, check_template};
use super::{AdmissionContext, CDI_GROUP};
use crate::cdi::api::dataimportcron::{
    DataImportCron, DEFAULT_IMPORTS_TO_KEEP, GARBAGE_COLLECT_NEVER, GARBAGE_COLLECT_OUTDATED, RETAIN_ALL,
};
use crate::cdi::k8s::admission::{AdmissionRequest, AdmissionResponse};
use crate::cdi::scheduler::CronSchedule;

const RESOURCE: &str = "dataimportcrons";

fn causes(cron: &DataImportCron) -> Vec<StatusCause> {
    let spec = &cron.spec;
    let dv = &spec.template.spec;
    let Some(source) = &dv.source else {
        return vec![StatusCause::new("spec.template.spec.source", "Missing template source")];
    };
    if source.registry.is_none() {
        return vec![StatusCause::new(
            "spec.template.spec.source",
            "Only registry sources are supported by DataImportCron",
        )];
    }
    if dv.source_ref.is_some() {
        return vec![StatusCause::new("spec.template.spec.sourceRef", "SourceRef is not supported")];
    }
    if dv.content_type.as_deref().map(|value| !value.is_empty()).unwrap_or(false) {
        return vec![StatusCause::new("spec.template.spec.contentType", "ContentType is not supported")];
    }
    if !dv.checkpoints.is_empty() || dv.final_checkpoint.is_some() {
        return vec![StatusCause::new(
            "spec.template.spec.checkpoints",
            "Checkpoints are not supported by DataImportCron",
        )];
    }
    let found = check_source(source, None);
    if !found.is_empty() {
        return found;
    }
    let found = check_template(dv);
    if !found.is_empty() {
        return found;
    }
    if let Err(err) = CronSchedule::from_standard(&spec.schedule) {
        return vec![StatusCause::new("spec.schedule", format!("Illegal cron schedule: {err}"))];
    }
    if let Some(policy) = spec.garbage_collect.as_deref() {
        if policy != GARBAGE_COLLECT_OUTDATED && policy != GARBAGE_COLLECT_NEVER {
            return vec![StatusCause::new(
                "spec.garbageCollect",
                format!("Illegal GarbageCollect value: {policy}"),
            )];
        }
    }
    if spec.imports_to_keep.map(|keep| keep < 0).unwrap_or(false) {
        return vec![StatusCause::new("spec.importsToKeep", "ImportsToKeep must not be negative")];
    }
    if spec.managed_data_source.is_empty() {
        return vec![StatusCause::new("spec.managedDataSource", "Illegal managedDataSource value")];
    }
    if spec.managed_data_source.len() > MAX_NAME_LENGTH {
        return vec![StatusCause::new(
            "spec.managedDataSource",
            format!("managedDataSource name cannot be longer than {MAX_NAME_LENGTH} characters"),
        )];
    }
    Vec::new()
}

pub async fn validate(_ctx: &AdmissionContext, request: &AdmissionRequest) -> AdmissionResponse {
    if let Err(err) = admission::expect_resource(request, CDI_GROUP, &[RESOURCE]) {
        return admission::errored(err);
    }
    let cron: DataImportCron = match admission::decode(request, false) {
        Ok(cron) => cron,
        Err(err) => return admission::errored(err),
    };
    if request.operation == OPERATION_UPDATE {
        let old: DataImportCron = match admission::decode(request, true) {
            Ok(old) => old,
            Err(err) => return admission::errored(err),
        };
        if old.spec != cron.spec {
            return admission::rejected(&[StatusCause::new(
                "DataImportCron.Spec",
                "Cannot update DataImportCron Spec",
            )]);
        }
        return admission::allowed();
    }
    if request.operation != OPERATION_CREATE {
        return admission::allowed();
    }
    if let Some(cause) = admission::name_length(cron.metadata.name(), "metadata.name") {
        return admission::rejected(&[cause]);
    }
    let found = causes(&cron);
    if found.is_empty() {
        admission::allowed()
    } else {
        admission::rejected(&found)
    }
}

/// Fills retention and garbage-collection defaults on creation.
pub fn mutate(request: &AdmissionRequest) -> AdmissionResponse {
    if let Err(err) = admission::expect_resource(request, CDI_GROUP, &[RESOURCE]) {
        return admission::errored(err);
    }
    let original: DataImportCron = match admission::decode(request, false) {
        Ok(cron) => cron,
        Err(err) => return admission::errored(err),
    };
    if request.operation != OPERATION_CREATE {
        return admission::allowed();
    }
    let mut modified = original.clone();
    modified.spec.imports_to_keep.get_or_insert(DEFAULT_IMPORTS_TO_KEEP);
    modified
        .spec
        .garbage_collect
        .get_or_insert_with(|| GARBAGE_COLLECT_OUTDATED.to_string());
    modified
        .spec
        .retention_policy
        .get_or_insert_with(|| RETAIN_ALL.to_string());
    admission::patched(&original, &modified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdi::api::dataimportcron::DataImportCronSpec;
    use crate::cdi::api::datavolume::{DataVolumeSource, DataVolumeSpec, DataVolumeTemplate, RegistrySource};
    use crate::cdi::k8s::admission::{GroupVersionResource, UserInfo};
    use crate::cdi::k8s::meta::ObjectMeta;
    use crate::cdi::k8s::volume::PersistentVolumeClaimSpec;
    use base64::Engine;
    use serde_json::{json, Value};

    fn cron(schedule: &str) -> DataImportCron {
        DataImportCron {
            metadata: ObjectMeta::named(Some("golden"), "fedora"),
            spec: DataImportCronSpec {
                template: DataVolumeTemplate {
                    metadata: ObjectMeta::default(),
                    spec: DataVolumeSpec {
                        source: Some(DataVolumeSource {
                            registry: Some(RegistrySource {
                                url: Some("docker://quay.io/containerdisks/fedora:latest".to_string()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        storage: Some(PersistentVolumeClaimSpec::default()),
                        ..Default::default()
                    },
                },
                schedule: schedule.to_string(),
                managed_data_source: "fedora".to_string(),
                ..Default::default()
            },
            status: None,
        }
    }

    fn request(operation: &str, object: &DataImportCron) -> AdmissionRequest {
        AdmissionRequest {
            uid: "req-1".to_string(),
            resource: GroupVersionResource {
                group: CDI_GROUP.to_string(),
                version: "v1beta1".to_string(),
                resource: RESOURCE.to_string(),
            },
            name: object.metadata.name().to_string(),
            namespace: object.metadata.namespace().to_string(),
            operation: operation.to_string(),
            user_info: UserInfo::default(),
            object: serde_json::to_value(object).ok(),
            ..Default::default()
        }
    }

    #[test]
    fn well_formed_crons_pass() {
        assert!(causes(&cron("30 1 * * 1")).is_empty());
    }

    #[test]
    fn bad_schedules_are_rejected() {
        let found = causes(&cron("every tuesday"));
        assert_eq!(found[0].field, "spec.schedule");
    }

    #[test]
    fn only_registry_sources_are_accepted() {
        let mut http = cron("0 0 * * *");
        http.spec.template.spec.source = Some(DataVolumeSource {
            blank: Some(Default::default()),
            ..Default::default()
        });
        assert_eq!(causes(&http)[0].field, "spec.template.spec.source");

        let mut unmanaged = cron("0 0 * * *");
        unmanaged.spec.managed_data_source.clear();
        assert_eq!(causes(&unmanaged)[0].field, "spec.managedDataSource");

        let mut collected = cron("0 0 * * *");
        collected.spec.garbage_collect = Some("Sometimes".to_string());
        assert_eq!(causes(&collected)[0].field, "spec.garbageCollect");
    }

    #[test]
    fn creation_fills_defaults() {
        let response = mutate(&request(OPERATION_CREATE, &cron("0 0 * * *")));
        assert!(response.allowed);
        let patch = response.patch.expect("patch");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(patch)
            .expect("base64");
        let ops: Vec<Value> = serde_json::from_slice(&decoded).expect("json");
        assert!(ops.contains(&json!({"op": "add", "path": "/spec/importsToKeep", "value": 3})));
        assert!(ops.contains(&json!({"op": "add", "path": "/spec/garbageCollect", "value": "Outdated"})));
        assert!(ops.contains(&json!({"op": "add", "path": "/spec/retentionPolicy", "value": "RetainAll"})));
    }
}
