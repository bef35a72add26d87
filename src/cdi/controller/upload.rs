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

//! Claim-level upload loop: keeps an upload server pod and its service alive
//! for claims that await an upload, and tears both down once data arrived.

use super::cdiconfig::current_config;
use super::events::{EventRecorder, ERR_EXCEEDED_QUOTA, UPLOAD_SUCCEEDED};
use super::informer::{Controller, ControllerOptions, WatchSpec};
use super::pods::{
    ensure_scratch_claim, record_pod_state, scratch_claim_name, worker_pod_name, ClaimAttachment,
    PodError, WorkerPodSpec, WorkerPods, WorkerRole, BLOCK_DEVICE_PATH, FILESYSTEM_MOUNT_PATH,
};
use super::reconcile::{
    ReconcileContext, ReconcileError, ReconcileFuture, ReconcileOutcome, ReconcileResult,
    Reconciler,
};
use super::runtime::ObjectKey;
use crate::cdi::api::annotations::*;
use crate::cdi::api::datavolume::{CONTENT_TYPE_ARCHIVE, CONTENT_TYPE_KUBEVIRT};
use crate::cdi::client::{Api, ClientError, ClusterClient};
use crate::cdi::config::Settings;
use crate::cdi::k8s::meta::ObjectMeta;
use crate::cdi::k8s::objects::{Service, ServicePort, ServiceSpec};
use crate::cdi::k8s::pod::{ContainerPort, EnvVar, HttpGetAction, Pod, Probe, POD_SUCCEEDED};
use crate::cdi::k8s::resource::{Resource, ResourceKind};
use crate::cdi::k8s::volume::{PersistentVolumeClaim, VOLUME_MODE_FILESYSTEM};
use crate::cdi::logger::log_info;
use crate::cdi::util::naming::resource_name;
use std::collections::HashMap;
use std::sync::Arc;

const NAME: &str = "upload-controller";

pub const UPLOAD_SERVER_PORT: u16 = 8443;
const HEALTH_PORT: u16 = 8080;

/// Service fronting the upload pod of a claim.
pub fn upload_service_name(claim: &str) -> String {
    resource_name("cdi-upload", claim)
}

pub fn is_upload_claim(claim: &PersistentVolumeClaim) -> bool {
    claim.metadata.annotation(ANN_UPLOAD_REQUEST).is_some()
}

fn content_type_of(claim: &PersistentVolumeClaim) -> &str {
    match claim.metadata.annotation(ANN_CONTENT_TYPE) {
        Some(CONTENT_TYPE_ARCHIVE) => CONTENT_TYPE_ARCHIVE,
        _ => CONTENT_TYPE_KUBEVIRT,
    }
}

/// ClusterIP service selecting the claim's `role` pod on the upload port.
pub async fn ensure_upload_service(
    services: &Api<Service>,
    claim: &PersistentVolumeClaim,
    role: WorkerRole,
) -> Result<(), ClientError> {
    let name = upload_service_name(claim.metadata.name());
    if services
        .get_opt(claim.metadata.namespace(), &name)
        .await?
        .is_some()
    {
        return Ok(());
    }
    let mut metadata = ObjectMeta::named(Some(claim.metadata.namespace()), &name);
    metadata
        .labels
        .insert(LABEL_APP.to_string(), LABEL_APP_VALUE.to_string());
    metadata
        .labels
        .insert(LABEL_COMPONENT.to_string(), role.component().to_string());
    metadata.owner_references.push(claim.owner_reference(true));
    let mut selector = HashMap::new();
    selector.insert(LABEL_OWNER_UID.to_string(), claim.metadata.uid().to_string());
    selector.insert(LABEL_COMPONENT.to_string(), role.component().to_string());
    let service = Service {
        metadata,
        spec: ServiceSpec {
            selector,
            ports: vec![ServicePort {
                name: Some("uploadproxy".to_string()),
                port: 443,
                target_port: Some(UPLOAD_SERVER_PORT),
                protocol: Some("TCP".to_string()),
            }],
            service_type: Some("ClusterIP".to_string()),
        },
    };
    match services.create(&service).await {
        Ok(_) | Err(ClientError::AlreadyExists) => Ok(()),
        Err(err) => Err(err),
    }
}

pub async fn remove_upload_service(
    services: &Api<Service>,
    claim: &PersistentVolumeClaim,
) -> Result<(), ClientError> {
    services
        .delete_opt(
            claim.metadata.namespace(),
            &upload_service_name(claim.metadata.name()),
        )
        .await
        .map(|_| ())
}

/// Health and upload ports of an upload server container.
pub fn upload_server_ports() -> (Vec<ContainerPort>, Probe) {
    let ports = vec![ContainerPort {
        name: Some("uploadserver".to_string()),
        container_port: UPLOAD_SERVER_PORT,
        protocol: Some("TCP".to_string()),
    }];
    let probe = Probe {
        http_get: Some(HttpGetAction {
            path: "/healthz".to_string(),
            port: HEALTH_PORT,
            scheme: None,
        }),
        initial_delay_seconds: Some(2),
        period_seconds: Some(5),
    };
    (ports, probe)
}

pub struct UploadReconciler {
    claims: Api<PersistentVolumeClaim>,
    services: Api<Service>,
    pods: WorkerPods,
    client: Arc<dyn ClusterClient>,
    settings: Arc<Settings>,
    recorder: EventRecorder,
}

impl UploadReconciler {
    pub fn new(ctx: &ReconcileContext) -> Result<Self, ReconcileError> {
        let client = ctx.client()?;
        let recorder = EventRecorder::new(Arc::clone(&client), NAME);
        Ok(UploadReconciler {
            claims: Api::new(Arc::clone(&client)),
            services: Api::new(Arc::clone(&client)),
            pods: WorkerPods::new(Arc::clone(&client), recorder.clone()),
            settings: ctx.require::<Settings>()?,
            client,
            recorder,
        })
    }

    pub fn controller(ctx: &ReconcileContext, options: ControllerOptions) -> Result<Controller, ReconcileError> {
        Ok(Controller::new(Arc::new(Self::new(ctx)?), options)
            .watch(WatchSpec::primary(ResourceKind::PersistentVolumeClaim))
            .watch(WatchSpec::owned_by(ResourceKind::Pod, ResourceKind::PersistentVolumeClaim))
            .watch(WatchSpec::namespace_of(
                ResourceKind::ResourceQuota,
                ResourceKind::PersistentVolumeClaim,
            )))
    }

    async fn sync(&self, key: &ObjectKey) -> ReconcileResult {
        let Some(claim) = self.claims.get_opt(&key.namespace, &key.name).await? else {
            return Ok(ReconcileOutcome::Done);
        };
        if !is_upload_claim(&claim) {
            return Ok(ReconcileOutcome::Done);
        }
        let pod_name = worker_pod_name(claim.metadata.uid(), WorkerRole::Upload);
        let pod = self
            .pods
            .get(&key.namespace, &pod_name)
            .await?
            .filter(|pod| pod.metadata.is_controlled_by(claim.metadata.uid()));

        if claim.metadata.is_deleting() {
            if let Some(pod) = pod {
                self.pods.delete(&key.namespace, pod.metadata.name()).await?;
            }
            remove_upload_service(&self.services, &claim).await?;
            return Ok(ReconcileOutcome::Done);
        }
        if claim.metadata.annotation(ANN_POD_PHASE) == Some(POD_SUCCEEDED) {
            if let Some(pod) = pod {
                return self.observe(claim, pod).await;
            }
            remove_upload_service(&self.services, &claim).await?;
            return Ok(ReconcileOutcome::Done);
        }

        let pod = match pod {
            Some(pod) => pod,
            None => match self.start(&claim).await? {
                Some(pod) => pod,
                None => return Ok(ReconcileOutcome::Done),
            },
        };
        ensure_upload_service(&self.services, &claim, WorkerRole::Upload).await?;
        self.observe(claim, pod).await
    }

    async fn start(&self, claim: &PersistentVolumeClaim) -> Result<Option<Pod>, ReconcileError> {
        let config = current_config(&self.client).await?;
        let mut spec = WorkerPodSpec::new(
            WorkerRole::Upload,
            claim,
            &self.settings.uploadserver_image,
            &self.settings.pull_policy,
        );
        let destination = if claim.is_block() {
            BLOCK_DEVICE_PATH.to_string()
        } else {
            format!("{FILESYSTEM_MOUNT_PATH}/disk.img")
        };
        let overhead = if claim.volume_mode() == VOLUME_MODE_FILESYSTEM {
            config.filesystem_overhead(claim.storage_class())
        } else {
            0.0
        };
        spec.env = vec![
            EnvVar::new("OWNER_UID", claim.metadata.uid()),
            EnvVar::new("UPLOAD_CONTENT_TYPE", content_type_of(claim)),
            EnvVar::new("DESTINATION", destination),
            EnvVar::new(
                "UPLOAD_IMAGE_SIZE",
                claim
                    .spec
                    .resources
                    .requests
                    .get("storage")
                    .cloned()
                    .unwrap_or_default(),
            ),
            EnvVar::new("FILESYSTEM_OVERHEAD", overhead.to_string()),
            EnvVar::new(
                "PREALLOCATION",
                claim
                    .metadata
                    .is_annotation_true(ANN_PREALLOCATION_REQUESTED)
                    .to_string(),
            ),
        ];
        spec.args = vec![format!("-v={}", self.settings.verbosity)];
        let (ports, probe) = upload_server_ports();
        spec.ports = ports;
        spec.readiness_probe = Some(probe);
        spec.claims.push(ClaimAttachment::data(claim, false));
        let scratch = content_type_of(claim) == CONTENT_TYPE_KUBEVIRT;
        if scratch {
            spec.claims
                .push(ClaimAttachment::scratch(&scratch_claim_name(claim.metadata.name())));
        }
        spec.priority_class_name = claim
            .metadata
            .annotation(ANN_PRIORITY_CLASS_NAME)
            .map(str::to_string);
        spec.resources = config
            .status
            .as_ref()
            .and_then(|status| status.default_pod_resource_requirements.clone());

        match self.pods.ensure(&spec, claim).await {
            Ok(pod) => {
                if scratch {
                    let class = config
                        .status
                        .as_ref()
                        .and_then(|status| status.scratch_space_storage_class.clone());
                    ensure_scratch_claim(&self.claims, claim, &pod, class).await?;
                }
                Ok(Some(pod))
            }
            Err(PodError::QuotaExceeded(reason)) => {
                let mut claim = claim.clone();
                let meta = &mut claim.metadata;
                let mut changed = meta.set_annotation(ANN_BOUND_CONDITION, "false");
                changed |= meta.set_annotation(ANN_BOUND_CONDITION_REASON, ERR_EXCEEDED_QUOTA);
                changed |= meta.set_annotation(ANN_BOUND_CONDITION_MESSAGE, reason);
                if changed {
                    self.claims.update(&claim).await?;
                }
                Ok(None)
            }
            Err(PodError::Client(err)) => Err(err.into()),
        }
    }

    async fn observe(&self, mut claim: PersistentVolumeClaim, pod: Pod) -> ReconcileResult {
        let was_complete = claim.metadata.annotation(ANN_POD_PHASE) == Some(POD_SUCCEEDED);
        let mut changed = record_pod_state(&mut claim, &pod);
        changed |= claim
            .metadata
            .set_annotation(ANN_UPLOAD_POD, pod.metadata.name());
        for key in [ANN_BOUND_CONDITION, ANN_BOUND_CONDITION_MESSAGE, ANN_BOUND_CONDITION_REASON] {
            changed |= claim.metadata.remove_annotation(key);
        }
        self.pods.report_startup_failure(&claim, &pod).await;
        if changed {
            claim = self.claims.update(&claim).await?;
        }
        if pod.phase() == POD_SUCCEEDED {
            if !was_complete {
                log_info(
                    NAME,
                    "Upload finished",
                    &[
                        ("namespace", claim.metadata.namespace()),
                        ("claim", claim.metadata.name()),
                    ],
                );
                self.recorder
                    .normal(&claim, UPLOAD_SUCCEEDED, "Upload Successful")
                    .await;
            }
            if !claim.metadata.is_annotation_true(ANN_POD_RETAIN_AFTER_COMPLETION) {
                self.pods
                    .delete(claim.metadata.namespace(), pod.metadata.name())
                    .await?;
            }
            remove_upload_service(&self.services, &claim).await?;
        }
        Ok(ReconcileOutcome::Done)
    }
}

impl Reconciler for UploadReconciler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn reconcile<'a>(&'a self, key: &'a ObjectKey) -> ReconcileFuture<'a> {
        Box::pin(self.sync(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdi::client::InMemoryCluster;
    use crate::cdi::k8s::pod::PodStatus;
    use crate::cdi::test_support::{claim_spec, context_for};

    async fn setup(content_type: &str) -> (Arc<InMemoryCluster>, UploadReconciler, PersistentVolumeClaim) {
        let cluster = InMemoryCluster::new();
        let mut metadata = ObjectMeta::named(Some("ns"), "up");
        metadata.set_annotation(ANN_UPLOAD_REQUEST, "");
        metadata.set_annotation(ANN_CONTENT_TYPE, content_type);
        let claim = Api::<PersistentVolumeClaim>::new(cluster.clone())
            .create(&PersistentVolumeClaim {
                metadata,
                spec: claim_spec("1Gi", None),
                status: None,
            })
            .await
            .unwrap();
        let reconciler = UploadReconciler::new(&context_for(&cluster)).unwrap();
        (cluster, reconciler, claim)
    }

    #[tokio::test]
    async fn creates_pod_service_and_scratch() {
        let (cluster, reconciler, claim) = setup(CONTENT_TYPE_KUBEVIRT).await;
        reconciler.reconcile(&ObjectKey::new("ns", "up")).await.unwrap();

        let pod = Api::<Pod>::new(cluster.clone())
            .get("ns", &format!("{}-upload", claim.metadata.uid()))
            .await
            .expect("upload pod");
        assert!(pod.uses_claim("up-scratch"));
        let service = Api::<Service>::new(cluster.clone())
            .get("ns", "cdi-upload-up")
            .await
            .expect("upload service");
        assert_eq!(
            service.spec.selector.get(LABEL_OWNER_UID).map(String::as_str),
            Some(claim.metadata.uid())
        );
        let claim = Api::<PersistentVolumeClaim>::new(cluster.clone())
            .get("ns", "up")
            .await
            .unwrap();
        assert_eq!(claim.metadata.annotation(ANN_UPLOAD_POD), Some(pod.metadata.name()));
    }

    #[tokio::test]
    async fn archive_uploads_skip_scratch() {
        let (cluster, reconciler, claim) = setup(CONTENT_TYPE_ARCHIVE).await;
        reconciler.reconcile(&ObjectKey::new("ns", "up")).await.unwrap();
        let pod = Api::<Pod>::new(cluster.clone())
            .get("ns", &format!("{}-upload", claim.metadata.uid()))
            .await
            .unwrap();
        assert!(!pod.uses_claim("up-scratch"));
    }

    #[tokio::test]
    async fn completion_removes_pod_and_service() {
        let (cluster, reconciler, claim) = setup(CONTENT_TYPE_ARCHIVE).await;
        let key = ObjectKey::new("ns", "up");
        reconciler.reconcile(&key).await.unwrap();
        let pods = Api::<Pod>::new(cluster.clone());
        let name = format!("{}-upload", claim.metadata.uid());
        let mut pod = pods.get("ns", &name).await.unwrap();
        pod.status = Some(PodStatus {
            phase: Some(POD_SUCCEEDED.to_string()),
            ..Default::default()
        });
        pods.update(&pod).await.unwrap();

        reconciler.reconcile(&key).await.unwrap();
        assert!(pods.get_opt("ns", &name).await.unwrap().is_none());
        assert!(Api::<Service>::new(cluster.clone())
            .get_opt("ns", "cdi-upload-up")
            .await
            .unwrap()
            .is_none());
        let claim = Api::<PersistentVolumeClaim>::new(cluster.clone())
            .get("ns", "up")
            .await
            .unwrap();
        assert_eq!(claim.metadata.annotation(ANN_POD_PHASE), Some(POD_SUCCEEDED));
    }
}
