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

//! Claim-level host-assisted clone: a source pod streams the source claim
//! into an upload server pod writing the target claim.

use super::cdiconfig::current_config;
use super::events::{
    EventRecorder, CLONE_FAILED, CLONE_SOURCE_IN_USE, ERR_CLAIM_NOT_VALID, ERR_EXCEEDED_QUOTA,
};
use super::import::ready_for_worker;
use super::informer::{Controller, ControllerOptions, WatchSpec};
use super::pods::{
    record_pod_state, worker_pod_name, worker_restarts, ClaimAttachment, PodError, WorkerPodSpec,
    WorkerPods, WorkerRole, BLOCK_DEVICE_PATH, FILESYSTEM_MOUNT_PATH, WORKER_RETRY_LIMIT,
};
use super::reconcile::{
    ReconcileContext, ReconcileError, ReconcileFuture, ReconcileOutcome, ReconcileResult,
    Reconciler,
};
use super::runtime::ObjectKey;
use super::upload::{
    ensure_upload_service, remove_upload_service, upload_server_ports, upload_service_name,
};
use crate::cdi::api::annotations::*;
use crate::cdi::client::{Api, ClusterClient};
use crate::cdi::config::Settings;
use crate::cdi::k8s::objects::Service;
use crate::cdi::k8s::pod::{EnvVar, Pod, POD_FAILED, POD_PENDING, POD_SUCCEEDED};
use crate::cdi::k8s::resource::ResourceKind;
use crate::cdi::k8s::volume::{PersistentVolumeClaim, VOLUME_MODE_FILESYSTEM};
use crate::cdi::logger::log_info;
use crate::cdi::storage::ProfileRegistry;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const NAME: &str = "host-clone-controller";

/// Set on source pods; names the target claim as `namespace/name`.
pub const ANN_CLONE_TARGET: &str = "cdi.kubevirt.io/storage.clone.target";

const SOURCE_RETRY: Duration = Duration::from_secs(5);

/// Splits a `namespace/name` clone request.
pub fn parse_clone_request(request: &str) -> Option<(&str, &str)> {
    let (namespace, name) = request.split_once('/')?;
    (!namespace.is_empty() && !name.is_empty()).then_some((namespace, name))
}

pub struct HostCloneReconciler {
    claims: Api<PersistentVolumeClaim>,
    pod_api: Api<Pod>,
    services: Api<Service>,
    pods: WorkerPods,
    client: Arc<dyn ClusterClient>,
    settings: Arc<Settings>,
    profiles: Arc<ProfileRegistry>,
    recorder: EventRecorder,
}

impl HostCloneReconciler {
    pub fn new(ctx: &ReconcileContext) -> Result<Self, ReconcileError> {
        let client = ctx.client()?;
        let recorder = EventRecorder::new(Arc::clone(&client), NAME);
        Ok(HostCloneReconciler {
            claims: Api::new(Arc::clone(&client)),
            pod_api: Api::new(Arc::clone(&client)),
            services: Api::new(Arc::clone(&client)),
            pods: WorkerPods::new(Arc::clone(&client), recorder.clone()),
            settings: ctx.require::<Settings>()?,
            profiles: ctx.require::<ProfileRegistry>()?,
            client,
            recorder,
        })
    }

    pub fn controller(ctx: &ReconcileContext, options: ControllerOptions) -> Result<Controller, ReconcileError> {
        Ok(Controller::new(Arc::new(Self::new(ctx)?), options)
            .watch(WatchSpec::primary(ResourceKind::PersistentVolumeClaim))
            .watch(WatchSpec::owned_by(ResourceKind::Pod, ResourceKind::PersistentVolumeClaim))
            .watch(WatchSpec::mapped(ResourceKind::Pod, |pod: &Value| {
                pod.pointer("/metadata/annotations")
                    .and_then(|annotations| annotations.get(ANN_CLONE_TARGET))
                    .and_then(Value::as_str)
                    .and_then(parse_clone_request)
                    .map(|(namespace, name)| ObjectKey::new(namespace, name))
                    .into_iter()
                    .collect()
            }))
            // Source pods run in the source namespace, so a quota change
            // anywhere may unblock a clone.
            .watch(WatchSpec::all_of(
                ResourceKind::ResourceQuota,
                ResourceKind::PersistentVolumeClaim,
            )))
    }

    async fn sync(&self, key: &ObjectKey) -> ReconcileResult {
        let Some(claim) = self.claims.get_opt(&key.namespace, &key.name).await? else {
            return Ok(ReconcileOutcome::Done);
        };
        let Some(request) = claim.metadata.annotation(ANN_CLONE_REQUEST).map(str::to_string) else {
            return Ok(ReconcileOutcome::Done);
        };
        let Some((source_namespace, source_name)) = parse_clone_request(&request) else {
            self.recorder
                .warning(
                    &claim,
                    ERR_CLAIM_NOT_VALID,
                    &format!("invalid clone request {request:?}"),
                )
                .await;
            return Ok(ReconcileOutcome::Done);
        };
        let uid = claim.metadata.uid().to_string();
        let target_pod_name = worker_pod_name(&uid, WorkerRole::CloneTarget);
        let source_pod_name = worker_pod_name(&uid, WorkerRole::CloneSource);
        let target_pod = self.pods.get(&key.namespace, &target_pod_name).await?;
        let source_pod = self.pods.get(source_namespace, &source_pod_name).await?;

        if claim.metadata.is_deleting() {
            self.cleanup(&claim, source_namespace, target_pod, source_pod)
                .await?;
            return Ok(ReconcileOutcome::Done);
        }
        if claim.metadata.annotation(ANN_POD_PHASE) == Some(POD_SUCCEEDED) {
            if !claim.metadata.is_annotation_true(ANN_POD_RETAIN_AFTER_COMPLETION) {
                self.cleanup(&claim, source_namespace, target_pod, source_pod)
                    .await?;
            }
            return Ok(ReconcileOutcome::Done);
        }
        if claim.metadata.annotation(ANN_POD_PHASE) == Some(POD_FAILED)
            && worker_restarts(&claim) >= WORKER_RETRY_LIMIT
        {
            // Failed pods stay around for their logs.
            return Ok(ReconcileOutcome::Done);
        }

        let config = current_config(&self.client).await?;
        if !ready_for_worker(&self.profiles, &claim, &config).await? {
            return Ok(ReconcileOutcome::Done);
        }
        let Some(source) = self.claims.get_opt(source_namespace, source_name).await? else {
            return Ok(ReconcileOutcome::RequeueAfter(SOURCE_RETRY));
        };
        if !source.is_bound() {
            return Ok(ReconcileOutcome::RequeueAfter(SOURCE_RETRY));
        }

        let target_pod = match target_pod {
            Some(pod) => pod,
            None => match self.start_target(&claim, &config).await? {
                Some(pod) => pod,
                None => return Ok(ReconcileOutcome::Done),
            },
        };
        ensure_upload_service(&self.services, &claim, WorkerRole::CloneTarget).await?;

        let source_pod = match source_pod {
            Some(pod) => Some(pod),
            None => {
                if self.source_in_use(&claim, &source, &source_pod_name).await? {
                    return Ok(ReconcileOutcome::RequeueAfter(SOURCE_RETRY));
                }
                self.start_source(&claim, &source).await?
            }
        };
        self.observe(claim, target_pod, source_pod).await
    }

    /// The source must not be written while it is copied.
    async fn source_in_use(
        &self,
        claim: &PersistentVolumeClaim,
        source: &PersistentVolumeClaim,
        own_pod: &str,
    ) -> Result<bool, ReconcileError> {
        let writers: Vec<String> = self
            .pod_api
            .list(Some(source.metadata.namespace()), None)
            .await?
            .into_iter()
            .filter(|pod| pod.metadata.name() != own_pod && !pod.is_terminal())
            .filter(|pod| {
                pod.claim_mounts()
                    .any(|(name, read_only)| name == source.metadata.name() && !read_only)
            })
            .map(|pod| pod.metadata.name().to_string())
            .collect();
        for writer in &writers {
            self.recorder
                .normal(
                    claim,
                    CLONE_SOURCE_IN_USE,
                    &format!(
                        "pod {}/{} using PersistentVolumeClaim {}",
                        source.metadata.namespace(),
                        writer,
                        source.metadata.name()
                    ),
                )
                .await;
        }
        Ok(!writers.is_empty())
    }

    async fn start_target(
        &self,
        claim: &PersistentVolumeClaim,
        config: &crate::cdi::api::cdiconfig::CdiConfig,
    ) -> Result<Option<Pod>, ReconcileError> {
        let mut spec = WorkerPodSpec::new(
            WorkerRole::CloneTarget,
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
            EnvVar::new("UPLOAD_CLONE", "true"),
            EnvVar::new("DESTINATION", destination),
            EnvVar::new("FILESYSTEM_OVERHEAD", overhead.to_string()),
            EnvVar::new(
                "PREALLOCATION",
                claim
                    .metadata
                    .is_annotation_true(ANN_PREALLOCATION_REQUESTED)
                    .to_string(),
            ),
        ];
        let (ports, probe) = upload_server_ports();
        spec.ports = ports;
        spec.readiness_probe = Some(probe);
        spec.claims.push(ClaimAttachment::data(claim, false));
        spec.priority_class_name = claim
            .metadata
            .annotation(ANN_PRIORITY_CLASS_NAME)
            .map(str::to_string);
        spec.resources = config
            .status
            .as_ref()
            .and_then(|status| status.default_pod_resource_requirements.clone());
        self.ensure_pod(&spec, claim).await
    }

    async fn start_source(
        &self,
        claim: &PersistentVolumeClaim,
        source: &PersistentVolumeClaim,
    ) -> Result<Option<Pod>, ReconcileError> {
        let mut spec = WorkerPodSpec::new(
            WorkerRole::CloneSource,
            claim,
            &self.settings.cloner_image,
            &self.settings.pull_policy,
        );
        // Owner references cannot cross namespaces; the annotation maps back.
        spec.namespace = source.metadata.namespace().to_string();
        spec.owner = None;
        spec.annotations.insert(
            ANN_CLONE_TARGET.to_string(),
            format!("{}/{}", claim.metadata.namespace(), claim.metadata.name()),
        );
        let upload_url = format!(
            "https://{}.{}.svc/v1beta1/upload-clone",
            upload_service_name(claim.metadata.name()),
            claim.metadata.namespace()
        );
        let mount_point = if source.is_block() {
            BLOCK_DEVICE_PATH
        } else {
            FILESYSTEM_MOUNT_PATH
        };
        spec.env = vec![
            EnvVar::new("OWNER_UID", claim.metadata.uid()),
            EnvVar::new("UPLOAD_URL", upload_url),
            EnvVar::new("VOLUME_MODE", source.volume_mode()),
            EnvVar::new("MOUNT_POINT", mount_point),
        ];
        spec.claims.push(ClaimAttachment::data(source, true));
        spec.priority_class_name = claim
            .metadata
            .annotation(ANN_PRIORITY_CLASS_NAME)
            .map(str::to_string);
        self.ensure_pod(&spec, claim).await
    }

    async fn ensure_pod(
        &self,
        spec: &WorkerPodSpec,
        claim: &PersistentVolumeClaim,
    ) -> Result<Option<Pod>, ReconcileError> {
        match self.pods.ensure(spec, claim).await {
            Ok(pod) => Ok(Some(pod)),
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

    async fn observe(
        &self,
        mut claim: PersistentVolumeClaim,
        target_pod: Pod,
        source_pod: Option<Pod>,
    ) -> ReconcileResult {
        let mut changed = record_pod_state(&mut claim, &target_pod);
        if let Some(source_pod) = &source_pod {
            changed |= claim
                .metadata
                .set_annotation(ANN_CLONE_SOURCE_POD, source_pod.metadata.name());
            self.pods.report_startup_failure(&claim, source_pod).await;
        }
        for key in [ANN_BOUND_CONDITION, ANN_BOUND_CONDITION_MESSAGE, ANN_BOUND_CONDITION_REASON] {
            changed |= claim.metadata.remove_annotation(key);
        }
        let failed = target_pod.phase() == POD_FAILED
            || source_pod.as_ref().map(Pod::phase) == Some(POD_FAILED);
        if failed {
            return self.retry_failed(claim, target_pod, source_pod).await;
        }
        let succeeded = target_pod.phase() == POD_SUCCEEDED;
        if succeeded {
            changed |= claim.metadata.set_annotation(ANN_CLONE_OF, "true");
        }
        if changed {
            claim = self.claims.update(&claim).await?;
        }
        if succeeded {
            log_info(
                NAME,
                "Host-assisted clone finished",
                &[
                    ("namespace", claim.metadata.namespace()),
                    ("claim", claim.metadata.name()),
                ],
            );
            if !claim.metadata.is_annotation_true(ANN_POD_RETAIN_AFTER_COMPLETION) {
                let source_namespace = claim
                    .metadata
                    .annotation(ANN_CLONE_REQUEST)
                    .and_then(parse_clone_request)
                    .map(|(namespace, _)| namespace.to_string())
                    .unwrap_or_default();
                self.cleanup(&claim, &source_namespace, Some(target_pod), source_pod)
                    .await?;
            }
        }
        Ok(ReconcileOutcome::Done)
    }

    /// Replaces a failed pod pair until the retry limit is spent, after which
    /// the claim records the failure for good.
    async fn retry_failed(
        &self,
        mut claim: PersistentVolumeClaim,
        target_pod: Pod,
        source_pod: Option<Pod>,
    ) -> ReconcileResult {
        let restarts = worker_restarts(&claim);
        let message = claim
            .metadata
            .annotation(ANN_RUNNING_CONDITION_MESSAGE)
            .filter(|message| !message.is_empty())
            .unwrap_or("clone pod failed")
            .to_string();
        let meta = &mut claim.metadata;
        if restarts >= WORKER_RETRY_LIMIT {
            meta.set_annotation(ANN_POD_PHASE, POD_FAILED);
            self.claims.update(&claim).await?;
            self.recorder
                .warning(
                    &claim,
                    CLONE_FAILED,
                    &format!("host-assisted clone failed after {restarts} retries: {message}"),
                )
                .await;
            return Ok(ReconcileOutcome::Done);
        }
        meta.set_annotation(ANN_POD_PHASE, POD_PENDING);
        meta.set_annotation(ANN_POD_READY, "false");
        meta.set_annotation(ANN_POD_RESTARTS, (restarts + 1).to_string());
        let claim = self.claims.update(&claim).await?;
        self.recorder
            .warning(
                &claim,
                CLONE_FAILED,
                &format!(
                    "host-assisted clone pod failed, retrying ({}/{WORKER_RETRY_LIMIT}): {message}",
                    restarts + 1
                ),
            )
            .await;
        log_info(
            NAME,
            "Restarting failed host-assisted clone",
            &[
                ("namespace", claim.metadata.namespace()),
                ("claim", claim.metadata.name()),
            ],
        );
        let source_namespace = claim
            .metadata
            .annotation(ANN_CLONE_REQUEST)
            .and_then(parse_clone_request)
            .map(|(namespace, _)| namespace.to_string())
            .unwrap_or_default();
        self.cleanup(&claim, &source_namespace, Some(target_pod), source_pod)
            .await?;
        Ok(ReconcileOutcome::RequeueAfter(SOURCE_RETRY))
    }

    async fn cleanup(
        &self,
        claim: &PersistentVolumeClaim,
        source_namespace: &str,
        target_pod: Option<Pod>,
        source_pod: Option<Pod>,
    ) -> Result<(), ReconcileError> {
        if let Some(pod) = source_pod {
            self.pods.delete(source_namespace, pod.metadata.name()).await?;
        }
        if let Some(pod) = target_pod {
            self.pods
                .delete(claim.metadata.namespace(), pod.metadata.name())
                .await?;
        }
        remove_upload_service(&self.services, claim).await?;
        Ok(())
    }
}

impl Reconciler for HostCloneReconciler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn reconcile<'a>(&'a self, key: &'a ObjectKey) -> ReconcileFuture<'a> {
        Box::pin(self.sync(key))
    }
}
