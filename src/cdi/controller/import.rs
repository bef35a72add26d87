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

//! Claim-level import loop: runs the importer pod for claims carrying import
//! annotations and lifts the pod's progress back into those annotations.

use super::cdiconfig::current_config;
use super::events::{EventRecorder, ERR_EXCEEDED_QUOTA, ERR_IMPORT_FAILED, IMPORT_SUCCEEDED, IMPORT_TARGET_IN_USE};
use super::informer::{Controller, ControllerOptions, WatchSpec};
use super::pods::{
    ensure_scratch_claim, exit_code, record_pod_state, scratch_claim_name, termination_message,
    worker_pod_name, ClaimAttachment, ConfigAttachment, PodError, WorkerPodSpec, WorkerPods, WorkerRole,
    SCRATCH_SPACE_NEEDED_EXIT_CODE,
};
use super::reconcile::{
    ReconcileContext, ReconcileError, ReconcileFuture, ReconcileOutcome, ReconcileResult,
    Reconciler,
};
use super::runtime::ObjectKey;
use crate::cdi::api::annotations::*;
use crate::cdi::api::cdiconfig::{CdiConfig, FEATURE_HONOR_WAIT_FOR_FIRST_CONSUMER};
use crate::cdi::api::datavolume::{CONTENT_TYPE_ARCHIVE, CONTENT_TYPE_KUBEVIRT, PULL_METHOD_NODE};
use crate::cdi::client::{Api, ClientError, ClusterClient};
use crate::cdi::config::Settings;
use crate::cdi::k8s::pod::{EnvVar, Pod, POD_PENDING, POD_SUCCEEDED};
use crate::cdi::k8s::resource::ResourceKind;
use crate::cdi::k8s::volume::{PersistentVolumeClaim, VOLUME_MODE_FILESYSTEM};
use crate::cdi::logger::{log_debug, log_info};
use crate::cdi::storage::ProfileRegistry;
use serde::Deserialize;
use std::sync::Arc;

const NAME: &str = "import-controller";

pub const SOURCE_HTTP: &str = "http";
pub const SOURCE_REGISTRY: &str = "registry";
pub const SOURCE_IMAGEIO: &str = "imageio";
pub const SOURCE_VDDK: &str = "vddk";
pub const SOURCE_NONE: &str = "none";

pub fn is_import_claim(claim: &PersistentVolumeClaim) -> bool {
    let meta = &claim.metadata;
    meta.annotation(ANN_ENDPOINT).is_some() || meta.annotation(ANN_SOURCE).is_some()
}

pub fn is_claim_complete(claim: &PersistentVolumeClaim) -> bool {
    claim.metadata.annotation(ANN_POD_PHASE) == Some(POD_SUCCEEDED)
}

fn source_of(claim: &PersistentVolumeClaim) -> &str {
    claim.metadata.annotation(ANN_SOURCE).unwrap_or(SOURCE_HTTP)
}

fn content_type_of(claim: &PersistentVolumeClaim) -> &str {
    match claim.metadata.annotation(ANN_CONTENT_TYPE) {
        Some(CONTENT_TYPE_ARCHIVE) => CONTENT_TYPE_ARCHIVE,
        _ => CONTENT_TYPE_KUBEVIRT,
    }
}

/// Archives and most registry pulls are staged in scratch space; a pod may
/// also ask for it at run time.
pub fn requires_scratch(claim: &PersistentVolumeClaim) -> bool {
    let meta = &claim.metadata;
    let by_source = content_type_of(claim) == CONTENT_TYPE_ARCHIVE
        || match source_of(claim) {
            SOURCE_IMAGEIO => meta.annotation(ANN_CURRENT_CHECKPOINT).is_some(),
            SOURCE_REGISTRY => meta.annotation(ANN_PULL_METHOD) != Some(PULL_METHOD_NODE),
            _ => false,
        };
    by_source || meta.is_annotation_true(ANN_REQUIRES_SCRATCH)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VddkInfo {
    #[serde(default)]
    host: String,
    #[serde(default)]
    version: String,
}

fn parse_vddk_info(message: &str) -> Option<VddkInfo> {
    let start = message.find('{')?;
    let end = message.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&message[start..=end]).ok()
}

fn registry_host(endpoint: &str) -> Option<String> {
    let url = reqwest::Url::parse(endpoint).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Environment handed to the importer.
pub fn importer_env(claim: &PersistentVolumeClaim, config: &CdiConfig) -> Vec<EnvVar> {
    let meta = &claim.metadata;
    let endpoint = meta.annotation(ANN_ENDPOINT).unwrap_or_default();
    let insecure = registry_host(endpoint)
        .map(|host| config.spec.insecure_registries.iter().any(|entry| *entry == host))
        .unwrap_or(false);
    let image_size = claim
        .spec
        .resources
        .requests
        .get("storage")
        .cloned()
        .unwrap_or_default();
    let overhead = if claim.volume_mode() == VOLUME_MODE_FILESYSTEM {
        config.filesystem_overhead(claim.storage_class())
    } else {
        0.0
    };

    let mut env = vec![
        EnvVar::new("IMPORTER_SOURCE", source_of(claim)),
        EnvVar::new("IMPORTER_ENDPOINT", endpoint),
        EnvVar::new("IMPORTER_CONTENT_TYPE", content_type_of(claim)),
        EnvVar::new("IMPORTER_IMAGE_SIZE", image_size),
        EnvVar::new(
            "OWNER_UID",
            meta.annotation(ANN_OWNER_UID).unwrap_or(meta.uid()),
        ),
        EnvVar::new("INSECURE_TLS", insecure.to_string()),
        EnvVar::new("FILESYSTEM_OVERHEAD", overhead.to_string()),
        EnvVar::new(
            "PREALLOCATION",
            meta.is_annotation_true(ANN_PREALLOCATION_REQUESTED).to_string(),
        ),
    ];
    let optional = [
        ("IMPORTER_PULL_METHOD", ANN_PULL_METHOD),
        ("IMPORTER_DISK_ID", ANN_DISK_ID),
        ("IMPORTER_UUID", ANN_UUID),
        ("IMPORTER_THUMBPRINT", ANN_THUMBPRINT),
        ("IMPORTER_BACKING_FILE", ANN_BACKING_FILE),
        ("IMPORTER_CURRENT_CHECKPOINT", ANN_CURRENT_CHECKPOINT),
        ("IMPORTER_PREVIOUS_CHECKPOINT", ANN_PREVIOUS_CHECKPOINT),
        ("IMPORTER_FINAL_CHECKPOINT", ANN_FINAL_CHECKPOINT),
    ];
    for (name, annotation) in optional {
        if let Some(value) = meta.annotation(annotation) {
            env.push(EnvVar::new(name, value));
        }
    }
    if let Some(headers) = meta.annotation(ANN_EXTRA_HEADERS) {
        for (index, header) in headers.lines().filter(|line| !line.is_empty()).enumerate() {
            env.push(EnvVar::new(&format!("IMPORTER_EXTRA_HEADER_{index}"), header));
        }
    }
    if let Some(proxy) = config.import_proxy() {
        for (name, value) in [
            ("HTTP_PROXY", &proxy.http_proxy),
            ("HTTPS_PROXY", &proxy.https_proxy),
            ("NO_PROXY", &proxy.no_proxy),
        ] {
            if let Some(value) = value {
                env.push(EnvVar::new(name, value.clone()));
            }
        }
    }
    env
}

pub const CERT_MOUNT_PATH: &str = "/certs";
pub const CREDENTIALS_MOUNT_PATH: &str = "/opt/import/credentials";
pub const SECRET_HEADERS_MOUNT_PATH: &str = "/extraheaders";

/// Credentials, CA bundle and header secrets named on the claim, with the
/// variables telling the importer where to find them.
pub fn importer_mounts(claim: &PersistentVolumeClaim) -> (Vec<ConfigAttachment>, Vec<EnvVar>) {
    let meta = &claim.metadata;
    let mut mounts = Vec::new();
    let mut env = Vec::new();
    if let Some(secret) = meta.annotation(ANN_SECRET).filter(|name| !name.is_empty()) {
        mounts.push(ConfigAttachment::Secret {
            volume_name: "cdi-secret-vol".to_string(),
            secret_name: secret.to_string(),
            mount_path: CREDENTIALS_MOUNT_PATH.to_string(),
        });
        env.push(EnvVar::new("IMPORTER_CREDENTIALS_DIR", CREDENTIALS_MOUNT_PATH));
    }
    if let Some(config_map) = meta.annotation(ANN_CERT_CONFIG_MAP).filter(|name| !name.is_empty()) {
        mounts.push(ConfigAttachment::ConfigMap {
            volume_name: "cdi-cert-vol".to_string(),
            config_map_name: config_map.to_string(),
            mount_path: CERT_MOUNT_PATH.to_string(),
        });
        env.push(EnvVar::new("IMPORTER_CERT_DIR", CERT_MOUNT_PATH));
    }
    let header_secrets: Vec<&str> = meta
        .annotation(ANN_SECRET_EXTRA_HEADERS)
        .map(|secrets| secrets.lines().filter(|line| !line.is_empty()).collect())
        .unwrap_or_default();
    for (index, secret) in header_secrets.iter().enumerate() {
        mounts.push(ConfigAttachment::Secret {
            volume_name: format!("cdi-extra-headers-vol-{index}"),
            secret_name: secret.to_string(),
            mount_path: format!("{SECRET_HEADERS_MOUNT_PATH}/secret{index}"),
        });
    }
    if !header_secrets.is_empty() {
        env.push(EnvVar::new("IMPORTER_SECRET_EXTRA_HEADERS_DIR", SECRET_HEADERS_MOUNT_PATH));
    }
    (mounts, env)
}

/// Worker pods start once the claim is bound, or right away on a
/// delayed-binding class where the worker acts as the first consumer.
pub async fn ready_for_worker(
    profiles: &ProfileRegistry,
    claim: &PersistentVolumeClaim,
    config: &CdiConfig,
) -> Result<bool, ClientError> {
    if claim.is_bound() {
        return Ok(true);
    }
    if config.feature_gate_enabled(FEATURE_HONOR_WAIT_FOR_FIRST_CONSUMER) {
        return Ok(false);
    }
    Ok(profiles
        .lookup(claim.storage_class())
        .await?
        .map(|profile| profile.wait_for_first_consumer)
        .unwrap_or(false))
}

pub struct ImportReconciler {
    claims: Api<PersistentVolumeClaim>,
    pod_api: Api<Pod>,
    pods: WorkerPods,
    client: Arc<dyn ClusterClient>,
    settings: Arc<Settings>,
    profiles: Arc<ProfileRegistry>,
    recorder: EventRecorder,
}

impl ImportReconciler {
    pub fn new(ctx: &ReconcileContext) -> Result<Self, ReconcileError> {
        let client = ctx.client()?;
        let recorder = EventRecorder::new(Arc::clone(&client), NAME);
        Ok(ImportReconciler {
            claims: Api::new(Arc::clone(&client)),
            pod_api: Api::new(Arc::clone(&client)),
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
            .watch(WatchSpec::namespace_of(
                ResourceKind::ResourceQuota,
                ResourceKind::PersistentVolumeClaim,
            )))
    }

    async fn sync(&self, key: &ObjectKey) -> ReconcileResult {
        let Some(mut claim) = self.claims.get_opt(&key.namespace, &key.name).await? else {
            return Ok(ReconcileOutcome::Done);
        };
        if !is_import_claim(&claim) {
            return Ok(ReconcileOutcome::Done);
        }
        let pod_name = worker_pod_name(claim.metadata.uid(), WorkerRole::Importer);
        let pod = self
            .pods
            .get(&key.namespace, &pod_name)
            .await?
            .filter(|pod| pod.metadata.is_controlled_by(claim.metadata.uid()));

        if claim.metadata.is_deleting() {
            if pod.is_some() {
                self.pods.delete(&key.namespace, &pod_name).await?;
            }
            return Ok(ReconcileOutcome::Done);
        }

        if is_claim_complete(&claim) {
            if let Some(pod) = pod {
                return self.observe(claim, pod).await;
            }
            return Ok(ReconcileOutcome::Done);
        }

        if claim.is_block()
            && source_of(&claim) == SOURCE_NONE
            && !claim.metadata.is_annotation_true(ANN_PREALLOCATION_REQUESTED)
        {
            log_debug(
                NAME,
                "Blank block claim needs no importer",
                &[("claim", key.to_string().as_str())],
            );
            claim.metadata.set_annotation(ANN_POD_PHASE, POD_SUCCEEDED);
            self.claims.update(&claim).await?;
            return Ok(ReconcileOutcome::Done);
        }

        match pod {
            Some(pod) => self.observe(claim, pod).await,
            None => self.start(claim).await,
        }
    }

    async fn start(&self, mut claim: PersistentVolumeClaim) -> ReconcileResult {
        let config = current_config(&self.client).await?;
        if !ready_for_worker(&self.profiles, &claim, &config).await? {
            return Ok(ReconcileOutcome::Done);
        }
        let namespace = claim.metadata.namespace().to_string();
        let name = claim.metadata.name().to_string();
        let own_pod = worker_pod_name(claim.metadata.uid(), WorkerRole::Importer);
        let users: Vec<Pod> = self
            .pod_api
            .list(Some(&namespace), None)
            .await?
            .into_iter()
            .filter(|pod| !pod.is_terminal() && pod.uses_claim(&name) && pod.metadata.name() != own_pod)
            .collect();
        if !users.is_empty() {
            for user in &users {
                self.recorder
                    .warning(
                        &claim,
                        IMPORT_TARGET_IN_USE,
                        &format!(
                            "pod {}/{} using PersistentVolumeClaim {}",
                            namespace,
                            user.metadata.name(),
                            name
                        ),
                    )
                    .await;
            }
            return Ok(ReconcileOutcome::RequeueAfter(std::time::Duration::from_secs(5)));
        }

        if claim.metadata.annotation(ANN_IMPORT_POD) != Some(own_pod.as_str()) {
            claim.metadata.set_annotation(ANN_IMPORT_POD, own_pod.clone());
            claim = self.claims.update(&claim).await?;
        }

        let mut spec = WorkerPodSpec::new(
            WorkerRole::Importer,
            &claim,
            &self.settings.importer_image,
            &self.settings.pull_policy,
        );
        spec.env = importer_env(&claim, &config);
        let (mounts, mount_env) = importer_mounts(&claim);
        spec.configs = mounts;
        spec.env.extend(mount_env);
        spec.args = vec!["-v=".to_string() + &self.settings.verbosity];
        spec.claims.push(ClaimAttachment::data(&claim, false));
        let scratch = requires_scratch(&claim);
        if scratch {
            spec.claims.push(ClaimAttachment::scratch(&scratch_claim_name(&name)));
        }
        spec.priority_class_name = claim
            .metadata
            .annotation(ANN_PRIORITY_CLASS_NAME)
            .map(str::to_string);
        spec.resources = config
            .status
            .as_ref()
            .and_then(|status| status.default_pod_resource_requirements.clone());

        match self.pods.ensure(&spec, &claim).await {
            Ok(pod) => {
                if scratch {
                    let class = config
                        .status
                        .as_ref()
                        .and_then(|status| status.scratch_space_storage_class.clone());
                    ensure_scratch_claim(&self.claims, &claim, &pod, class).await?;
                }
                self.observe(claim, pod).await
            }
            Err(PodError::QuotaExceeded(reason)) => {
                let meta = &mut claim.metadata;
                let mut changed = meta.set_annotation(ANN_BOUND_CONDITION, "false");
                changed |= meta.set_annotation(ANN_BOUND_CONDITION_REASON, ERR_EXCEEDED_QUOTA);
                changed |= meta.set_annotation(ANN_BOUND_CONDITION_MESSAGE, reason);
                if changed {
                    self.claims.update(&claim).await?;
                }
                Ok(ReconcileOutcome::Done)
            }
            Err(PodError::Client(err)) => Err(err.into()),
        }
    }

    async fn observe(&self, mut claim: PersistentVolumeClaim, pod: Pod) -> ReconcileResult {
        let previous_phase = claim.metadata.annotation(ANN_POD_PHASE).map(str::to_string);
        let mut changed = record_pod_state(&mut claim, &pod);
        let meta_uid = pod.metadata.uid().to_string();

        let last_exit = pod
            .first_container_status()
            .and_then(|status| status.last_state.as_ref())
            .and_then(|state| state.terminated.as_ref())
            .map(|terminated| terminated.exit_code)
            .filter(|code| *code > 0);
        let scratch_requested = last_exit == Some(SCRATCH_SPACE_NEEDED_EXIT_CODE)
            || (pod.phase() != POD_SUCCEEDED && exit_code(&pod) == Some(SCRATCH_SPACE_NEEDED_EXIT_CODE));
        if scratch_requested {
            log_info(
                NAME,
                "Importer requested scratch space; restarting with scratch",
                &[("pod", pod.metadata.name())],
            );
            changed |= claim.metadata.set_annotation(ANN_REQUIRES_SCRATCH, "true");
            match &previous_phase {
                Some(phase) => claim.metadata.set_annotation(ANN_POD_PHASE, phase.clone()),
                None => claim.metadata.remove_annotation(ANN_POD_PHASE),
            };
        } else if last_exit.is_some() {
            let message = termination_message(&pod).unwrap_or("Import failed").to_string();
            self.recorder.warning(&claim, ERR_IMPORT_FAILED, &message).await;
        }

        if pod.is_terminal() && source_of(&claim) == SOURCE_VDDK {
            if let Some(info) = termination_message(&pod).and_then(parse_vddk_info) {
                if !info.host.is_empty() {
                    changed |= claim.metadata.set_annotation(ANN_VDDK_HOST, info.host);
                }
                if !info.version.is_empty() {
                    changed |= claim.metadata.set_annotation(ANN_VDDK_VERSION, info.version);
                }
            }
        }

        let current_checkpoint = claim
            .metadata
            .annotation(ANN_CURRENT_CHECKPOINT)
            .map(str::to_string);
        if let Some(checkpoint) = &current_checkpoint {
            changed |= claim.metadata.set_annotation(ANN_CURRENT_POD_ID, meta_uid.clone());
            if pod.phase() == POD_SUCCEEDED {
                // Recorded before the pod is removed.
                changed |= claim
                    .metadata
                    .set_annotation(&checkpoint_copied_key(checkpoint), meta_uid.clone());
                if claim.metadata.is_annotation_true(ANN_FINAL_CHECKPOINT) {
                    changed |= claim.metadata.set_annotation(ANN_MULTI_STAGE_IMPORT_DONE, "true");
                }
            }
        }

        if pod.phase() != POD_PENDING || !requires_scratch(&claim) {
            for key in [ANN_BOUND_CONDITION, ANN_BOUND_CONDITION_MESSAGE, ANN_BOUND_CONDITION_REASON] {
                changed |= claim.metadata.remove_annotation(key);
            }
        }
        if claim.metadata.label(LABEL_APP) != Some(LABEL_APP_VALUE) {
            claim
                .metadata
                .labels
                .insert(LABEL_APP.to_string(), LABEL_APP_VALUE.to_string());
            changed = true;
        }

        if changed {
            claim = self.claims.update(&claim).await?;
        }

        let succeeded = pod.phase() == POD_SUCCEEDED;
        if succeeded && previous_phase.as_deref() != Some(POD_SUCCEEDED) {
            self.recorder
                .normal(&claim, IMPORT_SUCCEEDED, "Import Successful")
                .await;
        }
        let retain = claim.metadata.is_annotation_true(ANN_POD_RETAIN_AFTER_COMPLETION);
        if scratch_requested || (succeeded && !retain) {
            self.pods
                .delete(claim.metadata.namespace(), pod.metadata.name())
                .await?;
        }
        Ok(ReconcileOutcome::Done)
    }
}

impl Reconciler for ImportReconciler {
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
    use crate::cdi::k8s::pod::{ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus};
    use crate::cdi::k8s::meta::ObjectMeta;
    use crate::cdi::k8s::volume::{
        PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, ACCESS_RWO, CLAIM_BOUND,
        VOLUME_MODE_BLOCK,
    };
    use crate::cdi::test_support::context_for;

    fn import_claim(source: &str) -> PersistentVolumeClaim {
        let mut metadata = ObjectMeta::named(Some("ns"), "dv");
        metadata.set_annotation(ANN_SOURCE, source);
        metadata.set_annotation(ANN_ENDPOINT, "http://images/disk.img");
        let mut spec = PersistentVolumeClaimSpec {
            access_modes: vec![ACCESS_RWO.to_string()],
            ..Default::default()
        };
        spec.resources
            .requests
            .insert("storage".to_string(), "1Gi".to_string());
        PersistentVolumeClaim {
            metadata,
            spec,
            status: Some(PersistentVolumeClaimStatus {
                phase: Some(CLAIM_BOUND.to_string()),
                ..Default::default()
            }),
        }
    }

    async fn setup(claim: PersistentVolumeClaim) -> (Arc<InMemoryCluster>, ImportReconciler, PersistentVolumeClaim) {
        let cluster = InMemoryCluster::new();
        let created = Api::<PersistentVolumeClaim>::new(cluster.clone())
            .create(&claim)
            .await
            .unwrap();
        let reconciler = ImportReconciler::new(&context_for(&cluster)).unwrap();
        (cluster, reconciler, created)
    }

    fn key() -> ObjectKey {
        ObjectKey::new("ns", "dv")
    }

    #[test]
    fn env_carries_source_contract() {
        let mut claim = import_claim(SOURCE_REGISTRY);
        claim.metadata.uid = Some("uid-1".to_string());
        claim
            .metadata
            .set_annotation(ANN_ENDPOINT, "docker://registry:5000/disk");
        let mut config = CdiConfig::default();
        config.spec.insecure_registries.push("registry:5000".to_string());
        let env = importer_env(&claim, &config);
        let value = |name: &str| {
            env.iter()
                .find(|var| var.name == name)
                .and_then(|var| var.value.clone())
        };
        assert_eq!(value("IMPORTER_SOURCE").as_deref(), Some("registry"));
        assert_eq!(value("IMPORTER_IMAGE_SIZE").as_deref(), Some("1Gi"));
        assert_eq!(value("OWNER_UID").as_deref(), Some("uid-1"));
        assert_eq!(value("INSECURE_TLS").as_deref(), Some("true"));
        assert!(requires_scratch(&claim));
    }

    #[test]
    fn credentials_and_header_secrets_are_mounted() {
        let mut claim = import_claim(SOURCE_HTTP);
        claim.metadata.set_annotation(ANN_SECRET, "s3-creds");
        claim.metadata.set_annotation(ANN_CERT_CONFIG_MAP, "internal-ca");
        claim
            .metadata
            .set_annotation(ANN_SECRET_EXTRA_HEADERS, "token-a\ntoken-b");
        let (mounts, env) = importer_mounts(&claim);
        assert_eq!(mounts.len(), 4);
        assert!(mounts.contains(&ConfigAttachment::ConfigMap {
            volume_name: "cdi-cert-vol".to_string(),
            config_map_name: "internal-ca".to_string(),
            mount_path: CERT_MOUNT_PATH.to_string(),
        }));
        assert!(mounts.contains(&ConfigAttachment::Secret {
            volume_name: "cdi-extra-headers-vol-1".to_string(),
            secret_name: "token-b".to_string(),
            mount_path: "/extraheaders/secret1".to_string(),
        }));
        let names: Vec<&str> = env.iter().map(|var| var.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["IMPORTER_CREDENTIALS_DIR", "IMPORTER_CERT_DIR", "IMPORTER_SECRET_EXTRA_HEADERS_DIR"]
        );

        let (mounts, env) = importer_mounts(&import_claim(SOURCE_HTTP));
        assert!(mounts.is_empty() && env.is_empty());
    }

    #[test]
    fn vddk_termination_message_is_parsed() {
        let info = parse_vddk_info(r#"Import Complete; VDDK: {"Version":"7.0.3","Host":"esx1"}"#).unwrap();
        assert_eq!(info.host, "esx1");
        assert_eq!(info.version, "7.0.3");
    }

    #[tokio::test]
    async fn creates_importer_pod_for_bound_claim() {
        let (cluster, reconciler, claim) = setup(import_claim(SOURCE_HTTP)).await;
        reconciler.reconcile(&key()).await.unwrap();
        let pod_name = format!("{}-importer", claim.metadata.uid());
        let pod = Api::<Pod>::new(cluster.clone())
            .get("ns", &pod_name)
            .await
            .expect("importer pod");
        assert_eq!(
            pod.spec.containers[0].env_value("IMPORTER_ENDPOINT"),
            Some("http://images/disk.img")
        );
        let claim = Api::<PersistentVolumeClaim>::new(cluster.clone())
            .get("ns", "dv")
            .await
            .unwrap();
        assert_eq!(claim.metadata.annotation(ANN_POD_PHASE), Some(POD_PENDING));
    }

    #[tokio::test]
    async fn blank_block_claims_complete_without_pod() {
        let mut claim = import_claim(SOURCE_NONE);
        claim.spec.volume_mode = Some(VOLUME_MODE_BLOCK.to_string());
        let (cluster, reconciler, _) = setup(claim).await;
        reconciler.reconcile(&key()).await.unwrap();
        let claim = Api::<PersistentVolumeClaim>::new(cluster.clone())
            .get("ns", "dv")
            .await
            .unwrap();
        assert!(is_claim_complete(&claim));
        assert!(Api::<Pod>::new(cluster.clone())
            .list(Some("ns"), None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn scratch_exit_code_restarts_with_scratch() {
        let (cluster, reconciler, claim) = setup(import_claim(SOURCE_HTTP)).await;
        reconciler.reconcile(&key()).await.unwrap();
        let pods = Api::<Pod>::new(cluster.clone());
        let pod_name = format!("{}-importer", claim.metadata.uid());
        let mut pod = pods.get("ns", &pod_name).await.unwrap();
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            container_statuses: vec![ContainerStatus {
                name: "importer".to_string(),
                restart_count: 1,
                last_state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code: SCRATCH_SPACE_NEEDED_EXIT_CODE,
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        });
        pods.update_status(&pod).await.unwrap();

        reconciler.reconcile(&key()).await.unwrap();
        assert!(pods.get_opt("ns", &pod_name).await.unwrap().is_none());
        let claim = Api::<PersistentVolumeClaim>::new(cluster.clone())
            .get("ns", "dv")
            .await
            .unwrap();
        assert!(claim.metadata.is_annotation_true(ANN_REQUIRES_SCRATCH));

        reconciler.reconcile(&key()).await.unwrap();
        let pod = pods.get("ns", &pod_name).await.expect("restarted pod");
        assert!(pod.uses_claim("dv-scratch"));
        let scratch = Api::<PersistentVolumeClaim>::new(cluster.clone())
            .get("ns", "dv-scratch")
            .await
            .expect("scratch claim");
        assert!(scratch.metadata.is_controlled_by(pod.metadata.uid()));
    }
}
