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

//! Single-shot worker pods bound to a claim. Pods are named after the owning
//! claim's UID and role, so a restarted controller finds them again and the
//! API server's create conflict keeps one pod per claim and role.

use super::events::{EventRecorder, ERR_EXCEEDED_QUOTA, ERR_STARTING_POD};
use crate::cdi::api::annotations::{
    ANN_ISTIO_INJECT, ANN_LINKERD_INJECT, ANN_POD_PHASE, ANN_POD_READY, ANN_POD_RESTARTS,
    ANN_RUNNING_CONDITION, ANN_RUNNING_CONDITION_MESSAGE, ANN_RUNNING_CONDITION_REASON, LABEL_APP,
    LABEL_APP_VALUE, LABEL_COMPONENT, LABEL_OWNER_UID,
};
use crate::cdi::client::{Api, ClientError, ClusterClient};
use crate::cdi::k8s::meta::{ObjectMeta, OwnerReference};
use crate::cdi::k8s::pod::{
    Capabilities, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, ExecAction, Lifecycle,
    LifecycleHandler, PersistentVolumeClaimVolumeSource, Pod, PodSecurityContext, PodSpec, Probe,
    ResourceRequirements, SeccompProfile, SecretVolumeSource, SecurityContext, Volume, VolumeDevice,
    VolumeMount, POD_RUNNING,
};
use crate::cdi::k8s::resource::Resource;
use crate::cdi::k8s::volume::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, ACCESS_RWO, VOLUME_MODE_FILESYSTEM,
};
use crate::cdi::logger::{log_error, log_info};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

const COMPONENT: &str = "worker-pods";

/// User and group the worker images run as.
pub const WORKER_USER_ID: i64 = 107;

pub const DATA_VOLUME_NAME: &str = "cdi-data-vol";
pub const SCRATCH_VOLUME_NAME: &str = "cdi-scratch-vol";
pub const FILESYSTEM_MOUNT_PATH: &str = "/data";
pub const BLOCK_DEVICE_PATH: &str = "/dev/cdi-block-volume";
pub const SCRATCH_MOUNT_PATH: &str = "/scratch";
pub const TERMINATION_MESSAGE_PATH: &str = "/dev/termination-log";

/// Exit code an importer uses to ask for scratch space.
pub const SCRATCH_SPACE_NEEDED_EXIT_CODE: i32 = 42;

const ISTIO_QUIT_COMMAND: &str = "curl -X POST http://localhost:15020/quitquitquit";
const LINKERD_SHUTDOWN_COMMAND: &str = "curl -X POST http://localhost:4191/shutdown";

/// Container waiting reasons that mean the pod cannot start on its own.
const STARTUP_FAILURES: &[&str] = &[
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CrashLoopBackOff",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerRole {
    Importer,
    Upload,
    CloneSource,
    CloneTarget,
}

impl WorkerRole {
    pub fn suffix(self) -> &'static str {
        match self {
            WorkerRole::Importer => "importer",
            WorkerRole::Upload => "upload",
            WorkerRole::CloneSource => "source-pod",
            WorkerRole::CloneTarget => "clone-target",
        }
    }

    /// Value of the component label on the pod.
    pub fn component(self) -> &'static str {
        match self {
            WorkerRole::Importer => "importer",
            WorkerRole::Upload => "cdi-upload-server",
            WorkerRole::CloneSource => "cdi-clone-source",
            WorkerRole::CloneTarget => "cdi-clone-target",
        }
    }

    pub fn container_name(self) -> &'static str {
        match self {
            WorkerRole::Importer => "importer",
            WorkerRole::Upload => "cdi-upload-server",
            WorkerRole::CloneSource => "cdi-clone-source",
            WorkerRole::CloneTarget => "cdi-clone-target",
        }
    }
}

pub fn worker_pod_name(owner_uid: &str, role: WorkerRole) -> String {
    format!("{owner_uid}-{}", role.suffix())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mesh {
    Istio,
    Linkerd,
}

impl Mesh {
    pub fn detect(annotations: &HashMap<String, String>) -> Option<Mesh> {
        if annotations.get(ANN_ISTIO_INJECT).map(String::as_str) == Some("true") {
            Some(Mesh::Istio)
        } else if annotations.get(ANN_LINKERD_INJECT).map(String::as_str) == Some("enabled") {
            Some(Mesh::Linkerd)
        } else {
            None
        }
    }

    fn pre_stop(self) -> Lifecycle {
        let command = match self {
            Mesh::Istio => ISTIO_QUIT_COMMAND,
            Mesh::Linkerd => LINKERD_SHUTDOWN_COMMAND,
        };
        Lifecycle {
            pre_stop: Some(LifecycleHandler {
                exec: Some(ExecAction {
                    command: vec!["/bin/sh".to_string(), "-c".to_string(), command.to_string()],
                }),
            }),
        }
    }

    fn annotation(self) -> (&'static str, &'static str) {
        match self {
            Mesh::Istio => (ANN_ISTIO_INJECT, "true"),
            Mesh::Linkerd => (ANN_LINKERD_INJECT, "enabled"),
        }
    }
}

/// A claim attached to a worker pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimAttachment {
    pub volume_name: String,
    pub claim_name: String,
    pub block: bool,
    pub read_only: bool,
    pub mount_path: String,
}

impl ClaimAttachment {
    pub fn data(claim: &PersistentVolumeClaim, read_only: bool) -> Self {
        let block = claim.is_block();
        ClaimAttachment {
            volume_name: DATA_VOLUME_NAME.to_string(),
            claim_name: claim.metadata.name().to_string(),
            block,
            read_only,
            mount_path: if block {
                BLOCK_DEVICE_PATH.to_string()
            } else {
                FILESYSTEM_MOUNT_PATH.to_string()
            },
        }
    }

    pub fn scratch(claim_name: &str) -> Self {
        ClaimAttachment {
            volume_name: SCRATCH_VOLUME_NAME.to_string(),
            claim_name: claim_name.to_string(),
            block: false,
            read_only: false,
            mount_path: SCRATCH_MOUNT_PATH.to_string(),
        }
    }
}

/// Secret or ConfigMap content mounted read-only into a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigAttachment {
    Secret {
        volume_name: String,
        secret_name: String,
        mount_path: String,
    },
    ConfigMap {
        volume_name: String,
        config_map_name: String,
        mount_path: String,
    },
}

impl ConfigAttachment {
    fn volume(&self) -> (Volume, VolumeMount) {
        let (name, mount_path, volume) = match self {
            ConfigAttachment::Secret {
                volume_name,
                secret_name,
                mount_path,
            } => (
                volume_name,
                mount_path,
                Volume {
                    name: volume_name.clone(),
                    secret: Some(SecretVolumeSource {
                        secret_name: secret_name.clone(),
                    }),
                    ..Default::default()
                },
            ),
            ConfigAttachment::ConfigMap {
                volume_name,
                config_map_name,
                mount_path,
            } => (
                volume_name,
                mount_path,
                Volume {
                    name: volume_name.clone(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: config_map_name.clone(),
                    }),
                    ..Default::default()
                },
            ),
        };
        let mount = VolumeMount {
            name: name.clone(),
            mount_path: mount_path.clone(),
            read_only: Some(true),
        };
        (volume, mount)
    }
}

/// Desired shape of a worker pod.
#[derive(Debug, Clone)]
pub struct WorkerPodSpec {
    pub role: WorkerRole,
    pub namespace: String,
    pub owner_uid: String,
    pub owner: Option<OwnerReference>,
    pub image: String,
    pub pull_policy: String,
    pub env: Vec<EnvVar>,
    pub args: Vec<String>,
    pub claims: Vec<ClaimAttachment>,
    pub configs: Vec<ConfigAttachment>,
    pub node_name: Option<String>,
    pub priority_class_name: Option<String>,
    pub resources: Option<ResourceRequirements>,
    pub mesh: Option<Mesh>,
    pub ports: Vec<ContainerPort>,
    pub readiness_probe: Option<Probe>,
    pub annotations: HashMap<String, String>,
}

impl WorkerPodSpec {
    pub fn new(role: WorkerRole, claim: &PersistentVolumeClaim, image: &str, pull_policy: &str) -> Self {
        WorkerPodSpec {
            role,
            namespace: claim.metadata.namespace().to_string(),
            owner_uid: claim.metadata.uid().to_string(),
            owner: Some(claim.owner_reference(true)),
            image: image.to_string(),
            pull_policy: pull_policy.to_string(),
            env: Vec::new(),
            args: Vec::new(),
            claims: Vec::new(),
            configs: Vec::new(),
            node_name: None,
            priority_class_name: None,
            resources: None,
            mesh: Mesh::detect(&claim.metadata.annotations),
            ports: Vec::new(),
            readiness_probe: None,
            annotations: HashMap::new(),
        }
    }

    pub fn pod_name(&self) -> String {
        worker_pod_name(&self.owner_uid, self.role)
    }

    pub fn build(&self) -> Pod {
        let mut metadata = ObjectMeta::named(Some(&self.namespace), &self.pod_name());
        metadata
            .labels
            .insert(LABEL_APP.to_string(), LABEL_APP_VALUE.to_string());
        metadata
            .labels
            .insert(LABEL_COMPONENT.to_string(), self.role.component().to_string());
        metadata
            .labels
            .insert(LABEL_OWNER_UID.to_string(), self.owner_uid.clone());
        if let Some(owner) = &self.owner {
            metadata.owner_references.push(owner.clone());
        }
        for (key, value) in &self.annotations {
            metadata.set_annotation(key, value.clone());
        }
        if let Some(mesh) = self.mesh {
            let (key, value) = mesh.annotation();
            metadata.set_annotation(key, value);
        }

        let mut volumes = Vec::new();
        let mut volume_mounts = Vec::new();
        let mut volume_devices = Vec::new();
        for attachment in &self.claims {
            volumes.push(Volume {
                name: attachment.volume_name.clone(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: attachment.claim_name.clone(),
                    read_only: attachment.read_only.then_some(true),
                }),
                ..Default::default()
            });
            if attachment.block {
                volume_devices.push(VolumeDevice {
                    name: attachment.volume_name.clone(),
                    device_path: attachment.mount_path.clone(),
                });
            } else {
                volume_mounts.push(VolumeMount {
                    name: attachment.volume_name.clone(),
                    mount_path: attachment.mount_path.clone(),
                    read_only: attachment.read_only.then_some(true),
                });
            }
        }
        let has_mounts = !volume_mounts.is_empty();
        for config in &self.configs {
            let (volume, mount) = config.volume();
            volumes.push(volume);
            volume_mounts.push(mount);
        }

        let container = Container {
            name: self.role.container_name().to_string(),
            image: Some(self.image.clone()),
            image_pull_policy: Some(self.pull_policy.clone()),
            args: self.args.clone(),
            env: self.env.clone(),
            ports: self.ports.clone(),
            volume_mounts,
            volume_devices,
            resources: self.resources.clone(),
            security_context: Some(restricted_container_context()),
            lifecycle: self.mesh.map(Mesh::pre_stop),
            readiness_probe: self.readiness_probe.clone(),
            termination_message_path: Some(TERMINATION_MESSAGE_PATH.to_string()),
            ..Default::default()
        };

        Pod {
            metadata,
            spec: PodSpec {
                containers: vec![container],
                volumes,
                restart_policy: Some("OnFailure".to_string()),
                node_name: self.node_name.clone(),
                priority_class_name: self.priority_class_name.clone(),
                security_context: Some(PodSecurityContext {
                    fs_group: has_mounts.then_some(WORKER_USER_ID),
                    run_as_non_root: Some(true),
                    run_as_user: Some(WORKER_USER_ID),
                    seccomp_profile: Some(runtime_default_seccomp()),
                }),
                ..Default::default()
            },
            status: None,
        }
    }
}

fn runtime_default_seccomp() -> SeccompProfile {
    SeccompProfile {
        profile_type: "RuntimeDefault".to_string(),
    }
}

fn restricted_container_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        capabilities: Some(Capabilities {
            add: Vec::new(),
            drop: vec!["ALL".to_string()],
        }),
        run_as_non_root: Some(true),
        run_as_user: Some(WORKER_USER_ID),
        seccomp_profile: Some(runtime_default_seccomp()),
    }
}

#[derive(Debug)]
pub enum PodError {
    /// Namespace quota refused the pod; callers hold and wait for quota changes.
    QuotaExceeded(String),
    Client(ClientError),
}

impl fmt::Display for PodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PodError::QuotaExceeded(reason) => write!(f, "worker pod exceeds quota: {reason}"),
            PodError::Client(err) => write!(f, "worker pod request failed: {err}"),
        }
    }
}

impl std::error::Error for PodError {}

impl From<ClientError> for PodError {
    fn from(err: ClientError) -> Self {
        PodError::Client(err)
    }
}

pub struct WorkerPods {
    pods: Api<Pod>,
    recorder: EventRecorder,
}

impl WorkerPods {
    pub fn new(client: Arc<dyn ClusterClient>, recorder: EventRecorder) -> Self {
        WorkerPods {
            pods: Api::new(client),
            recorder,
        }
    }

    pub async fn get(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClientError> {
        self.pods.get_opt(namespace, name).await
    }

    /// Finds or creates the pod for `spec`. The `claim` receives the events.
    pub async fn ensure(
        &self,
        spec: &WorkerPodSpec,
        claim: &PersistentVolumeClaim,
    ) -> Result<Pod, PodError> {
        let name = spec.pod_name();
        if let Some(existing) = self.pods.get_opt(&spec.namespace, &name).await? {
            return Ok(self.align_env(existing, spec).await);
        }

        let pod = spec.build();
        match self.pods.create(&pod).await {
            Ok(created) => {
                log_info(
                    COMPONENT,
                    "Created worker pod",
                    &[
                        ("namespace", spec.namespace.as_str()),
                        ("pod", name.as_str()),
                        ("role", spec.role.suffix()),
                    ],
                );
                Ok(created)
            }
            Err(ClientError::AlreadyExists) => Ok(self.pods.get(&spec.namespace, &name).await?),
            Err(err) if err.is_quota_exceeded() => {
                let reason = err.to_string();
                self.recorder
                    .warning(claim, ERR_EXCEEDED_QUOTA, &reason)
                    .await;
                Err(PodError::QuotaExceeded(reason))
            }
            Err(err) => {
                let error = err.to_string();
                log_error(
                    COMPONENT,
                    "Failed to create worker pod",
                    &[
                        ("namespace", spec.namespace.as_str()),
                        ("pod", name.as_str()),
                        ("error", error.as_str()),
                    ],
                );
                self.recorder
                    .warning(claim, ERR_STARTING_POD, "Failed to create the worker pod")
                    .await;
                Err(PodError::Client(err))
            }
        }
    }

    /// Pods that have not started yet get their env brought in line.
    async fn align_env(&self, mut pod: Pod, spec: &WorkerPodSpec) -> Pod {
        if pod.phase() == POD_RUNNING || pod.is_terminal() {
            return pod;
        }
        let Some(container) = pod.spec.containers.first_mut() else {
            return pod;
        };
        if container.env == spec.env {
            return pod;
        }
        container.env = spec.env.clone();
        match self.pods.update(&pod).await {
            Ok(updated) => updated,
            Err(err) => {
                let error = err.to_string();
                log_info(
                    COMPONENT,
                    "Worker pod env left unchanged",
                    &[("pod", pod.metadata.name()), ("error", error.as_str())],
                );
                pod
            }
        }
    }

    pub async fn delete(&self, namespace: &str, name: &str) -> Result<bool, ClientError> {
        self.pods.delete_opt(namespace, name).await
    }

    pub async fn report_startup_failure(&self, claim: &PersistentVolumeClaim, pod: &Pod) {
        if let Some(reason) = startup_failure(pod) {
            self.recorder
                .warning(
                    claim,
                    ERR_STARTING_POD,
                    &format!("Worker pod failed to start: {reason}"),
                )
                .await;
        }
    }
}

pub fn scratch_claim_name(claim: &str) -> String {
    format!("{claim}-scratch")
}

/// Creates the scratch claim a worker pod stages data in. The pod owns it, so
/// the claim goes away with the pod.
pub async fn ensure_scratch_claim(
    claims: &Api<PersistentVolumeClaim>,
    claim: &PersistentVolumeClaim,
    pod: &Pod,
    storage_class: Option<String>,
) -> Result<(), ClientError> {
    let name = scratch_claim_name(claim.metadata.name());
    let mut metadata = ObjectMeta::named(Some(claim.metadata.namespace()), &name);
    metadata
        .labels
        .insert(LABEL_APP.to_string(), LABEL_APP_VALUE.to_string());
    metadata.owner_references.push(pod.owner_reference(true));
    let mut spec = PersistentVolumeClaimSpec {
        access_modes: vec![ACCESS_RWO.to_string()],
        storage_class_name: storage_class.or_else(|| claim.storage_class().map(str::to_string)),
        volume_mode: Some(VOLUME_MODE_FILESYSTEM.to_string()),
        ..Default::default()
    };
    if let Some(size) = claim.spec.resources.requests.get("storage") {
        spec.resources
            .requests
            .insert("storage".to_string(), size.clone());
    }
    let scratch = PersistentVolumeClaim {
        metadata,
        spec,
        status: None,
    };
    match claims.create(&scratch).await {
        Ok(_) | Err(ClientError::AlreadyExists) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Fresh pod pairs a failed host-assisted copy gets before the failure sticks.
pub const WORKER_RETRY_LIMIT: i32 = 3;

/// Restarts recorded on the claim so far.
pub fn worker_restarts(claim: &PersistentVolumeClaim) -> i32 {
    claim
        .metadata
        .annotation(ANN_POD_RESTARTS)
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

pub fn restart_count(pod: &Pod) -> i32 {
    pod.first_container_status()
        .map(|status| status.restart_count)
        .unwrap_or(0)
}

fn terminated(pod: &Pod) -> Option<&crate::cdi::k8s::pod::ContainerStateTerminated> {
    let status = pod.first_container_status()?;
    status
        .state
        .as_ref()
        .and_then(|state| state.terminated.as_ref())
        .or_else(|| {
            status
                .last_state
                .as_ref()
                .and_then(|state| state.terminated.as_ref())
        })
}

pub fn exit_code(pod: &Pod) -> Option<i32> {
    terminated(pod).map(|state| state.exit_code)
}

pub fn termination_message(pod: &Pod) -> Option<&str> {
    terminated(pod).and_then(|state| state.message.as_deref())
}

/// Kubelet reason when the container cannot start; never carries arguments.
pub fn startup_failure(pod: &Pod) -> Option<&str> {
    let status = pod.first_container_status()?;
    let reason = status
        .state
        .as_ref()?
        .waiting
        .as_ref()?
        .reason
        .as_deref()?;
    STARTUP_FAILURES.contains(&reason).then_some(reason)
}

/// Lifts the pod's state into claim annotations. Returns true when any changed.
pub fn record_pod_state(claim: &mut PersistentVolumeClaim, pod: &Pod) -> bool {
    let meta = &mut claim.metadata;
    let mut changed = meta.set_annotation(ANN_POD_PHASE, pod.phase());
    changed |= meta.set_annotation(ANN_POD_READY, pod.is_ready().to_string());

    let previous_restarts: i32 = meta
        .annotation(ANN_POD_RESTARTS)
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);
    let previous_reason = meta
        .annotation(ANN_RUNNING_CONDITION_REASON)
        .map(str::to_string);
    let (running, reason, message) = running_condition(pod);
    let mut restarts = previous_restarts.max(restart_count(pod));
    if let Some(failure) = startup_failure(pod) {
        if previous_reason.as_deref() != Some(failure) {
            restarts = previous_restarts + 1;
        }
    }
    changed |= meta.set_annotation(ANN_POD_RESTARTS, restarts.to_string());
    changed |= meta.set_annotation(ANN_RUNNING_CONDITION, running.to_string());
    changed |= meta.set_annotation(ANN_RUNNING_CONDITION_REASON, reason);
    changed |= meta.set_annotation(ANN_RUNNING_CONDITION_MESSAGE, message);
    changed
}

/// (running, reason, message) for the claim's running condition.
pub fn running_condition(pod: &Pod) -> (bool, String, String) {
    let Some(state) = pod.first_container_status().and_then(|status| status.state.as_ref()) else {
        return (false, "Pending".to_string(), String::new());
    };
    if state.running.is_some() {
        return (true, String::new(), String::new());
    }
    if let Some(terminated) = &state.terminated {
        return (
            false,
            terminated
                .reason
                .clone()
                .unwrap_or_else(|| "Completed".to_string()),
            terminated.message.clone().unwrap_or_default(),
        );
    }
    if let Some(waiting) = &state.waiting {
        return (
            false,
            waiting.reason.clone().unwrap_or_default(),
            waiting.message.clone().unwrap_or_default(),
        );
    }
    (false, String::new(), String::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdi::client::InMemoryCluster;
    use crate::cdi::k8s::objects::{ResourceQuota, ResourceQuotaSpec};
    use crate::cdi::k8s::pod::{ContainerState, ContainerStateWaiting, ContainerStatus, PodStatus};
    use crate::cdi::k8s::volume::{PersistentVolumeClaimSpec, VOLUME_MODE_BLOCK};

    fn claim(name: &str, uid: &str) -> PersistentVolumeClaim {
        let mut metadata = ObjectMeta::named(Some("ns"), name);
        metadata.uid = Some(uid.to_string());
        PersistentVolumeClaim {
            metadata,
            spec: PersistentVolumeClaimSpec::default(),
            status: None,
        }
    }

    fn importer_spec(claim: &PersistentVolumeClaim) -> WorkerPodSpec {
        let mut spec = WorkerPodSpec::new(WorkerRole::Importer, claim, "importer:latest", "IfNotPresent");
        spec.claims.push(ClaimAttachment::data(claim, false));
        spec.env.push(EnvVar::new("IMPORTER_SOURCE", "http"));
        spec
    }

    #[test]
    fn pods_carry_restricted_defaults() {
        let target = claim("dv", "uid-1");
        let pod = importer_spec(&target).build();
        assert_eq!(pod.metadata.name(), "uid-1-importer");
        let security = pod.spec.security_context.as_ref().unwrap();
        assert_eq!(security.fs_group, Some(WORKER_USER_ID));
        assert_eq!(security.run_as_non_root, Some(true));
        let container = &pod.spec.containers[0];
        let context = container.security_context.as_ref().unwrap();
        assert_eq!(context.capabilities.as_ref().unwrap().drop, vec!["ALL"]);
        assert_eq!(context.allow_privilege_escalation, Some(false));
        assert!(container.lifecycle.is_none());
        assert_eq!(pod.metadata.owner_references[0].uid, "uid-1");
    }

    #[test]
    fn block_claims_skip_fs_group_and_use_devices() {
        let mut target = claim("dv", "uid-1");
        target.spec.volume_mode = Some(VOLUME_MODE_BLOCK.to_string());
        let pod = importer_spec(&target).build();
        assert!(pod.spec.security_context.as_ref().unwrap().fs_group.is_none());
        assert_eq!(pod.spec.containers[0].volume_devices[0].device_path, BLOCK_DEVICE_PATH);
    }

    #[test]
    fn meshed_claims_get_pre_stop_hooks() {
        let mut target = claim("dv", "uid-1");
        target.metadata.set_annotation(ANN_LINKERD_INJECT, "enabled");
        let pod = importer_spec(&target).build();
        let hook = pod.spec.containers[0].lifecycle.as_ref().unwrap();
        let command = &hook.pre_stop.as_ref().unwrap().exec.as_ref().unwrap().command;
        assert!(command[2].contains("4191/shutdown"));

        let mut target = claim("dv", "uid-2");
        target.metadata.set_annotation(ANN_ISTIO_INJECT, "true");
        let pod = importer_spec(&target).build();
        let command = &pod.spec.containers[0].lifecycle.as_ref().unwrap().pre_stop.as_ref().unwrap().exec.as_ref().unwrap().command;
        assert!(command[2].contains("15020/quitquitquit"));
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let cluster = InMemoryCluster::new();
        let pods = WorkerPods::new(cluster.clone(), EventRecorder::new(cluster.clone(), "test"));
        let target = claim("dv", "uid-1");
        let spec = importer_spec(&target);
        let first = pods.ensure(&spec, &target).await.expect("pod");
        let second = pods.ensure(&spec, &target).await.expect("pod");
        assert_eq!(first.metadata.uid, second.metadata.uid);
        assert_eq!(
            Api::<Pod>::new(cluster.clone())
                .list(Some("ns"), None)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn quota_is_reported_distinctly() {
        let cluster = InMemoryCluster::new();
        let mut quota = ResourceQuota {
            metadata: ObjectMeta::named(Some("ns"), "pods"),
            spec: ResourceQuotaSpec::default(),
        };
        quota.spec.hard.insert("pods".to_string(), "0".to_string());
        Api::<ResourceQuota>::new(cluster.clone())
            .create(&quota)
            .await
            .unwrap();
        let pods = WorkerPods::new(cluster.clone(), EventRecorder::new(cluster.clone(), "test"));
        let target = claim("dv", "uid-1");
        let err = pods.ensure(&importer_spec(&target), &target).await.unwrap_err();
        assert!(matches!(err, PodError::QuotaExceeded(_)));
    }

    #[test]
    fn image_pull_failures_count_as_restarts() {
        let mut target = claim("dv", "uid-1");
        let mut pod = importer_spec(&target).build();
        pod.status = Some(PodStatus {
            container_statuses: vec![ContainerStatus {
                name: "importer".to_string(),
                state: Some(ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some("ImagePullBackOff".to_string()),
                        message: None,
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        });
        assert!(record_pod_state(&mut target, &pod));
        assert_eq!(target.metadata.annotation(ANN_POD_RESTARTS), Some("1"));
        assert!(!record_pod_state(&mut target, &pod));
        assert_eq!(target.metadata.annotation(ANN_POD_RESTARTS), Some("1"));
    }
}
