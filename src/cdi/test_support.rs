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

#![allow(dead_code)]

//! Shared fixtures for unit and scenario tests: a controller runtime wired to
//! an in-memory cluster, and a simulated node that provisions volumes, takes
//! snapshots and runs worker pods the way the real components would.

use crate::cdi::api::annotations::{
    ANN_SELECTED_NODE, LABEL_COMPONENT, LABEL_DATA_IMPORT_CRON_POLLER, LABEL_OWNER_UID,
};
use crate::cdi::client::{Api, ClientError, ClusterClient, InMemoryCluster};
use crate::cdi::config::Settings;
use crate::cdi::controller::informer::{Controller, ControllerOptions};
use crate::cdi::controller::manager;
use crate::cdi::controller::pods::WorkerRole;
use crate::cdi::controller::reconcile::{DependencyHandle, ReconcileContext};
use crate::cdi::controller::runtime::ControllerRuntime;
use crate::cdi::k8s::meta::{ObjectMeta, ObjectReference};
use crate::cdi::k8s::pod::{
    ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStatus, Pod,
    PodCondition, PodStatus, POD_PENDING, POD_RUNNING, POD_SUCCEEDED,
};
use crate::cdi::k8s::resource::ResourceKind;
use crate::cdi::k8s::storage::{
    CsiDriver, StorageClass, VolumeSnapshot, VolumeSnapshotClass, VolumeSnapshotStatus,
    ANN_DEFAULT_SNAPSHOT_CLASS, ANN_DEFAULT_STORAGE_CLASS, BINDING_WAIT_FOR_FIRST_CONSUMER,
};
use crate::cdi::k8s::volume::{
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimStatus, PersistentVolumeSpec, PersistentVolumeStatus, ACCESS_RWO,
    CLAIM_BOUND, RECLAIM_DELETE, VOLUME_AVAILABLE, VOLUME_BOUND, VOLUME_RELEASED,
};
use crate::cdi::storage::ProfileRegistry;
use crate::cdi::token::keys::KeyStore;
use crate::cdi::util::quantity::format_quantity;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

pub const TEST_NAMESPACE: &str = "cdi";
pub const DISK_IMAGE: &str = "disk.img";

/// Runtime with the dependencies every reconciler expects.
pub fn runtime_for(cluster: &Arc<InMemoryCluster>) -> Arc<ControllerRuntime> {
    let runtime = ControllerRuntime::new();
    let client: Arc<dyn ClusterClient> = cluster.clone();
    runtime.register_dependency(Arc::new(DependencyHandle::new(Arc::clone(&client))));
    runtime.register_dependency(Arc::new(Settings {
        namespace: TEST_NAMESPACE.to_string(),
        ..Settings::default()
    }));
    runtime.register_dependency(Arc::new(ProfileRegistry::new(Arc::clone(&client))));
    runtime.register_dependency(Arc::new(KeyStore::new(client, TEST_NAMESPACE)));
    runtime
}

pub fn context_for(cluster: &Arc<InMemoryCluster>) -> ReconcileContext {
    runtime_for(cluster).context()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub async fn add_storage_class(
    cluster: &Arc<InMemoryCluster>,
    name: &str,
    provisioner: &str,
    default: bool,
) -> StorageClass {
    let mut class = storage_class(name, provisioner);
    if default {
        class
            .metadata
            .set_annotation(ANN_DEFAULT_STORAGE_CLASS, "true");
    }
    create(cluster, &class).await
}

pub fn storage_class(name: &str, provisioner: &str) -> StorageClass {
    StorageClass {
        metadata: ObjectMeta::named(None, name),
        provisioner: provisioner.to_string(),
        ..Default::default()
    }
}

pub fn wait_for_first_consumer(mut class: StorageClass) -> StorageClass {
    class.volume_binding_mode = Some(BINDING_WAIT_FOR_FIRST_CONSUMER.to_string());
    class
}

/// Registers a CSI driver and a default snapshot class for `driver`.
pub async fn add_csi_driver(cluster: &Arc<InMemoryCluster>, driver: &str, snapshots: bool) {
    create(
        cluster,
        &CsiDriver {
            metadata: ObjectMeta::named(None, driver),
            ..Default::default()
        },
    )
    .await;
    if snapshots {
        let mut metadata = ObjectMeta::named(None, &format!("{driver}-snapclass"));
        metadata.set_annotation(ANN_DEFAULT_SNAPSHOT_CLASS, "true");
        create(
            cluster,
            &VolumeSnapshotClass {
                metadata,
                driver: driver.to_string(),
                deletion_policy: "Delete".to_string(),
            },
        )
        .await;
    }
}

pub async fn create<T>(cluster: &Arc<InMemoryCluster>, object: &T) -> T
where
    T: crate::cdi::k8s::resource::Resource,
{
    match Api::<T>::new(cluster.clone()).create(object).await {
        Ok(created) => created,
        Err(err) => panic!("failed to create {}: {err}", object.name()),
    }
}

pub fn claim_spec(size: &str, storage_class: Option<&str>) -> PersistentVolumeClaimSpec {
    let mut spec = PersistentVolumeClaimSpec {
        access_modes: vec![ACCESS_RWO.to_string()],
        storage_class_name: storage_class.map(str::to_string),
        ..Default::default()
    };
    spec.resources
        .requests
        .insert("storage".to_string(), size.to_string());
    spec
}

type VolumeFiles = BTreeMap<String, Vec<u8>>;

#[derive(Default)]
struct NodeState {
    /// Files per persistent volume name.
    volumes: HashMap<String, VolumeFiles>,
    /// Files captured per snapshot, keyed `<namespace>/<name>`.
    snapshots: HashMap<String, VolumeFiles>,
    http: HashMap<String, Vec<u8>>,
    /// Image repository to (digest, content).
    registry: HashMap<String, (String, Vec<u8>)>,
}

/// Stands in for the external provisioner, snapshotter and kubelet.
pub struct FakeNode {
    cluster: Arc<InMemoryCluster>,
    state: Mutex<NodeState>,
}

impl FakeNode {
    pub fn new(cluster: Arc<InMemoryCluster>) -> Self {
        FakeNode {
            cluster,
            state: Mutex::new(NodeState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn client(&self) -> Arc<dyn ClusterClient> {
        self.cluster.clone()
    }

    pub fn serve_http(&self, url: &str, content: &[u8]) {
        self.state().http.insert(url.to_string(), content.to_vec());
    }

    /// Publishes `content` under `repository` (a `docker://` URL without digest).
    pub fn publish_image(&self, repository: &str, content: &[u8]) -> String {
        let digest = format!("sha256:{}", sha256_hex(content));
        self.state()
            .registry
            .insert(repository.to_string(), (digest.clone(), content.to_vec()));
        digest
    }

    pub async fn read_file(&self, namespace: &str, claim: &str, file: &str) -> Option<Vec<u8>> {
        let volume = self.volume_of(namespace, claim).await?;
        self.state()
            .volumes
            .get(&volume)
            .and_then(|files| files.get(file))
            .cloned()
    }

    pub async fn image_checksum(&self, namespace: &str, claim: &str) -> Option<String> {
        self.read_file(namespace, claim, DISK_IMAGE)
            .await
            .map(|bytes| sha256_hex(&bytes))
    }

    /// Creates a claim that is already bound and holds `content` as its image.
    pub async fn create_populated_claim(
        &self,
        namespace: &str,
        name: &str,
        spec: PersistentVolumeClaimSpec,
        content: &[u8],
    ) -> PersistentVolumeClaim {
        let claim = create(
            &self.cluster,
            &PersistentVolumeClaim {
                metadata: ObjectMeta::named(Some(namespace), name),
                spec,
                status: None,
            },
        )
        .await;
        let mut files = VolumeFiles::new();
        files.insert(DISK_IMAGE.to_string(), content.to_vec());
        match self.bind(claim, files).await {
            Ok(bound) => bound,
            Err(err) => panic!("failed to bind {namespace}/{name}: {err}"),
        }
    }

    /// Finishes the upload served by the claim's upload pod.
    pub async fn complete_upload(&self, namespace: &str, claim: &str, content: &[u8]) -> bool {
        let Some(volume) = self.volume_of(namespace, claim).await else {
            return false;
        };
        let pods: Api<Pod> = Api::new(self.client());
        let Ok(listed) = pods.list(Some(namespace), None).await else {
            return false;
        };
        let Some(pod) = listed.into_iter().find(|pod| {
            component(pod) == Some(WorkerRole::Upload.component())
                && pod.uses_claim(claim)
                && pod.phase() == POD_RUNNING
        }) else {
            return false;
        };
        self.state()
            .volumes
            .entry(volume)
            .or_default()
            .insert(DISK_IMAGE.to_string(), content.to_vec());
        self.finish(pod, "Upload Complete").await.is_ok()
    }

    async fn volume_of(&self, namespace: &str, claim: &str) -> Option<String> {
        let claims: Api<PersistentVolumeClaim> = Api::new(self.client());
        claims
            .get_opt(namespace, claim)
            .await
            .ok()
            .flatten()
            .and_then(|claim| claim.spec.volume_name)
    }

    /// One pass of every simulated component.
    pub async fn step(&self) -> Result<(), ClientError> {
        self.take_snapshots().await?;
        self.release_volumes().await?;
        self.provision().await?;
        self.run_pods().await?;
        Ok(())
    }

    async fn provision(&self) -> Result<(), ClientError> {
        let client = self.client();
        let claims: Api<PersistentVolumeClaim> = Api::new(Arc::clone(&client));
        let classes: Api<StorageClass> = Api::new(Arc::clone(&client));
        let pods: Api<Pod> = Api::new(Arc::clone(&client));
        let volumes: Api<PersistentVolume> = Api::new(Arc::clone(&client));
        let all_pods = pods.list(None, None).await?;
        let all_classes = classes.list(None, None).await?;
        let all_volumes = volumes.list(None, None).await?;

        for mut claim in claims.list(None, None).await? {
            if claim.metadata.is_deleting() {
                continue;
            }
            if !claim.is_bound() {
                if claim.spec.volume_name.is_none() {
                    // Volumes pre-bound to this claim win over provisioning.
                    claim.spec.volume_name = all_volumes
                        .iter()
                        .find(|volume| {
                            volume.phase() == VOLUME_AVAILABLE
                                && volume.is_claimed_by(claim.metadata.namespace(), claim.metadata.name())
                        })
                        .map(|volume| volume.metadata.name().to_string());
                }
                if let Some(volume) = claim.spec.volume_name.clone() {
                    self.bind_existing(claim, &volume).await?;
                    continue;
                }
            }
            let class = match claim.storage_class() {
                Some(name) => all_classes.iter().find(|class| class.metadata.name() == name),
                None => all_classes.iter().find(|class| class.is_default()),
            };
            let Some(class) = class else {
                continue;
            };
            if claim.is_bound() {
                self.expand(&claims, claim, class).await?;
                continue;
            }
            if is_populator_claim(&claim) {
                continue;
            }
            if class.waits_for_first_consumer() {
                let consumed = claim.metadata.annotation(ANN_SELECTED_NODE).is_some()
                    || all_pods.iter().any(|pod| {
                        pod.metadata.namespace() == claim.metadata.namespace()
                            && !pod.is_terminal()
                            && pod.uses_claim(claim.metadata.name())
                    });
                if !consumed {
                    continue;
                }
            }
            let Some(files) = self.initial_content(&claim).await? else {
                continue;
            };
            let mut claim = claim;
            if claim.spec.storage_class_name.is_none() {
                claim.spec.storage_class_name = Some(class.metadata.name().to_string());
            }
            match self.bind(claim, files).await {
                Ok(_) | Err(ClientError::Conflict) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn initial_content(&self, claim: &PersistentVolumeClaim) -> Result<Option<VolumeFiles>, ClientError> {
        let Some(source) = &claim.spec.data_source else {
            return Ok(Some(VolumeFiles::new()));
        };
        let namespace = claim.metadata.namespace();
        match source.kind.as_str() {
            "VolumeSnapshot" => {
                let key = format!("{namespace}/{}", source.name);
                Ok(self.state().snapshots.get(&key).cloned())
            }
            "PersistentVolumeClaim" => {
                let claims: Api<PersistentVolumeClaim> = Api::new(self.client());
                let Some(volume) = claims
                    .get_opt(namespace, &source.name)
                    .await?
                    .and_then(|source| source.spec.volume_name)
                else {
                    return Ok(None);
                };
                Ok(Some(
                    self.state().volumes.get(&volume).cloned().unwrap_or_default(),
                ))
            }
            _ => Ok(Some(VolumeFiles::new())),
        }
    }

    async fn bind(
        &self,
        mut claim: PersistentVolumeClaim,
        files: VolumeFiles,
    ) -> Result<PersistentVolumeClaim, ClientError> {
        let client = self.client();
        let volume_name = format!("pvc-{}", claim.metadata.uid());
        let size = claim
            .requested_storage()
            .map(format_quantity)
            .unwrap_or_else(|| "1Gi".to_string());
        let mut capacity = HashMap::new();
        capacity.insert("storage".to_string(), size);

        let volumes: Api<PersistentVolume> = Api::new(Arc::clone(&client));
        let volume = PersistentVolume {
            metadata: ObjectMeta::named(None, &volume_name),
            spec: PersistentVolumeSpec {
                capacity: capacity.clone(),
                access_modes: claim.spec.access_modes.clone(),
                volume_mode: claim.spec.volume_mode.clone(),
                storage_class_name: claim.spec.storage_class_name.clone(),
                claim_ref: Some(ObjectReference {
                    kind: Some("PersistentVolumeClaim".to_string()),
                    namespace: Some(claim.metadata.namespace().to_string()),
                    name: Some(claim.metadata.name().to_string()),
                    uid: Some(claim.metadata.uid().to_string()),
                    ..Default::default()
                }),
                persistent_volume_reclaim_policy: Some("Delete".to_string()),
                csi: None,
            },
            status: Some(PersistentVolumeStatus {
                phase: Some(VOLUME_BOUND.to_string()),
            }),
        };
        match volumes.create(&volume).await {
            Ok(_) | Err(ClientError::AlreadyExists) => {}
            Err(err) => return Err(err),
        }

        claim.spec.volume_name = Some(volume_name.clone());
        claim.status = Some(PersistentVolumeClaimStatus {
            phase: Some(CLAIM_BOUND.to_string()),
            access_modes: claim.spec.access_modes.clone(),
            capacity,
        });
        let claims: Api<PersistentVolumeClaim> = Api::new(client);
        let bound = claims.update(&claim).await?;
        self.state().volumes.insert(volume_name, files);
        Ok(bound)
    }

    /// Binds a claim that names its volume up front, provided the volume's
    /// claim reference points back at it.
    async fn bind_existing(&self, mut claim: PersistentVolumeClaim, volume_name: &str) -> Result<(), ClientError> {
        let client = self.client();
        let volumes: Api<PersistentVolume> = Api::new(Arc::clone(&client));
        let Some(mut volume) = volumes.get_opt("", volume_name).await? else {
            return Ok(());
        };
        let namespace = claim.metadata.namespace().to_string();
        let name = claim.metadata.name().to_string();
        if !volume.is_claimed_by(&namespace, &name) {
            return Ok(());
        }
        let uid = claim.metadata.uid().to_string();
        if let Some(reference) = volume.spec.claim_ref.as_mut() {
            if reference.uid.as_deref().is_some_and(|bound| bound != uid) {
                return Ok(());
            }
            reference.uid = Some(uid);
        }
        volume.status = Some(PersistentVolumeStatus {
            phase: Some(VOLUME_BOUND.to_string()),
        });
        volumes.update(&volume).await?;

        claim.status = Some(PersistentVolumeClaimStatus {
            phase: Some(CLAIM_BOUND.to_string()),
            access_modes: volume.spec.access_modes.clone(),
            capacity: volume.spec.capacity.clone(),
        });
        let claims: Api<PersistentVolumeClaim> = Api::new(client);
        match claims.update(&claim).await {
            Ok(_) | Err(ClientError::Conflict) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Volumes whose bound claim is gone are deleted or released according
    /// to their reclaim policy.
    async fn release_volumes(&self) -> Result<(), ClientError> {
        let client = self.client();
        let volumes: Api<PersistentVolume> = Api::new(Arc::clone(&client));
        let claims: Api<PersistentVolumeClaim> = Api::new(client);
        for mut volume in volumes.list(None, None).await? {
            if volume.phase() != VOLUME_BOUND {
                continue;
            }
            let Some(reference) = volume.spec.claim_ref.clone() else {
                continue;
            };
            let (Some(namespace), Some(name), Some(uid)) =
                (reference.namespace, reference.name, reference.uid)
            else {
                continue;
            };
            let present = claims
                .get_opt(&namespace, &name)
                .await?
                .is_some_and(|claim| claim.metadata.uid() == uid);
            if present {
                continue;
            }
            let name = volume.metadata.name().to_string();
            if volume.spec.persistent_volume_reclaim_policy.as_deref() == Some(RECLAIM_DELETE) {
                volumes.delete_opt("", &name).await?;
                self.state().volumes.remove(&name);
                continue;
            }
            volume.status = Some(PersistentVolumeStatus {
                phase: Some(VOLUME_RELEASED.to_string()),
            });
            match volumes.update(&volume).await {
                Ok(_) | Err(ClientError::Conflict) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn expand(
        &self,
        claims: &Api<PersistentVolumeClaim>,
        mut claim: PersistentVolumeClaim,
        class: &StorageClass,
    ) -> Result<(), ClientError> {
        let (Some(requested), Some(current)) = (claim.requested_storage(), claim.capacity()) else {
            return Ok(());
        };
        if requested <= current || !class.allows_expansion() {
            return Ok(());
        }
        if let Some(status) = claim.status.as_mut() {
            status
                .capacity
                .insert("storage".to_string(), format_quantity(requested));
        }
        match claims.update(&claim).await {
            Ok(_) | Err(ClientError::Conflict) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn take_snapshots(&self) -> Result<(), ClientError> {
        let client = self.client();
        let snapshots: Api<VolumeSnapshot> = Api::new(Arc::clone(&client));
        let claims: Api<PersistentVolumeClaim> = Api::new(client);
        for mut snapshot in snapshots.list(None, None).await? {
            if snapshot.is_ready() || snapshot.metadata.is_deleting() {
                continue;
            }
            let Some(source) = snapshot.spec.source.persistent_volume_claim_name.clone() else {
                continue;
            };
            let namespace = snapshot.metadata.namespace().to_string();
            let Some(claim) = claims.get_opt(&namespace, &source).await? else {
                continue;
            };
            let Some(volume) = claim.spec.volume_name.clone() else {
                continue;
            };
            let files = self.state().volumes.get(&volume).cloned().unwrap_or_default();
            self.state()
                .snapshots
                .insert(format!("{namespace}/{}", snapshot.metadata.name()), files);
            snapshot.status = Some(VolumeSnapshotStatus {
                ready_to_use: Some(true),
                restore_size: claim.capacity().map(format_quantity),
                bound_volume_snapshot_content_name: Some(format!(
                    "snapcontent-{}",
                    snapshot.metadata.uid()
                )),
                error: None,
            });
            match snapshots.update(&snapshot).await {
                Ok(_) | Err(ClientError::Conflict) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn run_pods(&self) -> Result<(), ClientError> {
        let client = self.client();
        let pods: Api<Pod> = Api::new(Arc::clone(&client));
        let claims: Api<PersistentVolumeClaim> = Api::new(client);
        for pod in pods.list(None, None).await? {
            if pod.is_terminal() || pod.metadata.is_deleting() {
                continue;
            }
            let namespace = pod.metadata.namespace().to_string();
            let mut ready = true;
            for (claim_name, _) in pod.claim_mounts() {
                match claims.get_opt(&namespace, claim_name).await? {
                    Some(claim) if claim.is_bound() => {}
                    Some(mut claim) => {
                        // Scheduling the pod selects a node for delayed-binding claims.
                        if claim.metadata.set_annotation(ANN_SELECTED_NODE, "node01") {
                            match claims.update(&claim).await {
                                Ok(_) | Err(ClientError::Conflict) => {}
                                Err(err) => return Err(err),
                            }
                        }
                        ready = false;
                    }
                    None => ready = false,
                }
            }
            if !ready {
                continue;
            }
            let result = if pod.metadata.label(LABEL_DATA_IMPORT_CRON_POLLER).is_some() {
                self.run_poller(pod).await
            } else {
                match component(&pod) {
                    Some(role) if role == WorkerRole::Importer.component() => self.run_importer(pod).await,
                    Some(role) if role == WorkerRole::CloneSource.component() => {
                        self.run_clone_source(pod).await
                    }
                    Some(_) if pod.phase() == POD_PENDING => self.start(pod).await,
                    _ => Ok(()),
                }
            };
            match result {
                Ok(()) | Err(ClientError::Conflict) | Err(ClientError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn run_importer(&self, pod: Pod) -> Result<(), ClientError> {
        let Some(container) = pod.spec.containers.first() else {
            return Ok(());
        };
        let source = container.env_value("IMPORTER_SOURCE").unwrap_or("http");
        let endpoint = container.env_value("IMPORTER_ENDPOINT").unwrap_or_default();
        let content = {
            let state = self.state();
            match source {
                "registry" => state
                    .registry
                    .get(strip_digest(endpoint))
                    .map(|(_, content)| content.clone()),
                "none" => Some(Vec::new()),
                _ => state.http.get(endpoint).cloned(),
            }
        };
        let Some(content) = content else {
            return self.fail(pod, "Unable to connect to http data source").await;
        };
        let Some(claim) = pod.claim_mounts().next().map(|(name, _)| name.to_string()) else {
            return Ok(());
        };
        if let Some(volume) = self.volume_of(pod.metadata.namespace(), &claim).await {
            self.state()
                .volumes
                .entry(volume)
                .or_default()
                .insert(DISK_IMAGE.to_string(), content);
        }
        self.finish(pod, "Import Complete").await
    }

    async fn run_poller(&self, pod: Pod) -> Result<(), ClientError> {
        let endpoint = pod
            .spec
            .containers
            .first()
            .and_then(|container| container.env_value("IMPORTER_ENDPOINT"))
            .unwrap_or_default()
            .to_string();
        let digest = self
            .state()
            .registry
            .get(strip_digest(&endpoint))
            .map(|(digest, _)| digest.clone());
        match digest {
            Some(digest) => self.finish(pod, &digest).await,
            None => self.fail(pod, "manifest unknown").await,
        }
    }

    /// Copies the source volume into the target claim of the paired clone
    /// target pod, then completes both pods.
    async fn run_clone_source(&self, pod: Pod) -> Result<(), ClientError> {
        let client = self.client();
        let pods: Api<Pod> = Api::new(client);
        let Some(owner) = pod.metadata.label(LABEL_OWNER_UID).map(str::to_string) else {
            return Ok(());
        };
        let Some(target_pod) = pods.list(None, None).await?.into_iter().find(|candidate| {
            component(candidate) == Some(WorkerRole::CloneTarget.component())
                && candidate.metadata.label(LABEL_OWNER_UID) == Some(owner.as_str())
        }) else {
            return Ok(());
        };
        if target_pod.phase() != POD_RUNNING {
            return Ok(());
        }
        let Some(source_claim) = pod.claim_mounts().next().map(|(name, _)| name.to_string()) else {
            return Ok(());
        };
        let Some(target_claim) = target_pod.claim_mounts().next().map(|(name, _)| name.to_string()) else {
            return Ok(());
        };
        let source = self.volume_of(pod.metadata.namespace(), &source_claim).await;
        let target = self
            .volume_of(target_pod.metadata.namespace(), &target_claim)
            .await;
        if let (Some(source), Some(target)) = (source, target) {
            let mut state = self.state();
            let files = state.volumes.get(&source).cloned().unwrap_or_default();
            state.volumes.insert(target, files);
        }
        self.finish(pod, "Clone Complete").await?;
        self.finish(target_pod, "Clone Complete").await
    }

    async fn start(&self, mut pod: Pod) -> Result<(), ClientError> {
        let name = pod
            .spec
            .containers
            .first()
            .map(|container| container.name.clone())
            .unwrap_or_default();
        pod.status = Some(PodStatus {
            phase: Some(POD_RUNNING.to_string()),
            conditions: vec![PodCondition {
                condition_type: "Ready".to_string(),
                status: "True".to_string(),
                reason: None,
                message: None,
            }],
            container_statuses: vec![ContainerStatus {
                name,
                ready: true,
                restart_count: 0,
                state: Some(ContainerState {
                    running: Some(ContainerStateRunning { started_at: None }),
                    ..Default::default()
                }),
                last_state: None,
            }],
            ..Default::default()
        });
        Api::<Pod>::new(self.client()).update(&pod).await.map(|_| ())
    }

    async fn finish(&self, pod: Pod, message: &str) -> Result<(), ClientError> {
        self.terminate(pod, POD_SUCCEEDED, 0, "Completed", message).await
    }

    async fn fail(&self, pod: Pod, message: &str) -> Result<(), ClientError> {
        self.terminate(pod, "Failed", 1, "Error", message).await
    }

    async fn terminate(
        &self,
        mut pod: Pod,
        phase: &str,
        exit_code: i32,
        reason: &str,
        message: &str,
    ) -> Result<(), ClientError> {
        let name = pod
            .spec
            .containers
            .first()
            .map(|container| container.name.clone())
            .unwrap_or_default();
        pod.status = Some(PodStatus {
            phase: Some(phase.to_string()),
            container_statuses: vec![ContainerStatus {
                name,
                ready: false,
                restart_count: 0,
                state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code,
                        reason: Some(reason.to_string()),
                        message: Some(message.to_string()),
                    }),
                    ..Default::default()
                }),
                last_state: None,
            }],
            ..Default::default()
        });
        Api::<Pod>::new(self.client()).update(&pod).await.map(|_| ())
    }
}

fn component(pod: &Pod) -> Option<&str> {
    pod.metadata.label(LABEL_COMPONENT)
}

fn strip_digest(endpoint: &str) -> &str {
    endpoint.split('@').next().unwrap_or(endpoint)
}

/// Claims whose data source is a populator are bound through their prime claim.
fn is_populator_claim(claim: &PersistentVolumeClaim) -> bool {
    claim
        .spec
        .data_source_ref
        .as_ref()
        .map(|source| matches!(source.kind.as_str(), "VolumeImportSource" | "VolumeCloneSource"))
        .unwrap_or(false)
}

/// Every controller of the manager plus the fake node, driven in lockstep.
pub struct Harness {
    pub cluster: Arc<InMemoryCluster>,
    pub runtime: Arc<ControllerRuntime>,
    pub node: FakeNode,
    controllers: Vec<Controller>,
}

impl Harness {
    pub fn new() -> Self {
        let cluster = InMemoryCluster::new();
        let runtime = runtime_for(&cluster);
        let controllers = match manager::controllers(&runtime.context(), ControllerOptions::default()) {
            Ok(controllers) => controllers,
            Err(err) => panic!("controllers: {err}"),
        };
        Harness {
            node: FakeNode::new(cluster.clone()),
            cluster,
            runtime,
            controllers,
        }
    }

    pub fn client(&self) -> Arc<dyn ClusterClient> {
        self.cluster.clone()
    }

    pub fn api<T: crate::cdi::k8s::resource::Resource>(&self) -> Api<T> {
        Api::new(self.client())
    }

    /// Runs every controller and the fake node until the cluster stops
    /// changing. Returns false when it never settles.
    pub async fn settle(&self) -> bool {
        let mut previous = String::new();
        for _ in 0..60 {
            self.round().await;
            let current = self.fingerprint();
            if current == previous {
                return true;
            }
            previous = current;
        }
        false
    }

    /// One lockstep pass: every controller, then the fake node.
    pub async fn round(&self) {
        let client = self.client();
        for controller in &self.controllers {
            controller.reconcile_listed(&client).await;
        }
        if let Err(err) = self.node.step().await {
            panic!("fake node: {err}");
        }
    }

    /// Stable rendering of cluster state, ignoring events and versions.
    fn fingerprint(&self) -> String {
        let mut rendered = Vec::new();
        for kind in ResourceKind::ALL {
            if kind == ResourceKind::Event {
                continue;
            }
            let mut objects: Vec<Value> = self.cluster.objects(kind);
            for object in &mut objects {
                if let Some(meta) = object.get_mut("metadata").and_then(Value::as_object_mut) {
                    meta.remove("resourceVersion");
                    meta.remove("generation");
                }
            }
            let mut lines: Vec<String> = objects.iter().map(Value::to_string).collect();
            lines.sort();
            rendered.push(lines.join("\n"));
        }
        rendered.join("\n")
    }

    /// Reasons of the events recorded against an object.
    pub fn event_reasons(&self, namespace: &str, name: &str) -> Vec<String> {
        self.cluster
            .objects(ResourceKind::Event)
            .into_iter()
            .filter(|event| {
                event.pointer("/involvedObject/name").and_then(Value::as_str) == Some(name)
                    && event
                        .pointer("/involvedObject/namespace")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        == namespace
            })
            .filter_map(|event| event.get("reason").and_then(Value::as_str).map(str::to_string))
            .collect()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
