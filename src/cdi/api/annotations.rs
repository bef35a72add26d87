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

//! Annotation and label keys. Claim annotations are the durable store for
//! in-flight population state; DataVolume status is derived from them.

pub const ANN_POD_PHASE: &str = "cdi.kubevirt.io/storage.pod.phase";
pub const ANN_POD_READY: &str = "cdi.kubevirt.io/storage.pod.ready";
pub const ANN_POD_RESTARTS: &str = "cdi.kubevirt.io/storage.pod.restarts";
pub const ANN_POD_RETAIN_AFTER_COMPLETION: &str =
    "cdi.kubevirt.io/storage.pod.retainAfterCompletion";
pub const ANN_PRIORITY_CLASS_NAME: &str = "cdi.kubevirt.io/storage.pod.priorityclassname";

pub const ANN_POPULATED_FOR: &str = "cdi.kubevirt.io/storage.populatedFor";
pub const ANN_ALLOW_CLAIM_ADOPTION: &str = "cdi.kubevirt.io/allowClaimAdoption";
pub const ANN_CHECK_STATIC_VOLUME: &str = "cdi.kubevirt.io/storage.checkStaticVolume";
pub const ANN_PERSISTENT_VOLUME_LIST: &str = "cdi.kubevirt.io/storage.persistentVolumeList";
pub const ANN_DELETE_AFTER_COMPLETION: &str = "cdi.kubevirt.io/storage.deleteAfterCompletion";
pub const ANN_IMMEDIATE_BINDING: &str = "cdi.kubevirt.io/storage.bind.immediate.requested";

pub const ANN_PREVIOUS_CHECKPOINT: &str = "cdi.kubevirt.io/storage.checkpoint.previous";
pub const ANN_CURRENT_CHECKPOINT: &str = "cdi.kubevirt.io/storage.checkpoint.current";
pub const ANN_FINAL_CHECKPOINT: &str = "cdi.kubevirt.io/storage.checkpoint.final";
/// Prefix; the full key is `<prefix>.<checkpoint id>`.
pub const ANN_CHECKPOINTS_COPIED: &str = "cdi.kubevirt.io/storage.checkpoint.copied";
pub const ANN_CURRENT_POD_ID: &str = "cdi.kubevirt.io/storage.checkpoint.pod.id";
pub const ANN_MULTI_STAGE_IMPORT_DONE: &str = "cdi.kubevirt.io/storage.checkpoint.done";

pub const ANN_RUNNING_CONDITION: &str = "cdi.kubevirt.io/storage.condition.running";
pub const ANN_RUNNING_CONDITION_MESSAGE: &str = "cdi.kubevirt.io/storage.condition.running.message";
pub const ANN_RUNNING_CONDITION_REASON: &str = "cdi.kubevirt.io/storage.condition.running.reason";
pub const ANN_BOUND_CONDITION: &str = "cdi.kubevirt.io/storage.condition.bound";
pub const ANN_BOUND_CONDITION_MESSAGE: &str = "cdi.kubevirt.io/storage.condition.bound.message";
pub const ANN_BOUND_CONDITION_REASON: &str = "cdi.kubevirt.io/storage.condition.bound.reason";

pub const ANN_SOURCE: &str = "cdi.kubevirt.io/storage.import.source";
pub const ANN_ENDPOINT: &str = "cdi.kubevirt.io/storage.import.endpoint";
pub const ANN_SECRET: &str = "cdi.kubevirt.io/storage.import.secretName";
pub const ANN_CERT_CONFIG_MAP: &str = "cdi.kubevirt.io/storage.import.certConfigMap";
pub const ANN_PULL_METHOD: &str = "cdi.kubevirt.io/storage.import.pullMethod";
pub const ANN_DISK_ID: &str = "cdi.kubevirt.io/storage.import.diskId";
pub const ANN_UUID: &str = "cdi.kubevirt.io/storage.import.uuid";
pub const ANN_THUMBPRINT: &str = "cdi.kubevirt.io/storage.import.thumbprint";
pub const ANN_BACKING_FILE: &str = "cdi.kubevirt.io/storage.import.backingFile";
pub const ANN_EXTRA_HEADERS: &str = "cdi.kubevirt.io/storage.import.extraHeaders";
pub const ANN_SECRET_EXTRA_HEADERS: &str = "cdi.kubevirt.io/storage.import.secretExtraHeaders";
pub const ANN_REQUIRES_SCRATCH: &str = "cdi.kubevirt.io/storage.import.requiresScratch";
pub const ANN_IMPORT_POD: &str = "cdi.kubevirt.io/storage.import.importPodName";
pub const ANN_VDDK_INIT_IMAGE_URL: &str = "cdi.kubevirt.io/storage.pod.vddk.initimageurl";
pub const ANN_VDDK_HOST: &str = "cdi.kubevirt.io/storage.pod.vddk.host";
pub const ANN_VDDK_VERSION: &str = "cdi.kubevirt.io/storage.pod.vddk.version";

pub const ANN_CONTENT_TYPE: &str = "cdi.kubevirt.io/storage.contentType";
pub const ANN_UPLOAD_REQUEST: &str = "cdi.kubevirt.io/storage.upload.target";
pub const ANN_UPLOAD_POD: &str = "cdi.kubevirt.io/storage.uploadPodName";
pub const ANN_PREALLOCATION_REQUESTED: &str = "cdi.kubevirt.io/storage.preallocation.requested";
pub const ANN_OWNER_UID: &str = "cdi.kubevirt.io/storage.ownerUID";

/// `<namespace>/<name>` of the source claim for host-assisted copies.
pub const ANN_CLONE_REQUEST: &str = "k8s.io/CloneRequest";
pub const ANN_CLONE_OF: &str = "k8s.io/CloneOf";
pub const ANN_CLONE_TOKEN: &str = "cdi.kubevirt.io/storage.clone.token";
pub const ANN_EXTENDED_CLONE_TOKEN: &str = "cdi.kubevirt.io/storage.extended.clone.token";
pub const ANN_CLONE_TYPE: &str = "cdi.kubevirt.io/cloneType";
pub const ANN_CLONE_SOURCE_POD: &str = "cdi.kubevirt.io/storage.sourceClonePodName";
pub const ANN_POPULATOR_PROGRESS: &str = "cdi.kubevirt.io/storage.populator.progress";

pub const ANN_SOURCE_DESIRED_DIGEST: &str = "cdi.kubevirt.io/storage.import.sourceDesiredDigest";
pub const ANN_LAST_CRON_TIME: &str = "cdi.kubevirt.io/storage.dataImportCron.lastCronTime";
pub const ANN_NEXT_CRON_TIME: &str = "cdi.kubevirt.io/storage.dataImportCron.nextCronTime";

/// Name of the ObjectTransfer that has claimed a source object.
pub const ANN_OBJECT_TRANSFER_NAME: &str = "cdi.kubevirt.io/objectTransferName";

pub const ANN_BIND_COMPLETED: &str = "pv.kubernetes.io/bind-completed";
pub const ANN_SELECTED_NODE: &str = "volume.kubernetes.io/selected-node";

pub const ANN_ISTIO_INJECT: &str = "sidecar.istio.io/inject";
pub const ANN_LINKERD_INJECT: &str = "linkerd.io/inject";

pub const LABEL_APP: &str = "app";
pub const LABEL_APP_VALUE: &str = "containerized-data-importer";
pub const LABEL_COMPONENT: &str = "cdi.kubevirt.io";
pub const LABEL_OWNER_UID: &str = "cdi.kubevirt.io/ownerUID";
pub const LABEL_DATA_IMPORT_CRON: &str = "cdi.kubevirt.io/dataImportCron";
pub const LABEL_DATA_IMPORT_CRON_POLLER: &str = "cdi.kubevirt.io/dataImportCron.poller";
pub const LABEL_DATA_IMPORT_CRON_CLEANUP: &str = "cdi.kubevirt.io/dataImportCronCleanup";

/// Key under which a completed checkpoint is recorded.
pub fn checkpoint_copied_key(checkpoint: &str) -> String {
    format!("{ANN_CHECKPOINTS_COPIED}.{checkpoint}")
}
