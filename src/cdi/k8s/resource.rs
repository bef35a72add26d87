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

use super::meta::{ObjectMeta, ObjectReference, OwnerReference};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

/// Every object kind the control plane reads or writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Pod,
    PersistentVolumeClaim,
    PersistentVolume,
    ConfigMap,
    Secret,
    Service,
    Event,
    ResourceQuota,
    StorageClass,
    CsiDriver,
    VolumeSnapshot,
    VolumeSnapshotClass,
    ClusterProxy,
    DataVolume,
    DataSource,
    DataImportCron,
    StorageProfile,
    ObjectTransfer,
    CdiConfig,
    VolumeImportSource,
    VolumeCloneSource,
}

pub const CDI_GROUP: &str = "cdi.kubevirt.io";
pub const CDI_VERSION: &str = "v1beta1";

impl ResourceKind {
    pub const ALL: [ResourceKind; 21] = [
        ResourceKind::Pod,
        ResourceKind::PersistentVolumeClaim,
        ResourceKind::PersistentVolume,
        ResourceKind::ConfigMap,
        ResourceKind::Secret,
        ResourceKind::Service,
        ResourceKind::Event,
        ResourceKind::ResourceQuota,
        ResourceKind::StorageClass,
        ResourceKind::CsiDriver,
        ResourceKind::VolumeSnapshot,
        ResourceKind::VolumeSnapshotClass,
        ResourceKind::ClusterProxy,
        ResourceKind::DataVolume,
        ResourceKind::DataSource,
        ResourceKind::DataImportCron,
        ResourceKind::StorageProfile,
        ResourceKind::ObjectTransfer,
        ResourceKind::CdiConfig,
        ResourceKind::VolumeImportSource,
        ResourceKind::VolumeCloneSource,
    ];

    pub fn group(self) -> &'static str {
        match self {
            ResourceKind::Pod
            | ResourceKind::PersistentVolumeClaim
            | ResourceKind::PersistentVolume
            | ResourceKind::ConfigMap
            | ResourceKind::Secret
            | ResourceKind::Service
            | ResourceKind::Event
            | ResourceKind::ResourceQuota => "",
            ResourceKind::StorageClass | ResourceKind::CsiDriver => "storage.k8s.io",
            ResourceKind::VolumeSnapshot | ResourceKind::VolumeSnapshotClass => {
                "snapshot.storage.k8s.io"
            }
            ResourceKind::ClusterProxy => "config.openshift.io",
            ResourceKind::DataVolume
            | ResourceKind::DataSource
            | ResourceKind::DataImportCron
            | ResourceKind::StorageProfile
            | ResourceKind::ObjectTransfer
            | ResourceKind::CdiConfig
            | ResourceKind::VolumeImportSource
            | ResourceKind::VolumeCloneSource => CDI_GROUP,
        }
    }

    pub fn version(self) -> &'static str {
        match self.group() {
            "" | "storage.k8s.io" | "snapshot.storage.k8s.io" | "config.openshift.io" => "v1",
            _ => CDI_VERSION,
        }
    }

    pub fn api_version(self) -> String {
        match self.group() {
            "" => self.version().to_string(),
            group => format!("{}/{}", group, self.version()),
        }
    }

    pub fn kind(self) -> &'static str {
        match self {
            ResourceKind::Pod => "Pod",
            ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ResourceKind::PersistentVolume => "PersistentVolume",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Secret => "Secret",
            ResourceKind::Service => "Service",
            ResourceKind::Event => "Event",
            ResourceKind::ResourceQuota => "ResourceQuota",
            ResourceKind::StorageClass => "StorageClass",
            ResourceKind::CsiDriver => "CSIDriver",
            ResourceKind::VolumeSnapshot => "VolumeSnapshot",
            ResourceKind::VolumeSnapshotClass => "VolumeSnapshotClass",
            ResourceKind::ClusterProxy => "Proxy",
            ResourceKind::DataVolume => "DataVolume",
            ResourceKind::DataSource => "DataSource",
            ResourceKind::DataImportCron => "DataImportCron",
            ResourceKind::StorageProfile => "StorageProfile",
            ResourceKind::ObjectTransfer => "ObjectTransfer",
            ResourceKind::CdiConfig => "CDIConfig",
            ResourceKind::VolumeImportSource => "VolumeImportSource",
            ResourceKind::VolumeCloneSource => "VolumeCloneSource",
        }
    }

    pub fn plural(self) -> &'static str {
        match self {
            ResourceKind::Pod => "pods",
            ResourceKind::PersistentVolumeClaim => "persistentvolumeclaims",
            ResourceKind::PersistentVolume => "persistentvolumes",
            ResourceKind::ConfigMap => "configmaps",
            ResourceKind::Secret => "secrets",
            ResourceKind::Service => "services",
            ResourceKind::Event => "events",
            ResourceKind::ResourceQuota => "resourcequotas",
            ResourceKind::StorageClass => "storageclasses",
            ResourceKind::CsiDriver => "csidrivers",
            ResourceKind::VolumeSnapshot => "volumesnapshots",
            ResourceKind::VolumeSnapshotClass => "volumesnapshotclasses",
            ResourceKind::ClusterProxy => "proxies",
            ResourceKind::DataVolume => "datavolumes",
            ResourceKind::DataSource => "datasources",
            ResourceKind::DataImportCron => "dataimportcrons",
            ResourceKind::StorageProfile => "storageprofiles",
            ResourceKind::ObjectTransfer => "objecttransfers",
            ResourceKind::CdiConfig => "cdiconfigs",
            ResourceKind::VolumeImportSource => "volumeimportsources",
            ResourceKind::VolumeCloneSource => "volumeclonesources",
        }
    }

    pub fn namespaced(self) -> bool {
        !matches!(
            self,
            ResourceKind::PersistentVolume
                | ResourceKind::StorageClass
                | ResourceKind::CsiDriver
                | ResourceKind::VolumeSnapshotClass
                | ResourceKind::ClusterProxy
                | ResourceKind::StorageProfile
                | ResourceKind::ObjectTransfer
                | ResourceKind::CdiConfig
        )
    }

    /// Kinds whose `status` is written through the `/status` subresource.
    pub fn has_status_subresource(self) -> bool {
        matches!(
            self,
            ResourceKind::DataVolume
                | ResourceKind::DataSource
                | ResourceKind::DataImportCron
                | ResourceKind::StorageProfile
                | ResourceKind::ObjectTransfer
                | ResourceKind::CdiConfig
        )
    }

    pub fn from_kind(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|candidate| candidate.kind() == kind)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// A typed object stored in the cluster.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: ResourceKind;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn name(&self) -> &str {
        self.meta().name()
    }

    fn namespace(&self) -> &str {
        self.meta().namespace()
    }

    fn uid(&self) -> &str {
        self.meta().uid()
    }

    /// Owner reference pointing at this object; `controller` marks it as the managing owner.
    fn owner_reference(&self, controller: bool) -> OwnerReference {
        OwnerReference {
            api_version: Self::KIND.api_version(),
            kind: Self::KIND.kind().to_string(),
            name: self.name().to_string(),
            uid: self.uid().to_string(),
            controller: controller.then_some(true),
            block_owner_deletion: controller.then_some(true),
        }
    }

    fn object_reference(&self) -> ObjectReference {
        let meta = self.meta();
        ObjectReference {
            api_version: Some(Self::KIND.api_version()),
            kind: Some(Self::KIND.kind().to_string()),
            name: meta.name.clone(),
            namespace: meta.namespace.clone(),
            uid: meta.uid.clone(),
            resource_version: meta.resource_version.clone(),
        }
    }
}

macro_rules! impl_resource {
    ($ty:ty, $kind:expr) => {
        impl $crate::cdi::k8s::resource::Resource for $ty {
            const KIND: $crate::cdi::k8s::resource::ResourceKind = $kind;

            fn meta(&self) -> &$crate::cdi::k8s::meta::ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut $crate::cdi::k8s::meta::ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

pub(crate) use impl_resource;
