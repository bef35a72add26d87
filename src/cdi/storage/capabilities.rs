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

use crate::cdi::api::storageprofile::ClaimPropertySet;
use crate::cdi::k8s::storage::{StorageClass, NO_PROVISIONER};
use crate::cdi::k8s::volume::{
    PersistentVolume, ACCESS_RWO, ACCESS_RWX, VOLUME_MODE_BLOCK, VOLUME_MODE_FILESYSTEM,
};

/// Best access and volume mode a provisioner is known to support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageCapabilities {
    pub access_mode: &'static str,
    pub volume_mode: &'static str,
}

impl StorageCapabilities {
    const fn new(access_mode: &'static str, volume_mode: &'static str) -> Self {
        StorageCapabilities {
            access_mode,
            volume_mode,
        }
    }

    pub fn claim_property_set(&self) -> ClaimPropertySet {
        ClaimPropertySet {
            access_modes: vec![self.access_mode.to_string()],
            volume_mode: Some(self.volume_mode.to_string()),
        }
    }
}

const RWX_BLOCK: StorageCapabilities = StorageCapabilities::new(ACCESS_RWX, VOLUME_MODE_BLOCK);
const RWX_FILE: StorageCapabilities = StorageCapabilities::new(ACCESS_RWX, VOLUME_MODE_FILESYSTEM);
const RWO_BLOCK: StorageCapabilities = StorageCapabilities::new(ACCESS_RWO, VOLUME_MODE_BLOCK);
const RWO_FILE: StorageCapabilities = StorageCapabilities::new(ACCESS_RWO, VOLUME_MODE_FILESYSTEM);

const UNKNOWN_KEY: &str = "UNKNOWN";

fn by_key(key: &str) -> Option<StorageCapabilities> {
    let capabilities = match key {
        "kubevirt.io/hostpath-provisioner" => RWO_FILE,
        "kubernetes.io/rbd"
        | "rbd.csi.ceph.com"
        | "rook-ceph.rbd.csi.ceph.com"
        | "openshift-storage.rbd.csi.ceph.com" => RWX_BLOCK,
        "cephfs.csi.ceph.com" | "openshift-storage.cephfs.csi.ceph.com" => RWX_FILE,
        "kubernetes.io/storageos" | "storageos" => RWO_FILE,
        "kubernetes.io/aws-ebs" | "ebs.csi.aws.com" => RWO_BLOCK,
        "kubernetes.io/azure-disk" | "disk.csi.azure.com" => RWO_BLOCK,
        "kubernetes.io/azure-file" | "file.csi.azure.com" => RWX_FILE,
        "kubernetes.io/gce-pd" | "pd.csi.storage.gke.io" => RWO_BLOCK,
        "kubernetes.io/portworx-volume/shared" | "pxd.openstorage.org/shared" => RWX_FILE,
        "kubernetes.io/portworx-volume" | "pxd.openstorage.org" => RWO_FILE,
        "csi.trident.netapp.io/ontap-nas" => RWX_FILE,
        "csi.trident.netapp.io/ontap-san" => RWO_BLOCK,
        _ => return None,
    };
    Some(capabilities)
}

/// Some provisioners change behavior with class parameters, so the table is
/// keyed on a provisioner-specific refinement.
fn provisioner_key(class: &StorageClass) -> String {
    let provisioner = class.provisioner.as_str();
    match provisioner {
        "pxd.openstorage.org" | "kubernetes.io/portworx-volume" => {
            if class.parameters.get("shared").map(String::as_str) == Some("true") {
                format!("{provisioner}/shared")
            } else {
                provisioner.to_string()
            }
        }
        "csi.trident.netapp.io" => match class.parameters.get("backendType").map(String::as_str) {
            Some(backend @ ("ontap-nas" | "ontap-san")) => format!("{provisioner}/{backend}"),
            _ => UNKNOWN_KEY.to_string(),
        },
        _ => provisioner.to_string(),
    }
}

pub fn lookup(class: &StorageClass) -> Option<StorageCapabilities> {
    by_key(&provisioner_key(class))
}

pub fn is_no_provisioner(class: &StorageClass) -> bool {
    class.provisioner == NO_PROVISIONER
}

/// Property sets offered by the pre-created volumes of a no-provisioner class,
/// one per distinct (access modes, volume mode) pair in listing order.
pub fn from_volumes(class_name: &str, volumes: &[PersistentVolume]) -> Vec<ClaimPropertySet> {
    let mut sets: Vec<ClaimPropertySet> = Vec::new();
    for volume in volumes
        .iter()
        .filter(|volume| volume.spec.storage_class_name.as_deref() == Some(class_name))
    {
        if volume.spec.access_modes.is_empty() {
            continue;
        }
        let set = ClaimPropertySet {
            access_modes: volume.spec.access_modes.clone(),
            volume_mode: Some(volume.volume_mode().to_string()),
        };
        if !sets.contains(&set) {
            sets.push(set);
        }
    }
    sets
}
