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

//! External population: a `dataSourceRef` naming a populator CDI does not
//! implement. CDI only creates the claim and reports when it is bound.

use super::{DataVolumeReconciler, Step};
use crate::cdi::api::annotations::ANN_POD_PHASE;
use crate::cdi::api::datavolume::{DataVolume, DataVolumePhase};
use crate::cdi::client::ClientError;
use crate::cdi::controller::events::{
    NO_ANY_VOLUME_DATA_SOURCE, NO_CSI_DRIVER_FOR_EXTERNAL_POPULATION,
};
use crate::cdi::controller::reconcile::ReconcileError;
use crate::cdi::k8s::meta::ObjectMeta;
use crate::cdi::k8s::pod::POD_SUCCEEDED;
use crate::cdi::k8s::resource::CDI_GROUP;
use crate::cdi::k8s::volume::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, TypedObjectReference, ACCESS_RWO,
};
use crate::cdi::logger::log_info;
use crate::cdi::util::naming::random_suffix;

pub(super) async fn start(
    reconciler: &DataVolumeReconciler,
    dv: &DataVolume,
    reference: &TypedObjectReference,
    claim: PersistentVolumeClaim,
) -> Result<Step, ReconcileError> {
    let supported = reconciler
        .any_volume_data_source
        .get_or_try_init(|| probe_any_volume_data_source(reconciler, dv.metadata.namespace()))
        .await?;
    if !*supported {
        reconciler
            .recorder
            .warning(
                dv,
                NO_ANY_VOLUME_DATA_SOURCE,
                "the cluster does not support the AnyVolumeDataSource feature; dataSourceRef cannot be used",
            )
            .await;
        return Ok(Step::pending());
    }
    let provisioner = reconciler
        .profiles
        .lookup(claim.storage_class())
        .await?
        .map(|profile| profile.provisioner.clone());
    let has_driver = match &provisioner {
        Some(provisioner) => reconciler.drivers.get_opt("", provisioner).await?.is_some(),
        None => false,
    };
    if !has_driver {
        reconciler
            .recorder
            .warning(
                dv,
                NO_CSI_DRIVER_FOR_EXTERNAL_POPULATION,
                &format!(
                    "populator {}/{} needs a CSI storage class; provisioner {} has no CSIDriver",
                    reference.kind,
                    reference.name,
                    provisioner.as_deref().unwrap_or("<none>")
                ),
            )
            .await;
        return Ok(Step::pending());
    }
    let claim = reconciler.create_claim(claim).await?;
    Ok(Step::new(DataVolumePhase::PendingPopulation, Some(claim)))
}

pub(super) async fn progress(
    reconciler: &DataVolumeReconciler,
    _dv: &DataVolume,
    mut claim: PersistentVolumeClaim,
) -> Result<Step, ReconcileError> {
    if claim.metadata.annotation(ANN_POD_PHASE) == Some(POD_SUCCEEDED) {
        return Ok(Step::new(DataVolumePhase::Succeeded, Some(claim)));
    }
    if !claim.is_bound() {
        return Ok(Step::new(DataVolumePhase::PendingPopulation, Some(claim)));
    }
    claim.metadata.set_annotation(ANN_POD_PHASE, POD_SUCCEEDED);
    let claim = reconciler.claims.update(&claim).await?;
    Ok(Step::new(DataVolumePhase::Succeeded, Some(claim)))
}

/// API servers without AnyVolumeDataSource silently drop `dataSourceRef`;
/// a throwaway claim shows whether it survives.
async fn probe_any_volume_data_source(
    reconciler: &DataVolumeReconciler,
    namespace: &str,
) -> Result<bool, ClientError> {
    let name = format!("cdi-populator-probe-{}", random_suffix(5));
    let mut spec = PersistentVolumeClaimSpec {
        access_modes: vec![ACCESS_RWO.to_string()],
        data_source_ref: Some(TypedObjectReference {
            api_group: Some(CDI_GROUP.to_string()),
            kind: "VolumeImportSource".to_string(),
            name: "probe".to_string(),
            namespace: None,
        }),
        ..Default::default()
    };
    spec.resources
        .requests
        .insert("storage".to_string(), "1Mi".to_string());
    let probe = PersistentVolumeClaim {
        metadata: ObjectMeta::named(Some(namespace), &name),
        spec,
        status: None,
    };
    let created = reconciler.claims.create(&probe).await?;
    reconciler.claims.delete_opt(namespace, &name).await?;
    let supported = created.spec.data_source_ref.is_some();
    log_info(
        super::NAME,
        "Probed AnyVolumeDataSource support",
        &[("supported", if supported { "true" } else { "false" })],
    );
    Ok(supported)
}
