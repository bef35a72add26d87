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

//! Claims the DataVolume did not create: adoption of pre-populated claims
//! and binding to statically provisioned volumes.

use super::{DataVolumeReconciler, Step};
use crate::cdi::api::annotations::*;
use crate::cdi::api::cdiconfig::{CdiConfig, FEATURE_DATA_VOLUME_CLAIM_ADOPTION};
use crate::cdi::api::datavolume::{DataVolume, DataVolumePhase};
use crate::cdi::controller::events::{CLAIM_ADOPTED, ERR_CLAIM_NOT_VALID, ERR_STATIC_BINDING};
use crate::cdi::controller::reconcile::ReconcileError;
use crate::cdi::k8s::pod::POD_SUCCEEDED;
use crate::cdi::k8s::resource::Resource;
use crate::cdi::k8s::volume::{PersistentVolume, PersistentVolumeClaim, VOLUME_AVAILABLE};
use crate::cdi::logger::log_info;

/// Whether an existing claim may be taken over by `dv`.
pub(crate) fn adoptable(dv: &DataVolume, claim: &PersistentVolumeClaim, config: &CdiConfig) -> bool {
    if claim.metadata.annotation(ANN_POPULATED_FOR) == Some(dv.metadata.name()) {
        return true;
    }
    if claim.metadata.controller_ref().is_some() {
        return false;
    }
    match dv.metadata.annotation(ANN_ALLOW_CLAIM_ADOPTION) {
        Some(value) => value.eq_ignore_ascii_case("true"),
        None => config.feature_gate_enabled(FEATURE_DATA_VOLUME_CLAIM_ADOPTION),
    }
}

/// An adopted claim must match what the DataVolume asks for.
fn compatible(dv: &DataVolume, claim: &PersistentVolumeClaim) -> Result<(), String> {
    let Some(template) = dv.spec.claim_template() else {
        return Ok(());
    };
    if let Some(class) = template.storage_class_name.as_deref() {
        if claim.storage_class() != Some(class) {
            return Err(format!(
                "storage class {} does not match requested {class}",
                claim.storage_class().unwrap_or("<none>")
            ));
        }
    }
    if let Some(requested) = template.requested_storage() {
        let available = claim.capacity().or(claim.requested_storage()).unwrap_or(0);
        if available < requested {
            return Err(format!(
                "size {available} is smaller than requested {requested}"
            ));
        }
    }
    if let Some(mode) = template.volume_mode.as_deref() {
        if claim.volume_mode() != mode {
            return Err(format!(
                "volume mode {} does not match requested {mode}",
                claim.volume_mode()
            ));
        }
    }
    Ok(())
}

/// Takes over a claim of the same name, treating its content as the
/// finished population. Refuses claims it may not adopt.
pub(super) async fn adopt(
    reconciler: &DataVolumeReconciler,
    dv: &DataVolume,
    mut claim: PersistentVolumeClaim,
    config: &CdiConfig,
) -> Result<Step, ReconcileError> {
    if !adoptable(dv, &claim, config) {
        reconciler
            .recorder
            .warning(
                dv,
                ERR_CLAIM_NOT_VALID,
                &format!(
                    "PersistentVolumeClaim {} already exists and is not owned by this DataVolume",
                    claim.metadata.name()
                ),
            )
            .await;
        return Ok(Step::pending());
    }
    if let Err(message) = compatible(dv, &claim) {
        reconciler
            .recorder
            .warning(
                dv,
                ERR_CLAIM_NOT_VALID,
                &format!("PersistentVolumeClaim {} cannot be adopted: {message}", claim.metadata.name()),
            )
            .await;
        return Ok(Step::pending());
    }
    let meta = &mut claim.metadata;
    for (key, value) in &dv.metadata.labels {
        meta.labels.entry(key.clone()).or_insert_with(|| value.clone());
    }
    meta.owner_references
        .retain(|owner| !owner.controller.unwrap_or(false));
    meta.owner_references.push(dv.owner_reference(true));
    meta.labels
        .insert(LABEL_APP.to_string(), LABEL_APP_VALUE.to_string());
    meta.set_annotation(ANN_POD_PHASE, POD_SUCCEEDED);
    meta.remove_annotation(ANN_POPULATED_FOR);
    let claim = reconciler.claims.update(&claim).await?;
    log_info(
        super::NAME,
        "Adopted existing claim",
        &[
            ("namespace", claim.metadata.namespace()),
            ("claim", claim.metadata.name()),
        ],
    );
    reconciler
        .recorder
        .normal(
            dv,
            CLAIM_ADOPTED,
            &format!("Adopted PersistentVolumeClaim {}", claim.metadata.name()),
        )
        .await;
    Ok(Step::new(DataVolumePhase::Succeeded, Some(claim)))
}

/// Available volumes pre-bound to the claim the DataVolume is about to create.
pub(super) fn static_candidates(
    volumes: &[PersistentVolume],
    namespace: &str,
    name: &str,
) -> Vec<String> {
    volumes
        .iter()
        .filter(|volume| volume.phase() == VOLUME_AVAILABLE && volume.is_claimed_by(namespace, name))
        .map(|volume| volume.metadata.name().to_string())
        .collect()
}

/// With `checkStaticVolume` set and matching volumes present, creates the
/// bare claim and waits for it to bind instead of populating it.
pub(super) async fn start_static(
    reconciler: &DataVolumeReconciler,
    dv: &DataVolume,
    base: &PersistentVolumeClaim,
) -> Result<Option<Step>, ReconcileError> {
    if !dv.metadata.is_annotation_true(ANN_CHECK_STATIC_VOLUME) {
        return Ok(None);
    }
    let volumes = reconciler.volumes.list(None, None).await?;
    let candidates = static_candidates(&volumes, dv.metadata.namespace(), dv.metadata.name());
    if candidates.is_empty() {
        return Ok(None);
    }
    let list = serde_json::to_string(&candidates)
        .map_err(|err| ReconcileError::Internal(err.to_string()))?;
    let mut claim = base.clone();
    claim.metadata.set_annotation(ANN_PERSISTENT_VOLUME_LIST, list);
    let claim = reconciler.create_claim(claim).await?;
    Ok(Some(Step::new(DataVolumePhase::Pending, Some(claim))))
}

/// Resolves a claim created for static binding once it binds.
pub(super) async fn static_binding(
    reconciler: &DataVolumeReconciler,
    dv: &DataVolume,
    mut claim: PersistentVolumeClaim,
) -> Result<Step, ReconcileError> {
    if !claim.is_bound() {
        return Ok(Step::new(DataVolumePhase::Pending, Some(claim)));
    }
    let listed: Vec<String> = claim
        .metadata
        .annotation(ANN_PERSISTENT_VOLUME_LIST)
        .and_then(|value| serde_json::from_str(value).ok())
        .unwrap_or_default();
    let bound_to = claim.spec.volume_name.clone().unwrap_or_default();
    if !listed.contains(&bound_to) {
        reconciler
            .recorder
            .warning(
                dv,
                ERR_STATIC_BINDING,
                &format!("claim bound to unexpected volume {bound_to}; recreating"),
            )
            .await;
        reconciler
            .claims
            .delete_opt(claim.metadata.namespace(), claim.metadata.name())
            .await?;
        return Ok(Step::pending());
    }
    claim.metadata.remove_annotation(ANN_PERSISTENT_VOLUME_LIST);
    claim.metadata.set_annotation(ANN_POD_PHASE, POD_SUCCEEDED);
    claim
        .metadata
        .set_annotation(ANN_POPULATED_FOR, dv.metadata.name());
    let claim = reconciler.claims.update(&claim).await?;
    Ok(Step::new(DataVolumePhase::Succeeded, Some(claim)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdi::k8s::meta::{ObjectMeta, ObjectReference};
    use crate::cdi::k8s::volume::{PersistentVolumeSpec, PersistentVolumeStatus, VOLUME_BOUND};

    fn volume(name: &str, phase: &str, claim: Option<(&str, &str)>) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta::named(None, name),
            spec: PersistentVolumeSpec {
                claim_ref: claim.map(|(namespace, name)| ObjectReference {
                    namespace: Some(namespace.to_string()),
                    name: Some(name.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            status: Some(PersistentVolumeStatus {
                phase: Some(phase.to_string()),
            }),
        }
    }

    #[test]
    fn only_available_prebound_volumes_qualify() {
        let volumes = vec![
            volume("pv-match", VOLUME_AVAILABLE, Some(("ns", "dv"))),
            volume("pv-bound", VOLUME_BOUND, Some(("ns", "dv"))),
            volume("pv-other", VOLUME_AVAILABLE, Some(("ns", "other"))),
            volume("pv-free", VOLUME_AVAILABLE, None),
        ];
        assert_eq!(static_candidates(&volumes, "ns", "dv"), vec!["pv-match".to_string()]);
    }

    #[test]
    fn adoption_follows_annotation_then_gate() {
        let mut dv = DataVolume {
            metadata: ObjectMeta::named(Some("ns"), "dv"),
            ..Default::default()
        };
        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta::named(Some("ns"), "dv"),
            ..Default::default()
        };
        let mut config = CdiConfig::default();
        assert!(!adoptable(&dv, &claim, &config));
        config
            .spec
            .feature_gates
            .push(FEATURE_DATA_VOLUME_CLAIM_ADOPTION.to_string());
        assert!(adoptable(&dv, &claim, &config));
        dv.metadata.set_annotation(ANN_ALLOW_CLAIM_ADOPTION, "false");
        assert!(!adoptable(&dv, &claim, &config));
    }

    #[test]
    fn adopted_claim_must_be_large_enough() {
        let mut dv = DataVolume {
            metadata: ObjectMeta::named(Some("ns"), "dv"),
            ..Default::default()
        };
        let mut template = crate::cdi::k8s::volume::PersistentVolumeClaimSpec::default();
        template
            .resources
            .requests
            .insert("storage".to_string(), "2Gi".to_string());
        dv.spec.pvc = Some(template);
        let mut claim = PersistentVolumeClaim {
            metadata: ObjectMeta::named(Some("ns"), "dv"),
            ..Default::default()
        };
        claim
            .spec
            .resources
            .requests
            .insert("storage".to_string(), "1Gi".to_string());
        assert!(compatible(&dv, &claim).is_err());
        claim
            .spec
            .resources
            .requests
            .insert("storage".to_string(), "4Gi".to_string());
        assert!(compatible(&dv, &claim).is_ok());
    }

    #[test]
    fn populated_for_claims_are_always_adoptable() {
        let dv = DataVolume {
            metadata: ObjectMeta::named(Some("ns"), "dv"),
            ..Default::default()
        };
        let mut claim = PersistentVolumeClaim {
            metadata: ObjectMeta::named(Some("ns"), "dv"),
            ..Default::default()
        };
        claim.metadata.set_annotation(ANN_POPULATED_FOR, "dv");
        assert!(adoptable(&dv, &claim, &CdiConfig::default()));
    }
}
