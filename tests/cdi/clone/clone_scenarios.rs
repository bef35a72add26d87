use cdi::cdi::api::annotations::{ANN_CLONE_TOKEN, ANN_CLONE_TYPE, ANN_EXTENDED_CLONE_TOKEN};
use cdi::cdi::api::datasource::{DataSource, DataSourceSource, DataSourceSpec};
use cdi::cdi::api::datavolume::{
    DataVolume, DataVolumePhase, DataVolumeSource, DataVolumeSourceRef, DataVolumeSpec,
    NamespacedSource,
};
use cdi::cdi::api::storageprofile::CloneStrategy;
use cdi::cdi::k8s::meta::ObjectMeta;
use cdi::cdi::k8s::storage::{VolumeSnapshot, VolumeSnapshotSource, VolumeSnapshotSpec};
use cdi::cdi::k8s::volume::PersistentVolumeClaim;
use cdi::cdi::test_support::{
    add_csi_driver, add_storage_class, claim_spec, create, sha256_hex, Harness,
};
use cdi::cdi::token::keys::KeyStore;
use cdi::cdi::token::{Payload, TokenError, CLONE_TOKEN_LIFETIME};
use std::time::Duration;

const SOURCE_NS: &str = "golden-images";
const TARGET_NS: &str = "tenant";
const HOSTPATH: &str = "kubevirt.io/hostpath-provisioner";
const RBD: &str = "rbd.csi.ceph.com";

fn clone_dv(namespace: &str, name: &str, source_ns: &str, source_name: &str, size: &str) -> DataVolume {
    DataVolume {
        metadata: ObjectMeta::named(Some(namespace), name),
        spec: DataVolumeSpec {
            source: Some(DataVolumeSource {
                pvc: Some(NamespacedSource {
                    namespace: source_ns.to_string(),
                    name: source_name.to_string(),
                }),
                ..Default::default()
            }),
            pvc: Some(claim_spec(size, None)),
            ..Default::default()
        },
        status: None,
    }
}

async fn get_dv(harness: &Harness, namespace: &str, name: &str) -> DataVolume {
    harness
        .api::<DataVolume>()
        .get(namespace, name)
        .await
        .expect("datavolume")
}

async fn get_claim(harness: &Harness, namespace: &str, name: &str) -> PersistentVolumeClaim {
    harness
        .api::<PersistentVolumeClaim>()
        .get(namespace, name)
        .await
        .expect("claim")
}

/// Mints the token admission would have attached to a cross-namespace clone.
async fn clone_token(harness: &Harness, source: (&str, &str), target: (&str, &str)) -> String {
    clone_token_lasting(harness, source, target, CLONE_TOKEN_LIFETIME).await
}

async fn clone_token_lasting(
    harness: &Harness,
    source: (&str, &str),
    target: (&str, &str),
    lifetime: Duration,
) -> String {
    let keys = harness
        .runtime
        .context()
        .require::<KeyStore>()
        .expect("key store");
    keys.ensure_signing_key().await.expect("signing key");
    keys.generator(lifetime)
        .expect("generator")
        .generate(&Payload::clone_source(source.0, source.1, target.0, target.1))
        .expect("token")
}

#[tokio::test]
async fn scenario_host_assisted_clone_copies_source() {
    let harness = Harness::new();
    add_storage_class(&harness.cluster, "standard", HOSTPATH, true).await;
    let content = b"golden fedora".to_vec();
    harness
        .node
        .create_populated_claim(SOURCE_NS, "fedora", claim_spec("1Gi", Some("standard")), &content)
        .await;

    create(&harness.cluster, &clone_dv(SOURCE_NS, "copy", "", "fedora", "1Gi")).await;
    assert!(harness.settle().await);

    assert_eq!(get_dv(&harness, SOURCE_NS, "copy").await.phase(), DataVolumePhase::Succeeded);
    let claim = get_claim(&harness, SOURCE_NS, "copy").await;
    assert_eq!(
        claim.metadata.annotation(ANN_CLONE_TYPE),
        Some(CloneStrategy::HostAssisted.as_str())
    );
    assert_eq!(
        harness.node.image_checksum(SOURCE_NS, "copy").await,
        Some(sha256_hex(&content))
    );
    assert!(harness
        .event_reasons(SOURCE_NS, "copy")
        .contains(&"CloneSucceeded".to_string()));
}

#[tokio::test]
async fn scenario_snapshot_clone_restores_from_snapshot() {
    let harness = Harness::new();
    add_csi_driver(&harness.cluster, RBD, true).await;
    add_storage_class(&harness.cluster, "ceph", RBD, true).await;
    let content = b"snapshotted image".to_vec();
    harness
        .node
        .create_populated_claim(SOURCE_NS, "fedora", claim_spec("1Gi", Some("ceph")), &content)
        .await;

    create(&harness.cluster, &clone_dv(SOURCE_NS, "fast", SOURCE_NS, "fedora", "1Gi")).await;
    assert!(harness.settle().await);

    assert_eq!(get_dv(&harness, SOURCE_NS, "fast").await.phase(), DataVolumePhase::Succeeded);
    let claim = get_claim(&harness, SOURCE_NS, "fast").await;
    assert_eq!(
        claim.metadata.annotation(ANN_CLONE_TYPE),
        Some(CloneStrategy::Snapshot.as_str())
    );
    assert_eq!(
        harness.node.image_checksum(SOURCE_NS, "fast").await,
        Some(sha256_hex(&content))
    );
}

#[tokio::test]
async fn scenario_cross_namespace_clone_falls_back_to_host_copy() {
    let harness = Harness::new();
    add_csi_driver(&harness.cluster, RBD, true).await;
    add_storage_class(&harness.cluster, "ceph", RBD, true).await;
    let content = b"shared golden image".to_vec();
    harness
        .node
        .create_populated_claim(SOURCE_NS, "fedora", claim_spec("1Gi", Some("ceph")), &content)
        .await;

    let mut dv = clone_dv(TARGET_NS, "mine", SOURCE_NS, "fedora", "1Gi");
    let token = clone_token(&harness, (SOURCE_NS, "fedora"), (TARGET_NS, "mine")).await;
    dv.metadata.set_annotation(ANN_CLONE_TOKEN, token);
    create(&harness.cluster, &dv).await;
    assert!(harness.settle().await);

    assert_eq!(get_dv(&harness, TARGET_NS, "mine").await.phase(), DataVolumePhase::Succeeded);
    let claim = get_claim(&harness, TARGET_NS, "mine").await;
    assert_eq!(
        claim.metadata.annotation(ANN_CLONE_TYPE),
        Some(CloneStrategy::HostAssisted.as_str())
    );
    assert_eq!(
        harness.node.image_checksum(TARGET_NS, "mine").await,
        Some(sha256_hex(&content))
    );
    assert!(harness
        .event_reasons(TARGET_NS, "mine")
        .contains(&"CrossNamespace".to_string()));
}

#[tokio::test]
async fn scenario_cross_namespace_clone_without_token_is_held() {
    let harness = Harness::new();
    add_storage_class(&harness.cluster, "standard", HOSTPATH, true).await;
    harness
        .node
        .create_populated_claim(SOURCE_NS, "fedora", claim_spec("1Gi", Some("standard")), b"disk")
        .await;

    create(&harness.cluster, &clone_dv(TARGET_NS, "sneaky", SOURCE_NS, "fedora", "1Gi")).await;
    assert!(harness.settle().await);

    assert_eq!(
        get_dv(&harness, TARGET_NS, "sneaky").await.phase(),
        DataVolumePhase::CloneScheduled
    );
    let claim = harness
        .api::<PersistentVolumeClaim>()
        .get_opt(TARGET_NS, "sneaky")
        .await
        .expect("lookup");
    assert!(claim.is_none());
    assert!(harness
        .event_reasons(TARGET_NS, "sneaky")
        .contains(&"CloneValidationFailed".to_string()));
}

#[tokio::test]
async fn scenario_token_for_another_target_is_rejected() {
    let harness = Harness::new();
    add_storage_class(&harness.cluster, "standard", HOSTPATH, true).await;
    harness
        .node
        .create_populated_claim(SOURCE_NS, "fedora", claim_spec("1Gi", Some("standard")), b"disk")
        .await;

    let mut dv = clone_dv(TARGET_NS, "second", SOURCE_NS, "fedora", "1Gi");
    let token = clone_token(&harness, (SOURCE_NS, "fedora"), (TARGET_NS, "first")).await;
    dv.metadata.set_annotation(ANN_CLONE_TOKEN, token);
    create(&harness.cluster, &dv).await;
    assert!(harness.settle().await);

    assert_eq!(
        get_dv(&harness, TARGET_NS, "second").await.phase(),
        DataVolumePhase::CloneScheduled
    );
}

#[tokio::test]
async fn scenario_smaller_target_fails_clone() {
    let harness = Harness::new();
    add_storage_class(&harness.cluster, "standard", HOSTPATH, true).await;
    harness
        .node
        .create_populated_claim(SOURCE_NS, "fedora", claim_spec("2Gi", Some("standard")), b"disk")
        .await;

    create(&harness.cluster, &clone_dv(SOURCE_NS, "tiny", SOURCE_NS, "fedora", "1Gi")).await;
    assert!(harness.settle().await);

    assert_eq!(get_dv(&harness, SOURCE_NS, "tiny").await.phase(), DataVolumePhase::Failed);
    assert!(harness
        .event_reasons(SOURCE_NS, "tiny")
        .contains(&"ErrIncompatiblePVC".to_string()));
}

#[tokio::test]
async fn scenario_missing_source_waits() {
    let harness = Harness::new();
    add_storage_class(&harness.cluster, "standard", HOSTPATH, true).await;

    create(&harness.cluster, &clone_dv(SOURCE_NS, "orphan", SOURCE_NS, "absent", "1Gi")).await;
    assert!(harness.settle().await);
    assert_eq!(
        get_dv(&harness, SOURCE_NS, "orphan").await.phase(),
        DataVolumePhase::CloneScheduled
    );

    let content = b"late source".to_vec();
    harness
        .node
        .create_populated_claim(SOURCE_NS, "absent", claim_spec("1Gi", Some("standard")), &content)
        .await;
    assert!(harness.settle().await);
    assert_eq!(get_dv(&harness, SOURCE_NS, "orphan").await.phase(), DataVolumePhase::Succeeded);
    assert_eq!(
        harness.node.image_checksum(SOURCE_NS, "orphan").await,
        Some(sha256_hex(&content))
    );
}

#[tokio::test]
async fn scenario_source_ref_resolves_through_datasource() {
    let harness = Harness::new();
    add_storage_class(&harness.cluster, "standard", HOSTPATH, true).await;
    let content = b"current golden".to_vec();
    harness
        .node
        .create_populated_claim(SOURCE_NS, "fedora-v2", claim_spec("1Gi", Some("standard")), &content)
        .await;
    create(
        &harness.cluster,
        &DataSource {
            metadata: ObjectMeta::named(Some(SOURCE_NS), "fedora"),
            spec: DataSourceSpec {
                source: DataSourceSource {
                    pvc: Some(NamespacedSource {
                        namespace: SOURCE_NS.to_string(),
                        name: "fedora-v2".to_string(),
                    }),
                    snapshot: None,
                },
            },
            status: None,
        },
    )
    .await;

    let dv = DataVolume {
        metadata: ObjectMeta::named(Some(SOURCE_NS), "vm-disk"),
        spec: DataVolumeSpec {
            source_ref: Some(DataVolumeSourceRef {
                kind: "DataSource".to_string(),
                namespace: None,
                name: "fedora".to_string(),
            }),
            pvc: Some(claim_spec("1Gi", None)),
            ..Default::default()
        },
        status: None,
    };
    create(&harness.cluster, &dv).await;
    assert!(harness.settle().await);

    assert_eq!(get_dv(&harness, SOURCE_NS, "vm-disk").await.phase(), DataVolumePhase::Succeeded);
    assert_eq!(
        harness.node.image_checksum(SOURCE_NS, "vm-disk").await,
        Some(sha256_hex(&content))
    );
    let source = harness
        .api::<DataSource>()
        .get(SOURCE_NS, "fedora")
        .await
        .expect("datasource");
    let ready = source
        .conditions()
        .iter()
        .find(|condition| condition.condition_type == "Ready")
        .expect("ready condition");
    assert_eq!(ready.status, "True");
}

#[tokio::test]
async fn scenario_clone_outlives_admission_token_while_source_is_late() {
    let harness = Harness::new();
    add_storage_class(&harness.cluster, "standard", HOSTPATH, true).await;

    let mut dv = clone_dv(TARGET_NS, "patient", SOURCE_NS, "fedora", "1Gi");
    let token = clone_token_lasting(
        &harness,
        (SOURCE_NS, "fedora"),
        (TARGET_NS, "patient"),
        Duration::from_secs(1),
    )
    .await;
    dv.metadata.set_annotation(ANN_CLONE_TOKEN, token.clone());
    create(&harness.cluster, &dv).await;
    assert!(harness.settle().await);

    let waiting = get_dv(&harness, TARGET_NS, "patient").await;
    assert_eq!(waiting.phase(), DataVolumePhase::CloneScheduled);
    assert!(waiting.metadata.annotation(ANN_EXTENDED_CLONE_TOKEN).is_some());

    // Past the admission token lifetime plus leeway.
    tokio::time::sleep(Duration::from_secs(12)).await;
    let keys = harness
        .runtime
        .context()
        .require::<KeyStore>()
        .expect("key store");
    let validator = keys.clone_token_validator().await.expect("validator");
    assert_eq!(validator.validate(&token), Err(TokenError::Expired));

    let content = b"late golden image".to_vec();
    harness
        .node
        .create_populated_claim(SOURCE_NS, "fedora", claim_spec("1Gi", Some("standard")), &content)
        .await;
    assert!(harness.settle().await);

    assert_eq!(
        get_dv(&harness, TARGET_NS, "patient").await.phase(),
        DataVolumePhase::Succeeded
    );
    assert_eq!(
        harness.node.image_checksum(TARGET_NS, "patient").await,
        Some(sha256_hex(&content))
    );
    assert!(!harness
        .event_reasons(TARGET_NS, "patient")
        .contains(&"CloneValidationFailed".to_string()));
}

#[tokio::test]
async fn scenario_extended_token_is_bound_to_its_datavolume() {
    let harness = Harness::new();
    add_storage_class(&harness.cluster, "standard", HOSTPATH, true).await;

    let mut first = clone_dv(TARGET_NS, "reused", SOURCE_NS, "fedora", "1Gi");
    let token = clone_token(&harness, (SOURCE_NS, "fedora"), (TARGET_NS, "reused")).await;
    first.metadata.set_annotation(ANN_CLONE_TOKEN, token);
    create(&harness.cluster, &first).await;
    assert!(harness.settle().await);
    let extended = get_dv(&harness, TARGET_NS, "reused")
        .await
        .metadata
        .annotation(ANN_EXTENDED_CLONE_TOKEN)
        .map(str::to_string)
        .expect("extended token");

    // A recreated DataVolume of the same name gets a new uid.
    harness
        .api::<DataVolume>()
        .delete(TARGET_NS, "reused")
        .await
        .expect("delete");
    let mut second = clone_dv(TARGET_NS, "reused", SOURCE_NS, "fedora", "1Gi");
    second.metadata.set_annotation(ANN_EXTENDED_CLONE_TOKEN, extended);
    create(&harness.cluster, &second).await;
    harness
        .node
        .create_populated_claim(SOURCE_NS, "fedora", claim_spec("1Gi", Some("standard")), b"disk")
        .await;
    assert!(harness.settle().await);

    assert_eq!(
        get_dv(&harness, TARGET_NS, "reused").await.phase(),
        DataVolumePhase::CloneScheduled
    );
    assert!(harness
        .event_reasons(TARGET_NS, "reused")
        .contains(&"CloneValidationFailed".to_string()));
}

#[tokio::test]
async fn scenario_snapshot_source_without_expansion_copies_through_temporary_claim() {
    let harness = Harness::new();
    add_csi_driver(&harness.cluster, RBD, true).await;
    // No allowVolumeExpansion on the class: a larger restore is impossible.
    add_storage_class(&harness.cluster, "ceph", RBD, true).await;
    let content = b"small snapshotted disk".to_vec();
    harness
        .node
        .create_populated_claim(SOURCE_NS, "fedora", claim_spec("1Gi", Some("ceph")), &content)
        .await;
    create(
        &harness.cluster,
        &VolumeSnapshot {
            metadata: ObjectMeta::named(Some(SOURCE_NS), "fedora-snap"),
            spec: VolumeSnapshotSpec {
                source: VolumeSnapshotSource {
                    persistent_volume_claim_name: Some("fedora".to_string()),
                    ..Default::default()
                },
                volume_snapshot_class_name: None,
            },
            status: None,
        },
    )
    .await;

    let dv = DataVolume {
        metadata: ObjectMeta::named(Some(SOURCE_NS), "grown"),
        spec: DataVolumeSpec {
            source: Some(DataVolumeSource {
                snapshot: Some(NamespacedSource {
                    namespace: SOURCE_NS.to_string(),
                    name: "fedora-snap".to_string(),
                }),
                ..Default::default()
            }),
            pvc: Some(claim_spec("2Gi", None)),
            ..Default::default()
        },
        status: None,
    };
    create(&harness.cluster, &dv).await;

    let claims = harness.api::<PersistentVolumeClaim>();
    let temporary = "tmp-source-pvc-grown";
    let mut restored = None;
    for _ in 0..30 {
        harness.round().await;
        restored = claims
            .get_opt(SOURCE_NS, temporary)
            .await
            .expect("lookup");
        if restored.is_some() {
            break;
        }
    }
    let restored = restored.expect("temporary source claim while copying");
    assert_eq!(
        restored.spec.data_source.as_ref().map(|source| source.name.as_str()),
        Some("fedora-snap")
    );

    assert!(harness.settle().await);
    assert_eq!(get_dv(&harness, SOURCE_NS, "grown").await.phase(), DataVolumePhase::Succeeded);
    let claim = get_claim(&harness, SOURCE_NS, "grown").await;
    assert_eq!(
        claim.metadata.annotation(ANN_CLONE_TYPE),
        Some(CloneStrategy::HostAssisted.as_str())
    );
    assert!(claims
        .get_opt(SOURCE_NS, temporary)
        .await
        .expect("lookup")
        .is_none());
    assert_eq!(
        harness.node.image_checksum(SOURCE_NS, "grown").await,
        Some(sha256_hex(&content))
    );
    assert!(harness
        .event_reasons(SOURCE_NS, "grown")
        .contains(&"NoVolumeExpansion".to_string()));
}
