use cdi::cdi::api::annotations::{
    ANN_ALLOW_CLAIM_ADOPTION, ANN_CHECK_STATIC_VOLUME, ANN_PERSISTENT_VOLUME_LIST,
    ANN_POPULATED_FOR,
};
use cdi::cdi::api::cdiconfig::{
    CdiConfig, CdiConfigSpec, CDI_CONFIG_NAME, FEATURE_DATA_VOLUME_CLAIM_ADOPTION,
};
use cdi::cdi::api::datavolume::{
    DataVolume, DataVolumePhase, DataVolumeSource, DataVolumeSpec, HttpSource,
};
use cdi::cdi::k8s::meta::{ObjectMeta, ObjectReference};
use cdi::cdi::k8s::pod::Pod;
use cdi::cdi::k8s::volume::{
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeSpec, PersistentVolumeStatus,
    VOLUME_AVAILABLE,
};
use cdi::cdi::test_support::{add_storage_class, claim_spec, create, sha256_hex, Harness};
use std::collections::HashMap;

const NAMESPACE: &str = "default";
const IMAGE_URL: &str = "http://images.example.com/golden.img";

fn import_dv(name: &str) -> DataVolume {
    DataVolume {
        metadata: ObjectMeta::named(Some(NAMESPACE), name),
        spec: DataVolumeSpec {
            source: Some(DataVolumeSource {
                http: Some(HttpSource {
                    url: IMAGE_URL.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            pvc: Some(claim_spec("1Gi", None)),
            ..Default::default()
        },
        status: None,
    }
}

async fn harness_with_class() -> Harness {
    let harness = Harness::new();
    add_storage_class(&harness.cluster, "standard", "kubevirt.io/hostpath-provisioner", true).await;
    harness.node.serve_http(IMAGE_URL, b"fresh import");
    harness
}

async fn dv_phase(harness: &Harness, name: &str) -> DataVolumePhase {
    harness
        .api::<DataVolume>()
        .get(NAMESPACE, name)
        .await
        .expect("datavolume")
        .phase()
}

#[tokio::test]
async fn scenario_annotated_datavolume_adopts_populated_claim() {
    let harness = harness_with_class().await;
    let existing = b"pre-populated".to_vec();
    harness
        .node
        .create_populated_claim(NAMESPACE, "golden", claim_spec("1Gi", Some("standard")), &existing)
        .await;

    let mut dv = import_dv("golden");
    dv.metadata.set_annotation(ANN_ALLOW_CLAIM_ADOPTION, "true");
    let dv = create(&harness.cluster, &dv).await;
    assert!(harness.settle().await);

    assert_eq!(dv_phase(&harness, "golden").await, DataVolumePhase::Succeeded);
    let claim = harness
        .api::<PersistentVolumeClaim>()
        .get(NAMESPACE, "golden")
        .await
        .expect("claim");
    assert!(claim.metadata.is_controlled_by(dv.metadata.uid()));
    assert_eq!(
        harness.node.image_checksum(NAMESPACE, "golden").await,
        Some(sha256_hex(&existing)),
        "adoption must not re-import"
    );
    let pods = harness.api::<Pod>().list(Some(NAMESPACE), None).await.expect("pods");
    assert!(pods.is_empty(), "no worker pod should run");
    assert!(harness
        .event_reasons(NAMESPACE, "golden")
        .contains(&"ClaimAdopted".to_string()));
}

#[tokio::test]
async fn scenario_foreign_claim_is_left_alone_without_opt_in() {
    let harness = harness_with_class().await;
    let existing = b"someone else's disk".to_vec();
    harness
        .node
        .create_populated_claim(NAMESPACE, "taken", claim_spec("1Gi", Some("standard")), &existing)
        .await;

    create(&harness.cluster, &import_dv("taken")).await;
    assert!(harness.settle().await);

    assert_eq!(dv_phase(&harness, "taken").await, DataVolumePhase::Pending);
    let claim = harness
        .api::<PersistentVolumeClaim>()
        .get(NAMESPACE, "taken")
        .await
        .expect("claim");
    assert!(claim.metadata.controller_ref().is_none());
    assert_eq!(
        harness.node.image_checksum(NAMESPACE, "taken").await,
        Some(sha256_hex(&existing))
    );
    assert!(harness
        .event_reasons(NAMESPACE, "taken")
        .contains(&"ErrClaimNotValid".to_string()));
}

#[tokio::test]
async fn scenario_feature_gate_enables_adoption() {
    let harness = harness_with_class().await;
    create(
        &harness.cluster,
        &CdiConfig {
            metadata: ObjectMeta::named(None, CDI_CONFIG_NAME),
            spec: CdiConfigSpec {
                feature_gates: vec![FEATURE_DATA_VOLUME_CLAIM_ADOPTION.to_string()],
                ..Default::default()
            },
            status: None,
        },
    )
    .await;
    harness
        .node
        .create_populated_claim(NAMESPACE, "gated", claim_spec("1Gi", Some("standard")), b"disk")
        .await;

    create(&harness.cluster, &import_dv("gated")).await;
    assert!(harness.settle().await);

    assert_eq!(dv_phase(&harness, "gated").await, DataVolumePhase::Succeeded);
}

#[tokio::test]
async fn scenario_explicit_opt_out_overrides_feature_gate() {
    let harness = harness_with_class().await;
    create(
        &harness.cluster,
        &CdiConfig {
            metadata: ObjectMeta::named(None, CDI_CONFIG_NAME),
            spec: CdiConfigSpec {
                feature_gates: vec![FEATURE_DATA_VOLUME_CLAIM_ADOPTION.to_string()],
                ..Default::default()
            },
            status: None,
        },
    )
    .await;
    harness
        .node
        .create_populated_claim(NAMESPACE, "refused", claim_spec("1Gi", Some("standard")), b"disk")
        .await;

    let mut dv = import_dv("refused");
    dv.metadata.set_annotation(ANN_ALLOW_CLAIM_ADOPTION, "false");
    create(&harness.cluster, &dv).await;
    assert!(harness.settle().await);

    assert_eq!(dv_phase(&harness, "refused").await, DataVolumePhase::Pending);
}

#[tokio::test]
async fn scenario_undersized_claim_is_not_adopted() {
    let harness = harness_with_class().await;
    harness
        .node
        .create_populated_claim(NAMESPACE, "small", claim_spec("512Mi", Some("standard")), b"disk")
        .await;

    let mut dv = import_dv("small");
    dv.metadata.set_annotation(ANN_ALLOW_CLAIM_ADOPTION, "true");
    create(&harness.cluster, &dv).await;
    assert!(harness.settle().await);

    assert_eq!(dv_phase(&harness, "small").await, DataVolumePhase::Pending);
}

#[tokio::test]
async fn scenario_static_volume_binds_instead_of_importing() {
    let harness = harness_with_class().await;
    create(
        &harness.cluster,
        &PersistentVolume {
            metadata: ObjectMeta::named(None, "nfs-golden"),
            spec: PersistentVolumeSpec {
                capacity: HashMap::from([("storage".to_string(), "1Gi".to_string())]),
                access_modes: vec!["ReadWriteOnce".to_string()],
                storage_class_name: Some("standard".to_string()),
                claim_ref: Some(ObjectReference {
                    kind: Some("PersistentVolumeClaim".to_string()),
                    namespace: Some(NAMESPACE.to_string()),
                    name: Some("static".to_string()),
                    ..Default::default()
                }),
                persistent_volume_reclaim_policy: Some("Retain".to_string()),
                ..Default::default()
            },
            status: Some(PersistentVolumeStatus {
                phase: Some(VOLUME_AVAILABLE.to_string()),
            }),
        },
    )
    .await;

    let mut dv = import_dv("static");
    dv.spec.pvc = Some(claim_spec("1Gi", Some("standard")));
    dv.metadata.set_annotation(ANN_CHECK_STATIC_VOLUME, "true");
    create(&harness.cluster, &dv).await;
    assert!(harness.settle().await);

    assert_eq!(dv_phase(&harness, "static").await, DataVolumePhase::Succeeded);
    let claim = harness
        .api::<PersistentVolumeClaim>()
        .get(NAMESPACE, "static")
        .await
        .expect("claim");
    assert_eq!(claim.spec.volume_name.as_deref(), Some("nfs-golden"));
    assert_eq!(claim.metadata.annotation(ANN_POPULATED_FOR), Some("static"));
    assert!(claim.metadata.annotation(ANN_PERSISTENT_VOLUME_LIST).is_none());
    let pods = harness.api::<Pod>().list(Some(NAMESPACE), None).await.expect("pods");
    assert!(pods.is_empty(), "no worker pod should run");
}
