use cdi::cdi::api::annotations::{
    ANN_DELETE_AFTER_COMPLETION, ANN_POPULATED_FOR, ANN_SOURCE, ANN_UPLOAD_REQUEST,
};
use cdi::cdi::api::cdiconfig::{
    CdiConfig, CdiConfigSpec, CDI_CONFIG_NAME, FEATURE_HONOR_WAIT_FOR_FIRST_CONSUMER,
};
use cdi::cdi::api::datavolume::{
    DataVolume, DataVolumePhase, DataVolumeSource, DataVolumeSpec, EmptySource, HttpSource,
};
use cdi::cdi::k8s::meta::ObjectMeta;
use cdi::cdi::k8s::pod::Pod;
use cdi::cdi::k8s::volume::{PersistentVolumeClaim, TypedObjectReference};
use cdi::cdi::test_support::{
    add_csi_driver, add_storage_class, claim_spec, create, sha256_hex, storage_class, wait_for_first_consumer,
    Harness,
};

const NAMESPACE: &str = "default";
const IMAGE_URL: &str = "http://images.example.com/fedora.qcow2";

fn data_volume(name: &str, source: DataVolumeSource) -> DataVolume {
    DataVolume {
        metadata: ObjectMeta::named(Some(NAMESPACE), name),
        spec: DataVolumeSpec {
            source: Some(source),
            pvc: Some(claim_spec("1Gi", None)),
            ..Default::default()
        },
        status: None,
    }
}

fn http_source(url: &str) -> DataVolumeSource {
    DataVolumeSource {
        http: Some(HttpSource {
            url: url.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

async fn phase_of(harness: &Harness, name: &str) -> DataVolumePhase {
    harness
        .api::<DataVolume>()
        .get(NAMESPACE, name)
        .await
        .expect("datavolume")
        .phase()
}

#[tokio::test]
async fn scenario_http_import_populates_claim() {
    let harness = Harness::new();
    add_storage_class(&harness.cluster, "standard", "kubevirt.io/hostpath-provisioner", true).await;
    let image = b"QFI\xfb fedora image bytes".to_vec();
    harness.node.serve_http(IMAGE_URL, &image);

    create(&harness.cluster, &data_volume("fedora", http_source(IMAGE_URL))).await;
    assert!(harness.settle().await, "cluster never settled");

    let dv = harness
        .api::<DataVolume>()
        .get(NAMESPACE, "fedora")
        .await
        .expect("datavolume");
    assert_eq!(dv.phase(), DataVolumePhase::Succeeded);
    let status = dv.status.expect("status");
    assert_eq!(status.progress, "100.0%");
    assert_eq!(status.claim_name.as_deref(), Some("fedora"));

    let claim = harness
        .api::<PersistentVolumeClaim>()
        .get(NAMESPACE, "fedora")
        .await
        .expect("claim");
    assert!(claim.is_bound());
    assert!(claim.metadata.is_controlled_by(dv.metadata.uid()));
    assert_eq!(claim.metadata.annotation(ANN_SOURCE), Some("http"));
    assert_eq!(
        harness.node.image_checksum(NAMESPACE, "fedora").await,
        Some(sha256_hex(&image))
    );

    let pods = harness
        .api::<Pod>()
        .list(Some(NAMESPACE), None)
        .await
        .expect("pods");
    assert!(pods.is_empty(), "importer pod should be removed after success");
    assert!(harness
        .event_reasons(NAMESPACE, "fedora")
        .contains(&"ImportSucceeded".to_string()));
}

#[tokio::test]
async fn scenario_unreachable_source_fails_import() {
    let harness = Harness::new();
    add_storage_class(&harness.cluster, "standard", "kubevirt.io/hostpath-provisioner", true).await;

    create(
        &harness.cluster,
        &data_volume("missing", http_source("http://images.example.com/absent.img")),
    )
    .await;
    assert!(harness.settle().await);

    assert_eq!(phase_of(&harness, "missing").await, DataVolumePhase::Failed);
    assert!(harness
        .event_reasons(NAMESPACE, "missing")
        .contains(&"Failed".to_string()));
    assert_eq!(harness.node.image_checksum(NAMESPACE, "missing").await, None);
}

#[tokio::test]
async fn scenario_blank_volume_is_created_empty() {
    let harness = Harness::new();
    add_storage_class(&harness.cluster, "standard", "kubevirt.io/hostpath-provisioner", true).await;
    let blank = DataVolumeSource {
        blank: Some(EmptySource {}),
        ..Default::default()
    };

    create(&harness.cluster, &data_volume("scratch", blank)).await;
    assert!(harness.settle().await);

    assert_eq!(phase_of(&harness, "scratch").await, DataVolumePhase::Succeeded);
    assert_eq!(
        harness.node.read_file(NAMESPACE, "scratch", "disk.img").await,
        Some(Vec::new())
    );
}

#[tokio::test]
async fn scenario_upload_waits_for_client_then_succeeds() {
    let harness = Harness::new();
    add_storage_class(&harness.cluster, "standard", "kubevirt.io/hostpath-provisioner", true).await;
    let upload = DataVolumeSource {
        upload: Some(EmptySource {}),
        ..Default::default()
    };

    create(&harness.cluster, &data_volume("uploaded", upload)).await;
    assert!(harness.settle().await);
    assert_eq!(phase_of(&harness, "uploaded").await, DataVolumePhase::UploadReady);
    let claim = harness
        .api::<PersistentVolumeClaim>()
        .get(NAMESPACE, "uploaded")
        .await
        .expect("claim");
    assert!(claim.metadata.annotation(ANN_UPLOAD_REQUEST).is_some());

    let content = b"uploaded disk".to_vec();
    assert!(harness.node.complete_upload(NAMESPACE, "uploaded", &content).await);
    assert!(harness.settle().await);

    assert_eq!(phase_of(&harness, "uploaded").await, DataVolumePhase::Succeeded);
    assert_eq!(
        harness.node.image_checksum(NAMESPACE, "uploaded").await,
        Some(sha256_hex(&content))
    );
    assert!(harness
        .event_reasons(NAMESPACE, "uploaded")
        .contains(&"UploadSucceeded".to_string()));
}

#[tokio::test]
async fn scenario_delayed_binding_is_honored_when_gated() {
    let harness = Harness::new();
    create(
        &harness.cluster,
        &wait_for_first_consumer(storage_class("local", "kubevirt.io/hostpath-provisioner")),
    )
    .await;
    create(
        &harness.cluster,
        &CdiConfig {
            metadata: ObjectMeta::named(None, CDI_CONFIG_NAME),
            spec: CdiConfigSpec {
                feature_gates: vec![FEATURE_HONOR_WAIT_FOR_FIRST_CONSUMER.to_string()],
                ..Default::default()
            },
            status: None,
        },
    )
    .await;
    harness.node.serve_http(IMAGE_URL, b"image");

    let mut dv = data_volume("delayed", http_source(IMAGE_URL));
    dv.spec.pvc = Some(claim_spec("1Gi", Some("local")));
    create(&harness.cluster, &dv).await;
    assert!(harness.settle().await);

    assert_eq!(
        phase_of(&harness, "delayed").await,
        DataVolumePhase::WaitForFirstConsumer
    );
    let claim = harness
        .api::<PersistentVolumeClaim>()
        .get(NAMESPACE, "delayed")
        .await
        .expect("claim");
    assert!(!claim.is_bound());
}

#[tokio::test]
async fn scenario_delayed_binding_is_consumed_without_gate() {
    let harness = Harness::new();
    create(
        &harness.cluster,
        &wait_for_first_consumer(storage_class("local", "kubevirt.io/hostpath-provisioner")),
    )
    .await;
    let image = b"image".to_vec();
    harness.node.serve_http(IMAGE_URL, &image);

    let mut dv = data_volume("eager", http_source(IMAGE_URL));
    dv.spec.pvc = Some(claim_spec("1Gi", Some("local")));
    create(&harness.cluster, &dv).await;
    assert!(harness.settle().await);

    assert_eq!(phase_of(&harness, "eager").await, DataVolumePhase::Succeeded);
    assert_eq!(
        harness.node.image_checksum(NAMESPACE, "eager").await,
        Some(sha256_hex(&image))
    );
}

fn ttl_config(seconds: i32) -> CdiConfig {
    CdiConfig {
        metadata: ObjectMeta::named(None, CDI_CONFIG_NAME),
        spec: CdiConfigSpec {
            data_volume_ttl_seconds: Some(seconds),
            ..Default::default()
        },
        status: None,
    }
}

#[tokio::test]
async fn scenario_completed_datavolume_is_garbage_collected() {
    let harness = Harness::new();
    add_storage_class(&harness.cluster, "standard", "kubevirt.io/hostpath-provisioner", true).await;
    create(&harness.cluster, &ttl_config(0)).await;
    harness.node.serve_http(IMAGE_URL, b"image");

    create(&harness.cluster, &data_volume("collected", http_source(IMAGE_URL))).await;
    assert!(harness.settle().await);

    let gone = harness
        .api::<DataVolume>()
        .get_opt(NAMESPACE, "collected")
        .await
        .expect("lookup");
    assert!(gone.is_none());
    let claim = harness
        .api::<PersistentVolumeClaim>()
        .get(NAMESPACE, "collected")
        .await
        .expect("claim survives its datavolume");
    assert_eq!(claim.metadata.annotation(ANN_POPULATED_FOR), Some("collected"));
    assert!(claim.metadata.controller_ref().is_none());
    assert!(harness
        .event_reasons(NAMESPACE, "collected")
        .contains(&"GarbageCollected".to_string()));
}

#[tokio::test]
async fn scenario_garbage_collection_opt_out_keeps_datavolume() {
    let harness = Harness::new();
    add_storage_class(&harness.cluster, "standard", "kubevirt.io/hostpath-provisioner", true).await;
    create(&harness.cluster, &ttl_config(0)).await;
    harness.node.serve_http(IMAGE_URL, b"image");

    let mut dv = data_volume("kept", http_source(IMAGE_URL));
    dv.metadata.set_annotation(ANN_DELETE_AFTER_COMPLETION, "false");
    create(&harness.cluster, &dv).await;
    assert!(harness.settle().await);

    assert_eq!(phase_of(&harness, "kept").await, DataVolumePhase::Succeeded);
}

fn external_dv(name: &str) -> DataVolume {
    let mut template = claim_spec("1Gi", Some("ceph"));
    template.data_source_ref = Some(TypedObjectReference {
        api_group: Some("forklift.konveyor.io".to_string()),
        kind: "OvirtVolumePopulator".to_string(),
        name: "disk-1".to_string(),
        namespace: None,
    });
    DataVolume {
        metadata: ObjectMeta::named(Some(NAMESPACE), name),
        spec: DataVolumeSpec {
            pvc: Some(template),
            ..Default::default()
        },
        status: None,
    }
}

#[tokio::test]
async fn scenario_external_populator_claim_is_handed_to_storage() {
    let harness = Harness::new();
    add_storage_class(&harness.cluster, "ceph", "rbd.csi.ceph.com", false).await;
    add_csi_driver(&harness.cluster, "rbd.csi.ceph.com", false).await;

    create(&harness.cluster, &external_dv("ovirt")).await;
    assert!(harness.settle().await);

    assert_eq!(phase_of(&harness, "ovirt").await, DataVolumePhase::Succeeded);
    let claim = harness
        .api::<PersistentVolumeClaim>()
        .get(NAMESPACE, "ovirt")
        .await
        .expect("claim");
    assert!(claim.is_bound());
    let reference = claim.spec.data_source_ref.expect("data source ref kept");
    assert_eq!(reference.kind, "OvirtVolumePopulator");
    let pods = harness.api::<Pod>().list(Some(NAMESPACE), None).await.expect("pods");
    assert!(pods.is_empty());
}

#[tokio::test]
async fn scenario_external_population_needs_any_volume_data_source() {
    let harness = Harness::new();
    harness.cluster.set_preserve_data_source_ref(false);
    add_storage_class(&harness.cluster, "ceph", "rbd.csi.ceph.com", false).await;
    add_csi_driver(&harness.cluster, "rbd.csi.ceph.com", false).await;

    create(&harness.cluster, &external_dv("ovirt")).await;
    assert!(harness.settle().await);

    assert_eq!(phase_of(&harness, "ovirt").await, DataVolumePhase::Pending);
    assert!(harness
        .event_reasons(NAMESPACE, "ovirt")
        .contains(&"NoAnyVolumeDataSource".to_string()));
    let claim = harness
        .api::<PersistentVolumeClaim>()
        .get_opt(NAMESPACE, "ovirt")
        .await
        .expect("lookup");
    assert!(claim.is_none());
}

#[tokio::test]
async fn scenario_external_population_needs_csi_storage() {
    let harness = Harness::new();
    add_storage_class(&harness.cluster, "ceph", "rbd.csi.ceph.com", false).await;

    create(&harness.cluster, &external_dv("ovirt")).await;
    assert!(harness.settle().await);

    assert_eq!(phase_of(&harness, "ovirt").await, DataVolumePhase::Pending);
    assert!(harness
        .event_reasons(NAMESPACE, "ovirt")
        .contains(&"NoCSIDriverForExternalPopulation".to_string()));
}
