use cdi::cdi::api::conditions::{find_condition, CONDITION_READY, CONDITION_UP_TO_DATE};
use cdi::cdi::api::dataimportcron::{
    DataImportCron, DataImportCronSpec, REASON_DIGEST_NOT_FOUND, REASON_UP_TO_DATE, RETAIN_NONE,
};
use cdi::cdi::api::datasource::DataSource;
use cdi::cdi::api::datavolume::{
    DataVolume, DataVolumePhase, DataVolumeSource, DataVolumeSpec, DataVolumeTemplate,
    RegistrySource,
};
use cdi::cdi::controller::dataimportcron::{import_name, mark_tick};
use cdi::cdi::k8s::meta::ObjectMeta;
use cdi::cdi::k8s::volume::PersistentVolumeClaim;
use cdi::cdi::test_support::{add_storage_class, claim_spec, create, sha256_hex, Harness};

const NAMESPACE: &str = "golden-images";
const REPOSITORY: &str = "docker://quay.io/containerdisks/fedora";

fn cron(name: &str, managed: &str) -> DataImportCron {
    DataImportCron {
        metadata: ObjectMeta::named(Some(NAMESPACE), name),
        spec: DataImportCronSpec {
            template: DataVolumeTemplate {
                metadata: ObjectMeta::default(),
                spec: DataVolumeSpec {
                    source: Some(DataVolumeSource {
                        registry: Some(RegistrySource {
                            url: Some(REPOSITORY.to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    pvc: Some(claim_spec("1Gi", None)),
                    ..Default::default()
                },
            },
            schedule: "0 */12 * * *".to_string(),
            garbage_collect: Some("Outdated".to_string()),
            imports_to_keep: Some(3),
            managed_data_source: managed.to_string(),
            retention_policy: None,
        },
        status: None,
    }
}

async fn harness() -> Harness {
    let harness = Harness::new();
    add_storage_class(&harness.cluster, "standard", "kubevirt.io/hostpath-provisioner", true).await;
    harness
}

async fn get_cron(harness: &Harness, name: &str) -> DataImportCron {
    harness
        .api::<DataImportCron>()
        .get(NAMESPACE, name)
        .await
        .expect("cron")
}

async fn get_source(harness: &Harness, name: &str) -> DataSource {
    harness
        .api::<DataSource>()
        .get(NAMESPACE, name)
        .await
        .expect("datasource")
}

fn condition_reason(cron: &DataImportCron, kind: &str) -> Option<String> {
    cron.status
        .as_ref()
        .and_then(|status| find_condition(&status.conditions, kind))
        .map(|condition| condition.reason.clone())
}

#[tokio::test]
async fn scenario_cron_imports_latest_digest_into_datasource() {
    let harness = harness().await;
    let image = b"fedora 40".to_vec();
    let digest = harness.node.publish_image(REPOSITORY, &image);

    create(&harness.cluster, &cron("fedora-nightly", "fedora")).await;
    assert!(harness.settle().await);

    let expected = import_name("fedora", &digest).expect("import name");
    let dv = harness
        .api::<DataVolume>()
        .get(NAMESPACE, &expected)
        .await
        .expect("import datavolume");
    assert_eq!(dv.phase(), DataVolumePhase::Succeeded);
    assert_eq!(
        harness.node.image_checksum(NAMESPACE, &expected).await,
        Some(sha256_hex(&image))
    );

    let cron = get_cron(&harness, "fedora-nightly").await;
    assert_eq!(
        condition_reason(&cron, CONDITION_UP_TO_DATE).as_deref(),
        Some(REASON_UP_TO_DATE)
    );
    let status = cron.status.expect("status");
    assert_eq!(
        status.last_imported_pvc.map(|pvc| pvc.name),
        Some(expected.clone())
    );
    assert!(status.last_import_timestamp.is_some());

    let source = get_source(&harness, "fedora").await;
    assert_eq!(source.pvc_source().map(|pvc| pvc.name), Some(expected));
    let ready = find_condition(source.conditions(), CONDITION_READY).expect("ready");
    assert_eq!(ready.status, "True");
}

#[tokio::test]
async fn scenario_new_digest_replaces_and_collects_old_import() {
    let harness = harness().await;
    let first = harness.node.publish_image(REPOSITORY, b"fedora 40");
    let mut nightly = cron("fedora-nightly", "fedora");
    nightly.spec.imports_to_keep = Some(1);
    create(&harness.cluster, &nightly).await;
    assert!(harness.settle().await);

    let updated = b"fedora 40 respin".to_vec();
    let second = harness.node.publish_image(REPOSITORY, &updated);
    mark_tick(&harness.client(), NAMESPACE, "fedora-nightly")
        .await
        .expect("tick");
    assert!(harness.settle().await);

    let old_name = import_name("fedora", &first).expect("old name");
    let new_name = import_name("fedora", &second).expect("new name");
    let dvs = harness.api::<DataVolume>();
    assert!(dvs.get_opt(NAMESPACE, &old_name).await.expect("lookup").is_none());
    assert_eq!(
        dvs.get(NAMESPACE, &new_name).await.expect("new import").phase(),
        DataVolumePhase::Succeeded
    );
    assert_eq!(
        harness.node.image_checksum(NAMESPACE, &new_name).await,
        Some(sha256_hex(&updated))
    );
    let source = get_source(&harness, "fedora").await;
    assert_eq!(source.pvc_source().map(|pvc| pvc.name), Some(new_name));
}

#[tokio::test]
async fn scenario_unchanged_digest_does_not_reimport() {
    let harness = harness().await;
    let digest = harness.node.publish_image(REPOSITORY, b"fedora 40");
    create(&harness.cluster, &cron("fedora-nightly", "fedora")).await;
    assert!(harness.settle().await);

    mark_tick(&harness.client(), NAMESPACE, "fedora-nightly")
        .await
        .expect("tick");
    assert!(harness.settle().await);

    let dvs = harness
        .api::<DataVolume>()
        .list(Some(NAMESPACE), None)
        .await
        .expect("datavolumes");
    assert_eq!(dvs.len(), 1);
    assert_eq!(dvs[0].metadata.name(), import_name("fedora", &digest).expect("name"));
    let cron = get_cron(&harness, "fedora-nightly").await;
    assert!(cron.status.and_then(|status| status.last_execution_timestamp).is_some());
}

#[tokio::test]
async fn scenario_missing_image_reports_digest_not_found() {
    let harness = harness().await;
    create(&harness.cluster, &cron("fedora-nightly", "fedora")).await;
    assert!(harness.settle().await);

    let cron = get_cron(&harness, "fedora-nightly").await;
    assert_eq!(
        condition_reason(&cron, CONDITION_UP_TO_DATE).as_deref(),
        Some(REASON_DIGEST_NOT_FOUND)
    );
    assert!(harness
        .event_reasons(NAMESPACE, "fedora-nightly")
        .contains(&"DigestNotFound".to_string()));
    let dvs = harness
        .api::<DataVolume>()
        .list(Some(NAMESPACE), None)
        .await
        .expect("datavolumes");
    assert!(dvs.is_empty());
}

#[tokio::test]
async fn scenario_invalid_schedule_is_reported() {
    let harness = harness().await;
    harness.node.publish_image(REPOSITORY, b"fedora 40");
    let mut broken = cron("broken", "fedora");
    broken.spec.schedule = "every tuesday".to_string();
    create(&harness.cluster, &broken).await;
    assert!(harness.settle().await);

    assert!(harness
        .event_reasons(NAMESPACE, "broken")
        .contains(&"ErrInvalidSchedule".to_string()));
    let dvs = harness
        .api::<DataVolume>()
        .list(Some(NAMESPACE), None)
        .await
        .expect("datavolumes");
    assert!(dvs.is_empty());
}

#[tokio::test]
async fn scenario_second_cron_cannot_take_managed_datasource() {
    let harness = harness().await;
    harness.node.publish_image(REPOSITORY, b"fedora 40");
    create(&harness.cluster, &cron("first", "fedora")).await;
    assert!(harness.settle().await);

    create(&harness.cluster, &cron("second", "fedora")).await;
    assert!(harness.settle().await);

    assert!(harness
        .event_reasons(NAMESPACE, "second")
        .contains(&"ErrDataSourceAlreadyManaged".to_string()));
    let source = get_source(&harness, "fedora").await;
    assert_eq!(
        source.metadata.label("cdi.kubevirt.io/dataImportCron"),
        Some("first")
    );
}

#[tokio::test]
async fn scenario_retain_none_removes_imports_with_cron() {
    let harness = harness().await;
    harness.node.publish_image(REPOSITORY, b"fedora 40");
    let mut nightly = cron("fedora-nightly", "fedora");
    nightly.spec.retention_policy = Some(RETAIN_NONE.to_string());
    create(&harness.cluster, &nightly).await;
    assert!(harness.settle().await);
    assert!(!harness
        .api::<DataVolume>()
        .list(Some(NAMESPACE), None)
        .await
        .expect("datavolumes")
        .is_empty());

    harness
        .api::<DataImportCron>()
        .delete(NAMESPACE, "fedora-nightly")
        .await
        .expect("delete cron");
    assert!(harness.settle().await);

    let crons = harness.api::<DataImportCron>();
    assert!(crons.get_opt(NAMESPACE, "fedora-nightly").await.expect("lookup").is_none());
    assert!(harness
        .api::<DataVolume>()
        .list(Some(NAMESPACE), None)
        .await
        .expect("datavolumes")
        .is_empty());
    assert!(harness
        .api::<DataSource>()
        .get_opt(NAMESPACE, "fedora")
        .await
        .expect("lookup")
        .is_none());
    assert!(harness
        .api::<PersistentVolumeClaim>()
        .list(Some(NAMESPACE), None)
        .await
        .expect("claims")
        .is_empty());
}
