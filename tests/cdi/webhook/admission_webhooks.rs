use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cdi::cdi::api::annotations::ANN_CLONE_TOKEN;
use cdi::cdi::api::dataimportcron::{DataImportCron, DataImportCronSpec, DEFAULT_IMPORTS_TO_KEEP};
use cdi::cdi::api::datavolume::{
    DataVolume, DataVolumeSource, DataVolumeSpec, DataVolumeTemplate, EmptySource, HttpSource,
    NamespacedSource, RegistrySource,
};
use cdi::cdi::api::transfer::{ObjectTransfer, ObjectTransferSpec, TransferSource, TransferTarget};
use cdi::cdi::client::memory::InMemoryCluster;
use cdi::cdi::client::ClusterClient;
use cdi::cdi::k8s::admission::{
    AdmissionRequest, AdmissionResponse, AdmissionReview, GroupVersionResource, UserInfo,
};
use cdi::cdi::k8s::meta::ObjectMeta;
use cdi::cdi::k8s::volume::PersistentVolumeClaim;
use cdi::cdi::storage::ProfileRegistry;
use cdi::cdi::test_support::{claim_spec, create, TEST_NAMESPACE};
use cdi::cdi::token::keys::KeyStore;
use cdi::cdi::webhook::{review, AdmissionContext, Webhook, CDI_GROUP};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

const SOURCE_NS: &str = "golden-images";
const TARGET_NS: &str = "tenant";

struct Fixture {
    cluster: Arc<InMemoryCluster>,
    keys: Arc<KeyStore>,
    ctx: AdmissionContext,
}

async fn fixture() -> Fixture {
    let cluster = InMemoryCluster::new();
    let client: Arc<dyn ClusterClient> = cluster.clone();
    let keys = Arc::new(KeyStore::new(Arc::clone(&client), TEST_NAMESPACE));
    keys.ensure_signing_key().await.expect("signing key");
    let profiles = Arc::new(ProfileRegistry::new(Arc::clone(&client)));
    let ctx = AdmissionContext::new(client, Arc::clone(&keys), profiles);
    Fixture { cluster, keys, ctx }
}

fn request<T: Serialize>(
    resource: &str,
    operation: &str,
    namespace: &str,
    name: &str,
    object: &T,
    old: Option<&T>,
) -> AdmissionReview {
    AdmissionReview::for_request(AdmissionRequest {
        uid: format!("{resource}-{name}"),
        resource: GroupVersionResource {
            group: CDI_GROUP.to_string(),
            version: "v1beta1".to_string(),
            resource: resource.to_string(),
        },
        name: name.to_string(),
        namespace: namespace.to_string(),
        operation: operation.to_string(),
        user_info: UserInfo {
            username: "alice".to_string(),
            ..Default::default()
        },
        object: Some(serde_json::to_value(object).expect("object")),
        old_object: old.map(|old| serde_json::to_value(old).expect("old object")),
        ..Default::default()
    })
}

async fn respond(fixture: &Fixture, hook: Webhook, request: AdmissionReview) -> AdmissionResponse {
    let uid = request.request.as_ref().map(|r| r.uid.clone()).unwrap_or_default();
    let answered = review(&fixture.ctx, hook, request).await;
    let response = answered.response.expect("response");
    assert_eq!(response.uid, uid);
    response
}

fn message(response: &AdmissionResponse) -> String {
    response
        .status
        .as_ref()
        .and_then(|status| status.message.clone())
        .unwrap_or_default()
}

fn patch_operations(response: &AdmissionResponse) -> Vec<Value> {
    let encoded = response.patch.as_deref().expect("patch");
    let bytes = STANDARD.decode(encoded).expect("base64 patch");
    serde_json::from_slice(&bytes).expect("json patch")
}

/// Value the patch writes to `field` under `parent`, whether it adds the
/// parent map or only the field.
fn patched_field(operations: &[Value], parent: &str, field: &str) -> Option<Value> {
    let escaped = field.replace('~', "~0").replace('/', "~1");
    operations.iter().find_map(|operation| {
        let path = operation.get("path")?.as_str()?;
        let value = operation.get("value")?;
        if path == format!("{parent}/{escaped}") {
            Some(value.clone())
        } else if path == parent {
            value.get(field).cloned()
        } else {
            None
        }
    })
}

fn http_dv(namespace: &str, name: &str) -> DataVolume {
    DataVolume {
        metadata: ObjectMeta::named(Some(namespace), name),
        spec: DataVolumeSpec {
            source: Some(DataVolumeSource {
                http: Some(HttpSource {
                    url: "https://images.example.com/fedora.qcow2".to_string(),
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

fn clone_dv(name: &str) -> DataVolume {
    DataVolume {
        metadata: ObjectMeta::named(Some(TARGET_NS), name),
        spec: DataVolumeSpec {
            source: Some(DataVolumeSource {
                pvc: Some(NamespacedSource {
                    namespace: SOURCE_NS.to_string(),
                    name: "fedora".to_string(),
                }),
                ..Default::default()
            }),
            pvc: Some(claim_spec("1Gi", None)),
            ..Default::default()
        },
        status: None,
    }
}

async fn add_source_claim(fixture: &Fixture) {
    create(
        &fixture.cluster,
        &PersistentVolumeClaim {
            metadata: ObjectMeta::named(Some(SOURCE_NS), "fedora"),
            spec: claim_spec("1Gi", None),
            status: None,
        },
    )
    .await;
}

fn cron(name: &str) -> DataImportCron {
    DataImportCron {
        metadata: ObjectMeta::named(Some(TEST_NAMESPACE), name),
        spec: DataImportCronSpec {
            template: DataVolumeTemplate {
                metadata: ObjectMeta::default(),
                spec: DataVolumeSpec {
                    source: Some(DataVolumeSource {
                        registry: Some(RegistrySource {
                            url: Some("docker://quay.io/containerdisks/fedora".to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    storage: Some(claim_spec("5Gi", None)),
                    ..Default::default()
                },
            },
            schedule: "30 1 * * *".to_string(),
            garbage_collect: None,
            imports_to_keep: None,
            managed_data_source: "fedora".to_string(),
            retention_policy: None,
        },
        status: None,
    }
}

fn claim_transfer(name: &str, target_namespace: &str) -> ObjectTransfer {
    ObjectTransfer {
        metadata: ObjectMeta::named(None, name),
        spec: ObjectTransferSpec {
            source: TransferSource {
                kind: "PersistentVolumeClaim".to_string(),
                namespace: SOURCE_NS.to_string(),
                name: "fedora".to_string(),
                ..Default::default()
            },
            target: TransferTarget {
                namespace: Some(target_namespace.to_string()),
                name: None,
            },
            parent_name: None,
        },
        status: None,
    }
}

#[tokio::test]
async fn datavolume_with_single_source_is_admitted() {
    let fixture = fixture().await;
    let dv = http_dv(TARGET_NS, "fedora");
    let response = respond(
        &fixture,
        Webhook::DataVolumeValidate,
        request("datavolumes", "CREATE", TARGET_NS, "fedora", &dv, None),
    )
    .await;
    assert!(response.allowed, "{}", message(&response));
}

#[tokio::test]
async fn datavolume_with_two_sources_is_rejected() {
    let fixture = fixture().await;
    let mut dv = http_dv(TARGET_NS, "fedora");
    if let Some(source) = dv.spec.source.as_mut() {
        source.blank = Some(EmptySource {});
    }
    let response = respond(
        &fixture,
        Webhook::DataVolumeValidate,
        request("datavolumes", "CREATE", TARGET_NS, "fedora", &dv, None),
    )
    .await;
    assert!(!response.allowed);
    assert_eq!(message(&response), "Multiple Data volume sources");
    assert_eq!(response.status.and_then(|status| status.code), Some(422));
}

#[tokio::test]
async fn datavolume_spec_cannot_change_after_creation() {
    let fixture = fixture().await;
    let old = http_dv(TARGET_NS, "fedora");
    let mut new = old.clone();
    if let Some(http) = new.spec.source.as_mut().and_then(|source| source.http.as_mut()) {
        http.url = "https://images.example.com/centos.qcow2".to_string();
    }
    let response = respond(
        &fixture,
        Webhook::DataVolumeValidate,
        request("datavolumes", "UPDATE", TARGET_NS, "fedora", &new, Some(&old)),
    )
    .await;
    assert!(!response.allowed);
    assert_eq!(message(&response), "Cannot update DataVolume Spec");
}

#[tokio::test]
async fn datavolume_over_foreign_claim_is_rejected() {
    let fixture = fixture().await;
    create(
        &fixture.cluster,
        &PersistentVolumeClaim {
            metadata: ObjectMeta::named(Some(TARGET_NS), "fedora"),
            spec: claim_spec("1Gi", None),
            status: None,
        },
    )
    .await;
    let dv = http_dv(TARGET_NS, "fedora");
    let response = respond(
        &fixture,
        Webhook::DataVolumeValidate,
        request("datavolumes", "CREATE", TARGET_NS, "fedora", &dv, None),
    )
    .await;
    assert!(!response.allowed);
    assert_eq!(message(&response), format!("Destination PVC {TARGET_NS}/fedora already exists"));
}

#[tokio::test]
async fn cross_namespace_clone_gets_token_that_validation_accepts() {
    let fixture = fixture().await;
    add_source_claim(&fixture).await;
    let dv = clone_dv("copy");

    let mutated = respond(
        &fixture,
        Webhook::DataVolumeMutate,
        request("datavolumes", "CREATE", TARGET_NS, "copy", &dv, None),
    )
    .await;
    assert!(mutated.allowed, "{}", message(&mutated));
    let operations = patch_operations(&mutated);
    let token = patched_field(&operations, "/metadata/annotations", ANN_CLONE_TOKEN)
        .and_then(|value| value.as_str().map(str::to_string))
        .expect("clone token in patch");

    let validator = fixture.keys.clone_token_validator().await.expect("validator");
    let payload = validator.validate(&token).expect("valid token");
    payload
        .verify_clone(SOURCE_NS, "fedora", TARGET_NS, "copy", None)
        .expect("token for this pair");

    let mut tokened = dv.clone();
    tokened.metadata.set_annotation(ANN_CLONE_TOKEN, &token);
    let validated = respond(
        &fixture,
        Webhook::DataVolumeValidate,
        request("datavolumes", "CREATE", TARGET_NS, "copy", &tokened, None),
    )
    .await;
    assert!(validated.allowed, "{}", message(&validated));
}

#[tokio::test]
async fn clone_is_refused_when_user_cannot_read_source() {
    let fixture = fixture().await;
    add_source_claim(&fixture).await;
    fixture.cluster.set_access_policy(|spec| {
        let namespace = spec
            .resource_attributes
            .as_ref()
            .and_then(|attributes| attributes.namespace.as_deref());
        if namespace == Some(SOURCE_NS) {
            Err("alice cannot clone golden images".to_string())
        } else {
            Ok(())
        }
    });

    let response = respond(
        &fixture,
        Webhook::DataVolumeMutate,
        request("datavolumes", "CREATE", TARGET_NS, "copy", &clone_dv("copy"), None),
    )
    .await;
    assert!(!response.allowed);
    assert!(response.patch.is_none());
    assert_eq!(message(&response), "alice cannot clone golden images");
}

#[tokio::test]
async fn clone_without_token_fails_validation() {
    let fixture = fixture().await;
    add_source_claim(&fixture).await;
    let response = respond(
        &fixture,
        Webhook::DataVolumeValidate,
        request("datavolumes", "CREATE", TARGET_NS, "copy", &clone_dv("copy"), None),
    )
    .await;
    assert!(!response.allowed);
    assert_eq!(message(&response), "Clone token is missing for a cross-namespace clone");
}

#[tokio::test]
async fn clone_of_missing_claim_is_rejected() {
    let fixture = fixture().await;
    let response = respond(
        &fixture,
        Webhook::DataVolumeValidate,
        request("datavolumes", "CREATE", TARGET_NS, "copy", &clone_dv("copy"), None),
    )
    .await;
    assert!(!response.allowed);
    assert_eq!(message(&response), format!("Source PVC {SOURCE_NS}/fedora doesn't exist"));
}

#[tokio::test]
async fn cron_defaults_are_filled_on_create() {
    let fixture = fixture().await;
    let response = respond(
        &fixture,
        Webhook::DataImportCronMutate,
        request("dataimportcrons", "CREATE", TEST_NAMESPACE, "fedora", &cron("fedora"), None),
    )
    .await;
    assert!(response.allowed);
    let operations = patch_operations(&response);
    assert_eq!(
        patched_field(&operations, "/spec", "importsToKeep"),
        Some(Value::from(DEFAULT_IMPORTS_TO_KEEP))
    );
    assert_eq!(
        patched_field(&operations, "/spec", "garbageCollect"),
        Some(Value::from("Outdated"))
    );
}

#[tokio::test]
async fn cron_with_illegal_schedule_is_rejected() {
    let fixture = fixture().await;
    let mut invalid = cron("fedora");
    invalid.spec.schedule = "every tuesday".to_string();
    let response = respond(
        &fixture,
        Webhook::DataImportCronValidate,
        request("dataimportcrons", "CREATE", TEST_NAMESPACE, "fedora", &invalid, None),
    )
    .await;
    assert!(!response.allowed);
    assert!(message(&response).starts_with("Illegal cron schedule"));
}

#[tokio::test]
async fn cron_needs_a_registry_source() {
    let fixture = fixture().await;
    let mut http = cron("fedora");
    http.spec.template.spec.source = http_dv(TEST_NAMESPACE, "fedora").spec.source;
    let response = respond(
        &fixture,
        Webhook::DataImportCronValidate,
        request("dataimportcrons", "CREATE", TEST_NAMESPACE, "fedora", &http, None),
    )
    .await;
    assert!(!response.allowed);
    assert_eq!(message(&response), "Only registry sources are supported by DataImportCron");
}

#[tokio::test]
async fn transfer_spec_is_immutable() {
    let fixture = fixture().await;
    let old = claim_transfer("move", TARGET_NS);
    let new = claim_transfer("move", "elsewhere");
    let response = respond(
        &fixture,
        Webhook::ObjectTransferValidate,
        request("objecttransfers", "UPDATE", "", "move", &new, Some(&old)),
    )
    .await;
    assert!(!response.allowed);
    assert_eq!(message(&response), "ObjectTransfer spec is immutable");

    let unchanged = respond(
        &fixture,
        Webhook::ObjectTransferValidate,
        request("objecttransfers", "UPDATE", "", "move", &old, Some(&old)),
    )
    .await;
    assert!(unchanged.allowed);
}

#[tokio::test]
async fn transfer_onto_existing_claim_is_rejected() {
    let fixture = fixture().await;
    create(
        &fixture.cluster,
        &PersistentVolumeClaim {
            metadata: ObjectMeta::named(Some(TARGET_NS), "fedora"),
            spec: claim_spec("1Gi", None),
            status: None,
        },
    )
    .await;
    let response = respond(
        &fixture,
        Webhook::ObjectTransferValidate,
        request("objecttransfers", "CREATE", "", "move", &claim_transfer("move", TARGET_NS), None),
    )
    .await;
    assert!(!response.allowed);
    assert_eq!(
        message(&response),
        format!("PersistentVolumeClaim {TARGET_NS}/fedora already exists")
    );
}

#[tokio::test]
async fn second_transfer_of_same_source_is_rejected() {
    let fixture = fixture().await;
    create(&fixture.cluster, &claim_transfer("first", TARGET_NS)).await;
    let response = respond(
        &fixture,
        Webhook::ObjectTransferValidate,
        request("objecttransfers", "CREATE", "", "second", &claim_transfer("second", "elsewhere"), None),
    )
    .await;
    assert!(!response.allowed);
    assert_eq!(message(&response), "Source is already being transferred by first");
}

#[tokio::test]
async fn review_without_request_is_an_error() {
    let fixture = fixture().await;
    let answered = review(&fixture.ctx, Webhook::DataVolumeValidate, AdmissionReview::default()).await;
    let response = answered.response.expect("response");
    assert!(!response.allowed);
    assert_eq!(message(&response), "AdmissionReview.Request is nil");
    assert!(!answered.api_version.is_empty());
}
