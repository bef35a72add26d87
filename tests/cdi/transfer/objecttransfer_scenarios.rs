use cdi::cdi::api::annotations::ANN_OBJECT_TRANSFER_NAME;
use cdi::cdi::api::conditions::{find_condition, CONDITION_COMPLETE};
use cdi::cdi::api::transfer::{
    ObjectTransfer, ObjectTransferSpec, TransferPhase, TransferSource, TransferTarget,
};
use cdi::cdi::controller::transfer::FINALIZER;
use cdi::cdi::k8s::meta::ObjectMeta;
use cdi::cdi::k8s::pod::{
    Container, PersistentVolumeClaimVolumeSource, Pod, PodSpec, Volume,
};
use cdi::cdi::k8s::volume::{PersistentVolume, PersistentVolumeClaim};
use cdi::cdi::test_support::{add_storage_class, claim_spec, create, sha256_hex, Harness};
use std::collections::HashMap;

const SOURCE_NS: &str = "staging";
const TARGET_NS: &str = "production";

fn transfer(name: &str, claim: &str, target_namespace: Option<&str>, target_name: Option<&str>) -> ObjectTransfer {
    ObjectTransfer {
        metadata: ObjectMeta::named(None, name),
        spec: ObjectTransferSpec {
            source: TransferSource {
                kind: "PersistentVolumeClaim".to_string(),
                namespace: SOURCE_NS.to_string(),
                name: claim.to_string(),
                required_annotations: HashMap::new(),
            },
            target: TransferTarget {
                namespace: target_namespace.map(str::to_string),
                name: target_name.map(str::to_string),
            },
            parent_name: None,
        },
        status: None,
    }
}

async fn harness_with_disk(content: &[u8]) -> Harness {
    let harness = Harness::new();
    add_storage_class(&harness.cluster, "standard", "kubevirt.io/hostpath-provisioner", true).await;
    harness
        .node
        .create_populated_claim(SOURCE_NS, "disk", claim_spec("1Gi", Some("standard")), content)
        .await;
    harness
}

async fn get_transfer(harness: &Harness, name: &str) -> ObjectTransfer {
    harness
        .api::<ObjectTransfer>()
        .get("", name)
        .await
        .expect("transfer")
}

fn complete_message(transfer: &ObjectTransfer) -> Option<String> {
    transfer
        .status
        .as_ref()
        .and_then(|status| find_condition(&status.conditions, CONDITION_COMPLETE))
        .map(|condition| condition.message.clone())
}

#[tokio::test]
async fn scenario_claim_moves_to_another_namespace() {
    let content = b"staging database".to_vec();
    let harness = harness_with_disk(&content).await;
    let volume_name = harness
        .api::<PersistentVolumeClaim>()
        .get(SOURCE_NS, "disk")
        .await
        .expect("claim")
        .spec
        .volume_name
        .expect("bound volume");

    create(&harness.cluster, &transfer("promote", "disk", Some(TARGET_NS), None)).await;
    assert!(harness.settle().await);

    let done = get_transfer(&harness, "promote").await;
    assert_eq!(done.phase(), TransferPhase::Complete);
    assert!(!done.metadata.finalizers.iter().any(|finalizer| finalizer == FINALIZER));
    assert!(done.status.expect("status").data.is_empty());

    let claims = harness.api::<PersistentVolumeClaim>();
    assert!(claims.get_opt(SOURCE_NS, "disk").await.expect("lookup").is_none());
    let moved = claims.get(TARGET_NS, "disk").await.expect("target claim");
    assert!(moved.is_bound());
    assert_eq!(moved.spec.volume_name.as_deref(), Some(volume_name.as_str()));
    assert!(moved.metadata.annotation(ANN_OBJECT_TRANSFER_NAME).is_none());
    assert_eq!(
        harness.node.image_checksum(TARGET_NS, "disk").await,
        Some(sha256_hex(&content))
    );

    let volume = harness
        .api::<PersistentVolume>()
        .get("", &volume_name)
        .await
        .expect("volume");
    assert_eq!(
        volume.spec.persistent_volume_reclaim_policy.as_deref(),
        Some("Delete"),
        "original reclaim policy is restored"
    );
}

#[tokio::test]
async fn scenario_claim_is_renamed_in_place() {
    let content = b"renamed".to_vec();
    let harness = harness_with_disk(&content).await;

    create(&harness.cluster, &transfer("rename", "disk", None, Some("disk-v2"))).await;
    assert!(harness.settle().await);

    assert_eq!(get_transfer(&harness, "rename").await.phase(), TransferPhase::Complete);
    assert_eq!(
        harness.node.image_checksum(SOURCE_NS, "disk-v2").await,
        Some(sha256_hex(&content))
    );
}

#[tokio::test]
async fn scenario_required_annotation_gates_transfer() {
    let harness = harness_with_disk(b"gated").await;
    let mut gated = transfer("gated", "disk", Some(TARGET_NS), None);
    gated
        .spec
        .source
        .required_annotations
        .insert("example.com/approved".to_string(), "true".to_string());
    create(&harness.cluster, &gated).await;
    assert!(harness.settle().await);

    let waiting = get_transfer(&harness, "gated").await;
    assert_eq!(waiting.phase(), TransferPhase::Pending);
    assert_eq!(
        complete_message(&waiting).as_deref(),
        Some("Required annotation missing")
    );

    let claims = harness.api::<PersistentVolumeClaim>();
    let mut claim = claims.get(SOURCE_NS, "disk").await.expect("claim");
    claim.metadata.set_annotation("example.com/approved", "true");
    claims.update(&claim).await.expect("approve");
    assert!(harness.settle().await);

    assert_eq!(get_transfer(&harness, "gated").await.phase(), TransferPhase::Complete);
}

#[tokio::test]
async fn scenario_claim_in_use_holds_transfer() {
    let harness = harness_with_disk(b"busy").await;
    let pods = harness.api::<Pod>();
    pods.create(&Pod {
        metadata: ObjectMeta::named(Some(SOURCE_NS), "consumer"),
        spec: PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                ..Default::default()
            }],
            volumes: vec![Volume {
                name: "data".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: "disk".to_string(),
                    read_only: None,
                }),
                ..Default::default()
            }],
            ..Default::default()
        },
        status: None,
    })
    .await
    .expect("consumer pod");

    create(&harness.cluster, &transfer("busy", "disk", Some(TARGET_NS), None)).await;
    assert!(harness.settle().await);
    let waiting = get_transfer(&harness, "busy").await;
    assert_eq!(waiting.phase(), TransferPhase::Pending);
    assert_eq!(complete_message(&waiting).as_deref(), Some("Pods using PVC"));

    pods.delete(SOURCE_NS, "consumer").await.expect("delete consumer");
    assert!(harness.settle().await);
    assert_eq!(get_transfer(&harness, "busy").await.phase(), TransferPhase::Complete);
}

#[tokio::test]
async fn scenario_unsupported_kind_fails_transfer() {
    let harness = harness_with_disk(b"disk").await;
    let mut snapshot = transfer("snapshot", "disk", Some(TARGET_NS), None);
    snapshot.spec.source.kind = "VolumeSnapshot".to_string();
    create(&harness.cluster, &snapshot).await;
    assert!(harness.settle().await);

    assert_eq!(get_transfer(&harness, "snapshot").await.phase(), TransferPhase::Error);
    let claim = harness
        .api::<PersistentVolumeClaim>()
        .get(SOURCE_NS, "disk")
        .await
        .expect("source untouched");
    assert!(claim.metadata.annotation(ANN_OBJECT_TRANSFER_NAME).is_none());
}

#[tokio::test]
async fn scenario_missing_source_waits_for_claim() {
    let harness = Harness::new();
    add_storage_class(&harness.cluster, "standard", "kubevirt.io/hostpath-provisioner", true).await;
    create(&harness.cluster, &transfer("early", "later", Some(TARGET_NS), None)).await;
    assert!(harness.settle().await);

    let waiting = get_transfer(&harness, "early").await;
    assert_eq!(waiting.phase(), TransferPhase::Pending);
    assert_eq!(complete_message(&waiting).as_deref(), Some("No source"));

    harness
        .node
        .create_populated_claim(SOURCE_NS, "later", claim_spec("1Gi", Some("standard")), b"late")
        .await;
    assert!(harness.settle().await);
    assert_eq!(get_transfer(&harness, "early").await.phase(), TransferPhase::Complete);
}
