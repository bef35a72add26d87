use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use cdi::cdi::api::annotations::{ANN_POD_PHASE, ANN_POD_READY, ANN_UPLOAD_REQUEST};
use cdi::cdi::api::upload::{UploadTokenRequest, UploadTokenRequestSpec};
use cdi::cdi::client::memory::InMemoryCluster;
use cdi::cdi::client::ClusterClient;
use cdi::cdi::k8s::discovery::UPLOAD_GROUP;
use cdi::cdi::k8s::meta::ObjectMeta;
use cdi::cdi::k8s::objects::ConfigMap;
use cdi::cdi::k8s::volume::PersistentVolumeClaim;
use cdi::cdi::server::auth::{AuthConfig, PeerCertificate};
use cdi::cdi::server::{build_router, AppState};
use cdi::cdi::test_support::{claim_spec, create, TEST_NAMESPACE};
use cdi::cdi::token::jwe;
use cdi::cdi::token::keys::{generate_key_pair, SigningKeyPair, PROXY_PUBLIC_KEY_ENTRY, UPLOAD_PROXY_SIGNER_BUNDLE};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

const TENANT: &str = "tenant";

struct Api {
    cluster: Arc<InMemoryCluster>,
    state: AppState,
    router: Router,
    proxy_keys: SigningKeyPair,
}

async fn api() -> Api {
    let cluster = InMemoryCluster::new();
    let client: Arc<dyn ClusterClient> = cluster.clone();
    let proxy_keys = generate_key_pair().expect("proxy key pair");
    let mut bundle = ConfigMap {
        metadata: ObjectMeta::named(Some(TEST_NAMESPACE), UPLOAD_PROXY_SIGNER_BUNDLE),
        data: HashMap::new(),
    };
    bundle.data.insert(
        PROXY_PUBLIC_KEY_ENTRY.to_string(),
        String::from_utf8(proxy_keys.public_pem.clone()).expect("pem"),
    );
    create(&cluster, &bundle).await;

    let state = AppState::new(client, TEST_NAMESPACE);
    state.keys.ensure_signing_key().await.expect("signing key");
    state.gate.set_config(AuthConfig {
        allowed_names: vec!["front-proxy-client".to_string()],
        user_headers: vec!["X-Remote-User".to_string()],
        group_headers: vec!["X-Remote-Group".to_string()],
        extra_prefix_headers: vec!["X-Remote-Extra-".to_string()],
        ..Default::default()
    });
    let router = build_router(state.clone());
    Api {
        cluster,
        state,
        router,
        proxy_keys,
    }
}

fn front_proxy(common_name: &str) -> PeerCertificate {
    PeerCertificate {
        common_name: common_name.to_string(),
        organizations: Vec::new(),
        front_proxy: true,
        client: false,
    }
}

async fn upload_claim(cluster: &Arc<InMemoryCluster>, name: &str, ready: bool) {
    let mut claim = PersistentVolumeClaim {
        metadata: ObjectMeta::named(Some(TENANT), name),
        spec: claim_spec("1Gi", None),
        status: None,
    };
    claim.metadata.set_annotation(ANN_UPLOAD_REQUEST, "");
    claim.metadata.set_annotation(ANN_POD_PHASE, "Running");
    claim
        .metadata
        .set_annotation(ANN_POD_READY, if ready { "true" } else { "false" });
    create(cluster, &claim).await;
}

fn token_request(
    namespace: &str,
    claim: &str,
    peer: Option<PeerCertificate>,
    user: Option<&str>,
) -> Request<Body> {
    let body = UploadTokenRequest {
        api_version: UploadTokenRequest::preferred_api_version(),
        kind: "UploadTokenRequest".to_string(),
        spec: UploadTokenRequestSpec {
            pvc_name: claim.to_string(),
        },
        ..Default::default()
    };
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(format!("/apis/{UPLOAD_GROUP}/v1beta1/namespaces/{namespace}/uploadtokenrequests"))
        .header("content-type", "application/json");
    if let Some(user) = user {
        builder = builder
            .header("X-Remote-User", user)
            .header("X-Remote-Group", "system:authenticated");
    }
    let mut request = builder
        .body(Body::from(serde_json::to_vec(&body).expect("body")))
        .expect("request");
    if let Some(peer) = peer {
        request.extensions_mut().insert(peer);
    }
    request
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn ready_upload_claim_gets_encrypted_token() {
    let api = api().await;
    upload_claim(&api.cluster, "disk", true).await;

    let (status, body) = send(
        &api.router,
        token_request(TENANT, "disk", Some(front_proxy("front-proxy-client")), Some("alice")),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["kind"], "UploadTokenRequest");
    assert_eq!(body["apiVersion"], format!("{UPLOAD_GROUP}/v1beta1"));
    let token = body["status"]["token"].as_str().expect("token");

    let signed = jwe::decrypt(token, &api.proxy_keys.private_pem).expect("proxy can decrypt");
    let validator = api.state.keys.clone_token_validator().await.expect("validator");
    let payload = validator.validate(&signed).expect("signed by the api server");
    payload.verify_upload(TENANT, "disk").expect("token for this claim");
    assert!(payload.verify_upload(TENANT, "other").is_err());
}

#[tokio::test]
async fn claim_without_ready_server_is_bad_request() {
    let api = api().await;
    upload_claim(&api.cluster, "disk", false).await;
    let (status, body) = send(
        &api.router,
        token_request(TENANT, "disk", Some(front_proxy("front-proxy-client")), Some("alice")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["error"],
        format!("PersistentVolumeClaim {TENANT}/disk is not ready for upload")
    );
}

#[tokio::test]
async fn claim_that_is_not_an_upload_target_is_bad_request() {
    let api = api().await;
    create(
        &api.cluster,
        &PersistentVolumeClaim {
            metadata: ObjectMeta::named(Some(TENANT), "plain"),
            spec: claim_spec("1Gi", None),
            status: None,
        },
    )
    .await;
    let (status, body) = send(
        &api.router,
        token_request(TENANT, "plain", Some(front_proxy("front-proxy-client")), Some("alice")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["error"],
        format!("PersistentVolumeClaim {TENANT}/plain is not an upload target")
    );

    let (status, _) = send(
        &api.router,
        token_request(TENANT, "missing", Some(front_proxy("front-proxy-client")), Some("alice")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn request_without_client_certificate_is_unauthorized() {
    let api = api().await;
    upload_claim(&api.cluster, "disk", true).await;
    let (status, _) = send(&api.router, token_request(TENANT, "disk", None, Some("alice"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unlisted_front_proxy_is_unauthorized() {
    let api = api().await;
    upload_claim(&api.cluster, "disk", true).await;
    let (status, _) = send(
        &api.router,
        token_request(TENANT, "disk", Some(front_proxy("rogue-proxy")), Some("alice")),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &api.router,
        token_request(TENANT, "disk", Some(front_proxy("front-proxy-client")), None),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn user_denied_by_access_review_is_forbidden() {
    let api = api().await;
    upload_claim(&api.cluster, "disk", true).await;
    api.cluster.set_access_policy(|spec| {
        if spec.user.as_deref() == Some("mallory") {
            Err("mallory may not upload".to_string())
        } else {
            Ok(())
        }
    });

    let (status, _) = send(
        &api.router,
        token_request(TENANT, "disk", Some(front_proxy("front-proxy-client")), Some("mallory")),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &api.router,
        token_request(TENANT, "disk", Some(front_proxy("front-proxy-client")), Some("alice")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn directly_authenticated_client_certificate_is_accepted() {
    let api = api().await;
    upload_claim(&api.cluster, "disk", true).await;
    let peer = PeerCertificate {
        common_name: "virtctl".to_string(),
        organizations: vec!["system:authenticated".to_string()],
        front_proxy: false,
        client: true,
    };
    let (status, body) = send(&api.router, token_request(TENANT, "disk", Some(peer), None)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
}

#[tokio::test]
async fn unknown_version_is_not_found() {
    let api = api().await;
    let request = Request::builder()
        .uri(format!("/apis/{UPLOAD_GROUP}/v2"))
        .body(Body::empty())
        .expect("request");
    let (status, _) = send(&api.router, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn discovery_advertises_upload_group() {
    let api = api().await;
    let request = Request::builder().uri("/apis").body(Body::empty()).expect("request");
    let (status, body) = send(&api.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.to_string().contains(UPLOAD_GROUP));

    let request = Request::builder()
        .uri(format!("/apis/{UPLOAD_GROUP}/v1beta1"))
        .body(Body::empty())
        .expect("request");
    let (status, body) = send(&api.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.to_string().contains("uploadtokenrequests"));
}

#[tokio::test]
async fn webhook_route_answers_admission_reviews() {
    let api = api().await;
    let review = serde_json::json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "review-1",
            "resource": {"group": "cdi.kubevirt.io", "version": "v1beta1", "resource": "objecttransfers"},
            "operation": "DELETE",
            "object": {"metadata": {"name": "move"}, "spec": {"source": {"kind": "PersistentVolumeClaim", "namespace": "a", "name": "b"}}}
        }
    });
    let request = Request::builder()
        .method(Method::POST)
        .uri("/objecttransfer-validate")
        .header("content-type", "application/json")
        .body(Body::from(review.to_string()))
        .expect("request");
    let (status, body) = send(&api.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"]["uid"], "review-1");
    assert_eq!(body["response"]["allowed"], true);
}
