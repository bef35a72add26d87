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

//! Aggregated API front-end: upload token issuance, discovery documents and
//! the admission webhooks, served over TLS with client-certificate
//! identification. Metrics and probes are served on a separate plain port.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::future::{self, Either};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HyperAcceptor;
use hyper_util::service::TowerToHyperService;
use openssl::x509::X509VerifyResult;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::Service;

pub mod auth;
pub mod handlers;
pub mod tls;

use self::auth::{AuthGate, PeerCertificate};
use self::handlers::error::ErrorBody;
use self::tls::{accept_with_tls, CertificatePaths, TlsReloader};
use crate::cdi::client::ClusterClient;
use crate::cdi::config::Settings;
use crate::cdi::k8s::admission::AdmissionReview;
use crate::cdi::k8s::discovery::UPLOAD_GROUP;
use crate::cdi::logger::{log_error, log_info, log_warn};
use crate::cdi::storage::ProfileRegistry;
use crate::cdi::token::keys::KeyStore;
use crate::cdi::util::error::{with_context, DynError};
use crate::cdi::webhook::{AdmissionContext, Webhook};

const COMPONENT: &str = "apiserver";

/// Shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub client: Arc<dyn ClusterClient>,
    pub keys: Arc<KeyStore>,
    pub gate: Arc<AuthGate>,
    pub admission: Arc<AdmissionContext>,
    pub namespace: String,
}

impl AppState {
    pub fn new(client: Arc<dyn ClusterClient>, namespace: &str) -> Self {
        let keys = Arc::new(KeyStore::new(Arc::clone(&client), namespace));
        let profiles = Arc::new(ProfileRegistry::new(Arc::clone(&client)));
        AppState {
            gate: Arc::new(AuthGate::new(Arc::clone(&client))),
            admission: Arc::new(AdmissionContext::new(Arc::clone(&client), Arc::clone(&keys), profiles)),
            keys,
            client,
            namespace: namespace.to_string(),
        }
    }
}

fn unauthorized_response(message: &str) -> Response {
    let body = Json(ErrorBody {
        error: message.to_string(),
    });
    (StatusCode::UNAUTHORIZED, body).into_response()
}

#[derive(Clone)]
enum CertificateState {
    Verified(PeerCertificate),
    Missing,
    Invalid { reason: String },
}

/// Hands the connection's verified peer certificate to the handlers. A
/// certificate that failed chain verification rejects every request.
#[derive(Clone)]
struct InjectPeerCertificate<S> {
    inner: S,
    certificate_state: CertificateState,
}

impl<S> InjectPeerCertificate<S> {
    fn new(inner: S, certificate_state: CertificateState) -> Self {
        Self {
            inner,
            certificate_state,
        }
    }
}

impl<S, ReqBody> Service<Request<ReqBody>> for InjectPeerCertificate<S>
where
    S: Service<Request<ReqBody>, Response = Response, Error = Infallible>,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Either<S::Future, future::Ready<Result<Self::Response, Self::Error>>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<ReqBody>) -> Self::Future {
        match &self.certificate_state {
            CertificateState::Verified(peer) => {
                request.extensions_mut().insert(peer.clone());
                Either::Left(self.inner.call(request))
            }
            CertificateState::Missing => Either::Left(self.inner.call(request)),
            CertificateState::Invalid { reason } => {
                Either::Right(future::ready(Ok(unauthorized_response(reason.as_str()))))
            }
        }
    }
}

fn certificate_state(gate: &AuthGate, tls_stream: &tokio_openssl::SslStream<tokio::net::TcpStream>) -> CertificateState {
    let ssl = tls_stream.ssl();
    match ssl.peer_certificate() {
        None => CertificateState::Missing,
        Some(_) if ssl.verify_result() != X509VerifyResult::OK => CertificateState::Invalid {
            reason: format!(
                "client certificate validation failed: {}",
                ssl.verify_result().error_string()
            ),
        },
        Some(cert) => CertificateState::Verified(gate.config().classify(&cert)),
    }
}

pub fn build_router(state: AppState) -> Router {
    let upload_path = format!("/apis/{UPLOAD_GROUP}");
    let mut router = Router::new()
        .route("/", get(handlers::discovery::root_paths))
        .route("/apis", get(handlers::discovery::api_groups))
        .route(&upload_path, get(handlers::discovery::upload_group))
        .route(
            &format!("{upload_path}/{{version}}"),
            get(handlers::discovery::upload_resources),
        )
        .route(
            &format!("{upload_path}/{{version}}/namespaces/{{namespace}}/uploadtokenrequests"),
            post(handlers::upload::create_upload_token),
        )
        .route("/openapi/v2", get(handlers::openapi_spec))
        .route("/healthz", get(handlers::healthz));

    for hook in Webhook::ALL {
        router = router.route(
            hook.path(),
            post(move |State(state): State<AppState>, Json(body): Json<AdmissionReview>| {
                handlers::admission::review(state, hook, body)
            }),
        );
    }
    router.with_state(state)
}

/// Metrics and liveness; needs no cluster access.
pub fn probe_router() -> Router {
    Router::new()
        .route("/metrics", get(handlers::metrics_text))
        .route("/livez", get(handlers::livez))
}

/// Accepts TLS connections until `shutdown` fires. The acceptor is fetched
/// per connection so certificate rotation never drops the listener.
pub async fn serve(
    state: AppState,
    reloader: Arc<TlsReloader>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), DynError> {
    let app = build_router(state.clone());
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| with_context(e, format!("Failed to bind API listener at {addr}")))?;
    let listen_addr_text = addr.to_string();
    log_info(COMPONENT, "API server listening", &[("addr", listen_addr_text.as_str())]);

    loop {
        let (stream, remote_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted
                .map_err(|e| with_context(e, "Failed to accept incoming TCP connection"))?,
        };
        let service = app.clone();
        let acceptor = reloader.acceptor();
        let gate = Arc::clone(&state.gate);
        tokio::spawn(async move {
            let remote_addr_text = remote_addr.to_string();
            let tls_stream = match accept_with_tls(&acceptor, stream).await {
                Ok(tls_stream) => tls_stream,
                Err(err) => {
                    let error_text = err.to_string();
                    log_warn(
                        COMPONENT,
                        "TLS handshake failed",
                        &[("remote_addr", remote_addr_text.as_str()), ("error", error_text.as_str())],
                    );
                    return;
                }
            };
            let certificate_state = certificate_state(&gate, &tls_stream);
            if let CertificateState::Invalid { reason } = &certificate_state {
                log_warn(
                    COMPONENT,
                    "Client certificate validation failed",
                    &[("remote_addr", remote_addr_text.as_str()), ("error", reason.as_str())],
                );
            }

            let io = TokioIo::new(tls_stream);
            let service = TowerToHyperService::new(InjectPeerCertificate::new(service, certificate_state));
            if let Err(err) = HyperAcceptor::new(TokioExecutor::new())
                .serve_connection_with_upgrades(io, service)
                .await
            {
                let should_log = err
                    .downcast_ref::<hyper::Error>()
                    .map(|hyper_err| !(hyper_err.is_closed() || hyper_err.is_incomplete_message()))
                    .unwrap_or(true);
                if should_log {
                    let error_text = err.to_string();
                    log_error(
                        COMPONENT,
                        "HTTP serving error",
                        &[("remote_addr", remote_addr_text.as_str()), ("error", error_text.as_str())],
                    );
                }
            }
        });
    }
    log_info(COMPONENT, "API server stopped", &[]);
    Ok(())
}

pub async fn serve_probes(router: Router, addr: SocketAddr, shutdown: CancellationToken) -> Result<(), DynError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| with_context(e, format!("Failed to bind metrics listener at {addr}")))?;
    let addr_text = addr.to_string();
    log_info(COMPONENT, "Metrics listening", &[("addr", addr_text.as_str())]);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| with_context(e, "Metrics server failed"))
}

/// Bootstraps the signing key and caller trust, then serves until shutdown.
pub async fn run(client: Arc<dyn ClusterClient>, settings: &Settings, shutdown: CancellationToken) -> Result<(), DynError> {
    let state = AppState::new(Arc::clone(&client), &settings.namespace);
    state
        .keys
        .ensure_signing_key()
        .await
        .map_err(|e| with_context(e, "Failed to load the API signing key"))?;
    if let Err(err) = state.gate.refresh().await {
        let error = err.to_string();
        log_warn(COMPONENT, "Failed to read caller authentication config", &[("error", error.as_str())]);
    }
    let reloader = Arc::new(
        TlsReloader::load(CertificatePaths::from_config(), Arc::clone(&state.gate))
            .map_err(|e| with_context(e, "Failed to prepare TLS acceptor"))?,
    );

    tokio::spawn(Arc::clone(&state.gate).watch(shutdown.clone()));
    tokio::spawn(Arc::clone(&reloader).watch(shutdown.clone()));
    tokio::spawn(Arc::clone(&state.keys).watch_signing_key(Arc::clone(&client), shutdown.clone()));

    let probes = probe_router().merge(
        Router::new()
            .route("/healthz", get(handlers::healthz))
            .with_state(state.clone()),
    );
    let metrics = tokio::spawn(serve_probes(probes, settings.metrics_bind, shutdown.clone()));
    let result = serve(state, reloader, settings.api_bind, shutdown.clone()).await;
    shutdown.cancel();
    match metrics.await {
        Ok(Err(err)) => {
            let error = err.to_string();
            log_warn(COMPONENT, "Metrics server exited with error", &[("error", error.as_str())]);
        }
        Err(err) => {
            let error = err.to_string();
            log_warn(COMPONENT, "Metrics task failed", &[("error", error.as_str())]);
        }
        Ok(Ok(())) => {}
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use tower::service_fn;

    fn ok_service() -> impl Service<Request<()>, Response = Response, Error = Infallible> + Clone {
        service_fn(|request: Request<()>| async move {
            let status = if request.extensions().get::<PeerCertificate>().is_some() {
                StatusCode::OK
            } else {
                StatusCode::NO_CONTENT
            };
            Ok::<_, Infallible>(Response::builder().status(status).body(Body::empty()).unwrap())
        })
    }

    #[tokio::test]
    async fn invalid_certificate_is_rejected() {
        let mut layer = InjectPeerCertificate::new(
            ok_service(),
            CertificateState::Invalid {
                reason: "client certificate validation failed: unable to get local issuer certificate"
                    .to_string(),
            },
        );
        let response = layer.call(Request::new(())).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_certificate_reaches_handlers_without_identity() {
        let mut layer = InjectPeerCertificate::new(ok_service(), CertificateState::Missing);
        let response = layer.call(Request::new(())).await.expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn verified_certificate_is_attached() {
        let peer = PeerCertificate {
            common_name: "front-proxy-client".to_string(),
            organizations: Vec::new(),
            front_proxy: true,
            client: false,
        };
        let mut layer = InjectPeerCertificate::new(ok_service(), CertificateState::Verified(peer));
        let response = layer.call(Request::new(())).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }
}
