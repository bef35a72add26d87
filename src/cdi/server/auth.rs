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

//! Request authentication for the aggregated API.
//!
//! A caller is identified either by a client certificate issued by the
//! cluster's client CA, or by user/group headers asserted by the front proxy.
//! Header identities are only trusted when the connection itself presents a
//! certificate signed by the request-header CA whose common name is allowed.
//! The trust configuration is read from the orchestrator's
//! `extension-apiserver-authentication` ConfigMap and swapped atomically on
//! change, so requests already holding a snapshot keep it.

use axum::http::HeaderMap;
use futures_util::StreamExt;
use openssl::nid::Nid;
use openssl::x509::{X509NameRef, X509};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cdi::client::{Api, ClientError, ClusterClient};
use crate::cdi::k8s::admission::UserInfo;
use crate::cdi::k8s::authorization::{ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec};
use crate::cdi::k8s::objects::ConfigMap;
use crate::cdi::k8s::resource::ResourceKind;
use crate::cdi::logger::{log_info, log_warn};

const COMPONENT: &str = "auth";

pub const AUTH_CONFIG_MAP: &str = "extension-apiserver-authentication";
pub const AUTH_CONFIG_NAMESPACE: &str = "kube-system";

const KEY_CLIENT_CA: &str = "client-ca-file";
const KEY_REQUEST_HEADER_CA: &str = "requestheader-client-ca-file";
const KEY_ALLOWED_NAMES: &str = "requestheader-allowed-names";
const KEY_USER_HEADERS: &str = "requestheader-username-headers";
const KEY_GROUP_HEADERS: &str = "requestheader-group-headers";
const KEY_EXTRA_PREFIXES: &str = "requestheader-extra-headers-prefix";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    Unauthenticated(String),
    Forbidden(String),
    Review(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Unauthenticated(reason) => write!(f, "unauthenticated: {reason}"),
            AuthError::Forbidden(reason) => write!(f, "forbidden: {reason}"),
            AuthError::Review(reason) => write!(f, "access review failed: {reason}"),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<ClientError> for AuthError {
    fn from(err: ClientError) -> Self {
        AuthError::Review(err.to_string())
    }
}

/// List-valued entries are JSON arrays of strings.
fn string_list(data: &HashMap<String, String>, key: &str) -> Vec<String> {
    data.get(key)
        .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthConfig {
    pub client_ca: Vec<u8>,
    pub request_header_ca: Vec<u8>,
    pub allowed_names: Vec<String>,
    pub user_headers: Vec<String>,
    pub group_headers: Vec<String>,
    pub extra_prefix_headers: Vec<String>,
}

impl AuthConfig {
    pub fn from_config_map(config_map: &ConfigMap) -> Self {
        let data = &config_map.data;
        AuthConfig {
            client_ca: data.get(KEY_CLIENT_CA).map(|ca| ca.as_bytes().to_vec()).unwrap_or_default(),
            request_header_ca: data
                .get(KEY_REQUEST_HEADER_CA)
                .map(|ca| ca.as_bytes().to_vec())
                .unwrap_or_default(),
            allowed_names: string_list(data, KEY_ALLOWED_NAMES),
            user_headers: string_list(data, KEY_USER_HEADERS),
            group_headers: string_list(data, KEY_GROUP_HEADERS),
            extra_prefix_headers: string_list(data, KEY_EXTRA_PREFIXES),
        }
    }

    /// An empty allow-list accepts any front proxy signed by the CA.
    pub fn validate_name(&self, common_name: &str) -> bool {
        self.allowed_names.is_empty() || self.allowed_names.iter().any(|name| name == common_name)
    }

    /// Every CA a client certificate may chain to.
    pub fn trusted_cas(&self) -> Vec<X509> {
        [&self.client_ca, &self.request_header_ca]
            .into_iter()
            .filter(|pem| !pem.is_empty())
            .filter_map(|pem| X509::stack_from_pem(pem).ok())
            .flatten()
            .collect()
    }

    fn signed_by(bundle: &[u8], certificate: &X509) -> bool {
        X509::stack_from_pem(bundle)
            .unwrap_or_default()
            .iter()
            .filter_map(|ca| ca.public_key().ok())
            .any(|key| certificate.verify(&key).unwrap_or(false))
    }

    /// Classifies a handshake-verified peer certificate.
    pub fn classify(&self, certificate: &X509) -> PeerCertificate {
        let subject = certificate.subject_name();
        PeerCertificate {
            common_name: name_entries(subject, Nid::COMMONNAME).into_iter().next().unwrap_or_default(),
            organizations: name_entries(subject, Nid::ORGANIZATIONNAME),
            front_proxy: Self::signed_by(&self.request_header_ca, certificate),
            client: Self::signed_by(&self.client_ca, certificate),
        }
    }
}

fn name_entries(name: &X509NameRef, nid: Nid) -> Vec<String> {
    name.entries_by_nid(nid)
        .filter_map(|entry| std::str::from_utf8(entry.data().as_slice()).ok().map(str::to_string))
        .collect()
}

/// Identity carried by a verified TLS peer certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerCertificate {
    pub common_name: String,
    pub organizations: Vec<String>,
    /// Signed by the request-header CA.
    pub front_proxy: bool,
    /// Signed by the client CA.
    pub client: bool,
}

fn header_values(headers: &HeaderMap, name: &str) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::to_string)
        .collect()
}

/// Resolves the requesting user from the connection and headers.
pub fn authenticate(config: &AuthConfig, peer: Option<&PeerCertificate>, headers: &HeaderMap) -> Result<UserInfo, AuthError> {
    let Some(peer) = peer else {
        return Err(AuthError::Unauthenticated("no client certificate".to_string()));
    };
    if peer.front_proxy {
        if !config.validate_name(&peer.common_name) {
            return Err(AuthError::Unauthenticated(format!(
                "front proxy {} is not allowed",
                peer.common_name
            )));
        }
        let username = config
            .user_headers
            .iter()
            .flat_map(|header| header_values(headers, header))
            .find(|value| !value.is_empty())
            .ok_or_else(|| AuthError::Unauthenticated("no user header".to_string()))?;
        let groups = config
            .group_headers
            .iter()
            .flat_map(|header| header_values(headers, header))
            .collect();
        let mut extra: HashMap<String, Vec<String>> = HashMap::new();
        for prefix in &config.extra_prefix_headers {
            let prefix = prefix.to_ascii_lowercase();
            for (name, value) in headers {
                let Some(key) = name.as_str().strip_prefix(&prefix) else {
                    continue;
                };
                if let Ok(value) = value.to_str() {
                    extra.entry(key.to_string()).or_default().push(value.to_string());
                }
            }
        }
        return Ok(UserInfo {
            username,
            uid: None,
            groups,
            extra,
        });
    }
    if peer.client && !peer.common_name.is_empty() {
        return Ok(UserInfo {
            username: peer.common_name.clone(),
            uid: None,
            groups: peer.organizations.clone(),
            extra: HashMap::new(),
        });
    }
    Err(AuthError::Unauthenticated("client certificate is not trusted".to_string()))
}

/// Owns the current trust configuration and the access-review client.
pub struct AuthGate {
    client: Arc<dyn ClusterClient>,
    config: RwLock<Arc<AuthConfig>>,
}

impl AuthGate {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        AuthGate {
            client,
            config: RwLock::new(Arc::new(AuthConfig::default())),
        }
    }

    pub fn config(&self) -> Arc<AuthConfig> {
        Arc::clone(&self.config.read().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    pub fn set_config(&self, config: AuthConfig) {
        *self.config.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(config);
    }

    pub async fn refresh(&self) -> Result<(), ClientError> {
        let config_maps: Api<ConfigMap> = Api::new(Arc::clone(&self.client));
        let config = config_maps
            .get_opt(AUTH_CONFIG_NAMESPACE, AUTH_CONFIG_MAP)
            .await?
            .map(|config_map| AuthConfig::from_config_map(&config_map))
            .unwrap_or_default();
        if *self.config() != config {
            log_info(COMPONENT, "Authentication configuration updated", &[]);
            self.set_config(config);
        }
        Ok(())
    }

    /// Asks the orchestrator whether `user` may perform `attributes`.
    pub async fn authorize(&self, user: &UserInfo, attributes: ResourceAttributes) -> Result<(), AuthError> {
        let review = SubjectAccessReview::new(SubjectAccessReviewSpec {
            user: Some(user.username.clone()),
            groups: user.groups.clone(),
            extra: user.extra.clone(),
            uid: user.uid.clone(),
            resource_attributes: Some(attributes),
        });
        let review = self.client.create_subject_access_review(review).await?;
        if review.allowed() {
            return Ok(());
        }
        let reason = review
            .status
            .and_then(|status| status.reason)
            .unwrap_or_else(|| "access denied".to_string());
        Err(AuthError::Forbidden(reason))
    }

    /// Follows the authentication ConfigMap until shutdown.
    pub async fn watch(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            if let Err(err) = self.refresh().await {
                let error = err.to_string();
                log_warn(COMPONENT, "Failed to read authentication config", &[("error", error.as_str())]);
            }
            let mut events = match self.client.watch(ResourceKind::ConfigMap).await {
                Ok(events) => events,
                Err(err) => {
                    let error = err.to_string();
                    log_warn(COMPONENT, "Failed to watch config maps", &[("error", error.as_str())]);
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            };
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    event = events.next() => match event {
                        Some(Ok(event)) => {
                            let name = event.object.pointer("/metadata/name").and_then(|v| v.as_str());
                            let namespace = event.object.pointer("/metadata/namespace").and_then(|v| v.as_str());
                            if name == Some(AUTH_CONFIG_MAP) && namespace == Some(AUTH_CONFIG_NAMESPACE) {
                                if let Err(err) = self.refresh().await {
                                    let error = err.to_string();
                                    log_warn(COMPONENT, "Failed to refresh authentication config", &[("error", error.as_str())]);
                                }
                            }
                        }
                        Some(Err(_)) | None => break,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdi::client::InMemoryCluster;
    use crate::cdi::k8s::meta::ObjectMeta;
    use axum::http::HeaderValue;

    fn auth_config_map() -> ConfigMap {
        let mut config_map = ConfigMap {
            metadata: ObjectMeta::named(Some(AUTH_CONFIG_NAMESPACE), AUTH_CONFIG_MAP),
            ..Default::default()
        };
        let data = &mut config_map.data;
        data.insert(KEY_ALLOWED_NAMES.to_string(), r#"["front-proxy-client"]"#.to_string());
        data.insert(KEY_USER_HEADERS.to_string(), r#"["X-Remote-User"]"#.to_string());
        data.insert(KEY_GROUP_HEADERS.to_string(), r#"["X-Remote-Group"]"#.to_string());
        data.insert(KEY_EXTRA_PREFIXES.to_string(), r#"["X-Remote-Extra-"]"#.to_string());
        config_map
    }

    fn front_proxy(name: &str) -> PeerCertificate {
        PeerCertificate {
            common_name: name.to_string(),
            front_proxy: true,
            ..Default::default()
        }
    }

    fn proxied_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-remote-user", HeaderValue::from_static("alice"));
        headers.append("x-remote-group", HeaderValue::from_static("dev"));
        headers.append("x-remote-group", HeaderValue::from_static("ops"));
        headers.insert("x-remote-extra-scopes", HeaderValue::from_static("read"));
        headers
    }

    #[test]
    fn config_map_lists_are_parsed() {
        let config = AuthConfig::from_config_map(&auth_config_map());
        assert_eq!(config.user_headers, vec!["X-Remote-User"]);
        assert!(config.validate_name("front-proxy-client"));
        assert!(!config.validate_name("foobar"));
        assert!(AuthConfig::default().validate_name("anyone"));
    }

    #[test]
    fn front_proxy_headers_identify_the_user() {
        let config = AuthConfig::from_config_map(&auth_config_map());
        let user = authenticate(&config, Some(&front_proxy("front-proxy-client")), &proxied_headers()).unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(user.groups, vec!["dev", "ops"]);
        assert_eq!(user.extra.get("scopes"), Some(&vec!["read".to_string()]));
    }

    #[test]
    fn untrusted_callers_are_rejected() {
        let config = AuthConfig::from_config_map(&auth_config_map());
        let headers = proxied_headers();
        assert!(matches!(
            authenticate(&config, None, &headers),
            Err(AuthError::Unauthenticated(_))
        ));
        assert!(matches!(
            authenticate(&config, Some(&front_proxy("foobar")), &headers),
            Err(AuthError::Unauthenticated(_))
        ));
        let stranger = PeerCertificate {
            common_name: "mallory".to_string(),
            ..Default::default()
        };
        assert!(authenticate(&config, Some(&stranger), &headers).is_err());
    }

    #[test]
    fn client_certificates_identify_by_subject() {
        let peer = PeerCertificate {
            common_name: "bob".to_string(),
            organizations: vec!["system:masters".to_string()],
            client: true,
            front_proxy: false,
        };
        let user = authenticate(&AuthConfig::default(), Some(&peer), &HeaderMap::new()).unwrap();
        assert_eq!(user.username, "bob");
        assert_eq!(user.groups, vec!["system:masters"]);
    }

    #[test]
    fn certificates_are_classified_by_issuer() {
        use crate::cdi::server::tls::testing::issue;
        let (client_ca, client_key) = issue("client-ca", None, None);
        let (proxy_ca, proxy_key) = issue("front-proxy-ca", None, None);
        let config = AuthConfig {
            client_ca: client_ca.to_pem().unwrap(),
            request_header_ca: proxy_ca.to_pem().unwrap(),
            ..Default::default()
        };
        let (proxy, _) = issue("front-proxy-client", None, Some((&proxy_ca, &proxy_key)));
        let peer = config.classify(&proxy);
        assert!(peer.front_proxy && !peer.client);
        assert_eq!(peer.common_name, "front-proxy-client");

        let (admin, _) = issue("admin", Some("system:masters"), Some((&client_ca, &client_key)));
        let peer = config.classify(&admin);
        assert!(peer.client && !peer.front_proxy);
        assert_eq!(peer.organizations, vec!["system:masters"]);
        assert_eq!(config.trusted_cas().len(), 2);
    }

    #[test]
    fn subject_names_keep_non_ascii_text() {
        use crate::cdi::server::tls::testing::issue;
        let (certificate, _) = issue("jörg", Some("bäckerei"), None);
        let peer = AuthConfig::default().classify(&certificate);
        assert_eq!(peer.common_name, "jörg");
        assert_eq!(peer.organizations, vec!["bäckerei"]);
    }

    #[tokio::test]
    async fn denied_reviews_carry_the_reason() {
        let cluster = InMemoryCluster::new();
        cluster.set_access_policy(|spec: &SubjectAccessReviewSpec| match spec.user.as_deref() {
            Some("alice") => Ok(()),
            _ => Err("not permitted".to_string()),
        });
        let gate = AuthGate::new(cluster.clone());
        let attributes = ResourceAttributes {
            verb: "create".to_string(),
            resource: "uploadtokenrequests".to_string(),
            ..Default::default()
        };
        let alice = UserInfo {
            username: "alice".to_string(),
            ..Default::default()
        };
        let bob = UserInfo {
            username: "bob".to_string(),
            ..Default::default()
        };
        assert!(gate.authorize(&alice, attributes.clone()).await.is_ok());
        assert!(matches!(
            gate.authorize(&bob, attributes).await,
            Err(AuthError::Forbidden(reason)) if reason == "not permitted"
        ));
    }

    #[tokio::test]
    async fn refresh_reads_the_config_map() {
        let cluster = InMemoryCluster::new();
        let config_maps: Api<ConfigMap> = Api::new(cluster.clone());
        config_maps.create(&auth_config_map()).await.unwrap();
        let gate = AuthGate::new(cluster.clone());
        gate.refresh().await.unwrap();
        assert_eq!(gate.config().group_headers, vec!["X-Remote-Group"]);
    }
}
