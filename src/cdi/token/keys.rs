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

//! Key material for the token service. The API signing key pair lives in a
//! Secret and is loaded once; the public halves are exchanged via ConfigMaps.

use super::{
    Generator, TokenError, Validator, API_SERVER_ISSUER, CLONE_TOKEN_LEEWAY,
    EXTENDED_CLONE_TOKEN_ISSUER, EXTENDED_CLONE_TOKEN_LIFETIME,
};
use crate::cdi::client::{Api, ClientError, ClusterClient};
use crate::cdi::k8s::meta::ObjectMeta;
use crate::cdi::k8s::objects::{ConfigMap, Secret};
use crate::cdi::k8s::resource::ResourceKind;
use crate::cdi::logger::{log_info, log_warn};
use futures_util::StreamExt;
use openssl::rsa::Rsa;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "keystore";

pub const SIGNING_KEY_SECRET: &str = "cdi-api-signing-key";
pub const PRIVATE_KEY_ENTRY: &str = "id_rsa";
pub const PUBLIC_KEY_ENTRY: &str = "id_rsa.pub";
pub const API_SIGNER_BUNDLE: &str = "cdi-apiserver-signer-bundle";
pub const UPLOAD_PROXY_SIGNER_BUNDLE: &str = "cdi-uploadproxy-signer-bundle";
pub const PROXY_PUBLIC_KEY_ENTRY: &str = "publicKey";

const PUBLIC_KEY_CACHE_TTL: Duration = Duration::from_secs(30);
const KEY_BITS: u32 = 2048;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningKeyPair {
    pub private_pem: Vec<u8>,
    pub public_pem: Vec<u8>,
}

pub fn generate_key_pair() -> Result<SigningKeyPair, TokenError> {
    let rsa = Rsa::generate(KEY_BITS).map_err(|err| TokenError::Key(err.to_string()))?;
    Ok(SigningKeyPair {
        private_pem: rsa
            .private_key_to_pem()
            .map_err(|err| TokenError::Key(err.to_string()))?,
        public_pem: rsa
            .public_key_to_pem()
            .map_err(|err| TokenError::Key(err.to_string()))?,
    })
}

fn client_error(err: ClientError) -> TokenError {
    TokenError::Key(err.to_string())
}

struct CachedKey {
    fetched: Instant,
    pem: Vec<u8>,
}

pub struct KeyStore {
    namespace: String,
    secrets: Api<Secret>,
    config_maps: Api<ConfigMap>,
    signing: RwLock<Option<Arc<SigningKeyPair>>>,
    proxy_key: Mutex<Option<CachedKey>>,
    api_key: Mutex<Option<CachedKey>>,
}

impl KeyStore {
    pub fn new(client: Arc<dyn ClusterClient>, namespace: &str) -> Self {
        KeyStore {
            namespace: namespace.to_string(),
            secrets: Api::new(Arc::clone(&client)),
            config_maps: Api::new(client),
            signing: RwLock::new(None),
            proxy_key: Mutex::new(None),
            api_key: Mutex::new(None),
        }
    }

    /// Loads the signing key pair, creating the Secret on first start, and
    /// publishes the public half for the controllers.
    pub async fn ensure_signing_key(&self) -> Result<Arc<SigningKeyPair>, TokenError> {
        let secret = match self
            .secrets
            .get_opt(&self.namespace, SIGNING_KEY_SECRET)
            .await
            .map_err(client_error)?
        {
            Some(secret) => secret,
            None => {
                let pair = generate_key_pair()?;
                let mut secret = Secret {
                    metadata: ObjectMeta::named(Some(&self.namespace), SIGNING_KEY_SECRET),
                    ..Default::default()
                };
                secret.insert_encoded(PRIVATE_KEY_ENTRY, &pair.private_pem);
                secret.insert_encoded(PUBLIC_KEY_ENTRY, &pair.public_pem);
                match self.secrets.create(&secret).await {
                    Ok(created) => {
                        log_info(
                            COMPONENT,
                            "Generated API signing key",
                            &[("namespace", self.namespace.as_str())],
                        );
                        created
                    }
                    Err(ClientError::AlreadyExists) => self
                        .secrets
                        .get(&self.namespace, SIGNING_KEY_SECRET)
                        .await
                        .map_err(client_error)?,
                    Err(err) => return Err(client_error(err)),
                }
            }
        };
        let pair = Arc::new(pair_from_secret(&secret)?);
        self.publish_public_key(&pair.public_pem).await?;
        self.set_signing(Some(Arc::clone(&pair)));
        Ok(pair)
    }

    async fn publish_public_key(&self, public_pem: &[u8]) -> Result<(), TokenError> {
        let value = String::from_utf8_lossy(public_pem).into_owned();
        match self
            .config_maps
            .get_opt(&self.namespace, API_SIGNER_BUNDLE)
            .await
            .map_err(client_error)?
        {
            Some(mut bundle) => {
                if bundle.data.get(PUBLIC_KEY_ENTRY) != Some(&value) {
                    bundle.data.insert(PUBLIC_KEY_ENTRY.to_string(), value);
                    self.config_maps.update(&bundle).await.map_err(client_error)?;
                }
            }
            None => {
                let mut bundle = ConfigMap {
                    metadata: ObjectMeta::named(Some(&self.namespace), API_SIGNER_BUNDLE),
                    ..Default::default()
                };
                bundle.data.insert(PUBLIC_KEY_ENTRY.to_string(), value);
                match self.config_maps.create(&bundle).await {
                    Ok(_) | Err(ClientError::AlreadyExists) => {}
                    Err(err) => return Err(client_error(err)),
                }
            }
        }
        Ok(())
    }

    fn set_signing(&self, pair: Option<Arc<SigningKeyPair>>) {
        *self
            .signing
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = pair;
    }

    /// The cached signing key; fails while the Secret is missing.
    pub fn signing_key(&self) -> Result<Arc<SigningKeyPair>, TokenError> {
        self.signing
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| TokenError::Key("API signing key is unavailable".to_string()))
    }

    pub fn is_available(&self) -> bool {
        self.signing_key().is_ok()
    }

    /// Re-reads the Secret; a deleted Secret makes the key unavailable.
    pub async fn refresh_signing_key(&self) -> Result<(), TokenError> {
        match self
            .secrets
            .get_opt(&self.namespace, SIGNING_KEY_SECRET)
            .await
            .map_err(client_error)?
        {
            Some(secret) => {
                let pair = pair_from_secret(&secret)?;
                self.set_signing(Some(Arc::new(pair)));
            }
            None => {
                if self.is_available() {
                    log_warn(
                        COMPONENT,
                        "API signing key removed; token requests are refused until it is restored",
                        &[("namespace", self.namespace.as_str())],
                    );
                }
                self.set_signing(None);
            }
        }
        Ok(())
    }

    pub fn generator(&self, lifetime: Duration) -> Result<Generator, TokenError> {
        let pair = self.signing_key()?;
        Generator::new(API_SERVER_ISSUER, &pair.private_pem, lifetime)
    }

    /// The upload proxy's public key, cached briefly.
    pub async fn proxy_public_key(&self) -> Result<Vec<u8>, TokenError> {
        self.cached_bundle_key(&self.proxy_key, UPLOAD_PROXY_SIGNER_BUNDLE, PROXY_PUBLIC_KEY_ENTRY)
            .await
    }

    /// The API server's public key as published for the controllers.
    pub async fn api_public_key(&self) -> Result<Vec<u8>, TokenError> {
        self.cached_bundle_key(&self.api_key, API_SIGNER_BUNDLE, PUBLIC_KEY_ENTRY)
            .await
    }

    pub async fn clone_token_validator(&self) -> Result<Validator, TokenError> {
        let pem = self.api_public_key().await?;
        Validator::new(API_SERVER_ISSUER, &pem, CLONE_TOKEN_LEEWAY)
    }

    /// Signs extended clone tokens with the API key, loading it from its
    /// Secret when this process has not seen it yet.
    pub async fn extended_clone_token_generator(&self) -> Result<Generator, TokenError> {
        if !self.is_available() {
            self.refresh_signing_key().await?;
        }
        let pair = self.signing_key()?;
        Generator::new(
            EXTENDED_CLONE_TOKEN_ISSUER,
            &pair.private_pem,
            EXTENDED_CLONE_TOKEN_LIFETIME,
        )
    }

    pub async fn extended_clone_token_validator(&self) -> Result<Validator, TokenError> {
        let pem = self.api_public_key().await?;
        Validator::new(EXTENDED_CLONE_TOKEN_ISSUER, &pem, CLONE_TOKEN_LEEWAY)
    }

    async fn cached_bundle_key(
        &self,
        cache: &Mutex<Option<CachedKey>>,
        config_map: &str,
        entry: &str,
    ) -> Result<Vec<u8>, TokenError> {
        {
            let guard = cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(cached) = guard.as_ref() {
                if cached.fetched.elapsed() < PUBLIC_KEY_CACHE_TTL {
                    return Ok(cached.pem.clone());
                }
            }
        }
        let bundle = self
            .config_maps
            .get(&self.namespace, config_map)
            .await
            .map_err(|err| TokenError::Key(format!("{config_map}: {err}")))?;
        let pem = bundle
            .data
            .get(entry)
            .map(|value| value.as_bytes().to_vec())
            .ok_or_else(|| TokenError::Key(format!("{config_map} has no {entry}")))?;
        *cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(CachedKey {
            fetched: Instant::now(),
            pem: pem.clone(),
        });
        Ok(pem)
    }

    /// Follows the signing Secret so a deletion takes the key out of service.
    pub async fn watch_signing_key(
        self: Arc<Self>,
        client: Arc<dyn ClusterClient>,
        shutdown: CancellationToken,
    ) {
        loop {
            let mut events = match client.watch(ResourceKind::Secret).await {
                Ok(events) => events,
                Err(err) => {
                    let error = err.to_string();
                    log_warn(COMPONENT, "Failed to watch secrets", &[("error", error.as_str())]);
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
                            if name == Some(SIGNING_KEY_SECRET) && namespace == Some(self.namespace.as_str()) {
                                if let Err(err) = self.refresh_signing_key().await {
                                    let error = err.to_string();
                                    log_warn(COMPONENT, "Failed to refresh signing key", &[("error", error.as_str())]);
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

fn pair_from_secret(secret: &Secret) -> Result<SigningKeyPair, TokenError> {
    let private_pem = secret
        .decoded(PRIVATE_KEY_ENTRY)
        .ok_or_else(|| TokenError::Key(format!("{SIGNING_KEY_SECRET} has no {PRIVATE_KEY_ENTRY}")))?;
    let public_pem = match secret.decoded(PUBLIC_KEY_ENTRY) {
        Some(pem) => pem,
        None => Rsa::private_key_from_pem(&private_pem)
            .and_then(|rsa| rsa.public_key_to_pem())
            .map_err(|err| TokenError::Key(err.to_string()))?,
    };
    Ok(SigningKeyPair {
        private_pem,
        public_pem,
    })
}
