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

//! TLS termination for the API listener. The serving pair is read from the
//! certificate directory and the acceptor is rebuilt whenever the files or
//! the trusted client CAs change.

use std::fs;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use openssl::pkey::PKey;
use openssl::ssl::{select_next_proto, AlpnError, Ssl, SslAcceptor, SslMethod, SslVerifyMode};
use openssl::stack::Stack;
use openssl::x509::{X509Name, X509};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;
use tokio_util::sync::CancellationToken;

use super::auth::AuthGate;
use crate::cdi::config::Config;
use crate::cdi::logger::{log_info, log_warn};
use crate::cdi::util::error::{with_context, DynError};

const COMPONENT: &str = "tls";
const RELOAD_INTERVAL: Duration = Duration::from_secs(10);
const ALPN_PROTO_LIST: &[u8] = b"\x08http/1.1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl CertificatePaths {
    pub fn in_dir(dir: &Path) -> Self {
        CertificatePaths {
            cert: dir.join("tls.crt"),
            key: dir.join("tls.key"),
        }
    }

    pub fn from_config() -> Self {
        Self::in_dir(&Config::CertDir.get_path())
    }

    fn modified(&self) -> Option<(SystemTime, SystemTime)> {
        let cert = fs::metadata(&self.cert).and_then(|meta| meta.modified()).ok()?;
        let key = fs::metadata(&self.key).and_then(|meta| meta.modified()).ok()?;
        Some((cert, key))
    }
}

/// Builds an acceptor serving `cert_pem`. Client certificates are requested
/// but never fail the handshake; callers inspect the verify result.
pub fn build_acceptor(cert_pem: &[u8], key_pem: &[u8], client_cas: &[X509]) -> Result<SslAcceptor, DynError> {
    let mut chain = X509::stack_from_pem(cert_pem)
        .map_err(|e| with_context(e, "Failed to parse serving certificate PEM"))?
        .into_iter();
    let leaf = chain
        .next()
        .ok_or_else(|| crate::cdi::util::error::new_error("Serving certificate PEM is empty"))?;
    let key = PKey::private_key_from_pem(key_pem)
        .map_err(|e| with_context(e, "Failed to parse serving private key PEM"))?;

    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())
        .map_err(|e| with_context(e, "Failed to initialize TLS acceptor builder"))?;
    builder
        .set_private_key(&key)
        .map_err(|e| with_context(e, "Failed to attach serving private key"))?;
    builder
        .set_certificate(&leaf)
        .map_err(|e| with_context(e, "Failed to attach serving certificate"))?;
    for intermediate in chain {
        builder
            .add_extra_chain_cert(intermediate)
            .map_err(|e| with_context(e, "Failed to attach certificate chain"))?;
    }
    builder
        .check_private_key()
        .map_err(|e| with_context(e, "Serving certificate and key mismatch"))?;

    let mut names = Stack::<X509Name>::new().map_err(|e| with_context(e, "Failed to prepare client CA list"))?;
    for ca in client_cas {
        builder
            .cert_store_mut()
            .add_cert(ca.clone())
            .map_err(|e| with_context(e, "Failed to add client CA to certificate store"))?;
        let subject = ca
            .subject_name()
            .to_owned()
            .map_err(|e| with_context(e, "Failed to copy client CA subject"))?;
        names
            .push(subject)
            .map_err(|e| with_context(e, "Failed to register client CA subject"))?;
    }
    if !client_cas.is_empty() {
        builder.set_client_ca_list(names);
        builder.set_verify_callback(SslVerifyMode::PEER, |_, _| true);
    }

    builder
        .set_session_id_context(b"cdi-apiserver")
        .map_err(|e| with_context(e, "Failed to set TLS session context"))?;
    builder
        .set_alpn_protos(ALPN_PROTO_LIST)
        .map_err(|e| with_context(e, "Failed to configure ALPN protocols"))?;
    builder.set_alpn_select_callback(|_, client| select_next_proto(client, ALPN_PROTO_LIST).ok_or(AlpnError::NOACK));

    Ok(builder.build())
}

pub async fn accept_with_tls(acceptor: &SslAcceptor, stream: TcpStream) -> Result<SslStream<TcpStream>, DynError> {
    let ssl = Ssl::new(acceptor.context()).map_err(|e| with_context(e, "Failed to initialize TLS session"))?;
    let mut tls_stream =
        SslStream::new(ssl, stream).map_err(|e| with_context(e, "Failed to bind TLS stream to socket"))?;
    Pin::new(&mut tls_stream)
        .accept()
        .await
        .map_err(|e| with_context(e, "TLS handshake failed"))?;
    Ok(tls_stream)
}

/// Current acceptor plus what it was built from.
struct Loaded {
    acceptor: Arc<SslAcceptor>,
    modified: Option<(SystemTime, SystemTime)>,
    client_cas: Vec<Vec<u8>>,
}

pub struct TlsReloader {
    paths: CertificatePaths,
    gate: Arc<AuthGate>,
    loaded: RwLock<Loaded>,
}

fn ca_fingerprints(cas: &[X509]) -> Vec<Vec<u8>> {
    cas.iter().filter_map(|ca| ca.to_der().ok()).collect()
}

impl TlsReloader {
    pub fn load(paths: CertificatePaths, gate: Arc<AuthGate>) -> Result<Self, DynError> {
        let client_cas = gate.config().trusted_cas();
        let (acceptor, modified) = Self::build(&paths, &client_cas)?;
        Ok(TlsReloader {
            paths,
            gate,
            loaded: RwLock::new(Loaded {
                acceptor: Arc::new(acceptor),
                modified,
                client_cas: ca_fingerprints(&client_cas),
            }),
        })
    }

    fn build(
        paths: &CertificatePaths,
        client_cas: &[X509],
    ) -> Result<(SslAcceptor, Option<(SystemTime, SystemTime)>), DynError> {
        let modified = paths.modified();
        let cert = fs::read(&paths.cert)
            .map_err(|e| with_context(e, format!("Failed to read {}", paths.cert.display())))?;
        let key =
            fs::read(&paths.key).map_err(|e| with_context(e, format!("Failed to read {}", paths.key.display())))?;
        Ok((build_acceptor(&cert, &key, client_cas)?, modified))
    }

    pub fn acceptor(&self) -> Arc<SslAcceptor> {
        Arc::clone(&self.loaded.read().unwrap_or_else(|poisoned| poisoned.into_inner()).acceptor)
    }

    /// Rebuilds the acceptor when its inputs changed. Returns whether a
    /// new acceptor was installed; on failure the previous one stays.
    pub fn reload_if_changed(&self) -> Result<bool, DynError> {
        let client_cas = self.gate.config().trusted_cas();
        let fingerprints = ca_fingerprints(&client_cas);
        let modified = self.paths.modified();
        {
            let loaded = self.loaded.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            if loaded.modified == modified && loaded.client_cas == fingerprints {
                return Ok(false);
            }
        }
        let (acceptor, modified) = Self::build(&self.paths, &client_cas)?;
        let mut loaded = self.loaded.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *loaded = Loaded {
            acceptor: Arc::new(acceptor),
            modified,
            client_cas: fingerprints,
        };
        Ok(true)
    }

    pub async fn watch(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(RELOAD_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match self.reload_if_changed() {
                Ok(true) => log_info(COMPONENT, "Reloaded serving certificate", &[]),
                Ok(false) => {}
                Err(err) => {
                    let error = err.to_string();
                    log_warn(COMPONENT, "Failed to reload serving certificate", &[("error", error.as_str())]);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use openssl::asn1::Asn1Time;
    use openssl::bn::BigNum;
    use openssl::hash::MessageDigest;
    use openssl::pkey::{PKey, Private};
    use openssl::rsa::Rsa;
    use openssl::x509::{X509Builder, X509NameBuilder, X509};

    /// Issues a certificate for `common_name`, self-signed when no issuer is given.
    pub fn issue(
        common_name: &str,
        organization: Option<&str>,
        issuer: Option<(&X509, &PKey<Private>)>,
    ) -> (X509, PKey<Private>) {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", common_name).unwrap();
        if let Some(organization) = organization {
            name.append_entry_by_text("O", organization).unwrap();
        }
        let name = name.build();
        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
        builder.set_not_after(&Asn1Time::days_from_now(30).unwrap()).unwrap();
        match issuer {
            Some((ca, ca_key)) => {
                builder.set_issuer_name(ca.subject_name()).unwrap();
                builder.sign(ca_key, MessageDigest::sha256()).unwrap();
            }
            None => {
                builder.set_issuer_name(&name).unwrap();
                builder.sign(&key, MessageDigest::sha256()).unwrap();
            }
        }
        (builder.build(), key)
    }
}
