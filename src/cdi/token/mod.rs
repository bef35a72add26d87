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

//! Capability tokens: PS512-signed JWS binding an operation on one resource
//! to a bounded time window. Upload tokens are additionally wrapped in a JWE
//! for the upload proxy (see [`jwe`]).

pub mod jwe;
pub mod keys;

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::time::Duration;

pub const API_SERVER_ISSUER: &str = "cdi-apiserver";
/// Issuer of the long-lived clone tokens the controller mints for a
/// DataVolume once its admission token has been checked.
pub const EXTENDED_CLONE_TOKEN_ISSUER: &str = "cdi-extended-clone";
pub const CLONE_TOKEN_LIFETIME: Duration = Duration::from_secs(5 * 60);
pub const EXTENDED_CLONE_TOKEN_LIFETIME: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);
pub const UPLOAD_TOKEN_LIFETIME: Duration = Duration::from_secs(5 * 60);
pub const CLONE_TOKEN_LEEWAY: Duration = Duration::from_secs(10);
pub const UPLOAD_TOKEN_LEEWAY: Duration = Duration::from_secs(5 * 60);

pub const PARAM_TARGET_NAMESPACE: &str = "targetNamespace";
pub const PARAM_TARGET_NAME: &str = "targetName";
pub const PARAM_UID: &str = "uid";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Upload,
    Clone,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupVersionResource {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl GroupVersionResource {
    pub fn claims() -> Self {
        GroupVersionResource {
            group: String::new(),
            version: "v1".to_string(),
            resource: "persistentvolumeclaims".to_string(),
        }
    }
}

/// Token payload; `params` carries operation-specific bindings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub operation: Operation,
    pub name: String,
    pub namespace: String,
    pub resource: GroupVersionResource,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, String>,
}

impl Payload {
    pub fn upload(namespace: &str, name: &str) -> Self {
        Payload {
            operation: Operation::Upload,
            name: name.to_string(),
            namespace: namespace.to_string(),
            resource: GroupVersionResource::claims(),
            params: HashMap::new(),
        }
    }

    /// Clone capability for reading `source` on behalf of `target`.
    pub fn clone_source(
        source_namespace: &str,
        source_name: &str,
        target_namespace: &str,
        target_name: &str,
    ) -> Self {
        Payload {
            operation: Operation::Clone,
            name: source_name.to_string(),
            namespace: source_namespace.to_string(),
            resource: GroupVersionResource::claims(),
            params: HashMap::from([
                (PARAM_TARGET_NAMESPACE.to_string(), target_namespace.to_string()),
                (PARAM_TARGET_NAME.to_string(), target_name.to_string()),
            ]),
        }
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Checks that a clone payload binds exactly this source and target.
    pub fn verify_clone(
        &self,
        source_namespace: &str,
        source_name: &str,
        target_namespace: &str,
        target_name: &str,
        target_uid: Option<&str>,
    ) -> Result<(), TokenError> {
        if self.operation != Operation::Clone {
            return Err(TokenError::Mismatch("operation is not clone".to_string()));
        }
        if self.resource.resource != "persistentvolumeclaims" {
            return Err(TokenError::Mismatch(format!(
                "unexpected resource {}",
                self.resource.resource
            )));
        }
        if self.namespace != source_namespace || self.name != source_name {
            return Err(TokenError::Mismatch("source does not match".to_string()));
        }
        if self.param(PARAM_TARGET_NAMESPACE) != Some(target_namespace)
            || self.param(PARAM_TARGET_NAME) != Some(target_name)
        {
            return Err(TokenError::Mismatch("target does not match".to_string()));
        }
        if let Some(uid) = self.param(PARAM_UID) {
            if target_uid != Some(uid) {
                return Err(TokenError::Mismatch("target uid does not match".to_string()));
            }
        }
        Ok(())
    }

    pub fn verify_upload(&self, namespace: &str, name: &str) -> Result<(), TokenError> {
        if self.operation != Operation::Upload
            || self.resource.resource != "persistentvolumeclaims"
            || self.namespace != namespace
            || self.name != name
        {
            return Err(TokenError::Mismatch(format!(
                "token is not valid for {namespace}/{name}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Bad signature, malformed token, wrong issuer or premature use.
    Invalid(String),
    Expired,
    /// Valid token whose payload does not bind the requested operation.
    Mismatch(String),
    Key(String),
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenError::Invalid(reason) => write!(f, "token invalid: {reason}"),
            TokenError::Expired => write!(f, "token expired"),
            TokenError::Mismatch(reason) => write!(f, "token mismatch: {reason}"),
            TokenError::Key(reason) => write!(f, "key error: {reason}"),
        }
    }
}

impl Error for TokenError {}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    #[serde(flatten)]
    payload: Payload,
    iss: String,
    iat: f64,
    nbf: f64,
    exp: f64,
}

fn now_seconds() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

pub struct Generator {
    issuer: String,
    key: EncodingKey,
    lifetime: Duration,
}

impl Generator {
    pub fn new(issuer: &str, private_key_pem: &[u8], lifetime: Duration) -> Result<Self, TokenError> {
        let key = EncodingKey::from_rsa_pem(private_key_pem)
            .map_err(|err| TokenError::Key(err.to_string()))?;
        Ok(Generator {
            issuer: issuer.to_string(),
            key,
            lifetime,
        })
    }

    pub fn generate(&self, payload: &Payload) -> Result<String, TokenError> {
        let issued = now_seconds();
        let claims = Claims {
            payload: payload.clone(),
            iss: self.issuer.clone(),
            iat: issued,
            nbf: issued,
            exp: issued + self.lifetime.as_secs_f64(),
        };
        encode(&Header::new(Algorithm::PS512), &claims, &self.key)
            .map_err(|err| TokenError::Key(err.to_string()))
    }
}

pub struct Validator {
    issuer: String,
    key: DecodingKey,
    leeway: Duration,
}

impl Validator {
    pub fn new(issuer: &str, public_key_pem: &[u8], leeway: Duration) -> Result<Self, TokenError> {
        let key = DecodingKey::from_rsa_pem(public_key_pem)
            .map_err(|err| TokenError::Key(err.to_string()))?;
        Ok(Validator {
            issuer: issuer.to_string(),
            key,
            leeway,
        })
    }

    pub fn validate(&self, token: &str) -> Result<Payload, TokenError> {
        let mut validation = Validation::new(Algorithm::PS512);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.set_required_spec_claims(&["iss"]);
        validation.set_issuer(&[self.issuer.as_str()]);

        let data = decode::<Claims>(token, &self.key, &validation).map_err(|err| match err.kind() {
            ErrorKind::InvalidIssuer => TokenError::Invalid("issuer mismatch".to_string()),
            ErrorKind::InvalidSignature => TokenError::Invalid("signature mismatch".to_string()),
            _ => TokenError::Invalid(err.to_string()),
        })?;
        let claims = data.claims;

        // Fractional NumericDates keep sub-second lifetimes meaningful.
        let now = now_seconds();
        let leeway = self.leeway.as_secs_f64();
        if now + leeway < claims.nbf || now + leeway < claims.iat {
            return Err(TokenError::Invalid("token used before issued".to_string()));
        }
        if now - leeway > claims.exp {
            return Err(TokenError::Expired);
        }
        Ok(claims.payload)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cdi::token::keys::generate_key_pair;
    use std::sync::OnceLock;

    pub(crate) fn test_keys() -> &'static keys::SigningKeyPair {
        static KEYS: OnceLock<keys::SigningKeyPair> = OnceLock::new();
        KEYS.get_or_init(|| generate_key_pair().expect("key pair"))
    }

    fn upload_payload() -> Payload {
        Payload::upload("fakenamespace", "fakepvc")
    }

    #[test]
    fn round_trip_preserves_payload() {
        let keys = test_keys();
        let generator = Generator::new("issuer", &keys.private_pem, Duration::from_secs(300)).unwrap();
        let validator = Validator::new("issuer", &keys.public_pem, Duration::ZERO).unwrap();
        let payload = Payload::clone_source("src-ns", "src", "dst-ns", "dst").with_param(PARAM_UID, "1234");
        let token = generator.generate(&payload).unwrap();
        assert_eq!(validator.validate(&token).unwrap(), payload);
    }

    #[test]
    fn short_lifetime_expires() {
        let keys = test_keys();
        let generator = Generator::new("issuer", &keys.private_pem, Duration::from_millis(200)).unwrap();
        let validator = Validator::new("issuer", &keys.public_pem, Duration::ZERO).unwrap();
        let token = generator.generate(&upload_payload()).unwrap();
        std::thread::sleep(Duration::from_secs(1));
        assert_eq!(validator.validate(&token), Err(TokenError::Expired));
    }

    #[test]
    fn wrong_issuer_is_rejected() {
        let keys = test_keys();
        let generator = Generator::new("foo", &keys.private_pem, Duration::from_secs(300)).unwrap();
        let validator = Validator::new("bar", &keys.public_pem, Duration::ZERO).unwrap();
        let token = generator.generate(&upload_payload()).unwrap();
        assert!(matches!(validator.validate(&token), Err(TokenError::Invalid(_))));
    }

    #[test]
    fn other_key_is_rejected() {
        let keys = test_keys();
        let other = generate_key_pair().unwrap();
        let generator = Generator::new("issuer", &keys.private_pem, Duration::from_secs(300)).unwrap();
        let validator = Validator::new("issuer", &other.public_pem, Duration::ZERO).unwrap();
        let token = generator.generate(&upload_payload()).unwrap();
        assert!(matches!(validator.validate(&token), Err(TokenError::Invalid(_))));
    }

    #[test]
    fn any_altered_byte_fails_validation() {
        let keys = test_keys();
        let generator = Generator::new("issuer", &keys.private_pem, Duration::from_secs(300)).unwrap();
        let validator = Validator::new("issuer", &keys.public_pem, Duration::ZERO).unwrap();
        let token = generator.generate(&upload_payload()).unwrap();
        let bytes = token.as_bytes();
        for index in (0..bytes.len()).step_by(7) {
            let mut altered = bytes.to_vec();
            altered[index] = if altered[index] == b'A' { b'B' } else { b'A' };
            let altered = String::from_utf8(altered).unwrap();
            if altered == token {
                continue;
            }
            assert!(validator.validate(&altered).is_err(), "byte {index} accepted");
        }
    }

    #[test]
    fn clone_payload_must_bind_target() {
        let payload = Payload::clone_source("a", "src", "b", "dst");
        assert!(payload.verify_clone("a", "src", "b", "dst", None).is_ok());
        assert!(payload.verify_clone("a", "src", "b", "other", None).is_err());
        let bound = payload.with_param(PARAM_UID, "uid-1");
        assert!(bound.verify_clone("a", "src", "b", "dst", Some("uid-1")).is_ok());
        assert!(matches!(
            bound.verify_clone("a", "src", "b", "dst", Some("uid-2")),
            Err(TokenError::Mismatch(_))
        ));
        assert!(Payload::upload("a", "src").verify_clone("a", "src", "b", "dst", None).is_err());
    }
}
