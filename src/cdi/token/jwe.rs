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

//! Compact JWE (`RSA-OAEP` key wrap, `A256GCM` content) used to seal upload
//! tokens so only the upload proxy can read them.

use super::TokenError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use openssl::pkey::{Private, Public};
use openssl::rand::rand_bytes;
use openssl::rsa::{Padding, Rsa};
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};
use serde::{Deserialize, Serialize};

const KEY_LEN: usize = 32;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct JweHeader {
    alg: String,
    enc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cty: Option<String>,
}

fn key_error(err: impl std::fmt::Display) -> TokenError {
    TokenError::Key(err.to_string())
}

fn invalid(reason: &str) -> TokenError {
    TokenError::Invalid(reason.to_string())
}

/// Seals `plaintext` (a compact JWS) for the holder of `public_key_pem`.
pub fn encrypt(plaintext: &str, public_key_pem: &[u8]) -> Result<String, TokenError> {
    let rsa: Rsa<Public> = Rsa::public_key_from_pem(public_key_pem).map_err(key_error)?;
    let header = JweHeader {
        alg: "RSA-OAEP".to_string(),
        enc: "A256GCM".to_string(),
        cty: Some("JWT".to_string()),
    };
    let protected = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).map_err(key_error)?);

    let mut cek = [0u8; KEY_LEN];
    let mut iv = [0u8; IV_LEN];
    rand_bytes(&mut cek).map_err(key_error)?;
    rand_bytes(&mut iv).map_err(key_error)?;

    let mut encrypted_key = vec![0u8; rsa.size() as usize];
    let written = rsa
        .public_encrypt(&cek, &mut encrypted_key, Padding::PKCS1_OAEP)
        .map_err(key_error)?;
    encrypted_key.truncate(written);

    let mut tag = [0u8; TAG_LEN];
    let ciphertext = encrypt_aead(
        Cipher::aes_256_gcm(),
        &cek,
        Some(&iv),
        protected.as_bytes(),
        plaintext.as_bytes(),
        &mut tag,
    )
    .map_err(key_error)?;

    Ok(format!(
        "{}.{}.{}.{}.{}",
        protected,
        URL_SAFE_NO_PAD.encode(encrypted_key),
        URL_SAFE_NO_PAD.encode(iv),
        URL_SAFE_NO_PAD.encode(ciphertext),
        URL_SAFE_NO_PAD.encode(tag)
    ))
}

/// Opens a compact JWE produced by [`encrypt`].
pub fn decrypt(token: &str, private_key_pem: &[u8]) -> Result<String, TokenError> {
    let parts: Vec<&str> = token.split('.').collect();
    let &[protected, encrypted_key, iv, ciphertext, tag] = parts.as_slice() else {
        return Err(invalid("expected five JWE segments"));
    };
    let decode = |segment: &str| {
        URL_SAFE_NO_PAD
            .decode(segment)
            .map_err(|_| invalid("malformed JWE segment"))
    };

    let header: JweHeader = serde_json::from_slice(&decode(protected)?)
        .map_err(|_| invalid("malformed JWE header"))?;
    if header.alg != "RSA-OAEP" || header.enc != "A256GCM" {
        return Err(invalid("unsupported JWE algorithm"));
    }

    let rsa: Rsa<Private> = Rsa::private_key_from_pem(private_key_pem).map_err(key_error)?;
    let encrypted_key = decode(encrypted_key)?;
    let mut cek = vec![0u8; rsa.size() as usize];
    let written = rsa
        .private_decrypt(&encrypted_key, &mut cek, Padding::PKCS1_OAEP)
        .map_err(|_| invalid("content key does not decrypt"))?;
    cek.truncate(written);
    if cek.len() != KEY_LEN {
        return Err(invalid("unexpected content key length"));
    }

    let iv = decode(iv)?;
    let tag = decode(tag)?;
    if iv.len() != IV_LEN || tag.len() != TAG_LEN {
        return Err(invalid("unexpected IV or tag length"));
    }
    let plaintext = decrypt_aead(
        Cipher::aes_256_gcm(),
        &cek,
        Some(&iv),
        protected.as_bytes(),
        &decode(ciphertext)?,
        &tag,
    )
    .map_err(|_| invalid("content does not authenticate"))?;
    String::from_utf8(plaintext).map_err(|_| invalid("content is not UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdi::token::tests::test_keys;
    use crate::cdi::token::{Generator, Payload, Validator, UPLOAD_TOKEN_LEEWAY};
    use std::time::Duration;

    #[test]
    fn sealed_token_opens_and_validates() {
        let keys = test_keys();
        let proxy = crate::cdi::token::keys::generate_key_pair().expect("proxy key");
        let generator = Generator::new("cdi-apiserver", &keys.private_pem, Duration::from_secs(300)).unwrap();
        let signed = generator.generate(&Payload::upload("ns", "target")).unwrap();

        let sealed = encrypt(&signed, &proxy.public_pem).unwrap();
        assert_eq!(sealed.split('.').count(), 5);
        let opened = decrypt(&sealed, &proxy.private_pem).unwrap();
        assert_eq!(opened, signed);

        let validator = Validator::new("cdi-apiserver", &keys.public_pem, UPLOAD_TOKEN_LEEWAY).unwrap();
        let payload = validator.validate(&opened).unwrap();
        assert!(payload.verify_upload("ns", "target").is_ok());
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let proxy = crate::cdi::token::keys::generate_key_pair().expect("proxy key");
        let sealed = encrypt("payload", &proxy.public_pem).unwrap();
        let mut parts: Vec<String> = sealed.split('.').map(str::to_string).collect();
        let mut body = URL_SAFE_NO_PAD.decode(&parts[3]).unwrap();
        body[0] ^= 0x01;
        parts[3] = URL_SAFE_NO_PAD.encode(body);
        assert!(decrypt(&parts.join("."), &proxy.private_pem).is_err());

        let other = crate::cdi::token::keys::generate_key_pair().expect("other key");
        assert!(decrypt(&sealed, &other.private_pem).is_err());
    }
}
