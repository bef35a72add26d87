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

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};

/// Maximum length of a DNS-1123 label, which bounds pod and service names.
pub const MAX_LABEL_LENGTH: usize = 63;

/// Joins `base` and `suffix` with a dash, shortening `base` with a stable hash
/// when the result would exceed a DNS label.
pub fn resource_name(base: &str, suffix: &str) -> String {
    let joined = format!("{base}-{suffix}");
    if joined.len() <= MAX_LABEL_LENGTH {
        return joined;
    }
    let digest = hex::encode(Sha256::digest(base.as_bytes()));
    let hash = &digest[..8];
    let room = MAX_LABEL_LENGTH.saturating_sub(suffix.len() + hash.len() + 2);
    let prefix: String = base.chars().take(room).collect();
    let prefix = prefix.trim_end_matches('-');
    format!("{prefix}-{hash}-{suffix}")
}

/// Random lowercase alphanumeric suffix used for `generateName` style objects.
pub fn random_suffix(len: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}

/// RFC 4122 version-4 style identifier.
pub fn new_uid() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names_are_joined_verbatim() {
        assert_eq!(resource_name("dv1", "scratch"), "dv1-scratch");
    }

    #[test]
    fn long_names_are_hashed_and_bounded() {
        let base = "a".repeat(80);
        let first = resource_name(&base, "importer");
        let second = resource_name(&base, "importer");
        assert_eq!(first, second);
        assert!(first.len() <= MAX_LABEL_LENGTH);
        assert!(first.ends_with("-importer"));
    }

    #[test]
    fn uids_are_unique_and_well_formed() {
        let a = new_uid();
        let b = new_uid();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
        assert_eq!(a.matches('-').count(), 4);
    }
}
