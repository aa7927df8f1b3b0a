//! Public key metadata: salt, KDF parameters and verifier
//!
//! None of these values is secret. They are persisted locally, uploaded
//! next to the backups, and embedded in every sealed manifest header so an
//! archive always records the parameters it was made with.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::encoding::{base64_decode_array, base64_encode, hex_encode};

pub const SALT_SIZE: usize = 16;
pub const VERIFIER_SIZE: usize = 32;

/// Argon2id parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

/// Per-user random salt, generated once per key
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct KeySalt([u8; SALT_SIZE]);

impl KeySalt {
    pub fn from_bytes(bytes: [u8; SALT_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SALT_SIZE] {
        &self.0
    }
}

impl fmt::Debug for KeySalt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeySalt({})", hex_encode(&self.0))
    }
}

impl Serialize for KeySalt {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64_encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for KeySalt {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64_decode_array(&s)
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// Non-reversible value proving knowledge of the backup key.
///
/// Equality is constant time.
#[derive(Clone, Copy)]
pub struct KeyVerifier([u8; VERIFIER_SIZE]);

impl KeyVerifier {
    pub fn from_bytes(bytes: [u8; VERIFIER_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; VERIFIER_SIZE] {
        &self.0
    }

    /// Short public fingerprint used as a key identifier
    pub fn fingerprint(&self) -> String {
        hex_encode(&self.0[..8])
    }
}

impl PartialEq for KeyVerifier {
    fn eq(&self, other: &Self) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl Eq for KeyVerifier {}

impl fmt::Debug for KeyVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyVerifier({}..)", self.fingerprint())
    }
}

impl Serialize for KeyVerifier {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64_encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for KeyVerifier {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64_decode_array(&s)
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// Everything needed to re-derive and check a backup key, minus the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Fingerprint of the verifier
    pub key_id: String,
    pub salt: KeySalt,
    pub params: KdfParams,
    pub verifier: KeyVerifier,
    /// Unix timestamp (ms) when the key was set up
    pub created_at: u64,
}

impl KeyRecord {
    pub fn new(salt: KeySalt, params: KdfParams, verifier: KeyVerifier, created_at: u64) -> Self {
        Self {
            key_id: verifier.fingerprint(),
            salt,
            params,
            verifier,
            created_at,
        }
    }
}
