//! Key derivation: backup secret → backup key (Argon2id), plus verifiers

use argon2::{Algorithm, Argon2, Params, Version};
use chatvault_core::key_record::{KdfParams, KeyRecord, KeySalt, KeyVerifier, SALT_SIZE};
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::keys::derive_verifier_key;
use crate::secret::BackupSecret;
use crate::KEY_SIZE;

const VERIFIER_CONSTANT: &[u8] = b"chatvault key verifier v1";

/// A 256-bit backup key derived from the user's secret via Argon2id.
///
/// Zeroized on drop. Deliberately not `Clone`: every copy is one more
/// place the key would have to be wiped.
pub struct BackupKey {
    bytes: [u8; KEY_SIZE],
}

impl BackupKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for BackupKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for BackupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a fresh random per-key salt.
pub fn generate_salt() -> KeySalt {
    let mut bytes = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    KeySalt::from_bytes(bytes)
}

/// Derive the backup key from a secret. The secret is validated first and
/// consumed, so it is wiped as soon as derivation returns.
pub fn derive_key(
    secret: BackupSecret,
    salt: &KeySalt,
    params: &KdfParams,
) -> Result<BackupKey, CryptoError> {
    secret.validate()?;

    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| CryptoError::Kdf(format!("invalid Argon2id params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut okm = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(secret.expose().as_bytes(), salt.as_bytes(), &mut okm)
        .map_err(|e| CryptoError::Kdf(format!("Argon2id failed: {e}")))?;
    drop(secret);

    let key = BackupKey::from_bytes(okm);
    okm.zeroize();
    Ok(key)
}

/// Compute the non-reversible verifier for `key`.
pub fn make_verifier(key: &BackupKey) -> Result<KeyVerifier, CryptoError> {
    let subkey = derive_verifier_key(key)?;
    let hash = blake3::keyed_hash(subkey.as_bytes(), VERIFIER_CONSTANT);
    Ok(KeyVerifier::from_bytes(*hash.as_bytes()))
}

/// Constant-time check of `key` against a stored verifier.
pub fn key_matches(key: &BackupKey, verifier: &KeyVerifier) -> Result<bool, CryptoError> {
    Ok(make_verifier(key)? == *verifier)
}

/// Re-derive from `secret` and report whether it matches `verifier`.
///
/// A weak secret is still an error: it could never have been accepted.
pub fn verify(
    secret: BackupSecret,
    salt: &KeySalt,
    params: &KdfParams,
    verifier: &KeyVerifier,
) -> Result<bool, CryptoError> {
    let key = derive_key(secret, salt, params)?;
    key_matches(&key, verifier)
}

/// Set up a brand-new key: fresh salt, derived key, verifier record.
pub fn create_key_record(
    secret: BackupSecret,
    params: &KdfParams,
    created_at: u64,
) -> Result<(BackupKey, KeyRecord), CryptoError> {
    let salt = generate_salt();
    let key = derive_key(secret, &salt, params)?;
    let verifier = make_verifier(&key)?;
    Ok((key, KeyRecord::new(salt, *params, verifier, created_at)))
}

/// Derive the key for an existing record, failing with `InvalidSecret` when
/// the secret does not reproduce the stored verifier.
pub fn unlock(secret: BackupSecret, record: &KeyRecord) -> Result<BackupKey, CryptoError> {
    let key = derive_key(secret, &record.salt, &record.params)?;
    if !key_matches(&key, &record.verifier)? {
        return Err(CryptoError::InvalidSecret);
    }
    Ok(key)
}
