//! Sub-key hierarchy: backup key → purpose-bound keys via HKDF-SHA256

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::kdf::BackupKey;
use crate::KEY_SIZE;

const CHUNK_INFO: &[u8] = b"chatvault-chunks-v1";
const MANIFEST_INFO: &[u8] = b"chatvault-manifest-v1";
const VERIFIER_INFO: &[u8] = b"chatvault-verifier-v1";

/// A purpose-bound 256-bit key. Zeroized on drop.
pub struct SubKey {
    bytes: [u8; KEY_SIZE],
}

impl SubKey {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for SubKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SubKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubKey").field("bytes", &"[REDACTED]").finish()
    }
}

/// Key sealing chunk payloads.
pub fn derive_chunk_key(key: &BackupKey) -> Result<SubKey, CryptoError> {
    hkdf_derive(key.as_bytes(), CHUNK_INFO)
}

/// Key sealing manifest bodies.
pub fn derive_manifest_key(key: &BackupKey) -> Result<SubKey, CryptoError> {
    hkdf_derive(key.as_bytes(), MANIFEST_INFO)
}

/// Key for the public verifier. Never used for encryption.
pub fn derive_verifier_key(key: &BackupKey) -> Result<SubKey, CryptoError> {
    hkdf_derive(key.as_bytes(), VERIFIER_INFO)
}

fn hkdf_derive(ikm: &[u8; KEY_SIZE], info: &[u8]) -> Result<SubKey, CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| CryptoError::Kdf(format!("HKDF expand failed: {e}")))?;
    Ok(SubKey { bytes: okm })
}
