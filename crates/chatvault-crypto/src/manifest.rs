//! Manifest body sealing
//!
//! The body (chunk list with plaintext digests, message index) is sealed
//! under the manifest sub-key. The public header is the associated data, so
//! any change to the header, including the blob list, breaks the tag.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use chatvault_core::encoding::base64_encode;
use chatvault_core::types::BackupId;
use chatvault_core::wire::{ManifestHeader, SealedManifest};

use crate::error::CryptoError;
use crate::kdf::{key_matches, BackupKey};
use crate::keys::derive_manifest_key;
use crate::{NONCE_SIZE, TAG_SIZE};

const MANIFEST_DOMAIN: &[u8] = b"chatvault-manifest-v1";

fn manifest_nonce(id: &BackupId) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..BackupId::LEN].copy_from_slice(id.as_bytes());
    // chunk sequences never reach u64::MAX, so this slot is reserved
    nonce[BackupId::LEN..].copy_from_slice(&u64::MAX.to_be_bytes());
    nonce
}

fn manifest_aad(header: &ManifestHeader) -> Result<Vec<u8>, CryptoError> {
    let canonical = header
        .canonical_bytes()
        .map_err(|e| CryptoError::Encoding(e.to_string()))?;
    let mut aad = Vec::with_capacity(MANIFEST_DOMAIN.len() + canonical.len());
    aad.extend_from_slice(MANIFEST_DOMAIN);
    aad.extend_from_slice(&canonical);
    Ok(aad)
}

/// Seal `body` under `key`, authenticating `header`.
pub fn seal_manifest(
    key: &BackupKey,
    header: ManifestHeader,
    body: &[u8],
) -> Result<SealedManifest, CryptoError> {
    let subkey = derive_manifest_key(key)?;
    let cipher = XChaCha20Poly1305::new(subkey.as_bytes().into());
    let nonce_bytes = manifest_nonce(&header.backup_id);
    let aad = manifest_aad(&header)?;

    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce_bytes),
            Payload { msg: body, aad: &aad },
        )
        .map_err(|e| CryptoError::Encoding(format!("manifest encryption failed: {e}")))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);

    Ok(SealedManifest {
        header,
        body: base64_encode(&sealed),
    })
}

/// Open a sealed manifest body. Every failure is `Authentication`.
pub fn open_manifest(key: &BackupKey, sealed: &SealedManifest) -> Result<Vec<u8>, CryptoError> {
    let data = sealed
        .body_bytes()
        .map_err(|_| CryptoError::Authentication)?;
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Authentication);
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    if nonce_bytes != manifest_nonce(&sealed.header.backup_id) {
        return Err(CryptoError::Authentication);
    }

    let subkey = derive_manifest_key(key)?;
    let cipher = XChaCha20Poly1305::new(subkey.as_bytes().into());
    let aad = manifest_aad(&sealed.header)?;

    cipher
        .decrypt(
            XNonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| CryptoError::Authentication)
}

/// Whether `key` is the key this manifest's header was sealed under.
pub fn header_matches_key(key: &BackupKey, header: &ManifestHeader) -> Result<bool, CryptoError> {
    key_matches(key, &header.key.verifier)
}
