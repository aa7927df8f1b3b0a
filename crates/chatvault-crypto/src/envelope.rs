//! Per-chunk XChaCha20-Poly1305 envelope
//!
//! Sealed chunk format (binary):
//! ```text
//! [24 bytes: nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! nonce = manifest_id (16 bytes) || sequence (8 bytes, big-endian)
//! AAD   = "chatvault-chunk-v1" || manifest_id || sequence (8 bytes, big-endian)
//! ```
//!
//! The manifest id is derived from the archive content, so a nonce is only
//! ever reused for the exact same plaintext. The AAD binds each chunk to its
//! backup and position: a chunk moved to another slot or another backup
//! fails authentication.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use chatvault_core::types::BackupId;
use chatvault_core::wire::EncryptedChunk;

use crate::error::CryptoError;
use crate::kdf::BackupKey;
use crate::keys::derive_chunk_key;
use crate::{NONCE_SIZE, TAG_SIZE};

const CHUNK_DOMAIN: &[u8] = b"chatvault-chunk-v1";

/// Position of a chunk: the backup it belongs to and its index there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAad {
    pub manifest_id: BackupId,
    pub sequence: u64,
}

impl ChunkAad {
    pub fn new(manifest_id: BackupId, sequence: u64) -> Self {
        Self {
            manifest_id,
            sequence,
        }
    }

    pub fn nonce(&self) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..BackupId::LEN].copy_from_slice(self.manifest_id.as_bytes());
        nonce[BackupId::LEN..].copy_from_slice(&self.sequence.to_be_bytes());
        nonce
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(CHUNK_DOMAIN.len() + BackupId::LEN + 8);
        aad.extend_from_slice(CHUNK_DOMAIN);
        aad.extend_from_slice(self.manifest_id.as_bytes());
        aad.extend_from_slice(&self.sequence.to_be_bytes());
        aad
    }

    /// Chunk id as recorded in the manifest
    pub fn chunk_id(&self) -> String {
        format!("{}-{}", self.manifest_id, self.sequence)
    }
}

/// Chunk cipher bound to one backup key's chunk sub-key.
pub struct EnvelopeCipher {
    cipher: XChaCha20Poly1305,
}

impl EnvelopeCipher {
    pub fn new(key: &BackupKey) -> Result<Self, CryptoError> {
        let subkey = derive_chunk_key(key)?;
        Ok(Self {
            cipher: XChaCha20Poly1305::new(subkey.as_bytes().into()),
        })
    }

    /// Seal a chunk payload at position `aad`.
    pub fn seal(&self, plaintext: &[u8], aad: &ChunkAad) -> Result<EncryptedChunk, CryptoError> {
        let nonce_bytes = aad.nonce();
        let aad_bytes = aad.to_bytes();
        let ciphertext = self
            .cipher
            .encrypt(
                XNonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &aad_bytes,
                },
            )
            .map_err(|e| CryptoError::Encoding(format!("chunk encryption failed: {e}")))?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        let blob_hash = blake3::hash(&blob).to_hex().to_string();

        Ok(EncryptedChunk {
            chunk_id: aad.chunk_id(),
            sequence: aad.sequence,
            blob,
            blob_hash,
        })
    }

    /// Open a sealed chunk expected at position `aad`.
    ///
    /// Any mismatch (key, position, nonce, tampered byte) is reported as
    /// `Authentication` with no partial plaintext.
    pub fn open(&self, chunk: &EncryptedChunk, aad: &ChunkAad) -> Result<Vec<u8>, CryptoError> {
        if chunk.blob.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::Authentication);
        }
        let expected_nonce = aad.nonce();
        if chunk.nonce() != expected_nonce {
            return Err(CryptoError::Authentication);
        }

        let aad_bytes = aad.to_bytes();
        self.cipher
            .decrypt(
                XNonce::from_slice(&expected_nonce),
                Payload {
                    msg: chunk.ciphertext(),
                    aad: &aad_bytes,
                },
            )
            .map_err(|_| CryptoError::Authentication)
    }
}

/// Seal one chunk with `key`. Prefer [`EnvelopeCipher`] for many chunks.
pub fn seal(
    key: &BackupKey,
    plaintext: &[u8],
    aad: &ChunkAad,
) -> Result<EncryptedChunk, CryptoError> {
    EnvelopeCipher::new(key)?.seal(plaintext, aad)
}

/// Open one chunk with `key`.
pub fn open(key: &BackupKey, chunk: &EncryptedChunk, aad: &ChunkAad) -> Result<Vec<u8>, CryptoError> {
    EnvelopeCipher::new(key)?.open(chunk, aad)
}
