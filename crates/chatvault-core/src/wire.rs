//! Wire types: the only things a destination adapter ever stores.
//!
//! ```text
//! chunk blob      = [24 bytes: nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! sealed manifest = JSON { header, body }
//!                   header: public, authenticated as AAD of the body
//!                   body:   base64([24 bytes: nonce][sealed manifest JSON + tag])
//! ```

use serde::{Deserialize, Serialize};

use crate::encoding::base64_decode;
use crate::error::{ChatvaultError, ChatvaultResult};
use crate::key_record::KeyRecord;
use crate::types::{BackupId, BackupType};

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// A sealed chunk, ready for upload. Carries no key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedChunk {
    /// Chunk id as recorded in the manifest
    pub chunk_id: String,
    /// Zero-based sequence index within the manifest
    pub sequence: u64,
    /// `[nonce][ciphertext][tag]`
    pub blob: Vec<u8>,
    /// BLAKE3 of `blob` (hex), the storage key
    pub blob_hash: String,
}

impl EncryptedChunk {
    pub fn nonce(&self) -> &[u8] {
        &self.blob[..NONCE_SIZE.min(self.blob.len())]
    }

    /// Ciphertext including the trailing tag
    pub fn ciphertext(&self) -> &[u8] {
        &self.blob[NONCE_SIZE.min(self.blob.len())..]
    }

    pub fn len(&self) -> usize {
        self.blob.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blob.is_empty()
    }

    pub fn blob_ref(&self) -> BlobRef {
        BlobRef {
            sequence: self.sequence,
            hash: self.blob_hash.clone(),
            len: self.blob.len() as u64,
        }
    }
}

/// Public reference to a stored chunk blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub sequence: u64,
    /// BLAKE3 of the blob bytes (hex)
    pub hash: String,
    pub len: u64,
}

/// The public half of a sealed manifest.
///
/// Every field is bound to the encrypted body as associated data, so a
/// tampered blob list is detected before any chunk is fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestHeader {
    pub version: u32,
    pub backup_id: BackupId,
    /// Unix timestamp (ms)
    pub created_at: u64,
    pub backup_type: BackupType,
    pub parent_id: Option<BackupId>,
    /// Key the body and chunks are sealed under
    pub key: KeyRecord,
    /// Messages carried by this backup's own chunks
    pub message_count: u64,
    pub blobs: Vec<BlobRef>,
}

impl ManifestHeader {
    /// Canonical serialization used as AEAD associated data
    pub fn canonical_bytes(&self) -> ChatvaultResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| ChatvaultError::Encoding(format!("manifest header: {e}")))
    }

    /// Sum of stored blob sizes
    pub fn total_bytes(&self) -> u64 {
        self.blobs.iter().map(|b| b.len).sum()
    }
}

/// What the destination stores for each backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedManifest {
    pub header: ManifestHeader,
    /// base64 of `[nonce][ciphertext][tag]`
    pub body: String,
}

impl SealedManifest {
    pub fn backup_id(&self) -> BackupId {
        self.header.backup_id
    }

    pub fn body_bytes(&self) -> ChatvaultResult<Vec<u8>> {
        base64_decode(&self.body)
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> ChatvaultResult<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| ChatvaultError::Encoding(format!("sealed manifest serialization: {e}")))
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(data: &[u8]) -> ChatvaultResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| ChatvaultError::Encoding(format!("sealed manifest deserialization: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::base64_encode;
    use crate::key_record::{KdfParams, KeySalt, KeyVerifier};

    fn header() -> ManifestHeader {
        ManifestHeader {
            version: 1,
            backup_id: BackupId::from_bytes([3u8; 16]),
            created_at: 1000,
            backup_type: BackupType::Full,
            parent_id: None,
            key: KeyRecord::new(
                KeySalt::from_bytes([1u8; 16]),
                KdfParams::default(),
                KeyVerifier::from_bytes([2u8; 32]),
                5,
            ),
            message_count: 3,
            blobs: vec![
                BlobRef {
                    sequence: 0,
                    hash: "aa".into(),
                    len: 100,
                },
                BlobRef {
                    sequence: 1,
                    hash: "bb".into(),
                    len: 60,
                },
            ],
        }
    }

    #[test]
    fn test_sealed_manifest_roundtrip() {
        let sealed = SealedManifest {
            header: header(),
            body: base64_encode(b"opaque"),
        };
        let bytes = sealed.to_bytes().unwrap();
        let back = SealedManifest::from_bytes(&bytes).unwrap();
        assert_eq!(back, sealed);
        assert_eq!(back.body_bytes().unwrap(), b"opaque");
        assert_eq!(back.header.total_bytes(), 160);
    }

    #[test]
    fn test_canonical_bytes_change_with_blob_list() {
        let a = header();
        let mut b = header();
        b.blobs[1].hash = "cc".into();
        assert_ne!(a.canonical_bytes().unwrap(), b.canonical_bytes().unwrap());
        assert_eq!(a.canonical_bytes().unwrap(), header().canonical_bytes().unwrap());
    }

    #[test]
    fn test_chunk_accessors() {
        let mut blob = vec![1u8; NONCE_SIZE];
        blob.extend_from_slice(&[2u8; 20]);
        let chunk = EncryptedChunk {
            chunk_id: "x-0".into(),
            sequence: 0,
            blob,
            blob_hash: "h".into(),
        };
        assert_eq!(chunk.nonce(), &[1u8; NONCE_SIZE]);
        assert_eq!(chunk.ciphertext(), &[2u8; 20]);
        assert_eq!(chunk.blob_ref().len, 44);
    }
}
