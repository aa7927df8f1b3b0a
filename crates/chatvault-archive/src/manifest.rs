//! Plaintext backup manifest
//!
//! This is the body that gets sealed under the manifest sub-key. It carries
//! the plaintext digests the public header must not reveal: per-chunk content
//! hashes and the cumulative message index.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use chatvault_core::key_record::KeyRecord;
use chatvault_core::types::{BackupId, BackupType};
use chatvault_core::wire::{BlobRef, ManifestHeader, NONCE_SIZE, TAG_SIZE};

use crate::codec::Compression;
use crate::error::ArchiveError;

/// Manifest schema version written by this crate
pub const MANIFEST_VERSION: u32 = 1;

const ID_CONTEXT: &str = "chatvault 2024 backup manifest id v1";

/// A single chunk entry in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    /// `{backup_id}-{sequence}`
    pub chunk_id: String,
    /// Zero-based sequence index
    pub sequence: u64,
    /// Payload length before sealing (after compression)
    pub payload_len: u64,
    /// Length of the sealed blob (nonce + ciphertext + tag)
    pub sealed_len: u64,
    /// BLAKE3 of the payload (hex)
    pub content_hash: String,
    /// Records in this chunk
    pub message_count: u64,
}

impl ChunkEntry {
    /// Check a decrypted payload against the recorded content hash.
    pub fn verify_payload(&self, payload: &[u8]) -> Result<(), ArchiveError> {
        if payload.len() as u64 != self.payload_len
            || blake3::hash(payload).to_hex().as_str() != self.content_hash
        {
            return Err(ArchiveError::ContentMismatch {
                chunk_id: self.chunk_id.clone(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub version: u32,
    pub backup_id: BackupId,
    /// Unix timestamp (ms)
    pub created_at: u64,
    pub backup_type: BackupType,
    pub parent_id: Option<BackupId>,
    /// Every manifest needed before this one, root first
    pub ancestors: Vec<BackupId>,
    pub compression: Compression,
    pub chunks: Vec<ChunkEntry>,
    /// Cumulative message id → record digest, across the whole chain
    pub message_index: BTreeMap<String, String>,
    /// Messages carried by this manifest's own chunks
    pub message_count: u64,
    /// Sum of payload lengths
    pub total_size: u64,
}

impl BackupManifest {
    /// Content-derived manifest id.
    pub fn compute_id(
        created_at: u64,
        backup_type: BackupType,
        parent_id: Option<&BackupId>,
        compression: Compression,
        chunks: &[ChunkEntry],
    ) -> BackupId {
        let mut hasher = blake3::Hasher::new_derive_key(ID_CONTEXT);
        hasher.update(&MANIFEST_VERSION.to_be_bytes());
        hasher.update(&created_at.to_be_bytes());
        hasher.update(match backup_type {
            BackupType::Full => b"F",
            BackupType::Incremental => b"I",
        });
        match parent_id {
            Some(parent) => {
                hasher.update(&[1]);
                hasher.update(parent.as_bytes());
            }
            None => {
                hasher.update(&[0]);
            }
        }
        hasher.update(match compression {
            Compression::None => b"n",
            Compression::Zstd => b"z",
        });
        hasher.update(&(chunks.len() as u64).to_be_bytes());
        for chunk in chunks {
            hasher.update(chunk.content_hash.as_bytes());
        }

        let mut id = [0u8; BackupId::LEN];
        id.copy_from_slice(&hasher.finalize().as_bytes()[..BackupId::LEN]);
        BackupId::from_bytes(id)
    }

    /// Sealed size of a payload of `payload_len` bytes
    pub fn sealed_len(payload_len: u64) -> u64 {
        payload_len + (NONCE_SIZE + TAG_SIZE) as u64
    }

    pub fn chunk(&self, sequence: u64) -> Option<&ChunkEntry> {
        self.chunks.iter().find(|c| c.sequence == sequence)
    }

    /// Public header for sealing. `blobs` must list one sealed blob per chunk.
    pub fn header(&self, key: KeyRecord, blobs: Vec<BlobRef>) -> ManifestHeader {
        ManifestHeader {
            version: self.version,
            backup_id: self.backup_id,
            created_at: self.created_at,
            backup_type: self.backup_type,
            parent_id: self.parent_id,
            key,
            message_count: self.message_count,
            blobs,
        }
    }

    /// Check that a header (already authenticated) describes this manifest.
    pub fn matches_header(&self, header: &ManifestHeader) -> bool {
        header.backup_id == self.backup_id
            && header.created_at == self.created_at
            && header.backup_type == self.backup_type
            && header.parent_id == self.parent_id
            && header.message_count == self.message_count
            && header.blobs.len() == self.chunks.len()
            && self
                .chunks
                .iter()
                .zip(&header.blobs)
                .all(|(c, b)| c.sequence == b.sequence && c.sealed_len == b.len)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ArchiveError> {
        serde_json::to_vec(self).map_err(|e| ArchiveError::Encoding(format!("manifest: {e}")))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ArchiveError> {
        let manifest: Self = serde_json::from_slice(data)
            .map_err(|e| ArchiveError::Encoding(format!("manifest: {e}")))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(ArchiveError::UnsupportedVersion(manifest.version));
        }
        Ok(manifest)
    }
}
