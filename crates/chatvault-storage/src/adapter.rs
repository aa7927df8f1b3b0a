//! The destination adapter contract

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use chatvault_core::key_record::KeyRecord;
use chatvault_core::types::{BackupDestination, BackupId, BackupType};
use chatvault_core::wire::{BlobRef, EncryptedChunk, ManifestHeader, SealedManifest};

use crate::error::StorageError;

/// Outcome of storing one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkReceipt {
    /// False when the blob was already present and nothing was written
    pub stored: bool,
}

/// A blob fetched during download, still sealed
#[derive(Debug, Clone)]
pub struct FetchedBlob {
    pub blob: BlobRef,
    pub bytes: Vec<u8>,
}

pub type BlobStream<'a> = BoxStream<'a, Result<FetchedBlob, StorageError>>;

/// What a destination can tell about a backup without any key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteBackupSummary {
    pub backup_id: BackupId,
    pub created_at: u64,
    pub backup_type: BackupType,
    pub parent_id: Option<BackupId>,
    pub key_id: String,
    pub message_count: u64,
    pub chunk_count: usize,
    pub byte_size: u64,
}

impl From<&ManifestHeader> for RemoteBackupSummary {
    fn from(header: &ManifestHeader) -> Self {
        Self {
            backup_id: header.backup_id,
            created_at: header.created_at,
            backup_type: header.backup_type,
            parent_id: header.parent_id,
            key_id: header.key.key_id.clone(),
            message_count: header.message_count,
            chunk_count: header.blobs.len(),
            byte_size: header.total_bytes(),
        }
    }
}

/// Storage backend for sealed backups.
///
/// Every method is idempotent: storing a chunk that is already present is a
/// no-op, and deleting a backup that is already gone succeeds.
#[async_trait]
pub trait DestinationAdapter: Send + Sync {
    fn destination(&self) -> &BackupDestination;

    async fn put_chunk(&self, chunk: &EncryptedChunk) -> Result<ChunkReceipt, StorageError>;

    async fn chunk_exists(&self, blob: &BlobRef) -> Result<bool, StorageError>;

    async fn get_chunk(&self, blob: &BlobRef) -> Result<Vec<u8>, StorageError>;

    /// Write the manifest. This is the commit point of a backup.
    async fn put_manifest(&self, manifest: &SealedManifest) -> Result<BackupId, StorageError>;

    async fn get_manifest(&self, id: &BackupId) -> Result<SealedManifest, StorageError>;

    /// Remove a backup's chunks, then its manifest.
    async fn delete(&self, id: &BackupId) -> Result<(), StorageError>;

    /// Summaries of every stored manifest, oldest first
    async fn list(&self) -> Result<Vec<RemoteBackupSummary>, StorageError>;

    async fn put_key_record(&self, record: &KeyRecord) -> Result<(), StorageError>;

    async fn get_key_record(&self, key_id: &str) -> Result<KeyRecord, StorageError>;

    /// Store every chunk, then the manifest.
    async fn upload(
        &self,
        manifest: &SealedManifest,
        chunks: &[EncryptedChunk],
    ) -> Result<BackupId, StorageError> {
        for chunk in chunks {
            self.put_chunk(chunk).await?;
        }
        self.put_manifest(manifest).await
    }

    /// Fetch the manifest and a lazy stream over its chunks in sequence order.
    async fn download<'a>(
        &'a self,
        id: &BackupId,
    ) -> Result<(SealedManifest, BlobStream<'a>), StorageError> {
        let manifest = self.get_manifest(id).await?;
        let blobs = manifest.header.blobs.clone();
        let stream = futures::stream::iter(blobs)
            .then(move |blob| async move {
                let bytes = self.get_chunk(&blob).await?;
                Ok(FetchedBlob { blob, bytes })
            })
            .boxed();
        Ok((manifest, stream))
    }
}
