//! First-party adapter: our S3-compatible backup bucket

use async_trait::async_trait;
use opendal::{ErrorKind, Operator};

use chatvault_core::config::StorageConfig;
use chatvault_core::key_record::KeyRecord;
use chatvault_core::types::{BackupDestination, BackupId};
use chatvault_core::wire::{BlobRef, EncryptedChunk, SealedManifest};

use crate::adapter::{ChunkReceipt, DestinationAdapter, RemoteBackupSummary};
use crate::blob_store::BlobStore;
use crate::error::StorageError;
use crate::operator::{build_from_core_config, S3Credentials};

/// Timeouts, 5xx and dropped connections are worth another attempt.
/// Permission and quota failures are not.
fn first_party_transient(e: &opendal::Error) -> bool {
    e.is_temporary()
        || matches!(
            e.kind(),
            ErrorKind::Unexpected | ErrorKind::RateLimited | ErrorKind::ConditionNotMatch
        )
}

pub struct OurServersAdapter {
    store: BlobStore,
}

impl OurServersAdapter {
    pub fn new(op: Operator, root: &str, account: &str) -> Self {
        Self {
            store: BlobStore::new(
                op,
                root,
                account,
                BackupDestination::OurServers,
                first_party_transient,
            ),
        }
    }

    pub fn from_config(
        storage: &StorageConfig,
        creds: &S3Credentials,
        account: &str,
    ) -> Result<Self, StorageError> {
        let op = build_from_core_config(storage, creds)?;
        Ok(Self::new(op, &storage.root, account))
    }

    pub fn operator(&self) -> &Operator {
        self.store.operator()
    }

    /// `{root}/{account}` prefix every object lives under
    pub fn prefix(&self) -> &str {
        self.store.prefix()
    }
}

#[async_trait]
impl DestinationAdapter for OurServersAdapter {
    fn destination(&self) -> &BackupDestination {
        self.store.destination()
    }

    async fn put_chunk(&self, chunk: &EncryptedChunk) -> Result<ChunkReceipt, StorageError> {
        self.store.put_chunk(chunk).await
    }

    async fn chunk_exists(&self, blob: &BlobRef) -> Result<bool, StorageError> {
        self.store.chunk_exists(blob).await
    }

    async fn get_chunk(&self, blob: &BlobRef) -> Result<Vec<u8>, StorageError> {
        self.store.get_chunk(blob).await
    }

    async fn put_manifest(&self, manifest: &SealedManifest) -> Result<BackupId, StorageError> {
        self.store.put_manifest(manifest).await
    }

    async fn get_manifest(&self, id: &BackupId) -> Result<SealedManifest, StorageError> {
        self.store.get_manifest(id).await
    }

    async fn delete(&self, id: &BackupId) -> Result<(), StorageError> {
        self.store.delete(id).await
    }

    async fn list(&self) -> Result<Vec<RemoteBackupSummary>, StorageError> {
        self.store.list().await
    }

    async fn put_key_record(&self, record: &KeyRecord) -> Result<(), StorageError> {
        self.store.put_key_record(record).await
    }

    async fn get_key_record(&self, key_id: &str) -> Result<KeyRecord, StorageError> {
        self.store.get_key_record(key_id).await
    }
}
