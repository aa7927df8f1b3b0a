//! Third-party adapter: a consumer cloud drive reached through an OpenDAL
//! service the operator configures (fs mount, WebDAV, S3 gateway, ...).
//!
//! The provider only ever receives sealed blobs, but it is a separate host
//! with its own quotas. Rate limiting is retried; permission, quota and
//! configuration failures surface immediately.

use async_trait::async_trait;
use opendal::{ErrorKind, Operator};

use chatvault_core::config::ThirdPartyConfig;
use chatvault_core::key_record::KeyRecord;
use chatvault_core::types::{BackupDestination, BackupId, ThirdPartyProvider};
use chatvault_core::wire::{BlobRef, EncryptedChunk, SealedManifest};

use crate::adapter::{ChunkReceipt, DestinationAdapter, RemoteBackupSummary};
use crate::blob_store::BlobStore;
use crate::error::StorageError;
use crate::operator::build_third_party_operator;

fn third_party_transient(e: &opendal::Error) -> bool {
    match e.kind() {
        ErrorKind::RateLimited => true,
        ErrorKind::PermissionDenied | ErrorKind::Unsupported | ErrorKind::IsSameFile => false,
        _ => e.is_temporary(),
    }
}

pub struct ThirdPartyAdapter {
    provider: ThirdPartyProvider,
    store: BlobStore,
}

impl ThirdPartyAdapter {
    pub fn new(provider: ThirdPartyProvider, op: Operator, root: &str, account: &str) -> Self {
        let store = BlobStore::new(
            op,
            root,
            account,
            BackupDestination::ThirdParty(provider.clone()),
            third_party_transient,
        );
        Self { provider, store }
    }

    /// Build from `[third_party]`. `provider` must name a third-party destination.
    pub fn from_config(cfg: &ThirdPartyConfig, account: &str) -> Result<Self, StorageError> {
        let provider = match cfg.provider.parse::<BackupDestination>() {
            Ok(BackupDestination::ThirdParty(provider)) => provider,
            Ok(BackupDestination::OurServers) => {
                return Err(StorageError::Config(
                    "third_party.provider must not be our_servers".into(),
                ))
            }
            Err(e) => return Err(StorageError::Config(e.to_string())),
        };
        let op = build_third_party_operator(cfg)?;
        Ok(Self::new(provider, op, &cfg.root, account))
    }

    pub fn provider(&self) -> &ThirdPartyProvider {
        &self.provider
    }

    pub fn operator(&self) -> &Operator {
        self.store.operator()
    }
}

#[async_trait]
impl DestinationAdapter for ThirdPartyAdapter {
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
        tracing::debug!(
            provider = self.provider.display_name(),
            backup_id = %manifest.backup_id(),
            "writing manifest to third-party storage"
        );
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
