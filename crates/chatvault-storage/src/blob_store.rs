//! Shared OpenDAL object layout used by every adapter
//!
//! ```text
//! {root}/{account}/manifests/{backup_id}.json
//! {root}/{account}/chunks/{blob_hash}
//! {root}/{account}/keys/{key_id}.json
//! ```

use opendal::{ErrorKind, Operator};
use tracing::{debug, warn};

use chatvault_core::key_record::KeyRecord;
use chatvault_core::types::{BackupDestination, BackupId};
use chatvault_core::wire::{BlobRef, EncryptedChunk, SealedManifest};

use crate::adapter::{ChunkReceipt, RemoteBackupSummary};
use crate::error::StorageError;

/// Decides whether a backend error is worth retrying
pub(crate) type TransientFn = fn(&opendal::Error) -> bool;

pub(crate) struct BlobStore {
    op: Operator,
    prefix: String,
    destination: BackupDestination,
    is_transient: TransientFn,
}

impl BlobStore {
    pub(crate) fn new(
        op: Operator,
        root: &str,
        account: &str,
        destination: BackupDestination,
        is_transient: TransientFn,
    ) -> Self {
        let root = root.trim_matches('/');
        let account = account.trim_matches('/');
        let prefix = if root.is_empty() {
            account.to_string()
        } else {
            format!("{root}/{account}")
        };
        Self {
            op,
            prefix,
            destination,
            is_transient,
        }
    }

    pub(crate) fn destination(&self) -> &BackupDestination {
        &self.destination
    }

    pub(crate) fn operator(&self) -> &Operator {
        &self.op
    }

    pub(crate) fn prefix(&self) -> &str {
        &self.prefix
    }

    fn manifest_path(&self, id: &BackupId) -> String {
        format!("{}/manifests/{id}.json", self.prefix)
    }

    fn chunk_path(&self, hash: &str) -> String {
        format!("{}/chunks/{hash}", self.prefix)
    }

    fn key_path(&self, key_id: &str) -> String {
        format!("{}/keys/{key_id}.json", self.prefix)
    }

    fn classify(&self, action: &str, path: &str, e: opendal::Error) -> StorageError {
        match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound(path.to_string()),
            ErrorKind::ConfigInvalid => StorageError::Config(e.to_string()),
            _ => StorageError::Unavailable {
                destination: self.destination.to_string(),
                action: action.to_string(),
                message: e.to_string(),
                transient: (self.is_transient)(&e),
            },
        }
    }

    pub(crate) async fn put_chunk(&self, chunk: &EncryptedChunk) -> Result<ChunkReceipt, StorageError> {
        let path = self.chunk_path(&chunk.blob_hash);
        let present = self
            .op
            .exists(&path)
            .await
            .map_err(|e| self.classify("put_chunk", &path, e))?;
        if present {
            debug!(chunk_id = %chunk.chunk_id, "chunk already stored");
            return Ok(ChunkReceipt { stored: false });
        }
        self.op
            .write(&path, chunk.blob.clone())
            .await
            .map_err(|e| self.classify("put_chunk", &path, e))?;
        Ok(ChunkReceipt { stored: true })
    }

    pub(crate) async fn chunk_exists(&self, blob: &BlobRef) -> Result<bool, StorageError> {
        let path = self.chunk_path(&blob.hash);
        self.op
            .exists(&path)
            .await
            .map_err(|e| self.classify("chunk_exists", &path, e))
    }

    pub(crate) async fn get_chunk(&self, blob: &BlobRef) -> Result<Vec<u8>, StorageError> {
        let path = self.chunk_path(&blob.hash);
        let data = self
            .op
            .read(&path)
            .await
            .map_err(|e| self.classify("get_chunk", &path, e))?;
        Ok(data.to_vec())
    }

    pub(crate) async fn put_manifest(&self, manifest: &SealedManifest) -> Result<BackupId, StorageError> {
        let id = manifest.backup_id();
        let path = self.manifest_path(&id);
        let bytes = manifest.to_bytes().map_err(|e| StorageError::Corrupt {
            path: path.clone(),
            message: e.to_string(),
        })?;
        self.op
            .write(&path, bytes)
            .await
            .map_err(|e| self.classify("put_manifest", &path, e))?;
        Ok(id)
    }

    pub(crate) async fn get_manifest(&self, id: &BackupId) -> Result<SealedManifest, StorageError> {
        let path = self.manifest_path(id);
        let data = self
            .op
            .read(&path)
            .await
            .map_err(|e| self.classify("get_manifest", &path, e))?;
        let manifest =
            SealedManifest::from_bytes(&data.to_bytes()).map_err(|e| StorageError::Corrupt {
                path: path.clone(),
                message: e.to_string(),
            })?;
        if manifest.backup_id() != *id {
            return Err(StorageError::Corrupt {
                path,
                message: format!("manifest claims id {}", manifest.backup_id()),
            });
        }
        Ok(manifest)
    }

    pub(crate) async fn delete(&self, id: &BackupId) -> Result<(), StorageError> {
        let manifest = match self.get_manifest(id).await {
            Ok(m) => m,
            Err(StorageError::NotFound(_)) => {
                debug!(backup_id = %id, "delete: manifest already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // Manifest first: a delete that stops partway leaves orphaned
        // chunks, never a manifest listing blobs that are gone.
        let path = self.manifest_path(id);
        self.op
            .delete(&path)
            .await
            .map_err(|e| self.classify("delete", &path, e))?;
        for blob in &manifest.header.blobs {
            let path = self.chunk_path(&blob.hash);
            self.op
                .delete(&path)
                .await
                .map_err(|e| self.classify("delete", &path, e))?;
        }
        debug!(backup_id = %id, chunks = manifest.header.blobs.len(), "deleted backup");
        Ok(())
    }

    pub(crate) async fn list(&self) -> Result<Vec<RemoteBackupSummary>, StorageError> {
        let dir = format!("{}/manifests/", self.prefix);
        let entries = match self.op.list(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.classify("list", &dir, e)),
        };

        let mut summaries = Vec::new();
        for entry in entries {
            let Some(id) = entry
                .name()
                .strip_suffix(".json")
                .and_then(|s| s.parse::<BackupId>().ok())
            else {
                continue;
            };
            match self.get_manifest(&id).await {
                Ok(manifest) => summaries.push(RemoteBackupSummary::from(&manifest.header)),
                Err(StorageError::Corrupt { path, message }) => {
                    warn!(%path, %message, "skipping unreadable manifest");
                }
                Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        summaries.sort_by_key(|s| (s.created_at, s.backup_id));
        Ok(summaries)
    }

    pub(crate) async fn put_key_record(&self, record: &KeyRecord) -> Result<(), StorageError> {
        let path = self.key_path(&record.key_id);
        let bytes = serde_json::to_vec_pretty(record).map_err(|e| StorageError::Corrupt {
            path: path.clone(),
            message: e.to_string(),
        })?;
        self.op
            .write(&path, bytes)
            .await
            .map_err(|e| self.classify("put_key_record", &path, e))?;
        Ok(())
    }

    pub(crate) async fn get_key_record(&self, key_id: &str) -> Result<KeyRecord, StorageError> {
        let path = self.key_path(key_id);
        let data = self
            .op
            .read(&path)
            .await
            .map_err(|e| self.classify("get_key_record", &path, e))?;
        serde_json::from_slice(&data.to_bytes()).map_err(|e| StorageError::Corrupt {
            path,
            message: e.to_string(),
        })
    }
}
