//! Restore engine: sealed manifest chain → verified message set
//!
//! ```text
//! Fetching:   every manifest root→target, every blob, BLAKE3 checked against the header
//! Decrypting: open manifest bodies and chunks, check content hashes, decode JSONL
//!             ChainAssembler applies manifests root first
//! ```
//!
//! Nothing is returned until the whole chain has been verified. Any manifest
//! or chunk that fails a check aborts the restore with `CorruptBackup`
//! naming it; a missing ancestor is `IncompleteChain`.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use chatvault_archive::{decode_payload, BackupManifest, ChainAssembler};
use chatvault_core::types::{BackupId, MessageRecord};
use chatvault_core::wire::{BlobRef, EncryptedChunk, SealedManifest};
use chatvault_crypto::{open_manifest, BackupKey, ChunkAad, EnvelopeCipher};
use chatvault_storage::{DestinationAdapter, StorageError};

use crate::error::{BackupError, BackupErrorKind};
use crate::progress::ProgressEvent;
use crate::retry::{RetryError, RetryPolicy};
use crate::state::{RunState, RunTracker};

/// One manifest of the chain with its verified, still-sealed blobs
struct FetchedManifest {
    manifest: BackupManifest,
    blobs: Vec<(BlobRef, Vec<u8>)>,
}

pub struct RestoreEngine<'a> {
    adapter: &'a dyn DestinationAdapter,
    retry: &'a RetryPolicy,
    cancel: &'a CancellationToken,
}

impl<'a> RestoreEngine<'a> {
    pub fn new(
        adapter: &'a dyn DestinationAdapter,
        retry: &'a RetryPolicy,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            adapter,
            retry,
            cancel,
        }
    }

    /// Fetch one sealed manifest. A missing manifest maps to `missing(id)`.
    pub async fn fetch_manifest(
        &self,
        id: &BackupId,
        missing: impl FnOnce(BackupId) -> BackupErrorKind,
    ) -> Result<SealedManifest, BackupErrorKind> {
        let result = self
            .retry
            .run(self.cancel, "get_manifest", || self.adapter.get_manifest(id))
            .await;
        match result {
            Ok(sealed) => Ok(sealed),
            Err(RetryError::Permanent(StorageError::NotFound(_))) => Err(missing(*id)),
            Err(RetryError::Permanent(StorageError::Corrupt { .. })) => {
                Err(BackupErrorKind::CorruptBackup {
                    chunk_id: manifest_label(id),
                })
            }
            Err(e) => Err(e.into_unavailable()),
        }
    }

    /// Restore the chain ending at `target`, which the caller has already
    /// fetched and matched against `key`.
    pub(crate) async fn restore(
        &self,
        key: &BackupKey,
        target: SealedManifest,
        tracker: &mut RunTracker<'_>,
    ) -> Result<Vec<MessageRecord>, BackupError> {
        let target_id = target.backup_id();
        let target_manifest = open_sealed(key, &target).map_err(|k| tracker.error(k))?;
        let mut assembler = ChainAssembler::new(&target_manifest);
        let chain_ids = assembler.expected().to_vec();

        tracker.enter(RunState::Fetching);
        let mut target = Some((target, target_manifest));
        let mut fetched = Vec::with_capacity(chain_ids.len());
        for id in &chain_ids {
            let (sealed, manifest) = match target.take() {
                Some(t) if t.0.backup_id() == *id => t,
                other => {
                    target = other;
                    let sealed = self
                        .fetch_manifest(id, |missing| BackupErrorKind::IncompleteChain { missing })
                        .await
                        .map_err(|k| tracker.error(k))?;
                    let manifest = open_sealed(key, &sealed).map_err(|k| tracker.error(k))?;
                    (sealed, manifest)
                }
            };
            let blobs = self
                .fetch_blobs(&sealed, &manifest)
                .await
                .map_err(|k| tracker.error(k))?;
            fetched.push(FetchedManifest { manifest, blobs });
        }

        tracker.enter(RunState::Decrypting);
        let cipher = EnvelopeCipher::new(key).map_err(|e| tracker.error(e.into()))?;
        let total: usize = fetched.iter().map(|f| f.blobs.len()).sum();
        let mut index = 0usize;
        for FetchedManifest { manifest, blobs } in fetched {
            let mut records = Vec::new();
            for (blob, bytes) in blobs {
                if self.cancel.is_cancelled() {
                    return Err(tracker.error(BackupErrorKind::Cancelled));
                }
                let len = bytes.len() as u64;
                let mut decoded =
                    open_chunk(&cipher, &manifest, blob, bytes).map_err(|k| tracker.error(k))?;
                records.append(&mut decoded);
                index += 1;
                tracker.emit(&ProgressEvent::ChunkRestored {
                    index,
                    total,
                    bytes: len,
                });
            }
            assembler.apply(&manifest, records).map_err(|e| {
                tracker.error(BackupErrorKind::CorruptBackup {
                    chunk_id: format!("{}: {e}", manifest_label(&manifest.backup_id)),
                })
            })?;
        }

        let messages = assembler.finish().map_err(|e| {
            tracker.error(BackupErrorKind::CorruptBackup {
                chunk_id: format!("{}: {e}", manifest_label(&target_id)),
            })
        })?;
        info!(
            backup_id = %target_id,
            manifests = chain_ids.len(),
            chunks = total,
            messages = messages.len(),
            "chain restored"
        );
        Ok(messages)
    }

    /// Fetch every blob of one manifest and check it against the header.
    async fn fetch_blobs(
        &self,
        sealed: &SealedManifest,
        manifest: &BackupManifest,
    ) -> Result<Vec<(BlobRef, Vec<u8>)>, BackupErrorKind> {
        let mut blobs = Vec::with_capacity(sealed.header.blobs.len());
        for (blob, entry) in sealed.header.blobs.iter().zip(&manifest.chunks) {
            if self.cancel.is_cancelled() {
                return Err(BackupErrorKind::Cancelled);
            }
            let corrupt = || BackupErrorKind::CorruptBackup {
                chunk_id: entry.chunk_id.clone(),
            };
            let bytes = match self
                .retry
                .run(self.cancel, "get_chunk", || self.adapter.get_chunk(blob))
                .await
            {
                Ok(bytes) => bytes,
                Err(RetryError::Permanent(StorageError::NotFound(_))) => return Err(corrupt()),
                Err(e) => return Err(e.into_unavailable()),
            };
            if bytes.len() as u64 != blob.len || blake3::hash(&bytes).to_hex().as_str() != blob.hash
            {
                return Err(corrupt());
            }
            blobs.push((blob.clone(), bytes));
        }
        debug!(backup_id = %manifest.backup_id, chunks = blobs.len(), "blobs fetched");
        Ok(blobs)
    }
}

/// Authenticate and parse a manifest body, and check it agrees with its header.
pub(crate) fn open_sealed(
    key: &BackupKey,
    sealed: &SealedManifest,
) -> Result<BackupManifest, BackupErrorKind> {
    let id = sealed.backup_id();
    let corrupt = || BackupErrorKind::CorruptBackup {
        chunk_id: manifest_label(&id),
    };
    let body = open_manifest(key, sealed).map_err(|_| corrupt())?;
    let manifest = BackupManifest::from_bytes(&body).map_err(|_| corrupt())?;
    if !manifest.matches_header(&sealed.header) {
        return Err(corrupt());
    }
    Ok(manifest)
}

fn open_chunk(
    cipher: &EnvelopeCipher,
    manifest: &BackupManifest,
    blob: BlobRef,
    bytes: Vec<u8>,
) -> Result<Vec<MessageRecord>, BackupErrorKind> {
    let Some(entry) = manifest.chunk(blob.sequence) else {
        return Err(BackupErrorKind::CorruptBackup {
            chunk_id: format!("{}-{}", manifest.backup_id, blob.sequence),
        });
    };
    let corrupt = || BackupErrorKind::CorruptBackup {
        chunk_id: entry.chunk_id.clone(),
    };

    let chunk = EncryptedChunk {
        chunk_id: entry.chunk_id.clone(),
        sequence: blob.sequence,
        blob: bytes,
        blob_hash: blob.hash,
    };
    let aad = ChunkAad::new(manifest.backup_id, blob.sequence);
    let payload = cipher.open(&chunk, &aad).map_err(|_| corrupt())?;
    entry.verify_payload(&payload).map_err(|_| corrupt())?;
    let records = decode_payload(&payload, manifest.compression).map_err(|_| corrupt())?;
    if records.len() as u64 != entry.message_count {
        return Err(corrupt());
    }
    Ok(records)
}

fn manifest_label(id: &BackupId) -> String {
    format!("manifest {id}")
}
