//! Archive builder: message set → manifest + plaintext chunk payloads
//!
//! Chunking policy:
//!   - records are encoded as JSON lines in (timestamp, id) order
//!   - a chunk is closed before it would exceed `max_chunk_bytes` of raw JSONL
//!   - a record is never split; one larger than the limit gets its own chunk
//!
//! Incremental builds diff against the parent's cumulative message index and
//! only chunk records that are new or whose digest changed.

use std::collections::BTreeMap;

use chatvault_core::types::{sort_messages, BackupType, MessageRecord};

use crate::codec::{compress_payload, encode_record, Compression};
use crate::error::ArchiveError;
use crate::hash::{hash_bytes, hash_to_hex};
use crate::manifest::{BackupManifest, ChunkEntry, MANIFEST_VERSION};

/// Default maximum raw chunk payload: 1 MiB
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 1024 * 1024;

/// A plaintext chunk payload waiting to be sealed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPayload {
    pub chunk_id: String,
    pub sequence: u64,
    pub bytes: Vec<u8>,
}

/// Result of a build: the manifest and its payloads in sequence order
#[derive(Debug, Clone)]
pub struct BuiltArchive {
    pub manifest: BackupManifest,
    pub payloads: Vec<ChunkPayload>,
}

impl BuiltArchive {
    /// True when the build carries no chunks (e.g. an unchanged incremental)
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    max_chunk_bytes: usize,
    compression: Compression,
    level: i32,
    created_at: Option<u64>,
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHUNK_BYTES)
    }
}

impl ArchiveBuilder {
    pub fn new(max_chunk_bytes: usize) -> Self {
        Self {
            max_chunk_bytes: max_chunk_bytes.max(1),
            compression: Compression::None,
            level: 3,
            created_at: None,
        }
    }

    pub fn with_compression(mut self, compression: Compression, level: i32) -> Self {
        self.compression = compression;
        self.level = level;
        self
    }

    /// Pin the creation timestamp. Builds over the same message set with the
    /// same timestamp produce byte-identical manifests.
    pub fn with_timestamp(mut self, created_at: u64) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn build_full(&self, messages: &[MessageRecord]) -> Result<BuiltArchive, ArchiveError> {
        let records = dedup_sorted(messages);
        let mut index = BTreeMap::new();
        let mut lines = Vec::with_capacity(records.len());
        for record in &records {
            let line = encode_record(record)?;
            index.insert(record.id.clone(), hash_to_hex(&hash_bytes(&line)));
            lines.push(line);
        }
        self.assemble(BackupType::Full, None, lines, index)
    }

    pub fn build_incremental(
        &self,
        messages: &[MessageRecord],
        parent: &BackupManifest,
    ) -> Result<BuiltArchive, ArchiveError> {
        let records = dedup_sorted(messages);
        let mut index = parent.message_index.clone();
        let mut lines = Vec::new();
        for record in &records {
            let line = encode_record(record)?;
            let digest = hash_to_hex(&hash_bytes(&line));
            if index.get(&record.id) != Some(&digest) {
                index.insert(record.id.clone(), digest);
                lines.push(line);
            }
        }
        tracing::debug!(
            parent = %parent.backup_id,
            changed = lines.len(),
            total = records.len(),
            "incremental diff"
        );
        self.assemble(BackupType::Incremental, Some(parent), lines, index)
    }

    fn assemble(
        &self,
        backup_type: BackupType,
        parent: Option<&BackupManifest>,
        lines: Vec<Vec<u8>>,
        message_index: BTreeMap<String, String>,
    ) -> Result<BuiltArchive, ArchiveError> {
        let created_at = self.created_at.unwrap_or_else(chatvault_core::now_millis);
        let message_count = lines.len() as u64;

        let mut bodies = Vec::new();
        for group in group_lines(lines, self.max_chunk_bytes) {
            let count = group.len() as u64;
            let raw: Vec<u8> = group.concat();
            bodies.push((compress_payload(raw, self.compression, self.level)?, count));
        }

        let mut chunks: Vec<ChunkEntry> = bodies
            .iter()
            .enumerate()
            .map(|(seq, (bytes, count))| ChunkEntry {
                chunk_id: String::new(),
                sequence: seq as u64,
                payload_len: bytes.len() as u64,
                sealed_len: BackupManifest::sealed_len(bytes.len() as u64),
                content_hash: hash_to_hex(&hash_bytes(bytes)),
                message_count: *count,
            })
            .collect();

        let parent_id = parent.map(|p| p.backup_id);
        let backup_id = BackupManifest::compute_id(
            created_at,
            backup_type,
            parent_id.as_ref(),
            self.compression,
            &chunks,
        );
        for chunk in &mut chunks {
            chunk.chunk_id = format!("{backup_id}-{}", chunk.sequence);
        }

        let ancestors = match parent {
            Some(p) => {
                let mut chain = p.ancestors.clone();
                chain.push(p.backup_id);
                chain
            }
            None => Vec::new(),
        };

        let payloads = chunks
            .iter()
            .zip(bodies)
            .map(|(entry, (bytes, _))| ChunkPayload {
                chunk_id: entry.chunk_id.clone(),
                sequence: entry.sequence,
                bytes,
            })
            .collect();

        let manifest = BackupManifest {
            version: MANIFEST_VERSION,
            backup_id,
            created_at,
            backup_type,
            parent_id,
            ancestors,
            compression: self.compression,
            total_size: chunks.iter().map(|c| c.payload_len).sum(),
            chunks,
            message_index,
            message_count,
        };

        tracing::debug!(
            backup_id = %manifest.backup_id,
            backup_type = %backup_type,
            chunks = manifest.chunks.len(),
            messages = message_count,
            "archive built"
        );

        Ok(BuiltArchive { manifest, payloads })
    }
}

/// Keep the last record per id, then order by (timestamp, id).
fn dedup_sorted(messages: &[MessageRecord]) -> Vec<MessageRecord> {
    let mut by_id: BTreeMap<&str, &MessageRecord> = BTreeMap::new();
    for m in messages {
        by_id.insert(m.id.as_str(), m);
    }
    let mut records: Vec<MessageRecord> = by_id.into_values().cloned().collect();
    sort_messages(&mut records);
    records
}

/// Pack whole lines into groups of at most `max` bytes (oversized lines alone).
fn group_lines(lines: Vec<Vec<u8>>, max: usize) -> Vec<Vec<Vec<u8>>> {
    let mut groups = Vec::new();
    let mut current: Vec<Vec<u8>> = Vec::new();
    let mut current_len = 0usize;

    for line in lines {
        if !current.is_empty() && current_len + line.len() > max {
            groups.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current_len += line.len();
        current.push(line);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}
