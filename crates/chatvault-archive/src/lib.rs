//! chatvault-archive: turns a message set into a chunked, versioned archive
//!
//! # Overview
//! - `hash`: BLAKE3 digests for payloads and message records
//! - `codec`: JSONL record encoding and optional zstd compression of chunk payloads
//! - `manifest`: the plaintext `BackupManifest` (chunk list, message index, ancestry)
//! - `builder`: full and incremental builds with whole-record chunk boundaries
//! - `chain`: reassembling a message set from a root→target manifest chain

pub mod builder;
pub mod chain;
pub mod codec;
pub mod error;
pub mod hash;
pub mod manifest;

pub use builder::{ArchiveBuilder, BuiltArchive, ChunkPayload};
pub use chain::ChainAssembler;
pub use codec::{decode_payload, encode_record, Compression};
pub use error::ArchiveError;
pub use hash::{hash_bytes, hash_from_hex, hash_to_hex, record_digest, Hash};
pub use manifest::{BackupManifest, ChunkEntry, MANIFEST_VERSION};
