//! BLAKE3 digests for chunk payloads and message records

use chatvault_core::types::MessageRecord;

use crate::codec::encode_record;
use crate::error::ArchiveError;

/// A BLAKE3 hash digest (32 bytes), displayed as 64 hex chars
pub type Hash = blake3::Hash;

pub fn hash_bytes(data: &[u8]) -> Hash {
    blake3::hash(data)
}

/// Format a hash as lowercase hex string (64 chars)
pub fn hash_to_hex(hash: &Hash) -> String {
    hash.to_hex().to_string()
}

/// Parse a 64-char hex string into a Hash
pub fn hash_from_hex(hex: &str) -> Result<Hash, ArchiveError> {
    blake3::Hash::from_hex(hex)
        .map_err(|e| ArchiveError::Encoding(format!("invalid BLAKE3 hex '{hex}': {e}")))
}

/// Digest of a record's canonical encoding. Two records with the same id
/// but any differing field have different digests.
pub fn record_digest(record: &MessageRecord) -> Result<String, ArchiveError> {
    Ok(hash_to_hex(&hash_bytes(&encode_record(record)?)))
}
