//! Chunk payload codec
//!
//! A payload is newline-delimited JSON, one message record per line, in
//! (timestamp, id) order. With `Compression::Zstd` the whole payload is a
//! single zstd frame.

use serde::{Deserialize, Serialize};

use chatvault_core::types::MessageRecord;

use crate::error::ArchiveError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    Zstd,
}

/// Encode one record as a JSON line including the trailing newline.
pub fn encode_record(record: &MessageRecord) -> Result<Vec<u8>, ArchiveError> {
    let mut line = serde_json::to_vec(record)
        .map_err(|e| ArchiveError::Encoding(format!("message {}: {e}", record.id)))?;
    line.push(b'\n');
    Ok(line)
}

/// Apply `compression` to an assembled JSONL payload.
pub fn compress_payload(
    raw: Vec<u8>,
    compression: Compression,
    level: i32,
) -> Result<Vec<u8>, ArchiveError> {
    match compression {
        Compression::None => Ok(raw),
        Compression::Zstd => zstd::encode_all(raw.as_slice(), level)
            .map_err(|e| ArchiveError::Compression(format!("zstd compress: {e}"))),
    }
}

/// Decompress (if needed) and parse a chunk payload back into records.
pub fn decode_payload(
    payload: &[u8],
    compression: Compression,
) -> Result<Vec<MessageRecord>, ArchiveError> {
    let raw = match compression {
        Compression::None => payload.to_vec(),
        Compression::Zstd => zstd::decode_all(payload)
            .map_err(|e| ArchiveError::Compression(format!("zstd decompress: {e}")))?,
    };

    raw.split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_slice(line)
                .map_err(|e| ArchiveError::Encoding(format!("message record: {e}")))
        })
        .collect()
}
