use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("compression error: {0}")]
    Compression(String),

    /// Decrypted payload does not hash to the digest recorded in the manifest
    #[error("chunk {chunk_id}: content hash mismatch")]
    ContentMismatch { chunk_id: String },

    #[error("unsupported manifest version {0}")]
    UnsupportedVersion(u32),

    /// Ancestor list does not line up with the manifests supplied
    #[error("broken manifest chain: {0}")]
    BrokenChain(String),
}
