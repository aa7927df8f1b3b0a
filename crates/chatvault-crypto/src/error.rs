use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// Secret rejected before any derivation ran
    #[error("weak secret: {0}")]
    WeakSecret(String),

    /// Secret does not match the stored verifier
    #[error("invalid secret: does not match the stored key verifier")]
    InvalidSecret,

    /// AEAD tag mismatch, wrong key, or wrong associated data
    #[error("authentication failed: invalid key, corrupted data, or wrong associated data")]
    Authentication,

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("encoding error: {0}")]
    Encoding(String),
}
