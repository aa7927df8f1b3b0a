//! chatvault-core: shared types for the encrypted message backup engine
//!
//! Nothing in this crate touches key material. The types here are the
//! vocabulary every other chatvault crate speaks:
//! - `types`: message records, backup ids, destinations, backup kinds
//! - `key_record`: public key metadata (salt, KDF params, verifier)
//! - `wire`: what a destination adapter stores (sealed chunks and manifests)
//! - `config`: the TOML configuration schema

pub mod config;
pub mod encoding;
pub mod error;
pub mod key_record;
pub mod types;
pub mod wire;

pub use error::{ChatvaultError, ChatvaultResult};
pub use key_record::{KdfParams, KeyRecord, KeySalt, KeyVerifier};
pub use types::{
    sort_messages, BackupDestination, BackupFrequency, BackupId, BackupType, MessageRecord,
    ThirdPartyProvider, TrustLevel,
};
pub use wire::{BlobRef, EncryptedChunk, ManifestHeader, SealedManifest};

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
