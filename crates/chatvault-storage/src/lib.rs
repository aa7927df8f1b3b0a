//! chatvault-storage: destination adapters over OpenDAL
//!
//! Adapters move opaque bytes only. Nothing in this crate can see a key,
//! a secret, or plaintext: it does not depend on the crypto crate and every
//! payload it handles is a sealed [`EncryptedChunk`] or [`SealedManifest`].
//!
//! [`EncryptedChunk`]: chatvault_core::wire::EncryptedChunk
//! [`SealedManifest`]: chatvault_core::wire::SealedManifest

pub mod adapter;
pub mod error;
pub mod health;
pub mod operator;
pub mod our_servers;
pub mod third_party;

mod blob_store;

pub use adapter::{
    BlobStream, ChunkReceipt, DestinationAdapter, FetchedBlob, RemoteBackupSummary,
};
pub use error::StorageError;
pub use health::{check_health, is_healthy};
pub use operator::{
    build_from_core_config, build_s3_operator, build_third_party_operator, S3Credentials,
};
pub use our_servers::OurServersAdapter;
pub use third_party::ThirdPartyAdapter;
