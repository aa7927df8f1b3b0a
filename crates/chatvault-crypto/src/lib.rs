//! chatvault-crypto: client-side encryption for message backups
//!
//! Key hierarchy:
//! ```text
//! BackupSecret (PIN 6-8 digits | passphrase >= 12 chars, never stored)
//!   └── BackupKey (256-bit, Argon2id(secret, KeySalt, KdfParams))
//!       ├── Chunk key    (HKDF-SHA256, info="chatvault-chunks-v1")
//!       │   └── Chunk AEAD: XChaCha20-Poly1305, nonce = manifest_id || sequence
//!       ├── Manifest key (HKDF-SHA256, info="chatvault-manifest-v1")
//!       │   └── Manifest AEAD, AAD = canonical manifest header
//!       └── Verifier key (HKDF-SHA256, info="chatvault-verifier-v1")
//!           └── KeyVerifier = BLAKE3-keyed(verifier key, fixed constant)
//! ```
//!
//! Nonces are never random: they are derived from the manifest id and the
//! chunk sequence index, so two different plaintexts can never be sealed
//! under the same (key, nonce) pair.

pub mod envelope;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod manifest;
pub mod secret;

pub use envelope::{open, seal, ChunkAad, EnvelopeCipher};
pub use error::CryptoError;
pub use kdf::{
    create_key_record, derive_key, generate_salt, key_matches, make_verifier, unlock, verify,
    BackupKey,
};
pub use manifest::{header_matches_key, open_manifest, seal_manifest};
pub use secret::{BackupSecret, SecretKind};

pub use chatvault_core::wire::{NONCE_SIZE, TAG_SIZE};

/// Size of a backup key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;
