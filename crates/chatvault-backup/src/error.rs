use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use chatvault_core::types::{BackupDestination, BackupId};
use chatvault_crypto::CryptoError;

use crate::state::RunState;

/// User-visible operation a failure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Setup,
    Backup,
    Restore,
    Migration,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Setup => "setup",
            Operation::Backup => "backup",
            Operation::Restore => "restore",
            Operation::Migration => "migration",
            Operation::Delete => "delete",
        })
    }
}

/// A failed operation: which one, at which stage, and why.
///
/// Never carries key material or plaintext.
#[derive(Debug, Error)]
#[error("{operation} failed during {stage}: {kind}")]
pub struct BackupError {
    pub operation: Operation,
    pub stage: RunState,
    pub kind: BackupErrorKind,
}

impl BackupError {
    pub fn kind(&self) -> &BackupErrorKind {
        &self.kind
    }
}

#[derive(Debug, Error)]
pub enum BackupErrorKind {
    #[error("weak secret: {0}")]
    WeakSecret(String),

    #[error("the PIN or passphrase is incorrect")]
    InvalidSecret,

    #[error("authentication failed: data was tampered with or sealed under another key")]
    Authentication,

    #[error("incomplete backup chain: ancestor {missing} is missing")]
    IncompleteChain { missing: BackupId },

    #[error("corrupt backup: {chunk_id} failed verification")]
    CorruptBackup { chunk_id: String },

    #[error("another backup or restore is already running")]
    BackupInProgress,

    #[error("gave up after {attempts} attempts: {reason}")]
    BackupFailed { attempts: u32, reason: String },

    #[error("destination unavailable: {0}")]
    DestinationUnavailable(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0} requires acknowledging the third-party storage notice first")]
    RiskNotAcknowledged(BackupDestination),

    #[error("no backup PIN or passphrase has been set up")]
    NoKeyConfigured,

    #[error("a backup PIN or passphrase is already set up; rotate it instead")]
    KeyAlreadyConfigured,

    #[error("no storage adapter registered for {0}")]
    UnknownDestination(BackupDestination),

    #[error("backup {0} not found")]
    BackupNotFound(BackupId),

    #[error("backups are disabled")]
    BackupsDisabled,

    #[error("local ledger: {0}")]
    Ledger(String),

    #[error("message store: {0}")]
    MessageStore(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BackupErrorKind {
    /// Integrity failures: never retried, never downgraded.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            BackupErrorKind::Authentication
                | BackupErrorKind::CorruptBackup { .. }
                | BackupErrorKind::IncompleteChain { .. }
        )
    }
}

impl From<CryptoError> for BackupErrorKind {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::WeakSecret(reason) => BackupErrorKind::WeakSecret(reason),
            CryptoError::InvalidSecret => BackupErrorKind::InvalidSecret,
            CryptoError::Authentication => BackupErrorKind::Authentication,
            CryptoError::Kdf(msg) | CryptoError::Encoding(msg) => BackupErrorKind::Internal(msg),
        }
    }
}
