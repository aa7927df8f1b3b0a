//! chatvault-backup: orchestrates backups and restores end to end
//!
//! ```text
//! trigger → BackupOrchestrator
//!             ├── DerivingKey  unlock (or create) the key against the local KeyRecord
//!             ├── Building     MessageSource → ArchiveBuilder (full | incremental)
//!             ├── Encrypting   EnvelopeCipher per chunk, manifest sealed over its header
//!             ├── Uploading    bounded-concurrency put_chunk with per-chunk retry, then manifest
//!             ├── Verifying    re-read manifest, confirm every chunk, append history
//!             └── Completed | Failed(reason) | Cancelled
//! ```
//!
//! One backup or restore runs at a time per orchestrator; the key lives only
//! for the duration of that run.

pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod progress;
pub mod restore;
pub mod retry;
pub mod schedule;
pub mod settings;
pub mod source;
pub mod state;
pub mod task;

pub use error::{BackupError, BackupErrorKind, Operation};
pub use ledger::{ActivityEntry, BackupHistoryEntry, BackupOutcome, Ledger, MigrationReason};
pub use orchestrator::{BackupOrchestrator, BackupRequest, RestoreRequest};
pub use progress::{ProgressEvent, ProgressFn};
pub use restore::RestoreEngine;
pub use retry::{RetryError, RetryPolicy};
pub use schedule::AutoBackupPolicy;
pub use settings::BackupSettings;
pub use source::{write_jsonl, JsonlFileSource, MessageSource, StaticSource};
pub use state::RunState;
pub use task::BackupTask;
