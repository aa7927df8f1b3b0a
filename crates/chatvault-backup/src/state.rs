//! Run state machine
//!
//! ```text
//! backup:  Idle → DerivingKey → Building → Encrypting → Uploading → Verifying → Completed
//! restore: Idle → DerivingKey → Fetching → Decrypting → Completed
//! delete:  Idle → Deleting → Completed
//! any non-terminal state → Failed(reason) | Cancelled
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{BackupError, BackupErrorKind, Operation};
use crate::progress::{ProgressEvent, ProgressFn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    DerivingKey,
    Building,
    Encrypting,
    Uploading,
    Verifying,
    Fetching,
    Decrypting,
    Deleting,
    Completed,
    Failed(String),
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed(_) | RunState::Cancelled
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => f.write_str("idle"),
            RunState::DerivingKey => f.write_str("key derivation"),
            RunState::Building => f.write_str("archive build"),
            RunState::Encrypting => f.write_str("encryption"),
            RunState::Uploading => f.write_str("upload"),
            RunState::Verifying => f.write_str("verification"),
            RunState::Fetching => f.write_str("fetch"),
            RunState::Decrypting => f.write_str("decryption"),
            RunState::Deleting => f.write_str("deletion"),
            RunState::Completed => f.write_str("completed"),
            RunState::Failed(reason) => write!(f, "failed ({reason})"),
            RunState::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Tracks the stage of one run, publishing every transition to the watch
/// channel and the run's progress observer.
pub(crate) struct RunTracker<'a> {
    operation: Operation,
    stage: RunState,
    tx: &'a watch::Sender<RunState>,
    progress: Option<ProgressFn>,
}

impl<'a> RunTracker<'a> {
    pub(crate) fn new(
        operation: Operation,
        tx: &'a watch::Sender<RunState>,
        progress: Option<ProgressFn>,
    ) -> Self {
        tx.send_replace(RunState::Idle);
        Self {
            operation,
            stage: RunState::Idle,
            tx,
            progress,
        }
    }

    pub(crate) fn enter(&mut self, stage: RunState) {
        tracing::debug!(operation = %self.operation, stage = %stage, "stage");
        self.stage = stage.clone();
        self.tx.send_replace(stage.clone());
        self.emit(&ProgressEvent::Stage(stage));
    }

    pub(crate) fn emit(&self, event: &ProgressEvent) {
        if let Some(progress) = &self.progress {
            progress(event);
        }
    }

    /// An error attributed to the current stage
    pub(crate) fn error(&self, kind: BackupErrorKind) -> BackupError {
        BackupError {
            operation: self.operation,
            stage: self.stage.clone(),
            kind,
        }
    }

    /// Move to the terminal state matching `result`.
    pub(crate) fn finish<T>(&mut self, result: Result<T, BackupError>) -> Result<T, BackupError> {
        match &result {
            Ok(_) => self.enter(RunState::Completed),
            Err(e) if matches!(e.kind, BackupErrorKind::Cancelled) => {
                self.enter(RunState::Cancelled)
            }
            Err(e) => self.enter(RunState::Failed(e.kind.to_string())),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_terminal_states() {
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
        assert!(RunState::Failed("x".into()).is_terminal());
        assert!(!RunState::Uploading.is_terminal());
    }

    #[test]
    fn test_tracker_publishes_transitions() {
        let (tx, rx) = watch::channel(RunState::Idle);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: ProgressFn = Arc::new(move |e: &ProgressEvent| {
            if let ProgressEvent::Stage(s) = e {
                sink.lock().unwrap().push(s.clone());
            }
        });

        let mut tracker = RunTracker::new(Operation::Backup, &tx, Some(progress));
        tracker.enter(RunState::DerivingKey);
        let err = tracker.error(BackupErrorKind::InvalidSecret);
        assert_eq!(err.stage, RunState::DerivingKey);
        let result: Result<(), _> = tracker.finish(Err(err));
        assert!(result.is_err());

        assert!(matches!(*rx.borrow(), RunState::Failed(_)));
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], RunState::DerivingKey);
        assert!(matches!(seen[1], RunState::Failed(_)));
    }

    #[test]
    fn test_cancel_ends_in_cancelled() {
        let (tx, rx) = watch::channel(RunState::Idle);
        let mut tracker = RunTracker::new(Operation::Restore, &tx, None);
        tracker.enter(RunState::Fetching);
        let err = tracker.error(BackupErrorKind::Cancelled);
        let _ = tracker.finish::<()>(Err(err));
        assert_eq!(*rx.borrow(), RunState::Cancelled);
    }
}
