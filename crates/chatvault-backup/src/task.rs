//! Handle for a run spawned onto the runtime

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{BackupError, BackupErrorKind, Operation};
use crate::state::RunState;

pub struct BackupTask<T> {
    operation: Operation,
    cancel: CancellationToken,
    handle: JoinHandle<Result<T, BackupError>>,
}

impl<T> BackupTask<T> {
    pub(crate) fn new(
        operation: Operation,
        cancel: CancellationToken,
        handle: JoinHandle<Result<T, BackupError>>,
    ) -> Self {
        Self {
            operation,
            cancel,
            handle,
        }
    }

    /// Request cancellation. In-flight chunk uploads finish or abort; no
    /// further chunks start and no history entry is written.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn join(self) -> Result<T, BackupError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(BackupError {
                operation: self.operation,
                stage: RunState::Failed(e.to_string()),
                kind: if e.is_cancelled() {
                    BackupErrorKind::Cancelled
                } else {
                    BackupErrorKind::Internal(format!("run panicked: {e}"))
                },
            }),
        }
    }
}
