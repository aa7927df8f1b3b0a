//! Progress events delivered to a run's observer

use std::sync::Arc;

use crate::state::RunState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// The run entered a new stage
    Stage(RunState),
    /// One chunk confirmed by the destination. `index` counts confirmations
    /// (1-based), not sequence numbers: uploads complete out of order.
    ChunkUploaded {
        index: usize,
        total: usize,
        bytes_uploaded: u64,
        bytes_total: u64,
    },
    /// One chunk fetched, authenticated and decoded
    ChunkRestored {
        index: usize,
        total: usize,
        bytes: u64,
    },
}

/// Observer callback. Called from the run's task; keep it cheap.
pub type ProgressFn = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;
