//! Destination health check

use crate::adapter::DestinationAdapter;
use crate::error::StorageError;

/// Verify the destination is reachable by listing the account's manifests.
pub async fn check_health(adapter: &dyn DestinationAdapter) -> Result<(), StorageError> {
    adapter.list().await.map(|_| ())
}

/// Returns true if the destination is reachable, false otherwise
pub async fn is_healthy(adapter: &dyn DestinationAdapter) -> bool {
    check_health(adapter).await.is_ok()
}
