use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::TriggerResult;
use crate::types::ChangeEvent;

/// Trait for user code that consumes change batches.
///
/// The runtime delivers each change at least once; invocations for the same
/// change may repeat after lease expiry, so implementations must be
/// idempotent. Returning an error leaves the batch's leases to expire and be
/// retried, eventually poison-quarantining the rows.
///
/// The `cancellation` token is scoped to one invocation. The renewal worker
/// triggers it when the handler exceeds its renewal budget; a well-behaved
/// handler observes the token during long operations and returns promptly.
pub trait ChangeHandler {
    /// Processes one batch of changes, ordered ascending by change version.
    fn handle_changes(
        &self,
        batch: Vec<ChangeEvent>,
        cancellation: CancellationToken,
    ) -> impl Future<Output = TriggerResult<()>> + Send;
}
