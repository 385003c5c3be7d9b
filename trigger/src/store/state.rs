use std::future::Future;
use std::time::Duration;

use trigger_mssql::schema::TableSchema;

use crate::error::TriggerResult;
use crate::types::{Cell, LeasedChange};

/// Which change rows a scale-monitor count covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCountScope {
    /// Every row the database's change table currently reports.
    All,
    /// Only rows that are not yet processed or poison-quarantined.
    Unprocessed,
}

/// Trait for the shared coordination state behind one trigger binding.
///
/// [`LeaseStore`] is the seam between the workers and the database: every
/// mutation of the lease ledger, the global version number and the liveness
/// table flows through it. The production implementation talks to SQL Server;
/// the in-memory implementation models the same semantics for tests.
///
/// Mutating operations must uphold the lease protocol: acquisition reads its
/// predicate and writes the lease in one transaction, and release never
/// regresses a newer stored version. The database is the single source of
/// truth; implementations hold no authoritative in-memory state.
pub trait LeaseStore {
    /// Ensures the coordination schema exists and announces this worker.
    ///
    /// Idempotent and safe to run concurrently from many workers. Returns the
    /// user table's schema, read from the live catalog. Fails when the user
    /// table is missing or change tracking is not enabled.
    fn provision(&self) -> impl Future<Output = TriggerResult<TableSchema>> + Send;

    /// Runs the pre-fetch preamble: resets coordination state when the
    /// database was recreated and keeps the global version number at or above
    /// the database's minimum valid version.
    fn synchronize_version(&self) -> impl Future<Output = TriggerResult<()>> + Send;

    /// Fetches a bounded batch of unclaimed (or lease-expired) changes and
    /// acquires leases on every returned row, all within one transaction.
    ///
    /// Rows are ordered ascending by change version. Poison-quarantined rows
    /// are never returned.
    fn fetch_batch(&self) -> impl Future<Output = TriggerResult<Vec<LeasedChange>>> + Send;

    /// Re-extends the lease expiration on the given in-flight keys.
    fn renew_leases(&self, keys: &[Vec<Cell>])
    -> impl Future<Output = TriggerResult<()>> + Send;

    /// Releases the leases of a processed batch and records this worker's
    /// batch size, in one transaction.
    ///
    /// A row is released only when its processed version is at least the
    /// version currently stored in its lease row, so a slower writer never
    /// regresses state written by a worker that stole the lease.
    fn release_batch(
        &self,
        batch: &[LeasedChange],
    ) -> impl Future<Output = TriggerResult<()>> + Send;

    /// Advances the global version number to `new_version` when every change
    /// at or below it is processed, retiring covered lease rows, then adds
    /// `rows_processed` to the wrapping processed-rows counter.
    fn try_advance_version(
        &self,
        new_version: i64,
        rows_processed: i64,
    ) -> impl Future<Output = TriggerResult<()>> + Send;

    /// Attempts the same advance using the highest released version in the
    /// ledger as candidate. Called on empty polls to retire the tail the
    /// second-highest-version rule leaves behind.
    fn try_advance_tail(&self) -> impl Future<Output = TriggerResult<()>> + Send;

    /// Refreshes this worker's liveness row, creating it when absent.
    fn refresh_worker(&self) -> impl Future<Output = TriggerResult<()>> + Send;

    /// Deletes liveness rows that have not been refreshed within the cleanup
    /// interval.
    fn cleanup_stale_workers(&self) -> impl Future<Output = TriggerResult<()>> + Send;

    /// Deletes this worker's liveness row on clean shutdown.
    fn retire_worker(&self) -> impl Future<Output = TriggerResult<()>> + Send;

    /// Counts change rows for the scale monitor.
    fn change_count(
        &self,
        scope: ChangeCountScope,
    ) -> impl Future<Output = TriggerResult<i64>> + Send;

    /// Reads the wrapping processed-rows counter.
    fn rows_processed(&self) -> impl Future<Output = TriggerResult<i64>> + Send;

    /// Counts workers whose liveness row was refreshed within `window`.
    fn active_worker_count(
        &self,
        window: Duration,
    ) -> impl Future<Output = TriggerResult<i64>> + Send;
}
