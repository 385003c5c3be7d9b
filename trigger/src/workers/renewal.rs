use std::sync::Arc;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{Instrument, debug, info, warn};
use trigger_mssql::schema::TableId;

use crate::concurrency::shutdown::ShutdownRx;
use crate::config::TriggerConfig;
use crate::error::TriggerResult;
use crate::metrics::{
    TABLE_ID_LABEL, TRIGGER_HANDLER_CANCELLATIONS_TOTAL, TRIGGER_LEASE_RENEWALS_TOTAL,
};
use crate::store::state::LeaseStore;
use crate::types::Cell;
use crate::workers::base::{WorkerType, join_worker};
use crate::workers::batch::{ProcessorPhase, SharedBatchState};

/// Handle for monitoring the renewal worker.
#[derive(Debug)]
pub struct RenewalWorkerHandle {
    handle: JoinHandle<TriggerResult<()>>,
}

impl RenewalWorkerHandle {
    /// Waits for the renewal worker to complete execution.
    pub async fn wait(self) -> TriggerResult<()> {
        join_worker(self.handle, WorkerType::Renewal).await
    }
}

/// Worker that keeps the in-flight batch's leases alive.
///
/// Every half lease interval, while a batch is in the processing phase, the
/// renewal worker re-stamps the lease expiration on every in-flight key. It
/// also counts renewal rounds per batch; when the count reaches the
/// configured budget it assumes the handler is wedged and cancels the
/// handler's invocation through the batch-scoped cancellation token.
pub struct RenewalWorker<S> {
    table_id: TableId,
    config: Arc<TriggerConfig>,
    store: S,
    state: SharedBatchState,
    shutdown_rx: ShutdownRx,
}

impl<S> RenewalWorker<S>
where
    S: LeaseStore + Send + Sync + 'static,
{
    /// Creates a new renewal worker over the shared batch state.
    pub fn new(
        table_id: TableId,
        config: Arc<TriggerConfig>,
        store: S,
        state: SharedBatchState,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            table_id,
            config,
            store,
            state,
            shutdown_rx,
        }
    }

    /// Spawns the renewal worker and returns a handle for monitoring.
    pub fn start(self) -> RenewalWorkerHandle {
        let span = tracing::info_span!("renewal_worker", table_id = %self.table_id);
        let handle = tokio::spawn(self.run().instrument(span.or_current()));
        RenewalWorkerHandle { handle }
    }

    async fn run(self) -> TriggerResult<()> {
        info!("starting lease renewal worker");

        let mut ticker = interval(self.config.lease_renewal_interval());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.renew_once().await;
                }
                _ = self.shutdown_rx.wait_for_shutdown() => {
                    info!("renewal worker received shutdown signal");
                    return Ok(());
                }
            }
        }
    }

    /// Runs one renewal round. Holds the batch mutex around the renewal query
    /// and the renewal-count update so the poll worker cannot swap the batch
    /// out from underneath it.
    async fn renew_once(&self) {
        let mut state = self.state.lock().await;
        if state.phase != ProcessorPhase::ProcessingChanges || state.batch.is_empty() {
            return;
        }

        let keys: Vec<Vec<Cell>> = state
            .batch
            .iter()
            .map(|change| change.key.clone())
            .collect();

        match self.store.renew_leases(&keys).await {
            Ok(()) => {
                debug!(rows = keys.len(), "renewed in-flight leases");
                counter!(
                    TRIGGER_LEASE_RENEWALS_TOTAL,
                    TABLE_ID_LABEL => self.table_id.to_string()
                )
                .increment(1);
            }
            Err(err) => {
                // The next renewal tick, or eventually lease expiry, covers
                // the gap; the release guard protects against a steal racing
                // this worker's release.
                warn!(error = %err, "lease renewal failed");
            }
        }

        state.renewal_count += 1;
        if state.renewal_count >= self.config.max_lease_renewal_count
            && !state.cancellation.is_cancelled()
        {
            warn!(
                renewal_count = state.renewal_count,
                "handler exceeded its renewal budget, cancelling the invocation"
            );
            state.cancellation.cancel();
            counter!(
                TRIGGER_HANDLER_CANCELLATIONS_TOTAL,
                TABLE_ID_LABEL => self.table_id.to_string()
            )
            .increment(1);
        }
    }
}
