use std::sync::Arc;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};
use trigger_mssql::schema::TableId;

use crate::concurrency::shutdown::{ShutdownRx, ShutdownTx};
use crate::config::TriggerConfig;
use crate::error::{ErrorKind, TriggerError, TriggerResult};
use crate::handler::ChangeHandler;
use crate::metrics::{
    TABLE_ID_LABEL, TRIGGER_BATCHES_DELIVERED_TOTAL, TRIGGER_BATCHES_FAILED_TOTAL,
    TRIGGER_ROWS_DELIVERED_TOTAL,
};
use crate::store::state::LeaseStore;
use crate::types::LeasedChange;
use crate::workers::base::{WorkerType, join_worker};
use crate::workers::batch::{ProcessorPhase, SharedBatchState};

/// Handle for monitoring the poll worker.
#[derive(Debug)]
pub struct PollWorkerHandle {
    handle: JoinHandle<TriggerResult<()>>,
}

impl PollWorkerHandle {
    /// Waits for the poll worker to complete execution.
    pub async fn wait(self) -> TriggerResult<()> {
        join_worker(self.handle, WorkerType::Poll).await
    }
}

/// Worker that drives the two-phase processing state machine.
///
/// [`PollWorker`] owns the poll loop: it discovers and leases new changes,
/// invokes the user handler, and runs the release-and-advance protocol when
/// the handler succeeds. It is the only task that mutates the in-flight
/// batch's membership.
///
/// When the poll loop terminates (shutdown or fatal error), it signals the
/// companion renewal and cleanup workers to stop as well.
pub struct PollWorker<S, H> {
    table_id: TableId,
    config: Arc<TriggerConfig>,
    store: S,
    handler: Arc<H>,
    state: SharedBatchState,
    shutdown_tx: ShutdownTx,
    shutdown_rx: ShutdownRx,
}

impl<S, H> PollWorker<S, H>
where
    S: LeaseStore + Send + Sync + 'static,
    H: ChangeHandler + Send + Sync + 'static,
{
    /// Creates a new poll worker over the shared batch state.
    pub fn new(
        table_id: TableId,
        config: Arc<TriggerConfig>,
        store: S,
        handler: Arc<H>,
        state: SharedBatchState,
        shutdown_tx: ShutdownTx,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            table_id,
            config,
            store,
            handler,
            state,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Spawns the poll worker and returns a handle for monitoring.
    pub fn start(self) -> PollWorkerHandle {
        let span = tracing::info_span!("poll_worker", table_id = %self.table_id);
        let handle = tokio::spawn(self.run().instrument(span.or_current()));
        PollWorkerHandle { handle }
    }

    async fn run(mut self) -> TriggerResult<()> {
        info!("starting poll worker");

        loop {
            if self.shutdown_rx.is_shutdown() {
                break;
            }

            match self.poll_once().await {
                // A batch was processed; look for more work immediately.
                Ok(true) => {}
                Ok(false) => self.sleep_between_polls().await,
                Err(err) => {
                    error!(error = %err, "poll tick failed, retrying after polling interval");
                    self.clear_batch().await;
                    self.sleep_between_polls().await;
                }
            }
        }

        info!("poll worker stopping, signalling companion workers");
        let _ = self.shutdown_tx.send(true);

        Ok(())
    }

    /// Runs one poll tick. Returns `true` when a batch was taken through the
    /// processing phase, `false` when there was nothing to do.
    async fn poll_once(&mut self) -> TriggerResult<bool> {
        self.store.synchronize_version().await?;
        let batch = self.store.fetch_batch().await?;

        if batch.is_empty() {
            // Retire the tail the second-highest-version rule left behind.
            if let Err(err) = self.store.try_advance_tail().await {
                warn!(error = %err, "tail advance failed, next tick retries");
            }
            return Ok(false);
        }

        debug!(rows = batch.len(), "processing change batch");

        let cancellation = CancellationToken::new();
        {
            let mut state = self.state.lock().await;
            state.phase = ProcessorPhase::ProcessingChanges;
            state.batch = batch.clone();
            state.renewal_count = 0;
            state.cancellation = cancellation.clone();
        }

        let events = batch.iter().map(LeasedChange::to_event).collect();

        // The handler is a long operation; it runs without holding the batch
        // mutex so lease renewal can proceed concurrently. Shutdown cancels
        // the invocation's token and then waits for the handler to observe
        // it.
        let outcome = {
            let invocation = self.handler.handle_changes(events, cancellation.clone());
            tokio::pin!(invocation);
            tokio::select! {
                outcome = &mut invocation => outcome,
                _ = self.shutdown_rx.wait_for_shutdown() => {
                    info!("shutdown requested, cancelling in-flight handler invocation");
                    cancellation.cancel();
                    invocation.await
                }
            }
        };

        match outcome {
            Ok(()) => self.release_and_advance(&batch).await,
            Err(err) => {
                // Leases are left to expire; another worker (or this one)
                // retries, and the dequeue count eventually poisons the rows.
                let err = {
                    let state = self.state.lock().await;
                    if state.cancellation.is_cancelled() {
                        TriggerError::with_source(
                            ErrorKind::HandlerWedged {
                                renewal_count: state.renewal_count,
                            },
                            err,
                        )
                    } else {
                        err
                    }
                };
                warn!(error = %err, "handler failed, leases will expire and be retried");
                counter!(
                    TRIGGER_BATCHES_FAILED_TOTAL,
                    TABLE_ID_LABEL => self.table_id.to_string()
                )
                .increment(1);
            }
        }

        self.clear_batch().await;

        Ok(true)
    }

    /// Runs the release-and-advance protocol after a successful handler
    /// invocation: release leases and report the batch size in one
    /// transaction, then advance the global version in a second one so the
    /// released leases are already visible.
    async fn release_and_advance(&self, batch: &[LeasedChange]) {
        if let Err(err) = self.store.release_batch(batch).await {
            warn!(error = %err, "lease release failed, leases will expire instead");
            return;
        }

        let candidate = advance_candidate(batch);
        if let Err(err) = self
            .store
            .try_advance_version(candidate, batch.len() as i64)
            .await
        {
            warn!(error = %err, "version advance failed, next batch retries");
        }

        counter!(
            TRIGGER_BATCHES_DELIVERED_TOTAL,
            TABLE_ID_LABEL => self.table_id.to_string()
        )
        .increment(1);
        counter!(
            TRIGGER_ROWS_DELIVERED_TOTAL,
            TABLE_ID_LABEL => self.table_id.to_string()
        )
        .increment(batch.len() as u64);
    }

    /// Clears the in-flight batch and returns to the checking phase.
    async fn clear_batch(&self) {
        let mut state = self.state.lock().await;
        state.batch.clear();
        state.renewal_count = 0;
        state.phase = ProcessorPhase::CheckingForChanges;
    }

    async fn sleep_between_polls(&self) {
        tokio::select! {
            _ = sleep(self.config.polling_interval()) => {}
            _ = self.shutdown_rx.wait_for_shutdown() => {}
        }
    }
}

/// Picks the version the batch is allowed to advance the global version to.
///
/// The highest version in the batch may still have unseen sibling changes at
/// the same version owned by other workers; the second-highest is the largest
/// value for which every strictly-lower version in this batch is covered. A
/// single-element batch advances to its only version.
fn advance_candidate(batch: &[LeasedChange]) -> i64 {
    debug_assert!(!batch.is_empty());
    if batch.len() == 1 {
        batch[0].version
    } else {
        batch[batch.len() - 2].version
    }
}
