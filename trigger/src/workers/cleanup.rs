use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{Instrument, info, warn};
use trigger_mssql::schema::TableId;

use crate::concurrency::shutdown::ShutdownRx;
use crate::config::TriggerConfig;
use crate::error::TriggerResult;
use crate::store::state::LeaseStore;
use crate::workers::base::{WorkerType, join_worker};

/// Handle for monitoring the cleanup worker.
#[derive(Debug)]
pub struct CleanupWorkerHandle {
    handle: JoinHandle<TriggerResult<()>>,
}

impl CleanupWorkerHandle {
    /// Waits for the cleanup worker to complete execution.
    pub async fn wait(self) -> TriggerResult<()> {
        join_worker(self.handle, WorkerType::Cleanup).await
    }
}

/// Worker that maintains the worker-liveness table.
///
/// Every cleanup interval, the worker deletes liveness rows that have not
/// been refreshed within the interval (abandoned workers) and refreshes this
/// worker's own row. On shutdown it deletes its own row so peers do not need
/// to wait out the staleness window.
pub struct CleanupWorker<S> {
    table_id: TableId,
    config: Arc<TriggerConfig>,
    store: S,
    shutdown_rx: ShutdownRx,
}

impl<S> CleanupWorker<S>
where
    S: LeaseStore + Send + Sync + 'static,
{
    /// Creates a new cleanup worker.
    pub fn new(
        table_id: TableId,
        config: Arc<TriggerConfig>,
        store: S,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            table_id,
            config,
            store,
            shutdown_rx,
        }
    }

    /// Spawns the cleanup worker and returns a handle for monitoring.
    pub fn start(self) -> CleanupWorkerHandle {
        let span = tracing::info_span!("cleanup_worker", table_id = %self.table_id);
        let handle = tokio::spawn(self.run().instrument(span.or_current()));
        CleanupWorkerHandle { handle }
    }

    async fn run(self) -> TriggerResult<()> {
        info!("starting cleanup worker");

        let mut ticker = interval(self.config.cleanup_duration());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.housekeep_once().await;
                }
                _ = self.shutdown_rx.wait_for_shutdown() => {
                    break;
                }
            }
        }

        // Delete our own liveness row on the way out.
        if let Err(err) = self.store.retire_worker().await {
            warn!(error = %err, "failed to retire worker liveness row on shutdown");
        } else {
            info!("cleanup worker retired its liveness row");
        }

        Ok(())
    }

    async fn housekeep_once(&self) {
        if let Err(err) = self.store.cleanup_stale_workers().await {
            warn!(error = %err, "stale worker cleanup failed, next tick retries");
        }
        if let Err(err) = self.store.refresh_worker().await {
            warn!(error = %err, "liveness refresh failed, next tick retries");
        }
    }
}
