use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel, subscribe};
use crate::config::{TriggerConfig, WorkerConfig};
use crate::error::TriggerResult;
use crate::handler::ChangeHandler;
use crate::metrics::register_metrics;
use crate::store::mssql::MssqlStore;
use crate::store::state::LeaseStore;
use crate::types::{ScaleDecision, WorkerId};
use crate::workers::batch::create_batch_state;
use crate::workers::cleanup::{CleanupWorker, CleanupWorkerHandle};
use crate::workers::monitor::{ScaleMonitorHandle, ScaleMonitorWorker};
use crate::workers::poll::{PollWorker, PollWorkerHandle};
use crate::workers::renewal::{RenewalWorker, RenewalWorkerHandle};

enum PipelineState {
    Created,
    Started {
        poll_worker: PollWorkerHandle,
        renewal_worker: RenewalWorkerHandle,
        cleanup_worker: CleanupWorkerHandle,
        scale_monitor: Option<ScaleMonitorHandle>,
    },
}

impl std::fmt::Debug for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Created => write!(f, "Created"),
            PipelineState::Started { .. } => write!(f, "Started"),
        }
    }
}

/// Core orchestrator for one trigger binding on one user table.
///
/// The pipeline coordinates the cooperating tasks of a single worker process:
/// 1. **Provisioning**: ensures the coordination schema exists and reads the
///    user table's key schema.
/// 2. **Polling**: the poll worker discovers and leases changes, invokes the
///    handler and retires processed versions.
/// 3. **Renewal and housekeeping**: the renewal worker keeps in-flight leases
///    alive; the cleanup worker maintains the liveness table.
///
/// When a scale configuration is present, an independent read-only scale
/// monitor is started alongside the workers.
#[derive(Debug)]
pub struct TriggerPipeline<S, H> {
    config: Arc<TriggerConfig>,
    state: PipelineState,
    store: S,
    handler: Arc<H>,
    shutdown_tx: ShutdownTx,
}

impl<H> TriggerPipeline<MssqlStore, H>
where
    H: ChangeHandler + Send + Sync + 'static,
{
    /// Creates a pipeline over the production SQL Server store from a loaded
    /// worker configuration.
    ///
    /// This is the path host bindings take after
    /// [`crate::config::load_worker_config`]: the connection, table name and
    /// worker identity from the configuration become the store, and the
    /// trigger settings drive the workers.
    pub fn from_worker_config(worker_config: WorkerConfig, handler: H) -> Self {
        let worker_id = worker_config
            .worker_id
            .map(WorkerId::new)
            .unwrap_or_else(WorkerId::generate);
        let store = MssqlStore::new(
            worker_config.connection,
            worker_config.trigger.clone(),
            worker_config.table,
            worker_id,
        );

        Self::new(worker_config.trigger, store, handler)
    }
}

impl<S, H> TriggerPipeline<S, H>
where
    S: LeaseStore + Clone + Send + Sync + 'static,
    H: ChangeHandler + Send + Sync + 'static,
{
    /// Creates a new pipeline with the given configuration.
    ///
    /// The pipeline is created in the `Created` state. Call
    /// [`TriggerPipeline::start`] to begin processing.
    pub fn new(config: TriggerConfig, store: S, handler: H) -> Self {
        register_metrics();
        let (shutdown_tx, _shutdown_rx) = create_shutdown_channel();
        TriggerPipeline {
            config: Arc::new(config),
            state: PipelineState::Created,
            store,
            handler: Arc::new(handler),
            shutdown_tx,
        }
    }

    /// Starts the pipeline and begins processing changes.
    ///
    /// Validates the configuration, provisions the coordination schema, and
    /// spawns the poll, renewal and cleanup workers (plus the scale monitor
    /// when configured).
    pub async fn start(&mut self) -> TriggerResult<()> {
        self.config.validate()?;

        let schema = self.store.provision().await?;
        let table_id = schema.id;

        info!(
            table = %schema.table,
            table_id = %table_id,
            batch_size = %self.config.batch_size,
            "starting trigger pipeline"
        );

        let batch_state = create_batch_state();

        let poll_worker = PollWorker::new(
            table_id,
            self.config.clone(),
            self.store.clone(),
            self.handler.clone(),
            batch_state.clone(),
            self.shutdown_tx.clone(),
            subscribe(&self.shutdown_tx),
        )
        .start();

        let renewal_worker = RenewalWorker::new(
            table_id,
            self.config.clone(),
            self.store.clone(),
            batch_state,
            subscribe(&self.shutdown_tx),
        )
        .start();

        let cleanup_worker = CleanupWorker::new(
            table_id,
            self.config.clone(),
            self.store.clone(),
            subscribe(&self.shutdown_tx),
        )
        .start();

        let scale_monitor = self.config.scale.as_ref().map(|scale| {
            info!(table_id = %table_id, "starting scale monitor");
            ScaleMonitorWorker::new(
                table_id,
                self.config.clone(),
                scale.clone(),
                self.store.clone(),
                subscribe(&self.shutdown_tx),
            )
            .start()
        });

        self.state = PipelineState::Started {
            poll_worker,
            renewal_worker,
            cleanup_worker,
            scale_monitor,
        };

        Ok(())
    }

    /// Returns a receiver observing the latest scale decision, when the
    /// pipeline was started with a scale monitor.
    pub fn scale_decisions(&self) -> Option<watch::Receiver<Option<ScaleDecision>>> {
        match &self.state {
            PipelineState::Started {
                scale_monitor: Some(monitor),
                ..
            } => Some(monitor.decisions()),
            _ => None,
        }
    }

    /// Waits for the pipeline to complete all work.
    ///
    /// Blocks until every worker has finished. The poll worker completes
    /// first (its termination signals the others), then renewal, cleanup and
    /// the scale monitor. Worker errors are logged; cancellation-induced
    /// errors are expected during shutdown and not treated as faults.
    pub async fn wait(self) -> TriggerResult<()> {
        let PipelineState::Started {
            poll_worker,
            renewal_worker,
            cleanup_worker,
            scale_monitor,
        } = self.state
        else {
            info!("pipeline was not started, skipping wait");
            return Ok(());
        };

        info!("waiting for poll worker to complete");
        if let Err(err) = poll_worker.wait().await
            && !err.is_cancellation()
        {
            error!(error = %err, "poll worker failed");
        }

        info!("waiting for renewal worker to complete");
        if let Err(err) = renewal_worker.wait().await
            && !err.is_cancellation()
        {
            error!(error = %err, "renewal worker failed");
        }

        info!("waiting for cleanup worker to complete");
        if let Err(err) = cleanup_worker.wait().await
            && !err.is_cancellation()
        {
            error!(error = %err, "cleanup worker failed");
        }

        if let Some(monitor) = scale_monitor {
            info!("waiting for scale monitor to complete");
            if let Err(err) = monitor.wait().await
                && !err.is_cancellation()
            {
                error!(error = %err, "scale monitor failed");
            }
        }

        info!("trigger pipeline stopped");

        Ok(())
    }

    /// Initiates a graceful shutdown of the pipeline.
    ///
    /// Signals all workers to stop processing. Call
    /// [`TriggerPipeline::wait`] afterwards to wait for completion.
    pub fn shutdown(&self) {
        info!("sending shutdown signal to trigger workers");
        let _ = self.shutdown_tx.send(true);
    }

    /// Signals a graceful shutdown and then waits for all workers to
    /// complete.
    pub async fn shutdown_and_wait(self) -> TriggerResult<()> {
        self.shutdown();
        self.wait().await
    }
}
