//! Scale monitor: a read-only observer advising a fleet controller.
//!
//! The monitor holds no leases and never writes change state. Each heartbeat
//! samples the change count, fleet throughput and active worker count, and
//! turns the deltas into an add/remove/none recommendation with a
//! human-readable reason.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Instrument, debug, info, warn};
use trigger_mssql::schema::TableId;

use crate::concurrency::shutdown::ShutdownRx;
use crate::config::{ScaleConfig, TriggerConfig};
use crate::error::TriggerResult;
use crate::metrics::{
    RECOMMENDATION_LABEL, TABLE_ID_LABEL, TRIGGER_ACTIVE_WORKERS,
    TRIGGER_SCALE_RECOMMENDATIONS_TOTAL, TRIGGER_UNPROCESSED_CHANGES,
};
use crate::store::state::{ChangeCountScope, LeaseStore};
use crate::types::{ScaleDecision, ScaleRecommendation};
use crate::workers::base::{WorkerType, join_worker};

/// Stateful delta computation between scale heartbeats.
///
/// Stateless across process boundaries; within a process it remembers the
/// previous change count and processed-rows counter so each heartbeat can
/// reason about deltas. Both fields start uninitialized, so the first
/// heartbeat only primes them.
#[derive(Debug, Default)]
pub struct ScaleSampler {
    last_changes: Option<i64>,
    last_rows_processed: Option<i64>,
}

impl ScaleSampler {
    /// Creates an uninitialized sampler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluates one heartbeat's samples into a decision.
    ///
    /// `current_changes` is `None` when the change count could not be read;
    /// the sampler then keeps its state and recommends no change.
    pub fn evaluate(
        &mut self,
        current_changes: Option<i64>,
        rows_processed: i64,
        active_workers: i64,
        batch_size: i64,
    ) -> ScaleDecision {
        let Some(current_changes) = current_changes else {
            return decision(
                ScaleRecommendation::None,
                true,
                "change count could not be read".to_string(),
                0,
                0,
            );
        };

        let (Some(last_changes), Some(last_rows_processed)) =
            (self.last_changes, self.last_rows_processed)
        else {
            self.last_changes = Some(current_changes);
            self.last_rows_processed = Some(rows_processed);
            return decision(
                ScaleRecommendation::None,
                true,
                "first heartbeat, deltas not yet available".to_string(),
                0,
                0,
            );
        };

        let new_changes = current_changes - last_changes;
        let new_rows_processed = unwrap_rows_delta(last_rows_processed, rows_processed);
        self.last_changes = Some(current_changes);
        self.last_rows_processed = Some(rows_processed);

        if new_changes < 0 {
            return decision(
                ScaleRecommendation::None,
                true,
                "change table was cleaned up since the last heartbeat".to_string(),
                new_changes,
                new_rows_processed,
            );
        }

        if new_rows_processed < new_changes {
            return decision(
                ScaleRecommendation::AddWorker,
                true,
                format!(
                    "workers processed {new_rows_processed} of {new_changes} new changes"
                ),
                new_changes,
                new_rows_processed,
            );
        }

        let unused_capacity = active_workers * batch_size - new_rows_processed;
        if unused_capacity >= batch_size {
            return decision(
                ScaleRecommendation::RemoveWorker,
                false,
                format!(
                    "{unused_capacity} rows of unused capacity across {active_workers} workers"
                ),
                new_changes,
                new_rows_processed,
            );
        }

        decision(
            ScaleRecommendation::None,
            true,
            "throughput matches incoming changes".to_string(),
            new_changes,
            new_rows_processed,
        )
    }
}

fn decision(
    recommendation: ScaleRecommendation,
    keep_alive: bool,
    reason: String,
    new_changes: i64,
    new_rows_processed: i64,
) -> ScaleDecision {
    ScaleDecision {
        recommendation,
        keep_alive,
        reason,
        new_changes,
        new_rows_processed,
    }
}

/// Computes the processed-rows delta, unwrapping the counter's wrap at
/// `i64::MAX`.
fn unwrap_rows_delta(last: i64, current: i64) -> i64 {
    let delta = current - last;
    if last > 0 && delta < 0 {
        i64::MAX - last + current
    } else {
        delta
    }
}

/// Handle for monitoring the scale monitor worker.
#[derive(Debug)]
pub struct ScaleMonitorHandle {
    handle: JoinHandle<TriggerResult<()>>,
    decision_rx: watch::Receiver<Option<ScaleDecision>>,
}

impl ScaleMonitorHandle {
    /// Returns a receiver observing the latest scale decision.
    pub fn decisions(&self) -> watch::Receiver<Option<ScaleDecision>> {
        self.decision_rx.clone()
    }

    /// Waits for the scale monitor worker to complete execution.
    pub async fn wait(self) -> TriggerResult<()> {
        join_worker(self.handle, WorkerType::ScaleMonitor).await
    }
}

/// Worker that periodically samples the store and publishes scale decisions.
///
/// Failed samples are retried with jittered exponential backoff so a fleet of
/// monitors does not hammer a recovering database in lockstep.
pub struct ScaleMonitorWorker<S> {
    table_id: TableId,
    config: Arc<TriggerConfig>,
    scale: ScaleConfig,
    store: S,
    sampler: ScaleSampler,
    shutdown_rx: ShutdownRx,
    decision_tx: watch::Sender<Option<ScaleDecision>>,
}

impl<S> ScaleMonitorWorker<S>
where
    S: LeaseStore + Send + Sync + 'static,
{
    /// Creates a new scale monitor worker.
    pub fn new(
        table_id: TableId,
        config: Arc<TriggerConfig>,
        scale: ScaleConfig,
        store: S,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        let (decision_tx, _) = watch::channel(None);
        Self {
            table_id,
            config,
            scale,
            store,
            sampler: ScaleSampler::new(),
            shutdown_rx,
            decision_tx,
        }
    }

    /// Spawns the scale monitor worker and returns a handle for monitoring.
    pub fn start(self) -> ScaleMonitorHandle {
        let span = tracing::info_span!("scale_monitor", table_id = %self.table_id);
        let decision_rx = self.decision_tx.subscribe();
        let handle = tokio::spawn(self.run().instrument(span.or_current()));
        ScaleMonitorHandle {
            handle,
            decision_rx,
        }
    }

    async fn run(mut self) -> TriggerResult<()> {
        info!("starting scale monitor");

        let min_backoff = Duration::from_millis(self.scale.min_backoff_ms);
        let max_backoff = Duration::from_millis(self.scale.max_backoff_ms);
        let mut current_backoff = min_backoff;

        loop {
            if self.shutdown_rx.is_shutdown() {
                info!("scale monitor shutting down");
                return Ok(());
            }

            match self.heartbeat().await {
                Ok(decision) => {
                    current_backoff = min_backoff;
                    debug!(
                        recommendation = %decision.recommendation,
                        reason = %decision.reason,
                        "scale heartbeat"
                    );
                    let _ = self.decision_tx.send(Some(decision));

                    tokio::select! {
                        _ = sleep(self.config.polling_interval()) => {}
                        _ = self.shutdown_rx.wait_for_shutdown() => {}
                    }
                }
                Err(err) => {
                    let jittered_backoff = self.jittered(current_backoff);
                    warn!(
                        error = %err,
                        backoff_ms = %jittered_backoff.as_millis(),
                        "scale heartbeat failed, will retry after backoff"
                    );

                    tokio::select! {
                        _ = sleep(jittered_backoff) => {}
                        _ = self.shutdown_rx.wait_for_shutdown() => {}
                    }

                    current_backoff = (current_backoff * 2).min(max_backoff);
                }
            }
        }
    }

    /// Runs one heartbeat: sample, evaluate, publish metrics.
    async fn heartbeat(&mut self) -> TriggerResult<ScaleDecision> {
        let scope = if self.scale.count_only_unprocessed {
            ChangeCountScope::Unprocessed
        } else {
            ChangeCountScope::All
        };

        // An unreadable change count is a decision input, not a failed
        // heartbeat.
        let current_changes = match self.store.change_count(scope).await {
            Ok(count) => Some(count),
            Err(err) => {
                warn!(error = %err, "change count could not be read");
                None
            }
        };

        let rows_processed = self.store.rows_processed().await?;
        let active_workers = self
            .store
            .active_worker_count(self.config.polling_interval())
            .await?;

        let decision = self.sampler.evaluate(
            current_changes,
            rows_processed,
            active_workers,
            i64::from(self.config.batch_size),
        );

        if let Some(current_changes) = current_changes {
            gauge!(
                TRIGGER_UNPROCESSED_CHANGES,
                TABLE_ID_LABEL => self.table_id.to_string()
            )
            .set(current_changes as f64);
        }
        gauge!(
            TRIGGER_ACTIVE_WORKERS,
            TABLE_ID_LABEL => self.table_id.to_string()
        )
        .set(active_workers as f64);
        counter!(
            TRIGGER_SCALE_RECOMMENDATIONS_TOTAL,
            TABLE_ID_LABEL => self.table_id.to_string(),
            RECOMMENDATION_LABEL => decision.recommendation.to_string()
        )
        .increment(1);

        Ok(decision)
    }

    /// Applies random jitter to a backoff so concurrent monitors spread out.
    fn jittered(&self, base: Duration) -> Duration {
        let jitter_fraction = f64::from(self.scale.jitter_percent) / 100.0;
        let jitter_range = base.as_secs_f64() * jitter_fraction;

        let mut rng = rand::rng();
        let jitter = if jitter_range > 0.0 {
            rng.random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_secs_f64((base.as_secs_f64() + jitter).max(0.1))
    }
}
