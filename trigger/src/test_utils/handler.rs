use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::info;

use crate::error::{TriggerError, TriggerResult};
use crate::handler::ChangeHandler;
use crate::types::ChangeEvent;
use tokio_util::sync::CancellationToken;

/// Default timeout when waiting for handler activity in tests.
///
/// Chosen empirically; under a paused clock the timeout is virtual time, so
/// generous values cost nothing.
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

/// How a scripted invocation behaves.
#[derive(Debug, Clone, Copy)]
enum Behavior {
    Succeed,
    Fail,
    Wedge,
}

#[derive(Debug)]
struct Inner {
    batches: Vec<Vec<ChangeEvent>>,
    invocations: u32,
    cancellations: u32,
    failures_remaining: u32,
    wedge: bool,
}

/// In-memory handler for testing the trigger runtime.
///
/// [`MemoryHandler`] captures every delivered batch and can be scripted to
/// fail the first N invocations or to wedge (block until cancelled). All
/// captured data is held in memory for later inspection.
#[derive(Debug, Clone)]
pub struct MemoryHandler {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryHandler {
    /// Creates a handler that succeeds on every invocation.
    pub fn new() -> Self {
        Self::with_failures(0)
    }

    /// Creates a handler that fails its first `failures` invocations and
    /// succeeds afterwards.
    pub fn with_failures(failures: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                batches: Vec::new(),
                invocations: 0,
                cancellations: 0,
                failures_remaining: failures,
                wedge: false,
            })),
        }
    }

    /// Creates a handler that blocks until its invocation is cancelled.
    pub fn wedged() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                batches: Vec::new(),
                invocations: 0,
                cancellations: 0,
                failures_remaining: 0,
                wedge: true,
            })),
        }
    }

    /// Returns a copy of every delivered batch, in delivery order.
    pub async fn batches(&self) -> Vec<Vec<ChangeEvent>> {
        self.inner.lock().await.batches.clone()
    }

    /// Returns a flat copy of every delivered event, in delivery order.
    pub async fn events(&self) -> Vec<ChangeEvent> {
        self.inner.lock().await.batches.concat()
    }

    /// Returns the number of handler invocations so far.
    pub async fn invocation_count(&self) -> u32 {
        self.inner.lock().await.invocations
    }

    /// Returns the number of invocations that ended by cancellation.
    pub async fn cancellation_count(&self) -> u32 {
        self.inner.lock().await.cancellations
    }

    /// Waits until at least `count` invocations have happened.
    ///
    /// # Panics
    ///
    /// Panics when the count is not reached within the default timeout, so a
    /// test fails fast instead of hanging.
    pub async fn wait_for_invocations(&self, count: u32) {
        let waited = timeout(DEFAULT_WAIT_TIMEOUT, async {
            while self.invocation_count().await < count {
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await;

        if waited.is_err() {
            panic!(
                "timed out waiting for {count} handler invocations; \
                 the expected state was never reached"
            );
        }
    }

    /// Waits until at least `count` invocations ended by cancellation.
    ///
    /// # Panics
    ///
    /// Panics when the count is not reached within the default timeout.
    pub async fn wait_for_cancellations(&self, count: u32) {
        let waited = timeout(DEFAULT_WAIT_TIMEOUT, async {
            while self.cancellation_count().await < count {
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await;

        if waited.is_err() {
            panic!(
                "timed out waiting for {count} handler cancellations; \
                 the expected state was never reached"
            );
        }
    }
}

impl Default for MemoryHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeHandler for MemoryHandler {
    async fn handle_changes(
        &self,
        batch: Vec<ChangeEvent>,
        cancellation: CancellationToken,
    ) -> TriggerResult<()> {
        let behavior = {
            let mut inner = self.inner.lock().await;
            inner.invocations += 1;
            info!(
                invocation = inner.invocations,
                rows = batch.len(),
                "memory handler invoked"
            );
            inner.batches.push(batch);

            if inner.wedge {
                Behavior::Wedge
            } else if inner.failures_remaining > 0 {
                inner.failures_remaining -= 1;
                Behavior::Fail
            } else {
                Behavior::Succeed
            }
        };

        match behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail => Err(TriggerError::handler_failed("scripted failure")),
            Behavior::Wedge => {
                cancellation.cancelled().await;
                let mut inner = self.inner.lock().await;
                inner.cancellations += 1;
                Err(TriggerError::handler_failed("invocation cancelled"))
            }
        }
    }
}
