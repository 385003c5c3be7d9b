use std::fmt;

use tokio::task::JoinHandle;

use crate::error::{ErrorKind, TriggerError, TriggerResult};

/// Classification of trigger worker types with identifying properties.
///
/// [`WorkerType`] distinguishes the cooperating tasks that run per user table
/// per worker process. This is used for logging and for mapping task panics
/// and cancellations to structured errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WorkerType {
    /// Worker that drives the poll loop and the two-phase state machine
    Poll,
    /// Worker that re-extends leases on the in-flight batch
    Renewal,
    /// Worker that maintains the liveness table
    Cleanup,
    /// Worker that samples throughput and emits scale recommendations
    ScaleMonitor,
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerType::Poll => "poll",
            WorkerType::Renewal => "renewal",
            WorkerType::Cleanup => "cleanup",
            WorkerType::ScaleMonitor => "scale-monitor",
        };
        write!(f, "{name}")
    }
}

/// Awaits a worker's join handle, mapping panics and runtime-level
/// cancellation to structured errors.
pub(crate) async fn join_worker(
    handle: JoinHandle<TriggerResult<()>>,
    worker_type: WorkerType,
) -> TriggerResult<()> {
    match handle.await {
        Ok(result) => result,
        Err(err) if err.is_cancelled() => Err(TriggerError::with_source(
            ErrorKind::WorkerCancelled { worker_type },
            err,
        )),
        Err(err) => Err(TriggerError::with_source(
            ErrorKind::WorkerPanicked { worker_type },
            err,
        )),
    }
}
