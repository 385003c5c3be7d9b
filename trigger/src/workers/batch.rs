//! Shared state of the in-flight batch.
//!
//! The poll and renewal workers are the only contenders for this state. The
//! poll worker mutates batch membership and drives the phase transitions; the
//! renewal worker re-stamps leases and counts renewals. The mutex is held
//! around those operations only, never across a handler invocation.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::types::LeasedChange;

/// Phase of the per-table processing state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorPhase {
    /// Polling for new changes; the in-flight batch is empty.
    CheckingForChanges,
    /// A batch is leased and the handler is (or is about to be) running.
    ProcessingChanges,
}

/// The in-flight batch and its processing phase.
#[derive(Debug)]
pub struct BatchState {
    /// Current phase of the state machine.
    pub phase: ProcessorPhase,
    /// The leased rows currently being processed.
    pub batch: Vec<LeasedChange>,
    /// Renewal rounds performed on the current batch.
    pub renewal_count: u32,
    /// Cancellation token scoped to the current handler invocation. Replaced
    /// for every batch so cancellations never leak across invocations.
    pub cancellation: CancellationToken,
}

impl BatchState {
    fn new() -> Self {
        Self {
            phase: ProcessorPhase::CheckingForChanges,
            batch: Vec::new(),
            renewal_count: 0,
            cancellation: CancellationToken::new(),
        }
    }
}

/// The batch state shared between the poll and renewal workers.
pub type SharedBatchState = Arc<Mutex<BatchState>>;

/// Creates a fresh shared batch state in the checking phase.
pub fn create_batch_state() -> SharedBatchState {
    Arc::new(Mutex::new(BatchState::new()))
}
