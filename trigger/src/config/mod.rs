//! Configuration objects for the trigger runtime.
//!
//! This module contains re-exported configurations that are needed by the
//! runtime, plus the loading entry point host bindings use.

// Re-exports.
pub use trigger_config::shared::*;

use crate::error::TriggerResult;

/// Loads and validates the worker configuration.
///
/// Uses the standard configuration loading mechanism from [`trigger_config`]
/// (base file, environment file, `TRIGGER_`-prefixed variable overrides) and
/// validates the resulting [`WorkerConfig`] before returning it.
pub fn load_worker_config() -> TriggerResult<WorkerConfig> {
    let config = trigger_config::load_worker_config()?;
    config.validate()?;

    Ok(config)
}
