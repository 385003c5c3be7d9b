//! Shared configuration types for the trigger runtime.

mod connection;
mod scale;
mod trigger;
mod worker;

pub use connection::{MssqlConnectionConfig, MssqlConnectionConfigWithoutSecrets};
pub use scale::ScaleConfig;
pub use trigger::{TimeUnit, TriggerConfig};
pub use worker::WorkerConfig;

use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A field holds a value outside its allowed range.
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue {
        field: &'static str,
        constraint: &'static str,
    },
}
