//! Change-tracking trigger runtime core.
//!
//! Lets multiple independent worker processes cooperatively consume row-level
//! changes from a change-tracked SQL Server table and deliver each change at
//! least once, deduplicated by version number, to a user-supplied handler.
//! The database itself is the shared coordinator: workers acquire short-lived
//! leases on change rows, renew them while a batch is in flight, steal
//! abandoned work after lease expiry, and retire processed changes by
//! advancing a shared version watermark. A read-only scale monitor observes
//! throughput and lag to advise a fleet controller.

pub mod concurrency;
pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod pipeline;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workers;
