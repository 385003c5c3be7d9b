//! SQL Server specific building blocks for the trigger runtime.
//!
//! This crate is the engine-facing leaf: table and column schema types read
//! from the system catalogs, identifier quoting, the dynamic [`types::Cell`]
//! value bridging driver rows and handler payloads, and the per-table T-SQL
//! statement builders used by the lease store.

pub mod schema;
pub mod sql;
pub mod types;
