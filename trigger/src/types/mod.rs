//! Shared data types of the trigger runtime.

use std::fmt;
use std::sync::Arc;

pub use trigger_mssql::schema::{TableId, TableName};
pub use trigger_mssql::types::{Cell, ChangeOperation};

/// Stable identity of one worker process.
///
/// Recorded in the worker-liveness table and used in log spans. Two workers
/// must never share an id; the default derivation combines the host name with
/// the process id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    /// Creates a worker id from an explicit string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives a worker id from the host name and process id.
    pub fn generate() -> Self {
        let host = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "worker".to_string());
        Self(format!("{host}_{}", std::process::id()))
    }

    /// Returns the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One row's worth of user-table data delivered to the handler.
///
/// Columns and values are kept in table ordinal order; the column list is
/// shared across the rows of a batch. For deletions only the primary-key
/// columns are present.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRow {
    columns: Arc<Vec<String>>,
    values: Vec<Cell>,
}

impl ChangeRow {
    /// Creates a row from a shared column list and matching values.
    pub fn new(columns: Arc<Vec<String>>, values: Vec<Cell>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Returns the value of the named column, if present.
    pub fn get(&self, column: &str) -> Option<&Cell> {
        self.columns
            .iter()
            .position(|name| name == column)
            .map(|index| &self.values[index])
    }

    /// Returns the column names in table ordinal order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns the values in table ordinal order.
    pub fn values(&self) -> &[Cell] {
        &self.values
    }

    /// Iterates over `(column, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Cell)> {
        self.columns
            .iter()
            .map(|name| name.as_str())
            .zip(self.values.iter())
    }
}

/// One change delivered to the user handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Kind of change the database reported for this row.
    pub operation: ChangeOperation,
    /// Row payload; primary-key columns only for deletions.
    pub row: ChangeRow,
}

/// A change row fetched under a lease, as the workers see it.
///
/// Carries the coordination metadata the handler never sees: the change
/// version and the primary-key tuple used for renewal and release.
#[derive(Debug, Clone)]
pub struct LeasedChange {
    /// The change version this lease covers.
    pub version: i64,
    /// Kind of change the database reported.
    pub operation: ChangeOperation,
    /// Primary-key values of the row, in key order.
    pub key: Vec<Cell>,
    /// The handler-facing payload.
    pub row: ChangeRow,
}

impl LeasedChange {
    /// Converts the leased change into its handler-facing event.
    pub fn to_event(&self) -> ChangeEvent {
        ChangeEvent {
            operation: self.operation,
            row: self.row.clone(),
        }
    }
}

/// Scaling advice emitted by the scale monitor for a fleet controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleRecommendation {
    /// Workers are falling behind; add one.
    AddWorker,
    /// The fleet has at least one batch worth of spare capacity; remove one.
    RemoveWorker,
    /// Keep the fleet as it is.
    None,
}

impl fmt::Display for ScaleRecommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScaleRecommendation::AddWorker => "add-worker",
            ScaleRecommendation::RemoveWorker => "remove-worker",
            ScaleRecommendation::None => "none",
        };
        write!(f, "{name}")
    }
}

/// One scale monitor heartbeat: the recommendation plus the observed deltas.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleDecision {
    /// The scaling advice for the fleet controller.
    pub recommendation: ScaleRecommendation,
    /// Whether this worker should be kept alive.
    pub keep_alive: bool,
    /// Human-readable reason for the recommendation.
    pub reason: String,
    /// New changes observed since the previous heartbeat.
    pub new_changes: i64,
    /// Rows processed by the fleet since the previous heartbeat, unwrapped.
    pub new_rows_processed: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_generation_is_nonempty() {
        let id = WorkerId::generate();
        assert!(!id.as_str().is_empty());
        assert!(id.as_str().contains('_'));
    }

    #[test]
    fn test_change_row_lookup() {
        let columns = Arc::new(vec!["id".to_string(), "name".to_string()]);
        let row = ChangeRow::new(
            columns,
            vec![Cell::I32(1), Cell::String("first".to_string())],
        );

        assert_eq!(row.get("id"), Some(&Cell::I32(1)));
        assert_eq!(row.get("name"), Some(&Cell::String("first".to_string())));
        assert_eq!(row.get("missing"), None);
        assert_eq!(row.iter().count(), 2);
    }

    #[test]
    fn test_leased_change_to_event_drops_metadata() {
        let columns = Arc::new(vec!["id".to_string()]);
        let leased = LeasedChange {
            version: 17,
            operation: ChangeOperation::Delete,
            key: vec![Cell::I32(9)],
            row: ChangeRow::new(columns, vec![Cell::I32(9)]),
        };

        let event = leased.to_event();
        assert_eq!(event.operation, ChangeOperation::Delete);
        assert_eq!(event.row.get("id"), Some(&Cell::I32(9)));
    }
}
