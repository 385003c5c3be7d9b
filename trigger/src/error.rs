use std::{error, fmt, result};

use crate::workers::base::WorkerType;

/// Type alias for convenience when using the Result type with our Error.
pub type TriggerResult<T> = result::Result<T, TriggerError>;

/// Internal error representation with kind and optional source error.
///
/// Uses boxing to keep the public Error type size consistent and enable
/// rich error context without penalizing the success path.
struct ErrorInner {
    kind: ErrorKind,
    source: Option<Box<dyn error::Error + Send + Sync>>,
}

/// Error classification for the trigger runtime.
///
/// Covers the failure surfaces of the coordination protocol: schema
/// provisioning, database round-trips, handler invocation, and worker
/// lifecycle.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Database connection failure with connection details
    ConnectionFailed { host: String, database: String },
    /// Connection lost during ongoing operations
    ConnectionLost,
    /// SQL query execution failure
    QueryExecutionFailed { query: String },
    /// Database transaction operation failure
    TransactionFailed,

    /// User table not found in the database
    TableNotFound { table_name: String },
    /// Change tracking is not enabled on the table or database
    ChangeTrackingNotEnabled { table_name: String },
    /// The user table has no primary key to lease on
    PrimaryKeyMissing { table_name: String },
    /// Unsupported SQL Server data type encountered while decoding a row
    UnsupportedDataType { table_name: String, reason: String },
    /// Coordination tables could not be created
    SchemaProvisioningFailed { reason: String },

    /// A fetched change row could not be decoded for the handler
    RowDecodingFailed { column: String },
    /// The user handler signalled failure for a batch
    HandlerFailed { reason: String },
    /// The handler exceeded the renewal budget and was cancelled
    HandlerWedged { renewal_count: u32 },

    /// Worker task panicked during execution
    WorkerPanicked { worker_type: WorkerType },
    /// Worker task cancelled during execution
    WorkerCancelled { worker_type: WorkerType },

    /// An internal state invariant was violated
    InvalidState { description: String },
    /// Configuration parsing or validation failure
    ConfigurationError { parameter: String, reason: String },

    /// Error that doesn't fit other categories
    Other { description: String },
}

/// A stable error type for the trigger runtime using the boxed-inner pattern.
///
/// Provides a stable public API while allowing internal error details to
/// evolve. Supports error chaining and classification for retry decisions.
pub struct TriggerError(Box<ErrorInner>);

impl TriggerError {
    /// Creates a new error with the specified kind.
    pub fn new(kind: ErrorKind) -> Self {
        TriggerError(Box::new(ErrorInner { kind, source: None }))
    }

    /// Creates a new error with the specified kind and source error.
    pub fn with_source<E>(kind: ErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        TriggerError(Box::new(ErrorInner {
            kind,
            source: Some(source.into()),
        }))
    }

    /// Creates a table not found error.
    pub fn table_not_found(table_name: impl Into<String>) -> Self {
        Self::new(ErrorKind::TableNotFound {
            table_name: table_name.into(),
        })
    }

    /// Creates a change-tracking-not-enabled error.
    pub fn change_tracking_not_enabled(table_name: impl Into<String>) -> Self {
        Self::new(ErrorKind::ChangeTrackingNotEnabled {
            table_name: table_name.into(),
        })
    }

    /// Creates a handler failure error.
    pub fn handler_failed(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::HandlerFailed {
            reason: reason.into(),
        })
    }

    /// Creates an invalid state error.
    pub fn invalid_state(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState {
            description: description.into(),
        })
    }

    /// Creates an external error.
    pub fn other(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other {
            description: description.into(),
        })
    }

    /// Returns the error kind.
    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }

    /// Returns true if this error is likely transient and the next tick
    /// should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.0.kind,
            ErrorKind::ConnectionFailed { .. }
                | ErrorKind::ConnectionLost
                | ErrorKind::QueryExecutionFailed { .. }
                | ErrorKind::TransactionFailed
                | ErrorKind::HandlerFailed { .. }
                | ErrorKind::HandlerWedged { .. }
        )
    }

    /// Returns true if this error was induced by shutdown rather than a
    /// fault; such errors are not logged at error level.
    pub fn is_cancellation(&self) -> bool {
        matches!(self.0.kind, ErrorKind::WorkerCancelled { .. })
    }
}

impl fmt::Debug for TriggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerError")
            .field("kind", &self.0.kind)
            .field("source", &self.0.source)
            .finish()
    }
}

impl fmt::Display for TriggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ErrorKind::*;

        match &self.0.kind {
            ConnectionFailed { host, database } => {
                write!(f, "failed to connect to database '{database}' at {host}")
            }
            ConnectionLost => write!(f, "database connection lost"),
            QueryExecutionFailed { query } => {
                write!(f, "query execution failed: {query}")
            }
            TransactionFailed => write!(f, "database transaction failed"),

            TableNotFound { table_name } => {
                write!(f, "table '{table_name}' not found")
            }
            ChangeTrackingNotEnabled { table_name } => {
                write!(
                    f,
                    "change tracking is not enabled on table '{table_name}' or its database"
                )
            }
            PrimaryKeyMissing { table_name } => {
                write!(f, "table '{table_name}' has no primary key")
            }
            UnsupportedDataType { table_name, reason } => {
                write!(
                    f,
                    "unsupported data type in table '{table_name}': {reason}"
                )
            }
            SchemaProvisioningFailed { reason } => {
                write!(f, "failed to provision coordination schema: {reason}")
            }

            RowDecodingFailed { column } => {
                write!(f, "failed to decode change row column '{column}'")
            }
            HandlerFailed { reason } => {
                write!(f, "handler failed: {reason}")
            }
            HandlerWedged { renewal_count } => {
                write!(
                    f,
                    "handler cancelled after {renewal_count} lease renewals"
                )
            }

            WorkerPanicked { worker_type } => {
                write!(f, "{worker_type} worker panicked")
            }
            WorkerCancelled { worker_type } => {
                write!(f, "{worker_type} worker cancelled")
            }

            InvalidState { description } => {
                write!(f, "invalid state: {description}")
            }
            ConfigurationError { parameter, reason } => {
                write!(
                    f,
                    "configuration error for parameter '{parameter}': {reason}"
                )
            }

            Other { description } => {
                write!(f, "other error: {description}")
            }
        }
    }
}

impl error::Error for TriggerError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn error::Error + 'static))
    }
}

impl From<tiberius::error::Error> for TriggerError {
    fn from(err: tiberius::error::Error) -> Self {
        match &err {
            tiberius::error::Error::Io { .. } => Self::with_source(ErrorKind::ConnectionLost, err),
            tiberius::error::Error::Tls(_) => Self::with_source(
                ErrorKind::ConnectionFailed {
                    host: "unknown".to_string(),
                    database: "unknown".to_string(),
                },
                err,
            ),
            tiberius::error::Error::Routing { .. } => Self::with_source(
                ErrorKind::ConnectionFailed {
                    host: "unknown".to_string(),
                    database: "unknown".to_string(),
                },
                err,
            ),
            tiberius::error::Error::Server(token) => {
                let message = token.message().to_string();
                let kind = match token.code() {
                    // Deadlock victim and snapshot/transaction aborts.
                    1205 | 3960 | 3961 => ErrorKind::TransactionFailed,
                    // Cannot open database / login failed.
                    4060 | 18456 => ErrorKind::ConnectionFailed {
                        host: "unknown".to_string(),
                        database: "unknown".to_string(),
                    },
                    // Invalid object name.
                    208 => ErrorKind::TableNotFound {
                        table_name: message.clone(),
                    },
                    _ => ErrorKind::QueryExecutionFailed { query: message },
                };
                Self::with_source(kind, err)
            }
            tiberius::error::Error::Conversion(reason) => {
                let column = reason.to_string();
                Self::with_source(ErrorKind::RowDecodingFailed { column }, err)
            }
            _ => Self::with_source(
                ErrorKind::Other {
                    description: err.to_string(),
                },
                err,
            ),
        }
    }
}

impl From<trigger_config::shared::ValidationError> for TriggerError {
    fn from(err: trigger_config::shared::ValidationError) -> Self {
        Self::with_source(
            ErrorKind::ConfigurationError {
                parameter: "trigger".to_string(),
                reason: err.to_string(),
            },
            err,
        )
    }
}

impl From<trigger_config::LoadConfigError> for TriggerError {
    fn from(err: trigger_config::LoadConfigError) -> Self {
        Self::with_source(
            ErrorKind::ConfigurationError {
                parameter: "configuration".to_string(),
                reason: err.to_string(),
            },
            err,
        )
    }
}
