use serde::Deserialize;

use crate::shared::{MssqlConnectionConfig, TriggerConfig, ValidationError};

/// Complete configuration for one trigger worker process.
///
/// This is the shape host bindings load through the configuration loader: the
/// database connection, the tracked user table, the worker identity and the
/// trigger runtime settings.
///
/// This intentionally does not implement [`serde::Serialize`] to avoid
/// accidentally leaking connection secrets into serialized forms.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Connection to the SQL Server instance hosting the user table and the
    /// coordination schema.
    pub connection: MssqlConnectionConfig,
    /// Normalized, quoted name of the tracked user table
    /// (e.g. `[dbo].[items]`).
    pub table: String,
    /// Explicit worker identity. When absent, the identity is derived from
    /// the host name and process id.
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Trigger runtime settings for the table.
    #[serde(default)]
    pub trigger: TriggerConfig,
}

impl WorkerConfig {
    /// Validates worker configuration settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.table.is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "table",
                constraint: "must not be empty",
            });
        }

        if let Some(worker_id) = &self.worker_id
            && worker_id.is_empty()
        {
            return Err(ValidationError::InvalidFieldValue {
                field: "worker_id",
                constraint: "must not be empty when set",
            });
        }

        self.trigger.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> WorkerConfig {
        WorkerConfig {
            connection: MssqlConnectionConfig {
                host: "localhost".to_string(),
                port: 1433,
                database: "appdb".to_string(),
                username: "worker".to_string(),
                password: None,
                encryption: false,
                trust_server_certificate: false,
                application_name: None,
            },
            table: "[dbo].[items]".to_string(),
            worker_id: None,
            trigger: TriggerConfig::default(),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn test_empty_table_rejected() {
        let config = WorkerConfig {
            table: String::new(),
            ..sample_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_worker_id_rejected() {
        let config = WorkerConfig {
            worker_id: Some(String::new()),
            ..sample_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_trigger_settings_propagate() {
        let config = WorkerConfig {
            trigger: TriggerConfig {
                batch_size: 0,
                ..Default::default()
            },
            ..sample_config()
        };
        assert!(config.validate().is_err());
    }
}
