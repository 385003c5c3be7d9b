use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tiberius::{AuthMethod, Config as TiberiusConfig, EncryptionLevel};

/// Default TDS port for SQL Server.
const DEFAULT_PORT: u16 = 1433;

/// Application name reported to the server for trigger connections.
const APP_NAME_TRIGGER: &str = "sql_trigger_worker";

/// Connection configuration for the SQL Server instance hosting the user table
/// and the coordination schema.
///
/// This intentionally does not implement [`Serialize`] to avoid accidentally
/// leaking secrets in the config into serialized forms.
#[derive(Debug, Clone, Deserialize)]
pub struct MssqlConnectionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Name of the database that holds the user table.
    pub database: String,
    pub username: String,
    pub password: Option<SecretString>,
    /// Whether to negotiate TLS encryption for the connection.
    #[serde(default = "default_encryption")]
    pub encryption: bool,
    /// Whether to accept the server certificate without validation.
    #[serde(default)]
    pub trust_server_certificate: bool,
    /// Application name reported to the server; defaults to a fixed worker name.
    #[serde(default)]
    pub application_name: Option<String>,
}

impl MssqlConnectionConfig {
    /// Builds the driver-level connection configuration for this target.
    pub fn to_connect_config(&self) -> TiberiusConfig {
        let mut config = TiberiusConfig::new();
        config.host(&self.host);
        config.port(self.port);
        config.database(&self.database);

        let password = self
            .password
            .as_ref()
            .map(|password| password.expose_secret().to_string())
            .unwrap_or_default();
        config.authentication(AuthMethod::sql_server(&self.username, password));

        if self.encryption {
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        if self.trust_server_certificate {
            config.trust_cert();
        }

        config.application_name(
            self.application_name
                .as_deref()
                .unwrap_or(APP_NAME_TRIGGER),
        );

        config
    }
}

/// Same as [`MssqlConnectionConfig`] but without secrets. This type implements
/// [`Serialize`] because it does not contain secrets so is safe to serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MssqlConnectionConfigWithoutSecrets {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default = "default_encryption")]
    pub encryption: bool,
    #[serde(default)]
    pub trust_server_certificate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_name: Option<String>,
}

impl From<MssqlConnectionConfig> for MssqlConnectionConfigWithoutSecrets {
    fn from(value: MssqlConnectionConfig) -> Self {
        MssqlConnectionConfigWithoutSecrets {
            host: value.host,
            port: value.port,
            database: value.database,
            username: value.username,
            encryption: value.encryption,
            trust_server_certificate: value.trust_server_certificate,
            application_name: value.application_name,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_encryption() -> bool {
    true
}
