use std::{
    io,
    path::{Path, PathBuf},
};

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::Environment;
use crate::shared::WorkerConfig;

/// Directory containing configuration files relative to the worker root.
const CONFIGURATION_DIR: &str = "configuration";

/// Environment variable for specifying an absolute path to the configuration directory.
const CONFIG_DIR_ENV_VAR: &str = "TRIGGER_CONFIG_DIR";

/// Supported extensions for base and environment configuration files.
const CONFIG_FILE_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Prefix for environment-variable configuration overrides.
const ENV_PREFIX: &str = "TRIGGER";

/// Separator between the environment-variable prefix and key segments.
const ENV_PREFIX_SEPARATOR: &str = "_";

/// Separator for nested configuration keys in environment variables.
const ENV_SEPARATOR: &str = "__";

/// Stem of the always-present configuration file every worker loads.
const BASE_FILE_STEM: &str = "base";

/// Errors that can occur while loading configuration files and overrides.
#[derive(Debug, Error)]
pub enum LoadConfigError {
    /// Failed to determine the current working directory.
    #[error("failed to determine the current directory")]
    CurrentDir(#[source] io::Error),

    /// The configured `configuration` directory does not exist.
    #[error("configuration directory `{0}` does not exist")]
    MissingConfigurationDirectory(PathBuf),

    /// Could not locate one of the required configuration files.
    #[error("could not locate the `{stem}` configuration in `{directory}`; attempted: {attempted}")]
    ConfigurationFileMissing {
        stem: String,
        directory: PathBuf,
        attempted: String,
    },

    /// The configuration files were parsed but deserialization failed.
    #[error("failed to deserialize configuration")]
    Deserialization(#[source] config::ConfigError),

    /// Failed to determine the runtime environment (`TRIGGER_ENVIRONMENT`).
    #[error("failed to determine runtime environment")]
    Environment(#[source] io::Error),

    /// Failed to initialize the configuration builder.
    #[error("failed to initialize configuration builder")]
    Builder(#[source] config::ConfigError),
}

/// Loads the full [`WorkerConfig`] for one trigger worker process.
///
/// This is the entry point host bindings use: the connection, the tracked
/// table and the trigger settings all come from the layered sources described
/// on [`load_config`].
pub fn load_worker_config() -> Result<WorkerConfig, LoadConfigError> {
    load_config::<WorkerConfig>()
}

/// Loads hierarchical configuration from base, environment, and
/// environment-variable sources.
///
/// The configuration directory is determined by:
/// - First checking the `TRIGGER_CONFIG_DIR` environment variable for an absolute path
/// - If not set, using `<current_dir>/configuration`
///
/// Loads files from `base.(yaml|yml|json)` and `{environment}.(yaml|yml|json)`
/// before applying overrides from `TRIGGER_`-prefixed environment variables.
/// Nested keys use double underscores (`TRIGGER_CONNECTION__HOST`).
pub fn load_config<T>() -> Result<T, LoadConfigError>
where
    T: DeserializeOwned,
{
    let configuration_directory = configuration_directory()?;
    let environment = Environment::load().map_err(LoadConfigError::Environment)?;

    let base_file = find_configuration_file(&configuration_directory, BASE_FILE_STEM)?;
    let environment_file =
        find_configuration_file(&configuration_directory, environment.as_str())?;

    let environment_source = config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_PREFIX_SEPARATOR)
        .separator(ENV_SEPARATOR);

    let settings = config::Config::builder()
        .add_source(config::File::from(base_file))
        .add_source(config::File::from(environment_file))
        .add_source(environment_source)
        .build()
        .map_err(LoadConfigError::Builder)?;

    settings
        .try_deserialize::<T>()
        .map_err(LoadConfigError::Deserialization)
}

/// Resolves the directory that holds the configuration files.
fn configuration_directory() -> Result<PathBuf, LoadConfigError> {
    let directory = if let Ok(config_dir) = std::env::var(CONFIG_DIR_ENV_VAR) {
        PathBuf::from(config_dir)
    } else {
        let base_path = std::env::current_dir().map_err(LoadConfigError::CurrentDir)?;
        base_path.join(CONFIGURATION_DIR)
    };

    if !directory.is_dir() {
        return Err(LoadConfigError::MissingConfigurationDirectory(directory));
    }
    Ok(directory)
}

/// Finds the configuration file with the given stem and a supported extension.
fn find_configuration_file(directory: &Path, stem: &str) -> Result<PathBuf, LoadConfigError> {
    let mut attempted_paths = Vec::with_capacity(CONFIG_FILE_EXTENSIONS.len());

    for extension in CONFIG_FILE_EXTENSIONS {
        let path = directory.join(format!("{stem}.{extension}"));
        attempted_paths.push(path.clone());

        if path.is_file() {
            return Ok(path);
        }
    }

    let attempted = attempted_paths
        .iter()
        .map(|path| format!("`{}`", path.display()))
        .collect::<Vec<_>>()
        .join(", ");

    Err(LoadConfigError::ConfigurationFileMissing {
        stem: stem.to_string(),
        directory: directory.to_path_buf(),
        attempted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::fs;
    use std::sync::{Mutex, OnceLock};
    use tempfile::TempDir;

    /// Mutex to serialize tests that modify environment variables or current directory.
    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    fn worker_config_json() -> String {
        serde_json::json!({
            "connection": {
                "host": "db.internal",
                "database": "appdb",
                "username": "worker",
                "password": "hunter2",
                "encryption": false
            },
            "table": "[dbo].[items]",
            "trigger": {
                "batch_size": 32,
                "polling_interval_secs": 5,
                "lease_interval": 60,
                "max_lease_renewal_count": 10,
                "max_dequeue_count": 5,
                "cleanup_interval": 300,
                "lease_units": "seconds",
                "cleanup_units": "seconds"
            }
        })
        .to_string()
    }

    fn write_config_files(config_dir: &Path) {
        fs::write(config_dir.join("base.json"), "{}").unwrap();
        fs::write(config_dir.join("prod.json"), worker_config_json()).unwrap();
    }

    #[test]
    fn test_worker_config_loads_from_files() {
        let _guard = env_lock().lock().unwrap();

        let temp_dir = TempDir::new().unwrap();
        let config_dir = temp_dir.path().join("worker-config");
        fs::create_dir(&config_dir).unwrap();
        write_config_files(&config_dir);

        unsafe {
            std::env::set_var(CONFIG_DIR_ENV_VAR, config_dir.to_str().unwrap());
            std::env::set_var("TRIGGER_ENVIRONMENT", "prod");
        }

        let config = load_worker_config().unwrap();

        assert_eq!(config.connection.host, "db.internal");
        assert_eq!(config.connection.database, "appdb");
        assert_eq!(
            config
                .connection
                .password
                .as_ref()
                .map(|password| password.expose_secret().to_string()),
            Some("hunter2".to_string())
        );
        assert_eq!(config.table, "[dbo].[items]");
        assert_eq!(config.trigger.batch_size, 32);
        assert!(config.validate().is_ok());

        unsafe {
            std::env::remove_var(CONFIG_DIR_ENV_VAR);
        }
    }

    #[test]
    fn test_environment_variables_override_files() {
        let _guard = env_lock().lock().unwrap();

        let temp_dir = TempDir::new().unwrap();
        let config_dir = temp_dir.path().join("worker-config");
        fs::create_dir(&config_dir).unwrap();
        write_config_files(&config_dir);

        unsafe {
            std::env::set_var(CONFIG_DIR_ENV_VAR, config_dir.to_str().unwrap());
            std::env::set_var("TRIGGER_ENVIRONMENT", "prod");
            std::env::set_var("TRIGGER_CONNECTION__HOST", "failover.internal");
            std::env::set_var("TRIGGER_TABLE", "[dbo].[orders]");
        }

        let config = load_worker_config().unwrap();

        assert_eq!(config.connection.host, "failover.internal");
        assert_eq!(config.table, "[dbo].[orders]");

        unsafe {
            std::env::remove_var(CONFIG_DIR_ENV_VAR);
            std::env::remove_var("TRIGGER_CONNECTION__HOST");
            std::env::remove_var("TRIGGER_TABLE");
        }
    }

    #[test]
    fn test_missing_environment_file_is_reported() {
        let _guard = env_lock().lock().unwrap();

        let temp_dir = TempDir::new().unwrap();
        let config_dir = temp_dir.path().join("worker-config");
        fs::create_dir(&config_dir).unwrap();
        fs::write(config_dir.join("base.json"), "{}").unwrap();

        unsafe {
            std::env::set_var(CONFIG_DIR_ENV_VAR, config_dir.to_str().unwrap());
            std::env::set_var("TRIGGER_ENVIRONMENT", "prod");
        }

        let result = load_worker_config();
        assert!(matches!(
            result,
            Err(LoadConfigError::ConfigurationFileMissing { ref stem, .. }) if stem == "prod"
        ));

        unsafe {
            std::env::remove_var(CONFIG_DIR_ENV_VAR);
        }
    }

    #[test]
    fn test_all_supported_extensions_detected() {
        let temp_dir = TempDir::new().unwrap();
        let config_dir = temp_dir.path().join("worker-config");
        fs::create_dir(&config_dir).unwrap();

        for extension in CONFIG_FILE_EXTENSIONS {
            let test_file = config_dir.join(format!("base.{extension}"));
            fs::write(&test_file, "{}").unwrap();

            let result = find_configuration_file(&config_dir, BASE_FILE_STEM);
            assert!(result.is_ok());
            assert_eq!(result.unwrap(), test_file);

            fs::remove_file(&test_file).unwrap();
        }
    }
}
