use serde::{Deserialize, Serialize};

use crate::shared::{ScaleConfig, ValidationError};

/// Granularity used for lease and cleanup date arithmetic in the database.
///
/// Rendered as the `datepart` argument of `DATEADD`, so the database performs
/// all expiration math with its own clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
}

impl TimeUnit {
    /// Returns the `DATEADD` datepart keyword for this unit.
    pub fn as_datepart(&self) -> &'static str {
        match self {
            TimeUnit::Seconds => "second",
            TimeUnit::Minutes => "minute",
            TimeUnit::Hours => "hour",
        }
    }

    /// Returns the number of seconds in one unit.
    pub fn seconds(&self) -> u64 {
        match self {
            TimeUnit::Seconds => 1,
            TimeUnit::Minutes => 60,
            TimeUnit::Hours => 3600,
        }
    }
}

impl Default for TimeUnit {
    fn default() -> Self {
        TimeUnit::Seconds
    }
}

/// Configuration for a single trigger binding on one user table.
///
/// Contains all settings required to run the polling loop, the lease protocol
/// and the housekeeping tasks for that table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Maximum number of change rows per handler invocation. Also the divisor
    /// for the scale monitor's capacity computation.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Interval between poll ticks, in seconds.
    #[serde(default = "default_polling_interval_secs")]
    pub polling_interval_secs: u64,
    /// Validity of an acquired lease, in `lease_units`. Leases are renewed at
    /// half this interval while a batch is being processed.
    #[serde(default = "default_lease_interval")]
    pub lease_interval: u64,
    /// Number of renewals after which the handler is declared wedged and its
    /// invocation is cancelled.
    #[serde(default = "default_max_lease_renewal_count")]
    pub max_lease_renewal_count: u32,
    /// Number of acquisitions after which a change is poison-quarantined.
    #[serde(default = "default_max_dequeue_count")]
    pub max_dequeue_count: u32,
    /// Interval between liveness-table housekeeping passes, in `cleanup_units`.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
    /// Date-math granularity for `lease_interval`.
    #[serde(default)]
    pub lease_units: TimeUnit,
    /// Date-math granularity for `cleanup_interval`.
    #[serde(default)]
    pub cleanup_units: TimeUnit,
    /// Configuration for the scale monitor. When absent, no monitor worker is
    /// started for this table.
    #[serde(default)]
    pub scale: Option<ScaleConfig>,
}

impl TriggerConfig {
    /// Default maximum number of rows per handler invocation.
    pub const DEFAULT_BATCH_SIZE: u32 = 100;

    /// Default number of seconds between poll ticks.
    pub const DEFAULT_POLLING_INTERVAL_SECS: u64 = 5;

    /// Default lease validity.
    pub const DEFAULT_LEASE_INTERVAL: u64 = 60;

    /// Default number of renewals before a handler is considered wedged.
    pub const DEFAULT_MAX_LEASE_RENEWAL_COUNT: u32 = 10;

    /// Default number of acquisitions before a change is poison-quarantined.
    pub const DEFAULT_MAX_DEQUEUE_COUNT: u32 = 5;

    /// Default number of units between housekeeping passes.
    pub const DEFAULT_CLEANUP_INTERVAL: u64 = 300;

    /// Validates trigger configuration settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.batch_size == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "batch_size",
                constraint: "must be greater than 0",
            });
        }

        if self.polling_interval_secs == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "polling_interval_secs",
                constraint: "must be greater than 0",
            });
        }

        // Renewals run at half the lease interval; a one-unit lease would
        // renew on a zero-length cadence.
        if self.lease_interval < 2 {
            return Err(ValidationError::InvalidFieldValue {
                field: "lease_interval",
                constraint: "must be at least 2 units",
            });
        }

        if self.max_lease_renewal_count == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "max_lease_renewal_count",
                constraint: "must be greater than 0",
            });
        }

        if self.max_dequeue_count == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "max_dequeue_count",
                constraint: "must be greater than 0",
            });
        }

        if self.cleanup_interval == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "cleanup_interval",
                constraint: "must be greater than 0",
            });
        }

        Ok(())
    }

    /// Returns the lease validity as a wall-clock duration.
    pub fn lease_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.lease_interval * self.lease_units.seconds())
    }

    /// Returns the cadence at which in-flight leases are renewed.
    pub fn lease_renewal_interval(&self) -> std::time::Duration {
        self.lease_duration() / 2
    }

    /// Returns the cadence of the housekeeping worker.
    pub fn cleanup_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cleanup_interval * self.cleanup_units.seconds())
    }

    /// Returns the interval between poll ticks.
    pub fn polling_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.polling_interval_secs)
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            polling_interval_secs: default_polling_interval_secs(),
            lease_interval: default_lease_interval(),
            max_lease_renewal_count: default_max_lease_renewal_count(),
            max_dequeue_count: default_max_dequeue_count(),
            cleanup_interval: default_cleanup_interval(),
            lease_units: TimeUnit::default(),
            cleanup_units: TimeUnit::default(),
            scale: None,
        }
    }
}

fn default_batch_size() -> u32 {
    TriggerConfig::DEFAULT_BATCH_SIZE
}

fn default_polling_interval_secs() -> u64 {
    TriggerConfig::DEFAULT_POLLING_INTERVAL_SECS
}

fn default_lease_interval() -> u64 {
    TriggerConfig::DEFAULT_LEASE_INTERVAL
}

fn default_max_lease_renewal_count() -> u32 {
    TriggerConfig::DEFAULT_MAX_LEASE_RENEWAL_COUNT
}

fn default_max_dequeue_count() -> u32 {
    TriggerConfig::DEFAULT_MAX_DEQUEUE_COUNT
}

fn default_cleanup_interval() -> u64 {
    TriggerConfig::DEFAULT_CLEANUP_INTERVAL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TriggerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.lease_interval, 60);
        assert_eq!(config.max_dequeue_count, 5);
    }

    #[test]
    fn test_renewal_interval_is_half_lease() {
        let config = TriggerConfig {
            lease_interval: 60,
            lease_units: TimeUnit::Seconds,
            ..Default::default()
        };
        assert_eq!(
            config.lease_renewal_interval(),
            std::time::Duration::from_secs(30)
        );
    }

    #[test]
    fn test_minute_units_scale_durations() {
        let config = TriggerConfig {
            lease_interval: 2,
            lease_units: TimeUnit::Minutes,
            ..Default::default()
        };
        assert_eq!(
            config.lease_duration(),
            std::time::Duration::from_secs(120)
        );
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config = TriggerConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_short_lease_rejected() {
        let config = TriggerConfig {
            lease_interval: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = TriggerConfig {
            batch_size: 32,
            lease_units: TimeUnit::Minutes,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let decoded: TriggerConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded.batch_size, 32);
        assert_eq!(decoded.lease_units, TimeUnit::Minutes);
    }
}
