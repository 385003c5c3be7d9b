//! Configuration for the scale monitor worker.
//!
//! The scale monitor is a read-only observer that samples unprocessed-change
//! counts and worker throughput to advise a fleet controller.

use serde::{Deserialize, Serialize};

/// Configuration for the scale monitor worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleConfig {
    /// When `true`, the change count samples only rows that are actually
    /// unprocessed. The default counts every row the database's change table
    /// reports.
    #[serde(default)]
    pub count_only_unprocessed: bool,

    /// Minimum backoff in milliseconds after a failed sample.
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,

    /// Maximum backoff in milliseconds after repeated failures.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Jitter percentage (0-100) to add randomness to backoff timing.
    #[serde(default = "default_jitter_percent")]
    pub jitter_percent: u8,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            count_only_unprocessed: false,
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_percent: default_jitter_percent(),
        }
    }
}

fn default_min_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_jitter_percent() -> u8 {
    25
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ScaleConfig::default();
        assert!(!config.count_only_unprocessed);
        assert_eq!(config.min_backoff_ms, 1_000);
        assert_eq!(config.max_backoff_ms, 60_000);
        assert_eq!(config.jitter_percent, 25);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = ScaleConfig {
            count_only_unprocessed: true,
            min_backoff_ms: 500,
            max_backoff_ms: 30_000,
            jitter_percent: 10,
        };
        let json = serde_json::to_string(&config).unwrap();
        let decoded: ScaleConfig = serde_json::from_str(&json).unwrap();

        assert!(decoded.count_only_unprocessed);
        assert_eq!(decoded.min_backoff_ms, 500);
    }
}
