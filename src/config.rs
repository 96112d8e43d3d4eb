//! Configuration loading.
//!
//! Strongly-typed settings loaded with figment from two sources, later ones
//! winning:
//!
//! 1. `scope_acq.toml` (or an explicit path)
//! 2. Environment variables prefixed with `SCOPE_ACQ_` (nested fields
//!    separated by a double underscore, e.g.
//!    `SCOPE_ACQ_ACQUISITION__WATCHDOG=30s`)
//!
//! Every field has a default, so a missing file yields a usable
//! configuration.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{AcqError, AcqResult};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "SCOPE_ACQ_";

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "scope_acq.toml";

/// Top-level crate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Acquisition knobs.
    #[serde(default)]
    pub acquisition: AcquisitionSettings,
}

/// Knobs for the acquisition engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Optional per-stream acquisition watchdog. When unset (the default), a
    /// hung stream acquisition hangs the whole task, matching the behavior
    /// of the hardware pipelines this crate coordinates.
    #[serde(default, with = "humantime_serde")]
    pub watchdog: Option<Duration>,
    /// Extra parameter names the settings observer should skip, on top of
    /// the built-in denylist.
    #[serde(default)]
    pub ignored_parameters: Vec<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            acquisition: AcquisitionSettings::default(),
        }
    }
}

impl Settings {
    /// Load from [`DEFAULT_CONFIG_FILE`] and the environment.
    pub fn load() -> AcqResult<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from a specific file path and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AcqResult<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate semantic constraints after loading.
    pub fn validate(&self) -> AcqResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(AcqError::Configuration(format!(
                "invalid log_level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }
        if let Some(watchdog) = self.acquisition.watchdog {
            if watchdog.is_zero() {
                return Err(AcqError::Configuration(
                    "acquisition.watchdog must be greater than zero".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.log_level, "info");
        assert!(settings.acquisition.watchdog.is_none());
        assert!(settings.acquisition.ignored_parameters.is_empty());
        assert!(settings.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_missing_file_yields_defaults() {
        let settings = Settings::load_from("does/not/exist.toml").unwrap();
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("SCOPE_ACQ_LOG_LEVEL", "debug");
        std::env::set_var("SCOPE_ACQ_ACQUISITION__WATCHDOG", "30s");
        let settings = Settings::load_from("does/not/exist.toml").unwrap();
        std::env::remove_var("SCOPE_ACQ_LOG_LEVEL");
        std::env::remove_var("SCOPE_ACQ_ACQUISITION__WATCHDOG");

        assert_eq!(settings.log_level, "debug");
        assert_eq!(
            settings.acquisition.watchdog,
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    #[serial]
    fn test_invalid_log_level_rejected() {
        std::env::set_var("SCOPE_ACQ_LOG_LEVEL", "verbose");
        let result = Settings::load_from("does/not/exist.toml");
        std::env::remove_var("SCOPE_ACQ_LOG_LEVEL");
        assert!(matches!(result, Err(AcqError::Configuration(_))));
    }

    #[test]
    fn test_zero_watchdog_rejected() {
        let settings = Settings {
            acquisition: AcquisitionSettings {
                watchdog: Some(Duration::ZERO),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
