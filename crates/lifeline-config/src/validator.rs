//! Configuration validation.

use crate::error::ConfigError;
use crate::schema::{parse_time_of_day, Config, DaemonConfiguration};

/// Validation result.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// Turn the first error into a `ConfigError`.
    pub fn into_result(self) -> Result<Vec<ValidationWarning>, ConfigError> {
        match self.errors.into_iter().next() {
            Some(error) => Err(ConfigError::InvalidValue {
                field: error.path,
                message: error.message,
            }),
            None => Ok(self.warnings),
        }
    }
}

/// A validation error.
#[derive(Debug)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A validation warning.
#[derive(Debug)]
pub struct ValidationWarning {
    pub path: String,
    pub message: String,
}

impl ValidationWarning {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration.
    pub fn validate(config: &Config) -> Result<ValidationResult, ConfigError> {
        let mut result = ValidationResult::default();

        Self::validate_runtime(config, &mut result);
        Self::validate_supervision(config, &mut result);

        for (name, entry) in &config.daemons {
            Self::validate_daemon(&format!("daemons.{}", name), entry, &mut result);
        }

        Ok(result)
    }

    /// Validate a single daemon entry rooted at `path`.
    pub fn validate_daemon(path: &str, entry: &DaemonConfiguration, result: &mut ValidationResult) {
        if let Some(interval) = entry.interval {
            if interval.is_nan() || interval <= 0.0 {
                result.add_error(ValidationError::new(
                    format!("{}.interval", path),
                    "interval must be greater than 0",
                ));
            }
        }

        match (entry.interval, entry.max_interval) {
            (_, Some(max)) if max.is_nan() || max <= 0.0 => {
                result.add_error(ValidationError::new(
                    format!("{}.maxInterval", path),
                    "maxInterval must be greater than 0",
                ));
            }
            (Some(interval), Some(max)) if max < interval => {
                result.add_error(ValidationError::new(
                    format!("{}.maxInterval", path),
                    "maxInterval must not be smaller than interval",
                ));
            }
            (Some(_), None) => {
                result.add_warning(ValidationWarning::new(
                    format!("{}.maxInterval", path),
                    "maxInterval not set, defaults to interval * 10",
                ));
            }
            _ => {}
        }

        match (&entry.run_start, &entry.run_end) {
            (Some(_), None) | (None, Some(_)) => {
                result.add_error(ValidationError::new(
                    format!("{}.runStart", path),
                    "runStart and runEnd must be set together",
                ));
            }
            _ => {}
        }

        for (key, value) in [("runStart", &entry.run_start), ("runEnd", &entry.run_end)] {
            if let Some(value) = value {
                if parse_time_of_day(value).is_none() {
                    result.add_error(ValidationError::new(
                        format!("{}.{}", path, key),
                        format!("'{}' is not a time of day (HH:MM or HH:MM:SS)", value),
                    ));
                }
            }
        }
    }

    fn validate_runtime(config: &Config, result: &mut ValidationResult) {
        if config.runtime.pid_root.trim().is_empty() {
            result.add_error(ValidationError::new(
                "runtime.pid_root",
                "pid_root cannot be empty",
            ));
        }

        if config.runtime.environment.trim().is_empty() {
            result.add_error(ValidationError::new(
                "runtime.environment",
                "environment cannot be empty",
            ));
        }
    }

    fn validate_supervision(config: &Config, result: &mut ValidationResult) {
        if config.supervision.stall_factor == 0 {
            result.add_error(ValidationError::new(
                "supervision.stall_factor",
                "stall_factor must be greater than 0",
            ));
        }
    }
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod tests;
