//! Environment variable parsing with type safety.
//!
//! Every getter returns `None` when the variable is unset, so callers can
//! layer environment values over file values and defaults. Invalid values are
//! collected rather than aborting, so all issues can be reported at once.

use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Prefix shared by every bridge environment variable.
pub const ENV_PREFIX: &str = "PHONEHOME_";

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Invalid duration format.
    #[error("Invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },

    /// Value out of valid range.
    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send>;

/// Parse a duration given as bare seconds (`"30"`) or humantime (`"2m 30s"`).
pub fn parse_duration(raw: &str) -> Result<Duration, humantime::DurationError> {
    let trimmed = raw.trim();
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(trimmed)
}

/// Type-safe environment variable parser.
pub struct EnvParser {
    prefix: &'static str,
    lookup: Lookup,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Create a parser reading the process environment.
    pub fn new() -> Self {
        Self::with_lookup(|name| std::env::var(name).ok())
    }

    /// Create a parser over an arbitrary lookup function.
    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + 'static) -> Self {
        Self {
            prefix: ENV_PREFIX,
            lookup: Box::new(lookup),
            errors: Vec::new(),
        }
    }

    /// Create a parser over a fixed set of variables.
    pub fn from_map(vars: HashMap<String, String>) -> Self {
        Self::with_lookup(move |name| vars.get(name).cloned())
    }

    /// Get all accumulated errors.
    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    /// Check if any errors occurred.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Take ownership of errors.
    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn raw(&self, var_name: &str) -> Option<String> {
        (self.lookup)(var_name)
    }

    /// Get an optional string (None if not set or empty).
    pub fn get_string(&mut self, name: &str) -> Option<String> {
        let var_name = self.var_name(name);
        self.raw(&var_name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Get a u16 value, rejecting values outside `min..=max`.
    pub fn get_u16_range(&mut self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.get_u64_range(name, u64::from(min), u64::from(max))
            .and_then(|n| u16::try_from(n).ok())
    }

    /// Get a u64 value, rejecting values outside `min..=max`.
    pub fn get_u64_range(&mut self, name: &str, min: u64, max: u64) -> Option<u64> {
        let var_name = self.var_name(name);
        let value = self.raw(&var_name)?;
        match value.trim().parse::<u64>() {
            Ok(n) if n >= min && n <= max => Some(n),
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var: var_name,
                    value: n.to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
                None
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var: var_name,
                    expected: "unsigned integer".to_string(),
                    value,
                });
                None
            }
        }
    }

    /// Get a duration in humantime format (`30s`, `2m`, `1h 5m`).
    ///
    /// A bare integer is read as seconds.
    pub fn get_duration(&mut self, name: &str) -> Option<Duration> {
        let var_name = self.var_name(name);
        let value = self.raw(&var_name)?;
        match parse_duration(&value) {
            Ok(d) => Some(d),
            Err(_) => {
                self.errors.push(EnvError::InvalidDuration {
                    var: var_name,
                    value,
                });
                None
            }
        }
    }

    /// Get a value parsed through `FromStr`, describing the expected form on error.
    pub fn get_parsed<T: std::str::FromStr>(&mut self, name: &str, expected: &str) -> Option<T> {
        let var_name = self.var_name(name);
        let value = self.raw(&var_name)?;
        match value.trim().parse::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var: var_name,
                    expected: expected.to_string(),
                    value,
                });
                None
            }
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}
