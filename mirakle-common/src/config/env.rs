//! Environment variable parsing with type safety.
//!
//! Environment variables are the top layer of the native configuration. Each
//! getter returns `None` when the variable is unset so the caller keeps the
//! value from the layer below. Parse errors are collected so all problems can
//! be reported at once.

use std::env;
use thiserror::Error;

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

    /// Value out of valid range.
    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    /// Invalid log level.
    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

/// Type-safe environment variable parser.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Create a new parser with the MIRAKLE_ prefix.
    pub fn new() -> Self {
        Self::with_prefix("MIRAKLE_")
    }

    /// Create a parser with a custom prefix.
    pub fn with_prefix(prefix: &'static str) -> Self {
        Self {
            prefix,
            errors: Vec::new(),
        }
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

    /// Get a string (None if not set or empty).
    pub fn get_optional_string(&mut self, name: &str) -> Option<String> {
        match env::var(self.var_name(name)) {
            Ok(value) if value.trim().is_empty() => None,
            Ok(value) => Some(value),
            Err(_) => None,
        }
    }

    /// Get a boolean.
    ///
    /// Accepts: 1, true, yes, on (for true)
    ///          0, false, no, off (for false)
    pub fn get_optional_bool(&mut self, name: &str) -> Option<bool> {
        let var_name = self.var_name(name);
        let value = env::var(&var_name).ok()?;
        match parse_bool(&value) {
            Some(parsed) => Some(parsed),
            None => {
                self.errors.push(EnvError::InvalidValue {
                    var: var_name,
                    expected: "boolean (true/false/1/0/yes/no)".to_string(),
                    value,
                });
                None
            }
        }
    }

    /// Get a u64 within `min..=max`.
    pub fn get_optional_u64_range(&mut self, name: &str, min: u64, max: u64) -> Option<u64> {
        let var_name = self.var_name(name);
        let value = env::var(&var_name).ok()?;
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
                    expected: "unsigned 64-bit integer".to_string(),
                    value,
                });
                None
            }
        }
    }

    /// Get a comma-separated list of strings.
    pub fn get_string_list(&mut self, name: &str) -> Option<Vec<String>> {
        let value = env::var(self.var_name(name)).ok()?;
        Some(parse_string_list(&value))
    }

    /// Get a log level value with validation.
    pub fn get_log_level(&mut self, name: &str, default: &str) -> String {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match parse_log_level(&value) {
                Some(level) => level,
                None => {
                    self.errors.push(EnvError::InvalidLogLevel {
                        var: var_name,
                        value,
                    });
                    default.to_string()
                }
            },
            Err(_) => default.to_string(),
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_log_level(value: &str) -> Option<String> {
    let lower = value.trim().to_lowercase();
    match lower.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" | "off" => Some(lower),
        _ => None,
    }
}

fn parse_string_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn set_env(key: &str, value: &str) {
        // SAFETY: env-mutating tests are serialized
        unsafe { env::set_var(key, value) };
    }

    fn cleanup_env(vars: &[&str]) {
        for var in vars {
            // SAFETY: env-mutating tests are serialized
            unsafe { env::remove_var(var) };
        }
    }

    #[test]
    #[serial]
    fn test_get_optional_bool_values() {
        let vars = ["MIRAKLE_TEST_BOOL"];
        for (raw, expected) in [("1", true), ("yes", true), ("TRUE", true), ("off", false), ("0", false)] {
            set_env("MIRAKLE_TEST_BOOL", raw);
            let mut parser = EnvParser::new();
            assert_eq!(parser.get_optional_bool("TEST_BOOL"), Some(expected), "{}", raw);
            assert!(!parser.has_errors());
        }
        cleanup_env(&vars);
    }

    #[test]
    #[serial]
    fn test_get_optional_bool_invalid_is_recorded() {
        set_env("MIRAKLE_TEST_BAD_BOOL", "maybe");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_optional_bool("TEST_BAD_BOOL"), None);
        assert_eq!(parser.errors().len(), 1);
        cleanup_env(&["MIRAKLE_TEST_BAD_BOOL"]);
    }

    #[test]
    #[serial]
    fn test_unset_values_are_none() {
        cleanup_env(&["MIRAKLE_TEST_UNSET"]);
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_optional_string("TEST_UNSET"), None);
        assert_eq!(parser.get_optional_bool("TEST_UNSET"), None);
        assert_eq!(parser.get_optional_u64_range("TEST_UNSET", 1, 10), None);
        assert!(!parser.has_errors());
    }

    #[test]
    #[serial]
    fn test_get_u64_range() {
        set_env("MIRAKLE_TEST_U64", "50");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_optional_u64_range("TEST_U64", 1, 100), Some(50));

        set_env("MIRAKLE_TEST_U64", "0");
        assert_eq!(parser.get_optional_u64_range("TEST_U64", 1, 100), None);
        assert!(matches!(parser.take_errors().as_slice(), [EnvError::OutOfRange { .. }]));
        cleanup_env(&["MIRAKLE_TEST_U64"]);
    }

    #[test]
    fn test_parse_string_list() {
        assert_eq!(parse_string_list("-p, 2222 ,,-v"), vec!["-p", "2222", "-v"]);
        assert!(parse_string_list("").is_empty());
    }

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("DEBUG").as_deref(), Some("debug"));
        assert_eq!(parse_log_level("loud"), None);
    }
}
