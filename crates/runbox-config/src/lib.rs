#![warn(missing_docs)]

//! # runbox-config
//!
//! Configuration loading for Runbox.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! timeout_ms = 30000
//! max_heap_mb = 64
//! max_concurrent = 8
//! max_output_kb = 1024
//! max_code_kb = 1024
//! allowed_modules = ["path", "util", "crypto"]
//!
//! [runner]
//! serialize_per_script = false
//! ```

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Module names a script may be allowed to `require`.
pub const SUPPORTED_MODULES: &[&str] = &["path", "util", "crypto"];

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level Runbox configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunboxConfig {
    /// Sandbox execution settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Execution lifecycle settings.
    #[serde(default)]
    pub runner: RunnerOverrides,
}

/// Sandbox configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxOverrides {
    /// Execution deadline in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Maximum V8 heap size in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// Maximum concurrent sandbox executions.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Maximum captured log output per execution, in kilobytes.
    #[serde(default)]
    pub max_output_kb: Option<usize>,

    /// Maximum script source size, in kilobytes.
    #[serde(default)]
    pub max_code_kb: Option<usize>,

    /// Modules scripts may `require`. Must be a subset of [`SUPPORTED_MODULES`].
    #[serde(default)]
    pub allowed_modules: Option<Vec<String>>,
}

/// Execution lifecycle overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunnerOverrides {
    /// Queue overlapping executions of the same script instead of running
    /// them concurrently.
    #[serde(default)]
    pub serialize_per_script: Option<bool>,
}

impl RunboxConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: RunboxConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let sandbox = &self.sandbox;
        let limits = [
            ("timeout_ms", sandbox.timeout_ms.map(|v| v as usize)),
            ("max_heap_mb", sandbox.max_heap_mb),
            ("max_concurrent", sandbox.max_concurrent),
            ("max_output_kb", sandbox.max_output_kb),
            ("max_code_kb", sandbox.max_code_kb),
        ];
        for (name, value) in limits {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.{name} must be greater than zero"
                )));
            }
        }

        if let Some(modules) = &sandbox.allowed_modules {
            for module in modules {
                if !SUPPORTED_MODULES.contains(&module.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "sandbox.allowed_modules: unsupported module '{}', supported: {}",
                        module,
                        SUPPORTED_MODULES.join(", ")
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                // Leave the placeholder if env var not found
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(ch);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_empty_is_valid() {
        let config = RunboxConfig::from_toml("").unwrap();
        assert!(config.sandbox.timeout_ms.is_none());
        assert!(config.sandbox.allowed_modules.is_none());
        assert!(config.runner.serialize_per_script.is_none());
    }

    #[test]
    fn config_parses_sandbox_overrides() {
        let toml = r#"
            [sandbox]
            timeout_ms = 5000
            max_heap_mb = 128
            max_concurrent = 4
            max_output_kb = 256
            max_code_kb = 512
        "#;

        let config = RunboxConfig::from_toml(toml).unwrap();
        assert_eq!(config.sandbox.timeout_ms, Some(5000));
        assert_eq!(config.sandbox.max_heap_mb, Some(128));
        assert_eq!(config.sandbox.max_concurrent, Some(4));
        assert_eq!(config.sandbox.max_output_kb, Some(256));
        assert_eq!(config.sandbox.max_code_kb, Some(512));
    }

    #[test]
    fn config_parses_allowed_modules_subset() {
        let toml = r#"
            [sandbox]
            allowed_modules = ["path"]
        "#;

        let config = RunboxConfig::from_toml(toml).unwrap();
        assert_eq!(
            config.sandbox.allowed_modules.as_deref(),
            Some(&["path".to_string()][..])
        );
    }

    #[test]
    fn config_rejects_unsupported_module() {
        let toml = r#"
            [sandbox]
            allowed_modules = ["path", "fs"]
        "#;

        let err = RunboxConfig::from_toml(toml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("'fs'"), "error should name the module: {msg}");
        assert!(msg.contains("crypto"), "error should list supported modules: {msg}");
    }

    #[test]
    fn config_rejects_zero_limits() {
        let toml = r#"
            [sandbox]
            timeout_ms = 0
        "#;

        let err = RunboxConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("timeout_ms"));
    }

    #[test]
    fn config_parses_runner_section() {
        let toml = r#"
            [runner]
            serialize_per_script = true
        "#;

        let config = RunboxConfig::from_toml(toml).unwrap();
        assert_eq!(config.runner.serialize_per_script, Some(true));
    }

    #[test]
    fn config_rejects_malformed_toml() {
        let err = RunboxConfig::from_toml("[sandbox\ntimeout_ms = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn config_expands_environment_variables() {
        std::env::set_var("RUNBOX_TEST_TIMEOUT", "1234");
        let toml = r#"
            [sandbox]
            timeout_ms = ${RUNBOX_TEST_TIMEOUT}
        "#;

        let config = RunboxConfig::from_toml_with_env(toml).unwrap();
        assert_eq!(config.sandbox.timeout_ms, Some(1234));
        std::env::remove_var("RUNBOX_TEST_TIMEOUT");
    }

    #[test]
    fn config_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runbox.toml");
        std::fs::write(
            &path,
            r#"
            [sandbox]
            max_concurrent = 2
        "#,
        )
        .unwrap();

        let config = RunboxConfig::from_file(&path).unwrap();
        assert_eq!(config.sandbox.max_concurrent, Some(2));
    }

    #[test]
    fn config_missing_file_is_io_error() {
        let err = RunboxConfig::from_file(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn env_var_expansion_preserves_unresolved() {
        let result = expand_env_vars("prefix ${DEFINITELY_NOT_SET_12345} suffix");
        assert_eq!(result, "prefix ${DEFINITELY_NOT_SET_12345} suffix");
    }

    #[test]
    fn env_var_expansion_handles_no_vars() {
        let result = expand_env_vars("no variables here");
        assert_eq!(result, "no variables here");
    }
}
