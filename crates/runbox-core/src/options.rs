//! Service options derived from a [`RunboxConfig`].

use std::time::Duration;

use runbox_config::RunboxConfig;
use runbox_error::CoreError;
use runbox_sandbox::{AllowedModule, CapabilityContextBuilder, SandboxConfig};

/// Everything needed to construct a [`ScriptService`](crate::ScriptService).
#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    /// Executor limits.
    pub sandbox: SandboxConfig,
    /// Template for the per-run capability contexts.
    pub contexts: CapabilityContextBuilder,
    /// Queue overlapping executions of the same script.
    pub serialize_per_script: bool,
}

impl ServiceOptions {
    /// Apply config overrides on top of the defaults.
    pub fn from_config(config: &RunboxConfig) -> Result<Self, CoreError> {
        let mut options = Self::default();
        let overrides = &config.sandbox;

        if let Some(ms) = overrides.timeout_ms {
            options.sandbox.timeout = Duration::from_millis(ms);
        }
        if let Some(mb) = overrides.max_heap_mb {
            options.sandbox.max_heap_size = scaled("sandbox.max_heap_mb", mb, 1024 * 1024)?;
        }
        if let Some(n) = overrides.max_concurrent {
            options.sandbox.max_concurrent = n;
        }
        if let Some(kb) = overrides.max_code_kb {
            options.sandbox.max_code_size = scaled("sandbox.max_code_kb", kb, 1024)?;
        }
        if let Some(kb) = overrides.max_output_kb {
            options.contexts = options
                .contexts
                .max_output_bytes(scaled("sandbox.max_output_kb", kb, 1024)?);
        }
        if let Some(names) = &overrides.allowed_modules {
            let modules = names
                .iter()
                .map(|name| {
                    name.parse::<AllowedModule>()
                        .map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))
                })
                .collect::<Result<Vec<_>, _>>()?;
            options.contexts = options.contexts.allow_modules(modules);
        }

        options.serialize_per_script = config.runner.serialize_per_script.unwrap_or(false);
        Ok(options)
    }
}

/// Convert a configured size to bytes, rejecting values that overflow.
fn scaled(key: &str, value: usize, unit: usize) -> Result<usize, CoreError> {
    value
        .checked_mul(unit)
        .ok_or_else(|| CoreError::Internal(anyhow::anyhow!("{key} = {value} is too large")))
}
