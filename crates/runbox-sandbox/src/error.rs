//! Error types for the Runbox sandbox.

use thiserror::Error;

/// Errors that can end a sandbox run.
///
/// Every variant is terminal for one execution only. The lifecycle manager
/// folds them into the execution record's `error` status; none of them is
/// ever propagated to the caller of `execute_script`.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Script source exceeds the configured maximum size.
    #[error("script exceeds maximum size of {max} bytes (got {actual})")]
    CodeTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// The script asked for a capability outside its context, such as a
    /// module that is not on the allow-list.
    #[error("{message}")]
    CapabilityDenied {
        /// Denial message, e.g. `Module 'fs' is not allowed`.
        message: String,
    },

    /// The execution deadline passed and the isolate was terminated.
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured deadline in milliseconds.
        timeout_ms: u64,
    },

    /// The script threw: syntax error, runtime error, or a thrown value.
    #[error("{message}")]
    ScriptRuntime {
        /// The exception's message.
        message: String,
    },

    /// V8 heap memory limit was exceeded.
    #[error("V8 heap limit exceeded")]
    HeapLimitExceeded,

    /// Captured log output exceeds the configured maximum size.
    #[error("output exceeds maximum size of {max} bytes")]
    OutputTooLarge {
        /// Maximum allowed size.
        max: usize,
    },

    /// The sandbox itself failed (thread spawn, runtime construction).
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),
}

impl SandboxError {
    /// Stable label for logs, audit entries, and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CodeTooLarge { .. } => "code_too_large",
            Self::CapabilityDenied { .. } => "capability_denied",
            Self::Timeout { .. } => "timeout",
            Self::ScriptRuntime { .. } => "script_runtime",
            Self::HeapLimitExceeded => "heap_limit",
            Self::OutputTooLarge { .. } => "output_too_large",
            Self::Execution(_) => "execution",
        }
    }
}
