#![warn(missing_docs)]

//! # runbox-sandbox
//!
//! V8 sandbox for Runbox scripts.
//!
//! Runs script source in a deno_core isolate with no filesystem, network,
//! process, or environment access. The only globals a script sees are the
//! ones its [`CapabilityContext`] installs: `console`, an allow-listed
//! `require`, timers, and `Buffer`.
//!
//! ## Security model
//!
//! - **V8 isolate**: Same process-level isolation as Chrome tabs
//! - **Fresh runtime and context per run**: No state leakage between runs
//! - **Allow-listed modules**: `require` resolves only `path`, `util`, `crypto`
//! - **Deadline enforcement**: A watchdog terminates the isolate on timeout
//! - **Heap and output limits**: Runaway allocation or logging fails the run

pub mod audit;
pub mod context;
pub mod error;
pub mod executor;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod modules;
pub mod ops;
pub mod validator;

pub use context::{AllowedModule, CapabilityContext, CapabilityContextBuilder};
pub use error::SandboxError;
pub use executor::{
    RunOutcome, RunReport, SandboxConfig, SandboxExecutor, NO_OUTPUT_PLACEHOLDER,
};
