#![warn(missing_docs)]

//! # runbox-core
//!
//! The script service: owns the entity store and the sandbox executor, and
//! drives each execution record from `running` to exactly one terminal state.
//!
//! Collaborators (CLI, an HTTP layer, a scheduler) talk to [`ScriptService`]
//! only. Sandbox failures never surface as errors here; they become
//! executions with status `error`.

pub mod options;
pub mod service;

pub use options::ServiceOptions;
pub use service::{ExecutionResult, ScriptService, MAX_UPLOAD_BYTES, UNKNOWN_SCRIPT_NAME};
