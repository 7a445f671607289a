//! Audit logging for sandbox runs.
//!
//! Every run emits an [`AuditEntry`] containing:
//! - Run ID (UUID)
//! - SHA-256 hash of the script source
//! - A preview of the first 500 bytes of source
//! - Duration, output size, and outcome
//!
//! The [`AuditLogger`] trait allows pluggable backends.
//! [`JsonLinesAuditLogger`] writes newline-delimited JSON to any `AsyncWrite`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::executor::{RunOutcome, RunReport};
use crate::SandboxError;

/// Maximum length of the source preview in audit entries.
const CODE_PREVIEW_MAX: usize = 500;

/// A complete audit record for a single sandbox run.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Unique run identifier.
    pub run_id: String,
    /// When the run was submitted.
    pub timestamp: DateTime<Utc>,
    /// SHA-256 hash of the script source.
    pub code_hash: String,
    /// First bytes of the source (for human review).
    pub code_preview: String,
    /// Run duration in milliseconds.
    pub duration_ms: u64,
    /// Size of the captured output in bytes.
    pub output_bytes: usize,
    /// Final outcome.
    pub outcome: AuditOutcome,
}

/// The outcome of a sandbox run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuditOutcome {
    /// The script completed.
    Success,
    /// The script failed.
    Error {
        /// Error kind label.
        kind: String,
        /// The error message.
        message: String,
    },
    /// The run was terminated at its deadline.
    Timeout,
}

/// Trait for audit log backends.
#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    /// Write an audit entry.
    async fn log(&self, entry: &AuditEntry);
}

/// Writes audit entries as newline-delimited JSON to an `AsyncWrite` sink.
pub struct JsonLinesAuditLogger<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditLogger<W> {
    /// Create a new JSON lines audit logger writing to the given sink.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditLogger for JsonLinesAuditLogger<W> {
    async fn log(&self, entry: &AuditEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
        let _ = writer.flush().await;
    }
}

/// Compute the SHA-256 hash of a string, returned as a hex string.
pub fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

/// Create a source preview (first N bytes, with ellipsis if truncated).
///
/// Truncates at a valid UTF-8 char boundary.
pub fn code_preview(code: &str) -> String {
    if code.len() <= CODE_PREVIEW_MAX {
        code.to_string()
    } else {
        let mut end = CODE_PREVIEW_MAX;
        while !code.is_char_boundary(end) {
            end -= 1;
        }
        let mut preview = code[..end].to_string();
        preview.push_str("...");
        preview
    }
}

/// Builder for an audit entry, started when a run is submitted.
pub struct AuditEntryBuilder {
    run_id: String,
    timestamp: DateTime<Utc>,
    code_hash: String,
    code_preview: String,
}

impl AuditEntryBuilder {
    /// Start building an audit entry for a run of `code`.
    pub fn new(code: &str) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            code_hash: sha256_hex(code),
            code_preview: code_preview(code),
        }
    }

    /// Finalize the audit entry with the run report.
    pub fn finish(self, report: &RunReport) -> AuditEntry {
        let (output_bytes, outcome) = match &report.outcome {
            RunOutcome::Success { lines } => (
                lines.iter().map(|l| l.len() + 1).sum::<usize>().saturating_sub(1),
                AuditOutcome::Success,
            ),
            RunOutcome::Error {
                error: SandboxError::Timeout { .. },
            } => (0, AuditOutcome::Timeout),
            RunOutcome::Error { error } => (
                0,
                AuditOutcome::Error {
                    kind: error.kind().to_string(),
                    message: error.to_string(),
                },
            ),
        };

        AuditEntry {
            run_id: self.run_id,
            timestamp: self.timestamp,
            code_hash: self.code_hash,
            code_preview: self.code_preview,
            duration_ms: report.elapsed_ms,
            output_bytes,
            outcome,
        }
    }
}

/// A no-op audit logger for when auditing is not needed.
pub struct NoopAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _entry: &AuditEntry) {}
}

/// An audit logger that emits structured events via the [`tracing`] framework.
///
/// Entries are logged at `INFO` level with `audit = true` for easy filtering.
/// Use `RUST_LOG=runbox=info` to capture them.
pub struct TracingAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        let outcome = match &entry.outcome {
            AuditOutcome::Success => "success",
            AuditOutcome::Error { .. } => "error",
            AuditOutcome::Timeout => "timeout",
        };
        tracing::info!(
            audit = true,
            run_id = %entry.run_id,
            code_hash = %entry.code_hash,
            duration_ms = entry.duration_ms,
            output_bytes = entry.output_bytes,
            outcome = outcome,
            "audit"
        );
    }
}
