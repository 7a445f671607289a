//! Sandbox executor: creates fresh V8 isolates and runs script source.
//!
//! Each run gets a brand new runtime and the capability context built for it.
//! No state leaks between runs.
//!
//! V8 isolates are `!Send`, so all JsRuntime operations run on a dedicated
//! thread with its own single-threaded tokio runtime. The public API is
//! fully async and `Send`-safe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use tokio::sync::Semaphore;

use crate::audit::{AuditEntryBuilder, AuditLogger, NoopAuditLogger};
use crate::context::{invocation_source, CapabilityContext, CAPABILITY_DENIED_ERROR};
use crate::error::SandboxError;
#[cfg(feature = "metrics")]
use crate::metrics::RunboxMetrics;
use crate::ops::{runbox_ext, CapturedLog, FailureSlot};
use crate::validator::validate_code;

/// Output recorded for a successful run that logged nothing.
pub const NO_OUTPUT_PLACEHOLDER: &str = "Script executed successfully (no output)";

/// Extra time granted past the deadline for the isolate thread to report back.
const TERMINATION_GRACE: Duration = Duration::from_millis(250);

/// Configuration for the sandbox executor.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum execution time before the isolate is terminated.
    pub timeout: Duration,
    /// Maximum size of script source in bytes.
    pub max_code_size: usize,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Maximum concurrent isolates.
    pub max_concurrent: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_code_size: crate::validator::DEFAULT_MAX_CODE_SIZE,
            max_heap_size: 64 * 1024 * 1024, // 64 MB
            max_concurrent: 8,
        }
    }
}

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// The script completed. Lines are in emission order.
    Success {
        /// Captured console lines.
        lines: Vec<String>,
    },
    /// The script threw, was denied a capability, or ran out of time or memory.
    Error {
        /// What went wrong.
        error: SandboxError,
    },
}

/// Result of one sandbox run.
#[derive(Debug)]
pub struct RunReport {
    /// How the run ended.
    pub outcome: RunOutcome,
    /// Wall-clock time from requesting a sandbox slot to report, in milliseconds.
    pub elapsed_ms: u64,
}

impl RunReport {
    /// Whether the script completed.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Success { .. })
    }

    /// Captured output joined with newlines, or the placeholder when nothing
    /// was logged. `None` for failed runs.
    pub fn output(&self) -> Option<String> {
        match &self.outcome {
            RunOutcome::Success { lines } if lines.is_empty() => {
                Some(NO_OUTPUT_PLACEHOLDER.to_string())
            }
            RunOutcome::Success { lines } => Some(lines.join("\n")),
            RunOutcome::Error { .. } => None,
        }
    }

    /// The failure message. `None` for successful runs.
    pub fn error_message(&self) -> Option<String> {
        match &self.outcome {
            RunOutcome::Error { error } => Some(error.to_string()),
            RunOutcome::Success { .. } => None,
        }
    }
}

/// The sandbox executor. Creates fresh V8 isolates for each run.
///
/// This is `Send + Sync` safe: all V8 operations are dispatched to a
/// dedicated thread internally. A concurrency semaphore limits the number
/// of simultaneous isolates; callers past the limit wait for a slot, within
/// their deadline.
pub struct SandboxExecutor {
    config: SandboxConfig,
    semaphore: Arc<Semaphore>,
    audit_logger: Arc<dyn AuditLogger>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<RunboxMetrics>>,
}

impl SandboxExecutor {
    /// Create a new sandbox executor with the given configuration.
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_audit_logger(config, Arc::new(NoopAuditLogger))
    }

    /// Create a new sandbox executor with an audit logger.
    pub fn with_audit_logger(config: SandboxConfig, logger: Arc<dyn AuditLogger>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            semaphore,
            audit_logger: logger,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Attach a metrics registry.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<RunboxMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The executor's configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run `source` inside `context` with the configured deadline.
    ///
    /// Never returns an error: every failure is folded into the report.
    pub async fn run(&self, source: &str, context: CapabilityContext) -> RunReport {
        self.run_with_deadline(source, context, self.config.timeout)
            .await
    }

    /// Run `source` inside `context`, terminating it after `deadline`.
    ///
    /// The deadline covers the wait for a concurrency slot as well as the run
    /// itself, so the caller is unblocked shortly after it however busy the
    /// executor is.
    pub async fn run_with_deadline(
        &self,
        source: &str,
        context: CapabilityContext,
        deadline: Duration,
    ) -> RunReport {
        let audit = AuditEntryBuilder::new(source);

        let report = match validate_code(source, Some(self.config.max_code_size)) {
            Err(error) => RunReport {
                outcome: RunOutcome::Error { error },
                elapsed_ms: 0,
            },
            Ok(()) => {
                let started = Instant::now();
                let outcome = match tokio::time::timeout(
                    deadline,
                    self.semaphore.clone().acquire_owned(),
                )
                .await
                {
                    Ok(Ok(permit)) => {
                        let budget = deadline.saturating_sub(started.elapsed());
                        let outcome = self
                            .run_on_isolate_thread(source, context, deadline, budget)
                            .await;
                        drop(permit);
                        outcome
                    }
                    Ok(Err(_)) => RunOutcome::Error {
                        error: SandboxError::Execution(anyhow::anyhow!(
                            "sandbox executor is shut down"
                        )),
                    },
                    Err(_) => {
                        tracing::warn!(
                            deadline_ms = deadline.as_millis() as u64,
                            "no sandbox slot freed up before the deadline"
                        );
                        RunOutcome::Error {
                            error: SandboxError::Timeout {
                                timeout_ms: deadline.as_millis() as u64,
                            },
                        }
                    }
                };
                RunReport {
                    outcome,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }
            }
        };

        match &report.outcome {
            RunOutcome::Success { lines } => {
                tracing::debug!(
                    elapsed_ms = report.elapsed_ms,
                    lines = lines.len(),
                    "sandbox run succeeded"
                );
            }
            RunOutcome::Error { error } => {
                tracing::debug!(
                    elapsed_ms = report.elapsed_ms,
                    kind = error.kind(),
                    error = %error,
                    "sandbox run failed"
                );
            }
        }

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_report(&report);
        }

        self.audit_logger.log(&audit.finish(&report)).await;
        report
    }

    /// Spawn a dedicated thread with its own V8 isolate and wait for it,
    /// allowing a short grace past the deadline for termination to land.
    async fn run_on_isolate_thread(
        &self,
        source: &str,
        context: CapabilityContext,
        deadline: Duration,
        budget: Duration,
    ) -> RunOutcome {
        let source = source.to_string();
        let config = self.config.clone();

        let (tx, rx) = tokio::sync::oneshot::channel();
        let spawned = std::thread::Builder::new()
            .name("runbox-sandbox".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        if tx.send(RunOutcome::Error { error: SandboxError::Execution(e.into()) }).is_err() {
                            tracing::warn!("sandbox result receiver dropped");
                        }
                        return;
                    }
                };
                let outcome = rt.block_on(run_in_isolate(&config, &source, context, deadline, budget));
                if tx.send(outcome).is_err() {
                    tracing::warn!("sandbox result receiver dropped before result was sent");
                }
            });

        if let Err(e) = spawned {
            return RunOutcome::Error {
                error: SandboxError::Execution(anyhow::anyhow!("failed to spawn sandbox thread: {e}")),
            };
        }

        match tokio::time::timeout(budget + TERMINATION_GRACE, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => RunOutcome::Error {
                error: SandboxError::Execution(anyhow::anyhow!("sandbox thread panicked")),
            },
            Err(_) => {
                tracing::warn!(
                    deadline_ms = deadline.as_millis() as u64,
                    "sandbox thread did not report after termination"
                );
                RunOutcome::Error {
                    error: SandboxError::Timeout {
                        timeout_ms: deadline.as_millis() as u64,
                    },
                }
            }
        }
    }
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    /// Whether the heap limit has been triggered. Uses AtomicBool so the callback
    /// can use a shared `&` reference instead of `&mut`.
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate cleanly.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to `heap_state` (Box<HeapLimitState>) allocated in
    // `run_in_isolate`, which drops the runtime before the box. V8 only
    // invokes this callback while the isolate is executing on this thread.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Create a fresh JsRuntime with the runbox extension loaded and V8 heap limits set.
fn create_runtime(max_heap_size: usize) -> JsRuntime {
    let create_params = v8::CreateParams::default().heap_limits(0, max_heap_size);

    JsRuntime::new(RuntimeOptions {
        extensions: vec![runbox_ext::init_ops()],
        create_params: Some(create_params),
        ..Default::default()
    })
}

/// Run one script on the current thread (must be called from a dedicated
/// thread, not the main tokio runtime).
///
/// Sets up a CPU watchdog thread and near-heap-limit callback before running
/// the script. The watchdog terminates V8 execution when `budget` elapses,
/// which handles CPU-bound loops. A script whose top-level code finished but
/// which still has timers pending when the budget runs out is cut off by the
/// event-loop timeout and keeps the output it logged so far.
async fn run_in_isolate(
    config: &SandboxConfig,
    source: &str,
    context: CapabilityContext,
    deadline: Duration,
    budget: Duration,
) -> RunOutcome {
    let started = Instant::now();
    let max_output = context.max_output_bytes();
    let mut runtime = create_runtime(config.max_heap_size);

    if let Err(error) = context.install(&mut runtime) {
        return RunOutcome::Error { error };
    }
    let invocation = match invocation_source(source) {
        Ok(inv) => inv,
        Err(error) => return RunOutcome::Error { error },
    };

    // --- Heap limit callback ---
    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    // --- CPU watchdog ---
    let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog_timed_out = timed_out.clone();
    let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();

    let watchdog = std::thread::spawn(move || {
        if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(budget) {
            watchdog_timed_out.store(true, Ordering::SeqCst);
            watchdog_handle.terminate_execution();
        }
    });

    // --- Execute ---
    // `idle_at_deadline` means the event loop was only waiting on timers when
    // the budget ran out: no script code was running.
    let mut idle_at_deadline = false;
    let exec_error = match runtime.execute_script("[runbox:run]", invocation) {
        Ok(_) if failure_recorded(&mut runtime) => None,
        Ok(_) => {
            let remaining = budget.saturating_sub(started.elapsed());
            match tokio::time::timeout(
                remaining,
                runtime.run_event_loop(PollEventLoopOptions::default()),
            )
            .await
            {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => {
                    idle_at_deadline = true;
                    None
                }
            }
        }
        Err(e) => Some(e.to_string()),
    };

    // --- Cleanup: cancel watchdog and wait for it to exit ---
    // The watchdog must be done before the runtime drops so the IsolateHandle
    // never outlives the isolate.
    let _ = cancel_tx.send(());
    let _ = watchdog.join();

    let (failure, log) = {
        let state = runtime.op_state();
        let mut state = state.borrow_mut();
        let failure = state.take::<FailureSlot>().0;
        let log = state.take::<CapturedLog>();
        (failure, log)
    };
    let heap_exceeded = heap_state.triggered.load(Ordering::SeqCst);

    // The isolate holds a raw pointer to `heap_state` until it is torn down.
    drop(runtime);
    drop(heap_state);

    // --- Check failure causes in priority order ---
    if heap_exceeded {
        return RunOutcome::Error {
            error: SandboxError::HeapLimitExceeded,
        };
    }

    if timed_out.load(Ordering::SeqCst) && !idle_at_deadline {
        return RunOutcome::Error {
            error: SandboxError::Timeout {
                timeout_ms: deadline.as_millis() as u64,
            },
        };
    }

    if let Some(failure) = failure {
        let error = if failure.name == CAPABILITY_DENIED_ERROR {
            SandboxError::CapabilityDenied {
                message: failure.message,
            }
        } else {
            SandboxError::ScriptRuntime {
                message: failure.message,
            }
        };
        return RunOutcome::Error { error };
    }

    if let Some(raw) = exec_error {
        return RunOutcome::Error {
            error: classify_exception(&raw),
        };
    }

    if log.overflowed() {
        return RunOutcome::Error {
            error: SandboxError::OutputTooLarge { max: max_output },
        };
    }

    if idle_at_deadline {
        tracing::debug!(
            deadline_ms = deadline.as_millis() as u64,
            "timers still pending at deadline, discarding them"
        );
    }

    RunOutcome::Success {
        lines: log.into_lines(),
    }
}

fn failure_recorded(runtime: &mut JsRuntime) -> bool {
    let state = runtime.op_state();
    let state = state.borrow();
    state
        .try_borrow::<FailureSlot>()
        .is_some_and(|slot| slot.0.is_some())
}

/// Split a V8 exception string into the error name (when it has one) and the
/// thrown message, e.g. `Uncaught (in promise) Error: boom\n    at ...`
/// becomes `(Some("Error"), "boom")`.
fn split_exception(raw: &str) -> (Option<&str>, &str) {
    let first = raw.lines().next().unwrap_or(raw).trim();
    let first = first
        .strip_prefix("Uncaught (in promise) ")
        .or_else(|| first.strip_prefix("Uncaught "))
        .unwrap_or(first);

    if let Some((name, message)) = first.split_once(": ") {
        let is_error_name = !name.is_empty()
            && name.ends_with("Error")
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if is_error_name {
            return (Some(name), message);
        }
    }
    (None, first)
}

/// Denials that escape as rejected promises keep their capability kind.
fn classify_exception(raw: &str) -> SandboxError {
    match split_exception(raw) {
        (Some(CAPABILITY_DENIED_ERROR), message) => SandboxError::CapabilityDenied {
            message: message.to_string(),
        },
        (_, message) => SandboxError::ScriptRuntime {
            message: message.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CapabilityContextBuilder;
    use serial_test::serial;

    fn executor() -> SandboxExecutor {
        SandboxExecutor::new(SandboxConfig::default())
    }

    fn ctx() -> CapabilityContext {
        CapabilityContextBuilder::new().build()
    }

    #[test]
    fn exception_messages_are_cleaned() {
        assert_eq!(
            split_exception("Uncaught (in promise) Error: boom\n    at <anon>:1:7"),
            (Some("Error"), "boom")
        );
        assert_eq!(
            split_exception("Uncaught TypeError: x is not a function"),
            (Some("TypeError"), "x is not a function")
        );
        assert_eq!(split_exception("Uncaught oops"), (None, "oops"));
        assert_eq!(split_exception("note: plain"), (None, "note: plain"));
    }

    #[test]
    fn rejected_denial_keeps_capability_kind() {
        let error = classify_exception(
            "Uncaught (in promise) CapabilityDeniedError: Module 'fs' is not allowed",
        );
        assert_eq!(error.kind(), "capability_denied");
        assert_eq!(error.to_string(), "Module 'fs' is not allowed");
        assert_eq!(
            classify_exception("Uncaught RangeError: too deep").kind(),
            "script_runtime"
        );
    }

    #[test]
    fn placeholder_for_empty_output() {
        let report = RunReport {
            outcome: RunOutcome::Success { lines: vec![] },
            elapsed_ms: 1,
        };
        assert_eq!(report.output().as_deref(), Some(NO_OUTPUT_PLACEHOLDER));
        assert!(report.error_message().is_none());
    }

    #[tokio::test]
    async fn console_log_is_captured() {
        let report = executor().run(r#"console.log("hi")"#, ctx()).await;
        let output = report.output().unwrap();
        assert!(output.starts_with('['), "got: {output}");
        assert!(output.ends_with("] hi"), "got: {output}");
    }

    #[tokio::test]
    async fn thrown_error_message_is_reported() {
        let report = executor().run(r#"throw new Error("boom")"#, ctx()).await;
        assert_eq!(report.error_message().as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn thrown_string_is_reported() {
        let report = executor().run(r#"throw "plain""#, ctx()).await;
        assert_eq!(report.error_message().as_deref(), Some("plain"));
    }

    #[tokio::test]
    async fn syntax_error_is_a_script_error() {
        let report = executor().run("let = ;", ctx()).await;
        match report.outcome {
            RunOutcome::Error {
                error: SandboxError::ScriptRuntime { message },
            } => assert!(!message.is_empty()),
            other => panic!("expected script error, got {other:?}"),
        }
    }

    #[tokio::test]
    #[serial]
    async fn cpu_bound_infinite_loop_is_terminated() {
        let exec = executor();
        let start = Instant::now();
        let report = exec
            .run_with_deadline("while(true) {}", ctx(), Duration::from_millis(300))
            .await;
        assert!(
            matches!(
                report.outcome,
                RunOutcome::Error {
                    error: SandboxError::Timeout { .. }
                }
            ),
            "expected timeout, got: {:?}",
            report.outcome
        );
        assert!(start.elapsed() < Duration::from_millis(800));
    }

    #[tokio::test]
    #[serial]
    async fn pending_timer_past_deadline_keeps_top_level_output() {
        let start = Instant::now();
        let report = executor()
            .run_with_deadline(
                "console.log('top'); setInterval(() => {}, 1000); setTimeout(() => console.log('late'), 10000)",
                ctx(),
                Duration::from_millis(200),
            )
            .await;
        let output = report.output().expect("run should succeed");
        assert!(output.ends_with("] top"), "got: {output}");
        assert!(!output.contains("late"));
        assert!(start.elapsed() < Duration::from_millis(700));
    }

    #[tokio::test]
    async fn denial_inside_async_function_is_a_capability_error() {
        let report = executor()
            .run("(async () => require('fs'))()", ctx())
            .await;
        match report.outcome {
            RunOutcome::Error {
                error: SandboxError::CapabilityDenied { message },
            } => assert_eq!(message, "Module 'fs' is not allowed"),
            other => panic!("expected capability denial, got {other:?}"),
        }
    }

    #[tokio::test]
    #[serial]
    async fn saturated_executor_still_honours_the_deadline() {
        let exec = Arc::new(SandboxExecutor::new(SandboxConfig {
            max_concurrent: 1,
            ..Default::default()
        }));
        let deadline = Duration::from_millis(300);

        let hog = {
            let exec = exec.clone();
            tokio::spawn(async move {
                exec.run_with_deadline("while(true) {}", ctx(), deadline)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let start = Instant::now();
        let report = exec.run_with_deadline("while(true) {}", ctx(), deadline).await;
        assert!(
            start.elapsed() <= deadline + Duration::from_millis(500),
            "took {:?}",
            start.elapsed()
        );
        assert!(matches!(
            report.outcome,
            RunOutcome::Error {
                error: SandboxError::Timeout { .. }
            }
        ));
        assert!(!hog.await.unwrap().is_success());
    }

    #[tokio::test]
    async fn heap_limit_prevents_oom() {
        let exec = SandboxExecutor::new(SandboxConfig {
            max_heap_size: 10 * 1024 * 1024,
            ..Default::default()
        });
        let code = r#"
            const arr = [];
            while (true) { arr.push(new Array(100000).fill("x")); }
        "#;
        let report = exec.run(code, ctx()).await;
        assert!(
            matches!(
                report.outcome,
                RunOutcome::Error {
                    error: SandboxError::HeapLimitExceeded | SandboxError::ScriptRuntime { .. }
                }
            ),
            "expected heap limit or script error, got: {:?}",
            report.outcome
        );
    }

    #[tokio::test]
    async fn oversized_code_is_rejected_before_running() {
        let exec = SandboxExecutor::new(SandboxConfig {
            max_code_size: 10,
            ..Default::default()
        });
        let report = exec.run("console.log('too long')", ctx()).await;
        assert!(matches!(
            report.outcome,
            RunOutcome::Error {
                error: SandboxError::CodeTooLarge { .. }
            }
        ));
    }

    #[tokio::test]
    async fn large_output_is_rejected() {
        let context = CapabilityContextBuilder::new().max_output_bytes(100).build();
        let report = executor()
            .run("for (let i = 0; i < 50; i++) console.log('line ' + i)", context)
            .await;
        assert!(matches!(
            report.outcome,
            RunOutcome::Error {
                error: SandboxError::OutputTooLarge { max: 100 }
            }
        ));
    }
}
