//! The script service and the execution record lifecycle.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use runbox_error::CoreError;
use runbox_sandbox::{CapabilityContextBuilder, SandboxExecutor};
use runbox_store::{
    EntityStore, Execution, ExecutionPatch, ExecutionStatus, NewExecution, NewSchedule, Schedule,
    SchedulePatch, Script, ScriptPatch, StoreError,
};
use serde::Serialize;

use crate::options::ServiceOptions;

/// Display name for executions whose script has been deleted.
pub const UNKNOWN_SCRIPT_NAME: &str = "Unknown Script";

/// Largest script file `import_script` accepts (1 MiB).
pub const MAX_UPLOAD_BYTES: usize = 1024 * 1024;

/// What a caller gets back from [`ScriptService::execute_script`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// The execution record that was created.
    pub execution_id: u64,
    /// Terminal status: `success` or `error`.
    pub status: ExecutionStatus,
    /// Captured output, on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Error message, on error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration of the run.
    pub duration_ms: u64,
}

impl From<&Execution> for ExecutionResult {
    fn from(execution: &Execution) -> Self {
        Self {
            execution_id: execution.id,
            status: execution.status,
            output: execution.output.clone(),
            error: execution.error.clone(),
            duration_ms: execution.duration_ms.unwrap_or_default(),
        }
    }
}

type ScriptLocks = Mutex<HashMap<u64, Arc<tokio::sync::Mutex<()>>>>;

/// Scripts, executions, and schedules behind one shared entry point.
///
/// `Send + Sync`; share it with `Arc`.
pub struct ScriptService {
    store: Arc<EntityStore>,
    executor: Arc<SandboxExecutor>,
    contexts: CapabilityContextBuilder,
    script_locks: Option<ScriptLocks>,
}

fn store_error(err: StoreError) -> CoreError {
    match err {
        StoreError::DuplicateName(name) => CoreError::DuplicateName(name),
        other => CoreError::Internal(other.into()),
    }
}

impl ScriptService {
    /// A service over an existing store and executor with default contexts.
    pub fn new(store: Arc<EntityStore>, executor: Arc<SandboxExecutor>) -> Self {
        Self {
            store,
            executor,
            contexts: CapabilityContextBuilder::default(),
            script_locks: None,
        }
    }

    /// A service with a fresh store, built from options.
    pub fn from_options(options: ServiceOptions) -> Self {
        let service = Self::new(
            Arc::new(EntityStore::new()),
            Arc::new(SandboxExecutor::new(options.sandbox)),
        )
        .with_context_builder(options.contexts);
        if options.serialize_per_script {
            service.with_serialized_runs()
        } else {
            service
        }
    }

    /// Use `builder` as the template for every run's capability context.
    pub fn with_context_builder(mut self, builder: CapabilityContextBuilder) -> Self {
        self.contexts = builder;
        self
    }

    /// Queue overlapping executions of the same script instead of running
    /// them concurrently.
    pub fn with_serialized_runs(mut self) -> Self {
        self.script_locks = Some(Mutex::new(HashMap::new()));
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Execution lifecycle
    // -----------------------------------------------------------------------

    /// Run a script with the executor's default deadline.
    pub async fn execute_script(&self, script_id: u64) -> Result<ExecutionResult, CoreError> {
        let deadline = self.executor.config().timeout;
        self.execute_script_with_deadline(script_id, deadline).await
    }

    /// Run a script, terminating it after `deadline`.
    ///
    /// Unknown ids fail before any record is created. Otherwise a `running`
    /// execution is inserted, the script runs in a freshly built context, and
    /// the record moves to exactly one terminal state. Script failures are
    /// reported through the returned status, never as `Err`.
    pub async fn execute_script_with_deadline(
        &self,
        script_id: u64,
        deadline: Duration,
    ) -> Result<ExecutionResult, CoreError> {
        let script = self
            .store
            .get_script(script_id)
            .ok_or(CoreError::ScriptNotFound(script_id))?;

        let _guard = match self.script_lock(script_id) {
            Some(lock) => Some(lock.lock_owned().await),
            None => None,
        };

        let execution = self.store.create_execution(NewExecution::running(script_id));
        tracing::info!(
            script_id,
            execution_id = execution.id,
            name = %script.name,
            "execution started"
        );

        let report = self
            .executor
            .run_with_deadline(&script.content, self.contexts.build(), deadline)
            .await;

        let patch = match (report.output(), report.error_message()) {
            (Some(output), _) => ExecutionPatch::success(output, report.elapsed_ms),
            (None, error) => ExecutionPatch::error(error.unwrap_or_default(), report.elapsed_ms),
        };
        let finished = self
            .store
            .update_execution(execution.id, patch)
            .map_err(store_error)?
            .ok_or(CoreError::ExecutionNotFound(execution.id))?;

        match finished.status {
            ExecutionStatus::Success => {
                tracing::info!(
                    script_id,
                    execution_id = finished.id,
                    status = %finished.status,
                    duration_ms = report.elapsed_ms,
                    "execution finished"
                );
                self.stamp_last_run(script_id);
            }
            _ => {
                tracing::warn!(
                    script_id,
                    execution_id = finished.id,
                    status = %finished.status,
                    duration_ms = report.elapsed_ms,
                    error = finished.error.as_deref().unwrap_or_default(),
                    "execution failed"
                );
            }
        }

        Ok(ExecutionResult::from(&finished))
    }

    fn stamp_last_run(&self, script_id: u64) {
        match self
            .store
            .update_script(script_id, ScriptPatch::last_run(Utc::now()))
        {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::debug!(script_id, "script deleted during execution; last run not stamped");
            }
            Err(e) => tracing::warn!(script_id, error = %e, "failed to stamp last run"),
        }
    }

    fn script_lock(&self, script_id: u64) -> Option<Arc<tokio::sync::Mutex<()>>> {
        let locks = self.script_locks.as_ref()?;
        let mut locks = locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Some(locks.entry(script_id).or_default().clone())
    }

    // -----------------------------------------------------------------------
    // Scripts
    // -----------------------------------------------------------------------

    /// Create a script. Fails with [`CoreError::DuplicateName`] if the name is taken.
    pub fn create_script(
        &self,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Script, CoreError> {
        self.store.create_script(name, content).map_err(store_error)
    }

    /// Create a script from an uploaded file.
    ///
    /// The file must be named `*.js`, be at most [`MAX_UPLOAD_BYTES`], and be
    /// UTF-8. The script takes the file's base name.
    pub fn import_script(&self, file_name: &str, bytes: &[u8]) -> Result<Script, CoreError> {
        let name = Path::new(file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(file_name);

        if !name.ends_with(".js") {
            return Err(CoreError::InvalidUpload(
                "only JavaScript files (.js) are allowed".into(),
            ));
        }
        if bytes.len() > MAX_UPLOAD_BYTES {
            return Err(CoreError::InvalidUpload(format!(
                "file exceeds maximum size of {MAX_UPLOAD_BYTES} bytes (got {})",
                bytes.len()
            )));
        }
        let content = std::str::from_utf8(bytes)
            .map_err(|_| CoreError::InvalidUpload("file is not valid UTF-8".into()))?;

        let script = self.create_script(name, content)?;
        tracing::info!(script_id = script.id, name = %script.name, "script imported");
        Ok(script)
    }

    /// Look up a script by id.
    pub fn get_script(&self, id: u64) -> Result<Script, CoreError> {
        self.store.get_script(id).ok_or(CoreError::ScriptNotFound(id))
    }

    /// Look up a script by exact name.
    pub fn get_script_by_name(&self, name: &str) -> Option<Script> {
        self.store.get_script_by_name(name)
    }

    /// Look up a script by name, suggesting a close match when absent.
    pub fn resolve_script_name(&self, name: &str) -> Result<Script, CoreError> {
        if let Some(script) = self.store.get_script_by_name(name) {
            return Ok(script);
        }
        let scripts = self.store.list_scripts();
        Err(CoreError::script_name_not_found(
            name,
            scripts.iter().map(|s| s.name.as_str()),
        ))
    }

    /// All scripts, newest-first.
    pub fn list_scripts(&self) -> Vec<Script> {
        self.store.list_scripts()
    }

    /// Shallow-merge `patch` into a script.
    pub fn update_script(&self, id: u64, patch: ScriptPatch) -> Result<Script, CoreError> {
        self.store
            .update_script(id, patch)
            .map_err(store_error)?
            .ok_or(CoreError::ScriptNotFound(id))
    }

    /// Delete a script. Its executions are kept.
    pub fn delete_script(&self, id: u64) -> bool {
        if let Some(locks) = &self.script_locks {
            locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&id);
        }
        self.store.delete_script(id)
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Look up an execution by id.
    pub fn get_execution(&self, id: u64) -> Result<Execution, CoreError> {
        self.store
            .get_execution(id)
            .ok_or(CoreError::ExecutionNotFound(id))
    }

    /// All executions, newest-first.
    pub fn list_executions(&self) -> Vec<Execution> {
        self.store.list_executions()
    }

    /// One script's executions, newest-first.
    pub fn list_executions_for_script(&self, script_id: u64) -> Vec<Execution> {
        self.store.list_executions_for_script(script_id)
    }

    /// The name of the execution's script, or [`UNKNOWN_SCRIPT_NAME`] once
    /// the script is gone.
    pub fn script_name_for(&self, execution: &Execution) -> String {
        self.store
            .get_script(execution.script_id)
            .map(|s| s.name)
            .unwrap_or_else(|| UNKNOWN_SCRIPT_NAME.to_string())
    }

    // -----------------------------------------------------------------------
    // Schedules
    // -----------------------------------------------------------------------

    /// Create a schedule for an existing script.
    pub fn create_schedule(&self, new: NewSchedule) -> Result<Schedule, CoreError> {
        if self.store.get_script(new.script_id).is_none() {
            return Err(CoreError::ScriptNotFound(new.script_id));
        }
        Ok(self.store.create_schedule(new))
    }

    /// Look up a schedule by id.
    pub fn get_schedule(&self, id: u64) -> Result<Schedule, CoreError> {
        self.store
            .get_schedule(id)
            .ok_or(CoreError::ScheduleNotFound(id))
    }

    /// All schedules, newest-first.
    pub fn list_schedules(&self) -> Vec<Schedule> {
        self.store.list_schedules()
    }

    /// One script's schedules, newest-first.
    pub fn list_schedules_for_script(&self, script_id: u64) -> Vec<Schedule> {
        self.store.list_schedules_for_script(script_id)
    }

    /// Shallow-merge `patch` into a schedule.
    pub fn update_schedule(&self, id: u64, patch: SchedulePatch) -> Result<Schedule, CoreError> {
        self.store
            .update_schedule(id, patch)
            .ok_or(CoreError::ScheduleNotFound(id))
    }

    /// Delete a schedule.
    pub fn delete_schedule(&self, id: u64) -> bool {
        self.store.delete_schedule(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ScriptService {
        ScriptService::from_options(ServiceOptions::default())
    }

    #[test]
    fn service_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ScriptService>();
    }

    #[test]
    fn import_rejects_non_js_files() {
        let err = service().import_script("notes.txt", b"hello").unwrap_err();
        assert!(matches!(err, CoreError::InvalidUpload(_)));
    }

    #[test]
    fn import_rejects_oversized_files() {
        let big = vec![b'x'; MAX_UPLOAD_BYTES + 1];
        let err = service().import_script("big.js", &big).unwrap_err();
        assert!(matches!(err, CoreError::InvalidUpload(_)));
    }

    #[test]
    fn import_uses_base_name_and_rejects_duplicates() {
        let svc = service();
        let script = svc
            .import_script("some/dir/hello.js", b"console.log('hi')")
            .unwrap();
        assert_eq!(script.name, "hello.js");
        let err = svc.import_script("hello.js", b"1").unwrap_err();
        assert!(matches!(err, CoreError::DuplicateName(ref n) if n == "hello.js"));
        assert_eq!(err.http_status(), 409);
    }

    #[test]
    fn update_unknown_script_is_not_found() {
        let err = service()
            .update_script(99, ScriptPatch::content("x"))
            .unwrap_err();
        assert!(matches!(err, CoreError::ScriptNotFound(99)));
    }

    #[test]
    fn schedule_requires_existing_script() {
        let err = service()
            .create_schedule(NewSchedule {
                script_id: 5,
                frequency: runbox_store::Frequency::Daily,
                start_time: Utc::now(),
                enabled: true,
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::ScriptNotFound(5)));
    }

    #[test]
    fn resolve_suggests_close_names() {
        let svc = service();
        svc.create_script("backup.js", "").unwrap();
        match svc.resolve_script_name("bakup.js").unwrap_err() {
            CoreError::ScriptNameNotFound { suggestion, .. } => {
                assert_eq!(suggestion.as_deref(), Some("backup.js"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn result_serializes_camel_case() {
        let result = ExecutionResult {
            execution_id: 3,
            status: ExecutionStatus::Error,
            output: None,
            error: Some("boom".into()),
            duration_ms: 7,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["executionId"], 3);
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"], "boom");
        assert!(json.get("output").is_none());
    }
}
