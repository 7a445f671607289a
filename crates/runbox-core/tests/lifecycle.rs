//! End-to-end tests for the execution lifecycle:
//! ScriptService -> EntityStore + SandboxExecutor -> V8.
//!
//! Tests with wall-clock bounds are serialized so isolates from other tests
//! do not compete with them for CPU.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use runbox_core::{ScriptService, ServiceOptions, UNKNOWN_SCRIPT_NAME};
use runbox_error::CoreError;
use runbox_sandbox::SandboxConfig;
use runbox_store::{ExecutionStatus, ScriptPatch};
use serial_test::serial;

fn service() -> ScriptService {
    ScriptService::from_options(ServiceOptions::default())
}

#[tokio::test]
async fn console_log_succeeds_and_stamps_last_run() {
    let svc = service();
    let script = svc.create_script("hi.js", r#"console.log("hi")"#).unwrap();
    assert!(script.last_run.is_none());

    let called_at = Utc::now();
    let result = svc.execute_script(script.id).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Success);
    let output = result.output.as_deref().unwrap();
    assert!(output.lines().any(|l| l.ends_with("] hi")), "got: {output}");
    assert!(result.error.is_none());

    let record = svc.get_execution(result.execution_id).unwrap();
    assert_eq!(record.status, ExecutionStatus::Success);
    assert_eq!(record.duration_ms, Some(result.duration_ms));
    let last_run = svc.get_script(script.id).unwrap().last_run.unwrap();
    assert!(last_run >= called_at);
}

#[tokio::test]
async fn empty_script_records_placeholder_output() {
    let svc = service();
    let script = svc.create_script("empty.js", "").unwrap();
    let result = svc.execute_script(script.id).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(
        result.output.as_deref(),
        Some("Script executed successfully (no output)")
    );
}

#[tokio::test]
async fn thrown_error_is_recorded_and_last_run_untouched() {
    let svc = service();
    let script = svc
        .create_script("boom.js", r#"throw new Error("boom")"#)
        .unwrap();

    let result = svc.execute_script(script.id).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Error);
    assert_eq!(result.error.as_deref(), Some("boom"));
    assert!(result.output.is_none());
    assert!(svc.get_script(script.id).unwrap().last_run.is_none());
}

#[tokio::test]
async fn failed_run_keeps_previous_last_run() {
    let svc = service();
    let script = svc.create_script("flaky.js", "console.log('ok')").unwrap();

    let first = svc.execute_script(script.id).await.unwrap();
    assert_eq!(first.status, ExecutionStatus::Success);
    let stamped = svc.get_script(script.id).unwrap().last_run;
    assert!(stamped.is_some());

    svc.update_script(script.id, ScriptPatch::content("throw new Error('now broken')"))
        .unwrap();
    let second = svc.execute_script(script.id).await.unwrap();
    assert_eq!(second.status, ExecutionStatus::Error);
    assert_eq!(svc.get_script(script.id).unwrap().last_run, stamped);
}

#[tokio::test]
async fn denied_module_is_an_error_execution() {
    let svc = service();
    let denied = svc.create_script("fs.js", r#"require("fs")"#).unwrap();
    let allowed = svc
        .create_script("path.js", r#"console.log(require("path").join("a", "b"))"#)
        .unwrap();

    let result = svc.execute_script(denied.id).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Error);
    assert_eq!(result.error.as_deref(), Some("Module 'fs' is not allowed"));

    let result = svc.execute_script(allowed.id).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Success);
    assert!(result.output.unwrap().ends_with("] a/b"));
}

#[tokio::test]
#[serial]
async fn infinite_loop_times_out_within_bound() {
    let svc = service();
    let script = svc.create_script("spin.js", "while(true){}").unwrap();
    let deadline = Duration::from_millis(500);

    let start = Instant::now();
    let result = svc
        .execute_script_with_deadline(script.id, deadline)
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(result.status, ExecutionStatus::Error);
    assert!(result.error.unwrap().contains("timed out"));
    assert!(
        elapsed <= deadline + Duration::from_millis(500),
        "took {elapsed:?}"
    );
    assert!(svc.get_script(script.id).unwrap().last_run.is_none());
}

#[tokio::test]
#[serial]
async fn busy_executor_still_unblocks_callers_at_deadline() {
    let svc = Arc::new(ScriptService::from_options(ServiceOptions {
        sandbox: SandboxConfig {
            max_concurrent: 1,
            ..Default::default()
        },
        ..Default::default()
    }));
    let spin = svc.create_script("spin.js", "while(true){}").unwrap();
    let quick = svc.create_script("quick.js", "console.log('hi')").unwrap();
    let deadline = Duration::from_millis(300);

    let hog = {
        let svc = svc.clone();
        tokio::spawn(async move { svc.execute_script_with_deadline(spin.id, deadline).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = Instant::now();
    let result = svc
        .execute_script_with_deadline(quick.id, deadline)
        .await
        .unwrap();
    assert!(
        start.elapsed() <= deadline + Duration::from_millis(500),
        "took {:?}",
        start.elapsed()
    );
    assert!(result.duration_ms <= (deadline + Duration::from_millis(500)).as_millis() as u64);
    assert_eq!(hog.await.unwrap().unwrap().status, ExecutionStatus::Error);
}

#[tokio::test]
async fn unknown_script_creates_no_record() {
    let svc = service();
    let err = svc.execute_script(42).await.unwrap_err();
    assert!(matches!(err, CoreError::ScriptNotFound(42)));
    assert!(svc.list_executions().is_empty());
}

#[tokio::test]
async fn executions_list_newest_first() {
    let svc = service();
    let a = svc.create_script("a.js", "console.log('a')").unwrap();
    let b = svc.create_script("b.js", "console.log('b')").unwrap();

    let first = svc.execute_script(a.id).await.unwrap();
    let second = svc.execute_script(b.id).await.unwrap();
    let third = svc.execute_script(a.id).await.unwrap();

    let ids: Vec<u64> = svc.list_executions().iter().map(|e| e.id).collect();
    assert_eq!(
        ids,
        vec![third.execution_id, second.execution_id, first.execution_id]
    );

    let for_a: Vec<u64> = svc
        .list_executions_for_script(a.id)
        .iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(for_a, vec![third.execution_id, first.execution_id]);
}

#[tokio::test]
async fn deleted_script_history_shows_unknown_name() {
    let svc = service();
    let script = svc.create_script("temp.js", "console.log(1)").unwrap();
    let result = svc.execute_script(script.id).await.unwrap();

    assert!(svc.delete_script(script.id));
    let execution = svc.get_execution(result.execution_id).unwrap();
    assert_eq!(svc.script_name_for(&execution), UNKNOWN_SCRIPT_NAME);
    assert_eq!(svc.list_executions_for_script(script.id).len(), 1);
}

#[tokio::test]
async fn runs_do_not_share_state() {
    let svc = service();
    let writer = svc
        .create_script("writer.js", "globalThis.shared = 'x'; console.log('set')")
        .unwrap();
    let reader = svc
        .create_script("reader.js", "console.log(typeof shared)")
        .unwrap();

    svc.execute_script(writer.id).await.unwrap();
    let result = svc.execute_script(reader.id).await.unwrap();
    assert!(result.output.unwrap().ends_with("] undefined"));
}

#[tokio::test]
async fn concurrent_runs_of_one_script_each_get_a_record() {
    let svc = Arc::new(service());
    let script = svc
        .create_script("slow.js", "setTimeout(() => console.log('done'), 50)")
        .unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let svc = svc.clone();
            tokio::spawn(async move { svc.execute_script(script.id).await })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Success);
        ids.push(result.execution_id);
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    assert_eq!(svc.list_executions_for_script(script.id).len(), 4);
}

#[tokio::test]
#[serial]
async fn serialized_runs_do_not_overlap() {
    let svc = Arc::new(ScriptService::from_options(ServiceOptions {
        serialize_per_script: true,
        ..Default::default()
    }));
    let script = svc
        .create_script("queued.js", "setTimeout(() => console.log('done'), 150)")
        .unwrap();

    let start = Instant::now();
    let (a, b) = tokio::join!(svc.execute_script(script.id), svc.execute_script(script.id));
    assert_eq!(a.unwrap().status, ExecutionStatus::Success);
    assert_eq!(b.unwrap().status, ExecutionStatus::Success);
    assert!(start.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn terminal_executions_are_immutable() {
    let svc = service();
    let script = svc.create_script("once.js", "1").unwrap();
    let result = svc.execute_script(script.id).await.unwrap();

    let err = svc
        .store()
        .update_execution(
            result.execution_id,
            runbox_store::ExecutionPatch::error("late", 1),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        runbox_store::StoreError::InvalidTransition { .. }
    ));
    assert_eq!(
        svc.get_execution(result.execution_id).unwrap().status,
        ExecutionStatus::Success
    );
}
