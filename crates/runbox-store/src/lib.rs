#![warn(missing_docs)]

//! # runbox-store
//!
//! In-memory entity store for scripts, executions, and schedules.
//!
//! The store is an explicit object: construct it once at process start and
//! share it by `Arc`. Each entity kind lives in its own table behind its own
//! mutex, so id assignment and shallow-merge updates are serialized per kind.
//!
//! # Invariants
//!
//! - Ids are per-kind counters starting at 1 and are never reused.
//! - Script names are unique, including across renames.
//! - An execution moves from `running` to a terminal state at most once.
//! - Listings are newest-first; equal timestamps order by id, descending.

pub mod model;

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use thiserror::Error;

pub use model::{
    Execution, ExecutionPatch, ExecutionStatus, Frequency, NewExecution, NewSchedule, Schedule,
    SchedulePatch, Script, ScriptPatch,
};

/// Errors returned by [`EntityStore`] mutations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// A script with this name already exists.
    #[error("script with name '{0}' already exists")]
    DuplicateName(String),

    /// The execution is already terminal and cannot change state again.
    #[error("execution {id} is already {status} and cannot be updated")]
    InvalidTransition {
        /// The execution id.
        id: u64,
        /// Its current terminal status.
        status: ExecutionStatus,
    },

    /// A terminal update is missing a field its status requires, or sets one
    /// it forbids.
    #[error("execution {id} cannot become {status}: {reason}")]
    IncompleteExecution {
        /// The execution id.
        id: u64,
        /// The requested terminal status.
        status: ExecutionStatus,
        /// What the update got wrong.
        reason: &'static str,
    },
}

/// Rows of one entity kind plus the next id to assign.
struct Table<T> {
    rows: BTreeMap<u64, T>,
    next_id: u64,
}

impl<T: Clone> Table<T> {
    fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn insert_with(&mut self, build: impl FnOnce(u64) -> T) -> T {
        let id = self.next_id;
        self.next_id += 1;
        let row = build(id);
        self.rows.insert(id, row.clone());
        row
    }
}

/// Lock a table. A panic while holding the lock cannot leave a row
/// half-written (rows are replaced whole), so a poisoned lock is recovered.
fn lock<T>(table: &Mutex<Table<T>>) -> MutexGuard<'_, Table<T>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The authoritative in-memory holder of all Runbox entities.
pub struct EntityStore {
    scripts: Mutex<Table<Script>>,
    executions: Mutex<Table<Execution>>,
    schedules: Mutex<Table<Schedule>>,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(Table::new()),
            executions: Mutex::new(Table::new()),
            schedules: Mutex::new(Table::new()),
        }
    }

    // -----------------------------------------------------------------------
    // Scripts
    // -----------------------------------------------------------------------

    /// Create a script. Fails if the name is taken.
    pub fn create_script(
        &self,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Script, StoreError> {
        let name = name.into();
        let mut scripts = lock(&self.scripts);
        if scripts.rows.values().any(|s| s.name == name) {
            return Err(StoreError::DuplicateName(name));
        }
        let content = content.into();
        let script = scripts.insert_with(|id| Script {
            id,
            name,
            content,
            last_run: None,
            created_at: Utc::now(),
        });
        tracing::debug!(script_id = script.id, name = %script.name, "script created");
        Ok(script)
    }

    /// Look up a script by id.
    pub fn get_script(&self, id: u64) -> Option<Script> {
        lock(&self.scripts).rows.get(&id).cloned()
    }

    /// Look up a script by its exact name.
    pub fn get_script_by_name(&self, name: &str) -> Option<Script> {
        lock(&self.scripts)
            .rows
            .values()
            .find(|s| s.name == name)
            .cloned()
    }

    /// All scripts, newest-first by creation time.
    pub fn list_scripts(&self) -> Vec<Script> {
        let mut scripts: Vec<Script> = lock(&self.scripts).rows.values().cloned().collect();
        scripts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        scripts
    }

    /// Shallow-merge `patch` into a script.
    ///
    /// Returns `Ok(None)` if the id is unknown. Renaming onto another
    /// script's name fails with [`StoreError::DuplicateName`].
    pub fn update_script(&self, id: u64, patch: ScriptPatch) -> Result<Option<Script>, StoreError> {
        let mut scripts = lock(&self.scripts);
        let Some(existing) = scripts.rows.get(&id) else {
            return Ok(None);
        };
        if let Some(name) = &patch.name {
            if scripts.rows.values().any(|s| s.id != id && &s.name == name) {
                return Err(StoreError::DuplicateName(name.clone()));
            }
        }
        let mut updated = existing.clone();
        if let Some(name) = patch.name {
            updated.name = name;
        }
        if let Some(content) = patch.content {
            updated.content = content;
        }
        if let Some(last_run) = patch.last_run {
            updated.last_run = Some(last_run);
        }
        scripts.rows.insert(id, updated.clone());
        Ok(Some(updated))
    }

    /// Delete a script. Its executions and schedules are kept.
    ///
    /// Returns `true` iff a record existed and was removed.
    pub fn delete_script(&self, id: u64) -> bool {
        let removed = lock(&self.scripts).rows.remove(&id).is_some();
        if removed {
            tracing::debug!(script_id = id, "script deleted");
        }
        removed
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Insert an execution record, stamped with the current time.
    pub fn create_execution(&self, new: NewExecution) -> Execution {
        lock(&self.executions).insert_with(|id| Execution {
            id,
            script_id: new.script_id,
            status: new.status,
            output: new.output,
            error: new.error,
            duration_ms: new.duration_ms,
            executed_at: Utc::now(),
        })
    }

    /// Look up an execution by id.
    pub fn get_execution(&self, id: u64) -> Option<Execution> {
        lock(&self.executions).rows.get(&id).cloned()
    }

    /// Shallow-merge `patch` into an execution.
    ///
    /// Returns `Ok(None)` if the id is unknown. Terminal executions are
    /// immutable: any update to one fails with
    /// [`StoreError::InvalidTransition`]. A terminal update must leave a
    /// duration and exactly the field its status calls for (`output` for
    /// success, `error` for error), or it fails with
    /// [`StoreError::IncompleteExecution`] and nothing changes.
    pub fn update_execution(
        &self,
        id: u64,
        patch: ExecutionPatch,
    ) -> Result<Option<Execution>, StoreError> {
        let mut executions = lock(&self.executions);
        let Some(existing) = executions.rows.get(&id) else {
            return Ok(None);
        };
        if existing.status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                id,
                status: existing.status,
            });
        }
        let mut updated = existing.clone();
        if let Some(status) = patch.status {
            updated.status = status;
        }
        if let Some(output) = patch.output {
            updated.output = Some(output);
        }
        if let Some(error) = patch.error {
            updated.error = Some(error);
        }
        if let Some(duration_ms) = patch.duration_ms {
            updated.duration_ms = Some(duration_ms);
        }
        check_terminal_fields(&updated)?;
        executions.rows.insert(id, updated.clone());
        Ok(Some(updated))
    }

    /// All executions, newest-first.
    pub fn list_executions(&self) -> Vec<Execution> {
        let executions = lock(&self.executions);
        newest_executions_first(executions.rows.values().cloned().collect())
    }

    /// Executions of one script, newest-first.
    pub fn list_executions_for_script(&self, script_id: u64) -> Vec<Execution> {
        let executions = lock(&self.executions);
        newest_executions_first(
            executions
                .rows
                .values()
                .filter(|e| e.script_id == script_id)
                .cloned()
                .collect(),
        )
    }

    // -----------------------------------------------------------------------
    // Schedules
    // -----------------------------------------------------------------------

    /// Insert a schedule.
    pub fn create_schedule(&self, new: NewSchedule) -> Schedule {
        lock(&self.schedules).insert_with(|id| Schedule {
            id,
            script_id: new.script_id,
            frequency: new.frequency,
            start_time: new.start_time,
            enabled: new.enabled,
            last_run: None,
            created_at: Utc::now(),
        })
    }

    /// Look up a schedule by id.
    pub fn get_schedule(&self, id: u64) -> Option<Schedule> {
        lock(&self.schedules).rows.get(&id).cloned()
    }

    /// Shallow-merge `patch` into a schedule. Returns `None` if the id is unknown.
    pub fn update_schedule(&self, id: u64, patch: SchedulePatch) -> Option<Schedule> {
        let mut schedules = lock(&self.schedules);
        let existing = schedules.rows.get(&id)?;
        let mut updated = existing.clone();
        if let Some(frequency) = patch.frequency {
            updated.frequency = frequency;
        }
        if let Some(start_time) = patch.start_time {
            updated.start_time = start_time;
        }
        if let Some(enabled) = patch.enabled {
            updated.enabled = enabled;
        }
        if let Some(last_run) = patch.last_run {
            updated.last_run = Some(last_run);
        }
        schedules.rows.insert(id, updated.clone());
        Some(updated)
    }

    /// Delete a schedule. Returns `true` iff a record existed and was removed.
    pub fn delete_schedule(&self, id: u64) -> bool {
        lock(&self.schedules).rows.remove(&id).is_some()
    }

    /// All schedules, newest-first by creation time.
    pub fn list_schedules(&self) -> Vec<Schedule> {
        let schedules = lock(&self.schedules);
        newest_schedules_first(schedules.rows.values().cloned().collect())
    }

    /// Schedules of one script, newest-first by creation time.
    pub fn list_schedules_for_script(&self, script_id: u64) -> Vec<Schedule> {
        let schedules = lock(&self.schedules);
        newest_schedules_first(
            schedules
                .rows
                .values()
                .filter(|s| s.script_id == script_id)
                .cloned()
                .collect(),
        )
    }
}

fn check_terminal_fields(execution: &Execution) -> Result<(), StoreError> {
    let reason = match execution.status {
        ExecutionStatus::Running => return Ok(()),
        _ if execution.duration_ms.is_none() => "duration is required",
        ExecutionStatus::Success if execution.output.is_none() => "output is required",
        ExecutionStatus::Success if execution.error.is_some() => "error must be unset",
        ExecutionStatus::Error if execution.error.is_none() => "error is required",
        ExecutionStatus::Error if execution.output.is_some() => "output must be unset",
        _ => return Ok(()),
    };
    Err(StoreError::IncompleteExecution {
        id: execution.id,
        status: execution.status,
        reason,
    })
}

fn newest_executions_first(mut executions: Vec<Execution>) -> Vec<Execution> {
    executions.sort_by(|a, b| b.executed_at.cmp(&a.executed_at).then(b.id.cmp(&a.id)));
    executions
}

fn newest_schedules_first(mut schedules: Vec<Schedule>) -> Vec<Schedule> {
    schedules.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    schedules
}

// Compile-time assertion: the store is shared across threads by `Arc`.
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<EntityStore>();
};
