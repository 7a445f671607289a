//! Entity records held by the [`EntityStore`](crate::EntityStore).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Script {
    /// Store-assigned identifier.
    pub id: u64,
    /// Unique script name.
    pub name: String,
    /// JavaScript source text.
    pub content: String,
    /// When the last successful execution finished.
    pub last_run: Option<DateTime<Utc>>,
    /// When the script was created.
    pub created_at: DateTime<Utc>,
}

/// Shallow-merge update for a [`Script`]. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptPatch {
    /// New name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// New source text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// New last-run timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
}

impl ScriptPatch {
    /// A patch that only renames.
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// A patch that only replaces the source text.
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    /// A patch that only stamps the last-run time.
    pub fn last_run(at: DateTime<Utc>) -> Self {
        Self {
            last_run: Some(at),
            ..Default::default()
        }
    }
}

/// Lifecycle state of an [`Execution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The sandbox has not finished yet.
    Running,
    /// The script completed without throwing.
    Success,
    /// The script failed, was denied a capability, or timed out.
    Error,
}

impl ExecutionStatus {
    /// Whether this is a final state.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Lowercase label, as stored by collaborators.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One run of one script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    /// Store-assigned identifier.
    pub id: u64,
    /// The script that was run. May dangle after the script is deleted.
    pub script_id: u64,
    /// Current state.
    pub status: ExecutionStatus,
    /// Captured log output. Set only on success.
    pub output: Option<String>,
    /// Error message. Set only on error.
    pub error: Option<String>,
    /// Wall-clock duration. Absent while running.
    pub duration_ms: Option<u64>,
    /// When the execution record was created.
    pub executed_at: DateTime<Utc>,
}

/// Insert payload for an [`Execution`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewExecution {
    /// The script being run.
    pub script_id: u64,
    /// Initial state.
    pub status: ExecutionStatus,
    /// Initial output.
    pub output: Option<String>,
    /// Initial error.
    pub error: Option<String>,
    /// Initial duration.
    pub duration_ms: Option<u64>,
}

impl NewExecution {
    /// A fresh `running` record with no output, error, or duration.
    pub fn running(script_id: u64) -> Self {
        Self {
            script_id,
            status: ExecutionStatus::Running,
            output: None,
            error: None,
            duration_ms: None,
        }
    }
}

/// Shallow-merge update for an [`Execution`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPatch {
    /// New state.
    pub status: Option<ExecutionStatus>,
    /// New output.
    pub output: Option<String>,
    /// New error.
    pub error: Option<String>,
    /// New duration.
    pub duration_ms: Option<u64>,
}

impl ExecutionPatch {
    /// Terminal transition to `success`.
    pub fn success(output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status: Some(ExecutionStatus::Success),
            output: Some(output.into()),
            error: None,
            duration_ms: Some(duration_ms),
        }
    }

    /// Terminal transition to `error`.
    pub fn error(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status: Some(ExecutionStatus::Error),
            output: None,
            error: Some(error.into()),
            duration_ms: Some(duration_ms),
        }
    }
}

/// Recurrence descriptor of a [`Schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frequency {
    /// Every hour.
    #[serde(rename = "hourly")]
    Hourly,
    /// Every six hours.
    #[serde(rename = "6hourly")]
    SixHourly,
    /// Once a day.
    #[serde(rename = "daily")]
    Daily,
    /// Once a week.
    #[serde(rename = "weekly")]
    Weekly,
    /// Once a month.
    #[serde(rename = "monthly")]
    Monthly,
}

impl std::str::FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(Self::Hourly),
            "6hourly" => Ok(Self::SixHourly),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(format!(
                "unknown frequency '{other}', expected one of: hourly, 6hourly, daily, weekly, monthly"
            )),
        }
    }
}

/// A recurring trigger for a script. Only data lives here; the scheduling
/// collaborator decides when to fire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    /// Store-assigned identifier.
    pub id: u64,
    /// The script to trigger.
    pub script_id: u64,
    /// How often to trigger.
    pub frequency: Frequency,
    /// First trigger time.
    pub start_time: DateTime<Utc>,
    /// Whether the schedule is active.
    pub enabled: bool,
    /// When the scheduler last fired this schedule.
    pub last_run: Option<DateTime<Utc>>,
    /// When the schedule was created.
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a [`Schedule`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSchedule {
    /// The script to trigger.
    pub script_id: u64,
    /// How often to trigger.
    pub frequency: Frequency,
    /// First trigger time.
    pub start_time: DateTime<Utc>,
    /// Whether the schedule starts active.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Shallow-merge update for a [`Schedule`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulePatch {
    /// New frequency.
    #[serde(default)]
    pub frequency: Option<Frequency>,
    /// New start time.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// Enable or disable.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// New last-fired time.
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
}
