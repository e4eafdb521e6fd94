use chrono::NaiveDateTime;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::recurrence::Recurrence;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskConfigError {
    #[error("local command path is not set")]
    MissingCommandPath,
    #[error("transfer source path is not set")]
    MissingSourcePath,
    #[error("transfer destination node is not set")]
    MissingDestinationNode,
    #[error("transfer destination path is not set")]
    MissingDestinationPath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority '{other}', expected low, medium or high")),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a task actually runs. Exactly one variant per task, so a row can
/// never carry half of one backend's settings and half of the other's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskAction {
    LocalCommand { command_path: String },
    RemoteTransfer(TransferSpec),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSpec {
    pub source_path: String,
    pub destination_node: String,
    pub destination_path: String,
    pub process_name: Option<String>,
}

impl TaskAction {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskAction::LocalCommand { .. } => "local_command",
            TaskAction::RemoteTransfer(_) => "remote_transfer",
        }
    }

    pub fn validate(&self) -> Result<(), TaskConfigError> {
        match self {
            TaskAction::LocalCommand { command_path } => {
                if command_path.trim().is_empty() {
                    return Err(TaskConfigError::MissingCommandPath);
                }
            }
            TaskAction::RemoteTransfer(spec) => {
                if spec.source_path.trim().is_empty() {
                    return Err(TaskConfigError::MissingSourcePath);
                }
                if spec.destination_node.trim().is_empty() {
                    return Err(TaskConfigError::MissingDestinationNode);
                }
                if spec.destination_path.trim().is_empty() {
                    return Err(TaskConfigError::MissingDestinationPath);
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub action: TaskAction,
    pub created_at: NaiveDateTime,
    pub last_run_at: Option<NaiveDateTime>,
    pub run_count: i64,
}

/// Fields the caller supplies when registering a task. The id and the
/// bookkeeping columns are filled in by the store.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub action: TaskAction,
}

#[derive(Debug, Clone)]
pub struct Schedule {
    pub id: i64,
    pub task_id: i64,
    pub name: String,
    pub recurrence: Recurrence,
    pub active: bool,
    pub retry_budget: u32,
    pub retry_count: u32,
    pub notify_on_success: bool,
    pub notify_on_failure: bool,
    pub created_at: NaiveDateTime,
    pub next_fire_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub task_id: i64,
    pub name: String,
    pub recurrence: Recurrence,
    pub retry_budget: u32,
    pub notify_on_success: bool,
    pub notify_on_failure: bool,
    pub next_fire_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Success,
    Failure,
    Timeout,
}

impl ExecStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecStatus::Success => "success",
            ExecStatus::Failure => "failure",
            ExecStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<ExecStatus> {
        match s {
            "success" => Some(ExecStatus::Success),
            "failure" => Some(ExecStatus::Failure),
            "timeout" => Some(ExecStatus::Timeout),
            _ => None,
        }
    }
}

impl fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who asked for the run. Manual runs are recorded like any other but
/// never touch schedule state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Scheduler,
    Manual,
}

#[derive(Debug, Clone)]
pub struct Execution {
    pub id: i64,
    pub task_id: i64,
    pub ran_at: NaiveDateTime,
    pub status: ExecStatus,
    pub return_code: i32,
    pub duration: Duration,
    pub output: String,
    pub scheduled: bool,
}

#[derive(Debug, Clone)]
pub struct NewExecution {
    pub task_id: i64,
    pub ran_at: NaiveDateTime,
    pub status: ExecStatus,
    pub return_code: i32,
    pub duration: Duration,
    pub output: String,
    pub scheduled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    Error,
    Success,
    Timeout,
    Test,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Error => "error",
            AlertKind::Success => "success",
            AlertKind::Timeout => "timeout",
            AlertKind::Test => "test",
        }
    }

    pub fn parse(s: &str) -> Option<AlertKind> {
        match s {
            "error" => Some(AlertKind::Error),
            "success" => Some(AlertKind::Success),
            "timeout" => Some(AlertKind::Timeout),
            "test" => Some(AlertKind::Test),
            _ => None,
        }
    }

    pub fn from_status(status: ExecStatus) -> AlertKind {
        match status {
            ExecStatus::Success => AlertKind::Success,
            ExecStatus::Failure => AlertKind::Error,
            ExecStatus::Timeout => AlertKind::Timeout,
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub id: i64,
    pub kind: AlertKind,
    pub title: String,
    pub message: String,
    pub task_id: Option<i64>,
    pub schedule_id: Option<i64>,
    pub created_at: NaiveDateTime,
    pub resolved: bool,
    pub resolved_at: Option<NaiveDateTime>,
    pub channel: Option<String>,
    pub delivered: bool,
}

#[derive(Debug, Clone)]
pub struct NewAlert {
    pub kind: AlertKind,
    pub title: String,
    pub message: String,
    pub task_id: Option<i64>,
    pub schedule_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NotificationChannel {
    pub channel: String,
    pub enabled: bool,
    pub settings: String,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Default)]
pub struct DashboardStats {
    pub total_tasks: i64,
    pub active_schedules: i64,
    pub executions_today: i64,
    pub unresolved_alerts: i64,
    pub success_rate: Option<f64>,
    pub last_execution_at: Option<NaiveDateTime>,
}
