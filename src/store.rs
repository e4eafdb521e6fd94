use chrono::{NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use libsql::{params, Builder, Connection};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::model::{
    Alert, AlertKind, DashboardStats, ExecStatus, Execution, NewAlert, NewExecution, NewSchedule,
    NewTask, NotificationChannel, Schedule, Task, TaskAction, TaskConfigError, TransferSpec,
};
use crate::recurrence::Recurrence;

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS tasks (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    title                TEXT NOT NULL,
    description          TEXT NOT NULL DEFAULT '',
    priority             TEXT NOT NULL DEFAULT 'medium',
    kind                 TEXT NOT NULL,
    command_path         TEXT,
    transfer_source_path TEXT,
    transfer_dest_node   TEXT,
    transfer_dest_path   TEXT,
    transfer_process     TEXT,
    created_at           TEXT NOT NULL,
    last_run_at          TEXT,
    run_count            INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS schedules (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id           INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    name              TEXT NOT NULL,
    recurrence        TEXT NOT NULL,
    time_of_day       TEXT,
    weekdays          TEXT,
    day_of_month      INTEGER,
    run_at            TEXT,
    active            INTEGER NOT NULL DEFAULT 1,
    retry_budget      INTEGER NOT NULL DEFAULT 3,
    retry_count       INTEGER NOT NULL DEFAULT 0,
    notify_on_success INTEGER NOT NULL DEFAULT 0,
    notify_on_failure INTEGER NOT NULL DEFAULT 1,
    created_at        TEXT NOT NULL,
    next_fire_at      TEXT
);

CREATE TABLE IF NOT EXISTS executions (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id       INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    ran_at        TEXT NOT NULL,
    status        TEXT NOT NULL,
    return_code   INTEGER NOT NULL,
    duration_secs REAL NOT NULL,
    output        TEXT NOT NULL DEFAULT '',
    scheduled     INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS alerts (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    kind        TEXT NOT NULL,
    title       TEXT NOT NULL,
    message     TEXT NOT NULL DEFAULT '',
    task_id     INTEGER REFERENCES tasks(id) ON DELETE CASCADE,
    schedule_id INTEGER REFERENCES schedules(id) ON DELETE SET NULL,
    created_at  TEXT NOT NULL,
    resolved    INTEGER NOT NULL DEFAULT 0,
    resolved_at TEXT,
    channel     TEXT,
    delivered   INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS notification_channels (
    channel    TEXT PRIMARY KEY,
    enabled    INTEGER NOT NULL DEFAULT 0,
    settings   TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules (active, next_fire_at);
CREATE INDEX IF NOT EXISTS idx_executions_task ON executions (task_id, ran_at);
CREATE INDEX IF NOT EXISTS idx_alerts_resolved ON alerts (resolved, created_at);
";

const TASK_COLUMNS: &str = "id, title, description, priority, kind, command_path, \
    transfer_source_path, transfer_dest_node, transfer_dest_path, transfer_process, \
    created_at, last_run_at, run_count";

const SCHEDULE_COLUMNS: &str = "id, task_id, name, recurrence, time_of_day, weekdays, \
    day_of_month, run_at, active, retry_budget, retry_count, notify_on_success, \
    notify_on_failure, created_at, next_fire_at";

const EXECUTION_COLUMNS: &str =
    "id, task_id, ran_at, status, return_code, duration_secs, output, scheduled";

const ALERT_COLUMNS: &str = "id, kind, title, message, task_id, schedule_id, created_at, \
    resolved, resolved_at, channel, delivered";

const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const TIME_FORMAT: &str = "%H:%M";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] libsql::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timestamp parse error: {0}")]
    Timestamp(#[from] chrono::ParseError),
    #[error("invalid task configuration: {0}")]
    InvalidTask(#[from] TaskConfigError),
    #[error("task {0} not found")]
    TaskNotFound(i64),
    #[error("schedule {0} not found")]
    ScheduleNotFound(i64),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// All reads and writes go through one shared connection, so concurrent
/// callers (the poll loop and a manual run) serialize at the database.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
    tz: Tz,
}

impl Store {
    pub async fn open(path: &Path, tz: Tz) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Builder::new_local(path).build().await?;
        let store = Store { conn: db.connect()?, tz };
        store.init().await?;
        Ok(store)
    }

    pub async fn open_in_memory(tz: Tz) -> Result<Self, StoreError> {
        let db = Builder::new_local(":memory:").build().await?;
        let store = Store { conn: db.connect()?, tz };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(SCHEMA).await?;
        Ok(())
    }

    /// Wall clock in the configured timezone, without offset, truncated
    /// to whole seconds so values round-trip through the stored format.
    pub fn now(&self) -> NaiveDateTime {
        let now = self.tz.from_utc_datetime(&Utc::now().naive_utc()).naive_local();
        now.with_nanosecond(0).unwrap_or(now)
    }

    pub async fn create_task(&self, new: NewTask) -> Result<Task, StoreError> {
        new.action.validate()?;
        let created_at = self.now();
        let (kind, command_path, source, node, dest, process) = action_columns(&new.action);
        self.conn
            .execute(
                "INSERT INTO tasks (title, description, priority, kind, command_path, \
                 transfer_source_path, transfer_dest_node, transfer_dest_path, \
                 transfer_process, created_at, run_count) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0)",
                params![
                    new.title.clone(),
                    new.description.clone(),
                    new.priority.as_str(),
                    kind,
                    command_path,
                    source,
                    node,
                    dest,
                    process,
                    format_datetime(created_at),
                ],
            )
            .await?;
        Ok(Task {
            id: self.conn.last_insert_rowid(),
            title: new.title,
            description: new.description,
            priority: new.priority,
            action: new.action,
            created_at,
            last_run_at: None,
            run_count: 0,
        })
    }

    pub async fn task(&self, id: i64) -> Result<Option<Task>, StoreError> {
        let mut rows = self
            .conn
            .query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"), params![id])
            .await?;
        rows.next().await?.map(|row| read_task(&row)).transpose()
    }

    pub async fn tasks(&self) -> Result<Vec<Task>, StoreError> {
        let mut rows = self
            .conn
            .query(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id"), ())
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(read_task(&row)?);
        }
        Ok(out)
    }

    pub async fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        task.action.validate()?;
        let (kind, command_path, source, node, dest, process) = action_columns(&task.action);
        let affected = self
            .conn
            .execute(
                "UPDATE tasks SET title = ?1, description = ?2, priority = ?3, kind = ?4, \
                 command_path = ?5, transfer_source_path = ?6, transfer_dest_node = ?7, \
                 transfer_dest_path = ?8, transfer_process = ?9 WHERE id = ?10",
                params![
                    task.title.clone(),
                    task.description.clone(),
                    task.priority.as_str(),
                    kind,
                    command_path,
                    source,
                    node,
                    dest,
                    process,
                    task.id,
                ],
            )
            .await?;
        if affected == 0 {
            return Err(StoreError::TaskNotFound(task.id));
        }
        Ok(())
    }

    pub async fn delete_task(&self, id: i64) -> Result<bool, StoreError> {
        let affected = self.conn.execute("DELETE FROM tasks WHERE id = ?1", params![id]).await?;
        Ok(affected > 0)
    }

    pub async fn create_schedule(&self, new: NewSchedule) -> Result<Schedule, StoreError> {
        if self.task(new.task_id).await?.is_none() {
            return Err(StoreError::TaskNotFound(new.task_id));
        }
        let created_at = self.now();
        let (kind, time_of_day, weekdays, day_of_month, run_at) =
            recurrence_columns(&new.recurrence);
        self.conn
            .execute(
                "INSERT INTO schedules (task_id, name, recurrence, time_of_day, weekdays, \
                 day_of_month, run_at, active, retry_budget, retry_count, notify_on_success, \
                 notify_on_failure, created_at, next_fire_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, 0, ?9, ?10, ?11, ?12)",
                params![
                    new.task_id,
                    new.name.clone(),
                    kind,
                    time_of_day,
                    weekdays,
                    day_of_month,
                    run_at,
                    i64::from(new.retry_budget),
                    i64::from(new.notify_on_success),
                    i64::from(new.notify_on_failure),
                    format_datetime(created_at),
                    new.next_fire_at.map(format_datetime),
                ],
            )
            .await?;
        Ok(Schedule {
            id: self.conn.last_insert_rowid(),
            task_id: new.task_id,
            name: new.name,
            recurrence: new.recurrence,
            active: true,
            retry_budget: new.retry_budget,
            retry_count: 0,
            notify_on_success: new.notify_on_success,
            notify_on_failure: new.notify_on_failure,
            created_at,
            next_fire_at: new.next_fire_at,
        })
    }

    pub async fn schedule(&self, id: i64) -> Result<Option<Schedule>, StoreError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
                params![id],
            )
            .await?;
        rows.next().await?.map(|row| read_schedule(&row)).transpose()
    }

    pub async fn schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        self.collect_schedules(format!("SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY id"), ())
            .await
    }

    pub async fn schedules_for_task(&self, task_id: i64) -> Result<Vec<Schedule>, StoreError> {
        self.collect_schedules(
            format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE task_id = ?1 ORDER BY id"),
            params![task_id],
        )
        .await
    }

    pub async fn update_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
        let (kind, time_of_day, weekdays, day_of_month, run_at) =
            recurrence_columns(&schedule.recurrence);
        let affected = self
            .conn
            .execute(
                "UPDATE schedules SET name = ?1, recurrence = ?2, time_of_day = ?3, \
                 weekdays = ?4, day_of_month = ?5, run_at = ?6, active = ?7, retry_budget = ?8, \
                 retry_count = ?9, notify_on_success = ?10, notify_on_failure = ?11, \
                 next_fire_at = ?12 WHERE id = ?13",
                params![
                    schedule.name.clone(),
                    kind,
                    time_of_day,
                    weekdays,
                    day_of_month,
                    run_at,
                    i64::from(schedule.active),
                    i64::from(schedule.retry_budget),
                    i64::from(schedule.retry_count),
                    i64::from(schedule.notify_on_success),
                    i64::from(schedule.notify_on_failure),
                    schedule.next_fire_at.map(format_datetime),
                    schedule.id,
                ],
            )
            .await?;
        if affected == 0 {
            return Err(StoreError::ScheduleNotFound(schedule.id));
        }
        Ok(())
    }

    /// Schedules that should fire now, oldest target first.
    pub async fn due_schedules(&self, now: NaiveDateTime) -> Result<Vec<Schedule>, StoreError> {
        self.collect_schedules(
            format!(
                "SELECT {SCHEDULE_COLUMNS} FROM schedules \
                 WHERE active = 1 AND next_fire_at IS NOT NULL AND next_fire_at <= ?1 \
                 ORDER BY next_fire_at, id"
            ),
            params![format_datetime(now)],
        )
        .await
    }

    async fn collect_schedules(
        &self,
        sql: String,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Schedule>, StoreError> {
        let mut rows = self.conn.query(&sql, params).await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(read_schedule(&row)?);
        }
        Ok(out)
    }

    /// One write that settles a fired schedule: the new target instant,
    /// the failure counter and the active flag.
    pub async fn apply_outcome(
        &self,
        schedule_id: i64,
        next_fire_at: Option<NaiveDateTime>,
        retry_count: u32,
        active: bool,
    ) -> Result<(), StoreError> {
        let affected = self
            .conn
            .execute(
                "UPDATE schedules SET next_fire_at = ?1, retry_count = ?2, active = ?3 \
                 WHERE id = ?4",
                params![
                    next_fire_at.map(format_datetime),
                    i64::from(retry_count),
                    i64::from(active),
                    schedule_id,
                ],
            )
            .await?;
        if affected == 0 {
            return Err(StoreError::ScheduleNotFound(schedule_id));
        }
        Ok(())
    }

    pub async fn set_schedule_active(
        &self,
        id: i64,
        active: bool,
        next_fire_at: Option<NaiveDateTime>,
    ) -> Result<(), StoreError> {
        let affected = self
            .conn
            .execute(
                "UPDATE schedules SET active = ?1, next_fire_at = ?2, retry_count = 0 \
                 WHERE id = ?3",
                params![i64::from(active), next_fire_at.map(format_datetime), id],
            )
            .await?;
        if affected == 0 {
            return Err(StoreError::ScheduleNotFound(id));
        }
        Ok(())
    }

    pub async fn delete_schedule(&self, id: i64) -> Result<bool, StoreError> {
        let affected =
            self.conn.execute("DELETE FROM schedules WHERE id = ?1", params![id]).await?;
        Ok(affected > 0)
    }

    /// Inserts the execution row and bumps the task's run bookkeeping in
    /// one transaction.
    pub async fn record_execution(&self, new: NewExecution) -> Result<Execution, StoreError> {
        let tx = self.conn.transaction().await?;
        tx.execute(
            "INSERT INTO executions (task_id, ran_at, status, return_code, duration_secs, \
             output, scheduled) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                new.task_id,
                format_datetime(new.ran_at),
                new.status.as_str(),
                i64::from(new.return_code),
                new.duration.as_secs_f64(),
                new.output.clone(),
                i64::from(new.scheduled),
            ],
        )
        .await?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE tasks SET last_run_at = ?1, run_count = run_count + 1 WHERE id = ?2",
            params![format_datetime(new.ran_at), new.task_id],
        )
        .await?;
        tx.commit().await?;
        Ok(Execution {
            id,
            task_id: new.task_id,
            ran_at: new.ran_at,
            status: new.status,
            return_code: new.return_code,
            duration: new.duration,
            output: new.output,
            scheduled: new.scheduled,
        })
    }

    pub async fn executions_for_task(
        &self,
        task_id: i64,
        limit: i64,
    ) -> Result<Vec<Execution>, StoreError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions WHERE task_id = ?1 \
                     ORDER BY ran_at DESC, id DESC LIMIT ?2"
                ),
                params![task_id, limit],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(read_execution(&row)?);
        }
        Ok(out)
    }

    pub async fn recent_executions(&self, limit: i64) -> Result<Vec<Execution>, StoreError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions \
                     ORDER BY ran_at DESC, id DESC LIMIT ?1"
                ),
                params![limit],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(read_execution(&row)?);
        }
        Ok(out)
    }

    pub async fn create_alert(&self, new: NewAlert) -> Result<Alert, StoreError> {
        let created_at = self.now();
        self.conn
            .execute(
                "INSERT INTO alerts (kind, title, message, task_id, schedule_id, created_at, \
                 resolved, delivered) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0)",
                params![
                    new.kind.as_str(),
                    new.title.clone(),
                    new.message.clone(),
                    new.task_id,
                    new.schedule_id,
                    format_datetime(created_at),
                ],
            )
            .await?;
        Ok(Alert {
            id: self.conn.last_insert_rowid(),
            kind: new.kind,
            title: new.title,
            message: new.message,
            task_id: new.task_id,
            schedule_id: new.schedule_id,
            created_at,
            resolved: false,
            resolved_at: None,
            channel: None,
            delivered: false,
        })
    }

    pub async fn alerts(&self, unresolved_only: bool) -> Result<Vec<Alert>, StoreError> {
        let sql = if unresolved_only {
            format!(
                "SELECT {ALERT_COLUMNS} FROM alerts WHERE resolved = 0 \
                 ORDER BY created_at DESC, id DESC"
            )
        } else {
            format!("SELECT {ALERT_COLUMNS} FROM alerts ORDER BY created_at DESC, id DESC")
        };
        let mut rows = self.conn.query(&sql, ()).await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(read_alert(&row)?);
        }
        Ok(out)
    }

    pub async fn resolve_alert(&self, id: i64) -> Result<bool, StoreError> {
        let affected = self
            .conn
            .execute(
                "UPDATE alerts SET resolved = 1, resolved_at = ?1 WHERE id = ?2 AND resolved = 0",
                params![format_datetime(self.now()), id],
            )
            .await?;
        Ok(affected > 0)
    }

    pub async fn clear_resolved_alerts(&self) -> Result<u64, StoreError> {
        let affected = self.conn.execute("DELETE FROM alerts WHERE resolved = 1", ()).await?;
        Ok(affected)
    }

    pub async fn mark_alert_delivered(&self, id: i64, channel: &str) -> Result<(), StoreError> {
        self.conn
            .execute(
                "UPDATE alerts SET delivered = 1, channel = ?1 WHERE id = ?2",
                params![channel, id],
            )
            .await?;
        Ok(())
    }

    pub async fn unresolved_alert_counts(&self) -> Result<Vec<(AlertKind, i64)>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT kind, COUNT(*) FROM alerts WHERE resolved = 0 GROUP BY kind ORDER BY kind",
                (),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            let kind: String = row.get(0)?;
            if let Some(kind) = AlertKind::parse(&kind) {
                out.push((kind, row.get(1)?));
            }
        }
        Ok(out)
    }

    pub async fn upsert_channel(
        &self,
        channel: &str,
        enabled: bool,
        settings: &str,
    ) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO notification_channels (channel, enabled, settings, updated_at) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(channel) DO UPDATE SET enabled = excluded.enabled, \
                 settings = excluded.settings, updated_at = excluded.updated_at",
                params![channel, i64::from(enabled), settings, format_datetime(self.now())],
            )
            .await?;
        Ok(())
    }

    pub async fn set_channel_enabled(
        &self,
        channel: &str,
        enabled: bool,
    ) -> Result<bool, StoreError> {
        let affected = self
            .conn
            .execute(
                "UPDATE notification_channels SET enabled = ?1, updated_at = ?2 \
                 WHERE channel = ?3",
                params![i64::from(enabled), format_datetime(self.now()), channel],
            )
            .await?;
        Ok(affected > 0)
    }

    pub async fn channel(&self, channel: &str) -> Result<Option<NotificationChannel>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT channel, enabled, settings, updated_at FROM notification_channels \
                 WHERE channel = ?1",
                params![channel],
            )
            .await?;
        rows.next().await?.map(|row| read_channel(&row)).transpose()
    }

    pub async fn enabled_channel(
        &self,
        channel: &str,
    ) -> Result<Option<NotificationChannel>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT channel, enabled, settings, updated_at FROM notification_channels \
                 WHERE channel = ?1 AND enabled = 1",
                params![channel],
            )
            .await?;
        rows.next().await?.map(|row| read_channel(&row)).transpose()
    }

    pub async fn dashboard_stats(&self, now: NaiveDateTime) -> Result<DashboardStats, StoreError> {
        let total_tasks = self.scalar("SELECT COUNT(*) FROM tasks", ()).await?;
        let active_schedules =
            self.scalar("SELECT COUNT(*) FROM schedules WHERE active = 1", ()).await?;
        let day_start = now.date().and_time(NaiveTime::MIN);
        let executions_today = self
            .scalar(
                "SELECT COUNT(*) FROM executions WHERE ran_at >= ?1",
                params![format_datetime(day_start)],
            )
            .await?;
        let unresolved_alerts =
            self.scalar("SELECT COUNT(*) FROM alerts WHERE resolved = 0", ()).await?;

        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*), SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END) \
                 FROM executions",
                (),
            )
            .await?;
        let (total, succeeded) = match rows.next().await? {
            Some(row) => (row.get::<i64>(0)?, row.get::<Option<i64>>(1)?.unwrap_or(0)),
            None => (0, 0),
        };
        let success_rate =
            if total > 0 { Some(succeeded as f64 / total as f64) } else { None };

        let mut rows = self.conn.query("SELECT MAX(ran_at) FROM executions", ()).await?;
        let last_execution_at = match rows.next().await? {
            Some(row) => parse_opt_datetime(row.get(0)?)?,
            None => None,
        };

        Ok(DashboardStats {
            total_tasks,
            active_schedules,
            executions_today,
            unresolved_alerts,
            success_rate,
            last_execution_at,
        })
    }

    async fn scalar(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<i64, StoreError> {
        let mut rows = self.conn.query(sql, params).await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }
}

fn format_datetime(t: NaiveDateTime) -> String {
    t.format(DATETIME_FORMAT).to_string()
}

fn parse_datetime(s: &str) -> Result<NaiveDateTime, StoreError> {
    Ok(NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)?)
}

fn parse_opt_datetime(s: Option<String>) -> Result<Option<NaiveDateTime>, StoreError> {
    s.map(|v| parse_datetime(&v)).transpose()
}

fn action_columns(
    action: &TaskAction,
) -> (&'static str, Option<String>, Option<String>, Option<String>, Option<String>, Option<String>)
{
    match action {
        TaskAction::LocalCommand { command_path } => {
            ("local_command", Some(command_path.clone()), None, None, None, None)
        }
        TaskAction::RemoteTransfer(spec) => (
            "remote_transfer",
            None,
            Some(spec.source_path.clone()),
            Some(spec.destination_node.clone()),
            Some(spec.destination_path.clone()),
            spec.process_name.clone(),
        ),
    }
}

fn recurrence_columns(
    rule: &Recurrence,
) -> (&'static str, Option<String>, Option<String>, Option<i64>, Option<String>) {
    match rule {
        Recurrence::Daily { at } => {
            ("daily", Some(at.format(TIME_FORMAT).to_string()), None, None, None)
        }
        Recurrence::Weekly { weekdays, at } => (
            "weekly",
            Some(at.format(TIME_FORMAT).to_string()),
            Some(weekdays.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(",")),
            None,
            None,
        ),
        Recurrence::Monthly { day, at } => (
            "monthly",
            Some(at.format(TIME_FORMAT).to_string()),
            None,
            Some(i64::from(*day)),
            None,
        ),
        Recurrence::Once { at } => ("once", None, None, None, Some(format_datetime(*at))),
    }
}

fn recurrence_from_columns(
    kind: &str,
    time_of_day: Option<String>,
    weekdays: Option<String>,
    day_of_month: Option<i64>,
    run_at: Option<String>,
) -> Result<Recurrence, StoreError> {
    let parse_time = |s: Option<String>| -> Result<NaiveTime, StoreError> {
        let s = s
            .ok_or_else(|| StoreError::Corrupt("schedule row is missing its time of day".into()))?;
        Ok(NaiveTime::parse_from_str(&s, TIME_FORMAT)?)
    };
    match kind {
        "daily" => Ok(Recurrence::Daily { at: parse_time(time_of_day)? }),
        "weekly" => {
            let at = parse_time(time_of_day)?;
            let days = weekdays
                .unwrap_or_default()
                .split(',')
                .filter(|p| !p.trim().is_empty())
                .map(|p| p.trim().parse::<u8>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::Corrupt(format!("bad weekday list: {e}")))?;
            Ok(Recurrence::Weekly { weekdays: days, at })
        }
        "monthly" => {
            let day = day_of_month
                .ok_or_else(|| StoreError::Corrupt("monthly schedule row has no day".into()))?;
            Ok(Recurrence::Monthly { day: day as u32, at: parse_time(time_of_day)? })
        }
        "once" => {
            let s = run_at
                .ok_or_else(|| StoreError::Corrupt("one-shot schedule row has no instant".into()))?;
            Ok(Recurrence::Once { at: parse_datetime(&s)? })
        }
        other => Err(StoreError::Corrupt(format!("unknown recurrence kind '{other}'"))),
    }
}

fn read_task(row: &libsql::Row) -> Result<Task, StoreError> {
    let kind: String = row.get(4)?;
    let action = match kind.as_str() {
        "local_command" => TaskAction::LocalCommand {
            command_path: row.get::<Option<String>>(5)?.unwrap_or_default(),
        },
        "remote_transfer" => TaskAction::RemoteTransfer(TransferSpec {
            source_path: row.get::<Option<String>>(6)?.unwrap_or_default(),
            destination_node: row.get::<Option<String>>(7)?.unwrap_or_default(),
            destination_path: row.get::<Option<String>>(8)?.unwrap_or_default(),
            process_name: row.get(9)?,
        }),
        other => return Err(StoreError::Corrupt(format!("unknown task kind '{other}'"))),
    };
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        priority: row.get::<String>(3)?.parse().unwrap_or_default(),
        action,
        created_at: parse_datetime(&row.get::<String>(10)?)?,
        last_run_at: parse_opt_datetime(row.get(11)?)?,
        run_count: row.get(12)?,
    })
}

fn read_schedule(row: &libsql::Row) -> Result<Schedule, StoreError> {
    let kind: String = row.get(3)?;
    let recurrence =
        recurrence_from_columns(&kind, row.get(4)?, row.get(5)?, row.get(6)?, row.get(7)?)?;
    Ok(Schedule {
        id: row.get(0)?,
        task_id: row.get(1)?,
        name: row.get(2)?,
        recurrence,
        active: row.get::<i64>(8)? != 0,
        retry_budget: row.get::<i64>(9)? as u32,
        retry_count: row.get::<i64>(10)? as u32,
        notify_on_success: row.get::<i64>(11)? != 0,
        notify_on_failure: row.get::<i64>(12)? != 0,
        created_at: parse_datetime(&row.get::<String>(13)?)?,
        next_fire_at: parse_opt_datetime(row.get(14)?)?,
    })
}

fn read_execution(row: &libsql::Row) -> Result<Execution, StoreError> {
    let status: String = row.get(3)?;
    let status = ExecStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown execution status '{status}'")))?;
    Ok(Execution {
        id: row.get(0)?,
        task_id: row.get(1)?,
        ran_at: parse_datetime(&row.get::<String>(2)?)?,
        status,
        return_code: row.get::<i64>(4)? as i32,
        duration: Duration::from_secs_f64(row.get::<f64>(5)?.max(0.0)),
        output: row.get(6)?,
        scheduled: row.get::<i64>(7)? != 0,
    })
}

fn read_alert(row: &libsql::Row) -> Result<Alert, StoreError> {
    let kind: String = row.get(1)?;
    let kind = AlertKind::parse(&kind)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown alert kind '{kind}'")))?;
    Ok(Alert {
        id: row.get(0)?,
        kind,
        title: row.get(2)?,
        message: row.get(3)?,
        task_id: row.get(4)?,
        schedule_id: row.get(5)?,
        created_at: parse_datetime(&row.get::<String>(6)?)?,
        resolved: row.get::<i64>(7)? != 0,
        resolved_at: parse_opt_datetime(row.get(8)?)?,
        channel: row.get(9)?,
        delivered: row.get::<i64>(10)? != 0,
    })
}

fn read_channel(row: &libsql::Row) -> Result<NotificationChannel, StoreError> {
    Ok(NotificationChannel {
        channel: row.get(0)?,
        enabled: row.get::<i64>(1)? != 0,
        settings: row.get(2)?,
        updated_at: parse_datetime(&row.get::<String>(3)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Priority;
    use chrono::NaiveDate;

    async fn store() -> Store {
        Store::open_in_memory(chrono_tz::UTC).await.unwrap()
    }

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_time(NaiveTime::from_hms_opt(h, mi, 0).unwrap())
    }

    fn local_task(title: &str) -> NewTask {
        NewTask {
            title: title.to_string(),
            description: "nightly maintenance".to_string(),
            priority: Priority::High,
            action: TaskAction::LocalCommand { command_path: "/opt/jobs/nightly.sh".to_string() },
        }
    }

    fn daily_schedule(task_id: i64, next: NaiveDateTime) -> NewSchedule {
        NewSchedule {
            task_id,
            name: "nightly".to_string(),
            recurrence: Recurrence::parse("daily 08:30").unwrap(),
            retry_budget: 3,
            notify_on_success: false,
            notify_on_failure: true,
            next_fire_at: Some(next),
        }
    }

    fn execution(task_id: i64, at: NaiveDateTime, status: ExecStatus) -> NewExecution {
        NewExecution {
            task_id,
            ran_at: at,
            status,
            return_code: if status == ExecStatus::Success { 0 } else { 1 },
            duration: Duration::from_millis(1500),
            output: "STDOUT:\nok\n\nSTDERR:\n".to_string(),
            scheduled: true,
        }
    }

    #[tokio::test]
    async fn task_round_trips_through_both_kinds() {
        let store = store().await;
        let local = store.create_task(local_task("backup")).await.unwrap();
        let fetched = store.task(local.id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "backup");
        assert_eq!(fetched.priority, Priority::High);
        assert_eq!(fetched.action, local.action);
        assert_eq!(fetched.run_count, 0);
        assert!(fetched.last_run_at.is_none());

        let transfer = store
            .create_task(NewTask {
                title: "ship report".to_string(),
                description: String::new(),
                priority: Priority::Medium,
                action: TaskAction::RemoteTransfer(TransferSpec {
                    source_path: "/data/report.csv".to_string(),
                    destination_node: "NODE_B".to_string(),
                    destination_path: "/inbox/report.csv".to_string(),
                    process_name: Some("REPORTS".to_string()),
                }),
            })
            .await
            .unwrap();
        let fetched = store.task(transfer.id).await.unwrap().unwrap();
        assert_eq!(fetched.action, transfer.action);
        assert_eq!(store.tasks().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn invalid_task_is_rejected_before_it_reaches_a_row() {
        let store = store().await;
        let res = store
            .create_task(NewTask {
                title: "broken".to_string(),
                description: String::new(),
                priority: Priority::Low,
                action: TaskAction::LocalCommand { command_path: "   ".to_string() },
            })
            .await;
        assert!(matches!(res, Err(StoreError::InvalidTask(_))));
        assert!(store.tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn schedule_round_trips_every_recurrence_kind() {
        let store = store().await;
        let task = store.create_task(local_task("multi")).await.unwrap();
        for expr in ["daily 08:30", "weekly mon,wed 08:30", "monthly 31 23:00", "once 2026-01-15 08:30"] {
            let rule = Recurrence::parse(expr).unwrap();
            let created = store
                .create_schedule(NewSchedule {
                    task_id: task.id,
                    name: expr.to_string(),
                    recurrence: rule.clone(),
                    retry_budget: 2,
                    notify_on_success: true,
                    notify_on_failure: true,
                    next_fire_at: Some(dt(2026, 1, 1, 8, 30)),
                })
                .await
                .unwrap();
            let fetched = store.schedule(created.id).await.unwrap().unwrap();
            assert_eq!(fetched.recurrence, rule);
            assert!(fetched.active);
            assert_eq!(fetched.retry_budget, 2);
            assert_eq!(fetched.next_fire_at, Some(dt(2026, 1, 1, 8, 30)));
        }
    }

    #[tokio::test]
    async fn schedule_for_missing_task_is_rejected() {
        let store = store().await;
        let res = store.create_schedule(daily_schedule(999, dt(2026, 1, 1, 8, 30))).await;
        assert!(matches!(res, Err(StoreError::TaskNotFound(999))));
    }

    #[tokio::test]
    async fn due_query_honors_flag_and_instant_and_orders_oldest_first() {
        let store = store().await;
        let task = store.create_task(local_task("due")).await.unwrap();
        let now = dt(2026, 1, 10, 12, 0);

        let late = store.create_schedule(daily_schedule(task.id, dt(2026, 1, 10, 9, 0))).await.unwrap();
        let later = store.create_schedule(daily_schedule(task.id, dt(2026, 1, 10, 7, 0))).await.unwrap();
        let future = store.create_schedule(daily_schedule(task.id, dt(2026, 1, 10, 13, 0))).await.unwrap();
        let disabled = store.create_schedule(daily_schedule(task.id, dt(2026, 1, 10, 6, 0))).await.unwrap();
        store.set_schedule_active(disabled.id, false, None).await.unwrap();

        let due = store.due_schedules(now).await.unwrap();
        let ids: Vec<i64> = due.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![later.id, late.id]);
        assert!(!ids.contains(&future.id));
    }

    #[tokio::test]
    async fn exactly_due_schedule_is_picked_up() {
        let store = store().await;
        let task = store.create_task(local_task("edge")).await.unwrap();
        let now = dt(2026, 1, 10, 8, 30);
        let sched = store.create_schedule(daily_schedule(task.id, now)).await.unwrap();
        let due = store.due_schedules(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, sched.id);
    }

    #[tokio::test]
    async fn apply_outcome_rewrites_cadence_counter_and_flag() {
        let store = store().await;
        let task = store.create_task(local_task("outcome")).await.unwrap();
        let sched = store.create_schedule(daily_schedule(task.id, dt(2026, 1, 10, 8, 30))).await.unwrap();

        store.apply_outcome(sched.id, Some(dt(2026, 1, 10, 8, 35)), 2, true).await.unwrap();
        let fetched = store.schedule(sched.id).await.unwrap().unwrap();
        assert_eq!(fetched.next_fire_at, Some(dt(2026, 1, 10, 8, 35)));
        assert_eq!(fetched.retry_count, 2);
        assert!(fetched.active);

        store.apply_outcome(sched.id, None, 0, false).await.unwrap();
        let fetched = store.schedule(sched.id).await.unwrap().unwrap();
        assert_eq!(fetched.next_fire_at, None);
        assert_eq!(fetched.retry_count, 0);
        assert!(!fetched.active);

        assert!(matches!(
            store.apply_outcome(9999, None, 0, false).await,
            Err(StoreError::ScheduleNotFound(9999))
        ));
    }

    #[tokio::test]
    async fn updates_rewrite_rows_in_place() {
        let store = store().await;
        let mut task = store.create_task(local_task("rename me")).await.unwrap();
        task.title = "renamed".to_string();
        task.priority = Priority::Low;
        task.action = TaskAction::LocalCommand { command_path: "/opt/jobs/other.sh".to_string() };
        store.update_task(&task).await.unwrap();
        let fetched = store.task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "renamed");
        assert_eq!(fetched.priority, Priority::Low);
        assert_eq!(fetched.action, task.action);

        let mut sched =
            store.create_schedule(daily_schedule(task.id, dt(2026, 1, 10, 8, 30))).await.unwrap();
        sched.recurrence = Recurrence::parse("weekly fri 17:00").unwrap();
        sched.retry_budget = 5;
        store.update_schedule(&sched).await.unwrap();
        let fetched = store.schedule(sched.id).await.unwrap().unwrap();
        assert_eq!(fetched.recurrence, sched.recurrence);
        assert_eq!(fetched.retry_budget, 5);

        let ghost = Task { id: 9999, ..task };
        assert!(matches!(store.update_task(&ghost).await, Err(StoreError::TaskNotFound(9999))));
    }

    #[tokio::test]
    async fn reenabling_resets_the_retry_counter() {
        let store = store().await;
        let task = store.create_task(local_task("flaky")).await.unwrap();
        let sched =
            store.create_schedule(daily_schedule(task.id, dt(2026, 1, 10, 8, 30))).await.unwrap();
        store.apply_outcome(sched.id, Some(dt(2026, 1, 10, 8, 35)), 2, true).await.unwrap();

        store.set_schedule_active(sched.id, false, None).await.unwrap();
        let fetched = store.schedule(sched.id).await.unwrap().unwrap();
        assert!(!fetched.active);
        assert_eq!(fetched.retry_count, 0);
        assert_eq!(fetched.next_fire_at, None);

        store.set_schedule_active(sched.id, true, Some(dt(2026, 1, 11, 8, 30))).await.unwrap();
        let fetched = store.schedule(sched.id).await.unwrap().unwrap();
        assert!(fetched.active);
        assert_eq!(fetched.next_fire_at, Some(dt(2026, 1, 11, 8, 30)));
    }

    #[tokio::test]
    async fn recording_an_execution_bumps_task_bookkeeping() {
        let store = store().await;
        let task = store.create_task(local_task("bump")).await.unwrap();

        let first = dt(2026, 1, 10, 8, 30);
        store.record_execution(execution(task.id, first, ExecStatus::Failure)).await.unwrap();
        let fetched = store.task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.run_count, 1);
        assert_eq!(fetched.last_run_at, Some(first));

        let second = dt(2026, 1, 11, 8, 30);
        store.record_execution(execution(task.id, second, ExecStatus::Success)).await.unwrap();
        let fetched = store.task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.run_count, 2);
        assert_eq!(fetched.last_run_at, Some(second));

        let history = store.executions_for_task(task.id, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].ran_at, second);
        assert_eq!(history[0].status, ExecStatus::Success);
        assert_eq!(history[1].status, ExecStatus::Failure);
    }

    #[tokio::test]
    async fn deleting_a_task_cascades_to_dependents() {
        let store = store().await;
        let task = store.create_task(local_task("cascade")).await.unwrap();
        let sched = store.create_schedule(daily_schedule(task.id, dt(2026, 1, 10, 8, 30))).await.unwrap();
        store.record_execution(execution(task.id, dt(2026, 1, 10, 8, 30), ExecStatus::Success)).await.unwrap();
        store
            .create_alert(NewAlert {
                kind: AlertKind::Error,
                title: "Task failed: cascade".to_string(),
                message: String::new(),
                task_id: Some(task.id),
                schedule_id: Some(sched.id),
            })
            .await
            .unwrap();

        assert!(store.delete_task(task.id).await.unwrap());
        assert!(store.task(task.id).await.unwrap().is_none());
        assert!(store.schedule(sched.id).await.unwrap().is_none());
        assert!(store.executions_for_task(task.id, 10).await.unwrap().is_empty());
        assert!(store.alerts(false).await.unwrap().is_empty());
        assert!(!store.delete_task(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn alert_lifecycle_resolve_and_clear() {
        let store = store().await;
        let alert = store
            .create_alert(NewAlert {
                kind: AlertKind::Timeout,
                title: "Task timed out: slow".to_string(),
                message: "300 s ceiling".to_string(),
                task_id: None,
                schedule_id: None,
            })
            .await
            .unwrap();
        assert!(!alert.resolved);
        assert_eq!(store.alerts(true).await.unwrap().len(), 1);

        assert!(store.resolve_alert(alert.id).await.unwrap());
        assert!(!store.resolve_alert(alert.id).await.unwrap());
        assert!(store.alerts(true).await.unwrap().is_empty());
        let all = store.alerts(false).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].resolved);
        assert!(all[0].resolved_at.is_some());

        assert_eq!(store.clear_resolved_alerts().await.unwrap(), 1);
        assert!(store.alerts(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delivery_marking_records_the_channel() {
        let store = store().await;
        let alert = store
            .create_alert(NewAlert {
                kind: AlertKind::Error,
                title: "Task failed: x".to_string(),
                message: String::new(),
                task_id: None,
                schedule_id: None,
            })
            .await
            .unwrap();
        store.mark_alert_delivered(alert.id, "email").await.unwrap();
        let all = store.alerts(false).await.unwrap();
        assert!(all[0].delivered);
        assert_eq!(all[0].channel.as_deref(), Some("email"));
    }

    #[tokio::test]
    async fn unresolved_counts_group_by_kind() {
        let store = store().await;
        for kind in [AlertKind::Error, AlertKind::Error, AlertKind::Timeout] {
            store
                .create_alert(NewAlert {
                    kind,
                    title: "x".to_string(),
                    message: String::new(),
                    task_id: None,
                    schedule_id: None,
                })
                .await
                .unwrap();
        }
        let counts = store.unresolved_alert_counts().await.unwrap();
        assert!(counts.contains(&(AlertKind::Error, 2)));
        assert!(counts.contains(&(AlertKind::Timeout, 1)));
    }

    #[tokio::test]
    async fn channel_upsert_enable_round_trip() {
        let store = store().await;
        store.upsert_channel("email", false, "{\"smtp_server\":\"mail\"}").await.unwrap();
        assert!(store.enabled_channel("email").await.unwrap().is_none());
        assert!(store.channel("email").await.unwrap().is_some());

        assert!(store.set_channel_enabled("email", true).await.unwrap());
        let ch = store.enabled_channel("email").await.unwrap().unwrap();
        assert_eq!(ch.settings, "{\"smtp_server\":\"mail\"}");

        store.upsert_channel("email", true, "{\"smtp_server\":\"mail2\"}").await.unwrap();
        let ch = store.enabled_channel("email").await.unwrap().unwrap();
        assert_eq!(ch.settings, "{\"smtp_server\":\"mail2\"}");

        assert!(!store.set_channel_enabled("slack", true).await.unwrap());
    }

    #[tokio::test]
    async fn dashboard_stats_summarize_the_world() {
        let store = store().await;
        let empty = store.dashboard_stats(dt(2026, 1, 10, 12, 0)).await.unwrap();
        assert_eq!(empty.total_tasks, 0);
        assert!(empty.success_rate.is_none());
        assert!(empty.last_execution_at.is_none());

        let task = store.create_task(local_task("stats")).await.unwrap();
        store.create_schedule(daily_schedule(task.id, dt(2026, 1, 10, 8, 30))).await.unwrap();
        store.record_execution(execution(task.id, dt(2026, 1, 9, 8, 30), ExecStatus::Failure)).await.unwrap();
        store.record_execution(execution(task.id, dt(2026, 1, 10, 8, 30), ExecStatus::Success)).await.unwrap();
        store
            .create_alert(NewAlert {
                kind: AlertKind::Error,
                title: "x".to_string(),
                message: String::new(),
                task_id: Some(task.id),
                schedule_id: None,
            })
            .await
            .unwrap();

        let stats = store.dashboard_stats(dt(2026, 1, 10, 12, 0)).await.unwrap();
        assert_eq!(stats.total_tasks, 1);
        assert_eq!(stats.active_schedules, 1);
        assert_eq!(stats.executions_today, 1);
        assert_eq!(stats.unresolved_alerts, 1);
        assert_eq!(stats.success_rate, Some(0.5));
        assert_eq!(stats.last_execution_at, Some(dt(2026, 1, 10, 8, 30)));
    }
}
