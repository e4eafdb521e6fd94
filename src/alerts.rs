use anyhow::Result;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use crate::model::{Alert, AlertKind, ExecStatus, Execution, NewAlert, Schedule, Task};
use crate::store::{Store, StoreError};
use crate::utils::{format_duration, truncate};

pub const EMAIL_CHANNEL: &str = "email";

/// How much of the captured output is embedded in an alert message. The
/// execution row keeps the full text.
const OUTPUT_PREVIEW_LIMIT: usize = 200;

const DEFAULT_SUBJECT: &str = "[taskmill] {{ alert_title }}";

const DEFAULT_BODY: &str = "\
{{ alert_title }}

{{ alert_message }}

Task: {{ task_title }}
Status: {{ status }}
Return code: {{ return_code }}
Duration: {{ duration }}
Ran at: {{ ran_at }}

This is an automated notification, do not reply.";

/// Stored as the JSON settings blob of the email channel row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSettings {
    pub smtp_server: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_smtp_port() -> u16 {
    587
}

/// Failures and timeouts always go out. Success goes out only when the
/// schedule asked for it, so manual successes stay store-only.
pub fn should_deliver(status: ExecStatus, schedule: Option<&Schedule>) -> bool {
    match status {
        ExecStatus::Failure | ExecStatus::Timeout => true,
        ExecStatus::Success => schedule.map_or(false, |s| s.notify_on_success),
    }
}

/// Records the outcome of a finished attempt as an alert row and pushes
/// it through the notification channel when the delivery rules say so.
/// The row is written even when nothing is delivered.
pub async fn on_outcome(
    store: &Store,
    task: &Task,
    schedule: Option<&Schedule>,
    execution: &Execution,
    exhausted: bool,
) -> Result<Alert, StoreError> {
    let kind = AlertKind::from_status(execution.status);
    let (title, mut message) = match execution.status {
        ExecStatus::Success => (
            format!("Task completed: {}", task.title),
            format!(
                "Finished in {} with return code {}",
                format_duration(execution.duration),
                execution.return_code
            ),
        ),
        ExecStatus::Failure => (
            format!("Task failed: {}", task.title),
            format!(
                "Return code {}\n{}",
                execution.return_code,
                truncate(&execution.output, OUTPUT_PREVIEW_LIMIT)
            ),
        ),
        ExecStatus::Timeout => (
            format!("Task timed out: {}", task.title),
            format!(
                "Return code {}\n{}",
                execution.return_code,
                truncate(&execution.output, OUTPUT_PREVIEW_LIMIT)
            ),
        ),
    };
    if let Some(schedule) = schedule {
        message.push_str(&format!("\nSchedule: {}", schedule.name));
        if exhausted {
            message.push_str(&format!(
                "\nGiving up after {} attempts (retry budget {})",
                schedule.retry_budget + 1,
                schedule.retry_budget
            ));
        }
    }

    let mut alert = store
        .create_alert(NewAlert {
            kind,
            title,
            message,
            task_id: Some(task.id),
            schedule_id: schedule.map(|s| s.id),
        })
        .await?;

    if should_deliver(execution.status, schedule)
        && deliver(store, &alert, Some(task), Some(execution)).await?
    {
        alert.delivered = true;
        alert.channel = Some(EMAIL_CHANNEL.to_string());
    }
    Ok(alert)
}

/// Exercises the whole pipeline with a synthetic alert, delivery included.
pub async fn send_test_notification(store: &Store) -> Result<Alert, StoreError> {
    let mut alert = store
        .create_alert(NewAlert {
            kind: AlertKind::Test,
            title: "Notification test".to_string(),
            message: "This is a test of the alert and notification pipeline.".to_string(),
            task_id: None,
            schedule_id: None,
        })
        .await?;
    if deliver(store, &alert, None, None).await? {
        alert.delivered = true;
        alert.channel = Some(EMAIL_CHANNEL.to_string());
    }
    Ok(alert)
}

/// Returns whether the alert actually went out. A missing channel or a
/// refused send is not an error, the alert simply stays undelivered.
async fn deliver(
    store: &Store,
    alert: &Alert,
    task: Option<&Task>,
    execution: Option<&Execution>,
) -> Result<bool, StoreError> {
    let Some(channel) = store.enabled_channel(EMAIL_CHANNEL).await? else {
        debug!("No enabled notification channel, alert {} stays store-only", alert.id);
        return Ok(false);
    };
    let settings: EmailSettings = match serde_json::from_str(&channel.settings) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Malformed email channel settings: {}", e);
            return Ok(false);
        }
    };
    match send_email(&settings, alert, task, execution) {
        Ok(()) => {
            store.mark_alert_delivered(alert.id, EMAIL_CHANNEL).await?;
            info!("Alert {} delivered via email to {}", alert.id, settings.to);
            Ok(true)
        }
        Err(e) => {
            error!("Failed to deliver alert {} via email: {:#}", alert.id, e);
            Ok(false)
        }
    }
}

fn send_email(
    settings: &EmailSettings,
    alert: &Alert,
    task: Option<&Task>,
    execution: Option<&Execution>,
) -> Result<()> {
    let subject = settings.subject.clone().unwrap_or_else(|| DEFAULT_SUBJECT.to_string());
    let body = settings.body.clone().unwrap_or_else(|| DEFAULT_BODY.to_string());

    let email = Message::builder()
        .from(settings.from.parse()?)
        .to(settings.to.parse()?)
        .subject(template_replace(&subject, alert, task, execution))
        .body(template_replace(&body, alert, task, execution))?;

    let mailer = if settings.smtp_server == "localhost" || settings.smtp_port == 25 {
        SmtpTransport::builder_dangerous(settings.smtp_server.clone()).port(settings.smtp_port)
    } else {
        SmtpTransport::starttls_relay(&settings.smtp_server)?.port(settings.smtp_port)
    };
    let mailer = if let (Some(username), Some(password)) = (&settings.username, &settings.password)
    {
        mailer.credentials(Credentials::new(username.clone(), password.clone()))
    } else {
        mailer
    };

    mailer.build().send(&email)?;
    Ok(())
}

fn template_replace(
    template: &str,
    alert: &Alert,
    task: Option<&Task>,
    execution: Option<&Execution>,
) -> String {
    let mut result = template.to_string();
    result = result.replace("{{ alert_title }}", &alert.title);
    result = result.replace("{{ alert_message }}", &alert.message);
    result = result.replace("{{ kind }}", alert.kind.as_str());
    result = result.replace("{{ task_title }}", task.map_or("-", |t| t.title.as_str()));
    match execution {
        Some(ex) => {
            result = result.replace("{{ status }}", ex.status.as_str());
            result = result.replace("{{ return_code }}", &ex.return_code.to_string());
            result = result.replace("{{ duration }}", &format_duration(ex.duration));
            result =
                result.replace("{{ ran_at }}", &ex.ran_at.format("%Y-%m-%d %H:%M:%S").to_string());
            result = result.replace("{{ output }}", ex.output.trim());
        }
        None => {
            result = result.replace("{{ status }}", alert.kind.as_str());
            result = result.replace("{{ return_code }}", "-");
            result = result.replace("{{ duration }}", "-");
            result = result
                .replace("{{ ran_at }}", &alert.created_at.format("%Y-%m-%d %H:%M:%S").to_string());
            result = result.replace("{{ output }}", "");
        }
    }
    result
}
