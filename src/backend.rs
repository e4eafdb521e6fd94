use log::{info, warn};
use reqwest::Client;
use serde_json::json;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::process::Command;

use crate::config::TransferApiConfig;
use crate::model::{ExecStatus, Task, TransferSpec};

/// Hard ceiling on a local command run. The process is killed when it is
/// reached and the attempt is recorded as a timeout.
pub const LOCAL_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Ceiling on the transfer submission round trip. Hitting it is an
/// ordinary failure, not a timeout, since nothing was killed.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

/// Name reported to the transfer service as the requesting application.
pub const ORIGIN_APP: &str = "taskmill";

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ExecStatus,
    pub return_code: i32,
    pub duration: Duration,
    pub output: String,
}

impl ExecutionOutcome {
    pub fn failed_to_start(output: String) -> Self {
        ExecutionOutcome {
            status: ExecStatus::Failure,
            return_code: -1,
            duration: Duration::ZERO,
            output,
        }
    }
}

/// Runs the executable at `command_path` with its own directory as the
/// working directory, capturing both output streams.
pub async fn run_local_command(command_path: &str, limit: Duration) -> ExecutionOutcome {
    let started = Instant::now();
    let path = Path::new(command_path);
    if command_path.trim().is_empty() || !path.exists() {
        return ExecutionOutcome {
            status: ExecStatus::Failure,
            return_code: -1,
            duration: started.elapsed(),
            output: format!("Command file does not exist: {command_path}"),
        };
    }

    let mut cmd = Command::new(command_path);
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        cmd.current_dir(dir);
    }
    cmd.kill_on_drop(true);

    match tokio::time::timeout(limit, cmd.output()).await {
        Ok(Ok(out)) => {
            let return_code = out.status.code().unwrap_or(-1);
            let status = if out.status.success() {
                ExecStatus::Success
            } else {
                ExecStatus::Failure
            };
            let output = format!(
                "STDOUT:\n{}\n\nSTDERR:\n{}",
                String::from_utf8_lossy(&out.stdout),
                String::from_utf8_lossy(&out.stderr)
            );
            ExecutionOutcome { status, return_code, duration: started.elapsed(), output }
        }
        Ok(Err(e)) => ExecutionOutcome {
            status: ExecStatus::Failure,
            return_code: -1,
            duration: started.elapsed(),
            output: format!("Failed to start command: {e}"),
        },
        Err(_) => {
            warn!(
                "Command '{}' exceeded time limit of {} seconds, sending SIGKILL",
                command_path,
                limit.as_secs()
            );
            ExecutionOutcome {
                status: ExecStatus::Timeout,
                return_code: -1,
                duration: started.elapsed(),
                output: format!(
                    "Execution exceeded the {} second time limit and was killed",
                    limit.as_secs()
                ),
            }
        }
    }
}

pub fn transfer_payload(
    api: &TransferApiConfig,
    task: &Task,
    spec: &TransferSpec,
) -> serde_json::Value {
    let mut payload = json!({
        "source": {
            "node": api.local_node,
            "path": spec.source_path,
            "fileFormat": "BINARY",
        },
        "destination": {
            "node": spec.destination_node,
            "path": spec.destination_path,
            "fileFormat": "BINARY",
        },
        "metadata": {
            "originApp": ORIGIN_APP,
            "taskId": task.id,
            "taskTitle": task.title,
        },
        "options": {
            "overwrite": true,
            "compress": false,
        },
    });
    if let Some(process) = &spec.process_name {
        payload["processName"] = json!(process);
    }
    payload
}

/// Submits a transfer order and reports how the service answered. A 2xx
/// answer means the order was accepted, nothing more.
pub async fn submit_transfer(
    http: &Client,
    api: &TransferApiConfig,
    task: &Task,
    spec: &TransferSpec,
) -> ExecutionOutcome {
    let started = Instant::now();
    let url = format!("{}/filetransfers", api.base_url.trim_end_matches('/'));
    let payload = transfer_payload(api, task, spec);

    info!("Submitting transfer order for task '{}' to {}", task.title, url);
    let response = http
        .post(&url)
        .basic_auth(&api.username, Some(&api.password))
        .json(&payload)
        .timeout(TRANSFER_TIMEOUT)
        .send()
        .await;

    match response {
        Ok(resp) => {
            let code = resp.status();
            let body = resp
                .text()
                .await
                .unwrap_or_else(|e| format!("<unreadable response body: {e}>"));
            if code.is_success() {
                ExecutionOutcome {
                    status: ExecStatus::Success,
                    return_code: 0,
                    duration: started.elapsed(),
                    output: body,
                }
            } else {
                ExecutionOutcome {
                    status: ExecStatus::Failure,
                    return_code: i32::from(code.as_u16()),
                    duration: started.elapsed(),
                    output: format!("Transfer request rejected with HTTP {}\n{}", code.as_u16(), body),
                }
            }
        }
        Err(e) if e.is_timeout() => ExecutionOutcome {
            status: ExecStatus::Failure,
            return_code: -1,
            duration: started.elapsed(),
            output: format!(
                "Transfer request timed out after {} seconds: {e}",
                TRANSFER_TIMEOUT.as_secs()
            ),
        },
        Err(e) => ExecutionOutcome {
            status: ExecStatus::Failure,
            return_code: -1,
            duration: started.elapsed(),
            output: format!("Transfer request failed: {e}"),
        },
    }
}
