use log::{error, info};
use reqwest::Client;
use std::time::Instant;

use crate::backend::{self, ExecutionOutcome, LOCAL_COMMAND_TIMEOUT};
use crate::config::TransferApiConfig;
use crate::model::{ExecStatus, Execution, NewExecution, Task, TaskAction, Trigger};
use crate::store::{Store, StoreError};
use crate::utils::format_duration;

/// Runs a task through its backend and writes the paper trail. Every
/// attempt leaves an execution row and bumps the task's run bookkeeping,
/// whatever the outcome was.
pub struct Dispatcher {
    store: Store,
    transfer: Option<TransferApiConfig>,
    http: Client,
}

impl Dispatcher {
    pub fn new(store: Store, transfer: Option<TransferApiConfig>) -> Self {
        Dispatcher { store, transfer, http: Client::new() }
    }

    pub async fn dispatch(&self, task: &Task, trigger: Trigger) -> Result<Execution, StoreError> {
        let ran_at = self.store.now();
        let clock = Instant::now();
        info!("Running task '{}' ({})", task.title, task.action.kind());

        let outcome = match &task.action {
            TaskAction::LocalCommand { command_path } => {
                backend::run_local_command(command_path, LOCAL_COMMAND_TIMEOUT).await
            }
            TaskAction::RemoteTransfer(spec) => match &self.transfer {
                Some(api) => backend::submit_transfer(&self.http, api, task, spec).await,
                None => ExecutionOutcome::failed_to_start(
                    "Transfer API is not configured, add a transfer_api section to the config"
                        .to_string(),
                ),
            },
        };

        // Wall clock measured here, not taken from the backend.
        let duration = clock.elapsed();
        let execution = self
            .store
            .record_execution(NewExecution {
                task_id: task.id,
                ran_at,
                status: outcome.status,
                return_code: outcome.return_code,
                duration,
                output: outcome.output,
                scheduled: trigger == Trigger::Scheduler,
            })
            .await?;

        match execution.status {
            ExecStatus::Success => info!(
                "Task '{}' finished with code {}, elapsed {}",
                task.title,
                execution.return_code,
                format_duration(duration)
            ),
            ExecStatus::Failure => error!(
                "Task '{}' failed with code {}, elapsed {}",
                task.title,
                execution.return_code,
                format_duration(duration)
            ),
            ExecStatus::Timeout => {
                error!("Task '{}' was killed after exceeding its time limit", task.title)
            }
        }

        Ok(execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewTask, Priority, TransferSpec};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(name: &str, body: &str) -> String {
        let dir = std::env::temp_dir().join(format!("taskmill-dispatch-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().into_owned()
    }

    async fn store() -> Store {
        Store::open_in_memory(chrono_tz::UTC).await.unwrap()
    }

    async fn command_task(store: &Store, name: &str, script: &str) -> Task {
        store
            .create_task(NewTask {
                title: name.to_string(),
                description: String::new(),
                priority: Priority::Medium,
                action: TaskAction::LocalCommand { command_path: script.to_string() },
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn success_leaves_a_row_and_bumps_the_task() {
        let store = store().await;
        let script = write_script("ok.sh", "#!/bin/sh\necho done\nexit 0\n");
        let task = command_task(&store, "ok", &script).await;
        let dispatcher = Dispatcher::new(store.clone(), None);

        let execution = dispatcher.dispatch(&task, Trigger::Scheduler).await.unwrap();
        assert_eq!(execution.status, ExecStatus::Success);
        assert_eq!(execution.return_code, 0);
        assert!(execution.scheduled);
        assert!(execution.output.contains("done"));

        let task = store.task(task.id).await.unwrap().unwrap();
        assert_eq!(task.run_count, 1);
        assert!(task.last_run_at.is_some());
    }

    #[tokio::test]
    async fn failure_is_recorded_exactly_like_success() {
        let store = store().await;
        let script = write_script("bad.sh", "#!/bin/sh\necho oops >&2\nexit 2\n");
        let task = command_task(&store, "bad", &script).await;
        let dispatcher = Dispatcher::new(store.clone(), None);

        let execution = dispatcher.dispatch(&task, Trigger::Manual).await.unwrap();
        assert_eq!(execution.status, ExecStatus::Failure);
        assert_eq!(execution.return_code, 2);
        assert!(!execution.scheduled);

        let task = store.task(task.id).await.unwrap().unwrap();
        assert_eq!(task.run_count, 1);
        let history = store.executions_for_task(task.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].output.contains("oops"));
    }

    #[tokio::test]
    async fn transfer_without_api_config_fails_cleanly() {
        let store = store().await;
        let task = store
            .create_task(NewTask {
                title: "ship".to_string(),
                description: String::new(),
                priority: Priority::Low,
                action: TaskAction::RemoteTransfer(TransferSpec {
                    source_path: "/data/a".to_string(),
                    destination_node: "NODE_B".to_string(),
                    destination_path: "/inbox/a".to_string(),
                    process_name: None,
                }),
            })
            .await
            .unwrap();
        let dispatcher = Dispatcher::new(store.clone(), None);

        let execution = dispatcher.dispatch(&task, Trigger::Scheduler).await.unwrap();
        assert_eq!(execution.status, ExecStatus::Failure);
        assert_eq!(execution.return_code, -1);
        assert!(execution.output.contains("not configured"));
        assert_eq!(store.task(task.id).await.unwrap().unwrap().run_count, 1);
    }

    #[tokio::test]
    async fn configured_transfer_goes_over_the_wire() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/filetransfers")
            .with_status(200)
            .with_body("queued")
            .create_async()
            .await;

        let store = store().await;
        let task = store
            .create_task(NewTask {
                title: "ship".to_string(),
                description: String::new(),
                priority: Priority::High,
                action: TaskAction::RemoteTransfer(TransferSpec {
                    source_path: "/data/a".to_string(),
                    destination_node: "NODE_B".to_string(),
                    destination_path: "/inbox/a".to_string(),
                    process_name: None,
                }),
            })
            .await
            .unwrap();
        let api = TransferApiConfig {
            base_url: server.url(),
            username: "svc".to_string(),
            password: "secret".to_string(),
            local_node: "NODE_A".to_string(),
        };
        let dispatcher = Dispatcher::new(store.clone(), Some(api));

        let execution = dispatcher.dispatch(&task, Trigger::Scheduler).await.unwrap();
        assert_eq!(execution.status, ExecStatus::Success);
        assert_eq!(execution.output, "queued");
    }
}
