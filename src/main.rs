mod alerts;
mod backend;
mod config;
mod dispatcher;
mod logging;
mod model;
mod recurrence;
mod retry;
mod scheduler;
mod store;
mod utils;

use anyhow::{anyhow, bail, Result};
use chrono::NaiveDateTime;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::path::PathBuf;

use alerts::EmailSettings;
use config::file::{read_config_file, ConfigFile};
use config::validation::{validate_config, ValidationResult};
use config::{parse_config_file, Config};
use dispatcher::Dispatcher;
use model::{ExecStatus, NewSchedule, NewTask, Priority, TaskAction, TransferSpec, Trigger};
use recurrence::Recurrence;
use scheduler::Scheduler;
use store::Store;
use utils::format_duration;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the config file
    #[arg(short, long)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler until interrupted
    Serve {
        /// Print the config validation report and exit
        #[arg(long)]
        validate: bool,
    },
    /// Manage tasks
    #[command(subcommand)]
    Task(TaskCommand),
    /// Manage schedules
    #[command(subcommand)]
    Schedule(ScheduleCommand),
    /// Run a task right now, outside its schedule
    Run {
        task_id: i64,
    },
    /// Show recent executions
    History {
        /// Only show runs of this task
        task_id: Option<i64>,
        #[arg(short, long, default_value_t = 20)]
        limit: i64,
    },
    /// Manage alerts
    #[command(subcommand)]
    Alerts(AlertCommand),
    /// Notification delivery
    #[command(subcommand)]
    Notify(NotifyCommand),
    /// Manage notification channels
    #[command(subcommand)]
    Channel(ChannelCommand),
    /// Dashboard summary numbers
    Stats,
}

#[derive(Subcommand, Debug)]
enum TaskCommand {
    /// Create a task
    Add {
        /// Name shown in listings and alerts
        title: String,
        #[arg(short, long, default_value = "")]
        description: String,
        /// low, medium or high
        #[arg(short, long, default_value = "medium")]
        priority: String,
        /// Path of the command to run locally
        #[arg(long)]
        command: Option<String>,
        /// Transfer source path
        #[arg(long)]
        source: Option<String>,
        /// Transfer destination node
        #[arg(long)]
        node: Option<String>,
        /// Transfer destination path
        #[arg(long)]
        dest: Option<String>,
        /// Transfer process name
        #[arg(long)]
        process: Option<String>,
    },
    /// List tasks
    List,
    /// Show one task with its schedules and recent runs
    Show { task_id: i64 },
    /// Delete a task, its schedules, executions and alerts
    Remove { task_id: i64 },
}

#[derive(Subcommand, Debug)]
enum ScheduleCommand {
    /// Attach a recurrence to a task
    Add {
        task_id: i64,
        /// Recurrence expression: "daily 08:30", "weekly mon,fri 07:00",
        /// "monthly 31 23:00" or "once 2026-12-01 09:00"
        expression: String,
        /// Name shown in listings, defaults to the expression
        #[arg(short, long)]
        name: Option<String>,
        /// Extra attempts after a failed run
        #[arg(long, default_value_t = 3)]
        retry_budget: u32,
        /// Also notify when the task succeeds
        #[arg(long)]
        notify_on_success: bool,
        /// Do not request notifications for failed runs
        #[arg(long)]
        no_notify_on_failure: bool,
    },
    /// List schedules
    List,
    /// Delete a schedule
    Remove { schedule_id: i64 },
    /// Resume a paused schedule and recompute its next run
    Enable { schedule_id: i64 },
    /// Pause a schedule
    Disable { schedule_id: i64 },
}

#[derive(Subcommand, Debug)]
enum AlertCommand {
    /// List alerts
    List {
        /// Include resolved alerts
        #[arg(long)]
        all: bool,
    },
    /// Mark an alert as resolved
    Resolve { alert_id: i64 },
    /// Delete all resolved alerts
    ClearResolved,
}

#[derive(Subcommand, Debug)]
enum NotifyCommand {
    /// Push a test alert through the notification pipeline
    Test,
}

#[derive(Subcommand, Debug)]
enum ChannelCommand {
    /// Store e-mail delivery settings and enable the channel
    SetEmail {
        #[arg(long)]
        smtp_server: String,
        #[arg(long, default_value_t = 587)]
        smtp_port: u16,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
    /// Turn a channel on
    Enable { channel: String },
    /// Turn a channel off
    Disable { channel: String },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config_file = read_config_file(&args.config)?;
    let config = parse_config_file(&config_file)?;

    logging::setup_logging(&config.logging)?;

    let runtime = tokio::runtime::Runtime::new()?;
    let code = runtime.block_on(run(args.command, &config_file, config))?;
    drop(runtime);

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn run(command: Command, config_file: &ConfigFile, config: Config) -> Result<i32> {
    if let Command::Serve { validate } = &command {
        let results = validate_config(config_file);
        for msg in &results {
            match msg {
                ValidationResult::Error(m) => error!("{}", m),
                ValidationResult::Warning(m) => warn!("{}", m),
            }
        }
        let has_errors =
            results.iter().any(|r| matches!(r, ValidationResult::Error(_)));
        if *validate {
            if results.is_empty() {
                info!("Config file is valid");
            }
            return Ok(i32::from(has_errors));
        }
        if has_errors {
            bail!("Config validation failed, fix the errors above");
        }
    }

    let store = Store::open(&config.database, config.timezone).await?;

    match command {
        Command::Serve { .. } => {
            info!("Starting taskmill against {}", config.database.display());
            let dispatcher = Dispatcher::new(store.clone(), config.transfer_api.clone());
            let handle =
                Scheduler::new(store.clone(), dispatcher, config.poll_interval).start();

            tokio::signal::ctrl_c().await?;
            info!("Received Ctrl-C");
            handle.stop().await;
            info!("Exiting");
        }
        Command::Task(command) => return run_task_command(&store, command).await,
        Command::Schedule(command) => return run_schedule_command(&store, command).await,
        Command::Run { task_id } => {
            let task = store
                .task(task_id)
                .await?
                .ok_or_else(|| anyhow!("No task with id {}", task_id))?;
            let dispatcher = Dispatcher::new(store.clone(), config.transfer_api.clone());
            let execution = dispatcher.dispatch(&task, Trigger::Manual).await?;
            alerts::on_outcome(&store, &task, None, &execution, false).await?;

            println!(
                "{} ({}) in {}",
                execution.status,
                execution.return_code,
                format_duration(execution.duration)
            );
            if !execution.output.trim().is_empty() {
                println!("{}", execution.output.trim_end());
            }
            return Ok(i32::from(execution.status != ExecStatus::Success));
        }
        Command::History { task_id, limit } => {
            let executions = match task_id {
                Some(id) => store.executions_for_task(id, limit).await?,
                None => store.recent_executions(limit).await?,
            };
            if executions.is_empty() {
                println!("No executions recorded");
            }
            for ex in executions {
                println!(
                    "{}  task {:<4} {:<8} ({:>4}) {:>12}  {}",
                    fmt_time(ex.ran_at),
                    ex.task_id,
                    ex.status.to_string(),
                    ex.return_code,
                    format_duration(ex.duration),
                    if ex.scheduled { "scheduled" } else { "manual" },
                );
            }
        }
        Command::Alerts(command) => return run_alert_command(&store, command).await,
        Command::Notify(NotifyCommand::Test) => {
            let alert = alerts::send_test_notification(&store).await?;
            if alert.delivered {
                println!(
                    "Test alert {} delivered via {}",
                    alert.id,
                    alert.channel.as_deref().unwrap_or("?")
                );
            } else {
                println!(
                    "Test alert {} stored, not delivered (no enabled channel or delivery failed)",
                    alert.id
                );
            }
        }
        Command::Channel(command) => return run_channel_command(&store, command).await,
        Command::Stats => {
            let stats = store.dashboard_stats(store.now()).await?;
            println!("Tasks:             {}", stats.total_tasks);
            println!("Active schedules:  {}", stats.active_schedules);
            println!("Executions today:  {}", stats.executions_today);
            println!("Unresolved alerts: {}", stats.unresolved_alerts);
            let counts = store.unresolved_alert_counts().await?;
            if !counts.is_empty() {
                let parts: Vec<String> =
                    counts.iter().map(|(kind, n)| format!("{} {}", n, kind.as_str())).collect();
                println!("  by kind:         {}", parts.join(", "));
            }
            match stats.success_rate {
                Some(rate) => println!("Success rate:      {:.1}%", rate * 100.0),
                None => println!("Success rate:      n/a"),
            }
            println!("Last execution:    {}", fmt_opt_time(stats.last_execution_at));
        }
    }

    Ok(0)
}

async fn run_task_command(store: &Store, command: TaskCommand) -> Result<i32> {
    match command {
        TaskCommand::Add { title, description, priority, command, source, node, dest, process } => {
            let priority: Priority = priority.parse().map_err(anyhow::Error::msg)?;
            let action = match (command, source) {
                (Some(command_path), None) => TaskAction::LocalCommand { command_path },
                (None, Some(source_path)) => TaskAction::RemoteTransfer(TransferSpec {
                    source_path,
                    destination_node: node.unwrap_or_default(),
                    destination_path: dest.unwrap_or_default(),
                    process_name: process,
                }),
                (Some(_), Some(_)) => bail!("--command and --source are mutually exclusive"),
                (None, None) => bail!(
                    "Specify --command for a local task or --source/--node/--dest for a transfer"
                ),
            };
            let task = store.create_task(NewTask { title, description, priority, action }).await?;
            println!("Created task {} '{}'", task.id, task.title);
        }
        TaskCommand::List => {
            let tasks = store.tasks().await?;
            if tasks.is_empty() {
                println!("No tasks");
            }
            for task in tasks {
                println!(
                    "{:>4}  {:<24} {:<8} {:<16} runs {:<5} last {}",
                    task.id,
                    task.title,
                    task.priority.to_string(),
                    task.action.kind(),
                    task.run_count,
                    fmt_opt_time(task.last_run_at),
                );
            }
        }
        TaskCommand::Show { task_id } => {
            let task = store
                .task(task_id)
                .await?
                .ok_or_else(|| anyhow!("No task with id {}", task_id))?;
            println!("Task {}: {}", task.id, task.title);
            if !task.description.is_empty() {
                println!("  {}", task.description);
            }
            println!("  priority: {}", task.priority);
            match &task.action {
                TaskAction::LocalCommand { command_path } => {
                    println!("  command:  {}", command_path);
                }
                TaskAction::RemoteTransfer(spec) => {
                    println!(
                        "  transfer: {} -> {}:{}",
                        spec.source_path, spec.destination_node, spec.destination_path
                    );
                    if let Some(process) = &spec.process_name {
                        println!("  process:  {}", process);
                    }
                }
            }
            println!("  created:  {}", fmt_time(task.created_at));
            println!("  runs:     {} (last {})", task.run_count, fmt_opt_time(task.last_run_at));

            for s in store.schedules_for_task(task.id).await? {
                println!(
                    "  schedule {}: '{}' [{}] {}, next {}",
                    s.id,
                    s.name,
                    s.recurrence,
                    if s.active { "active" } else { "paused" },
                    fmt_opt_time(s.next_fire_at),
                );
            }
            for ex in store.executions_for_task(task.id, 5).await? {
                println!(
                    "  run at {}: {} ({}) in {}",
                    fmt_time(ex.ran_at),
                    ex.status,
                    ex.return_code,
                    format_duration(ex.duration),
                );
            }
        }
        TaskCommand::Remove { task_id } => {
            if !store.delete_task(task_id).await? {
                bail!("No task with id {}", task_id);
            }
            println!("Removed task {} and everything attached to it", task_id);
        }
    }
    Ok(0)
}

async fn run_schedule_command(store: &Store, command: ScheduleCommand) -> Result<i32> {
    match command {
        ScheduleCommand::Add {
            task_id,
            expression,
            name,
            retry_budget,
            notify_on_success,
            no_notify_on_failure,
        } => {
            let recurrence = Recurrence::parse(&expression)?;
            let next = recurrence
                .next_fire(store.now())
                .ok_or_else(|| anyhow!("'{}' never produces a next execution", expression))?;
            let schedule = store
                .create_schedule(NewSchedule {
                    task_id,
                    name: name.unwrap_or_else(|| recurrence.to_string()),
                    recurrence,
                    retry_budget,
                    notify_on_success,
                    notify_on_failure: !no_notify_on_failure,
                    next_fire_at: Some(next),
                })
                .await?;
            println!(
                "Created schedule {} '{}', first run at {}",
                schedule.id,
                schedule.name,
                fmt_time(next)
            );
        }
        ScheduleCommand::List => {
            let schedules = store.schedules().await?;
            if schedules.is_empty() {
                println!("No schedules");
            }
            for s in schedules {
                println!(
                    "{:>4}  task {:<4} {:<24} [{}] {:<7} retries {}/{}, next {}",
                    s.id,
                    s.task_id,
                    s.name,
                    s.recurrence,
                    if s.active { "active" } else { "paused" },
                    s.retry_count,
                    s.retry_budget,
                    fmt_opt_time(s.next_fire_at),
                );
            }
        }
        ScheduleCommand::Remove { schedule_id } => {
            if !store.delete_schedule(schedule_id).await? {
                bail!("No schedule with id {}", schedule_id);
            }
            println!("Removed schedule {}", schedule_id);
        }
        ScheduleCommand::Enable { schedule_id } => {
            let schedule = store
                .schedule(schedule_id)
                .await?
                .ok_or_else(|| anyhow!("No schedule with id {}", schedule_id))?;
            let next = schedule.recurrence.next_fire(store.now());
            store.set_schedule_active(schedule_id, true, next).await?;
            match next {
                Some(next) => println!("Schedule {} enabled, next run at {}", schedule_id, fmt_time(next)),
                None => println!("Schedule {} enabled, but it has no next run", schedule_id),
            }
        }
        ScheduleCommand::Disable { schedule_id } => {
            store.set_schedule_active(schedule_id, false, None).await?;
            println!("Schedule {} disabled", schedule_id);
        }
    }
    Ok(0)
}

async fn run_alert_command(store: &Store, command: AlertCommand) -> Result<i32> {
    match command {
        AlertCommand::List { all } => {
            let alerts = store.alerts(!all).await?;
            if alerts.is_empty() {
                println!("No alerts");
            }
            for alert in alerts {
                let mut flags = String::new();
                if alert.resolved {
                    flags.push_str(" [resolved]");
                }
                if alert.delivered {
                    flags.push_str(" [delivered]");
                }
                println!(
                    "{:>4}  {}  {:<8} {}{}",
                    alert.id,
                    fmt_time(alert.created_at),
                    alert.kind.as_str(),
                    alert.title,
                    flags,
                );
            }
        }
        AlertCommand::Resolve { alert_id } => {
            if !store.resolve_alert(alert_id).await? {
                bail!("No unresolved alert with id {}", alert_id);
            }
            println!("Alert {} resolved", alert_id);
        }
        AlertCommand::ClearResolved => {
            let removed = store.clear_resolved_alerts().await?;
            println!("Removed {} resolved alert(s)", removed);
        }
    }
    Ok(0)
}

async fn run_channel_command(store: &Store, command: ChannelCommand) -> Result<i32> {
    match command {
        ChannelCommand::SetEmail { smtp_server, smtp_port, username, password, from, to } => {
            let settings = EmailSettings {
                smtp_server,
                smtp_port,
                username,
                password,
                from,
                to: to.clone(),
                subject: None,
                body: None,
            };
            let blob = serde_json::to_string(&settings)?;
            store.upsert_channel(alerts::EMAIL_CHANNEL, true, &blob).await?;
            println!("Email channel configured, notifications go to {}", to);
        }
        ChannelCommand::Enable { channel } => {
            if !store.set_channel_enabled(&channel, true).await? {
                bail!("No channel named '{}'", channel);
            }
            println!("Channel '{}' enabled", channel);
        }
        ChannelCommand::Disable { channel } => {
            if !store.set_channel_enabled(&channel, false).await? {
                bail!("No channel named '{}'", channel);
            }
            println!("Channel '{}' disabled", channel);
        }
    }
    Ok(0)
}

fn fmt_time(t: NaiveDateTime) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn fmt_opt_time(t: Option<NaiveDateTime>) -> String {
    t.map_or_else(|| "-".to_string(), fmt_time)
}
