use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use wadqueue_core::config::{
    initialize_data_dir, initialize_file_root, resolve_config_path, AppConfig,
};
use wadqueue_core::id::created_at;
use wadqueue_core::logging::{
    open_log_sink, LogSettings, LogSink, RuntimeLogMode, DEFAULT_LOG_FILTER,
};
use wadqueue_core::runner::{list_task_ids, ReconcileSignal, TaskRunner};
use wadqueue_core::server::{app_router, AppState};
use wadqueue_core::task::{Task, TaskStatus};

#[derive(Parser)]
#[command(
    name = "wadqueue",
    about = "Queue and run procedural map generation jobs one at a time",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true, help = "Path to config.toml (overrides CONFIG_PATH)")]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print stored tasks, newest first.
    List(ListArgs),
}

#[derive(Args)]
struct ListArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
    #[arg(long, help = "Emit one JSON object per line")]
    json: bool,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = if cli.command.is_some() {
        RuntimeLogMode::Cli
    } else {
        RuntimeLogMode::Server
    };
    let data_dir = wadqueue_core::config::data_dir(cli.data_dir.as_deref());

    init_logging(&data_dir, cli.verbose, cli.log_filter.as_deref());

    let cfg_path = resolve_config_path(cli.config.as_deref(), &data_dir);
    info!(
        mode = mode.as_str(),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );

    if cli.config.is_none() && std::env::var_os(wadqueue_core::config::ENV_CONFIG_PATH).is_none()
    {
        if let Err(e) = initialize_data_dir(&data_dir) {
            warn!(error = %e, "Failed to initialize data directory");
        }
    }
    let config = load_config(&cfg_path)?;

    match cli.command {
        Some(Commands::List(args)) => list_tasks(&config, args).await,
        None => run_server(config, cli.port, cli.host).await,
    }
}

fn load_config(path: &Path) -> Result<AppConfig> {
    let mut config = match AppConfig::load_from_path(path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    config
        .apply_env_overrides(|key| std::env::var(key).ok())
        .context("invalid environment override")?;
    Ok(config)
}

fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>) {
    let settings = LogSettings {
        verbose,
        cli_filter: cli_log_filter.map(ToString::to_string),
        rust_log: std::env::var("RUST_LOG").ok(),
    };
    let filters = settings.filters();
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));

    match open_log_sink(Some(data_dir)) {
        LogSink::File(appender) => {
            let subscriber = tracing_subscriber::registry().with(console_layer).with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(appender)
                    .with_filter(parse_env_filter_with_fallback(&filters.file, "file")),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        LogSink::ConsoleOnly { log_dir, reason } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            let attempted_log_dir = log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn build_runner(config: &AppConfig) -> Result<TaskRunner> {
    initialize_file_root(&config.paths.file_root)?;
    let generator = config.generator();
    info!(
        file_root = %config.paths.file_root.display(),
        program = %generator.program.display(),
        "Task runner configured"
    );
    Ok(TaskRunner::new(
        config.paths.file_root.clone(),
        Arc::new(generator),
    ))
}

async fn run_server(config: AppConfig, port: Option<u16>, host: Option<String>) -> Result<()> {
    let runner = build_runner(&config)?;
    // Nothing in memory survives a restart; the first pass repairs stale
    // running markers from the logs.
    runner.request_reconcile(ReconcileSignal::Startup);

    let port = port.unwrap_or(config.server.port);
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let app = app_router(AppState::new(runner));

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting wadqueue server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn list_tasks(config: &AppConfig, args: ListArgs) -> Result<()> {
    let file_root = config.paths.file_root.as_path();
    let ids = list_task_ids(file_root)
        .await
        .with_context(|| format!("failed to list {}", file_root.display()))?;

    for id in ids.into_iter().rev().take(args.limit) {
        let status = Task::open(file_root, &id)?.status().await?;
        let date = created_at(&id)
            .map(|date| date.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_default();
        if args.json {
            let line = serde_json::json!({ "id": id, "date": date, "status": status });
            println!("{line}");
        } else {
            println!("{id}  {date}  {}", describe_status(&status));
        }
    }
    Ok(())
}

fn describe_status(status: &TaskStatus) -> String {
    let mut out = status.state.as_str().to_string();
    if let Some(queue) = status.queue {
        out.push_str(&format!(" (queue {queue})"));
    }
    if let Some(title) = &status.title {
        out.push_str(&format!(" \"{title}\""));
    }
    if let Some(error) = &status.error {
        out.push_str(&format!(": {error}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_server_mode() {
        let cli = Cli::try_parse_from(["wadqueue", "-p", "9090"]).expect("parse");
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(9090));
    }

    #[test]
    fn cli_parses_list_with_global_flags() {
        let cli = Cli::try_parse_from(["wadqueue", "list", "--limit", "5", "-vv"]).expect("parse");
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Some(Commands::List(args)) => {
                assert_eq!(args.limit, 5);
                assert!(!args.json);
            }
            None => panic!("expected list subcommand"),
        }
    }

    #[test]
    fn describe_status_includes_optional_fields() {
        assert_eq!(describe_status(&TaskStatus::queued(3)), "pending (queue 3)");
        assert_eq!(describe_status(&TaskStatus::done("Keep")), "done \"Keep\"");
        assert_eq!(
            describe_status(&TaskStatus::failed("exit code: 1")),
            "error: exit code: 1"
        );
    }
}
