use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use orchard::activity::{Activity, ActivityCategory};
use orchard::config::{Overrides, ProjectConfig};
use orchard::{instance, ipc, AppContext};

#[derive(Parser)]
#[command(name = "orchard", version, about = "Isolated git worktrees with virtualized dev-server ports")]
struct Cli {
    /// Project root (the primary checkout).
    #[arg(long, env = "ORCHARD_PROJECT_DIR", default_value = ".", global = true)]
    project_dir: PathBuf,

    /// Control-server port. Overrides the config file.
    #[arg(long, env = "ORCHARD_PORT", global = true)]
    port: Option<u16>,

    /// Control-server bind address. Overrides the config file.
    #[arg(long, env = "ORCHARD_BIND", global = true)]
    bind: Option<String>,

    /// Log filter, e.g. "debug" or "info,orchard=trace".
    #[arg(long, env = "ORCHARD_LOG", global = true)]
    log: Option<String>,

    /// Also write logs to this file.
    #[arg(long, env = "ORCHARD_LOG_FILE", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (the default).
    Serve,
    /// Query a running daemon's health endpoint.
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Command::Status { json }) => status(&cli, json).await,
        Some(Command::Serve) | None => serve(cli).await,
    }
}

async fn serve(cli: Cli) -> Result<()> {
    let project_dir = cli
        .project_dir
        .canonicalize()
        .with_context(|| format!("invalid project dir: {}", cli.project_dir.display()))?;

    let config = ProjectConfig::load(
        &project_dir,
        Overrides {
            listen_port: cli.port,
            bind_address: cli.bind.clone(),
            log: cli.log.clone(),
        },
    )?;

    let _log_guard = setup_logging(&config.log, &config.log_format, cli.log_file.as_deref());
    info!(version = env!("CARGO_PKG_VERSION"), project = %project_dir.display(), "starting");

    let url = format!("ws://{}:{}", config.bind_address, config.listen_port);
    let _instance = instance::acquire(config.instance_file(), url)?;

    let ctx = AppContext::new(config);
    ctx.worktrees.bootstrap().await?;
    ctx.activity
        .append(Activity::info(
            ActivityCategory::System,
            "daemon_started",
            format!("orchard {} started", env!("CARGO_PKG_VERSION")),
        ))
        .await;

    spawn_reconcile_task(ctx.clone());

    let result = ipc::run(ctx.clone()).await;
    ctx.activity
        .append(Activity::info(
            ActivityCategory::System,
            "daemon_stopped",
            "orchard shut down",
        ))
        .await;
    if let Err(e) = &result {
        error!(err = %e, "server error");
    }
    result
}

/// Periodic git-status refresh for all registered worktrees.
fn spawn_reconcile_task(ctx: Arc<AppContext>) {
    tokio::spawn(async move {
        let period = Duration::from_secs(ctx.config.read().await.reconcile_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await; // immediate first tick — skip it
        loop {
            interval.tick().await;
            ctx.worktrees.reconcile().await;
        }
    });
}

async fn status(cli: &Cli, json: bool) -> Result<()> {
    let project_dir = cli
        .project_dir
        .canonicalize()
        .with_context(|| format!("invalid project dir: {}", cli.project_dir.display()))?;
    let config = ProjectConfig::load(
        &project_dir,
        Overrides {
            listen_port: cli.port,
            bind_address: cli.bind.clone(),
            log: None,
        },
    )?;

    let url = format!(
        "http://{}:{}/health",
        config.bind_address, config.listen_port
    );
    let body: serde_json::Value = reqwest::Client::new()
        .get(&url)
        .timeout(Duration::from_secs(3))
        .send()
        .await
        .with_context(|| format!("daemon not reachable at {url}"))?
        .json()
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        println!(
            "orchard {} — up {}s, {} running worktree(s)",
            body["version"].as_str().unwrap_or("?"),
            body["uptime"].as_u64().unwrap_or(0),
            body["runningWorktrees"].as_u64().unwrap_or(0),
        );
    }
    Ok(())
}

fn setup_logging(
    filter: &str,
    format: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("orchard.log"));
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let builder = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(writer)
                .with_ansi(false);
            if format == "json" {
                builder.json().init();
            } else {
                builder.init();
            }
            Some(guard)
        }
        None => {
            let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
            if format == "json" {
                builder.json().init();
            } else {
                builder.init();
            }
            None
        }
    }
}
