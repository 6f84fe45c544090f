//! Windlass CLI: run cascades, serve the control surface, inspect sessions.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use windlass::bridge::udf::SqlBridge;
use windlass::cascade::spec::CascadeSpec;
use windlass::config::WindlassConfig;
use windlass::runner::{CascadeRunner, RunOptions, RunnerError};
use windlass::session::{SessionFilter, SessionStatus};

/// Clean completion.
const EXIT_OK: u8 = 0;
/// Invalid cascade or configuration.
const EXIT_CONFIG: u8 = 2;
/// Provider failure.
const EXIT_PROVIDER: u8 = 3;
/// Cancellation.
const EXIT_CANCELLED: u8 = 4;
/// Refused to take over a zombie session.
const EXIT_ZOMBIE_REFUSAL: u8 = 5;

#[derive(Parser)]
#[command(name = "windlass", about = "LLM cascade execution engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a cascade spec file to completion.
    Run {
        /// Path to a YAML or JSON cascade spec.
        cascade: String,
        /// Input bindings as key=value pairs.
        #[arg(long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
        /// Full input object as JSON (overrides --input pairs).
        #[arg(long)]
        input_json: Option<String>,
        /// Reuse a session id (refused when that session is still active).
        #[arg(long)]
        session_id: Option<String>,
    },
    /// Serve the HTTP control surface.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8844")]
        bind: SocketAddr,
    },
    /// List sessions.
    Sessions {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        cascade_id: Option<String>,
        #[arg(long)]
        active_only: bool,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Transition stale-heartbeat sessions to orphaned.
    CleanupZombies {
        /// Extra grace beyond the heartbeat lease, in seconds.
        #[arg(long, default_value_t = 30)]
        grace: i64,
    },
    /// Execute SQL (with UDFs and pipeline stages) against a fresh bridge.
    Query { sql: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    // ErrorLayer captures span traces so diagnostic reports carry the
    // tracing context of the failure.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(ErrorLayer::default())
        .init();

    let cli = Cli::parse();
    let config = WindlassConfig::from_env();

    let code = match dispatch(cli.command, config).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:?}");
            exit_code_for(&err)
        }
    };
    ExitCode::from(code)
}

async fn dispatch(command: Command, config: WindlassConfig) -> miette::Result<u8> {
    match command {
        Command::Run {
            cascade,
            inputs,
            input_json,
            session_id,
        } => cmd_run(config, &cascade, inputs, input_json, session_id).await,
        Command::Serve { bind } => {
            let runner = CascadeRunner::bootstrap(config)
                .await
                .map_err(miette::Report::new)?;
            windlass::server::serve(runner, bind)
                .await
                .map_err(|e| miette::miette!("server error: {e}"))?;
            Ok(EXIT_OK)
        }
        Command::Sessions {
            status,
            cascade_id,
            active_only,
            limit,
        } => {
            let runner = CascadeRunner::bootstrap(config)
                .await
                .map_err(miette::Report::new)?;
            let filter = SessionFilter {
                status: status.as_deref().map(SessionStatus::decode),
                cascade_id,
                active_only,
                limit: Some(limit),
            };
            let sessions = runner
                .sessions()
                .list(&filter)
                .await
                .map_err(miette::Report::new)?;
            for session in sessions {
                println!(
                    "{}  {}  {}  cell={}",
                    session.id,
                    session.status,
                    session.cascade_id,
                    session.current_cell.as_deref().unwrap_or("-"),
                );
            }
            Ok(EXIT_OK)
        }
        Command::CleanupZombies { grace } => {
            let runner = CascadeRunner::bootstrap(config)
                .await
                .map_err(miette::Report::new)?;
            let orphaned = runner
                .sessions()
                .cleanup_zombies(grace)
                .await
                .map_err(miette::Report::new)?;
            println!("orphaned {} session(s)", orphaned.len());
            for id in orphaned {
                println!("  {id}");
            }
            Ok(EXIT_OK)
        }
        Command::Query { sql } => {
            let runner = CascadeRunner::bootstrap(config)
                .await
                .map_err(miette::Report::new)?;
            let bridge = SqlBridge::open(runner).await.map_err(miette::Report::new)?;
            let frame = bridge.execute(&sql).await.map_err(miette::Report::new)?;
            println!("{}", serde_json::to_string_pretty(&frame.to_records()).unwrap_or_default());
            Ok(EXIT_OK)
        }
    }
}

async fn cmd_run(
    config: WindlassConfig,
    cascade_path: &str,
    inputs: Vec<String>,
    input_json: Option<String>,
    session_id: Option<String>,
) -> miette::Result<u8> {
    let spec = CascadeSpec::from_path(cascade_path).map_err(miette::Report::new)?;
    let input = match input_json {
        Some(raw) => {
            serde_json::from_str(&raw).map_err(|e| miette::miette!("invalid --input-json: {e}"))?
        }
        None => {
            let mut map = serde_json::Map::new();
            for pair in inputs {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| miette::miette!("--input expects KEY=VALUE, got: {pair}"))?;
                map.insert(key.to_string(), Value::String(value.to_string()));
            }
            Value::Object(map)
        }
    };

    let runner = CascadeRunner::bootstrap(config)
        .await
        .map_err(miette::Report::new)?;

    // Reusing a live session id is refused; the owning process may still be
    // running, and a zombie must be orphaned first.
    if let Some(id) = &session_id {
        if let Ok(existing) = runner.sessions().get(id).await {
            if existing.status.is_active() || existing.status == SessionStatus::Starting {
                eprintln!(
                    "refusing to take over session {id} (status {})",
                    existing.status
                );
                return Ok(EXIT_ZOMBIE_REFUSAL);
            }
        }
    }

    let opts = RunOptions {
        session_id,
        ..Default::default()
    };
    match runner.run(&spec, input, opts).await {
        Ok(outcome) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&outcome.final_output).unwrap_or_default()
            );
            Ok(EXIT_OK)
        }
        Err(err) => {
            let code = runner_exit_code(&err);
            eprintln!("{:?}", miette::Report::new(err));
            Ok(code)
        }
    }
}

fn runner_exit_code(err: &RunnerError) -> u8 {
    match err {
        RunnerError::Config(_) | RunnerError::Template(_) | RunnerError::UnknownCascade { .. } => {
            EXIT_CONFIG
        }
        RunnerError::Agent(_) => EXIT_PROVIDER,
        RunnerError::Cancelled { .. } | RunnerError::CheckpointTimeout { .. } => EXIT_CANCELLED,
        _ => 1,
    }
}

fn exit_code_for(err: &miette::Report) -> u8 {
    if let Some(runner_err) = err.downcast_ref::<RunnerError>() {
        return runner_exit_code(runner_err);
    }
    if err.downcast_ref::<windlass::cascade::spec::CascadeConfigError>().is_some() {
        return EXIT_CONFIG;
    }
    1
}
