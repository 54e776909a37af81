mod cli;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use devsup::config::{self, SupervisorConfig, SupervisorSettings};
use devsup::control::{self, EXIT_UNREACHABLE, Request, Response};
use devsup::error::SupervisorError;
use devsup::supervisor::{self, EXIT_CONFIG, EXIT_FAULT, Supervisor};
use log::{error, info, warn};

fn main() {
    // Initialize logger with custom format for the supervisor
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    match real_main() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(EXIT_FAULT);
        }
    }
}

fn real_main() -> Result<i32> {
    let args = cli::Args::parse();

    match args.sub.unwrap_or(cli::Cmd::Run { config: None }) {
        cli::Cmd::Run { config } => run_supervisor(config),
        cli::Cmd::Status { config, socket } => Ok(handle_status(config, socket)),
        cli::Cmd::Stop { config, socket } => Ok(handle_stop(config, socket)),
    }
}

fn run_supervisor(config_path: Option<PathBuf>) -> Result<i32> {
    let cfg_path = config::resolve_config_path(config_path);
    let cfg = match SupervisorConfig::load(&cfg_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{e}");
            return Ok(EXIT_CONFIG);
        }
    };
    info!("Using config from: {}", cfg_path.display());

    // Probes and child pipes run here; the supervising loop stays on this thread.
    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;

    supervisor::install_signal_handlers()?;
    let sup = match Supervisor::new(cfg, rt.handle().clone()) {
        Ok(sup) => sup,
        Err(SupervisorError::Config(e)) => {
            error!("{e}");
            return Ok(EXIT_CONFIG);
        }
        Err(e) => return Err(e).context("Failed to initialise supervisor"),
    };
    let sup = sup
        .with_control_socket()
        .context("Failed to open control socket")?;

    info!("devsup started (pid {})", std::process::id());
    let outcome = sup.run();
    rt.shutdown_timeout(std::time::Duration::from_secs(1));
    info!("devsup exiting with code {}", outcome.exit_code());
    Ok(outcome.exit_code())
}

/// Explicit `--socket`, else the socket named by the config, else the default.
fn socket_path(config_path: Option<PathBuf>, socket: Option<PathBuf>) -> PathBuf {
    if let Some(socket) = socket {
        return socket;
    }
    let cfg_path = config::resolve_config_path(config_path);
    match SupervisorConfig::load(&cfg_path) {
        Ok(cfg) => cfg.supervisor.control_socket_path(),
        Err(e) => {
            warn!("{e}; using the default control socket");
            SupervisorSettings::default().control_socket_path()
        }
    }
}

/// Handle status command - one line per child, exit code summarises
fn handle_status(config_path: Option<PathBuf>, socket: Option<PathBuf>) -> i32 {
    let path = socket_path(config_path, socket);
    match control::request(&path, &Request::Status) {
        Ok(Response::Status { children }) => {
            print!("{}", control::render_status(&children));
            control::status_exit_code(&children)
        }
        Ok(other) => {
            eprintln!("Unexpected response from supervisor: {other:?}");
            EXIT_UNREACHABLE
        }
        Err(e) => {
            eprintln!("Supervisor unreachable: {e}");
            EXIT_UNREACHABLE
        }
    }
}

/// Handle stop command - request an orderly shutdown
fn handle_stop(config_path: Option<PathBuf>, socket: Option<PathBuf>) -> i32 {
    let path = socket_path(config_path, socket);
    match control::request(&path, &Request::Stop) {
        Ok(Response::Stopping) => {
            println!("devsup is shutting down");
            0
        }
        Ok(other) => {
            eprintln!("Unexpected response from supervisor: {other:?}");
            EXIT_UNREACHABLE
        }
        Err(e) => {
            eprintln!("Supervisor unreachable: {e}");
            EXIT_UNREACHABLE
        }
    }
}
