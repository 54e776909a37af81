//! Fixture process for the integration tests: a tiny HTTP service whose
//! health, lifetime and signal handling are set from the command line.

use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use clap::Parser;
use nix::sys::signal::{self, SigHandler, Signal};

#[derive(Parser, Debug)]
#[command(about = "devsup integration test fixture")]
struct Args {
    /// Port to listen on; defaults to $PORT. Without either, no listener.
    #[arg(long)]
    port: Option<u16>,

    /// Status code served on /health once healthy
    #[arg(long, default_value_t = 200)]
    status: u16,

    /// Serve 503 until this many milliseconds after start
    #[arg(long)]
    healthy_after_ms: Option<u64>,

    /// Serve 503 from this many milliseconds after start
    #[arg(long)]
    unhealthy_after_ms: Option<u64>,

    /// Exit on its own after this many milliseconds
    #[arg(long)]
    exit_after_ms: Option<u64>,

    /// Exit code used with --exit-after-ms
    #[arg(long, default_value_t = 1)]
    exit_code: i32,

    /// Ignore SIGTERM so only SIGKILL stops the process
    #[arg(long)]
    ignore_sigterm: bool,

    /// Line written to stderr at start
    #[arg(long)]
    stderr: Option<String>,

    /// Dump PORT, cwd and the full environment here at start
    #[arg(long)]
    write_env: Option<PathBuf>,
}

struct Health {
    started: Instant,
    status: StatusCode,
    healthy_after: Option<Duration>,
    unhealthy_after: Option<Duration>,
}

async fn health(State(health): State<Arc<Health>>) -> StatusCode {
    let elapsed = health.started.elapsed();
    if health.healthy_after.is_some_and(|d| elapsed < d)
        || health.unhealthy_after.is_some_and(|d| elapsed >= d)
    {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    health.status
}

fn write_env(path: &Path) -> Result<()> {
    let mut out = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writeln!(out, "cwd={}", std::env::current_dir()?.display())?;
    let mut vars: Vec<(String, String)> = std::env::vars().collect();
    vars.sort();
    for (key, value) in vars {
        writeln!(out, "{key}={value}")?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let started = Instant::now();

    if let Some(msg) = &args.stderr {
        eprintln!("{msg}");
    }
    if let Some(path) = &args.write_env {
        write_env(path)?;
    }
    if args.ignore_sigterm {
        // SAFETY: installs SIG_IGN, no handler code runs.
        unsafe { signal::signal(Signal::SIGTERM, SigHandler::SigIgn) }
            .context("Failed to ignore SIGTERM")?;
    }
    if let Some(ms) = args.exit_after_ms {
        let code = args.exit_code;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            eprintln!("exiting with {code}");
            std::process::exit(code);
        });
    }

    let port = args.port.or_else(|| {
        std::env::var("PORT")
            .ok()
            .and_then(|raw| raw.parse().ok())
    });
    let Some(port) = port else {
        std::future::pending::<()>().await;
        return Ok(());
    };

    let state = Arc::new(Health {
        started,
        status: StatusCode::from_u16(args.status).context("Invalid --status")?,
        healthy_after: args.healthy_after_ms.map(Duration::from_millis),
        unhealthy_after: args.unhealthy_after_ms.map(Duration::from_millis),
    });
    let app = Router::new()
        .route("/health", get(health))
        .route("/", get(|| async { "devsup-testexe" }))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;
    println!("listening on {port}");
    axum::serve(listener, app).await?;
    Ok(())
}
