//! Out-of-process control of a running supervisor.
//!
//! A Unix domain socket carries one JSON request line and one JSON response
//! line per connection:
//! - `{"cmd":"status"}` → `{"kind":"status","children":[...]}`
//! - `{"cmd":"stop"}` → `{"kind":"stopping"}`
//!
//! Accepting and reading happen off the supervising thread, which only sees
//! complete requests on a crossbeam channel.

use std::fs;
use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::SecondsFormat;
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::ControlError;
use crate::supervisor::{ChildSnapshot, ChildStatus};

/// Exit code of `devsup status` / `devsup stop` when no supervisor answers.
pub const EXIT_UNREACHABLE: i32 = 4;

const IO_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Status,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Status { children: Vec<ChildSnapshot> },
    Stopping,
    Error { message: String },
}

/// A parsed request waiting for the supervisor's answer.
#[derive(Debug)]
pub struct ControlRequest {
    pub request: Request,
    reply: Sender<Response>,
}

impl ControlRequest {
    pub fn respond(self, response: Response) {
        // The peer may have timed out and gone.
        let _ = self.reply.send(response);
    }
}

/// Socket owner. Connections are accepted and read on background threads;
/// only complete requests reach the supervising thread, through
/// [`requests`](Self::requests).
pub struct ControlServer {
    path: PathBuf,
    requests: Receiver<ControlRequest>,
    // Keeps `requests` connected for as long as the server lives.
    _tx: Sender<ControlRequest>,
    closing: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Bind `path`, replacing a stale socket file. Fails if another
    /// supervisor is answering on it.
    pub fn bind(path: &Path) -> Result<Self, ControlError> {
        let io_err = |source: io::Error| ControlError::Io {
            path: path.to_path_buf(),
            source,
        };

        if path.exists() {
            if UnixStream::connect(path).is_ok() {
                return Err(io_err(io::Error::new(
                    ErrorKind::AddrInUse,
                    "another supervisor is listening",
                )));
            }
            debug!("Removing stale control socket {}", path.display());
            fs::remove_file(path).map_err(io_err)?;
        }
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let listener = UnixListener::bind(path).map_err(io_err)?;
        let (tx, requests) = unbounded();
        let closing = Arc::new(AtomicBool::new(false));
        let acceptor = {
            let tx = tx.clone();
            let closing = Arc::clone(&closing);
            thread::Builder::new()
                .name("devsup-control".into())
                .spawn(move || accept_loop(listener, tx, closing))
                .map_err(io_err)?
        };
        info!("Control socket listening on {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            requests,
            _tx: tx,
            closing,
            acceptor: Some(acceptor),
        })
    }

    /// Requests ready to be answered. Never blocks on a peer.
    pub fn requests(&self) -> &Receiver<ControlRequest> {
        &self.requests
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        // Wake the blocking accept so the thread sees `closing`.
        let woke = UnixStream::connect(&self.path).is_ok();
        if let Some(acceptor) = self.acceptor.take()
            && woke
            && acceptor.join().is_err()
        {
            warn!("Control acceptor thread panicked");
        }
        if let Err(e) = fs::remove_file(&self.path)
            && e.kind() != ErrorKind::NotFound
        {
            warn!("Failed to remove control socket {}: {e}", self.path.display());
        }
    }
}

fn accept_loop(listener: UnixListener, tx: Sender<ControlRequest>, closing: Arc<AtomicBool>) {
    loop {
        let accepted = listener.accept();
        if closing.load(Ordering::SeqCst) {
            break;
        }
        match accepted {
            Ok((stream, _)) => {
                let tx = tx.clone();
                // One thread per peer: a silent client only stalls itself.
                let spawned = thread::Builder::new()
                    .name("devsup-control-conn".into())
                    .spawn(move || {
                        if let Err(e) = serve_one(stream, &tx) {
                            warn!("Control request failed: {e}");
                        }
                    });
                if let Err(e) = spawned {
                    warn!("Failed to spawn control connection thread: {e}");
                }
            }
            Err(e) => {
                warn!("Control socket accept failed: {e}");
                thread::sleep(ACCEPT_BACKOFF);
            }
        }
    }
    debug!("Control acceptor stopped");
}

fn serve_one(stream: UnixStream, tx: &Sender<ControlRequest>) -> Result<(), ControlError> {
    let io_err = |source: io::Error| ControlError::Io {
        path: PathBuf::from("<peer>"),
        source,
    };
    stream.set_read_timeout(Some(IO_TIMEOUT)).map_err(io_err)?;
    stream.set_write_timeout(Some(IO_TIMEOUT)).map_err(io_err)?;

    let mut line = String::new();
    BufReader::new(&stream).read_line(&mut line).map_err(io_err)?;
    if line.trim().is_empty() {
        // Liveness checks connect and hang up without a request.
        return Ok(());
    }
    let response = match serde_json::from_str::<Request>(line.trim()) {
        Ok(request) => {
            debug!("Control request: {request:?}");
            let (reply, answer) = bounded(1);
            if tx.send(ControlRequest { request, reply }).is_err() {
                return Err(ControlError::NoResponse);
            }
            answer
                .recv_timeout(IO_TIMEOUT)
                .map_err(|_| ControlError::NoResponse)?
        }
        Err(e) => Response::Error {
            message: e.to_string(),
        },
    };

    let mut out = serde_json::to_string(&response)?;
    out.push('\n');
    (&stream).write_all(out.as_bytes()).map_err(io_err)?;
    Ok(())
}

/// Client side: send one request and wait for its response.
pub fn request(path: &Path, request: &Request) -> Result<Response, ControlError> {
    let io_err = |source: io::Error| ControlError::Io {
        path: path.to_path_buf(),
        source,
    };
    let stream = UnixStream::connect(path).map_err(io_err)?;
    stream.set_read_timeout(Some(IO_TIMEOUT)).map_err(io_err)?;
    stream.set_write_timeout(Some(IO_TIMEOUT)).map_err(io_err)?;

    let mut out = serde_json::to_string(request)?;
    out.push('\n');
    (&stream).write_all(out.as_bytes()).map_err(io_err)?;

    let mut line = String::new();
    BufReader::new(&stream).read_line(&mut line).map_err(io_err)?;
    if line.trim().is_empty() {
        return Err(ControlError::NoResponse);
    }
    Ok(serde_json::from_str(line.trim())?)
}

/// `name status port=<p|-> since=<RFC3339|-> restarts=<n>`, one line per child.
pub fn render_status(children: &[ChildSnapshot]) -> String {
    let mut out = String::new();
    for child in children {
        let port = child
            .effective_port
            .map_or_else(|| "-".to_string(), |p| p.to_string());
        let since = child.since.map_or_else(
            || "-".to_string(),
            |t| t.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        out.push_str(&format!(
            "{} {} port={port} since={since} restarts={}",
            child.name, child.status, child.restart_count
        ));
        if let Some(reason) = &child.reason {
            out.push_str(&format!(" reason=\"{reason}\""));
        }
        out.push('\n');
    }
    out
}

/// 0 all Ready, 1 any Dead, 2 any Unhealthy, 3 otherwise.
pub fn status_exit_code(children: &[ChildSnapshot]) -> i32 {
    let any = |status: ChildStatus| children.iter().any(|c| c.status == status);
    if any(ChildStatus::Dead) {
        1
    } else if any(ChildStatus::Unhealthy) {
        2
    } else if children.iter().all(|c| c.status == ChildStatus::Ready) {
        0
    } else {
        3
    }
}
