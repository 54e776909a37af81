use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::runtime::Handle;

use crate::config::ServiceSpec;
use crate::error::SpawnError;
use crate::log_ring::{CapturedOutput, LogRing};

/// Env var carrying the resolved port into the child.
pub const PORT_ENV: &str = "PORT";

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Bound on waiting for the OS to reap a SIGKILLed child.
pub const REAP_TIMEOUT: Duration = Duration::from_secs(5);
/// Stand-in for deadlines too far out for `Instant` to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + timeout`, saturating instead of overflowing for huge timeouts.
pub fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildPoll {
    Running,
    Exited(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GracefulOutcome {
    Exited(i32),
    TimedOut,
}

/// One spawned OS child, leader of its own process group.
pub struct ChildHandle {
    name: String,
    child: tokio::process::Child,
    pid: u32,
    output: CapturedOutput,
    exit_code: Option<i32>,
}

impl ChildHandle {
    /// Spawn `spec.command` with the merged environment and `PORT` set to
    /// `effective_port`. Returns right after the OS accepts the process.
    pub fn spawn(
        spec: &ServiceSpec,
        effective_port: Option<u16>,
        log_cap: usize,
        runtime: &Handle,
    ) -> Result<Self, SpawnError> {
        let Some((program, args)) = spec.command.split_first() else {
            return Err(SpawnError {
                program: String::new(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty command"),
            });
        };

        let mut std_cmd = std::process::Command::new(program);
        std_cmd
            .args(args)
            .envs(&spec.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own group so soft/hard stops reach grandchildren too.
            .process_group(0);
        if let Some(dir) = &spec.working_directory {
            std_cmd.current_dir(dir);
        }
        if let Some(port) = effective_port {
            std_cmd.env(PORT_ENV, port.to_string());
        }
        let mut cmd = tokio::process::Command::from(std_cmd);

        // Pipes register with the runtime's reactor.
        let _guard = runtime.enter();
        let mut child = cmd.spawn().map_err(|source| SpawnError {
            program: program.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();

        let output = CapturedOutput::new(log_cap);
        if let Some(stdout) = child.stdout.take() {
            runtime.spawn(pump(
                spec.name.clone(),
                "stdout",
                stdout,
                Arc::clone(&output.stdout),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            runtime.spawn(pump(
                spec.name.clone(),
                "stderr",
                stderr,
                Arc::clone(&output.stderr),
            ));
        }

        info!("{} spawned (PID: {pid})", spec.name);
        Ok(Self {
            name: spec.name.clone(),
            child,
            pid,
            output,
            exit_code: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Shared capture rings; they outlive the handle.
    pub fn output(&self) -> &CapturedOutput {
        &self.output
    }

    /// Non-blocking. Reaps the child on first observed exit.
    pub fn poll(&mut self) -> io::Result<ChildPoll> {
        if let Some(code) = self.exit_code {
            return Ok(ChildPoll::Exited(code));
        }
        match self.child.try_wait()? {
            Some(status) => {
                let code = exit_code(status);
                self.exit_code = Some(code);
                Ok(ChildPoll::Exited(code))
            }
            None => Ok(ChildPoll::Running),
        }
    }

    /// SIGTERM to the process group, then poll-wait up to `grace`.
    pub fn terminate_graceful(&mut self, grace: Duration) -> io::Result<GracefulOutcome> {
        if let ChildPoll::Exited(code) = self.poll()? {
            return Ok(GracefulOutcome::Exited(code));
        }
        self.signal_group(Signal::SIGTERM);

        let start = Instant::now();
        let deadline = deadline_after(start, grace);
        loop {
            if let ChildPoll::Exited(code) = self.poll()? {
                info!(
                    "{} exited gracefully in {:.2}s (code {code})",
                    self.name,
                    start.elapsed().as_secs_f64()
                );
                return Ok(GracefulOutcome::Exited(code));
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("{} graceful shutdown timeout ({grace:?})", self.name);
                return Ok(GracefulOutcome::TimedOut);
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// SIGKILL to the process group; blocks until the child is reaped.
    pub fn terminate_forceful(&mut self) -> io::Result<i32> {
        if let ChildPoll::Exited(code) = self.poll()? {
            return Ok(code);
        }
        self.signal_group(Signal::SIGKILL);
        warn!("Sent SIGKILL to {} (PID: {})", self.name, self.pid);

        let deadline = deadline_after(Instant::now(), REAP_TIMEOUT);
        loop {
            if let ChildPoll::Exited(code) = self.poll()? {
                info!("{} terminated by SIGKILL (code {code})", self.name);
                return Ok(code);
            }
            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!(
                        "{} did not respond to SIGKILL after {REAP_TIMEOUT:?} (PID: {})",
                        self.name, self.pid
                    ),
                ));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// SIGTERM to the process group without waiting; the caller keeps
    /// polling and escalates on its own schedule.
    pub fn request_stop(&mut self) {
        if !matches!(self.poll(), Ok(ChildPoll::Exited(_))) {
            self.signal_group(Signal::SIGTERM);
        }
    }

    /// SIGKILL to the process group without waiting for the reap.
    pub fn kill_now(&mut self) {
        if !matches!(self.poll(), Ok(ChildPoll::Exited(_))) {
            self.signal_group(Signal::SIGKILL);
        }
    }

    /// `(stdout_tail, stderr_tail)`
    pub fn drain_logs(&self) -> (String, String) {
        self.output.tails()
    }

    fn signal_group(&mut self, sig: Signal) {
        // killpg(0) would hit the supervisor's own group.
        if self.pid == 0 {
            let _ = self.child.start_kill();
            return;
        }
        let pid = Pid::from_raw(self.pid as i32);
        match signal::killpg(pid, sig) {
            Ok(()) => debug!("Sent {sig} to process group of {} ({})", self.name, self.pid),
            Err(Errno::ESRCH) => {
                // Group gone; the leader may still be unreaped.
                if let Err(e) = signal::kill(pid, sig)
                    && e != Errno::ESRCH
                {
                    warn!("Failed {sig} to {}: {e}", self.name);
                }
            }
            Err(e) => {
                warn!("Failed {sig} to process group of {}: {e}", self.name);
                if sig == Signal::SIGKILL {
                    let _ = self.child.start_kill();
                }
            }
        }
    }
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        if self.exit_code.is_none() && matches!(self.child.try_wait(), Ok(None)) {
            warn!("{} handle dropped while running; killing", self.name);
            self.signal_group(Signal::SIGKILL);
        }
    }
}

/// Signal deaths map to `128 + signo`, the shell convention.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

async fn pump<R>(name: String, stream: &'static str, mut reader: R, ring: Arc<Mutex<LogRing>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = &buf[..n];
                match ring.lock() {
                    Ok(mut guard) => guard.push(chunk),
                    Err(poisoned) => poisoned.into_inner().push(chunk),
                }
                for line in String::from_utf8_lossy(chunk).lines() {
                    debug!("[{name}:{stream}] {line}");
                }
            }
            Err(e) => {
                debug!("[{name}:{stream}] read error: {e}");
                break;
            }
        }
    }
}
