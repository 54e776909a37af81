//! Port arbitration - bind probing, free-port discovery, and narrow
//! termination of whatever process listens on a port.
//!
//! Listener discovery is OS-specific:
//! - Linux: `/proc/net/tcp{,6}` socket inodes mapped to PIDs via `/proc/<pid>/fd`
//! - other Unix: `lsof -t -iTCP:<port> -sTCP:LISTEN`

use std::fmt;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, TcpListener};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::error::ProbeError;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod procfs;
        use procfs as platform;
    } else {
        mod lsof;
        use lsof as platform;
    }
}

/// PIDs found listening on a port.
#[derive(Debug, Default)]
pub(crate) struct Discovery {
    pub pids: Vec<i32>,
    /// Some candidate owners could not be inspected.
    pub partial: bool,
}

/// Result of [`PortArbiter::terminate_holder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolderOutcome {
    Vacated,
    NotFound,
    StillBound,
    PermissionDenied,
}

impl fmt::Display for HolderOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HolderOutcome::Vacated => "vacated",
            HolderOutcome::NotFound => "not_found",
            HolderOutcome::StillBound => "still_bound",
            HolderOutcome::PermissionDenied => "permission_denied",
        })
    }
}

#[derive(Debug, Clone)]
pub struct PortArbiter {
    /// Every loopback family a dev server may listen on.
    hosts: [IpAddr; 2],
    vacate_timeout: Duration,
    poll_interval: Duration,
}

impl Default for PortArbiter {
    fn default() -> Self {
        Self {
            hosts: [
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
            ],
            vacate_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl PortArbiter {
    pub fn new(vacate_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            vacate_timeout,
            poll_interval,
            ..Self::default()
        }
    }

    /// Check if a port is available by attempting to bind then immediately
    /// releasing, on IPv4 and IPv6 loopback. A family the host lacks is
    /// skipped.
    pub fn is_free(&self, port: u16) -> Result<bool, ProbeError> {
        for host in self.hosts {
            match TcpListener::bind((host, port)) {
                Ok(listener) => drop(listener),
                Err(e) if e.kind() == ErrorKind::AddrInUse => {
                    debug!("Port {port} is taken on {host}");
                    return Ok(false);
                }
                Err(e) if host.is_ipv6() && family_unavailable(&e) => {
                    debug!("No IPv6 loopback, skipping [{host}]:{port}");
                }
                Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                    return Err(ProbeError::PermissionDenied { port });
                }
                Err(source) => return Err(ProbeError::Os { port, source }),
            }
        }
        debug!("Port {port} is available");
        Ok(true)
    }

    /// First free port in `[start, start + window)`, never past 65535.
    pub fn find_next_free(&self, start: u16, window: u16) -> Result<Option<u16>, ProbeError> {
        let end = (u32::from(start) + u32::from(window)).min(u32::from(u16::MAX) + 1);
        for candidate in u32::from(start)..end {
            // `end` is clamped, so every candidate fits.
            let port = candidate as u16;
            if self.is_free(port)? {
                return Ok(Some(port));
            }
            debug!("Port {port} is taken, trying next");
        }
        Ok(None)
    }

    /// Terminate the process(es) listening on `port` and wait for the port to
    /// become bindable. SIGTERM first; one SIGKILL escalation if the port is
    /// still held after the vacate timeout.
    pub fn terminate_holder(&self, port: u16) -> HolderOutcome {
        if matches!(self.is_free(port), Ok(true)) {
            return HolderOutcome::NotFound;
        }

        let discovery = match platform::listening_pids(port) {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                warn!("Cannot inspect listeners on port {port}: {e}");
                return HolderOutcome::PermissionDenied;
            }
            Err(e) => {
                warn!("Listener discovery for port {port} failed: {e}");
                return HolderOutcome::NotFound;
            }
        };

        let own_pid = std::process::id() as i32;
        let held_by_self = discovery.pids.contains(&own_pid);
        if held_by_self {
            warn!("Port {port} is held by the supervisor itself; refusing to signal it");
        }
        let pids: Vec<i32> = discovery
            .pids
            .into_iter()
            .filter(|&pid| pid != own_pid)
            .collect();

        if pids.is_empty() {
            return if discovery.partial && !held_by_self {
                HolderOutcome::PermissionDenied
            } else {
                HolderOutcome::NotFound
            };
        }

        info!("Port {port} held by PID(s) {pids:?}; sending SIGTERM");
        if let Some(outcome) = self.signal_all(&pids, Signal::SIGTERM) {
            return outcome;
        }
        if self.wait_until_free(port, self.vacate_timeout) {
            info!("Port {port} vacated");
            return HolderOutcome::Vacated;
        }

        warn!(
            "Port {port} still bound after {:?}, escalating to SIGKILL",
            self.vacate_timeout
        );
        if let Some(outcome) = self.signal_all(&pids, Signal::SIGKILL) {
            return outcome;
        }
        if self.wait_until_free(port, self.vacate_timeout) {
            info!("Port {port} vacated after SIGKILL");
            HolderOutcome::Vacated
        } else {
            HolderOutcome::StillBound
        }
    }

    /// `Some(outcome)` short-circuits the termination sequence.
    fn signal_all(&self, pids: &[i32], sig: Signal) -> Option<HolderOutcome> {
        for &pid in pids {
            match signal::kill(Pid::from_raw(pid), sig) {
                Ok(()) => debug!("Sent {sig} to PID {pid}"),
                // Already gone - that is what we wanted.
                Err(Errno::ESRCH) => {}
                Err(Errno::EPERM) => {
                    warn!("Not permitted to send {sig} to PID {pid}");
                    return Some(HolderOutcome::PermissionDenied);
                }
                Err(e) => warn!("Failed to send {sig} to PID {pid}: {e}"),
            }
        }
        None
    }

    fn wait_until_free(&self, port: u16, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if matches!(self.is_free(port), Ok(true)) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}

fn family_unavailable(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::AddrNotAvailable | ErrorKind::Unsupported
    ) || e.raw_os_error() == Some(Errno::EAFNOSUPPORT as i32)
}
