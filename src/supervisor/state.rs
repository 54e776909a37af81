use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::child::ChildHandle;
use crate::config::ServiceSpec;
use crate::log_ring::CapturedOutput;

/// Per-child lifecycle status.
///
/// ```text
/// Pending ─▶ Starting ─▶ Ready ◀─▶ Unhealthy
///    ▲          │          │          │
///    │          ▼          ▼          ▼
///    └──────── Exited ◀────┴──────────┘
///               │
///               ▼
///             Dead
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChildStatus {
    Pending,
    Starting,
    Ready,
    Unhealthy,
    Exited,
    Dead,
}

impl ChildStatus {
    /// States in which an OS process exists.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ChildStatus::Starting | ChildStatus::Ready | ChildStatus::Unhealthy
        )
    }

    pub fn can_transition_to(self, to: ChildStatus) -> bool {
        use ChildStatus::*;
        matches!(
            (self, to),
            (Pending, Starting)
                | (Pending, Dead)
                | (Starting, Ready)
                | (Starting, Exited)
                | (Ready, Unhealthy)
                | (Ready, Exited)
                | (Unhealthy, Ready)
                | (Unhealthy, Exited)
                | (Exited, Pending)
                | (Exited, Dead)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChildStatus::Pending => "Pending",
            ChildStatus::Starting => "Starting",
            ChildStatus::Ready => "Ready",
            ChildStatus::Unhealthy => "Unhealthy",
            ChildStatus::Exited => "Exited",
            ChildStatus::Dead => "Dead",
        }
    }
}

impl fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable record of one service, owned by the supervising thread.
pub struct ChildState {
    pub spec: ServiceSpec,
    pub(crate) handle: Option<ChildHandle>,
    pub status: ChildStatus,
    pub spawn_time: Option<Instant>,
    /// Wall-clock twin of `spawn_time`, for display only.
    pub spawned_at: Option<DateTime<Utc>>,
    pub last_health_ok_time: Option<Instant>,
    pub last_exit_time: Option<Instant>,
    pub restart_count: u32,
    pub last_exit_code: Option<i32>,
    pub effective_port: Option<u16>,
    pub dead_reason: Option<String>,
    /// Capture rings of the most recent run; kept after the process is gone.
    pub output: Option<CapturedOutput>,
    pub(crate) consecutive_failures: u32,
    pub(crate) last_probe_time: Option<Instant>,
    pub(crate) probe_in_flight: Option<u64>,
    /// Sequence number of the last transition; older probe results are stale.
    pub(crate) transition_seq: u64,
    pub(crate) status_at_shutdown: Option<ChildStatus>,
    /// Set while a readiness or health stop is in progress.
    pub(crate) stopping: Option<Stopping>,
}

/// A stop advanced once per tick instead of blocking the loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Stopping {
    pub deadline: Instant,
    /// SIGKILL already sent; `deadline` is now the reap bound.
    pub forced: bool,
}

impl ChildState {
    pub fn new(spec: ServiceSpec) -> Self {
        Self {
            spec,
            handle: None,
            status: ChildStatus::Pending,
            spawn_time: None,
            spawned_at: None,
            last_health_ok_time: None,
            last_exit_time: None,
            restart_count: 0,
            last_exit_code: None,
            effective_port: None,
            dead_reason: None,
            output: None,
            consecutive_failures: 0,
            last_probe_time: None,
            probe_in_flight: None,
            transition_seq: 0,
            status_at_shutdown: None,
            stopping: None,
        }
    }

    pub fn stderr_tail(&self) -> Option<String> {
        self.output
            .as_ref()
            .map(CapturedOutput::stderr_tail)
            .filter(|tail| !tail.is_empty())
    }

    pub fn snapshot(&self) -> ChildSnapshot {
        ChildSnapshot {
            name: self.spec.name.clone(),
            status: self.status,
            effective_port: self.effective_port,
            since: if self.status.is_live() {
                self.spawned_at
            } else {
                None
            },
            restart_count: self.restart_count,
            reason: self.dead_reason.clone(),
        }
    }
}

/// Point-in-time view of one child, as served to `devsup status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSnapshot {
    pub name: String,
    pub status: ChildStatus,
    pub effective_port: Option<u16>,
    /// Spawn time of the running process.
    pub since: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Spawned { pid: u32 },
    Reaped { code: i32 },
    TerminationRequested { forceful: bool },
    Transition { from: ChildStatus, to: ChildStatus },
}

#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub at: Instant,
    pub name: String,
    pub kind: EventKind,
}

/// Ordered record of everything the supervisor did to its children.
#[derive(Debug, Default)]
pub struct Journal {
    entries: Vec<JournalEntry>,
}

impl Journal {
    pub fn record(&mut self, name: &str, kind: EventKind) {
        self.record_at(Instant::now(), name, kind);
    }

    /// For events observed on another thread and recorded afterwards.
    pub fn record_at(&mut self, at: Instant, name: &str, kind: EventKind) {
        match &kind {
            EventKind::Transition { from, to } => info!("{name}: {from} → {to}"),
            other => debug!("{name}: {other:?}"),
        }
        self.entries.push(JournalEntry {
            at,
            name: name.to_string(),
            kind,
        });
    }

    /// Entries in timestamp order.
    pub fn into_entries(mut self) -> Vec<JournalEntry> {
        self.entries.sort_by_key(|e| e.at);
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ChildStatus::*;

    const ALL: [ChildStatus; 6] = [Pending, Starting, Ready, Unhealthy, Exited, Dead];

    #[test]
    fn dead_is_terminal() {
        for to in ALL {
            assert!(!Dead.can_transition_to(to), "Dead → {to} must be illegal");
        }
    }

    #[test]
    fn only_exited_children_return_to_pending() {
        for from in ALL {
            assert_eq!(from.can_transition_to(Pending), from == Exited, "{from}");
        }
    }

    #[test]
    fn starting_is_reached_only_from_pending() {
        for from in ALL {
            assert_eq!(from.can_transition_to(Starting), from == Pending, "{from}");
        }
    }

    #[test]
    fn live_states_hold_a_process() {
        let live: Vec<_> = ALL.into_iter().filter(|s| s.is_live()).collect();
        assert_eq!(live, vec![Starting, Ready, Unhealthy]);
    }

    #[test]
    fn every_live_state_can_exit() {
        for from in ALL.into_iter().filter(|s| s.is_live()) {
            assert!(from.can_transition_to(Exited), "{from}");
        }
    }

    #[test]
    fn journal_sorts_late_recorded_events() {
        let mut journal = Journal::default();
        let t0 = Instant::now();
        let t1 = t0 + std::time::Duration::from_millis(5);
        journal.record_at(t1, "web", EventKind::Reaped { code: 0 });
        journal.record_at(t0, "web", EventKind::TerminationRequested { forceful: false });
        let entries = journal.into_entries();
        assert!(matches!(
            entries[0].kind,
            EventKind::TerminationRequested { .. }
        ));
        assert!(matches!(entries[1].kind, EventKind::Reaped { .. }));
    }
}
