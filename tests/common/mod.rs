#![allow(dead_code)]

use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use devsup::config::{Backoff, RestartPolicySpec};
use devsup::supervisor::{ChildSnapshot, EventKind, JournalEntry};
use devsup::{
    ChildStatus, RunOutcome, ServiceSpec, ShutdownHandle, StatusBoard, Supervisor,
    SupervisorConfig, SupervisorSettings,
};

pub const TESTEXE: &str = env!("CARGO_BIN_EXE_devsup-testexe");

pub const WAIT: Duration = Duration::from_secs(20);

/// A port that was free a moment ago.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    listener.local_addr().unwrap().port()
}

pub fn wait_for_listener(port: u16) {
    let deadline = Instant::now() + WAIT;
    while TcpStream::connect((Ipv4Addr::LOCALHOST, port)).is_err() {
        assert!(Instant::now() < deadline, "nothing listening on {port}");
        thread::sleep(Duration::from_millis(50));
    }
}

/// Settings tuned so scenarios finish in a few seconds.
pub fn fast_settings() -> SupervisorSettings {
    SupervisorSettings {
        tick_interval_ms: 50,
        probe_interval_ms: 100,
        probe_timeout_ms: 500,
        settle_period_ms: 300,
        grace_period_ms: 1000,
        ..SupervisorSettings::default()
    }
}

/// A fixture service with no restarts unless the test asks for them.
pub fn fixture(name: &str, args: &[&str]) -> ServiceSpec {
    let mut command = vec![TESTEXE.to_string()];
    command.extend(args.iter().map(|a| a.to_string()));
    let mut spec = ServiceSpec::new(name, command);
    spec.readiness_timeout_secs = 10.0;
    spec.restart_policy = RestartPolicySpec {
        max_restarts: 0,
        cooldown_seconds: 0.0,
        backoff: Backoff::None,
    };
    spec
}

/// Fixture serving HTTP on `port` with a `{port}` health URL.
pub fn http_fixture(name: &str, port: u16, args: &[&str]) -> ServiceSpec {
    let mut spec = fixture(name, args);
    spec.desired_port = Some(port);
    spec.health_url = Some("http://127.0.0.1:{port}/health".into());
    spec
}

pub fn config(settings: SupervisorSettings, services: Vec<ServiceSpec>) -> SupervisorConfig {
    SupervisorConfig {
        supervisor: settings,
        services,
    }
}

/// A supervisor running on its own thread.
pub struct Running {
    pub shutdown: ShutdownHandle,
    pub board: StatusBoard,
    thread: Option<JoinHandle<RunOutcome>>,
    _rt: tokio::runtime::Runtime,
}

impl Running {
    pub fn start(config: SupervisorConfig) -> Self {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let sup = Supervisor::new(config, rt.handle().clone()).unwrap();
        Self::spawn(sup, rt)
    }

    pub fn spawn(sup: Supervisor, rt: tokio::runtime::Runtime) -> Self {
        let shutdown = sup.shutdown_handle();
        let board = sup.status_board();
        let thread = thread::spawn(move || sup.run());
        Self {
            shutdown,
            board,
            thread: Some(thread),
            _rt: rt,
        }
    }

    pub fn wait_until<F>(&self, what: &str, pred: F) -> Vec<ChildSnapshot>
    where
        F: Fn(&[ChildSnapshot]) -> bool,
    {
        let deadline = Instant::now() + WAIT;
        loop {
            let board = self.board.read();
            if pred(&board) {
                return board;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {what}; last seen {board:#?}"
            );
            thread::sleep(Duration::from_millis(25));
        }
    }

    pub fn wait_for(&self, name: &str, status: ChildStatus) -> ChildSnapshot {
        let board = self.wait_until(&format!("{name} {status}"), |children| {
            children
                .iter()
                .any(|c| c.name == name && c.status == status)
        });
        board.into_iter().find(|c| c.name == name).unwrap()
    }

    /// Request shutdown and collect the outcome.
    pub fn stop(mut self) -> RunOutcome {
        self.shutdown.request();
        self.join()
    }

    /// Wait for the loop to end without asking it to.
    pub fn finish(mut self) -> RunOutcome {
        self.join()
    }

    fn join(&mut self) -> RunOutcome {
        self.thread
            .take()
            .unwrap()
            .join()
            .expect("supervisor thread panicked")
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.shutdown.request();
            let _ = thread.join();
        }
    }
}

pub fn spawn_count(outcome: &RunOutcome, name: &str) -> usize {
    outcome
        .events_for(name)
        .filter(|e| matches!(e.kind, EventKind::Spawned { .. }))
        .count()
}

/// Every Spawned is followed by exactly one Reaped before the next Spawned.
pub fn assert_bracketed(outcome: &RunOutcome, name: &str) {
    let mut open = false;
    for entry in outcome.events_for(name) {
        match entry.kind {
            EventKind::Spawned { .. } => {
                assert!(!open, "{name}: spawned while a previous run was unreaped");
                open = true;
            }
            EventKind::Reaped { .. } => {
                assert!(open, "{name}: reaped without a spawn");
                open = false;
            }
            _ => {}
        }
    }
    assert!(!open, "{name}: last run never reaped");
}

/// Position of the first journal entry matching `pred`.
pub fn position<F>(journal: &[JournalEntry], pred: F) -> usize
where
    F: Fn(&JournalEntry) -> bool,
{
    journal
        .iter()
        .position(pred)
        .expect("journal entry not found")
}

pub fn became(name: &'static str, to: ChildStatus) -> impl Fn(&JournalEntry) -> bool {
    move |e| e.name == name && matches!(e.kind, EventKind::Transition { to: t, .. } if t == to)
}
