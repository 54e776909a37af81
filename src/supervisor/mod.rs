//! The supervising loop.
//!
//! One thread owns every [`ChildState`]. It wakes on a crossbeam `tick` or on
//! a probe result, and on each tick:
//! 1. polls live children for exit
//! 2. escalates stops whose grace period ran out
//! 3. applies settle periods and readiness timeouts
//! 4. dispatches due health probes
//! 5. consults the restart policy for exited children
//! 6. launches the next start tier when the current one has settled
//!
//! Control requests arrive on their own channel and are answered as they come.
//!
//! Shutdown walks the tiers in reverse, stopping each tier's children
//! concurrently under one outer deadline.

mod signals;
mod state;

pub use signals::{ShutdownHandle, check_signals, install_signal_handlers};
pub use state::{ChildSnapshot, ChildState, ChildStatus, EventKind, Journal, JournalEntry};
use state::Stopping;

use std::io;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, never, select, tick};
use log::{debug, error, info, warn};
use tokio::runtime::Handle;

use crate::arbiter::{HolderOutcome, PortArbiter};
use crate::child::{ChildHandle, ChildPoll, GracefulOutcome, REAP_TIMEOUT, deadline_after};
use crate::config::{PortResolution, SupervisorConfig, SupervisorSettings};
use crate::control::{ControlRequest, ControlServer, Request, Response};
use crate::error::{PortResolutionError, Result, SupervisorError};
use crate::health::{ProbePool, ProbeResult};
use crate::policy::{RestartDecision, RestartInput, RestartPolicy};
use crate::report::{ChildReport, RunReport};

pub const EXIT_CLEAN: i32 = 0;
pub const EXIT_DEAD: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_FAULT: i32 = 3;

/// Latest published view of every child, readable from other threads.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard(Arc<RwLock<Vec<ChildSnapshot>>>);

impl StatusBoard {
    pub fn read(&self) -> Vec<ChildSnapshot> {
        match self.0.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn get(&self, name: &str) -> Option<ChildSnapshot> {
        self.read().into_iter().find(|c| c.name == name)
    }

    fn publish(&self, children: Vec<ChildSnapshot>) {
        match self.0.write() {
            Ok(mut guard) => *guard = children,
            Err(poisoned) => *poisoned.into_inner() = children,
        }
    }
}

/// What [`Supervisor::run`] hands back once every child is gone.
#[derive(Debug)]
pub struct RunOutcome {
    pub report: RunReport,
    pub journal: Vec<JournalEntry>,
    pub fault: Option<String>,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        if self.fault.is_some() {
            EXIT_FAULT
        } else if self.report.any_dead() {
            EXIT_DEAD
        } else {
            EXIT_CLEAN
        }
    }

    pub fn events_for<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a JournalEntry> {
        self.journal.iter().filter(move |e| e.name == name)
    }
}

/// A child stopped on a worker thread during shutdown.
struct Stopped {
    idx: usize,
    handle: ChildHandle,
    forced_at: Option<Instant>,
    result: io::Result<i32>,
    at: Instant,
}

pub struct Supervisor {
    settings: SupervisorSettings,
    /// Sorted by `start_order`; indices are stable for the whole run.
    children: Vec<ChildState>,
    policies: Vec<RestartPolicy>,
    tiers: Vec<Vec<usize>>,
    /// Index of the next tier to launch.
    next_tier: usize,
    arbiter: PortArbiter,
    probes: ProbePool,
    probe_rx: Receiver<ProbeResult>,
    runtime: Handle,
    shutdown: ShutdownHandle,
    journal: Journal,
    control: Option<ControlServer>,
    board: StatusBoard,
    seq: u64,
    started_at: DateTime<Utc>,
}

impl Supervisor {
    /// Build a supervisor for a validated service set. Nothing is spawned
    /// until [`run`](Self::run).
    pub fn new(config: SupervisorConfig, runtime: Handle) -> Result<Self> {
        config.validate()?;
        let SupervisorConfig {
            supervisor: settings,
            services: mut specs,
        } = config;
        specs.sort_by_key(|spec| spec.start_order);

        let policies = specs
            .iter()
            .map(|spec| RestartPolicy::new(spec.restart_policy, settings.backoff_ceiling()))
            .collect();
        let children: Vec<ChildState> = specs.into_iter().map(ChildState::new).collect();
        let tiers = tiers_of(&children);

        let (probes, probe_rx) = ProbePool::new(runtime.clone(), settings.probe_workers)
            .map_err(|e| SupervisorError::Fault(format!("failed to build HTTP client: {e}")))?;

        let board = StatusBoard::default();
        board.publish(children.iter().map(ChildState::snapshot).collect());

        Ok(Self {
            settings,
            children,
            policies,
            tiers,
            next_tier: 0,
            arbiter: PortArbiter::default(),
            probes,
            probe_rx,
            runtime,
            shutdown: ShutdownHandle::default(),
            journal: Journal::default(),
            control: None,
            board,
            seq: 0,
            started_at: Utc::now(),
        })
    }

    /// Serve `status`/`stop` on the configured control socket.
    pub fn with_control_socket(mut self) -> Result<Self> {
        let path = self.settings.control_socket_path();
        self.control = Some(ControlServer::bind(&path)?);
        Ok(self)
    }

    pub fn with_arbiter(mut self, arbiter: PortArbiter) -> Self {
        self.arbiter = arbiter;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn status_board(&self) -> StatusBoard {
        self.board.clone()
    }

    /// Supervise until shutdown is requested, then stop every child and
    /// write the report. Faults are captured in the outcome, never panicked.
    pub fn run(mut self) -> RunOutcome {
        self.started_at = Utc::now();
        info!(
            "Supervising {} services in {} tiers",
            self.children.len(),
            self.tiers.len()
        );

        let fault = match self.supervise() {
            Ok(()) => None,
            Err(e) => {
                error!("{e}; terminating all children");
                Some(e.to_string())
            }
        };

        self.shutdown_all();
        self.publish();

        let report = RunReport {
            started_at: self.started_at,
            ended_at: Utc::now(),
            children: self
                .children
                .iter()
                .map(|c| ChildReport::new(c, c.status_at_shutdown.unwrap_or(c.status)))
                .collect(),
        };
        if let Some(path) = &self.settings.report_path {
            match report.write(path) {
                Ok(()) => info!("Run report written to {}", path.display()),
                Err(e) => error!("{e:#}"),
            }
        }
        // Removes the socket file.
        drop(self.control.take());

        info!("Supervisor stopped");
        RunOutcome {
            report,
            journal: std::mem::take(&mut self.journal).into_entries(),
            fault,
        }
    }

    fn supervise(&mut self) -> Result<()> {
        let ticker = tick(self.settings.tick_interval());
        let probe_rx = self.probe_rx.clone();
        let control_rx = self
            .control
            .as_ref()
            .map_or_else(never, |control| control.requests().clone());

        // Initial pass launches the first tier without waiting a tick.
        self.step(Instant::now())?;

        while !self.shutdown.is_requested() {
            select! {
                recv(probe_rx) -> msg => match msg {
                    Ok(result) => self.handle_probe(result, Instant::now())?,
                    Err(_) => return Err(SupervisorError::Fault("probe channel closed".into())),
                },
                recv(control_rx) -> msg => match msg {
                    Ok(request) => self.answer_control(request),
                    Err(_) => return Err(SupervisorError::Fault("control channel closed".into())),
                },
                recv(ticker) -> _ => {
                    if let Some(sig) = check_signals() {
                        info!("Received {sig}, shutting down");
                        self.shutdown.request();
                        break;
                    }
                    self.step(Instant::now())?;
                }
            }
        }
        Ok(())
    }

    fn step(&mut self, now: Instant) -> Result<()> {
        if self.shutdown.is_requested() {
            return Ok(());
        }
        self.observe_exits()?;
        self.advance_stops(now)?;
        self.check_readiness(now)?;
        self.dispatch_probes(now);
        self.apply_restart_policy(now)?;
        self.advance_tiers()?;
        self.publish();

        if self
            .children
            .iter()
            .all(|c| c.status == ChildStatus::Dead)
        {
            warn!("Every service is Dead; nothing left to supervise");
            self.shutdown.request();
        }
        Ok(())
    }

    fn answer_control(&self, pending: ControlRequest) {
        let response = match pending.request {
            Request::Status => Response::Status {
                children: self.children.iter().map(ChildState::snapshot).collect(),
            },
            Request::Stop => {
                info!("Stop requested over control socket");
                self.shutdown.request();
                Response::Stopping
            }
        };
        pending.respond(response);
    }

    fn publish(&self) {
        self.board
            .publish(self.children.iter().map(ChildState::snapshot).collect());
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn name(&self, idx: usize) -> String {
        self.children[idx].spec.name.clone()
    }

    /// The only place `status` changes.
    fn transition(&mut self, idx: usize, to: ChildStatus) -> Result<()> {
        let seq = self.next_seq();
        let child = &mut self.children[idx];
        let from = child.status;
        if !from.can_transition_to(to) {
            return Err(SupervisorError::Fault(format!(
                "illegal transition {from} → {to} for {}",
                child.spec.name
            )));
        }
        if child.handle.is_some() != to.is_live() {
            return Err(SupervisorError::Fault(format!(
                "{}: process handle out of step with {to}",
                child.spec.name
            )));
        }
        child.status = to;
        child.transition_seq = seq;
        child.consecutive_failures = 0;
        let name = child.spec.name.clone();
        self.journal.record(&name, EventKind::Transition { from, to });
        Ok(())
    }

    fn mark_dead(&mut self, idx: usize, reason: String) -> Result<()> {
        let child = &mut self.children[idx];
        match child.stderr_tail() {
            Some(tail) => error!("{} is Dead: {reason}\n{}", child.spec.name, tail.trim_end()),
            None => error!("{} is Dead: {reason}", child.spec.name),
        }
        child.dead_reason = Some(reason);
        self.transition(idx, ChildStatus::Dead)
    }

    fn record_exit(&mut self, idx: usize, code: i32, at: Instant) -> Result<()> {
        let name = self.name(idx);
        self.journal.record_at(at, &name, EventKind::Reaped { code });
        let child = &mut self.children[idx];
        child.last_exit_code = Some(code);
        child.last_exit_time = Some(at);
        child.stopping = None;
        self.transition(idx, ChildStatus::Exited)
    }

    fn observe_exits(&mut self) -> Result<()> {
        for idx in 0..self.children.len() {
            let Some(handle) = self.children[idx].handle.as_mut() else {
                continue;
            };
            let polled = handle.poll();
            let name = self.name(idx);
            match polled {
                Ok(ChildPoll::Running) => {}
                Ok(ChildPoll::Exited(code)) => {
                    warn!("{name} exited with code {code}");
                    self.children[idx].handle = None;
                    self.record_exit(idx, code, Instant::now())?;
                }
                Err(e) => {
                    return Err(SupervisorError::Fault(format!(
                        "failed to poll {name}: {e}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_readiness(&mut self, now: Instant) -> Result<()> {
        let settle = self.settings.settle_period();
        for idx in 0..self.children.len() {
            let child = &self.children[idx];
            if child.status != ChildStatus::Starting || child.stopping.is_some() {
                continue;
            }
            let Some(spawned) = child.spawn_time else {
                continue;
            };
            let running = now.saturating_duration_since(spawned);

            if child.spec.health_url.is_none() && running >= settle {
                debug!("{} settled after {running:?}", child.spec.name);
                self.transition(idx, ChildStatus::Ready)?;
            } else if running >= child.spec.readiness_timeout() {
                warn!(
                    "{} not ready after {:?}; terminating",
                    child.spec.name,
                    child.spec.readiness_timeout()
                );
                self.begin_stop(idx, now);
            }
        }
        Ok(())
    }

    fn dispatch_probes(&mut self, now: Instant) {
        let interval = self.settings.probe_interval();
        let timeout = self.settings.probe_timeout();
        for idx in 0..self.children.len() {
            let child = &self.children[idx];
            if !child.status.is_live()
                || child.probe_in_flight.is_some()
                || child.stopping.is_some()
            {
                continue;
            }
            let Some(url) = child.spec.health_url_for(child.effective_port) else {
                continue;
            };
            if child
                .last_probe_time
                .is_some_and(|last| now.saturating_duration_since(last) < interval)
            {
                continue;
            }

            let seq = self.next_seq();
            let child = &mut self.children[idx];
            child.probe_in_flight = Some(seq);
            child.last_probe_time = Some(now);
            self.probes.dispatch(child.spec.name.clone(), seq, url, timeout);
        }
    }

    fn handle_probe(&mut self, result: ProbeResult, now: Instant) -> Result<()> {
        let Some(idx) = self
            .children
            .iter()
            .position(|c| c.spec.name == result.name)
        else {
            return Ok(());
        };
        let threshold = self.settings.unhealthy_threshold;
        let child = &mut self.children[idx];
        if child.probe_in_flight == Some(result.seq) {
            child.probe_in_flight = None;
        }
        if result.seq < child.transition_seq
            || !child.status.is_live()
            || child.stopping.is_some()
        {
            debug!("Discarding stale probe {}#{}", result.name, result.seq);
            return Ok(());
        }

        if result.outcome.is_healthy() {
            child.last_health_ok_time = Some(now);
            child.consecutive_failures = 0;
            if matches!(child.status, ChildStatus::Starting | ChildStatus::Unhealthy) {
                self.transition(idx, ChildStatus::Ready)?;
            }
            return Ok(());
        }

        child.consecutive_failures += 1;
        let failures = child.consecutive_failures;
        match child.status {
            ChildStatus::Starting => {
                debug!("{} not ready yet: {}", result.name, result.outcome);
            }
            ChildStatus::Ready => {
                warn!(
                    "{} health probe failed ({failures}/{threshold}): {}",
                    result.name, result.outcome
                );
                if failures >= threshold {
                    self.transition(idx, ChildStatus::Unhealthy)?;
                    if self.children[idx].spec.restart_on_unhealthy {
                        warn!("{} is unhealthy; restarting", result.name);
                        self.begin_stop(idx, now);
                    }
                }
            }
            ChildStatus::Unhealthy => {
                warn!("{} still unhealthy: {}", result.name, result.outcome);
            }
            _ => {}
        }
        Ok(())
    }

    /// SIGTERM one live child and let later ticks observe the exit or
    /// escalate once the grace period is over.
    fn begin_stop(&mut self, idx: usize, now: Instant) {
        let grace = self.settings.grace_period();
        let child = &mut self.children[idx];
        let Some(handle) = child.handle.as_mut() else {
            return;
        };
        handle.request_stop();
        child.stopping = Some(Stopping {
            deadline: deadline_after(now, grace),
            forced: false,
        });
        let name = self.name(idx);
        self.journal
            .record(&name, EventKind::TerminationRequested { forceful: false });
    }

    fn advance_stops(&mut self, now: Instant) -> Result<()> {
        for idx in 0..self.children.len() {
            let child = &mut self.children[idx];
            let Some(stopping) = child.stopping else {
                continue;
            };
            if now < stopping.deadline {
                continue;
            }
            let Some(handle) = child.handle.as_mut() else {
                child.stopping = None;
                continue;
            };
            if stopping.forced {
                return Err(SupervisorError::Fault(format!(
                    "{} could not be reaped {REAP_TIMEOUT:?} after SIGKILL",
                    child.spec.name
                )));
            }
            warn!(
                "{} ignored SIGTERM for {:?}; killing",
                child.spec.name,
                self.settings.grace_period()
            );
            handle.kill_now();
            child.stopping = Some(Stopping {
                deadline: deadline_after(now, REAP_TIMEOUT),
                forced: true,
            });
            let name = self.name(idx);
            self.journal
                .record(&name, EventKind::TerminationRequested { forceful: true });
        }
        Ok(())
    }

    fn apply_restart_policy(&mut self, now: Instant) -> Result<()> {
        for idx in 0..self.children.len() {
            let child = &self.children[idx];
            if child.status != ChildStatus::Exited {
                continue;
            }
            let input = RestartInput {
                restart_count: child.restart_count,
                last_exit_time: child.last_exit_time.unwrap_or(now),
                shutdown_requested: self.shutdown.is_requested(),
            };
            match self.policies[idx].decide(input, now) {
                RestartDecision::RestartImmediately => {
                    let child = &mut self.children[idx];
                    child.restart_count += 1;
                    info!(
                        "Restarting {} (attempt {}/{})",
                        child.spec.name, child.restart_count, child.spec.restart_policy.max_restarts
                    );
                    self.transition(idx, ChildStatus::Pending)?;
                    self.launch(idx)?;
                }
                RestartDecision::RestartAfter(wait) => {
                    debug!("{} restarts in {wait:?}", child.spec.name);
                }
                RestartDecision::GiveUp => {
                    let code = child
                        .last_exit_code
                        .map_or_else(|| "unknown".to_string(), |c| c.to_string());
                    let reason = format!(
                        "restart budget exhausted after {} restarts (last exit code {code})",
                        child.restart_count
                    );
                    self.mark_dead(idx, reason)?;
                }
            }
        }
        Ok(())
    }

    /// Launch tiers in order while the previous tier is fully Ready or Dead.
    fn advance_tiers(&mut self) -> Result<()> {
        while self.next_tier < self.tiers.len() {
            if self.next_tier > 0 {
                let prev = &self.tiers[self.next_tier - 1];
                let blocker = prev
                    .iter()
                    .map(|&i| &self.children[i])
                    .find(|c| c.spec.required && c.status == ChildStatus::Dead)
                    .map(|c| c.spec.name.clone());
                if let Some(blocker) = blocker {
                    self.block_later_tiers(&blocker)?;
                    return Ok(());
                }
                let settled = prev.iter().all(|&i| {
                    matches!(
                        self.children[i].status,
                        ChildStatus::Ready | ChildStatus::Dead
                    )
                });
                if !settled {
                    return Ok(());
                }
            }

            let tier = self.tiers[self.next_tier].clone();
            self.next_tier += 1;
            info!(
                "Launching tier {} (start_order {}): {}",
                self.next_tier - 1,
                self.children[tier[0]].spec.start_order,
                tier.iter()
                    .map(|&i| self.children[i].spec.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            for idx in tier {
                self.launch(idx)?;
            }
        }
        Ok(())
    }

    fn block_later_tiers(&mut self, blocker: &str) -> Result<()> {
        let later: Vec<usize> = self.tiers[self.next_tier..].iter().flatten().copied().collect();
        self.next_tier = self.tiers.len();
        for idx in later {
            if self.children[idx].status == ChildStatus::Pending {
                self.mark_dead(idx, format!("blocked by required service {blocker}"))?;
            }
        }
        Ok(())
    }

    /// Pending → Starting, or Pending → Dead if the port cannot be resolved or
    /// the OS refuses the spawn.
    fn launch(&mut self, idx: usize) -> Result<()> {
        let port = match self.resolve_port(idx) {
            Ok(port) => port,
            Err(e) => return self.mark_dead(idx, e.to_string()),
        };

        let spawned = ChildHandle::spawn(
            &self.children[idx].spec,
            port,
            self.settings.log_tail_bytes,
            &self.runtime,
        );
        self.children[idx].effective_port = port;
        match spawned {
            Ok(handle) => {
                let name = self.name(idx);
                self.journal
                    .record(&name, EventKind::Spawned { pid: handle.pid() });
                let child = &mut self.children[idx];
                child.output = Some(handle.output().clone());
                child.spawn_time = Some(Instant::now());
                child.spawned_at = Some(Utc::now());
                child.last_probe_time = None;
                child.handle = Some(handle);
                self.transition(idx, ChildStatus::Starting)
            }
            Err(e) => self.mark_dead(idx, e.to_string()),
        }
    }

    fn resolve_port(&self, idx: usize) -> Result<Option<u16>, PortResolutionError> {
        let spec = &self.children[idx].spec;
        let Some(desired) = spec.desired_port else {
            return Ok(None);
        };
        match spec.port_resolution {
            PortResolution::RequireExact => {
                if self.arbiter.is_free(desired)? {
                    Ok(Some(desired))
                } else {
                    Err(PortResolutionError::InUse(desired))
                }
            }
            PortResolution::KillConflicting => {
                if self.arbiter.is_free(desired)? {
                    return Ok(Some(desired));
                }
                info!("{}: port {desired} is taken; terminating its holder", spec.name);
                match self.arbiter.terminate_holder(desired) {
                    HolderOutcome::Vacated => Ok(Some(desired)),
                    outcome => Err(PortResolutionError::NotVacated {
                        port: desired,
                        outcome: outcome.to_string(),
                    }),
                }
            }
            PortResolution::FindNextFree => {
                let window = self.settings.port_scan_window;
                match self.arbiter.find_next_free(desired, window)? {
                    Some(port) => {
                        if port != desired {
                            info!("{}: port {desired} is taken; using {port}", spec.name);
                        }
                        Ok(Some(port))
                    }
                    None => Err(PortResolutionError::NoneFree {
                        start: desired,
                        end: u32::from(desired) + u32::from(window),
                    }),
                }
            }
        }
    }

    /// Stop everything. Never returns early: every live child is stopped or,
    /// past the outer deadline, killed without waiting.
    fn shutdown_all(&mut self) {
        for child in &mut self.children {
            child.status_at_shutdown = Some(child.status);
        }
        for idx in 0..self.children.len() {
            if self.children[idx].status == ChildStatus::Pending
                && let Err(e) = self.mark_dead(idx, "not started: shutdown requested".into())
            {
                error!("{e}");
            }
        }

        let grace = self.settings.grace_period();
        let live = self.children.iter().filter(|c| c.handle.is_some()).count() as u32;
        let budget = grace.saturating_mul(2).saturating_mul(live).max(grace);
        let deadline = deadline_after(Instant::now(), budget);
        info!("Shutting down {live} running children (deadline {budget:?})");

        for tier in self.tiers.clone().into_iter().rev() {
            self.stop_tier(tier, grace, deadline);
        }
    }

    /// Stop one tier's live children concurrently. Past `deadline` they are
    /// sent SIGKILL and left unreaped.
    fn stop_tier(&mut self, tier: Vec<usize>, grace: Duration, deadline: Instant) {
        let members: Vec<(usize, ChildHandle)> = tier
            .into_iter()
            .filter_map(|idx| self.children[idx].handle.take().map(|h| (idx, h)))
            .collect();
        if members.is_empty() {
            return;
        }

        let now = Instant::now();
        if now >= deadline {
            for (idx, mut handle) in members {
                let name = self.name(idx);
                warn!("{name}: shutdown deadline exceeded; killing without waiting");
                self.journal
                    .record(&name, EventKind::TerminationRequested { forceful: true });
                handle.kill_now();
            }
            return;
        }

        let tier_grace = grace.min(deadline - now);
        for (idx, _) in &members {
            let name = self.name(*idx);
            self.journal
                .record(&name, EventKind::TerminationRequested { forceful: false });
        }
        let stopped: Vec<Stopped> = thread::scope(|scope| {
            let workers: Vec<_> = members
                .into_iter()
                .map(|(idx, mut handle)| {
                    scope.spawn(move || {
                        let (forced_at, result) = stop_child(&mut handle, tier_grace);
                        Stopped {
                            idx,
                            handle,
                            forced_at,
                            result,
                            at: Instant::now(),
                        }
                    })
                })
                .collect();
            workers
                .into_iter()
                .filter_map(|worker| match worker.join() {
                    Ok(stopped) => Some(stopped),
                    Err(_) => {
                        error!("Shutdown worker panicked");
                        None
                    }
                })
                .collect()
        });
        for stopped in stopped {
            self.finish_stop(stopped);
        }
    }

    fn finish_stop(&mut self, stopped: Stopped) {
        let Stopped {
            idx,
            handle,
            forced_at,
            result,
            at,
        } = stopped;
        let name = self.name(idx);
        if let Some(forced_at) = forced_at {
            self.journal
                .record_at(forced_at, &name, EventKind::TerminationRequested { forceful: true });
        }
        match result {
            Ok(code) => {
                drop(handle);
                if let Err(e) = self.record_exit(idx, code, at) {
                    error!("{e}");
                }
            }
            Err(e) => error!("{name} could not be reaped: {e}"),
        }
    }
}

/// `(forced_at, exit code)`; `forced_at` is set when SIGKILL was needed.
fn stop_child(handle: &mut ChildHandle, grace: Duration) -> (Option<Instant>, io::Result<i32>) {
    match handle.terminate_graceful(grace) {
        Ok(GracefulOutcome::Exited(code)) => (None, Ok(code)),
        Ok(GracefulOutcome::TimedOut) => {
            let forced_at = Instant::now();
            (Some(forced_at), handle.terminate_forceful())
        }
        Err(e) => (None, Err(e)),
    }
}

/// Group consecutive children (already sorted) sharing a `start_order`.
fn tiers_of(children: &[ChildState]) -> Vec<Vec<usize>> {
    let mut tiers: Vec<Vec<usize>> = Vec::new();
    let mut current = None;
    for (idx, child) in children.iter().enumerate() {
        if current != Some(child.spec.start_order) {
            current = Some(child.spec.start_order);
            tiers.push(Vec::new());
        }
        if let Some(tier) = tiers.last_mut() {
            tier.push(idx);
        }
    }
    tiers
}
