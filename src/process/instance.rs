//! Supervision of a single instance slot.
//!
//! Each slot is an actor: one tokio task owns the slot's [`InstanceState`],
//! its current [`ProcessHandle`] and its failure history, and reacts to
//! commands sent through [`InstanceSupervisor`]. While a process runs, the
//! actor races three things in one `select!`: the exit wait, the memory
//! watchdog and incoming commands. Whichever resolves first ends the
//! episode; the other futures are dropped with it, so a late exit or a
//! late memory breach can never be acted on twice.
//!
//! ```text
//! pending ──start──► starting ──► running ──stop──► stopping ──► stopped
//!                       ▲            │
//!                       │      exit / memory
//!                       │            ▼
//!                       └──delay── restarting ──give up──► failed ──stop──► stopped
//! ```
//!
//! A slot stopped after giving up keeps `failed_permanently` set until it is
//! started again.

use crate::config::AppSpec;
use crate::error::{Result, WardenError};
use crate::process::events::EventBus;
use crate::process::handle::ProcessHandle;
use crate::process::monitor::{MemoryBreach, MemoryProbe, MemoryWatchdog};
use crate::process::restart::{ExitCause, RestartAction, RestartDecision, RestartPolicy};
use crate::process::types::{EventKind, ExitInfo, InstanceState, InstanceStatus, LifecycleEvent};
use chrono::Utc;
use nix::sys::signal::Signal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

pub(crate) enum Command {
    Start,
    Stop(oneshot::Sender<()>),
    Restart,
    UpdateSpec(Arc<AppSpec>),
}

/// Control handle for one slot's actor.
///
/// Dropping it closes the command channel; the actor then stops its process
/// and exits.
pub struct InstanceSupervisor {
    slot: usize,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<InstanceState>,
    task: JoinHandle<()>,
}

impl InstanceSupervisor {
    /// Spawn the actor for `slot`; the slot stays `pending` until started
    pub fn spawn(
        slot: usize,
        spec: Arc<AppSpec>,
        bus: EventBus,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(InstanceState::new(slot));

        let actor = InstanceActor {
            slot,
            policy: RestartPolicy::from_spec(&spec),
            spec,
            bus,
            probe,
            state: state_tx,
            commands: commands_rx,
        };
        let task = tokio::spawn(actor.run());

        Self {
            slot,
            commands: commands_tx,
            state: state_rx,
            task,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Current state of the slot
    pub fn snapshot(&self) -> InstanceState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state change of the slot
    pub fn watch_state(&self) -> watch::Receiver<InstanceState> {
        self.state.clone()
    }

    /// Launch the slot if it is pending, stopped or failed
    pub fn start(&self) -> Result<()> {
        self.send(Command::Start)
    }

    /// Stop then start the running process; launch the slot if it is idle
    pub fn restart(&self) -> Result<()> {
        self.send(Command::Restart)
    }

    /// Use `spec` for every later spawn; the running process is untouched
    pub fn update_spec(&self, spec: Arc<AppSpec>) -> Result<()> {
        self.send(Command::UpdateSpec(spec))
    }

    /// Ask the slot to stop; the receiver resolves once it has settled
    pub fn request_stop(&self) -> Result<oneshot::Receiver<()>> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(Command::Stop(ack_tx))?;
        Ok(ack_rx)
    }

    /// Stop the slot and wait until it is no longer running
    pub async fn stop(&self) -> Result<()> {
        self.request_stop()?
            .await
            .map_err(|_| WardenError::SupervisorGone(self.slot))
    }

    /// Stop the slot and tear the actor down
    pub async fn shutdown(self) {
        if let Err(e) = self.stop().await {
            debug!(slot = self.slot, "stop during shutdown: {}", e);
        }

        let InstanceSupervisor { commands, task, .. } = self;
        drop(commands);
        if let Err(e) = task.await {
            error!("instance actor panicked: {}", e);
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| WardenError::SupervisorGone(self.slot))
    }
}

/// Where the actor goes next
enum Next {
    /// Wait for a command
    Idle,
    /// Spawn a process; `scheduled` when the policy ordered it
    Launch { scheduled: bool },
    /// Sleep before a scheduled launch; cancellable by commands
    Backoff(Duration),
    /// The owner is gone
    Shutdown,
}

/// What ended a running episode
enum Episode {
    Exited(ExitInfo),
    MemoryExceeded(MemoryBreach),
    Command(Option<Command>),
    Stable,
}

struct InstanceActor {
    slot: usize,
    spec: Arc<AppSpec>,
    policy: RestartPolicy,
    bus: EventBus,
    probe: Arc<dyn MemoryProbe>,
    state: watch::Sender<InstanceState>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl InstanceActor {
    async fn run(mut self) {
        let mut next = Next::Idle;
        loop {
            next = match next {
                Next::Idle => self.idle().await,
                Next::Launch { scheduled } => self.launch(scheduled).await,
                Next::Backoff(delay) => self.backoff(delay).await,
                Next::Shutdown => break,
            };
        }
        debug!(app = %self.spec.name, slot = self.slot, "instance actor exited");
    }

    async fn idle(&mut self) -> Next {
        let Some(command) = self.commands.recv().await else {
            return Next::Shutdown;
        };

        let status = self.state.borrow().status;
        match command {
            Command::Start | Command::Restart if status.is_startable() => {
                let gave_up = self.state.borrow().failed_permanently;
                if gave_up {
                    self.update(|s| {
                        s.consecutive_failures = 0;
                        s.failed_permanently = false;
                    });
                }
                Next::Launch { scheduled: false }
            }
            Command::Start | Command::Restart => Next::Idle,
            Command::Stop(ack) => {
                match status {
                    InstanceStatus::Pending => {
                        self.update(|s| s.status = InstanceStatus::Stopped);
                        self.emit(EventKind::Stopped, "stopped before start");
                    }
                    InstanceStatus::Failed => {
                        self.update(|s| s.status = InstanceStatus::Stopped);
                        self.emit(EventKind::Stopped, "stopped after restarts were exhausted");
                    }
                    _ => {}
                }
                let _ = ack.send(());
                Next::Idle
            }
            Command::UpdateSpec(spec) => {
                self.apply_spec(spec);
                Next::Idle
            }
        }
    }

    async fn launch(&mut self, scheduled: bool) -> Next {
        self.update(|s| s.status = InstanceStatus::Starting);
        if scheduled {
            self.emit(EventKind::Starting, "scheduled restart");
        }

        match ProcessHandle::spawn(&self.spec, self.slot) {
            Ok(handle) => {
                let pid = handle.pid();
                self.update(|s| {
                    s.status = InstanceStatus::Running;
                    s.pid = Some(pid);
                    s.last_started_at = Some(Utc::now());
                    s.memory_usage = None;
                });
                info!(app = %self.spec.name, slot = self.slot, pid, "instance started");
                self.emit(EventKind::Started { pid }, handle.name().to_string());
                self.supervise(handle).await
            }
            Err(e) => {
                warn!(app = %self.spec.name, slot = self.slot, "{}", e);
                let failures = self.state.borrow().consecutive_failures;
                let decision =
                    self.policy
                        .decide(&ExitCause::SpawnFailed(e.to_string()), Duration::ZERO, failures);
                self.apply_decision(decision)
            }
        }
    }

    async fn supervise(&mut self, mut handle: ProcessHandle) -> Next {
        let pid = handle.pid();
        let stable_at = Instant::now() + self.policy.min_uptime;
        let mut stable = false;

        let state = &self.state;
        let watchdog = self.spec.max_memory.map(|limit| {
            MemoryWatchdog::new(
                pid,
                limit,
                self.spec.memory_check_interval(),
                Arc::clone(&self.probe),
            )
        });
        let memory = async move {
            match watchdog {
                Some(watchdog) => {
                    watchdog
                        .watch(|rss| state.send_modify(|s| s.memory_usage = Some(rss)))
                        .await
                }
                None => std::future::pending().await,
            }
        };
        tokio::pin!(memory);

        loop {
            let episode = tokio::select! {
                exit = handle.wait() => Episode::Exited(exit.unwrap_or_else(|e| {
                    warn!(slot = self.slot, pid, "wait failed: {}", e);
                    ExitInfo::unknown()
                })),
                breach = &mut memory => Episode::MemoryExceeded(breach),
                command = self.commands.recv() => Episode::Command(command),
                _ = sleep_until(stable_at), if !stable => Episode::Stable,
            };

            match episode {
                Episode::Stable => {
                    stable = true;
                    self.state.send_modify(|s| s.consecutive_failures = 0);
                    debug!(slot = self.slot, pid, "instance reached min uptime");
                }
                Episode::Exited(exit) => {
                    let uptime = handle.uptime();
                    self.state.send_modify(|s| {
                        s.pid = None;
                        s.last_exit = Some(exit);
                    });
                    warn!(app = %self.spec.name, slot = self.slot, pid, "instance exited: {}", exit);
                    self.emit(EventKind::Exited(exit), format!("{} after {:?}", exit, uptime));

                    let failures = self.state.borrow().consecutive_failures;
                    let decision = self
                        .policy
                        .decide(&ExitCause::Exited(exit), uptime, failures);
                    return self.apply_decision(decision);
                }
                Episode::MemoryExceeded(MemoryBreach { rss, limit }) => {
                    let uptime = handle.uptime();
                    // No longer healthy while the grace period runs
                    self.state.send_modify(|s| s.status = InstanceStatus::Restarting);
                    self.emit(
                        EventKind::MemoryExceeded { rss, limit },
                        format!("{} bytes over ceiling {} bytes", rss, limit),
                    );

                    let exit = self.terminate(&mut handle).await;
                    self.state.send_modify(|s| {
                        s.pid = None;
                        s.last_exit = Some(exit);
                    });

                    let failures = self.state.borrow().consecutive_failures;
                    let decision = self.policy.decide(
                        &ExitCause::MemoryExceeded { rss, limit },
                        uptime,
                        failures,
                    );
                    return self.apply_decision(decision);
                }
                Episode::Command(Some(Command::Stop(ack))) => {
                    self.stop_running(&mut handle).await;
                    let _ = ack.send(());
                    return Next::Idle;
                }
                Episode::Command(Some(Command::Restart)) => {
                    self.stop_running(&mut handle).await;
                    self.state.send_modify(|s| s.restarts += 1);
                    return Next::Launch { scheduled: false };
                }
                Episode::Command(Some(Command::Start)) => {}
                Episode::Command(Some(Command::UpdateSpec(spec))) => {
                    // The watchdog borrows `state`; update fields directly
                    self.policy = RestartPolicy::from_spec(&spec);
                    self.spec = spec;
                }
                Episode::Command(None) => {
                    self.stop_running(&mut handle).await;
                    return Next::Shutdown;
                }
            }
        }
    }

    async fn backoff(&mut self, delay: Duration) -> Next {
        let deadline = sleep(delay);
        tokio::pin!(deadline);

        loop {
            let command = tokio::select! {
                biased;
                command = self.commands.recv() => Some(command),
                _ = &mut deadline => None,
            };

            match command {
                None => return Next::Launch { scheduled: true },
                Some(None) => return Next::Shutdown,
                Some(Some(Command::Stop(ack))) => {
                    self.update(|s| s.status = InstanceStatus::Stopped);
                    info!(app = %self.spec.name, slot = self.slot, "pending restart cancelled by stop");
                    self.emit(EventKind::Stopped, "pending restart cancelled");
                    let _ = ack.send(());
                    return Next::Idle;
                }
                Some(Some(Command::Restart)) => return Next::Launch { scheduled: true },
                Some(Some(Command::Start)) => {}
                Some(Some(Command::UpdateSpec(spec))) => self.apply_spec(spec),
            }
        }
    }

    /// Record a policy decision and move to `restarting` or `failed`
    fn apply_decision(&self, decision: RestartDecision) -> Next {
        let RestartDecision {
            action,
            reason,
            consecutive_failures,
        } = decision;
        self.update(|s| s.consecutive_failures = consecutive_failures);

        match action {
            RestartAction::GiveUp => {
                self.update(|s| {
                    s.status = InstanceStatus::Failed;
                    s.failed_permanently = true;
                });
                error!(app = %self.spec.name, slot = self.slot, "giving up: {}", reason);
                self.emit(EventKind::FailedPermanently, reason);
                Next::Idle
            }
            RestartAction::RestartNow | RestartAction::RestartAfter(_) => {
                let delay = action.delay().unwrap_or_default();
                self.update(|s| {
                    s.status = InstanceStatus::Restarting;
                    s.restarts += 1;
                });
                info!(
                    app = %self.spec.name,
                    slot = self.slot,
                    failures = consecutive_failures,
                    "restarting in {:?}: {}",
                    delay,
                    reason
                );
                self.emit(EventKind::Restarting { delay }, reason);
                Next::Backoff(delay)
            }
        }
    }

    /// Graceful stop on request: `running → stopping → stopped`
    async fn stop_running(&self, handle: &mut ProcessHandle) {
        self.update(|s| s.status = InstanceStatus::Stopping);
        self.emit(EventKind::Stopping, format!("pid {}", handle.pid()));

        let exit = self.terminate(handle).await;
        self.update(|s| {
            s.status = InstanceStatus::Stopped;
            s.pid = None;
            s.last_exit = Some(exit);
        });
        info!(app = %self.spec.name, slot = self.slot, "instance stopped: {}", exit);
        self.emit(EventKind::Stopped, exit.to_string());
    }

    /// Stop signal, grace period, then SIGKILL
    async fn terminate(&self, handle: &mut ProcessHandle) -> ExitInfo {
        let signal = self.spec.stop_signal().unwrap_or(Signal::SIGTERM);
        match handle.shutdown(signal, self.spec.kill_timeout()).await {
            Ok(exit) => exit,
            Err(e) => {
                error!(slot = self.slot, pid = handle.pid(), "failed to stop process: {}", e);
                ExitInfo::unknown()
            }
        }
    }

    fn apply_spec(&mut self, spec: Arc<AppSpec>) {
        self.policy = RestartPolicy::from_spec(&spec);
        self.spec = spec;
    }

    fn update(&self, modify: impl FnOnce(&mut InstanceState)) {
        self.state.send_modify(modify);
    }

    fn emit(&self, kind: EventKind, detail: impl Into<String>) {
        self.bus.emit(LifecycleEvent::new(self.slot, kind, detail));
    }
}
