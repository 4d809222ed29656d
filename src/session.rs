//! Sessions: a controller driven by its own tokio task.
//!
//! Callers talk to the task through a [`SessionHandle`]: commands go over an
//! unbounded channel, state comes back on a `watch` channel. The controller
//! itself only ever runs on blocking threads so allocation and worker joins
//! never stall the runtime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sysinfo::MINIMUM_CPU_UPDATE_INTERVAL;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::ControlConfig;
use crate::controller::{Controller, SessionParts, TickOutcome};
use crate::coordinate::Coordinator;
use crate::error::{FailureReason, GovernorError, Result};
use crate::governor::EmergencyStop;
use crate::state::{ControlState, StateSnapshot};
use crate::types::{ResourceKind, Target};

static SESSION_COUNTER: AtomicUsize = AtomicUsize::new(1);

fn next_session_id(kind: ResourceKind) -> String {
    let id = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{kind}-{id}")
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SessionSpec {
    pub kind: ResourceKind,
    pub target: Target,
    pub period: Duration,
}

impl SessionSpec {
    pub fn new(kind: ResourceKind, target: Target, period: Duration) -> Self {
        Self { kind, target, period }
    }
}

enum Command {
    SetTarget(Target),
    Stop,
}

enum Exit {
    Requested,
    Emergency,
    Failed,
}

/// Starts a session on the ambient tokio runtime with real workers.
pub fn start_session(spec: SessionSpec, config: &ControlConfig) -> Result<SessionHandle> {
    let handle = Handle::try_current().map_err(|_| GovernorError::NoRuntime)?;
    start_session_on(&handle, spec, config)
}

pub fn start_session_on(handle: &Handle, spec: SessionSpec, config: &ControlConfig) -> Result<SessionHandle> {
    launch_system(handle, spec, config, None)
}

/// Like [`start_session_on`], with the session posting to and deferring to
/// `coordinator`. Used when a CPU and a memory session run side by side.
pub fn start_coordinated(
    handle: &Handle,
    spec: SessionSpec,
    config: &ControlConfig,
    coordinator: &Coordinator,
) -> Result<SessionHandle> {
    launch_system(handle, spec, config, Some(coordinator.clone()))
}

fn launch_system(
    handle: &Handle,
    spec: SessionSpec,
    config: &ControlConfig,
    coordinator: Option<Coordinator>,
) -> Result<SessionHandle> {
    if spec.kind == ResourceKind::Cpu && spec.period < MINIMUM_CPU_UPDATE_INTERVAL {
        debug!(
            period_ms = spec.period.as_millis() as u64,
            refresh_ms = MINIMUM_CPU_UPDATE_INTERVAL.as_millis() as u64,
            "period is shorter than the cpu refresh interval, readings repeat between refreshes"
        );
    }
    let mut parts = SessionParts::system(spec.kind, config);
    parts.coordinator = coordinator;
    launch(handle, spec, config, parts)
}

/// Starts a session around caller-provided parts.
pub fn launch(handle: &Handle, spec: SessionSpec, config: &ControlConfig, parts: SessionParts) -> Result<SessionHandle> {
    let mut config = config.clone();
    config.period_ms = u64::try_from(spec.period.as_millis()).unwrap_or(u64::MAX);
    config.validate()?;

    let id = next_session_id(spec.kind);
    let emergency = parts.emergency.clone();
    let mut controller = Controller::new(id.clone(), spec.kind, spec.target, &config, parts);
    if spec.target.is_unusual_for(spec.kind) {
        let (low, high) = spec.kind.advisory_range();
        warn!(session = %id, target = %spec.target, low, high, "target outside the advisory range");
    }
    controller.start();

    let (state_tx, state_rx) = watch::channel(controller.snapshot());
    let state_tx = Arc::new(state_tx);
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();

    handle.spawn(drive(
        controller,
        commands_rx,
        Arc::clone(&state_tx),
        emergency.clone(),
        config.period(),
    ));

    Ok(SessionHandle {
        id,
        kind: spec.kind,
        commands: commands_tx,
        state_tx,
        state_rx,
        emergency,
    })
}

fn publish(state: &watch::Sender<StateSnapshot>, snapshot: StateSnapshot) {
    state.send_modify(|current| current.merge(snapshot));
}

async fn drive(
    mut controller: Controller,
    mut commands: mpsc::UnboundedReceiver<Command>,
    state: Arc<watch::Sender<StateSnapshot>>,
    emergency: EmergencyStop,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_tick: Option<Instant> = None;

    let exit = loop {
        tokio::select! {
            biased;
            _ = emergency.tripped() => break Exit::Emergency,
            command = commands.recv() => match command {
                Some(Command::SetTarget(target)) => {
                    controller.set_target(target);
                    publish(&state, controller.snapshot());
                }
                Some(Command::Stop) | None => break Exit::Requested,
            },
            _ = interval.tick() => {
                let started = Instant::now();
                if let Some(previous) = last_tick {
                    let missed = started.duration_since(previous).as_nanos() / period.as_nanos().max(1);
                    if missed > 1 {
                        controller.note_skipped(u64::try_from(missed - 1).unwrap_or(u64::MAX));
                    }
                }
                last_tick = Some(started);

                let joined = tokio::task::spawn_blocking(move || {
                    let outcome = controller.tick();
                    (controller, outcome)
                })
                .await;
                let (returned, outcome) = match joined {
                    Ok(done) => done,
                    Err(err) => {
                        error!(error = %err, "control tick panicked");
                        abandon(&state, err.to_string());
                        return;
                    }
                };
                controller = returned;

                let took = started.elapsed();
                if took > period {
                    controller.note_overrun(took);
                }
                publish(&state, controller.snapshot());
                if matches!(outcome, TickOutcome::Failed(_)) {
                    break Exit::Failed;
                }
            }
        }
    };

    match exit {
        Exit::Emergency => info!(session = %controller.id(), "emergency stop"),
        Exit::Requested => info!(session = %controller.id(), "stop requested"),
        Exit::Failed => {}
    }
    controller.begin_stop();
    publish(&state, controller.snapshot());

    let joined = tokio::task::spawn_blocking(move || {
        let result = controller.shutdown();
        (controller, result)
    })
    .await;
    match joined {
        Ok((controller, _)) => publish(&state, controller.snapshot()),
        Err(err) => abandon(&state, err.to_string()),
    }
}

/// Marks the session failed after its controller was lost.
fn abandon(state: &watch::Sender<StateSnapshot>, detail: String) {
    state.send_modify(|current| {
        if current.state.can_advance_to(ControlState::Failed) {
            current.state = ControlState::Failed;
            current.failure = Some(FailureReason::InvariantViolation { detail });
        }
    });
}

/// Caller's side of a running session. Cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    kind: ResourceKind,
    commands: mpsc::UnboundedSender<Command>,
    state_tx: Arc<watch::Sender<StateSnapshot>>,
    state_rx: watch::Receiver<StateSnapshot>,
    emergency: EmergencyStop,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Live target change; workers keep running.
    pub fn set_target(&self, target: Target) -> Result<()> {
        if self.state().state != ControlState::Running {
            return Err(GovernorError::SessionClosed(self.id.clone()));
        }
        self.commands
            .send(Command::SetTarget(target))
            .map_err(|_| GovernorError::SessionClosed(self.id.clone()))
    }

    /// Graceful stop. Calling it again, or after the session ended, does nothing.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    /// Immediate stop: workers halt at their next phase boundary and the
    /// published state becomes Stopping right away.
    pub fn emergency_stop(&self) {
        self.emergency.trip();
        self.state_tx.send_modify(|current| {
            if current.state.can_advance_to(ControlState::Stopping) {
                current.state = ControlState::Stopping;
            }
        });
    }

    pub fn state(&self) -> StateSnapshot {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.state_rx.clone()
    }

    /// Resolves with the first Stopped or Failed snapshot.
    pub async fn wait_terminal(&self) -> StateSnapshot {
        let mut rx = self.state_rx.clone();
        let result = rx.wait_for(|snapshot| snapshot.state.is_terminal()).await;
        match result {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.state(),
        }
    }

    pub async fn stop_and_wait(&self) -> StateSnapshot {
        self.stop();
        self.wait_terminal().await
    }
}
