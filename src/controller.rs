//! The feedback loop body.
//!
//! The controller works in "induced percentage points": the share of the
//! resource its own workers are responsible for. Each tick it compares the
//! smoothed reading with the target, moves the induced load by the control
//! law's step, translates that into an [`Actuation`], lets the governor lower
//! it, and applies it. The induced load is then recomputed from what the pool
//! actually reached so ceilings and allocation shortfalls never wind up the
//! integrator.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::ControlConfig;
use crate::coordinate::{Coordinator, Standing};
use crate::error::{FailureReason, GovernorError, Result};
use crate::governor::{EmergencyStop, Governor, Limits};
use crate::pool::{CpuPool, MemoryPool, WorkerPool};
use crate::sampler::{Probe, Reading, Sampler, SystemProbe};
use crate::state::{ControlState, Diagnostics, StateSnapshot};
use crate::types::{Actuation, ResourceKind, Target};

/// Velocity-form PI law with a per-tick step clamp and a deadband.
#[derive(Clone, Debug)]
pub struct ControlLaw {
    kp: f64,
    ki: f64,
    max_step: f64,
    deadband: f64,
    prev_error: Option<f64>,
}

impl ControlLaw {
    pub fn new(kp: f64, ki: f64, max_step: f64, deadband: f64) -> Self {
        Self {
            kp,
            ki,
            max_step,
            deadband,
            prev_error: None,
        }
    }

    pub fn from_config(config: &ControlConfig) -> Self {
        Self::new(config.kp, config.ki, config.max_step_percent, config.deadband_percent)
    }

    /// Change of induced load, in percentage points, for the given error.
    pub fn step(&mut self, error: f64) -> f64 {
        let error = if !error.is_finite() || error.abs() < self.deadband {
            0.0
        } else {
            error
        };
        let change = self.prev_error.map_or(0.0, |prev| error - prev);
        self.prev_error = Some(error);
        (self.ki * error + self.kp * change).clamp(-self.max_step, self.max_step)
    }

    /// Forgets the error history.
    pub fn reset(&mut self) {
        self.prev_error = None;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TickOutcome {
    Adjusted(Actuation),
    /// Stale reading; the previous actuation stays in place.
    Held { consecutive: u32 },
    Failed(FailureReason),
}

/// The pieces a controller drives, chosen per environment.
pub struct SessionParts {
    pub probe: Box<dyn Probe>,
    pub pool: Box<dyn WorkerPool>,
    pub logical_cpus: usize,
    pub emergency: EmergencyStop,
    /// Shared with a session driving the other resource, if any.
    pub coordinator: Option<Coordinator>,
}

impl SessionParts {
    /// Real workers measured through `sysinfo`.
    pub fn system(kind: ResourceKind, config: &ControlConfig) -> Self {
        let emergency = EmergencyStop::new();
        let pool: Box<dyn WorkerPool> = match kind {
            ResourceKind::Cpu => Box::new(CpuPool::new(config.cpu_cycle(), emergency.halt())),
            ResourceKind::Memory => Box::new(MemoryPool::new(config.memory_chunk_bytes, config.touch_memory)),
        };
        Self {
            probe: Box::new(SystemProbe::new(kind)),
            pool,
            logical_cpus: num_cpus::get(),
            emergency,
            coordinator: None,
        }
    }

    pub fn with_coordinator(mut self, coordinator: Coordinator) -> Self {
        self.coordinator = Some(coordinator);
        self
    }
}

pub struct Controller {
    id: String,
    kind: ResourceKind,
    target: Target,
    law: ControlLaw,
    sampler: Sampler,
    pool: Box<dyn WorkerPool>,
    governor: Governor,
    coordinator: Option<Coordinator>,
    holding_for_peer: bool,
    logical_cpus: usize,
    stale_threshold: u32,
    retirement_timeout: Duration,
    induced: f64,
    state: ControlState,
    ticks: u64,
    diagnostics: Diagnostics,
    reading: Option<Reading>,
    failure: Option<FailureReason>,
}

impl Controller {
    pub fn new(id: String, kind: ResourceKind, target: Target, config: &ControlConfig, parts: SessionParts) -> Self {
        Self {
            id,
            kind,
            target,
            law: ControlLaw::from_config(config),
            sampler: Sampler::new(kind, parts.probe, config.smoothing_alpha),
            pool: parts.pool,
            governor: Governor::new(Limits::from_config(config), parts.emergency),
            coordinator: parts.coordinator,
            holding_for_peer: false,
            logical_cpus: parts.logical_cpus.max(1),
            stale_threshold: config.stale_tick_threshold,
            retirement_timeout: config.retirement_timeout(),
            induced: 0.0,
            state: ControlState::Idle,
            ticks: 0,
            diagnostics: Diagnostics::default(),
            reading: None,
            failure: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn start(&mut self) {
        if self.advance(ControlState::Running) {
            info!(session = %self.id, kind = %self.kind, target = %self.target, "session running");
        }
    }

    /// Replaces the target; error history restarts, workers are left as they are.
    pub fn set_target(&mut self, target: Target) {
        if target.is_unusual_for(self.kind) {
            let (low, high) = self.kind.advisory_range();
            warn!(session = %self.id, %target, low, high, "target outside the advisory range");
        }
        info!(session = %self.id, from = %self.target, to = %target, "target changed");
        self.target = target;
        self.law.reset();
    }

    /// One pass of the loop. Does nothing unless the session is running.
    pub fn tick(&mut self) -> TickOutcome {
        if self.state != ControlState::Running {
            return TickOutcome::Held {
                consecutive: self.diagnostics.consecutive_stale_ticks,
            };
        }
        self.ticks += 1;

        let maintenance = self.pool.maintain();
        self.diagnostics.respawned_workers += maintenance.respawned as u64;

        let reading = self.sampler.sample();
        self.reading = Some(reading.clone());

        if reading.stale {
            self.diagnostics.consecutive_stale_ticks += 1;
            self.diagnostics.total_stale_ticks += 1;
            let consecutive = self.diagnostics.consecutive_stale_ticks;
            warn!(session = %self.id, consecutive, threshold = self.stale_threshold, "stale reading, holding actuation");
            if consecutive > self.stale_threshold {
                return self.fail(FailureReason::SamplerStale { consecutive });
            }
            return TickOutcome::Held { consecutive };
        }
        self.diagnostics.consecutive_stale_ticks = 0;

        if let Some(coordinator) = &self.coordinator {
            let standing = Standing {
                percent: reading.percent,
                target: self.target.percent(),
                induced: self.induced,
            };
            coordinator.report(self.kind, standing);
        }

        let error = self.target.percent() - reading.percent;
        let mut step = self.law.step(error);
        if step > 0.0 && self.peer_holds_rise() {
            step = 0.0;
        } else {
            self.holding_for_peer = false;
        }
        let wanted = (self.induced + step).clamp(0.0, 100.0);
        let requested = self.translate(wanted, &reading);

        let clamp = self.governor.clamp(requested, &reading, self.pool.current());
        if clamp.vetoed {
            self.diagnostics.governor_vetoes += 1;
            info!(session = %self.id, ?requested, allowed = ?clamp.allowed, "governor lowered actuation");
        }

        let achieved = match self.pool.scale_to(clamp.allowed) {
            Ok(achieved) => achieved,
            Err(GovernorError::AllocationFailure { requested, achieved }) => {
                self.diagnostics.allocation_failures += 1;
                self.diagnostics.last_error = Some(format!("allocated {achieved} of {requested} bytes"));
                warn!(session = %self.id, requested, achieved, "allocation fell short, clamping to what was obtained");
                self.pool.current()
            }
            Err(err @ GovernorError::WorkerSpawn(_)) => {
                self.diagnostics.spawn_failures += 1;
                warn!(session = %self.id, error = %err, "worker spawn failed");
                self.diagnostics.last_error = Some(err.to_string());
                self.pool.current()
            }
            Err(err) => {
                return self.fail(FailureReason::InvariantViolation {
                    detail: err.to_string(),
                })
            }
        };

        self.induced = self.percent_of(&achieved, &reading);
        debug!(
            session = %self.id,
            reading = reading.percent,
            error,
            step,
            induced = self.induced,
            ?achieved,
            "tick"
        );
        TickOutcome::Adjusted(achieved)
    }

    fn peer_holds_rise(&mut self) -> bool {
        let Some((peer, standing)) = self.coordinator.as_ref().and_then(|c| c.holds_rise(self.kind)) else {
            return false;
        };
        self.diagnostics.coordination_holds += 1;
        if !self.holding_for_peer {
            info!(
                session = %self.id,
                %peer,
                peer_percent = standing.percent,
                peer_target = standing.target,
                "peer above its target, holding further load"
            );
        }
        self.holding_for_peer = true;
        true
    }

    fn withdraw(&self) {
        if let Some(coordinator) = &self.coordinator {
            coordinator.withdraw(self.kind);
        }
    }

    /// Load in induced percentage points to concrete workers or bytes.
    fn translate(&self, induced: f64, reading: &Reading) -> Actuation {
        match self.kind {
            ResourceKind::Cpu => {
                let cores = induced / 100.0 * self.logical_cpus as f64;
                if cores <= 0.0 {
                    return Actuation::idle(ResourceKind::Cpu);
                }
                let limits = self.governor.limits();
                // add workers before any duty would pass the per-worker ceiling
                let workers = ((cores / limits.max_duty).ceil() as usize).clamp(1, limits.max_workers.max(1));
                Actuation::Cpu {
                    workers,
                    duty: cores / workers as f64,
                }
            }
            ResourceKind::Memory => Actuation::Memory {
                bytes: (induced / 100.0 * reading.total_bytes as f64) as u64,
            },
        }
    }

    fn percent_of(&self, actuation: &Actuation, reading: &Reading) -> f64 {
        match actuation {
            Actuation::Cpu { .. } => actuation.busy_cores() / self.logical_cpus as f64 * 100.0,
            Actuation::Memory { bytes } if reading.total_bytes > 0 => *bytes as f64 / reading.total_bytes as f64 * 100.0,
            Actuation::Memory { .. } => 0.0,
        }
    }

    pub fn note_skipped(&mut self, ticks: u64) {
        self.diagnostics.skipped_ticks += ticks;
        debug!(session = %self.id, ticks, "ticks skipped");
    }

    pub fn note_overrun(&mut self, took: Duration) {
        self.diagnostics.overrun_ticks += 1;
        warn!(session = %self.id, took_ms = took.as_millis() as u64, "tick overran its period");
    }

    pub fn fail(&mut self, reason: FailureReason) -> TickOutcome {
        error!(session = %self.id, %reason, "session failed");
        self.withdraw();
        self.advance(ControlState::Failed);
        self.failure = Some(reason.clone());
        TickOutcome::Failed(reason)
    }

    /// Running to Stopping. False if the session was already past it.
    pub fn begin_stop(&mut self) -> bool {
        let moved = self.advance(ControlState::Stopping);
        if moved {
            info!(session = %self.id, "session stopping");
        }
        moved
    }

    /// Retires every worker. A stopping session ends Stopped even when some
    /// workers outlived the timeout; the timeout is returned to the caller.
    pub fn shutdown(&mut self) -> Result<()> {
        self.withdraw();
        let result = self.pool.stop_all(self.retirement_timeout);
        if let Err(err) = &result {
            self.diagnostics.retirement_timeouts += 1;
            self.diagnostics.last_error = Some(err.to_string());
            warn!(session = %self.id, error = %err, "workers did not retire in time, detached");
        }
        self.induced = 0.0;
        if self.state != ControlState::Failed {
            self.advance(ControlState::Stopping);
            self.advance(ControlState::Stopped);
            info!(session = %self.id, ticks = self.ticks, "session stopped");
        }
        result
    }

    fn advance(&mut self, next: ControlState) -> bool {
        if self.state.can_advance_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let duty = match self.pool.current() {
            Actuation::Cpu { duty, .. } => duty,
            Actuation::Memory { .. } => 0.0,
        };
        StateSnapshot {
            session_id: self.id.clone(),
            kind: self.kind,
            state: self.state,
            target: self.target,
            reading: self.reading.clone(),
            active_workers: self.pool.active_workers(),
            resident_bytes: self.pool.resident_bytes(),
            duty,
            induced_percent: self.induced,
            ticks: self.ticks,
            diagnostics: self.diagnostics.clone(),
            failure: self.failure.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn law_clamps_step_and_ignores_small_errors() {
        let mut law = ControlLaw::new(0.2, 0.4, 10.0, 0.5);
        assert_eq!(law.step(60.0), 10.0);
        assert_eq!(law.step(0.3), -10.0);
        law.reset();
        assert_eq!(law.step(0.3), 0.0);
        assert_eq!(law.step(f64::NAN), 0.0);
    }

    #[test]
    fn law_first_step_is_integral_only() {
        let mut law = ControlLaw::new(0.2, 0.4, 10.0, 0.5);
        assert!((law.step(5.0) - 2.0).abs() < 1e-9);
        // 0.4 * 3 + 0.2 * (3 - 5)
        assert!((law.step(3.0) - 0.8).abs() < 1e-9);
    }
}
