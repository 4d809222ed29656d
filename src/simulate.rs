//! A stand-in machine for dry runs and tests.
//!
//! The plant's utilization is its baseline plus whatever the simulated pool
//! currently induces, capped at 100%. Probes and pools made from the same
//! plant share its state.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::controller::SessionParts;
use crate::error::{GovernorError, Result};
use crate::governor::EmergencyStop;
use crate::pool::{Maintenance, WorkerPool};
use crate::sampler::{Probe, ProbeError, RawSample};
use crate::types::{Actuation, ResourceKind};

struct PlantState {
    baseline: f64,
    logical_cpus: usize,
    total_bytes: u64,
    cpu: Actuation,
    memory: Actuation,
    pending_failures: u32,
    allocation_limit: Option<u64>,
    applied: Vec<Actuation>,
}

impl PlantState {
    fn induced(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Cpu => self.cpu.busy_cores() / self.logical_cpus as f64 * 100.0,
            ResourceKind::Memory if self.total_bytes > 0 => self.memory.bytes() as f64 / self.total_bytes as f64 * 100.0,
            ResourceKind::Memory => 0.0,
        }
    }

    fn slot(&mut self, kind: ResourceKind) -> &mut Actuation {
        match kind {
            ResourceKind::Cpu => &mut self.cpu,
            ResourceKind::Memory => &mut self.memory,
        }
    }
}

#[derive(Clone)]
pub struct SimulatedPlant {
    state: Arc<Mutex<PlantState>>,
}

impl SimulatedPlant {
    pub fn new(baseline_percent: f64, logical_cpus: usize, total_bytes: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(PlantState {
                baseline: baseline_percent.clamp(0.0, 100.0),
                logical_cpus: logical_cpus.max(1),
                total_bytes,
                cpu: Actuation::idle(ResourceKind::Cpu),
                memory: Actuation::idle(ResourceKind::Memory),
                pending_failures: 0,
                allocation_limit: None,
                applied: Vec::new(),
            })),
        }
    }

    pub fn logical_cpus(&self) -> usize {
        self.state.lock().logical_cpus
    }

    pub fn set_baseline(&self, percent: f64) {
        self.state.lock().baseline = percent.clamp(0.0, 100.0);
    }

    /// Makes the next `count` probe calls fail.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().pending_failures = count;
    }

    /// Memory requests above `limit` bytes come back short.
    pub fn set_allocation_limit(&self, limit: Option<u64>) {
        self.state.lock().allocation_limit = limit;
    }

    pub fn utilization(&self, kind: ResourceKind) -> f64 {
        let state = self.state.lock();
        (state.baseline + state.induced(kind)).min(100.0)
    }

    pub fn actuation(&self, kind: ResourceKind) -> Actuation {
        *self.state.lock().slot(kind)
    }

    /// Every actuation a pool has applied, oldest first.
    pub fn applied(&self) -> Vec<Actuation> {
        self.state.lock().applied.clone()
    }

    pub fn probe(&self, kind: ResourceKind) -> SimulatedProbe {
        SimulatedProbe {
            plant: self.clone(),
            kind,
        }
    }

    pub fn pool(&self, kind: ResourceKind) -> SimulatedPool {
        SimulatedPool {
            plant: self.clone(),
            kind,
        }
    }

    pub fn session_parts(&self, kind: ResourceKind) -> SessionParts {
        SessionParts {
            probe: Box::new(self.probe(kind)),
            pool: Box::new(self.pool(kind)),
            logical_cpus: self.logical_cpus(),
            emergency: EmergencyStop::new(),
            coordinator: None,
        }
    }
}

pub struct SimulatedProbe {
    plant: SimulatedPlant,
    kind: ResourceKind,
}

impl Probe for SimulatedProbe {
    fn measure(&mut self) -> std::result::Result<RawSample, ProbeError> {
        let mut state = self.plant.state.lock();
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            return Err(ProbeError::Unavailable("simulated outage".into()));
        }
        let percent = (state.baseline + state.induced(self.kind)).min(100.0);
        let (used, available, total) = match self.kind {
            ResourceKind::Cpu => (0, 0, 0),
            ResourceKind::Memory => {
                let used = (percent / 100.0 * state.total_bytes as f64) as u64;
                (used, state.total_bytes - used.min(state.total_bytes), state.total_bytes)
            }
        };
        Ok(RawSample {
            percent,
            used_bytes: used,
            available_bytes: available,
            total_bytes: total,
        })
    }
}

pub struct SimulatedPool {
    plant: SimulatedPlant,
    kind: ResourceKind,
}

impl WorkerPool for SimulatedPool {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn scale_to(&mut self, actuation: Actuation) -> Result<Actuation> {
        if actuation.kind() != self.kind {
            return Err(GovernorError::KindMismatch {
                pool: self.kind,
                requested: actuation.kind(),
            });
        }
        let mut state = self.plant.state.lock();
        let shortfall = match (actuation, state.allocation_limit) {
            (Actuation::Memory { bytes }, Some(limit)) if bytes > limit => Some((bytes, limit)),
            _ => None,
        };
        let reached = match shortfall {
            Some((_, limit)) => Actuation::Memory { bytes: limit },
            None => actuation,
        };
        *state.slot(self.kind) = reached;
        state.applied.push(reached);
        match shortfall {
            Some((requested, achieved)) => Err(GovernorError::AllocationFailure { requested, achieved }),
            None => Ok(reached),
        }
    }

    fn current(&self) -> Actuation {
        self.plant.actuation(self.kind)
    }

    fn maintain(&mut self) -> Maintenance {
        Maintenance::default()
    }

    fn stop_all(&mut self, _timeout: Duration) -> Result<()> {
        *self.plant.state.lock().slot(self.kind) = Actuation::idle(self.kind);
        Ok(())
    }

    fn active_workers(&self) -> usize {
        match self.current() {
            Actuation::Cpu { workers, .. } => workers,
            Actuation::Memory { bytes } => usize::from(bytes > 0),
        }
    }

    fn resident_bytes(&self) -> u64 {
        self.current().bytes()
    }
}
