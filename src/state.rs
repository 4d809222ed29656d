use serde::Serialize;

use crate::error::FailureReason;
use crate::sampler::Reading;
use crate::types::{ResourceKind, Target};

/// Lifecycle of a session. Variants are ordered: a session only moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlState {
    Idle,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ControlState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ControlState::Stopped | ControlState::Failed)
    }

    pub fn can_advance_to(self, next: ControlState) -> bool {
        !self.is_terminal() && next > self
    }
}

/// Conditions absorbed by the loop, surfaced for operators.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub consecutive_stale_ticks: u32,
    pub total_stale_ticks: u64,
    pub governor_vetoes: u64,
    pub allocation_failures: u64,
    pub spawn_failures: u64,
    pub skipped_ticks: u64,
    pub overrun_ticks: u64,
    pub retirement_timeouts: u64,
    pub respawned_workers: u64,
    /// Ticks whose upward step was held for the coordinated peer session.
    pub coordination_holds: u64,
    pub last_error: Option<String>,
}

/// What `query_state` returns.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub session_id: String,
    pub kind: ResourceKind,
    pub state: ControlState,
    pub target: Target,
    pub reading: Option<Reading>,
    pub active_workers: usize,
    pub resident_bytes: u64,
    pub duty: f64,
    /// Load the session is inducing, in percentage points.
    pub induced_percent: f64,
    pub ticks: u64,
    pub diagnostics: Diagnostics,
    pub failure: Option<FailureReason>,
}

impl StateSnapshot {
    /// Overwrites `self` with `newer` without ever moving the state backwards.
    pub fn merge(&mut self, newer: StateSnapshot) {
        let floor = self.state;
        *self = newer;
        if floor > self.state {
            self.state = floor;
        }
    }
}
