//! Cross-resource coordination for a CPU and a memory session run together.
//!
//! Load on one resource leaks into the other: page touching costs CPU time
//! and busy workers keep the allocator warm. When both loops push at once
//! they can chase each other's side effects. A [`Coordinator`] is a shared
//! board where each session posts its latest standing. A session holds its
//! upward steps while the other one sits above its own target by more than
//! the tolerance and still has load of its own to give back. It carries on
//! once the other is back within tolerance, or has nothing left to shed.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::ResourceKind;

/// Latest fresh reading of one session next to its target.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Standing {
    pub percent: f64,
    pub target: f64,
    /// Load the session itself is inducing, in percentage points.
    pub induced: f64,
}

impl Standing {
    pub fn overshoot(&self) -> f64 {
        self.percent - self.target
    }
}

#[derive(Default)]
struct Board {
    cpu: Option<Standing>,
    memory: Option<Standing>,
}

impl Board {
    fn slot(&mut self, kind: ResourceKind) -> &mut Option<Standing> {
        match kind {
            ResourceKind::Cpu => &mut self.cpu,
            ResourceKind::Memory => &mut self.memory,
        }
    }
}

/// Shared between the sessions it coordinates. Cheap to clone.
#[derive(Clone)]
pub struct Coordinator {
    board: Arc<Mutex<Board>>,
    tolerance: f64,
}

impl Coordinator {
    pub fn new(tolerance_percent: f64) -> Self {
        Self {
            board: Arc::new(Mutex::new(Board::default())),
            tolerance: tolerance_percent.max(0.0),
        }
    }

    pub fn report(&self, kind: ResourceKind, standing: Standing) {
        *self.board.lock().slot(kind) = Some(standing);
    }

    /// Drops a session that stopped driving its resource.
    pub fn withdraw(&self, kind: ResourceKind) {
        *self.board.lock().slot(kind) = None;
    }

    /// The other resource and its standing, when `kind` should not raise its load.
    pub fn holds_rise(&self, kind: ResourceKind) -> Option<(ResourceKind, Standing)> {
        let other = kind.other();
        let standing = (*self.board.lock().slot(other))?;
        // an overshoot made of foreign load is not the peer's to fix
        (standing.overshoot() > self.tolerance && standing.induced > 0.0).then_some((other, standing))
    }
}
