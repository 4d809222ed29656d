use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{GovernorError, Result};

/// The closed set of resources a session can drive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Memory,
}

impl ResourceKind {
    /// Range an operator is nudged towards. Targets outside it are still accepted.
    pub fn advisory_range(self) -> (f64, f64) {
        match self {
            ResourceKind::Cpu => (10.0, 90.0),
            ResourceKind::Memory => (10.0, 85.0),
        }
    }

    pub fn other(self) -> Self {
        match self {
            ResourceKind::Cpu => ResourceKind::Memory,
            ResourceKind::Memory => ResourceKind::Cpu,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Cpu => f.write_str("cpu"),
            ResourceKind::Memory => f.write_str("memory"),
        }
    }
}

impl FromStr for ResourceKind {
    type Err = GovernorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "memory" | "mem" => Ok(Self::Memory),
            other => Err(GovernorError::UnknownKind(other.to_string())),
        }
    }
}

/// Utilization percentage an operator wants sustained, always within `0..=100`.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Target(f64);

impl Target {
    pub fn new(percent: f64) -> Result<Self> {
        if (0.0..=100.0).contains(&percent) {
            Ok(Self(percent))
        } else {
            Err(GovernorError::InvalidTarget(percent))
        }
    }

    pub fn percent(self) -> f64 {
        self.0
    }

    /// True when the target sits outside the kind's advisory range.
    pub fn is_unusual_for(self, kind: ResourceKind) -> bool {
        let (low, high) = kind.advisory_range();
        self.0 < low || self.0 > high
    }
}

impl TryFrom<f64> for Target {
    type Error = GovernorError;

    fn try_from(value: f64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Target> for f64 {
    fn from(target: Target) -> f64 {
        target.0
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}%", self.0)
    }
}

/// The amount of load a pool is asked to produce.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Actuation {
    Cpu { workers: usize, duty: f64 },
    Memory { bytes: u64 },
}

impl Actuation {
    pub fn idle(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Cpu => Actuation::Cpu {
                workers: 0,
                duty: 0.0,
            },
            ResourceKind::Memory => Actuation::Memory { bytes: 0 },
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Actuation::Cpu { .. } => ResourceKind::Cpu,
            Actuation::Memory { .. } => ResourceKind::Memory,
        }
    }

    /// Busy cores the actuation amounts to (`workers * duty`); zero for memory.
    pub fn busy_cores(&self) -> f64 {
        match *self {
            Actuation::Cpu { workers, duty } => workers as f64 * duty,
            Actuation::Memory { .. } => 0.0,
        }
    }

    pub fn bytes(&self) -> u64 {
        match *self {
            Actuation::Cpu { .. } => 0,
            Actuation::Memory { bytes } => bytes,
        }
    }

    pub fn workers(&self) -> usize {
        match *self {
            Actuation::Cpu { workers, .. } => workers,
            Actuation::Memory { .. } => 0,
        }
    }
}
