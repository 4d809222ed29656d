use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

pub type Result<T, E = GovernorError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum GovernorError {
    #[error("target {0} is outside 0..=100")]
    InvalidTarget(f64),

    #[error("unsupported resource kind: {0}")]
    UnknownKind(String),

    #[error("allocated {achieved} of {requested} requested bytes")]
    AllocationFailure { requested: u64, achieved: u64 },

    #[error("{outstanding} worker(s) still running after {waited:?}")]
    WorkerRetirementTimeout { outstanding: usize, waited: Duration },

    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("{pool} pool cannot apply a {requested} actuation")]
    KindMismatch {
        pool: crate::ResourceKind,
        requested: crate::ResourceKind,
    },

    #[error("session {0} is no longer running")]
    SessionClosed(String),

    #[error("no session with id {0}")]
    SessionNotFound(String),

    #[error("sessions need a tokio runtime to drive their control loop")]
    NoRuntime,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("profile i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("profile format: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{key} must be {expected}, got {value}")]
    OutOfRange {
        key: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("{key}: cannot parse {value:?}")]
    Parse { key: String, value: String },

    #[error("unknown option {0}")]
    UnknownKey(String),

    #[error("invalid schedule time {0:?}, expected HH:MM")]
    ScheduleTime(String),

    #[error("schedule time {0} is listed twice")]
    DuplicateSchedule(String),
}

/// Reason code carried by a session that ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum FailureReason {
    SamplerStale { consecutive: u32 },
    InvariantViolation { detail: String },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::SamplerStale { consecutive } => {
                write!(f, "sampler stale for {consecutive} ticks")
            }
            FailureReason::InvariantViolation { detail } => write!(f, "invariant violated: {detail}"),
        }
    }
}
