//! Closed-loop load generation.
//!
//! A session samples CPU or memory utilization on a fixed period and grows or
//! shrinks its own workers until the machine sits at the requested target.
//! The [`Governor`] bounds whatever the controller asks for.

pub mod config;
pub mod controller;
pub mod coordinate;
pub mod error;
pub mod governor;
pub mod pool;
pub mod sampler;
pub mod schedule;
pub mod session;
pub mod simulate;
pub mod state;
pub mod types;
pub mod worker;

pub use config::{ControlConfig, Profile};
pub use controller::{ControlLaw, Controller, SessionParts, TickOutcome};
pub use coordinate::Coordinator;
pub use error::{ConfigError, FailureReason, GovernorError, Result};
pub use governor::{Clamp, EmergencyStop, Governor, Limits};
pub use pool::{CpuPool, MemoryPool, WorkerPool};
pub use sampler::{Reading, Sampler, SystemProbe};
pub use schedule::{ScheduleAction, ScheduleEntry, Scheduler};
pub use session::{launch, start_coordinated, start_session, start_session_on, SessionHandle, SessionSpec};
pub use simulate::SimulatedPlant;
pub use state::{ControlState, Diagnostics, StateSnapshot};
pub use types::{Actuation, ResourceKind, Target};
