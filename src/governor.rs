//! Safety ceilings and the emergency stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::warn;

use crate::config::ControlConfig;
use crate::sampler::Reading;
use crate::types::Actuation;
use crate::worker::Halt;

#[derive(Clone, Debug, PartialEq)]
pub struct Limits {
    pub max_workers: usize,
    pub max_duty: f64,
    pub max_memory_bytes: Option<u64>,
    pub min_free_memory_bytes: u64,
}

impl Limits {
    pub fn from_config(config: &ControlConfig) -> Self {
        Self {
            max_workers: config.max_workers,
            max_duty: config.max_duty,
            max_memory_bytes: config.max_memory_bytes,
            min_free_memory_bytes: config.min_free_memory_bytes,
        }
    }
}

/// Result of [`Governor::clamp`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Clamp {
    pub allowed: Actuation,
    /// True when `allowed` is lower than what was asked for.
    pub vetoed: bool,
}

struct EmergencyInner {
    tripped: AtomicBool,
    halt: Halt,
    notify: Notify,
}

/// Cloneable trigger that stops a session from outside its control task.
///
/// Tripping sets the halt signal the CPU workers watch and wakes the sleeping
/// ones, so they leave at their next phase boundary without waiting for the
/// control task to react.
#[derive(Clone)]
pub struct EmergencyStop {
    inner: Arc<EmergencyInner>,
}

impl Default for EmergencyStop {
    fn default() -> Self {
        Self::new()
    }
}

impl EmergencyStop {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EmergencyInner {
                tripped: AtomicBool::new(false),
                halt: Halt::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Returns true for the call that actually tripped it.
    pub fn trip(&self) -> bool {
        let first = !self.inner.tripped.swap(true, Ordering::AcqRel);
        self.inner.halt.set();
        self.inner.notify.notify_waiters();
        if first {
            warn!("emergency stop tripped");
        }
        first
    }

    pub fn is_tripped(&self) -> bool {
        self.inner.tripped.load(Ordering::Acquire)
    }

    /// Resolves once [`trip`](Self::trip) has been called.
    pub async fn tripped(&self) {
        let notified = self.inner.notify.notified();
        if self.is_tripped() {
            return;
        }
        notified.await;
    }

    /// Signal to hand to CPU pools.
    pub fn halt(&self) -> Halt {
        self.inner.halt.clone()
    }
}

pub struct Governor {
    limits: Limits,
    emergency: EmergencyStop,
}

impl Governor {
    pub fn new(limits: Limits, emergency: EmergencyStop) -> Self {
        Self { limits, emergency }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn emergency_handle(&self) -> EmergencyStop {
        self.emergency.clone()
    }

    pub fn emergency_stop(&self) -> bool {
        self.emergency.trip()
    }

    /// Lowers `requested` to fit the ceilings; never raises it.
    ///
    /// The memory headroom rule uses `reading` for free memory and `held` for
    /// what the pool already owns, since that memory is counted as used.
    pub fn clamp(&self, requested: Actuation, reading: &Reading, held: Actuation) -> Clamp {
        let allowed = if self.emergency.is_tripped() {
            Actuation::idle(requested.kind())
        } else {
            match requested {
                Actuation::Cpu { workers, duty } => {
                    let workers = workers.min(self.limits.max_workers);
                    let duty = if duty.is_nan() || workers == 0 {
                        0.0
                    } else {
                        duty.clamp(0.0, self.limits.max_duty)
                    };
                    Actuation::Cpu { workers, duty }
                }
                Actuation::Memory { bytes } => Actuation::Memory {
                    bytes: bytes.min(self.memory_ceiling(reading, held.bytes())),
                },
            }
        };
        Clamp {
            allowed,
            vetoed: allowed != requested,
        }
    }

    /// Largest number of bytes the pool may hold given the current reading.
    pub fn memory_ceiling(&self, reading: &Reading, held: u64) -> u64 {
        let mut ceiling = self.limits.max_memory_bytes.unwrap_or(u64::MAX);
        if reading.total_bytes > 0 {
            let min_free = self.limits.min_free_memory_bytes;
            let available = reading.available_bytes;
            let headroom = if available >= min_free {
                held.saturating_add(available - min_free)
            } else {
                held.saturating_sub(min_free - available)
            };
            ceiling = ceiling.min(headroom);
        }
        ceiling
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::pool::{CpuPool, WorkerPool};
    use crate::types::ResourceKind;

    const MIB: u64 = 1024 * 1024;

    fn limits() -> Limits {
        Limits {
            max_workers: 4,
            max_duty: 0.8,
            max_memory_bytes: Some(512 * MIB),
            min_free_memory_bytes: 256 * MIB,
        }
    }

    fn memory_reading(available: u64, total: u64) -> Reading {
        Reading {
            available_bytes: available,
            total_bytes: total,
            used_bytes: total - available,
            stale: false,
            ..Reading::empty(ResourceKind::Memory)
        }
    }

    #[test]
    fn clamps_cpu_workers_and_duty() {
        let governor = Governor::new(limits(), EmergencyStop::new());
        let reading = Reading::empty(ResourceKind::Cpu);
        let idle = Actuation::idle(ResourceKind::Cpu);

        let clamp = governor.clamp(Actuation::Cpu { workers: 9, duty: 1.0 }, &reading, idle);
        assert_eq!(clamp.allowed, Actuation::Cpu { workers: 4, duty: 0.8 });
        assert!(clamp.vetoed);

        let within = Actuation::Cpu { workers: 2, duty: 0.5 };
        assert_eq!(governor.clamp(within, &reading, idle), Clamp { allowed: within, vetoed: false });
    }

    #[test]
    fn memory_respects_ceiling_and_headroom() {
        let governor = Governor::new(limits(), EmergencyStop::new());
        let held = Actuation::Memory { bytes: 100 * MIB };

        // plenty free: the absolute ceiling wins
        let roomy = memory_reading(4096 * MIB, 8192 * MIB);
        let clamp = governor.clamp(Actuation::Memory { bytes: 1024 * MIB }, &roomy, held);
        assert_eq!(clamp.allowed, Actuation::Memory { bytes: 512 * MIB });

        // 300 MiB free with 256 MiB reserved: 44 MiB more than held
        let tight = memory_reading(300 * MIB, 8192 * MIB);
        let clamp = governor.clamp(Actuation::Memory { bytes: 400 * MIB }, &tight, held);
        assert_eq!(clamp.allowed, Actuation::Memory { bytes: 144 * MIB });

        // below the reserve: must give memory back
        let starved = memory_reading(200 * MIB, 8192 * MIB);
        let clamp = governor.clamp(Actuation::Memory { bytes: 100 * MIB }, &starved, held);
        assert_eq!(clamp.allowed, Actuation::Memory { bytes: 44 * MIB });
    }

    #[test]
    fn tripped_emergency_forces_idle() {
        let emergency = EmergencyStop::new();
        let governor = Governor::new(limits(), emergency.clone());
        assert!(emergency.trip());
        assert!(!governor.emergency_stop());
        assert!(emergency.halt().is_set());

        let clamp = governor.clamp(
            Actuation::Cpu { workers: 1, duty: 0.1 },
            &Reading::empty(ResourceKind::Cpu),
            Actuation::idle(ResourceKind::Cpu),
        );
        assert_eq!(clamp.allowed, Actuation::idle(ResourceKind::Cpu));
    }

    #[tokio::test]
    async fn tripped_future_wakes_waiters() {
        let emergency = EmergencyStop::new();
        let waiter = emergency.clone();
        let task = tokio::spawn(async move { waiter.tripped().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        emergency.trip();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        // already tripped resolves immediately
        emergency.tripped().await;
    }

    #[test]
    fn trip_wakes_sleeping_cpu_workers() {
        let emergency = EmergencyStop::new();
        let cycle = Duration::from_secs(1);
        let mut pool = CpuPool::new(cycle, emergency.halt());
        pool.resize(2, 0.01).unwrap();
        // both workers are well into their 990 ms sleep by now
        thread::sleep(Duration::from_millis(100));
        assert_eq!(pool.active_workers(), 2);

        let tripped_at = Instant::now();
        emergency.trip();
        while pool.active_workers() > 0 {
            assert!(tripped_at.elapsed() < cycle / 4, "workers still parked");
            thread::sleep(Duration::from_millis(1));
        }
    }
}
