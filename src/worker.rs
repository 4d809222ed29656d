//! Units of load.

use std::collections::TryReserveError;
use std::hint::black_box;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

use crate::error::{GovernorError, Result};

/// Stride used to touch memory; one write per page keeps it resident.
pub const PAGE_SIZE: usize = 4096;

/// Pool-wide stop signal. Setting it wakes every worker registered with it,
/// so a sleeping worker leaves at once instead of at its sleep deadline.
#[derive(Clone, Default)]
pub struct Halt {
    inner: Arc<HaltInner>,
}

#[derive(Default)]
struct HaltInner {
    set: AtomicBool,
    sleepers: Mutex<Vec<Thread>>,
}

impl Halt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::Acquire)
    }

    pub fn set(&self) {
        self.inner.set.store(true, Ordering::Release);
        for thread in self.inner.sleepers.lock().iter() {
            thread.unpark();
        }
    }

    fn register(&self, thread: Thread) {
        self.inner.sleepers.lock().push(thread);
    }

    fn unregister(&self, id: ThreadId) {
        self.inner.sleepers.lock().retain(|thread| thread.id() != id);
    }

    #[cfg(test)]
    fn registered(&self) -> usize {
        self.inner.sleepers.lock().len()
    }
}

struct CpuShared {
    duty_bits: AtomicU64,
    retire: AtomicBool,
    halt: Halt,
    busy_started: AtomicU64,
    busy_completed: AtomicU64,
}

impl CpuShared {
    fn should_exit(&self) -> bool {
        self.retire.load(Ordering::Acquire) || self.halt.is_set()
    }

    fn duty(&self) -> f64 {
        f64::from_bits(self.duty_bits.load(Ordering::Relaxed))
    }
}

/// Busy phases a worker has entered and finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhaseCounts {
    pub started: u64,
    pub completed: u64,
}

/// An OS thread alternating a busy spin and a sleep.
///
/// The busy share of each cycle is the duty. Retirement, requested either on
/// the worker itself or through the pool-wide halt flag, is only honored
/// between phases, so a busy phase always runs to completion.
pub struct CpuWorker {
    id: usize,
    shared: Arc<CpuShared>,
    handle: Option<JoinHandle<()>>,
}

impl CpuWorker {
    pub fn spawn(id: usize, duty: f64, cycle: Duration, halt: Halt) -> Result<Self> {
        let shared = Arc::new(CpuShared {
            duty_bits: AtomicU64::new(sanitize_duty(duty).to_bits()),
            retire: AtomicBool::new(false),
            halt,
            busy_started: AtomicU64::new(0),
            busy_completed: AtomicU64::new(0),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("cpu-worker-{id}"))
            .spawn(move || run_phases(&thread_shared, cycle))
            .map_err(GovernorError::WorkerSpawn)?;
        shared.halt.register(handle.thread().clone());
        Ok(Self {
            id,
            shared,
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn duty(&self) -> f64 {
        self.shared.duty()
    }

    /// Takes effect from the worker's next cycle.
    pub fn set_duty(&self, duty: f64) {
        self.shared
            .duty_bits
            .store(sanitize_duty(duty).to_bits(), Ordering::Relaxed);
    }

    pub fn retire(&self) {
        self.shared.retire.store(true, Ordering::Release);
        if let Some(handle) = &self.handle {
            handle.thread().unpark();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub fn phases(&self) -> PhaseCounts {
        PhaseCounts {
            started: self.shared.busy_started.load(Ordering::SeqCst),
            completed: self.shared.busy_completed.load(Ordering::SeqCst),
        }
    }

    /// Waits for the thread to leave its phase loop. Returns false if it panicked.
    pub fn join(mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                self.shared.halt.unregister(handle.thread().id());
                handle.join().is_ok()
            }
            None => true,
        }
    }
}

fn sanitize_duty(duty: f64) -> f64 {
    if duty.is_nan() {
        0.0
    } else {
        duty.clamp(0.0, 1.0)
    }
}

fn run_phases(shared: &CpuShared, cycle: Duration) {
    while !shared.should_exit() {
        let busy = cycle.mul_f64(shared.duty());
        if !busy.is_zero() {
            shared.busy_started.fetch_add(1, Ordering::SeqCst);
            let start = Instant::now();
            while start.elapsed() < busy {
                black_box((0..10_000u64).fold(0u64, |acc, x| acc.wrapping_add(x)));
            }
            shared.busy_completed.fetch_add(1, Ordering::SeqCst);
        }

        let deadline = Instant::now() + cycle.saturating_sub(busy);
        loop {
            if shared.should_exit() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout(deadline - now);
        }
    }
}

/// One block of held memory.
pub struct MemoryChunk {
    id: usize,
    block: Vec<u8>,
    touch: bool,
}

impl MemoryChunk {
    /// Reserves exactly `len` bytes and writes all of them so the pages are resident.
    pub fn allocate(id: usize, len: usize, touch: bool) -> std::result::Result<Self, TryReserveError> {
        let mut block = Vec::new();
        block.try_reserve_exact(len)?;
        let fill: u8 = rand::rng().random_range(1..=u8::MAX);
        block.resize(len, fill);
        Ok(Self { id, block, touch })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn len(&self) -> usize {
        self.block.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block.is_empty()
    }

    /// Rewrites one byte per page. No-op when touching is off.
    pub fn touch(&mut self) {
        if !self.touch {
            return;
        }
        self.block
            .iter_mut()
            .step_by(PAGE_SIZE)
            .for_each(|byte| *byte = byte.wrapping_add(1));
    }

    /// Releases everything past `len` back to the allocator.
    pub fn shrink_to(&mut self, len: usize) {
        self.block.truncate(len);
        self.block.shrink_to_fit();
    }
}
