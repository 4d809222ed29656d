//! Worker pools: the only place load is actually created or released.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{GovernorError, Result};
use crate::types::{Actuation, ResourceKind};
use crate::worker::{CpuWorker, Halt, MemoryChunk};

/// What a pool did during [`WorkerPool::maintain`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Maintenance {
    pub respawned: usize,
}

/// Capability shared by every resource kind's pool.
pub trait WorkerPool: Send {
    fn kind(&self) -> ResourceKind;

    /// Applies an actuation and returns what was actually reached.
    fn scale_to(&mut self, actuation: Actuation) -> Result<Actuation>;

    fn current(&self) -> Actuation;

    /// Per-tick upkeep: reaping, respawning, page touching.
    fn maintain(&mut self) -> Maintenance;

    /// Releases everything, waiting at most `timeout` for workers to exit.
    fn stop_all(&mut self, timeout: Duration) -> Result<()>;

    fn active_workers(&self) -> usize;

    fn resident_bytes(&self) -> u64;
}

pub struct CpuPool {
    workers: Vec<CpuWorker>,
    retiring: Vec<CpuWorker>,
    duty: f64,
    cycle: Duration,
    halt: Halt,
    next_id: usize,
}

impl CpuPool {
    pub fn new(cycle: Duration, halt: Halt) -> Self {
        Self {
            workers: Vec::new(),
            retiring: Vec::new(),
            duty: 0.0,
            cycle,
            halt,
            next_id: 1,
        }
    }

    /// Sets every worker's duty, then adds or retires workers until `count` remain.
    /// New workers start at `duty`; retirement takes the newest workers first.
    pub fn resize(&mut self, count: usize, duty: f64) -> Result<()> {
        self.duty = if duty.is_nan() { 0.0 } else { duty.clamp(0.0, 1.0) };
        for worker in &self.workers {
            worker.set_duty(self.duty);
        }
        while self.workers.len() > count {
            if let Some(worker) = self.workers.pop() {
                worker.retire();
                self.retiring.push(worker);
            }
        }
        while self.workers.len() < count {
            let worker = self.spawn()?;
            self.workers.push(worker);
        }
        self.reap();
        Ok(())
    }

    pub fn duty(&self) -> f64 {
        self.duty
    }

    fn spawn(&mut self) -> Result<CpuWorker> {
        let id = self.next_id;
        self.next_id += 1;
        let worker = CpuWorker::spawn(id, self.duty, self.cycle, self.halt.clone())?;
        debug!(worker = id, duty = self.duty, "cpu worker spawned");
        Ok(worker)
    }

    /// Joins retired workers that have already left their phase loop.
    fn reap(&mut self) {
        let (done, pending): (Vec<_>, Vec<_>) = self.retiring.drain(..).partition(CpuWorker::is_finished);
        self.retiring = pending;
        for worker in done {
            let id = worker.id();
            if !worker.join() {
                warn!(worker = id, "cpu worker panicked");
            }
        }
    }

    fn retire_all(&mut self) {
        for worker in self.workers.drain(..) {
            worker.retire();
            self.retiring.push(worker);
        }
    }
}

impl WorkerPool for CpuPool {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Cpu
    }

    fn scale_to(&mut self, actuation: Actuation) -> Result<Actuation> {
        match actuation {
            Actuation::Cpu { workers, duty } => {
                self.resize(workers, duty)?;
                Ok(self.current())
            }
            other => Err(GovernorError::KindMismatch {
                pool: ResourceKind::Cpu,
                requested: other.kind(),
            }),
        }
    }

    fn current(&self) -> Actuation {
        Actuation::Cpu {
            workers: self.workers.len(),
            duty: if self.workers.is_empty() { 0.0 } else { self.duty },
        }
    }

    fn maintain(&mut self) -> Maintenance {
        self.reap();
        if self.halt.is_set() {
            return Maintenance::default();
        }
        let mut respawned = 0;
        for slot in 0..self.workers.len() {
            if !self.workers[slot].is_finished() {
                continue;
            }
            match self.spawn() {
                Ok(fresh) => {
                    let dead = std::mem::replace(&mut self.workers[slot], fresh);
                    warn!(worker = dead.id(), "cpu worker exited unexpectedly, replaced");
                    dead.join();
                    respawned += 1;
                }
                Err(err) => warn!(error = %err, "could not replace dead cpu worker"),
            }
        }
        Maintenance { respawned }
    }

    fn stop_all(&mut self, timeout: Duration) -> Result<()> {
        self.retire_all();
        self.duty = 0.0;
        let deadline = Instant::now() + timeout;
        loop {
            self.reap();
            if self.retiring.is_empty() {
                info!("all cpu workers retired");
                return Ok(());
            }
            if Instant::now() >= deadline {
                let outstanding = self.retiring.len();
                // dropping the handles detaches the threads; their retire flag stays set
                self.retiring.clear();
                return Err(GovernorError::WorkerRetirementTimeout {
                    outstanding,
                    waited: timeout,
                });
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn active_workers(&self) -> usize {
        self.workers
            .iter()
            .chain(&self.retiring)
            .filter(|worker| !worker.is_finished())
            .count()
    }

    fn resident_bytes(&self) -> u64 {
        0
    }
}

impl Drop for CpuPool {
    fn drop(&mut self) {
        self.retire_all();
    }
}

pub struct MemoryPool {
    chunks: Vec<MemoryChunk>,
    held: u64,
    chunk_bytes: u64,
    touch: bool,
    next_id: usize,
}

impl MemoryPool {
    pub fn new(chunk_bytes: u64, touch: bool) -> Self {
        Self {
            chunks: Vec::new(),
            held: 0,
            chunk_bytes: chunk_bytes.max(1),
            touch,
            next_id: 1,
        }
    }

    pub fn held(&self) -> u64 {
        self.held
    }

    /// Allocates chunks until `total` bytes are held. On allocation failure the
    /// pool keeps what it got and reports it in the error.
    pub fn grow_to(&mut self, total: u64) -> Result<u64> {
        while self.held < total {
            let len = self.chunk_bytes.min(total - self.held);
            let size = usize::try_from(len).unwrap_or(usize::MAX);
            match MemoryChunk::allocate(self.next_id, size, self.touch) {
                Ok(chunk) => {
                    self.next_id += 1;
                    self.held += chunk.len() as u64;
                    self.chunks.push(chunk);
                }
                Err(err) => {
                    debug!(error = %err, requested = total, held = self.held, "memory chunk allocation failed");
                    return Err(GovernorError::AllocationFailure {
                        requested: total,
                        achieved: self.held,
                    });
                }
            }
        }
        Ok(self.held)
    }

    /// Frees the newest chunks first until at most `total` bytes are held.
    pub fn shrink_to(&mut self, total: u64) -> u64 {
        while self.held > total {
            let excess = self.held - total;
            let Some(last) = self.chunks.last_mut() else {
                self.held = 0;
                break;
            };
            let len = last.len() as u64;
            if len <= excess {
                self.chunks.pop();
                self.held -= len;
            } else {
                last.shrink_to((len - excess) as usize);
                self.held -= excess;
            }
        }
        self.held
    }
}

impl WorkerPool for MemoryPool {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Memory
    }

    fn scale_to(&mut self, actuation: Actuation) -> Result<Actuation> {
        match actuation {
            Actuation::Memory { bytes } if bytes >= self.held => {
                self.grow_to(bytes)?;
                Ok(self.current())
            }
            Actuation::Memory { bytes } => {
                self.shrink_to(bytes);
                Ok(self.current())
            }
            other => Err(GovernorError::KindMismatch {
                pool: ResourceKind::Memory,
                requested: other.kind(),
            }),
        }
    }

    fn current(&self) -> Actuation {
        Actuation::Memory { bytes: self.held }
    }

    fn maintain(&mut self) -> Maintenance {
        for chunk in &mut self.chunks {
            chunk.touch();
        }
        Maintenance::default()
    }

    fn stop_all(&mut self, _timeout: Duration) -> Result<()> {
        self.chunks.clear();
        self.chunks.shrink_to_fit();
        self.held = 0;
        info!("memory pool released");
        Ok(())
    }

    fn active_workers(&self) -> usize {
        self.chunks.len()
    }

    fn resident_bytes(&self) -> u64 {
        self.held
    }
}
