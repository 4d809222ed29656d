//! Utilization readings.
//!
//! A [`Probe`] takes one raw measurement; the [`Sampler`] smooths successive
//! measurements with an exponential moving average and turns probe failures
//! into stale readings so the control loop never has to handle them as errors.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{MemoryRefreshKind, System, MINIMUM_CPU_UPDATE_INTERVAL};
use thiserror::Error;
use tracing::debug;

use crate::types::ResourceKind;

/// One unsmoothed measurement.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawSample {
    pub percent: f64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("system reports no memory")]
    NoMemory,
    #[error("probe unavailable: {0}")]
    Unavailable(String),
}

pub trait Probe: Send {
    fn measure(&mut self) -> Result<RawSample, ProbeError>;
}

/// Reads the host through `sysinfo`.
pub struct SystemProbe {
    kind: ResourceKind,
    system: System,
    last_cpu_refresh: Instant,
    last_cpu: Option<RawSample>,
}

impl SystemProbe {
    pub fn new(kind: ResourceKind) -> Self {
        let mut system = System::new();
        // cpu usage is a difference between two refreshes; take the first one now
        if kind == ResourceKind::Cpu {
            system.refresh_cpu_usage();
        }
        Self {
            kind,
            system,
            last_cpu_refresh: Instant::now(),
            last_cpu: None,
        }
    }

    /// Between refreshes sysinfo has nothing newer, so the last figure is
    /// still the current one. The first call waits out the interval instead,
    /// since there is no figure yet.
    fn measure_cpu(&mut self) -> Result<RawSample, ProbeError> {
        let since = self.last_cpu_refresh.elapsed();
        if since < MINIMUM_CPU_UPDATE_INTERVAL {
            match self.last_cpu {
                Some(sample) => return Ok(sample),
                None => std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL - since),
            }
        }
        self.system.refresh_cpu_usage();
        self.last_cpu_refresh = Instant::now();
        let percent = f64::from(self.system.global_cpu_usage());
        if !percent.is_finite() {
            return Err(ProbeError::Unavailable(format!("cpu usage {percent}")));
        }
        let sample = RawSample {
            percent: percent.clamp(0.0, 100.0),
            used_bytes: 0,
            available_bytes: 0,
            total_bytes: 0,
        };
        self.last_cpu = Some(sample);
        Ok(sample)
    }

    fn measure_memory(&mut self) -> Result<RawSample, ProbeError> {
        self.system
            .refresh_memory_specifics(MemoryRefreshKind::nothing().with_ram());
        let total = self.system.total_memory();
        if total == 0 {
            return Err(ProbeError::NoMemory);
        }
        let available = self.system.available_memory().min(total);
        let used = total - available;
        Ok(RawSample {
            percent: used as f64 / total as f64 * 100.0,
            used_bytes: used,
            available_bytes: available,
            total_bytes: total,
        })
    }
}

impl Probe for SystemProbe {
    fn measure(&mut self) -> Result<RawSample, ProbeError> {
        match self.kind {
            ResourceKind::Cpu => self.measure_cpu(),
            ResourceKind::Memory => self.measure_memory(),
        }
    }
}

/// A timestamped, smoothed utilization sample.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Reading {
    pub kind: ResourceKind,
    /// Smoothed utilization, the value the controller acts on.
    pub percent: f64,
    pub raw_percent: f64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub total_bytes: u64,
    /// Set when the probe failed and this repeats an earlier reading.
    pub stale: bool,
    pub sampled_at: DateTime<Utc>,
}

impl Reading {
    /// Placeholder handed out before the first successful measurement.
    pub fn empty(kind: ResourceKind) -> Self {
        Self {
            kind,
            percent: 0.0,
            raw_percent: 0.0,
            used_bytes: 0,
            available_bytes: 0,
            total_bytes: 0,
            stale: true,
            sampled_at: Utc::now(),
        }
    }
}

pub struct Sampler {
    kind: ResourceKind,
    probe: Box<dyn Probe>,
    alpha: f64,
    last: Option<Reading>,
}

impl Sampler {
    pub fn new(kind: ResourceKind, probe: Box<dyn Probe>, alpha: f64) -> Self {
        Self {
            kind,
            probe,
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            last: None,
        }
    }

    pub fn sample(&mut self) -> Reading {
        match self.probe.measure() {
            Ok(raw) => {
                let percent = match &self.last {
                    Some(prev) => self.alpha * raw.percent + (1.0 - self.alpha) * prev.percent,
                    None => raw.percent,
                };
                let reading = Reading {
                    kind: self.kind,
                    percent,
                    raw_percent: raw.percent,
                    used_bytes: raw.used_bytes,
                    available_bytes: raw.available_bytes,
                    total_bytes: raw.total_bytes,
                    stale: false,
                    sampled_at: Utc::now(),
                };
                self.last = Some(reading.clone());
                reading
            }
            Err(err) => {
                debug!(kind = %self.kind, error = %err, "probe failed, repeating last reading");
                match &self.last {
                    Some(prev) => Reading {
                        stale: true,
                        ..prev.clone()
                    },
                    None => Reading::empty(self.kind),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    struct Scripted(VecDeque<Option<f64>>);

    impl Probe for Scripted {
        fn measure(&mut self) -> Result<RawSample, ProbeError> {
            match self.0.pop_front().flatten() {
                Some(percent) => Ok(RawSample {
                    percent,
                    used_bytes: 0,
                    available_bytes: 0,
                    total_bytes: 0,
                }),
                None => Err(ProbeError::Unavailable("scripted".into())),
            }
        }
    }

    fn sampler(script: &[Option<f64>]) -> Sampler {
        Sampler::new(ResourceKind::Cpu, Box::new(Scripted(script.iter().copied().collect())), 0.5)
    }

    #[test]
    fn smooths_with_moving_average() {
        let mut sampler = sampler(&[Some(40.0), Some(80.0), Some(80.0)]);
        assert_eq!(sampler.sample().percent, 40.0);
        assert_eq!(sampler.sample().percent, 60.0);
        let third = sampler.sample();
        assert_eq!(third.percent, 70.0);
        assert_eq!(third.raw_percent, 80.0);
        assert!(!third.stale);
    }

    #[test]
    fn failure_repeats_previous_reading_as_stale() {
        let mut sampler = sampler(&[Some(30.0), None, None, Some(50.0)]);
        let first = sampler.sample();
        let stale = sampler.sample();
        assert!(stale.stale);
        assert_eq!(stale.percent, first.percent);
        assert_eq!(stale.sampled_at, first.sampled_at);
        assert!(sampler.sample().stale);
        let fresh = sampler.sample();
        assert!(!fresh.stale);
        assert_eq!(fresh.percent, 40.0);
    }

    #[test]
    fn failure_before_any_sample_is_empty_and_stale() {
        let mut sampler = sampler(&[None, Some(20.0)]);
        let empty = sampler.sample();
        assert!(empty.stale);
        assert_eq!(empty.percent, 0.0);
        assert_eq!(sampler.sample().percent, 20.0);
    }

    #[test]
    fn cpu_probe_repeats_its_last_figure_between_refreshes() {
        let mut probe = SystemProbe::new(ResourceKind::Cpu);
        // the first call waits for a full refresh interval
        let first = probe.measure().unwrap();
        assert!((0.0..=100.0).contains(&first.percent));
        assert_eq!(probe.measure().unwrap(), first);
    }
}
