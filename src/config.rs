//! Operator-facing configuration.
//!
//! [`ControlConfig`] holds the knobs of one control session. [`Profile`] is
//! what gets persisted between runs: the last targets, the control knobs and
//! the daily schedule, stored as pretty-printed JSON.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::schedule::{ScheduleEntry, Scheduler};
use crate::types::Target;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Sampling and control period in milliseconds.
    pub period_ms: u64,
    /// Ceiling on concurrently running CPU workers.
    pub max_workers: usize,
    /// Ceiling on a single CPU worker's duty cycle.
    pub max_duty: f64,
    /// Ceiling on bytes held by the memory pool. `None` leaves only the headroom rule.
    pub max_memory_bytes: Option<u64>,
    /// Free memory the governor always leaves to the rest of the system.
    pub min_free_memory_bytes: u64,
    /// Consecutive stale readings tolerated before the session fails.
    pub stale_tick_threshold: u32,
    /// Weight of the newest sample in the moving average.
    pub smoothing_alpha: f64,
    pub kp: f64,
    pub ki: f64,
    /// Largest change of induced load per tick, in percentage points.
    pub max_step_percent: f64,
    /// Error band, in percentage points, treated as on target.
    pub deadband_percent: f64,
    /// Length of one busy+sleep cycle of a CPU worker.
    pub cpu_cycle_ms: u64,
    pub memory_chunk_bytes: u64,
    /// Rewrite every page of held memory once per tick.
    pub touch_memory: bool,
    /// How long Stopping waits for workers before detaching them.
    pub retirement_timeout_ms: u64,
    /// How far past its target a coordinated peer may sit before this
    /// session stops raising its own load.
    pub coordination_tolerance_percent: f64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            period_ms: 500,
            max_workers: num_cpus::get(),
            max_duty: 1.0,
            max_memory_bytes: None,
            min_free_memory_bytes: 512 * MIB,
            stale_tick_threshold: 5,
            smoothing_alpha: 0.5,
            kp: 0.2,
            ki: 0.4,
            max_step_percent: 10.0,
            deadband_percent: 0.5,
            cpu_cycle_ms: 50,
            memory_chunk_bytes: 16 * MIB,
            touch_memory: true,
            retirement_timeout_ms: 2_000,
            coordination_tolerance_percent: 2.0,
        }
    }
}

impl ControlConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn cpu_cycle(&self) -> Duration {
        Duration::from_millis(self.cpu_cycle_ms)
    }

    pub fn retirement_timeout(&self) -> Duration {
        Duration::from_millis(self.retirement_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check("period_ms", "between 20 and 60000", self.period_ms, (20..=60_000).contains(&self.period_ms))?;
        check("max_workers", "between 1 and 4096", self.max_workers, (1..=4096).contains(&self.max_workers))?;
        check("max_duty", "in (0, 1]", self.max_duty, self.max_duty > 0.0 && self.max_duty <= 1.0)?;
        if let Some(max) = self.max_memory_bytes {
            check("max_memory_bytes", "positive", max, max > 0)?;
        }
        check(
            "stale_tick_threshold",
            "at least 1",
            self.stale_tick_threshold,
            self.stale_tick_threshold >= 1,
        )?;
        check(
            "smoothing_alpha",
            "in (0, 1]",
            self.smoothing_alpha,
            self.smoothing_alpha > 0.0 && self.smoothing_alpha <= 1.0,
        )?;
        check("kp", "finite and >= 0", self.kp, self.kp.is_finite() && self.kp >= 0.0)?;
        check("ki", "finite and > 0", self.ki, self.ki.is_finite() && self.ki > 0.0)?;
        check(
            "max_step_percent",
            "in (0, 100]",
            self.max_step_percent,
            self.max_step_percent > 0.0 && self.max_step_percent <= 100.0,
        )?;
        check(
            "deadband_percent",
            "in [0, 10]",
            self.deadband_percent,
            (0.0..=10.0).contains(&self.deadband_percent),
        )?;
        check("cpu_cycle_ms", "between 5 and 1000", self.cpu_cycle_ms, (5..=1_000).contains(&self.cpu_cycle_ms))?;
        check(
            "memory_chunk_bytes",
            "at least 4096",
            self.memory_chunk_bytes,
            self.memory_chunk_bytes >= 4096,
        )?;
        check(
            "retirement_timeout_ms",
            "at least 1",
            self.retirement_timeout_ms,
            self.retirement_timeout_ms >= 1,
        )?;
        check(
            "coordination_tolerance_percent",
            "in [0, 50]",
            self.coordination_tolerance_percent,
            (0.0..=50.0).contains(&self.coordination_tolerance_percent),
        )?;
        Ok(())
    }

    /// Builds a validated config from flat `key = value` pairs; unset keys keep their defaults.
    pub fn from_flat_map<'a, I>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Self::default();
        for (key, value) in entries {
            config.set(key, value)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Sets one option from its string form. Does not validate ranges.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let value = value.trim();
        match key {
            "period_ms" => self.period_ms = parse(key, value)?,
            "max_workers" => self.max_workers = parse(key, value)?,
            "max_duty" => self.max_duty = parse(key, value)?,
            "max_memory_bytes" => {
                self.max_memory_bytes = match value {
                    "" | "none" => None,
                    bytes => Some(parse(key, bytes)?),
                }
            }
            "min_free_memory_bytes" => self.min_free_memory_bytes = parse(key, value)?,
            "stale_tick_threshold" => self.stale_tick_threshold = parse(key, value)?,
            "smoothing_alpha" => self.smoothing_alpha = parse(key, value)?,
            "kp" => self.kp = parse(key, value)?,
            "ki" => self.ki = parse(key, value)?,
            "max_step_percent" => self.max_step_percent = parse(key, value)?,
            "deadband_percent" => self.deadband_percent = parse(key, value)?,
            "cpu_cycle_ms" => self.cpu_cycle_ms = parse(key, value)?,
            "memory_chunk_bytes" => self.memory_chunk_bytes = parse(key, value)?,
            "touch_memory" => self.touch_memory = parse(key, value)?,
            "retirement_timeout_ms" => self.retirement_timeout_ms = parse(key, value)?,
            "coordination_tolerance_percent" => self.coordination_tolerance_percent = parse(key, value)?,
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(())
    }
}

fn check<T: ToString>(key: &'static str, expected: &'static str, value: T, ok: bool) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            key,
            expected,
            value: value.to_string(),
        })
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Parse {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Persisted operator profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub cpu_target: Option<f64>,
    pub memory_target: Option<f64>,
    /// Run the CPU and memory sessions against one [`Coordinator`](crate::Coordinator).
    pub coordinate: bool,
    pub control: ControlConfig,
    pub schedules: Vec<ScheduleEntry>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            cpu_target: Some(50.0),
            memory_target: Some(50.0),
            coordinate: false,
            control: ControlConfig::default(),
            schedules: Vec::new(),
        }
    }
}

impl Profile {
    /// `<config dir>/load-governor/profile.json`, falling back to the working directory.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("load-governor"))
            .unwrap_or_default()
            .join("profile.json")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let profile: Profile = serde_json::from_str(&text)?;
        profile.validate()?;
        Ok(profile)
    }

    /// Loads `path` if it exists, otherwise returns the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Builds a profile from flat `key = value` pairs. Target keys are
    /// `cpu_target` and `memory_target`; everything else goes to [`ControlConfig`].
    pub fn from_flat_map<'a, I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut profile = Self::default();
        for (key, value) in entries {
            match key {
                "cpu_target" => profile.cpu_target = Some(parse(key, value.trim())?),
                "memory_target" => profile.memory_target = Some(parse(key, value.trim())?),
                "coordinate" => profile.coordinate = parse(key, value.trim())?,
                _ => profile.control.set(key, value)?,
            }
        }
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<()> {
        self.control.validate()?;
        for target in [self.cpu_target, self.memory_target].into_iter().flatten() {
            Target::new(target)?;
        }
        Scheduler::new(self.schedules.clone())?;
        Ok(())
    }

    pub fn target(&self, kind: crate::ResourceKind) -> Option<f64> {
        match kind {
            crate::ResourceKind::Cpu => self.cpu_target,
            crate::ResourceKind::Memory => self.memory_target,
        }
    }
}
