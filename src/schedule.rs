//! Daily start/stop plan.
//!
//! Entries are wall-clock `HH:MM` times. [`Scheduler::due`] is meant to be
//! polled well inside a minute (the CLI polls every 30 seconds); each entry
//! fires at most once per calendar day.

use std::collections::{HashMap, HashSet};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleAction {
    Start,
    Stop,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    #[serde(with = "hhmm")]
    pub at: NaiveTime,
    pub action: ScheduleAction,
}

impl ScheduleEntry {
    pub fn parse(at: &str, action: ScheduleAction) -> Result<Self, ConfigError> {
        Ok(Self {
            at: hhmm::parse(at)?,
            action,
        })
    }
}

pub struct Scheduler {
    entries: Vec<ScheduleEntry>,
    fired: HashMap<NaiveTime, NaiveDate>,
}

impl Scheduler {
    pub fn new(mut entries: Vec<ScheduleEntry>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.at) {
                return Err(ConfigError::DuplicateSchedule(entry.at.format("%H:%M").to_string()));
            }
        }
        entries.sort_by_key(|entry| entry.at);
        Ok(Self {
            entries,
            fired: HashMap::new(),
        })
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    /// Actions whose minute contains `now` and that have not fired today.
    pub fn due(&mut self, now: NaiveDateTime) -> Vec<ScheduleAction> {
        let today = now.date();
        let mut actions = Vec::new();
        for entry in &self.entries {
            let since = now.time().signed_duration_since(entry.at);
            if since < TimeDelta::zero() || since >= TimeDelta::minutes(1) {
                continue;
            }
            if self.fired.get(&entry.at) == Some(&today) {
                continue;
            }
            self.fired.insert(entry.at, today);
            info!(at = %entry.at.format("%H:%M"), action = ?entry.action, "schedule entry due");
            actions.push(entry.action);
        }
        actions
    }
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::error::ConfigError;

    pub fn parse(text: &str) -> Result<NaiveTime, ConfigError> {
        NaiveTime::parse_from_str(text.trim(), "%H:%M").map_err(|_| ConfigError::ScheduleTime(text.to_string()))
    }

    pub fn serialize<S: Serializer>(at: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&at.format("%H:%M"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse(&text).map_err(serde::de::Error::custom)
    }
}
