use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

/// Mutable state of a simulated device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigState {
    pub sleep_min_ms: u64,
    pub sleep_max_ms: u64,
    pub reported_counter: u64,
}

impl Default for ConfigState {
    fn default() -> Self {
        Self {
            sleep_min_ms: 100,
            sleep_max_ms: 300,
            reported_counter: 0,
        }
    }
}

impl ConfigState {
    pub fn get(&self, field: Field) -> u64 {
        match field {
            Field::SleepMin => self.sleep_min_ms,
            Field::SleepMax => self.sleep_max_ms,
            Field::ReportedCounter => self.reported_counter,
        }
    }

    pub fn set(&mut self, field: Field, value: u64) {
        match field {
            Field::SleepMin => self.sleep_min_ms = value,
            Field::SleepMax => self.sleep_max_ms = value,
            Field::ReportedCounter => self.reported_counter = value,
        }
    }
}

/// The closed set of state fields that can be changed remotely
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    SleepMin,
    SleepMax,
    ReportedCounter,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SleepMin => "sleepmin",
            Self::SleepMax => "sleepmax",
            Self::ReportedCounter => "reportedcounter",
        }
    }
}

impl Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown state field '{0}'")]
pub struct UnknownFieldError(String);

impl FromStr for Field {
    type Err = UnknownFieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sleepmin" => Ok(Self::SleepMin),
            "sleepmax" => Ok(Self::SleepMax),
            "reportedcounter" => Ok(Self::ReportedCounter),
            _ => Err(UnknownFieldError(s.to_owned())),
        }
    }
}

/// Shared handle to the device state
///
/// Every read returns a consistent copy and every write is applied while
/// holding the channel lock, so concurrent readers never observe a partial
/// update. Observers can follow changes through [`StateHandle::subscribe`].
#[derive(Clone, Debug)]
pub struct StateHandle {
    tx: Arc<watch::Sender<ConfigState>>,
}

impl Default for StateHandle {
    fn default() -> Self {
        Self::new(ConfigState::default())
    }
}

impl StateHandle {
    pub fn new(initial: ConfigState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> ConfigState {
        *self.tx.borrow()
    }

    pub fn set(&self, field: Field, value: u64) {
        self.tx.send_modify(|state| state.set(field, value));
    }

    /// Apply `f` to the state atomically, returning its result
    pub fn update<R>(&self, f: impl FnOnce(&mut ConfigState) -> R) -> R {
        let mut result = None;
        self.tx.send_modify(|state| result = Some(f(state)));
        result.expect("send_modify always runs the closure")
    }

    /// Increment the reported counter returning the new value
    pub fn increment_reported_counter(&self) -> u64 {
        self.update(|state| {
            state.reported_counter = state.reported_counter.saturating_add(1);
            state.reported_counter
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<ConfigState> {
        self.tx.subscribe()
    }
}
