//! Observed board state
//!
//! `StateStore` keeps the last value per I/O id and the last pulse count per
//! digital input. Updates report genuine transitions to the `ChangeNotifier`;
//! the first sample of an id only establishes its baseline.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::trace;

use crate::address::IoId;

/// Round to the 2 decimal places analog values are stored with
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Value of one I/O point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IoValue {
    Digital(bool),
    Analog(f64),
}

impl IoValue {
    /// Normalized form used for storage and comparison
    pub fn normalized(self) -> Self {
        match self {
            IoValue::Analog(v) => IoValue::Analog(round2(v)),
            digital => digital,
        }
    }

    pub fn as_bool(self) -> bool {
        match self {
            IoValue::Digital(b) => b,
            IoValue::Analog(v) => v != 0.0,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            IoValue::Digital(b) => f64::from(u8::from(b)),
            IoValue::Analog(v) => v,
        }
    }

    /// Compare after normalization, treating digital and numeric forms alike
    pub fn matches(self, other: IoValue) -> bool {
        match (self.normalized(), other.normalized()) {
            (IoValue::Digital(a), IoValue::Digital(b)) => a == b,
            (a, b) => round2(a.as_f64()) == round2(b.as_f64()),
        }
    }
}

impl From<bool> for IoValue {
    fn from(v: bool) -> Self {
        IoValue::Digital(v)
    }
}

impl From<f64> for IoValue {
    fn from(v: f64) -> Self {
        IoValue::Analog(v)
    }
}

impl std::fmt::Display for IoValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoValue::Digital(b) => write!(f, "{}", u8::from(*b)),
            IoValue::Analog(v) => write!(f, "{:.2}", v),
        }
    }
}

/// A state transition of one I/O point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: IoId,
    pub value: IoValue,
    pub previous: IoValue,
}

/// Fan-out of change events to subscribers
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn emit(&self, event: ChangeEvent) {
        // No receivers is a normal state, not a failure
        if self.tx.send(event).is_err() {
            trace!("Change on {} dropped, no subscribers", event.id);
        }
    }
}

/// Last known values and counters of a board
#[derive(Debug)]
pub struct StateStore {
    values: RwLock<HashMap<IoId, IoValue>>,
    counters: RwLock<HashMap<IoId, u32>>,
    notifier: ChangeNotifier,
}

impl StateStore {
    pub fn new(notifier: ChangeNotifier) -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            counters: RwLock::new(HashMap::new()),
            notifier,
        }
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    /// Merge a polled value; returns the emitted event, if any
    pub fn update(&self, id: IoId, value: IoValue) -> Option<ChangeEvent> {
        let value = value.normalized();
        let event = {
            let mut values = self.values.write();
            match values.insert(id, value) {
                None => None,
                Some(previous) if previous == value => None,
                Some(previous) => Some(ChangeEvent {
                    id,
                    value,
                    previous,
                }),
            }
        };

        if let Some(event) = event {
            self.notifier.emit(event);
        }
        event
    }

    pub fn get(&self, id: &IoId) -> Option<IoValue> {
        self.values.read().get(id).copied()
    }

    pub fn contains(&self, id: &IoId) -> bool {
        self.values.read().contains_key(id)
    }

    pub fn update_counter(&self, id: IoId, count: u32) {
        self.counters.write().insert(id, count);
    }

    pub fn counter(&self, id: &IoId) -> Option<u32> {
        self.counters.read().get(id).copied()
    }

    /// All known ids in canonical order
    pub fn ids(&self) -> Vec<IoId> {
        let mut ids: Vec<IoId> = self.values.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Copy of the current values
    pub fn snapshot(&self) -> HashMap<IoId, IoValue> {
        self.values.read().clone()
    }
}
