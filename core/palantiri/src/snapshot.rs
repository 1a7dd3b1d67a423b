//! Timestamped counter values.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;

/// A measurement of a clock.
///
/// This opaque type is currently a wrapper around [`SystemTime`],
/// but this could change in the future.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(SystemTime);

impl Timestamp {
    /// Returns a `Timestamp` representing the current system time.
    pub fn now() -> Self {
        Self(SystemTime::now())
    }

    /// Returns the number of seconds and nanoseconds since the Unix epoch.
    ///
    /// Timestamps that are before the epoch are clamped to the epoch.
    pub fn to_unix_timestamp(&self) -> (u64, u32) {
        let t = self.0.duration_since(UNIX_EPOCH).unwrap_or_default();
        (t.as_secs(), t.subsec_nanos())
    }

    /// Returns the amount of time elapsed from an earlier timestamp, or `None` if `earlier` is later than `self`.
    pub fn duration_since(&self, earlier: Timestamp) -> Option<Duration> {
        self.0.duration_since(earlier.0).ok()
    }
}

impl From<SystemTime> for Timestamp {
    fn from(value: SystemTime) -> Self {
        Self(value)
    }
}

impl From<Timestamp> for SystemTime {
    fn from(value: Timestamp) -> Self {
        value.0
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A value read from a counter, with the time at which the sampling tick happened.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterValue {
    pub timestamp: Timestamp,
    pub value: f64,
}

/// One complete set of values produced by a single sampling tick.
///
/// Every value of a snapshot has the same timestamp: it is captured once per tick,
/// before any counter is read. A counter whose read failed during the tick has no entry.
///
/// The entries keep the order of the counter set of the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    timestamp: Timestamp,
    values: IndexMap<String, CounterValue>,
}

impl Snapshot {
    /// Builds a snapshot from `(alias, value)` pairs, all stamped with `timestamp`.
    ///
    /// If an alias appears more than once, the last value wins.
    pub fn from_values<S: Into<String>>(timestamp: Timestamp, values: impl IntoIterator<Item = (S, f64)>) -> Self {
        let values = values
            .into_iter()
            .map(|(alias, value)| (alias.into(), CounterValue { timestamp, value }))
            .collect();
        Self { timestamp, values }
    }

    /// The time of the tick that produced this snapshot.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Returns the value associated with `alias`, if the counter was successfully read.
    pub fn get(&self, alias: &str) -> Option<&CounterValue> {
        self.values.get(alias)
    }

    /// Iterates on the `(alias, value)` entries, in the order of the counter set.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &CounterValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterates on the aliases present in the snapshot.
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
