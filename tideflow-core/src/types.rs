use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Event time in milliseconds since epoch.
pub type EventTime = i64;

/// Minimum possible event time. Used as the initial "no watermark" sentinel.
pub const EVENT_TIME_MIN: EventTime = i64::MIN;

/// Maximum possible event time. Used to represent no upper bound.
pub const EVENT_TIME_MAX: EventTime = i64::MAX;

/// Unique identifier for snapshot barriers.
pub type SnapshotId = u64;

/// The fundamental unit flowing along an edge: a data item or an in-band
/// control marker. The markers carry their payload directly; they have no
/// life outside an edge, so they need no standalone types.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StreamItem<T> {
    /// User data item.
    Data(T),
    /// Event-time progress marker: no later item on this edge will carry a
    /// timestamp below this value. Monotonic per edge.
    Watermark(EventTime),
    /// Snapshot barrier. The core forwards barriers untouched; interpreting
    /// them is left to the host runtime.
    Barrier(SnapshotId),
}

impl<T> StreamItem<T> {
    /// Create a data item.
    pub fn data(value: T) -> Self {
        Self::Data(value)
    }

    /// Create a watermark item.
    pub fn watermark(timestamp: EventTime) -> Self {
        Self::Watermark(timestamp)
    }

    /// Create a barrier item.
    pub fn barrier(snapshot_id: SnapshotId) -> Self {
        Self::Barrier(snapshot_id)
    }

    /// Return `true` if this item carries user data.
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Data(_))
    }
}

/// A keyed value labeled with the timestamp of the window (or frame) that
/// produced it. The timestamp is the exclusive upper bound of the window's
/// timestamp range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimestampedEntry<K, V> {
    pub timestamp: EventTime,
    pub key: K,
    pub value: V,
}

impl<K, V> TimestampedEntry<K, V> {
    /// Create an entry for the window ending at `timestamp`.
    pub fn new(timestamp: EventTime, key: K, value: V) -> Self {
        Self {
            timestamp,
            key,
            value,
        }
    }
}

impl<K: std::fmt::Debug, V: std::fmt::Debug> std::fmt::Display for TimestampedEntry<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TimestampedEntry({}, {:?}, {:?})",
            self.timestamp, self.key, self.value
        )
    }
}

/// What an edge payload must support: hand-off between worker threads,
/// duplication onto multiple output ordinals, and bincode encoding for
/// snapshot capture and byte-comparable grouping keys.
pub trait StreamData: Send + Clone + Serialize + DeserializeOwned + 'static {}

impl<T: Send + Clone + Serialize + DeserializeOwned + 'static> StreamData for T {}
