//! Outbox: bounded per-ordinal buckets plus a snapshot bucket.
//!
//! The processor deposits output through [`offer`](Outbox::offer) /
//! [`broadcast`](Outbox::broadcast); the engine drains the buckets into the
//! outbound edges. A `false` return from any offer means the destination
//! bucket is full: the processor must store what it was doing and return
//! from its callback, retrying on the next invocation. Offers must never be
//! spun on.
//!
//! For cooperative processors every bucket has capacity 1; non-cooperative
//! processors get effectively unbounded buckets that the engine flushes with
//! blocking sends.

use std::collections::VecDeque;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::types::{EventTime, StreamItem};

/// One `(key, value)` state record of a snapshot capture, both sides
/// bincode-encoded. Keys must be unique within a single capture.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl SnapshotEntry {
    /// Encode a key/value pair into a snapshot entry.
    pub fn encode<K: Serialize, V: Serialize>(key: &K, value: &V) -> Result<Self> {
        Ok(Self {
            key: bincode::serialize(key)?,
            value: bincode::serialize(value)?,
        })
    }

    /// Decode the key side.
    pub fn decode_key<K: for<'de> Deserialize<'de>>(&self) -> Result<K> {
        Ok(bincode::deserialize(&self.key)?)
    }

    /// Decode the value side.
    pub fn decode_value<V: for<'de> Deserialize<'de>>(&self) -> Result<V> {
        Ok(bincode::deserialize(&self.value)?)
    }
}

/// Bounded output conduit of one processor instance.
pub struct Outbox<T> {
    vertex: String,
    buckets: Vec<VecDeque<StreamItem<T>>>,
    snapshot_bucket: VecDeque<SnapshotEntry>,
    capacity: usize,
    /// Last watermark accepted per bucket; watermarks must not regress.
    last_watermark: Vec<Option<EventTime>>,
    /// Unfinished broadcast: the item plus per-ordinal delivered flags, so a
    /// retry completes the broadcast without duplicates.
    pending_broadcast: Option<(StreamItem<T>, Vec<bool>)>,
}

impl<T: Clone> Outbox<T> {
    /// Create an outbox with `ordinals` data buckets of the given capacity.
    /// The snapshot bucket gets the same capacity.
    pub fn new(vertex: impl Into<String>, ordinals: usize, capacity: usize) -> Self {
        Self {
            vertex: vertex.into(),
            buckets: (0..ordinals).map(|_| VecDeque::new()).collect(),
            snapshot_bucket: VecDeque::new(),
            capacity,
            last_watermark: vec![None; ordinals],
            pending_broadcast: None,
        }
    }

    /// Number of data ordinals.
    pub fn num_ordinals(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket capacity (shared by the snapshot bucket).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Offer an item to a single ordinal.
    ///
    /// Returns `Ok(false)` when the bucket is full. A watermark below the
    /// last one accepted on the same ordinal is a contract violation.
    pub fn offer(&mut self, ordinal: usize, item: StreamItem<T>) -> Result<bool> {
        if let StreamItem::Watermark(wm) = &item {
            if let Some(last) = self.last_watermark[ordinal] {
                if *wm < last {
                    return Err(EngineError::contract(
                        &self.vertex,
                        format!(
                            "watermark regressed from {} to {} on ordinal {}",
                            last, wm, ordinal
                        ),
                    )
                    .into());
                }
            }
        }
        if self.buckets[ordinal].len() >= self.capacity {
            return Ok(false);
        }
        if let StreamItem::Watermark(wm) = &item {
            self.last_watermark[ordinal] = Some(*wm);
        }
        self.buckets[ordinal].push_back(item);
        Ok(true)
    }

    /// Offer an item to every data ordinal.
    ///
    /// On partial success the outbox keeps the item together with the set of
    /// ordinals that already took it and returns `Ok(false)`; the caller
    /// suspends and later resumes via [`retry_broadcast`](Self::retry_broadcast),
    /// which completes the delivery without duplicates. Starting a new
    /// broadcast while one is unfinished is a programming error.
    pub fn broadcast(&mut self, item: StreamItem<T>) -> Result<bool> {
        assert!(
            self.pending_broadcast.is_none(),
            "unfinished broadcast; call retry_broadcast() first"
        );
        self.pending_broadcast = Some((item, vec![false; self.buckets.len()]));
        self.retry_broadcast()
    }

    /// Resume an unfinished broadcast, if any.
    ///
    /// Returns `Ok(true)` when no broadcast is pending (either there never
    /// was one or it just completed). Callbacks that broadcast start by
    /// gating on this.
    pub fn retry_broadcast(&mut self) -> Result<bool> {
        let Some((item, mut delivered)) = self.pending_broadcast.take() else {
            return Ok(true);
        };

        let mut complete = true;
        for ordinal in 0..self.buckets.len() {
            if delivered[ordinal] {
                continue;
            }
            if self.offer(ordinal, item.clone())? {
                delivered[ordinal] = true;
            } else {
                complete = false;
            }
        }

        if !complete {
            self.pending_broadcast = Some((item, delivered));
        }
        Ok(complete)
    }

    /// Offer a `(key, value)` state record to the snapshot bucket.
    ///
    /// Snapshot writes respect the same backpressure as data writes.
    pub fn offer_to_snapshot<K: Serialize, V: Serialize>(
        &mut self,
        key: &K,
        value: &V,
    ) -> Result<bool> {
        if self.snapshot_bucket.len() >= self.capacity {
            return Ok(false);
        }
        self.snapshot_bucket.push_back(SnapshotEntry::encode(key, value)?);
        Ok(true)
    }

    /// Offer an already-encoded snapshot entry. Same backpressure as
    /// [`offer_to_snapshot`](Self::offer_to_snapshot).
    pub fn offer_snapshot_entry(&mut self, entry: SnapshotEntry) -> bool {
        if self.snapshot_bucket.len() >= self.capacity {
            return false;
        }
        self.snapshot_bucket.push_back(entry);
        true
    }

    // --- Engine side ---

    /// Number of items queued on an ordinal's bucket.
    pub fn bucket_len(&self, ordinal: usize) -> usize {
        self.buckets[ordinal].len()
    }

    /// Head of an ordinal's bucket, if any.
    pub fn peek_bucket(&self, ordinal: usize) -> Option<&StreamItem<T>> {
        self.buckets[ordinal].front()
    }

    /// Remove and return the head of an ordinal's bucket.
    pub fn pop_bucket(&mut self, ordinal: usize) -> Option<StreamItem<T>> {
        self.buckets[ordinal].pop_front()
    }

    /// Drain an ordinal's bucket in order.
    pub fn drain_bucket(&mut self, ordinal: usize, mut consumer: impl FnMut(StreamItem<T>)) {
        while let Some(item) = self.buckets[ordinal].pop_front() {
            consumer(item);
        }
    }

    /// Number of queued snapshot entries.
    pub fn snapshot_len(&self) -> usize {
        self.snapshot_bucket.len()
    }

    /// Drain the snapshot bucket in order.
    pub fn drain_snapshot(&mut self, mut consumer: impl FnMut(SnapshotEntry)) {
        while let Some(entry) = self.snapshot_bucket.pop_front() {
            consumer(entry);
        }
    }
}

/// Drain `queue` into the outbox via broadcast until the outbox refuses.
///
/// Returns `Ok(true)` when the queue is empty and no broadcast is pending.
/// Shared by the stateful processors that materialize their emissions ahead
/// of backpressure.
pub fn flush_pending<T: Clone>(
    outbox: &mut Outbox<T>,
    queue: &mut VecDeque<StreamItem<T>>,
) -> Result<bool> {
    if !outbox.retry_broadcast()? {
        return Ok(false);
    }
    while let Some(item) = queue.pop_front() {
        if !outbox.broadcast(item)? {
            return Ok(false);
        }
    }
    Ok(true)
}
