//! Frame-aligned sliding-window aggregation.
//!
//! A *frame* is the minimal aggregation unit: the time range
//! `(frame_end - frame_size, frame_end]`, identified by its end timestamp.
//! A *window* is the union of `window_size / frame_size` consecutive
//! frames. [`SlidingWindowP`] keeps one partial accumulator per
//! `(key, frame)` and, when a watermark arrives, combines frames into the
//! window positions the watermark has closed.
//!
//! Tumbling windows are sliding windows whose frame equals the window.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound::{Excluded, Included};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::aggregate::AggregateOperation1;
use crate::inbox::Inbox;
use crate::outbox::{flush_pending, Outbox, SnapshotEntry};
use crate::processor::{Context, Processor};
use crate::types::{
    EventTime, StreamData, StreamItem, TimestampedEntry, EVENT_TIME_MIN,
};

/// Definition of a frame-aligned sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowDefinition {
    frame_size: i64,
    frame_offset: i64,
    window_size: i64,
}

impl WindowDefinition {
    /// Sliding window of `window_size` advancing by `frame_size`.
    /// `window_size` must be a positive multiple of `frame_size`.
    pub fn sliding(window_size: i64, frame_size: i64) -> Self {
        assert!(frame_size > 0, "frame_size must be positive");
        assert!(
            window_size > 0 && window_size % frame_size == 0,
            "window_size must be a positive multiple of frame_size"
        );
        Self {
            frame_size,
            frame_offset: 0,
            window_size,
        }
    }

    /// Tumbling window: a sliding window whose step equals its size.
    pub fn tumbling(size: i64) -> Self {
        Self::sliding(size, size)
    }

    /// Shift the frame grid by `offset` (`0 <= offset < frame_size`).
    pub fn with_offset(mut self, offset: i64) -> Self {
        assert!(
            (0..self.frame_size).contains(&offset),
            "offset must be in [0, frame_size)"
        );
        self.frame_offset = offset;
        self
    }

    pub fn frame_size(&self) -> i64 {
        self.frame_size
    }

    pub fn frame_offset(&self) -> i64 {
        self.frame_offset
    }

    pub fn window_size(&self) -> i64 {
        self.window_size
    }

    /// The largest frame boundary `<= timestamp`.
    pub fn floor_frame_ts(&self, timestamp: EventTime) -> EventTime {
        timestamp - (timestamp - self.frame_offset).rem_euclid(self.frame_size)
    }

    /// The smallest frame boundary `> timestamp`: the end timestamp of the
    /// frame the event at `timestamp` belongs to.
    pub fn higher_frame_ts(&self, timestamp: EventTime) -> EventTime {
        self.floor_frame_ts(timestamp) + self.frame_size
    }

    /// The definition the first stage of a two-stage setup aggregates by:
    /// tumbling over single frames.
    pub fn to_tumbling_by_frame(&self) -> Self {
        Self {
            frame_size: self.frame_size,
            frame_offset: self.frame_offset,
            window_size: self.frame_size,
        }
    }
}

/// Which kind of timestamp the timestamp function extracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampKind {
    /// Event time; mapped to the containing frame via
    /// [`WindowDefinition::higher_frame_ts`].
    Event,
    /// Already a frame end timestamp (second stage of a two-stage setup).
    Frame,
}

type KeyBytes = Vec<u8>;

/// Snapshot key space of [`SlidingWindowP`]: one entry per live
/// `(key, frame)` pair, the emission cursor (not derivable from the frames
/// alone), and one entry per not-yet-delivered emission so a snapshot taken
/// between emission rounds loses nothing.
#[derive(Debug, Serialize, Deserialize)]
enum SlidingSnapshotKey<K> {
    Frame(K, EventTime),
    EmitCursor,
    Pending(u64),
}

/// Sliding-window aggregation processor.
///
/// State per key is an ordered map `frame_end_ts -> accumulator`. On a
/// watermark `wm` the processor emits one [`TimestampedEntry`] per key per
/// window position `we <= wm`, in ascending `we` (ascending serialized key
/// within one `we`), then forwards the watermark. Frames no window can need
/// anymore (`frame_end_ts <= wm - window_size`) are dropped.
///
/// When the aggregate operation supplies `deduct`, consecutive window
/// positions are maintained incrementally; otherwise each position re-folds
/// its frames.
pub struct SlidingWindowP<T, K, A, R, KF, TF> {
    key_fn: KF,
    ts_fn: TF,
    timestamp_kind: TimestampKind,
    wdef: WindowDefinition,
    aggr_op: AggregateOperation1<T, A, R>,
    /// frame end ts -> serialized key -> (key, accumulator)
    frames: BTreeMap<EventTime, BTreeMap<KeyBytes, (K, A)>>,
    /// Lowest window end not yet emitted.
    next_win_to_emit: EventTime,
    pending: VecDeque<StreamItem<TimestampedEntry<K, R>>>,
    snapshot_drain: Option<VecDeque<SnapshotEntry>>,
    /// Pending emissions restored out of order, resolved in
    /// `finish_snapshot_restore`.
    restored_pending: Vec<(u64, StreamItem<TimestampedEntry<K, R>>)>,
}

impl<T, K, A, R, KF, TF> SlidingWindowP<T, K, A, R, KF, TF>
where
    T: StreamData,
    K: StreamData,
    A: StreamData,
    R: StreamData,
    KF: Fn(&T) -> K + Send,
    TF: Fn(&T) -> EventTime + Send,
{
    /// Create a sliding-window processor. Prefer the factory functions
    /// ([`aggregate_to_sliding_window`], [`accumulate_by_frame`],
    /// [`combine_to_sliding_window`]) which arrange the aggregate operation
    /// for the stage they implement.
    pub fn new(
        key_fn: KF,
        ts_fn: TF,
        timestamp_kind: TimestampKind,
        wdef: WindowDefinition,
        aggr_op: AggregateOperation1<T, A, R>,
    ) -> Self {
        Self {
            key_fn,
            ts_fn,
            timestamp_kind,
            wdef,
            aggr_op,
            frames: BTreeMap::new(),
            next_win_to_emit: EVENT_TIME_MIN,
            pending: VecDeque::new(),
            snapshot_drain: None,
            restored_pending: Vec::new(),
        }
    }

    /// Number of live `(key, frame)` accumulators; used by tests to check
    /// the retention bound.
    pub fn live_frame_count(&self) -> usize {
        self.frames.values().map(|keys| keys.len()).sum()
    }

    fn on_data(&mut self, item: &T) -> Result<()> {
        let frame_ts = match self.timestamp_kind {
            TimestampKind::Event => self.wdef.higher_frame_ts((self.ts_fn)(item)),
            TimestampKind::Frame => (self.ts_fn)(item),
        };
        let key = (self.key_fn)(item);
        let key_bytes = bincode::serialize(&key)?;

        let op = &self.aggr_op;
        let (_, acc) = self
            .frames
            .entry(frame_ts)
            .or_default()
            .entry(key_bytes)
            .or_insert_with(|| (key, op.create()));
        op.accumulate(acc, item);
        Ok(())
    }

    fn on_watermark(&mut self, wm: EventTime) {
        if let (Some(&first_frame), Some(&last_frame)) =
            (self.frames.keys().next(), self.frames.keys().next_back())
        {
            let lower = self.next_win_to_emit.max(first_frame);
            let upper = self
                .wdef
                .floor_frame_ts(wm)
                .min(last_frame + self.wdef.window_size() - self.wdef.frame_size());
            if lower <= upper {
                self.emit_windows(lower, upper);
            }
        }

        // Frames no window above the watermark can need anymore.
        let cutoff = wm.saturating_sub(self.wdef.window_size());
        self.frames = self.frames.split_off(&(cutoff + 1));

        // Window positions at or below the watermark are settled for good.
        self.next_win_to_emit = self
            .next_win_to_emit
            .max(self.wdef.floor_frame_ts(wm) + self.wdef.frame_size());

        self.pending.push_back(StreamItem::watermark(wm));
    }

    /// Materialize window results for every position in `[lower, upper]`
    /// (both on the frame grid), ascending.
    fn emit_windows(&mut self, lower: EventTime, upper: EventTime) {
        if self.aggr_op.deduct_fn().is_some() {
            self.emit_windows_deducting(lower, upper);
        } else {
            self.emit_windows_refolding(lower, upper);
        }
        self.next_win_to_emit = upper + self.wdef.frame_size();
    }

    fn emit_windows_refolding(&mut self, lower: EventTime, upper: EventTime) {
        let window = self.wdef.window_size();
        let op = &self.aggr_op;

        let mut we = lower;
        while we <= upper {
            let mut combined: BTreeMap<&KeyBytes, (&K, A)> = BTreeMap::new();
            for keys in self
                .frames
                .range((Excluded(we - window), Included(we)))
                .map(|(_, keys)| keys)
            {
                for (key_bytes, (key, acc)) in keys {
                    combined
                        .entry(key_bytes)
                        .and_modify(|(_, window_acc)| op.combine(window_acc, acc))
                        .or_insert_with(|| {
                            let mut window_acc = op.create();
                            op.combine(&mut window_acc, acc);
                            (key, window_acc)
                        });
                }
            }
            for (_, (key, window_acc)) in combined {
                self.pending.push_back(StreamItem::Data(TimestampedEntry::new(
                    we,
                    key.clone(),
                    op.finish(&window_acc),
                )));
            }
            we += self.wdef.frame_size();
        }
    }

    fn emit_windows_deducting(&mut self, lower: EventTime, upper: EventTime) {
        let frame = self.wdef.frame_size();
        let window = self.wdef.window_size();
        let op = &self.aggr_op;

        // Running accumulator per key over the current window position,
        // with a count of live frames so a key leaves when its last frame
        // slides out.
        let mut running: BTreeMap<KeyBytes, (K, A, usize)> = BTreeMap::new();
        let mut enter = |running: &mut BTreeMap<KeyBytes, (K, A, usize)>,
                         keys: &BTreeMap<KeyBytes, (K, A)>| {
            for (key_bytes, (key, acc)) in keys {
                let entry = running
                    .entry(key_bytes.clone())
                    .or_insert_with(|| (key.clone(), op.create(), 0));
                op.combine(&mut entry.1, acc);
                entry.2 += 1;
            }
        };

        // Seed with the frames of window `lower` that precede it.
        for keys in self
            .frames
            .range((Excluded(lower - window), Excluded(lower)))
            .map(|(_, keys)| keys)
        {
            enter(&mut running, keys);
        }

        let mut we = lower;
        while we <= upper {
            if let Some(keys) = self.frames.get(&we) {
                enter(&mut running, keys);
            }
            for (key, acc, _) in running.values() {
                self.pending.push_back(StreamItem::Data(TimestampedEntry::new(
                    we,
                    key.clone(),
                    op.finish(acc),
                )));
            }
            // The lowest frame of this window is not part of the next one.
            let leaving = we - window + frame;
            if let Some(keys) = self.frames.get(&leaving) {
                let deduct = op.deduct_fn().expect("deducting path requires deduct");
                for (key_bytes, (_, acc)) in keys {
                    let emptied = match running.get_mut(key_bytes) {
                        Some(entry) => {
                            deduct(&mut entry.1, acc);
                            entry.2 -= 1;
                            entry.2 == 0
                        }
                        None => false,
                    };
                    if emptied {
                        running.remove(key_bytes);
                    }
                }
            }
            we += frame;
        }
    }

    /// Emit every window still covered by live frames; used at end of input.
    fn emit_remaining(&mut self) {
        if let (Some(&first_frame), Some(&last_frame)) =
            (self.frames.keys().next(), self.frames.keys().next_back())
        {
            let lower = self.next_win_to_emit.max(first_frame);
            let upper = last_frame + self.wdef.window_size() - self.wdef.frame_size();
            if lower <= upper {
                self.emit_windows(lower, upper);
            }
        }
        self.frames.clear();
    }
}

impl<T, K, A, R, KF, TF> Processor for SlidingWindowP<T, K, A, R, KF, TF>
where
    T: StreamData,
    K: StreamData,
    A: StreamData,
    R: StreamData,
    KF: Fn(&T) -> K + Send,
    TF: Fn(&T) -> EventTime + Send,
{
    type In = T;
    type Out = TimestampedEntry<K, R>;

    fn process(
        &mut self,
        _ordinal: usize,
        inbox: &mut Inbox<StreamItem<T>>,
        outbox: &mut Outbox<TimestampedEntry<K, R>>,
        _ctx: &Context,
    ) -> Result<()> {
        loop {
            if !flush_pending(outbox, &mut self.pending)? {
                return Ok(());
            }
            match inbox.peek() {
                None => return Ok(()),
                Some(StreamItem::Data(item)) => {
                    // Accumulating is O(1); absorb the item immediately.
                    self.on_data(item)?;
                    inbox.poll();
                }
                Some(StreamItem::Watermark(wm)) => {
                    let wm = *wm;
                    inbox.poll();
                    self.on_watermark(wm);
                }
                Some(StreamItem::Barrier(barrier)) => {
                    let barrier = *barrier;
                    inbox.poll();
                    self.pending.push_back(StreamItem::Barrier(barrier));
                }
            }
        }
    }

    fn try_process(
        &mut self,
        outbox: &mut Outbox<TimestampedEntry<K, R>>,
        _ctx: &Context,
    ) -> Result<bool> {
        flush_pending(outbox, &mut self.pending)
    }

    fn complete(
        &mut self,
        outbox: &mut Outbox<TimestampedEntry<K, R>>,
        _ctx: &Context,
    ) -> Result<bool> {
        self.emit_remaining();
        flush_pending(outbox, &mut self.pending)
    }

    fn save_snapshot(&mut self, outbox: &mut Outbox<TimestampedEntry<K, R>>) -> Result<bool> {
        if self.snapshot_drain.is_none() {
            let mut entries = VecDeque::new();
            for (frame_ts, keys) in &self.frames {
                for (_, (key, acc)) in keys {
                    entries.push_back(SnapshotEntry::encode(
                        &SlidingSnapshotKey::Frame(key.clone(), *frame_ts),
                        acc,
                    )?);
                }
            }
            entries.push_back(SnapshotEntry::encode(
                &SlidingSnapshotKey::<K>::EmitCursor,
                &self.next_win_to_emit,
            )?);
            for (seq, item) in self.pending.iter().enumerate() {
                entries.push_back(SnapshotEntry::encode(
                    &SlidingSnapshotKey::<K>::Pending(seq as u64),
                    item,
                )?);
            }
            self.snapshot_drain = Some(entries);
        }

        let drain = self.snapshot_drain.as_mut().expect("staged above");
        while let Some(entry) = drain.front() {
            if !outbox.offer_snapshot_entry(entry.clone()) {
                return Ok(false);
            }
            drain.pop_front();
        }
        self.snapshot_drain = None;
        Ok(true)
    }

    fn restore_snapshot(&mut self, inbox: &mut Inbox<SnapshotEntry>) -> Result<()> {
        while let Some(entry) = inbox.poll() {
            match entry.decode_key::<SlidingSnapshotKey<K>>()? {
                SlidingSnapshotKey::Frame(key, frame_ts) => {
                    let key_bytes = bincode::serialize(&key)?;
                    let acc: A = entry.decode_value()?;
                    self.frames
                        .entry(frame_ts)
                        .or_default()
                        .insert(key_bytes, (key, acc));
                }
                SlidingSnapshotKey::EmitCursor => {
                    self.next_win_to_emit = entry.decode_value()?;
                }
                SlidingSnapshotKey::Pending(seq) => {
                    self.restored_pending.push((seq, entry.decode_value()?));
                }
            }
        }
        Ok(())
    }

    fn finish_snapshot_restore(&mut self) -> Result<bool> {
        self.restored_pending.sort_by_key(|(seq, _)| *seq);
        self.pending
            .extend(self.restored_pending.drain(..).map(|(_, item)| item));
        Ok(true)
    }
}

/// Single-stage sliding-window aggregation over event timestamps.
pub fn aggregate_to_sliding_window<T, K, A, R, KF, TF>(
    key_fn: KF,
    ts_fn: TF,
    wdef: WindowDefinition,
    aggr_op: AggregateOperation1<T, A, R>,
) -> SlidingWindowP<T, K, A, R, KF, TF>
where
    T: StreamData,
    K: StreamData,
    A: StreamData,
    R: StreamData,
    KF: Fn(&T) -> K + Send,
    TF: Fn(&T) -> EventTime + Send,
{
    SlidingWindowP::new(key_fn, ts_fn, TimestampKind::Event, wdef, aggr_op)
}

/// First stage of two-stage windowing: accumulate per `(key, frame)` and
/// emit raw accumulators, tumbling frame by frame. The operation's `finish`
/// is replaced with identity.
pub fn accumulate_by_frame<T, K, A, R, KF, TF>(
    key_fn: KF,
    ts_fn: TF,
    wdef: WindowDefinition,
    aggr_op: AggregateOperation1<T, A, R>,
) -> SlidingWindowP<T, K, A, A, KF, TF>
where
    T: StreamData,
    K: StreamData,
    A: StreamData,
    KF: Fn(&T) -> K + Send,
    TF: Fn(&T) -> EventTime + Send,
{
    SlidingWindowP::new(
        key_fn,
        ts_fn,
        TimestampKind::Event,
        wdef.to_tumbling_by_frame(),
        aggr_op.with_identity_finish(),
    )
}

/// Second stage of two-stage windowing: combine the partial frame
/// accumulators produced by [`accumulate_by_frame`] into window results.
/// Takes the same operation the first stage was built from.
pub fn combine_to_sliding_window<T, K, A, R>(
    wdef: WindowDefinition,
    aggr_op: AggregateOperation1<T, A, R>,
) -> SlidingWindowP<
    TimestampedEntry<K, A>,
    K,
    A,
    R,
    impl Fn(&TimestampedEntry<K, A>) -> K + Send,
    impl Fn(&TimestampedEntry<K, A>) -> EventTime + Send,
>
where
    K: StreamData,
    A: StreamData,
    R: StreamData,
{
    SlidingWindowP::new(
        |entry: &TimestampedEntry<K, A>| entry.key.clone(),
        |entry: &TimestampedEntry<K, A>| entry.timestamp,
        TimestampKind::Frame,
        wdef,
        aggr_op.with_combining_accumulate(|entry: &TimestampedEntry<K, A>| &entry.value),
    )
}
