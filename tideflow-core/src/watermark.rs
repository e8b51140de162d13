//! Watermark machinery: policies deciding the current watermark, emission
//! policies throttling how often it is put on the wire, coalescing across
//! multiple input edges, and the watermark-inserting processor.

use std::time::Duration;

use anyhow::Result;

use crate::inbox::Inbox;
use crate::outbox::{Outbox, SnapshotEntry};
use crate::processor::{Context, Processor};
use crate::types::{EventTime, StreamData, StreamItem, EVENT_TIME_MAX, EVENT_TIME_MIN};
use crate::window::WindowDefinition;

/// Decides the current watermark from observed event timestamps.
///
/// The returned values must be monotonically non-decreasing. `report_event`
/// may be invoked more than once for the same item (the inserting processor
/// re-observes the head item after suspending on backpressure), so
/// implementations must be idempotent per timestamp.
pub trait WatermarkPolicy: Send {
    /// Observe an event timestamp; returns the updated watermark.
    fn report_event(&mut self, timestamp: EventTime) -> EventTime;

    /// Current watermark without a new event, e.g. on an idle tick.
    fn current_watermark(&mut self) -> EventTime;
}

/// Watermark policy for streams where events arrive out of order by at most
/// `lag`: the watermark trails the highest seen timestamp by that amount.
pub struct FixedLagPolicy {
    lag_ms: i64,
    max_seen: EventTime,
}

impl WatermarkPolicy for FixedLagPolicy {
    fn report_event(&mut self, timestamp: EventTime) -> EventTime {
        if timestamp > self.max_seen {
            self.max_seen = timestamp;
        }
        self.current_watermark()
    }

    fn current_watermark(&mut self) -> EventTime {
        if self.max_seen == EVENT_TIME_MIN {
            // No event seen yet.
            return EVENT_TIME_MIN;
        }
        self.max_seen - self.lag_ms
    }
}

/// Create a [`FixedLagPolicy`] with the given maximum out-of-order delay.
pub fn with_fixed_lag(lag: Duration) -> FixedLagPolicy {
    FixedLagPolicy {
        lag_ms: lag.as_millis() as i64,
        max_seen: EVENT_TIME_MIN,
    }
}

/// Throttles watermark emission given the last emitted value.
pub trait WatermarkEmissionPolicy: Send {
    /// Whether `candidate` should be emitted, given that `last_emitted` was
    /// the previous watermark put on the wire.
    fn should_emit(&self, candidate: EventTime, last_emitted: EventTime) -> bool;
}

/// Emit every advanced watermark.
pub struct EmitAll;

impl WatermarkEmissionPolicy for EmitAll {
    fn should_emit(&self, candidate: EventTime, last_emitted: EventTime) -> bool {
        candidate > last_emitted
    }
}

/// Emit only when the watermark crosses into a new frame of the given
/// window definition; intermediate values are suppressed since downstream
/// windows only react at frame boundaries.
pub struct EmitByFrame {
    wdef: WindowDefinition,
}

impl WatermarkEmissionPolicy for EmitByFrame {
    fn should_emit(&self, candidate: EventTime, last_emitted: EventTime) -> bool {
        last_emitted == EVENT_TIME_MIN || candidate >= self.wdef.higher_frame_ts(last_emitted)
    }
}

/// Create an [`EmitByFrame`] policy aligned to `wdef`'s frames.
pub fn emit_by_frame(wdef: WindowDefinition) -> EmitByFrame {
    EmitByFrame { wdef }
}

/// Create an [`EmitAll`] policy.
pub fn emit_all() -> EmitAll {
    EmitAll
}

/// Tracks per-edge watermarks of a multi-input vertex and computes the
/// coalesced (minimum) watermark to forward.
///
/// A lower-watermark edge might still deliver earlier events, so the vertex
/// clock can only advance to the minimum across edges. When an edge is
/// exhausted its slot becomes `+inf` and stops limiting the minimum.
pub struct WatermarkCoalescer {
    edge_watermarks: Vec<EventTime>,
    last_forwarded: EventTime,
}

impl WatermarkCoalescer {
    /// Create a coalescer for `num_edges` input edges.
    pub fn new(num_edges: usize) -> Self {
        Self {
            edge_watermarks: vec![EVENT_TIME_MIN; num_edges],
            last_forwarded: EVENT_TIME_MIN,
        }
    }

    /// Record a watermark observed on `edge`. Returns the coalesced value to
    /// forward when the minimum advanced, `None` otherwise.
    pub fn observe(&mut self, edge: usize, timestamp: EventTime) -> Option<EventTime> {
        // Clamp: a stale low watermark must not pull the minimum backward.
        self.edge_watermarks[edge] = timestamp.max(self.edge_watermarks[edge]);
        self.advanced_min()
    }

    /// Mark `edge` exhausted; it no longer limits the minimum. Returns a
    /// watermark to forward when the minimum advanced as a result.
    pub fn edge_exhausted(&mut self, edge: usize) -> Option<EventTime> {
        self.edge_watermarks[edge] = EVENT_TIME_MAX;
        self.advanced_min()
    }

    /// Last watermark this coalescer decided to forward.
    pub fn last_forwarded(&self) -> EventTime {
        self.last_forwarded
    }

    fn advanced_min(&mut self) -> Option<EventTime> {
        let min = self
            .edge_watermarks
            .iter()
            .copied()
            .min()
            .unwrap_or(EVENT_TIME_MIN);
        // All edges exhausted: nothing left to announce.
        if min > self.last_forwarded && min < EVENT_TIME_MAX {
            self.last_forwarded = min;
            Some(min)
        } else {
            None
        }
    }
}

/// Snapshot key of [`InsertWatermarksP`]: a single fixed slot.
const WM_SNAPSHOT_KEY: &str = "wm";

/// Inserts watermark items into a data stream.
///
/// For every data item the policy observes the item's timestamp; when the
/// emission policy permits, the advanced watermark is emitted *before* the
/// item that triggered it. Idle ticks consult the policy with wall-clock
/// progress only. Emitted watermark values strictly increase.
///
/// Backpressure discipline: a refused item stays either in the inbox (the
/// triggering data item) or in the outbox's unfinished-broadcast slot, so
/// the processor itself carries no emission queue to lose across a
/// snapshot; its only snapshotted state is the last emitted watermark.
pub struct InsertWatermarksP<T, TF, P, E> {
    ts_fn: TF,
    policy: P,
    emission: E,
    last_emitted: EventTime,
    _marker: std::marker::PhantomData<fn(&T)>,
}

impl<T, TF, P, E> InsertWatermarksP<T, TF, P, E>
where
    T: StreamData,
    TF: Fn(&T) -> EventTime + Send,
    P: WatermarkPolicy,
    E: WatermarkEmissionPolicy,
{
    /// Create a watermark-inserting processor.
    pub fn new(ts_fn: TF, policy: P, emission: E) -> Self {
        Self {
            ts_fn,
            policy,
            emission,
            last_emitted: EVENT_TIME_MIN,
            _marker: std::marker::PhantomData,
        }
    }

    /// Emit the advanced watermark if the emission policy permits.
    /// Returns `Ok(false)` when the outbox refused it.
    fn offer_advanced(&mut self, candidate: EventTime, outbox: &mut Outbox<T>) -> Result<bool> {
        if candidate > self.last_emitted && self.emission.should_emit(candidate, self.last_emitted)
        {
            self.last_emitted = candidate;
            return outbox.broadcast(StreamItem::watermark(candidate));
        }
        Ok(true)
    }
}

impl<T, TF, P, E> Processor for InsertWatermarksP<T, TF, P, E>
where
    T: StreamData,
    TF: Fn(&T) -> EventTime + Send,
    P: WatermarkPolicy,
    E: WatermarkEmissionPolicy,
{
    type In = T;
    type Out = T;

    fn process(
        &mut self,
        _ordinal: usize,
        inbox: &mut Inbox<StreamItem<T>>,
        outbox: &mut Outbox<T>,
        _ctx: &Context,
    ) -> Result<()> {
        loop {
            if !outbox.retry_broadcast()? {
                return Ok(());
            }
            match inbox.peek() {
                None => return Ok(()),
                Some(StreamItem::Data(item)) => {
                    let candidate = self.policy.report_event((self.ts_fn)(item));
                    if !self.offer_advanced(candidate, outbox)? {
                        // Watermark in outbox custody; the item stays in the
                        // inbox and is re-observed on the next call.
                        return Ok(());
                    }
                    if let Some(item) = inbox.poll() {
                        if !outbox.broadcast(item)? {
                            return Ok(());
                        }
                    }
                }
                Some(StreamItem::Watermark(upstream)) => {
                    // An upstream watermark is absorbed into the policy's
                    // output ordering: forward only if it advances ours.
                    let upstream = *upstream;
                    inbox.poll();
                    if upstream > self.last_emitted {
                        self.last_emitted = upstream;
                        if !outbox.broadcast(StreamItem::Watermark(upstream))? {
                            return Ok(());
                        }
                    } else {
                        tracing::debug!(
                            timestamp = upstream,
                            "dropping upstream watermark behind emitted one"
                        );
                    }
                }
                Some(StreamItem::Barrier(barrier)) => {
                    let barrier = *barrier;
                    inbox.poll();
                    if !outbox.broadcast(StreamItem::Barrier(barrier))? {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn try_process(&mut self, outbox: &mut Outbox<T>, _ctx: &Context) -> Result<bool> {
        if !outbox.retry_broadcast()? {
            return Ok(false);
        }
        let candidate = self.policy.current_watermark();
        self.offer_advanced(candidate, outbox)
    }

    fn complete(&mut self, outbox: &mut Outbox<T>, _ctx: &Context) -> Result<bool> {
        outbox.retry_broadcast()
    }

    fn save_snapshot(&mut self, outbox: &mut Outbox<T>) -> Result<bool> {
        outbox.offer_to_snapshot(&WM_SNAPSHOT_KEY, &self.last_emitted)
    }

    fn restore_snapshot(&mut self, inbox: &mut Inbox<SnapshotEntry>) -> Result<()> {
        while let Some(entry) = inbox.poll() {
            self.last_emitted = entry.decode_value()?;
        }
        Ok(())
    }
}
