//! Session windows: gap-based, merging, per key.
//!
//! Every event under a key covers the *event interval*
//! `[timestamp, timestamp + session_timeout]`. The first event opens a
//! session spanning exactly that interval; a later event belongs to a
//! session iff its interval overlaps it, extending the session to cover the
//! union. An event whose interval bridges the gap between two sessions
//! merges them with the aggregate operation's `combine`. A session is
//! emitted and dropped once the watermark passes its end.

use std::collections::{BTreeMap, VecDeque};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::aggregate::AggregateOperation1;
use crate::inbox::Inbox;
use crate::outbox::{flush_pending, Outbox, SnapshotEntry};
use crate::processor::{Context, Processor};
use crate::types::{EventTime, StreamData, StreamItem, EVENT_TIME_MAX};

/// Result of one closed session window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionWindowResult<K, R> {
    pub start: EventTime,
    pub end: EventTime,
    pub key: K,
    pub result: R,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Session<A> {
    start: EventTime,
    end: EventTime,
    acc: A,
}

/// Disjoint sessions of one key, sorted by start (hence also by end).
struct KeySessions<K, A> {
    key: K,
    sessions: Vec<Session<A>>,
}

/// Snapshot key space: one entry per live `(key, session_start)` pair plus
/// one per not-yet-delivered emission.
#[derive(Debug, Serialize, Deserialize)]
enum SessionSnapshotKey<K> {
    Session(K, EventTime),
    Pending(u64),
}

type KeyBytes = Vec<u8>;

/// Session-window aggregation processor.
pub struct SessionWindowP<T, K, A, R, KF, TF> {
    session_timeout: i64,
    key_fn: KF,
    ts_fn: TF,
    aggr_op: AggregateOperation1<T, A, R>,
    keys: BTreeMap<KeyBytes, KeySessions<K, A>>,
    pending: VecDeque<StreamItem<SessionWindowResult<K, R>>>,
    snapshot_drain: Option<VecDeque<SnapshotEntry>>,
    restored_pending: Vec<(u64, StreamItem<SessionWindowResult<K, R>>)>,
}

impl<T, K, A, R, KF, TF> SessionWindowP<T, K, A, R, KF, TF>
where
    T: StreamData,
    K: StreamData,
    A: StreamData,
    R: StreamData,
    KF: Fn(&T) -> K + Send,
    TF: Fn(&T) -> EventTime + Send,
{
    /// Create a session-window processor with the given maximum gap between
    /// events of one session.
    pub fn new(
        session_timeout: i64,
        ts_fn: TF,
        key_fn: KF,
        aggr_op: AggregateOperation1<T, A, R>,
    ) -> Self {
        assert!(session_timeout > 0, "session_timeout must be positive");
        Self {
            session_timeout,
            key_fn,
            ts_fn,
            aggr_op,
            keys: BTreeMap::new(),
            pending: VecDeque::new(),
            snapshot_drain: None,
            restored_pending: Vec::new(),
        }
    }

    /// Number of live sessions across all keys.
    pub fn live_session_count(&self) -> usize {
        self.keys.values().map(|ks| ks.sessions.len()).sum()
    }

    fn on_data(&mut self, item: &T) -> Result<()> {
        let ts = (self.ts_fn)(item);
        let interval_end = ts + self.session_timeout;
        let key = (self.key_fn)(item);
        let key_bytes = bincode::serialize(&key)?;

        let op = &self.aggr_op;
        let entry = self
            .keys
            .entry(key_bytes)
            .or_insert_with(|| KeySessions {
                key,
                sessions: Vec::new(),
            });

        // Sessions overlapping the event interval [ts, interval_end].
        // Disjointness bounds the overlap to at most two sessions; merging
        // a range handles both the extend and the bridge case uniformly.
        let sessions = &mut entry.sessions;
        let lo = sessions.partition_point(|s| s.end < ts);
        let hi = sessions.partition_point(|s| s.start <= interval_end);

        if lo == hi {
            let mut acc = op.create();
            op.accumulate(&mut acc, item);
            sessions.insert(
                lo,
                Session {
                    start: ts,
                    end: interval_end,
                    acc,
                },
            );
            return Ok(());
        }

        let mut merged: Option<Session<A>> = None;
        for session in sessions.drain(lo..hi) {
            match merged.as_mut() {
                None => merged = Some(session),
                Some(acc_session) => {
                    op.combine(&mut acc_session.acc, &session.acc);
                    acc_session.end = session.end;
                }
            }
        }
        let mut session = merged.expect("range was non-empty");
        session.start = session.start.min(ts);
        session.end = session.end.max(interval_end);
        op.accumulate(&mut session.acc, item);
        sessions.insert(lo, session);
        Ok(())
    }

    /// Emit and drop every session with `end <= wm`, ascending by
    /// `(start, serialized key)`.
    fn emit_due_sessions(&mut self, wm: EventTime) {
        let op = &self.aggr_op;
        let mut due: Vec<(EventTime, KeyBytes, SessionWindowResult<K, R>)> = Vec::new();

        for (key_bytes, entry) in self.keys.iter_mut() {
            // Ends ascend with starts, so the due sessions are a prefix.
            let due_count = entry.sessions.partition_point(|s| s.end <= wm);
            for session in entry.sessions.drain(..due_count) {
                due.push((
                    session.start,
                    key_bytes.clone(),
                    SessionWindowResult {
                        start: session.start,
                        end: session.end,
                        key: entry.key.clone(),
                        result: op.finish(&session.acc),
                    },
                ));
            }
        }
        self.keys.retain(|_, entry| !entry.sessions.is_empty());

        due.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        self.pending
            .extend(due.into_iter().map(|(_, _, result)| StreamItem::Data(result)));
    }

    fn on_watermark(&mut self, wm: EventTime) {
        self.emit_due_sessions(wm);
        self.pending.push_back(StreamItem::watermark(wm));
    }
}

impl<T, K, A, R, KF, TF> Processor for SessionWindowP<T, K, A, R, KF, TF>
where
    T: StreamData,
    K: StreamData,
    A: StreamData,
    R: StreamData,
    KF: Fn(&T) -> K + Send,
    TF: Fn(&T) -> EventTime + Send,
{
    type In = T;
    type Out = SessionWindowResult<K, R>;

    fn process(
        &mut self,
        _ordinal: usize,
        inbox: &mut Inbox<StreamItem<T>>,
        outbox: &mut Outbox<SessionWindowResult<K, R>>,
        _ctx: &Context,
    ) -> Result<()> {
        loop {
            if !flush_pending(outbox, &mut self.pending)? {
                return Ok(());
            }
            match inbox.peek() {
                None => return Ok(()),
                Some(StreamItem::Data(item)) => {
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
        outbox: &mut Outbox<SessionWindowResult<K, R>>,
        _ctx: &Context,
    ) -> Result<bool> {
        flush_pending(outbox, &mut self.pending)
    }

    fn complete(
        &mut self,
        outbox: &mut Outbox<SessionWindowResult<K, R>>,
        _ctx: &Context,
    ) -> Result<bool> {
        self.emit_due_sessions(EVENT_TIME_MAX);
        flush_pending(outbox, &mut self.pending)
    }

    fn save_snapshot(
        &mut self,
        outbox: &mut Outbox<SessionWindowResult<K, R>>,
    ) -> Result<bool> {
        if self.snapshot_drain.is_none() {
            let mut entries = VecDeque::new();
            for entry in self.keys.values() {
                for session in &entry.sessions {
                    entries.push_back(SnapshotEntry::encode(
                        &SessionSnapshotKey::Session(entry.key.clone(), session.start),
                        &(session.end, session.acc.clone()),
                    )?);
                }
            }
            for (seq, item) in self.pending.iter().enumerate() {
                entries.push_back(SnapshotEntry::encode(
                    &SessionSnapshotKey::<K>::Pending(seq as u64),
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
            match entry.decode_key::<SessionSnapshotKey<K>>()? {
                SessionSnapshotKey::Session(key, start) => {
                    let (end, acc): (EventTime, A) = entry.decode_value()?;
                    let key_bytes = bincode::serialize(&key)?;
                    self.keys
                        .entry(key_bytes)
                        .or_insert_with(|| KeySessions {
                            key,
                            sessions: Vec::new(),
                        })
                        .sessions
                        .push(Session { start, end, acc });
                }
                SessionSnapshotKey::Pending(seq) => {
                    self.restored_pending.push((seq, entry.decode_value()?));
                }
            }
        }
        Ok(())
    }

    fn finish_snapshot_restore(&mut self) -> Result<bool> {
        // Entries arrive in snapshot order, not session order.
        for entry in self.keys.values_mut() {
            entry.sessions.sort_by_key(|s| s.start);
        }
        self.restored_pending.sort_by_key(|(seq, _)| *seq);
        self.pending
            .extend(self.restored_pending.drain(..).map(|(_, item)| item));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::counting;
    use crate::processor::JobHandle;

    type Event = (String, i64); // (key, timestamp)

    fn session_count(
        timeout: i64,
    ) -> SessionWindowP<
        Event,
        String,
        i64,
        i64,
        impl Fn(&Event) -> String + Send,
        impl Fn(&Event) -> EventTime + Send,
    > {
        SessionWindowP::new(
            timeout,
            |e: &Event| e.1,
            |e: &Event| e.0.clone(),
            counting(),
        )
    }

    fn drive<P: Processor>(
        p: &mut P,
        input: Vec<StreamItem<P::In>>,
        capacity: usize,
    ) -> Vec<StreamItem<P::Out>> {
        let ctx = Context::new("session", 0, 1, true, JobHandle::new());
        let mut inbox = Inbox::new();
        inbox.extend(input);
        let mut outbox = Outbox::new("session", 1, capacity);
        let mut out = Vec::new();
        while !inbox.is_empty() {
            p.process(0, &mut inbox, &mut outbox, &ctx).unwrap();
            outbox.drain_bucket(0, |item| out.push(item));
        }
        loop {
            let done = p.try_process(&mut outbox, &ctx).unwrap();
            outbox.drain_bucket(0, |item| out.push(item));
            if done {
                break;
            }
        }
        out
    }

    fn result(
        start: i64,
        end: i64,
        key: &str,
        count: i64,
    ) -> StreamItem<SessionWindowResult<String, i64>> {
        StreamItem::Data(SessionWindowResult {
            start,
            end,
            key: key.to_string(),
            result: count,
        })
    }

    fn ev(key: &str, ts: i64) -> StreamItem<Event> {
        StreamItem::data((key.to_string(), ts))
    }

    #[test]
    fn test_single_session() {
        let mut p = session_count(5);
        let out = drive(
            &mut p,
            vec![ev("a", 10), ev("a", 12), StreamItem::watermark(100)],
            16,
        );
        assert_eq!(out, vec![result(10, 17, "a", 2), StreamItem::watermark(100)]);
    }

    #[test]
    fn test_gap_opens_new_session() {
        let mut p = session_count(5);
        let out = drive(
            &mut p,
            vec![ev("a", 10), ev("a", 30), StreamItem::watermark(100)],
            16,
        );
        assert_eq!(
            out,
            vec![
                result(10, 15, "a", 1),
                result(30, 35, "a", 1),
                StreamItem::watermark(100),
            ]
        );
    }

    #[test]
    fn test_bridging_event_merges_sessions() {
        let mut p = session_count(5);
        // Sessions [10,17] and [20,27] exist when 16 arrives; its interval
        // [16,21] bridges them into [10,27] holding all five events.
        let out = drive(
            &mut p,
            vec![
                ev("a", 10),
                ev("a", 12),
                ev("a", 20),
                ev("a", 22),
                ev("a", 16),
                StreamItem::watermark(100),
            ],
            16,
        );
        assert_eq!(out, vec![result(10, 27, "a", 5), StreamItem::watermark(100)]);
    }

    #[test]
    fn test_watermark_emits_only_expired() {
        let mut p = session_count(5);
        let out = drive(
            &mut p,
            vec![ev("a", 10), ev("a", 40), StreamItem::watermark(20)],
            16,
        );
        assert_eq!(out, vec![result(10, 15, "a", 1), StreamItem::watermark(20)]);
        assert_eq!(p.live_session_count(), 1, "session [40,45] still open");
    }

    #[test]
    fn test_keys_are_independent() {
        let mut p = session_count(5);
        let out = drive(
            &mut p,
            vec![ev("b", 10), ev("a", 11), StreamItem::watermark(100)],
            16,
        );
        // Ascending start; ties broken by serialized key, stable either way.
        assert_eq!(
            out,
            vec![
                result(10, 15, "b", 1),
                result(11, 16, "a", 1),
                StreamItem::watermark(100),
            ]
        );
    }

    #[test]
    fn test_complete_flushes_open_sessions() {
        let ctx = Context::new("session", 0, 1, true, JobHandle::new());
        let mut p = session_count(5);
        let mut inbox = Inbox::new();
        inbox.add(ev("a", 10));
        let mut outbox = Outbox::new("session", 1, 16);
        p.process(0, &mut inbox, &mut outbox, &ctx).unwrap();

        assert!(p.complete(&mut outbox, &ctx).unwrap());
        let mut out = Vec::new();
        outbox.drain_bucket(0, |item| out.push(item));
        assert_eq!(out, vec![result(10, 15, "a", 1)]);
        assert_eq!(p.live_session_count(), 0);
    }

    #[test]
    fn test_emission_under_backpressure() {
        let mut p = session_count(5);
        let out = drive(
            &mut p,
            vec![ev("a", 10), ev("a", 30), ev("b", 11), StreamItem::watermark(100)],
            1,
        );
        assert_eq!(
            out,
            vec![
                result(10, 15, "a", 1),
                result(11, 16, "b", 1),
                result(30, 35, "a", 1),
                StreamItem::watermark(100),
            ]
        );
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_merge_behaviour() {
        let ctx = Context::new("session", 0, 1, true, JobHandle::new());
        let mut p = session_count(5);

        let mut inbox = Inbox::new();
        inbox.extend(vec![ev("a", 10), ev("a", 12), ev("a", 20), ev("a", 22)]);
        let mut outbox = Outbox::new("session", 1, 64);
        p.process(0, &mut inbox, &mut outbox, &ctx).unwrap();

        let mut entries = Inbox::new();
        loop {
            let done = p.save_snapshot(&mut outbox).unwrap();
            outbox.drain_snapshot(|e| entries.add(e));
            if done {
                break;
            }
        }
        assert_eq!(entries.len(), 2, "one entry per live session");

        let mut restored = session_count(5);
        restored.restore_snapshot(&mut entries).unwrap();
        assert!(restored.finish_snapshot_restore().unwrap());

        // The bridging event and the watermark arrive after restore; the
        // outcome must match an uninterrupted run.
        let out = drive(
            &mut restored,
            vec![ev("a", 16), StreamItem::watermark(100)],
            64,
        );
        assert_eq!(out, vec![result(10, 27, "a", 5), StreamItem::watermark(100)]);
    }
}
