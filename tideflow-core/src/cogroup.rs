//! Batch grouping and aggregation: co-group over n input ordinals and the
//! keyless whole-stream aggregate.
//!
//! These processors absorb their entire (bounded) input into per-key
//! accumulators and emit results in `complete`, one entry per observed key.
//! Emission order is the serialized-key order: not contractual, but
//! deterministic across runs.

use std::collections::{BTreeMap, VecDeque};

use anyhow::Result;

use crate::aggregate::{AggregateOperation, AggregateOperation1};
use crate::inbox::Inbox;
use crate::outbox::{Outbox, SnapshotEntry};
use crate::processor::{Context, Processor};
use crate::types::{StreamData, StreamItem};

/// Key extractor for one input ordinal.
pub type KeyFn<T, K> = Box<dyn Fn(&T) -> K + Send>;

type KeyBytes = Vec<u8>;

/// Groups items from `n` input ordinals by key and aggregates each group,
/// with a separate key extractor and accumulate primitive per ordinal.
/// After all inputs are exhausted it emits one `(key, result)` pair per
/// observed key.
pub struct CoGroupP<T, K, A, R> {
    key_fns: Vec<KeyFn<T, K>>,
    aggr_op: AggregateOperation<T, A, R>,
    groups: BTreeMap<KeyBytes, (K, A)>,
    snapshot_drain: Option<VecDeque<SnapshotEntry>>,
}

impl<T, K, A, R> CoGroupP<T, K, A, R>
where
    T: StreamData,
    K: StreamData,
    A: StreamData,
    R: StreamData,
{
    /// Create a co-group processor; `key_fns[i]` keys the items of input
    /// ordinal `i` and must match the operation's arity.
    pub fn new(key_fns: Vec<KeyFn<T, K>>, aggr_op: AggregateOperation<T, A, R>) -> Self {
        assert_eq!(
            key_fns.len(),
            aggr_op.arity(),
            "one key extractor per accumulate primitive"
        );
        Self {
            key_fns,
            aggr_op,
            groups: BTreeMap::new(),
            snapshot_drain: None,
        }
    }

    fn on_data(&mut self, ordinal: usize, item: &T) -> Result<()> {
        let key = (self.key_fns[ordinal])(item);
        let key_bytes = bincode::serialize(&key)?;
        let op = &self.aggr_op;
        let (_, acc) = self
            .groups
            .entry(key_bytes)
            .or_insert_with(|| (key, op.create()));
        op.accumulate(ordinal, acc, item);
        Ok(())
    }
}

impl<T, K, A, R> Processor for CoGroupP<T, K, A, R>
where
    T: StreamData,
    K: StreamData,
    A: StreamData,
    R: StreamData,
{
    type In = T;
    type Out = (K, R);

    fn process(
        &mut self,
        ordinal: usize,
        inbox: &mut Inbox<StreamItem<T>>,
        outbox: &mut Outbox<(K, R)>,
        _ctx: &Context,
    ) -> Result<()> {
        loop {
            if !outbox.retry_broadcast()? {
                return Ok(());
            }
            match inbox.peek() {
                None => return Ok(()),
                Some(StreamItem::Data(item)) => {
                    self.on_data(ordinal, item)?;
                    inbox.poll();
                }
                Some(StreamItem::Watermark(wm)) => {
                    // No event-time semantics here; keep the stream's
                    // watermarks flowing for downstream stages.
                    let wm = *wm;
                    inbox.poll();
                    if !outbox.broadcast(StreamItem::Watermark(wm))? {
                        return Ok(());
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

    fn complete(&mut self, outbox: &mut Outbox<(K, R)>, _ctx: &Context) -> Result<bool> {
        if !outbox.retry_broadcast()? {
            return Ok(false);
        }
        // Entries are handed to the outbox one by one; a popped entry is in
        // outbox custody, so state and in-flight output never overlap.
        while let Some((_, (key, acc))) = self.groups.pop_first() {
            let result = self.aggr_op.finish(&acc);
            if !outbox.broadcast(StreamItem::Data((key, result)))? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn save_snapshot(&mut self, outbox: &mut Outbox<(K, R)>) -> Result<bool> {
        if self.snapshot_drain.is_none() {
            let mut entries = VecDeque::new();
            for (key, acc) in self.groups.values() {
                entries.push_back(SnapshotEntry::encode(key, acc)?);
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
            let key: K = entry.decode_key()?;
            let acc: A = entry.decode_value()?;
            let key_bytes = bincode::serialize(&key)?;
            self.groups.insert(key_bytes, (key, acc));
        }
        Ok(())
    }
}

/// Aggregates the whole (bounded) input into a single result, emitted once
/// all inputs are exhausted. Grouping by a constant key, without the key.
pub struct AggregateP<T, A, R> {
    aggr_op: AggregateOperation1<T, A, R>,
    /// `None` once the result was handed to the outbox.
    acc: Option<A>,
}

impl<T, A, R> AggregateP<T, A, R>
where
    T: StreamData,
    A: StreamData,
    R: StreamData,
{
    /// Create a whole-stream aggregation processor.
    pub fn new(aggr_op: AggregateOperation1<T, A, R>) -> Self {
        let acc = Some(aggr_op.create());
        Self { aggr_op, acc }
    }
}

impl<T, A, R> Processor for AggregateP<T, A, R>
where
    T: StreamData,
    A: StreamData,
    R: StreamData,
{
    type In = T;
    type Out = R;

    fn process(
        &mut self,
        _ordinal: usize,
        inbox: &mut Inbox<StreamItem<T>>,
        outbox: &mut Outbox<R>,
        _ctx: &Context,
    ) -> Result<()> {
        loop {
            if !outbox.retry_broadcast()? {
                return Ok(());
            }
            match inbox.peek() {
                None => return Ok(()),
                Some(StreamItem::Data(item)) => {
                    if let Some(acc) = self.acc.as_mut() {
                        self.aggr_op.accumulate(acc, item);
                    }
                    inbox.poll();
                }
                Some(StreamItem::Watermark(wm)) => {
                    let wm = *wm;
                    inbox.poll();
                    if !outbox.broadcast(StreamItem::Watermark(wm))? {
                        return Ok(());
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

    fn complete(&mut self, outbox: &mut Outbox<R>, _ctx: &Context) -> Result<bool> {
        if !outbox.retry_broadcast()? {
            return Ok(false);
        }
        if let Some(acc) = self.acc.take() {
            // Even an empty input produces its neutral result.
            return outbox.broadcast(StreamItem::Data(self.aggr_op.finish(&acc)));
        }
        Ok(true)
    }

    fn save_snapshot(&mut self, outbox: &mut Outbox<R>) -> Result<bool> {
        match &self.acc {
            Some(acc) => outbox.offer_to_snapshot(&"acc", acc),
            None => Ok(true),
        }
    }

    fn restore_snapshot(&mut self, inbox: &mut Inbox<SnapshotEntry>) -> Result<()> {
        while let Some(entry) = inbox.poll() {
            self.acc = Some(entry.decode_value()?);
        }
        Ok(())
    }
}

/// Group by key and aggregate each group; emits `(key, result)` pairs.
pub fn aggregate_by_key<T, K, A, R>(
    key_fn: impl Fn(&T) -> K + Send + 'static,
    aggr_op: AggregateOperation1<T, A, R>,
) -> CoGroupP<T, K, A, R>
where
    T: StreamData,
    K: StreamData,
    A: StreamData,
    R: StreamData,
{
    CoGroupP::new(vec![Box::new(key_fn)], aggr_op.into_multi())
}

/// First stage of two-stage grouping: emits `(key, accumulator)` pairs.
pub fn accumulate_by_key<T, K, A>(
    key_fn: impl Fn(&T) -> K + Send + 'static,
    aggr_op: AggregateOperation1<T, A, impl StreamData>,
) -> CoGroupP<T, K, A, A>
where
    T: StreamData,
    K: StreamData,
    A: StreamData,
{
    CoGroupP::new(vec![Box::new(key_fn)], aggr_op.with_identity_finish().into_multi())
}

/// Second stage of two-stage grouping: combines the `(key, accumulator)`
/// pairs produced by several upstream [`accumulate_by_key`] instances.
/// Takes the same operation the first stage was built from.
pub fn combine_by_key<T, K, A, R>(
    aggr_op: AggregateOperation1<T, A, R>,
) -> CoGroupP<(K, A), K, A, R>
where
    K: StreamData,
    A: StreamData,
    R: StreamData,
{
    CoGroupP::new(
        vec![Box::new(|entry: &(K, A)| entry.0.clone())],
        aggr_op
            .with_combining_accumulate(|entry: &(K, A)| &entry.1)
            .into_multi(),
    )
}

/// Co-group `key_fns.len()` input ordinals with a multi-input operation.
pub fn co_aggregate_by_key<T, K, A, R>(
    key_fns: Vec<KeyFn<T, K>>,
    aggr_op: AggregateOperation<T, A, R>,
) -> CoGroupP<T, K, A, R>
where
    T: StreamData,
    K: StreamData,
    A: StreamData,
    R: StreamData,
{
    CoGroupP::new(key_fns, aggr_op)
}

/// Aggregate the whole input into one result.
pub fn aggregate<T, A, R>(aggr_op: AggregateOperation1<T, A, R>) -> AggregateP<T, A, R>
where
    T: StreamData,
    A: StreamData,
    R: StreamData,
{
    AggregateP::new(aggr_op)
}

/// First stage of two-stage whole-stream aggregation: emits the raw
/// accumulator.
pub fn accumulate<T, A>(
    aggr_op: AggregateOperation1<T, A, impl StreamData>,
) -> AggregateP<T, A, A>
where
    T: StreamData,
    A: StreamData,
{
    AggregateP::new(aggr_op.with_identity_finish())
}

/// Second stage of two-stage whole-stream aggregation: combines upstream
/// accumulators into the final result. Takes the same operation the first
/// stage was built from.
pub fn combine<T, A, R>(aggr_op: AggregateOperation1<T, A, R>) -> AggregateP<A, A, R>
where
    A: StreamData,
    R: StreamData,
{
    AggregateP::new(aggr_op.with_combining_accumulate(|acc: &A| acc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{accumulate_fn, counting, summing_i64, AggregateOperation};
    use crate::processor::JobHandle;

    fn drive<P: Processor>(
        p: &mut P,
        inputs: Vec<(usize, Vec<StreamItem<P::In>>)>,
        capacity: usize,
    ) -> Vec<StreamItem<P::Out>> {
        let ctx = Context::new("cogroup", 0, 1, true, JobHandle::new());
        let mut outbox = Outbox::new("cogroup", 1, capacity);
        let mut out = Vec::new();
        for (ordinal, items) in inputs {
            let mut inbox = Inbox::new();
            inbox.extend(items);
            while !inbox.is_empty() {
                p.process(ordinal, &mut inbox, &mut outbox, &ctx).unwrap();
                outbox.drain_bucket(0, |item| out.push(item));
            }
            loop {
                let done = p.complete_edge(ordinal, &mut outbox, &ctx).unwrap();
                outbox.drain_bucket(0, |item| out.push(item));
                if done {
                    break;
                }
            }
        }
        loop {
            let done = p.complete(&mut outbox, &ctx).unwrap();
            outbox.drain_bucket(0, |item| out.push(item));
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn test_aggregate_by_key_counts() {
        let mut p = aggregate_by_key(|w: &String| w.clone(), counting());
        let input = ["a", "b", "a", "a"]
            .iter()
            .map(|w| StreamItem::data(w.to_string()))
            .collect();
        let out = drive(&mut p, vec![(0, input)], 16);
        assert_eq!(
            out,
            vec![
                StreamItem::data(("a".to_string(), 3i64)),
                StreamItem::data(("b".to_string(), 1i64)),
            ]
        );
    }

    #[test]
    fn test_two_stage_by_key_matches_single_stage() {
        let words: Vec<String> = ["x", "y", "x", "z", "x", "y"]
            .iter()
            .map(|w| w.to_string())
            .collect();
        let input: Vec<StreamItem<String>> =
            words.iter().cloned().map(StreamItem::data).collect();

        let mut single = aggregate_by_key(|w: &String| w.clone(), counting());
        let expected = drive(&mut single, vec![(0, input.clone())], 64);

        let mut stage1 = accumulate_by_key(|w: &String| w.clone(), counting::<String>());
        let partials = drive(&mut stage1, vec![(0, input)], 64);

        let mut stage2 = combine_by_key(counting::<String>());
        let out = drive(&mut stage2, vec![(0, partials)], 64);

        assert_eq!(out, expected);
    }

    #[test]
    fn test_co_group_two_ordinals() {
        // Ordinal 0 carries (user, clicks), ordinal 1 carries (user, buys);
        // both fold into one accumulator per user.
        type Ev = (String, i64);
        let op: AggregateOperation<Ev, (i64, i64), (i64, i64)> = AggregateOperation::new(
            || (0i64, 0i64),
            vec![
                accumulate_fn(|acc: &mut (i64, i64), e: &Ev| acc.0 += e.1),
                accumulate_fn(|acc: &mut (i64, i64), e: &Ev| acc.1 += e.1),
            ],
            |acc, other| {
                acc.0 += other.0;
                acc.1 += other.1;
            },
            |acc| *acc,
        );
        let mut p = co_aggregate_by_key(
            vec![
                Box::new(|e: &Ev| e.0.clone()),
                Box::new(|e: &Ev| e.0.clone()),
            ],
            op,
        );

        let clicks = vec![
            StreamItem::data(("u1".to_string(), 2i64)),
            StreamItem::data(("u2".to_string(), 1i64)),
        ];
        let buys = vec![StreamItem::data(("u1".to_string(), 1i64))];
        let out = drive(&mut p, vec![(0, clicks), (1, buys)], 16);

        assert_eq!(
            out,
            vec![
                StreamItem::data(("u1".to_string(), (2i64, 1i64))),
                StreamItem::data(("u2".to_string(), (1i64, 0i64))),
            ]
        );
    }

    #[test]
    fn test_aggregate_whole_stream() {
        let mut p = aggregate(summing_i64(|v: &i64| *v));
        let input = vec![
            StreamItem::data(1i64),
            StreamItem::data(2),
            StreamItem::data(3),
        ];
        let out = drive(&mut p, vec![(0, input)], 16);
        assert_eq!(out, vec![StreamItem::data(6i64)]);
    }

    #[test]
    fn test_aggregate_empty_input_emits_neutral() {
        let mut p = aggregate(counting::<i64>());
        let out = drive(&mut p, vec![(0, vec![])], 16);
        assert_eq!(out, vec![StreamItem::data(0i64)]);
    }

    #[test]
    fn test_two_stage_whole_stream_matches() {
        let input: Vec<StreamItem<i64>> =
            (1..=6).map(StreamItem::data).collect();

        let mut single = aggregate(summing_i64(|v: &i64| *v));
        let expected = drive(&mut single, vec![(0, input.clone())], 16);

        // Two upstream accumulate instances, one downstream combine.
        let mut acc_a = accumulate(summing_i64(|v: &i64| *v));
        let mut acc_b = accumulate(summing_i64(|v: &i64| *v));
        let half_a = drive(&mut acc_a, vec![(0, input[..3].to_vec())], 16);
        let half_b = drive(&mut acc_b, vec![(0, input[3..].to_vec())], 16);

        let mut comb = combine(summing_i64(|v: &i64| *v));
        let mut partials = half_a;
        partials.extend(half_b);
        let out = drive(&mut comb, vec![(0, partials)], 16);

        assert_eq!(out, expected);
    }

    #[test]
    fn test_complete_resumes_under_backpressure() {
        let mut p = aggregate_by_key(|w: &String| w.clone(), counting());
        let input = ["a", "b", "c"]
            .iter()
            .map(|w| StreamItem::data(w.to_string()))
            .collect();
        let out = drive(&mut p, vec![(0, input)], 1);
        assert_eq!(out.len(), 3, "all groups emitted despite capacity 1");
    }

    #[test]
    fn test_cogroup_snapshot_roundtrip() {
        let ctx = Context::new("cogroup", 0, 1, true, JobHandle::new());
        let mut p = aggregate_by_key(|w: &String| w.clone(), counting());

        let mut inbox = Inbox::new();
        inbox.extend(vec![
            StreamItem::data("a".to_string()),
            StreamItem::data("b".to_string()),
            StreamItem::data("a".to_string()),
        ]);
        let mut outbox = Outbox::new("cogroup", 1, 64);
        p.process(0, &mut inbox, &mut outbox, &ctx).unwrap();

        let mut entries = Inbox::new();
        loop {
            let done = p.save_snapshot(&mut outbox).unwrap();
            outbox.drain_snapshot(|e| entries.add(e));
            if done {
                break;
            }
        }
        assert_eq!(entries.len(), 2);

        let mut restored = aggregate_by_key(|w: &String| w.clone(), counting());
        restored.restore_snapshot(&mut entries).unwrap();
        assert!(restored.finish_snapshot_restore().unwrap());

        let out = drive(
            &mut restored,
            vec![(0, vec![StreamItem::data("a".to_string())])],
            16,
        );
        assert_eq!(
            out,
            vec![
                StreamItem::data(("a".to_string(), 3i64)),
                StreamItem::data(("b".to_string(), 1i64)),
            ]
        );
    }
}
