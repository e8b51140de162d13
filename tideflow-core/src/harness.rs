//! Processor verification harness: the reference driver for the processor
//! contract.
//!
//! The harness initializes a processor, feeds it the input items one by
//! one, drains and records the outbox, and asserts the contract along the
//! way:
//!
//! - **Progress**: every callback must consume from the inbox, emit to the
//!   outbox, or (for boolean callbacks) return `true`.
//! - **Cooperative timing**: each callback of a cooperative processor is
//!   timed; above 5 ms a warning is logged, above the configured limit
//!   (default 1 s) the run fails.
//! - **Backpressure**: cooperative processors get a 1-capacity outbox, and
//!   whenever the outbox is full with input remaining, `process` is called
//!   once more to exercise the suspend path.
//! - **Snapshots**: unless disabled, state is captured and restored into a
//!   fresh instance before the first item, whenever the inbox empties, and
//!   between `complete` rounds. Duplicate keys within one capture fail the
//!   run, and the final output must be unaffected by the interruptions.
//!
//! `complete_edge` is driven once for ordinal 0 before `complete`;
//! `try_process` is not driven in between.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _, Result};

use crate::error::EngineError;
use crate::inbox::Inbox;
use crate::outbox::{Outbox, SnapshotEntry};
use crate::processor::{Context, JobHandle, Processor, ProcessorSupplier};
use crate::types::StreamItem;

const TIME_LIMIT_WARN: Duration = Duration::from_millis(5);
const TIME_LIMIT_FAIL: Duration = Duration::from_millis(1000);
const VERTEX: &str = "verified-processor";

type Checker<O> = Box<dyn Fn(&[StreamItem<O>], &[StreamItem<O>]) -> bool>;

/// Fluent builder around one processor-under-test. See the module docs.
pub struct ProcessorVerifier<P: Processor, S: FnMut() -> P> {
    supplier: S,
    input: Vec<StreamItem<P::In>>,
    assert_progress: bool,
    do_snapshots: bool,
    call_complete: bool,
    cooperative_timeout: Duration,
    output_checker: Checker<P::Out>,
}

/// Verify a processor built by `supplier`. A fresh instance is requested
/// after every snapshot capture, so the supplier must be repeatable.
pub fn verify_processor<P, S>(supplier: S) -> ProcessorVerifier<P, S>
where
    P: Processor,
    P::Out: PartialEq,
    S: FnMut() -> P,
{
    ProcessorVerifier {
        supplier,
        input: Vec::new(),
        assert_progress: true,
        do_snapshots: true,
        call_complete: true,
        cooperative_timeout: TIME_LIMIT_FAIL,
        output_checker: Box::new(|expected, actual| expected == actual),
    }
}

/// Adapt a [`ProcessorSupplier`] into the closure form the verifier takes.
pub fn supplier_from<S: ProcessorSupplier>(mut supplier: S) -> impl FnMut() -> S::P {
    move || {
        supplier
            .get(1)
            .pop()
            .expect("supplier returned no processor")
    }
}

impl<P, S> ProcessorVerifier<P, S>
where
    P: Processor,
    S: FnMut() -> P,
    P::Out: PartialEq + std::fmt::Debug,
{
    /// Input items fed to ordinal 0, one per `process` batch.
    pub fn input(mut self, input: Vec<StreamItem<P::In>>) -> Self {
        self.input = input;
        self
    }

    /// Disable the progress assertion.
    pub fn disable_progress_assertion(mut self) -> Self {
        self.assert_progress = false;
        self
    }

    /// Disable the snapshot+restore cycling.
    pub fn disable_snapshots(mut self) -> Self {
        self.do_snapshots = false;
        self
    }

    /// Do not drive `complete` (streaming processors whose flushing code
    /// must not run).
    pub fn disable_complete_call(mut self) -> Self {
        self.call_complete = false;
        self
    }

    /// Fail a cooperative callback exceeding `timeout`; zero disables the
    /// check (useful under a debugger).
    pub fn cooperative_timeout(mut self, timeout: Duration) -> Self {
        self.cooperative_timeout = timeout;
        self
    }

    /// Replace the `==` comparison of expected and actual output.
    pub fn output_checker(
        mut self,
        checker: impl Fn(&[StreamItem<P::Out>], &[StreamItem<P::Out>]) -> bool + 'static,
    ) -> Self {
        self.output_checker = Box::new(checker);
        self
    }

    /// Set the expected output and run the verification.
    pub fn expect_output(mut self, expected: Vec<StreamItem<P::Out>>) -> Result<()> {
        // A snapshotting run must match a plain run first.
        self.run(false, &expected)?;
        if self.do_snapshots {
            self.run(true, &expected)?;
        }
        Ok(())
    }

    fn run(&mut self, do_snapshots: bool, expected: &[StreamItem<P::Out>]) -> Result<()> {
        let ctx = Context::new(VERTEX, 0, 1, do_snapshots, JobHandle::new());
        let mut processor = (self.supplier)();
        let cooperative = processor.is_cooperative();
        let capacity = if cooperative { 1 } else { usize::MAX };
        let mut outbox: Outbox<P::Out> = Outbox::new(VERTEX, 1, capacity);
        let mut actual: Vec<StreamItem<P::Out>> = Vec::new();

        processor.init(&ctx)?;

        // Exercise save_snapshot with no state accumulated yet.
        self.snapshot_and_restore(
            &mut processor,
            &mut outbox,
            &mut actual,
            do_snapshots,
            cooperative,
            &ctx,
        )?;

        let mut inbox = Inbox::new();
        let mut remaining = self.input.clone().into_iter();
        loop {
            if inbox.is_empty() {
                match remaining.next() {
                    Some(item) => inbox.add(item),
                    None => break,
                }
            }
            self.timed(cooperative, "process", || {
                processor.process(0, &mut inbox, &mut outbox, &ctx)
            })?;
            if self.assert_progress && !inbox.is_empty() && outbox.bucket_len(0) == 0 {
                bail!(EngineError::contract(VERTEX, "process() call without progress"));
            }
            if cooperative && outbox.bucket_len(0) == capacity && !inbox.is_empty() {
                // The outbox is full and input remains: the processor must
                // cope with being called anyway, without emitting more.
                self.timed(cooperative, "process", || {
                    processor.process(0, &mut inbox, &mut outbox, &ctx)
                })?;
            }
            outbox.drain_bucket(0, |item| actual.push(item));
            if inbox.is_empty() {
                self.snapshot_and_restore(
                    &mut processor,
                    &mut outbox,
                    &mut actual,
                    do_snapshots,
                    cooperative,
                    &ctx,
                )?;
            }
        }

        // The single input edge is exhausted.
        loop {
            let mut done = false;
            self.timed(cooperative, "complete_edge", || {
                done = processor.complete_edge(0, &mut outbox, &ctx)?;
                Ok(())
            })?;
            if self.assert_progress && !done && outbox.bucket_len(0) == 0 {
                bail!(EngineError::contract(
                    VERTEX,
                    "complete_edge() call without progress"
                ));
            }
            outbox.drain_bucket(0, |item| actual.push(item));
            if done {
                break;
            }
        }

        if self.call_complete {
            loop {
                let mut done = false;
                self.timed(cooperative, "complete", || {
                    done = processor.complete(&mut outbox, &ctx)?;
                    Ok(())
                })?;
                if self.assert_progress && !done && outbox.bucket_len(0) == 0 {
                    bail!(EngineError::contract(VERTEX, "complete() call without progress"));
                }
                outbox.drain_bucket(0, |item| actual.push(item));
                self.snapshot_and_restore(
                    &mut processor,
                    &mut outbox,
                    &mut actual,
                    do_snapshots,
                    cooperative,
                    &ctx,
                )?;
                if done {
                    break;
                }
            }
        }

        if !(self.output_checker)(expected, &actual) {
            bail!(
                "processor output does not match (snapshots {})\n  expected: {:?}\n  actual:   {:?}",
                if do_snapshots { "on" } else { "off" },
                expected,
                actual
            );
        }
        Ok(())
    }

    /// Capture the processor's snapshot, then replace it with a fresh
    /// instance restored from the captured entries.
    fn snapshot_and_restore(
        &mut self,
        processor: &mut P,
        outbox: &mut Outbox<P::Out>,
        actual: &mut Vec<StreamItem<P::Out>>,
        enabled: bool,
        cooperative: bool,
        ctx: &Context,
    ) -> Result<()> {
        if !enabled {
            return Ok(());
        }

        let mut entries: Inbox<SnapshotEntry> = Inbox::new();
        let mut seen_keys: HashSet<Vec<u8>, ahash::RandomState> = HashSet::default();
        loop {
            let mut done = false;
            self.timed(cooperative, "save_snapshot", || {
                done = processor.save_snapshot(outbox)?;
                Ok(())
            })?;
            if self.assert_progress
                && !done
                && outbox.snapshot_len() == 0
                && outbox.bucket_len(0) == 0
            {
                bail!(EngineError::contract(
                    VERTEX,
                    "save_snapshot() call without progress"
                ));
            }
            let mut captured = Vec::new();
            outbox.drain_snapshot(|entry| captured.push(entry));
            for entry in captured {
                if !seen_keys.insert(entry.key.clone()) {
                    bail!(EngineError::contract(
                        VERTEX,
                        "duplicate key produced in save_snapshot()"
                    ));
                }
                entries.add(entry);
            }
            outbox.drain_bucket(0, |item| actual.push(item));
            if done {
                break;
            }
        }

        *processor = (self.supplier)();
        processor.init(ctx)?;

        if entries.is_empty() {
            // Nothing was captured; finish_snapshot_restore is not driven.
            return Ok(());
        }

        while !entries.is_empty() {
            let before = entries.len();
            self.timed(cooperative, "restore_snapshot", || {
                processor.restore_snapshot(&mut entries)
            })?;
            if self.assert_progress && entries.len() == before && outbox.bucket_len(0) == 0 {
                bail!(EngineError::contract(
                    VERTEX,
                    "restore_snapshot() call without progress"
                ));
            }
            outbox.drain_bucket(0, |item| actual.push(item));
        }

        loop {
            let mut done = false;
            self.timed(cooperative, "finish_snapshot_restore", || {
                done = processor.finish_snapshot_restore()?;
                Ok(())
            })?;
            if self.assert_progress && !done && outbox.bucket_len(0) == 0 {
                bail!(EngineError::contract(
                    VERTEX,
                    "finish_snapshot_restore() call without progress"
                ));
            }
            outbox.drain_bucket(0, |item| actual.push(item));
            if done {
                break;
            }
        }
        Ok(())
    }

    /// Run one callback under the cooperative time budget.
    fn timed(
        &self,
        cooperative: bool,
        method: &str,
        callback: impl FnOnce() -> Result<()>,
    ) -> Result<()> {
        let start = Instant::now();
        callback().with_context(|| format!("{method}() failed"))?;
        let elapsed = start.elapsed();

        if !cooperative {
            return Ok(());
        }
        if elapsed > TIME_LIMIT_WARN {
            tracing::warn!(?elapsed, method, "cooperative callback exceeded soft budget");
        }
        if !self.cooperative_timeout.is_zero() && elapsed > self.cooperative_timeout {
            bail!(EngineError::contract(
                VERTEX,
                format!("call to {method}() took {elapsed:?}"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{counting, summing_i64};
    use crate::session::{SessionWindowP, SessionWindowResult};
    use crate::transform::{filter, map};
    use crate::types::TimestampedEntry;
    use crate::window::{aggregate_to_sliding_window, WindowDefinition};

    #[test]
    fn test_map_to_uppercase() {
        verify_processor(|| map(|s: &String| Some(s.to_uppercase())))
            .input(vec![
                StreamItem::data("foo".to_string()),
                StreamItem::data("bar".to_string()),
            ])
            .expect_output(vec![
                StreamItem::data("FOO".to_string()),
                StreamItem::data("BAR".to_string()),
            ])
            .unwrap();
    }

    #[test]
    fn test_filter_even() {
        verify_processor(|| filter(|v: &i64| v % 2 == 0))
            .input((1..=4).map(StreamItem::data).collect())
            .expect_output(vec![StreamItem::data(2), StreamItem::data(4)])
            .unwrap();
    }

    type Event = (String, i64, i64); // (key, timestamp, value)

    fn event(ts: i64, value: i64) -> StreamItem<Event> {
        StreamItem::data(("k".to_string(), ts, value))
    }

    fn entry(we: i64, value: i64) -> StreamItem<TimestampedEntry<String, i64>> {
        StreamItem::Data(TimestampedEntry::new(we, "k".to_string(), value))
    }

    #[test]
    fn test_tumbling_sum_windows() {
        verify_processor(|| {
            aggregate_to_sliding_window(
                |e: &Event| e.0.clone(),
                |e: &Event| e.1,
                WindowDefinition::tumbling(10),
                summing_i64(|e: &Event| e.2),
            )
        })
        .input(vec![
            event(5, 1),
            event(7, 2),
            event(12, 3),
            event(18, 4),
            StreamItem::watermark(100),
        ])
        .expect_output(vec![entry(10, 3), entry(20, 7), StreamItem::watermark(100)])
        .unwrap();
    }

    #[test]
    fn test_sliding_sum_windows() {
        verify_processor(|| {
            aggregate_to_sliding_window(
                |e: &Event| e.0.clone(),
                |e: &Event| e.1,
                WindowDefinition::sliding(10, 5),
                summing_i64(|e: &Event| e.2),
            )
        })
        .input(vec![
            event(3, 1),
            event(7, 1),
            event(12, 1),
            StreamItem::watermark(20),
        ])
        .expect_output(vec![
            entry(5, 1),
            entry(10, 2),
            entry(15, 2),
            entry(20, 1),
            StreamItem::watermark(20),
        ])
        .unwrap();
    }

    #[test]
    fn test_session_merge_through_snapshots() {
        verify_processor(|| {
            SessionWindowP::new(
                5,
                |e: &(String, i64)| e.1,
                |e: &(String, i64)| e.0.clone(),
                counting(),
            )
        })
        .input(vec![
            StreamItem::data(("a".to_string(), 10)),
            StreamItem::data(("a".to_string(), 12)),
            StreamItem::data(("a".to_string(), 20)),
            StreamItem::data(("a".to_string(), 22)),
            StreamItem::data(("a".to_string(), 16)),
            StreamItem::watermark(100),
        ])
        .expect_output(vec![
            StreamItem::Data(SessionWindowResult {
                start: 10,
                end: 27,
                key: "a".to_string(),
                result: 5,
            }),
            StreamItem::watermark(100),
        ])
        .unwrap();
    }

    // A processor that neither consumes nor emits nor finishes.
    struct StuckP;

    impl Processor for StuckP {
        type In = i64;
        type Out = i64;

        fn process(
            &mut self,
            _ordinal: usize,
            _inbox: &mut Inbox<StreamItem<i64>>,
            _outbox: &mut Outbox<i64>,
            _ctx: &Context,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_progress_violation_detected() {
        let err = verify_processor(|| StuckP)
            .input(vec![StreamItem::data(1)])
            .expect_output(vec![])
            .unwrap_err();
        assert!(err.to_string().contains("without progress"), "{err}");
    }

    // A processor that emits the same snapshot key twice.
    struct DuplicateKeyP;

    impl Processor for DuplicateKeyP {
        type In = i64;
        type Out = i64;

        fn process(
            &mut self,
            _ordinal: usize,
            inbox: &mut Inbox<StreamItem<i64>>,
            _outbox: &mut Outbox<i64>,
            _ctx: &Context,
        ) -> Result<()> {
            inbox.drain_to(|_| {});
            Ok(())
        }

        fn save_snapshot(&mut self, outbox: &mut Outbox<i64>) -> Result<bool> {
            outbox.offer_to_snapshot(&"dup", &1i64)?;
            outbox.offer_to_snapshot(&"dup", &2i64)?;
            Ok(true)
        }

        fn restore_snapshot(&mut self, inbox: &mut Inbox<SnapshotEntry>) -> Result<()> {
            inbox.drain_to(|_| {});
            Ok(())
        }

        fn is_cooperative(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_duplicate_snapshot_key_detected() {
        let err = verify_processor(|| DuplicateKeyP)
            .input(vec![StreamItem::data(1)])
            .expect_output(vec![])
            .unwrap_err();
        assert!(err.to_string().contains("duplicate key"), "{err}");
    }

    // A non-cooperative processor may take its time; only cooperative ones
    // are timed.
    struct SlowNonCooperativeP;

    impl Processor for SlowNonCooperativeP {
        type In = i64;
        type Out = i64;

        fn process(
            &mut self,
            _ordinal: usize,
            inbox: &mut Inbox<StreamItem<i64>>,
            outbox: &mut Outbox<i64>,
            _ctx: &Context,
        ) -> Result<()> {
            std::thread::sleep(Duration::from_millis(20));
            while let Some(item) = inbox.poll() {
                outbox.broadcast(item)?;
            }
            Ok(())
        }

        fn is_cooperative(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_non_cooperative_not_timed() {
        verify_processor(|| SlowNonCooperativeP)
            .input(vec![StreamItem::data(7)])
            .cooperative_timeout(Duration::from_millis(1))
            .expect_output(vec![StreamItem::data(7)])
            .unwrap();
    }

    #[test]
    fn test_custom_output_checker() {
        // Order-insensitive comparison.
        verify_processor(|| map(|v: &i64| Some(*v)))
            .input(vec![StreamItem::data(1), StreamItem::data(2)])
            .output_checker(|expected, actual| {
                let mut a = format!("{actual:?}").into_bytes();
                let mut e = format!("{expected:?}").into_bytes();
                a.sort_unstable();
                e.sort_unstable();
                a == e
            })
            .expect_output(vec![StreamItem::data(2), StreamItem::data(1)])
            .unwrap();
    }
}
