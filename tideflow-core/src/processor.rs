//! The per-vertex processor contract.
//!
//! A processor transforms zero or more input streams into zero or more
//! output streams; each stream corresponds to one edge ordinal of the
//! vertex. The engine owns the control flow and repeatedly invokes the
//! callbacks; the processor never schedules itself.
//!
//! # Lifecycle
//!
//! ```text
//! init -> { process | try_process }* -> complete_edge* -> complete*
//!      -> { save_snapshot | restore_snapshot + finish_snapshot_restore }*
//! ```
//!
//! # Cooperative contract
//!
//! A cooperative processor ([`is_cooperative`](Processor::is_cooperative)
//! returns `true`) shares a worker thread with its peers. Every callback
//! must return quickly (~1 ms soft budget) and must never block. The only
//! suspension points are the callback returns themselves: to yield with
//! work remaining, return `false` from a boolean callback or leave items in
//! the inbox. A non-cooperative processor owns a dedicated thread, may block
//! indefinitely, and must return `true` from `try_process` immediately.
//!
//! # Progress rule
//!
//! Every callback must consume from the inbox, emit to the outbox, or
//! return `true`. A call that does none of these is a defect, surfaced by
//! the verification harness as a contract violation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};

use crate::inbox::Inbox;
use crate::outbox::{Outbox, SnapshotEntry};
use crate::types::{StreamData, StreamItem};

/// Shared handle to the job's completion state. Long-running or blocking
/// callbacks consult [`is_done`](JobHandle::is_done) and return promptly
/// once the job is cancelled or failed.
#[derive(Clone, Default)]
pub struct JobHandle {
    inner: Arc<JobHandleInner>,
}

#[derive(Default)]
struct JobHandleInner {
    done: AtomicBool,
    failure: Mutex<Option<String>>,
}

impl JobHandle {
    /// Create a fresh, running job handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `true` once the job was cancelled or failed.
    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }

    /// Cancel the job. Idempotent.
    pub fn cancel(&self) {
        self.inner.done.store(true, Ordering::Release);
    }

    /// Fail the job with the given reason. The first failure wins.
    pub fn fail(&self, reason: impl Into<String>) {
        let mut failure = self.inner.failure.lock().expect("job handle lock");
        if failure.is_none() {
            *failure = Some(reason.into());
        }
        drop(failure);
        self.inner.done.store(true, Ordering::Release);
    }

    /// The recorded failure reason, if the job failed.
    pub fn failure(&self) -> Option<String> {
        self.inner.failure.lock().expect("job handle lock").clone()
    }
}

/// Context passed to the processor in [`Processor::init`] and every
/// subsequent callback.
#[derive(Clone)]
pub struct Context {
    vertex_name: String,
    global_processor_index: usize,
    local_parallelism: usize,
    snapshotting_enabled: bool,
    job: JobHandle,
}

impl Context {
    pub fn new(
        vertex_name: impl Into<String>,
        global_processor_index: usize,
        local_parallelism: usize,
        snapshotting_enabled: bool,
        job: JobHandle,
    ) -> Self {
        Self {
            vertex_name: vertex_name.into(),
            global_processor_index,
            local_parallelism,
            snapshotting_enabled,
            job,
        }
    }

    /// Name of the vertex this processor instance belongs to.
    pub fn vertex_name(&self) -> &str {
        &self.vertex_name
    }

    /// Index of this instance among all instances of the vertex.
    pub fn global_processor_index(&self) -> usize {
        self.global_processor_index
    }

    /// Number of parallel instances of this vertex on the local member.
    pub fn local_parallelism(&self) -> usize {
        self.local_parallelism
    }

    /// Whether snapshots will be taken for this job.
    pub fn snapshotting_enabled(&self) -> bool {
        self.snapshotting_enabled
    }

    /// Handle to check for job cancellation.
    pub fn job(&self) -> &JobHandle {
        &self.job
    }
}

/// The state machine every operator obeys. See the module docs for the
/// lifecycle and the cooperative contract.
///
/// Shared helpers for emission live in free-standing utilities
/// ([`crate::outbox::flush_pending`], [`crate::traverser`]) rather than in
/// a base implementation; each processor composes what it needs.
pub trait Processor: Send {
    /// Item type received on the input edges.
    type In: StreamData;
    /// Item type deposited to the outbox.
    type Out: StreamData;

    /// Called exactly once, before any other callback.
    fn init(&mut self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    /// Called only with a non-empty inbox. The processor removes the items
    /// it has fully processed; items it could not finish stay in the inbox
    /// and the engine calls again with the same batch.
    fn process(
        &mut self,
        ordinal: usize,
        inbox: &mut Inbox<StreamItem<Self::In>>,
        outbox: &mut Outbox<Self::Out>,
        ctx: &Context,
    ) -> Result<()>;

    /// Periodic tick when no input is available; lets the processor emit on
    /// time or advance timers. Non-cooperative processors must return
    /// `Ok(true)` immediately.
    fn try_process(&mut self, _outbox: &mut Outbox<Self::Out>, _ctx: &Context) -> Result<bool> {
        Ok(true)
    }

    /// Called once per input ordinal when that input is exhausted;
    /// re-invoked until it returns `true`.
    fn complete_edge(
        &mut self,
        _ordinal: usize,
        _outbox: &mut Outbox<Self::Out>,
        _ctx: &Context,
    ) -> Result<bool> {
        Ok(true)
    }

    /// Called after all inputs are exhausted; may emit until it returns
    /// `true`. Returning `true` without emission is valid termination.
    fn complete(&mut self, _outbox: &mut Outbox<Self::Out>, _ctx: &Context) -> Result<bool> {
        Ok(true)
    }

    /// Whether this instance participates in cooperative multithreading.
    /// The value is fixed for the lifetime of the instance.
    fn is_cooperative(&self) -> bool {
        true
    }

    /// Stream state into the outbox's snapshot bucket as `(key, value)`
    /// records until nothing remains, then return `true`. May be paused by
    /// a full bucket (`Ok(false)`, resumed on the next call). Each key must
    /// be emitted at most once per capture.
    fn save_snapshot(&mut self, _outbox: &mut Outbox<Self::Out>) -> Result<bool> {
        Ok(true)
    }

    /// Consume a batch of snapshot records and rebuild state. Called
    /// repeatedly until the snapshot data is exhausted.
    fn restore_snapshot(&mut self, _inbox: &mut Inbox<SnapshotEntry>) -> Result<()> {
        bail!("processor does not support snapshot restore");
    }

    /// Called after all records were restored; resolves derived invariants
    /// (ordering, emission cursors). Returns `true` when done.
    fn finish_snapshot_restore(&mut self) -> Result<bool> {
        Ok(true)
    }
}

/// Context for supplier resolution.
#[derive(Debug, Clone)]
pub struct SupplierContext {
    pub vertex_name: String,
    pub local_parallelism: usize,
    pub member_count: usize,
}

/// Creates the processor instances of one vertex on one member.
pub trait ProcessorSupplier: Send {
    type P: Processor;

    /// Called once on the target member before any `get`.
    fn init(&mut self, _ctx: &SupplierContext) -> Result<()> {
        Ok(())
    }

    /// Create `count` processor instances.
    fn get(&mut self, count: usize) -> Vec<Self::P>;
}

// Any `FnMut() -> P` closure is a supplier; this is the common case for
// local execution and the verification harness.
impl<Proc: Processor, F: FnMut() -> Proc + Send> ProcessorSupplier for F {
    type P = Proc;

    fn get(&mut self, count: usize) -> Vec<Proc> {
        (0..count).map(|_| self()).collect()
    }
}

/// Resolved on the job coordinator: maps each member to the
/// [`ProcessorSupplier`] that will run there.
pub trait ProcessorMetaSupplier: Send {
    type S: ProcessorSupplier;

    /// Called once on the coordinator before `get`.
    fn init(&mut self, _ctx: &SupplierContext) -> Result<()> {
        Ok(())
    }

    /// Return a factory assigning a supplier to each member index.
    fn get(&mut self, members: &[usize]) -> Box<dyn FnMut(usize) -> Self::S + Send>;
}

/// Declares the wrapped processor non-cooperative, moving it onto a
/// dedicated thread with a blocking outbox. All callbacks delegate.
pub struct NonCooperative<P>(pub P);

impl<P: Processor> Processor for NonCooperative<P> {
    type In = P::In;
    type Out = P::Out;

    fn init(&mut self, ctx: &Context) -> Result<()> {
        self.0.init(ctx)
    }

    fn process(
        &mut self,
        ordinal: usize,
        inbox: &mut Inbox<StreamItem<P::In>>,
        outbox: &mut Outbox<P::Out>,
        ctx: &Context,
    ) -> Result<()> {
        self.0.process(ordinal, inbox, outbox, ctx)
    }

    fn try_process(&mut self, _outbox: &mut Outbox<P::Out>, _ctx: &Context) -> Result<bool> {
        // Non-cooperative processors must not linger in the idle tick.
        Ok(true)
    }

    fn complete_edge(
        &mut self,
        ordinal: usize,
        outbox: &mut Outbox<P::Out>,
        ctx: &Context,
    ) -> Result<bool> {
        self.0.complete_edge(ordinal, outbox, ctx)
    }

    fn complete(&mut self, outbox: &mut Outbox<P::Out>, ctx: &Context) -> Result<bool> {
        self.0.complete(outbox, ctx)
    }

    fn is_cooperative(&self) -> bool {
        false
    }

    fn save_snapshot(&mut self, outbox: &mut Outbox<P::Out>) -> Result<bool> {
        self.0.save_snapshot(outbox)
    }

    fn restore_snapshot(&mut self, inbox: &mut Inbox<SnapshotEntry>) -> Result<()> {
        self.0.restore_snapshot(inbox)
    }

    fn finish_snapshot_restore(&mut self) -> Result<bool> {
        self.0.finish_snapshot_restore()
    }
}

/// Meta-supplier that hands the same supplier to every member.
pub struct ReplicatingMetaSupplier<Sup>(pub Sup);

impl<Sup: ProcessorSupplier + Clone + Send + 'static> ProcessorMetaSupplier
    for ReplicatingMetaSupplier<Sup>
{
    type S = Sup;

    fn get(&mut self, _members: &[usize]) -> Box<dyn FnMut(usize) -> Sup + Send> {
        let supplier = self.0.clone();
        Box::new(move |_| supplier.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Minimal conforming processor: forwards every item unchanged.
    struct ForwardP;

    impl Processor for ForwardP {
        type In = i32;
        type Out = i32;

        fn process(
            &mut self,
            _ordinal: usize,
            inbox: &mut Inbox<StreamItem<i32>>,
            outbox: &mut Outbox<i32>,
            _ctx: &Context,
        ) -> Result<()> {
            if !outbox.retry_broadcast()? {
                return Ok(());
            }
            while let Some(item) = inbox.poll() {
                if !outbox.broadcast(item)? {
                    return Ok(());
                }
            }
            Ok(())
        }
    }

    fn test_ctx() -> Context {
        Context::new("test", 0, 1, true, JobHandle::new())
    }

    #[test]
    fn test_forward_processor_drains_inbox() {
        let ctx = test_ctx();
        let mut p = ForwardP;
        p.init(&ctx).unwrap();

        let mut inbox = Inbox::new();
        inbox.add(StreamItem::data(1));
        inbox.add(StreamItem::watermark(10));
        let mut outbox = Outbox::new("test", 1, 8);

        p.process(0, &mut inbox, &mut outbox, &ctx).unwrap();
        assert!(inbox.is_empty());
        assert_eq!(outbox.pop_bucket(0), Some(StreamItem::data(1)));
        assert_eq!(outbox.pop_bucket(0), Some(StreamItem::watermark(10)));

        assert!(p.complete_edge(0, &mut outbox, &ctx).unwrap());
        assert!(p.complete(&mut outbox, &ctx).unwrap());
    }

    #[test]
    fn test_forward_processor_suspends_on_full_outbox() {
        let ctx = test_ctx();
        let mut p = ForwardP;

        let mut inbox = Inbox::new();
        inbox.add(StreamItem::data(1));
        inbox.add(StreamItem::data(2));
        let mut outbox = Outbox::new("test", 1, 1);

        // First call: item 1 fills the bucket, item 2 is left as an
        // unfinished broadcast inside the outbox.
        p.process(0, &mut inbox, &mut outbox, &ctx).unwrap();
        assert_eq!(outbox.pop_bucket(0), Some(StreamItem::data(1)));

        // Second call resumes the suspended emission.
        p.process(0, &mut inbox, &mut outbox, &ctx).unwrap();
        assert_eq!(outbox.pop_bucket(0), Some(StreamItem::data(2)));
        assert!(inbox.is_empty());
    }

    #[test]
    fn test_job_handle_cancel_and_fail() {
        let job = JobHandle::new();
        assert!(!job.is_done());
        job.cancel();
        assert!(job.is_done());
        assert_eq!(job.failure(), None);

        let job = JobHandle::new();
        job.fail("boom");
        job.fail("later"); // first failure wins
        assert!(job.is_done());
        assert_eq!(job.failure().as_deref(), Some("boom"));
    }

    #[test]
    fn test_closure_supplier() {
        let mut supplier = || ForwardP;
        let instances = ProcessorSupplier::get(&mut supplier, 3);
        assert_eq!(instances.len(), 3);
    }

    #[test]
    fn test_non_cooperative_wrapper() {
        let wrapped = NonCooperative(ForwardP);
        assert!(!wrapped.is_cooperative());
        assert!(ForwardP.is_cooperative());
    }

    #[test]
    fn test_replicating_meta_supplier() {
        #[derive(Clone)]
        struct S;
        impl ProcessorSupplier for S {
            type P = ForwardP;
            fn get(&mut self, count: usize) -> Vec<ForwardP> {
                (0..count).map(|_| ForwardP).collect()
            }
        }

        let mut meta = ReplicatingMetaSupplier(S);
        let mut assign = meta.get(&[0, 1]);
        let mut s = assign(1);
        assert_eq!(s.get(2).len(), 2);
    }
}
