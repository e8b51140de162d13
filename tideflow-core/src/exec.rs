//! Local execution of processor pipelines.
//!
//! A [`ProcessorTasklet`] binds one processor instance to its input and
//! output edges (bounded channels). A tasklet never blocks inside a step:
//! it moves whatever the channels and the processor allow and reports
//! whether it made progress. Cooperative tasklets share worker threads in
//! round-robin; each non-cooperative tasklet gets a dedicated thread that
//! may block on its outbound edges.
//!
//! End-of-stream is signalled by closing the channel: a tasklet drops its
//! senders once its processor completed, and an upstream disconnect marks
//! the input edge exhausted. Watermarks from multiple input edges are
//! coalesced to their minimum before the processor sees them.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::error::EngineError;
use crate::inbox::Inbox;
use crate::outbox::Outbox;
use crate::processor::{Context, JobHandle, Processor};
use crate::types::{StreamData, StreamItem};
use crate::watermark::WatermarkCoalescer;

/// Default capacity of the edges between tasklets (bounded for
/// backpressure).
pub const DEFAULT_EDGE_CAPACITY: usize = 1024;

/// How many items one step moves from an input edge into the inbox.
const INBOX_BATCH: usize = 256;

/// Create a bounded edge between two tasklets.
pub fn edge<T>(capacity: usize) -> (Sender<StreamItem<T>>, Receiver<StreamItem<T>>) {
    bounded(capacity)
}

/// Outcome of one tasklet step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Moved data, produced output, or advanced the lifecycle.
    Made,
    /// Nothing to do right now; call again later.
    Idle,
    /// Terminal: the tasklet finished and closed its outputs.
    Done,
}

/// A unit of work the workers drive. One step must return promptly.
pub trait Tasklet: Send {
    fn name(&self) -> &str;
    fn step(&mut self) -> Result<Progress>;
}

enum Phase {
    Process,
    Complete,
    Done,
}

/// Drives one processor instance over its edges.
pub struct ProcessorTasklet<P: Processor> {
    name: String,
    processor: P,
    ctx: Context,
    initialized: bool,
    blocking: bool,
    inputs: Vec<Receiver<StreamItem<P::In>>>,
    outputs: Vec<Sender<StreamItem<P::Out>>>,
    inbox: Inbox<StreamItem<P::In>>,
    /// Ordinal whose items the inbox currently holds.
    inbox_ordinal: usize,
    outbox: Outbox<P::Out>,
    coalescer: WatermarkCoalescer,
    edge_done: Vec<bool>,
    /// Exhausted ordinals whose `complete_edge` has not finished yet.
    edges_to_complete: VecDeque<usize>,
    next_input: usize,
    phase: Phase,
    /// Whether `complete()` has returned `true`; it is never called again
    /// afterwards.
    completed: bool,
}

impl<P: Processor> ProcessorTasklet<P> {
    /// Bind `processor` to its edges. The tasklet's blocking behaviour
    /// follows [`Processor::is_cooperative`].
    pub fn new(
        name: impl Into<String>,
        processor: P,
        ctx: Context,
        inputs: Vec<Receiver<StreamItem<P::In>>>,
        outputs: Vec<Sender<StreamItem<P::Out>>>,
    ) -> Self {
        let name = name.into();
        let blocking = !processor.is_cooperative();
        let num_inputs = inputs.len();
        let num_outputs = outputs.len();
        // Cooperative processors run against a small outbox so emission
        // yields frequently; non-cooperative ones flush with blocking sends.
        let outbox_capacity = if blocking { usize::MAX } else { INBOX_BATCH };
        Self {
            processor,
            ctx,
            initialized: false,
            blocking,
            inputs,
            outputs,
            inbox: Inbox::new(),
            inbox_ordinal: 0,
            outbox: Outbox::new(&name, num_outputs, outbox_capacity),
            coalescer: WatermarkCoalescer::new(num_inputs),
            edge_done: vec![false; num_inputs],
            edges_to_complete: VecDeque::new(),
            next_input: 0,
            phase: Phase::Process,
            completed: false,
            name,
        }
    }

    /// Move queued outbox items onto the outbound edges.
    fn flush_outbox(&mut self) -> Result<bool> {
        let mut moved = false;
        for ordinal in 0..self.outputs.len() {
            while let Some(item) = self.outbox.peek_bucket(ordinal) {
                if self.blocking {
                    self.outputs[ordinal]
                        .send(item.clone())
                        .map_err(|_| anyhow!("edge from '{}' closed by downstream", self.name))?;
                } else {
                    match self.outputs[ordinal].try_send(item.clone()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => break,
                        Err(TrySendError::Disconnected(_)) => {
                            bail!("edge from '{}' closed by downstream", self.name);
                        }
                    }
                }
                self.outbox.pop_bucket(ordinal);
                moved = true;
            }
        }
        Ok(moved)
    }

    /// Pull a batch from one input edge into the inbox. Returns `true` if
    /// any item arrived or an edge was discovered exhausted.
    fn fill_inbox(&mut self) -> bool {
        let num_inputs = self.inputs.len();
        for offset in 0..num_inputs {
            let ordinal = (self.next_input + offset) % num_inputs;
            if self.edge_done[ordinal] {
                continue;
            }
            let mut got_any = false;
            while self.inbox.len() < INBOX_BATCH {
                match self.inputs[ordinal].try_recv() {
                    Ok(StreamItem::Watermark(wm)) => {
                        got_any = true;
                        if let Some(min) = self.coalescer.observe(ordinal, wm) {
                            self.inbox.add(StreamItem::watermark(min));
                        }
                    }
                    Ok(item) => {
                        got_any = true;
                        self.inbox.add(item);
                    }
                    Err(crossbeam_channel::TryRecvError::Empty) => break,
                    Err(crossbeam_channel::TryRecvError::Disconnected) => {
                        self.edge_done[ordinal] = true;
                        self.edges_to_complete.push_back(ordinal);
                        if let Some(min) = self.coalescer.edge_exhausted(ordinal) {
                            self.inbox.add(StreamItem::watermark(min));
                        }
                        tracing::debug!(tasklet = %self.name, ordinal, "input edge exhausted");
                        break;
                    }
                }
            }
            if got_any || !self.inbox.is_empty() {
                self.inbox_ordinal = ordinal;
                // Resume the rotation at the next edge for fairness.
                self.next_input = (ordinal + 1) % num_inputs;
                return true;
            }
        }
        false
    }
}

impl<P: Processor> Tasklet for ProcessorTasklet<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn step(&mut self) -> Result<Progress> {
        if matches!(self.phase, Phase::Done) {
            return Ok(Progress::Done);
        }
        if self.ctx.job().is_done() {
            self.outputs.clear();
            self.phase = Phase::Done;
            return Ok(Progress::Done);
        }
        if !self.initialized {
            self.processor.init(&self.ctx)?;
            self.initialized = true;
            tracing::debug!(tasklet = %self.name, "initialized");
        }

        let mut progress = self.flush_outbox()?;

        match self.phase {
            Phase::Done => unreachable!("handled above"),
            Phase::Process => {
                if !self.inbox.is_empty() {
                    self.processor.process(
                        self.inbox_ordinal,
                        &mut self.inbox,
                        &mut self.outbox,
                        &self.ctx,
                    )?;
                    progress = true;
                } else if let Some(&ordinal) = self.edges_to_complete.front() {
                    if self
                        .processor
                        .complete_edge(ordinal, &mut self.outbox, &self.ctx)?
                    {
                        self.edges_to_complete.pop_front();
                    }
                    progress = true;
                } else if self.fill_inbox() {
                    progress = true;
                } else if self.edge_done.iter().all(|done| *done)
                    && self.edges_to_complete.is_empty()
                {
                    self.phase = Phase::Complete;
                    progress = true;
                } else if !self.processor.try_process(&mut self.outbox, &self.ctx)? {
                    progress = true;
                }
            }
            Phase::Complete => {
                if !self.completed {
                    self.completed = self.processor.complete(&mut self.outbox, &self.ctx)?;
                }
                if self.completed {
                    self.flush_outbox()?;
                    if (0..self.outbox.num_ordinals())
                        .all(|ordinal| self.outbox.bucket_len(ordinal) == 0)
                    {
                        // Close the outbound edges: end-of-stream.
                        self.outputs.clear();
                        self.phase = Phase::Done;
                        tracing::debug!(tasklet = %self.name, "completed");
                        return Ok(Progress::Done);
                    }
                }
                progress = true;
            }
        }

        Ok(if progress { Progress::Made } else { Progress::Idle })
    }
}

/// Source tasklet feeding a fixed item sequence into one edge.
pub struct VecSource<T> {
    name: String,
    items: VecDeque<StreamItem<T>>,
    output: Option<Sender<StreamItem<T>>>,
}

impl<T: StreamData> VecSource<T> {
    pub fn new(
        name: impl Into<String>,
        items: Vec<StreamItem<T>>,
        output: Sender<StreamItem<T>>,
    ) -> Self {
        Self {
            name: name.into(),
            items: items.into(),
            output: Some(output),
        }
    }
}

impl<T: StreamData> Tasklet for VecSource<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn step(&mut self) -> Result<Progress> {
        let Some(output) = self.output.as_ref() else {
            return Ok(Progress::Done);
        };
        let mut progress = Progress::Idle;
        while let Some(item) = self.items.front() {
            match output.try_send(item.clone()) {
                Ok(()) => {
                    self.items.pop_front();
                    progress = Progress::Made;
                }
                Err(TrySendError::Full(_)) => return Ok(progress),
                Err(TrySendError::Disconnected(_)) => {
                    bail!("edge from source '{}' closed by downstream", self.name);
                }
            }
        }
        self.output = None;
        Ok(Progress::Done)
    }
}

/// Sink tasklet collecting every received item into a shared vector.
pub struct VecSink<T> {
    name: String,
    input: Receiver<StreamItem<T>>,
    collected: Arc<Mutex<Vec<StreamItem<T>>>>,
}

impl<T: StreamData> VecSink<T> {
    pub fn new(name: impl Into<String>, input: Receiver<StreamItem<T>>) -> Self {
        Self {
            name: name.into(),
            input,
            collected: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle to the collected output; read it after the job finished.
    pub fn collected(&self) -> Arc<Mutex<Vec<StreamItem<T>>>> {
        self.collected.clone()
    }
}

impl<T: StreamData> Tasklet for VecSink<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn step(&mut self) -> Result<Progress> {
        let mut progress = Progress::Idle;
        loop {
            match self.input.try_recv() {
                Ok(item) => {
                    self.collected.lock().expect("sink lock").push(item);
                    progress = Progress::Made;
                }
                Err(crossbeam_channel::TryRecvError::Empty) => return Ok(progress),
                Err(crossbeam_channel::TryRecvError::Disconnected) => {
                    return Ok(Progress::Done)
                }
            }
        }
    }
}

/// A set of tasklets executed together as one local job.
pub struct LocalJob {
    job: JobHandle,
    cooperative: Vec<Box<dyn Tasklet>>,
    dedicated: Vec<Box<dyn Tasklet>>,
}

impl LocalJob {
    /// Create an empty job around the given handle. The same handle must
    /// be passed to the [`Context`] of every participating processor.
    pub fn new(job: JobHandle) -> Self {
        Self {
            job,
            cooperative: Vec::new(),
            dedicated: Vec::new(),
        }
    }

    /// Add a tasklet to the shared cooperative workers.
    pub fn add(&mut self, tasklet: Box<dyn Tasklet>) -> &mut Self {
        self.cooperative.push(tasklet);
        self
    }

    /// Add a tasklet that owns a dedicated thread (non-cooperative
    /// processors, blocking sources).
    pub fn add_dedicated(&mut self, tasklet: Box<dyn Tasklet>) -> &mut Self {
        self.dedicated.push(tasklet);
        self
    }

    /// Run every tasklet to completion on `workers` cooperative worker
    /// threads plus one thread per dedicated tasklet. Returns once all
    /// tasklets finished or the job failed.
    pub fn run(self, workers: usize) -> Result<()> {
        assert!(workers > 0, "at least one worker");
        let job = self.job;

        // Deal cooperative tasklets round-robin onto the workers.
        let mut assignments: Vec<Vec<Box<dyn Tasklet>>> =
            (0..workers).map(|_| Vec::new()).collect();
        for (index, tasklet) in self.cooperative.into_iter().enumerate() {
            assignments[index % workers].push(tasklet);
        }

        let mut handles = Vec::new();
        for (index, tasklets) in assignments.into_iter().enumerate() {
            if tasklets.is_empty() {
                continue;
            }
            let job = job.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("tideflow-worker-{index}"))
                    .spawn(move || worker_loop(tasklets, job))?,
            );
        }
        for tasklet in self.dedicated {
            let job = job.clone();
            let name = format!("tideflow-{}", tasklet.name());
            handles.push(
                std::thread::Builder::new()
                    .name(name)
                    .spawn(move || worker_loop(vec![tasklet], job))?,
            );
        }

        for handle in handles {
            let _ = handle.join();
        }

        match job.failure() {
            Some(reason) => Err(anyhow!(reason)),
            None => Ok(()),
        }
    }
}

/// Round-robin over the worker's tasklets until all are done or the job
/// dies. A panic inside a step is a user-code fault that fails the job.
fn worker_loop(mut tasklets: Vec<Box<dyn Tasklet>>, job: JobHandle) {
    let mut done = vec![false; tasklets.len()];
    loop {
        if job.is_done() {
            return;
        }
        let mut all_done = true;
        let mut any_progress = false;
        for (index, tasklet) in tasklets.iter_mut().enumerate() {
            if done[index] {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| tasklet.step()));
            match outcome {
                Ok(Ok(Progress::Made)) => {
                    all_done = false;
                    any_progress = true;
                }
                Ok(Ok(Progress::Idle)) => {
                    all_done = false;
                }
                Ok(Ok(Progress::Done)) => {
                    done[index] = true;
                }
                Ok(Err(err)) => {
                    tracing::error!(tasklet = tasklet.name(), %err, "tasklet failed");
                    job.fail(format!("tasklet '{}' failed: {err:#}", tasklet.name()));
                    return;
                }
                Err(_panic) => {
                    let fault = EngineError::UserCodeFault {
                        vertex: tasklet.name().to_string(),
                        detail: "panic in processor callback".to_string(),
                    };
                    tracing::error!(tasklet = tasklet.name(), "panic in processor callback");
                    job.fail(fault.to_string());
                    return;
                }
            }
        }
        if all_done {
            return;
        }
        if !any_progress {
            // Everyone is waiting on channels; back off briefly.
            std::thread::sleep(Duration::from_micros(50));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::summing_i64;
    use crate::transform::map;
    use crate::types::TimestampedEntry;
    use crate::window::{aggregate_to_sliding_window, WindowDefinition};

    fn ctx_for(job: &JobHandle, vertex: &str) -> Context {
        Context::new(vertex, 0, 1, false, job.clone())
    }

    #[test]
    fn test_single_stage_pipeline() {
        let job = JobHandle::new();
        let (src_tx, src_rx) = edge::<i64>(8);
        let (out_tx, out_rx) = edge::<i64>(8);

        let source = VecSource::new(
            "source",
            vec![StreamItem::data(1i64), StreamItem::data(2), StreamItem::data(3)],
            src_tx,
        );
        let tasklet = ProcessorTasklet::new(
            "double",
            map(|v: &i64| Some(v * 2)),
            ctx_for(&job, "double"),
            vec![src_rx],
            vec![out_tx],
        );
        let sink = VecSink::new("sink", out_rx);
        let collected = sink.collected();

        let mut local = LocalJob::new(job);
        local.add(Box::new(source));
        local.add(Box::new(tasklet));
        local.add(Box::new(sink));
        local.run(1).unwrap();

        let out = collected.lock().unwrap().clone();
        assert_eq!(
            out,
            vec![StreamItem::data(2i64), StreamItem::data(4), StreamItem::data(6)]
        );
    }

    #[test]
    fn test_two_stage_windowed_pipeline() {
        type Event = (String, i64, i64);
        let job = JobHandle::new();
        let (src_tx, src_rx) = edge::<Event>(8);
        let (mid_tx, mid_rx) = edge::<Event>(8);
        let (out_tx, out_rx) = edge::<TimestampedEntry<String, i64>>(8);

        let source = VecSource::new(
            "source",
            vec![
                StreamItem::data(("k".to_string(), 5, 1)),
                StreamItem::data(("k".to_string(), 7, 2)),
                StreamItem::data(("k".to_string(), 12, 3)),
                StreamItem::watermark(100),
            ],
            src_tx,
        );
        let forward = ProcessorTasklet::new(
            "forward",
            map(|e: &Event| Some(e.clone())),
            ctx_for(&job, "forward"),
            vec![src_rx],
            vec![mid_tx],
        );
        let window = ProcessorTasklet::new(
            "window",
            aggregate_to_sliding_window(
                |e: &Event| e.0.clone(),
                |e: &Event| e.1,
                WindowDefinition::tumbling(10),
                summing_i64(|e: &Event| e.2),
            ),
            ctx_for(&job, "window"),
            vec![mid_rx],
            vec![out_tx],
        );
        let sink = VecSink::new("sink", out_rx);
        let collected = sink.collected();

        let mut local = LocalJob::new(job);
        local.add(Box::new(source));
        local.add(Box::new(forward));
        local.add(Box::new(window));
        local.add(Box::new(sink));
        local.run(1).unwrap();

        let out = collected.lock().unwrap().clone();
        assert_eq!(
            out,
            vec![
                StreamItem::Data(TimestampedEntry::new(10, "k".to_string(), 3)),
                StreamItem::Data(TimestampedEntry::new(20, "k".to_string(), 3)),
                StreamItem::watermark(100),
            ]
        );
    }

    #[test]
    fn test_watermarks_coalesced_across_edges() {
        let job = JobHandle::new();
        let (tx_a, rx_a) = edge::<i64>(8);
        let (tx_b, rx_b) = edge::<i64>(8);
        let (out_tx, out_rx) = edge::<i64>(8);

        let source_a = VecSource::new(
            "source-a",
            vec![StreamItem::data(1i64), StreamItem::watermark(10)],
            tx_a,
        );
        let source_b = VecSource::new(
            "source-b",
            vec![StreamItem::data(2i64), StreamItem::watermark(5)],
            tx_b,
        );
        let merge = ProcessorTasklet::new(
            "merge",
            map(|v: &i64| Some(*v)),
            ctx_for(&job, "merge"),
            vec![rx_a, rx_b],
            vec![out_tx],
        );
        let sink = VecSink::new("sink", out_rx);
        let collected = sink.collected();

        let mut local = LocalJob::new(job);
        local.add(Box::new(source_a));
        local.add(Box::new(source_b));
        local.add(Box::new(merge));
        local.add(Box::new(sink));
        local.run(1).unwrap();

        let out = collected.lock().unwrap().clone();
        let wms: Vec<i64> = out
            .iter()
            .filter_map(|item| match item {
                StreamItem::Watermark(wm) => Some(*wm),
                _ => None,
            })
            .collect();
        // wm=10 alone must not cross the vertex while edge B is behind;
        // once edge A closes its slot stops limiting, so the minimum is
        // B's 5. Nothing follows because B then closes too.
        assert_eq!(wms, vec![5]);
        let data: Vec<i64> = out
            .iter()
            .filter_map(|item| match item {
                StreamItem::Data(v) => Some(*v),
                _ => None,
            })
            .collect();
        assert_eq!(data.len(), 2);
        assert!(data.contains(&1) && data.contains(&2));
    }

    #[test]
    fn test_panic_becomes_user_code_fault() {
        let job = JobHandle::new();
        let (src_tx, src_rx) = edge::<i64>(8);
        let (out_tx, out_rx) = edge::<i64>(8);

        let source = VecSource::new("source", vec![StreamItem::data(1i64)], src_tx);
        let faulty = ProcessorTasklet::new(
            "faulty",
            map(|_: &i64| -> Option<i64> { panic!("user bug") }),
            ctx_for(&job, "faulty"),
            vec![src_rx],
            vec![out_tx],
        );
        let sink = VecSink::new("sink", out_rx);

        let mut local = LocalJob::new(job);
        local.add(Box::new(source));
        local.add(Box::new(faulty));
        local.add(Box::new(sink));
        let err = local.run(1).unwrap_err();
        assert!(err.to_string().contains("user code fault"), "{err}");
    }

    #[test]
    fn test_cancellation_stops_the_job() {
        let job = JobHandle::new();
        let (_src_tx, src_rx) = edge::<i64>(8);
        let (out_tx, _out_rx) = edge::<i64>(8);

        // The source never sends nor closes, so only cancellation can end
        // this job.
        let stuck = ProcessorTasklet::new(
            "stuck",
            map(|v: &i64| Some(*v)),
            ctx_for(&job, "stuck"),
            vec![src_rx],
            vec![out_tx],
        );
        let mut local = LocalJob::new(job.clone());
        local.add(Box::new(stuck));

        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            job.cancel();
        });
        local.run(1).unwrap();
        canceller.join().unwrap();
    }

    #[test]
    fn test_wm_coalesce_with_exhausted_edge() {
        // When one edge closes early its slot stops limiting the minimum.
        let job = JobHandle::new();
        let (tx_a, rx_a) = edge::<i64>(8);
        let (tx_b, rx_b) = edge::<i64>(8);
        let (out_tx, out_rx) = edge::<i64>(8);

        let source_a = VecSource::new("source-a", vec![StreamItem::data(1i64)], tx_a);
        let source_b = VecSource::new(
            "source-b",
            vec![StreamItem::data(2i64), StreamItem::watermark(7)],
            tx_b,
        );
        let merge = ProcessorTasklet::new(
            "merge",
            map(|v: &i64| Some(*v)),
            ctx_for(&job, "merge"),
            vec![rx_a, rx_b],
            vec![out_tx],
        );
        let sink = VecSink::new("sink", out_rx);
        let collected = sink.collected();

        let mut local = LocalJob::new(job);
        local.add(Box::new(source_a));
        local.add(Box::new(source_b));
        local.add(Box::new(merge));
        local.add(Box::new(sink));
        local.run(1).unwrap();

        let out = collected.lock().unwrap().clone();
        let wms: Vec<i64> = out
            .iter()
            .filter_map(|item| match item {
                StreamItem::Watermark(wm) => Some(*wm),
                _ => None,
            })
            .collect();
        assert_eq!(wms, vec![7], "closed edge A must not hold wm back");
    }
}
