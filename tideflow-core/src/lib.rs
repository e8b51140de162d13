//! # Tideflow Core
//!
//! Per-vertex processor runtime for a DAG of stream/batch processors
//! exchanging items through inboxes and outboxes.
//!
//! This crate provides the processor contract and the stateful operators
//! built on it:
//!
//! - [`types`] — Core data types: [`StreamItem`](types::StreamItem) with its
//!   data/watermark/barrier payloads,
//!   [`TimestampedEntry`](types::TimestampedEntry), and the
//!   [`StreamData`](types::StreamData) trait bound.
//! - [`inbox`] / [`outbox`] — Bounded conduits between stages: batch-wise
//!   input, per-ordinal output buckets plus the snapshot bucket.
//! - [`processor`] — The [`Processor`](processor::Processor) contract,
//!   [`Context`](processor::Context), job handle and suppliers.
//! - [`traverser`] — Resumable lazy sequences used for flat-map emission.
//! - [`transform`] — Stateless map / filter / flat-map processors.
//! - [`aggregate`] — Aggregate operations (create, accumulate, combine,
//!   deduct, finish) and their stage transformations.
//! - [`window`] — Frame-aligned sliding/tumbling window aggregation,
//!   single- and two-stage.
//! - [`session`] — Gap-based merging session windows.
//! - [`watermark`] — Watermark policies, emission throttling, coalescing
//!   across edges, and the watermark-inserting processor.
//! - [`cogroup`] — Batch co-group and whole-stream aggregation.
//! - [`harness`] — The verification driver asserting the processor
//!   contract (progress, timing, snapshot round-trips).
//! - [`exec`] — Local cooperative execution of processor pipelines.

pub mod aggregate;
pub mod cogroup;
pub mod error;
pub mod exec;
pub mod harness;
pub mod inbox;
pub mod outbox;
pub mod processor;
pub mod session;
pub mod transform;
pub mod traverser;
pub mod types;
pub mod watermark;
pub mod window;
