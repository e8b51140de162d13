//! Windowed click counting over a generated event stream.
//!
//! Pipeline: generated clicks -> watermark insertion -> 10 s tumbling
//! count per user -> collected results printed at the end.

use std::time::Duration;

use anyhow::Result;

use tideflow_core::aggregate::counting;
use tideflow_core::exec::{edge, LocalJob, ProcessorTasklet, VecSink, VecSource};
use tideflow_core::processor::{Context, JobHandle};
use tideflow_core::types::{StreamItem, TimestampedEntry};
use tideflow_core::watermark::{emit_by_frame, with_fixed_lag, InsertWatermarksP};
use tideflow_core::window::{aggregate_to_sliding_window, WindowDefinition};

/// A click event: (user, event-time ms).
type Click = (String, i64);

fn lcg_next(state: &mut u64) -> u64 {
    *state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
    *state
}

/// Generate a mildly out-of-order stream of clicks for a few users.
fn gen_clicks(seed: u64, n: usize) -> Vec<StreamItem<Click>> {
    let users = ["ada", "grace", "edsger"];
    let mut state = seed;
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let user = users[(lcg_next(&mut state) % users.len() as u64) as usize];
        let jitter = (lcg_next(&mut state) % 3_000) as i64;
        let ts = i as i64 * 500 + jitter;
        out.push(StreamItem::data((user.to_string(), ts)));
    }
    out
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let window = WindowDefinition::tumbling(10_000);
    let job = JobHandle::new();

    let (src_tx, src_rx) = edge::<Click>(1024);
    let (wm_tx, wm_rx) = edge::<Click>(1024);
    let (out_tx, out_rx) = edge::<TimestampedEntry<String, i64>>(1024);

    let source = VecSource::new("clicks", gen_clicks(42, 200), src_tx);
    let insert = ProcessorTasklet::new(
        "insert-watermarks",
        InsertWatermarksP::new(
            |c: &Click| c.1,
            with_fixed_lag(Duration::from_secs(3)),
            emit_by_frame(window),
        ),
        Context::new("insert-watermarks", 0, 1, false, job.clone()),
        vec![src_rx],
        vec![wm_tx],
    );
    let count = ProcessorTasklet::new(
        "count-per-user",
        aggregate_to_sliding_window(
            |c: &Click| c.0.clone(),
            |c: &Click| c.1,
            window,
            counting(),
        ),
        Context::new("count-per-user", 0, 1, false, job.clone()),
        vec![wm_rx],
        vec![out_tx],
    );
    let sink = VecSink::new("results", out_rx);
    let collected = sink.collected();

    tracing::info!("running windowed click count");
    let mut local = LocalJob::new(job);
    local.add(Box::new(source));
    local.add(Box::new(insert));
    local.add(Box::new(count));
    local.add(Box::new(sink));
    local.run(2)?;

    let results = collected.lock().expect("sink lock").clone();
    for item in &results {
        if let StreamItem::Data(entry) = item {
            println!(
                "window ending {:>6} ms  {:<8} {:>3} clicks",
                entry.timestamp, entry.key, entry.value
            );
        }
    }
    tracing::info!(windows = results.iter().filter(|i| i.is_data()).count(), "done");
    Ok(())
}
