//! Shared operation counter and the periodic throughput sampler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Completed-operation counter shared by every read worker.
#[derive(Clone, Debug, Default)]
pub struct OpsCounter {
    ops: Arc<AtomicU64>,
}

impl OpsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self) {
        self.ops.fetch_add(1, Ordering::Relaxed);
    }

    /// Read the current value and reset it to zero in one step.
    pub fn take(&self) -> u64 {
        self.ops.swap(0, Ordering::AcqRel)
    }

    pub fn load(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }
}

/// Totals across the whole monitoring run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MonitorSummary {
    pub ticks: u64,
    pub total_ops: u64,
    pub peak_ops: u64,
}

/// Samples `counter` every `interval` and passes each sample to `report`.
///
/// The first sample is taken one full interval after start. Cancellation is
/// observed between ticks; operations counted after the last completed tick
/// are discarded rather than reported as a short interval.
pub async fn run_monitor<F>(
    counter: OpsCounter,
    interval: Duration,
    cancel: CancellationToken,
    mut report: F,
) -> MonitorSummary
where
    F: FnMut(u64),
{
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut summary = MonitorSummary::default();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let ops = counter.take();
                summary.ticks += 1;
                summary.total_ops += ops;
                summary.peak_ops = summary.peak_ops.max(ops);
                report(ops);
            }
        }
    }

    summary
}
