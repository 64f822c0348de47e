//! Profile report: folded stacks built from stack-sample events.
//!
//! The poll loop must never wait on symbolization, so samples are handed to
//! a worker thread over a bounded channel with a non-blocking send. Samples
//! that don't fit are counted and reported next to the consumer's own drop
//! count, so the final sample counts can be read for what they are.
//!
//! ## Data Flow
//!
//! ```text
//! EventConsumer::dispatch()
//!     │  EVENT_STACK_SAMPLE handler
//!     ▼
//! SampleSender::offer()  ──(try_send, bounded)──►  worker thread
//!                                                    │ Resolver::resolve()
//!                                                    ▼
//!                                              StackAggregator
//!                                                    │ on disconnect
//!                                                    ▼
//!                                              ProfileReport
//! ```

// Percentage calculations intentionally convert u64 to f64
#![allow(clippy::cast_precision_loss)]

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender, TrySendError};
use ebtrace_common::{comm_str, StackSample};
use log::{info, warn};

use crate::domain::Pid;
use crate::symbolization::{ImageLoader, MapsSource, ResolvedFrame, Resolver};

/// Default capacity of the sample channel.
pub const DEFAULT_SAMPLE_QUEUE: usize = 4096;

// =============================================================================
// SAMPLE SENDER (POLL LOOP SIDE)
// =============================================================================

/// Non-blocking handle the poll loop uses to pass samples on.
#[derive(Clone)]
pub struct SampleSender {
    tx: Sender<StackSample>,
    dropped: Arc<AtomicU64>,
}

impl SampleSender {
    /// Queue `sample` for symbolization, or count it as dropped if the
    /// worker is behind (or gone).
    pub fn offer(&self, sample: StackSample) -> bool {
        match self.tx.try_send(sample) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// =============================================================================
// STACK AGGREGATOR
// =============================================================================

/// Folded stack counts (`comm;outer;...;inner` → samples).
#[derive(Debug, Default)]
pub struct StackAggregator {
    stacks: HashMap<String, u64>,
    total_samples: u64,
}

impl StackAggregator {
    /// Record one sample whose frames are innermost first.
    pub fn record(&mut self, comm: &str, frames: &[ResolvedFrame]) {
        *self.stacks.entry(fold(comm, frames)).or_default() += 1;
        self.total_samples += 1;
    }

    #[must_use]
    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    /// Finish aggregation; `queue_dropped` is the number of samples the
    /// worker never saw.
    #[must_use]
    pub fn into_report(self, queue_dropped: u64) -> ProfileReport {
        let mut stacks: Vec<(String, u64)> = self.stacks.into_iter().collect();
        // Most samples first; ties by name for stable output
        stacks.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ProfileReport { stacks, total_samples: self.total_samples, queue_dropped }
    }
}

/// Folded representation of one stack, root first.
fn fold(comm: &str, frames: &[ResolvedFrame]) -> String {
    let mut line = if comm.is_empty() { "[unknown]".to_string() } else { comm.to_string() };
    for frame in frames.iter().rev() {
        line.push(';');
        line.push_str(frame.name());
    }
    line
}

// =============================================================================
// PROFILE REPORT (OUTPUT TYPE)
// =============================================================================

/// Aggregated stacks, most frequent first.
#[derive(Debug, Clone, Default)]
pub struct ProfileReport {
    pub stacks: Vec<(String, u64)>,
    pub total_samples: u64,
    /// Samples dropped between the poll loop and the worker
    pub queue_dropped: u64,
}

impl ProfileReport {
    /// The `n` most frequent stacks.
    #[must_use]
    pub fn top(&self, n: usize) -> &[(String, u64)] {
        &self.stacks[..n.min(self.stacks.len())]
    }

    /// Render the top `n` stacks as text.
    ///
    /// `consumer_dropped` is the kernel-side loss reported by the event
    /// consumer.
    #[must_use]
    pub fn render(&self, n: usize, consumer_dropped: u64) -> String {
        let mut out = format!(
            "{} samples ({} lost in event buffers, {} dropped before symbolization)\n",
            self.total_samples, consumer_dropped, self.queue_dropped
        );
        for (stack, count) in self.top(n) {
            let pct = if self.total_samples == 0 {
                0.0
            } else {
                *count as f64 * 100.0 / self.total_samples as f64
            };
            let _ = writeln!(out, "{count:>8} {pct:>5.1}%  {stack}");
        }
        out
    }

    /// Log the report, warning when samples were lost.
    pub fn log_summary(&self, n: usize, consumer_dropped: u64) {
        if consumer_dropped > 0 || self.queue_dropped > 0 {
            warn!(
                "⚠️  Sample counts are incomplete: {consumer_dropped} events lost in kernel buffers, {} dropped before symbolization",
                self.queue_dropped
            );
        }
        for line in self.render(n, consumer_dropped).lines() {
            info!("{line}");
        }
    }
}

// =============================================================================
// WORKER
// =============================================================================

/// Start the symbolization worker.
///
/// The worker exits and returns its report once every [`SampleSender`]
/// clone has been dropped.
pub fn spawn_report_worker<M, L>(
    resolver: Resolver<M, L>,
    capacity: usize,
) -> (SampleSender, JoinHandle<ProfileReport>)
where
    M: MapsSource + 'static,
    L: ImageLoader + 'static,
{
    let (tx, rx) = bounded::<StackSample>(capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    let sender = SampleSender { tx, dropped: Arc::clone(&dropped) };

    let handle = std::thread::spawn(move || {
        let mut aggregator = StackAggregator::default();
        let mut addrs = Vec::new();
        for sample in rx {
            // Kernel frames sit below user frames; both innermost first.
            addrs.clear();
            addrs.extend_from_slice(sample.kernel_frames());
            addrs.extend_from_slice(sample.user_frames());
            let frames = resolver.resolve(Pid::from(sample.pid), &addrs);
            aggregator.record(comm_str(&sample.comm), &frames);
        }
        let stats = resolver.cache().stats();
        info!(
            "Symbol cache: {} tables, {} KiB, {} hits, {} misses, {} invalidated, {} evicted",
            stats.entries,
            stats.used_bytes / 1024,
            stats.hits,
            stats.misses,
            stats.invalidations,
            stats.evictions
        );
        aggregator.into_report(dropped.load(Ordering::Relaxed))
    });

    (sender, handle)
}
