//! Polling and dispatch across all CPU buffers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ebtrace_common::{EVENT_PROCESS_EXEC, EVENT_PROCESS_EXIT, EVENT_SOCKET_DATA, EVENT_STACK_SAMPLE};
use log::{info, warn};

use super::record::{split_record, RawEvent};
use super::ring::CpuRing;
use super::stats::ConsumerStats;
use crate::domain::{ConsumerError, CpuId, Timestamp};

/// Longest single sleep while waiting for records.
const POLL_SLICE: Duration = Duration::from_millis(10);

/// Callback for one record type.
pub type Handler = Box<dyn FnMut(&RawEvent) + Send>;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Records taken from one CPU per pass before moving to the next CPU.
    /// Passes repeat until every buffer is empty; `None` takes a whole
    /// buffer in one pass.
    pub batch_per_cpu: Option<usize>,
    /// How often poll() logs a counter summary
    pub summary_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self { batch_per_cpu: None, summary_interval: Duration::from_secs(10) }
    }
}

struct CpuSource {
    ring: Box<dyn CpuRing>,
    next_sequence: u64,
}

struct Pending {
    cpu: CpuId,
    sequence: u64,
    record: Bytes,
}

/// Drains every CPU buffer and routes records by type tag.
pub struct EventConsumer {
    sources: Vec<CpuSource>,
    handlers: HashMap<u32, Handler>,
    known_tags: Arc<HashSet<u32>>,
    stats: Arc<ConsumerStats>,
    config: ConsumerConfig,
    scratch: Vec<Bytes>,
    last_summary: Instant,
    dropped_at_summary: u64,
}

impl EventConsumer {
    #[must_use]
    pub fn new(rings: Vec<Box<dyn CpuRing>>, config: ConsumerConfig) -> Self {
        let known_tags =
            [EVENT_STACK_SAMPLE, EVENT_PROCESS_EXEC, EVENT_PROCESS_EXIT, EVENT_SOCKET_DATA]
                .into_iter()
                .collect();
        Self {
            sources: rings.into_iter().map(|ring| CpuSource { ring, next_sequence: 0 }).collect(),
            handlers: HashMap::new(),
            known_tags: Arc::new(known_tags),
            stats: Arc::new(ConsumerStats::default()),
            config,
            scratch: Vec::new(),
            last_summary: Instant::now(),
            dropped_at_summary: 0,
        }
    }

    /// Report into an existing counter set instead of a private one.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<ConsumerStats>) -> Self {
        self.stats = stats;
        self
    }

    #[must_use]
    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    #[must_use]
    pub fn cpu_count(&self) -> usize {
        self.sources.len()
    }

    /// Route records tagged `type_tag` to `handler`, replacing any previous one.
    ///
    /// Registering a tag also makes [`poll`](Self::poll) yield it.
    pub fn register_handler<F>(&mut self, type_tag: u32, handler: F)
    where
        F: FnMut(&RawEvent) + Send + 'static,
    {
        Arc::make_mut(&mut self.known_tags).insert(type_tag);
        self.handlers.insert(type_tag, Box::new(handler));
    }

    /// Wait up to `timeout` for records and take everything available.
    ///
    /// Once a pass finds records (or losses), passes over all CPUs repeat
    /// until every buffer reports empty, so nothing available is left
    /// behind. Never returns later than `timeout`. Records come out in per-CPU order; no
    /// order holds across CPUs. Decoding happens as the result is iterated:
    /// malformed records and unknown tags are counted and skipped, and
    /// records left unconsumed when the result is dropped count as abandoned.
    ///
    /// # Errors
    /// Currently infallible per CPU (read failures are logged); kept
    /// fallible for sources that can fail as a whole
    pub fn poll(&mut self, timeout: Duration) -> Result<Polled, ConsumerError> {
        let deadline = Instant::now() + timeout;
        self.stats.add_poll();

        let mut pending = Vec::new();
        loop {
            if self.drain_all(&mut pending) > 0 {
                while Instant::now() < deadline && self.drain_all(&mut pending) > 0 {}
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(POLL_SLICE));
        }

        self.maybe_log_summary();
        Ok(Polled {
            pending: pending.into_iter(),
            known_tags: Arc::clone(&self.known_tags),
            stats: Arc::clone(&self.stats),
        })
    }

    /// Poll once and hand each record to its registered handler.
    ///
    /// Returns how many records reached a handler.
    ///
    /// # Errors
    /// Propagates [`poll`](Self::poll) errors
    pub fn dispatch(&mut self, timeout: Duration) -> Result<usize, ConsumerError> {
        let polled = self.poll(timeout)?;
        let mut dispatched = 0;
        for event in polled {
            if let Some(handler) = self.handlers.get_mut(&event.type_tag) {
                handler(&event);
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// One pass over all CPUs. Returns the number of records read or lost.
    fn drain_all(&mut self, pending: &mut Vec<Pending>) -> u64 {
        let Self { sources, scratch, stats, config, .. } = self;
        let batch = config.batch_per_cpu.unwrap_or(usize::MAX);
        let mut seen = 0;
        for source in sources.iter_mut() {
            scratch.clear();
            let cpu = source.ring.cpu();
            let drained = match source.ring.drain(scratch, batch) {
                Ok(drained) => drained,
                Err(e) => {
                    warn!("⚠️  {e}");
                    continue;
                }
            };
            // Losses are charged before the records of the same drain.
            if drained.lost > 0 {
                stats.add_dropped(drained.lost);
                source.next_sequence += drained.lost;
                seen += drained.lost;
            }
            seen += scratch.len() as u64;
            for record in scratch.drain(..) {
                pending.push(Pending { cpu, sequence: source.next_sequence, record });
                source.next_sequence += 1;
            }
        }
        seen
    }

    fn maybe_log_summary(&mut self) {
        if self.last_summary.elapsed() < self.config.summary_interval {
            return;
        }
        let snapshot = self.stats.snapshot();
        info!("Consumer: {snapshot}");
        if snapshot.dropped > self.dropped_at_summary {
            warn!(
                "⚠️  {} events dropped since last summary (buffers overrun)",
                snapshot.dropped - self.dropped_at_summary
            );
        }
        self.dropped_at_summary = snapshot.dropped;
        self.last_summary = Instant::now();
    }
}

/// Records taken by one [`EventConsumer::poll`].
pub struct Polled {
    pending: std::vec::IntoIter<Pending>,
    known_tags: Arc<HashSet<u32>>,
    stats: Arc<ConsumerStats>,
}

impl Iterator for Polled {
    type Item = RawEvent;

    fn next(&mut self) -> Option<RawEvent> {
        for Pending { cpu, sequence, record } in self.pending.by_ref() {
            let Some((header, payload)) = split_record(&record) else {
                self.stats.add_malformed();
                continue;
            };
            if !self.known_tags.contains(&header.type_tag) {
                self.stats.add_unknown();
                continue;
            }
            self.stats.add_events(1);
            return Some(RawEvent {
                cpu,
                sequence,
                timestamp: Timestamp(header.timestamp_ns),
                type_tag: header.type_tag,
                payload,
            });
        }
        None
    }
}

impl Drop for Polled {
    fn drop(&mut self) {
        let rest = self.pending.len() as u64;
        if rest > 0 {
            self.stats.add_abandoned(rest);
        }
    }
}
