//! Consumer counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters shared between the polling context and observers.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    events: AtomicU64,
    dropped: AtomicU64,
    abandoned: AtomicU64,
    unknown: AtomicU64,
    malformed: AtomicU64,
    polls: AtomicU64,
}

/// Point-in-time copy of [`ConsumerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Records yielded to callers
    pub events: u64,
    /// Records lost to buffer overrun
    pub dropped: u64,
    /// Records taken from a buffer but never consumed by the caller
    pub abandoned: u64,
    /// Records skipped for an unknown type tag
    pub unknown: u64,
    /// Records skipped for a bad header
    pub malformed: u64,
    pub polls: u64,
}

impl ConsumerStats {
    pub(crate) fn add_events(&self, n: u64) {
        self.events.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_abandoned(&self, n: u64) {
        self.abandoned.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_unknown(&self) {
        self.unknown.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_poll(&self) {
        self.polls.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events: self.events.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "events={} dropped={} abandoned={} unknown={} malformed={} polls={}",
            self.events, self.dropped, self.abandoned, self.unknown, self.malformed, self.polls
        )
    }
}
