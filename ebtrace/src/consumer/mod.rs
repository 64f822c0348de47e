//! # Event Ring Consumer
//!
//! Drains the per-CPU buffers kernel probes write into and routes records
//! to handlers by type tag.
//!
//! ## Components
//!
//! - [`CpuRing`] - one CPU's buffer ([`PerfCpuRing`] over aya, [`MemoryRing`] in-process)
//! - [`EventConsumer`] - `poll()` / `dispatch()` across all CPUs
//! - [`RawEvent`] / [`TypedEvent`] - records before and after decoding
//! - [`ConsumerStats`] - event, drop, unknown and malformed counters
//!
//! ## Ordering
//!
//! Records from one CPU come out in the order they were written. Nothing
//! orders records across CPUs; sort on [`RawEvent::timestamp`] if needed.
//! Overruns are never silent: lost records add to the drop counter and
//! advance the CPU's sequence number.

mod poller;
pub(crate) mod record;
mod ring;
mod stats;

pub use poller::{ConsumerConfig, EventConsumer, Handler, Polled};
pub use record::{encode_record, RawEvent, TypedEvent};
pub use ring::{open_perf_rings, CpuRing, Drained, MemoryProducer, MemoryRing, PerfCpuRing};
pub use stats::{ConsumerStats, StatsSnapshot};
