//! Per-CPU record sources.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use aya::maps::perf::{PerfEventArray, PerfEventArrayBuffer};
use aya::maps::{Map, MapData};
use bytes::{Bytes, BytesMut};

use crate::domain::{ConsumerError, CpuId};

/// Records read by one [`CpuRing::drain`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Drained {
    pub read: usize,
    /// Records the producer overwrote or discarded since the last drain
    pub lost: u64,
}

/// One CPU's buffer as seen by the consumer.
pub trait CpuRing: Send {
    fn cpu(&self) -> CpuId;

    /// Move up to `max` pending records into `out`, oldest first.
    ///
    /// Never waits for new records.
    ///
    /// # Errors
    /// Returns an error if the underlying buffer cannot be read
    fn drain(&mut self, out: &mut Vec<Bytes>, max: usize) -> Result<Drained, ConsumerError>;
}

/// Number of scratch buffers handed to one `read_events` call.
const PERF_READ_BATCH: usize = 16;

/// Kernel perf buffer of one CPU.
pub struct PerfCpuRing {
    cpu: CpuId,
    buffer: PerfEventArrayBuffer<MapData>,
    scratch: Vec<BytesMut>,
}

impl PerfCpuRing {
    #[must_use]
    pub fn new(cpu: CpuId, buffer: PerfEventArrayBuffer<MapData>) -> Self {
        let scratch = (0..PERF_READ_BATCH).map(|_| BytesMut::with_capacity(4096)).collect();
        Self { cpu, buffer, scratch }
    }
}

impl CpuRing for PerfCpuRing {
    fn cpu(&self) -> CpuId {
        self.cpu
    }

    fn drain(&mut self, out: &mut Vec<Bytes>, max: usize) -> Result<Drained, ConsumerError> {
        let mut total = Drained::default();
        while total.read < max && self.buffer.readable() {
            let events = self
                .buffer
                .read_events(&mut self.scratch)
                .map_err(|e| ConsumerError::Read { cpu: self.cpu, reason: e.to_string() })?;
            for buf in self.scratch.iter_mut().take(events.read) {
                out.push(buf.split().freeze());
            }
            total.read += events.read;
            total.lost += events.lost as u64;
            if events.read == 0 && events.lost == 0 {
                break;
            }
        }
        Ok(total)
    }
}

/// Open one perf buffer per CPU on the `PERF_EVENT_ARRAY` map.
///
/// # Errors
/// Returns an error if the map has the wrong type or a buffer cannot be mapped
pub fn open_perf_rings(
    map: Map,
    cpus: &[CpuId],
    page_count: Option<usize>,
) -> Result<Vec<Box<dyn CpuRing>>, ConsumerError> {
    let mut array = PerfEventArray::try_from(map)?;
    cpus.iter()
        .map(|&cpu| {
            let buffer = array
                .open(cpu.0, page_count)
                .map_err(|e| ConsumerError::BufferOpen { cpu, reason: e.to_string() })?;
            Ok(Box::new(PerfCpuRing::new(cpu, buffer)) as Box<dyn CpuRing>)
        })
        .collect()
}

#[derive(Debug)]
struct MemoryRingState {
    records: VecDeque<Bytes>,
    capacity: usize,
    lost: u64,
}

/// Bounded in-process ring that overwrites its oldest record when full.
///
/// Behaves like a kernel buffer with overwrite semantics: the producer never
/// waits and overwritten records are reported as lost.
#[derive(Debug)]
pub struct MemoryRing {
    cpu: CpuId,
    state: Arc<Mutex<MemoryRingState>>,
}

/// Producer side of a [`MemoryRing`].
#[derive(Debug, Clone)]
pub struct MemoryProducer {
    state: Arc<Mutex<MemoryRingState>>,
}

impl MemoryRing {
    /// Create a ring holding at most `capacity` records (minimum 1).
    #[must_use]
    pub fn new(cpu: CpuId, capacity: usize) -> (Self, MemoryProducer) {
        let state = Arc::new(Mutex::new(MemoryRingState {
            records: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            lost: 0,
        }));
        (Self { cpu, state: Arc::clone(&state) }, MemoryProducer { state })
    }
}

impl MemoryProducer {
    /// Append a record, overwriting the oldest one if the ring is full.
    pub fn push(&self, record: Bytes) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.records.len() >= state.capacity {
            state.records.pop_front();
            state.lost += 1;
        }
        state.records.push_back(record);
    }

    /// Report records the producer had to discard without writing.
    pub fn record_lost(&self, count: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.lost += count;
    }
}

impl CpuRing for MemoryRing {
    fn cpu(&self) -> CpuId {
        self.cpu
    }

    fn drain(&mut self, out: &mut Vec<Bytes>, max: usize) -> Result<Drained, ConsumerError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let take = state.records.len().min(max);
        out.extend(state.records.drain(..take));
        Ok(Drained { read: take, lost: std::mem::take(&mut state.lost) })
    }
}
