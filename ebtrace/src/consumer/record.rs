//! Raw and typed event records.

use bytes::{BufMut, Bytes, BytesMut};
use ebtrace_common::{
    EventHeader, ProcessEvent, SocketDataHeader, StackSample, EVENT_HEADER_SIZE,
    EVENT_PROCESS_EXEC, EVENT_PROCESS_EXIT, EVENT_SOCKET_DATA, EVENT_STACK_SAMPLE,
};

use crate::domain::{CpuId, Timestamp};

/// One record drained from a CPU's buffer, header already split off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub cpu: CpuId,
    /// Per-CPU position; records lost to overrun advance it too
    pub sequence: u64,
    pub timestamp: Timestamp,
    pub type_tag: u32,
    pub payload: Bytes,
}

/// Copy a `#[repr(C)]` record out of a byte buffer.
///
/// Returns `None` if the buffer is too short. Only used with the plain
/// integer layouts from `ebtrace-common`, for which every bit pattern is valid.
#[allow(unsafe_code)]
pub(crate) fn read_record<T: Copy>(bytes: &[u8]) -> Option<T> {
    if bytes.len() < std::mem::size_of::<T>() {
        return None;
    }
    // SAFETY: length checked above; read_unaligned tolerates any alignment.
    Some(unsafe { bytes.as_ptr().cast::<T>().read_unaligned() })
}

/// Split a raw record into its header and payload.
///
/// `None` when the record is shorter than the header or than the payload
/// length the header claims.
pub(crate) fn split_record(record: &Bytes) -> Option<(EventHeader, Bytes)> {
    let header: EventHeader = read_record(record)?;
    let end = EVENT_HEADER_SIZE.checked_add(header.len as usize)?;
    if record.len() < end {
        return None;
    }
    Some((header, record.slice(EVENT_HEADER_SIZE..end)))
}

/// Frame a payload the way kernel-side programs do.
///
/// Used for replaying captured records through a [`MemoryRing`](super::MemoryRing).
#[must_use]
pub fn encode_record(type_tag: u32, timestamp_ns: u64, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(EVENT_HEADER_SIZE + payload.len());
    buf.put_u32_ne(type_tag);
    buf.put_u32_ne(u32::try_from(payload.len()).unwrap_or(u32::MAX));
    buf.put_u64_ne(timestamp_ns);
    buf.put_slice(payload);
    buf.freeze()
}

/// Record decoded according to its type tag.
#[derive(Debug, Clone)]
pub enum TypedEvent {
    StackSample(Box<StackSample>),
    ProcessExec(ProcessEvent),
    ProcessExit(ProcessEvent),
    SocketData { header: SocketDataHeader, data: Bytes },
}

impl TypedEvent {
    /// Decode the payload of a known record type.
    ///
    /// Returns `None` for unknown tags and truncated payloads.
    #[must_use]
    pub fn decode(event: &RawEvent) -> Option<Self> {
        let payload = &event.payload;
        match event.type_tag {
            EVENT_STACK_SAMPLE => {
                read_record::<StackSample>(payload).map(|s| TypedEvent::StackSample(Box::new(s)))
            }
            EVENT_PROCESS_EXEC => read_record(payload).map(TypedEvent::ProcessExec),
            EVENT_PROCESS_EXIT => read_record(payload).map(TypedEvent::ProcessExit),
            EVENT_SOCKET_DATA => {
                let header: SocketDataHeader = read_record(payload)?;
                let start = std::mem::size_of::<SocketDataHeader>();
                let end = (start + header.cap_len as usize).min(payload.len());
                Some(TypedEvent::SocketData { header, data: payload.slice(start..end) })
            }
            _ => None,
        }
    }
}

/// Reinterpret a `#[repr(C)]` record as bytes, for building test fixtures.
#[cfg(test)]
#[allow(unsafe_code)]
pub(crate) fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    // SAFETY: T is a plain-old-data record; the slice covers exactly its bytes.
    unsafe {
        std::slice::from_raw_parts(std::ptr::from_ref(value).cast::<u8>(), std::mem::size_of::<T>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(type_tag: u32, payload: &[u8]) -> RawEvent {
        RawEvent {
            cpu: CpuId(0),
            sequence: 0,
            timestamp: Timestamp(1),
            type_tag,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn test_split_record() {
        let record = encode_record(EVENT_PROCESS_EXEC, 42, b"abc");
        let (header, payload) = split_record(&record).unwrap();
        assert_eq!(header.type_tag, EVENT_PROCESS_EXEC);
        assert_eq!(header.len, 3);
        assert_eq!(header.timestamp_ns, 42);
        assert_eq!(&payload[..], b"abc");
    }

    #[test]
    fn test_split_record_rejects_short_records() {
        assert!(split_record(&Bytes::from_static(&[1, 0, 0])).is_none());

        let mut record = BytesMut::from(&encode_record(EVENT_PROCESS_EXEC, 0, b"abcdef")[..]);
        record.truncate(EVENT_HEADER_SIZE + 2);
        assert!(split_record(&record.freeze()).is_none());
    }

    #[test]
    fn test_decode_process_exec() {
        let mut event = ProcessEvent { pid: 10, ppid: 1, ..ProcessEvent::default() };
        event.comm[..4].copy_from_slice(b"bash");

        match TypedEvent::decode(&raw(EVENT_PROCESS_EXEC, as_bytes(&event))) {
            Some(TypedEvent::ProcessExec(decoded)) => {
                assert_eq!(decoded.pid, 10);
                assert_eq!(ebtrace_common::comm_str(&decoded.comm), "bash");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_socket_data_clamps_capture() {
        let header = SocketDataHeader { pid: 7, cap_len: 64, ..SocketDataHeader::default() };
        let mut payload = as_bytes(&header).to_vec();
        payload.extend_from_slice(b"GET / HTTP/1.1");

        match TypedEvent::decode(&raw(EVENT_SOCKET_DATA, &payload)) {
            Some(TypedEvent::SocketData { header, data }) => {
                assert_eq!(header.pid, 7);
                assert_eq!(&data[..], b"GET / HTTP/1.1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_truncated_and_unknown() {
        assert!(TypedEvent::decode(&raw(EVENT_STACK_SAMPLE, &[0u8; 8])).is_none());
        assert!(TypedEvent::decode(&raw(999, &[0u8; 64])).is_none());
    }
}
