//! # Shared Record Layouts (eBPF ↔ Userspace)
//!
//! Fixed-layout records written by kernel-side probe programs into the per-CPU
//! `EVENTS` perf buffers and decoded by the `ebtrace` consumer. All types are
//! `#[repr(C)]` so both sides agree on the memory layout.
//!
//! ## Record Framing
//!
//! Every record starts with an [`EventHeader`]. The header's `type_tag`
//! selects the payload layout that follows it:
//!
//! ```text
//! ┌──────────────┬───────────────────────────────┐
//! │ EventHeader  │ payload (type-specific)       │
//! │ 16 bytes     │ StackSample / ProcessEvent /  │
//! │              │ SocketDataHeader + data bytes │
//! └──────────────┴───────────────────────────────┘
//! ```
//!
//! Unknown tags are legal: probe programs may be upgraded independently of
//! the consumer, which skips and counts records it cannot decode.

#![no_std]

// ============================================================================
// Event Type Tags
// ============================================================================

/// Periodic or event-triggered stack sample of one thread.
pub const EVENT_STACK_SAMPLE: u32 = 1;

/// A process called `execve` (emitted from `sched/sched_process_exec`).
pub const EVENT_PROCESS_EXEC: u32 = 2;

/// A process exited (emitted from `sched/sched_process_exit`).
pub const EVENT_PROCESS_EXIT: u32 = 3;

/// Socket read/write captured at the syscall layer. The payload bytes that
/// follow the header are opaque to the core.
pub const EVENT_SOCKET_DATA: u32 = 4;

/// Maximum number of frames a probe records per stack.
///
/// Matches the kernel's `PERF_MAX_STACK_DEPTH` default.
pub const MAX_STACK_DEPTH: usize = 127;

/// Length of the kernel's `task_struct::comm`, including the NUL terminator.
pub const TASK_COMM_LEN: usize = 16;

/// Socket data direction: written by the traced process.
pub const SOCKET_DIR_EGRESS: u8 = 0;

/// Socket data direction: read by the traced process.
pub const SOCKET_DIR_INGRESS: u8 = 1;

// ============================================================================
// Record Layouts
// ============================================================================

/// Header present at the start of every record.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventHeader {
    /// One of the `EVENT_*` constants (or a tag this build does not know).
    pub type_tag: u32,

    /// Payload length in bytes, excluding this header.
    pub len: u32,

    /// `bpf_ktime_get_ns()` at capture time. Monotonic, boot-relative.
    ///
    /// Per-CPU buffers impose no global order; callers that need causal
    /// order across CPUs sort on this field.
    pub timestamp_ns: u64,
}

/// Size of [`EventHeader`] on the wire.
pub const EVENT_HEADER_SIZE: usize = core::mem::size_of::<EventHeader>();

/// Stack sample payload (`EVENT_STACK_SAMPLE`).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct StackSample {
    /// Process ID (TGID)
    pub pid: u32,

    /// Thread ID
    pub tid: u32,

    /// CPU the sample was taken on
    pub cpu_id: u32,

    /// Number of valid entries in `user_ips`
    pub user_depth: u32,

    /// Number of valid entries in `kernel_ips`
    pub kernel_depth: u32,

    #[allow(clippy::pub_underscore_fields)]
    pub _padding: u32,

    /// Thread command name, NUL padded
    pub comm: [u8; TASK_COMM_LEN],

    /// User-space instruction pointers, innermost frame first
    pub user_ips: [u64; MAX_STACK_DEPTH],

    /// Kernel instruction pointers, innermost frame first
    pub kernel_ips: [u64; MAX_STACK_DEPTH],
}

impl StackSample {
    /// All-zero sample with no frames
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            pid: 0,
            tid: 0,
            cpu_id: 0,
            user_depth: 0,
            kernel_depth: 0,
            _padding: 0,
            comm: [0; TASK_COMM_LEN],
            user_ips: [0; MAX_STACK_DEPTH],
            kernel_ips: [0; MAX_STACK_DEPTH],
        }
    }

    /// Valid user-space frames
    #[must_use]
    pub fn user_frames(&self) -> &[u64] {
        let depth = (self.user_depth as usize).min(MAX_STACK_DEPTH);
        &self.user_ips[..depth]
    }

    /// Valid kernel frames
    #[must_use]
    pub fn kernel_frames(&self) -> &[u64] {
        let depth = (self.kernel_depth as usize).min(MAX_STACK_DEPTH);
        &self.kernel_ips[..depth]
    }
}

impl core::fmt::Debug for StackSample {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StackSample")
            .field("pid", &self.pid)
            .field("tid", &self.tid)
            .field("cpu_id", &self.cpu_id)
            .field("comm", &comm_str(&self.comm))
            .field("user_frames", &self.user_frames())
            .field("kernel_frames", &self.kernel_frames())
            .finish()
    }
}

/// Process lifecycle payload (`EVENT_PROCESS_EXEC` and `EVENT_PROCESS_EXIT`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessEvent {
    pub pid: u32,
    pub ppid: u32,

    /// Exit code for exit events, 0 for exec events
    pub exit_code: i32,

    #[allow(clippy::pub_underscore_fields)]
    pub _padding: u32,

    /// Task start time in nanoseconds since boot (`task_struct::start_time`)
    pub start_time_ns: u64,

    pub comm: [u8; TASK_COMM_LEN],
}

/// Socket data payload header (`EVENT_SOCKET_DATA`).
///
/// `cap_len` bytes of captured data follow this header in the record.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SocketDataHeader {
    pub pid: u32,
    pub tid: u32,
    pub fd: u32,

    /// `SOCKET_DIR_EGRESS` or `SOCKET_DIR_INGRESS`
    pub direction: u8,

    /// IP protocol number (6 = TCP, 17 = UDP)
    pub l4_protocol: u8,

    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u8; 2],

    /// Kernel-assigned socket identifier, stable for the socket's lifetime
    pub socket_id: u64,

    /// Bytes transferred by the syscall
    pub syscall_len: u64,

    /// Bytes actually captured after this header
    pub cap_len: u32,

    #[allow(clippy::pub_underscore_fields)]
    pub _padding2: u32,
}

/// Interpret a NUL-padded `comm` buffer as a string.
///
/// Invalid UTF-8 yields the longest valid prefix.
#[must_use]
pub fn comm_str(comm: &[u8; TASK_COMM_LEN]) -> &str {
    let end = comm.iter().position(|&b| b == 0).unwrap_or(TASK_COMM_LEN);
    match core::str::from_utf8(&comm[..end]) {
        Ok(s) => s,
        Err(e) => core::str::from_utf8(&comm[..e.valid_up_to()]).unwrap_or(""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_sixteen_bytes() {
        assert_eq!(EVENT_HEADER_SIZE, 16);
    }

    #[test]
    fn comm_str_stops_at_nul() {
        let mut comm = [0u8; TASK_COMM_LEN];
        comm[..5].copy_from_slice(b"nginx");
        assert_eq!(comm_str(&comm), "nginx");
    }

    #[test]
    fn comm_str_full_width() {
        let comm = *b"abcdefghijklmnop";
        assert_eq!(comm_str(&comm), "abcdefghijklmnop");
    }

    #[test]
    fn stack_frames_clamped_to_depth() {
        let mut sample = StackSample { user_depth: 2, kernel_depth: 500, ..StackSample::empty() };
        sample.user_ips[0] = 0x1000;
        sample.user_ips[1] = 0x2000;
        assert_eq!(sample.user_frames(), &[0x1000, 0x2000]);
        assert_eq!(sample.kernel_frames().len(), MAX_STACK_DEPTH);
    }
}
