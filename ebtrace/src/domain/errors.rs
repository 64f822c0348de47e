//! Structured error types for ebtrace
//!
//! Using thiserror for automatic Display implementation and error chaining.
//!
//! Expected races (a process exiting, a binary being replaced) never show up
//! here as hard failures: the resolver and registry absorb them into
//! "unknown" / "none" results. These enums carry the structural failures a
//! caller has to act on.

use super::types::{CpuId, Pid};
use thiserror::Error;

/// Failures of the probe attachment manager.
#[derive(Error, Debug)]
pub enum AttachError {
    #[error("Failed to load eBPF object {path}: {reason}")]
    ObjectLoadFailed { path: String, reason: String },

    #[error("Program {0} not found in eBPF object")]
    ProgramNotFound(String),

    #[error("Program {program} is not a {expected} program")]
    WrongProgramType { program: String, expected: &'static str },

    #[error("Verifier rejected {program}: {reason}")]
    LoadRejected { program: String, reason: String },

    #[error("Permission denied loading or attaching {program} (requires root or CAP_BPF)")]
    PermissionDenied { program: String },

    #[error("Kernel resources exhausted while setting up {program}: {reason}")]
    ResourceExhausted { program: String, reason: String },

    #[error("Attach target {target} for {program} does not exist on this system")]
    AttachTargetMissing { program: String, target: String },

    #[error("Failed to attach {program} to {target}: {reason}")]
    AttachFailed { program: String, target: String, reason: String },

    #[error("Failed to detach {program}: {reason}")]
    DetachFailed { program: String, reason: String },

    #[error("Probe handle {0} is not owned by this manager")]
    UnknownHandle(u64),

    #[error("Invalid probe spec '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },
}

impl AttachError {
    /// Whether retrying the same operation could succeed.
    ///
    /// Only kernel-side resource exhaustion qualifies; verification and
    /// privilege failures are permanent for this run.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, AttachError::ResourceExhausted { .. })
    }
}

/// Failures reading the process table.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Failed to read process table at {path}: {source}")]
    TableUnavailable {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Startup outcomes that abort the agent without being crashes.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("{name} with process ID {pid} is already running")]
    AlreadyRunning { name: String, pid: i32 },

    #[error("No probes could be attached ({failed} failed)")]
    NoProbesAttached { failed: usize },
}

/// Failures of the event ring consumer.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Events map {0} not found in eBPF object")]
    MapNotFound(String),

    #[error("Failed to open event buffer for {cpu}: {reason}")]
    BufferOpen { cpu: CpuId, reason: String },

    #[error("Failed to read event buffer for {cpu}: {reason}")]
    Read { cpu: CpuId, reason: String },

    #[error(transparent)]
    Map(#[from] aya::maps::MapError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures inside the symbolizer.
///
/// `resolve()` never returns these: they are logged and turned into
/// unknown frames. They exist so the building blocks (map parsing, ELF
/// loading) can be tested and reused on their own.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Process {0} is gone")]
    ProcessGone(Pid),

    #[error("Symbol table unavailable for {path}: {reason}")]
    SymbolTableUnavailable { path: String, reason: String },

    #[error("Malformed maps line: {0}")]
    MalformedMapsLine(String),

    #[error("Failed to read {path}: {reason}")]
    Io { path: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_gone_display() {
        let err = ResolveError::ProcessGone(Pid(1234));
        assert_eq!(err.to_string(), "Process PID:1234 is gone");
    }

    #[test]
    fn test_attach_target_missing_display() {
        let err = AttachError::AttachTargetMissing {
            program: "trace_tcp_sendmsg".to_string(),
            target: "kprobe:tcp_sendmsg".to_string(),
        };
        assert!(err.to_string().contains("trace_tcp_sendmsg"));
        assert!(err.to_string().contains("kprobe:tcp_sendmsg"));
    }

    #[test]
    fn test_only_exhaustion_is_retryable() {
        let exhausted =
            AttachError::ResourceExhausted { program: "p".into(), reason: "ENOMEM".into() };
        let rejected = AttachError::LoadRejected { program: "p".into(), reason: "bad".into() };
        assert!(exhausted.is_retryable());
        assert!(!rejected.is_retryable());
        assert!(!AttachError::PermissionDenied { program: "p".into() }.is_retryable());
    }

    #[test]
    fn test_already_running_display() {
        let err = StartupError::AlreadyRunning { name: "ebtrace".into(), pid: 42 };
        assert_eq!(err.to_string(), "ebtrace with process ID 42 is already running");
    }
}
