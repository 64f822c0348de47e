//! # Probe Attachment
//!
//! Loads programs from a compiled eBPF object and attaches them to kernel
//! functions, tracepoints and user-space functions.
//!
//! ## Components
//!
//! - [`ProgramSpec`] / [`AttachPoint`] - what to attach where, parsed from the command line
//! - [`ProbeManager`] - owns every attachment and guarantees detach on shutdown
//! - [`EbpfBackend`] - the aya implementation of [`ProbeBackend`]
//!
//! Kernel failures are classified into [`AttachError`](crate::domain::AttachError)
//! variants so the caller can tell a missing attach target (skip it) from a
//! privilege problem (abort).

mod backend;
mod manager;
mod spec;
mod targets;

pub use backend::{EbpfBackend, EbpfLink, ProbeBackend};
pub use manager::{AttachSummary, ProbeHandle, ProbeId, ProbeManager, ProbeState, RetryPolicy};
pub use spec::{AttachPoint, ProgramKind, ProgramSpec, UprobeLocation};
pub use targets::{kernel_function_names, tracepoint_exists};
