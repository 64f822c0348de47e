//! # ebtrace - eBPF process and socket tracing agent
//!
//! ebtrace loads compiled eBPF programs, attaches them to kernel functions,
//! tracepoints and user-space probe points, drains the events they produce
//! from per-CPU buffers and turns sampled stack traces into symbol names.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     eBPF Programs (Kernel)                      │
//! │  • Kprobes / kretprobes: tcp_sendmsg, ...                       │
//! │  • Tracepoints: sched_process_exec, sched_process_exit          │
//! │  • Uprobes: SSL_write, ...                                      │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ per-CPU perf event buffers
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     ebtrace (This Crate)                        │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │    Probes    │   │   Consumer   │──▶│    Report    │         │
//! │  │ (lifecycle)  │   │ (poll/route) │   │  (folded)    │         │
//! │  └──────────────┘   └──────────────┘   └──────┬───────┘         │
//! │                                               │                 │
//! │  ┌──────────────┐                      ┌──────▼───────┐         │
//! │  │   Registry   │◀─────────────────────│ Symbolization│         │
//! │  │ (pid + start)│                      │ (ELF, cache) │         │
//! │  └──────────────┘                      └──────────────┘         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`registry`]: process identity (pid + start time) and the
//!   single-instance check
//! - [`probes`]: load / attach / detach with typed failures and guaranteed
//!   teardown
//! - [`consumer`]: per-CPU buffer polling, overrun accounting and dispatch
//!   by event type
//! - [`symbolization`]: address → symbol resolution with a process-wide
//!   symbol table cache
//! - [`report`]: folded-stack aggregation of stack samples
//! - [`agent`]: wires the above into the `ebtrace` binary
//! - [`preflight`], [`cpu`], [`cli`]: startup checks, CPU discovery and
//!   argument parsing
//! - [`domain`]: newtypes (Pid, CpuId, StartTime, Timestamp) and error enums
//!
//! ## Typical Usage
//!
//! ```bash
//! sudo ./ebtrace --object probes.o \
//!     --probe tracepoint:sched/sched_process_exec=trace_exec \
//!     --probe kprobe:tcp_sendmsg=trace_tcp_sendmsg \
//!     --duration 60
//! ```
//!
//! ## Key Concepts
//!
//! - **Process identity**: pids are recycled, so every pid is paired with
//!   its start time before anything is attributed to it
//! - **Overrun**: kernel buffers never wait for user space; lost records
//!   show up as a drop count and as gaps in per-CPU sequence numbers
//! - **Modification token**: size + mtime + ctime of a binary, part of the
//!   symbol cache key so a replaced binary is never resolved with stale
//!   symbols

pub mod agent;
pub mod cli;
pub mod consumer;
pub mod cpu;
pub mod domain;
pub mod preflight;
pub mod probes;
pub mod registry;
pub mod report;
pub mod symbolization;
