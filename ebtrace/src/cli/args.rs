//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::consumer::ConsumerConfig;
use crate::probes::{ProgramSpec, RetryPolicy};
use crate::symbolization::ResolverConfig;

#[derive(Parser, Debug)]
#[command(
    name = "ebtrace",
    about = "Attach eBPF probes, drain their events and symbolize sampled stacks",
    after_help = "\
PROBE SPECS:
    kprobe:tcp_sendmsg=trace_tcp_sendmsg
    kretprobe:tcp_recvmsg=trace_tcp_recvmsg_ret
    tracepoint:sched/sched_process_exec=trace_exec
    uprobe:/usr/lib/libssl.so.3:SSL_write@1234=trace_ssl_write

EXAMPLES:
    sudo ebtrace --object probes.o --probe tracepoint:sched/sched_process_exec=trace_exec
    sudo ebtrace --object probes.o --probe kprobe:tcp_sendmsg=trace_send --duration 30"
)]
pub struct Args {
    /// Compiled eBPF object file
    #[arg(long, value_name = "PATH")]
    pub object: PathBuf,

    /// Probe to attach as `<kind>:<target>=<program>` (repeatable)
    #[arg(long = "probe", value_name = "SPEC", required = true)]
    pub probes: Vec<ProgramSpec>,

    /// Name of the perf event array map the programs write to
    #[arg(long, default_value = "EVENTS")]
    pub events_map: String,

    /// Upper bound for one poll of the event buffers
    #[arg(long, default_value = "100")]
    pub poll_timeout_ms: u64,

    /// Pages per CPU buffer (power of two, kernel default if omitted)
    #[arg(long)]
    pub per_cpu_pages: Option<usize>,

    /// Symbol cache budget in MiB
    #[arg(long, default_value = "256")]
    pub symbol_cache_mb: usize,

    /// Resolve `file:line` from DWARF line tables
    #[arg(long)]
    pub line_info: bool,

    /// Stop after N seconds (0 = unlimited)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Re-check for a conflicting instance every N seconds (0 = only at startup)
    #[arg(long, default_value = "0")]
    pub instance_check_secs: u64,

    /// Keep running when some probes fail, as long as one attached
    #[arg(long)]
    pub allow_partial: bool,

    /// Retry an attach once after kernel resource exhaustion
    #[arg(long)]
    pub retry_exhausted: bool,

    /// Number of stacks in the final report
    #[arg(long, default_value = "20")]
    pub top: usize,

    /// Verbose output (info-level logging)
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    #[must_use]
    pub fn duration_limit(&self) -> Option<Duration> {
        (self.duration > 0).then(|| Duration::from_secs(self.duration))
    }

    #[must_use]
    pub fn instance_check_interval(&self) -> Option<Duration> {
        (self.instance_check_secs > 0).then(|| Duration::from_secs(self.instance_check_secs))
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy { retry_exhausted: self.retry_exhausted, ..RetryPolicy::default() }
    }

    #[must_use]
    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            cache_bytes: self.symbol_cache_mb.saturating_mul(1 << 20),
            line_info: self.line_info,
            ..ResolverConfig::default()
        }
    }

    #[must_use]
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig::default()
    }
}
