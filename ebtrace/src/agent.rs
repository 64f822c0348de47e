//! Agent runtime: startup checks, probe lifecycle and the poll loop.
//!
//! ```text
//! conflict check ─► preflight ─► load object ─► attach probes
//!                                                   │
//!        ┌──────────────────────────────────────────┘
//!        ▼
//! open per-CPU buffers ─► poll loop (blocking task) ─► report worker
//!        ▲                       │
//!        │     shutdown flag ◄── SIGINT / SIGTERM / --duration
//!        │                       ▼
//!        └──────────────── detach_all() ─► report
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ebtrace_common::{
    comm_str, EVENT_PROCESS_EXEC, EVENT_PROCESS_EXIT, EVENT_SOCKET_DATA, EVENT_STACK_SAMPLE,
};
use log::{debug, info, warn};
use tokio::signal::unix::{signal, SignalKind};

use crate::cli::Args;
use crate::consumer::{open_perf_rings, ConsumerConfig, ConsumerStats, EventConsumer, TypedEvent};
use crate::cpu::online_cpus;
use crate::domain::{ConsumerError, Pid, StartupError};
use crate::preflight::run_preflight_checks;
use crate::probes::{EbpfBackend, ProbeManager, ProgramSpec, RetryPolicy};
use crate::registry::{own_command_name, ProcessTable, Registry};
use crate::report::{spawn_report_worker, SampleSender, DEFAULT_SAMPLE_QUEUE};
use crate::symbolization::{Resolver, ResolverConfig};

/// Everything the agent needs, resolved from the command line.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub object: PathBuf,
    pub probes: Vec<ProgramSpec>,
    pub events_map: String,
    pub poll_timeout: Duration,
    pub per_cpu_pages: Option<usize>,
    pub duration: Option<Duration>,
    pub instance_check: Option<Duration>,
    pub allow_partial: bool,
    pub retry: RetryPolicy,
    pub top: usize,
    pub resolver: ResolverConfig,
    pub consumer: ConsumerConfig,
}

impl From<&Args> for AgentConfig {
    fn from(args: &Args) -> Self {
        Self {
            object: args.object.clone(),
            probes: args.probes.clone(),
            events_map: args.events_map.clone(),
            poll_timeout: args.poll_timeout(),
            per_cpu_pages: args.per_cpu_pages,
            duration: args.duration_limit(),
            instance_check: args.instance_check_interval(),
            allow_partial: args.allow_partial,
            retry: args.retry_policy(),
            top: args.top,
            resolver: args.resolver_config(),
            consumer: args.consumer_config(),
        }
    }
}

/// Another live instance of `own_name`, as a startup error.
///
/// # Errors
/// Returns an error if the process table cannot be listed
pub fn check_for_conflict<T: ProcessTable>(
    registry: &Registry<T>,
    own_name: &str,
    own_pid: Pid,
) -> Result<Option<StartupError>> {
    let conflict = registry
        .find_conflicting_instance(own_name, own_pid)
        .context("Failed to scan for a running instance")?;
    Ok(conflict.map(|other| StartupError::AlreadyRunning {
        name: other.command_name,
        pid: other.pid.0,
    }))
}

/// Route decoded events: stack samples to the report worker, the rest to the log.
fn register_handlers(consumer: &mut EventConsumer, samples: SampleSender) {
    consumer.register_handler(EVENT_STACK_SAMPLE, move |event| {
        if let Some(TypedEvent::StackSample(sample)) = TypedEvent::decode(event) {
            samples.offer(*sample);
        }
    });
    consumer.register_handler(EVENT_PROCESS_EXEC, |event| {
        if let Some(TypedEvent::ProcessExec(exec)) = TypedEvent::decode(event) {
            debug!("exec {} ({}) parent {}", comm_str(&exec.comm), exec.pid, exec.ppid);
        }
    });
    consumer.register_handler(EVENT_PROCESS_EXIT, |event| {
        if let Some(TypedEvent::ProcessExit(exit)) = TypedEvent::decode(event) {
            debug!("exit {} ({})", comm_str(&exit.comm), exit.pid);
        }
    });
    consumer.register_handler(EVENT_SOCKET_DATA, |event| {
        if let Some(TypedEvent::SocketData { header, data }) = TypedEvent::decode(event) {
            debug!("socket data pid {} fd {}: {} bytes", header.pid, header.fd, data.len());
        }
    });
}

/// Resolves when SIGINT, SIGTERM or the duration limit fires.
async fn shutdown_signal(duration: Option<Duration>) -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let limit = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("Failed to listen for Ctrl+C")?;
            Ok("interrupted")
        }
        _ = sigterm.recv() => Ok("terminated"),
        () = limit => Ok("duration limit reached"),
    }
}

/// Periodically re-run the conflict check; hits are only logged.
fn spawn_instance_watch(own_name: String, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let name = own_name.clone();
            let check = tokio::task::spawn_blocking(move || {
                check_for_conflict(&Registry::new(), &name, Pid::current())
            })
            .await;
            match check {
                Ok(Ok(Some(conflict))) => warn!("⚠️  {conflict}"),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => debug!("Instance check failed: {e:#}"),
                Err(e) => debug!("Instance check task failed: {e}"),
            }
        }
    })
}

/// Run the agent until a shutdown signal.
///
/// Returns normally (exit code 0) when another instance is already running.
///
/// # Errors
/// Returns an error if preflight, loading or attaching fails, or if the
/// event buffers cannot be opened
pub async fn run(config: AgentConfig) -> Result<()> {
    let own_name = own_command_name().context("Failed to read own command name")?;
    if let Some(conflict) = check_for_conflict(&Registry::new(), &own_name, Pid::current())? {
        warn!("{conflict}");
        println!("{conflict}");
        return Ok(());
    }

    run_preflight_checks(&config.object)?;

    // aya-log needs the runtime, so the object is loaded from async context
    let backend = EbpfBackend::load_file(&config.object)?;
    let mut manager = ProbeManager::new(backend).with_retry(config.retry);

    let summary = manager.attach_all(&config.probes);
    let failed = summary.failed.len();
    if summary.attached.is_empty() {
        return Err(StartupError::NoProbesAttached { failed }.into());
    }
    if let Some((spec, err)) = summary.failed.into_iter().next() {
        if !config.allow_partial {
            manager.detach_all();
            return Err(anyhow::Error::new(err).context(format!("Failed to attach {spec}")));
        }
        warn!("⚠️  Continuing with {} of {} probes", summary.attached.len(), config.probes.len());
    }
    info!("{} probes attached", manager.attached_count());

    let map = manager
        .backend_mut()
        .take_map(&config.events_map)
        .ok_or_else(|| ConsumerError::MapNotFound(config.events_map.clone()))?;
    let cpus = online_cpus()?;
    let rings = open_perf_rings(map, &cpus, config.per_cpu_pages)?;

    let stats = Arc::new(ConsumerStats::default());
    let mut consumer =
        EventConsumer::new(rings, config.consumer.clone()).with_stats(Arc::clone(&stats));
    let (samples, worker) =
        spawn_report_worker(Resolver::new(&config.resolver), DEFAULT_SAMPLE_QUEUE);
    register_handlers(&mut consumer, samples);
    info!("Polling {} CPU buffers", consumer.cpu_count());

    let watch = config.instance_check.map(|every| spawn_instance_watch(own_name, every));

    let shutdown = Arc::new(AtomicBool::new(false));
    let started = Instant::now();
    let poll_timeout = config.poll_timeout;
    let flag = Arc::clone(&shutdown);
    let mut poll_task = tokio::task::spawn_blocking(move || -> Result<(), ConsumerError> {
        while !flag.load(Ordering::Relaxed) {
            consumer.dispatch(poll_timeout)?;
        }
        // Dropping the consumer drops the handlers and with them the sample sender
        Ok(())
    });

    let (exit_reason, poll_result) = tokio::select! {
        reason = shutdown_signal(config.duration) => {
            shutdown.store(true, Ordering::Relaxed);
            (reason?, (&mut poll_task).await)
        }
        result = &mut poll_task => ("event polling stopped", result),
    };
    if let Some(watch) = watch {
        watch.abort();
    }

    manager.detach_all();
    drop(manager);

    poll_result.context("Poll task panicked")??;

    let report = tokio::task::spawn_blocking(move || worker.join())
        .await
        .context("Report worker task failed")?
        .map_err(|_| anyhow::anyhow!("Report worker panicked"))?;

    let snapshot = stats.snapshot();
    eprintln!("\n{exit_reason}: {:.1}s, {snapshot}", started.elapsed().as_secs_f64());
    report.log_summary(config.top, snapshot.dropped);
    print!("{}", report.render(config.top, snapshot.dropped));
    Ok(())
}
