//! Single-instance check, end to end.
//!
//! Run without a conflicting instance, the binary starts a copy of itself,
//! waits until its own registry sees that copy, and expects the copy to
//! report the parent as already running. Run as that copy, it finds the
//! parent and prints the report.

use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use log::info;

use ebtrace::agent::check_for_conflict;
use ebtrace::consumer::ConsumerStats;
use ebtrace::domain::Pid;
use ebtrace::registry::{own_command_name, Registry};
use ebtrace::symbolization::SymbolCache;

const ALREADY_RUNNING: &str = "is already running";

/// Makes the copy stay alive until its stdin closes.
const HOLD_FLAG: &str = "--hold";

const CHILD_VISIBLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Verify that the child's output reports `parent` as the running instance.
fn check_child_output(stdout: &str, parent: Pid) -> Result<()> {
    let expected = format!("process ID {} {ALREADY_RUNNING}", parent.0);
    if !stdout.contains(&expected) {
        bail!("child output does not report {parent} as running: {stdout:?}");
    }
    Ok(())
}

/// Poll the registry until it reports `child` as a running instance.
fn wait_until_registered(registry: &Registry, own_name: &str, own_pid: Pid, child: Pid) -> Result<()> {
    let deadline = Instant::now() + CHILD_VISIBLE_TIMEOUT;
    loop {
        if let Some(found) = registry.find_conflicting_instance(own_name, own_pid)? {
            if found.pid == child {
                info!("registry sees child {child}");
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            bail!("registry never reported child {child} as running");
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn stop(mut child: Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn run(hold: bool) -> Result<()> {
    // Same shared state the agent sets up before its own check
    let cache = Arc::new(SymbolCache::new(1 << 20));
    let stats = Arc::new(ConsumerStats::default());
    info!("cache entries: {}, consumer: {}", cache.stats().entries, stats.snapshot());

    let own_name = own_command_name().context("Failed to read own command name")?;
    let own_pid = Pid::current();
    let registry = Registry::new();
    if let Some(conflict) = check_for_conflict(&registry, &own_name, own_pid)? {
        println!("{conflict}");
        if hold {
            std::io::stdout().flush()?;
            let _ = std::io::stdin().read_to_end(&mut Vec::new());
        }
        return Ok(());
    }

    let exe = std::env::current_exe().context("Failed to locate own executable")?;
    let mut child = Command::new(&exe)
        .arg(HOLD_FLAG)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to run {}", exe.display()))?;
    let child_pid = Pid::from(child.id());

    if let Err(e) = wait_until_registered(&registry, &own_name, own_pid, child_pid) {
        stop(child);
        return Err(e);
    }
    // Closing stdin releases the held child.
    drop(child.stdin.take());
    let output = child.wait_with_output().context("Failed to collect child output")?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        bail!("child exited with {}: {}", output.status, String::from_utf8_lossy(&output.stderr));
    }
    check_child_output(&stdout, own_pid)?;

    println!("ok: child reported {own_pid} as running");
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let hold = std::env::args().any(|arg| arg == HOLD_FLAG);
    if let Err(e) = run(hold) {
        eprintln!("error: {e:#}");
        std::process::exit(-1);
    }
}
