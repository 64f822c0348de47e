//! Pre-flight checks for ebtrace
//!
//! Validates system requirements before attempting to load eBPF programs.
//! Provides clear, actionable error messages when requirements aren't met.

#![allow(unsafe_code)] // geteuid() and setrlimit() require unsafe

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use std::fs::File;
use std::path::Path;

/// Minimum kernel version for perf event arrays + kprobes as used here
const MIN_KERNEL_VERSION: (u32, u32) = (4, 14);

// Exit codes
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_NOPERM: i32 = 77;

/// Run all pre-flight checks before eBPF loading
///
/// # Errors
/// Returns an error naming the first unmet requirement
pub fn run_preflight_checks(object_path: &Path) -> Result<()> {
    check_privileges()?;
    check_kernel_version()?;
    check_object_readable(object_path)?;
    raise_memlock_limit();
    Ok(())
}

/// Check if running with sufficient privileges for eBPF
fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    // CAP_BPF + CAP_PERFMON would do on 5.8+, but probing capabilities
    // needs more than libc offers, so root is required.
    bail!(
        "Permission denied: ebtrace requires root privileges to load eBPF programs.\n\n\
         Run with: sudo ebtrace ..."
    );
}

/// Check if the kernel version is sufficient for eBPF features
fn check_kernel_version() -> Result<()> {
    let version_str = std::fs::read_to_string("/proc/version")
        .context("Failed to read kernel version from /proc/version")?;

    // "Linux version 5.15.0-generic ..." or "Linux version 6.1.0-arch1-1 ..."
    let release = version_str.split_whitespace().nth(2).unwrap_or("unknown");
    let Some(version) = parse_kernel_release(release) else {
        // Can't parse, assume it's fine
        debug!("Unrecognized kernel release {release}");
        return Ok(());
    };

    if version < MIN_KERNEL_VERSION {
        bail!(
            "Kernel version {}.{} is too old.\n\n\
             ebtrace requires Linux {}.{} or newer for perf event arrays and kprobes.\n\
             Current kernel: {}",
            version.0,
            version.1,
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
            release
        );
    }

    Ok(())
}

/// `(major, minor)` of a release string like `6.1.0-arch1-1`
fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor: String = parts.next()?.chars().take_while(char::is_ascii_digit).collect();
    Some((major, minor.parse().ok()?))
}

/// Check that the eBPF object exists and can be opened
fn check_object_readable(object_path: &Path) -> Result<()> {
    if !object_path.exists() {
        bail!(
            "eBPF object not found: {}\n\n\
             Make sure the path is correct and the object was built.",
            object_path.display()
        );
    }
    if !object_path.is_file() {
        bail!(
            "Not a file: {}\n\n\
             --object must point to a compiled eBPF object file, not a directory.",
            object_path.display()
        );
    }
    File::open(object_path)
        .with_context(|| format!("Cannot read eBPF object {}", object_path.display()))?;
    Ok(())
}

/// Lift `RLIMIT_MEMLOCK` so map allocation isn't capped on pre-5.11 kernels.
fn raise_memlock_limit() {
    let rlim = libc::rlimit { rlim_cur: libc::RLIM_INFINITY, rlim_max: libc::RLIM_INFINITY };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to remove limit on locked memory, ret is: {ret}");
    }
}

/// Map an application error to a process exit code.
#[must_use]
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else if msg.contains("missing required argument") || msg.contains("invalid probe spec") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}
