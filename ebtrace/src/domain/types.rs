//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep pids, cpus and kernel timestamps from being
//! mixed up in the tracer's APIs.

use std::fmt;

/// Process ID
///
/// Kernel pids are recycled, so a `Pid` alone never identifies a process
/// instance. Pair it with a [`StartTime`] (see
/// [`ProcessIdentity`](crate::registry::ProcessIdentity)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub i32);

impl Pid {
    /// Pid of the calling process
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn current() -> Self {
        Pid(std::process::id() as i32)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

impl From<u32> for Pid {
    #[allow(clippy::cast_possible_wrap)]
    fn from(pid: u32) -> Self {
        Pid(pid as i32)
    }
}

/// CPU ID
///
/// Represents a logical CPU (0, 1, 2, ...). Each CPU owns one kernel event
/// buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuId(pub u32);

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CPU:{}", self.0)
    }
}

/// Process start time in clock ticks since boot
///
/// Field 22 of `/proc/<pid>/stat`. Together with the pid this is the
/// generation marker that distinguishes a live process from an earlier one
/// that owned the same pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StartTime(pub u64);

impl fmt::Display for StartTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ticks", self.0)
    }
}

/// Kernel timestamp in nanoseconds since boot (`bpf_ktime_get_ns`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Convert to seconds (f64)
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_seconds(self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s", self.as_seconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_display() {
        assert_eq!(Pid(1234).to_string(), "PID:1234");
    }

    #[test]
    fn test_cpu_display() {
        assert_eq!(CpuId(3).to_string(), "CPU:3");
    }

    #[test]
    fn test_pid_current_matches_std() {
        assert_eq!(u32::try_from(Pid::current().0).unwrap(), std::process::id());
    }

    #[test]
    fn test_timestamp_seconds() {
        assert!((Timestamp(1_500_000_000).as_seconds() - 1.5).abs() < f64::EPSILON);
    }
}
