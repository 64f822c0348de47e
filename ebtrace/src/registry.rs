//! Process identity registry: detect another running instance of the tracer.
//!
//! Two tracers attached to the same probe points corrupt each other's
//! kernel-side state, so the agent refuses to start when the process table
//! already holds a live process with its command name.
//!
//! The table is an external, point-in-time snapshot. Processes may exit
//! between being listed and being inspected; such entries are simply not
//! matches.
//!
//! Matching is by command name only. Two unrelated programs that share a
//! name are reported as conflicting, which mirrors the long-standing
//! behaviour operators rely on.

use std::fs;
use std::path::{Path, PathBuf};

use ebtrace_common::TASK_COMM_LEN;
use log::debug;

use crate::domain::{Pid, RegistryError, StartTime};

/// Longest command name the kernel stores (`comm` minus the NUL byte).
pub const COMM_MAX_LEN: usize = TASK_COMM_LEN - 1;

/// One running process instance.
///
/// `pid` alone is ambiguous because pids are recycled; `start_time` is the
/// generation marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessIdentity {
    pub pid: Pid,
    pub command_name: String,
    pub start_time: StartTime,
}

impl ProcessIdentity {
    /// True if both identities describe the same process instance.
    #[must_use]
    pub fn is_same_instance(&self, other: &ProcessIdentity) -> bool {
        self.pid == other.pid && self.start_time == other.start_time
    }
}

/// A process-table entry as read at inspection time.
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    pub identity: ProcessIdentity,
    /// Scheduler state letter from `/proc/<pid>/stat` (R, S, D, Z, X, ...)
    pub state: char,
}

impl ProcessEntry {
    /// Zombies and dead tasks still occupy a pid but are no longer running.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        matches!(self.state, 'Z' | 'X' | 'x')
    }
}

/// Source of process-table snapshots.
pub trait ProcessTable {
    /// List the pids currently present.
    ///
    /// # Errors
    /// Returns an error if the table itself cannot be listed.
    fn pids(&self) -> Result<Vec<Pid>, RegistryError>;

    /// Read one entry. `None` means the process is gone or unreadable.
    fn inspect(&self, pid: Pid) -> Option<ProcessEntry>;
}

/// Process table backed by procfs.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl ProcFs {
    #[must_use]
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Use an alternative procfs mount (e.g. a host `/proc` bind-mounted
    /// into a container).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for ProcFs {
    fn pids(&self) -> Result<Vec<Pid>, RegistryError> {
        let entries = fs::read_dir(&self.root).map_err(|source| {
            RegistryError::TableUnavailable { path: self.root.display().to_string(), source }
        })?;

        Ok(entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
            .map(Pid)
            .collect())
    }

    fn inspect(&self, pid: Pid) -> Option<ProcessEntry> {
        let stat_path = self.root.join(pid.0.to_string()).join("stat");
        // ENOENT / ESRCH here just means the process exited after listing
        let content = fs::read_to_string(stat_path).ok()?;
        parse_stat(pid, &content)
    }
}

/// Parse `/proc/<pid>/stat`.
///
/// Format: `pid (comm) state ppid ... starttime ...`. The command name may
/// itself contain spaces and parentheses, so it is delimited by the first
/// `(` and the last `)`.
#[must_use]
pub fn parse_stat(pid: Pid, stat_line: &str) -> Option<ProcessEntry> {
    let open = stat_line.find('(')?;
    let close = stat_line.rfind(')')?;
    if open >= close {
        return None;
    }
    let command_name = stat_line[open + 1..close].to_string();

    // Fields after the comm start at field 3 (state); starttime is field 22
    let rest: Vec<&str> = stat_line[close + 1..].split_whitespace().collect();
    let state = rest.first()?.chars().next()?;
    let start_time = rest.get(22 - 3)?.parse::<u64>().ok()?;

    Some(ProcessEntry {
        identity: ProcessIdentity { pid, command_name, start_time: StartTime(start_time) },
        state,
    })
}

/// Truncate a name the way the kernel truncates `comm`.
#[must_use]
pub fn comm_name(name: &str) -> &str {
    if name.len() <= COMM_MAX_LEN {
        return name;
    }
    let mut end = COMM_MAX_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Command name of the calling process, as other processes see it.
///
/// # Errors
/// Returns an error if neither `/proc/self/comm` nor the executable path
/// can be read.
pub fn own_command_name() -> std::io::Result<String> {
    if let Ok(comm) = fs::read_to_string("/proc/self/comm") {
        return Ok(comm.trim_end_matches('\n').to_string());
    }
    let exe = std::env::current_exe()?;
    let name = exe.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    Ok(comm_name(name).to_string())
}

/// Registry over a process table.
pub struct Registry<T = ProcFs> {
    table: T,
}

impl Registry<ProcFs> {
    #[must_use]
    pub fn new() -> Self {
        Self { table: ProcFs::new() }
    }
}

impl Default for Registry<ProcFs> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ProcessTable> Registry<T> {
    pub fn with_table(table: T) -> Self {
        Self { table }
    }

    /// Find another live process running under `expected_name`.
    ///
    /// Skips `own_pid`, processes that vanish mid-scan, and terminated
    /// (zombie/dead) entries. Returns the first match in table order.
    ///
    /// # Errors
    /// Returns an error only if the process table cannot be listed at all.
    pub fn find_conflicting_instance(
        &self,
        expected_name: &str,
        own_pid: Pid,
    ) -> Result<Option<ProcessIdentity>, RegistryError> {
        let wanted = comm_name(expected_name);

        for pid in self.table.pids()? {
            if pid == own_pid {
                continue;
            }
            let Some(entry) = self.table.inspect(pid) else {
                continue;
            };
            if entry.identity.command_name != wanted {
                continue;
            }
            if entry.is_terminated() {
                debug!("Ignoring terminated {} ({}) in state {}", wanted, pid, entry.state);
                continue;
            }
            return Ok(Some(entry.identity));
        }

        Ok(None)
    }

    /// Current identity of `pid`, if it is alive.
    #[must_use]
    pub fn lookup(&self, pid: Pid) -> Option<ProcessIdentity> {
        self.table.inspect(pid).filter(|entry| !entry.is_terminated()).map(|entry| entry.identity)
    }

    /// True if `identity` still names a live process (same pid, same start time).
    #[must_use]
    pub fn is_same_instance(&self, identity: &ProcessIdentity) -> bool {
        self.lookup(identity.pid).is_some_and(|current| current.is_same_instance(identity))
    }
}

/// Check the host process table for another instance of `expected_name`.
///
/// # Errors
/// Returns an error if `/proc` cannot be listed.
pub fn find_conflicting_instance(
    expected_name: &str,
    own_pid: Pid,
) -> Result<Option<ProcessIdentity>, RegistryError> {
    Registry::new().find_conflicting_instance(expected_name, own_pid)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashSet};

    /// In-memory process table. Pids in `vanished` are listed but exit
    /// before they can be inspected.
    #[derive(Default)]
    pub(crate) struct StaticTable {
        pub entries: BTreeMap<i32, ProcessEntry>,
        pub vanished: HashSet<i32>,
    }

    impl StaticTable {
        pub(crate) fn with(mut self, pid: i32, name: &str, start: u64, state: char) -> Self {
            self.entries.insert(
                pid,
                ProcessEntry {
                    identity: ProcessIdentity {
                        pid: Pid(pid),
                        command_name: name.to_string(),
                        start_time: StartTime(start),
                    },
                    state,
                },
            );
            self
        }
    }

    impl ProcessTable for StaticTable {
        fn pids(&self) -> Result<Vec<Pid>, RegistryError> {
            Ok(self.entries.keys().copied().map(Pid).collect())
        }

        fn inspect(&self, pid: Pid) -> Option<ProcessEntry> {
            if self.vanished.contains(&pid.0) {
                return None;
            }
            self.entries.get(&pid.0).cloned()
        }
    }

    #[test]
    fn test_parse_stat() {
        let stat = "1234 (my-app) S 1 1234 1234 0 -1 4194304 120 0 0 0 3 1 0 0 20 0 1 0 98765 1000";
        let entry = parse_stat(Pid(1234), stat).unwrap();
        assert_eq!(entry.identity.command_name, "my-app");
        assert_eq!(entry.state, 'S');
        assert_eq!(entry.identity.start_time, StartTime(98765));
    }

    #[test]
    fn test_parse_stat_with_parens() {
        // Command names can contain parentheses and spaces
        let stat =
            "77 (app (v2) x) Z 1 77 77 0 -1 4194304 120 0 0 0 3 1 0 0 20 0 1 0 555 1000 0";
        let entry = parse_stat(Pid(77), stat).unwrap();
        assert_eq!(entry.identity.command_name, "app (v2) x");
        assert!(entry.is_terminated());
        assert_eq!(entry.identity.start_time, StartTime(555));
    }

    #[test]
    fn test_parse_stat_truncated() {
        assert!(parse_stat(Pid(1), "1 (init) S 0").is_none());
        assert!(parse_stat(Pid(1), "garbage").is_none());
    }

    #[test]
    fn test_finds_other_instance() {
        let registry = Registry::with_table(
            StaticTable::default().with(1, "init", 1, 'S').with(500, "ebtrace", 4000, 'S'),
        );

        let found = registry.find_conflicting_instance("ebtrace", Pid(900)).unwrap().unwrap();
        assert_eq!(found.pid, Pid(500));
        assert_eq!(found.start_time, StartTime(4000));
    }

    #[test]
    fn test_own_pid_is_not_a_conflict() {
        let registry = Registry::with_table(StaticTable::default().with(500, "ebtrace", 4000, 'R'));
        assert!(registry.find_conflicting_instance("ebtrace", Pid(500)).unwrap().is_none());
    }

    #[test]
    fn test_vanished_process_is_not_a_conflict() {
        let mut table = StaticTable::default().with(500, "ebtrace", 4000, 'S');
        table.vanished.insert(500);
        let registry = Registry::with_table(table);
        assert!(registry.find_conflicting_instance("ebtrace", Pid(900)).unwrap().is_none());
    }

    #[test]
    fn test_zombie_is_not_a_conflict() {
        let registry = Registry::with_table(
            StaticTable::default().with(500, "ebtrace", 4000, 'Z').with(501, "ebtrace", 4001, 'X'),
        );
        assert!(registry.find_conflicting_instance("ebtrace", Pid(900)).unwrap().is_none());
    }

    #[test]
    fn test_name_is_compared_as_kernel_comm() {
        // The kernel keeps only 15 bytes of the name
        let registry = Registry::with_table(StaticTable::default().with(
            10,
            "very-long-trace",
            1,
            'S',
        ));
        let found = registry.find_conflicting_instance("very-long-tracer-agent", Pid(1)).unwrap();
        assert_eq!(found.map(|p| p.pid), Some(Pid(10)));

        // Prefixes shorter than 15 bytes must match exactly
        assert!(registry.find_conflicting_instance("very-long", Pid(1)).unwrap().is_none());
    }

    #[test]
    fn test_recycled_pid_is_not_same_instance() {
        let registry = Registry::with_table(StaticTable::default().with(42, "worker", 2000, 'S'));
        let stale = ProcessIdentity {
            pid: Pid(42),
            command_name: "worker".to_string(),
            start_time: StartTime(1000),
        };
        assert!(!registry.is_same_instance(&stale));

        let current = registry.lookup(Pid(42)).unwrap();
        assert!(registry.is_same_instance(&current));
    }

    #[test]
    fn test_comm_name_respects_char_boundaries() {
        assert_eq!(comm_name("short"), "short");
        assert_eq!(comm_name("abcdefghijklmnopqrst"), "abcdefghijklmno");
        // 14 ASCII bytes + a 2-byte char would straddle byte 15
        assert_eq!(comm_name("abcdefghijklmné"), "abcdefghijklmn");
    }

    #[test]
    fn test_procfs_sees_current_process() {
        let registry = Registry::new();
        let me = registry.lookup(Pid::current()).expect("own process must be visible");
        assert_eq!(me.pid, Pid::current());
        assert!(registry.is_same_instance(&me));
        assert_eq!(me.command_name, own_command_name().unwrap());
    }

    #[test]
    fn test_procfs_missing_root() {
        let table = ProcFs::with_root("/nonexistent/proc");
        assert!(table.pids().is_err());
        assert!(table.inspect(Pid(1)).is_none());
    }
}
