//! Existence checks for attach targets.
//!
//! The kernel reports a missing kprobe function or tracepoint with errno
//! values that overlap other failures, so targets are looked up before the
//! attach call and a missing one is reported as such.

use std::collections::HashSet;
use std::io;
use std::path::Path;

use crate::symbolization::KernelSymbols;

const TRACEFS_MOUNT_POINTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

/// Whether `category/name` is listed under any mounted tracefs.
///
/// Returns `None` when no tracefs is mounted at all, in which case the
/// attach call itself has to decide.
#[must_use]
pub fn tracepoint_exists(category: &str, name: &str) -> Option<bool> {
    let mounted: Vec<&Path> = TRACEFS_MOUNT_POINTS
        .iter()
        .map(Path::new)
        .filter(|base| base.join("events").is_dir())
        .collect();
    if mounted.is_empty() {
        return None;
    }
    Some(mounted.iter().any(|base| base.join("events").join(category).join(name).exists()))
}

/// Names of text symbols listed in a kallsyms file.
///
/// Module symbols (`name\t[module]`) are included by name only.
///
/// # Errors
/// Returns an error if the file cannot be read
pub fn kernel_function_names(path: &Path) -> io::Result<HashSet<String>> {
    Ok(KernelSymbols::load_from(path)?.names().map(str::to_string).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_kernel_function_names() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0000000000000000 T tcp_sendmsg").unwrap();
        writeln!(file, "0000000000000000 t do_one_initcall").unwrap();
        writeln!(file, "0000000000000000 D jiffies").unwrap();
        writeln!(file, "0000000000000000 t ext4_readdir\t[ext4]").unwrap();
        writeln!(file, "garbage").unwrap();

        let names = kernel_function_names(file.path()).unwrap();
        assert!(names.contains("tcp_sendmsg"));
        assert!(names.contains("do_one_initcall"));
        assert!(names.contains("ext4_readdir"));
        assert!(!names.contains("jiffies"));
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn test_kernel_function_names_missing_file() {
        assert!(kernel_function_names(Path::new("/nonexistent/kallsyms")).is_err());
    }

    #[test]
    fn test_bogus_tracepoint_never_reported_present() {
        assert_ne!(tracepoint_exists("no_such_category", "no_such_event"), Some(true));
    }
}
