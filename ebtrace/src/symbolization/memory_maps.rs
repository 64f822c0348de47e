//! Memory mapping utilities for process address space analysis
//!
//! Parses `/proc/<pid>/maps` into [`MemoryMapping`]s. Executable,
//! file-backed mappings are where user-space instruction pointers land; each
//! one knows the file offset it was mapped from, which is what turns a
//! runtime address back into a position inside the binary.

use std::fs;
use std::io;
use std::path::Path;

use crate::domain::{Pid, ResolveError};

/// Address range of a mapping in a process's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    /// Check if an address falls within this memory range
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// One line of `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub range: MemoryRange,
    /// `rwxp`-style permission string
    pub perms: String,
    /// File offset the mapping starts at
    pub offset: u64,
    /// Device in `st_dev` encoding
    pub dev: u64,
    pub inode: u64,
    /// Path or pseudo-name (`[heap]`, `[vdso]`); `None` for anonymous memory
    pub path: Option<String>,
    /// The file was unlinked or replaced after being mapped
    pub deleted: bool,
}

impl MemoryMapping {
    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.perms.as_bytes().get(2) == Some(&b'x')
    }

    /// Backed by a real file (not anonymous memory or a `[pseudo]` region).
    #[must_use]
    pub fn is_file_backed(&self) -> bool {
        self.inode != 0 && self.path.as_deref().is_some_and(|p| p.starts_with('/'))
    }

    /// Runtime address at which file offset 0 would be mapped.
    #[must_use]
    pub fn load_base(&self) -> u64 {
        self.range.start.wrapping_sub(self.offset)
    }

    /// File offset of a runtime address inside this mapping.
    #[must_use]
    pub fn file_offset(&self, addr: u64) -> u64 {
        addr - self.range.start + self.offset
    }
}

/// Encode `major:minor` the way glibc's `makedev` does, to compare with `st_dev`.
#[must_use]
pub fn encode_dev(major: u64, minor: u64) -> u64 {
    ((major & 0xffff_f000) << 32)
        | ((major & 0x0000_0fff) << 8)
        | ((minor & 0xffff_ff00) << 12)
        | (minor & 0x0000_00ff)
}

fn take_field<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let trimmed = rest.trim_start();
    if trimmed.is_empty() {
        return None;
    }
    let end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
    let (field, tail) = trimmed.split_at(end);
    *rest = tail;
    Some(field)
}

/// Parse one maps line: `start-end perms offset dev inode [pathname]`.
///
/// # Errors
/// Returns [`ResolveError::MalformedMapsLine`] if a required field is missing
/// or not a number
pub fn parse_maps_line(line: &str) -> Result<MemoryMapping, ResolveError> {
    let malformed = || ResolveError::MalformedMapsLine(line.to_string());
    let hex = |s: &str| u64::from_str_radix(s, 16).map_err(|_| malformed());

    let mut rest = line;
    let range = take_field(&mut rest).ok_or_else(malformed)?;
    let perms = take_field(&mut rest).ok_or_else(malformed)?;
    let offset = take_field(&mut rest).ok_or_else(malformed)?;
    let dev = take_field(&mut rest).ok_or_else(malformed)?;
    let inode = take_field(&mut rest).ok_or_else(malformed)?;

    let (start, end) = range.split_once('-').ok_or_else(malformed)?;
    let (major, minor) = dev.split_once(':').ok_or_else(malformed)?;

    // The pathname may contain spaces; it is everything after the inode.
    let path = rest.trim();
    let (path, deleted) = match path.strip_suffix(" (deleted)") {
        Some(stripped) => (stripped, true),
        None => (path, false),
    };

    Ok(MemoryMapping {
        range: MemoryRange { start: hex(start)?, end: hex(end)? },
        perms: perms.to_string(),
        offset: hex(offset)?,
        dev: encode_dev(hex(major)?, hex(minor)?),
        inode: inode.parse().map_err(|_| malformed())?,
        path: (!path.is_empty()).then(|| path.to_string()),
        deleted,
    })
}

/// Parse a whole maps file, skipping lines that do not parse.
#[must_use]
pub fn parse_maps(content: &str) -> Vec<MemoryMapping> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match parse_maps_line(line) {
            Ok(mapping) => Some(mapping),
            Err(e) => {
                log::debug!("{e}");
                None
            }
        })
        .collect()
}

/// Read and parse `<proc_root>/<pid>/maps`.
///
/// # Errors
/// Returns [`ResolveError::ProcessGone`] if the process no longer exists
pub fn read_memory_maps(proc_root: &Path, pid: Pid) -> Result<Vec<MemoryMapping>, ResolveError> {
    let maps_path = proc_root.join(pid.0.to_string()).join("maps");
    match fs::read_to_string(&maps_path) {
        Ok(content) => Ok(parse_maps(&content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound || e.raw_os_error() == Some(libc::ESRCH) => {
            Err(ResolveError::ProcessGone(pid))
        }
        Err(e) => {
            Err(ResolveError::Io { path: maps_path.display().to_string(), reason: e.to_string() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c4a00000-55d0c4a2a000 r--p 00000000 fd:01 1311018                    /usr/bin/my app
55d0c4a2a000-55d0c4b10000 r-xp 0002a000 fd:01 1311018                    /usr/bin/my app
55d0c5d6e000-55d0c5d8f000 rw-p 00000000 00:00 0                          [heap]
7f1b2c000000-7f1b2c021000 rw-p 00000000 00:00 0
7f1b2d228000-7f1b2d3bd000 r-xp 00028000 fd:01 1316422                    /usr/lib/x86_64-linux-gnu/libc.so.6 (deleted)
7ffd7b5f2000-7ffd7b5f4000 r-xp 00000000 00:00 0                          [vdso]
";

    #[test]
    fn test_memory_range_contains() {
        let range = MemoryRange { start: 0x1000, end: 0x2000 };

        assert!(range.contains(0x1000));
        assert!(range.contains(0x1500));
        assert!(range.contains(0x1FFF));
        assert!(!range.contains(0x0FFF));
        assert!(!range.contains(0x2000));
        assert!(!range.contains(0x2001));
    }

    #[test]
    fn test_parse_maps() {
        let maps = parse_maps(MAPS);
        assert_eq!(maps.len(), 6);

        let text = &maps[1];
        assert_eq!(text.range, MemoryRange { start: 0x55d0_c4a2_a000, end: 0x55d0_c4b1_0000 });
        assert_eq!(text.offset, 0x2a000);
        assert_eq!(text.inode, 1_311_018);
        assert_eq!(text.dev, encode_dev(0xfd, 0x01));
        assert_eq!(text.path.as_deref(), Some("/usr/bin/my app"));
        assert!(text.is_executable());
        assert!(text.is_file_backed());
        assert_eq!(text.load_base(), 0x55d0_c4a0_0000);
        assert_eq!(text.file_offset(0x55d0_c4a2_a780), 0x2a780);

        assert!(!maps[2].is_file_backed());
        assert_eq!(maps[3].path, None);

        let libc = &maps[4];
        assert!(libc.deleted);
        assert_eq!(libc.path.as_deref(), Some("/usr/lib/x86_64-linux-gnu/libc.so.6"));

        assert!(maps[5].is_executable());
        assert!(!maps[5].is_file_backed());
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(parse_maps_line("garbage"), Err(ResolveError::MalformedMapsLine(_))));
        assert!(parse_maps_line("zzzz-1000 r-xp 0 fd:01 1 /bin/x").is_err());
        assert_eq!(parse_maps("bad line\n\n").len(), 0);
    }

    #[test]
    fn test_encode_dev_matches_libc() {
        assert_eq!(encode_dev(8, 1), libc::makedev(8, 1));
        assert_eq!(encode_dev(259, 65_536), libc::makedev(259, 65_536));
    }

    #[test]
    fn test_read_own_maps() {
        let maps = read_memory_maps(Path::new("/proc"), Pid::current()).unwrap();
        assert!(maps.iter().any(|m| m.is_executable() && m.is_file_backed()));
    }

    #[test]
    fn test_read_maps_of_missing_process() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(
            read_memory_maps(root.path(), Pid(12345)),
            Err(ResolveError::ProcessGone(Pid(12345)))
        );
    }
}
