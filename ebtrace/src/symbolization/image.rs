//! Binary images mapped into a process and how to open them.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use super::memory_maps::{MemoryMapping, MemoryRange};
use super::symbol_table::SymbolTable;
use crate::domain::{Pid, ResolveError};

/// Device + inode of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub dev: u64,
    pub inode: u64,
}

/// Changes whenever the file's content may have changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModificationToken {
    pub size: u64,
    pub mtime_ns: i64,
    pub ctime_ns: i64,
}

impl ModificationToken {
    #[must_use]
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        let ns = |secs: i64, nsecs: i64| secs.saturating_mul(1_000_000_000).saturating_add(nsecs);
        Self {
            size: meta.size(),
            mtime_ns: ns(meta.mtime(), meta.mtime_nsec()),
            ctime_ns: ns(meta.ctime(), meta.ctime_nsec()),
        }
    }
}

/// Symbol cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageKey {
    pub identity: FileIdentity,
    pub token: ModificationToken,
}

/// A mapped path as seen from one filesystem root.
///
/// Two containers can map different files at the same path; their roots
/// (the identity of `/proc/<pid>/root`) tell them apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageLocation {
    pub root: FileIdentity,
    pub path: PathBuf,
}

/// An executable file mapping as found in a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryImage {
    /// Path as shown in the process's maps
    pub path: PathBuf,
    /// Identity of the process's root directory
    pub root: FileIdentity,
    /// The mapped file was unlinked or replaced since it was mapped
    pub deleted: bool,
    pub identity: FileIdentity,
    /// Runtime address of file offset 0
    pub load_base: u64,
    pub range: MemoryRange,
    pub token: ModificationToken,
    /// Where the file was actually opened (inside `/proc/<pid>/...`)
    pub source: PathBuf,
}

impl BinaryImage {
    #[must_use]
    pub fn key(&self) -> ImageKey {
        ImageKey { identity: self.identity, token: self.token }
    }

    /// Where the image currently lives; `None` once its path points elsewhere.
    #[must_use]
    pub fn location(&self) -> Option<ImageLocation> {
        (!self.deleted).then(|| ImageLocation { root: self.root, path: self.path.clone() })
    }
}

/// Locates and parses the binaries behind memory mappings.
pub trait ImageLoader: Send + Sync {
    /// Find the file behind `mapping` and read its identity and token.
    ///
    /// # Errors
    /// Returns [`ResolveError::SymbolTableUnavailable`] if the mapped file
    /// cannot be reached any more, or [`ResolveError::ProcessGone`]
    fn locate(&self, pid: Pid, mapping: &MemoryMapping) -> Result<BinaryImage, ResolveError>;

    /// Build the symbol table of a located image.
    ///
    /// # Errors
    /// Returns [`ResolveError::SymbolTableUnavailable`] for unreadable,
    /// non-ELF or stripped files
    fn load(&self, image: &BinaryImage) -> Result<SymbolTable, ResolveError>;
}

/// Opens binaries through `/proc/<pid>/root` so that files inside other
/// mount namespaces (containers) resolve.
///
/// When the file at the mapped path is no longer the mapped inode (the
/// binary was replaced or deleted) the kernel's `map_files` link to the
/// mapped file is used instead.
#[derive(Debug, Clone)]
pub struct ProcImageLoader {
    proc_root: PathBuf,
    line_info: bool,
}

impl ProcImageLoader {
    #[must_use]
    pub fn new(proc_root: impl Into<PathBuf>, line_info: bool) -> Self {
        Self { proc_root: proc_root.into(), line_info }
    }

    fn candidates(&self, pid: Pid, mapping: &MemoryMapping, path: &str) -> [PathBuf; 2] {
        let proc_dir = self.proc_root.join(pid.0.to_string());
        [
            proc_dir.join("root").join(path.trim_start_matches('/')),
            proc_dir
                .join("map_files")
                .join(format!("{:x}-{:x}", mapping.range.start, mapping.range.end)),
        ]
    }
}

impl ImageLoader for ProcImageLoader {
    fn locate(&self, pid: Pid, mapping: &MemoryMapping) -> Result<BinaryImage, ResolveError> {
        let path = mapping.path.as_deref().unwrap_or_default();
        let unavailable = |reason: String| ResolveError::SymbolTableUnavailable {
            path: path.to_string(),
            reason,
        };
        let proc_dir = self.proc_root.join(pid.0.to_string());
        if !proc_dir.exists() {
            return Err(ResolveError::ProcessGone(pid));
        }
        // Unreadable roots share one location namespace
        let root = fs::metadata(proc_dir.join("root"))
            .map_or(FileIdentity { dev: 0, inode: 0 }, |meta| FileIdentity {
                dev: meta.dev(),
                inode: meta.ino(),
            });

        for candidate in self.candidates(pid, mapping, path) {
            let Ok(meta) = fs::metadata(&candidate) else {
                continue;
            };
            // Device numbers differ across overlay mounts; the inode is what
            // tells a replaced binary apart.
            if meta.ino() != mapping.inode {
                continue;
            }
            return Ok(BinaryImage {
                path: PathBuf::from(path),
                root,
                deleted: mapping.deleted,
                identity: FileIdentity { dev: mapping.dev, inode: mapping.inode },
                load_base: mapping.load_base(),
                range: mapping.range,
                token: ModificationToken::from_metadata(&meta),
                source: candidate,
            });
        }
        Err(unavailable("mapped file is no longer reachable".to_string()))
    }

    fn load(&self, image: &BinaryImage) -> Result<SymbolTable, ResolveError> {
        let unavailable = |reason: String| ResolveError::SymbolTableUnavailable {
            path: image.path.display().to_string(),
            reason,
        };
        let data = fs::read(&image.source).map_err(|e| unavailable(e.to_string()))?;
        SymbolTable::from_elf(&data, self.line_info).map_err(unavailable)
    }
}
