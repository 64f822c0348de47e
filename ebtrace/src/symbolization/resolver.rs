//! Address → symbol resolution for a process.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use log::{debug, warn};

use super::cache::{SymbolCache, TableResult};
use super::image::{BinaryImage, FileIdentity, ImageLoader, ProcImageLoader};
use super::kallsyms::{is_kernel_address, KernelSymbols};
use super::memory_maps::{read_memory_maps, MemoryMapping};
use super::symbol_table::{InlinedFrame, SourceLocation};
use crate::domain::{Pid, ResolveError};
use crate::registry::{ProcessIdentity, ProcessTable, Registry};

/// Name used for anything that could not be resolved.
pub const UNKNOWN_SYMBOL: &str = "unknown";

/// Source of process memory maps.
pub trait MapsSource: Send + Sync {
    /// # Errors
    /// Returns [`ResolveError::ProcessGone`] if the process has exited
    fn memory_maps(&self, pid: Pid) -> Result<Vec<MemoryMapping>, ResolveError>;
}

/// Reads `/proc/<pid>/maps`.
#[derive(Debug, Clone)]
pub struct ProcMaps {
    root: PathBuf,
}

impl ProcMaps {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for ProcMaps {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl MapsSource for ProcMaps {
    fn memory_maps(&self, pid: Pid) -> Result<Vec<MemoryMapping>, ResolveError> {
        read_memory_maps(&self.root, pid)
    }
}

/// Image a frame was found in. Does not keep the symbol table alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub path: PathBuf,
    pub identity: FileIdentity,
}

/// One resolved address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFrame {
    pub address: u64,
    pub image: Option<ImageRef>,
    /// `None` when unresolved
    pub symbol: Option<String>,
    pub offset: u64,
    pub location: Option<SourceLocation>,
    /// Functions inlined at this address, innermost first (needs line info)
    pub inlined: Vec<InlinedFrame>,
}

impl ResolvedFrame {
    #[must_use]
    pub fn unknown(address: u64) -> Self {
        Self { address, image: None, symbol: None, offset: 0, location: None, inlined: Vec::new() }
    }

    /// Symbol name, or `"unknown"`
    #[must_use]
    pub fn name(&self) -> &str {
        self.symbol.as_deref().unwrap_or(UNKNOWN_SYMBOL)
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.symbol.is_some()
    }

    /// Format the frame for display, inlined functions first
    #[must_use]
    pub fn format(&self, frame_num: usize) -> String {
        let mut output = String::new();
        for (idx, inlined) in self.inlined.iter().enumerate() {
            let prefix = if idx == 0 { format!("#{frame_num:<2}") } else { "   ".to_string() };
            output.push_str(&format!("{prefix} 0x{:016x} {} (inlined)", self.address, inlined.function));
            push_location(&mut output, inlined.location.as_ref());
            output.push('\n');
        }
        let prefix = if self.inlined.is_empty() { format!("#{frame_num:<2}") } else { "   ".to_string() };
        output.push_str(&format!("{prefix} 0x{:016x} {self}", self.address));
        push_location(&mut output, self.location.as_ref());
        output
    }
}

fn push_location(output: &mut String, location: Option<&SourceLocation>) {
    if let Some(loc) = location {
        output.push_str(&format!("\n                      at {}:{}", loc.file, loc.line));
        if let Some(col) = loc.column {
            output.push_str(&format!(":{col}"));
        }
    }
}

impl fmt::Display for ResolvedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.symbol {
            Some(name) if self.offset == 0 => write!(f, "{name}")?,
            Some(name) => write!(f, "{name}+{:#x}", self.offset)?,
            None => write!(f, "{UNKNOWN_SYMBOL}")?,
        }
        if let Some(image) = &self.image {
            write!(f, " ({})", image.path.display())?;
        }
        Ok(())
    }
}

/// Resolver tuning.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Symbol cache budget in bytes
    pub cache_bytes: usize,
    /// Decode DWARF line tables for `file:line`
    pub line_info: bool,
    /// Resolve kernel addresses through `/proc/kallsyms`
    pub kernel_symbols: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self { cache_bytes: 256 << 20, line_info: false, kernel_symbols: true }
    }
}

/// Turns raw instruction pointers of a process into symbol names.
///
/// Process-gone and unreadable-binary conditions never fail a call; the
/// affected addresses come back as unknown frames.
pub struct Resolver<M = ProcMaps, L = ProcImageLoader> {
    maps: M,
    loader: L,
    cache: Arc<SymbolCache>,
    kernel_enabled: bool,
    kernel: OnceLock<Option<KernelSymbols>>,
}

impl Resolver {
    /// Resolver over the live `/proc`.
    #[must_use]
    pub fn new(config: &ResolverConfig) -> Self {
        Self::with_sources(
            ProcMaps::default(),
            ProcImageLoader::new("/proc", config.line_info),
            Arc::new(SymbolCache::new(config.cache_bytes)),
        )
        .with_kernel_symbols(config.kernel_symbols)
    }
}

impl<M: MapsSource, L: ImageLoader> Resolver<M, L> {
    pub fn with_sources(maps: M, loader: L, cache: Arc<SymbolCache>) -> Self {
        Self { maps, loader, cache, kernel_enabled: false, kernel: OnceLock::new() }
    }

    #[must_use]
    pub fn with_kernel_symbols(mut self, enabled: bool) -> Self {
        self.kernel_enabled = enabled;
        self
    }

    /// Use a preloaded kernel symbol table.
    #[must_use]
    pub fn with_kernel_table(self, symbols: KernelSymbols) -> Self {
        let kernel = OnceLock::new();
        let _ = kernel.set(Some(symbols));
        Self { kernel, kernel_enabled: true, ..self }
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<SymbolCache> {
        &self.cache
    }

    /// Resolve `addrs` of `pid`, one frame per address, in input order.
    #[must_use]
    pub fn resolve(&self, pid: Pid, addrs: &[u64]) -> Vec<ResolvedFrame> {
        if addrs.is_empty() {
            return Vec::new();
        }

        let needs_maps = addrs.iter().any(|&addr| !is_kernel_address(addr));
        let mappings = if needs_maps {
            match self.maps.memory_maps(pid) {
                Ok(mappings) => mappings,
                Err(ResolveError::ProcessGone(_)) => {
                    debug!("{pid} exited before its stack could be resolved");
                    return addrs.iter().map(|&addr| ResolvedFrame::unknown(addr)).collect();
                }
                Err(e) => {
                    warn!("⚠️  {e}");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let mut images: HashMap<usize, Option<(BinaryImage, TableResult)>> = HashMap::new();
        addrs
            .iter()
            .map(|&addr| {
                if is_kernel_address(addr) {
                    return self.resolve_kernel(addr);
                }
                let Some(idx) = mappings
                    .iter()
                    .position(|m| m.range.contains(addr) && m.is_executable() && m.is_file_backed())
                else {
                    return ResolvedFrame::unknown(addr);
                };
                let entry = images.entry(idx).or_insert_with(|| self.open_image(pid, &mappings[idx]));
                match entry {
                    Some((image, Ok(table))) => {
                        let file_offset = addr.wrapping_sub(image.load_base);
                        let image_ref =
                            ImageRef { path: image.path.clone(), identity: image.identity };
                        let Some(vaddr) = table.file_offset_to_vaddr(file_offset) else {
                            return ResolvedFrame { image: Some(image_ref), ..ResolvedFrame::unknown(addr) };
                        };
                        match table.lookup(vaddr) {
                            Some((symbol, offset)) => {
                                let mut inlined = table.source_frames(vaddr);
                                let location = inlined.pop().and_then(|outer| outer.location);
                                ResolvedFrame {
                                    address: addr,
                                    image: Some(image_ref),
                                    symbol: Some(symbol.name.clone()),
                                    offset,
                                    location,
                                    inlined,
                                }
                            }
                            None => ResolvedFrame { image: Some(image_ref), ..ResolvedFrame::unknown(addr) },
                        }
                    }
                    Some((image, Err(_))) => ResolvedFrame {
                        image: Some(ImageRef { path: image.path.clone(), identity: image.identity }),
                        ..ResolvedFrame::unknown(addr)
                    },
                    None => ResolvedFrame::unknown(addr),
                }
            })
            .collect()
    }

    /// Like [`resolve`](Self::resolve), but only for the exact process
    /// instance `identity` names.
    ///
    /// If the pid now belongs to a different process (before or after the
    /// maps are read) every frame is unknown.
    #[must_use]
    pub fn resolve_for<T: ProcessTable>(
        &self,
        registry: &Registry<T>,
        identity: &ProcessIdentity,
        addrs: &[u64],
    ) -> Vec<ResolvedFrame> {
        let unknown = || addrs.iter().map(|&addr| ResolvedFrame::unknown(addr)).collect();
        if addrs.is_empty() {
            return Vec::new();
        }
        if !registry.is_same_instance(identity) {
            return unknown();
        }
        let frames = self.resolve(identity.pid, addrs);
        if !registry.is_same_instance(identity) {
            debug!("{} was recycled while resolving", identity.pid);
            return unknown();
        }
        frames
    }

    fn open_image(&self, pid: Pid, mapping: &MemoryMapping) -> Option<(BinaryImage, TableResult)> {
        let image = match self.loader.locate(pid, mapping) {
            Ok(image) => image,
            Err(e) => {
                debug!("{e}");
                return None;
            }
        };
        let table = self.cache.get_or_build(image.location().as_ref(), image.key(), || {
            self.loader.load(&image).map(Arc::new).inspect_err(|e| debug!("{e}"))
        });
        Some((image, table))
    }

    fn resolve_kernel(&self, addr: u64) -> ResolvedFrame {
        if !self.kernel_enabled {
            return ResolvedFrame::unknown(addr);
        }
        let kernel = self.kernel.get_or_init(|| match KernelSymbols::load() {
            Ok(symbols) if !symbols.is_restricted() => Some(symbols),
            Ok(_) => {
                warn!("⚠️  Kernel addresses are hidden (kptr_restrict); kernel frames stay unknown");
                None
            }
            Err(e) => {
                warn!("⚠️  Cannot read kernel symbols: {e}");
                None
            }
        });
        match kernel.as_ref().and_then(|k| k.lookup(addr)) {
            Some((name, offset)) => ResolvedFrame {
                address: addr,
                image: None,
                symbol: Some(name.to_string()),
                offset,
                location: None,
                inlined: Vec::new(),
            },
            None => ResolvedFrame::unknown(addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::StaticTable;
    use crate::symbolization::image::ModificationToken;
    use crate::symbolization::memory_maps::parse_maps_line;
    use crate::symbolization::symbol_table::{LoadSegment, Symbol, SymbolTable};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    const APP_TEXT: &str =
        "55d0c4a2a000-55d0c4b10000 r-xp 0002a000 fd:01 1311018                    /usr/bin/app";
    const APP_BASE: u64 = 0x55d0_c4a0_0000;

    struct FakeMaps {
        maps: HashMap<i32, Vec<MemoryMapping>>,
    }

    impl MapsSource for FakeMaps {
        fn memory_maps(&self, pid: Pid) -> Result<Vec<MemoryMapping>, ResolveError> {
            self.maps.get(&pid.0).cloned().ok_or(ResolveError::ProcessGone(pid))
        }
    }

    /// Serves one fake binary whose symbols and token can be swapped.
    struct FakeLoader {
        mtime: AtomicU64,
        symbols: Mutex<Vec<Symbol>>,
        loads: AtomicU64,
    }

    impl FakeLoader {
        fn new(symbols: Vec<Symbol>) -> Self {
            Self { mtime: AtomicU64::new(1), symbols: Mutex::new(symbols), loads: AtomicU64::new(0) }
        }

        fn replace_binary(&self, symbols: Vec<Symbol>) {
            *self.symbols.lock().unwrap() = symbols;
            self.mtime.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl ImageLoader for FakeLoader {
        fn locate(&self, _pid: Pid, mapping: &MemoryMapping) -> Result<BinaryImage, ResolveError> {
            let mtime = i64::try_from(self.mtime.load(Ordering::SeqCst)).unwrap();
            Ok(BinaryImage {
                path: PathBuf::from(mapping.path.clone().unwrap()),
                root: FileIdentity { dev: 1, inode: 2 },
                deleted: mapping.deleted,
                identity: FileIdentity { dev: mapping.dev, inode: mapping.inode },
                load_base: mapping.load_base(),
                range: mapping.range,
                token: ModificationToken { size: 1, mtime_ns: mtime, ctime_ns: mtime },
                source: PathBuf::from(mapping.path.clone().unwrap()),
            })
        }

        fn load(&self, _image: &BinaryImage) -> Result<SymbolTable, ResolveError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(SymbolTable::from_parts(
                self.symbols.lock().unwrap().clone(),
                // Text segment: file offset 0x2a000 mapped at vaddr 0x2b000
                vec![LoadSegment { file_offset: 0x2a000, vaddr: 0x2b000, file_size: 0xe6000 }],
            ))
        }
    }

    fn sym(start: u64, len: u64, name: &str) -> Symbol {
        Symbol { start, len, name: name.to_string() }
    }

    fn resolver(loader: FakeLoader) -> Resolver<FakeMaps, FakeLoader> {
        let maps = FakeMaps { maps: HashMap::from([(100, vec![parse_maps_line(APP_TEXT).unwrap()])]) };
        Resolver::with_sources(maps, loader, Arc::new(SymbolCache::new(1 << 20)))
    }

    /// Runtime address of ELF vaddr `vaddr` in the fake process.
    fn runtime(vaddr: u64) -> u64 {
        APP_BASE + (vaddr - 0x2b000 + 0x2a000)
    }

    #[test]
    fn test_resolve_empty_input() {
        let resolver = resolver(FakeLoader::new(vec![]));
        assert!(resolver.resolve(Pid(100), &[]).is_empty());
        assert!(resolver.resolve(Pid(999), &[]).is_empty());
    }

    #[test]
    fn test_resolve_preserves_order() {
        let resolver = resolver(FakeLoader::new(vec![
            sym(0x2b100, 0x80, "main"),
            sym(0x2c000, 0x40, "handle_request"),
        ]));
        let addrs = [runtime(0x2c010), 0x1234, runtime(0x2b104)];
        let frames = resolver.resolve(Pid(100), &addrs);

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].name(), "handle_request");
        assert_eq!(frames[0].offset, 0x10);
        assert_eq!(frames[0].image.as_ref().unwrap().path, PathBuf::from("/usr/bin/app"));
        assert_eq!(frames[1].name(), UNKNOWN_SYMBOL);
        assert_eq!(frames[2].name(), "main");
        assert_eq!(frames[2].to_string(), "main+0x4 (/usr/bin/app)");
        assert!(frames.iter().zip(addrs).all(|(f, a)| f.address == a));
    }

    #[test]
    fn test_resolve_gone_process_is_all_unknown() {
        let resolver = resolver(FakeLoader::new(vec![sym(0x2b100, 0x80, "main")]));
        let frames = resolver.resolve(Pid(4242), &[runtime(0x2b104), runtime(0x2b108)]);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| !f.is_resolved()));
    }

    #[test]
    fn test_resolve_is_idempotent_with_unchanged_token() {
        let loader = FakeLoader::new(vec![sym(0x2b100, 0x80, "main")]);
        let resolver = resolver(loader);
        let first = resolver.resolve(Pid(100), &[runtime(0x2b104)]);
        let second = resolver.resolve(Pid(100), &[runtime(0x2b104)]);
        assert_eq!(first, second);
        assert_eq!(resolver.loader.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_changed_binary_is_reparsed() {
        let resolver = resolver(FakeLoader::new(vec![sym(0x2b100, 0x80, "old_fn")]));
        assert_eq!(resolver.resolve(Pid(100), &[runtime(0x2b104)])[0].name(), "old_fn");

        resolver.loader.replace_binary(vec![sym(0x2b000, 0x200, "new_fn")]);
        let frame = &resolver.resolve(Pid(100), &[runtime(0x2b104)])[0];
        assert_eq!(frame.name(), "new_fn");
        assert_eq!(frame.offset, 0x104);
        assert_eq!(resolver.cache().stats().invalidations, 1);
    }

    #[test]
    fn test_resolve_for_rejects_recycled_pid() {
        let resolver = resolver(FakeLoader::new(vec![sym(0x2b100, 0x80, "main")]));
        let registry = Registry::with_table(StaticTable::default().with(100, "app", 500, 'S'));

        let live = registry.lookup(Pid(100)).unwrap();
        assert_eq!(resolver.resolve_for(&registry, &live, &[runtime(0x2b104)])[0].name(), "main");

        let stale = ProcessIdentity { start_time: crate::domain::StartTime(1), ..live };
        let frames = resolver.resolve_for(&registry, &stale, &[runtime(0x2b104)]);
        assert!(!frames[0].is_resolved());
    }

    #[test]
    fn test_format_lists_inlined_frames_first() {
        let at = |file: &str, line| Some(SourceLocation { file: file.to_string(), line, column: None });
        let frame = ResolvedFrame {
            symbol: Some("serve".to_string()),
            offset: 0x24,
            location: at("/src/app/server.rs", 88),
            inlined: vec![InlinedFrame { function: "parse_header".to_string(), location: at("/src/app/http.rs", 12) }],
            ..ResolvedFrame::unknown(0x1000)
        };
        let text = frame.format(3);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("#3 ") && lines[0].ends_with("parse_header (inlined)"));
        assert!(lines[1].ends_with("at /src/app/http.rs:12"));
        assert!(lines[2].ends_with("serve+0x24"));
        assert!(lines[3].ends_with("at /src/app/server.rs:88"));
    }

    #[test]
    fn test_kernel_addresses_use_kallsyms() {
        let ksyms = KernelSymbols::from_reader(Cursor::new(
            &b"ffffffffa2000000 T do_syscall_64\nffffffffa2000400 T tcp_sendmsg\n"[..],
        ))
        .unwrap();
        let resolver = resolver(FakeLoader::new(vec![])).with_kernel_table(ksyms);

        // Kernel-only stacks resolve even for pids without maps.
        let frames = resolver.resolve(Pid(4242), &[0xffff_ffff_a200_0410]);
        assert_eq!(frames[0].name(), "tcp_sendmsg");
        assert_eq!(frames[0].offset, 0x10);
    }
}
