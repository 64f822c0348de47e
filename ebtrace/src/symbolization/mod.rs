//! # Symbol Resolution and Address Translation
//!
//! Stack samples captured in the kernel hold raw instruction pointers like
//! `0x55f3a2b4c780`. This module turns them into function names (and, when
//! DWARF line tables are present, `file:line`) for the process the sample
//! came from.
//!
//! ## The Symbolization Problem
//!
//! Three things make this harder than a single binary lookup:
//!
//! - **ASLR / PIE**: every process loads its executable and libraries at
//!   randomized addresses, so each address has to be located in the
//!   process's own `/proc/<pid>/maps` first.
//! - **Short-lived processes**: by the time a sample is resolved the process
//!   may be gone, or its pid may belong to someone else. Those frames come
//!   back as `unknown` instead of failing the whole call.
//! - **Binaries change on disk**: a deploy can replace `/usr/bin/app` while
//!   samples from the old build are still in flight. Cached symbol tables are
//!   keyed by file identity *and* a modification token so a rebuilt binary
//!   is never resolved with stale symbols.
//!
//! ## Address Translation Flow
//!
//! ```text
//! 1. eBPF captures stack trace
//!    Raw addresses: [0x55f3a2b4c780, 0xffffffffa2000410, ...]
//!
//! 2. Kernel half (>= 0xffff800000000000) → /proc/kallsyms
//!
//! 3. User half → /proc/<pid>/maps
//!    55f3a2b4c000-55f3a2b5f000 r-xp 00002000 fd:01 1311018 /usr/bin/app
//!
//! 4. Runtime address → file offset
//!    file_offset = addr - start + offset = 0x2780
//!
//! 5. File offset → ELF virtual address through the PT_LOAD segments
//!
//! 6. Virtual address → symbol (.symtab / .dynsym), demangled
//!    _ZN5tokio7runtime8blocking4pool8spawner14spawn_blocking17h...
//!      → tokio::runtime::blocking::pool::spawner::spawn_blocking
//! ```
//!
//! ## Module Structure
//!
//! - **`memory_maps`**: `/proc/<pid>/maps` parsing
//! - **`image`**: finding the file behind a mapping (through
//!   `/proc/<pid>/root`, falling back to `map_files`) and its cache key
//! - **`symbol_table`**: ELF symbol + optional DWARF line tables
//! - **`cache`**: process-wide, byte-bounded symbol table cache
//! - **`kallsyms`**: kernel symbols
//! - **`resolver`**: ties the above together
//!
//! ## Example
//!
//! ```rust,ignore
//! let resolver = Resolver::new(&ResolverConfig::default());
//! for frame in resolver.resolve(pid, &sample.user_frames()) {
//!     println!("{frame}");
//! }
//! ```
//!
//! ## Limitations
//!
//! - **Stripped binaries** resolve to `unknown`; separate debuginfo files
//!   are not searched.
//! - **JIT code** and anonymous executable mappings are never resolved.
//! - **Inlining**: only the outermost function is reported.

pub mod cache;
pub mod image;
pub mod kallsyms;
pub mod memory_maps;
pub mod resolver;
pub mod symbol_table;

pub use cache::{CacheStats, SymbolCache};
pub use image::{
    BinaryImage, FileIdentity, ImageKey, ImageLoader, ImageLocation, ModificationToken, ProcImageLoader,
};
pub use kallsyms::{is_kernel_address, KernelSymbols};
pub use memory_maps::{read_memory_maps, MemoryMapping, MemoryRange};
pub use resolver::{ImageRef, MapsSource, ProcMaps, ResolvedFrame, Resolver, ResolverConfig, UNKNOWN_SYMBOL};
pub use symbol_table::{demangle_symbol, InlinedFrame, SourceLocation, SymbolTable};
