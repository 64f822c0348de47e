//! Per-binary symbol tables built from ELF files.

use std::cell::Cell;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use addr2line::Context;
use gimli::{EndianArcSlice, RunTimeEndian};
use object::{Object, ObjectSection, ObjectSegment, ObjectSymbol, SegmentFlags, SymbolKind};
use rustc_demangle::demangle;

type DwarfReader = EndianArcSlice<RunTimeEndian>;

/// A function symbol, in ELF virtual addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub start: u64,
    pub len: u64,
    pub name: String,
}

impl Symbol {
    /// One past the last covered address
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.len)
    }
}

/// A `PT_LOAD` segment used to translate file offsets into virtual addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSegment {
    pub file_offset: u64,
    pub vaddr: u64,
    pub file_size: u64,
}

impl LoadSegment {
    fn contains_vaddr(&self, vaddr: u64) -> bool {
        vaddr >= self.vaddr && vaddr - self.vaddr < self.file_size
    }

    fn contains_offset(&self, offset: u64) -> bool {
        offset >= self.file_offset && offset - self.file_offset < self.file_size
    }
}

/// Source code location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    /// Full path, compilation directory included when the DWARF has one
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
}

/// An inlined frame within a resolved address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlinedFrame {
    pub function: String,
    pub location: Option<SourceLocation>,
}

/// DWARF of one binary behind a lock; lookups fill lazily parsed units.
struct LineInfo {
    ctx: Mutex<Context<DwarfReader>>,
    size: usize,
}

impl fmt::Debug for LineInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineInfo").field("size", &self.size).finish_non_exhaustive()
    }
}

/// Sorted symbols, load segments and optional line info of one binary.
///
/// Immutable once built; shared between threads through the cache.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    /// `max_end[i]` is the largest `end()` among `symbols[..=i]`
    max_end: Vec<u64>,
    segments: Vec<LoadSegment>,
    lines: Option<LineInfo>,
}

/// Demangle a Rust symbol name (other names pass through unchanged)
#[must_use]
pub fn demangle_symbol(symbol: &str) -> String {
    format!("{:#}", demangle(symbol))
}

impl SymbolTable {
    /// Build from already known symbols and segments.
    ///
    /// Symbols are sorted; zero-length symbols take the distance to the next
    /// symbol (or to the end of their segment for the last one). Symbols
    /// whose end does not fit in the address space are dropped.
    #[must_use]
    pub fn from_parts(mut symbols: Vec<Symbol>, segments: Vec<LoadSegment>) -> Self {
        symbols.retain(|sym| sym.start.checked_add(sym.len).is_some());
        symbols.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| b.len.cmp(&a.len)));
        symbols.dedup_by(|next, prev| next.start == prev.start && next.name == prev.name);

        for i in 0..symbols.len() {
            if symbols[i].len != 0 {
                continue;
            }
            let start = symbols[i].start;
            let next_start = symbols[i + 1..].iter().map(|s| s.start).find(|&s| s > start);
            symbols[i].len = match next_start {
                Some(next) => next - start,
                None => segments
                    .iter()
                    .find(|seg| seg.contains_vaddr(start))
                    .map_or(0, |seg| seg.file_size - (start - seg.vaddr)),
            };
        }

        let max_end = symbols
            .iter()
            .scan(0u64, |acc, sym| {
                *acc = (*acc).max(sym.end());
                Some(*acc)
            })
            .collect();

        Self { symbols, max_end, segments, lines: None }
    }

    /// Parse an ELF image.
    ///
    /// Text symbols come from `.symtab` and `.dynsym`. With `line_info` the
    /// DWARF sections are kept for source locations and inlined frames.
    ///
    /// # Errors
    /// Returns a description if the data is not a parseable object file or
    /// carries no function symbols at all (stripped)
    pub fn from_elf(data: &[u8], line_info: bool) -> Result<Self, String> {
        let file = object::File::parse(data).map_err(|e| format!("not an ELF object: {e}"))?;

        let segments: Vec<LoadSegment> = file
            .segments()
            .filter(|seg| match seg.flags() {
                SegmentFlags::Elf { p_flags } => p_flags & object::elf::PF_X != 0,
                _ => true,
            })
            .map(|seg| {
                let (file_offset, file_size) = seg.file_range();
                LoadSegment { file_offset, vaddr: seg.address(), file_size }
            })
            .collect();

        let symbols: Vec<Symbol> = file
            .symbols()
            .chain(file.dynamic_symbols())
            .filter(|sym| sym.kind() == SymbolKind::Text && sym.is_definition() && sym.address() != 0)
            .filter_map(|sym| {
                let name = sym.name().ok().filter(|n| !n.is_empty())?;
                Some(Symbol { start: sym.address(), len: sym.size(), name: demangle_symbol(name) })
            })
            .collect();

        if symbols.is_empty() {
            return Err("no function symbols (stripped binary)".to_string());
        }

        let mut table = Self::from_parts(symbols, segments);
        if line_info {
            match load_line_info(&file) {
                Ok(lines) => table.lines = Some(lines),
                Err(e) => log::debug!("Skipping line info: {e}"),
            }
        }
        Ok(table)
    }

    /// Translate a file offset into the ELF virtual address space.
    #[must_use]
    pub fn file_offset_to_vaddr(&self, offset: u64) -> Option<u64> {
        self.segments
            .iter()
            .filter(|seg| seg.contains_offset(offset))
            .find_map(|seg| (offset - seg.file_offset).checked_add(seg.vaddr))
    }

    /// Symbol covering `vaddr` and the offset into it.
    ///
    /// Nested or aliased symbols resolve to the closest start that still
    /// covers `vaddr`.
    #[must_use]
    pub fn lookup(&self, vaddr: u64) -> Option<(&Symbol, u64)> {
        let idx = self.symbols.partition_point(|sym| sym.start <= vaddr);
        for i in (0..idx).rev() {
            if self.max_end[i] <= vaddr {
                break;
            }
            let sym = &self.symbols[i];
            if vaddr < sym.end() {
                return Some((sym, vaddr - sym.start));
            }
        }
        None
    }

    /// Source frames at `vaddr`, innermost inlined function first.
    ///
    /// Empty unless line info was loaded and covers the address.
    #[must_use]
    pub fn source_frames(&self, vaddr: u64) -> Vec<InlinedFrame> {
        let Some(lines) = &self.lines else {
            return Vec::new();
        };
        let ctx = lines.ctx.lock().unwrap_or_else(PoisonError::into_inner);
        let mut frames = Vec::new();
        let Ok(mut iter) = ctx.find_frames(vaddr).skip_all_loads() else {
            return frames;
        };
        while let Ok(Some(frame)) = iter.next() {
            let function = frame
                .function
                .and_then(|f| f.demangle().ok().map(|s| s.to_string()))
                .unwrap_or_else(|| "<unknown>".to_string());
            let location = frame.location.and_then(|loc| {
                Some(SourceLocation {
                    file: loc.file?.to_string(),
                    line: loc.line?,
                    column: loc.column,
                })
            });
            frames.push(InlinedFrame { function, location });
        }
        frames
    }

    /// Source line for `vaddr`, when line info was loaded.
    #[must_use]
    pub fn location(&self, vaddr: u64) -> Option<SourceLocation> {
        self.source_frames(vaddr).pop()?.location
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    #[must_use]
    pub fn has_line_info(&self) -> bool {
        self.lines.is_some()
    }

    /// Approximate heap footprint, used for cache accounting.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        let symbols: usize =
            self.symbols.iter().map(|s| std::mem::size_of::<Symbol>() + s.name.len()).sum();
        symbols
            + self.max_end.len() * std::mem::size_of::<u64>()
            + self.segments.len() * std::mem::size_of::<LoadSegment>()
            + self.lines.as_ref().map_or(0, |lines| lines.size)
    }
}

fn load_line_info(file: &object::File<'_>) -> Result<LineInfo, gimli::Error> {
    let endian = if file.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };
    let size = Cell::new(0usize);

    let load_section = |id: gimli::SectionId| -> Result<DwarfReader, gimli::Error> {
        let data = file
            .section_by_name(id.name())
            .and_then(|section| section.uncompressed_data().ok())
            .unwrap_or(std::borrow::Cow::Borrowed(&[][..]));
        size.set(size.get() + data.len());
        Ok(EndianArcSlice::new(Arc::from(&*data), endian))
    };

    let dwarf = gimli::Dwarf::load(&load_section)?;
    let ctx = Context::from_dwarf(dwarf)?;
    // Parsed units roughly double the raw section footprint.
    Ok(LineInfo { ctx: Mutex::new(ctx), size: size.get() * 2 })
}
