//! Kernel symbol lookup from `/proc/kallsyms`.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

pub const KALLSYMS_PATH: &str = "/proc/kallsyms";

/// Kernel text addresses live in the upper half of the address space.
#[must_use]
pub fn is_kernel_address(addr: u64) -> bool {
    addr >= 0xffff_8000_0000_0000
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ksym {
    pub start_addr: u64,
    pub symbol_name: String,
}

/// Sorted kernel text symbols.
#[derive(Debug, Default)]
pub struct KernelSymbols {
    symbols: Vec<Ksym>,
}

impl KernelSymbols {
    /// Read `/proc/kallsyms`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read
    pub fn load() -> io::Result<Self> {
        Self::load_from(Path::new(KALLSYMS_PATH))
    }

    /// # Errors
    /// Returns an error if the file cannot be read
    pub fn load_from(path: &Path) -> io::Result<Self> {
        Self::from_reader(File::open(path)?)
    }

    /// Parse kallsyms text. Only text symbols (`t`, `T`, `w`, `W`) are kept.
    ///
    /// # Errors
    /// Returns an error on read failure
    pub fn from_reader<R: Read>(data: R) -> io::Result<Self> {
        let mut symbols = Vec::new();
        for line in BufReader::new(data).lines() {
            let line = line?;
            let mut fields = line.split_whitespace();
            let (Some(addr), Some(kind), Some(name)) = (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if !matches!(kind, "t" | "T" | "w" | "W") {
                continue;
            }
            let Ok(start_addr) = u64::from_str_radix(addr, 16) else {
                continue;
            };
            symbols.push(Ksym { start_addr, symbol_name: name.to_string() });
        }
        symbols.sort_by_key(|sym| sym.start_addr);
        Ok(Self { symbols })
    }

    /// True when addresses are hidden (`kptr_restrict`) and every symbol reads as 0.
    #[must_use]
    pub fn is_restricted(&self) -> bool {
        self.symbols.iter().all(|sym| sym.start_addr == 0)
    }

    /// Closest symbol at or below `addr`, with the offset into it.
    #[must_use]
    pub fn lookup(&self, addr: u64) -> Option<(&str, u64)> {
        if self.is_restricted() {
            return None;
        }
        let idx = self.symbols.partition_point(|sym| sym.start_addr <= addr);
        let sym = self.symbols.get(idx.checked_sub(1)?)?;
        Some((&sym.symbol_name, addr - sym.start_addr))
    }

    /// Symbol names, including those whose addresses are hidden.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.symbols.iter().map(|sym| sym.symbol_name.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}
