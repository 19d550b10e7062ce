//! Kernel symbol table (`/proc/kallsyms`)
//!
//! Used two ways: the kernel backend resolves breakpoint function names to the
//! addresses the probe program sees via `bpf_get_func_ip`, and the frame
//! processor may name return addresses through the [`SymbolSource`] trait.

use anyhow::{Context, Result};
use std::fs;

pub const KALLSYMS_PATH: &str = "/proc/kallsyms";

/// Source-level information for an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSymbol {
    /// `name` or `name+0xoff`
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

/// Address → symbol mapping injected into the frame processor
pub trait SymbolSource: Send + Sync {
    fn resolve(&self, address: u64) -> Option<ResolvedSymbol>;
}

#[derive(Debug, Clone)]
struct KernelSymbol {
    address: u64,
    name: String,
    is_text: bool,
}

/// Parsed kallsyms, sorted by address
#[derive(Debug, Default)]
pub struct KernelSymbols {
    symbols: Vec<KernelSymbol>,
}

impl KernelSymbols {
    /// # Errors
    /// Returns an error if `/proc/kallsyms` cannot be read
    pub fn load() -> Result<Self> {
        let content = fs::read_to_string(KALLSYMS_PATH)
            .with_context(|| format!("Failed to read {KALLSYMS_PATH}"))?;
        Ok(Self::parse(&content))
    }

    /// Parse `address type name [module]` lines
    pub fn parse(content: &str) -> Self {
        let mut symbols: Vec<KernelSymbol> = content
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let address = u64::from_str_radix(parts.next()?, 16).ok()?;
                let kind = parts.next()?;
                let name = parts.next()?;
                Some(KernelSymbol {
                    address,
                    name: name.to_string(),
                    is_text: matches!(kind, "t" | "T"),
                })
            })
            .collect();
        symbols.sort_by_key(|s| s.address);
        Self { symbols }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Addresses read as 0 when `kptr_restrict` hides them from this user
    pub fn addresses_visible(&self) -> bool {
        self.symbols.iter().any(|s| s.address != 0)
    }

    /// Address of the text symbol `name`
    pub fn address_of(&self, name: &str) -> Option<u64> {
        self.symbols.iter().find(|s| s.is_text && s.name == name).map(|s| s.address)
    }
}

impl SymbolSource for KernelSymbols {
    fn resolve(&self, address: u64) -> Option<ResolvedSymbol> {
        if address == 0 {
            return None;
        }
        let idx = self.symbols.partition_point(|s| s.address <= address);
        let symbol = self.symbols[..idx].iter().rev().find(|s| s.is_text)?;
        let offset = address - symbol.address;
        let function = if offset == 0 {
            symbol.name.clone()
        } else {
            format!("{}+0x{offset:x}", symbol.name)
        };
        Some(ResolvedSymbol { function, file: None, line: None })
    }
}
