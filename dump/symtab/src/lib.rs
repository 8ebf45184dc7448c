// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! `nm`-format symbol tables.
//!
//! A table answers two questions: name → address, and address → the nearest
//! preceding symbol with an offset. The second is the primary access path
//! when symbolising instruction pointers out of a crash capture.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::ops::Range;
use std::path::Path;
use std::path::PathBuf;
use thiserror::Error;

/// Symbolisation refuses attribution beyond this distance from the nearest
/// symbol; a hit that far out is more likely unmapped data than a function.
pub const MAX_SYMBOLISE_GAP: u64 = 1 << 20;

/// Symbol a full hypervisor table must contain to prove it was not built
/// from a stripped image.
pub const TEXT_SECTION_MARKER: &str = "_stext";

/// End-of-text marker used to derive [`SymbolTable::text_range`].
pub const TEXT_SECTION_END: &str = "_etext";

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub address: u64,
    pub type_code: char,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read symbol table {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("symbol table {} contains no symbols", path.display())]
    Empty { path: PathBuf },
    #[error("symbol table {} is missing the text section marker {TEXT_SECTION_MARKER}", path.display())]
    MissingTextSection { path: PathBuf },
}

/// An immutable, address-sorted symbol table.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    by_name: HashMap<String, u64>,
}

impl SymbolTable {
    /// Parses a text symbol file of `<hex address> <type char> <name>`
    /// lines. Blank lines and `#` comments are ignored; malformed lines are
    /// skipped. With `require_text_section`, the table must contain
    /// [`TEXT_SECTION_MARKER`].
    pub fn parse(path: &Path, require_text_section: bool) -> Result<Self, Error> {
        let file = File::open(path).map_err(|source| Error::Io {
            path: path.to_owned(),
            source,
        })?;
        let table = Self::from_reader(BufReader::new(file)).map_err(|source| Error::Io {
            path: path.to_owned(),
            source,
        })?;

        if table.symbols.is_empty() {
            return Err(Error::Empty {
                path: path.to_owned(),
            });
        }
        if require_text_section && table.lookup_name(TEXT_SECTION_MARKER).is_none() {
            return Err(Error::MissingTextSection {
                path: path.to_owned(),
            });
        }

        tracing::debug!(
            path = %path.display(),
            symbols = table.symbols.len(),
            "parsed symbol table"
        );
        Ok(table)
    }

    fn from_reader(reader: impl BufRead) -> io::Result<Self> {
        let mut symbols = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match parse_line(trimmed) {
                Some(symbol) => symbols.push(symbol),
                None => {
                    tracing::debug!(line = index + 1, "skipping malformed symbol line");
                }
            }
        }

        symbols.sort_by_key(|s| s.address);
        let mut by_name = HashMap::with_capacity(symbols.len());
        for symbol in &symbols {
            // First definition wins for duplicate names.
            by_name
                .entry(symbol.name.clone())
                .or_insert(symbol.address);
        }
        Ok(Self { symbols, by_name })
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// The address of a symbol by exact name.
    pub fn lookup_name(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).copied()
    }

    /// Resolves `address` to the greatest symbol at or below it, returning
    /// the symbol name and the positive offset. Addresses below the first
    /// symbol, or more than [`MAX_SYMBOLISE_GAP`] past the nearest one,
    /// resolve to `None`.
    pub fn symbolise(&self, address: u64) -> Option<(&str, u64)> {
        let idx = self.symbols.partition_point(|s| s.address <= address);
        let symbol = self.symbols[..idx].last()?;
        let offset = address - symbol.address;
        if offset > MAX_SYMBOLISE_GAP {
            return None;
        }
        Some((&symbol.name, offset))
    }

    /// The `[_stext, _etext)` range, when both markers are present.
    pub fn text_range(&self) -> Option<Range<u64>> {
        let start = self.lookup_name(TEXT_SECTION_MARKER)?;
        let end = self.lookup_name(TEXT_SECTION_END)?;
        (start < end).then_some(start..end)
    }
}

fn parse_line(line: &str) -> Option<Symbol> {
    let mut fields = line.split_whitespace();
    let address = fields.next()?;
    let type_code = fields.next()?;
    let name = fields.next()?;
    if fields.next().is_some() || address.len() > 16 {
        return None;
    }

    let address = u64::from_str_radix(address, 16).ok()?;
    let mut type_chars = type_code.chars();
    let type_code = type_chars.next()?;
    if type_chars.next().is_some() || !type_code.is_ascii_alphabetic() {
        return None;
    }

    Some(Symbol {
        name: name.to_owned(),
        address,
        type_code,
    })
}
