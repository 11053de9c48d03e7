use std::{collections::BTreeMap, io::BufRead};

use anyhow::{Context, Error, bail};

/// Resolves addresses of statically allocated objects to symbol names.
pub trait SymbolLookup {
    /// Returns the name of the symbol at `address`, or `None` if unknown.
    fn symbol_at(&self, address: u64) -> Option<&str>;
}

/// A lookup that knows no symbols.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSymbols;

impl SymbolLookup for NoSymbols {
    fn symbol_at(&self, _address: u64) -> Option<&str> {
        None
    }
}

#[derive(Debug, Clone)]
struct Symbol {
    name: String,
    size: Option<u64>,
}

/// A symbol table read from the output of `nm` or `nm -S`.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: BTreeMap<u64, Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads lines of the form `ADDR [SIZE] TYPE NAME`.
    ///
    /// Undefined symbols, which have no address, are skipped.
    pub fn from_nm<R: BufRead>(input: R) -> Result<Self, Error> {
        let mut table = Self::new();

        for (idx, line) in input.lines().enumerate() {
            let line = line?;
            let fields: Vec<&str> = line.split_whitespace().collect();

            let (address, size, name) = match fields.as_slice() {
                [] => continue,
                [_, _] => continue,
                [address, _, name] => (*address, None, *name),
                [address, size, _, name] => (*address, Some(*size), *name),
                _ => bail!("Malformed symbol in line {}: '{line}'", idx + 1),
            };

            let address = u64::from_str_radix(address, 16)
                .with_context(|| format!("Invalid symbol address in line {}", idx + 1))?;
            let size = size
                .map(|size| u64::from_str_radix(size, 16))
                .transpose()
                .with_context(|| format!("Invalid symbol size in line {}", idx + 1))?;

            table.insert(address, size, name);
        }

        Ok(table)
    }

    pub fn insert(&mut self, address: u64, size: Option<u64>, name: &str) {
        self.symbols.insert(
            address,
            Symbol {
                name: name.to_string(),
                size,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl SymbolLookup for SymbolTable {
    fn symbol_at(&self, address: u64) -> Option<&str> {
        let (start, symbol) = self.symbols.range(..=address).next_back()?;

        let hit = match symbol.size {
            _ if *start == address => true,
            Some(size) => address - start < size,
            None => false,
        };

        hit.then_some(symbol.name.as_str())
    }
}
