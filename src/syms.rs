use lazy_static::lazy_static;
use regex::Regex;
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub address: u64,
}

impl Display for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}=${:04x}", self.name, self.address)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SymbolError {
    #[error("line {line}: bad value `{value}`")]
    BadValue { line: usize, value: String },
}

/// Label addresses as reported by an assembler.
#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    symbols: BTreeMap<String, u64>,
}

lazy_static! {
    // Covers the dumps of the assemblers we drive:
    //   acme `-l`:      label	= $1900
    //   beebasm `-d`:   "label": 6400,
    //   xa `-l`:        label, 0x1900, 1, 0x0000
    //   z80asm map:     label = $1900 ; addr, local, ...
    // and beebasm style `.label = &1900`.
    static ref SYMBOL_LINE: Regex = Regex::new(
        r#"^\s*\.?"?([A-Za-z_][A-Za-z0-9_.@]*)"?\s*(?:=|:|,)\s*(\$|&|0[xX])?([0-9A-Fa-f]+)\b"#
    )
    .unwrap();
}

impl SymbolTable {
    /// Parses a symbol dump. Lines that don't look like a symbol are ignored,
    /// since most dumps carry headers or trailing noise.
    pub fn parse(text: &str) -> Result<Self, SymbolError> {
        let mut symbols = BTreeMap::new();

        for (idx, line) in text.lines().enumerate() {
            let caps = match SYMBOL_LINE.captures(line) {
                Some(caps) => caps,
                None => continue,
            };

            let name = &caps[1];
            let digits = &caps[3];
            let radix = if caps.get(2).is_some() { 16 } else { 10 };

            let address =
                u64::from_str_radix(digits, radix).map_err(|_| SymbolError::BadValue {
                    line: idx + 1,
                    value: digits.to_string(),
                })?;

            symbols.insert(name.to_string(), address);
        }

        Ok(Self { symbols })
    }

    pub fn lookup(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    /// Reverse lookup, first symbol (by name) at `address`
    pub fn name_at(&self, address: u64) -> Option<Symbol> {
        self.symbols
            .iter()
            .find(|(_, a)| **a == address)
            .map(|(name, &address)| Symbol {
                name: name.clone(),
                address,
            })
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::SymbolTable;

    #[test]
    fn acme_labels() {
        let table = SymbolTable::parse("\tpydis_start\t= $1900\n\tloop\t= $1904\t; ?\n").unwrap();
        assert_eq!(table.lookup("pydis_start"), Some(0x1900));
        assert_eq!(table.lookup("loop"), Some(0x1904));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn beebasm_dump() {
        let dump = "[{\"symbols\": {\n  \"pydis_start\": 6400,\n  \"oswrch\": 65518\n}}]\n";
        let table = SymbolTable::parse(dump).unwrap();
        assert_eq!(table.lookup("pydis_start"), Some(0x1900));
        assert_eq!(table.lookup("oswrch"), Some(0xffee));
    }

    #[test]
    fn xa_labels() {
        let table = SymbolTable::parse("pydis_end, 0x1a20, 1, 0x0000\n").unwrap();
        assert_eq!(table.lookup("pydis_end"), Some(0x1a20));
    }

    #[test]
    fn z80asm_map_and_noise() {
        let map = "; header\nstart = $0100 ; addr, local, , main, , main.asm:3\n\ngarbage here\n";
        let table = SymbolTable::parse(map).unwrap();
        assert_eq!(table.lookup("start"), Some(0x100));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn ampersand_hex_and_reverse_lookup() {
        let table = SymbolTable::parse(".entry = &2000\n").unwrap();
        assert_eq!(table.lookup("entry"), Some(0x2000));
        assert_eq!(table.name_at(0x2000).unwrap().to_string(), "entry=$2000");
        assert!(table.name_at(0x2001).is_none());
    }
}
