// symbols.rs - Flat symbol table filled in by the assembler

use crate::bytecode::Cell;
use std::fmt;
use std::io::{self, Write};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Label,
    Call,
    Constant,
    Variable,
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SymbolKind::Label => "label",
            SymbolKind::Call => "call",
            SymbolKind::Constant => "constant",
            SymbolKind::Variable => "variable",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub kind: SymbolKind,
    pub name: String,
    pub value: Cell,
    pub hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SymbolError {
    #[error("redefinition of symbol '{0}'")]
    Redefinition(String),
    #[error("line {line}: malformed symbol entry '{text}'")]
    Malformed { line: usize, text: String },
}

/// Names are unique; lookups scan linearly since tables stay small.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable {
            symbols: Vec::new(),
        }
    }

    pub fn add(
        &mut self,
        kind: SymbolKind,
        name: &str,
        value: Cell,
        hidden: bool,
    ) -> Result<(), SymbolError> {
        if self.lookup(name).is_some() {
            return Err(SymbolError::Redefinition(name.to_string()));
        }
        self.symbols.push(Symbol {
            kind,
            name: name.to_string(),
            value,
            hidden,
        });
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// One line per symbol: `kind name value hidden|visible`.
    pub fn dump(&self, out: &mut dyn Write) -> io::Result<()> {
        for s in &self.symbols {
            let visibility = if s.hidden { "hidden" } else { "visible" };
            writeln!(out, "{} {} {} {}", s.kind, s.name, s.value as i16, visibility)?;
        }
        Ok(())
    }

    /// Read back the format written by `dump`.
    pub fn parse_dump(text: &str) -> Result<SymbolTable, SymbolError> {
        let mut table = SymbolTable::new();
        for (index, entry) in text.lines().enumerate() {
            if entry.trim().is_empty() {
                continue;
            }
            let malformed = || SymbolError::Malformed {
                line: index + 1,
                text: entry.to_string(),
            };
            let fields: Vec<&str> = entry.split_whitespace().collect();
            let [kind, name, value, visibility] = fields[..] else {
                return Err(malformed());
            };
            let kind = match kind {
                "label" => SymbolKind::Label,
                "call" => SymbolKind::Call,
                "constant" => SymbolKind::Constant,
                "variable" => SymbolKind::Variable,
                _ => return Err(malformed()),
            };
            let value = value.parse::<i16>().map_err(|_| malformed())? as Cell;
            let hidden = match visibility {
                "hidden" => true,
                "visible" => false,
                _ => return Err(malformed()),
            };
            table.add(kind, name, value, hidden)?;
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_lookup() {
        let mut table = SymbolTable::new();
        table.add(SymbolKind::Call, "square", 0x20, false).unwrap();
        table.add(SymbolKind::Constant, "ten", 10, true).unwrap();

        let sym = table.lookup("square").unwrap();
        assert_eq!(sym.kind, SymbolKind::Call);
        assert_eq!(sym.value, 0x20);
        assert!(table.lookup("ten").unwrap().hidden);
        assert!(table.lookup("missing").is_none());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_redefinition_fails() {
        let mut table = SymbolTable::new();
        table.add(SymbolKind::Label, "x", 1, false).unwrap();
        assert_eq!(
            table.add(SymbolKind::Call, "x", 2, false),
            Err(SymbolError::Redefinition("x".to_string()))
        );
        assert_eq!(table.lookup("x").unwrap().value, 1);
    }

    #[test]
    fn test_dump_format() {
        let mut table = SymbolTable::new();
        table.add(SymbolKind::Constant, "neg", 0xFFFF, false).unwrap();
        table.add(SymbolKind::Variable, "v", 0x40, true).unwrap();
        let mut out = Vec::new();
        table.dump(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "constant neg -1 visible\nvariable v 64 hidden\n"
        );
    }

    #[test]
    fn test_parse_dump_reads_back() {
        let mut table = SymbolTable::new();
        table.add(SymbolKind::Call, "main", 0x10, false).unwrap();
        table.add(SymbolKind::Constant, "neg", 0xFFFF, true).unwrap();
        let mut out = Vec::new();
        table.dump(&mut out).unwrap();

        let parsed = SymbolTable::parse_dump(&String::from_utf8(out).unwrap()).unwrap();
        assert_eq!(parsed.lookup("neg").unwrap().value, 0xFFFF);
        assert!(parsed.lookup("neg").unwrap().hidden);
        assert_eq!(parsed.lookup("main").unwrap().kind, SymbolKind::Call);
    }

    #[test]
    fn test_parse_dump_rejects_garbage() {
        assert_eq!(
            SymbolTable::parse_dump("call main\n").unwrap_err(),
            SymbolError::Malformed {
                line: 1,
                text: "call main".to_string()
            }
        );
    }
}
