use std::fmt;

use object::{Object, ObjectSymbol};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SymbolKind {
    NoType,
    Object,
    Func,
    Section,
    File,
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SymbolKind::NoType => "notype",
            SymbolKind::Object => "object",
            SymbolKind::Func => "func",
            SymbolKind::Section => "section",
            SymbolKind::File => "file",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Symbol {
    pub kind: SymbolKind,
    pub name: String,
    pub addr: u64,
}

fn to_symbol_kind(kind: object::SymbolKind) -> SymbolKind {
    match kind {
        object::SymbolKind::Data => SymbolKind::Object,
        object::SymbolKind::Text => SymbolKind::Func,
        object::SymbolKind::Section => SymbolKind::Section,
        object::SymbolKind::File => SymbolKind::File,
        _ => SymbolKind::NoType,
    }
}

/// Records from the symbol table and the dynamic symbol table, extracted
/// once at load time.
pub fn extract_symbols(object: &object::File) -> Vec<Symbol> {
    object
        .symbols()
        .chain(object.dynamic_symbols())
        .filter_map(|sym| {
            let name = match sym.name() {
                Ok(name) if !name.is_empty() => name.to_owned(),
                _ => return None,
            };
            Some(Symbol {
                kind: to_symbol_kind(sym.kind()),
                name,
                addr: sym.address(),
            })
        })
        .collect()
}

pub fn lookup<'a>(symbols: &'a [Symbol], name: &str) -> Vec<&'a Symbol> {
    symbols.iter().filter(|sym| sym.name == name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_mapping() {
        assert_eq!(to_symbol_kind(object::SymbolKind::Text), SymbolKind::Func);
        assert_eq!(to_symbol_kind(object::SymbolKind::Data), SymbolKind::Object);
        assert_eq!(to_symbol_kind(object::SymbolKind::Unknown), SymbolKind::NoType);
        assert_eq!(to_symbol_kind(object::SymbolKind::Label), SymbolKind::NoType);
    }

    #[test]
    fn lookup_matches_exact_names_only() {
        let symbols = vec![
            Symbol { kind: SymbolKind::Func, name: "main".into(), addr: 0x401126 },
            Symbol { kind: SymbolKind::Object, name: "main_count".into(), addr: 0x404028 },
            Symbol { kind: SymbolKind::Func, name: "main".into(), addr: 0x401126 },
        ];
        let found = lookup(&symbols, "main");
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|s| s.name == "main"));
        assert!(lookup(&symbols, "missing").is_empty());
    }
}
