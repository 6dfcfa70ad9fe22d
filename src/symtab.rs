use goblin::elf::{header, section_header::SHF_EXECINSTR, Elf};
use std::{fmt, fs::File, io::Read, path::Path};

use crate::{
    diag::{Error, Result},
    symbol::{MemAddr, Symbol},
};

/// The function symbols of one loaded module (executable or DSO).
///
/// The table is loaded from the module's on-disk image at construction
/// and is read-only afterwards. Only entries that live in a code section
/// and are typed as functions are kept; names are demangled when the
/// demangler succeeds and decorated otherwise. Entries are sorted by
/// address so lookups can binary-search.
#[derive(Debug)]
pub struct Table {
    path: String,
    base: MemAddr,
    table: Vec<Symbol>,
}

impl Table {
    /// Load the symbol table of the objective code file at `path`, mapped
    /// at load base `base`.
    ///
    /// # Errors
    ///
    /// Returns an `Err` when the path is empty (`InvalidArgument`), the
    /// file cannot be read (`System`), it does not parse as object code
    /// (`Backend`) or it carries no symbol table (`Stripped`).
    pub fn build(path: &str, base: MemAddr) -> Result<Self> {
        if path.is_empty() {
            return Err(Error::invalid_argument("empty module path"));
        }

        let mut file = File::open(Path::new(path))?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;

        let elf = Elf::parse(&buffer).map_err(|e| {
            Error::backend(format!("failed to parse '{path}' ({e})"))
        })?;

        match elf.header.e_type {
            header::ET_EXEC | header::ET_DYN => (),
            other => {
                return Err(Error::backend(format!(
                    "'{path}' is not objective code (e_type {other})"
                )));
            }
        }

        if elf.syms.is_empty() {
            return Err(Error::stripped(path));
        }

        let mut table = Vec::new();
        for sym in elf.syms.iter() {
            if !sym.is_function() {
                continue;
            }

            let Some(section) = elf.section_headers.get(sym.st_shndx) else {
                continue;
            };
            if section.sh_flags & u64::from(SHF_EXECINSTR) == 0 {
                continue;
            }

            // The runtime address is the load base plus the symbol's
            // virtual memory address within the module image.
            let addr = base + sym.st_value;
            let nm = elf.strtab.get_at(sym.st_name);
            table.push(Symbol::new(addr, nm));
        }

        table.sort_by_key(Symbol::addr);

        log::debug!(
            "loaded the symbol table of '{}' ({} function symbols @ {:#x})",
            path,
            table.len(),
            base
        );

        Ok(Self {
            path: path.to_string(),
            base,
            table,
        })
    }

    #[cfg(test)]
    pub(crate) fn from_symbols(
        path: &str,
        base: MemAddr,
        mut table: Vec<Symbol>,
    ) -> Self {
        table.sort_by_key(Symbol::addr);
        Self {
            path: path.to_string(),
            base,
            table,
        }
    }

    #[must_use]
    pub fn base(&self) -> MemAddr {
        self.base
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.table.len()
    }

    /// Resolve an address to a symbol; exact entry-point match.
    #[must_use]
    pub fn resolve_address(&self, addr: MemAddr) -> Option<&Symbol> {
        self.table
            .binary_search_by_key(&addr, Symbol::addr)
            .ok()
            .map(|i| &self.table[i])
    }

    /// Resolve a name to a symbol; exact string match.
    #[must_use]
    pub fn resolve_name(&self, nm: &str) -> Option<&Symbol> {
        self.table.iter().find(|sym| sym.name() == Some(nm))
    }

    #[must_use]
    pub fn contains_address(&self, addr: MemAddr) -> bool {
        self.resolve_address(addr).is_some()
    }

    /// Resolve an address to a symbol name.
    #[must_use]
    pub fn addr_to_name(&self, addr: MemAddr) -> Option<&str> {
        self.resolve_address(addr).and_then(Symbol::name)
    }

    /// Resolve a name to a symbol address.
    #[must_use]
    pub fn name_to_addr(&self, nm: &str) -> Option<MemAddr> {
        self.resolve_name(nm).map(Symbol::addr)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Symbol enumeration of '{}' ({} symbols @ {:#x})",
            self.path,
            self.table.len(),
            self.base
        )?;

        for sym in &self.table {
            writeln!(
                f,
                "  {} @ {:#x}",
                sym.name().unwrap_or("?"),
                sym.addr()
            )?;
        }

        Ok(())
    }
}
