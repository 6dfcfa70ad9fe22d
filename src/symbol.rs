use cpp_demangle::{DemangleOptions, Symbol as CxxSymbol};
use rustc_demangle::try_demangle;

/// An address in the traced process address space.
pub type MemAddr = u64;

/// Demangle a decorated symbol name.
///
/// Itanium ABI (C++) demangling is attempted first, then Rust. Returns
/// `None` when neither demangler accepts the name, in which case callers
/// keep the decorated form.
#[must_use]
pub fn demangle(nm: &str) -> Option<String> {
    if let Ok(sym) = CxxSymbol::new(nm) {
        if let Ok(demangled) = sym.demangle(&DemangleOptions::default()) {
            return Some(demangled);
        }
    }

    try_demangle(nm).ok().map(|sym| format!("{sym:#}"))
}

/// A code address paired with its (demangled) function name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Symbol {
    addr: MemAddr,
    name: Option<String>,
}

impl Symbol {
    /// Create a symbol. The name, if given, is demangled; when demangling
    /// fails the decorated name is retained.
    #[must_use]
    pub fn new(addr: MemAddr, nm: Option<&str>) -> Self {
        let name = nm.map(|nm| demangle(nm).unwrap_or_else(|| nm.to_string()));
        Self { addr, name }
    }

    #[must_use]
    pub fn addr(&self) -> MemAddr {
        self.addr
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}
