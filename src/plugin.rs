use libc::{c_void, RTLD_LAZY, RTLD_LOCAL, RTLD_NOLOAD};
use std::ffi::{CStr, CString};

use crate::{
    diag::{Error, Result},
    symbol::MemAddr,
};

/// The type of a plugin entry point: `void f(void *this_fn, void
/// *call_site)` with the addresses already widened. The `C-unwind` ABI
/// lets the dispatcher contain a callback that unwinds.
pub type ModSym = extern "C-unwind" fn(MemAddr, MemAddr);

/// Owner of a `dlopen`ed plugin module; unlinks it on drop.
#[derive(Debug)]
struct DsoHandle {
    path: String,
    handle: *mut c_void,
}

impl Drop for DsoHandle {
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle);
        }
        log::debug!("plugin '{}' unlinked", self.path);
    }
}

/// An enter/exit observer: either a pair of callbacks supplied inline or
/// a dynamically loaded module exporting them.
#[derive(Debug)]
pub struct Plugin {
    begin: ModSym,
    end: ModSym,
    dso: Option<DsoHandle>,
}

// The dlopen handle is a process-global token, valid from any thread.
unsafe impl Send for Plugin {}

impl Plugin {
    /// Register a pair of inline callbacks as a plugin.
    #[must_use]
    pub fn inline(begin: ModSym, end: ModSym) -> Self {
        Self {
            begin,
            end,
            dso: None,
        }
    }

    /// Load a plugin module (DSO) and resolve its entry points,
    /// `mod_enter` and `mod_exit`.
    ///
    /// With `scope` set the entry points are expected to carry C++
    /// linkage nested in that scope (`ns::cls`) and their Itanium-mangled
    /// names are resolved instead.
    ///
    /// # Errors
    ///
    /// Returns an `Err` when the module cannot be loaded (`Backend`) or
    /// either entry point is unresolvable (`SymbolMissing`).
    pub fn from_dso(path: &str, scope: Option<&str>) -> Result<Self> {
        if path.is_empty() {
            return Err(Error::invalid_argument("empty plugin path"));
        }

        let cpath = CString::new(path)
            .map_err(|_| Error::invalid_argument("plugin path with NUL byte"))?;

        let flags = RTLD_LOCAL | RTLD_LAZY;
        let handle = unsafe {
            // Check if the module is already loaded before linking it.
            let handle = libc::dlopen(cpath.as_ptr(), flags | RTLD_NOLOAD);
            if handle.is_null() {
                libc::dlerror();
                let handle = libc::dlopen(cpath.as_ptr(), flags);
                if handle.is_null() {
                    return Err(Error::backend(format!(
                        "failed to load plugin '{path}' ({})",
                        dl_error()
                    )));
                }

                log::debug!("plugin '{path}' loaded/linked");
                handle
            } else {
                log::debug!("plugin '{path}' linked");
                handle
            }
        };

        let dso = DsoHandle {
            path: path.to_string(),
            handle,
        };
        let begin = resolve(&dso, "mod_enter", scope)?;
        let end = resolve(&dso, "mod_exit", scope)?;

        Ok(Self {
            begin,
            end,
            dso: Some(dso),
        })
    }

    /// The module file path, `None` for inline plugins.
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.dso.as_ref().map(|dso| dso.path.as_str())
    }

    /// Begin instrumenting a function.
    pub fn begin(&self, addr: MemAddr, site: MemAddr) {
        (self.begin)(addr, site);
    }

    /// End a function instrumentation.
    pub fn end(&self, addr: MemAddr, site: MemAddr) {
        (self.end)(addr, site);
    }

    pub(crate) fn begin_fn(&self) -> ModSym {
        self.begin
    }

    pub(crate) fn end_fn(&self) -> ModSym {
        self.end
    }
}

/// Mangle a nested function name per the Itanium C++ ABI, for the plugin
/// entry-point signature `void (void*, void*)`.
fn mangle(scope: &str, nm: &str) -> String {
    let parts: Vec<&str> = scope.split("::").collect();

    let mut mangled = String::from("_ZN");
    for part in &parts {
        mangled.push_str(&format!("{}{}", part.len(), part));
    }
    mangled.push_str(&format!("{}{}", nm.len(), nm));

    // The second void* parameter is a substitution reference to the
    // first; its index follows the scope component substitutions.
    mangled.push_str(&format!("EPvS{}_", parts.len() - 1));

    mangled
}

fn resolve(dso: &DsoHandle, nm: &str, scope: Option<&str>) -> Result<ModSym> {
    let symbol = match scope {
        Some(scope) => mangle(scope, nm),
        None => nm.to_string(),
    };

    let csym = CString::new(symbol.as_str())
        .map_err(|_| Error::invalid_argument("symbol name with NUL byte"))?;

    unsafe {
        libc::dlerror();
        let sym = libc::dlsym(dso.handle, csym.as_ptr());
        if sym.is_null() || !libc::dlerror().is_null() {
            return Err(Error::symbol_missing(&symbol, &dso.path));
        }

        Ok(std::mem::transmute::<*mut c_void, ModSym>(sym))
    }
}

fn dl_error() -> String {
    unsafe {
        let err = libc::dlerror();
        if err.is_null() {
            "unknown dl error".to_string()
        } else {
            CStr::from_ptr(err).to_string_lossy().into_owned()
        }
    }
}
