use nix::unistd::{getpid, Pid};
use std::{
    os::unix::thread::JoinHandleExt,
    thread::{Builder, JoinHandle},
};

use crate::{
    diag::{Error, Result},
    symbol::MemAddr,
    symtab::Table,
    thread::{Handle, Status, Thread},
};

/// The address-space and thread registry of the traced process: every
/// loaded module's symbol table and the simulated stack of every known
/// thread.
///
/// The registry carries no lock of its own; all access goes through the
/// tracer's process-wide recursive lock.
pub struct Registry {
    pid: Pid,
    symtabs: Vec<Table>,
    threads: Vec<Thread>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pid: getpid(),
            symtabs: Vec::new(),
            threads: Vec::new(),
        }
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Load the symbol table of the module at `path`, mapped at `base`,
    /// and add it to the registry.
    ///
    /// # Errors
    ///
    /// Returns an `Err` when the symbol table cannot be loaded.
    pub fn add_module(&mut self, path: &str, base: MemAddr) -> Result<()> {
        let table = Table::build(path, base)?;
        self.symtabs.push(table);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn add_table(&mut self, table: Table) {
        self.symtabs.push(table);
    }

    /// Resolve an address to a symbol name across all modules, in module
    /// insertion order.
    #[must_use]
    pub fn lookup(&self, addr: MemAddr) -> Option<&str> {
        self.symtabs.iter().find_map(|table| table.addr_to_name(addr))
    }

    /// Inverse lookup: find the module that defines the symbol at `addr`
    /// and return its path and load base.
    #[must_use]
    pub fn inverse_lookup(&self, addr: MemAddr) -> Option<(&str, MemAddr)> {
        self.symtabs
            .iter()
            .find(|table| table.contains_address(addr))
            .map(|table| (table.path(), table.base()))
    }

    #[must_use]
    pub fn module_count(&self) -> usize {
        self.symtabs.len()
    }

    #[must_use]
    pub fn symbol_count(&self) -> usize {
        self.symtabs.iter().map(Table::size).sum()
    }

    /// Get the state of the calling thread, creating and registering one
    /// when the thread makes its first instrumented call.
    pub fn current_thread(&mut self) -> &mut Thread {
        let i = match self.threads.iter().position(Thread::is_current) {
            Some(i) => i,
            None => {
                self.threads.push(Thread::new(None));
                self.threads.len() - 1
            }
        };

        &mut self.threads[i]
    }

    #[must_use]
    pub fn get_thread(&self, id: Handle) -> Option<&Thread> {
        self.threads.iter().find(|thr| thr.is(id))
    }

    pub(crate) fn get_thread_mut(&mut self, id: Handle) -> Option<&mut Thread> {
        self.threads.iter_mut().find(|thr| thr.is(id))
    }

    #[must_use]
    pub fn get_thread_by_name(&self, nm: &str) -> Option<&Thread> {
        self.threads.iter().find(|thr| thr.is_named(nm))
    }

    /// Get a thread by its offset in the registration order.
    ///
    /// # Errors
    ///
    /// Returns an `Err` when the offset is past the thread count.
    pub fn get_thread_at(&self, i: usize) -> Result<&Thread> {
        self.threads
            .get(i)
            .ok_or_else(|| Error::out_of_bounds(i, self.threads.len()))
    }

    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Register an externally created thread state.
    ///
    /// # Errors
    ///
    /// Returns an `Err` when a state with the same handle is already
    /// registered.
    pub fn register_thread(&mut self, thr: Thread) -> Result<()> {
        if self.get_thread(thr.handle()).is_some() {
            return Err(Error::already_registered(format!(
                "thread {:#x}",
                thr.handle()
            )));
        }

        self.threads.push(thr);
        Ok(())
    }

    /// Spawn a new, named OS thread and register its simulated stack.
    ///
    /// # Errors
    ///
    /// Returns an `Err` when the name is empty, the thread cannot be
    /// spawned, or its handle is already registered (the spawned thread
    /// keeps running in that case; the caller holds its join handle).
    pub fn fork_thread<F>(&mut self, nm: &str, entry: F) -> Result<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        if nm.is_empty() {
            return Err(Error::invalid_argument("empty thread name"));
        }

        let handle = Builder::new().name(nm.to_string()).spawn(entry)?;
        self.register_thread(Thread::with_handle(handle.as_pthread_t(), nm))?;

        Ok(handle)
    }

    /// Remove the state of the thread with the given handle.
    pub fn cleanup_thread(&mut self, id: Handle) {
        self.threads.retain(|thr| !thr.is(id));
    }

    /// Remove every finished thread whose stack has returned to depth
    /// zero.
    pub fn cleanup_zombies(&mut self) {
        self.threads.retain(|thr| {
            thr.call_depth() > 0
                || !matches!(thr.status(), Status::Started | Status::Exited)
        });
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
