use libc::c_void;
use once_cell::sync::OnceCell;
use parking_lot::ReentrantMutex;
use std::{
    cell::RefCell,
    fmt::Write,
    panic::{catch_unwind, AssertUnwindSafe},
    process,
    thread::JoinHandle,
};

use crate::{
    call::Call,
    diag::{Error, Result},
    dwarf::{Lookup, Resolver},
    filter::{Filter, Mode},
    plugin::Plugin,
    process::Registry,
    symbol::MemAddr,
    thread::Handle,
};

static TRACER: OnceCell<Tracer> = OnceCell::new();

/// Everything the process-wide recursive lock protects: the module and
/// thread registry, the plugin and filter lists and the source-location
/// resolver.
struct State {
    registry: Registry,
    plugins: Vec<Plugin>,
    filters: Vec<Filter>,
    resolver: Box<dyn Lookup>,
}

/// The tracer core: owner of the process registry, the plugin and filter
/// lists and the one recursive lock that makes the instrumentation hooks
/// safe under arbitrary multithreading.
///
/// A process has at most one installed tracer ([`Tracer::install`]); the
/// compiler-injected hooks reach it through [`Tracer::interface`].
pub struct Tracer {
    state: ReentrantMutex<RefCell<State>>,
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer").finish_non_exhaustive()
    }
}

impl Tracer {
    #[must_use]
    pub fn new() -> Self {
        Self::with_resolver(Box::new(Resolver::new()))
    }

    /// Create a tracer with a custom source-location resolver.
    #[must_use]
    pub fn with_resolver(resolver: Box<dyn Lookup>) -> Self {
        Self {
            state: ReentrantMutex::new(RefCell::new(State {
                registry: Registry::new(),
                plugins: Vec::new(),
                filters: Vec::new(),
                resolver,
            })),
        }
    }

    /// Install this tracer as the process-wide interface.
    ///
    /// # Errors
    ///
    /// Returns an `Err` when an interface is already installed.
    pub fn install(self) -> Result<&'static Self> {
        TRACER
            .set(self)
            .map_err(|_| Error::already_registered("tracer interface"))?;

        TRACER
            .get()
            .ok_or_else(|| Error::logic("installed interface not found"))
    }

    /// Get the installed interface.
    ///
    /// Returns `None` until a tracer is installed and the executable's
    /// symbols are loaded; the hooks treat that window as a no-op.
    #[must_use]
    pub fn interface() -> Option<&'static Self> {
        let tracer = TRACER.get()?;

        let ready = tracer.with_state(|st| {
            st.registry.module_count() > 0 && st.registry.symbol_count() > 0
        });

        ready.then_some(tracer)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        f(&mut st)
    }

    /// Load the symbol table of a module and add it to the registry.
    ///
    /// # Errors
    ///
    /// Returns an `Err` when the symbol table cannot be loaded.
    pub fn add_module(&self, path: &str, base: MemAddr) -> Result<()> {
        self.with_state(|st| st.registry.add_module(path, base))
    }

    #[must_use]
    pub fn module_count(&self) -> usize {
        self.with_state(|st| st.registry.module_count())
    }

    #[must_use]
    pub fn symbol_count(&self) -> usize {
        self.with_state(|st| st.registry.symbol_count())
    }

    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.with_state(|st| st.registry.thread_count())
    }

    /// Spawn a named, instrumented thread registered with the core.
    ///
    /// # Errors
    ///
    /// Returns an `Err` when the spawn or the registration fails.
    pub fn fork_thread<F>(&self, nm: &str, entry: F) -> Result<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        self.with_state(|st| st.registry.fork_thread(nm, entry))
    }

    /// Release the state of an exited or cancelled thread.
    pub fn cleanup_thread(&self, id: Handle) {
        self.with_state(|st| st.registry.cleanup_thread(id));
    }

    /// Release the state of every finished thread with an empty stack.
    pub fn cleanup_zombies(&self) {
        self.with_state(|st| st.registry.cleanup_zombies());
    }

    fn record_call(&self, addr: MemAddr, site: MemAddr) {
        self.with_state(|st| {
            st.registry.current_thread().called(addr, site, None);
        });
    }

    fn record_return(&self) {
        self.with_state(|st| {
            st.registry.current_thread().returned();
        });
    }

    /// Call all plugin enter callbacks in the order they were registered.
    ///
    /// The callbacks run outside the critical section; a panicking plugin
    /// is reported and does not stop the fan-out.
    fn begin_plugins(&self, addr: MemAddr, site: MemAddr) {
        let mut i = 0;
        loop {
            let begin =
                self.with_state(|st| st.plugins.get(i).map(Plugin::begin_fn));
            let Some(begin) = begin else {
                break;
            };

            if catch_unwind(|| begin(addr, site)).is_err() {
                log::error!("plugin {i}: panic in the enter callback");
            }

            i += 1;
        }
    }

    /// Call all plugin exit callbacks in the reverse order they were
    /// registered.
    fn end_plugins(&self, addr: MemAddr, site: MemAddr) {
        let mut i = self.with_state(|st| st.plugins.len());
        while i > 0 {
            i -= 1;

            let end = self.with_state(|st| st.plugins.get(i).map(Plugin::end_fn));
            let Some(end) = end else {
                continue;
            };

            if catch_unwind(|| end(addr, site)).is_err() {
                log::error!("plugin {i}: panic in the exit callback");
            }
        }
    }

    /// Register a plugin.
    ///
    /// # Errors
    ///
    /// Returns an `Err` when a DSO plugin with the same path is already
    /// registered.
    pub fn add_plugin(&self, plg: Plugin) -> Result<()> {
        self.with_state(|st| {
            if let Some(path) = plg.path() {
                if st.plugins.iter().any(|p| p.path() == Some(path)) {
                    return Err(Error::already_registered(format!(
                        "plugin '{path}'"
                    )));
                }
            }

            st.plugins.push(plg);
            Ok(())
        })
    }

    #[must_use]
    pub fn plugin_count(&self) -> usize {
        self.with_state(|st| st.plugins.len())
    }

    /// Unregister a plugin module (DSO) by path.
    pub fn remove_plugin(&self, path: &str) {
        self.with_state(|st| {
            if let Some(i) =
                st.plugins.iter().position(|p| p.path() == Some(path))
            {
                st.plugins.remove(i);
            }
        });
    }

    /// Unregister a plugin by registration index.
    ///
    /// # Errors
    ///
    /// Returns an `Err` when the index is past the plugin count.
    pub fn remove_plugin_at(&self, i: usize) -> Result<()> {
        self.with_state(|st| {
            if i >= st.plugins.len() {
                return Err(Error::out_of_bounds(i, st.plugins.len()));
            }

            st.plugins.remove(i);
            Ok(())
        })
    }

    /// Unregister all plugins.
    pub fn remove_all_plugins(&self) {
        self.with_state(|st| st.plugins.clear());
    }

    /// Register a filter.
    pub fn add_filter(&self, flt: Filter) {
        self.with_state(|st| st.filters.push(flt));
    }

    #[must_use]
    pub fn filter_count(&self) -> usize {
        self.with_state(|st| st.filters.len())
    }

    /// Unregister a filter by registration index.
    ///
    /// # Errors
    ///
    /// Returns an `Err` when the index is past the filter count.
    pub fn remove_filter(&self, i: usize) -> Result<()> {
        self.with_state(|st| {
            if i >= st.filters.len() {
                return Err(Error::out_of_bounds(i, st.filters.len()));
            }

            st.filters.remove(i);
            Ok(())
        })
    }

    /// Apply all module filters, in registration order, to a module path.
    #[must_use]
    pub fn apply_module_filters(&self, path: &str) -> bool {
        self.with_state(|st| {
            st.filters
                .iter()
                .filter(|flt| flt.mode() == Mode::Module)
                .any(|flt| flt.apply(path))
        })
    }

    /// Apply all symbol filters, in registration order, to a name.
    #[must_use]
    pub fn apply_symbol_filters(&self, nm: &str) -> bool {
        self.with_state(|st| {
            st.filters
                .iter()
                .filter(|flt| flt.mode() == Mode::Symbol)
                .any(|flt| flt.apply(nm))
        })
    }

    /// Create a stack trace of the current thread and append it to `dst`.
    ///
    /// The simulated stack is reconciled (unwound) first, and also when
    /// the method fails in any way to produce the trace, so no stale
    /// exception frames are left behind.
    ///
    /// # Errors
    ///
    /// Returns an `Err` when rendering fails.
    pub fn trace(&self, dst: &mut String) -> Result<()> {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        let st = &mut *st;

        let id = {
            let thr = st.registry.current_thread();
            thr.unwind();
            thr.handle()
        };

        let result = render(&mut st.registry, st.resolver.as_mut(), id, dst);
        if result.is_err() {
            st.registry.current_thread().unwind();
        }

        result
    }

    /// Create the stack trace of the thread with the given handle and
    /// append it to `dst`. The stack is snapshotted, not unwound; an
    /// unknown handle appends nothing.
    ///
    /// # Errors
    ///
    /// Returns an `Err` when rendering fails.
    pub fn trace_thread(&self, dst: &mut String, id: Handle) -> Result<()> {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        let st = &mut *st;

        render(&mut st.registry, st.resolver.as_mut(), id, dst)
    }

    /// Create stack traces of every known thread, separated by a blank
    /// line. No stack is unwound.
    ///
    /// # Errors
    ///
    /// Returns an `Err` when rendering fails.
    pub fn dump(&self, dst: &mut String) -> Result<()> {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        let st = &mut *st;

        let count = st.registry.thread_count();
        for i in 0..count {
            let id = st.registry.get_thread_at(i)?.handle();
            render(&mut st.registry, st.resolver.as_mut(), id, dst)?;

            if i < count - 1 {
                dst.push_str("\r\n");
            }
        }

        Ok(())
    }

    /// Unwind the simulated call stack of the current thread, discarding
    /// a pending exception trace.
    pub fn unwind(&self) {
        self.with_state(|st| st.registry.current_thread().unwind());
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

/// Render one thread's stack trace. Frames go top (innermost) to bottom;
/// each frame's source location comes from its call site resolved in the
/// caller frame's module, so the deepest frame renders bare.
fn render(
    registry: &mut Registry,
    resolver: &mut dyn Lookup,
    id: Handle,
    dst: &mut String,
) -> Result<()> {
    let (nm, frames) = {
        let Some(thr) = registry.get_thread(id) else {
            return Ok(());
        };

        let frames: Vec<Call> = thr.frames().iter().rev().cloned().collect();
        (thr.name().unwrap_or("anonymous").to_string(), frames)
    };

    write!(dst, "at '{nm}' thread ({id:#x}) {{\r\n")?;

    let mut resolved: Vec<(usize, String)> = Vec::new();
    for (i, frame) in frames.iter().enumerate() {
        let nm = match frame.name() {
            Some(nm) => Some(nm.to_string()),
            None => registry.lookup(frame.addr()).map(str::to_string),
        };

        match nm {
            Some(nm) => {
                if frame.name().is_none() {
                    resolved.push((i, nm.clone()));
                }

                write!(dst, "  at {nm}")?;
            }
            None => {
                if cfg!(feature = "unresolved") {
                    dst.push_str("  at UNRESOLVED");
                } else {
                    continue;
                }
            }
        }

        if let Some(caller) = frames.get(i + 1) {
            if let Some((path, base)) = registry.inverse_lookup(caller.addr()) {
                match resolver.addr2line(path, frame.site().wrapping_sub(base)) {
                    Ok(Some(info)) if !info.is_empty() && info != "??:0" => {
                        write!(dst, " ({info})")?;
                    }
                    Ok(_) => (),
                    Err(x) => log::debug!(
                        "no debug info for {:#x} in '{path}' ({x:?})",
                        frame.site()
                    ),
                }
            }
        }

        dst.push_str("\r\n");
    }

    dst.push_str("}\r\n");

    // Populate the advisory name caches for the next rendering.
    if !resolved.is_empty() {
        if let Some(thr) = registry.get_thread_mut(id) {
            for (i, nm) in resolved {
                thr.set_frame_name(i, &nm)?;
            }
        }
    }

    Ok(())
}

fn fatal(hook: &str) -> ! {
    log::error!("fatal tracer error in the {hook} hook");
    process::exit(libc::EXIT_FAILURE);
}

/// The enter instrumentation entry point.
///
/// Fans the event out to the registered plugins, then records the call on
/// the calling thread's simulated stack. A failure past the plugin stage
/// aborts the process: continuing with a corrupt simulated stack would
/// silently produce misleading traces.
pub fn enter(addr: MemAddr, site: MemAddr) {
    // An instrumented function may run during library startup; before the
    // interface is installed and populated the hooks are no-ops.
    let Some(tracer) = Tracer::interface() else {
        return;
    };

    tracer.begin_plugins(addr, site);

    if catch_unwind(AssertUnwindSafe(|| tracer.record_call(addr, site))).is_err()
    {
        fatal("enter");
    }
}

/// The exit instrumentation entry point, symmetric to [`enter`]: plugins
/// fan out in reverse registration order, then the call is retired from
/// the simulated stack.
pub fn exit(addr: MemAddr, site: MemAddr) {
    let Some(tracer) = Tracer::interface() else {
        return;
    };

    tracer.end_plugins(addr, site);

    if catch_unwind(AssertUnwindSafe(|| tracer.record_return())).is_err() {
        fatal("exit");
    }
}

/// In code compiled with `-finstrument-functions`, the compiler injects a
/// call to this function at the beginning of every instrumented function.
/// The pointers are treated as opaque addresses and never dereferenced.
#[no_mangle]
pub extern "C" fn __cyg_profile_func_enter(
    this_fn: *mut c_void,
    call_site: *mut c_void,
) {
    enter(this_fn as usize as MemAddr, call_site as usize as MemAddr);
}

/// In code compiled with `-finstrument-functions`, the compiler injects a
/// call to this function at the end of every instrumented function.
/// The pointers are treated as opaque addresses and never dereferenced.
#[no_mangle]
pub extern "C" fn __cyg_profile_func_exit(
    this_fn: *mut c_void,
    call_site: *mut c_void,
) {
    exit(this_fn as usize as MemAddr, call_site as usize as MemAddr);
}
