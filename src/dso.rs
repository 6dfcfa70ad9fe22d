use findshlibs::{IterationControl, Segment, SharedLibrary, TargetSharedLibrary};
use procfs::process::Process;
use std::env;

use crate::{
    diag::Result,
    filter::{Filter, Mode},
    symbol::MemAddr,
    tracer::Tracer,
};

/// Environment variable selecting the shared objects that participate in
/// the call stack simulation: a colon-separated list of extended regular
/// expressions matched against each DSO's absolute path. Unset includes
/// every DSO, set-but-empty includes none.
pub const LIBS_ENV: &str = "INSTRUMENT_LIBS";

/// Initialize the tracer and install it as the process-wide interface.
///
/// Loads the executable's own symbol table at load base 0, then iterates
/// the loaded shared objects and adds every one the [`LIBS_ENV`] filter
/// selects. A failure for one DSO is logged and does not abort the
/// bootstrap.
///
/// # Errors
///
/// Returns an `Err` when the executable's symbol table cannot be loaded
/// or an interface is already installed.
pub fn bootstrap() -> Result<&'static Tracer> {
    let tracer = Tracer::new();

    let exe = Process::myself()?.exe()?;
    tracer.add_module(&exe.to_string_lossy(), 0)?;

    let filters = parse_filter_list(env::var(LIBS_ENV).ok().as_deref());
    discover(&tracer, filters.as_deref());

    let tracer = tracer.install()?;
    log::info!(
        "instrument-rs {} initialized ({} modules, {} symbols)",
        env!("CARGO_PKG_VERSION"),
        tracer.module_count(),
        tracer.symbol_count()
    );

    Ok(tracer)
}

/// Parse the DSO filter variable: `None` when it is unset (include all),
/// otherwise the compiled list of module filters (possibly empty,
/// including none). Expressions that do not compile are discarded with a
/// warning.
fn parse_filter_list(value: Option<&str>) -> Option<Vec<Filter>> {
    let value = value?;

    let filters = value
        .split(':')
        .filter(|expr| !expr.is_empty())
        .filter_map(|expr| match Filter::new(expr, false, Mode::Module) {
            Ok(flt) => Some(flt),
            Err(x) => {
                log::warn!("discarded DSO filter '{expr}' ({x:?})");
                None
            }
        })
        .collect();

    Some(filters)
}

/// Iterate the loaded shared objects and add the selected ones to the
/// registry, at load base = object address + first segment address.
fn discover(tracer: &Tracer, filters: Option<&[Filter]>) {
    TargetSharedLibrary::each(|dso| {
        let path = dso.name().to_string_lossy().into_owned();
        if path.is_empty() {
            return IterationControl::Continue;
        }

        let Some(segment) = dso.segments().next() else {
            log::warn!("'{path}' has 0 segments");
            return IterationControl::Continue;
        };

        if let Some(filters) = filters {
            if !filters.iter().any(|flt| flt.apply(&path)) {
                log::debug!("filtered out '{path}'");
                return IterationControl::Continue;
            }
        }

        let base = segment.actual_virtual_memory_address(dso).0 as MemAddr;
        if let Err(x) = tracer.add_module(&path, base) {
            log::warn!("skipped '{path}' ({x:?})");
        }

        IterationControl::Continue
    });
}

#[cfg(feature = "preload")]
#[ctor::ctor]
fn init() {
    let _ = env_logger::try_init();

    if let Err(x) = bootstrap() {
        log::error!("failed to initialize the tracer ({x:?})");
        std::process::exit(libc::EXIT_FAILURE);
    }
}

#[cfg(feature = "preload")]
#[ctor::dtor]
fn fini() {
    log::info!("instrument-rs {} finalized", env!("CARGO_PKG_VERSION"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_variable_includes_all() {
        assert!(parse_filter_list(None).is_none());
    }

    #[test]
    fn test_empty_variable_includes_none() {
        let filters = parse_filter_list(Some("")).expect("filter list");
        assert!(filters.is_empty());

        let filters = parse_filter_list(Some(":")).expect("filter list");
        assert!(filters.is_empty());
    }

    #[test]
    fn test_filter_selection() {
        let filters =
            parse_filter_list(Some(r"libfoo\..*:libbar\..*")).expect("filters");
        assert_eq!(filters.len(), 2);

        let matches = |path: &str| filters.iter().any(|flt| flt.apply(path));
        assert!(matches("/usr/lib/libfoo.so.1"));
        assert!(matches("/usr/lib/libbar.so.2"));
        assert!(!matches("/usr/lib/libbaz.so.3"));
    }

    #[test]
    fn test_bad_expression_is_discarded() {
        let filters =
            parse_filter_list(Some(r"(broken:libfoo\..*")).expect("filters");
        assert_eq!(filters.len(), 1);
        assert!(filters[0].apply("/usr/lib/libfoo.so.1"));
    }
}
