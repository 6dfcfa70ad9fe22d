use serial_test::serial;
use std::{os::unix::thread::JoinHandleExt, thread, time::Duration};

use instrument_rs::{
    dso,
    symtab::Table,
    tracer::{self, Tracer},
};

#[no_mangle]
pub extern "C" fn trace_alpha() {}

#[no_mangle]
pub extern "C" fn trace_bravo() {}

#[no_mangle]
pub extern "C" fn trace_charlie() {}

fn own_exe() -> String {
    std::env::current_exe()
        .expect("current_exe")
        .to_str()
        .expect("utf-8 path")
        .to_string()
}

fn interface() -> &'static Tracer {
    match Tracer::interface() {
        Some(tracer) => tracer,
        None => dso::bootstrap().expect("bootstrap"),
    }
}

#[test]
#[serial]
fn test_bootstrap_loads_executable() {
    let tracer = interface();
    assert!(tracer.module_count() >= 1);
    assert!(tracer.symbol_count() > 0);
}

#[test]
#[serial]
fn test_hooks_and_trace() {
    let iface = interface();

    let table = Table::build(&own_exe(), 0).expect("table");
    let alpha = table.name_to_addr("trace_alpha").expect("alpha");
    let bravo = table.name_to_addr("trace_bravo").expect("bravo");
    let charlie = table.name_to_addr("trace_charlie").expect("charlie");

    tracer::enter(alpha, 0);
    tracer::enter(bravo, alpha + 4);
    tracer::enter(charlie, bravo + 4);

    let mut buf = String::new();
    iface.trace(&mut buf).expect("trace");

    assert!(buf.starts_with("at 'anonymous' thread (0x"));
    assert!(buf.ends_with("}\r\n"));

    let c = buf.find("  at trace_charlie").expect("charlie line");
    let b = buf.find("  at trace_bravo").expect("bravo line");
    let a = buf.find("  at trace_alpha").expect("alpha line");
    assert!(c < b && b < a, "frames out of order:\n{buf}");

    tracer::exit(charlie, bravo + 4);
    tracer::exit(bravo, alpha + 4);
    tracer::exit(alpha, 0);

    buf.clear();
    iface.trace(&mut buf).expect("trace");
    assert!(buf.ends_with("{\r\n}\r\n"), "stack not empty:\n{buf}");
}

#[test]
#[serial]
fn test_dump_includes_forked_thread() {
    let iface = interface();

    let handle = iface
        .fork_thread("aux", || thread::sleep(Duration::from_millis(50)))
        .expect("fork");
    let id = handle.as_pthread_t();

    let mut buf = String::new();
    iface.dump(&mut buf).expect("dump");
    assert!(buf.contains("at 'aux' thread"), "missing thread:\n{buf}");

    handle.join().expect("join");
    iface.cleanup_thread(id);
}
