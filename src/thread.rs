use libc::pthread_t;
use std::thread::panicking;

use crate::{
    call::Call,
    diag::{Error, Result},
    symbol::MemAddr,
};

/// The OS identity of a traced thread.
pub type Handle = pthread_t;

/// Lifecycle of a simulated thread.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Status {
    /// Created, no instrumented call observed yet.
    Init,
    /// Registered by an explicit fork, entry point not yet reached.
    PreEntry,
    /// At least one instrumented call observed.
    Started,
    /// The simulated stack has returned to depth zero after starting.
    Exited,
}

/// The simulated call stack of one OS thread.
///
/// The stack is maintained by the enter/exit hooks. While an unwind is in
/// progress the hooks do not mutate the stack; the depth difference
/// between the simulated and the real stack is tracked in `lag` and
/// reconciled by [`Thread::unwind`].
pub struct Thread {
    handle: Handle,
    name: Option<String>,
    stack: Vec<Call>,
    lag: i32,
    status: Status,
}

impl Thread {
    /// Create a state for the calling thread.
    #[must_use]
    pub fn new(nm: Option<&str>) -> Self {
        Self {
            handle: unsafe { libc::pthread_self() },
            name: nm.map(str::to_string),
            stack: Vec::new(),
            lag: 0,
            status: Status::Init,
        }
    }

    /// Create a state for an explicitly forked, named thread.
    #[must_use]
    pub fn with_handle(id: Handle, nm: &str) -> Self {
        Self {
            handle: id,
            name: Some(nm.to_string()),
            stack: Vec::new(),
            lag: 0,
            status: Status::PreEntry,
        }
    }

    #[must_use]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// The call depth difference between the simulated and the real call
    /// stack, the number of calls that must be popped off the simulated
    /// stack to match the real one.
    #[must_use]
    pub fn lag(&self) -> i32 {
        self.lag
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, nm: Option<&str>) {
        self.name = nm.map(str::to_string);
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.status
    }

    /// Size of the simulated call stack.
    #[must_use]
    pub fn call_depth(&self) -> usize {
        self.stack.len()
    }

    /// Peek at the simulated stack; offset 0 is the most recent call.
    ///
    /// # Errors
    ///
    /// Returns an `Err` when the offset is past the current call depth.
    pub fn backtrace(&self, i: usize) -> Result<&Call> {
        let depth = self.stack.len();
        self.stack
            .get(depth.wrapping_sub(1).wrapping_sub(i))
            .ok_or_else(|| Error::out_of_bounds(i, depth))
    }

    pub(crate) fn set_frame_name(&mut self, i: usize, nm: &str) -> Result<()> {
        let depth = self.stack.len();
        let frame = self
            .stack
            .get_mut(depth.wrapping_sub(1).wrapping_sub(i))
            .ok_or_else(|| Error::out_of_bounds(i, depth))?;

        frame.set_name(nm);
        Ok(())
    }

    /// Check if this state tracks the thread with the given handle.
    #[must_use]
    pub fn is(&self, id: Handle) -> bool {
        unsafe { libc::pthread_equal(self.handle, id) != 0 }
    }

    /// Check if this state tracks a thread with the given name.
    #[must_use]
    pub fn is_named(&self, nm: &str) -> bool {
        self.name.as_deref() == Some(nm)
    }

    /// Check if this state tracks the calling thread.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.is(unsafe { libc::pthread_self() })
    }

    /// Simulate a function call.
    pub fn called(&mut self, addr: MemAddr, site: MemAddr, nm: Option<&str>) {
        self.on_call(addr, site, nm, panicking());
    }

    /// Simulate a function return.
    pub fn returned(&mut self) {
        self.on_return(panicking());
    }

    fn on_call(
        &mut self,
        addr: MemAddr,
        site: MemAddr,
        nm: Option<&str>,
        unwinding: bool,
    ) {
        // An enter hook observed while an unwind is in progress belongs to
        // a frame the unwinder re-entered; the simulated stack stays put
        // and the drift is recorded.
        if unwinding {
            self.lag -= 1;
            return;
        }

        self.stack.push(Call::new(addr, site, nm));
        self.status = Status::Started;
    }

    fn on_return(&mut self, unwinding: bool) {
        // An exit hook fired by a frame the unwinder is tearing down: the
        // real stack shrinks but the simulated frame is kept so the
        // propagation path can still be rendered. The drift is absorbed
        // into the lag counter.
        if unwinding {
            self.lag += 1;
            return;
        }

        self.stack.pop();
        if self.stack.is_empty() && self.status == Status::Started {
            self.status = Status::Exited;
        }
    }

    /// Unwind the simulated call stack to meet the real call stack.
    ///
    /// A no-op when the two already agree (`lag == 0`).
    pub fn unwind(&mut self) {
        while self.lag > 0 {
            self.stack.pop();
            self.lag -= 1;
        }

        if self.stack.is_empty() && self.status == Status::Started {
            self.status = Status::Exited;
        }
    }

    pub(crate) fn frames(&self) -> &[Call] {
        &self.stack
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calls(thr: &mut Thread, addrs: &[MemAddr]) {
        for addr in addrs {
            thr.on_call(*addr, addr + 0x100, None, false);
        }
    }

    #[test]
    fn test_call_return_pairing() {
        let mut thr = Thread::new(None);
        assert_eq!(thr.status(), Status::Init);

        calls(&mut thr, &[0x10, 0x20, 0x30]);
        assert_eq!(thr.call_depth(), 3);
        assert_eq!(thr.status(), Status::Started);
        assert_eq!(thr.backtrace(0).expect("top frame").addr(), 0x30);
        assert_eq!(thr.backtrace(2).expect("bottom frame").addr(), 0x10);

        thr.on_return(false);
        thr.on_return(false);
        assert_eq!(thr.call_depth(), 1);
        assert_eq!(thr.status(), Status::Started);

        thr.on_return(false);
        assert_eq!(thr.call_depth(), 0);
        assert_eq!(thr.status(), Status::Exited);
        assert_eq!(thr.lag(), 0);
    }

    #[test]
    fn test_backtrace_out_of_bounds() {
        let thr = Thread::new(None);
        assert!(thr.backtrace(0).is_err());
    }

    #[test]
    fn test_unwind_noop_when_lag_zero() {
        let mut thr = Thread::new(None);
        calls(&mut thr, &[0x10, 0x20]);

        thr.unwind();
        assert_eq!(thr.call_depth(), 2);
        assert_eq!(thr.lag(), 0);
    }

    #[test]
    fn test_drift_transient_negative() {
        let mut thr = Thread::new(None);
        calls(&mut thr, &[0x10]);

        // Two enters observed while the unwinder is running: skipped, lag
        // goes negative.
        thr.on_call(0x20, 0x120, None, true);
        assert_eq!(thr.lag(), -1);
        thr.on_call(0x30, 0x130, None, true);
        assert_eq!(thr.lag(), -2);
        assert_eq!(thr.call_depth(), 1);

        // Their matching exits restore the balance without popping.
        thr.on_return(true);
        thr.on_return(true);
        assert_eq!(thr.lag(), 0);
        assert_eq!(thr.call_depth(), 1);
        assert_eq!(thr.backtrace(0).expect("frame").addr(), 0x10);
    }

    #[test]
    fn test_exception_reconciliation() {
        // f calls g calls h; h throws and f catches. The exits of h and g
        // fire while the unwind is in progress and are not popped; inside
        // a cleanup two more instrumented calls run and balance out.
        let mut thr = Thread::new(None);
        calls(&mut thr, &[0xf0, 0x60, 0x40]);

        thr.on_call(0x70, 0x170, None, true);
        thr.on_call(0x80, 0x180, None, true);
        assert_eq!(thr.lag(), -2);
        thr.on_return(true);
        thr.on_return(true);
        assert_eq!(thr.lag(), 0);

        // h and g unwound out from under us.
        thr.on_return(true);
        thr.on_return(true);
        assert_eq!(thr.lag(), 2);
        assert_eq!(thr.call_depth(), 3);

        // Reconcile before rendering: the simulated stack matches the
        // post-catch real stack, the catch frame alone.
        thr.unwind();
        assert_eq!(thr.lag(), 0);
        assert_eq!(thr.call_depth(), 1);
        assert_eq!(thr.backtrace(0).expect("catch frame").addr(), 0xf0);
    }

    #[test]
    fn test_identity() {
        let thr = Thread::new(Some("worker"));
        assert!(thr.is_current());
        assert!(thr.is_named("worker"));
        assert!(!thr.is_named("other"));

        let forked = Thread::with_handle(thr.handle() + 1, "forked");
        assert_eq!(forked.status(), Status::PreEntry);
        assert!(!forked.is(thr.handle()));
    }
}
