//! Nestable critical sections.
//!
//! All state shared between priority levels and interrupt context (ready
//! set, queue ring indices, event reference counters, time event counters)
//! lives in [`critical_section::Mutex`] cells and is only touched from
//! inside a critical section with an O(1) body. On a hosted target the
//! `std` implementation of `critical-section` stands in for interrupt
//! masking: a process-wide lock with per-thread reentrancy.
//!
//! A critical section is entered either through [`with`] or by holding a
//! [`CritGuard`]. Both record the state that was in effect on entry and
//! restore exactly that state on exit, so a nested section never releases
//! an outer one. The guard also releases on unwind, which keeps the kernel
//! usable after a fatal assertion in a test harness.

use core::cell::Cell;
use core::marker::PhantomData;

use critical_section::{CriticalSection, RestoreState};

thread_local! {
    static NESTING: Cell<usize> = const { Cell::new(0) };
}

/// RAII token for an entered critical section.
///
/// Guards must be dropped in the reverse order of creation, which scoped
/// use guarantees.
pub struct CritGuard {
    state: RestoreState,
    _not_send: PhantomData<*mut ()>,
}

impl CritGuard {
    /// Enters a critical section, saving the previous state.
    pub fn enter() -> Self {
        // SAFETY: the matching `release` happens in `Drop` with this token.
        let state = unsafe { critical_section::acquire() };
        NESTING.with(|n| n.set(n.get() + 1));
        Self {
            state,
            _not_send: PhantomData,
        }
    }

    /// Proof of being inside the section, for `critical_section::Mutex`.
    pub fn token(&self) -> CriticalSection<'_> {
        // SAFETY: the token cannot outlive the guard.
        unsafe { CriticalSection::new() }
    }
}

impl Drop for CritGuard {
    fn drop(&mut self) {
        NESTING.with(|n| n.set(n.get() - 1));
        // SAFETY: `state` came from the `acquire` in `enter`.
        unsafe { critical_section::release(self.state) }
    }
}

/// Runs `f` inside a critical section.
#[inline]
pub fn with<R>(f: impl FnOnce(CriticalSection<'_>) -> R) -> R {
    let guard = CritGuard::enter();
    f(guard.token())
}

/// Critical-section nesting depth of the calling thread.
pub fn nesting() -> usize {
    NESTING.with(Cell::get)
}

/// Returns `true` while the calling thread is inside a critical section.
pub fn is_active() -> bool {
    nesting() != 0
}
