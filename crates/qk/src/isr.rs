//! Interrupt context simulation.
//!
//! On a hosted target an "interrupt" is any code that brackets itself with
//! [`QkKernel::isr_entry`] and [`QkKernel::isr_exit`], typically through the
//! [`IsrGuard`] returned by [`QkKernel::isr`]. Posts made in between never
//! activate anything directly. When the outermost ISR returns, an idle CPU
//! is claimed right away; otherwise the preemption is left pending and the
//! step in progress hands over to the higher priority as soon as it
//! completes.

use core::marker::PhantomData;

use qf::critical;

use crate::kernel::QkKernel;

/// Interrupt context for as long as the guard lives.
#[must_use = "the interrupt ends when the guard is dropped"]
pub struct IsrGuard<'k> {
    kernel: &'k QkKernel,
    _not_send: PhantomData<*mut ()>,
}

impl Drop for IsrGuard<'_> {
    fn drop(&mut self) {
        self.kernel.isr_exit();
    }
}

impl QkKernel {
    /// Enters interrupt context until the returned guard is dropped.
    pub fn isr(&self) -> IsrGuard<'_> {
        self.isr_entry();
        IsrGuard {
            kernel: self,
            _not_send: PhantomData,
        }
    }

    pub fn isr_entry(&self) {
        self.sched.isr_entry();
    }

    pub fn isr_exit(&self) {
        if let Some(prio) = critical::with(|cs| self.sched.isr_exit(cs)) {
            self.activate(prio);
        }
    }

    pub fn in_isr(&self) -> bool {
        self.sched.in_isr()
    }
}
