//! Scheduling state of the QK kernel.
//!
//! [`QkScheduler`] holds the ready set together with the priority of the
//! run-to-completion step in progress and the scheduler-lock ceiling. It
//! only makes decisions; running the chosen active object is the
//! activator's job in [`crate::kernel`].
//!
//! Every method takes a [`CriticalSection`] token, so a decision and the
//! state change that follows from it always happen in one critical section.
//!
//! Interrupt nesting is tracked per thread: on a hosted target an interrupt
//! is whatever a thread runs between `isr_entry` and `isr_exit`, and other
//! threads keep running at task level meanwhile.

use core::cell::{Cell, RefCell};

use critical_section::{CriticalSection, Mutex};
use qf::{PrioSet, MAX_ACTIVE};

const MODULE: &str = "qk_sched";

thread_local! {
    static INT_NEST: Cell<u8> = const { Cell::new(0) };
}

fn int_nest() -> u8 {
    INT_NEST.with(Cell::get)
}

/// Result of [`QkScheduler::lock`], handed back to [`QkScheduler::unlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedStatus {
    /// The ceiling was raised; `prev_prio` is restored on unlock.
    Locked { prev_prio: u8 },
    /// The requested ceiling did not exceed the current one.
    Unlocked,
}

impl SchedStatus {
    pub fn is_locked(self) -> bool {
        matches!(self, Self::Locked { .. })
    }
}

#[derive(Debug, Default)]
struct State {
    ready: PrioSet,
    /// Priority of the step in progress; 0 when idle.
    act_prio: u8,
    lock_prio: u8,
    /// An ISR made a higher priority ready while a step was running.
    pend: bool,
    launched: bool,
}

impl State {
    fn sched(&self) -> Option<u8> {
        self.ready
            .find_max()
            .filter(|&p| p > self.act_prio && p > self.lock_prio)
    }
}

pub struct QkScheduler {
    state: Mutex<RefCell<State>>,
}

impl Default for QkScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl QkScheduler {
    /// Creates a scheduler locked at the top priority. Nothing is activated
    /// until [`launch`](QkScheduler::launch).
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(State {
                lock_prio: MAX_ACTIVE,
                ..State::default()
            })),
        }
    }

    /// Releases the startup lock. Returns `false` if already launched.
    pub fn launch(&self, cs: CriticalSection<'_>) -> bool {
        let mut state = self.state.borrow_ref_mut(cs);
        if state.launched {
            return false;
        }
        state.launched = true;
        state.lock_prio = 0;
        true
    }

    pub fn mark_ready(&self, cs: CriticalSection<'_>, prio: u8) {
        self.state.borrow_ref_mut(cs).ready.insert(prio);
    }

    pub fn mark_not_ready(&self, cs: CriticalSection<'_>, prio: u8) {
        self.state.borrow_ref_mut(cs).ready.remove(prio);
    }

    pub fn is_ready(&self, cs: CriticalSection<'_>, prio: u8) -> bool {
        self.state.borrow_ref(cs).ready.contains(prio)
    }

    pub fn ready_set(&self, cs: CriticalSection<'_>) -> PrioSet {
        self.state.borrow_ref(cs).ready
    }

    /// Highest ready priority allowed to preempt the current step, if any.
    pub fn sched(&self, cs: CriticalSection<'_>) -> Option<u8> {
        self.state.borrow_ref(cs).sched()
    }

    /// Picks the next priority to run and makes it the active one, but only
    /// from task level while no step is in progress. The caller must then
    /// run the activator.
    pub fn claim(&self, cs: CriticalSection<'_>) -> Option<u8> {
        let mut state = self.state.borrow_ref_mut(cs);
        if int_nest() != 0 || state.act_prio != 0 {
            return None;
        }
        let next = state.sched()?;
        state.act_prio = next;
        log::trace!("sched next {next} (idle)");
        Some(next)
    }

    /// Called by the activator after a step of `done` completed. Either
    /// commits the next priority to run or returns the CPU to idle.
    pub fn next_after(&self, cs: CriticalSection<'_>, done: u8) -> Option<u8> {
        let mut state = self.state.borrow_ref_mut(cs);
        q_assert!(300, state.act_prio == done);

        // steps are started from idle, so anything above the lock may run
        state.act_prio = 0;
        // a finished step has serviced any pended preemption
        state.pend = false;
        match state.sched() {
            Some(next) => {
                state.act_prio = next;
                log::trace!("sched next {next} ({done})");
                Some(next)
            }
            None => {
                log::trace!("sched idle ({done})");
                None
            }
        }
    }

    /// Raises the lock ceiling to `ceiling`.
    pub fn lock(&self, cs: CriticalSection<'_>, ceiling: u8) -> SchedStatus {
        q_require!(400, int_nest() == 0);
        let mut state = self.state.borrow_ref_mut(cs);

        let ceiling = ceiling.min(MAX_ACTIVE);
        if ceiling <= state.lock_prio {
            return SchedStatus::Unlocked;
        }
        let status = SchedStatus::Locked {
            prev_prio: state.lock_prio,
        };
        log::trace!(
            "sched lock {} -> {ceiling} (holder {})",
            state.lock_prio,
            state.act_prio
        );
        state.lock_prio = ceiling;
        status
    }

    /// Restores the ceiling saved in `status`.
    pub fn unlock(&self, cs: CriticalSection<'_>, status: SchedStatus) {
        let SchedStatus::Locked { prev_prio } = status else {
            return;
        };
        q_require!(500, int_nest() == 0);
        let mut state = self.state.borrow_ref_mut(cs);
        q_require!(510, state.lock_prio > prev_prio);
        log::trace!("sched unlock {} -> {prev_prio}", state.lock_prio);
        state.lock_prio = prev_prio;
    }

    pub fn lock_prio(&self, cs: CriticalSection<'_>) -> u8 {
        self.state.borrow_ref(cs).lock_prio
    }

    /// Enters interrupt context on the calling thread.
    pub fn isr_entry(&self) {
        INT_NEST.with(|nest| {
            q_assert!(600, nest.get() < u8::MAX);
            nest.set(nest.get() + 1);
        });
    }

    /// Leaves interrupt context.
    ///
    /// When the outermost ISR returns and a higher priority became ready,
    /// this either claims the CPU (nothing running; the caller activates the
    /// returned priority) or leaves preemption pending for the activator of
    /// the step in progress.
    pub fn isr_exit(&self, cs: CriticalSection<'_>) -> Option<u8> {
        let nest = int_nest();
        q_require!(610, nest > 0);
        INT_NEST.with(|n| n.set(nest - 1));
        if nest > 1 {
            return None;
        }

        {
            let mut state = self.state.borrow_ref_mut(cs);
            if state.act_prio != 0 {
                if let Some(next) = state.sched() {
                    state.pend = true;
                    log::trace!("preemption pended: {next} over {}", state.act_prio);
                }
                return None;
            }
        }
        self.claim(cs)
    }

    /// `true` while the calling thread is in interrupt context.
    pub fn in_isr(&self) -> bool {
        int_nest() != 0
    }

    pub fn active_prio(&self, cs: CriticalSection<'_>) -> u8 {
        self.state.borrow_ref(cs).act_prio
    }

    pub fn preemption_pending(&self, cs: CriticalSection<'_>) -> bool {
        self.state.borrow_ref(cs).pend
    }
}
