//! Active object abstraction.
//!
//! An active object couples a [`StateMachine`], an [`EventQueue`] and a
//! unique priority. The kernel owns the scheduling; this module provides
//! the object itself, the run-to-completion contract, and the
//! [`ActiveContext`] through which a state machine talks back to the kernel
//! while it handles an event.

use core::cell::RefCell;
use core::sync::atomic::{AtomicU8, Ordering};
use std::any::Any;
use std::sync::Arc;

use critical_section::{CriticalSection, Mutex};

use crate::critical;
use crate::event::{gc, DynPayload, EventRef, Signal};
use crate::pool::PoolTable;
use crate::queue::{EventQueue, Margin};
use crate::time::{TimeEvent, TimerWheel};
use crate::MAX_ACTIVE;

const MODULE: &str = "qf_active";

/// Outcome of a single dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    Handled,
    Ignored,
    Transition,
}

/// Trait implemented by application state machines.
///
/// `dispatch` runs to completion: it must not block and it always returns.
/// The kernel never dispatches the same object reentrantly and never calls
/// it from inside a critical section.
pub trait StateMachine: Send + 'static {
    /// Top-most initial transition, taken once when the object is started.
    fn init(&mut self, _ctx: &mut ActiveContext<'_>, _initial: Option<&EventRef>) {}

    fn dispatch(&mut self, ctx: &mut ActiveContext<'_>, event: &EventRef) -> DispatchResult;
}

/// Kernel operations available to running state machines.
pub trait KernelServices: Send + Sync {
    /// Posts `event` FIFO to the object at `target`.
    fn post(&self, target: u8, event: EventRef, margin: Margin) -> bool;

    /// Posts `event` to the head of the queue of the object at `target`.
    fn post_lifo(&self, target: u8, event: EventRef);

    /// Delivers `event` to every subscriber of its signal.
    fn publish(&self, event: EventRef, sender: u8);

    fn subscribe(&self, prio: u8, signal: Signal);
    fn unsubscribe(&self, prio: u8, signal: Signal);
    fn unsubscribe_all(&self, prio: u8);

    fn timers(&self) -> &TimerWheel;
    fn pools(&self) -> &PoolTable;
}

/// Per-dispatch context passed to state machines.
pub struct ActiveContext<'a> {
    prio: u8,
    services: &'a dyn KernelServices,
}

impl<'a> ActiveContext<'a> {
    pub fn new(prio: u8, services: &'a dyn KernelServices) -> Self {
        Self { prio, services }
    }

    /// Priority of the object being dispatched.
    pub fn prio(&self) -> u8 {
        self.prio
    }

    /// Posts an event that must be delivered.
    pub fn post(&self, target: u8, event: EventRef) {
        self.services.post(target, event, Margin::Guaranteed);
    }

    /// Posts an event with an explicit margin; `false` when rejected.
    pub fn post_x(&self, target: u8, event: EventRef, margin: Margin) -> bool {
        self.services.post(target, event, margin)
    }

    /// Puts `event` at the head of this object's own queue.
    pub fn post_self_lifo(&self, event: EventRef) {
        self.services.post_lifo(self.prio, event);
    }

    pub fn publish(&self, event: EventRef) {
        self.services.publish(event, self.prio);
    }

    pub fn subscribe(&self, signal: Signal) {
        self.services.subscribe(self.prio, signal);
    }

    pub fn unsubscribe(&self, signal: Signal) {
        self.services.unsubscribe(self.prio, signal);
    }

    pub fn unsubscribe_all(&self) {
        self.services.unsubscribe_all(self.prio);
    }

    /// Arms `te` to post to this object.
    pub fn arm(&self, te: &Arc<TimeEvent>, n_ticks: u32, interval: u32) {
        self.services.timers().arm(te, self.prio, n_ticks, interval);
    }

    pub fn rearm(&self, te: &Arc<TimeEvent>, n_ticks: u32) -> bool {
        self.services.timers().rearm(te, n_ticks)
    }

    pub fn disarm(&self, te: &TimeEvent) -> bool {
        te.disarm()
    }

    /// Allocates a pool event; see [`PoolTable::new_event`].
    pub fn new_event<T: Any + Send + Sync>(
        &self,
        signal: Signal,
        payload: T,
        margin: Margin,
    ) -> Option<EventRef> {
        let size = core::mem::size_of::<T>();
        self.services
            .pools()
            .new_event_dyn(signal, Some(Arc::new(payload) as DynPayload), size, margin)
    }

    /// Parks `event` in `queue` for later [`recall`](ActiveContext::recall).
    ///
    /// Returns `false` when the deferred queue is full.
    pub fn defer(&self, queue: &mut EventQueue, event: &EventRef) -> bool {
        let deferred = critical::with(|cs| queue.post(cs, event, Margin::Slots(0)));
        if !deferred {
            log::debug!("prio {} could not defer {}", self.prio, event.signal());
        }
        deferred
    }

    /// Moves the oldest deferred event to the head of this object's queue.
    ///
    /// Returns `false` when nothing was deferred.
    pub fn recall(&self, queue: &mut EventQueue) -> bool {
        let Some(event) = critical::with(|_| queue.get()) else {
            return false;
        };

        self.services.post_lifo(self.prio, event.clone());

        // the reference held by the deferred queue moved to the active queue
        critical::with(|cs| event.dec_ref(cs));
        true
    }

    /// Discards every deferred event. Returns how many were discarded.
    pub fn flush_deferred(&self, queue: &mut EventQueue) -> usize {
        let flushed = critical::with(|_| queue.drain());
        for event in &flushed {
            gc(event);
        }
        flushed.len()
    }
}

/// An active object.
pub struct ActiveObject {
    name: &'static str,
    prio: AtomicU8,
    queue: Mutex<RefCell<Option<EventQueue>>>,
    machine: parking_lot::Mutex<Box<dyn StateMachine>>,
}

impl ActiveObject {
    pub fn new<M: StateMachine>(name: &'static str, machine: M) -> Arc<Self> {
        Arc::new(Self {
            name,
            prio: AtomicU8::new(0),
            queue: Mutex::new(RefCell::new(None)),
            machine: parking_lot::Mutex::new(Box::new(machine)),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Priority assigned at start; 0 while not started.
    pub fn prio(&self) -> u8 {
        self.prio.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.prio() != 0
    }

    /// Gives the object its priority and a fresh queue of length `queue_len`.
    pub fn attach(&self, cs: CriticalSection<'_>, prio: u8, queue_len: u16) {
        q_require!(100, (1..=MAX_ACTIVE).contains(&prio));
        let mut queue = self.queue.borrow_ref_mut(cs);
        q_require!(110, queue.is_none());
        *queue = Some(EventQueue::new(queue_len));
        self.prio.store(prio, Ordering::Release);
    }

    /// Takes the queue back; the caller releases whatever is left in it.
    pub fn detach(&self, cs: CriticalSection<'_>) -> Option<EventQueue> {
        self.prio.store(0, Ordering::Release);
        self.queue.borrow_ref_mut(cs).take()
    }

    /// Runs `f` on the object's queue. Fatal if the object is not started.
    pub fn with_queue<R>(
        &self,
        cs: CriticalSection<'_>,
        f: impl FnOnce(&mut EventQueue) -> R,
    ) -> R {
        let mut queue = self.queue.borrow_ref_mut(cs);
        match queue.as_mut() {
            Some(queue) => f(queue),
            None => q_error!(120),
        }
    }

    pub fn init(&self, ctx: &mut ActiveContext<'_>, initial: Option<&EventRef>) {
        let mut machine = self.lock_machine();
        machine.init(ctx, initial);
    }

    /// Dispatches one event to the state machine.
    pub fn dispatch(&self, ctx: &mut ActiveContext<'_>, event: &EventRef) -> DispatchResult {
        let mut machine = self.lock_machine();
        machine.dispatch(ctx, event)
    }

    fn lock_machine(&self) -> parking_lot::MutexGuard<'_, Box<dyn StateMachine>> {
        q_require!(200, !critical::is_active());
        match self.machine.try_lock() {
            Some(machine) => machine,
            // another dispatch of the same object is in progress
            None => q_error!(210),
        }
    }
}

impl core::fmt::Debug for ActiveObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ActiveObject")
            .field("name", &self.name)
            .field("prio", &self.prio())
            .finish()
    }
}

/// Convenience behavior for state machines that only react to signals.
pub trait SignalHandler: Send + 'static {
    fn on_init(&mut self, _ctx: &mut ActiveContext<'_>) {}
    fn on_signal(&mut self, ctx: &mut ActiveContext<'_>, signal: Signal);
}

impl<T: SignalHandler> StateMachine for T {
    fn init(&mut self, ctx: &mut ActiveContext<'_>, _initial: Option<&EventRef>) {
        SignalHandler::on_init(self, ctx);
    }

    fn dispatch(&mut self, ctx: &mut ActiveContext<'_>, event: &EventRef) -> DispatchResult {
        SignalHandler::on_signal(self, ctx, event.signal());
        DispatchResult::Handled
    }
}
