//! Signals and reference-counted events.
//!
//! Events travel between active objects by reference: every queue that holds
//! an event holds a clone of the same [`EventRef`]. Events obtained from an
//! [`EventPool`](crate::pool::EventPool) additionally carry a framework
//! reference counter, incremented on every enqueue and decremented by
//! [`gc`] on every consume. The block goes back to its pool exactly when the
//! last holder lets go. Events with pool id 0 are immutable: the framework
//! never touches their counter and never recycles them.

use core::cell::Cell;
use core::fmt;
use std::any::Any;
use std::ops::Deref;
use std::sync::Arc;

use critical_section::{CriticalSection, Mutex};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::critical;
use crate::pool::EventPool;

const MODULE: &str = "qf_evt";

/// Identifier for a signal.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signal(pub u16);

impl Signal {
    pub const EMPTY: Signal = Signal(0);
    pub const ENTRY: Signal = Signal(1);
    pub const EXIT: Signal = Signal(2);
    pub const INIT: Signal = Signal(3);
    /// First signal available to applications.
    pub const USER: Signal = Signal(4);

    pub const fn is_user(self) -> bool {
        self.0 >= Self::USER.0
    }
}

impl From<u16> for Signal {
    #[inline]
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIG({:#06x})", self.0)
    }
}

/// Type-erased event payload.
pub type DynPayload = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Default, Clone, Copy)]
struct RefState {
    ctr: u8,
    recycled: bool,
}

/// An event: a signal plus an optional payload.
pub struct Event {
    signal: Signal,
    payload: Option<DynPayload>,
    pool_id: u8,
    refs: Mutex<Cell<RefState>>,
    origin: Option<Arc<dyn EventPool>>,
}

impl Event {
    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// Id of the pool the event came from; 0 for immutable events.
    pub fn pool_id(&self) -> u8 {
        self.pool_id
    }

    pub fn is_dynamic(&self) -> bool {
        self.pool_id != 0
    }

    /// Downcasts the payload.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.as_deref().and_then(|p| p.downcast_ref::<T>())
    }

    pub fn dyn_payload(&self) -> Option<&DynPayload> {
        self.payload.as_ref()
    }

    /// Current framework reference count (always 0 for immutable events).
    pub fn ref_count(&self) -> u8 {
        critical::with(|cs| self.refs.borrow(cs).get().ctr)
    }

    /// Records one more holder. Called by queues on every successful insert.
    pub fn inc_ref(&self, cs: CriticalSection<'_>) {
        if self.is_dynamic() {
            let cell = self.refs.borrow(cs);
            let mut refs = cell.get();
            q_assert!(200, refs.ctr < u8::MAX && !refs.recycled);
            refs.ctr += 1;
            cell.set(refs);
        }
    }

    /// Drops one holder without recycling. The caller must know it is not
    /// the last one.
    pub fn dec_ref(&self, cs: CriticalSection<'_>) {
        if self.is_dynamic() {
            let cell = self.refs.borrow(cs);
            let mut refs = cell.get();
            q_assert!(210, refs.ctr > 1);
            refs.ctr -= 1;
            cell.set(refs);
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("signal", &self.signal)
            .field("pool_id", &self.pool_id)
            .field("ref_count", &self.ref_count())
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

/// Shared handle to an [`Event`].
#[derive(Clone)]
pub struct EventRef(Arc<Event>);

impl EventRef {
    /// Creates an immutable (pool id 0) event without payload.
    pub fn immutable(signal: Signal) -> Self {
        Self::build(signal, None, 0, None)
    }

    /// Creates an immutable (pool id 0) event carrying `payload`.
    pub fn immutable_with<T: Any + Send + Sync>(signal: Signal, payload: T) -> Self {
        Self::build(signal, Some(Arc::new(payload) as DynPayload), 0, None)
    }

    pub(crate) fn from_pool(
        signal: Signal,
        payload: Option<DynPayload>,
        pool_id: u8,
        origin: Arc<dyn EventPool>,
    ) -> Self {
        Self::build(signal, payload, pool_id, Some(origin))
    }

    fn build(
        signal: Signal,
        payload: Option<DynPayload>,
        pool_id: u8,
        origin: Option<Arc<dyn EventPool>>,
    ) -> Self {
        Self(Arc::new(Event {
            signal,
            payload,
            pool_id,
            refs: Mutex::new(Cell::new(RefState::default())),
            origin,
        }))
    }

    /// Returns `true` if both handles point to the same event.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl Deref for EventRef {
    type Target = Event;

    fn deref(&self) -> &Event {
        &self.0
    }
}

impl fmt::Debug for EventRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

/// Releases one reference to `event`.
///
/// Immutable events are ignored. For a pool event the counter is
/// decremented; when this was the last reference (or the event was never
/// referenced at all) the block is returned to its pool.
pub fn gc(event: &Event) {
    if !event.is_dynamic() {
        return;
    }

    let last = critical::with(|cs| {
        let cell = event.refs.borrow(cs);
        let mut refs = cell.get();
        q_assert!(400, !refs.recycled);
        if refs.ctr > 1 {
            refs.ctr -= 1;
            cell.set(refs);
            false
        } else {
            refs.ctr = 0;
            refs.recycled = true;
            cell.set(refs);
            true
        }
    });

    if last {
        log::trace!("gc {} pool={}", event.signal, event.pool_id);
        match &event.origin {
            Some(pool) => pool.put(event),
            None => q_error!(410),
        }
    }
}

/// Keeps a counted reference to a pool event beyond the current
/// run-to-completion step. Balance with [`delete_ref`].
pub fn new_ref(event: &EventRef) -> EventRef {
    q_require!(500, event.is_dynamic());
    critical::with(|cs| event.inc_ref(cs));
    event.clone()
}

/// Releases a reference obtained from [`new_ref`].
pub fn delete_ref(event: EventRef) {
    gc(&event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{EventPool, MemPool};
    use crate::queue::Margin;

    #[test]
    fn immutable_events_ignore_gc() {
        let e = EventRef::immutable(Signal(7));
        critical::with(|cs| e.inc_ref(cs));
        gc(&e);
        gc(&e);
        assert_eq!(e.ref_count(), 0);
        assert!(!e.is_dynamic());
    }

    #[test]
    fn payload_downcast() {
        let e = EventRef::immutable_with(Signal(9), 42u32);
        assert_eq!(e.payload::<u32>(), Some(&42));
        assert_eq!(e.payload::<i64>(), None);
        assert_eq!(e.signal().to_string(), "SIG(0x0009)");
    }

    #[test]
    fn last_reference_returns_block() {
        let pool: Arc<MemPool> = Arc::new(MemPool::new(16, 2));
        assert!(pool.get(Margin::Guaranteed));
        let e = EventRef::from_pool(Signal(5), None, 1, pool.clone());

        critical::with(|cs| {
            e.inc_ref(cs);
            e.inc_ref(cs);
        });
        gc(&e);
        assert_eq!(e.ref_count(), 1);
        assert_eq!(pool.stats().free_blocks, 1);

        gc(&e);
        assert_eq!(pool.stats().free_blocks, 2);
    }

    #[test]
    fn new_ref_keeps_event_alive() {
        let pool: Arc<MemPool> = Arc::new(MemPool::new(16, 1));
        assert!(pool.get(Margin::Guaranteed));
        let e = EventRef::from_pool(Signal(5), None, 1, pool.clone());
        critical::with(|cs| e.inc_ref(cs));

        let kept = new_ref(&e);
        gc(&e);
        assert_eq!(pool.stats().free_blocks, 0);

        delete_ref(kept);
        assert_eq!(pool.stats().free_blocks, 1);
    }

    #[test]
    #[should_panic(expected = "qf_evt:400")]
    fn double_release_is_fatal() {
        let pool: Arc<MemPool> = Arc::new(MemPool::new(16, 1));
        assert!(pool.get(Margin::Guaranteed));
        let e = EventRef::from_pool(Signal(5), None, 1, pool);
        gc(&e);
        gc(&e);
    }
}
