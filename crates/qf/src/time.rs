//! Time events.
//!
//! A [`TimeEvent`] carries an immutable event and a down-counter. Armed time
//! events are linked into the [`TimerWheel`] list of their tick rate; every
//! call to [`TimerWheel::tick`] decrements the linked counters and posts
//! the carried event when a counter reaches zero. Periodic time events
//! reload from their interval, one-shot ones unlink.
//!
//! Only the tick walk ever removes entries from the armed list. Disarming
//! just zeroes the counter and the walk unlinks the entry lazily, so a time
//! event may disarm (or re-arm) itself while its own post is in flight.
//! Freshly armed time events go to a staging list that the walk appends to
//! the armed list when it reaches the end, as part of the same pass.

use core::cell::{Cell, RefCell};
use std::any::Any;
use std::sync::Arc;

use critical_section::Mutex;

use crate::critical;
use crate::event::{EventRef, Signal};
use crate::MAX_ACTIVE;

const MODULE: &str = "qf_time";

#[derive(Debug, Default, Clone, Copy)]
struct TimerState {
    ctr: u32,
    interval: u32,
    target: u8,
    linked: bool,
    was_disarmed: bool,
}

pub struct TimeEvent {
    event: EventRef,
    tick_rate: u8,
    state: Mutex<Cell<TimerState>>,
}

impl TimeEvent {
    /// Creates a disarmed time event for `signal` at `tick_rate`.
    pub fn new(signal: Signal, tick_rate: u8) -> Arc<Self> {
        Self::build(EventRef::immutable(signal), tick_rate)
    }

    /// Like [`new`](TimeEvent::new), with a payload attached to the carried
    /// event.
    pub fn with_payload<T: Any + Send + Sync>(
        signal: Signal,
        tick_rate: u8,
        payload: T,
    ) -> Arc<Self> {
        Self::build(EventRef::immutable_with(signal, payload), tick_rate)
    }

    fn build(event: EventRef, tick_rate: u8) -> Arc<Self> {
        q_require!(300, event.signal().is_user());
        Arc::new(Self {
            event,
            tick_rate,
            state: Mutex::new(Cell::new(TimerState::default())),
        })
    }

    pub fn signal(&self) -> Signal {
        self.event.signal()
    }

    pub fn tick_rate(&self) -> u8 {
        self.tick_rate
    }

    /// The event posted on expiry.
    pub fn event(&self) -> &EventRef {
        &self.event
    }

    /// Priority of the active object the event is posted to; 0 until the
    /// first arming.
    pub fn target(&self) -> u8 {
        critical::with(|cs| self.state.borrow(cs).get().target)
    }

    pub fn is_armed(&self) -> bool {
        self.current_ctr() != 0
    }

    /// Ticks left until expiry, 0 when disarmed.
    pub fn current_ctr(&self) -> u32 {
        critical::with(|cs| self.state.borrow(cs).get().ctr)
    }

    /// Disarms the time event.
    ///
    /// Returns `true` if it was running. `false` means a one-shot already
    /// expired and its event is on its way to the target. Events already
    /// posted are never retracted.
    pub fn disarm(&self) -> bool {
        let was_armed = critical::with(|cs| {
            let cell = self.state.borrow(cs);
            let mut state = cell.get();
            let was_armed = state.ctr != 0;
            state.ctr = 0;
            state.was_disarmed = was_armed;
            cell.set(state);
            was_armed
        });
        if !was_armed {
            log::debug!("disarm attempt on expired {}", self.signal());
        }
        was_armed
    }

    /// Reports whether the last [`disarm`](TimeEvent::disarm) caught the
    /// time event running, then marks it as disarmed.
    pub fn was_disarmed(&self) -> bool {
        critical::with(|cs| {
            let cell = self.state.borrow(cs);
            let mut state = cell.get();
            let was_disarmed = state.was_disarmed;
            state.was_disarmed = true;
            cell.set(state);
            was_disarmed
        })
    }
}

impl core::fmt::Debug for TimeEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = critical::with(|cs| self.state.borrow(cs).get());
        f.debug_struct("TimeEvent")
            .field("signal", &self.signal())
            .field("tick_rate", &self.tick_rate)
            .field("ctr", &state.ctr)
            .field("interval", &state.interval)
            .field("target", &state.target)
            .finish()
    }
}

#[derive(Default)]
struct TickList {
    armed: Vec<Arc<TimeEvent>>,
    staged: Vec<Arc<TimeEvent>>,
}

enum Step {
    Done,
    Next,
    Fire(Arc<TimeEvent>, u8),
}

/// Armed time events, one list per tick rate.
pub struct TimerWheel {
    rates: Box<[Mutex<RefCell<TickList>>]>,
}

impl TimerWheel {
    pub fn new(tick_rates: u8) -> Self {
        Self {
            rates: (0..tick_rates)
                .map(|_| Mutex::new(RefCell::new(TickList::default())))
                .collect(),
        }
    }

    pub fn tick_rates(&self) -> u8 {
        self.rates.len() as u8
    }

    /// Arms `te` to post to the active object at `target` after `n_ticks`
    /// ticks, then every `interval` ticks (0 for one-shot).
    ///
    /// Arming a running time event is fatal; disarm it or use
    /// [`rearm`](TimerWheel::rearm).
    pub fn arm(&self, te: &Arc<TimeEvent>, target: u8, n_ticks: u32, interval: u32) {
        q_require!(
            400,
            n_ticks != 0
                && (1..=MAX_ACTIVE).contains(&target)
                && te.tick_rate < self.tick_rates()
        );

        critical::with(|cs| {
            let cell = te.state.borrow(cs);
            let mut state = cell.get();
            q_require!(410, state.ctr == 0);
            state.ctr = n_ticks;
            state.interval = interval;
            state.target = target;
            let link = !state.linked;
            state.linked = true;
            cell.set(state);

            if link {
                self.rates[usize::from(te.tick_rate)]
                    .borrow_ref_mut(cs)
                    .staged
                    .push(Arc::clone(te));
            }
        });
        log::trace!("arm {} n={n_ticks} interval={interval} target={target}", te.signal());
    }

    /// Reloads the counter with `n_ticks`, keeping the interval.
    ///
    /// Returns `true` if the time event was running. A disarmed time event
    /// is armed again for the target of its last arming.
    pub fn rearm(&self, te: &Arc<TimeEvent>, n_ticks: u32) -> bool {
        q_require!(600, n_ticks != 0 && te.tick_rate < self.tick_rates());

        critical::with(|cs| {
            let cell = te.state.borrow(cs);
            let mut state = cell.get();
            q_require!(610, state.target != 0);
            let was_armed = state.ctr != 0;
            let link = !state.linked;
            state.ctr = n_ticks;
            state.linked = true;
            cell.set(state);

            if link {
                self.rates[usize::from(te.tick_rate)]
                    .borrow_ref_mut(cs)
                    .staged
                    .push(Arc::clone(te));
            }
            was_armed
        })
    }

    /// Returns `true` if no time event is linked at `tick_rate`.
    ///
    /// A time event disarmed since the last tick still counts until that
    /// tick unlinks it.
    pub fn no_active(&self, tick_rate: u8) -> bool {
        q_require!(800, tick_rate < self.tick_rates());
        critical::with(|cs| {
            let list = self.rates[usize::from(tick_rate)].borrow_ref(cs);
            list.armed.is_empty() && list.staged.is_empty()
        })
    }

    /// Processes one tick at `tick_rate`.
    ///
    /// `post` receives the target priority and the carried event of every
    /// expiring time event, outside of any critical section.
    pub fn tick(&self, tick_rate: u8, mut post: impl FnMut(u8, &EventRef)) {
        q_require!(100, tick_rate < self.tick_rates());
        let list = &self.rates[usize::from(tick_rate)];

        // Entries before `keep` stay linked; entries in `keep..idx` were
        // unlinked during this walk and get truncated at the end.
        let mut idx = 0;
        let mut keep = 0;
        loop {
            let step = critical::with(|cs| {
                let mut list = list.borrow_ref_mut(cs);
                if idx == list.armed.len() {
                    if list.staged.is_empty() {
                        list.armed.truncate(keep);
                        return Step::Done;
                    }
                    let staged = core::mem::take(&mut list.staged);
                    list.armed.extend(staged);
                }

                let te = Arc::clone(&list.armed[idx]);
                let cell = te.state.borrow(cs);
                let mut state = cell.get();

                let (linked, fired) = if state.ctr == 0 {
                    (false, false)
                } else {
                    state.ctr -= 1;
                    if state.ctr != 0 {
                        (true, false)
                    } else if state.interval != 0 {
                        state.ctr = state.interval;
                        (true, true)
                    } else {
                        (false, true)
                    }
                };

                state.linked = linked;
                cell.set(state);
                if linked {
                    list.armed.swap(keep, idx);
                    keep += 1;
                }
                idx += 1;

                if fired {
                    Step::Fire(Arc::clone(&te), state.target)
                } else {
                    Step::Next
                }
            });

            match step {
                Step::Done => break,
                Step::Next => {}
                Step::Fire(te, target) => {
                    log::trace!("time event {} fired for prio {target}", te.signal());
                    post(target, te.event());
                }
            }
        }
    }
}
