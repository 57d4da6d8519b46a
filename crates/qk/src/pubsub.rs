//! Publish-subscribe delivery.
//!
//! Every publishable signal has a [`PrioSet`](qf::PrioSet) of subscribers.
//! Publishing posts the event to each of them, highest priority first, with
//! the scheduler locked at the highest subscriber so no subscriber runs
//! before all of them got the event.

use qf::{critical, gc, EventRef, Margin, Signal};

use crate::kernel::QkKernel;
use crate::scheduler::SchedStatus;

const MODULE: &str = "qk_ps";

impl QkKernel {
    fn is_publishable(&self, signal: Signal) -> bool {
        signal.is_user() && signal.0 < self.config().max_pub_signal
    }

    pub(crate) fn subscribe_to(&self, prio: u8, signal: Signal) {
        q_require!(100, self.is_publishable(signal));
        q_require!(110, self.active(prio).is_some());
        critical::with(|cs| {
            self.subscribers.borrow_ref_mut(cs)[usize::from(signal.0)].insert(prio);
        });
        log::debug!("prio {prio} subscribed to {signal}");
    }

    pub(crate) fn unsubscribe_from(&self, prio: u8, signal: Signal) {
        q_require!(200, self.is_publishable(signal));
        critical::with(|cs| {
            self.subscribers.borrow_ref_mut(cs)[usize::from(signal.0)].remove(prio);
        });
        log::debug!("prio {prio} unsubscribed from {signal}");
    }

    pub(crate) fn unsubscribe_all_from(&self, prio: u8) {
        critical::with(|cs| {
            for subscribers in self.subscribers.borrow_ref_mut(cs).iter_mut() {
                subscribers.remove(prio);
            }
        });
    }

    pub(crate) fn publish_event(&self, event: EventRef, sender: u8) {
        let signal = event.signal();
        q_require!(300, self.is_publishable(signal));

        let (subscribers, status) = critical::with(|cs| {
            // keeps the event alive until the last subscriber got it
            event.inc_ref(cs);
            let subscribers = self.subscribers.borrow_ref(cs)[usize::from(signal.0)];
            let status = match subscribers.find_max() {
                Some(top) if !self.sched.in_isr() => self.sched.lock(cs, top),
                _ => SchedStatus::Unlocked,
            };
            (subscribers, status)
        });
        log::trace!(
            "publish {signal} from prio {sender} to {} subscribers",
            subscribers.len()
        );

        for prio in subscribers.iter_desc() {
            self.post_event(prio, event.clone(), Margin::Guaranteed);
        }

        if status.is_locked() {
            self.unlock_scheduler(status);
        }
        gc(&event);
    }
}
