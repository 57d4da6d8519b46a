//! Time management: the tick entry point and time event arming.

use std::sync::Arc;

use qf::{Margin, TimeEvent};

use crate::kernel::QkKernel;

impl QkKernel {
    /// Processes one clock tick at `tick_rate`.
    ///
    /// Meant to be called from the platform tick source, exactly once per
    /// tick period of that rate. Runs in interrupt context: expired time
    /// events are posted during the walk and whatever they made ready is
    /// activated when the tick returns.
    pub fn tick(&self, tick_rate: u8) {
        let _isr = self.isr();
        self.timers.tick(tick_rate, |target, event| {
            self.post_event(target, event.clone(), Margin::Guaranteed);
        });
    }

    /// Arms `te` to post to the object at `target` after `n_ticks`, then
    /// every `interval` ticks (0 for one-shot).
    pub fn arm(&self, te: &Arc<TimeEvent>, target: u8, n_ticks: u32, interval: u32) {
        self.timers.arm(te, target, n_ticks, interval);
    }

    /// Stops `te`. Returns `false` if it was not running. An event it
    /// already posted stays queued.
    pub fn disarm(&self, te: &TimeEvent) -> bool {
        te.disarm()
    }

    pub fn rearm(&self, te: &Arc<TimeEvent>, n_ticks: u32) -> bool {
        self.timers.rearm(te, n_ticks)
    }

    /// `true` when no time event is running at `tick_rate`.
    pub fn no_active_timers(&self, tick_rate: u8) -> bool {
        self.timers.no_active(tick_rate)
    }
}
