//! Clock tick thread.
//!
//! Ticks are scheduled against absolute monotonic deadlines, so a late
//! wakeup shortens the next sleep instead of drifting.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const MODULE: &str = "posix_tick";

pub const DEFAULT_TICKS_PER_SEC: u32 = 100;

const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Period of a clock running at `ticks_per_sec`.
pub fn period_for(ticks_per_sec: u32) -> Duration {
    q_require!(100, (1..=10_000).contains(&ticks_per_sec));
    Duration::from_nanos(NSEC_PER_SEC / u64::from(ticks_per_sec))
}

/// A running tick thread. Dropping it stops and joins the thread.
pub struct Ticker {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Spawns a thread calling `on_tick` once per `period`.
    pub fn spawn(period: Duration, mut on_tick: impl FnMut() + Send + 'static) -> io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("qp-ticker".into())
            .spawn(move || {
                let mut next_tick = Instant::now();
                while flag.load(Ordering::Relaxed) {
                    next_tick += period;
                    let now = Instant::now();
                    if next_tick > now {
                        thread::sleep(next_tick - now);
                    }
                    on_tick();
                }
            })?;
        log::debug!("ticker started, period {period:?}");

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("ticker thread panicked");
            }
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
