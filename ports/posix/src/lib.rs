//! Hosted port for the QK kernel.
//!
//! [`PosixPort`] runs a [`QkKernel`] inside an ordinary process: a ticker
//! thread stands in for the timer interrupt and calls [`QkKernel::tick`]
//! once per tick period, Ctrl-C requests a clean stop, and the kernel's own
//! loop runs on the calling thread.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use qk::QkKernel;
//! use qp_posix::PosixPort;
//!
//! let kernel = QkKernel::builder().build().expect("valid configuration");
//! // start active objects here
//! PosixPort::new(kernel)
//!     .tick_period(Duration::from_millis(10))
//!     .run()
//!     .expect("port failed");
//! ```

#[macro_use]
extern crate qf;

pub mod ticker;

use std::sync::Arc;
use std::time::Duration;

use qk::QkKernel;
use thiserror::Error;

pub use ticker::{period_for, Ticker, DEFAULT_TICKS_PER_SEC};

#[derive(Debug, Error)]
pub enum PortError {
    #[error("cannot install Ctrl-C handler: {0}")]
    Signal(#[from] ctrlc::Error),
    #[error("cannot spawn ticker thread: {0}")]
    Ticker(#[from] std::io::Error),
}

pub struct PosixPort {
    kernel: Arc<QkKernel>,
    tick_period: Duration,
    tick_rate: u8,
    handle_ctrlc: bool,
}

impl PosixPort {
    pub fn new(kernel: Arc<QkKernel>) -> Self {
        Self {
            kernel,
            tick_period: period_for(DEFAULT_TICKS_PER_SEC),
            tick_rate: 0,
            handle_ctrlc: true,
        }
    }

    pub fn tick_period(mut self, period: Duration) -> Self {
        self.tick_period = period;
        self
    }

    pub fn ticks_per_sec(self, ticks_per_sec: u32) -> Self {
        self.tick_period(period_for(ticks_per_sec))
    }

    /// Tick rate driven by the ticker thread.
    pub fn tick_rate(mut self, tick_rate: u8) -> Self {
        self.tick_rate = tick_rate;
        self
    }

    /// Whether Ctrl-C stops the kernel. Only one handler can be installed
    /// per process.
    pub fn handle_ctrlc(mut self, enabled: bool) -> Self {
        self.handle_ctrlc = enabled;
        self
    }

    pub fn kernel(&self) -> &Arc<QkKernel> {
        &self.kernel
    }

    /// Runs the kernel until a stop is requested.
    pub fn run(self) -> Result<(), PortError> {
        if self.handle_ctrlc {
            let kernel = Arc::downgrade(&self.kernel);
            ctrlc::set_handler(move || {
                log::info!("interrupted, stopping");
                if let Some(kernel) = kernel.upgrade() {
                    kernel.request_stop();
                }
            })?;
        }

        let ticker = {
            let kernel = Arc::clone(&self.kernel);
            let rate = self.tick_rate;
            Ticker::spawn(self.tick_period, move || kernel.tick(rate))?
        };

        self.kernel.run();
        ticker.stop();
        Ok(())
    }
}
