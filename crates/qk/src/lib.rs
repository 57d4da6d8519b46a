//! # qk
//!
//! Preemptive, non-blocking, run-to-completion kernel for [`qf`] active
//! objects.
//!
//! ## Module Overview
//! - [`scheduler`] – Ready set, lock ceiling and the scheduling decisions.
//! - [`kernel`]    – [`QkKernel`]: registry, posting and the activator.
//! - [`isr`]       – Interrupt context simulation.
//! - `pubsub`      – Publish-subscribe delivery.
//! - `time`        – Clock tick processing.
//!
//! ```no_run
//! use qf::{ActiveContext, ActiveObject, Signal, SignalHandler};
//! use qk::QkKernel;
//!
//! struct Counter(u32);
//!
//! impl SignalHandler for Counter {
//!     fn on_signal(&mut self, _ctx: &mut ActiveContext<'_>, _signal: Signal) {
//!         self.0 += 1;
//!     }
//! }
//!
//! let kernel = QkKernel::builder().build().expect("valid configuration");
//! let counter = ActiveObject::new("counter", Counter(0));
//! kernel.start(&counter, 1, 8, None);
//! kernel.run();
//! ```

#[macro_use]
extern crate qf;

pub mod isr;
pub mod kernel;
mod pubsub;
pub mod scheduler;
mod time;

pub use isr::IsrGuard;
pub use kernel::{QkKernel, QkKernelBuilder};
pub use qf::KernelServices;
pub use scheduler::{QkScheduler, SchedStatus};
