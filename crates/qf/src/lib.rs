//! # qf
//!
//! Framework primitives for a preemptive, run-to-completion active object
//! kernel, targeting `x86_64` hosts with the standard library enabled.
//!
//! ## Module Overview
//! - [`assert`]   – Fatal assertion funnel and `q_*` check macros.
//! - [`critical`] – Nestable critical sections.
//! - [`event`]    – Signals and reference-counted events.
//! - [`pool`]     – Event pool interface and a counting pool.
//! - [`pset`]     – Priority sets (ready set, subscriber lists).
//! - [`queue`]    – Bounded FIFO/LIFO event queues.
//! - [`active`]   – Active objects and the state machine contract.
//! - [`time`]     – Time events and the per-tick-rate timer wheel.
//! - [`config`]   – Kernel configuration.
//!
//! The scheduler itself lives in the `qk` crate, which implements
//! [`KernelServices`] on top of these primitives.

#[macro_use]
pub mod assert;

pub mod active;
pub mod config;
pub mod critical;
pub mod event;
pub mod pool;
pub mod pset;
pub mod queue;
pub mod time;

/// Highest priority an active object can have.
pub const MAX_ACTIVE: u8 = 63;

pub use active::{
    ActiveContext, ActiveObject, DispatchResult, KernelServices, SignalHandler, StateMachine,
};
pub use assert::{on_error, reset_assert_handler, set_assert_handler, AssertHandler};
pub use config::{ConfigError, KernelConfig, KernelConfigBuilder};
pub use event::{gc, DynPayload, Event, EventRef, Signal};
pub use pool::{EventPool, MemPool, PoolStats, PoolTable};
pub use pset::PrioSet;
pub use queue::{EventQueue, Margin, QueueStats};
pub use time::{TimeEvent, TimerWheel};
