//! Framework configuration.

use thiserror::Error;

use crate::MAX_ACTIVE;

/// Highest number of tick rates a [`TimerWheel`](crate::time::TimerWheel)
/// can service.
pub const MAX_TICK_RATE: u8 = 15;

/// Highest number of event pools.
pub const MAX_EVENT_POOLS: u8 = 15;

/// Problems detected while validating a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max_active {0} outside 1..=63")]
    MaxActive(u8),
    #[error("max_tick_rate {0} outside 1..=15")]
    MaxTickRate(u8),
    #[error("max_event_pools {0} outside 1..=15")]
    MaxEventPools(u8),
    #[error("max_pub_signal {0} leaves no room for user signals")]
    MaxPubSignal(u16),
    #[error("event pool with block size {next} registered after block size {previous}")]
    PoolOrder { previous: usize, next: usize },
    #[error("more than {limit} event pools registered")]
    TooManyPools { limit: u8 },
}

/// Configuration for the framework and kernel.
///
/// Sizes the priority table, the tick rates and the publish-subscribe
/// table, and carries the application hooks the kernel calls around its
/// idle loop.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub name: &'static str,
    pub max_active: u8,
    pub max_tick_rate: u8,
    /// Signals below this value may be published.
    pub max_pub_signal: u16,
    pub max_event_pools: u8,
    /// Called repeatedly while nothing is ready to run.
    pub idle_callback: Option<fn()>,
    /// Called once, after the initial events were processed.
    pub startup_callback: Option<fn()>,
    /// Called once when the kernel loop exits.
    pub cleanup_callback: Option<fn()>,
    pub version: u16,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            name: "QK",
            max_active: MAX_ACTIVE,
            max_tick_rate: 4,
            max_pub_signal: 64,
            max_event_pools: 3,
            idle_callback: None,
            startup_callback: None,
            cleanup_callback: None,
            version: 740,
        }
    }
}

impl KernelConfig {
    /// Creates a new kernel configuration builder.
    pub fn builder() -> KernelConfigBuilder {
        KernelConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_ACTIVE).contains(&self.max_active) {
            return Err(ConfigError::MaxActive(self.max_active));
        }
        if !(1..=MAX_TICK_RATE).contains(&self.max_tick_rate) {
            return Err(ConfigError::MaxTickRate(self.max_tick_rate));
        }
        if !(1..=MAX_EVENT_POOLS).contains(&self.max_event_pools) {
            return Err(ConfigError::MaxEventPools(self.max_event_pools));
        }
        if self.max_pub_signal != 0 && self.max_pub_signal <= crate::Signal::USER.0 {
            return Err(ConfigError::MaxPubSignal(self.max_pub_signal));
        }
        Ok(())
    }
}

/// Builder for ergonomic kernel configuration construction.
#[derive(Debug, Clone, Default)]
pub struct KernelConfigBuilder {
    config: KernelConfig,
}

impl KernelConfigBuilder {
    /// Sets the kernel name.
    pub fn name(mut self, name: &'static str) -> Self {
        self.config.name = name;
        self
    }

    /// Sets the maximum number of active objects.
    pub fn max_active(mut self, max: u8) -> Self {
        self.config.max_active = max;
        self
    }

    /// Sets the number of tick rates.
    pub fn max_tick_rate(mut self, max: u8) -> Self {
        self.config.max_tick_rate = max;
        self
    }

    /// Sets the size of the publish-subscribe table; 0 disables publishing.
    pub fn max_pub_signal(mut self, max: u16) -> Self {
        self.config.max_pub_signal = max;
        self
    }

    /// Sets the maximum number of event pools.
    pub fn max_event_pools(mut self, max: u8) -> Self {
        self.config.max_event_pools = max;
        self
    }

    /// Sets the idle callback function.
    pub fn idle_callback(mut self, callback: fn()) -> Self {
        self.config.idle_callback = Some(callback);
        self
    }

    pub fn startup_callback(mut self, callback: fn()) -> Self {
        self.config.startup_callback = Some(callback);
        self
    }

    pub fn cleanup_callback(mut self, callback: fn()) -> Self {
        self.config.cleanup_callback = Some(callback);
        self
    }

    /// Sets the version number.
    pub fn version(mut self, version: u16) -> Self {
        self.config.version = version;
        self
    }

    /// Builds the kernel configuration.
    pub fn build(self) -> KernelConfig {
        self.config
    }
}
