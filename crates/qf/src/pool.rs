//! Fixed-block event pools.
//!
//! The kernel does not allocate event memory itself; it consumes the
//! [`EventPool`] interface. [`MemPool`] is a counting implementation suited
//! to hosted targets, and [`PoolTable`] picks the smallest registered pool
//! able to hold a given payload.

use core::cell::Cell;
use std::any::Any;
use std::sync::Arc;

use critical_section::Mutex;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::critical;
use crate::event::{DynPayload, Event, EventRef, Signal};
use crate::queue::Margin;

const MODULE: &str = "qf_pool";

/// Occupancy statistics of an event pool.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Largest payload, in bytes, a block can hold.
    pub block_size: usize,
    pub total_blocks: u16,
    pub free_blocks: u16,
    pub used_blocks: u16,
    /// Low-water mark of `free_blocks`.
    pub min_free_blocks: u16,
}

impl PoolStats {
    pub const fn new(block_size: usize, total_blocks: u16) -> Self {
        Self {
            block_size,
            total_blocks,
            free_blocks: total_blocks,
            used_blocks: 0,
            min_free_blocks: total_blocks,
        }
    }

    fn on_alloc(&mut self) {
        self.used_blocks += 1;
        self.free_blocks -= 1;
        if self.free_blocks < self.min_free_blocks {
            self.min_free_blocks = self.free_blocks;
        }
    }

    fn on_dealloc(&mut self) {
        self.used_blocks -= 1;
        self.free_blocks += 1;
    }

    /// No free block left.
    pub const fn is_exhausted(&self) -> bool {
        self.free_blocks == 0
    }

    /// Utilization in percent.
    pub fn utilization(&self) -> u8 {
        if self.total_blocks == 0 {
            0
        } else {
            ((self.used_blocks as u32 * 100) / self.total_blocks as u32) as u8
        }
    }
}

/// Allocator interface consumed by the framework.
///
/// `get` reserves one block, `put` returns the block behind a recycled
/// event. Both may be called from interrupt context.
pub trait EventPool: Send + Sync {
    fn block_size(&self) -> usize;

    /// Reserves a block. With [`Margin::Slots`] the reservation only succeeds
    /// if more than `margin` blocks are free; with [`Margin::Guaranteed`] any
    /// free block will do.
    fn get(&self, margin: Margin) -> bool;

    fn put(&self, event: &Event);

    fn stats(&self) -> PoolStats;
}

/// Counting pool of `total_blocks` blocks of `block_size` bytes.
pub struct MemPool {
    stats: Mutex<Cell<PoolStats>>,
}

impl MemPool {
    pub fn new(block_size: usize, total_blocks: u16) -> Self {
        Self {
            stats: Mutex::new(Cell::new(PoolStats::new(block_size, total_blocks))),
        }
    }
}

impl EventPool for MemPool {
    fn block_size(&self) -> usize {
        self.stats().block_size
    }

    fn get(&self, margin: Margin) -> bool {
        critical::with(|cs| {
            let cell = self.stats.borrow(cs);
            let mut stats = cell.get();
            let available = match margin {
                Margin::Guaranteed => stats.free_blocks > 0,
                Margin::Slots(margin) => stats.free_blocks > margin,
            };
            if available {
                stats.on_alloc();
                cell.set(stats);
            }
            available
        })
    }

    fn put(&self, _event: &Event) {
        critical::with(|cs| {
            let cell = self.stats.borrow(cs);
            let mut stats = cell.get();
            q_assert!(200, stats.used_blocks > 0);
            stats.on_dealloc();
            cell.set(stats);
        });
    }

    fn stats(&self) -> PoolStats {
        critical::with(|cs| self.stats.borrow(cs).get())
    }
}

/// The set of event pools known to the framework, in ascending block size.
///
/// Pool ids are 1-based positions in the table; id 0 is reserved for
/// immutable events.
pub struct PoolTable {
    pools: Vec<Arc<dyn EventPool>>,
    limit: u8,
}

impl PoolTable {
    pub fn new(limit: u8) -> Self {
        Self {
            pools: Vec::new(),
            limit,
        }
    }

    /// Registers a pool and returns its id.
    ///
    /// Pools must be registered in strictly increasing block size.
    pub fn register(&mut self, pool: Arc<dyn EventPool>) -> Result<u8, ConfigError> {
        if self.pools.len() >= self.limit as usize {
            return Err(ConfigError::TooManyPools { limit: self.limit });
        }
        if let Some(last) = self.pools.last() {
            if last.block_size() >= pool.block_size() {
                return Err(ConfigError::PoolOrder {
                    previous: last.block_size(),
                    next: pool.block_size(),
                });
            }
        }
        self.pools.push(pool);
        Ok(self.pools.len() as u8)
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Statistics of the pool with the given (1-based) id.
    pub fn stats(&self, pool_id: u8) -> Option<PoolStats> {
        let idx = usize::from(pool_id).checked_sub(1)?;
        self.pools.get(idx).map(|pool| pool.stats())
    }

    /// Largest payload any registered pool can hold.
    pub fn max_block_size(&self) -> usize {
        self.pools.last().map_or(0, |pool| pool.block_size())
    }

    /// Allocates an event carrying `payload`.
    ///
    /// Returns `None` when the chosen pool cannot honor `margin`. Running out
    /// of blocks with [`Margin::Guaranteed`], or asking for a payload larger
    /// than any pool's block, is fatal.
    pub fn new_event<T: Any + Send + Sync>(
        &self,
        signal: Signal,
        payload: T,
        margin: Margin,
    ) -> Option<EventRef> {
        let size = core::mem::size_of::<T>();
        self.new_event_dyn(signal, Some(Arc::new(payload) as DynPayload), size, margin)
    }

    /// Allocates a pool event without payload.
    pub fn new_signal(&self, signal: Signal, margin: Margin) -> Option<EventRef> {
        self.new_event_dyn(signal, None, 0, margin)
    }

    /// Allocates an event whose payload occupies `size` bytes.
    pub fn new_event_dyn(
        &self,
        signal: Signal,
        payload: Option<DynPayload>,
        size: usize,
        margin: Margin,
    ) -> Option<EventRef> {
        let Some(idx) = self.pools.iter().position(|pool| size <= pool.block_size()) else {
            q_error!(310)
        };

        let pool = &self.pools[idx];
        if pool.get(margin) {
            let pool_id = (idx + 1) as u8;
            Some(EventRef::from_pool(signal, payload, pool_id, Arc::clone(pool)))
        } else {
            q_assert!(320, margin != Margin::Guaranteed);
            log::debug!("pool {} exhausted for {signal} (margin {margin:?})", idx + 1);
            None
        }
    }
}
