use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use critical_section::{CriticalSection, Mutex};
use qf::{
    critical, gc, ActiveContext, ActiveObject, ConfigError, EventPool, EventRef, KernelConfig,
    KernelServices, Margin, PoolTable, PrioSet, QueueStats, Signal, TimerWheel, MAX_ACTIVE,
};

use crate::scheduler::{QkScheduler, SchedStatus};

const MODULE: &str = "qk";

/// How long the default idle loop sleeps between checks for a stop request.
const IDLE_PERIOD: Duration = Duration::from_millis(10);

pub struct QkKernelBuilder {
    config: KernelConfig,
    pools: Vec<Arc<dyn EventPool>>,
}

impl Default for QkKernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl QkKernelBuilder {
    pub fn new() -> Self {
        Self {
            config: KernelConfig::default(),
            pools: Vec::new(),
        }
    }

    pub fn config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds an event pool. Pools must come in increasing block size.
    pub fn event_pool(mut self, pool: Arc<dyn EventPool>) -> Self {
        self.pools.push(pool);
        self
    }

    pub fn build(self) -> Result<Arc<QkKernel>, ConfigError> {
        self.config.validate()?;

        let mut pools = PoolTable::new(self.config.max_event_pools);
        for pool in self.pools {
            pools.register(pool)?;
        }

        log::info!(
            "{} v{}: {} priorities, {} tick rates, {} event pools",
            self.config.name,
            self.config.version,
            self.config.max_active,
            self.config.max_tick_rate,
            pools.len()
        );

        Ok(Arc::new(QkKernel {
            sched: QkScheduler::new(),
            registry: Mutex::new(RefCell::new(vec![None; usize::from(MAX_ACTIVE) + 1])),
            subscribers: Mutex::new(RefCell::new(vec![
                PrioSet::new();
                usize::from(self.config.max_pub_signal)
            ])),
            timers: TimerWheel::new(self.config.max_tick_rate),
            pools,
            stop: AtomicBool::new(false),
            config: self.config,
        }))
    }
}

/// Preemptive, run-to-completion kernel.
///
/// Active objects are registered with [`start`](QkKernel::start) and
/// receive events through the [`KernelServices`] operations. Whenever a
/// post from task level makes an object ready while nothing is running, the
/// posting thread becomes the activator and runs ready objects, highest
/// priority first, until none is left. Posts made while a step is in
/// progress are picked up when that step completes.
///
/// Until [`run`](QkKernel::run) or [`run_until_idle`](QkKernel::run_until_idle)
/// is called the scheduler stays locked, so events posted during setup wait.
pub struct QkKernel {
    config: KernelConfig,
    pub(crate) sched: QkScheduler,
    registry: Mutex<RefCell<Vec<Option<Arc<ActiveObject>>>>>,
    pub(crate) subscribers: Mutex<RefCell<Vec<PrioSet>>>,
    pub(crate) timers: TimerWheel,
    pools: PoolTable,
    stop: AtomicBool,
}

impl QkKernel {
    pub fn builder() -> QkKernelBuilder {
        QkKernelBuilder::new()
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &QkScheduler {
        &self.sched
    }

    /// Registers `ao` at `prio`, gives it a queue of `queue_len` entries and
    /// takes its initial transition.
    ///
    /// Starting two objects at the same priority is fatal.
    pub fn start(
        &self,
        ao: &Arc<ActiveObject>,
        prio: u8,
        queue_len: u16,
        initial: Option<&EventRef>,
    ) {
        q_require!(100, (1..=self.config.max_active).contains(&prio));
        critical::with(|cs| {
            q_require!(110, !self.sched.in_isr());
            let mut registry = self.registry.borrow_ref_mut(cs);
            let slot = &mut registry[usize::from(prio)];
            q_require!(120, slot.is_none());
            ao.attach(cs, prio, queue_len);
            *slot = Some(Arc::clone(ao));
        });
        log::debug!("start {} at prio {prio}, queue {queue_len}", ao.name());

        // the object may post to itself while initializing
        let status = self.lock_scheduler(prio);
        let mut ctx = ActiveContext::new(prio, self);
        ao.init(&mut ctx, initial);
        self.unlock_scheduler(status);
    }

    /// Unregisters the object at `prio` and releases the events still
    /// queued for it.
    pub fn stop(&self, prio: u8) {
        q_require!(200, (1..=self.config.max_active).contains(&prio));
        self.unsubscribe_all_from(prio);

        let (name, leftovers) = critical::with(|cs| {
            let Some(ao) = self.registry.borrow_ref_mut(cs)[usize::from(prio)].take() else {
                q_error!(210)
            };
            self.sched.mark_not_ready(cs, prio);
            let leftovers = ao.detach(cs).map(|mut queue| queue.drain());
            (ao.name(), leftovers.unwrap_or_default())
        });

        for event in &leftovers {
            gc(event);
        }
        log::debug!("stop {name} (prio {prio}), {} events discarded", leftovers.len());
    }

    /// The object registered at `prio`, if any.
    pub fn active(&self, prio: u8) -> Option<Arc<ActiveObject>> {
        let idx = usize::from(prio);
        critical::with(|cs| self.registry.borrow_ref(cs).get(idx).cloned().flatten())
    }

    /// Raises the scheduler lock ceiling. Objects at or below `ceiling`
    /// are not activated until the matching
    /// [`unlock_scheduler`](QkKernel::unlock_scheduler).
    pub fn lock_scheduler(&self, ceiling: u8) -> SchedStatus {
        critical::with(|cs| self.sched.lock(cs, ceiling))
    }

    /// Restores the ceiling saved in `status` and activates anything that
    /// became eligible.
    pub fn unlock_scheduler(&self, status: SchedStatus) {
        critical::with(|cs| self.sched.unlock(cs, status));
        self.schedule();
    }

    /// Releases the startup lock and processes everything ready.
    pub fn run_until_idle(&self) {
        if critical::with(|cs| self.sched.launch(cs)) {
            log::info!("{} launched", self.config.name);
        }
        self.schedule();
    }

    /// Runs the kernel on the calling thread until [`request_stop`] is
    /// called.
    ///
    /// Processes the events posted during setup, calls the startup hook and
    /// then the idle hook for as long as the kernel runs. Other threads
    /// drive the kernel meanwhile by posting events or ticking time.
    ///
    /// [`request_stop`]: QkKernel::request_stop
    pub fn run(&self) {
        self.run_until_idle();
        if let Some(on_startup) = self.config.startup_callback {
            on_startup();
        }

        while !self.stop.load(Ordering::Acquire) {
            match self.config.idle_callback {
                Some(on_idle) => on_idle(),
                None => std::thread::sleep(IDLE_PERIOD),
            }
        }

        if let Some(on_cleanup) = self.config.cleanup_callback {
            on_cleanup();
        }
        log::info!("{} stopped", self.config.name);
    }

    /// Makes [`run`](QkKernel::run) return after the current idle pass.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Low-water mark of free entries in the queue of the object at `prio`.
    pub fn queue_min(&self, prio: u8) -> u16 {
        self.queue_stats(prio).min_free
    }

    pub fn queue_stats(&self, prio: u8) -> QueueStats {
        critical::with(|cs| self.lookup(cs, prio).with_queue(cs, |queue| queue.stats()))
    }

    pub fn is_ready(&self, prio: u8) -> bool {
        critical::with(|cs| self.sched.is_ready(cs, prio))
    }

    pub fn ready_set(&self) -> PrioSet {
        critical::with(|cs| self.sched.ready_set(cs))
    }

    /// Priority of the step in progress, 0 when idle.
    pub fn active_prio(&self) -> u8 {
        critical::with(|cs| self.sched.active_prio(cs))
    }

    /// `true` while an ISR has made a higher priority ready than the one
    /// running.
    pub fn preemption_pending(&self) -> bool {
        critical::with(|cs| self.sched.preemption_pending(cs))
    }

    fn lookup(&self, cs: CriticalSection<'_>, prio: u8) -> Arc<ActiveObject> {
        q_require!(300, (1..=MAX_ACTIVE).contains(&prio));
        match &self.registry.borrow_ref(cs)[usize::from(prio)] {
            Some(ao) => Arc::clone(ao),
            None => q_error!(310),
        }
    }

    pub(crate) fn post_event(&self, target: u8, event: EventRef, margin: Margin) -> bool {
        let (posted, next) = critical::with(|cs| {
            let posted = self.lookup(cs, target).with_queue(cs, |queue| {
                let was_empty = queue.is_empty();
                let posted = queue.post(cs, &event, margin);
                if posted && was_empty {
                    self.sched.mark_ready(cs, target);
                }
                posted
            });

            if posted {
                (true, self.sched.claim(cs))
            } else {
                // lets the gc below recycle an event nobody else holds
                event.inc_ref(cs);
                (false, None)
            }
        });

        if !posted {
            log::debug!("post {} to prio {target} rejected ({margin:?})", event.signal());
            gc(&event);
        }
        if let Some(prio) = next {
            self.activate(prio);
        }
        posted
    }

    pub(crate) fn post_lifo_event(&self, target: u8, event: EventRef) {
        let next = critical::with(|cs| {
            self.lookup(cs, target).with_queue(cs, |queue| {
                let was_empty = queue.is_empty();
                queue.post_lifo(cs, &event);
                if was_empty {
                    self.sched.mark_ready(cs, target);
                }
            });
            self.sched.claim(cs)
        });

        if let Some(prio) = next {
            self.activate(prio);
        }
    }

    /// Claims the CPU if it is idle and something is eligible to run.
    pub(crate) fn schedule(&self) {
        if let Some(prio) = critical::with(|cs| self.sched.claim(cs)) {
            self.activate(prio);
        }
    }

    /// The activator. Runs one step of `prio`, which must already be
    /// claimed, then keeps going while anything eligible is ready.
    pub(crate) fn activate(&self, mut prio: u8) {
        loop {
            let (ao, event) = critical::with(|cs| {
                let ao = self.lookup(cs, prio);
                let event = ao.with_queue(cs, |queue| {
                    let event = queue.get();
                    if queue.is_empty() {
                        self.sched.mark_not_ready(cs, prio);
                    }
                    event
                });
                (ao, event)
            });
            // a ready bit without an event
            let Some(event) = event else { q_error!(400) };

            let mut ctx = ActiveContext::new(prio, self);
            let result = ao.dispatch(&mut ctx, &event);
            log::trace!("{} (prio {prio}) {}: {result:?}", ao.name(), event.signal());
            gc(&event);

            match critical::with(|cs| self.sched.next_after(cs, prio)) {
                Some(next) => prio = next,
                None => break,
            }
        }
    }
}

impl KernelServices for QkKernel {
    fn post(&self, target: u8, event: EventRef, margin: Margin) -> bool {
        self.post_event(target, event, margin)
    }

    fn post_lifo(&self, target: u8, event: EventRef) {
        self.post_lifo_event(target, event)
    }

    fn publish(&self, event: EventRef, sender: u8) {
        self.publish_event(event, sender)
    }

    fn subscribe(&self, prio: u8, signal: Signal) {
        self.subscribe_to(prio, signal)
    }

    fn unsubscribe(&self, prio: u8, signal: Signal) {
        self.unsubscribe_from(prio, signal)
    }

    fn unsubscribe_all(&self, prio: u8) {
        self.unsubscribe_all_from(prio)
    }

    fn timers(&self) -> &TimerWheel {
        &self.timers
    }

    fn pools(&self) -> &PoolTable {
        &self.pools
    }
}

impl core::fmt::Debug for QkKernel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QkKernel")
            .field("name", &self.config.name)
            .field("ready", &self.ready_set())
            .field("active_prio", &self.active_prio())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qf::{DispatchResult, MemPool, StateMachine};
    use std::sync::Mutex as StdMutex;

    type Log = Arc<StdMutex<Vec<(u8, Signal)>>>;

    struct Recorder {
        log: Log,
    }

    impl StateMachine for Recorder {
        fn dispatch(&mut self, ctx: &mut ActiveContext<'_>, event: &EventRef) -> DispatchResult {
            self.log.lock().unwrap().push((ctx.prio(), event.signal()));
            DispatchResult::Handled
        }
    }

    fn started(kernel: &QkKernel, log: &Log, prios: &[u8]) -> Vec<Arc<ActiveObject>> {
        prios
            .iter()
            .map(|&prio| {
                let ao = ActiveObject::new("recorder", Recorder { log: Arc::clone(log) });
                kernel.start(&ao, prio, 4, None);
                ao
            })
            .collect()
    }

    fn sig(n: u16) -> EventRef {
        EventRef::immutable(Signal(n))
    }

    #[test]
    fn schedules_highest_priority_first() {
        let _ = env_logger::try_init();
        let kernel = QkKernel::builder().build().unwrap();
        let log = Log::default();
        let _aos = started(&kernel, &log, &[2, 5]);

        kernel.post(2, sig(10), Margin::Guaranteed);
        kernel.post(5, sig(11), Margin::Guaranteed);
        assert!(log.lock().unwrap().is_empty(), "nothing runs before launch");
        assert_eq!(kernel.ready_set().iter_desc().collect::<Vec<_>>(), vec![5, 2]);

        kernel.run_until_idle();

        assert_eq!(*log.lock().unwrap(), vec![(5, Signal(11)), (2, Signal(10))]);
        assert!(kernel.ready_set().is_empty());
        assert_eq!(kernel.active_prio(), 0);
    }

    #[test]
    fn post_after_launch_runs_synchronously() {
        let kernel = QkKernel::builder().build().unwrap();
        let log = Log::default();
        let _aos = started(&kernel, &log, &[3]);
        kernel.run_until_idle();

        assert!(kernel.post(3, sig(9), Margin::Slots(0)));
        assert_eq!(*log.lock().unwrap(), vec![(3, Signal(9))]);
        assert!(!kernel.is_ready(3));
    }

    #[test]
    fn unlock_scheduler_triggers_pending_work() {
        let kernel = QkKernel::builder().build().unwrap();
        let log = Log::default();
        let _aos = started(&kernel, &log, &[6]);
        kernel.run_until_idle();

        let status = kernel.lock_scheduler(6);
        assert!(status.is_locked());
        kernel.post(6, sig(11), Margin::Guaranteed);
        assert!(log.lock().unwrap().is_empty(), "lock ceiling blocks scheduling");
        assert!(kernel.is_ready(6));

        kernel.unlock_scheduler(status);
        assert_eq!(*log.lock().unwrap(), vec![(6, Signal(11))]);
        assert!(!kernel.is_ready(6));
    }

    #[test]
    fn failed_post_recycles_an_unreferenced_event() {
        let pool = Arc::new(MemPool::new(8, 2));
        let kernel = QkKernel::builder()
            .event_pool(Arc::clone(&pool) as Arc<dyn EventPool>)
            .build()
            .unwrap();
        let log = Log::default();
        let _aos = started(&kernel, &log, &[1]);

        // one queue slot plus the front slot
        for n in 0..5 {
            kernel.post(1, sig(n), Margin::Guaranteed);
        }
        let e = kernel.pools().new_signal(Signal(20), Margin::Guaranteed).unwrap();
        assert_eq!(pool.stats().used_blocks, 1);
        assert!(!kernel.post(1, e, Margin::Slots(0)));
        assert_eq!(pool.stats().used_blocks, 0);
        assert_eq!(kernel.queue_stats(1).free, 0);
    }

    #[test]
    fn stop_releases_queued_events() {
        let pool = Arc::new(MemPool::new(8, 4));
        let kernel = QkKernel::builder()
            .event_pool(Arc::clone(&pool) as Arc<dyn EventPool>)
            .build()
            .unwrap();
        let log = Log::default();
        let aos = started(&kernel, &log, &[4]);

        for n in 10..13 {
            let e = kernel.pools().new_signal(Signal(n), Margin::Guaranteed).unwrap();
            kernel.post(4, e, Margin::Guaranteed);
        }
        assert_eq!(pool.stats().used_blocks, 3);

        kernel.stop(4);
        assert_eq!(pool.stats().used_blocks, 0);
        assert!(!kernel.is_ready(4));
        assert!(!aos[0].is_started());
        assert!(kernel.active(4).is_none());

        // the priority can be reused
        let _again = started(&kernel, &log, &[4]);
        assert!(kernel.active(4).is_some());
    }

    #[test]
    fn queue_min_tracks_the_low_water_mark() {
        let kernel = QkKernel::builder().build().unwrap();
        let log = Log::default();
        let _aos = started(&kernel, &log, &[7]);

        assert_eq!(kernel.queue_min(7), 5);
        for n in 0..3 {
            kernel.post(7, sig(n), Margin::Guaranteed);
        }
        kernel.run_until_idle();
        assert_eq!(kernel.queue_min(7), 2);
        assert_eq!(kernel.queue_stats(7).free, 5);
    }

    #[test]
    fn builder_rejects_bad_configuration() {
        let config = KernelConfig::builder().max_tick_rate(0).build();
        let err = QkKernel::builder().config(config).build().unwrap_err();
        assert_eq!(err, ConfigError::MaxTickRate(0));

        let err = QkKernel::builder()
            .event_pool(Arc::new(MemPool::new(32, 1)))
            .event_pool(Arc::new(MemPool::new(16, 1)))
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::PoolOrder { previous: 32, next: 16 });
    }

    #[test]
    #[should_panic(expected = "qk:120")]
    fn duplicate_priority_is_fatal() {
        let kernel = QkKernel::builder().build().unwrap();
        let log = Log::default();
        let _aos = started(&kernel, &log, &[3, 3]);
    }

    #[test]
    #[should_panic(expected = "qk:100")]
    fn priority_above_configured_maximum_is_fatal() {
        let config = KernelConfig::builder().max_active(8).build();
        let kernel = QkKernel::builder().config(config).build().unwrap();
        let log = Log::default();
        let _aos = started(&kernel, &log, &[9]);
    }

    #[test]
    #[should_panic(expected = "qk:310")]
    fn post_to_unregistered_priority_is_fatal() {
        let kernel = QkKernel::builder().build().unwrap();
        kernel.post(12, sig(5), Margin::Guaranteed);
    }

    #[test]
    #[should_panic(expected = "qk:400")]
    fn ready_bit_without_an_event_is_fatal() {
        let kernel = QkKernel::builder().build().unwrap();
        let log = Log::default();
        let _aos = started(&kernel, &log, &[3]);
        critical::with(|cs| kernel.scheduler().mark_ready(cs, 3));
        kernel.run_until_idle();
    }

    #[test]
    #[should_panic(expected = "qf_eq:110")]
    fn guaranteed_post_into_full_queue_is_fatal() {
        let kernel = QkKernel::builder().build().unwrap();
        let log = Log::default();
        let _aos = started(&kernel, &log, &[2]);
        for n in 0..6 {
            kernel.post(2, sig(n), Margin::Guaranteed);
        }
    }
}
