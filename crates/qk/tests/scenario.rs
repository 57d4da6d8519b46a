//! Three objects at priorities 1, 5 and 9, each with a queue of depth 4.

use std::sync::{Arc, Mutex, Weak};

use qf::{ActiveContext, ActiveObject, DispatchResult, EventRef, Margin, Signal, StateMachine};
use qk::{KernelServices, QkKernel};

const WORK: Signal = Signal(Signal::USER.0);
const IRQ: Signal = Signal(Signal::USER.0 + 1);

type Trace = Arc<Mutex<Vec<(u8, Signal)>>>;
type Pending = Arc<Mutex<Vec<(u8, bool)>>>;

struct Worker {
    kernel: Weak<QkKernel>,
    trace: Trace,
    /// What `preemption_pending` reported at the end of each step.
    pending: Pending,
    /// Posts to this priority from a simulated interrupt during dispatch.
    raise: Option<u8>,
}

impl StateMachine for Worker {
    fn dispatch(&mut self, ctx: &mut ActiveContext<'_>, event: &EventRef) -> DispatchResult {
        let kernel = self.kernel.upgrade().expect("kernel outlives its objects");
        if let Some(target) = self.raise.take() {
            let _isr = kernel.isr();
            kernel.post(target, EventRef::immutable(IRQ), Margin::Guaranteed);
        }
        self.trace.lock().unwrap().push((ctx.prio(), event.signal()));
        self.pending
            .lock()
            .unwrap()
            .push((ctx.prio(), kernel.preemption_pending()));
        DispatchResult::Handled
    }
}

fn setup(raise_from_mid: bool) -> (Arc<QkKernel>, Trace, Pending) {
    let _ = env_logger::try_init();
    let kernel = QkKernel::builder().build().unwrap();
    let trace = Trace::default();
    let pending = Pending::default();

    for prio in [1, 5, 9] {
        let ao = ActiveObject::new(
            "worker",
            Worker {
                kernel: Arc::downgrade(&kernel),
                trace: Arc::clone(&trace),
                pending: Arc::clone(&pending),
                raise: (raise_from_mid && prio == 5).then_some(9),
            },
        );
        kernel.start(&ao, prio, 4, None);
    }
    (kernel, trace, pending)
}

#[test]
fn higher_priority_runs_first_regardless_of_arrival() {
    let (kernel, trace, pending) = setup(false);

    kernel.post(1, EventRef::immutable(WORK), Margin::Guaranteed);
    kernel.post(5, EventRef::immutable(WORK), Margin::Guaranteed);
    kernel.run_until_idle();

    assert_eq!(*trace.lock().unwrap(), vec![(5, WORK), (1, WORK)]);
    assert_eq!(*pending.lock().unwrap(), vec![(5, false), (1, false)]);
}

#[test]
fn interrupt_during_mid_priority_step_runs_high_before_low() {
    let (kernel, trace, pending) = setup(true);

    kernel.post(1, EventRef::immutable(WORK), Margin::Guaranteed);
    kernel.post(5, EventRef::immutable(WORK), Margin::Guaranteed);
    kernel.run_until_idle();

    assert_eq!(*trace.lock().unwrap(), vec![(5, WORK), (9, IRQ), (1, WORK)]);
    assert!(kernel.ready_set().is_empty());
    assert!(!kernel.preemption_pending());
    for prio in [1, 5, 9] {
        assert_eq!(kernel.queue_stats(prio).free, 5);
    }
}

#[test]
fn pended_preemption_clears_once_serviced() {
    let (kernel, _trace, pending) = setup(true);

    kernel.post(1, EventRef::immutable(WORK), Margin::Guaranteed);
    kernel.post(5, EventRef::immutable(WORK), Margin::Guaranteed);
    kernel.run_until_idle();

    // only the interrupted step sees the pend
    assert_eq!(
        *pending.lock().unwrap(),
        vec![(5, true), (9, false), (1, false)]
    );
}
