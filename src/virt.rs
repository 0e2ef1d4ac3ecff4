//! In-memory implementation of the simulator facade.
//!
//! `virt` stands in for a real simulator in tests and demos: wires are
//! plain cells, and a [`TestClock`] resolves the tick phases in order on a
//! cooperative single-threaded runtime. Driving the clock and the models
//! from one `join!` keeps the interleaving deterministic: each `fire`
//! releases every future parked on that phase before the clock moves on.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use tokio::sync::Notify;

use crate::logic::LogicVector;
use crate::sim::{Entity, Tick, Wire};

pub struct VirtualWire {
    name: String,
    value: RefCell<LogicVector>,
}

impl VirtualWire {
    pub fn new(name: &str, width: usize) -> Rc<Self> {
        Rc::new(Self {
            name: name.to_string(),
            value: RefCell::new(LogicVector::zeros(width)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Testbench-side poke, clamped to the wire's width.
    pub fn set(&self, value: u64) {
        let width = self.value.borrow().width();
        *self.value.borrow_mut() = LogicVector::from_u64(value, width);
    }

    /// Forces every bit undefined, as an undriven wire would read.
    pub fn set_undefined(&self) {
        let width = self.value.borrow().width();
        *self.value.borrow_mut() = LogicVector::undefined(width);
    }

    /// Testbench-side peek as an integer; `None` while unresolvable.
    pub fn peek(&self) -> Option<u64> {
        self.value.borrow().as_u64()
    }
}

impl Wire for VirtualWire {
    fn read(&self) -> LogicVector {
        self.value.borrow().clone()
    }

    fn write(&self, value: &LogicVector) {
        let width = self.value.borrow().width();
        *self.value.borrow_mut() = value.resized(width);
    }

    fn width(&self) -> usize {
        self.value.borrow().width()
    }
}

#[derive(Default)]
pub struct VirtualEntity {
    wires: RefCell<BTreeMap<String, Rc<VirtualWire>>>,
}

impl VirtualEntity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and registers a wire.
    pub fn wire(&self, name: &str, width: usize) -> Rc<VirtualWire> {
        let wire = VirtualWire::new(name, width);
        self.wires
            .borrow_mut()
            .insert(name.to_string(), Rc::clone(&wire));
        wire
    }

    pub fn get(&self, name: &str) -> Option<Rc<VirtualWire>> {
        self.wires.borrow().get(name).cloned()
    }
}

impl Entity for VirtualEntity {
    fn lookup(&self, name: &str) -> Option<Rc<dyn Wire>> {
        self.wires
            .borrow()
            .get(name)
            .map(|w| Rc::clone(w) as Rc<dyn Wire>)
    }
}

/// An edge-triggered event: `wait` parks until the next `fire`.
struct Phase {
    seq: Cell<u64>,
    notify: Notify,
}

impl Phase {
    fn new() -> Self {
        Self {
            seq: Cell::new(0),
            notify: Notify::new(),
        }
    }

    fn fire(&self) {
        self.seq.set(self.seq.get() + 1);
        self.notify.notify_waiters();
    }

    async fn wait(&self) {
        let start = self.seq.get();
        loop {
            let parked = self.notify.notified();
            if self.seq.get() != start {
                return;
            }
            parked.await;
        }
    }
}

/// Resolves the three tick phases for every model sharing it.
///
/// The clock side calls [`TestClock::cycle`] (or [`TestClock::run`]) from a
/// future joined with the model futures; the model side suspends through
/// the [`Tick`] implementation.
pub struct TestClock {
    rising: Phase,
    read_only: Phase,
    next_step: Phase,
    ticks: Cell<u64>,
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            rising: Phase::new(),
            read_only: Phase::new(),
            next_step: Phase::new(),
            ticks: Cell::new(0),
        }
    }

    /// Ticks elapsed since construction.
    pub fn now(&self) -> u64 {
        self.ticks.get()
    }

    /// One full tick. The yield after each phase lets every parked future
    /// run to its next suspension point before the following phase fires.
    pub async fn cycle(&self) {
        self.ticks.set(self.ticks.get() + 1);
        self.rising.fire();
        yield_once().await;
        self.read_only.fire();
        yield_once().await;
        self.next_step.fire();
        yield_once().await;
    }

    pub async fn run(&self, ticks: usize) {
        for _ in 0..ticks {
            self.cycle().await;
        }
    }
}

impl Tick for TestClock {
    async fn rising_edge(&self) {
        self.rising.wait().await;
    }

    async fn read_only(&self) {
        self.read_only.wait().await;
    }

    async fn next_time_step(&self) {
        self.next_step.wait().await;
    }
}

async fn yield_once() {
    tokio::task::yield_now().await;
}
