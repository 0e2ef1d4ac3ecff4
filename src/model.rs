//! Behavioral models: the event loop connecting logical transactions to
//! physical stimulus.
//!
//! A [`Model`] owns an [`Interface`], the machine elaborated from it, and a
//! per-signal transaction buffer. [`Model::input`] buffers a logical
//! transaction and drives it onto the wires tick by tick;
//! [`Model::output`] recognizes a transaction from sampled stimulus and
//! returns it. Protocol-specific behavior lives in a [`Behavior`]
//! implementation: a plain struct holding protocol state plus a static
//! table of reactions the elaborator wires into the machine.

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;

use tracing::{debug, info};

use crate::elaborate::elaborate;
use crate::error::{Error, Result};
use crate::hsm::Machine;
use crate::interface::Interface;
use crate::reaction::{FilterDecl, Reaction, ReactionMeta, Schedule};
use crate::signal::{Control, LogicalValue, Signal};
use crate::sim::Tick;

/// A logical transaction: per-signal value sequences.
pub type Txn = BTreeMap<String, Vec<LogicalValue>>;

/// Protocol-specific state and reactions of a concrete model.
pub trait Behavior: Sized {
    /// The model's reaction table, read once during elaboration.
    fn reactions() -> Vec<Reaction<Self>>;

    /// Validation filters to attach to the interface's signals.
    fn filters() -> Vec<FilterDecl> {
        Vec::new()
    }
}

/// Per-signal FIFO buffer between logical transactions and the wires.
pub struct TxnBuffer {
    slots: BTreeMap<String, VecDeque<LogicalValue>>,
}

impl TxnBuffer {
    fn new(keys: BTreeSet<String>) -> Self {
        Self {
            slots: keys.into_iter().map(|k| (k, VecDeque::new())).collect(),
        }
    }

    pub fn keys(&self) -> BTreeSet<String> {
        self.slots.keys().cloned().collect()
    }

    pub fn has(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    pub fn push(&mut self, key: &str, value: LogicalValue) -> Result<()> {
        self.slots
            .get_mut(key)
            .ok_or_else(|| Error::Value(format!("no buffer slot for signal `{key}`")))?
            .push_back(value);
        Ok(())
    }

    pub fn pop(&mut self, key: &str) -> Option<LogicalValue> {
        self.slots.get_mut(key)?.pop_front()
    }

    pub fn peek(&self, key: &str) -> Option<&LogicalValue> {
        self.slots.get(key)?.front()
    }

    pub fn len(&self, key: &str) -> usize {
        self.slots.get(key).map_or(0, VecDeque::len)
    }

    /// Longest slot: how many words are still pending.
    pub fn remaining(&self) -> usize {
        self.slots.values().map(VecDeque::len).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn clear(&mut self) {
        for slot in self.slots.values_mut() {
            slot.clear();
        }
    }

    /// Drains every slot into a transaction, keeping the key set.
    pub fn take(&mut self) -> Txn {
        self.slots
            .iter_mut()
            .map(|(k, v)| (k.clone(), v.drain(..).collect()))
            .collect()
    }
}

/// What a reaction may touch while it runs.
pub struct Context<'a> {
    pub itf: &'a Interface,
    pub buff: &'a mut TxnBuffer,
    busy: &'a Cell<bool>,
    primary: Option<bool>,
}

impl Context<'_> {
    /// Marks the model's current transaction finished; the surrounding
    /// `input`/`output` loop exits after this tick.
    pub fn complete(&self) {
        self.busy.set(false);
    }

    pub fn primary(&self) -> Option<bool> {
        self.primary
    }

    pub fn signal(&self, name: &str) -> Result<&Signal> {
        self.itf
            .signal(name)
            .ok_or_else(|| Error::Value(format!("no signal `{name}` on {}", self.itf)))
    }

    pub fn control(&self, name: &str) -> Result<&Control> {
        self.itf
            .control(name)
            .ok_or_else(|| Error::Value(format!("no control `{name}` on {}", self.itf)))
    }

    /// Captures an instantiated signal; `None` when absent or unbound.
    pub fn capture(&self, name: &str) -> Result<Option<LogicalValue>> {
        match self.itf.signal(name) {
            Some(s) if s.instantiated() => Ok(Some(s.capture()?)),
            _ => Ok(None),
        }
    }

    pub fn capture_bool(&self, name: &str) -> Result<Option<bool>> {
        Ok(self.capture(name)?.and_then(|v| v.as_bool()))
    }

    /// Drives an instantiated signal; silently skips absent ones.
    pub fn drive(&self, name: &str, value: &LogicalValue) -> Result<()> {
        match self.itf.signal(name) {
            Some(s) if s.instantiated() => s.drive(value),
            _ => Ok(()),
        }
    }
}

/// Clears the busy flag however the event loop ends, including
/// cancellation of the owning future.
struct BusyGuard(Rc<Cell<bool>>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

pub struct Model<B: Behavior> {
    itf: Interface,
    behavior: B,
    machine: Machine,
    reactions: Vec<Reaction<B>>,
    buff: TxnBuffer,
    busy: Rc<Cell<bool>>,
    primary: Option<bool>,
}

impl<B: Behavior> Model<B> {
    /// Builds the model: attaches the behavior's filters, elaborates the
    /// machine from the interface's controls and the reaction table, and
    /// sizes the transaction buffer for the role's payload signals.
    pub fn new(mut itf: Interface, behavior: B, primary: Option<bool>) -> Result<Self> {
        let reactions = B::reactions();
        for (i, r) in reactions.iter().enumerate() {
            if r.forced
                && reactions[..i]
                    .iter()
                    .any(|other| other.forced && other.cname == r.cname)
            {
                return Err(Error::Value(format!(
                    "at most one reaction on `{}` may be forced",
                    r.cname
                )));
            }
        }
        for f in B::filters() {
            itf.add_filter(f.sname, Rc::new(f.check));
        }
        let metas: Vec<ReactionMeta> = reactions
            .iter()
            .enumerate()
            .map(|(i, r)| r.meta(i))
            .collect();
        let machine = elaborate(&itf, &metas);
        // Payload flows from the primary side; a role-less model carries
        // the bidirectional set.
        let payload = match primary {
            None => itf.txn(None),
            Some(_) => itf.txn(Some(true)),
        };
        info!(interface = %itf, ?primary, payload = ?payload, "model constructed");
        Ok(Self {
            itf,
            behavior,
            machine,
            reactions,
            buff: TxnBuffer::new(payload),
            busy: Rc::new(Cell::new(false)),
            primary,
        })
    }

    pub fn interface(&self) -> &Interface {
        &self.itf
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn behavior(&self) -> &B {
        &self.behavior
    }

    pub fn busy(&self) -> bool {
        self.busy.get()
    }

    pub fn primary(&self) -> Option<bool> {
        self.primary
    }

    /// Transmits one logical transaction as physical stimulus, consuming
    /// simulated time until the behavior reports completion.
    pub async fn input<T: Tick>(&mut self, txn: Txn, tick: &T) -> Result<()> {
        if self.busy.get() {
            return Err(Error::Protocol(format!(
                "{} cannot ingest input while busy",
                self.itf
            )));
        }
        let expected = self.buff.keys();
        let provided: BTreeSet<String> = txn.keys().cloned().collect();
        if provided != expected {
            return Err(Error::Value(format!(
                "transaction must cover signals {expected:?}, got {provided:?}"
            )));
        }
        for (key, values) in txn {
            for value in values {
                self.buff.push(&key, value)?;
            }
        }
        info!(interface = %self.itf, "input buffered");

        self.busy.set(true);
        let armed = BusyGuard(Rc::clone(&self.busy));
        while self.busy.get() {
            tick.rising_edge().await;
            tick.read_only().await;
            self.event_loop(tick).await?;
        }
        drop(armed);
        self.buff.clear();
        info!(interface = %self.itf, "input completed");
        Ok(())
    }

    /// Samples physical stimulus until the behavior recognizes a complete
    /// transaction, then returns it.
    pub async fn output<T: Tick>(&mut self, tick: &T) -> Result<Txn> {
        if self.busy.get() {
            return Err(Error::Protocol(format!(
                "{} cannot produce output while busy",
                self.itf
            )));
        }
        self.busy.set(true);
        let armed = BusyGuard(Rc::clone(&self.busy));
        while self.busy.get() {
            tick.rising_edge().await;
            tick.read_only().await;
            self.event_loop(tick).await?;
        }
        drop(armed);
        let out = self.flush()?;
        info!(interface = %self.itf, "output completed");
        Ok(out)
    }

    /// Snapshot-and-clear of the transaction buffer. The returned mapping
    /// always carries every payload key; a fresh or just-flushed model
    /// yields empty sequences.
    pub fn flush(&mut self) -> Result<Txn> {
        if self.busy.get() {
            return Err(Error::Protocol(format!(
                "{} cannot flush while busy",
                self.itf
            )));
        }
        Ok(self.buff.take())
    }

    /// One tick of the machine: advance to a leaf, verify the context
    /// invariant, invalidate influenced controls, and run the leaf's
    /// reactions (deferring next-time-step ones past the settle phase).
    async fn event_loop<T: Tick>(&mut self, tick: &T) -> Result<()> {
        let leaf = self.machine.advance(&self.itf)?;
        let state = self.machine.state(leaf);
        if leaf == self.machine.null() || !state.tags.accepted() {
            return Err(Error::Protocol(format!(
                "control context invariant violated at `{}`",
                self.machine.path_name(leaf)
            )));
        }
        let influences = state.influences.clone();
        let reactions = state.reactions.clone();
        debug!(state = %self.machine.path_name(leaf), "resting");

        for c in influences {
            self.itf.controls()[c].clear();
        }
        let mut deferred = Vec::new();
        for id in reactions {
            match self.reactions[id].schedule {
                Schedule::ReadOnly => self.run_reaction(id)?,
                Schedule::NextTimeStep => deferred.push(id),
            }
        }
        if !deferred.is_empty() {
            tick.next_time_step().await;
            for id in deferred {
                self.run_reaction(id)?;
            }
        }
        Ok(())
    }

    fn run_reaction(&mut self, id: usize) -> Result<()> {
        let run = self.reactions[id].run;
        let mut ctx = Context {
            itf: &self.itf,
            buff: &mut self.buff,
            busy: &*self.busy,
            primary: self.primary,
        };
        run(&mut self.behavior, &mut ctx)
    }
}
