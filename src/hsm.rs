//! Hierarchical state machine runtime.
//!
//! The machine is data-driven: states live in an arena, transitions in one
//! ordered global list, and guards are small terms evaluated against the
//! interface's controls at dispatch time. Keeping the description separate
//! from the running state means the elaborator emits plain data and the
//! runtime needs no callbacks.
//!
//! Dispatch bubbles from the current leaf through its ancestors; at each
//! state, transitions listing it as a source are tried in definition order
//! and the first whose guards all hold fires. A transition without a
//! destination is internal: it stops the bubbling without moving. Entering
//! a composite descends its initial children to a leaf, re-arming volatile
//! wait counters and queueing further `advance` dispatches along the way.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::error::Result;
use crate::interface::Interface;

pub type StateId = usize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tags {
    pub flow: bool,
    pub fix: bool,
    pub wait: bool,
}

impl Tags {
    pub fn flow() -> Self {
        Tags {
            flow: true,
            ..Default::default()
        }
    }

    pub fn fix() -> Self {
        Tags {
            fix: true,
            ..Default::default()
        }
    }

    pub fn waiting(mut self) -> Self {
        self.wait = true;
        self
    }

    /// Only flow- or fix-tagged leaves are legal resting points.
    pub fn accepted(&self) -> bool {
        self.flow || self.fix
    }
}

/// A guard term over one control, by index into the interface's controls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    Eq(usize, bool),
    Ne(usize, bool),
    IsFlow(usize),
    IsFix(usize),
}

impl Guard {
    pub fn eval(&self, itf: &Interface) -> Result<bool> {
        let controls = itf.controls();
        match self {
            Guard::Eq(c, v) => Ok(controls[*c].capture()? == *v),
            Guard::Ne(c, v) => Ok(controls[*c].capture()? != *v),
            Guard::IsFlow(c) => controls[*c].is_flow(),
            Guard::IsFix(c) => controls[*c].is_fix(),
        }
    }
}

fn eval_all(guards: &[Guard], itf: &Interface) -> Result<bool> {
    for g in guards {
        if !g.eval(itf)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Which delay bound a wait state counts against; read through the control
/// at runtime so interface properties set after elaboration still apply.
#[derive(Debug, Clone, Copy)]
pub enum WaitBound {
    Allowance(usize),
    Latency(usize),
}

impl WaitBound {
    fn limit(&self, itf: &Interface) -> u32 {
        match self {
            WaitBound::Allowance(c) => itf.controls()[*c].allowance(),
            WaitBound::Latency(c) => itf.controls()[*c].latency(),
        }
    }
}

/// Volatile delay bookkeeping for a wait state.
///
/// While the surrounding context (`conds`) holds, a tick satisfying
/// `positive` recovers to the base sibling, a tick satisfying `negative`
/// counts against the bound, and a saturated counter with `positive` still
/// unsatisfied escapes the machine to NULL: the control overstayed its
/// relaxation window.
#[derive(Debug, Clone)]
pub struct WaitSpec {
    pub bound: WaitBound,
    pub positive: Guard,
    pub negative: Guard,
    pub conds: Vec<Guard>,
    pub base: StateId,
}

pub struct State {
    pub name: String,
    pub tags: Tags,
    pub parent: Option<StateId>,
    pub children: Vec<StateId>,
    pub initial: Option<StateId>,
    /// Queue an `advance` whenever this state is entered, so the machine
    /// drives itself down to a leaf.
    pub enter_advance: bool,
    /// Entry-condition chain accumulated during elaboration.
    pub conds: Vec<Guard>,
    /// Controls whose caches are invalidated when the event loop rests here.
    pub influences: Vec<usize>,
    /// Reaction table indices attached to this state.
    pub reactions: Vec<usize>,
    pub wait: Option<WaitSpec>,
}

pub struct Transition {
    pub sources: Vec<StateId>,
    /// `None` marks an internal transition: guard-checked, but the machine
    /// stays put.
    pub dest: Option<StateId>,
    pub guards: Vec<Guard>,
}

enum Maintain {
    Idle,
    Moved,
    Escaped,
}

pub struct Machine {
    states: Vec<State>,
    transitions: Vec<Transition>,
    top: StateId,
    null: StateId,
    root: StateId,
    current: StateId,
    counters: Vec<u32>,
    pending: VecDeque<()>,
}

impl Machine {
    pub fn new(
        states: Vec<State>,
        transitions: Vec<Transition>,
        top: StateId,
        null: StateId,
        root: StateId,
    ) -> Self {
        let counters = vec![0; states.len()];
        Self {
            states,
            transitions,
            top,
            null,
            root,
            current: null,
            counters,
            pending: VecDeque::new(),
        }
    }

    pub fn current(&self) -> StateId {
        self.current
    }

    pub fn null(&self) -> StateId {
        self.null
    }

    pub fn root(&self) -> StateId {
        self.root
    }

    pub fn state(&self, id: StateId) -> &State {
        &self.states[id]
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    /// Dotted path of a state, for diagnostics.
    pub fn path_name(&self, id: StateId) -> String {
        self.path(id)
            .into_iter()
            .map(|s| self.states[s].name.as_str())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Ancestor chain, outermost first, ending at `id`.
    pub fn path(&self, id: StateId) -> Vec<StateId> {
        let mut path = Vec::new();
        let mut cursor = Some(id);
        while let Some(s) = cursor {
            path.push(s);
            cursor = self.states[s].parent;
        }
        path.reverse();
        path
    }

    /// Finds a state by dotted path relative to the top state.
    pub fn find(&self, path: &str) -> Option<StateId> {
        let mut cursor = self.top;
        for part in path.split('/') {
            cursor = *self.states[cursor]
                .children
                .iter()
                .find(|c| self.states[**c].name == part)?;
        }
        Some(cursor)
    }

    /// One external `advance`: wait maintenance first, then queued
    /// dispatches until the machine rests. Returns the leaf reached.
    pub fn advance(&mut self, itf: &Interface) -> Result<StateId> {
        match self.maintain(itf)? {
            Maintain::Escaped => {
                self.pending.clear();
                self.current = self.null;
                debug!("wait saturated, escaped to {}", self.path_name(self.null));
                return Ok(self.null);
            }
            Maintain::Moved | Maintain::Idle => {}
        }
        self.pending.push_back(());
        while self.pending.pop_front().is_some() {
            self.dispatch(itf)?;
        }
        trace!(state = %self.path_name(self.current), "advanced");
        Ok(self.current)
    }

    /// Per-tick upkeep of every wait state on the active path.
    fn maintain(&mut self, itf: &Interface) -> Result<Maintain> {
        for id in self.path(self.current) {
            let Some(wait) = self.states[id].wait.clone() else {
                continue;
            };
            if !eval_all(&wait.conds, itf)? {
                // Outer context shifted; ordinary dispatch resolves it.
                continue;
            }
            if wait.positive.eval(itf)? {
                self.transit(wait.base);
                return Ok(Maintain::Moved);
            }
            if wait.negative.eval(itf)? {
                let limit = wait.bound.limit(itf);
                if self.counters[id] < limit {
                    self.counters[id] += 1;
                    trace!(
                        state = %self.path_name(id),
                        count = self.counters[id],
                        limit,
                        "waiting"
                    );
                } else {
                    return Ok(Maintain::Escaped);
                }
            }
        }
        Ok(Maintain::Idle)
    }

    fn dispatch(&mut self, itf: &Interface) -> Result<()> {
        let mut scope = Some(self.current);
        while let Some(source) = scope {
            for i in 0..self.transitions.len() {
                if !self.transitions[i].sources.contains(&source) {
                    continue;
                }
                if !eval_all(&self.transitions[i].guards, itf)? {
                    continue;
                }
                match self.transitions[i].dest {
                    None => return Ok(()),
                    Some(dest) => {
                        self.transit(dest);
                        return Ok(());
                    }
                }
            }
            scope = self.states[source].parent;
        }
        // Nothing eligible anywhere; the machine rests where it is.
        Ok(())
    }

    /// Exits to the common ancestor, enters down to `dest`, then follows
    /// initial children to a leaf.
    fn transit(&mut self, dest: StateId) {
        let lca = self.lca(self.current, dest);
        let mut entry = Vec::new();
        let mut cursor = dest;
        while cursor != lca {
            entry.push(cursor);
            match self.states[cursor].parent {
                Some(p) => cursor = p,
                None => break,
            }
        }
        entry.reverse();
        for id in entry {
            self.enter(id);
        }
        let mut leaf = dest;
        while let Some(initial) = self.states[leaf].initial {
            self.enter(initial);
            leaf = initial;
        }
        self.current = leaf;
    }

    fn enter(&mut self, id: StateId) {
        if self.states[id].wait.is_some() {
            self.counters[id] = 0;
        }
        if self.states[id].enter_advance {
            self.pending.push_back(());
        }
    }

    fn lca(&self, a: StateId, b: StateId) -> StateId {
        let path_a = self.path(a);
        let path_b = self.path(b);
        let mut lca = self.top;
        for (x, y) in path_a.iter().zip(path_b.iter()) {
            if x == y {
                lca = *x;
            } else {
                break;
            }
        }
        lca
    }
}
