//! Elaboration: from an interface's controls to a hierarchical machine.
//!
//! The machine is rooted at `TOP`, whose children are `NULL` (the idle and
//! escape state) and `ROOT` (the elaborated body). Controls are taken in
//! ascending precedence order, one level per distinct precedence value;
//! each level expands every open flow leaf of the tree built so far:
//!
//! * a level with one instantiated control hangs that control's nest
//!   directly under each open leaf;
//! * a level with several instantiated controls adds an `INIT` stub plus a
//!   nest per control, entered under mutual exclusion (every sibling must
//!   sample fix);
//! * an uninstantiated control with a forced reaction contributes a
//!   virtual level: a single flow-tagged child carrying the reaction.
//!
//! A control's nest splits into `FLW` and `FXD` sides holding one value
//! state per flow/fix value. Each value state owns a `BASE` leaf and, when
//! the control's allowance (flow side) or latency (fix side) is positive, a
//! volatile `ALLOWANCE`/`LATENCY` wait sibling whose counter bounds how
//! long the sampled value may stay away. Open flow leaves include wait
//! states, so deeper levels keep operating inside a relaxation window.

use crate::hsm::{Guard, Machine, State, Tags, Transition, WaitBound, WaitSpec};
use crate::interface::Interface;
use crate::reaction::ReactionMeta;

pub fn elaborate(itf: &Interface, reactions: &[ReactionMeta]) -> Machine {
    let mut builder = Builder {
        itf,
        reactions,
        states: Vec::new(),
        transitions: Vec::new(),
    };

    let top = builder.add("TOP", None, Tags::default());
    let null = builder.add("NULL", Some(top), Tags::fix());
    let root = builder.add("ROOT", Some(top), Tags::flow());
    builder.states[top].initial = Some(null);
    builder.transitions.push(Transition {
        sources: vec![null],
        dest: Some(root),
        guards: vec![],
    });

    let sorted = itf.sorted_controls();
    let mut i = 0;
    while i < sorted.len() {
        let precedence = itf.controls()[sorted[i]].get_precedence();
        let mut level = Vec::new();
        while i < sorted.len() && itf.controls()[sorted[i]].get_precedence() == precedence {
            level.push(sorted[i]);
            i += 1;
        }
        builder.add_level(&level);
    }

    // Nothing fired anywhere: the control context is illegal and the
    // machine falls out to NULL for the event loop to report.
    builder.transitions.push(Transition {
        sources: vec![root],
        dest: Some(null),
        guards: vec![],
    });

    Machine::new(builder.states, builder.transitions, top, null, root)
}

struct Builder<'a> {
    itf: &'a Interface,
    reactions: &'a [ReactionMeta],
    states: Vec<State>,
    transitions: Vec<Transition>,
}

impl Builder<'_> {
    fn add(&mut self, name: &str, parent: Option<usize>, tags: Tags) -> usize {
        self.add_full(name, parent, tags, Vec::new(), Vec::new(), Vec::new())
    }

    fn add_full(
        &mut self,
        name: &str,
        parent: Option<usize>,
        tags: Tags,
        conds: Vec<Guard>,
        influences: Vec<usize>,
        reactions: Vec<usize>,
    ) -> usize {
        let id = self.states.len();
        self.states.push(State {
            name: name.to_string(),
            tags,
            parent,
            children: Vec::new(),
            initial: None,
            enter_advance: false,
            conds,
            influences,
            reactions,
            wait: None,
        });
        if let Some(p) = parent {
            self.states[p].children.push(id);
        }
        id
    }

    /// Leaves still tagged flow: the attachment points for the next level.
    fn flow_leaves(&self) -> Vec<usize> {
        (0..self.states.len())
            .filter(|i| self.states[*i].children.is_empty() && self.states[*i].tags.flow)
            .collect()
    }

    fn add_level(&mut self, level: &[usize]) {
        let itf = self.itf;
        let instantiated: Vec<usize> = level
            .iter()
            .copied()
            .filter(|c| itf.controls()[*c].instantiated())
            .collect();

        // Forced reactions on absent controls form virtual levels.
        for &c in level {
            if itf.controls()[c].instantiated() {
                continue;
            }
            let cname = itf.controls()[c].name();
            let Some(forced) = self
                .reactions
                .iter()
                .find(|r| r.cname == cname && r.forced)
            else {
                continue;
            };
            let forced_id = forced.id;
            let vname = cname.to_uppercase();
            for f in self.flow_leaves() {
                self.states[f].tags.flow = false;
                let conds = self.states[f].conds.clone();
                let influences = self.states[f].influences.clone();
                let mut reactions = self.states[f].reactions.clone();
                reactions.push(forced_id);
                let child =
                    self.add_full(&vname, Some(f), Tags::flow(), conds, influences, reactions);
                self.states[f].initial = Some(child);
            }
        }

        if instantiated.is_empty() {
            return;
        }

        for f in self.flow_leaves() {
            self.states[f].tags.flow = false;
            let conds = self.states[f].conds.clone();
            let mut influences = self.states[f].influences.clone();
            influences.extend(instantiated.iter().copied());
            let reactions = self.states[f].reactions.clone();

            if instantiated.len() == 1 {
                let nest = self.nestify(instantiated[0], f, conds, influences, reactions);
                self.states[f].initial = Some(nest);
                continue;
            }

            let init = self.add_full(
                "INIT",
                Some(f),
                Tags::default(),
                conds.clone(),
                influences.clone(),
                reactions.clone(),
            );
            self.states[f].initial = Some(init);
            self.states[f].enter_advance = true;

            let mut nests = Vec::new();
            for &c in &instantiated {
                let mutex: Vec<Guard> = instantiated
                    .iter()
                    .filter(|o| **o != c)
                    .map(|o| Guard::IsFix(*o))
                    .collect();
                let mut nest_conds = conds.clone();
                nest_conds.extend(mutex.iter().cloned());
                let nest = self.nestify(c, f, nest_conds, influences.clone(), reactions.clone());
                nests.push((c, nest, mutex));
            }
            for (c, nest, mutex) in &nests {
                let mut sources = vec![init];
                sources.extend(
                    nests
                        .iter()
                        .filter(|(other, _, _)| other != c)
                        .map(|(_, n, _)| *n),
                );
                let mut guards = mutex.clone();
                guards.push(Guard::IsFlow(*c));
                self.transitions.push(Transition {
                    sources,
                    dest: Some(*nest),
                    guards,
                });
            }
        }
    }

    /// The behavioral sub-space induced by one control.
    fn nestify(
        &mut self,
        c: usize,
        parent: usize,
        conds: Vec<Guard>,
        influences: Vec<usize>,
        reactions: Vec<usize>,
    ) -> usize {
        let itf = self.itf;
        let ctrl = &itf.controls()[c];
        let name = ctrl.name().to_uppercase();
        let allowance_delayed = ctrl.allowance() > 0;
        let latency_delayed = ctrl.latency() > 0;

        let nest = self.add_full(
            &name,
            Some(parent),
            Tags::default(),
            conds.clone(),
            influences.clone(),
            reactions.clone(),
        );
        self.states[nest].enter_advance = true;

        let flw = self.value_group(nest, c, true, allowance_delayed, &conds, &influences, &reactions);
        let fxd = self.value_group(nest, c, false, latency_delayed, &conds, &influences, &reactions);
        let init = self.add_full(
            "INIT",
            Some(nest),
            Tags::default(),
            conds.clone(),
            influences.clone(),
            reactions.clone(),
        );
        self.states[nest].initial = Some(init);

        let mut to_flow = conds.clone();
        to_flow.push(Guard::IsFlow(c));
        self.transitions.push(Transition {
            sources: vec![init, fxd],
            dest: Some(flw),
            guards: to_flow,
        });
        let mut to_fix = conds;
        to_fix.push(Guard::IsFix(c));
        self.transitions.push(Transition {
            sources: vec![init, flw],
            dest: Some(fxd),
            guards: to_fix,
        });
        nest
    }

    /// `FLW` or `FXD`: one value state per flow/fix value plus an `INIT`
    /// stub, entered by sampling the matching value.
    #[allow(clippy::too_many_arguments)]
    fn value_group(
        &mut self,
        nest: usize,
        c: usize,
        flow: bool,
        delayed: bool,
        conds: &[Guard],
        influences: &[usize],
        reactions: &[usize],
    ) -> usize {
        let group = self.add_full(
            if flow { "FLW" } else { "FXD" },
            Some(nest),
            Tags::default(),
            conds.to_vec(),
            influences.to_vec(),
            reactions.to_vec(),
        );
        self.states[group].enter_advance = true;
        let init = self.add_full(
            "INIT",
            Some(group),
            Tags::default(),
            conds.to_vec(),
            influences.to_vec(),
            reactions.to_vec(),
        );
        self.states[group].initial = Some(init);

        let values: Vec<bool> = if flow {
            self.itf.controls()[c].flow_vals().iter().copied().collect()
        } else {
            self.itf.controls()[c].fix_vals().iter().copied().collect()
        };
        let mut nodes = Vec::new();
        for v in &values {
            nodes.push((
                *v,
                self.value_state(group, c, *v, flow, delayed, conds, influences, reactions),
            ));
        }
        for (v, node) in &nodes {
            let mut sources = vec![init];
            sources.extend(nodes.iter().filter(|(o, _)| o != v).map(|(_, n)| *n));
            let mut guards = conds.to_vec();
            guards.push(Guard::Eq(c, *v));
            self.transitions.push(Transition {
                sources,
                dest: Some(*node),
                guards,
            });
        }
        group
    }

    /// One distinct control value: a tagged `BASE` leaf and, when delayed,
    /// a volatile wait sibling bounding how long the sample may stay away.
    #[allow(clippy::too_many_arguments)]
    fn value_state(
        &mut self,
        group: usize,
        c: usize,
        v: bool,
        flow: bool,
        delayed: bool,
        conds: &[Guard],
        influences: &[usize],
        reactions: &[usize],
    ) -> usize {
        let cname = self.itf.controls()[c].name();
        let mut reactions = reactions.to_vec();
        reactions.extend(
            self.reactions
                .iter()
                .filter(|r| r.cname == cname && r.val == v)
                .map(|r| r.id),
        );

        let vnode = self.add_full(
            if v { "TRUE" } else { "FALSE" },
            Some(group),
            Tags::default(),
            conds.to_vec(),
            influences.to_vec(),
            reactions.clone(),
        );
        let positive = Guard::Eq(c, v);
        let negative = Guard::Ne(c, v);
        let side = if flow { Tags::flow() } else { Tags::fix() };

        let mut base_conds = conds.to_vec();
        base_conds.push(positive.clone());
        let base = self.add_full(
            "BASE",
            Some(vnode),
            side,
            base_conds.clone(),
            influences.to_vec(),
            reactions.clone(),
        );
        self.states[vnode].initial = Some(base);
        self.transitions.push(Transition {
            sources: vec![base],
            dest: None,
            guards: base_conds,
        });

        if delayed {
            let mut wait_conds = conds.to_vec();
            wait_conds.push(negative.clone());
            let wait = self.add_full(
                if flow { "ALLOWANCE" } else { "LATENCY" },
                Some(vnode),
                side.waiting(),
                wait_conds.clone(),
                influences.to_vec(),
                reactions,
            );
            self.states[wait].wait = Some(WaitSpec {
                bound: if flow {
                    WaitBound::Allowance(c)
                } else {
                    WaitBound::Latency(c)
                },
                positive,
                negative,
                conds: conds.to_vec(),
                base,
            });
            self.transitions.push(Transition {
                sources: vec![base],
                dest: Some(wait),
                guards: wait_conds,
            });
        }
        vnode
    }
}
