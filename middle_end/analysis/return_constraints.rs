//! Forward flow: at each program point, the tightest known interval on the
//! most recent result of each callee along every path reaching that point.
//!
//! A call resets its callee to `top` (the fresh result is unconstrained). A
//! conditional branch whose condition compares a value that may hold a call
//! result splits that callee's interval: the compare abstraction is attached
//! to the two outgoing edges as a refinement, and the callee is killed to
//! `bottom` in the branch block's own out-fact. A block entry is the join,
//! over its incoming edges, of the predecessor out-fact with that edge's
//! refinement applied — so the split survives the merge join instead of
//! being drowned by it.

use std::collections::BTreeMap as Map;

use crate::commons::Valid;

use super::super::constraint::{abstract_icmp, Constraint, Interval};
use super::super::ir::*;
use super::return_propagation::ReturnPropagation;
use super::{BlockFactTable, Cfg, FactTable};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReturnConstraintsFact {
    pub value: Map<String, Constraint>,
}

impl ReturnConstraintsFact {
    fn join_with(&mut self, other: &ReturnConstraintsFact) {
        for (fname, c) in &other.value {
            match self.value.get_mut(fname) {
                Some(existing) => *existing = existing.join(c),
                None => {
                    self.value.insert(fname.clone(), c.clone());
                }
            }
        }
    }
}

pub struct ReturnConstraints {
    entry: BlockFactTable<ReturnConstraintsFact>,
    out: FactTable<ReturnConstraintsFact>,
    /// Branch refinements, keyed by CFG edge: on this edge, these callee
    /// results are known to lie in these intervals.
    refinements: Map<(BlockId, BlockId), Map<String, Constraint>>,
}

pub fn analyze(module: &Valid<Module>, return_propagation: &ReturnPropagation) -> ReturnConstraints {
    let module = &module.0;

    let mut analysis = ReturnConstraints {
        entry: BlockFactTable::new(module),
        out: FactTable::new(module),
        refinements: Map::new(),
    };

    for func in module.func_ids() {
        if module.func(func).is_defined() {
            analysis.run_on_function(module, func, return_propagation);
        }
    }

    analysis
}

impl ReturnConstraints {
    /// The fact just after the instruction; queried at block terminators.
    pub fn out_fact(&self, i: InstId) -> &ReturnConstraintsFact {
        self.out.get(i)
    }

    fn run_on_function(&mut self, module: &Module, func: FuncId, rp: &ReturnPropagation) {
        let cfg = Cfg::new(module, func);
        let blocks = module.func(func).blocks.clone();

        let mut changed = true;
        while changed {
            changed = false;
            for &bb in &blocks {
                let mut entry = ReturnConstraintsFact::default();
                for pred in cfg.pred(bb) {
                    let mut contribution = self.out.get(module.last_inst(pred)).clone();
                    if let Some(refinement) = self.refinements.get(&(pred, bb)) {
                        for (fname, c) in refinement {
                            contribution.value.insert(fname.clone(), c.clone());
                        }
                    }
                    entry.join_with(&contribution);
                }
                self.entry.set(bb, entry.clone());

                let mut fact = entry;
                for &i in &module.block(bb).insts {
                    self.transfer(module, rp, bb, i, &mut fact);
                    if fact != *self.out.get(i) {
                        self.out.set(i, fact.clone());
                        changed = true;
                    }
                }
            }
        }
    }

    fn transfer(
        &mut self,
        module: &Module,
        rp: &ReturnPropagation,
        bb: BlockId,
        id: InstId,
        fact: &mut ReturnConstraintsFact,
    ) {
        use InstKind::*;

        match &module.inst(id).kind {
            Call { .. } => {
                if let Some(name) = module.callee_name(id) {
                    // A new call invalidates whatever the current path knew
                    // about this callee's previous result.
                    fact.value.insert(
                        name.to_string(),
                        Constraint::with_interval(name, Interval::Top),
                    );
                }
            }
            CondBranch { cond, tt, ff } => {
                let ValueRef::Inst(cmp) = cond else { return };
                let ICmp { pred, lhs, rhs } = &module.inst(*cmp).kind else { return };
                let (true_interval, false_interval) = abstract_icmp(*pred, *lhs, *rhs);

                // Which call results does the tested operand carry?
                let tested = rp.in_fact(module, *cmp).held_values(*lhs);
                for v in tested {
                    let ValueRef::Inst(call) = v else { continue };
                    let Some(fname) = module.callee_name(call) else { continue };

                    // Kill the tested callee here so this block's out-fact
                    // contributes nothing for it; the refined intervals enter
                    // through the edges instead.
                    fact.value.insert(
                        fname.to_string(),
                        Constraint::with_interval(fname, Interval::Bot),
                    );

                    let loc = module.inst(*cmp).loc.clone();
                    let mut true_c = Constraint::with_interval(fname, true_interval);
                    true_c.loc = loc.clone();
                    let mut false_c = Constraint::with_interval(fname, false_interval);
                    false_c.loc = loc;

                    self.refinements
                        .entry((bb, *tt))
                        .or_default()
                        .insert(fname.to_string(), true_c);
                    self.refinements
                        .entry((bb, *ff))
                        .or_default()
                        .insert(fname.to_string(), false_c);
                }
            }
            _ => {}
        }
    }
}
