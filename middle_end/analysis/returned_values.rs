//! Backward flow: at each program point, the set of SSA values that can
//! still reach a return instruction along some path.
//!
//! Copies (loads, casts, truncations, extensions) are traced back to their
//! operands; stores swap the stored value in for the overwritten address; a
//! phi pushes its incoming values out to the predecessor block exits. Calls
//! whose result can be returned are recorded in the interprocedural
//! return-propagation map, and the kernel `ERR_PTR`/`IS_ERR`/`PTR_ERR`/
//! `ERR_CAST` wrappers are modeled as passing their first argument through.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use crate::commons::Valid;

use super::super::ir::*;
use super::{BlockFactTable, Cfg, FactTable};

const ERROR_WRAPPER_IDIOMS: [&str; 4] = ["ERR_PTR", "IS_ERR", "PTR_ERR", "ERR_CAST"];

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReturnedValuesFact {
    pub value: Set<ValueRef>,
}

impl ReturnedValuesFact {
    fn join_with(&mut self, other: &ReturnedValuesFact) {
        self.value.extend(other.value.iter().copied());
    }
}

pub struct ReturnedValues {
    in_facts: FactTable<ReturnedValuesFact>,
    exit: BlockFactTable<ReturnedValuesFact>,
    next_inst: Vec<Option<InstId>>,
    /// `caller name -> callee names whose results the caller may return`.
    pub return_propagated: Map<String, Set<String>>,
}

pub fn analyze(module: &Valid<Module>) -> ReturnedValues {
    let module = &module.0;

    let mut next_inst = vec![None; module.insts.len()];
    for block in &module.blocks {
        for pair in block.insts.windows(2) {
            next_inst[pair[0].0 as usize] = Some(pair[1]);
        }
    }

    let mut analysis = ReturnedValues {
        in_facts: FactTable::new(module),
        exit: BlockFactTable::new(module),
        next_inst,
        return_propagated: Map::new(),
    };

    for func in module.func_ids() {
        if module.func(func).is_defined() {
            analysis.run_on_function(module, func);
        }
    }

    analysis
}

impl ReturnedValues {
    /// The fact just before the instruction (in execution order).
    pub fn in_fact(&self, i: InstId) -> &ReturnedValuesFact {
        self.in_facts.get(i)
    }

    /// The fact just after the instruction (in execution order).
    pub fn out_fact<'a>(&'a self, module: &Module, i: InstId) -> &'a ReturnedValuesFact {
        match self.next_inst[i.0 as usize] {
            Some(next) => self.in_facts.get(next),
            None => self.exit.get(module.inst(i).block),
        }
    }

    fn run_on_function(&mut self, module: &Module, func: FuncId) {
        let cfg = Cfg::new(module, func);
        let blocks = module.func(func).blocks.clone();

        let mut changed = true;
        while changed {
            changed = false;
            for &bb in &blocks {
                let mut exit = self.exit.get(bb).clone();
                for succ in cfg.succ(bb) {
                    exit.join_with(self.in_facts.get(module.first_inst(succ)));
                }
                if exit != *self.exit.get(bb) {
                    self.exit.set(bb, exit.clone());
                    changed = true;
                }

                let mut fact = exit;
                for &i in module.block(bb).insts.iter().rev() {
                    // `fact` is the out-fact of `i` here.
                    let in_fact = self.transfer(module, i, &fact, &mut changed);
                    if in_fact != *self.in_facts.get(i) {
                        self.in_facts.set(i, in_fact.clone());
                        changed = true;
                    }
                    fact = in_fact;
                }
            }
        }
    }

    fn transfer(
        &mut self,
        module: &Module,
        id: InstId,
        out: &ReturnedValuesFact,
        changed: &mut bool,
    ) -> ReturnedValuesFact {
        use InstKind::*;

        let mut fact = out.clone();
        let result = ValueRef::Inst(id);
        match &module.inst(id).kind {
            Ret { value: Some(v) } => {
                fact.value.insert(*v);
            }
            Call { args, .. } => {
                let Some(name) = module.callee_name(id) else {
                    return fact;
                };
                if out.value.contains(&result) {
                    let caller = module.func(module.func_of_inst(id)).name.clone();
                    self.return_propagated
                        .entry(caller)
                        .or_default()
                        .insert(name.to_string());

                    // The wrapper's "result" is really its argument.
                    let wraps = ERROR_WRAPPER_IDIOMS.iter().any(|idiom| name.contains(idiom));
                    if wraps {
                        if let Some(&arg) = args.first() {
                            fact.value.insert(arg);
                        }
                    }
                }
            }
            Store { value, addr } => {
                fact.value.remove(addr);
                if out.value.contains(addr) {
                    fact.value.insert(*value);
                }
            }
            Load { addr: operand }
            | Bitcast { value: operand, .. }
            | PtrToInt { value: operand, .. }
            | Trunc { value: operand, .. }
            | SExt { value: operand, .. } => {
                fact.value.remove(&result);
                if out.value.contains(&result) {
                    fact.value.insert(*operand);
                }
            }
            Phi { incoming } => {
                if !out.value.contains(&result) {
                    return fact;
                }
                fact.value.remove(&result);
                for &(v, pred) in incoming {
                    // The incoming value can reach a return from the end of
                    // its source block.
                    if self.exit.get_mut(pred).value.insert(v) {
                        *changed = true;
                    }
                }
            }
            _ => {}
        }
        fact
    }
}
