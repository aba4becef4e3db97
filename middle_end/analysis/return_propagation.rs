//! Pointer-aware value flow: for every program point, which values (call
//! results in particular) each storage location may currently hold.
//!
//! The memory model is deliberately coarse. A `MemVal` names either a
//! concrete SSA value or a synthetic memory cell discovered when an address
//! is first dereferenced; field accesses with constant indices refine a tag
//! with up to two index annotations. This is enough to follow the dominant C
//! idiom where a call result lands in a local, travels through stores, loads,
//! casts and field slots, and is later compared, returned or passed on.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use crate::commons::Valid;

use super::super::ir::*;
use super::{BlockFactTable, Cfg, FactTable};

// SECTION: memory values

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemBase {
    /// A concrete SSA value: call result, parameter, address, constant.
    Value(ValueRef),
    /// A synthetic cell standing for memory we have no other name for.
    Ref(u64),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemVal {
    pub base: MemBase,
    pub idx1: i64,
    pub idx2: i64,
}

impl MemVal {
    pub fn value(v: ValueRef) -> Self {
        MemVal {
            base: MemBase::Value(v),
            idx1: 0,
            idx2: 0,
        }
    }

    fn fresh(idx: u64) -> Self {
        MemVal {
            base: MemBase::Ref(idx),
            idx1: 0,
            idx2: 0,
        }
    }

    pub fn is_ref(&self) -> bool {
        matches!(self.base, MemBase::Ref(_))
    }

    fn render(&self, m: &Module) -> String {
        let base = match self.base {
            MemBase::Value(v) => m.render_value(v),
            MemBase::Ref(idx) => format!("ref{idx}"),
        };
        format!("({}-{}-{})", base, self.idx1, self.idx2)
    }
}

// SECTION: facts

/// `storage -> possible contents`, pointwise-unioned at merges.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValueFlowFact {
    pub value: Map<MemVal, Set<MemVal>>,
}

impl ValueFlowFact {
    fn join_with(&mut self, other: &ValueFlowFact) {
        for (key, vals) in &other.value {
            self.value.entry(*key).or_default().extend(vals.iter().copied());
        }
    }

    /// May `var` currently hold the result of the given call instruction?
    pub fn value_may_hold(&self, var: ValueRef, call: InstId) -> bool {
        match self.value.get(&MemVal::value(var)) {
            Some(held) => held.contains(&MemVal::value(ValueRef::Inst(call))),
            None => false,
        }
    }

    /// The concrete SSA values `var` may hold (synthetic cells excluded).
    pub fn held_values(&self, var: ValueRef) -> Set<ValueRef> {
        let mut held = Set::new();
        if let Some(vals) = self.value.get(&MemVal::value(var)) {
            for mv in vals {
                if let MemBase::Value(v) = mv.base {
                    held.insert(v);
                }
            }
        }
        held
    }

    fn render(&self, m: &Module) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        for (key, vals) in &self.value {
            let vals: Vec<_> = vals.iter().map(|v| v.render(m)).collect();
            let _ = writeln!(out, "{}: {}", key.render(m), vals.join(" "));
        }
        out
    }
}

// SECTION: the analysis

pub struct ReturnPropagation {
    entry: BlockFactTable<ValueFlowFact>,
    out: FactTable<ValueFlowFact>,
    prev_inst: Vec<Option<InstId>>,
    // Synthetic cells are memoized per (instruction, key) so that revisiting
    // an instruction during the fixed point reproduces the same cell instead
    // of minting a new one.
    fresh_refs: Map<(InstId, MemVal), u64>,
    next_idx: u64,
}

pub fn analyze(module: &Valid<Module>) -> ReturnPropagation {
    let module = &module.0;

    let mut prev_inst = vec![None; module.insts.len()];
    for block in &module.blocks {
        for pair in block.insts.windows(2) {
            prev_inst[pair[1].0 as usize] = Some(pair[0]);
        }
    }

    let mut analysis = ReturnPropagation {
        entry: BlockFactTable::new(module),
        out: FactTable::new(module),
        prev_inst,
        fresh_refs: Map::new(),
        next_idx: 0,
    };

    for func in module.func_ids() {
        if module.func(func).is_defined() {
            analysis.run_on_function(module, func);
        }
    }

    analysis
}

impl ReturnPropagation {
    /// The fact just before the instruction executes.
    pub fn in_fact<'a>(&'a self, module: &Module, i: InstId) -> &'a ValueFlowFact {
        match self.prev_inst[i.0 as usize] {
            Some(prev) => self.out.get(prev),
            None => self.entry.get(module.inst(i).block),
        }
    }

    /// The fact just after the instruction executes.
    pub fn out_fact(&self, i: InstId) -> &ValueFlowFact {
        self.out.get(i)
    }

    fn run_on_function(&mut self, module: &Module, func: FuncId) {
        let cfg = Cfg::new(module, func);
        let blocks = module.func(func).blocks.clone();

        let mut changed = true;
        while changed {
            changed = false;
            for &bb in &blocks {
                let mut entry = self.entry.get(bb).clone();
                for pred in cfg.pred(bb) {
                    entry.join_with(self.out.get(module.last_inst(pred)));
                }
                if entry != *self.entry.get(bb) {
                    self.entry.set(bb, entry.clone());
                    changed = true;
                }

                let mut fact = entry;
                for &i in &module.block(bb).insts {
                    self.transfer(module, i, &mut fact);
                    if fact != *self.out.get(i) {
                        self.out.set(i, fact.clone());
                        changed = true;
                    }
                }
            }
        }
    }

    fn transfer(&mut self, module: &Module, id: InstId, fact: &mut ValueFlowFact) {
        use InstKind::*;

        let result = MemVal::value(ValueRef::Inst(id));
        match &module.inst(id).kind {
            Call { callee, .. } => {
                if let Callee::Direct(name) = callee {
                    if is_intrinsic(name) {
                        return;
                    }
                }
                // The call result holds itself; downstream copies preserve
                // this identity.
                fact.value.entry(result).or_default().insert(result);
            }
            Load { addr } => {
                let sources = self.find_or_create(id, fact, MemVal::value(*addr));
                let mut loaded = Set::new();
                for src in sources {
                    loaded.extend(self.find_or_create(id, fact, src));
                }
                fact.value.insert(result, loaded);
            }
            Store { value, addr } => {
                let sender = MemVal::value(*value);
                let sent = fact.value.get(&sender).cloned();
                let receivers = self.find_or_create(id, fact, MemVal::value(*addr));
                // Constants and other unseen values are stored as themselves.
                let sent = sent.unwrap_or_else(|| Set::from([sender]));
                for receiver in receivers {
                    fact.value.insert(receiver, sent.clone());
                }
            }
            Bitcast { value, .. } | PtrToInt { value, .. } => {
                fact.value.insert(result, Set::from([MemVal::value(*value)]));
            }
            Binary { lhs, .. } => {
                fact.value.insert(result, Set::from([MemVal::value(*lhs)]));
            }
            Gep { base, indices } => {
                let cells = self.transfer_gep(id, fact, *base, indices);
                fact.value.insert(result, cells);
            }
            Alloca { .. } => {
                self.find_or_create(id, fact, result);
            }
            Phi { incoming } => {
                // Phi collects the identities of its inputs, not their
                // pointed-to contents.
                let slot = fact.value.entry(result).or_default();
                for &(v, _) in incoming {
                    slot.insert(MemVal::value(v));
                }
            }
            _ => {}
        }
    }

    // Cells a field/element address may denote. Only two levels of constant
    // indices are tracked; anything else collapses to a fresh cell.
    fn transfer_gep(
        &mut self,
        id: InstId,
        fact: &mut ValueFlowFact,
        base: ValueRef,
        indices: &[ValueRef],
    ) -> Set<MemVal> {
        let result = MemVal::value(ValueRef::Inst(id));
        let (idx1, idx2) = match indices {
            [ValueRef::Const(i1), ValueRef::Const(i2), ..] => (*i1, *i2),
            _ => {
                let idx = self.ref_index(id, result);
                return Set::from([MemVal::fresh(idx)]);
            }
        };

        self.find_or_create(id, fact, MemVal::value(base))
            .into_iter()
            .map(|mv| MemVal {
                base: mv.base,
                idx1,
                idx2,
            })
            .collect()
    }

    // Look up the contents of `key`, initializing unseen memory with a cell
    // disjoint from everything else.
    fn find_or_create(&mut self, at: InstId, fact: &mut ValueFlowFact, key: MemVal) -> Set<MemVal> {
        if !fact.value.contains_key(&key) {
            let idx = self.ref_index(at, key);
            fact.value.insert(key, Set::from([MemVal::fresh(idx)]));
        }
        fact.value[&key].clone()
    }

    fn ref_index(&mut self, at: InstId, key: MemVal) -> u64 {
        if let Some(&idx) = self.fresh_refs.get(&(at, key)) {
            return idx;
        }
        let idx = self.next_idx;
        self.next_idx += 1;
        self.fresh_refs.insert((at, key), idx);
        idx
    }

    /// Dump the facts of one function to stderr (the `--debugfunction` hook).
    pub fn dump(&self, module: &Module, func: FuncId) {
        for i in module.func_insts(func) {
            eprintln!("=====");
            eprint!("{}", self.in_fact(module, i).render(module));
            eprintln!("---");
            eprintln!("{}", module.render_inst(i));
            eprintln!("---");
            eprint!("{}", self.out_fact(i).render(module));
            eprintln!("=====");
            eprintln!();
        }
    }
}
