//! Intraprocedural dataflow analyses over IR modules.
//!
//! Every analysis follows the same plan: facts are stored in vectors indexed
//! by instruction or block id, and a per-function loop re-runs the block
//! transfer functions until nothing changes. There is no worklist; the fact
//! lattices are small enough that sweeping the blocks in layout order
//! converges quickly.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use super::ir::*;

pub mod return_constraints;
pub mod return_propagation;
pub mod returned_values;

#[cfg(test)]
mod tests;

/// The control-flow graph of one function: successor and predecessor edges
/// derived from the block terminators.
#[derive(Clone, Debug)]
pub struct Cfg {
    pub entry: BlockId,
    succ_edges: Map<BlockId, Set<BlockId>>,
    pred_edges: Map<BlockId, Set<BlockId>>,
}

impl Cfg {
    pub fn new(module: &Module, func: FuncId) -> Self {
        let f = module.func(func);
        let mut succ_edges: Map<BlockId, Set<BlockId>> = Map::new();
        let mut pred_edges: Map<BlockId, Set<BlockId>> = Map::new();

        for &bb in &f.blocks {
            succ_edges.entry(bb).or_default();
            pred_edges.entry(bb).or_default();
        }
        for &bb in &f.blocks {
            let term = module.last_inst(bb);
            for succ in module.inst(term).kind.successors() {
                succ_edges.get_mut(&bb).unwrap().insert(succ);
                pred_edges.get_mut(&succ).unwrap().insert(bb);
            }
        }

        Cfg {
            entry: f.entry(),
            succ_edges,
            pred_edges,
        }
    }

    pub fn succ(&self, bb: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        self.succ_edges[&bb].iter().copied()
    }

    pub fn pred(&self, bb: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        self.pred_edges[&bb].iter().copied()
    }
}

/// A per-instruction fact vector, one slot per instruction in the module.
#[derive(Clone, Debug)]
pub struct FactTable<F> {
    facts: Vec<F>,
}

impl<F: Clone + Default> FactTable<F> {
    pub fn new(module: &Module) -> Self {
        FactTable {
            facts: vec![F::default(); module.insts.len()],
        }
    }

    pub fn get(&self, i: InstId) -> &F {
        &self.facts[i.0 as usize]
    }

    pub fn get_mut(&mut self, i: InstId) -> &mut F {
        &mut self.facts[i.0 as usize]
    }

    pub fn set(&mut self, i: InstId, fact: F) {
        self.facts[i.0 as usize] = fact;
    }
}

/// A per-block fact vector, one slot per block in the module.
#[derive(Clone, Debug)]
pub struct BlockFactTable<F> {
    facts: Vec<F>,
}

impl<F: Clone + Default> BlockFactTable<F> {
    pub fn new(module: &Module) -> Self {
        BlockFactTable {
            facts: vec![F::default(); module.blocks.len()],
        }
    }

    pub fn get(&self, b: BlockId) -> &F {
        &self.facts[b.0 as usize]
    }

    pub fn get_mut(&mut self, b: BlockId) -> &mut F {
        &mut self.facts[b.0 as usize]
    }

    pub fn set(&mut self, b: BlockId, fact: F) {
        self.facts[b.0 as usize] = fact;
    }
}
