//! Error-block detection and specification inference.
//!
//! The module-level fixed point at the heart of the tool. Seeded by the
//! error-only function list (any constant that can be returned after calling
//! one is an error value of the caller) and optionally by user-supplied
//! specifications, it repeatedly sweeps the module lifting abstract error
//! return values up the call graph: a block constrained to a callee's error
//! interval contributes whatever it returns to its own function's AERV.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use serde::{Deserialize, Serialize};

use crate::commons::Valid;

use super::analysis::return_constraints::ReturnConstraints;
use super::analysis::return_propagation::ReturnPropagation;
use super::analysis::returned_values::ReturnedValues;
use super::constraint::{Constraint, Interval};
use super::ir::*;

// SECTION: configuration

/// Integer constants treated as prima-facie error returns, as found in the
/// codebases the tool was tuned on. Overridable from the command line.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorCodeList {
    pub codes: Vec<i64>,
}

impl Default for ErrorCodeList {
    fn default() -> Self {
        ErrorCodeList {
            codes: vec![
                -114, -214, -314, -414, -514, -614, -714, -814, -914, -1014, -1114, -1214,
                -1314, -1414, -1514, -1614, -1714, -1814, -1914, -2014, -2114, -2214, -2314,
                -2414, -2514, -2614, -2714, -2814, -2914, -3014, -3114, -3214, -3314, -3414,
                114,
            ],
        }
    }
}

/// Read an error-only file: one function name per line.
pub fn parse_error_only(text: &str) -> Set<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

// SECTION: inference

pub struct ErrorBlocks {
    error_only: Set<String>,
    error_codes: Set<i64>,
    /// The specifications: `fname -> abstract error return value`.
    aervs: Map<String, Constraint>,
    /// Concrete integer-like constants seen as error returns, per function.
    /// Input specifications land in `aervs` only, so the key sets differ.
    error_return_values: Map<String, Set<i64>>,
    /// `(from, to)`: `to`'s AERV grew because it returns a value that holds
    /// the result of calling `from`.
    pub error_propagation: Set<(String, String)>,
    /// Functions whose AERV was seeded by an error-only call.
    pub error_only_bootstrap: Set<String>,
}

impl ErrorBlocks {
    pub fn new(
        error_only: Set<String>,
        input_specs: Map<String, Constraint>,
        error_codes: ErrorCodeList,
    ) -> Self {
        if error_only.is_empty() {
            eprintln!("WARNING: EMPTY ERROR-ONLY SET!");
        }
        if input_specs.is_empty() {
            eprintln!("WARNING: EMPTY INPUT SPECS LIST!");
        }

        ErrorBlocks {
            error_only,
            error_codes: error_codes.codes.into_iter().collect(),
            aervs: input_specs,
            error_return_values: Map::new(),
            error_propagation: Set::new(),
            error_only_bootstrap: Set::new(),
        }
    }

    /// The inferred specifications, keyed and ordered by function name.
    pub fn specs(&self) -> &Map<String, Constraint> {
        &self.aervs
    }

    pub fn aerv(&self, fname: &str) -> Option<&Constraint> {
        self.aervs.get(fname)
    }

    /// Run inference to a fixed point. Returns the number of module sweeps.
    pub fn run(
        &mut self,
        module: &Valid<Module>,
        rp: &ReturnPropagation,
        rv: &ReturnedValues,
        rc: &ReturnConstraints,
    ) -> usize {
        let module = &module.0;

        let mut sweeps = 0;
        let mut changed = true;
        while changed {
            changed = false;
            sweeps += 1;
            for func in module.func_ids() {
                for &bb in &module.func(func).blocks {
                    changed = self.visit_block(module, bb, rp, rv, rc) || changed;
                }
            }
        }
        sweeps
    }

    fn visit_block(
        &mut self,
        module: &Module,
        bb: BlockId,
        rp: &ReturnPropagation,
        rv: &ReturnedValues,
        rc: &ReturnConstraints,
    ) -> bool {
        let parent = module.func(module.block(bb).func).name.clone();
        let mut changed = false;

        // Calls to error-only functions poison every value that can still be
        // returned from this point on.
        for &i in &module.block(bb).insts {
            if let Some(callee) = module.callee_name(i) {
                if self.error_only.contains(callee) {
                    changed = self.visit_error_only_call(module, rv, i, &parent) || changed;
                }
            }
        }

        let constraints = rc.out_fact(module.last_inst(bb));
        let returned = rv.in_fact(module.first_inst(bb));

        // More than one candidate return value makes the block too ambiguous
        // to learn from.
        if returned.value.len() > 1 {
            return changed;
        }

        // Well-known error codes count as error returns wherever they occur.
        for v in &returned.value {
            if let ValueRef::Const(c) = v {
                if self.error_codes.contains(c) {
                    changed = self.add_error_value(&parent, *c) || changed;
                }
            }
        }

        for (constraint_fname, block_constraint) in &constraints.value {
            // No AERV yet: the block constraint cannot make this an error
            // block.
            let Some(constraint_aerv) = self.aervs.get(constraint_fname) else {
                continue;
            };

            // The block runs when `constraint_fname` may have failed iff the
            // path constraint overlaps its error interval.
            if block_constraint.meet(constraint_aerv).interval == Interval::Bot {
                continue;
            }

            for &returned_value in &returned.value {
                let mut contribution = Interval::Bot;
                let mut propagated_from: Option<String> = None;

                if block_constraint.interval != Interval::Top {
                    match returned_value {
                        ValueRef::Const(c) => {
                            contribution = Interval::of_int(c);
                            propagated_from = Some(constraint_fname.clone());
                        }
                        ValueRef::Null => {
                            contribution = Interval::of_int(0);
                            propagated_from = Some(constraint_fname.clone());
                        }
                        _ => {}
                    }
                }

                if let ValueRef::Inst(i) = returned_value {
                    if matches!(module.inst(i).kind, InstKind::Call { .. }) {
                        // Direct propagation: the block returns a call result.
                        if let Some(callee) = module.callee_name(i) {
                            if let Some(callee_aerv) = self.aervs.get(callee) {
                                contribution = callee_aerv.interval;
                                propagated_from = Some(callee.to_string());
                            }
                        }
                    } else {
                        // Indirect propagation: the returned value may hold a
                        // call result at the end of this block. More than one
                        // holder is too imprecise to use.
                        let held = rp.out_fact(module.last_inst(bb)).held_values(returned_value);
                        if held.len() > 1 {
                            continue;
                        }
                        for h in held {
                            let ValueRef::Inst(call) = h else { continue };
                            if let Some(callee) = module.callee_name(call) {
                                if let Some(callee_aerv) = self.aervs.get(callee) {
                                    contribution = callee_aerv.interval;
                                    propagated_from = Some(callee.to_string());
                                }
                            }
                        }
                    }
                }

                let grew = self.join_aerv(&parent, contribution);
                if grew {
                    if let Some(from) = propagated_from {
                        self.error_propagation.insert((from, parent.clone()));
                    }
                }
                changed = grew || changed;
            }
        }

        changed
    }

    // Every constant that can be returned after the error-only call becomes
    // an error value of the caller.
    fn visit_error_only_call(
        &mut self,
        module: &Module,
        rv: &ReturnedValues,
        call: InstId,
        parent: &str,
    ) -> bool {
        let mut changed = false;

        for &v in &rv.out_fact(module, call).value {
            match v {
                ValueRef::Const(c) => changed = self.add_error_value(parent, c) || changed,
                ValueRef::Null => changed = self.add_error_value(parent, 0) || changed,
                _ => {}
            }
        }
        self.error_only_bootstrap.insert(parent.to_string());

        changed
    }

    fn add_error_value(&mut self, fname: &str, v: i64) -> bool {
        let mut changed = self
            .error_return_values
            .entry(fname.to_string())
            .or_default()
            .insert(v);

        changed = self.join_aerv(fname, Interval::of_int(v)) || changed;
        changed
    }

    fn join_aerv(&mut self, fname: &str, interval: Interval) -> bool {
        let contribution = Constraint::with_interval(fname, interval);
        match self.aervs.get_mut(fname) {
            Some(existing) => {
                let joined = existing.join(&contribution);
                let grew = joined.interval != existing.interval;
                *existing = joined;
                grew
            }
            None => {
                self.aervs.insert(fname.to_string(), contribution);
                true
            }
        }
    }
}
