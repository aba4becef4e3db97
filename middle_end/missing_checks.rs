//! Find call sites whose result is never adequately checked, and error-only
//! calls reached on paths where every constrained callee looks successful.
//!
//! Consumes finalized specifications plus the value-flow and
//! branch-constraint facts. A call to a function with a spec counts as
//! checked when some instruction of the caller compares a value holding the
//! result with a sufficient interval, returns it, hands it to an
//! `IS_ERR`-style predicate, or switches on it.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use crate::commons::Valid;

use super::analysis::return_constraints::ReturnConstraints;
use super::analysis::return_propagation::ReturnPropagation;
use super::constraint::{abstract_icmp, Constraint, Interval};
use super::ir::*;

// SECTION: configuration and report

#[derive(Clone, Debug)]
pub struct MissingChecksConfig {
    /// Treat a callee as checked everywhere in a function once any one of
    /// its call sites there is sufficiently checked. Known to produce false
    /// negatives; kept for parity with older runs.
    pub conflate_checks: bool,
    /// Suppress unchecked-call reports in void-returning callers.
    pub filter_void: bool,
    /// How close (in module instruction numbering) a call must be to an
    /// error-only call for the inconsistency report to fire.
    pub check_distance: u32,
}

impl Default for MissingChecksConfig {
    fn default() -> Self {
        MissingChecksConfig {
            conflate_checks: false,
            filter_void: false,
            check_distance: 25,
        }
    }
}

/// An error-only call reached although some checked callee looks successful.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InconsistentReport {
    pub loc: String,
    pub success: Constraint,
    pub spec: Constraint,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UncheckedReport {
    pub loc: String,
    pub fname: String,
}

#[derive(Clone, Debug, Default)]
pub struct BugReport {
    pub inconsistent: Vec<InconsistentReport>,
    pub unchecked: Vec<UncheckedReport>,
    pub checked_calls: Map<String, u64>,
    pub unchecked_calls: Map<String, u64>,
}

// SECTION: the detector

pub struct MissingChecks {
    specs: Map<String, Constraint>,
    error_only: Set<String>,
    config: MissingChecksConfig,
    /// Per function, per callee: the union of block constraints under which
    /// some sufficient-looking check succeeded. Only used in conflated mode.
    handled: Map<FuncId, Map<String, Constraint>>,
    report: BugReport,
}

pub fn run(
    module: &Valid<Module>,
    rp: &ReturnPropagation,
    rc: &ReturnConstraints,
    specs: Map<String, Constraint>,
    error_only: Set<String>,
    config: MissingChecksConfig,
) -> BugReport {
    if specs.is_empty() {
        eprintln!("WARNING: EMPTY INPUT SPECS LIST!");
    }
    if error_only.is_empty() {
        eprintln!("WARNING: EMPTY ERROR-ONLY SET!");
    }

    let mut detector = MissingChecks {
        specs,
        error_only,
        config,
        handled: Map::new(),
        report: BugReport::default(),
    };

    let module = &module.0;
    if detector.config.conflate_checks {
        detector.populate_handled(module, rc);
    }

    for func in module.func_ids() {
        for i in module.func_insts(func) {
            if matches!(module.inst(i).kind, InstKind::Call { .. }) {
                detector.visit_call(module, rp, rc, i);
            }
        }
    }

    detector.report
}

impl MissingChecks {
    fn visit_call(
        &mut self,
        module: &Module,
        rp: &ReturnPropagation,
        rc: &ReturnConstraints,
        call: InstId,
    ) {
        let Some(fname) = module.callee_name(call) else {
            return;
        };
        let fname = fname.to_string();

        if self.error_only.contains(&fname) {
            self.check_inconsistent_handling(module, rc, call);
        }

        let Some(spec) = self.specs.get(&fname).cloned() else {
            return;
        };
        if spec.interval == Interval::Top {
            return;
        }

        let parent = module.func_of_inst(call);
        let mut checked = false;

        for i in module.func_insts(parent) {
            let in_fact = rp.in_fact(module, i);
            match &module.inst(i).kind {
                InstKind::ICmp { .. } => {
                    if self.check_is_sufficient(module, rp, i, call, &spec) {
                        checked = true;
                    }
                }
                InstKind::Ret { value: Some(v) } => {
                    // Propagating the result to the caller counts as checked.
                    if in_fact.value_may_hold(*v, call) {
                        checked = true;
                    }
                }
                InstKind::Call { args, .. } => {
                    let is_err_style = module
                        .callee_name(i)
                        .map_or(false, |name| name.contains("IS_ERR"));
                    if is_err_style && args.iter().any(|&a| in_fact.value_may_hold(a, call)) {
                        checked = true;
                    }
                }
                InstKind::Switch { cond, .. } => {
                    if in_fact.value_may_hold(*cond, call) {
                        checked = true;
                    }
                }
                _ => {}
            }
        }

        let filtered = self.config.filter_void && module.func(parent).ret_ty.is_void();

        self.report.checked_calls.entry(fname.clone()).or_insert(0);
        self.report.unchecked_calls.entry(fname.clone()).or_insert(0);

        if !checked && !filtered {
            *self.report.unchecked_calls.get_mut(&fname).unwrap() += 1;
            self.report.unchecked.push(UncheckedReport {
                loc: render_loc(module.inst(call).loc.as_ref()),
                fname,
            });
        } else {
            *self.report.checked_calls.get_mut(&fname).unwrap() += 1;
        }
    }

    fn check_is_sufficient(
        &self,
        module: &Module,
        rp: &ReturnPropagation,
        cmp: InstId,
        call: InstId,
        spec: &Constraint,
    ) -> bool {
        let InstKind::ICmp { pred, lhs, rhs } = &module.inst(cmp).kind else {
            return false;
        };
        let in_fact = rp.in_fact(module, cmp);

        for op in [*lhs, *rhs] {
            if !in_fact.value_may_hold(op, call) {
                continue;
            }
            if self.config.conflate_checks {
                let parent = module.func_of_inst(cmp);
                let Some(checked_union) =
                    self.handled.get(&parent).and_then(|h| h.get(&spec.fname))
                else {
                    return false;
                };
                if checked_union.covers(spec.interval) {
                    return true;
                }
            } else {
                let (true_interval, false_interval) = abstract_icmp(*pred, *lhs, *rhs);
                if true_interval.covers(spec.interval) || false_interval.covers(spec.interval) {
                    return true;
                }
            }
        }

        false
    }

    // An error-only call whose block shows a successful check of some spec'd
    // callee and no error evidence at all is handling inconsistently.
    fn check_inconsistent_handling(
        &mut self,
        module: &Module,
        rc: &ReturnConstraints,
        call: InstId,
    ) {
        let bb = module.inst(call).block;
        let constraints = rc.out_fact(module.last_inst(bb));

        let mut success: Option<(Constraint, Constraint)> = None;
        let mut have_no_error = true;

        for (constraint_fname, block_constraint) in &constraints.value {
            let Some(spec) = self.specs.get(constraint_fname) else {
                continue;
            };
            if block_constraint.interval == Interval::Top {
                continue;
            }

            if block_constraint.meet(spec).interval == Interval::Bot {
                success = Some((block_constraint.clone(), spec.clone()));
            } else {
                have_no_error = false;
            }
        }

        let Some((success_constraint, error_spec)) = success else {
            return;
        };
        if !have_no_error {
            return;
        }

        // Cut false positives: require a call to the checked function within
        // the last `check_distance` instructions of the module numbering.
        let near = module
            .insts
            .iter()
            .enumerate()
            .any(|(idx, _)| {
                let i = InstId(idx as u32);
                module.callee_name(i) == Some(success_constraint.fname.as_str())
                    && i.0 <= call.0
                    && call.0 - i.0 <= self.config.check_distance
            });
        if !near {
            return;
        }

        self.report.inconsistent.push(InconsistentReport {
            loc: render_loc(module.inst(call).loc.as_ref()),
            success: success_constraint,
            spec: error_spec,
        });
    }

    fn populate_handled(&mut self, module: &Module, rc: &ReturnConstraints) {
        for func in module.func_ids() {
            let per_func = self.handled.entry(func).or_default();
            for &bb in &module.func(func).blocks {
                let constraints = rc.out_fact(module.last_inst(bb));
                for (constraint_fname, block_constraint) in &constraints.value {
                    let Some(spec) = self.specs.get(constraint_fname) else {
                        continue;
                    };
                    if block_constraint.interval == Interval::Top {
                        continue;
                    }

                    let entry = per_func
                        .entry(constraint_fname.clone())
                        .or_insert_with(|| Constraint::new(constraint_fname));
                    if block_constraint.covers(spec.interval)
                        || spec.covers(block_constraint.interval)
                    {
                        *entry = entry.join(block_constraint);
                    }
                }
            }
        }
    }
}

fn render_loc(loc: Option<&Loc>) -> String {
    match loc {
        Some(loc) => loc.to_string(),
        None => ":0".to_string(),
    }
}

// SECTION: tests

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::front_end::parse_module;

    use super::super::analysis::{return_constraints, return_propagation};
    use super::super::constraint::Constraint;
    use super::*;

    fn detect(ir: &str, specs: &[(&str, Interval)], config: MissingChecksConfig) -> BugReport {
        detect_with_error_only(ir, specs, &["EO"], config)
    }

    fn detect_with_error_only(
        ir: &str,
        specs: &[(&str, Interval)],
        error_only: &[&str],
        config: MissingChecksConfig,
    ) -> BugReport {
        let module = parse_module(ir).unwrap();
        let rp = return_propagation::analyze(&module);
        let rc = return_constraints::analyze(&module, &rp);
        let specs: Map<String, Constraint> = specs
            .iter()
            .map(|(fname, interval)| {
                (fname.to_string(), Constraint::with_interval(*fname, *interval))
            })
            .collect();
        let error_only: Set<String> = error_only.iter().map(|s| s.to_string()).collect();
        run(&module, &rp, &rc, specs, error_only, config)
    }

    #[test]
    fn unchecked_call_is_reported() {
        let ir = r#"
fn @foo() -> i64;
fn @caller() -> i64 {
entry:
  %x = call @foo() !"t.c":5
  ret 0
}
"#;
        let report = detect(ir, &[("foo", Interval::Ltz)], MissingChecksConfig::default());
        assert_eq!(
            report.unchecked,
            vec![UncheckedReport {
                loc: "t.c:5".to_string(),
                fname: "foo".to_string(),
            }]
        );
        assert_eq!(report.unchecked_calls["foo"], 1);
        assert_eq!(report.checked_calls["foo"], 0);
    }

    #[test]
    fn compare_and_return_both_count_as_checks() {
        let ir = r#"
fn @foo() -> i64;
fn @checked() -> i64 {
entry:
  %x = call @foo()
  %c = icmp slt %x, 0
  br %c, fail, ok
fail:
  ret %x
ok:
  ret 0
}
"#;
        let report = detect(ir, &[("foo", Interval::Ltz)], MissingChecksConfig::default());
        assert!(report.unchecked.is_empty());
        assert_eq!(report.checked_calls["foo"], 1);
    }

    #[test]
    fn insufficient_compare_is_still_unchecked() {
        // spec says != 0, but the caller only tests < 0
        let ir = r#"
fn @foo() -> i64;
fn @sloppy() -> i64 {
entry:
  %x = call @foo() !"t.c":9
  %c = icmp slt %x, 0
  br %c, fail, ok
fail:
  ret -1
ok:
  ret 0
}
"#;
        let report = detect(ir, &[("foo", Interval::Ntz)], MissingChecksConfig::default());
        assert_eq!(report.unchecked.len(), 1);
        assert_eq!(report.unchecked[0].loc, "t.c:9");

        // the same caller testing != 0 is fine
        let ir = ir.replace("icmp slt", "icmp ne");
        let report = detect(&ir, &[("foo", Interval::Ntz)], MissingChecksConfig::default());
        assert!(report.unchecked.is_empty());
    }

    #[test]
    fn switch_and_is_err_predicates_count_as_checks() {
        let ir = r#"
fn @foo() -> i64;
fn @switcher() -> i64 {
entry:
  %x = call @foo()
  switch %x, other, 0: zero
zero:
  ret 0
other:
  ret -1
}
"#;
        let report = detect(ir, &[("foo", Interval::Ltz)], MissingChecksConfig::default());
        assert!(report.unchecked.is_empty());

        let ir = r#"
fn @foo() -> i64*;
fn @IS_ERR(%p: i64*) -> i64;
fn @pred() -> i64 {
entry:
  %p = call @foo()
  %e = call @IS_ERR(%p)
  ret %e
}
"#;
        let report = detect(ir, &[("foo", Interval::Zero)], MissingChecksConfig::default());
        assert!(report.unchecked.is_empty());
    }

    #[test]
    fn void_filter_suppresses_reports() {
        let ir = r#"
fn @foo() -> i64;
fn @fire_and_forget() {
entry:
  %x = call @foo()
  ret
}
"#;
        let report = detect(ir, &[("foo", Interval::Ltz)], MissingChecksConfig::default());
        assert_eq!(report.unchecked.len(), 1);

        let config = MissingChecksConfig {
            filter_void: true,
            ..Default::default()
        };
        let report = detect(ir, &[("foo", Interval::Ltz)], config);
        assert!(report.unchecked.is_empty());
        // filtered calls land on the checked side of the counters
        assert_eq!(report.checked_calls["foo"], 1);
    }

    const TWO_CALLS: &str = r#"
fn @foo() -> i64;
fn @two(%z: i64) -> i64 {
entry:
  %x = call @foo()
  %c1 = icmp ne %x, 0
  br %c1, e1, mid
e1:
  ret -1
mid:
  %y = call @foo() !"two.c":9
  %c2 = icmp slt %y, 0
  br %c2, e2, done
e2:
  ret -2
done:
  ret 0
}
"#;

    #[test]
    fn per_call_site_mode_flags_the_weak_second_check() {
        let report = detect(TWO_CALLS, &[("foo", Interval::Ntz)], MissingChecksConfig::default());
        assert_eq!(report.unchecked.len(), 1);
        assert_eq!(report.unchecked[0].loc, "two.c:9");
        assert_eq!(report.checked_calls["foo"], 1);
        assert_eq!(report.unchecked_calls["foo"], 1);
    }

    #[test]
    fn conflated_mode_misses_the_weak_second_check() {
        let config = MissingChecksConfig {
            conflate_checks: true,
            ..Default::default()
        };
        let report = detect(TWO_CALLS, &[("foo", Interval::Ntz)], config);
        assert!(report.unchecked.is_empty());
        assert_eq!(report.checked_calls["foo"], 2);
    }

    const INCONSISTENT: &str = r#"
fn @EO();
fn @mustcheck() -> i64;
fn @q() -> i64 {
entry:
  %x = call @mustcheck()
  %c = icmp sge %x, 0
  br %c, okblk, errblk
okblk:
  call @EO() !"q.c":10
  ret 0
errblk:
  ret %x
}
"#;

    #[test]
    fn error_only_call_on_success_path_is_flagged() {
        let report = detect(
            INCONSISTENT,
            &[("mustcheck", Interval::Ltz)],
            MissingChecksConfig::default(),
        );
        assert_eq!(report.inconsistent.len(), 1);
        let bug = &report.inconsistent[0];
        assert_eq!(bug.loc, "q.c:10");
        assert_eq!(bug.success.fname, "mustcheck");
        assert_eq!(bug.success.interval, Interval::Gez);
        assert_eq!(bug.spec.interval, Interval::Ltz);
    }

    #[test]
    fn distance_heuristic_gates_the_inconsistency_report() {
        let config = MissingChecksConfig {
            check_distance: 0,
            ..Default::default()
        };
        let report = detect(INCONSISTENT, &[("mustcheck", Interval::Ltz)], config);
        assert!(report.inconsistent.is_empty());
    }

    #[test]
    fn error_only_call_on_error_path_is_not_flagged() {
        // the EO call sits on the branch where mustcheck's result overlaps
        // its error interval
        let ir = r#"
fn @EO();
fn @mustcheck() -> i64;
fn @q() -> i64 {
entry:
  %x = call @mustcheck()
  %c = icmp slt %x, 0
  br %c, errblk, okblk
errblk:
  call @EO()
  ret %x
okblk:
  ret 0
}
"#;
        let report = detect(
            ir,
            &[("mustcheck", Interval::Ltz)],
            MissingChecksConfig::default(),
        );
        assert!(report.inconsistent.is_empty());
    }
}
