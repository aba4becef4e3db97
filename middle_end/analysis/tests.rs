// End-to-end tests for the analyses and for specification inference, each
// built from a small textual-IR module.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use pretty_assertions::assert_eq;

use crate::commons::Valid;
use crate::front_end::parse_module;

use super::super::constraint::Interval;
use super::super::error_blocks::{ErrorBlocks, ErrorCodeList};
use super::super::ir::*;
use super::{return_constraints, return_propagation, returned_values};

struct Analyses {
    module: Valid<Module>,
    rp: return_propagation::ReturnPropagation,
    rv: returned_values::ReturnedValues,
    rc: return_constraints::ReturnConstraints,
}

fn analyze(ir: &str) -> Analyses {
    let module = parse_module(ir).unwrap();
    let rp = return_propagation::analyze(&module);
    let rv = returned_values::analyze(&module);
    let rc = return_constraints::analyze(&module, &rp);
    Analyses { module, rp, rv, rc }
}

fn infer(ir: &str, error_only: &[&str]) -> (Analyses, ErrorBlocks, usize) {
    let analyses = analyze(ir);
    let error_only: Set<String> = error_only.iter().map(|s| s.to_string()).collect();
    let mut blocks = ErrorBlocks::new(error_only, Map::new(), ErrorCodeList::default());
    let sweeps = blocks.run(&analyses.module, &analyses.rp, &analyses.rv, &analyses.rc);
    (analyses, blocks, sweeps)
}

fn interval_of(blocks: &ErrorBlocks, fname: &str) -> Interval {
    blocks.aerv(fname).expect(fname).interval
}

const DIRECT_SEED: &str = r#"
fn @EO();
fn @foo(%cond: i64) -> i64 {
entry:
  %c = icmp ne %cond, 0
  br %c, fail, ok
fail:
  call @EO()
  ret -1
ok:
  ret 0
}
"#;

#[test]
fn direct_seed_from_error_only_call() {
    let (_, blocks, _) = infer(DIRECT_SEED, &["EO"]);
    assert_eq!(interval_of(&blocks, "foo"), Interval::Ltz);
    assert!(blocks.error_only_bootstrap.contains("foo"));
    // the success path must not widen the error interval
    assert_eq!(blocks.specs().len(), 1);
}

#[test]
fn propagation_through_a_local_variable() {
    let ir = r#"
fn @EO();
fn @foo(%cond: i64) -> i64 {
entry:
  %c = icmp ne %cond, 0
  br %c, fail, ok
fail:
  call @EO()
  ret -1
ok:
  ret 0
}
fn @bar() -> i64 {
entry:
  %p = alloca i64
  %x = call @foo(1)
  store %x, %p
  %v = load %p
  %c = icmp slt %v, 0
  br %c, fail, ok
fail:
  ret %v
ok:
  ret 0
}
"#;
    let (analyses, blocks, _) = infer(ir, &["EO"]);
    assert_eq!(interval_of(&blocks, "foo"), Interval::Ltz);
    assert_eq!(interval_of(&blocks, "bar"), Interval::Ltz);
    assert!(blocks
        .error_propagation
        .contains(&("foo".to_string(), "bar".to_string())));

    // the returned-values analysis saw that bar may return foo's result
    assert_eq!(
        analyses.rv.return_propagated["bar"],
        Set::from(["foo".to_string()])
    );
}

#[test]
fn inference_climbs_the_call_graph_bottom_up() {
    // bar is defined before foo, so the first sweep can only seed foo and a
    // second sweep is needed to lift the interval into bar.
    let ir = r#"
fn @EO();
fn @bar() -> i64 {
entry:
  %x = call @foo()
  %c = icmp slt %x, 0
  br %c, fail, ok
fail:
  ret %x
ok:
  ret 0
}
fn @foo(%cond: i64) -> i64 {
entry:
  %c = icmp ne %cond, 0
  br %c, fail, ok
fail:
  call @EO()
  ret -1
ok:
  ret 0
}
"#;
    let (_, blocks, sweeps) = infer(ir, &["EO"]);
    assert_eq!(interval_of(&blocks, "foo"), Interval::Ltz);
    assert_eq!(interval_of(&blocks, "bar"), Interval::Ltz);
    // the lattice has height 3, so the sweep count is bounded by it
    assert!(sweeps >= 2 && sweeps <= 3 * 3 + 1);
}

#[test]
fn phi_merge_keeps_the_error_branch_only() {
    let ir = r#"
fn @EO();
fn @pos(%cond: i64) -> i64 {
entry:
  %c = icmp ne %cond, 0
  br %c, a, b
a:
  call @EO()
  br join
b:
  br join
join:
  %r = phi [1, a], [-1, b]
  ret %r
}
"#;
    let (_, blocks, _) = infer(ir, &["EO"]);
    assert_eq!(interval_of(&blocks, "pos"), Interval::Gtz);
}

#[test]
fn phi_merge_of_two_error_paths_unions() {
    let ir = r#"
fn @EO();
fn @both(%cond: i64) -> i64 {
entry:
  %c = icmp ne %cond, 0
  br %c, a, b
a:
  call @EO()
  br join
b:
  call @EO()
  br join
join:
  %r = phi [1, a], [-1, b]
  ret %r
}
"#;
    let (_, blocks, _) = infer(ir, &["EO"]);
    assert_eq!(interval_of(&blocks, "both"), Interval::Ntz);
}

#[test]
fn known_error_codes_seed_without_error_only_calls() {
    let ir = r#"
fn @codes(%cond: i64) -> i64 {
entry:
  %c = icmp ne %cond, 0
  br %c, a, b
a:
  ret -114
b:
  ret 0
}
"#;
    let (_, blocks, _) = infer(ir, &[]);
    assert_eq!(interval_of(&blocks, "codes"), Interval::Ltz);
}

#[test]
fn input_specs_feed_propagation() {
    // no error-only functions at all; `open`'s spec comes in from the seed
    // file and climbs into the caller.
    let ir = r#"
fn @open() -> i64;
fn @wrapper() -> i64 {
entry:
  %x = call @open()
  %c = icmp slt %x, 0
  br %c, fail, ok
fail:
  ret %x
ok:
  ret 0
}
"#;
    let analyses = analyze(ir);
    let seeds = Map::from([(
        "open".to_string(),
        super::super::constraint::Constraint::with_interval("open", Interval::Ltz),
    )]);
    let mut blocks = ErrorBlocks::new(Set::new(), seeds, ErrorCodeList::default());
    blocks.run(&analyses.module, &analyses.rp, &analyses.rv, &analyses.rc);

    assert_eq!(interval_of(&blocks, "wrapper"), Interval::Ltz);
    assert!(blocks
        .error_propagation
        .contains(&("open".to_string(), "wrapper".to_string())));
}

#[test]
fn rerunning_inference_is_a_no_op() {
    let (analyses, mut blocks, _) = infer(DIRECT_SEED, &["EO"]);
    let before = blocks.specs().clone();
    let sweeps = blocks.run(&analyses.module, &analyses.rp, &analyses.rv, &analyses.rc);
    assert_eq!(sweeps, 1);
    assert_eq!(blocks.specs(), &before);
}

#[test]
fn err_ptr_wrappers_propagate_their_argument() {
    let ir = r#"
fn @ERR_PTR(%e: i64) -> i64*;
fn @maybe() -> i64* {
entry:
  %p = call @ERR_PTR(-12)
  ret %p
}
"#;
    let analyses = analyze(ir);
    let maybe = analyses.module.func_by_name("maybe").unwrap();
    let entry = analyses.module.func(maybe).entry();
    let call = analyses.module.first_inst(entry);

    // the wrapped argument can reach the return
    assert!(analyses
        .rv
        .in_fact(call)
        .value
        .contains(&ValueRef::Const(-12)));
    assert_eq!(
        analyses.rv.return_propagated["maybe"],
        Set::from(["ERR_PTR".to_string()])
    );
}

#[test]
fn value_flow_follows_constant_field_accesses() {
    let ir = r#"
fn @g() -> i64;
fn @h(%s: i64**) -> i64 {
entry:
  %f = gep %s, 0, 1
  %x = call @g()
  store %x, %f
  %f2 = gep %s, 0, 1
  %v = load %f2
  ret %v
}
"#;
    let analyses = analyze(ir);
    let h = analyses.module.func_by_name("h").unwrap();
    let entry = analyses.module.func(h).entry();
    let insts = analyses.module.block(entry).insts.clone();
    let call = insts[1];
    let ret = insts[5];

    let InstKind::Ret { value: Some(v) } = analyses.module.inst(ret).kind else {
        panic!("expected ret with operand");
    };
    assert!(analyses
        .rp
        .in_fact(&analyses.module, ret)
        .value_may_hold(v, call));
}

#[test]
fn branch_constraints_split_and_merge() {
    let ir = r#"
fn @foo() -> i64;
fn @user() -> i64 {
entry:
  %x = call @foo()
  %c = icmp slt %x, 0
  br %c, neg, nonneg
neg:
  br join
nonneg:
  br join
join:
  ret 0
}
"#;
    let analyses = analyze(ir);
    let user = analyses.module.func_by_name("user").unwrap();
    let blocks = analyses.module.func(user).blocks.clone();
    let fact_at = |bb: BlockId| {
        analyses
            .rc
            .out_fact(analyses.module.last_inst(bb))
            .value
            .get("foo")
            .map(|c| c.interval)
    };

    // killed in the branch block itself, split across the successors,
    // rejoined to top at the merge
    assert_eq!(fact_at(blocks[0]), Some(Interval::Bot));
    assert_eq!(fact_at(blocks[1]), Some(Interval::Ltz));
    assert_eq!(fact_at(blocks[2]), Some(Interval::Gez));
    assert_eq!(fact_at(blocks[3]), Some(Interval::Top));
}

#[test]
fn indirect_calls_stay_unknown() {
    let ir = r#"
fn @table(%fp: i64*) -> i64 {
entry:
  %x = call %fp()
  %c = icmp slt %x, 0
  br %c, fail, ok
fail:
  ret %x
ok:
  ret 0
}
"#;
    let (_, blocks, _) = infer(ir, &["EO"]);
    // nothing can be learned about a callee with no name
    assert!(blocks.aerv("table").is_none());
    assert_eq!(blocks.specs().len(), 0);
}
