// lower the AST to the arena module, resolving value and block names.

use std::collections::BTreeMap as Map;

use derive_more::Display;

use crate::middle_end::ir::*;

use super::parser::{CalleeAst, CastKind, FuncAst, OpAst, OpcodeAst, ProgramAst};

#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum LowerError {
    #[display(fmt = "function @{}: unknown value %{}", _0, _1)]
    UnknownValue(String, String),
    #[display(fmt = "function @{}: unknown block label {}", _0, _1)]
    UnknownBlock(String, String),
    #[display(fmt = "function @{}: duplicate value name %{}", _0, _1)]
    DuplicateValue(String, String),
    #[display(fmt = "function @{}: duplicate block label {}", _0, _1)]
    DuplicateBlock(String, String),
}

impl std::error::Error for LowerError {}

pub fn lower(program: ProgramAst) -> Result<Module, LowerError> {
    let mut module = Module::default();
    for func in program.funcs {
        lower_function(&mut module, func)?;
    }
    Ok(module)
}

fn lower_function(module: &mut Module, func: FuncAst) -> Result<(), LowerError> {
    let func_id = FuncId(module.functions.len() as u32);
    let fname = func.name.clone();

    // Parameters first: they are values too.
    let mut values: Map<String, ValueRef> = Map::new();
    let mut param_ids = vec![];
    for (pname, ty) in &func.params {
        let pid = ParamId(module.params.len() as u32);
        if values.insert(pname.clone(), ValueRef::Param(pid)).is_some() {
            return Err(LowerError::DuplicateValue(fname, pname.clone()));
        }
        module.params.push(Param {
            name: pname.clone(),
            ty: ty.clone(),
            func: func_id,
        });
        param_ids.push(pid);
    }

    if func.blocks.is_empty() {
        // External declaration.
        module.functions.push(Function {
            name: fname,
            ret_ty: func.ret_ty,
            params: param_ids,
            blocks: vec![],
        });
        return Ok(());
    }

    // Pre-assign block and instruction ids so operands and branch targets can
    // refer forward.
    let mut block_ids: Map<String, BlockId> = Map::new();
    let mut blocks = vec![];
    for block in &func.blocks {
        let bid = BlockId((module.blocks.len() + blocks.len()) as u32);
        if block_ids.insert(block.name.clone(), bid).is_some() {
            return Err(LowerError::DuplicateBlock(fname, block.name.clone()));
        }
        blocks.push(bid);
    }

    let mut next_inst = module.insts.len() as u32;
    for block in &func.blocks {
        for inst in &block.insts {
            let id = InstId(next_inst);
            next_inst += 1;
            if let Some(result) = &inst.result {
                if values.insert(result.clone(), ValueRef::Inst(id)).is_some() {
                    return Err(LowerError::DuplicateValue(fname, result.clone()));
                }
            }
        }
    }

    // Now build the blocks and instructions for real.
    for (block, &bid) in func.blocks.iter().zip(&blocks) {
        let mut inst_ids = vec![];
        for inst in &block.insts {
            let id = InstId(module.insts.len() as u32);
            let kind = lower_opcode(&fname, &values, &block_ids, &inst.op)?;
            module.insts.push(Inst {
                name: inst.result.clone(),
                kind,
                block: bid,
                loc: inst.loc.clone(),
            });
            inst_ids.push(id);
        }
        module.blocks.push(Block {
            name: block.name.clone(),
            func: func_id,
            insts: inst_ids,
        });
    }

    module.functions.push(Function {
        name: fname,
        ret_ty: func.ret_ty,
        params: param_ids,
        blocks,
    });
    Ok(())
}

fn lower_opcode(
    fname: &str,
    values: &Map<String, ValueRef>,
    block_ids: &Map<String, BlockId>,
    op: &OpcodeAst,
) -> Result<InstKind, LowerError> {
    let value = |op: &OpAst| -> Result<ValueRef, LowerError> {
        match op {
            OpAst::Local(name) => values.get(name).copied().ok_or_else(|| {
                LowerError::UnknownValue(fname.to_string(), name.clone())
            }),
            OpAst::Int(v) => Ok(ValueRef::Const(*v)),
            OpAst::Null => Ok(ValueRef::Null),
        }
    };
    let block = |label: &str| -> Result<BlockId, LowerError> {
        block_ids.get(label).copied().ok_or_else(|| {
            LowerError::UnknownBlock(fname.to_string(), label.to_string())
        })
    };

    let kind = match op {
        OpcodeAst::Call { callee, args } => {
            let callee = match callee {
                CalleeAst::Global(name) => Callee::Direct(name.clone()),
                CalleeAst::Local(name) => Callee::Indirect(value(&OpAst::Local(name.clone()))?),
            };
            let args = args.iter().map(&value).collect::<Result<Vec<_>, _>>()?;
            InstKind::Call { callee, args }
        }
        OpcodeAst::Load { addr } => InstKind::Load { addr: value(addr)? },
        OpcodeAst::Store { value: v, addr } => InstKind::Store {
            value: value(v)?,
            addr: value(addr)?,
        },
        OpcodeAst::Alloca { ty } => InstKind::Alloca { ty: ty.clone() },
        OpcodeAst::Cast { kind, value: v, to } => {
            let v = value(v)?;
            let to = to.clone();
            match kind {
                CastKind::Bitcast => InstKind::Bitcast { value: v, to },
                CastKind::PtrToInt => InstKind::PtrToInt { value: v, to },
                CastKind::Trunc => InstKind::Trunc { value: v, to },
                CastKind::SExt => InstKind::SExt { value: v, to },
            }
        }
        OpcodeAst::Gep { base, indices } => InstKind::Gep {
            base: value(base)?,
            indices: indices.iter().map(&value).collect::<Result<Vec<_>, _>>()?,
        },
        OpcodeAst::Binary { op, lhs, rhs } => InstKind::Binary {
            op: *op,
            lhs: value(lhs)?,
            rhs: value(rhs)?,
        },
        OpcodeAst::ICmp { pred, lhs, rhs } => InstKind::ICmp {
            pred: *pred,
            lhs: value(lhs)?,
            rhs: value(rhs)?,
        },
        OpcodeAst::Phi { incoming } => InstKind::Phi {
            incoming: incoming
                .iter()
                .map(|(v, label)| Ok((value(v)?, block(label)?)))
                .collect::<Result<Vec<_>, LowerError>>()?,
        },
        OpcodeAst::Branch { target } => InstKind::Branch {
            target: block(target)?,
        },
        OpcodeAst::CondBranch { cond, tt, ff } => InstKind::CondBranch {
            cond: value(cond)?,
            tt: block(tt)?,
            ff: block(ff)?,
        },
        OpcodeAst::Switch { cond, default, cases } => InstKind::Switch {
            cond: value(cond)?,
            default: block(default)?,
            cases: cases
                .iter()
                .map(|(v, label)| Ok((*v, block(label)?)))
                .collect::<Result<Vec<_>, LowerError>>()?,
        },
        OpcodeAst::Ret { value: Some(v) } => InstKind::Ret {
            value: Some(value(v)?),
        },
        OpcodeAst::Ret { value: None } => InstKind::Ret { value: None },
    };
    Ok(kind)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::super::parse_module;
    use super::*;

    #[test]
    fn lowers_and_links_names() {
        let module = parse_module(
            r#"
            fn @foo() -> i64;
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
            "#,
        )
        .unwrap();

        let bar = module.func_by_name("bar").unwrap();
        assert_eq!(module.func(bar).blocks.len(), 3);
        let entry = module.func(bar).entry();
        let call = module.first_inst(entry);
        assert_eq!(module.callee_name(call), Some("foo"));

        // %c's operand is the call result
        let cmp = module.block(entry).insts[1];
        let InstKind::ICmp { lhs, .. } = module.inst(cmp).kind else {
            panic!("expected icmp");
        };
        assert_eq!(lhs, ValueRef::Inst(call));
    }

    #[test]
    fn unknown_value_is_an_error() {
        let err = parse_module("fn @f() -> i64 {\nentry:\n  ret %nope\n}").unwrap_err();
        assert!(err.to_string().contains("unknown value"));
    }

    #[test]
    fn validates_phi_sources() {
        let err = parse_module(
            r#"
            fn @f(%x: i64) -> i64 {
            entry:
              br out
            out:
              %r = phi [0, entry], [1, out]
              ret %r
            }
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("not a predecessor"));
    }
}
