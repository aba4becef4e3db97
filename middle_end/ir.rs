//! The typed SSA intermediate representation that every analysis runs on.
//!
//! A module is an arena: functions, blocks, parameters and instructions all
//! live in flat vectors and refer to each other through index newtypes. Fact
//! tables in the analyses are plain vectors indexed the same way.

use std::fmt;

use derive_more::Display;
use hashconsing::{consign, HConsed, HashConsign};

use crate::commons::Valid;

// SECTION: types

consign! {
    let TYPES = consign(37) for TypeKind;
}

/// A hash-consed IR type. Cheap to clone and compare.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Type(pub HConsed<TypeKind>);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TypeKind {
    Void,
    Int(u32),
    Ptr(Type),
}

pub fn void_ty() -> Type {
    Type(TYPES.mk(TypeKind::Void))
}

pub fn int_ty(width: u32) -> Type {
    Type(TYPES.mk(TypeKind::Int(width)))
}

pub fn ptr_ty(elem: Type) -> Type {
    Type(TYPES.mk(TypeKind::Ptr(elem)))
}

impl Type {
    pub fn is_void(&self) -> bool {
        matches!(*self.0, TypeKind::Void)
    }

    pub fn is_int(&self) -> bool {
        matches!(*self.0, TypeKind::Int(_))
    }

    pub fn is_ptr(&self) -> bool {
        matches!(*self.0, TypeKind::Ptr(_))
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &*self.0 {
            TypeKind::Void => write!(f, "void"),
            TypeKind::Int(w) => write!(f, "i{w}"),
            TypeKind::Ptr(elem) => write!(f, "{elem}*"),
        }
    }
}

// SECTION: identifiers

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FuncId(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParamId(pub u32);

/// Instruction ids are assigned in module layout order, so the distance
/// between two ids doubles as the instruction-distance heuristic used by the
/// missing-check detector.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstId(pub u32);

/// An SSA operand: the result of an instruction, a function parameter, or an
/// integer/null constant. Null pointers abstract to 0 everywhere.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueRef {
    Inst(InstId),
    Param(ParamId),
    Const(i64),
    Null,
}

// SECTION: instructions

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Callee {
    Direct(String),
    Indirect(ValueRef),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum BinaryOp {
    #[display(fmt = "add")]
    Add,
    #[display(fmt = "sub")]
    Sub,
    #[display(fmt = "mul")]
    Mul,
    #[display(fmt = "div")]
    Div,
}

/// Compare predicates. The unsigned ones exist so the front end can accept
/// them; the interval abstraction only knows the signed and equality forms.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum Predicate {
    #[display(fmt = "eq")]
    Eq,
    #[display(fmt = "ne")]
    Ne,
    #[display(fmt = "slt")]
    Slt,
    #[display(fmt = "sle")]
    Sle,
    #[display(fmt = "sgt")]
    Sgt,
    #[display(fmt = "sge")]
    Sge,
    #[display(fmt = "ult")]
    Ult,
    #[display(fmt = "ule")]
    Ule,
    #[display(fmt = "ugt")]
    Ugt,
    #[display(fmt = "uge")]
    Uge,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstKind {
    Call { callee: Callee, args: Vec<ValueRef> },
    Load { addr: ValueRef },
    Store { value: ValueRef, addr: ValueRef },
    Alloca { ty: Type },
    Bitcast { value: ValueRef, to: Type },
    PtrToInt { value: ValueRef, to: Type },
    Trunc { value: ValueRef, to: Type },
    SExt { value: ValueRef, to: Type },
    Gep { base: ValueRef, indices: Vec<ValueRef> },
    Binary { op: BinaryOp, lhs: ValueRef, rhs: ValueRef },
    ICmp { pred: Predicate, lhs: ValueRef, rhs: ValueRef },
    Phi { incoming: Vec<(ValueRef, BlockId)> },
    Branch { target: BlockId },
    CondBranch { cond: ValueRef, tt: BlockId, ff: BlockId },
    Switch { cond: ValueRef, default: BlockId, cases: Vec<(i64, BlockId)> },
    Ret { value: Option<ValueRef> },
}

impl InstKind {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Branch { .. }
                | InstKind::CondBranch { .. }
                | InstKind::Switch { .. }
                | InstKind::Ret { .. }
        )
    }

    // Successor blocks of a terminator (empty for returns and non-terminators).
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            InstKind::Branch { target } => vec![*target],
            InstKind::CondBranch { tt, ff, .. } => vec![*tt, *ff],
            InstKind::Switch { default, cases, .. } => {
                let mut succs = vec![*default];
                succs.extend(cases.iter().map(|(_, bb)| *bb));
                succs
            }
            _ => vec![],
        }
    }
}

/// Source location attached to an instruction by the front end's `!` metadata.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Loc {
    pub file: String,
    pub line: u32,
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inst {
    /// SSA result name as written in the source, if the instruction has one.
    pub name: Option<String>,
    pub kind: InstKind,
    pub block: BlockId,
    pub loc: Option<Loc>,
}

// SECTION: module structure

#[derive(Clone, Debug)]
pub struct Block {
    pub name: String,
    pub func: FuncId,
    /// Non-empty after validation; the last instruction is the terminator.
    pub insts: Vec<InstId>,
}

#[derive(Clone, Debug)]
pub struct Param {
    pub name: String,
    pub ty: Type,
    pub func: FuncId,
}

#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    pub ret_ty: Type,
    pub params: Vec<ParamId>,
    /// Empty for external declarations; the first block is the entry.
    pub blocks: Vec<BlockId>,
}

impl Function {
    pub fn is_defined(&self) -> bool {
        !self.blocks.is_empty()
    }

    pub fn entry(&self) -> BlockId {
        self.blocks[0]
    }
}

#[derive(Clone, Debug, Default)]
pub struct Module {
    pub functions: Vec<Function>,
    pub blocks: Vec<Block>,
    pub params: Vec<Param>,
    pub insts: Vec<Inst>,
}

impl Module {
    pub fn func(&self, f: FuncId) -> &Function {
        &self.functions[f.0 as usize]
    }

    pub fn block(&self, b: BlockId) -> &Block {
        &self.blocks[b.0 as usize]
    }

    pub fn param(&self, p: ParamId) -> &Param {
        &self.params[p.0 as usize]
    }

    pub fn inst(&self, i: InstId) -> &Inst {
        &self.insts[i.0 as usize]
    }

    pub fn func_ids(&self) -> impl Iterator<Item = FuncId> {
        (0..self.functions.len()).map(|i| FuncId(i as u32))
    }

    pub fn func_by_name(&self, name: &str) -> Option<FuncId> {
        self.func_ids().find(|&f| self.func(f).name == name)
    }

    pub fn first_inst(&self, b: BlockId) -> InstId {
        self.block(b).insts[0]
    }

    pub fn last_inst(&self, b: BlockId) -> InstId {
        *self.block(b).insts.last().unwrap()
    }

    pub fn func_of_inst(&self, i: InstId) -> FuncId {
        self.block(self.inst(i).block).func
    }

    /// Name of the function called by a direct call. `None` for indirect
    /// calls and for anything that is not a call.
    pub fn callee_name(&self, i: InstId) -> Option<&str> {
        match &self.inst(i).kind {
            InstKind::Call { callee: Callee::Direct(name), .. } => Some(name),
            _ => None,
        }
    }

    /// Every instruction of a function, in block layout order.
    pub fn func_insts(&self, f: FuncId) -> impl Iterator<Item = InstId> + '_ {
        self.func(f)
            .blocks
            .iter()
            .flat_map(|&bb| self.block(bb).insts.iter().copied())
    }

    pub fn render_value(&self, v: ValueRef) -> String {
        match v {
            ValueRef::Inst(i) => match &self.inst(i).name {
                Some(name) => format!("%{name}"),
                None => format!("%inst.{}", i.0),
            },
            ValueRef::Param(p) => format!("%{}", self.param(p).name),
            ValueRef::Const(c) => c.to_string(),
            ValueRef::Null => "null".to_string(),
        }
    }

    pub fn render_inst(&self, id: InstId) -> String {
        use InstKind::*;

        let inst = self.inst(id);
        let lhs = match &inst.name {
            Some(name) => format!("%{name} = "),
            None => String::new(),
        };
        let rv = |v: ValueRef| self.render_value(v);
        let bb = |b: BlockId| self.block(b).name.clone();
        let body = match &inst.kind {
            Call { callee, args } => {
                let callee = match callee {
                    Callee::Direct(name) => format!("@{name}"),
                    Callee::Indirect(v) => rv(*v),
                };
                let args: Vec<_> = args.iter().map(|&a| rv(a)).collect();
                format!("call {callee}({})", args.join(", "))
            }
            Load { addr } => format!("load {}", rv(*addr)),
            Store { value, addr } => format!("store {}, {}", rv(*value), rv(*addr)),
            Alloca { ty } => format!("alloca {ty}"),
            Bitcast { value, to } => format!("bitcast {} to {to}", rv(*value)),
            PtrToInt { value, to } => format!("ptrtoint {} to {to}", rv(*value)),
            Trunc { value, to } => format!("trunc {} to {to}", rv(*value)),
            SExt { value, to } => format!("sext {} to {to}", rv(*value)),
            Gep { base, indices } => {
                let idx: Vec<_> = indices.iter().map(|&i| rv(i)).collect();
                format!("gep {}, {}", rv(*base), idx.join(", "))
            }
            Binary { op, lhs, rhs } => format!("{op} {}, {}", rv(*lhs), rv(*rhs)),
            ICmp { pred, lhs, rhs } => format!("icmp {pred} {}, {}", rv(*lhs), rv(*rhs)),
            Phi { incoming } => {
                let arms: Vec<_> = incoming
                    .iter()
                    .map(|&(v, b)| format!("[{}, {}]", rv(v), bb(b)))
                    .collect();
                format!("phi {}", arms.join(", "))
            }
            Branch { target } => format!("br {}", bb(*target)),
            CondBranch { cond, tt, ff } => {
                format!("br {}, {}, {}", rv(*cond), bb(*tt), bb(*ff))
            }
            Switch { cond, default, cases } => {
                let arms: Vec<_> = cases
                    .iter()
                    .map(|&(c, b)| format!("{c}: {}", bb(b)))
                    .collect();
                if arms.is_empty() {
                    format!("switch {}, {}", rv(*cond), bb(*default))
                } else {
                    format!("switch {}, {}, {}", rv(*cond), bb(*default), arms.join(", "))
                }
            }
            Ret { value: Some(v) } => format!("ret {}", rv(*v)),
            Ret { value: None } => "ret".to_string(),
        };
        format!("{lhs}{body}")
    }
}

/// Intrinsics are invisible to the analyses.
pub fn is_intrinsic(name: &str) -> bool {
    name.starts_with("llvm.")
}

// SECTION: validation

#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum ValidationError {
    #[display(fmt = "function @{} has a block with no terminator: {}", _0, _1)]
    MissingTerminator(String, String),
    #[display(fmt = "function @{} has a terminator in the middle of block {}", _0, _1)]
    EarlyTerminator(String, String),
    #[display(fmt = "function @{}: phi after a non-phi instruction in block {}", _0, _1)]
    MisplacedPhi(String, String),
    #[display(fmt = "function @{}: phi in block {} names {}, which is not a predecessor", _0, _1, _2)]
    BadPhiSource(String, String, String),
    #[display(fmt = "function @{}: duplicate block name {}", _0, _1)]
    DuplicateBlock(String, String),
    #[display(fmt = "duplicate function name @{}", _0)]
    DuplicateFunction(String),
}

impl std::error::Error for ValidationError {}

impl Module {
    /// Check the structural invariants the analyses rely on.
    pub fn validate(self) -> Result<Valid<Module>, ValidationError> {
        use std::collections::BTreeSet as Set;

        let mut fnames = Set::new();
        for func in &self.functions {
            if !fnames.insert(&func.name) {
                return Err(ValidationError::DuplicateFunction(func.name.clone()));
            }

            let mut bnames = Set::new();
            for &bb in &func.blocks {
                let block = self.block(bb);
                if !bnames.insert(&block.name) {
                    return Err(ValidationError::DuplicateBlock(
                        func.name.clone(),
                        block.name.clone(),
                    ));
                }
                match block.insts.last() {
                    Some(&last) if self.inst(last).kind.is_terminator() => {}
                    _ => {
                        return Err(ValidationError::MissingTerminator(
                            func.name.clone(),
                            block.name.clone(),
                        ))
                    }
                }
                let mut seen_non_phi = false;
                for (i, &id) in block.insts.iter().enumerate() {
                    let kind = &self.inst(id).kind;
                    if kind.is_terminator() && i + 1 != block.insts.len() {
                        return Err(ValidationError::EarlyTerminator(
                            func.name.clone(),
                            block.name.clone(),
                        ));
                    }
                    if matches!(kind, InstKind::Phi { .. }) {
                        if seen_non_phi {
                            return Err(ValidationError::MisplacedPhi(
                                func.name.clone(),
                                block.name.clone(),
                            ));
                        }
                    } else {
                        seen_non_phi = true;
                    }
                }
            }

            // Phi incoming blocks must be actual predecessors.
            let mut preds: Set<(BlockId, BlockId)> = Set::new();
            for &bb in &func.blocks {
                let term = self.last_inst(bb);
                for succ in self.inst(term).kind.successors() {
                    preds.insert((succ, bb));
                }
            }
            for &bb in &func.blocks {
                for &id in &self.block(bb).insts {
                    if let InstKind::Phi { incoming } = &self.inst(id).kind {
                        for &(_, src) in incoming {
                            if !preds.contains(&(bb, src)) {
                                return Err(ValidationError::BadPhiSource(
                                    func.name.clone(),
                                    self.block(bb).name.clone(),
                                    self.block(src).name.clone(),
                                ));
                            }
                        }
                    }
                }
            }
        }

        Ok(Valid(self))
    }
}
