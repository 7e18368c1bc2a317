//! Function IR targeted by the profiling instrumenters
//!
//! A compact SSA form with block parameters in place of phi nodes. Blocks are
//! addressed by their position in [`Function::blocks`]; new blocks are always
//! appended, so a block's index never changes once created. Each block ends in
//! exactly one [`Terminator`], stored separately from its instruction list.
//!
//! Profiling counters are embedded directly as [`CounterRef`]s: the address of
//! a process-lifetime atomic cell. Executing an [`Instr::AtomicAdd`] touches
//! only that cell, never the profile store.

pub mod analysis;
pub mod builder;
mod printer;

pub use builder::FunctionBuilder;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{self, AtomicU64};

// ==================== Identifiers & Types ====================

/// Scalar type of a constant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ty {
    /// One-bit boolean
    I1,
    /// 64-bit integer
    I64,
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::I1 => write!(f, "i1"),
            Ty::I64 => write!(f, "i64"),
        }
    }
}

/// SSA value identifier, unique within a function
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueId(pub u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Position of a basic block within its function
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// A typed integer literal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Constant {
    pub ty: Ty,
    pub value: i64,
}

impl Constant {
    pub fn i64(value: i64) -> Self {
        Self { ty: Ty::I64, value }
    }

    pub fn bool(value: bool) -> Self {
        Self {
            ty: Ty::I1,
            value: i64::from(value),
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ty {
            Ty::I1 => write!(f, "{}", self.value != 0),
            Ty::I64 => write!(f, "{}:i64", self.value),
        }
    }
}

/// An instruction operand: either an SSA value or an inline literal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Value(ValueId),
    Const(Constant),
}

impl Operand {
    /// Whether the operand is known at compile time
    pub fn is_const(&self) -> bool {
        matches!(self, Operand::Const(_))
    }

    pub fn as_value(&self) -> Option<ValueId> {
        match self {
            Operand::Value(v) => Some(*v),
            Operand::Const(_) => None,
        }
    }
}

impl From<ValueId> for Operand {
    fn from(value: ValueId) -> Self {
        Operand::Value(value)
    }
}

impl From<Constant> for Operand {
    fn from(value: Constant) -> Self {
        Operand::Const(value)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Value(v) => write!(f, "{}", v),
            Operand::Const(c) => write!(f, "{}", c),
        }
    }
}

// ==================== Metadata ====================

/// Annotation payload attached to a function by the frontend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Metadata {
    Int(i64),
    Bool(bool),
    Str(String),
    Tuple(Vec<Metadata>),
}

impl Metadata {
    /// Integer view of a boolean or integer entry
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Metadata::Int(n) => Some(*n),
            Metadata::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Metadata]> {
        match self {
            Metadata::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// The literal this entry denotes when passed as a call argument
    pub fn as_constant(&self) -> Option<Constant> {
        match self {
            Metadata::Int(n) => Some(Constant::i64(*n)),
            Metadata::Bool(b) => Some(Constant::bool(*b)),
            _ => None,
        }
    }

    /// Short name of the entry kind, for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Metadata::Int(_) => "int",
            Metadata::Bool(_) => "bool",
            Metadata::Str(_) => "string",
            Metadata::Tuple(_) => "tuple",
        }
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metadata::Int(n) => write!(f, "{}", n),
            Metadata::Bool(b) => write!(f, "{}", b),
            Metadata::Str(s) => write!(f, "{:?}", s),
            Metadata::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}

// ==================== Counters ====================

/// Memory ordering of an atomic counter update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOrdering {
    /// No ordering beyond atomicity of the single cell
    Monotonic,
    AcquireRelease,
    SequentiallyConsistent,
}

impl AtomicOrdering {
    pub fn to_std(self) -> atomic::Ordering {
        match self {
            AtomicOrdering::Monotonic => atomic::Ordering::Relaxed,
            AtomicOrdering::AcquireRelease => atomic::Ordering::AcqRel,
            AtomicOrdering::SequentiallyConsistent => atomic::Ordering::SeqCst,
        }
    }
}

impl fmt::Display for AtomicOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AtomicOrdering::Monotonic => write!(f, "monotonic"),
            AtomicOrdering::AcquireRelease => write!(f, "acq_rel"),
            AtomicOrdering::SequentiallyConsistent => write!(f, "seq_cst"),
        }
    }
}

/// Absolute address of a process-lifetime counter cell
///
/// Two refs are equal when they name the same cell.
#[derive(Clone, Copy)]
pub struct CounterRef(&'static AtomicU64);

impl CounterRef {
    pub fn new(cell: &'static AtomicU64) -> Self {
        Self(cell)
    }

    /// Numeric address of the cell
    pub fn addr(self) -> usize {
        self.0 as *const AtomicU64 as usize
    }

    /// Add `delta`, returning the previous value
    pub fn fetch_add(self, delta: u64, ordering: AtomicOrdering) -> u64 {
        self.0.fetch_add(delta, ordering.to_std())
    }

    pub fn load(self) -> u64 {
        self.0.load(atomic::Ordering::Relaxed)
    }

    pub fn is(self, cell: &AtomicU64) -> bool {
        std::ptr::eq(self.0, cell)
    }
}

impl PartialEq for CounterRef {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}

impl Eq for CounterRef {}

impl fmt::Debug for CounterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CounterRef({:#x})", self.addr())
    }
}

// ==================== Instructions ====================

/// Binary integer operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    /// Signed remainder
    SRem,
    And,
    Or,
    Xor,
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
}

impl BinOp {
    /// Comparisons produce an `i1`
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Slt | BinOp::Sle | BinOp::Sgt | BinOp::Sge
        )
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::SRem => "srem",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
            BinOp::Eq => "icmp eq",
            BinOp::Ne => "icmp ne",
            BinOp::Slt => "icmp slt",
            BinOp::Sle => "icmp sle",
            BinOp::Sgt => "icmp sgt",
            BinOp::Sge => "icmp sge",
        };
        f.write_str(s)
    }
}

/// Target of a call instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callee {
    /// Direct call to a named routine
    Symbol(String),
    /// Indirect call through an absolute code address
    Address(u64),
}

impl Callee {
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Callee::Symbol(name) => Some(name),
            Callee::Address(_) => None,
        }
    }
}

impl fmt::Display for Callee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callee::Symbol(name) => write!(f, "@{}", name),
            Callee::Address(addr) => write!(f, "*{:#x}", addr),
        }
    }
}

/// A non-terminator instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr {
    Const {
        result: ValueId,
        value: Constant,
    },
    BinOp {
        result: ValueId,
        op: BinOp,
        lhs: Operand,
        rhs: Operand,
    },
    /// Widen a condition to `i64`: 1 when nonzero, else 0
    ZExt {
        result: ValueId,
        value: Operand,
    },
    Call {
        result: Option<ValueId>,
        callee: Callee,
        args: Vec<Operand>,
    },
    /// Atomic fetch-add on an embedded counter; yields the previous value
    AtomicAdd {
        result: Option<ValueId>,
        counter: CounterRef,
        value: Operand,
        ordering: AtomicOrdering,
    },
}

impl Instr {
    pub fn result(&self) -> Option<ValueId> {
        match self {
            Instr::Const { result, .. } | Instr::BinOp { result, .. } | Instr::ZExt { result, .. } => {
                Some(*result)
            }
            Instr::Call { result, .. } | Instr::AtomicAdd { result, .. } => *result,
        }
    }

    pub fn operands(&self) -> Vec<Operand> {
        match self {
            Instr::Const { .. } => Vec::new(),
            Instr::BinOp { lhs, rhs, .. } => vec![*lhs, *rhs],
            Instr::ZExt { value, .. } | Instr::AtomicAdd { value, .. } => vec![*value],
            Instr::Call { args, .. } => args.clone(),
        }
    }

    /// Name of the directly called routine, if this is a direct call
    pub fn called_symbol(&self) -> Option<&str> {
        match self {
            Instr::Call { callee, .. } => callee.symbol(),
            _ => None,
        }
    }

    /// Shorthand for a monotonic counter increment with no result
    pub fn counter_add(counter: CounterRef, value: impl Into<Operand>) -> Self {
        Instr::AtomicAdd {
            result: None,
            counter,
            value: value.into(),
            ordering: AtomicOrdering::Monotonic,
        }
    }
}

/// Relative frequency of the two outcomes of a conditional branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchWeights {
    /// Weight of the `then` edge
    pub taken: u64,
    /// Weight of the `else` edge
    pub not_taken: u64,
}

/// The control transfer ending a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    Return {
        value: Option<Operand>,
    },
    Br {
        target: BlockId,
        args: Vec<Operand>,
    },
    CondBr {
        cond: Operand,
        then_dest: BlockId,
        then_args: Vec<Operand>,
        else_dest: BlockId,
        else_args: Vec<Operand>,
        weights: Option<BranchWeights>,
    },
    Unreachable,
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Return { .. } | Terminator::Unreachable => Vec::new(),
            Terminator::Br { target, .. } => vec![*target],
            Terminator::CondBr {
                then_dest,
                else_dest,
                ..
            } => vec![*then_dest, *else_dest],
        }
    }

    /// Edges as `(target, args)` pairs
    pub fn edges(&self) -> Vec<(BlockId, &[Operand])> {
        match self {
            Terminator::Return { .. } | Terminator::Unreachable => Vec::new(),
            Terminator::Br { target, args } => vec![(*target, args.as_slice())],
            Terminator::CondBr {
                then_dest,
                then_args,
                else_dest,
                else_args,
                ..
            } => vec![
                (*then_dest, then_args.as_slice()),
                (*else_dest, else_args.as_slice()),
            ],
        }
    }

    pub fn operands(&self) -> Vec<Operand> {
        match self {
            Terminator::Return { value } => value.iter().copied().collect(),
            Terminator::Br { args, .. } => args.clone(),
            Terminator::CondBr {
                cond,
                then_args,
                else_args,
                ..
            } => std::iter::once(*cond)
                .chain(then_args.iter().copied())
                .chain(else_args.iter().copied())
                .collect(),
            Terminator::Unreachable => Vec::new(),
        }
    }

    /// Condition of a genuinely conditional branch (non-constant condition)
    pub fn runtime_condition(&self) -> Option<Operand> {
        match self {
            Terminator::CondBr { cond, .. } if !cond.is_const() => Some(*cond),
            _ => None,
        }
    }
}

// ==================== Blocks & Functions ====================

/// A basic block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Optional display name used by the printer
    pub name: Option<String>,
    /// Block parameters (defined on entry from the incoming edge's arguments)
    pub params: Vec<ValueId>,
    pub instrs: Vec<Instr>,
    pub terminator: Terminator,
}

impl Block {
    pub fn new(name: Option<String>) -> Self {
        Self {
            name,
            params: Vec::new(),
            instrs: Vec::new(),
            terminator: Terminator::Unreachable,
        }
    }

    /// Number of instructions, counting the terminator
    pub fn size(&self) -> usize {
        self.instrs.len() + 1
    }
}

/// A function in SSA form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub params: Vec<ValueId>,
    /// Blocks in layout order; `blocks[0]` is the entry block
    pub blocks: Vec<Block>,
    /// Named frontend annotations
    pub annotations: BTreeMap<String, Metadata>,
    /// Profile-derived function entry frequency
    pub entry_count: Option<u64>,
    next_value: u32,
}

impl Function {
    /// Create an empty function; callers add at least an entry block
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            blocks: Vec::new(),
            annotations: BTreeMap::new(),
            entry_count: None,
            next_value: 0,
        }
    }

    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Total instruction count, terminators included
    pub fn inst_count(&self) -> usize {
        self.blocks.iter().map(Block::size).sum()
    }

    /// Upper bound (exclusive) of allocated value ids
    pub fn value_count(&self) -> usize {
        self.next_value as usize
    }

    /// Allocate a fresh SSA value id
    pub fn fresh_value(&mut self) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        id
    }

    /// Append a block and return its id
    pub fn add_block(&mut self, block: Block) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(block);
        id
    }

    pub fn annotation(&self, key: &str) -> Option<&Metadata> {
        self.annotations.get(key)
    }

    pub fn set_annotation(&mut self, key: impl Into<String>, value: Metadata) {
        self.annotations.insert(key.into(), value);
    }

    /// Insert `instrs` into `block` so the first one lands at position `at`
    pub fn insert_instrs(&mut self, block: BlockId, at: usize, instrs: Vec<Instr>) {
        let target = &mut self.block_mut(block).instrs;
        let tail = target.split_off(at);
        target.extend(instrs);
        target.extend(tail);
    }

    /// Split `block` before instruction `at` and guard a new region on `cond`
    ///
    /// Instructions from `at` onward, together with the original terminator,
    /// move to a fresh continuation block. `block` then ends in a conditional
    /// branch to a fresh, empty `then` block (which falls through to the
    /// continuation) or straight to the continuation. Returns the `then` block.
    pub fn split_block_and_insert_if_then(
        &mut self,
        block: BlockId,
        at: usize,
        cond: Operand,
        weights: Option<BranchWeights>,
    ) -> BlockId {
        let head = self.block_mut(block);
        let base = head.name.clone().unwrap_or_else(|| block.to_string());
        let moved = head.instrs.split_off(at);
        let terminator = std::mem::replace(&mut head.terminator, Terminator::Unreachable);

        let cont = self.add_block(Block {
            name: Some(format!("{}.cont", base)),
            params: Vec::new(),
            instrs: moved,
            terminator,
        });
        let then = self.add_block(Block {
            name: Some(format!("{}.then", base)),
            params: Vec::new(),
            instrs: Vec::new(),
            terminator: Terminator::Br {
                target: cont,
                args: Vec::new(),
            },
        });

        self.block_mut(block).terminator = Terminator::CondBr {
            cond,
            then_dest: then,
            then_args: Vec::new(),
            else_dest: cont,
            else_args: Vec::new(),
            weights,
        };
        then
    }

    /// Every direct call as `(block, instruction index, instruction)`
    pub fn calls(&self) -> impl Iterator<Item = (BlockId, usize, &Instr)> + '_ {
        self.blocks.iter().enumerate().flat_map(|(b, block)| {
            block
                .instrs
                .iter()
                .enumerate()
                .filter(|(_, instr)| matches!(instr, Instr::Call { .. }))
                .map(move |(i, instr)| (BlockId(b as u32), i, instr))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static CELL: AtomicU64 = AtomicU64::new(0);
    static OTHER: AtomicU64 = AtomicU64::new(0);

    #[test]
    fn test_counter_ref_identity() {
        let a = CounterRef::new(&CELL);
        let b = CounterRef::new(&CELL);
        let c = CounterRef::new(&OTHER);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.is(&CELL));
        assert_eq!(a.addr(), &CELL as *const AtomicU64 as usize);
    }

    #[test]
    fn test_counter_ref_fetch_add_returns_previous() {
        static LOCAL: AtomicU64 = AtomicU64::new(5);
        let r = CounterRef::new(&LOCAL);
        assert_eq!(r.fetch_add(2, AtomicOrdering::Monotonic), 5);
        assert_eq!(r.load(), 7);
    }

    #[test]
    fn test_runtime_condition_skips_constants() {
        let constant = Terminator::CondBr {
            cond: Operand::Const(Constant::bool(true)),
            then_dest: BlockId(1),
            then_args: vec![],
            else_dest: BlockId(2),
            else_args: vec![],
            weights: None,
        };
        assert_eq!(constant.runtime_condition(), None);

        let dynamic = Terminator::CondBr {
            cond: Operand::Value(ValueId(3)),
            then_dest: BlockId(1),
            then_args: vec![],
            else_dest: BlockId(2),
            else_args: vec![],
            weights: None,
        };
        assert_eq!(dynamic.runtime_condition(), Some(Operand::Value(ValueId(3))));
    }

    #[test]
    fn test_split_block_moves_tail() {
        let mut func = Function::new("f");
        let x = func.fresh_value();
        let y = func.fresh_value();
        let mut entry = Block::new(Some("entry".into()));
        entry.instrs.push(Instr::Const { result: x, value: Constant::i64(1) });
        entry.instrs.push(Instr::Const { result: y, value: Constant::i64(2) });
        entry.terminator = Terminator::Return { value: Some(y.into()) };
        func.add_block(entry);

        let then = func.split_block_and_insert_if_then(
            BlockId(0),
            1,
            Operand::Value(x),
            Some(BranchWeights { taken: 1, not_taken: 9 }),
        );

        assert_eq!(func.num_blocks(), 3);
        assert_eq!(func.block(BlockId(0)).instrs.len(), 1);
        let cont = BlockId(1);
        assert_eq!(func.block(cont).instrs.len(), 1);
        assert_eq!(func.block(cont).terminator, Terminator::Return { value: Some(y.into()) });
        assert_eq!(func.block(then).terminator.successors(), vec![cont]);
        assert_eq!(func.block(BlockId(0)).terminator.successors(), vec![then, cont]);
    }

    #[test]
    fn test_metadata_views() {
        assert_eq!(Metadata::Bool(true).as_int(), Some(1));
        assert_eq!(Metadata::Int(7).as_constant(), Some(Constant::i64(7)));
        assert_eq!(Metadata::Str("x".into()).as_int(), None);
        let tuple = Metadata::Tuple(vec![Metadata::Int(1), Metadata::Bool(false)]);
        assert_eq!(tuple.to_string(), "(1, false)");
    }
}
