//! Reference executor for the function IR
//!
//! Runs a [`Function`] to completion and resolves calls through an
//! [`ExternTable`] of host closures. An executor holds no mutable state of its
//! own, so any number of threads may run the same instrumented function at
//! once; embedded counters are the only shared memory they touch.

use rustc_hash::FxHashMap as HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::ir::{BinOp, BlockId, Callee, Function, Instr, Operand, Terminator, ValueId};

/// A host routine callable from IR
pub type ExternFn = Arc<dyn Fn(&[i64]) -> i64 + Send + Sync>;

/// Host routines addressable by symbol or by code address
#[derive(Clone, Default)]
pub struct ExternTable {
    symbols: HashMap<String, ExternFn>,
    addresses: HashMap<u64, ExternFn>,
}

impl fmt::Debug for ExternTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut symbols: Vec<_> = self.symbols.keys().collect();
        symbols.sort();
        let mut addresses: Vec<_> = self.addresses.keys().collect();
        addresses.sort();
        f.debug_struct("ExternTable")
            .field("symbols", &symbols)
            .field("addresses", &addresses)
            .finish()
    }
}

impl ExternTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_symbol(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&[i64]) -> i64 + Send + Sync + 'static,
    ) -> &mut Self {
        self.symbols.insert(name.into(), Arc::new(f));
        self
    }

    pub fn register_address(
        &mut self,
        addr: u64,
        f: impl Fn(&[i64]) -> i64 + Send + Sync + 'static,
    ) -> &mut Self {
        self.addresses.insert(addr, Arc::new(f));
        self
    }

    pub fn resolve(&self, callee: &Callee) -> Result<&ExternFn> {
        match callee {
            Callee::Symbol(name) => self
                .symbols
                .get(name)
                .ok_or_else(|| Error::UnknownSymbol(name.clone())),
            Callee::Address(addr) => self
                .addresses
                .get(addr)
                .ok_or(Error::UnknownAddress(*addr)),
        }
    }
}

/// Default budget of executed instructions per run
pub const DEFAULT_STEP_LIMIT: u64 = 10_000_000;

/// Executes functions against an extern table
#[derive(Debug, Clone, Copy)]
pub struct Executor<'a> {
    externs: &'a ExternTable,
    step_limit: u64,
}

impl<'a> Executor<'a> {
    pub fn new(externs: &'a ExternTable) -> Self {
        Self {
            externs,
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }

    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    /// Run `func` with `args`, returning its result if it returns one
    pub fn run(&self, func: &Function, args: &[i64]) -> Result<Option<i64>> {
        if args.len() != func.params.len() {
            return Err(Error::ArityMismatch {
                target: format!("@{}", func.name),
                expected: func.params.len(),
                actual: args.len(),
            });
        }

        let mut frame = Frame {
            values: vec![None; func.value_count()],
            block: func.entry(),
        };
        for (param, arg) in func.params.iter().zip(args) {
            frame.set(*param, *arg)?;
        }

        let mut steps: u64 = 0;
        loop {
            let block = func.block(frame.block);
            for instr in &block.instrs {
                steps += 1;
                if steps > self.step_limit {
                    return Err(Error::StepLimitExceeded(self.step_limit));
                }
                self.step(&mut frame, instr)?;
            }

            steps += 1;
            if steps > self.step_limit {
                return Err(Error::StepLimitExceeded(self.step_limit));
            }
            let (target, edge_args) = match &block.terminator {
                Terminator::Return { value } => {
                    return value.as_ref().map(|v| frame.read(v)).transpose();
                }
                Terminator::Unreachable => {
                    return Err(Error::invalid_ir(format!(
                        "`{}`: reached unreachable in {}",
                        func.name, frame.block
                    )));
                }
                Terminator::Br { target, args } => (*target, args),
                Terminator::CondBr {
                    cond,
                    then_dest,
                    then_args,
                    else_dest,
                    else_args,
                    ..
                } => {
                    if frame.read(cond)? != 0 {
                        (*then_dest, then_args)
                    } else {
                        (*else_dest, else_args)
                    }
                }
            };

            let dest = func.block(target);
            if dest.params.len() != edge_args.len() {
                return Err(Error::ArityMismatch {
                    target: target.to_string(),
                    expected: dest.params.len(),
                    actual: edge_args.len(),
                });
            }
            let incoming = edge_args
                .iter()
                .map(|a| frame.read(a))
                .collect::<Result<Vec<_>>>()?;
            for (param, value) in dest.params.iter().zip(incoming) {
                frame.set(*param, value)?;
            }
            frame.block = target;
        }
    }

    fn step(&self, frame: &mut Frame, instr: &Instr) -> Result<()> {
        match instr {
            Instr::Const { result, value } => frame.set(*result, value.value)?,
            Instr::BinOp { result, op, lhs, rhs } => {
                let value = eval_binop(*op, frame.read(lhs)?, frame.read(rhs)?)?;
                frame.set(*result, value)?;
            }
            // Conditions are truthy when nonzero, matching `CondBr`
            Instr::ZExt { result, value } => {
                let v = frame.read(value)?;
                frame.set(*result, i64::from(v != 0))?;
            }
            Instr::Call { result, callee, args } => {
                let target = self.externs.resolve(callee)?;
                let args = args.iter().map(|a| frame.read(a)).collect::<Result<Vec<_>>>()?;
                let value = target(args.as_slice());
                if let Some(r) = result {
                    frame.set(*r, value)?;
                }
            }
            Instr::AtomicAdd {
                result,
                counter,
                value,
                ordering,
            } => {
                let delta = frame.read(value)? as u64;
                let previous = counter.fetch_add(delta, *ordering);
                if let Some(r) = result {
                    frame.set(*r, previous as i64)?;
                }
            }
        }
        Ok(())
    }
}

struct Frame {
    values: Vec<Option<i64>>,
    block: BlockId,
}

impl Frame {
    fn set(&mut self, id: ValueId, value: i64) -> Result<()> {
        let slot = self.values.get_mut(id.index()).ok_or(Error::UndefinedValue {
            value: id,
            block: self.block,
        })?;
        *slot = Some(value);
        Ok(())
    }

    fn read(&self, op: &Operand) -> Result<i64> {
        match op {
            Operand::Const(c) => Ok(c.value),
            Operand::Value(id) => self
                .values
                .get(id.index())
                .copied()
                .flatten()
                .ok_or_else(|| Error::UndefinedValue {
                    value: *id,
                    block: self.block,
                }),
        }
    }
}

fn eval_binop(op: BinOp, lhs: i64, rhs: i64) -> Result<i64> {
    Ok(match op {
        BinOp::Add => lhs.wrapping_add(rhs),
        BinOp::Sub => lhs.wrapping_sub(rhs),
        BinOp::Mul => lhs.wrapping_mul(rhs),
        BinOp::SRem => {
            if rhs == 0 {
                return Err(Error::DivisionByZero);
            }
            lhs.wrapping_rem(rhs)
        }
        BinOp::And => lhs & rhs,
        BinOp::Or => lhs | rhs,
        BinOp::Xor => lhs ^ rhs,
        BinOp::Eq => i64::from(lhs == rhs),
        BinOp::Ne => i64::from(lhs != rhs),
        BinOp::Slt => i64::from(lhs < rhs),
        BinOp::Sle => i64::from(lhs <= rhs),
        BinOp::Sgt => i64::from(lhs > rhs),
        BinOp::Sge => i64::from(lhs >= rhs),
    })
}
