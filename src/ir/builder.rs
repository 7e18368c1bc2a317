//! Ergonomic construction of [`Function`]s
//!
//! ```
//! use jitprof::ir::{BinOp, Constant, FunctionBuilder};
//!
//! let mut b = FunctionBuilder::new("is_even");
//! let x = b.param();
//! let rem = b.binop(BinOp::SRem, x, Constant::i64(2));
//! let even = b.binop(BinOp::Eq, rem, Constant::i64(0));
//! b.ret(Some(even.into()));
//! let func = b.build().unwrap();
//! assert_eq!(func.num_blocks(), 1);
//! ```

use super::analysis;
use super::{BinOp, Block, BlockId, Callee, Constant, Function, Instr, Metadata, Operand, Terminator, ValueId};
use crate::error::{Error, Result};

/// Builds a function block by block
///
/// The entry block is created up front and is the initial insertion block.
pub struct FunctionBuilder {
    func: Function,
    current: BlockId,
    sealed: Vec<bool>,
    misuse: Option<String>,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let mut func = Function::new(name);
        let entry = func.add_block(Block::new(Some("entry".to_string())));
        Self {
            func,
            current: entry,
            sealed: vec![false],
            misuse: None,
        }
    }

    /// Add a function parameter
    pub fn param(&mut self) -> ValueId {
        let id = self.func.fresh_value();
        self.func.params.push(id);
        id
    }

    pub fn create_block(&mut self, name: &str) -> BlockId {
        self.sealed.push(false);
        self.func.add_block(Block::new(Some(name.to_string())))
    }

    /// Add a parameter to `block`, bound from incoming edge arguments
    pub fn block_param(&mut self, block: BlockId) -> ValueId {
        let id = self.func.fresh_value();
        self.func.block_mut(block).params.push(id);
        id
    }

    pub fn switch_to_block(&mut self, block: BlockId) {
        self.current = block;
    }

    pub fn current_block(&self) -> BlockId {
        self.current
    }

    pub fn annotate(&mut self, key: impl Into<String>, value: Metadata) {
        self.func.set_annotation(key, value);
    }

    pub fn iconst(&mut self, value: i64) -> ValueId {
        let result = self.func.fresh_value();
        self.push(Instr::Const {
            result,
            value: Constant::i64(value),
        });
        result
    }

    pub fn bconst(&mut self, value: bool) -> ValueId {
        let result = self.func.fresh_value();
        self.push(Instr::Const {
            result,
            value: Constant::bool(value),
        });
        result
    }

    pub fn binop(&mut self, op: BinOp, lhs: impl Into<Operand>, rhs: impl Into<Operand>) -> ValueId {
        let result = self.func.fresh_value();
        self.push(Instr::BinOp {
            result,
            op,
            lhs: lhs.into(),
            rhs: rhs.into(),
        });
        result
    }

    pub fn zext(&mut self, value: impl Into<Operand>) -> ValueId {
        let result = self.func.fresh_value();
        self.push(Instr::ZExt {
            result,
            value: value.into(),
        });
        result
    }

    /// Direct call to a named routine, returning its result value
    pub fn call(&mut self, symbol: &str, args: Vec<Operand>) -> ValueId {
        let result = self.func.fresh_value();
        self.push(Instr::Call {
            result: Some(result),
            callee: Callee::Symbol(symbol.to_string()),
            args,
        });
        result
    }

    /// Call whose result is discarded
    pub fn call_void(&mut self, callee: Callee, args: Vec<Operand>) {
        self.push(Instr::Call {
            result: None,
            callee,
            args,
        });
    }

    pub fn br(&mut self, target: BlockId, args: Vec<Operand>) {
        self.terminate(Terminator::Br { target, args });
    }

    pub fn cond_br(
        &mut self,
        cond: impl Into<Operand>,
        then_dest: BlockId,
        then_args: Vec<Operand>,
        else_dest: BlockId,
        else_args: Vec<Operand>,
    ) {
        self.terminate(Terminator::CondBr {
            cond: cond.into(),
            then_dest,
            then_args,
            else_dest,
            else_args,
            weights: None,
        });
    }

    pub fn ret(&mut self, value: Option<Operand>) {
        self.terminate(Terminator::Return { value });
    }

    pub fn unreachable(&mut self) {
        self.terminate(Terminator::Unreachable);
    }

    /// Finish construction and verify the result
    pub fn build(self) -> Result<Function> {
        if let Some(message) = self.misuse {
            return Err(Error::invalid_ir(message));
        }
        if let Some(open) = self.sealed.iter().position(|sealed| !sealed) {
            return Err(Error::invalid_ir(format!(
                "`{}`: block bb{} has no terminator",
                self.func.name, open
            )));
        }
        analysis::verify(&self.func)?;
        Ok(self.func)
    }

    fn push(&mut self, instr: Instr) {
        if self.sealed[self.current.index()] && self.misuse.is_none() {
            self.misuse = Some(format!(
                "`{}`: instruction appended to terminated block {}",
                self.func.name, self.current
            ));
        }
        self.func.block_mut(self.current).instrs.push(instr);
    }

    fn terminate(&mut self, terminator: Terminator) {
        let idx = self.current.index();
        if self.sealed[idx] && self.misuse.is_none() {
            self.misuse = Some(format!(
                "`{}`: block {} terminated twice",
                self.func.name, self.current
            ));
        }
        self.sealed[idx] = true;
        self.func.block_mut(self.current).terminator = terminator;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_diamond() {
        let mut b = FunctionBuilder::new("diamond");
        let x = b.param();
        let then = b.create_block("then");
        let other = b.create_block("else");
        let exit = b.create_block("exit");
        let r = b.block_param(exit);
        let c = b.binop(BinOp::Ne, x, Constant::i64(0));
        b.cond_br(c, then, vec![], other, vec![]);
        b.switch_to_block(then);
        b.br(exit, vec![Constant::i64(1).into()]);
        b.switch_to_block(other);
        b.br(exit, vec![Constant::i64(2).into()]);
        b.switch_to_block(exit);
        b.ret(Some(r.into()));

        let func = b.build().unwrap();
        assert_eq!(func.num_blocks(), 4);
        assert_eq!(func.inst_count(), 5);
        assert_eq!(func.block(exit).params, vec![r]);
    }

    #[test]
    fn test_unterminated_block_rejected() {
        let mut b = FunctionBuilder::new("open");
        b.create_block("dangling");
        b.ret(None);
        let err = b.build().unwrap_err();
        assert!(err.to_string().contains("has no terminator"));
    }

    #[test]
    fn test_double_termination_rejected() {
        let mut b = FunctionBuilder::new("twice");
        b.ret(None);
        b.ret(None);
        assert!(b.build().is_err());
    }
}
