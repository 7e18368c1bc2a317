//! Text rendering of functions
//!
//! Output is deterministic for a given function: annotations in key order,
//! blocks in layout order, instructions in program order. Counter cells print
//! as their absolute address.

use std::fmt;

use super::{Function, Instr, Operand, Terminator};

fn write_operands(f: &mut fmt::Formatter<'_>, ops: &[Operand]) -> fmt::Result {
    for (i, op) in ops.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", op)?;
    }
    Ok(())
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Const { result, value } => write!(f, "{} = const {}", result, value),
            Instr::BinOp { result, op, lhs, rhs } => {
                write!(f, "{} = {} {}, {}", result, op, lhs, rhs)
            }
            Instr::ZExt { result, value } => write!(f, "{} = zext {} to i64", result, value),
            Instr::Call { result, callee, args } => {
                if let Some(r) = result {
                    write!(f, "{} = ", r)?;
                }
                write!(f, "call {}(", callee)?;
                write_operands(f, args)?;
                write!(f, ")")
            }
            Instr::AtomicAdd {
                result,
                counter,
                value,
                ordering,
            } => {
                if let Some(r) = result {
                    write!(f, "{} = ", r)?;
                }
                write!(f, "atomicrmw add [{:#x}], {} {}", counter.addr(), value, ordering)
            }
        }
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminator::Return { value: Some(v) } => write!(f, "ret {}", v),
            Terminator::Return { value: None } => write!(f, "ret"),
            Terminator::Br { target, args } => {
                write!(f, "br {}(", target)?;
                write_operands(f, args)?;
                write!(f, ")")
            }
            Terminator::CondBr {
                cond,
                then_dest,
                then_args,
                else_dest,
                else_args,
                weights,
            } => {
                write!(f, "condbr {}, {}(", cond, then_dest)?;
                write_operands(f, then_args)?;
                write!(f, "), {}(", else_dest)?;
                write_operands(f, else_args)?;
                write!(f, ")")?;
                if let Some(w) = weights {
                    write!(f, " !branch_weights({}, {})", w.taken, w.not_taken)?;
                }
                Ok(())
            }
            Terminator::Unreachable => write!(f, "unreachable"),
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn @{}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", p)?;
        }
        write!(f, ")")?;
        if let Some(count) = self.entry_count {
            write!(f, " !function_entry_count({})", count)?;
        }
        writeln!(f, " {{")?;
        for (key, value) in &self.annotations {
            writeln!(f, "  !{} = {}", key, value)?;
        }

        for (idx, block) in self.blocks.iter().enumerate() {
            let label = block.name.as_deref().unwrap_or("bb");
            write!(f, "{}.{}(", label, idx)?;
            for (i, p) in block.params.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", p)?;
            }
            writeln!(f, "):")?;
            for instr in &block.instrs {
                writeln!(f, "  {}", instr)?;
            }
            writeln!(f, "  {}", block.terminator)?;
        }
        writeln!(f, "}}")
    }
}
