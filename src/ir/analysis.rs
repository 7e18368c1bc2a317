//! Control-flow analyses and structural verification

use super::{BlockId, Function, Operand};
use crate::error::{Error, Result};

/// Predecessor lists indexed by block
pub fn predecessors(func: &Function) -> Vec<Vec<BlockId>> {
    let mut preds = vec![Vec::new(); func.num_blocks()];
    for (idx, block) in func.blocks.iter().enumerate() {
        for succ in block.terminator.successors() {
            if let Some(list) = preds.get_mut(succ.index()) {
                list.push(BlockId(idx as u32));
            }
        }
    }
    preds
}

/// Blocks reachable from the entry, in reverse postorder
pub fn reverse_postorder(func: &Function) -> Vec<BlockId> {
    let n = func.num_blocks();
    if n == 0 {
        return Vec::new();
    }
    let mut visited = vec![false; n];
    let mut postorder = Vec::with_capacity(n);
    // (block, next successor to visit)
    let mut stack = vec![(func.entry(), 0usize)];
    visited[0] = true;

    while let Some((block, next)) = stack.pop() {
        let succs = func.block(block).terminator.successors();
        if let Some(&succ) = succs.get(next) {
            stack.push((block, next + 1));
            if !visited[succ.index()] {
                visited[succ.index()] = true;
                stack.push((succ, 0));
            }
        } else {
            postorder.push(block);
        }
    }

    postorder.reverse();
    postorder
}

/// Immediate dominators (Cooper, Harvey & Kennedy). Unreachable blocks get `None`.
pub fn immediate_dominators(func: &Function) -> Vec<Option<BlockId>> {
    let n = func.num_blocks();
    let mut idom: Vec<Option<BlockId>> = vec![None; n];
    if n == 0 {
        return idom;
    }

    let rpo = reverse_postorder(func);
    let mut order = vec![usize::MAX; n];
    for (i, b) in rpo.iter().enumerate() {
        order[b.index()] = i;
    }
    let preds = predecessors(func);
    let entry = func.entry();
    idom[entry.index()] = Some(entry);

    let intersect = |idom: &[Option<BlockId>], mut a: BlockId, mut b: BlockId| -> BlockId {
        while a != b {
            while order[a.index()] > order[b.index()] {
                a = idom[a.index()].unwrap_or(entry);
            }
            while order[b.index()] > order[a.index()] {
                b = idom[b.index()].unwrap_or(entry);
            }
        }
        a
    };

    let mut changed = true;
    while changed {
        changed = false;
        for &b in rpo.iter().skip(1) {
            let mut new_idom: Option<BlockId> = None;
            for &p in &preds[b.index()] {
                if idom[p.index()].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => p,
                    Some(current) => intersect(&idom, p, current),
                });
            }
            if new_idom.is_some() && idom[b.index()] != new_idom {
                idom[b.index()] = new_idom;
                changed = true;
            }
        }
    }

    idom
}

/// Whether `a` dominates `b` under the given dominator tree
pub fn dominates(idom: &[Option<BlockId>], a: BlockId, b: BlockId) -> bool {
    let mut cur = b;
    loop {
        if cur == a {
            return true;
        }
        match idom[cur.index()] {
            Some(parent) if parent != cur => cur = parent,
            _ => return false,
        }
    }
}

/// Natural loop headers, in reverse postorder (outer loops before inner ones)
pub fn loop_headers(func: &Function) -> Vec<BlockId> {
    let idom = immediate_dominators(func);
    let mut is_header = vec![false; func.num_blocks()];
    for (idx, block) in func.blocks.iter().enumerate() {
        let from = BlockId(idx as u32);
        if idom[idx].is_none() {
            continue;
        }
        for succ in block.terminator.successors() {
            if dominates(&idom, succ, from) {
                is_header[succ.index()] = true;
            }
        }
    }
    reverse_postorder(func)
        .into_iter()
        .filter(|b| is_header[b.index()])
        .collect()
}

/// Number of loops visited by a preorder walk of the loop forest
pub fn loop_count(func: &Function) -> usize {
    loop_headers(func).len()
}

/// Check the structural invariants every instrumentation pass relies on
pub fn verify(func: &Function) -> Result<()> {
    let name = &func.name;
    if func.blocks.is_empty() {
        return Err(Error::invalid_ir(format!("`{}` has no blocks", name)));
    }
    let entry = func.block(func.entry());
    if !entry.params.is_empty() {
        return Err(Error::invalid_ir(format!("`{}`: entry block takes parameters", name)));
    }

    let n_values = func.value_count();
    let mut defined = vec![false; n_values];
    let mut define = |v: super::ValueId| -> Result<()> {
        match defined.get_mut(v.index()) {
            Some(slot) if !*slot => {
                *slot = true;
                Ok(())
            }
            Some(_) => Err(Error::invalid_ir(format!("`{}`: {} defined twice", name, v))),
            None => Err(Error::invalid_ir(format!("`{}`: {} out of range", name, v))),
        }
    };

    for &p in &func.params {
        define(p)?;
    }
    for block in &func.blocks {
        for &p in &block.params {
            define(p)?;
        }
        for instr in &block.instrs {
            if let Some(r) = instr.result() {
                define(r)?;
            }
        }
    }

    let check_use = |op: &Operand| -> Result<()> {
        if let Operand::Value(v) = op {
            if !defined.get(v.index()).copied().unwrap_or(false) {
                return Err(Error::invalid_ir(format!("`{}`: {} used but never defined", name, v)));
            }
        }
        Ok(())
    };

    for (idx, block) in func.blocks.iter().enumerate() {
        for instr in &block.instrs {
            instr.operands().iter().try_for_each(&check_use)?;
        }
        block.terminator.operands().iter().try_for_each(&check_use)?;

        for (target, args) in block.terminator.edges() {
            let Some(dest) = func.blocks.get(target.index()) else {
                return Err(Error::invalid_ir(format!(
                    "`{}`: bb{} branches to missing {}",
                    name, idx, target
                )));
            };
            if target == func.entry() {
                return Err(Error::invalid_ir(format!(
                    "`{}`: bb{} branches to the entry block",
                    name, idx
                )));
            }
            if dest.params.len() != args.len() {
                return Err(Error::invalid_ir(format!(
                    "`{}`: edge bb{} -> {} passes {} arguments to {} parameters",
                    name,
                    idx,
                    target,
                    args.len(),
                    dest.params.len()
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinOp, Constant, FunctionBuilder};

    /// entry -> outer(i) { inner(j) loop } -> exit
    fn nested_loops() -> Function {
        let mut b = FunctionBuilder::new("nested");
        let n = b.param();
        let outer = b.create_block("outer");
        let i = b.block_param(outer);
        let inner = b.create_block("inner");
        let j = b.block_param(inner);
        let latch = b.create_block("latch");
        let exit = b.create_block("exit");

        b.br(outer, vec![Constant::i64(0).into()]);

        b.switch_to_block(outer);
        let c = b.binop(BinOp::Slt, i, n);
        b.cond_br(c, inner, vec![Constant::i64(0).into()], exit, vec![]);

        b.switch_to_block(inner);
        let j2 = b.binop(BinOp::Add, j, Constant::i64(1));
        let more = b.binop(BinOp::Slt, j2, n);
        b.cond_br(more, inner, vec![j2.into()], latch, vec![]);

        b.switch_to_block(latch);
        let i2 = b.binop(BinOp::Add, i, Constant::i64(1));
        b.br(outer, vec![i2.into()]);

        b.switch_to_block(exit);
        b.ret(None);
        b.build().unwrap()
    }

    #[test]
    fn test_loop_count_nested() {
        let func = nested_loops();
        assert_eq!(loop_count(&func), 2);
        assert_eq!(loop_headers(&func), vec![BlockId(1), BlockId(2)]);
    }

    #[test]
    fn test_straight_line_has_no_loops() {
        let mut b = FunctionBuilder::new("flat");
        b.ret(None);
        let func = b.build().unwrap();
        assert_eq!(loop_count(&func), 0);
    }

    #[test]
    fn test_dominators() {
        let func = nested_loops();
        let idom = immediate_dominators(&func);
        assert_eq!(idom[1], Some(BlockId(0)));
        assert_eq!(idom[2], Some(BlockId(1)));
        assert_eq!(idom[3], Some(BlockId(2)));
        assert_eq!(idom[4], Some(BlockId(1)));
        assert!(dominates(&idom, BlockId(1), BlockId(3)));
        assert!(!dominates(&idom, BlockId(2), BlockId(4)));
    }

    #[test]
    fn test_verify_rejects_branch_to_entry() {
        let mut b = FunctionBuilder::new("back_to_entry");
        b.br(BlockId(0), vec![]);
        let err = b.build().unwrap_err();
        assert!(err.to_string().contains("entry block"));
    }

    #[test]
    fn test_verify_rejects_arity_mismatch() {
        let mut b = FunctionBuilder::new("arity");
        let next = b.create_block("next");
        b.block_param(next);
        b.br(next, vec![]);
        b.switch_to_block(next);
        b.ret(None);
        assert!(b.build().is_err());
    }
}
