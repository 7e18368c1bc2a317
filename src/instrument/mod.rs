//! Profiling instrumentation passes
//!
//! Two function passes bracket the optimizer:
//!
//! - [`PreOptimizationProfiler`] creates the function's profile, installs
//!   branch counters and pre-optimization allocation counters, and can feed
//!   previously collected counts back as branch weights.
//! - [`PostOptimizationProfiler`] installs the call counter (with an optional
//!   threshold reporter) and post-optimization allocation counters. It only
//!   touches functions the first pass already created a profile for.
//!
//! Every inserted counter update is a monotonic atomic add against an address
//! owned by the profile store.

mod postopt;
mod preopt;

pub use postopt::{PostOptimizationProfiler, ReporterSpec};
pub use preopt::PreOptimizationProfiler;

use crate::config::AllocSymbols;
use crate::error::{Error, Result, Stage};
use crate::ir::{Constant, Function, Instr};
use crate::profiler::{counter, AllocInfo};

/// Which analyses of a function survive a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreservedAnalyses {
    cfg: bool,
    instructions: bool,
}

impl PreservedAnalyses {
    /// Nothing changed
    pub fn all() -> Self {
        Self {
            cfg: true,
            instructions: true,
        }
    }

    /// Instructions were added but the block graph is untouched
    pub fn cfg() -> Self {
        Self {
            cfg: true,
            instructions: false,
        }
    }

    /// Everything must be recomputed
    pub fn none() -> Self {
        Self {
            cfg: false,
            instructions: false,
        }
    }

    pub fn preserves_all(&self) -> bool {
        self.cfg && self.instructions
    }

    pub fn preserves_cfg(&self) -> bool {
        self.cfg
    }

    /// What survives both `self` and `other`
    pub fn intersect(self, other: Self) -> Self {
        Self {
            cfg: self.cfg && other.cfg,
            instructions: self.instructions && other.instructions,
        }
    }
}

/// A transformation run on one function at a time
pub trait FunctionPass {
    /// Human-readable name, used in diagnostics
    fn name(&self) -> &'static str;

    fn run(&mut self, func: &mut Function) -> Result<PreservedAnalyses>;
}

/// Reject allocation calls at `stage` that lack the configured size argument
pub(crate) fn check_alloc_calls(func: &Function, stage: Stage, symbols: &AllocSymbols) -> Result<()> {
    for (block, _, instr) in func.calls() {
        let Some(name) = instr.called_symbol() else {
            continue;
        };
        if symbols.matches(name, stage) && instr.operands().len() <= symbols.size_arg {
            return Err(Error::invalid_ir(format!(
                "`{}`: allocation call `{}` in {} has no size argument at index {}",
                func.name, name, block, symbols.size_arg
            )));
        }
    }
    Ok(())
}

/// Count every allocation call recognised at `stage` into `info`
///
/// The size and count updates go immediately before the call. Returns the
/// number of call sites instrumented.
pub(crate) fn add_alloc_instrumentation(
    info: &'static AllocInfo,
    func: &mut Function,
    stage: Stage,
    symbols: &AllocSymbols,
) -> Result<usize> {
    check_alloc_calls(func, stage, symbols)?;
    let is_alloc = |instr: &Instr| {
        instr
            .called_symbol()
            .is_some_and(|name| symbols.matches(name, stage))
    };

    let size_cell = counter(&info.size);
    let count_cell = counter(&info.count);
    let mut sites = 0;

    for (block_idx, block) in func.blocks.iter_mut().enumerate() {
        let original = std::mem::take(&mut block.instrs);
        let mut rewritten = Vec::with_capacity(original.len());
        for instr in original {
            if is_alloc(&instr) {
                let size = instr.operands()[symbols.size_arg];
                rewritten.push(Instr::counter_add(size_cell, size));
                rewritten.push(Instr::counter_add(count_cell, Constant::i64(1)));
                sites += 1;
                tracing::trace!(function = %func.name, block = block_idx, %stage, "allocation site");
            }
            rewritten.push(instr);
        }
        block.instrs = rewritten;
    }

    Ok(sites)
}
