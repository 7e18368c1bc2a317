//! Instrumentation run before the optimizer

use super::{add_alloc_instrumentation, check_alloc_calls, FunctionPass, PreservedAnalyses};
use crate::config::ProfilerConfig;
use crate::error::{Error, Result, Stage};
use crate::ir::{BranchWeights, Constant, Function, Instr, Terminator};
use crate::profiler::{counter, FunctionProfile, JitFunctionProfiler, ProfilingFlags};

/// Creates profiles and installs branch/allocation counters; applies PGO weights
///
/// With no profiler attached the pass does nothing.
pub struct PreOptimizationProfiler<'a> {
    profiler: Option<&'a JitFunctionProfiler>,
    config: &'a ProfilerConfig,
}

impl<'a> PreOptimizationProfiler<'a> {
    pub fn new(profiler: Option<&'a JitFunctionProfiler>, config: &'a ProfilerConfig) -> Self {
        Self { profiler, config }
    }
}

impl FunctionPass for PreOptimizationProfiler<'_> {
    fn name(&self) -> &'static str {
        "jit-preopt-profiler"
    }

    fn run(&mut self, func: &mut Function) -> Result<PreservedAnalyses> {
        let Some(profiler) = self.profiler else {
            return Ok(PreservedAnalyses::all());
        };

        let flags = ProfilingFlags::resolve(func, self.config)?;
        if flags.is_empty() {
            return Ok(PreservedAnalyses::all());
        }

        // Registered even for calls-only so the post-optimization pass finds it
        let profile = profiler.get_or_create_profile(&func.name, || FunctionProfile::from_function(func));
        if !flags.intersects(ProfilingFlags::BRANCHES | ProfilingFlags::ALLOCATIONS | ProfilingFlags::APPLY_PGO) {
            return Ok(PreservedAnalyses::all());
        }

        // Every failure is raised here, before the function changes
        if flags.contains(ProfilingFlags::ALLOCATIONS) {
            check_alloc_calls(func, Stage::PreOptimization, &self.config.alloc)?;
        }
        if flags.intersects(ProfilingFlags::BRANCHES | ProfilingFlags::APPLY_PGO) {
            check_branch_shape(profile, func)?;
        }

        let mut preserved = PreservedAnalyses::all();

        if flags.contains(ProfilingFlags::BRANCHES) {
            let sites = add_branch_instrumentation(profile, func)?;
            if sites > 0 {
                preserved = preserved.intersect(PreservedAnalyses::cfg());
            }
        }

        if flags.contains(ProfilingFlags::ALLOCATIONS) {
            let sites = add_alloc_instrumentation(&profile.preopt, func, Stage::PreOptimization, &self.config.alloc)?;
            tracing::debug!(function = %func.name, sites, "pre-optimization allocation counters");
            if sites > 0 {
                preserved = preserved.intersect(PreservedAnalyses::cfg());
            }
        }

        if flags.contains(ProfilingFlags::APPLY_PGO) {
            apply_pgo(profile, func)?;
            // Weight metadata changes invalidate nearly every analysis
            preserved = PreservedAnalyses::none();
        }

        Ok(preserved)
    }
}

/// A populated slot sequence must have one slot per block
fn check_branch_shape(profile: &FunctionProfile, func: &Function) -> Result<()> {
    let slots = profile.branch_slots();
    if slots.is_empty() || slots.len() == func.num_blocks() {
        return Ok(());
    }
    Err(Error::ShapeMismatch {
        function: func.name.clone(),
        slots: slots.len(),
        blocks: func.num_blocks(),
        stage: Stage::PreOptimization,
    })
}

/// Count outcomes of every conditional branch on a runtime condition
///
/// The slot sequence is sized to the block count on first use. Returns the
/// number of branch sites instrumented.
fn add_branch_instrumentation(profile: &'static FunctionProfile, func: &mut Function) -> Result<usize> {
    let mut slots = profile.branch_slots();
    if !slots.ensure_len(func.num_blocks()) {
        return Err(Error::ShapeMismatch {
            function: func.name.clone(),
            slots: slots.len(),
            blocks: func.num_blocks(),
            stage: Stage::PreOptimization,
        });
    }

    let mut sites = 0;
    for idx in 0..func.num_blocks() {
        let Some(cond) = func.blocks[idx].terminator.runtime_condition() else {
            continue;
        };
        let info = slots.get_or_insert(idx);
        let extended = func.fresh_value();
        let block = &mut func.blocks[idx];
        block.instrs.push(Instr::counter_add(counter(&info.total), Constant::i64(1)));
        block.instrs.push(Instr::ZExt {
            result: extended,
            value: cond,
        });
        block.instrs.push(Instr::counter_add(counter(&info.taken), extended));
        sites += 1;
        tracing::trace!(function = %func.name, block = idx, "branch site");
    }

    tracing::debug!(function = %func.name, sites, "branch counters installed");
    Ok(sites)
}

/// Attach collected counts as entry frequency and branch weights
fn apply_pgo(profile: &'static FunctionProfile, func: &mut Function) -> Result<()> {
    func.entry_count = Some(profile.calls());

    let slots = profile.branch_slots();
    if slots.is_empty() {
        tracing::warn!(function = %func.name, "PGO requested but no branch profile exists");
        return Ok(());
    }
    if slots.len() != func.num_blocks() {
        return Err(Error::ShapeMismatch {
            function: func.name.clone(),
            slots: slots.len(),
            blocks: func.num_blocks(),
            stage: Stage::PreOptimization,
        });
    }

    let mut weighted = 0;
    for (idx, info) in slots.populated() {
        let (taken, total) = (info.taken(), info.total());
        if total == 0 {
            continue;
        }
        if let Terminator::CondBr { weights, .. } = &mut func.blocks[idx].terminator {
            *weights = Some(BranchWeights {
                taken,
                not_taken: total.saturating_sub(taken),
            });
            weighted += 1;
        }
    }

    tracing::debug!(
        function = %func.name,
        entry_count = profile.calls(),
        weighted,
        "applied profile feedback"
    );
    Ok(())
}
