//! Instrumentation run after the optimizer

use super::{add_alloc_instrumentation, check_alloc_calls, FunctionPass, PreservedAnalyses};
use crate::config::ProfilerConfig;
use crate::error::{Error, Result, Stage};
use crate::ir::{
    AtomicOrdering, BinOp, BranchWeights, Callee, Constant, Function, Instr, Metadata, Operand, Ty,
};
use crate::profiler::{counter, FunctionProfile, JitFunctionProfiler, ProfilingFlags, REPORTER_ANNOTATION};

/// Decoded `jitprof.reporter` annotation
///
/// When the call counter reaches `threshold`, the function calls `callback`
/// with `args`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReporterSpec {
    pub threshold: i64,
    pub callback: u64,
    pub args: Vec<Constant>,
}

impl ReporterSpec {
    /// Decode `(threshold, callback address, arg0, arg1, ...)`
    pub fn from_annotation(function: &str, md: &Metadata) -> Result<Self> {
        let malformed = |reason: String| Error::malformed(function, REPORTER_ANNOTATION, reason);

        let items = md
            .as_tuple()
            .ok_or_else(|| malformed(format!("expected a tuple, got {}", md.kind())))?;
        if items.len() < 2 {
            return Err(malformed(format!("expected at least 2 entries, got {}", items.len())));
        }

        let threshold = match &items[0] {
            Metadata::Int(n) => *n,
            other => return Err(malformed(format!("threshold must be an integer, got {}", other.kind()))),
        };
        let callback = match &items[1] {
            Metadata::Int(addr) => *addr as u64,
            other => {
                return Err(malformed(format!(
                    "callback address must be an integer, got {}",
                    other.kind()
                )))
            }
        };
        let args = items[2..]
            .iter()
            .enumerate()
            .map(|(i, item)| {
                item.as_constant().ok_or_else(|| {
                    malformed(format!("argument {} must be a constant, got {}", i, item.kind()))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            threshold,
            callback,
            args,
        })
    }

    pub fn to_annotation(&self) -> Metadata {
        let mut items = vec![Metadata::Int(self.threshold), Metadata::Int(self.callback as i64)];
        items.extend(self.args.iter().map(|c| match c.ty {
            Ty::I1 => Metadata::Bool(c.value != 0),
            Ty::I64 => Metadata::Int(c.value),
        }));
        Metadata::Tuple(items)
    }

    /// Weights for the threshold check: the report edge is the rare one
    fn weights(&self, observed_calls: u64) -> BranchWeights {
        let remaining = (self.threshold as i128 - observed_calls as i128).max(1);
        BranchWeights {
            taken: 1,
            not_taken: remaining.min(u64::MAX as i128) as u64,
        }
    }
}

/// Installs call counting (with its optional reporter) and post-optimization
/// allocation counters
///
/// Only functions that already have a profile are instrumented.
pub struct PostOptimizationProfiler<'a> {
    profiler: Option<&'a JitFunctionProfiler>,
    config: &'a ProfilerConfig,
}

impl<'a> PostOptimizationProfiler<'a> {
    pub fn new(profiler: Option<&'a JitFunctionProfiler>, config: &'a ProfilerConfig) -> Self {
        Self { profiler, config }
    }
}

impl FunctionPass for PostOptimizationProfiler<'_> {
    fn name(&self) -> &'static str {
        "jit-postopt-profiler"
    }

    fn run(&mut self, func: &mut Function) -> Result<PreservedAnalyses> {
        let Some(profiler) = self.profiler else {
            return Ok(PreservedAnalyses::all());
        };

        let flags = ProfilingFlags::resolve(func, self.config)?;
        if !flags.intersects(ProfilingFlags::CALLS | ProfilingFlags::ALLOCATIONS) {
            return Ok(PreservedAnalyses::all());
        }
        let Some(profile) = profiler.get_profile(&func.name) else {
            tracing::debug!(function = %func.name, "no profile; skipping post-optimization counters");
            return Ok(PreservedAnalyses::all());
        };

        // Decode and check everything before the function changes
        if flags.contains(ProfilingFlags::ALLOCATIONS) {
            check_alloc_calls(func, Stage::PostOptimization, &self.config.alloc)?;
        }
        let reporter = match func.annotation(REPORTER_ANNOTATION) {
            Some(md) if flags.contains(ProfilingFlags::CALLS) => {
                Some(ReporterSpec::from_annotation(&func.name, md)?)
            }
            _ => None,
        };

        let mut preserved = PreservedAnalyses::all();

        if flags.contains(ProfilingFlags::CALLS) {
            let split = add_call_instrumentation(profile, func, reporter.as_ref());
            preserved = preserved.intersect(if split {
                PreservedAnalyses::none()
            } else {
                PreservedAnalyses::cfg()
            });
        }

        if flags.contains(ProfilingFlags::ALLOCATIONS) {
            let sites =
                add_alloc_instrumentation(&profile.postopt, func, Stage::PostOptimization, &self.config.alloc)?;
            tracing::debug!(function = %func.name, sites, "post-optimization allocation counters");
            if sites > 0 {
                preserved = preserved.intersect(PreservedAnalyses::cfg());
            }
        }

        Ok(preserved)
    }
}

/// Count entries to `func`, and report once the count reaches the threshold
///
/// Returns whether the entry block was split for the reporter.
fn add_call_instrumentation(
    profile: &'static FunctionProfile,
    func: &mut Function,
    reporter: Option<&ReporterSpec>,
) -> bool {
    let entry = func.entry();
    let previous = func.fresh_value();
    let mut prologue = vec![Instr::AtomicAdd {
        result: Some(previous),
        counter: counter(&profile.call_count),
        value: Constant::i64(1).into(),
        ordering: AtomicOrdering::Monotonic,
    }];

    let Some(reporter) = reporter else {
        func.insert_instrs(entry, 0, prologue);
        tracing::debug!(function = %func.name, "call counter installed");
        return false;
    };

    // The add yields the old value; compare the incremented one
    let current = func.fresh_value();
    let hit = func.fresh_value();
    prologue.push(Instr::BinOp {
        result: current,
        op: BinOp::Add,
        lhs: previous.into(),
        rhs: Constant::i64(1).into(),
    });
    prologue.push(Instr::BinOp {
        result: hit,
        op: BinOp::Eq,
        lhs: current.into(),
        rhs: Constant::i64(reporter.threshold).into(),
    });
    let len = prologue.len();
    func.insert_instrs(entry, 0, prologue);

    let weights = reporter.weights(profile.calls());
    let report = func.split_block_and_insert_if_then(entry, len, Operand::Value(hit), Some(weights));
    func.block_mut(report).instrs.push(Instr::Call {
        result: None,
        callee: Callee::Address(reporter.callback),
        args: reporter.args.iter().copied().map(Operand::Const).collect(),
    });

    tracing::debug!(
        function = %func.name,
        threshold = reporter.threshold,
        callback = reporter.callback,
        "call counter installed with reporter"
    );
    true
}
