//! Per-function compilation driver
//!
//! A [`JitPipeline`] brackets an optimizer with the two profiling passes:
//!
//! ```text
//! PreOptimizationProfiler -> FunctionOptimizer -> PostOptimizationProfiler
//! ```
//!
//! Each stage's [`PreservedAnalyses`] is returned in a [`CompileReport`]. The
//! first failing stage stops compilation of that function.

use std::sync::Arc;

use crate::config::{AllocSymbols, ProfilerConfig};
use crate::error::Result;
use crate::instrument::{FunctionPass, PostOptimizationProfiler, PreOptimizationProfiler, PreservedAnalyses};
use crate::ir::{analysis, Callee, Function, Instr, Operand};
use crate::profiler::JitFunctionProfiler;

/// The transformation run between the profiling passes
pub trait FunctionOptimizer: Send + Sync {
    fn name(&self) -> &str;
    fn optimize(&self, func: &mut Function) -> Result<PreservedAnalyses>;
}

/// Leaves every function untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopOptimizer;

impl FunctionOptimizer for NoopOptimizer {
    fn name(&self) -> &str {
        "Noop"
    }

    fn optimize(&self, _func: &mut Function) -> Result<PreservedAnalyses> {
        Ok(PreservedAnalyses::all())
    }
}

/// Largest request served from the small-object pool
pub const DEFAULT_POOL_LIMIT: i64 = 2032;

/// Lowers the canonical allocation request to a concrete allocator
///
/// Requests with a constant size up to `pool_limit` bytes go to the pool
/// allocator; everything else goes to the large-object allocator.
#[derive(Debug, Clone)]
pub struct AllocLowering {
    pub symbols: AllocSymbols,
    pub pool_limit: i64,
    pub pool_symbol: String,
    pub big_symbol: String,
}

impl Default for AllocLowering {
    fn default() -> Self {
        Self {
            symbols: AllocSymbols::default(),
            pool_limit: DEFAULT_POOL_LIMIT,
            pool_symbol: "jit.gc_pool_alloc".to_string(),
            big_symbol: "jit.gc_big_alloc".to_string(),
        }
    }
}

impl AllocLowering {
    fn lowered_symbol(&self, size: Option<&Operand>) -> &str {
        match size {
            Some(Operand::Const(c)) if c.value <= self.pool_limit => &self.pool_symbol,
            _ => &self.big_symbol,
        }
    }
}

impl FunctionOptimizer for AllocLowering {
    fn name(&self) -> &str {
        "AllocLowering"
    }

    fn optimize(&self, func: &mut Function) -> Result<PreservedAnalyses> {
        let mut lowered = 0;
        for block in &mut func.blocks {
            for instr in &mut block.instrs {
                let Instr::Call { callee, args, .. } = instr else {
                    continue;
                };
                if callee.symbol() != Some(self.symbols.preopt_symbol.as_str()) {
                    continue;
                }
                let target = self.lowered_symbol(args.get(self.symbols.size_arg));
                *callee = Callee::Symbol(target.to_string());
                lowered += 1;
            }
        }

        tracing::debug!(function = %func.name, lowered, "lowered allocation requests");
        Ok(if lowered > 0 {
            PreservedAnalyses::cfg()
        } else {
            PreservedAnalyses::all()
        })
    }
}

/// What each stage of one compilation preserved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileReport {
    pub preopt: PreservedAnalyses,
    pub optimizer: PreservedAnalyses,
    pub postopt: PreservedAnalyses,
}

impl CompileReport {
    /// What survives the whole pipeline
    pub fn overall(&self) -> PreservedAnalyses {
        self.preopt.intersect(self.optimizer).intersect(self.postopt)
    }
}

/// Runs the profiling passes around an optimizer
pub struct JitPipeline {
    profiler: Option<Arc<JitFunctionProfiler>>,
    config: ProfilerConfig,
    optimizer: Box<dyn FunctionOptimizer>,
}

impl JitPipeline {
    pub fn new(
        profiler: Option<Arc<JitFunctionProfiler>>,
        config: ProfilerConfig,
        optimizer: Box<dyn FunctionOptimizer>,
    ) -> Self {
        Self {
            profiler,
            config,
            optimizer,
        }
    }

    /// A pipeline without profiling
    pub fn unprofiled(optimizer: Box<dyn FunctionOptimizer>) -> Self {
        Self::new(None, ProfilerConfig::default(), optimizer)
    }

    pub fn profiler(&self) -> Option<&JitFunctionProfiler> {
        self.profiler.as_deref()
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    /// Instrument, optimize, then instrument again
    pub fn compile(&self, func: &mut Function) -> Result<CompileReport> {
        let profiler = self.profiler();

        let preopt = PreOptimizationProfiler::new(profiler, &self.config).run(func)?;
        let optimizer = self.optimizer.optimize(func)?;
        let postopt = PostOptimizationProfiler::new(profiler, &self.config).run(func)?;
        analysis::verify(func)?;

        let report = CompileReport {
            preopt,
            optimizer,
            postopt,
        };
        tracing::debug!(
            function = %func.name,
            optimizer = self.optimizer.name(),
            preserves_all = report.overall().preserves_all(),
            preserves_cfg = report.overall().preserves_cfg(),
            "compiled"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for JitPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitPipeline")
            .field("profiled", &self.profiler.is_some())
            .field("config", &self.config)
            .field("optimizer", &self.optimizer.name())
            .finish()
    }
}
