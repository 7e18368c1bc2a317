//! Jitprof: profiling instrumentation for a JIT compilation pipeline
//!
//! Jitprof inserts lightweight counters into functions as they are compiled
//! and aggregates the counts in a process-wide store. The counts can be dumped
//! as a structured report or fed back to later compilations as branch weights
//! and entry frequencies.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use jitprof::ir::{BinOp, Constant, FunctionBuilder};
//! use jitprof::pipeline::{JitPipeline, NoopOptimizer};
//! use jitprof::{Executor, ExternTable, JitFunctionProfiler, ProfilerConfig, ProfilingFlags, FLAGS_ANNOTATION};
//!
//! fn main() -> jitprof::Result<()> {
//!     let mut b = FunctionBuilder::new("inc");
//!     b.annotate(FLAGS_ANNOTATION, ProfilingFlags::CALLS.to_annotation());
//!     let x = b.param();
//!     let y = b.binop(BinOp::Add, x, Constant::i64(1));
//!     b.ret(Some(y.into()));
//!     let mut func = b.build()?;
//!
//!     let store = Arc::new(JitFunctionProfiler::new());
//!     let pipeline = JitPipeline::new(Some(Arc::clone(&store)), ProfilerConfig::default(), Box::new(NoopOptimizer));
//!     pipeline.compile(&mut func)?;
//!
//!     let externs = ExternTable::new();
//!     Executor::new(&externs).run(&func, &[41])?;
//!     assert_eq!(store.get_profile("inc").map(|p| p.calls()), Some(1));
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! | Module | Role |
//! |--------|------|
//! | [`ir`] | SSA function IR, builder, analyses, printer |
//! | [`instrument`] | Pre- and post-optimization profiling passes |
//! | [`profiler`] | Flag decoding, profile store, dump report |
//! | [`pipeline`] | Instrument → optimize → instrument driver |
//! | [`exec`] | Reference executor for instrumented functions |
//! | [`config`] | Force switches and allocation entry points |

pub mod config;
pub mod exec;
pub mod instrument;
pub mod ir;
pub mod pipeline;
pub mod profiler;

mod error;

pub use config::ProfilerConfig;
pub use error::{Error, Result, Stage};
pub use exec::{Executor, ExternTable};
pub use profiler::{global_profiler, FunctionProfile, JitFunctionProfiler, ProfilingFlags, FLAGS_ANNOTATION, REPORTER_ANNOTATION};

/// Jitprof version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
