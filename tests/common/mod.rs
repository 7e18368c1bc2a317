//! Shared IR builders and runners for integration tests

use jitprof::ir::{BinOp, Constant, Function, FunctionBuilder};
use jitprof::pipeline::{FunctionOptimizer, JitPipeline, NoopOptimizer};
use jitprof::{Executor, ExternTable, JitFunctionProfiler, ProfilerConfig, ProfilingFlags, FLAGS_ANNOTATION};
use std::sync::Arc;

/// `x < 3` decides between two arms that rejoin: 4 blocks, 5 instructions
pub fn branchy(name: &str, flags: Option<ProfilingFlags>) -> Function {
    let mut b = FunctionBuilder::new(name);
    if let Some(flags) = flags {
        b.annotate(FLAGS_ANNOTATION, flags.to_annotation());
    }
    let x = b.param();
    let then = b.create_block("then");
    let other = b.create_block("else");
    let exit = b.create_block("exit");
    let c = b.binop(BinOp::Slt, x, Constant::i64(3));
    b.cond_br(c, then, vec![], other, vec![]);
    b.switch_to_block(then);
    b.br(exit, vec![]);
    b.switch_to_block(other);
    b.br(exit, vec![]);
    b.switch_to_block(exit);
    b.ret(None);
    b.build().unwrap()
}

/// One canonical allocation request of `size` bytes, returning the object
#[allow(dead_code)]
pub fn allocating(name: &str, flags: Option<ProfilingFlags>, size: i64) -> Function {
    let mut b = FunctionBuilder::new(name);
    if let Some(flags) = flags {
        b.annotate(FLAGS_ANNOTATION, flags.to_annotation());
    }
    let obj = b.call(
        "jit.gc_alloc_obj",
        vec![Constant::i64(0).into(), Constant::i64(size).into(), Constant::i64(0).into()],
    );
    b.ret(Some(obj.into()));
    b.build().unwrap()
}

/// Sum of `0..n`, one natural loop
#[allow(dead_code)]
pub fn looping(name: &str, flags: Option<ProfilingFlags>) -> Function {
    let mut b = FunctionBuilder::new(name);
    if let Some(flags) = flags {
        b.annotate(FLAGS_ANNOTATION, flags.to_annotation());
    }
    let n = b.param();
    let header = b.create_block("header");
    let i = b.block_param(header);
    let acc = b.block_param(header);
    let body = b.create_block("body");
    let exit = b.create_block("exit");
    b.br(header, vec![Constant::i64(0).into(), Constant::i64(0).into()]);
    b.switch_to_block(header);
    let more = b.binop(BinOp::Slt, i, n);
    b.cond_br(more, body, vec![], exit, vec![]);
    b.switch_to_block(body);
    let acc2 = b.binop(BinOp::Add, acc, i);
    let i2 = b.binop(BinOp::Add, i, Constant::i64(1));
    b.br(header, vec![i2.into(), acc2.into()]);
    b.switch_to_block(exit);
    b.ret(Some(acc.into()));
    b.build().unwrap()
}

/// Allocator entry points that all return a dummy object
#[allow(dead_code)]
pub fn allocator_externs() -> ExternTable {
    let mut externs = ExternTable::new();
    externs
        .register_symbol("jit.gc_alloc_obj", |_| 0x10)
        .register_symbol("jit.gc_pool_alloc", |_| 0x20)
        .register_symbol("jit.gc_big_alloc", |_| 0x30);
    externs
}

pub fn pipeline_with(store: &Arc<JitFunctionProfiler>, optimizer: Box<dyn FunctionOptimizer>) -> JitPipeline {
    JitPipeline::new(Some(Arc::clone(store)), ProfilerConfig::default(), optimizer)
}

#[allow(dead_code)]
pub fn noop_pipeline(store: &Arc<JitFunctionProfiler>) -> JitPipeline {
    pipeline_with(store, Box::new(NoopOptimizer))
}

/// Run `func` once per argument
#[allow(dead_code)]
pub fn run_each(func: &Function, externs: &ExternTable, args: impl IntoIterator<Item = i64>) {
    let exec = Executor::new(externs);
    for arg in args {
        exec.run(func, &[arg]).unwrap();
    }
}
