//! Jitprof CLI
//!
//! Compiles a sample workload through the profiling pipeline, runs it on
//! several threads, then prints the collected profile.

use anyhow::{Context, Result};
use clap::Parser;
use jitprof::ir::{BinOp, Constant, Function, FunctionBuilder, Metadata};
use jitprof::instrument::ReporterSpec;
use jitprof::pipeline::{AllocLowering, JitPipeline};
use jitprof::{
    global_profiler, Executor, ExternTable, JitFunctionProfiler, ProfilerConfig, ProfilingFlags,
    FLAGS_ANNOTATION, REPORTER_ANNOTATION, VERSION,
};
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

const WORKLOAD: &str = "workload";
const REPORTER_ADDRESS: u64 = 0x1;

#[derive(Parser)]
#[command(name = "jitprof")]
#[command(author, version, about = "Profile a sample JIT workload", long_about = None)]
struct Cli {
    /// Count calls to the workload
    #[arg(long)]
    profile_calls: bool,

    /// Count branch outcomes in the workload
    #[arg(long)]
    profile_branches: bool,

    /// Count allocations before and after lowering
    #[arg(long)]
    profile_allocations: bool,

    /// Force call counting on functions without a flag annotation
    #[arg(long)]
    force_calls: bool,

    /// Force branch counting on functions without a flag annotation
    #[arg(long)]
    force_branches: bool,

    /// Force allocation counting on functions without a flag annotation
    #[arg(long)]
    force_allocations: bool,

    /// Report once the call count reaches this value
    #[arg(long, value_name = "N")]
    reporter_threshold: Option<i64>,

    /// Recompile with the collected profile applied and print the result
    #[arg(long)]
    apply_pgo: bool,

    /// Worker threads
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// Calls per thread
    #[arg(short, long, default_value_t = 100)]
    iterations: usize,

    /// Loop trip count of each call
    #[arg(long, default_value_t = 16)]
    trip_count: i64,

    /// Print the instrumented IR
    #[arg(long)]
    print_ir: bool,

    /// Write the dump here instead of stdout
    #[arg(long, value_name = "FILE")]
    dump: Option<PathBuf>,

    /// Leave functions with all-zero counters out of the dump
    #[arg(long)]
    active_only: bool,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn annotated_flags(&self) -> Option<ProfilingFlags> {
        let mut flags = ProfilingFlags::empty();
        flags.set(ProfilingFlags::CALLS, self.profile_calls);
        flags.set(ProfilingFlags::BRANCHES, self.profile_branches);
        flags.set(ProfilingFlags::ALLOCATIONS, self.profile_allocations);
        (!flags.is_empty()).then_some(flags)
    }

    fn config(&self) -> Result<ProfilerConfig> {
        let mut config = ProfilerConfig::from_env().context("reading profiler environment")?;
        config.force_profile_calls |= self.force_calls;
        config.force_profile_branches |= self.force_branches;
        config.force_profile_allocations |= self.force_allocations;
        if let Some(path) = &self.dump {
            config.dump_path = Some(path.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    tracing::info!(version = VERSION, "jitprof starting");

    let config = cli.config()?;
    let store = global_profiler();
    let pipeline = JitPipeline::new(
        Some(store.clone()),
        config.clone(),
        Box::new(AllocLowering::default()),
    );

    let mut func = build_workload(cli.annotated_flags(), cli.reporter_threshold)?;
    let report = pipeline
        .compile(&mut func)
        .with_context(|| format!("compiling `{}`", func.name))?;
    tracing::info!(?report, "workload compiled");
    if cli.print_ir {
        print!("{}", func);
    }

    let externs = workload_externs();
    let started = Instant::now();
    run_workers(&func, &externs, cli.threads, cli.iterations, cli.trip_count)?;
    tracing::info!(
        threads = cli.threads,
        iterations = cli.iterations,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "workload finished"
    );

    match &config.dump_path {
        Some(path) => {
            let file = std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
            let mut file = std::io::BufWriter::new(file);
            write_dump(&store, &mut file, cli.active_only)
                .with_context(|| format!("writing dump to {}", path.display()))?;
            file.flush()?;
        }
        None => write_dump(&store, &mut std::io::stdout().lock(), cli.active_only)?,
    }

    if cli.apply_pgo {
        let mut flags = cli.annotated_flags().unwrap_or_else(|| config.forced_flags());
        flags.insert(ProfilingFlags::APPLY_PGO);
        let mut recompiled = build_workload(Some(flags), None)?;
        pipeline
            .compile(&mut recompiled)
            .with_context(|| format!("recompiling `{}` with profile", recompiled.name))?;
        print!("{}", recompiled);
    }

    Ok(())
}

fn write_dump(store: &JitFunctionProfiler, sink: &mut impl Write, active_only: bool) -> jitprof::Result<()> {
    if active_only {
        store.dump_active(sink)
    } else {
        store.dump(sink)
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// A counted loop that allocates and branches on a random input each trip
fn build_workload(flags: Option<ProfilingFlags>, threshold: Option<i64>) -> Result<Function> {
    let mut b = FunctionBuilder::new(WORKLOAD);
    if let Some(flags) = flags {
        b.annotate(FLAGS_ANNOTATION, flags.to_annotation());
    }
    if let Some(threshold) = threshold {
        let reporter = ReporterSpec {
            threshold,
            callback: REPORTER_ADDRESS,
            args: vec![Constant::i64(threshold)],
        };
        b.annotate(REPORTER_ANNOTATION, reporter.to_annotation());
    }
    b.annotate("workload.kind", Metadata::Str("sample".into()));

    let n = b.param();
    let header = b.create_block("header");
    let i = b.block_param(header);
    let acc = b.block_param(header);
    let body = b.create_block("body");
    let odd = b.create_block("odd");
    let even = b.create_block("even");
    let latch = b.create_block("latch");
    let merged = b.block_param(latch);
    let exit = b.create_block("exit");

    b.br(header, vec![Constant::i64(0).into(), Constant::i64(0).into()]);

    b.switch_to_block(header);
    let more = b.binop(BinOp::Slt, i, n);
    b.cond_br(more, body, vec![], exit, vec![]);

    b.switch_to_block(body);
    b.call(
        "jit.gc_alloc_obj",
        vec![Constant::i64(0).into(), Constant::i64(48).into(), Constant::i64(0).into()],
    );
    let input = b.call("input", vec![i.into()]);
    let bit = b.binop(BinOp::And, input, Constant::i64(1));
    let is_odd = b.binop(BinOp::Ne, bit, Constant::i64(0));
    b.cond_br(is_odd, odd, vec![], even, vec![]);

    b.switch_to_block(odd);
    let bumped = b.binop(BinOp::Add, acc, Constant::i64(3));
    b.br(latch, vec![bumped.into()]);

    b.switch_to_block(even);
    b.br(latch, vec![acc.into()]);

    b.switch_to_block(latch);
    let next = b.binop(BinOp::Add, i, Constant::i64(1));
    b.br(header, vec![next.into(), merged.into()]);

    b.switch_to_block(exit);
    b.ret(Some(acc.into()));

    Ok(b.build()?)
}

fn workload_externs() -> ExternTable {
    let mut externs = ExternTable::new();
    externs
        .register_symbol("input", |_| i64::from(rand::random::<u32>()))
        .register_symbol("jit.gc_alloc_obj", |_| 0)
        .register_symbol("jit.gc_pool_alloc", |_| 0)
        .register_symbol("jit.gc_big_alloc", |_| 0)
        .register_address(REPORTER_ADDRESS, |args| {
            tracing::info!(threshold = args.first().copied().unwrap_or_default(), "call threshold reached");
            0
        });
    externs
}

fn run_workers(func: &Function, externs: &ExternTable, threads: usize, iterations: usize, trip_count: i64) -> Result<()> {
    let exec = Executor::new(externs);
    std::thread::scope(|scope| {
        let workers: Vec<_> = (0..threads)
            .map(|_| {
                scope.spawn(move || -> jitprof::Result<()> {
                    for _ in 0..iterations {
                        exec.run(func, &[trip_count])?;
                    }
                    Ok(())
                })
            })
            .collect();
        for worker in workers {
            match worker.join() {
                Ok(result) => result.context("executing workload")?,
                Err(_) => anyhow::bail!("worker thread panicked"),
            }
        }
        Ok(())
    })
}
