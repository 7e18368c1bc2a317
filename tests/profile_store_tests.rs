//! Profile store behavior under concurrency, and the dump report

mod common;

use common::*;
use jitprof::profiler::FunctionReport;
use jitprof::{global_profiler, ExternTable, FunctionProfile, JitFunctionProfiler, ProfilerConfig, ProfilingFlags};
use pretty_assertions::assert_eq;
use std::sync::Arc;

#[test]
fn test_concurrent_get_or_create_yields_one_profile() {
    let store = JitFunctionProfiler::new();
    let addrs: Vec<usize> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..16)
            .map(|_| {
                scope.spawn(|| {
                    let profile = store.get_or_create_profile("shared", FunctionProfile::default);
                    profile as *const FunctionProfile as usize
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(addrs.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(store.len(), 1);
}

#[test]
fn test_dump_is_idempotent() {
    let store = Arc::new(JitFunctionProfiler::new());
    let pipeline = noop_pipeline(&store);
    let mut a = branchy("alpha", Some(ProfilingFlags::BRANCHES | ProfilingFlags::CALLS));
    let mut b = looping("beta", Some(ProfilingFlags::BRANCHES));
    pipeline.compile(&mut a).unwrap();
    pipeline.compile(&mut b).unwrap();
    run_each(&a, &ExternTable::new(), 0..7);

    let first = store.dump_to_string().unwrap();
    let second = store.dump_to_string().unwrap();
    assert_eq!(first, second);

    let mut buffer = Vec::new();
    store.dump(&mut buffer).unwrap();
    assert_eq!(String::from_utf8(buffer).unwrap(), first);
}

#[test]
fn test_idle_functions_still_listed() {
    let store = Arc::new(JitFunctionProfiler::new());
    let mut func = looping("idle", Some(ProfilingFlags::BRANCHES));
    noop_pipeline(&store).compile(&mut func).unwrap();

    // Slot exists but was never traversed
    assert_eq!(
        store.dump_to_string().unwrap(),
        "[{\"Name\":\"idle\",\"Branches\":[{\"Idx\":1,\"Taken\":0,\"Total\":0}],\"Loops\":1,\"BBs\":4,\"Insts\":7}]\n"
    );
    assert!(!store.snapshot()[0].has_counts());
}

#[test]
fn test_dump_active_skips_idle_functions() {
    let store = Arc::new(JitFunctionProfiler::new());
    let pipeline = noop_pipeline(&store);
    let mut busy = branchy("busy", Some(ProfilingFlags::CALLS));
    let mut idle = looping("idle", Some(ProfilingFlags::BRANCHES));
    pipeline.compile(&mut busy).unwrap();
    pipeline.compile(&mut idle).unwrap();
    run_each(&busy, &ExternTable::new(), 0..2);

    let mut buffer = Vec::new();
    store.dump_active(&mut buffer).unwrap();
    assert_eq!(
        String::from_utf8(buffer).unwrap(),
        "[{\"Name\":\"busy\",\"Calls\":2,\"BBs\":4,\"Insts\":5}]\n"
    );
    assert_eq!(store.len(), 2);
}

#[test]
fn test_global_profiler_drives_pipeline() {
    let store = global_profiler();
    let pipeline = noop_pipeline(&store);
    let mut func = branchy("global_store_counted", Some(ProfilingFlags::CALLS));
    pipeline.compile(&mut func).unwrap();
    run_each(&func, &ExternTable::new(), 0..3);

    let profile = global_profiler().get_profile("global_store_counted").unwrap();
    assert_eq!(profile.calls(), 3);
}

#[test]
fn test_dump_sorted_by_name() {
    let store = JitFunctionProfiler::new();
    for name in ["zeta", "alpha", "mu"] {
        store.get_or_create_profile(name, FunctionProfile::default);
    }
    let names: Vec<String> = store.snapshot().into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["alpha", "mu", "zeta"]);
}

#[test]
fn test_dump_to_path() {
    let store = Arc::new(JitFunctionProfiler::new());
    let mut func = branchy("filed", Some(ProfilingFlags::CALLS));
    noop_pipeline(&store).compile(&mut func).unwrap();
    run_each(&func, &ExternTable::new(), [1, 2]);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("profile.json");
    store.dump_to_path(&path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let reports: Vec<FunctionReport> = serde_json::from_str(&text).unwrap();
    assert_eq!(reports, store.snapshot());
    assert_eq!(reports[0].calls, 2);
}

#[test]
fn test_config_from_environment_pairs() {
    let config = ProfilerConfig::from_vars([
        ("JITPROF_FORCE_PROFILE_BRANCHES", "1"),
        ("JITPROF_DUMP_PATH", "/tmp/out.json"),
        ("UNRELATED", "x"),
    ])
    .unwrap();
    assert_eq!(config.forced_flags(), ProfilingFlags::BRANCHES);
    assert_eq!(config.dump_path.as_deref(), Some(std::path::Path::new("/tmp/out.json")));
}

#[test]
fn test_counters_printed_as_atomics() {
    let store = Arc::new(JitFunctionProfiler::new());
    let mut func = branchy("shown", Some(ProfilingFlags::CALLS | ProfilingFlags::BRANCHES));
    noop_pipeline(&store).compile(&mut func).unwrap();

    let text = func.to_string();
    assert_eq!(text.matches("atomicrmw add").count(), 3);
    assert!(text.contains("monotonic"));
}
