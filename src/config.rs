//! Profiler configuration
//!
//! Process-wide switches and allocation entry-point names. A configuration is
//! resolved once (from defaults, the environment, or JSON) and passed
//! explicitly to flag resolution and the instrumenters.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result, Stage};
use crate::profiler::ProfilingFlags;

pub const ENV_FORCE_ALLOCATIONS: &str = "JITPROF_FORCE_PROFILE_ALLOCATIONS";
pub const ENV_FORCE_CALLS: &str = "JITPROF_FORCE_PROFILE_CALLS";
pub const ENV_FORCE_BRANCHES: &str = "JITPROF_FORCE_PROFILE_BRANCHES";
pub const ENV_DUMP_PATH: &str = "JITPROF_DUMP_PATH";

/// How allocation calls are recognized at each stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocSymbols {
    /// The canonical allocation request before optimization (exact match)
    pub preopt_symbol: String,
    /// Name fragments of the lowered allocators after optimization (substring match)
    pub postopt_fragments: Vec<String>,
    /// Index of the size argument in an allocation call
    pub size_arg: usize,
}

impl Default for AllocSymbols {
    fn default() -> Self {
        Self {
            preopt_symbol: "jit.gc_alloc_obj".to_string(),
            postopt_fragments: vec!["gc_pool_alloc".to_string(), "gc_big_alloc".to_string()],
            size_arg: 1,
        }
    }
}

impl AllocSymbols {
    /// Whether `name` is an allocation entry point at `stage`
    pub fn matches(&self, name: &str, stage: Stage) -> bool {
        match stage {
            Stage::PreOptimization => name == self.preopt_symbol,
            Stage::PostOptimization => self
                .postopt_fragments
                .iter()
                .any(|fragment| name.contains(fragment.as_str())),
        }
    }
}

/// Configuration consumed by flag resolution and the instrumenters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    pub force_profile_allocations: bool,
    pub force_profile_calls: bool,
    pub force_profile_branches: bool,
    pub alloc: AllocSymbols,
    /// Where the binary writes the dump report, if anywhere
    pub dump_path: Option<PathBuf>,
}

impl ProfilerConfig {
    /// Read the force switches and dump path from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Build a configuration from `(name, value)` pairs
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                ENV_FORCE_ALLOCATIONS => config.force_profile_allocations = parse_switch(key, value)?,
                ENV_FORCE_CALLS => config.force_profile_calls = parse_switch(key, value)?,
                ENV_FORCE_BRANCHES => config.force_profile_branches = parse_switch(key, value)?,
                ENV_DUMP_PATH if !value.is_empty() => config.dump_path = Some(PathBuf::from(value)),
                _ => {}
            }
        }
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.alloc.preopt_symbol.is_empty() {
            return Err(Error::Config("empty pre-optimization allocation symbol".into()));
        }
        if self.alloc.postopt_fragments.iter().any(String::is_empty) {
            return Err(Error::Config(
                "empty post-optimization allocator fragment would match every call".into(),
            ));
        }
        Ok(())
    }

    /// Flags applied to functions that carry no explicit annotation
    ///
    /// PGO feedback is never forced.
    pub fn forced_flags(&self) -> ProfilingFlags {
        let mut flags = ProfilingFlags::empty();
        flags.set(ProfilingFlags::ALLOCATIONS, self.force_profile_allocations);
        flags.set(ProfilingFlags::BRANCHES, self.force_profile_branches);
        flags.set(ProfilingFlags::CALLS, self.force_profile_calls);
        flags
    }
}

fn parse_switch(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!("{}: expected a boolean, got `{}`", key, other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_off() {
        let config = ProfilerConfig::default();
        assert!(config.forced_flags().is_empty());
        assert_eq!(config.alloc.size_arg, 1);
    }

    #[test]
    fn test_from_vars() {
        let config = ProfilerConfig::from_vars([
            (ENV_FORCE_CALLS, "1"),
            (ENV_FORCE_BRANCHES, "on"),
            (ENV_DUMP_PATH, "/tmp/prof.json"),
            ("UNRELATED", "whatever"),
        ])
        .unwrap();
        assert!(config.force_profile_calls);
        assert!(config.force_profile_branches);
        assert!(!config.force_profile_allocations);
        assert_eq!(config.dump_path, Some(PathBuf::from("/tmp/prof.json")));
        assert_eq!(
            config.forced_flags(),
            ProfilingFlags::CALLS | ProfilingFlags::BRANCHES
        );
    }

    #[test]
    fn test_bad_switch_value() {
        let err = ProfilerConfig::from_vars([(ENV_FORCE_CALLS, "maybe")]).unwrap_err();
        assert!(err.to_string().contains("expected a boolean"));
    }

    #[test]
    fn test_from_json_partial() {
        let config = ProfilerConfig::from_json(r#"{"force_profile_allocations": true}"#).unwrap();
        assert!(config.force_profile_allocations);
        assert_eq!(config.alloc, AllocSymbols::default());
    }

    #[test]
    fn test_from_json_rejects_empty_fragment() {
        let result = ProfilerConfig::from_json(r#"{"alloc": {"postopt_fragments": [""]}}"#);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_alloc_symbol_matching() {
        let symbols = AllocSymbols::default();
        assert!(symbols.matches("jit.gc_alloc_obj", Stage::PreOptimization));
        assert!(!symbols.matches("jit.gc_alloc_obj2", Stage::PreOptimization));
        assert!(symbols.matches("ijl_gc_pool_alloc_instrumented", Stage::PostOptimization));
        assert!(symbols.matches("gc_big_alloc", Stage::PostOptimization));
        assert!(!symbols.matches("jit.gc_alloc_obj", Stage::PostOptimization));
    }
}
