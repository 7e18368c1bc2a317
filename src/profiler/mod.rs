//! Profile store for instrumented JIT functions
//!
//! Instrumented code updates counters through absolute addresses baked into
//! the IR (see [`CounterRef`]), so every counter must keep its address for
//! the life of the process. Profiles are therefore leaked into
//! process-lifetime storage on creation and are never moved or freed; the
//! store only hands out `&'static` references to them.
//!
//! Locking: one store-wide mutex covers the name → profile map; each profile
//! has its own mutex covering its branch-slot sequence. Counter updates from
//! running code take neither.

mod dump;

pub use dump::{AllocReport, BranchReport, FunctionReport};

use bitflags::bitflags;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::config::ProfilerConfig;
use crate::error::{Error, Result};
use crate::ir::{analysis, CounterRef, Function, Metadata};

/// Annotation key of the per-function flag tuple
pub const FLAGS_ANNOTATION: &str = "jitprof.flags";
/// Annotation key of the call-count reporter tuple
pub const REPORTER_ANNOTATION: &str = "jitprof.reporter";

// ==================== Profiling Flags ====================

bitflags! {
    /// Which counters to install in a function
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ProfilingFlags: u8 {
        const ALLOCATIONS = 1 << 0;
        const BRANCHES = 1 << 1;
        const CALLS = 1 << 2;
        const APPLY_PGO = 1 << 3;
    }
}

/// Annotation field order
const FIELD_ORDER: [ProfilingFlags; 4] = [
    ProfilingFlags::ALLOCATIONS,
    ProfilingFlags::BRANCHES,
    ProfilingFlags::CALLS,
    ProfilingFlags::APPLY_PGO,
];

impl ProfilingFlags {
    /// Resolve the flags for `func`
    ///
    /// An explicit annotation is authoritative; otherwise the configuration's
    /// force switches apply.
    pub fn resolve(func: &Function, config: &ProfilerConfig) -> Result<Self> {
        match func.annotation(FLAGS_ANNOTATION) {
            Some(md) => Self::from_annotation(&func.name, md),
            None => Ok(config.forced_flags()),
        }
    }

    /// Decode the 4-tuple `(allocations, branches, calls, apply_pgo)`
    pub fn from_annotation(function: &str, md: &Metadata) -> Result<Self> {
        let items = md.as_tuple().ok_or_else(|| {
            Error::malformed(function, FLAGS_ANNOTATION, format!("expected a tuple, got {}", md.kind()))
        })?;
        if items.len() != FIELD_ORDER.len() {
            return Err(Error::malformed(
                function,
                FLAGS_ANNOTATION,
                format!("expected {} entries, got {}", FIELD_ORDER.len(), items.len()),
            ));
        }

        let mut flags = ProfilingFlags::empty();
        for (idx, (item, flag)) in items.iter().zip(FIELD_ORDER).enumerate() {
            let value = item.as_int().ok_or_else(|| {
                Error::malformed(
                    function,
                    FLAGS_ANNOTATION,
                    format!("entry {} must be a boolean constant, got {}", idx, item.kind()),
                )
            })?;
            flags.set(flag, value != 0);
        }
        Ok(flags)
    }

    /// Encode as the annotation tuple understood by [`Self::from_annotation`]
    pub fn to_annotation(self) -> Metadata {
        Metadata::Tuple(
            FIELD_ORDER
                .iter()
                .map(|flag| Metadata::Bool(self.contains(*flag)))
                .collect(),
        )
    }
}

// ==================== Profile Entities ====================

/// Allocation volume counters
#[derive(Debug, Default)]
pub struct AllocInfo {
    /// Total bytes requested
    pub size: AtomicU64,
    /// Number of allocation events
    pub count: AtomicU64,
}

impl AllocInfo {
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Outcome counters of one conditional branch site
///
/// `taken <= total` once all updates have landed; concurrent readers may
/// briefly observe otherwise.
#[derive(Debug, Default)]
pub struct BranchInfo {
    pub taken: AtomicU64,
    pub total: AtomicU64,
}

impl BranchInfo {
    pub fn taken(&self) -> u64 {
        self.taken.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Static shape of a function, captured when its profile is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StructuralCounts {
    pub loops: u64,
    pub blocks: u64,
    pub insts: u64,
}

impl StructuralCounts {
    pub fn of(func: &Function) -> Self {
        Self {
            loops: analysis::loop_count(func) as u64,
            blocks: func.num_blocks() as u64,
            insts: func.inst_count() as u64,
        }
    }
}

/// Aggregated counters for one function name
#[derive(Debug, Default)]
pub struct FunctionProfile {
    pub call_count: AtomicU64,
    /// Allocations seen before optimization
    pub preopt: AllocInfo,
    /// Allocations seen after optimization
    pub postopt: AllocInfo,
    branches: Mutex<Vec<Option<&'static BranchInfo>>>,
    pub shape: StructuralCounts,
}

impl FunctionProfile {
    pub fn new(shape: StructuralCounts) -> Self {
        Self {
            shape,
            ..Self::default()
        }
    }

    /// A fresh profile describing `func` as it is now
    pub fn from_function(func: &Function) -> Self {
        Self::new(StructuralCounts::of(func))
    }

    pub fn calls(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Lock the branch-slot sequence
    pub fn branch_slots(&self) -> BranchSlots<'_> {
        BranchSlots {
            slots: self.branches.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

/// Locked view of a profile's branch slots, one per block
pub struct BranchSlots<'a> {
    slots: MutexGuard<'a, Vec<Option<&'static BranchInfo>>>,
}

impl BranchSlots<'_> {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Size the sequence to `blocks` slots on first use
    ///
    /// Returns `false` if it was already sized to a different length.
    pub fn ensure_len(&mut self, blocks: usize) -> bool {
        if self.slots.is_empty() {
            self.slots.resize(blocks, None);
        }
        self.slots.len() == blocks
    }

    pub fn get(&self, idx: usize) -> Option<&'static BranchInfo> {
        self.slots.get(idx).copied().flatten()
    }

    /// The cell for block `idx`, created on first request
    ///
    /// `idx` must be within the sized sequence.
    pub fn get_or_insert(&mut self, idx: usize) -> &'static BranchInfo {
        *self.slots[idx].get_or_insert_with(|| &*Box::leak(Box::new(BranchInfo::default())))
    }

    /// Populated slots as `(block index, cell)`
    pub fn populated(&self) -> impl Iterator<Item = (usize, &'static BranchInfo)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.map(|info| (idx, info)))
    }
}

/// Embeddable address of a counter owned by a leaked profile
pub fn counter(cell: &'static AtomicU64) -> CounterRef {
    CounterRef::new(cell)
}

// ==================== Function Profiler ====================

/// Process-wide map from function name to its profile
#[derive(Debug, Default)]
pub struct JitFunctionProfiler {
    profiles: Mutex<BTreeMap<String, &'static FunctionProfile>>,
}

impl JitFunctionProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, &'static FunctionProfile>> {
        self.profiles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up an existing profile; never creates one
    pub fn get_profile(&self, name: &str) -> Option<&'static FunctionProfile> {
        self.lock().get(name).copied()
    }

    /// Fetch the profile for `name`, building it with `create` if absent
    ///
    /// `create` runs with the store lock held and must not touch the store.
    /// Functions sharing a name share one profile.
    pub fn get_or_create_profile(
        &self,
        name: &str,
        create: impl FnOnce() -> FunctionProfile,
    ) -> &'static FunctionProfile {
        let mut profiles = self.lock();
        if let Some(profile) = profiles.get(name) {
            return *profile;
        }
        let profile: &'static FunctionProfile = Box::leak(Box::new(create()));
        tracing::debug!(
            function = name,
            blocks = profile.shape.blocks,
            insts = profile.shape.insts,
            loops = profile.shape.loops,
            "created function profile"
        );
        profiles.insert(name.to_string(), profile);
        profile
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Read every profile into report rows, in name order
    pub fn snapshot(&self) -> Vec<FunctionReport> {
        let profiles = self.lock();
        profiles
            .iter()
            .map(|(name, profile)| FunctionReport::capture(name, profile))
            .collect()
    }

    /// Write the report, one JSON array terminated by a newline
    pub fn dump(&self, sink: &mut impl Write) -> Result<()> {
        write_reports(sink, &self.snapshot())
    }

    /// Like [`dump`](Self::dump), leaving out functions whose counters are all zero
    pub fn dump_active(&self, sink: &mut impl Write) -> Result<()> {
        let reports: Vec<_> = self.snapshot().into_iter().filter(FunctionReport::has_counts).collect();
        write_reports(sink, &reports)
    }

    pub fn dump_to_string(&self) -> Result<String> {
        let mut out = serde_json::to_string(&self.snapshot())?;
        out.push('\n');
        Ok(out)
    }

    pub fn dump_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        self.dump(&mut file)?;
        file.flush()?;
        Ok(())
    }
}

fn write_reports(sink: &mut impl Write, reports: &[FunctionReport]) -> Result<()> {
    serde_json::to_writer(&mut *sink, reports)?;
    sink.write_all(b"\n")?;
    Ok(())
}

/// The process-wide profile store
pub fn global_profiler() -> Arc<JitFunctionProfiler> {
    static GLOBAL: OnceLock<Arc<JitFunctionProfiler>> = OnceLock::new();
    Arc::clone(GLOBAL.get_or_init(|| Arc::new(JitFunctionProfiler::new())))
}
