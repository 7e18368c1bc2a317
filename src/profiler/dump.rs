//! Structured text report of the profile store
//!
//! One object per function:
//!
//! ```text
//! {"Name":"foo","Calls":10,"Allocs":[{"Size":..,"Count":..},{..}],
//!  "Branches":[{"Idx":1,"Taken":3,"Total":10}],"Loops":1,"BBs":4,"Insts":5}
//! ```
//!
//! `Calls` and `Loops` are omitted when zero, `Allocs` when neither stage
//! counted an allocation, and `Branches` when no slot is populated.

use serde::{Deserialize, Serialize};

use super::{AllocInfo, FunctionProfile};

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// Allocation volume for one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AllocReport {
    pub size: u64,
    pub count: u64,
}

impl AllocReport {
    fn capture(info: &AllocInfo) -> Self {
        Self {
            size: info.size(),
            count: info.count(),
        }
    }
}

/// Outcome counts of one populated branch slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BranchReport {
    pub idx: usize,
    pub taken: u64,
    pub total: u64,
}

/// Snapshot of one function profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionReport {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Calls", default, skip_serializing_if = "is_zero")]
    pub calls: u64,
    /// `[pre-optimization, post-optimization]`
    #[serde(rename = "Allocs", default, skip_serializing_if = "Option::is_none")]
    pub allocs: Option<[AllocReport; 2]>,
    #[serde(rename = "Branches", default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<BranchReport>,
    #[serde(rename = "Loops", default, skip_serializing_if = "is_zero")]
    pub loops: u64,
    #[serde(rename = "BBs")]
    pub bbs: u64,
    #[serde(rename = "Insts")]
    pub insts: u64,
}

impl FunctionReport {
    /// Read `profile`'s counters; takes the profile's branch lock while reading slots
    pub fn capture(name: &str, profile: &FunctionProfile) -> Self {
        let preopt = AllocReport::capture(&profile.preopt);
        let postopt = AllocReport::capture(&profile.postopt);
        let allocs = (preopt.count != 0 || postopt.count != 0).then_some([preopt, postopt]);

        let branches = profile
            .branch_slots()
            .populated()
            .map(|(idx, info)| BranchReport {
                idx,
                taken: info.taken(),
                total: info.total(),
            })
            .collect();

        Self {
            name: name.to_string(),
            calls: profile.calls(),
            allocs,
            branches,
            loops: profile.shape.loops,
            bbs: profile.shape.blocks,
            insts: profile.shape.insts,
        }
    }

    /// Whether any counter of this function is nonzero
    pub fn has_counts(&self) -> bool {
        self.calls != 0
            || self.allocs.is_some()
            || self.branches.iter().any(|b| b.total != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiler::{JitFunctionProfiler, StructuralCounts};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_empty_store_dump() {
        let store = JitFunctionProfiler::new();
        assert_eq!(store.dump_to_string().unwrap(), "[]\n");
    }

    #[test]
    fn test_zero_counters_omitted() {
        let store = JitFunctionProfiler::new();
        store.get_or_create_profile("idle", || {
            FunctionProfile::new(StructuralCounts { loops: 0, blocks: 2, insts: 6 })
        });
        assert_eq!(
            store.dump_to_string().unwrap(),
            "[{\"Name\":\"idle\",\"BBs\":2,\"Insts\":6}]\n"
        );
    }

    #[test]
    fn test_full_record_field_order() {
        let store = JitFunctionProfiler::new();
        let profile = store.get_or_create_profile("busy", || {
            FunctionProfile::new(StructuralCounts { loops: 1, blocks: 4, insts: 12 })
        });
        profile.call_count.fetch_add(10, Ordering::Relaxed);
        profile.postopt.count.fetch_add(2, Ordering::Relaxed);
        profile.postopt.size.fetch_add(64, Ordering::Relaxed);
        {
            let mut slots = profile.branch_slots();
            slots.ensure_len(4);
            let info = slots.get_or_insert(1);
            info.total.fetch_add(10, Ordering::Relaxed);
            info.taken.fetch_add(3, Ordering::Relaxed);
        }

        assert_eq!(
            store.dump_to_string().unwrap(),
            concat!(
                "[{\"Name\":\"busy\",\"Calls\":10,",
                "\"Allocs\":[{\"Size\":0,\"Count\":0},{\"Size\":64,\"Count\":2}],",
                "\"Branches\":[{\"Idx\":1,\"Taken\":3,\"Total\":10}],",
                "\"Loops\":1,\"BBs\":4,\"Insts\":12}]\n"
            )
        );
    }

    #[test]
    fn test_alloc_size_without_count_is_omitted() {
        let store = JitFunctionProfiler::new();
        let profile = store.get_or_create_profile("sized", FunctionProfile::default);
        profile.preopt.size.fetch_add(8, Ordering::Relaxed);
        let report = &store.snapshot()[0];
        assert!(report.allocs.is_none());
    }

    #[test]
    fn test_report_parses_back() {
        let store = JitFunctionProfiler::new();
        let profile = store.get_or_create_profile("g", FunctionProfile::default);
        profile.call_count.fetch_add(3, Ordering::Relaxed);
        let text = store.dump_to_string().unwrap();
        let parsed: Vec<FunctionReport> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, store.snapshot());
        assert!(parsed[0].has_counts());
    }
}
