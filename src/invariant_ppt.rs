//! PPT Invariant System: setup-time and worker-side invariant enforcement
//! with contract tracking.
//!
//! Only non-real-time paths assert here. The audio thread reports through
//! [`crate::invariant_rt`] instead.

#[cfg(feature = "ppt")]
use lazy_static::lazy_static;
#[cfg(feature = "ppt")]
use std::collections::HashSet;
#[cfg(feature = "ppt")]
use std::sync::Mutex;

/// Region 0 was mapped at the configured base size.
pub const POOL_INITIAL_REGION: u32 = 1;
/// Regions are committed strictly in index order, each at its doubled size.
pub const POOL_REGION_ORDER: u32 = 2;
/// Pool space equals the sum of committed region sizes.
pub const POOL_SPACE_CONSISTENT: u32 = 3;
/// Driver lookup table is sorted by type id with no duplicates.
pub const DRIVER_TABLE_SORTED: u32 = 4;
/// Script replacement happened with the worker holding the execution lock.
pub const SCRIPT_SWAP_UNDER_LOCK: u32 = 5;
/// Saved state was handed to the script with the worker holding the lock.
pub const STATE_RESTORED: u32 = 6;
/// Port counts fit the fixed per-block arrays.
pub const HOST_PORTS_BOUND: u32 = 7;

#[cfg(feature = "ppt")]
lazy_static! {
    static ref INVARIANT_LOG: Mutex<HashSet<u32>> = Mutex::new(HashSet::new());
}

#[cfg(feature = "ppt")]
/// Assert an invariant: logs it and panics on failure.
pub(crate) fn assert_invariant(id: u32, condition: bool, message: &str, context: Option<&str>) {
    if !condition {
        let full_message = match context {
            Some(ctx) => format!("Invariant {} failed: {} (context: {})", id, message, ctx),
            None => format!("Invariant {} failed: {}", id, message),
        };
        log::error!("{}", full_message);
        panic!("{}", full_message);
    }
    if let Ok(mut log) = INVARIANT_LOG.lock() {
        log.insert(id);
    }
}

#[cfg(not(feature = "ppt"))]
/// Assert an invariant: checks condition and panics on failure.
pub(crate) fn assert_invariant(_id: u32, condition: bool, message: &str, _context: Option<&str>) {
    if !condition {
        panic!("Invariant failed: {}", message);
    }
}

#[cfg(feature = "ppt")]
/// Contract test: checks that specified invariants were asserted.
pub fn contract_test(test_name: &str, required_invariants: &[u32]) {
    let missing: Vec<u32> = {
        let log = INVARIANT_LOG.lock().unwrap_or_else(|e| e.into_inner());
        required_invariants
            .iter()
            .copied()
            .filter(|inv| !log.contains(inv))
            .collect()
    };
    if !missing.is_empty() {
        panic!(
            "Contract test '{}' failed: invariants not enforced: {:?}",
            test_name, missing
        );
    }
}

#[cfg(not(feature = "ppt"))]
/// Contract test: no-op when PPT feature is disabled.
pub fn contract_test(_test_name: &str, _required_invariants: &[u32]) {}

#[cfg(feature = "ppt")]
/// Clear invariant log (for between test runs).
pub fn clear_invariant_log() {
    INVARIANT_LOG
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clear();
}

#[cfg(not(feature = "ppt"))]
/// Clear invariant log: no-op when PPT feature is disabled.
pub fn clear_invariant_log() {}
