//! RT-safe invariant signaling for the audio thread.
//!
//! Two tiers:
//! - **Tier 1 (RT-safe)**: `process` pushes integer ids into a lock-free
//!   SPSC queue
//! - **Tier 2 (Non-RT)**: the worker drains the queue and tests judge the
//!   contracts
//!
//! RT code **signals facts**. Non-RT code **judges correctness**.
//!
//! ```ignore
//! signal_invariant(&mut tx, INV_BLOCK_STASHED);
//!
//! let signals = drain_invariant_signals(&mut rx);
//! assert!(signals.contains(&INV_BLOCK_STASHED));
//! ```

use rtrb::{Consumer, Producer, RingBuffer};

// ============================================================================
// RT-Safe Invariant IDs (Tier 1)
// ============================================================================

/// The script ran on the live block.
pub const INV_BLOCK_PROCESSED: u8 = 1;

/// The lock was busy and the block went to the stash.
pub const INV_BLOCK_STASHED: u8 = 2;

/// Stashed blocks were replayed ahead of a live block.
pub const INV_STASH_REPLAYED: u8 = 3;

/// A stash ran out of room; later events in the period are dropped.
pub const INV_STASH_OVERFLOW: u8 = 4;

/// The pool ran dry and the block was bypassed.
pub const INV_OOM_BYPASS: u8 = 5;

/// An output buffer ran out of room and the block was bypassed.
pub const INV_FORGE_OVERFLOW: u8 = 6;

/// The script failed and is disabled until new code loads.
pub const INV_SCRIPT_ERROR: u8 = 7;

/// `process` returned without panicking.
pub const INV_RT_CALLBACK_CLEAN: u8 = 8;

/// The pool asked the worker for a new region during this block.
pub const INV_GROWTH_REQUESTED: u8 = 9;

// ============================================================================
// Invariant Signal Queue
// ============================================================================

/// Capacity for invariant signal queue.
/// Large enough for several blocks between worker drains.
pub const INVARIANT_QUEUE_CAPACITY: usize = 256;

/// Returns (producer for the audio thread, consumer for the worker).
pub fn new_invariant_queue() -> (Producer<u8>, Consumer<u8>) {
    RingBuffer::new(INVARIANT_QUEUE_CAPACITY)
}

/// Signals an invariant from the RT path.
///
/// # RT Safety
/// No allocation, no locking, no panics. A full queue drops the signal.
#[inline]
pub fn signal_invariant(tx: &mut Producer<u8>, id: u8) {
    let _ = tx.push(id);
}

// ============================================================================
// Non-RT Verification (Tier 2)
// ============================================================================

/// Drains all pending invariant signals from the queue.
pub fn drain_invariant_signals(rx: &mut Consumer<u8>) -> Vec<u8> {
    let mut signals = Vec::with_capacity(rx.slots());
    while let Ok(id) = rx.pop() {
        signals.push(id);
    }
    signals
}

/// Counts occurrences of each invariant ID in a signal list.
pub fn count_invariant_signals(signals: &[u8]) -> [usize; 256] {
    let mut counts = [0usize; 256];
    for &id in signals {
        counts[id as usize] += 1;
    }
    counts
}

/// Contract verification: asserts that required invariants were signaled.
///
/// # Panics
/// Panics if any required invariant was not signaled at least once.
#[cfg(any(test, feature = "ppt"))]
pub fn contract_test_rt(contract_name: &str, signals: &[u8], required: &[u8]) {
    let counts = count_invariant_signals(signals);
    let missing: Vec<&str> = required
        .iter()
        .filter(|&&id| counts[id as usize] == 0)
        .map(|&id| invariant_name(id))
        .collect();

    if !missing.is_empty() {
        let present: std::collections::BTreeSet<&str> =
            signals.iter().map(|&id| invariant_name(id)).collect();
        panic!(
            "RT Contract '{}' missing invariants: {:?}. Present: {:?}",
            contract_name, missing, present
        );
    }
}

/// Maps invariant ID to human-readable name (for diagnostics only).
pub const fn invariant_name(id: u8) -> &'static str {
    match id {
        INV_BLOCK_PROCESSED => "BLOCK_PROCESSED",
        INV_BLOCK_STASHED => "BLOCK_STASHED",
        INV_STASH_REPLAYED => "STASH_REPLAYED",
        INV_STASH_OVERFLOW => "STASH_OVERFLOW",
        INV_OOM_BYPASS => "OOM_BYPASS",
        INV_FORGE_OVERFLOW => "FORGE_OVERFLOW",
        INV_SCRIPT_ERROR => "SCRIPT_ERROR",
        INV_RT_CALLBACK_CLEAN => "RT_CALLBACK_CLEAN",
        INV_GROWTH_REQUESTED => "GROWTH_REQUESTED",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invariant_queue_roundtrip() {
        let (mut tx, mut rx) = new_invariant_queue();
        signal_invariant(&mut tx, INV_BLOCK_STASHED);
        signal_invariant(&mut tx, INV_STASH_REPLAYED);
        signal_invariant(&mut tx, INV_BLOCK_STASHED);
        assert_eq!(
            drain_invariant_signals(&mut rx),
            vec![INV_BLOCK_STASHED, INV_STASH_REPLAYED, INV_BLOCK_STASHED]
        );
    }

    #[test]
    fn test_count_invariant_signals() {
        let counts = count_invariant_signals(&[INV_OOM_BYPASS, INV_OOM_BYPASS, INV_BLOCK_PROCESSED]);
        assert_eq!(counts[INV_OOM_BYPASS as usize], 2);
        assert_eq!(counts[INV_BLOCK_PROCESSED as usize], 1);
        assert_eq!(counts[INV_SCRIPT_ERROR as usize], 0);
    }

    #[test]
    #[should_panic(expected = "missing invariants")]
    fn test_contract_fails_when_invariants_missing() {
        contract_test_rt(
            "incomplete contract",
            &[INV_BLOCK_STASHED],
            &[INV_BLOCK_STASHED, INV_STASH_REPLAYED],
        );
    }

    #[test]
    fn test_queue_handles_overflow_gracefully() {
        let (mut tx, mut rx) = new_invariant_queue();
        for _ in 0..INVARIANT_QUEUE_CAPACITY + 100 {
            signal_invariant(&mut tx, INV_RT_CALLBACK_CLEAN);
        }
        assert_eq!(drain_invariant_signals(&mut rx).len(), INVARIANT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_invariant_names() {
        assert_eq!(invariant_name(INV_GROWTH_REQUESTED), "GROWTH_REQUESTED");
        assert_eq!(invariant_name(255), "UNKNOWN");
    }
}
