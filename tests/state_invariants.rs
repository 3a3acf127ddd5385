//! Property-based tests for the shared suspend-state bitset.
//!
//! Two independent coordinators (GC and debugger) and the abort
//! controller compose the same per-thread state word; these properties
//! pin down that composed mutations never corrupt foreign bits.

use proptest::prelude::*;
use std::sync::Arc;

use stopworld::suspend_state::{AtomicSuspendState, SuspendState};

fn arb_state() -> impl Strategy<Value = SuspendState> {
    any::<u32>().prop_map(SuspendState::from_bits_truncate)
}

proptest! {
    /// replace(insert, remove) == (state & !remove) | insert, atomically.
    #[test]
    fn replace_matches_the_sequential_model(
        initial in arb_state(),
        insert in arb_state(),
        remove in arb_state(),
    ) {
        let state = AtomicSuspendState::new();
        state.insert(initial);

        let previous = state.replace(insert, remove);
        prop_assert_eq!(previous, initial);

        let expected = SuspendState::from_bits_truncate(
            (initial.bits() & !remove.bits()) | insert.bits(),
        );
        prop_assert_eq!(state.load(), expected);
    }

    /// insert_unless never fires when any guard bit is present.
    #[test]
    fn insert_unless_honors_the_guard(
        initial in arb_state(),
        flags in arb_state(),
        guard in arb_state(),
    ) {
        let state = AtomicSuspendState::new();
        state.insert(initial);

        let fired = state.insert_unless(flags, guard);
        if initial.intersects(guard) {
            prop_assert!(!fired);
            prop_assert_eq!(state.load(), initial);
        } else {
            prop_assert!(fired);
            prop_assert_eq!(state.load(), initial | flags);
        }
    }

    /// remove_if_set is all-or-nothing.
    #[test]
    fn remove_if_set_is_exact(initial in arb_state(), flags in arb_state()) {
        let state = AtomicSuspendState::new();
        state.insert(initial);

        let fired = state.remove_if_set(flags);
        if initial.contains(flags) {
            prop_assert!(fired);
            prop_assert_eq!(state.load(), initial - flags);
        } else {
            prop_assert!(!fired);
            prop_assert_eq!(state.load(), initial);
        }
    }
}

/// Concurrent GC-flag and debugger-flag churn leaves no foreign bits
/// behind, whatever the interleaving.
#[test]
fn concurrent_flag_churn_is_composable() {
    let state = Arc::new(AtomicSuspendState::new());
    let rounds = 5_000usize;

    crossbeam::scope(|scope| {
        let gc_state = Arc::clone(&state);
        scope.spawn(move |_| {
            for round in 0..rounds {
                gc_state.insert(SuspendState::SUSPEND_PENDING);
                if round % 3 == 0 {
                    gc_state.insert(SuspendState::REDIRECTED);
                }
                gc_state.remove(SuspendState::GC_CYCLE_FLAGS);
            }
        });

        let dbg_state = Arc::clone(&state);
        scope.spawn(move |_| {
            for _ in 0..rounds {
                dbg_state
                    .insert(SuspendState::DEBUG_SUSPEND_PENDING | SuspendState::WILL_SYNC);
                dbg_state.replace(
                    SuspendState::SYNC_SUSPENDED,
                    SuspendState::DEBUG_SUSPEND_PENDING | SuspendState::WILL_SYNC,
                );
                dbg_state.remove(SuspendState::SYNC_SUSPENDED);
            }
        });

        let abort_state = Arc::clone(&state);
        scope.spawn(move |_| {
            for _ in 0..rounds {
                if abort_state.insert_unless(
                    SuspendState::ABORT_REQUESTED,
                    SuspendState::ABORT_INITIATED,
                ) {
                    abort_state.remove(SuspendState::ABORT_REQUESTED);
                }
            }
        });
    })
    .unwrap();

    // Each actor cleaned up after itself; the word must be empty.
    assert!(state.load().is_empty(), "leftover bits: {:?}", state.load());
}
