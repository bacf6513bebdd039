//! Per-thread trace scratch, reachable from the exception handler.
//!
//! Four independent integers per thread, no locks. The dispatcher only ever
//! touches its own thread's slots, so plain `Cell`s are enough. A slot value
//! of `-1` means "none".

use core::cell::Cell;

thread_local! {
    static ACTIVE_BP_INDEX: Cell<i32> = Cell::new(-1);
    static SUSPENDED_BP_INDEX: Cell<i32> = Cell::new(-1);
    static CURRENT_TRACE_ID: Cell<i32> = Cell::new(-1);
    static CALL_DEPTH: Cell<i32> = Cell::new(0);
}

/// Debug slot of the breakpoint driving the current trace, `-1` when the
/// thread is not inside a traced function.
pub fn active_breakpoint_index() -> i32 {
    ACTIVE_BP_INDEX.with(|slot| slot.get())
}

pub fn set_active_breakpoint_index(index: i32) {
    ACTIVE_BP_INDEX.with(|slot| slot.set(index));
}

/// Debug slot of the one-shot resume breakpoint, `-1` unless branch tracing
/// is disabled pending return from excluded code.
pub fn suspended_breakpoint_index() -> i32 {
    SUSPENDED_BP_INDEX.with(|slot| slot.get())
}

pub fn set_suspended_breakpoint_index(index: i32) {
    SUSPENDED_BP_INDEX.with(|slot| slot.set(index));
}

/// Monotonic per-thread id of the trace currently (or most recently) driving
/// this thread.
pub fn current_trace_id() -> i32 {
    CURRENT_TRACE_ID.with(|slot| slot.get())
}

pub fn call_depth() -> i32 {
    CALL_DEPTH.with(|slot| slot.get())
}

/// Records a call: pre-increments the depth and returns the new value.
pub fn on_branch_entered() -> i32 {
    CALL_DEPTH.with(|slot| {
        let depth = slot.get() + 1;
        slot.set(depth);
        depth
    })
}

/// Records a return: pre-decrements the depth and returns the new value.
pub fn on_branch_returned() -> i32 {
    CALL_DEPTH.with(|slot| {
        let depth = slot.get() - 1;
        slot.set(depth);
        depth
    })
}

/// Arms this thread for a new trace driven by the given debug slot.
pub fn on_begin_new_trace(index: i32) {
    set_active_breakpoint_index(index);
    CALL_DEPTH.with(|slot| slot.set(0));
    CURRENT_TRACE_ID.with(|slot| slot.set(slot.get() + 1));
}

/// Clears the per-thread state once the trace has ended.
pub fn on_trace_ended() {
    set_active_breakpoint_index(-1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_start_empty() {
        std::thread::spawn(|| {
            assert_eq!(active_breakpoint_index(), -1);
            assert_eq!(suspended_breakpoint_index(), -1);
            assert_eq!(current_trace_id(), -1);
            assert_eq!(call_depth(), 0);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_depth_accounting_over_a_whole_trace() {
        std::thread::spawn(|| {
            on_begin_new_trace(2);
            assert_eq!(active_breakpoint_index(), 2);
            assert_eq!(current_trace_id(), 0);

            // Five recursive calls followed by five returns: the depth walks
            // 1..=5 and back down, ending at 0 on the final return.
            let mut seen = Vec::new();
            for _ in 0..5 {
                seen.push(on_branch_entered());
            }
            for _ in 0..5 {
                seen.push(on_branch_returned());
            }
            assert_eq!(seen, [1, 2, 3, 4, 5, 4, 3, 2, 1, 0]);

            on_trace_ended();
            assert_eq!(active_breakpoint_index(), -1);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_trace_id_increments_per_trace() {
        std::thread::spawn(|| {
            on_begin_new_trace(0);
            on_trace_ended();
            on_begin_new_trace(1);
            assert_eq!(current_trace_id(), 1);

            // A new trace resets the depth even if the previous one ended
            // unbalanced.
            on_branch_entered();
            on_trace_ended();
            on_begin_new_trace(0);
            assert_eq!(call_depth(), 0);
        })
        .join()
        .unwrap();
    }
}
