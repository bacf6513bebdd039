//! End-to-end scenarios against the local engine: arm a trace on a real
//! function, run it, drain the ring and check the recorded stream.
#![cfg(all(windows, target_arch = "x86"))]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use once_cell::sync::Lazy;
use tracer::{InstructionType, TracedInstruction};

/// The engine is a per-process singleton; scenarios must not interleave.
static ENGINE: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

fn attach_local() -> (MutexGuard<'static, ()>, Arc<tracer::ProcessContext>) {
    let guard = ENGINE.lock().unwrap();

    tracer::init(tracer::LIBRARY_VERSION, false).unwrap();
    let context = tracer::attach_process(-1, None).unwrap();
    tracer::set_process_context(Some(context.clone()));
    (guard, context)
}

fn teardown() {
    tracer::shutdown().unwrap();
}

fn drain() -> Vec<TracedInstruction> {
    let mut records = Vec::new();
    let mut chunk = [TracedInstruction::default(); 64];
    loop {
        let fetched = tracer::fetch_traces(&mut chunk).unwrap();
        records.extend_from_slice(&chunk[..fetched]);
        if fetched == 0 {
            return records;
        }
    }
}

fn calls_and_returns(records: &[TracedInstruction]) -> Vec<(InstructionType, i32)> {
    records
        .iter()
        .filter(|record| record.kind != InstructionType::Branch)
        .map(|record| (record.kind, record.call_depth))
        .collect()
}

// The traced bodies must contain exactly the calls the scenarios count, so
// no `black_box` in here; `black_box` compiles to a call of its own.
#[inline(never)]
fn factorial(n: u32) -> u32 {
    if n == 0 {
        return 1;
    }
    n * factorial(n - 1)
}

#[inline(never)]
fn depth_one() -> u32 {
    depth_two() + 1
}

#[inline(never)]
fn depth_two() -> u32 {
    depth_three() + 1
}

#[inline(never)]
fn depth_three() -> u32 {
    depth_four() + 1
}

#[inline(never)]
fn depth_four() -> u32 {
    4
}

#[test]
fn factorial_records_the_expected_call_depth_sequence() {
    let (_guard, _context) = attach_local();
    let entry = factorial as *const () as usize;

    tracer::start_trace(entry, -1, -1, -1).unwrap();
    assert_eq!(factorial(std::hint::black_box(5)), 120);
    tracer::stop_trace(entry, -1).unwrap();

    let records = drain();
    let events = calls_and_returns(&records);

    let expected: Vec<(InstructionType, i32)> = [1, 2, 3, 4, 5]
        .iter()
        .map(|&depth| (InstructionType::Call, depth))
        .chain([4, 3, 2, 1, 0].iter().map(|&depth| (InstructionType::Return, depth)))
        .collect();
    assert_eq!(events, expected);

    // All records belong to the driving thread and the same trace.
    let thread_id = records[0].thread_id;
    let trace_id = records[0].trace_id;
    assert!(records
        .iter()
        .all(|record| record.thread_id == thread_id && record.trace_id == trace_id));

    teardown();
}

#[test]
fn every_call_matches_its_return_one_level_up() {
    let (_guard, _context) = attach_local();
    let entry = factorial as *const () as usize;

    tracer::start_trace(entry, -1, -1, -1).unwrap();
    factorial(std::hint::black_box(7));
    tracer::stop_trace(entry, -1).unwrap();

    let events = calls_and_returns(&drain());
    assert!(!events.is_empty());

    // A call at depth d pairs with the return that brings the thread back to
    // depth d - 1.
    let mut open_calls = Vec::new();
    for (kind, depth) in events {
        match kind {
            InstructionType::Call => open_calls.push(depth),
            InstructionType::Return => {
                let call_depth = open_calls.pop().expect("return without a call");
                assert_eq!(depth, call_depth - 1);
            }
            InstructionType::Branch => {}
        }
    }
    assert!(open_calls.is_empty());

    teardown();
}

#[test]
fn depth_cap_suspends_deeper_calls() {
    let (_guard, _context) = attach_local();
    let entry = depth_one as *const () as usize;

    tracer::start_trace(entry, -1, 2, -1).unwrap();
    assert_eq!(depth_one(), std::hint::black_box(7));
    tracer::stop_trace(entry, -1).unwrap();

    let records = drain();
    assert!(!records.is_empty());

    // Calls are recorded down to the cap; everything below ran suspended and
    // left no records.
    let call_depths: Vec<i32> = records
        .iter()
        .filter(|record| record.kind == InstructionType::Call)
        .map(|record| record.call_depth)
        .collect();
    assert!(call_depths.contains(&1));
    assert!(call_depths.iter().all(|&depth| depth <= 2));
    assert!(records.iter().all(|record| record.call_depth <= 2));

    teardown();
}

#[test]
fn thread_filter_ignores_other_threads() {
    let (_guard, _context) = attach_local();
    let entry = factorial as *const () as usize;

    // A parked worker donates its thread id as the filter target.
    let worker_id = Arc::new(AtomicU32::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    let worker = {
        let worker_id = Arc::clone(&worker_id);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let id = unsafe { winapi::um::processthreadsapi::GetCurrentThreadId() };
            worker_id.store(id, Ordering::Release);
            while !stop.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
        })
    };

    while worker_id.load(Ordering::Acquire) == 0 {
        std::thread::yield_now();
    }
    let filter = worker_id.load(Ordering::Acquire) as i32;

    tracer::start_trace(entry, filter, -1, -1).unwrap();
    factorial(std::hint::black_box(5));
    tracer::stop_trace(entry, filter).unwrap();

    stop.store(true, Ordering::Release);
    worker.join().unwrap();

    // The breakpoint only existed on the worker; this thread ran untraced.
    assert!(drain().is_empty());

    teardown();
}

#[test]
fn lifetime_limits_the_number_of_traced_invocations() {
    let (_guard, _context) = attach_local();
    let entry = factorial as *const () as usize;

    tracer::start_trace(entry, -1, -1, 2).unwrap();
    for _ in 0..3 {
        factorial(std::hint::black_box(3));
    }

    let records = drain();
    let mut trace_ids: Vec<i32> = records.iter().map(|record| record.trace_id).collect();
    trace_ids.dedup();
    assert_eq!(trace_ids.len(), 2);

    // The expired trace removed itself; stopping it again is still success.
    tracer::stop_trace(entry, -1).unwrap();

    teardown();
}

#[test]
fn stop_trace_leaves_no_residual_breakpoint() {
    let (_guard, _context) = attach_local();
    let entry = factorial as *const () as usize;

    tracer::start_trace(entry, -1, -1, -1).unwrap();
    tracer::stop_trace(entry, -1).unwrap();

    // Repeated stop of an address that is no longer traced is a no-op
    // success.
    tracer::stop_trace(entry, -1).unwrap();

    factorial(std::hint::black_box(5));
    assert!(drain().is_empty());

    teardown();
}

#[test]
fn draining_in_small_chunks_loses_nothing() {
    let (_guard, _context) = attach_local();
    let entry = factorial as *const () as usize;

    tracer::start_trace(entry, -1, -1, -1).unwrap();
    factorial(std::hint::black_box(10));
    tracer::stop_trace(entry, -1).unwrap();

    // Tiny fetches force the consumer index to crawl and wrap.
    let mut records = Vec::new();
    let mut chunk = [TracedInstruction::default(); 4];
    loop {
        let fetched = tracer::fetch_traces(&mut chunk).unwrap();
        records.extend_from_slice(&chunk[..fetched]);
        if fetched == 0 {
            break;
        }
    }

    let calls = records
        .iter()
        .filter(|record| record.kind == InstructionType::Call)
        .count();
    let returns = records
        .iter()
        .filter(|record| record.kind == InstructionType::Return)
        .count();
    assert_eq!(calls, 10);
    assert_eq!(returns, 10);

    teardown();
}
