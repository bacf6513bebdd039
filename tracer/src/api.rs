//! The public surface of the library.
//!
//! Every entry point resets the thread-local last-error slot to `Success`
//! and stores a specific code on failure, so callers that only see a boolean
//! (e.g. across the remote transport) can still recover the reason. The
//! trace operations run against the calling thread's current context, or
//! broadcast across every attached context when none is set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use winapi::um::winnt::{HANDLE, SE_DEBUG_NAME};

use crate::core;
use crate::error::{self, Result, TracerError};
use crate::process::{LocalProcess, ProcessContext, RemoteProcess};
use crate::record::TracedInstruction;
use crate::LIBRARY_VERSION;

static HAS_DEBUG_PRIVILEGE: AtomicBool = AtomicBool::new(false);

/// Resets last-error on entry; every public function starts with this.
fn enter() {
    error::set_last_error(TracerError::Success);
}

/// Mirrors a failure into the thread-local last-error slot.
fn leave<T>(result: Result<T>) -> Result<T> {
    if let Err(error) = &result {
        error::set_last_error(*error);
    }
    result
}

/// The version constant this build reports.
pub fn version() -> i32 {
    LIBRARY_VERSION
}

/// The last error stored for the calling thread.
pub fn last_error() -> TracerError {
    error::last_error()
}

/// Initializes the library. Must be called before any other operation.
/// `acquire_debug_privilege` requests SeDebugPrivilege for cross-process
/// attaching; failing to get it is not fatal here, only attaching to a
/// foreign process will fail later.
pub fn init(version: i32, acquire_debug_privilege: bool) -> Result<()> {
    enter();
    leave((|| {
        if version < 1 || version > LIBRARY_VERSION {
            return Err(TracerError::WrongVersion);
        }

        if acquire_debug_privilege {
            match core::set_privilege(SE_DEBUG_NAME, true) {
                Ok(()) => HAS_DEBUG_PRIVILEGE.store(true, Ordering::Relaxed),
                Err(error) => {
                    log::warn!("Could not acquire SeDebugPrivilege: {}", error);
                    error::set_last_error(error);
                }
            }
        }
        Ok(())
    })())
}

/// Detaches every attached process and drops the debug privilege again.
pub fn shutdown() -> Result<()> {
    enter();
    leave((|| {
        detach_all();

        if HAS_DEBUG_PRIVILEGE.swap(false, Ordering::Relaxed) {
            let _ = core::set_privilege(SE_DEBUG_NAME, false);
        }
        Ok(())
    })())
}

/// Attaches to a process. `pid <= 0` or the current pid attach locally;
/// anything else goes through the injection transport. Attaching twice to
/// the same pid returns the existing context.
pub fn attach_process(pid: i32, shared_memory_handle: Option<HANDLE>) -> Result<Arc<ProcessContext>> {
    enter();
    leave((|| {
        let current = core::current_pid();
        let pid = if pid <= 0 { current } else { pid as u32 };

        if let Some(existing) = core::context_for_pid(pid) {
            return Ok(existing);
        }

        let context = if pid == current {
            ProcessContext::Local(LocalProcess::attach(shared_memory_handle)?)
        } else {
            ProcessContext::Remote(RemoteProcess::attach(pid)?)
        };

        let context = Arc::new(context);
        core::insert_context(pid, context.clone());
        Ok(context)
    })())
}

fn detach_one(context: &Arc<ProcessContext>) {
    core::remove_context(context.pid());
    core::clear_current_context_if(context);

    if let ProcessContext::Local(process) = context.as_ref() {
        crate::process::local::clear_local_process(process);
    }
}

fn detach_all() {
    for context in core::drain_contexts() {
        core::clear_current_context_if(&context);
        if let ProcessContext::Local(process) = context.as_ref() {
            crate::process::local::clear_local_process(process);
        }
    }
}

/// Detaches one process context, or all of them when `None` is passed.
pub fn detach_process(context: Option<&Arc<ProcessContext>>) -> Result<()> {
    enter();
    match context {
        Some(context) => detach_one(context),
        None => detach_all(),
    }
    Ok(())
}

/// Sets the current process context for the calling thread. With `None` the
/// trace operations broadcast across all attached contexts.
pub fn set_process_context(context: Option<Arc<ProcessContext>>) {
    enter();
    core::set_current_context(context);
}

/// The calling thread's current process context.
pub fn get_process_context() -> Option<Arc<ProcessContext>> {
    enter();
    core::current_context()
}

/// The context attached for `pid`, if any. `pid <= 0` means the current
/// process.
pub fn context_for_pid(pid: i32) -> Option<Arc<ProcessContext>> {
    enter();
    let pid = if pid <= 0 { core::current_pid() } else { pid as u32 };
    core::context_for_pid(pid)
}

/// Runs `operation` against the current context, or across all attached
/// contexts when none is current. All contexts are visited even after a
/// failure; the first error wins.
fn for_each_context<F>(operation: F) -> Result<()>
where
    F: Fn(&ProcessContext) -> Result<()>,
{
    match core::current_context() {
        Some(context) => operation(&context),
        None => {
            let mut result = Ok(());
            for context in core::all_contexts() {
                if let Err(error) = operation(&context) {
                    result = result.and(Err(error));
                }
            }
            result
        }
    }
}

/// Begins tracing the function at `address`: every control transfer executed
/// between its entry and its return to the caller is recorded.
pub fn start_trace(address: usize, thread_id: i32, max_depth: i32, lifetime: i32) -> Result<()> {
    enter();
    leave(for_each_context(|context| {
        context.start_trace(address, thread_id, max_depth, lifetime)
    }))
}

/// Removes the entry breakpoint for `address`. A trace already in flight
/// completes normally; stopping an address that is not traced succeeds.
pub fn stop_trace(address: usize, thread_id: i32) -> Result<()> {
    enter();
    leave(for_each_context(|context| context.stop_trace(address, thread_id)))
}

/// Drains buffered trace records from the current context into `out`.
pub fn fetch_traces(out: &mut [TracedInstruction]) -> Result<usize> {
    enter();
    leave((|| {
        if out.is_empty() {
            return Err(TracerError::InvalidArgument);
        }
        match core::current_context() {
            Some(context) => Ok(context.fetch_traces(out)),
            None => Err(TracerError::NotImplemented),
        }
    })())
}

/// Reads one instruction from the traced process and formats it.
pub fn decode_and_format(address: usize) -> Result<String> {
    enter();
    leave((|| match core::current_context() {
        Some(context) => context.decode_and_format(address),
        None => Err(TracerError::NotImplemented),
    })())
}
