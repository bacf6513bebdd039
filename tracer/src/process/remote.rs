//! The remote process context: the engine runs inside the target process and
//! streams its records back through the shared mapping.
//!
//! Attaching drives the injection contract end to end: create the mapping,
//! duplicate its handle into the target, load this library over there, then
//! call its exported entry points by rebased addresses with argument blocks
//! marshalled through remote memory.

use std::mem;
use std::ptr;

use winapi::shared::minwindef::FALSE;
use winapi::um::handleapi::DuplicateHandle;
use winapi::um::processthreadsapi::GetCurrentProcess;
use winapi::um::winnt::{DUPLICATE_SAME_ACCESS, HANDLE};

use crate::core::OwnedHandle;
use crate::error::{Result, TracerError};
use crate::memory::{self, MappedView, RemoteMemory, SHARED_MEMORY_SIZE};
use crate::record::TracedInstruction;
use crate::ring::Ring;
use crate::LIBRARY_VERSION;

/// Exported entry points the transport drives in the injected copy. Their
/// argument blocks are the `*Args` structs below; a non-zero thread exit
/// code means success.
const EXPORT_INIT: &str = "tracer_init_ex";
const EXPORT_ATTACH: &str = "tracer_attach_process_ex";
const EXPORT_START_TRACE: &str = "tracer_start_trace_ex";
const EXPORT_STOP_TRACE: &str = "tracer_stop_trace_ex";
const EXPORT_SHUTDOWN: &str = "tracer_shutdown_ex";

#[repr(C)]
struct InitArgs {
    size_of_struct: i32,
    version: i32,
    acquire_debug_privilege: i32,
}

#[repr(C)]
struct AttachArgs {
    size_of_struct: i32,
    process_id: i32,
    shared_memory_handle: u32,
}

#[repr(C)]
struct StartTraceArgs {
    size_of_struct: i32,
    address: u32,
    thread_id: i32,
    max_depth: i32,
    lifetime: i32,
}

#[repr(C)]
struct StopTraceArgs {
    size_of_struct: i32,
    address: u32,
    thread_id: i32,
}

#[repr(C)]
struct ShutdownArgs {
    size_of_struct: i32,
}

impl ShutdownArgs {
    fn new() -> Self {
        Self {
            size_of_struct: mem::size_of::<Self>() as i32,
        }
    }
}

fn as_bytes<T>(args: &T) -> &[u8] {
    unsafe { core::slice::from_raw_parts(args as *const T as *const u8, mem::size_of::<T>()) }
}

/// A process we attached to from the outside.
pub struct RemoteProcess {
    memory: RemoteMemory,
    ring: Ring<TracedInstruction>,
    _view: MappedView,
    _mapping: OwnedHandle,
}

impl RemoteProcess {
    /// Attaches to `pid`: shared mapping, injection, remote init + attach.
    pub fn attach(pid: u32) -> Result<Self> {
        let mut remote = RemoteMemory::open(pid)?;

        let mapping = memory::create_shared_mapping(SHARED_MEMORY_SIZE)?;
        let remote_mapping = duplicate_into(&remote, mapping.raw())?;

        let view = memory::map_view(mapping.raw(), SHARED_MEMORY_SIZE)?;
        let ring = unsafe { Ring::over_region(view.base(), SHARED_MEMORY_SIZE)? };

        remote.inject_library()?;

        let init = InitArgs {
            size_of_struct: mem::size_of::<InitArgs>() as i32,
            version: LIBRARY_VERSION,
            acquire_debug_privilege: 0,
        };
        if remote.call_local_export(EXPORT_INIT, as_bytes(&init))? == 0 {
            remote.eject_library();
            return Err(TracerError::RemoteInterop);
        }

        let attach = AttachArgs {
            size_of_struct: mem::size_of::<AttachArgs>() as i32,
            process_id: -1,
            shared_memory_handle: remote_mapping as u32,
        };
        if remote.call_local_export(EXPORT_ATTACH, as_bytes(&attach))? == 0 {
            // Attach failed over there; shut the injected copy down cleanly.
            let _ = remote.call_local_export(EXPORT_SHUTDOWN, as_bytes(&ShutdownArgs::new()));
            remote.eject_library();
            return Err(TracerError::RemoteInterop);
        }

        log::info!("Attached to remote process {}", pid);
        Ok(Self {
            memory: remote,
            ring,
            _view: view,
            _mapping: mapping,
        })
    }

    pub fn pid(&self) -> u32 {
        self.memory.pid()
    }

    pub(crate) fn memory(&self) -> &RemoteMemory {
        &self.memory
    }

    pub fn start_trace(
        &self,
        address: usize,
        thread_id: i32,
        max_depth: i32,
        lifetime: i32,
    ) -> Result<()> {
        let args = StartTraceArgs {
            size_of_struct: mem::size_of::<StartTraceArgs>() as i32,
            address: address as u32,
            thread_id,
            max_depth,
            lifetime,
        };

        if self.memory.call_local_export(EXPORT_START_TRACE, as_bytes(&args))? == 0 {
            return Err(TracerError::RemoteInterop);
        }
        Ok(())
    }

    pub fn stop_trace(&self, address: usize, thread_id: i32) -> Result<()> {
        let args = StopTraceArgs {
            size_of_struct: mem::size_of::<StopTraceArgs>() as i32,
            address: address as u32,
            thread_id,
        };

        if self.memory.call_local_export(EXPORT_STOP_TRACE, as_bytes(&args))? == 0 {
            return Err(TracerError::RemoteInterop);
        }
        Ok(())
    }

    /// Drains the consumer side of the shared ring.
    pub fn fetch_traces(&self, out: &mut [TracedInstruction]) -> usize {
        self.ring.pop_all(out)
    }
}

impl Drop for RemoteProcess {
    fn drop(&mut self) {
        let _ = self
            .memory
            .call_local_export(EXPORT_SHUTDOWN, as_bytes(&ShutdownArgs::new()));
        self.memory.eject_library();
    }
}

/// Duplicates a handle of ours into the remote process.
fn duplicate_into(remote: &RemoteMemory, handle: HANDLE) -> Result<usize> {
    let mut duplicated: HANDLE = ptr::null_mut();

    let ok = unsafe {
        DuplicateHandle(
            GetCurrentProcess(),
            handle,
            remote.process_handle().raw(),
            &mut duplicated,
            0,
            FALSE,
            DUPLICATE_SAME_ACCESS,
        )
    };
    if ok == 0 {
        return Err(TracerError::SystemCall);
    }
    Ok(duplicated as usize)
}
