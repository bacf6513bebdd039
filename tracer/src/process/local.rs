//! The local process context: the trace engine runs in this very process.

use std::sync::Arc;

use winapi::um::winnt::HANDLE;

use crate::core::OwnedHandle;
use crate::error::{Result, TracerError};
use crate::memory::{self, LocalMemory, MappedView, SHARED_MEMORY_SIZE};
use crate::record::TracedInstruction;
use crate::ring::Ring;
use crate::trace::TraceContext;

/// The one process context whose engine runs in-process. The exception
/// handler finds it through [`local_process`]; there can only be one.
pub struct LocalProcess {
    pid: u32,
    memory: LocalMemory,
    trace: TraceContext,
    ring: Arc<Ring<TracedInstruction>>,
    /// Keep the mapped view (and the mapping handle we were given) alive as
    /// long as the ring lives over it.
    _view: Option<MappedView>,
    _mapping: Option<OwnedHandle>,
}

static LOCAL_PROCESS: spin::RwLock<Option<Arc<LocalProcess>>> = spin::RwLock::new(None);

/// The published local context, if any. Called from the exception handler,
/// hence the spin lock.
pub(crate) fn local_process() -> Option<Arc<LocalProcess>> {
    LOCAL_PROCESS.read().clone()
}

/// Unpublishes the local context on detach.
pub(crate) fn clear_local_process(process: &Arc<LocalProcess>) {
    let mut slot = LOCAL_PROCESS.write();
    if let Some(published) = slot.as_ref() {
        if Arc::ptr_eq(published, process) {
            *slot = None;
        }
    }
}

impl LocalProcess {
    /// Attaches to the current process. With a shared-memory handle the ring
    /// is laid over its mapped view so a peer process can drain it; without
    /// one the ring lives on the private heap.
    pub fn attach(shared_memory_handle: Option<HANDLE>) -> Result<Arc<Self>> {
        if LOCAL_PROCESS.read().is_some() {
            return Err(TracerError::InvalidProcess);
        }

        let (ring, view, mapping) = match shared_memory_handle {
            Some(handle) => {
                let mapping = OwnedHandle::new(handle).ok_or(TracerError::InvalidHandle)?;
                let view = memory::map_view(mapping.raw(), SHARED_MEMORY_SIZE)?;
                let ring = unsafe { Ring::over_region(view.base(), SHARED_MEMORY_SIZE)? };
                (ring, Some(view), Some(mapping))
            }
            None => (Ring::alloc(SHARED_MEMORY_SIZE)?, None, None),
        };

        let ring = Arc::new(ring);
        let process = Arc::new(Self {
            pid: crate::core::current_pid(),
            memory: LocalMemory::new(),
            trace: TraceContext::new(ring.clone())?,
            ring,
            _view: view,
            _mapping: mapping,
        });

        *LOCAL_PROCESS.write() = Some(process.clone());
        log::info!("Attached to local process {}", process.pid);
        Ok(process)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn memory(&self) -> &LocalMemory {
        &self.memory
    }

    pub(crate) fn trace_context(&self) -> &TraceContext {
        &self.trace
    }

    pub fn start_trace(
        &self,
        address: usize,
        thread_id: i32,
        max_depth: i32,
        lifetime: i32,
    ) -> Result<()> {
        self.trace.start_trace(address, thread_id, max_depth, lifetime)
    }

    pub fn stop_trace(&self, address: usize, thread_id: i32) -> Result<()> {
        self.trace.stop_trace(address, thread_id).map(|_| ())
    }

    pub fn fetch_traces(&self, out: &mut [TracedInstruction]) -> usize {
        self.ring.pop_all(out)
    }
}
