//! The trace engine: the registry of armed traces and the controller that
//! arms and revokes them. The companion [`handler`] module reacts to the
//! debug exceptions the armed breakpoints produce.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use winapi::ctypes::c_void;
use winapi::um::errhandlingapi::{AddVectoredExceptionHandler, RemoveVectoredExceptionHandler};
use winapi::um::processthreadsapi::GetCurrentProcessId;
use winapi::um::tlhelp32::{
    CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, MODULEENTRY32W, TH32CS_SNAPMODULE,
};
use winapi::um::winnt::{CONTEXT, IMAGE_DOS_HEADER, IMAGE_NT_HEADERS32};

use crate::core::OwnedHandle;
use crate::error::{Result, TracerError};
use crate::hwbp::{Condition, HwBreakpoint};
use crate::record::TracedInstruction;
use crate::ring::Ring;

pub mod handler;

/// A registered tracing intent: an armed entry breakpoint plus the limits
/// that govern the trace once it fires.
pub struct ActiveTrace {
    entry: usize,
    thread_id: i32,
    base_of_code: usize,
    size_of_code: usize,
    max_depth: i32,
    /// Remaining completed invocations, −1 for unlimited. Only ever updated
    /// under the registry lock.
    lifetime: AtomicI32,
}

impl ActiveTrace {
    pub fn entry(&self) -> usize {
        self.entry
    }

    /// Whether this trace applies to `address` when hit by `thread_id`.
    fn matches(&self, address: usize, thread_id: u32) -> bool {
        self.entry == address && (self.thread_id == -1 || self.thread_id == thread_id as i32)
    }

    /// Whether `address` lies in the code section of the traced module.
    pub(crate) fn contains_code_address(&self, address: usize) -> bool {
        address >= self.base_of_code && address < self.base_of_code + self.size_of_code
    }

    /// Whether the depth cap cuts off tracing at `depth`. A cap of 0 (or −1)
    /// means unlimited.
    pub(crate) fn depth_capped(&self, depth: i32) -> bool {
        self.max_depth > 0 && depth >= self.max_depth
    }
}

struct TraceEntry {
    trace: Arc<ActiveTrace>,
    breakpoint: HwBreakpoint,
}

/// Registration of the vectored handler, removed exactly once.
struct VehGuard {
    handle: *mut c_void,
}

unsafe impl Send for VehGuard {}
unsafe impl Sync for VehGuard {}

impl VehGuard {
    fn register() -> Result<Self> {
        // First in the chain: debug exceptions from the armed breakpoints
        // must not reach other handlers before us.
        let handle = unsafe { AddVectoredExceptionHandler(1, Some(handler::vectored_handler)) };
        if handle.is_null() {
            return Err(TracerError::SystemCall);
        }
        Ok(Self { handle })
    }

    fn unregister(&mut self) {
        if !self.handle.is_null() {
            unsafe { RemoveVectoredExceptionHandler(self.handle) };
            self.handle = ptr::null_mut();
        }
    }
}

impl Drop for VehGuard {
    fn drop(&mut self) {
        self.unregister();
    }
}

/// The per-process trace engine: armed traces, the slot for the trace that
/// currently drives the handler, and the ring the records go into.
pub struct TraceContext {
    /// Armed traces. The controller mutates the list while the handler looks
    /// traces up, hence the spin lock (no OS calls from handler context).
    traces: spin::Mutex<Vec<TraceEntry>>,
    /// The single trace currently driving a thread. Steady-state stepping
    /// only takes the read side.
    current: spin::RwLock<Option<Arc<ActiveTrace>>>,
    ring: Arc<Ring<TracedInstruction>>,
    veh: VehGuard,
}

impl TraceContext {
    pub fn new(ring: Arc<Ring<TracedInstruction>>) -> Result<Self> {
        Ok(Self {
            traces: spin::Mutex::new(Vec::new()),
            current: spin::RwLock::new(None),
            ring,
            veh: VehGuard::register()?,
        })
    }

    pub(crate) fn ring(&self) -> &Ring<TracedInstruction> {
        &self.ring
    }

    /// Arms a trace on the entry of the function at `address`.
    pub fn start_trace(
        &self,
        address: usize,
        thread_id: i32,
        max_depth: i32,
        lifetime: i32,
    ) -> Result<()> {
        let (base_of_code, size_of_code) =
            find_module_code_bounds(address).ok_or(TracerError::SystemCall)?;

        let breakpoint = if thread_id >= 0 {
            HwBreakpoint::set_on_thread(address, 1, thread_id, Condition::Execute)?
        } else {
            HwBreakpoint::set_global(address, 1, Condition::Execute)?
        };

        let trace = Arc::new(ActiveTrace {
            entry: address,
            thread_id,
            base_of_code,
            size_of_code,
            max_depth,
            lifetime: AtomicI32::new(lifetime),
        });

        self.traces.lock().push(TraceEntry { trace, breakpoint });

        log::info!(
            "Tracing {:#x} (thread filter {}, max depth {}, lifetime {})",
            address,
            thread_id,
            max_depth,
            lifetime
        );
        Ok(())
    }

    /// Revokes every trace registered for `address` under the same thread
    /// filter. Returns the number of matches; zero matches is a no-op
    /// success.
    pub fn stop_trace(&self, address: usize, thread_id: i32) -> Result<usize> {
        let mut entries = self.traces.lock();
        let mut removed = 0;

        let mut index = 0;
        while index < entries.len() {
            if entries[index].trace.entry == address && entries[index].trace.thread_id == thread_id
            {
                let entry = entries.remove(index);

                let mut current = self.current.write();
                if let Some(active) = current.as_ref() {
                    if Arc::ptr_eq(active, &entry.trace) {
                        *current = None;
                    }
                }
                drop(current);

                if let Err(error) = entry.breakpoint.remove() {
                    log::warn!("Failed to remove breakpoint at {:#x}: {}", address, error);
                }
                removed += 1;
            } else {
                index += 1;
            }
        }

        if removed > 0 {
            log::info!("Stopped {} trace(s) at {:#x}", removed, address);
        }
        Ok(removed)
    }

    /// Looks up the armed trace matching `address` for the calling thread.
    pub(crate) fn find_trace(&self, address: usize, thread_id: u32) -> Option<Arc<ActiveTrace>> {
        self.traces
            .lock()
            .iter()
            .map(|entry| &entry.trace)
            .find(|trace| trace.matches(address, thread_id))
            .cloned()
    }

    /// Installs `trace` as the driving trace unless another thread already
    /// owns the slot.
    pub(crate) fn try_install_current(&self, trace: Arc<ActiveTrace>) -> bool {
        let mut current = self.current.write();
        if current.is_some() {
            return false;
        }
        *current = Some(trace);
        true
    }

    pub(crate) fn current_trace(&self) -> Option<Arc<ActiveTrace>> {
        self.current.read().clone()
    }

    /// Ends the driving trace: clears the current slot and, for a trace with
    /// a finite lifetime, counts down one completed invocation. At zero the
    /// trace is unregistered on the spot, clearing this thread's slot
    /// directly in the captured context.
    pub(crate) fn on_trace_finished(&self, context: &mut CONTEXT) {
        let mut entries = self.traces.lock();
        let mut current = self.current.write();

        if let Some(active) = current.take() {
            let lifetime = active.lifetime.load(Ordering::Relaxed);
            if lifetime > 0 {
                let remaining = lifetime - 1;
                active.lifetime.store(remaining, Ordering::Relaxed);

                if remaining == 0 {
                    if let Some(position) = entries
                        .iter()
                        .position(|entry| Arc::ptr_eq(&entry.trace, &active))
                    {
                        let entry = entries.remove(position);
                        let _ = entry.breakpoint.remove_on_context(context);
                        log::debug!("Trace at {:#x} expired", active.entry);
                    }
                }
            }
        }
    }
}

impl Drop for TraceContext {
    fn drop(&mut self) {
        // Unregister the handler before tearing down what it works on.
        self.veh.unregister();

        let entries = mem::take(&mut *self.traces.lock());
        for entry in entries {
            let _ = entry.breakpoint.remove();
        }
        *self.current.write() = None;
    }
}

/// Resolves the code section bounds of the module containing `address` by
/// walking the loaded-module snapshot and the PE headers of each candidate.
fn find_module_code_bounds(address: usize) -> Option<(usize, usize)> {
    let process_id = unsafe { GetCurrentProcessId() };
    let snapshot =
        OwnedHandle::new(unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPMODULE, process_id) })?;

    let mut entry: MODULEENTRY32W = unsafe { mem::zeroed() };
    entry.dwSize = mem::size_of::<MODULEENTRY32W>() as u32;

    if unsafe { Module32FirstW(snapshot.raw(), &mut entry) } == 0 {
        return None;
    }

    loop {
        if entry.th32ProcessID == process_id {
            let module = if entry.hModule.is_null() {
                entry.modBaseAddr as usize
            } else {
                entry.hModule as usize
            };

            if module != 0 {
                let (base_of_code, size_of_code) = unsafe {
                    let dos = &*(module as *const IMAGE_DOS_HEADER);
                    let nt = &*((module + dos.e_lfanew as usize) as *const IMAGE_NT_HEADERS32);
                    (
                        module + nt.OptionalHeader.BaseOfCode as usize,
                        nt.OptionalHeader.SizeOfCode as usize,
                    )
                };

                if address >= base_of_code && address < base_of_code + size_of_code {
                    return Some((base_of_code, size_of_code));
                }
            }
        }

        if unsafe { Module32NextW(snapshot.raw(), &mut entry) } == 0 {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_trace(entry: usize, thread_id: i32, max_depth: i32) -> ActiveTrace {
        ActiveTrace {
            entry,
            thread_id,
            base_of_code: 0x40_0000,
            size_of_code: 0x1000,
            max_depth,
            lifetime: AtomicI32::new(-1),
        }
    }

    #[test]
    fn test_thread_filter_matching() {
        let any = stub_trace(0x40_1000, -1, -1);
        assert!(any.matches(0x40_1000, 1234));
        assert!(!any.matches(0x40_1004, 1234));

        let filtered = stub_trace(0x40_1000, 1234, -1);
        assert!(filtered.matches(0x40_1000, 1234));
        assert!(!filtered.matches(0x40_1000, 5678));
    }

    #[test]
    fn test_module_bounds_check() {
        let trace = stub_trace(0x40_0100, -1, -1);
        assert!(trace.contains_code_address(0x40_0000));
        assert!(trace.contains_code_address(0x40_0fff));
        assert!(!trace.contains_code_address(0x40_1000));
        assert!(!trace.contains_code_address(0x3f_ffff));
    }

    #[test]
    fn test_depth_cap_of_zero_is_unlimited() {
        assert!(!stub_trace(0, -1, 0).depth_capped(1000));
        assert!(!stub_trace(0, -1, -1).depth_capped(1000));

        let capped = stub_trace(0, -1, 2);
        assert!(!capped.depth_capped(1));
        assert!(capped.depth_capped(2));
        assert!(capped.depth_capped(3));
    }

    #[test]
    fn test_own_module_is_resolvable() {
        let address = test_own_module_is_resolvable as *const () as usize;
        let (base, size) = find_module_code_bounds(address).unwrap();
        assert!(address >= base && address < base + size);

        // The stack lives outside any module's code section.
        let local = 0u8;
        assert_eq!(find_module_code_bounds(&local as *const u8 as usize), None);
    }
}
