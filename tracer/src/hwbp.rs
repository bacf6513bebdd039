//! Hardware breakpoint allocator.
//!
//! Sets and clears the four debug address registers on arbitrary threads of
//! the current process. The OS refuses context manipulation on the calling
//! thread, so self-targeting requests trampoline through a short-lived helper
//! thread that treats the original thread as foreign. Inside the exception
//! handler no suspension is needed at all: the faulting thread is already
//! stopped and its captured context can be edited in place.

use std::mem;

use winapi::shared::minwindef::FALSE;
use winapi::um::processthreadsapi::{
    GetCurrentProcessId, GetCurrentThreadId, GetThreadContext, OpenThread, ResumeThread,
    SetThreadContext, SuspendThread,
};
use winapi::um::tlhelp32::{
    CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use winapi::um::winnt::{
    CONTEXT, CONTEXT_DEBUG_REGISTERS, THREAD_GET_CONTEXT, THREAD_QUERY_INFORMATION,
    THREAD_SET_CONTEXT, THREAD_SUSPEND_RESUME,
};

use crate::bits;
use crate::core::OwnedHandle;
use crate::error::{Result, TracerError};

/// Number of debug address registers.
pub const SLOT_COUNT: u32 = 4;

/// Breakpoint trigger condition, encoded into the per-slot DR7 field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Condition {
    Execute = 0,
    Write = 1,
    Read = 2,
    ReadWrite = 3,
}

/// One armed debug slot on one thread.
#[derive(Debug, Clone, Copy)]
struct ThreadBreakpoint {
    index: u32,
    thread_id: u32,
}

/// Handle to an armed hardware breakpoint. A global breakpoint holds one
/// entry per thread it was replicated onto; removal clears every entry.
#[derive(Debug)]
pub struct HwBreakpoint {
    threads: Vec<ThreadBreakpoint>,
}

/// Maps a byte length onto the 2-bit DR7 length code.
fn encode_length(length: u32) -> Result<u32> {
    match length {
        1 => Ok(0),
        2 => Ok(1),
        4 => Ok(3),
        _ => Err(TracerError::InvalidArgument),
    }
}

fn dr_address(context: &CONTEXT, index: u32) -> u32 {
    match index {
        0 => context.Dr0,
        1 => context.Dr1,
        2 => context.Dr2,
        _ => context.Dr3,
    }
}

fn set_dr_address(context: &mut CONTEXT, index: u32, address: u32) {
    match index {
        0 => context.Dr0 = address,
        1 => context.Dr1 = address,
        2 => context.Dr2 = address,
        _ => context.Dr3 = address,
    }
}

/// Lowest slot whose address register is empty and whose enable bit is clear.
fn free_slot(context: &CONTEXT) -> Option<u32> {
    (0..SLOT_COUNT)
        .find(|&index| dr_address(context, index) == 0 && bits::get_bits(context.Dr7, index * 2, 1) == 0)
}

fn arm_slot(context: &mut CONTEXT, index: u32, address: usize, length_bits: u32, condition: Condition) {
    set_dr_address(context, index, address as u32);
    bits::set_bits(&mut context.Dr7, 16 + index * 4, 2, condition as u32);
    bits::set_bits(&mut context.Dr7, 18 + index * 4, 2, length_bits);
    bits::set_bits(&mut context.Dr7, index * 2, 1, 1);
}

fn disarm_slot(context: &mut CONTEXT, index: u32) {
    set_dr_address(context, index, 0);
    bits::set_bits(&mut context.Dr7, index * 2, 1, 0);
}

fn open_thread(thread_id: u32) -> Option<OwnedHandle> {
    let access = THREAD_GET_CONTEXT
        | THREAD_SET_CONTEXT
        | THREAD_QUERY_INFORMATION
        | THREAD_SUSPEND_RESUME;

    OwnedHandle::new(unsafe { OpenThread(access, FALSE, thread_id) })
}

/// Arms a breakpoint on a thread other than the calling one.
fn set_on_foreign_thread(
    address: usize,
    length: u32,
    thread_id: u32,
    condition: Condition,
) -> Result<ThreadBreakpoint> {
    if address == 0 || thread_id == unsafe { GetCurrentThreadId() } {
        return Err(TracerError::InvalidArgument);
    }
    let length_bits = encode_length(length)?;

    let thread = open_thread(thread_id).ok_or(TracerError::SystemCall)?;
    let suspended = unsafe { SuspendThread(thread.raw()) } != u32::MAX;

    let result = (|| {
        let mut context: CONTEXT = unsafe { mem::zeroed() };
        context.ContextFlags = CONTEXT_DEBUG_REGISTERS;

        if unsafe { GetThreadContext(thread.raw(), &mut context) } == 0 {
            return Err(TracerError::SystemCall);
        }

        let index = free_slot(&context).ok_or(TracerError::OutOfResources)?;
        arm_slot(&mut context, index, address, length_bits, condition);

        if unsafe { SetThreadContext(thread.raw(), &context) } == 0 {
            return Err(TracerError::SystemCall);
        }

        log::trace!(
            "Armed debug slot {} on thread {} at {:#x}",
            index,
            thread_id,
            address
        );
        Ok(ThreadBreakpoint { index, thread_id })
    })();

    if suspended {
        unsafe { ResumeThread(thread.raw()) };
    }
    result
}

/// Clears a breakpoint on a thread other than the calling one. A thread that
/// has already exited counts as success.
fn remove_on_foreign_thread(breakpoint: ThreadBreakpoint) -> Result<()> {
    if breakpoint.thread_id == unsafe { GetCurrentThreadId() } {
        return Err(TracerError::InvalidArgument);
    }

    let thread = match open_thread(breakpoint.thread_id) {
        Some(thread) => thread,
        None => return Ok(()),
    };
    let suspended = unsafe { SuspendThread(thread.raw()) } != u32::MAX;

    let result = (|| {
        let mut context: CONTEXT = unsafe { mem::zeroed() };
        context.ContextFlags = CONTEXT_DEBUG_REGISTERS;

        if unsafe { GetThreadContext(thread.raw(), &mut context) } == 0 {
            return Err(TracerError::SystemCall);
        }

        disarm_slot(&mut context, breakpoint.index);

        if unsafe { SetThreadContext(thread.raw(), &context) } == 0 {
            return Err(TracerError::SystemCall);
        }
        Ok(())
    })();

    if suspended {
        unsafe { ResumeThread(thread.raw()) };
    }
    result
}

/// Runs `operation` on a helper thread so the calling thread becomes foreign
/// and its context can be manipulated through the OS APIs.
fn on_helper_thread<T, F>(operation: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    std::thread::Builder::new()
        .spawn(operation)
        .map_err(|_| TracerError::SystemCall)?
        .join()
        .map_err(|_| TracerError::WaitIncomplete)?
}

impl HwBreakpoint {
    /// Arms an execute/data breakpoint on one thread. `thread_id <= 0` means
    /// the calling thread (which is served through the helper-thread
    /// trampoline).
    pub fn set_on_thread(
        address: usize,
        length: u32,
        thread_id: i32,
        condition: Condition,
    ) -> Result<Self> {
        if address == 0 {
            return Err(TracerError::InvalidArgument);
        }

        let current = unsafe { GetCurrentThreadId() };
        let thread_id = if thread_id <= 0 { current } else { thread_id as u32 };

        let breakpoint = if thread_id == current {
            on_helper_thread(move || set_on_foreign_thread(address, length, thread_id, condition))?
        } else {
            set_on_foreign_thread(address, length, thread_id, condition)?
        };

        Ok(Self {
            threads: vec![breakpoint],
        })
    }

    /// Arms the breakpoint on every thread of the current process. Threads
    /// that cannot be armed (exited, out of slots) are skipped; failure is
    /// reported only when no thread could be armed at all.
    pub fn set_global(address: usize, length: u32, condition: Condition) -> Result<Self> {
        if address == 0 {
            return Err(TracerError::InvalidArgument);
        }

        let process_id = unsafe { GetCurrentProcessId() };
        let snapshot = OwnedHandle::new(unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) })
            .ok_or(TracerError::SystemCall)?;

        let mut entry: THREADENTRY32 = unsafe { mem::zeroed() };
        entry.dwSize = mem::size_of::<THREADENTRY32>() as u32;

        let mut threads = Vec::new();
        let mut last_error = TracerError::OutOfResources;

        if unsafe { Thread32First(snapshot.raw(), &mut entry) } != 0 {
            loop {
                if entry.th32OwnerProcessID == process_id {
                    match Self::set_on_thread(address, length, entry.th32ThreadID as i32, condition)
                    {
                        Ok(mut armed) => threads.append(&mut armed.threads),
                        Err(error) => {
                            log::debug!(
                                "Skipping thread {} while arming {:#x}: {}",
                                entry.th32ThreadID,
                                address,
                                error
                            );
                            last_error = error;
                        }
                    }
                }
                if unsafe { Thread32Next(snapshot.raw(), &mut entry) } == 0 {
                    break;
                }
            }
        }

        if threads.is_empty() {
            return Err(last_error);
        }
        Ok(Self { threads })
    }

    /// Removes the breakpoint from every thread it was armed on.
    pub fn remove(self) -> Result<()> {
        let current = unsafe { GetCurrentThreadId() };
        let mut result = Ok(());

        for breakpoint in self.threads {
            let removed = if breakpoint.thread_id == current {
                on_helper_thread(move || remove_on_foreign_thread(breakpoint))
            } else {
                remove_on_foreign_thread(breakpoint)
            };

            if let Err(error) = removed {
                log::warn!(
                    "Failed to clear debug slot {} on thread {}: {}",
                    breakpoint.index,
                    breakpoint.thread_id,
                    error
                );
                result = result.and(Err(error));
            }
        }
        result
    }

    /// Removes the breakpoint while inside the exception handler: the calling
    /// thread's slot is cleared directly in the captured context (the thread
    /// is already stopped there), foreign threads take the usual path.
    pub(crate) fn remove_on_context(self, context: &mut CONTEXT) -> Result<()> {
        let current = unsafe { GetCurrentThreadId() };
        let mut result = Ok(());

        for breakpoint in self.threads {
            if breakpoint.thread_id == current {
                disarm_slot(context, breakpoint.index);
            } else if let Err(error) = remove_on_foreign_thread(breakpoint) {
                result = result.and(Err(error));
            }
        }
        result
    }
}

/// Clears one slot directly in a captured thread context: address register
/// and enable bit both, so the slot scans as free again.
pub(crate) fn clear_slot(context: &mut CONTEXT, index: u32) {
    disarm_slot(context, index);
}

/// Arms a one-shot breakpoint directly in a captured thread context and
/// returns the chosen slot. Used by the handler for the suspension resume
/// point; the armed slot is cleared again by the handler, so no handle is
/// created.
pub(crate) fn set_on_context(
    address: usize,
    length: u32,
    context: &mut CONTEXT,
    condition: Condition,
) -> Result<u32> {
    if address == 0 {
        return Err(TracerError::InvalidArgument);
    }
    let length_bits = encode_length(length)?;

    let index = free_slot(context).ok_or(TracerError::OutOfResources)?;
    arm_slot(context, index, address, length_bits, condition);
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_encoding() {
        assert_eq!(encode_length(1).unwrap(), 0);
        assert_eq!(encode_length(2).unwrap(), 1);
        assert_eq!(encode_length(4).unwrap(), 3);

        for invalid in [0, 3, 8, 16] {
            assert_eq!(encode_length(invalid).unwrap_err(), TracerError::InvalidArgument);
        }
    }

    #[test]
    fn test_free_slot_scan_checks_address_and_enable_bit() {
        let mut context: CONTEXT = unsafe { mem::zeroed() };
        assert_eq!(free_slot(&context), Some(0));

        // A leftover address with a cleared enable bit still blocks the slot.
        context.Dr0 = 0x1000;
        assert_eq!(free_slot(&context), Some(1));

        // An armed slot with an empty address register blocks as well.
        bits::set_bits(&mut context.Dr7, 1 * 2, 1, 1);
        assert_eq!(free_slot(&context), Some(2));

        context.Dr2 = 0x2000;
        context.Dr3 = 0x3000;
        assert_eq!(free_slot(&context), None);
    }

    #[test]
    fn test_arm_and_disarm_slot() {
        let mut context: CONTEXT = unsafe { mem::zeroed() };

        arm_slot(&mut context, 1, 0x40_1000, 0, Condition::Execute);
        assert_eq!(context.Dr1, 0x40_1000);
        assert_eq!(bits::get_bits(context.Dr7, 2, 1), 1);
        assert_eq!(bits::get_bits(context.Dr7, 16 + 4, 2), 0);
        assert_eq!(bits::get_bits(context.Dr7, 18 + 4, 2), 0);

        disarm_slot(&mut context, 1);
        assert_eq!(context.Dr1, 0);
        assert_eq!(context.Dr7, 0);
        assert_eq!(free_slot(&context), Some(0));
    }

    #[test]
    fn test_set_on_context_uses_lowest_free_slot() {
        let mut context: CONTEXT = unsafe { mem::zeroed() };
        context.Dr0 = 0x1000;

        let index = set_on_context(0x40_2000, 1, &mut context, Condition::Execute).unwrap();
        assert_eq!(index, 1);
        assert_eq!(context.Dr1, 0x40_2000);

        assert_eq!(
            set_on_context(0x40_2000, 3, &mut context, Condition::Execute).unwrap_err(),
            TracerError::InvalidArgument
        );
    }

    #[test]
    fn test_round_trip_on_own_thread() {
        // The self-targeting path has to trampoline through a helper thread.
        let target = test_round_trip_on_own_thread as *const () as usize;

        let breakpoint = HwBreakpoint::set_on_thread(target, 1, -1, Condition::Execute).unwrap();
        breakpoint.remove().unwrap();

        // After removal the slot must be reusable.
        let breakpoint = HwBreakpoint::set_on_thread(target, 1, -1, Condition::Execute).unwrap();
        breakpoint.remove().unwrap();
    }
}
