//! Process-wide plumbing: the table of attached process contexts, the
//! thread-local current context, and privilege acquisition.

use std::cell::RefCell;
use std::collections::HashMap;
use std::mem;
use std::ptr;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use winapi::shared::minwindef::FALSE;
use winapi::shared::winerror::ERROR_SUCCESS;
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::processthreadsapi::{GetCurrentProcess, OpenProcessToken};
use winapi::um::securitybaseapi::AdjustTokenPrivileges;
use winapi::um::winbase::LookupPrivilegeValueW;
use winapi::um::winnt::{
    HANDLE, LUID_AND_ATTRIBUTES, SE_PRIVILEGE_ENABLED, TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES,
};

use crate::error::{Result, TracerError};
use crate::process::ProcessContext;

/// Owning wrapper around a raw Win32 handle.
pub(crate) struct OwnedHandle(HANDLE);

// Win32 handles are process-global tokens, not thread-affine pointers.
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl OwnedHandle {
    /// Takes ownership of `handle`; `None` for null or invalid handles.
    pub(crate) fn new(handle: HANDLE) -> Option<Self> {
        if handle.is_null() || handle == INVALID_HANDLE_VALUE {
            None
        } else {
            Some(Self(handle))
        }
    }

    pub(crate) fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.0) };
    }
}

/// NUL-terminated UTF-16 conversion for the wide-string Win32 surface.
pub(crate) fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(core::iter::once(0)).collect()
}

/// Enables or disables a named privilege on the current process token.
pub(crate) fn set_privilege(privilege: &str, enable: bool) -> Result<()> {
    let name = wide(privilege);

    let mut luid = unsafe { mem::zeroed() };
    if unsafe { LookupPrivilegeValueW(ptr::null(), name.as_ptr(), &mut luid) } == 0 {
        return Err(TracerError::SystemCall);
    }

    let mut token: HANDLE = ptr::null_mut();
    if unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_ADJUST_PRIVILEGES, &mut token) } == 0 {
        return Err(TracerError::SystemCall);
    }
    let token = OwnedHandle::new(token).ok_or(TracerError::SystemCall)?;

    let mut privileges = TOKEN_PRIVILEGES {
        PrivilegeCount: 1,
        Privileges: [LUID_AND_ATTRIBUTES {
            Luid: luid,
            Attributes: if enable { SE_PRIVILEGE_ENABLED } else { 0 },
        }],
    };

    let adjusted = unsafe {
        AdjustTokenPrivileges(
            token.raw(),
            FALSE,
            &mut privileges,
            0,
            ptr::null_mut(),
            ptr::null_mut(),
        )
    };

    // AdjustTokenPrivileges succeeds even when it assigned nothing; the real
    // outcome is in the last-error value.
    if adjusted != 0 && unsafe { GetLastError() } == ERROR_SUCCESS {
        Ok(())
    } else {
        Err(TracerError::InsufficientPermission)
    }
}

static CONTEXTS: Lazy<Mutex<HashMap<u32, Arc<ProcessContext>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

thread_local! {
    static CURRENT_CONTEXT: RefCell<Option<Arc<ProcessContext>>> = RefCell::new(None);
}

pub(crate) fn context_for_pid(pid: u32) -> Option<Arc<ProcessContext>> {
    CONTEXTS.lock().unwrap().get(&pid).cloned()
}

pub(crate) fn insert_context(pid: u32, context: Arc<ProcessContext>) {
    CONTEXTS.lock().unwrap().insert(pid, context);
}

pub(crate) fn remove_context(pid: u32) -> Option<Arc<ProcessContext>> {
    CONTEXTS.lock().unwrap().remove(&pid)
}

pub(crate) fn drain_contexts() -> Vec<Arc<ProcessContext>> {
    CONTEXTS.lock().unwrap().drain().map(|(_, ctx)| ctx).collect()
}

pub(crate) fn all_contexts() -> Vec<Arc<ProcessContext>> {
    CONTEXTS.lock().unwrap().values().cloned().collect()
}

/// Sets the current process context for the calling thread. `None` makes the
/// trace operations broadcast across all attached contexts.
pub(crate) fn set_current_context(context: Option<Arc<ProcessContext>>) {
    CURRENT_CONTEXT.with(|slot| *slot.borrow_mut() = context);
}

pub(crate) fn current_context() -> Option<Arc<ProcessContext>> {
    CURRENT_CONTEXT.with(|slot| slot.borrow().clone())
}

/// Clears the calling thread's current context if it points at `context`.
pub(crate) fn clear_current_context_if(context: &Arc<ProcessContext>) {
    CURRENT_CONTEXT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some(current) = slot.as_ref() {
            if Arc::ptr_eq(current, context) {
                *slot = None;
            }
        }
    });
}

pub(crate) fn current_pid() -> u32 {
    unsafe { winapi::um::processthreadsapi::GetCurrentProcessId() }
}
