//! Access to our own address space.

use std::ptr;

use winapi::shared::minwindef::{HMODULE, MAX_PATH};
use winapi::um::libloaderapi::{
    GetModuleFileNameW, GetModuleHandleExW, GetModuleHandleW,
    GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS, GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
};

use crate::core::wide;
use crate::error::{Result, TracerError};

/// The local process: reads and writes are plain address-space copies.
pub struct LocalMemory {
    module: usize,
}

impl LocalMemory {
    pub fn new() -> Self {
        Self {
            module: own_module_handle(),
        }
    }

    /// Callers pass addresses obtained from the running process itself; a
    /// wild address faults here just like it would in the traced code.
    pub fn read(&self, address: usize, buffer: &mut [u8]) -> Result<usize> {
        if address == 0 {
            return Err(TracerError::InvalidArgument);
        }
        unsafe { ptr::copy_nonoverlapping(address as *const u8, buffer.as_mut_ptr(), buffer.len()) };
        Ok(buffer.len())
    }

    pub fn write(&self, address: usize, data: &[u8]) -> Result<usize> {
        if address == 0 {
            return Err(TracerError::InvalidArgument);
        }
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), address as *mut u8, data.len()) };
        Ok(data.len())
    }

    /// Base address of a loaded module; `None` means this library itself.
    pub fn find_module(&self, name: Option<&str>) -> Result<usize> {
        match name {
            None => Ok(self.module),
            Some(name) => {
                let name = wide(name);
                let module = unsafe { GetModuleHandleW(name.as_ptr()) };
                if module.is_null() {
                    Err(TracerError::SystemCall)
                } else {
                    Ok(module as usize)
                }
            }
        }
    }
}

/// Handle of the module this code lives in (the tracer DLL, or the host
/// executable when statically linked).
pub(crate) fn own_module_handle() -> usize {
    let mut module: HMODULE = ptr::null_mut();
    let flags =
        GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT;

    unsafe {
        GetModuleHandleExW(flags, own_module_handle as *const u16, &mut module);
    }
    module as usize
}

/// Full path of our own module, NUL-terminated UTF-16, ready to be handed to
/// a remote `LoadLibraryW` call.
pub(crate) fn own_module_path() -> Result<Vec<u16>> {
    let mut path = vec![0u16; MAX_PATH];
    let len = unsafe {
        GetModuleFileNameW(
            own_module_handle() as HMODULE,
            path.as_mut_ptr(),
            path.len() as u32,
        )
    };
    if len == 0 {
        return Err(TracerError::SystemCall);
    }

    path.truncate(len as usize + 1);
    Ok(path)
}
