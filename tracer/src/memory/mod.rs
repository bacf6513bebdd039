//! Memory access to the traced process, local or remote.
//!
//! The controller needs a uniform way to read instruction bytes (and, for the
//! remote case, to move argument blocks and the loader payload around), no
//! matter which side of the process boundary it sits on.

use std::ptr;

use winapi::um::handleapi::INVALID_HANDLE_VALUE;
use winapi::um::memoryapi::{CreateFileMappingW, MapViewOfFile, UnmapViewOfFile, FILE_MAP_ALL_ACCESS};
use winapi::um::winnt::{HANDLE, PAGE_READWRITE};

use crate::core::OwnedHandle;
use crate::error::{Result, TracerError};

pub mod local;
pub mod remote;

pub use local::LocalMemory;
pub use remote::RemoteMemory;

/// Size of the shared trace mapping: ring header plus record slots.
pub const SHARED_MEMORY_SIZE: usize = 16 * 1024 * 1024;

/// Address space of the traced process, borrowed from its context.
pub enum MemorySource<'a> {
    Local(&'a LocalMemory),
    Remote(&'a RemoteMemory),
}

impl MemorySource<'_> {
    /// Copies `buffer.len()` bytes out of the traced process.
    pub fn read(&self, address: usize, buffer: &mut [u8]) -> Result<usize> {
        match self {
            Self::Local(memory) => memory.read(address, buffer),
            Self::Remote(memory) => memory.read(address, buffer),
        }
    }

    /// Copies `data` into the traced process.
    pub fn write(&self, address: usize, data: &[u8]) -> Result<usize> {
        match self {
            Self::Local(memory) => memory.write(address, data),
            Self::Remote(memory) => memory.write(address, data),
        }
    }

    /// Base address of a module loaded in the traced process; `None` names
    /// this library itself.
    pub fn find_module(&self, name: Option<&str>) -> Result<usize> {
        match self {
            Self::Local(memory) => memory.find_module(name),
            Self::Remote(memory) => memory.find_module(name),
        }
    }
}

/// A mapped view of a file mapping object, unmapped on drop.
pub(crate) struct MappedView {
    base: *mut u8,
}

unsafe impl Send for MappedView {}
unsafe impl Sync for MappedView {}

impl MappedView {
    pub(crate) fn base(&self) -> *mut u8 {
        self.base
    }
}

impl Drop for MappedView {
    fn drop(&mut self) {
        unsafe { UnmapViewOfFile(self.base as *mut _) };
    }
}

/// Creates an anonymous pagefile-backed mapping of `size` bytes.
pub(crate) fn create_shared_mapping(size: usize) -> Result<OwnedHandle> {
    let handle = unsafe {
        CreateFileMappingW(
            INVALID_HANDLE_VALUE,
            ptr::null_mut(),
            PAGE_READWRITE,
            0,
            size as u32,
            ptr::null(),
        )
    };
    OwnedHandle::new(handle).ok_or(TracerError::SystemCall)
}

/// Maps `size` bytes of a file mapping object into this process.
pub(crate) fn map_view(mapping: HANDLE, size: usize) -> Result<MappedView> {
    let base = unsafe { MapViewOfFile(mapping, FILE_MAP_ALL_ACCESS, 0, 0, size) };
    if base.is_null() {
        return Err(TracerError::SystemCall);
    }
    Ok(MappedView {
        base: base as *mut u8,
    })
}
