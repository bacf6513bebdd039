//! Access to a remote process, including the call transport used by the
//! injection contract: argument blocks travel through remotely allocated
//! pages, and entry points are driven by remote threads whose exit code
//! carries the result back.

use std::mem;
use std::ptr;

use winapi::shared::minwindef::{DWORD, FALSE, HMODULE};
use winapi::um::libloaderapi::{GetModuleHandleW, GetProcAddress};
use winapi::um::memoryapi::{ReadProcessMemory, VirtualAllocEx, VirtualFreeEx, WriteProcessMemory};
use winapi::um::processthreadsapi::{CreateRemoteThread, GetExitCodeThread, OpenProcess};
use winapi::um::synchapi::WaitForSingleObject;
use winapi::um::tlhelp32::{
    CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, MODULEENTRY32W, TH32CS_SNAPMODULE,
};
use winapi::um::winbase::{INFINITE, WAIT_OBJECT_0};
use winapi::um::winnt::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE, PROCESS_CREATE_THREAD,
    PROCESS_QUERY_INFORMATION, PROCESS_VM_OPERATION, PROCESS_VM_READ, PROCESS_VM_WRITE,
};

use crate::core::{wide, OwnedHandle};
use crate::error::{Result, TracerError};
use crate::memory::local;

/// A remote process opened with the rights the transport needs.
pub struct RemoteMemory {
    pid: u32,
    process: OwnedHandle,
    /// Handle of our library inside the remote process, once injected.
    module: usize,
}

impl RemoteMemory {
    /// Opens the target process. Fails with `InsufficientPermission` when the
    /// required access rights cannot be obtained.
    pub fn open(pid: u32) -> Result<Self> {
        let access = PROCESS_VM_OPERATION
            | PROCESS_VM_READ
            | PROCESS_VM_WRITE
            | PROCESS_QUERY_INFORMATION
            | PROCESS_CREATE_THREAD;

        let process = OwnedHandle::new(unsafe { OpenProcess(access, FALSE, pid) })
            .ok_or(TracerError::InsufficientPermission)?;

        Ok(Self {
            pid,
            process,
            module: 0,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn process_handle(&self) -> &OwnedHandle {
        &self.process
    }

    /// Remote handle of the injected library, 0 before injection.
    pub fn remote_module(&self) -> usize {
        self.module
    }

    pub fn read(&self, address: usize, buffer: &mut [u8]) -> Result<usize> {
        let mut transferred = 0;
        let ok = unsafe {
            ReadProcessMemory(
                self.process.raw(),
                address as *const _,
                buffer.as_mut_ptr() as *mut _,
                buffer.len(),
                &mut transferred,
            )
        };
        if ok == 0 {
            return Err(TracerError::SystemCall);
        }
        Ok(transferred)
    }

    pub fn write(&self, address: usize, data: &[u8]) -> Result<usize> {
        let mut transferred = 0;
        let ok = unsafe {
            WriteProcessMemory(
                self.process.raw(),
                address as *mut _,
                data.as_ptr() as *const _,
                data.len(),
                &mut transferred,
            )
        };
        if ok == 0 {
            return Err(TracerError::SystemCall);
        }
        Ok(transferred)
    }

    /// Base address of a module loaded in the remote process; `None` names
    /// the injected copy of this library.
    pub fn find_module(&self, name: Option<&str>) -> Result<usize> {
        let wanted = match name {
            None => return Ok(self.module),
            Some(name) => name.to_ascii_lowercase(),
        };

        let snapshot =
            OwnedHandle::new(unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPMODULE, self.pid) })
                .ok_or(TracerError::SystemCall)?;

        let mut entry: MODULEENTRY32W = unsafe { mem::zeroed() };
        entry.dwSize = mem::size_of::<MODULEENTRY32W>() as u32;

        if unsafe { Module32FirstW(snapshot.raw(), &mut entry) } == 0 {
            return Err(TracerError::SystemCall);
        }

        loop {
            let len = entry
                .szModule
                .iter()
                .position(|&c| c == 0)
                .unwrap_or(entry.szModule.len());
            let module_name = String::from_utf16_lossy(&entry.szModule[..len]);

            if module_name.to_ascii_lowercase() == wanted {
                return Ok(entry.modBaseAddr as usize);
            }

            if unsafe { Module32NextW(snapshot.raw(), &mut entry) } == 0 {
                return Err(TracerError::SystemCall);
            }
        }
    }

    pub fn alloc(&self, size: usize) -> Result<usize> {
        let address = unsafe {
            VirtualAllocEx(
                self.process.raw(),
                ptr::null_mut(),
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        if address.is_null() {
            return Err(TracerError::NotEnoughMemory);
        }
        Ok(address as usize)
    }

    pub fn free(&self, address: usize) {
        unsafe { VirtualFreeEx(self.process.raw(), address as *mut _, 0, MEM_RELEASE) };
    }

    /// Runs a remote thread at `start_address` and returns its exit code.
    /// `timeout_ms` of `None` waits forever.
    fn run_remote_thread(
        &self,
        start_address: usize,
        parameter: usize,
        timeout_ms: Option<u32>,
    ) -> Result<u32> {
        let thread = unsafe {
            CreateRemoteThread(
                self.process.raw(),
                ptr::null_mut(),
                0,
                Some(mem::transmute(start_address)),
                parameter as *mut _,
                0,
                ptr::null_mut(),
            )
        };
        let thread = OwnedHandle::new(thread).ok_or(TracerError::SystemCall)?;

        match unsafe { WaitForSingleObject(thread.raw(), timeout_ms.unwrap_or(INFINITE)) } {
            WAIT_OBJECT_0 => {}
            0x0000_0102 /* WAIT_TIMEOUT */ => return Err(TracerError::WaitTimeout),
            _ => return Err(TracerError::WaitIncomplete),
        }

        let mut exit_code: DWORD = 0;
        if unsafe { GetExitCodeThread(thread.raw(), &mut exit_code) } == 0 {
            return Err(TracerError::SystemCall);
        }
        Ok(exit_code)
    }

    /// Calls an export of a system library inside the remote process. System
    /// libraries share their load address across the processes of a session,
    /// so the locally resolved address is valid over there.
    pub fn call_named_export(
        &self,
        module: &str,
        export: &str,
        parameter: usize,
        timeout_ms: Option<u32>,
    ) -> Result<u32> {
        let module_name = wide(module);
        let local_module = unsafe { GetModuleHandleW(module_name.as_ptr()) };
        if local_module.is_null() {
            return Err(TracerError::SystemCall);
        }

        let export_name: Vec<u8> = export.bytes().chain(core::iter::once(0)).collect();
        let address = unsafe { GetProcAddress(local_module, export_name.as_ptr() as *const _) };
        if address.is_null() {
            return Err(TracerError::SystemCall);
        }

        self.run_remote_thread(address as usize, parameter, timeout_ms)
    }

    /// Calls one of this library's own exports inside the remote process by
    /// rebasing the locally resolved export address onto the remote module
    /// handle. The argument block is marshalled through remote memory.
    /// Any failure along the way is a remote-interop error.
    pub fn call_local_export(&self, export: &str, args: &[u8]) -> Result<u32> {
        if self.module == 0 {
            return Err(TracerError::RemoteInterop);
        }

        let local_module = local::own_module_handle();
        let export_name: Vec<u8> = export.bytes().chain(core::iter::once(0)).collect();
        let local_address =
            unsafe { GetProcAddress(local_module as HMODULE, export_name.as_ptr() as *const _) };
        if local_address.is_null() {
            log::error!("Export {} is missing from the local module", export);
            return Err(TracerError::RemoteInterop);
        }

        let rebased = self.module + (local_address as usize - local_module);

        let remote_args = self.alloc(args.len())?;
        let result = (|| {
            self.write(remote_args, args)?;
            self.run_remote_thread(rebased, remote_args, None)
        })();
        self.free(remote_args);

        result.map_err(|error| {
            log::error!("Remote call to {} failed: {}", export, error);
            TracerError::RemoteInterop
        })
    }

    /// Loads this library into the remote process: writes our own path into
    /// remote memory and runs `kernel32!LoadLibraryW` over it.
    pub fn inject_library(&mut self) -> Result<()> {
        let path = local::own_module_path()?;
        let bytes = unsafe {
            core::slice::from_raw_parts(path.as_ptr() as *const u8, path.len() * 2)
        };

        let remote_path = self.alloc(bytes.len())?;
        let result = (|| {
            self.write(remote_path, bytes)?;
            self.call_named_export("kernel32.dll", "LoadLibraryW", remote_path, None)
        })();
        self.free(remote_path);

        match result {
            Ok(module) if module != 0 => {
                log::info!(
                    "Injected tracer library into pid {} at {:#x}",
                    self.pid,
                    module
                );
                self.module = module as usize;
                Ok(())
            }
            Ok(_) => Err(TracerError::RemoteInterop),
            Err(error) => Err(error),
        }
    }

    /// Unloads the injected library again.
    pub fn eject_library(&mut self) {
        if self.module == 0 {
            return;
        }
        let _ = self.call_named_export("kernel32.dll", "FreeLibrary", self.module, None);
        self.module = 0;
    }
}
