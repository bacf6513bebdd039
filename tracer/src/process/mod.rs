//! Per-process contexts: the aggregate a consumer holds after attaching.
//!
//! One tagged type instead of a class hierarchy: a context is either the
//! local process (the engine runs right here) or a remote one (the engine
//! runs in the target, records come back through the shared mapping).

use iced_x86::{Decoder, DecoderOptions, Formatter, IntelFormatter};

use crate::error::{Result, TracerError};
use crate::memory::MemorySource;
use crate::record::{TracedInstruction, MAX_INSTRUCTION_BYTES};

pub mod local;
pub mod remote;

pub use local::LocalProcess;
pub use remote::RemoteProcess;

use std::sync::Arc;

/// An attached process.
pub enum ProcessContext {
    Local(Arc<LocalProcess>),
    Remote(RemoteProcess),
}

impl ProcessContext {
    pub fn pid(&self) -> u32 {
        match self {
            Self::Local(process) => process.pid(),
            Self::Remote(process) => process.pid(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    /// Access to the traced process's address space.
    pub fn memory(&self) -> MemorySource<'_> {
        match self {
            Self::Local(process) => MemorySource::Local(process.memory()),
            Self::Remote(process) => MemorySource::Remote(process.memory()),
        }
    }

    /// Arms a trace on the entry of the function at `address`.
    pub fn start_trace(
        &self,
        address: usize,
        thread_id: i32,
        max_depth: i32,
        lifetime: i32,
    ) -> Result<()> {
        match self {
            Self::Local(process) => process.start_trace(address, thread_id, max_depth, lifetime),
            Self::Remote(process) => process.start_trace(address, thread_id, max_depth, lifetime),
        }
    }

    /// Revokes the trace(s) registered for `address`.
    pub fn stop_trace(&self, address: usize, thread_id: i32) -> Result<()> {
        match self {
            Self::Local(process) => process.stop_trace(address, thread_id),
            Self::Remote(process) => process.stop_trace(address, thread_id),
        }
    }

    /// Drains buffered trace records into `out`, returning the count.
    pub fn fetch_traces(&self, out: &mut [TracedInstruction]) -> usize {
        match self {
            Self::Local(process) => process.fetch_traces(out),
            Self::Remote(process) => process.fetch_traces(out),
        }
    }

    /// Reads one instruction from the traced process and formats it.
    pub fn decode_and_format(&self, address: usize) -> Result<String> {
        if address == 0 {
            return Err(TracerError::InvalidArgument);
        }

        let mut bytes = [0u8; MAX_INSTRUCTION_BYTES];
        self.memory().read(address, &mut bytes)?;

        let mut decoder = Decoder::with_ip(32, &bytes, address as u64, DecoderOptions::NONE);
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(TracerError::InvalidArgument);
        }

        let mut output = String::new();
        IntelFormatter::new().format(&instruction, &mut output);
        Ok(output)
    }
}
