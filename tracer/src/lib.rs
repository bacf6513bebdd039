//! Branch-level execution tracer for x86 user-mode processes on Windows.
//!
//! A hardware breakpoint is armed on the entry of a target function. Once the
//! breakpoint fires, the thread that hit it is switched into branch-trap
//! single-stepping: every taken branch raises a single-step exception, the
//! vectored handler decodes the branch at the CPU's last-branch address and
//! emits a record into a bounded ring that a consumer drains, possibly from
//! another process through a shared mapping.
//!
//! The engine itself only runs on `windows`/`x86`. The platform independent
//! subsystems (bit utilities, ring, per-thread depth accounting, record
//! types) build everywhere so that their tests can run on any host.

pub mod bits;
pub mod error;
pub mod record;
pub mod ring;
pub mod tls;

cfg_if::cfg_if! {
    if #[cfg(all(windows, target_arch = "x86"))] {
        pub mod api;
        pub mod core;
        pub mod hwbp;
        pub mod memory;
        pub mod process;
        pub mod trace;

        pub use api::{
            attach_process, context_for_pid, decode_and_format, detach_process, fetch_traces,
            get_process_context, init, last_error, set_process_context, shutdown, start_trace,
            stop_trace, version,
        };
        pub use process::ProcessContext;
    }
}

pub use error::TracerError;
pub use record::{InstructionType, RegisterSet, TracedInstruction};
pub use ring::Ring;

/// Version constant negotiated by [`init`]. The two least significant digits
/// are the minor version (e.g. `152` => 1.52).
pub const LIBRARY_VERSION: i32 = 100;
