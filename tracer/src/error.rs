//! Error codes shared by every public entry point.
//!
//! The codes are stable integers because they cross the process boundary: a
//! remote call returns them by value and the consumer maps them back through
//! [`TracerError::from_code`].

use core::cell::Cell;
use snafu::Snafu;

/// Result type used throughout the crate.
pub type Result<T, E = TracerError> = core::result::Result<T, E>;

/// One flat error enum surfaced through a thread-local last-error slot.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TracerError {
    #[snafu(display("The operation completed successfully"))]
    Success = 0,

    #[snafu(display("The library version does not match the caller's expectation"))]
    WrongVersion = 1,

    #[snafu(display("The operation is not implemented for this context"))]
    NotImplemented = 2,

    #[snafu(display("The operation failed due to an invalid argument"))]
    InvalidArgument = 3,

    #[snafu(display("The operation failed due to an invalid process id"))]
    InvalidProcess = 4,

    #[snafu(display("The operation failed due to an invalid handle"))]
    InvalidHandle = 5,

    #[snafu(display("The operation failed due to insufficient permission"))]
    InsufficientPermission = 6,

    #[snafu(display("There is not enough memory available"))]
    NotEnoughMemory = 7,

    #[snafu(display("A system call returned an error"))]
    SystemCall = 8,

    #[snafu(display("The operation timed out"))]
    WaitTimeout = 9,

    #[snafu(display("One of the wait handles returned an error"))]
    WaitIncomplete = 10,

    #[snafu(display("The remote end returned an error"))]
    RemoteInterop = 11,

    #[snafu(display("One of the patterns could not be found"))]
    PatternsNotFound = 12,

    #[snafu(display("A required resource was exhausted"))]
    OutOfResources = 13,
}

impl TracerError {
    /// The stable integer value of this code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Maps a stable integer back to the error code, if it is one.
    pub fn from_code(code: i32) -> Option<Self> {
        use TracerError::*;

        match code {
            0 => Some(Success),
            1 => Some(WrongVersion),
            2 => Some(NotImplemented),
            3 => Some(InvalidArgument),
            4 => Some(InvalidProcess),
            5 => Some(InvalidHandle),
            6 => Some(InsufficientPermission),
            7 => Some(NotEnoughMemory),
            8 => Some(SystemCall),
            9 => Some(WaitTimeout),
            10 => Some(WaitIncomplete),
            11 => Some(RemoteInterop),
            12 => Some(PatternsNotFound),
            13 => Some(OutOfResources),
            _ => None,
        }
    }
}

thread_local! {
    static LAST_ERROR: Cell<TracerError> = Cell::new(TracerError::Success);
}

/// Stores the last error for the calling thread.
pub fn set_last_error(error: TracerError) {
    LAST_ERROR.with(|slot| slot.set(error));
}

/// Returns the last error stored for the calling thread.
pub fn last_error() -> TracerError {
    LAST_ERROR.with(|slot| slot.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(TracerError::Success.code(), 0);
        assert_eq!(TracerError::InvalidArgument.code(), 3);
        assert_eq!(TracerError::SystemCall.code(), 8);
        assert_eq!(TracerError::RemoteInterop.code(), 11);
        assert_eq!(TracerError::OutOfResources.code(), 13);
    }

    #[test]
    fn test_code_round_trip() {
        for code in 0..=13 {
            let error = TracerError::from_code(code).unwrap();
            assert_eq!(error.code(), code);
        }
        assert_eq!(TracerError::from_code(14), None);
        assert_eq!(TracerError::from_code(-1), None);
    }

    #[test]
    fn test_last_error_is_thread_local() {
        set_last_error(TracerError::OutOfResources);

        let other = std::thread::spawn(|| last_error()).join().unwrap();
        assert_eq!(other, TracerError::Success);
        assert_eq!(last_error(), TracerError::OutOfResources);
    }
}
