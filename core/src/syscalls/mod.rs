//! Guest syscall front ends
//!
//! Each call receives primitive arguments and guest addresses from the
//! dispatcher, does all guest-memory marshalling, and hands back a
//! [`SyscallResult`]. A non-zero `delay_us` asks the dispatcher to hold the
//! result back for that long, standing in for latency a blocking call would
//! have had.
//!
//! - [`inet`] - the BSD-style inet socket API
//! - [`matching`] - guest-memory parts of the matching API

pub mod inet;
pub mod matching;

pub use inet::InetSyscalls;
pub use matching::{MEMBER_INFO_SIZE, MatchingSyscalls};

/// Return value for the guest plus an optional delivery delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallResult {
    pub value: i32,
    pub delay_us: u32,
}

impl SyscallResult {
    pub fn ok(value: i32) -> Self {
        Self { value, delay_us: 0 }
    }

    pub fn delayed(value: i32, delay_us: u32) -> Self {
        Self { value, delay_us }
    }

    /// A library error code as the guest receives it
    pub fn code(code: u32) -> Self {
        Self::ok(code as i32)
    }
}

/// Latency emulated for calls that would block on real hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallDelays {
    /// recv/recvfrom/select and would-block sends on blocking sockets
    pub blocking_us: u32,
    pub poll_us: u32,
    /// Member list queries
    pub members_us: u32,
}

impl Default for SyscallDelays {
    fn default() -> Self {
        Self {
            blocking_us: 500,
            poll_us: 1000,
            members_us: 100,
        }
    }
}
