//! Socket layer errors

use crate::translate::guest;

/// Failure of a guest socket operation
///
/// Every variant maps onto a guest errno through [`SocketError::guest_errno`];
/// native failures already carry the translated value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SocketError {
    /// No socket is registered under this id
    #[error("unknown socket id {0}")]
    UnknownHandle(i32),

    /// Argument rejected before any native call
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Every id in the guest handle range is in use
    #[error("socket id space exhausted")]
    ResourceExhausted,

    #[error("address family {0} not supported")]
    FamilyNotSupported(i32),

    #[error("socket type {0} not supported")]
    TypeNotSupported(i32),

    #[error("protocol {0} not supported")]
    ProtocolNotSupported(i32),

    /// Option is not on the allow-list for this socket class
    #[error("unsupported option {name:#x} at level {level:#x}")]
    UnsupportedOption { level: i32, name: i32 },

    /// Native call failed; `errno` is already in guest numbering
    #[error("native socket error (guest errno {errno})")]
    Native { errno: i32 },
}

impl SocketError {
    pub fn guest_errno(&self) -> i32 {
        match self {
            Self::UnknownHandle(_) => guest::EBADF,
            Self::InvalidArgument(_) => guest::EINVAL,
            Self::ResourceExhausted => guest::ENOBUFS,
            Self::FamilyNotSupported(_) => guest::EAFNOSUPPORT,
            Self::TypeNotSupported(_) => guest::ESOCKTNOSUPPORT,
            Self::ProtocolNotSupported(_) => guest::EPROTONOSUPPORT,
            Self::UnsupportedOption { .. } => guest::ENOPROTOOPT,
            Self::Native { errno } => *errno,
        }
    }

    pub fn would_block() -> Self {
        Self::Native {
            errno: guest::EAGAIN,
        }
    }

    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::Native { errno } if *errno == guest::EAGAIN)
    }
}

impl From<std::io::Error> for SocketError {
    fn from(e: std::io::Error) -> Self {
        Self::Native {
            errno: crate::translate::io_error_to_guest(&e),
        }
    }
}
