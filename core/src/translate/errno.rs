//! Errno translation
//!
//! Host errno values become guest errno values; guest errno values can be
//! reported further as kernel error codes. The second mapping collapses
//! several errnos onto one code and has no inverse.

use super::codes::kernel;
use super::guest;

const HOST_ERRNO: &[(i32, i32)] = &[
    (libc::EINTR, guest::EINTR),
    (libc::EBADF, guest::EBADF),
    (libc::EAGAIN, guest::EAGAIN),
    (libc::EACCES, guest::EACCES),
    (libc::EFAULT, guest::EFAULT),
    (libc::EINVAL, guest::EINVAL),
    (libc::ENOSPC, guest::ENOSPC),
    (libc::EPIPE, guest::EPIPE),
    (libc::ENOMSG, guest::ENOMSG),
    (libc::ENOLINK, guest::ENOLINK),
    (libc::EPROTO, guest::EPROTO),
    (libc::EBADMSG, guest::EBADMSG),
    (libc::EOPNOTSUPP, guest::EOPNOTSUPP),
    (libc::EPFNOSUPPORT, guest::EPFNOSUPPORT),
    (libc::ECONNRESET, guest::ECONNRESET),
    (libc::ENOBUFS, guest::ENOBUFS),
    (libc::EAFNOSUPPORT, guest::EAFNOSUPPORT),
    (libc::EPROTOTYPE, guest::EPROTOTYPE),
    (libc::ENOTSOCK, guest::ENOTSOCK),
    (libc::ENOPROTOOPT, guest::ENOPROTOOPT),
    (libc::ESHUTDOWN, guest::ESHUTDOWN),
    (libc::ECONNREFUSED, guest::ECONNREFUSED),
    (libc::EADDRINUSE, guest::EADDRINUSE),
    (libc::ECONNABORTED, guest::ECONNABORTED),
    (libc::ENETUNREACH, guest::ENETUNREACH),
    (libc::ENETDOWN, guest::ENETDOWN),
    (libc::ETIMEDOUT, guest::ETIMEDOUT),
    (libc::EHOSTDOWN, guest::EHOSTDOWN),
    (libc::EHOSTUNREACH, guest::EHOSTUNREACH),
    (libc::EINPROGRESS, guest::EINPROGRESS),
    (libc::EALREADY, guest::EALREADY),
    (libc::EDESTADDRREQ, guest::EDESTADDRREQ),
    (libc::EMSGSIZE, guest::EMSGSIZE),
    (libc::EPROTONOSUPPORT, guest::EPROTONOSUPPORT),
    (libc::ESOCKTNOSUPPORT, guest::ESOCKTNOSUPPORT),
    (libc::EADDRNOTAVAIL, guest::EADDRNOTAVAIL),
    (libc::ENETRESET, guest::ENETRESET),
    (libc::EISCONN, guest::EISCONN),
    (libc::ENOTCONN, guest::ENOTCONN),
    (libc::ETOOMANYREFS, guest::ETOOMANYREFS),
    (libc::ENOTSUP, guest::ENOTSUP),
];

/// Translate a host errno into guest numbering
///
/// Returns 0 for 0 and for host values with no guest counterpart.
pub fn errno_to_guest(host: i32) -> i32 {
    if host == 0 {
        return 0;
    }
    match HOST_ERRNO.iter().find(|(h, _)| *h == host) {
        Some((_, g)) => *g,
        None => {
            log::warn!("unmapped host errno {}", host);
            0
        }
    }
}

/// Guest errno for an I/O error, preferring the raw OS code
pub fn io_error_to_guest(err: &std::io::Error) -> i32 {
    use std::io::ErrorKind;

    if let Some(raw) = err.raw_os_error() {
        let mapped = errno_to_guest(raw);
        if mapped != 0 {
            return mapped;
        }
    }
    match err.kind() {
        ErrorKind::WouldBlock => guest::EAGAIN,
        ErrorKind::TimedOut => guest::ETIMEDOUT,
        ErrorKind::ConnectionRefused => guest::ECONNREFUSED,
        ErrorKind::ConnectionReset => guest::ECONNRESET,
        ErrorKind::ConnectionAborted => guest::ECONNABORTED,
        ErrorKind::NotConnected => guest::ENOTCONN,
        ErrorKind::AddrInUse => guest::EADDRINUSE,
        ErrorKind::AddrNotAvailable => guest::EADDRNOTAVAIL,
        ErrorKind::BrokenPipe => guest::EPIPE,
        ErrorKind::Interrupted => guest::EINTR,
        ErrorKind::InvalidInput => guest::EINVAL,
        _ => guest::EINVAL,
    }
}

/// Kernel error code reported for a guest errno
///
/// Unknown values are passed through unchanged.
pub fn guest_errno_to_kernel(errno: i32) -> u32 {
    use guest::*;

    match errno {
        0 => 0,
        EINTR => kernel::DEVICE_BUSY,
        EACCES => kernel::READ_ONLY,
        EFAULT => kernel::ADDR_OUT_OF_MAIN_MEM,
        EINVAL => kernel::INVALID_ARGUMENT,
        ENOSPC => kernel::NO_MEMORY,
        EPIPE => kernel::FILE_NOT_FOUND,
        ENOMSG => kernel::NO_MEDIA,
        ENOLINK => kernel::DEVICE_NOT_FOUND,
        EPROTO | EPROTOTYPE | ENOPROTOOPT => kernel::FILE_PROTOCOL,
        EBADMSG => kernel::INVALID_MEDIUM,
        EOPNOTSUPP | EPFNOSUPPORT | EAFNOSUPPORT | EPROTONOSUPPORT | ESOCKTNOSUPPORT => {
            kernel::FUNCTION_NOT_SUPPORTED
        }
        ECONNRESET | ENETRESET => kernel::CONNECTION_RESET,
        ENOBUFS => kernel::NO_FREE_BUF_SPACE,
        ENOTSOCK => kernel::INVALID_FILE_DESCRIPTOR,
        ESHUTDOWN | ENETDOWN | EHOSTDOWN => kernel::CLOSED,
        ECONNREFUSED => kernel::FILE_ALREADY_EXISTS,
        EADDRINUSE => kernel::FILE_ADDR_IN_USE,
        ECONNABORTED => kernel::CONNECTION_ABORTED,
        ENETUNREACH | EHOSTUNREACH => kernel::DEVICE_NOT_FOUND,
        ETIMEDOUT => kernel::FILE_TIMEOUT,
        EALREADY | EISCONN => kernel::ALREADY,
        EMSGSIZE => kernel::FILE_IS_TOO_BIG,
        EADDRNOTAVAIL => kernel::ADDRESS_NOT_AVAILABLE,
        ENOTCONN => kernel::NOT_CONNECTED,
        EAGAIN => kernel::RESOURCE_UNAVAILABLE,
        EINPROGRESS => kernel::IN_PROGRESS,
        other => {
            log::warn!("no kernel error code for guest errno {}", other);
            other as u32
        }
    }
}
