//! Guest/host socket constant translation
//!
//! Stateless lookups between the guest socket ABI and the host's native
//! numbering:
//!
//! - [`guest`] - guest ABI constants and flag sets
//! - [`tables`] - bidirectional families (domain, type, protocol, level,
//!   option name, control message) plus bit-set converters
//! - [`errno`] - host errno → guest errno → kernel error code
//! - [`codes`] - kernel and network-library error codes
//! - [`render`] - diagnostic names with hex fallbacks

pub mod codes;
pub mod errno;
pub mod guest;
pub mod render;
pub mod tables;


pub use codes::describe_net_error;
pub use errno::{errno_to_guest, guest_errno_to_kernel, io_error_to_guest};
pub use guest::{MsgFlags, PollEvents, SocketTypeFlags};
pub use tables::{
    CMSG_TYPES, ConstantFamily, DOMAINS, LEVELS, PROTOCOLS, SOCKET_TYPES, backlog_to_host,
    cmsg_to_guest, cmsg_to_host, msg_flags_to_guest, msg_flags_to_host, option_family, option_to_guest, option_to_host,
    poll_events_to_guest, poll_events_to_host, shutdown_to_host, split_socket_type,
};
