//! Guest socket emulation
//!
//! - [`registry`] - guest id ↔ native socket table
//! - [`shim`] - the guest socket API over native sockets
//! - [`options`] - per-class option allow-lists
//! - [`sockaddr`] - guest structure layouts
//! - [`pdp`] - ad-hoc datagram sockets addressed by MAC

mod error;
pub mod options;
pub mod pdp;
pub mod registry;
pub mod shim;
pub mod sockaddr;

#[cfg(test)]
mod tests;

pub use error::SocketError;
pub use pdp::{AdhocError, PdpLayer, PdpPacket};
pub use registry::{GuestSocket, MAX_SOCKET_ID, MIN_SOCKET_ID, SocketMeta, SocketOwner, SocketRegistry};
pub use shim::{ReceivedMessage, ShimSettings, SocketShim, routable_local_ip};
pub use sockaddr::{ControlMessage, FdSet, GuestMsgHdr, GuestSockAddr, PollFd};
