//! PSPNet Core - Ad-hoc wireless and socket emulation
//!
//! This crate emulates the handheld's network libraries on top of native
//! sockets so emulated games can play with each other over the internet.
//!
//! # Architecture
//!
//! - [`translate`] - Guest ↔ host constants, errno and error code tables
//! - [`socket`] - Guest socket registry, the socket call shim and PDP sockets
//! - [`relay`] - Relay session client (and a lobby server) for finding peers
//! - [`peers`] - Directory of known remote players
//! - [`matching`] - The ad-hoc matching engine (rooms, joins, keep-alives)
//! - [`syscalls`] - Guest-memory wrappers returning guest result codes
//! - [`stack`] - Everything wired together, with save states

pub mod clock;
pub mod config;
pub mod mac;
pub mod matching;
pub mod memory;
pub mod peers;
pub mod port;
pub mod relay;
pub mod savestate;
pub mod socket;
pub mod stack;
pub mod syscalls;
#[cfg(test)]
pub mod test_utils;
pub mod translate;

// Re-export the embedding surface
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::NetConfig;
pub use mac::MacAddr;
pub use memory::{FlatMemory, GuestMemory, MemoryError};
pub use port::{NoopPortManager, PortManager, PortProtocol};
pub use stack::{NetSnapshot, NetStack, StackError};

// Re-export component types
pub use matching::{MatchingEngine, MatchingError, MatchingHandler, NotificationQueue};
pub use peers::{Peer, PeerDirectory};
pub use relay::{LoginParameters, RelayClient, RelayError, RelayServer};
pub use savestate::SaveStateError;
pub use socket::{AdhocError, PdpLayer, SocketError, SocketRegistry, SocketShim};
pub use syscalls::{InetSyscalls, MatchingSyscalls, SyscallResult};
