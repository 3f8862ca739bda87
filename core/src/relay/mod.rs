//! Relay session layer
//!
//! Players find each other through a relay server. The client logs in with
//! its MAC, nickname and product code, joins a named group, and learns the
//! native IP of every other member; those land in the
//! [`PeerDirectory`](crate::peers::PeerDirectory) where the ad-hoc socket
//! layers resolve MACs to endpoints.
//!
//! - [`packets`] - wire frames
//! - [`client`] - session client and its worker thread
//! - [`server`] - lobby server
//! - [`types`] - states, notifications, errors

pub mod client;
pub mod packets;
pub mod server;
pub mod types;

#[cfg(test)]
mod tests;

pub use client::{RelayClient, RelaySettings, RelaySnapshot, SessionState};
pub use packets::{ClientPacket, RELAY_PORT, RelayDecodeError, ServerPacket};
pub use server::{RelayServer, RelayServerHandle};
pub use types::{
    AdhocctlEvent, AdhocctlNotification, AdhocctlState, LoginParameters, RelayError, ScanResult,
};
