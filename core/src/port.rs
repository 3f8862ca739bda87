//! Port manager collaborator
//!
//! The emulator may forward bound ports through a NAT/firewall helper
//! (UPnP or similar). The networking core only announces ports it binds
//! and releases.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport protocol of a forwarded port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortProtocol {
    Tcp,
    Udp,
}

impl fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
        }
    }
}

/// NAT/firewall traversal service
pub trait PortManager: Send + Sync {
    /// Request forwarding of `port`; returns false if the request failed
    fn add(&self, protocol: PortProtocol, port: u16) -> bool;

    /// Release a port previously passed to [`PortManager::add`]
    fn remove(&self, protocol: PortProtocol, port: u16) -> bool;
}

/// Port manager that accepts every request and does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPortManager;

impl PortManager for NoopPortManager {
    fn add(&self, protocol: PortProtocol, port: u16) -> bool {
        tracing::trace!(%protocol, port, "port forward (noop)");
        true
    }

    fn remove(&self, protocol: PortProtocol, port: u16) -> bool {
        tracing::trace!(%protocol, port, "port release (noop)");
        true
    }
}
