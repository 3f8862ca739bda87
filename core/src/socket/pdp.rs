//! Ad-hoc datagram (PDP) sockets
//!
//! PDP sockets address peers by MAC and guest port. Natively each peer
//! listens on `guest_port + port_offset`, which lets several emulator
//! instances share one host. Destinations are resolved through the
//! [`PeerDirectory`]; the broadcast MAC fans out to every active peer.

use std::net::SocketAddrV4;
use std::sync::Arc;

use crate::mac::MacAddr;
use crate::peers::PeerDirectory;
use crate::translate::codes::adhoc;
use crate::translate::{MsgFlags, guest};

use super::registry::SocketOwner;
use super::shim::SocketShim;
use super::SocketError;

/// Largest payload a PDP datagram may carry
pub const MAX_PDP_DATA: usize = 65_507;

/// PDP failures, reported to the guest as ad-hoc library codes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdhocError {
    #[error("invalid PDP socket id {0}")]
    InvalidSocketId(i32),
    #[error("invalid address {0}")]
    InvalidAddr(MacAddr),
    #[error("invalid port")]
    InvalidPort,
    #[error("port {0} already in use")]
    PortInUse(u16),
    #[error("invalid data length {0}")]
    InvalidDatalen(usize),
    #[error("operation would block")]
    WouldBlock,
    #[error("socket error: {0}")]
    Socket(SocketError),
}

impl AdhocError {
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidSocketId(_) => adhoc::INVALID_SOCKET_ID,
            Self::InvalidAddr(_) => adhoc::INVALID_ADDR,
            Self::InvalidPort => adhoc::INVALID_PORT,
            Self::PortInUse(_) => adhoc::PORT_IN_USE,
            Self::InvalidDatalen(_) => adhoc::INVALID_DATALEN,
            Self::WouldBlock => adhoc::WOULD_BLOCK,
            Self::Socket(_) => adhoc::INVALID_ARG,
        }
    }
}

impl From<SocketError> for AdhocError {
    fn from(e: SocketError) -> Self {
        match e {
            SocketError::UnknownHandle(id) => Self::InvalidSocketId(id),
            e if e.is_would_block() => Self::WouldBlock,
            e => Self::Socket(e),
        }
    }
}

/// One received PDP datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdpPacket {
    pub from: MacAddr,
    pub port: u16,
    pub len: usize,
}

/// PDP socket layer bound to the local player's identity
pub struct PdpLayer {
    shim: Arc<SocketShim>,
    peers: Arc<PeerDirectory>,
    local_mac: MacAddr,
    port_offset: u16,
}

impl PdpLayer {
    pub fn new(
        shim: Arc<SocketShim>,
        peers: Arc<PeerDirectory>,
        local_mac: MacAddr,
        port_offset: u16,
    ) -> Self {
        Self {
            shim,
            peers,
            local_mac,
            port_offset,
        }
    }

    pub fn local_mac(&self) -> MacAddr {
        self.local_mac
    }

    pub fn port_offset(&self) -> u16 {
        self.port_offset
    }

    fn check_owner(&self, id: i32) -> Result<SocketAddrV4, AdhocError> {
        let socket = self
            .shim
            .registry()
            .get(id)
            .map_err(|_| AdhocError::InvalidSocketId(id))?;
        if socket.meta.owner != SocketOwner::Adhoc || socket.meta.ty != guest::SOCK_DGRAM {
            return Err(AdhocError::InvalidSocketId(id));
        }
        socket.meta.bound_addr.ok_or(AdhocError::InvalidSocketId(id))
    }

    /// Open a PDP socket on `port`; `mac` must be the local address
    pub fn create(&self, mac: MacAddr, port: u16) -> Result<i32, AdhocError> {
        if mac != self.local_mac {
            return Err(AdhocError::InvalidAddr(mac));
        }
        let native_port = port
            .checked_add(self.port_offset)
            .ok_or(AdhocError::InvalidPort)?;

        let id = self.shim.create_owned(
            SocketOwner::Adhoc,
            guest::AF_INET,
            guest::SOCK_DGRAM,
            guest::IPPROTO_UDP,
        )?;
        let target = SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, native_port);
        if let Err(e) = self.shim.bind(id, target) {
            let _ = self.shim.close(id);
            return Err(match e {
                SocketError::Native { errno } if errno == guest::EADDRINUSE => {
                    AdhocError::PortInUse(port)
                }
                e => e.into(),
            });
        }
        tracing::debug!(id, port, native_port, "PDP socket created");
        Ok(id)
    }

    /// Guest port a PDP socket was opened on
    pub fn guest_port(&self, id: i32) -> Result<u16, AdhocError> {
        let bound = self.check_owner(id)?;
        Ok(bound.port().saturating_sub(self.port_offset))
    }

    /// Send to one peer, or to every active peer for the broadcast MAC
    pub fn send(
        &self,
        id: i32,
        dest: MacAddr,
        port: u16,
        data: &[u8],
    ) -> Result<usize, AdhocError> {
        self.check_owner(id)?;
        if data.len() > MAX_PDP_DATA {
            return Err(AdhocError::InvalidDatalen(data.len()));
        }

        if dest.is_broadcast() {
            for peer in self.peers.active_snapshot() {
                let addr = SocketAddrV4::new(peer.ip, port.wrapping_add(peer.port_offset));
                if let Err(e) = self.shim.send_to(id, data, MsgFlags::empty(), addr) {
                    tracing::debug!(id, mac = %peer.mac, error = %e, "PDP broadcast send failed");
                }
            }
            return Ok(data.len());
        }

        let peer = self
            .peers
            .find_by_mac(dest)
            .ok_or(AdhocError::InvalidAddr(dest))?;
        let addr = SocketAddrV4::new(peer.ip, port.wrapping_add(peer.port_offset));
        Ok(self.shim.send_to(id, data, MsgFlags::empty(), addr)?)
    }

    /// Receive one datagram from a known peer
    ///
    /// Datagrams from unknown sources are dropped. Returns
    /// [`AdhocError::WouldBlock`] when nothing is queued.
    pub fn recv(&self, id: i32, buf: &mut [u8]) -> Result<PdpPacket, AdhocError> {
        let bound = self.check_owner(id)?;
        let own_port = bound.port().saturating_sub(self.port_offset);
        loop {
            let (len, from) = self.shim.recv_from(id, buf, MsgFlags::empty())?;
            match self
                .peers
                .resolve_endpoint(*from.ip(), from.port(), Some(own_port))
            {
                Some((mac, port)) => return Ok(PdpPacket { from: mac, port, len }),
                None => {
                    tracing::trace!(%from, len, "dropping PDP datagram from unknown source");
                }
            }
        }
    }

    pub fn delete(&self, id: i32) -> Result<(), AdhocError> {
        self.check_owner(id)?;
        self.shim.close(id)?;
        tracing::debug!(id, "PDP socket deleted");
        Ok(())
    }
}
