//! Peer directory
//!
//! Known remote players, filled from relay notifications. Every method takes
//! the directory lock for the duration of the call and returns copies, so no
//! caller ever holds a reference into the table.

use std::net::Ipv4Addr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::mac::MacAddr;

/// A remote player
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub nickname: String,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    /// Added to guest ports when addressing this peer natively
    pub port_offset: u16,
    /// Last time the peer was heard from; 0 marks a timed-out entry
    pub last_recv_us: u64,
}

impl Peer {
    pub fn is_active(&self) -> bool {
        self.last_recv_us != 0
    }
}

/// Thread-safe table of known peers, in insertion order
#[derive(Default)]
pub struct PeerDirectory {
    peers: Mutex<Vec<Peer>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer, or refresh the entry with the same MAC
    ///
    /// Returns true when the peer was not known before.
    pub fn add(&self, peer: Peer) -> bool {
        let mut peers = self.peers.lock();
        if let Some(existing) = peers.iter_mut().find(|p| p.mac == peer.mac) {
            tracing::debug!(mac = %peer.mac, ip = %peer.ip, "peer updated");
            *existing = peer;
            false
        } else {
            tracing::info!(mac = %peer.mac, ip = %peer.ip, nickname = %peer.nickname, "peer added");
            peers.push(peer);
            true
        }
    }

    /// Remove every peer at `ip`; returns how many were removed
    pub fn remove_by_ip(&self, ip: Ipv4Addr) -> usize {
        let mut peers = self.peers.lock();
        let before = peers.len();
        peers.retain(|p| p.ip != ip);
        let removed = before - peers.len();
        if removed > 0 {
            tracing::info!(%ip, "peer removed");
        }
        removed
    }

    pub fn remove_by_mac(&self, mac: MacAddr) -> bool {
        let mut peers = self.peers.lock();
        let before = peers.len();
        peers.retain(|p| p.mac != mac);
        before != peers.len()
    }

    pub fn find_by_mac(&self, mac: MacAddr) -> Option<Peer> {
        self.peers.lock().iter().find(|p| p.mac == mac).cloned()
    }

    pub fn find_by_ip(&self, ip: Ipv4Addr) -> Option<Peer> {
        self.peers.lock().iter().find(|p| p.ip == ip).cloned()
    }

    /// Map a datagram source back to a peer and its guest port
    ///
    /// Several peers may share an IP (same host, different port offsets);
    /// when `guest_port_hint` is given the peer whose offset yields that
    /// guest port wins.
    pub fn resolve_endpoint(
        &self,
        ip: Ipv4Addr,
        native_port: u16,
        guest_port_hint: Option<u16>,
    ) -> Option<(MacAddr, u16)> {
        let peers = self.peers.lock();
        let mut candidates = peers
            .iter()
            .filter(|p| p.ip == ip && native_port >= p.port_offset)
            .map(|p| (p.mac, native_port - p.port_offset));

        match guest_port_hint {
            Some(hint) => {
                let all: Vec<_> = candidates.collect();
                all.iter()
                    .find(|(_, port)| *port == hint)
                    .or(all.first())
                    .copied()
            }
            None => candidates.next(),
        }
    }

    /// Record traffic from a peer
    pub fn touch(&self, mac: MacAddr, now_us: u64) -> bool {
        let mut peers = self.peers.lock();
        match peers.iter_mut().find(|p| p.mac == mac) {
            Some(peer) => {
                peer.last_recv_us = now_us.max(1);
                true
            }
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Peers that have not timed out
    pub fn active_count(&self) -> usize {
        self.peers.lock().iter().filter(|p| p.is_active()).count()
    }

    /// Drop peers not heard from within `timeout_us`; returns how many
    pub fn sweep(&self, now_us: u64, timeout_us: u64) -> usize {
        let mut peers = self.peers.lock();
        let before = peers.len();
        peers.retain(|p| now_us.saturating_sub(p.last_recv_us) <= timeout_us);
        let removed = before - peers.len();
        if removed > 0 {
            tracing::debug!(removed, "swept stale peers");
        }
        removed
    }

    /// Mark every peer as timed out, keeping the entries
    pub fn timeout_all(&self) {
        for peer in self.peers.lock().iter_mut() {
            peer.last_recv_us = 0;
        }
    }

    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.lock().clone()
    }

    pub fn active_snapshot(&self) -> Vec<Peer> {
        self.peers
            .lock()
            .iter()
            .filter(|p| p.is_active())
            .cloned()
            .collect()
    }

    pub fn replace_all(&self, peers: Vec<Peer>) {
        *self.peers.lock() = peers;
    }

    pub fn clear(&self) {
        self.peers.lock().clear();
    }
}
