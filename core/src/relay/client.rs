//! Relay session client
//!
//! One control connection to the relay server per session. After login a
//! dedicated worker thread keeps the session alive with pings, reads the
//! control stream into a rolling buffer, and applies complete frames to the
//! shared session state and the [`PeerDirectory`].
//!
//! # Lifecycle
//!
//! ```text
//! init(login) ──► worker running ──► term()
//!                   │                  │ 1. clear running flag
//!                   │                  │ 2. join worker
//!                   ▼                  │ 3. close control socket
//!          ping / recv / dispatch      ▼
//!                                  re-init allowed
//! ```

use std::collections::VecDeque;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::packets::{self, ClientPacket, RELAY_PORT, ServerPacket};
use super::types::{
    AdhocctlEvent, AdhocctlNotification, AdhocctlState, LoginParameters, RelayError, ScanResult,
};
use crate::clock::SharedClock;
use crate::mac::MacAddr;
use crate::peers::{Peer, PeerDirectory};
use crate::socket::{SocketError, SocketOwner, SocketShim};
use crate::translate::{MsgFlags, guest};

/// Relay client tunables
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub server: String,
    pub port: u16,
    pub keepalive_interval: Duration,
    /// Pause between worker iterations
    pub worker_sleep: Duration,
    /// Size of the rolling receive buffer
    pub recv_buffer: usize,
    /// Port offset assigned to peers announced by the server
    pub peer_port_offset: u16,
    pub chat_history: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            server: "127.0.0.1".to_string(),
            port: RELAY_PORT,
            keepalive_interval: Duration::from_millis(100),
            worker_sleep: Duration::from_millis(10),
            recv_buffer: 1024,
            peer_port_offset: 0,
            chat_history: 64,
        }
    }
}

/// Session state shared between the guest-facing API and the worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub state: AdhocctlState,
    pub group: Option<String>,
    pub bssid: Option<MacAddr>,
    pending_scan: Vec<ScanResult>,
    pub scan_results: Vec<ScanResult>,
    pub chat_log: VecDeque<String>,
}

/// Persisted relay session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySnapshot {
    pub login: LoginParameters,
    pub session: SessionState,
    pub events: Vec<AdhocctlNotification>,
}

struct Shared {
    running: AtomicBool,
    session: Mutex<SessionState>,
    events: Mutex<VecDeque<AdhocctlNotification>>,
}

impl Shared {
    fn notify(&self, event: AdhocctlEvent, error: u32) {
        tracing::debug!(?event, error, "adhocctl notification");
        self.events
            .lock()
            .push_back(AdhocctlNotification { event, error });
    }
}

/// Client side of the relay protocol
pub struct RelayClient {
    shim: Arc<SocketShim>,
    peers: Arc<PeerDirectory>,
    clock: SharedClock,
    settings: RelaySettings,
    shared: Arc<Shared>,
    socket: Option<i32>,
    login: Option<LoginParameters>,
    worker: Option<JoinHandle<()>>,
}

impl RelayClient {
    pub fn new(
        shim: Arc<SocketShim>,
        peers: Arc<PeerDirectory>,
        clock: SharedClock,
        settings: RelaySettings,
    ) -> Self {
        Self {
            shim,
            peers,
            clock,
            settings,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                session: Mutex::new(SessionState::default()),
                events: Mutex::new(VecDeque::new()),
            }),
            socket: None,
            login: None,
            worker: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.socket.is_some()
    }

    pub fn socket_id(&self) -> Option<i32> {
        self.socket
    }

    fn resolve_server(&self) -> Result<SocketAddrV4, RelayError> {
        let target = format!("{}:{}", self.settings.server, self.settings.port);
        target
            .to_socket_addrs()
            .map_err(|_| RelayError::Resolve(target.clone()))?
            .find_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(v4),
                SocketAddr::V6(_) => None,
            })
            .ok_or(RelayError::Resolve(target))
    }

    /// Connect to the relay server, log in and start the worker
    pub fn init(&mut self, login: LoginParameters) -> Result<(), RelayError> {
        if self.socket.is_some() {
            return Err(RelayError::AlreadyInitialized);
        }
        let server = self.resolve_server()?;

        let id = self.shim.create_owned(
            SocketOwner::Adhoc,
            guest::AF_INET,
            guest::SOCK_STREAM,
            guest::IPPROTO_TCP,
        )?;
        let connected = self.shim.connect(id, server).and_then(|()| {
            send_frame(
                &self.shim,
                id,
                &ClientPacket::Login {
                    mac: login.mac,
                    nickname: login.nickname.clone(),
                    product: login.product_code.clone(),
                }
                .to_bytes(),
            )
        });
        if let Err(e) = connected {
            tracing::warn!(%server, error = %e, "relay login failed");
            let _ = self.shim.close(id);
            return Err(e.into());
        }

        tracing::info!(%server, nickname = %login.nickname, mac = %login.mac, "logged in to relay server");
        *self.shared.session.lock() = SessionState::default();
        self.socket = Some(id);
        self.login = Some(login);
        self.spawn_worker(id);
        Ok(())
    }

    fn spawn_worker(&mut self, id: i32) {
        self.shared.running.store(true, Ordering::SeqCst);
        let worker = RelayWorker {
            shim: Arc::clone(&self.shim),
            peers: Arc::clone(&self.peers),
            clock: Arc::clone(&self.clock),
            shared: Arc::clone(&self.shared),
            settings: self.settings.clone(),
            socket: id,
        };
        let spawned = thread::Builder::new()
            .name("relay-worker".into())
            .spawn(move || worker.run());
        match spawned {
            Ok(handle) => self.worker = Some(handle),
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn relay worker");
                self.shared.running.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Stop the worker, then close the control socket
    pub fn term(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                tracing::error!("relay worker panicked");
            }
        }
        if let Some(id) = self.socket.take() {
            let _ = self.shim.close(id);
        }
        self.login = None;
        *self.shared.session.lock() = SessionState::default();
        self.shared.events.lock().clear();
        self.peers.clear();
        tracing::info!("relay session terminated");
    }

    fn socket(&self) -> Result<i32, RelayError> {
        self.socket.ok_or(RelayError::NotInitialized)
    }

    fn send(&self, packet: &ClientPacket) -> Result<(), RelayError> {
        let id = self.socket()?;
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(RelayError::Disconnected);
        }
        send_frame(&self.shim, id, &packet.to_bytes())?;
        Ok(())
    }

    /// Join (or create) a group
    pub fn connect(&self, group: &str) -> Result<(), RelayError> {
        self.socket()?;
        if !packets::is_valid_group_name(group) {
            return Err(RelayError::InvalidGroupName(group.to_string()));
        }
        let state = self.state();
        if state != AdhocctlState::Disconnected {
            return Err(RelayError::Busy(state));
        }
        self.send(&ClientPacket::Connect {
            group: group.to_string(),
        })?;
        self.shared.session.lock().group = Some(group.to_string());
        tracing::debug!(group, "group join requested");
        Ok(())
    }

    /// Leave the current group
    pub fn disconnect(&self) -> Result<(), RelayError> {
        self.socket()?;
        self.send(&ClientPacket::Disconnect)?;
        {
            let mut session = self.shared.session.lock();
            session.state = AdhocctlState::Disconnected;
            session.group = None;
            session.bssid = None;
        }
        self.peers.clear();
        self.shared.notify(AdhocctlEvent::Disconnect, 0);
        Ok(())
    }

    /// Ask the server for the list of groups
    pub fn scan(&self) -> Result<(), RelayError> {
        self.socket()?;
        {
            let mut session = self.shared.session.lock();
            if session.state != AdhocctlState::Disconnected {
                return Err(RelayError::Busy(session.state));
            }
            session.state = AdhocctlState::Scanning;
            session.pending_scan.clear();
        }
        if let Err(e) = self.send(&ClientPacket::Scan) {
            self.shared.session.lock().state = AdhocctlState::Disconnected;
            return Err(e);
        }
        Ok(())
    }

    pub fn chat(&self, message: &str) -> Result<(), RelayError> {
        self.socket()?;
        let state = self.state();
        if state != AdhocctlState::Connected {
            return Err(RelayError::Busy(state));
        }
        self.send(&ClientPacket::Chat {
            message: message.to_string(),
        })
    }

    pub fn state(&self) -> AdhocctlState {
        self.shared.session.lock().state
    }

    pub fn group(&self) -> Option<String> {
        self.shared.session.lock().group.clone()
    }

    pub fn bssid(&self) -> Option<MacAddr> {
        self.shared.session.lock().bssid
    }

    pub fn scan_results(&self) -> Vec<ScanResult> {
        self.shared.session.lock().scan_results.clone()
    }

    pub fn chat_log(&self) -> Vec<String> {
        self.shared.session.lock().chat_log.iter().cloned().collect()
    }

    pub fn login(&self) -> Option<&LoginParameters> {
        self.login.as_ref()
    }

    /// Drain pending guest notifications
    pub fn take_events(&self) -> Vec<AdhocctlNotification> {
        self.shared.events.lock().drain(..).collect()
    }

    pub fn snapshot(&self) -> Option<RelaySnapshot> {
        let login = self.login.clone()?;
        Some(RelaySnapshot {
            login,
            session: self.shared.session.lock().clone(),
            events: self.shared.events.lock().iter().copied().collect(),
        })
    }

    /// Re-open the control connection for a saved session
    ///
    /// A native connection cannot be carried across a save, so this logs in
    /// again and re-sends CONNECT for a saved group. The saved session is
    /// installed before anything is sent and the peer directory is left as
    /// the caller filled it; server replies then update both in place.
    pub fn restore(&mut self, snapshot: RelaySnapshot) -> Result<(), RelayError> {
        if self.socket.is_some() {
            self.term();
        }
        self.init(snapshot.login)?;
        let rejoin = match (&snapshot.session.group, snapshot.session.state) {
            (Some(group), AdhocctlState::Connected | AdhocctlState::GameMode) => {
                Some(group.clone())
            }
            _ => None,
        };
        *self.shared.session.lock() = snapshot.session;
        self.shared.events.lock().extend(snapshot.events);
        if let Some(group) = rejoin {
            self.send(&ClientPacket::Connect { group })?;
        }
        Ok(())
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        if self.socket.is_some() {
            self.term();
        }
    }
}

/// Send a whole frame, waiting briefly when the socket buffer is full
fn send_frame(shim: &SocketShim, id: i32, frame: &[u8]) -> Result<(), SocketError> {
    let mut sent = 0;
    let mut stalls = 0;
    while sent < frame.len() {
        match shim.send(id, &frame[sent..], MsgFlags::empty()) {
            Ok(n) => sent += n,
            Err(e) if e.is_would_block() && stalls < 100 => {
                stalls += 1;
                thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// ============================================================================
// Worker
// ============================================================================

struct RelayWorker {
    shim: Arc<SocketShim>,
    peers: Arc<PeerDirectory>,
    clock: SharedClock,
    shared: Arc<Shared>,
    settings: RelaySettings,
    socket: i32,
}

impl RelayWorker {
    fn run(self) {
        let keepalive_us = self.settings.keepalive_interval.as_micros() as u64;
        let mut rx = vec![0u8; self.settings.recv_buffer.max(256)];
        let mut filled = 0usize;
        let mut last_ping = 0u64;

        tracing::debug!(socket = self.socket, "relay worker started");
        while self.shared.running.load(Ordering::SeqCst) {
            let now = self.clock.now_us();
            if now.saturating_sub(last_ping) >= keepalive_us {
                last_ping = now;
                match self.shim.send(self.socket, &ClientPacket::Ping.to_bytes(), MsgFlags::empty()) {
                    Ok(_) => {}
                    Err(e) if e.is_would_block() => {}
                    Err(e) => {
                        self.transport_failed(&e.to_string());
                        break;
                    }
                }
            }

            match self.shim.recv(self.socket, &mut rx[filled..], MsgFlags::empty()) {
                Ok(0) => {
                    self.transport_failed("server closed the connection");
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.is_would_block() => {}
                Err(e) => {
                    self.transport_failed(&e.to_string());
                    break;
                }
            }

            let consumed = self.dispatch(&rx[..filled]);
            rx.copy_within(consumed..filled, 0);
            filled -= consumed;

            thread::sleep(self.settings.worker_sleep);
        }
        tracing::debug!(socket = self.socket, "relay worker stopped");
    }

    /// Apply every complete frame; returns the number of bytes consumed
    fn dispatch(&self, buf: &[u8]) -> usize {
        let mut consumed = 0;
        while consumed < buf.len() {
            match ServerPacket::decode(&buf[consumed..]) {
                Ok(Some((packet, len))) => {
                    self.apply(packet);
                    consumed += len;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, dropped = buf.len() - consumed, "discarding relay stream data");
                    return buf.len();
                }
            }
        }
        consumed
    }

    fn apply(&self, packet: ServerPacket) {
        match packet {
            ServerPacket::Connect { nickname, mac, ip } => {
                self.peers.add(Peer {
                    nickname,
                    mac,
                    ip,
                    port_offset: self.settings.peer_port_offset,
                    last_recv_us: self.clock.now_us(),
                });
            }
            ServerPacket::Disconnect { ip } => {
                self.peers.remove_by_ip(ip);
            }
            ServerPacket::Scan { group, mac } => {
                self.shared
                    .session
                    .lock()
                    .pending_scan
                    .push(ScanResult { group, bssid: mac });
            }
            ServerPacket::ScanComplete => {
                {
                    let mut session = self.shared.session.lock();
                    session.scan_results = std::mem::take(&mut session.pending_scan);
                    session.state = AdhocctlState::Disconnected;
                    tracing::debug!(groups = session.scan_results.len(), "scan complete");
                }
                self.shared.notify(AdhocctlEvent::Scan, 0);
            }
            ServerPacket::ConnectBssid { mac } => {
                {
                    let mut session = self.shared.session.lock();
                    session.bssid = Some(mac);
                    session.state = AdhocctlState::Connected;
                }
                tracing::info!(bssid = %mac, "joined group");
                self.shared.notify(AdhocctlEvent::Connect, 0);
            }
            ServerPacket::Chat { message, nickname } => {
                let mut session = self.shared.session.lock();
                session.chat_log.push_back(format!("{}: {}", nickname, message));
                while session.chat_log.len() > self.settings.chat_history {
                    session.chat_log.pop_front();
                }
            }
        }
    }

    fn transport_failed(&self, reason: &str) {
        tracing::warn!(reason, "relay connection lost");
        self.shared.running.store(false, Ordering::SeqCst);
        {
            let mut session = self.shared.session.lock();
            session.state = AdhocctlState::Disconnected;
            session.bssid = None;
        }
        self.peers.timeout_all();
        self.shared
            .notify(AdhocctlEvent::Error, RelayError::Disconnected.code());
    }
}
