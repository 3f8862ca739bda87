//! The assembled networking stack
//!
//! One [`NetStack`] per emulated console. It owns every component and wires
//! them together:
//!
//! ```text
//!                ┌──────────────┐      ┌────────────────┐
//!  guest calls ─►│ InetSyscalls │      │MatchingSyscalls│◄─ guest calls
//!                └──────┬───────┘      └───────┬────────┘
//!                       │               ┌──────▼────────┐
//!                       │               │MatchingEngine │
//!                       │               └──────┬────────┘
//!                       │  ┌───────────┐ ┌─────▼────┐
//!                       │  │RelayClient│ │ PdpLayer │──► PeerDirectory
//!                       │  └─────┬─────┘ └─────┬────┘        ▲
//!                       ▼        ▼             ▼             │
//!                ┌─────────────────────────────────┐   relay worker
//!                │ SocketShim ─► SocketRegistry    │
//!                └─────────────────────────────────┘
//! ```
//!
//! Save states capture the inet sockets, the relay session, the peer table
//! and every matching context. Ad-hoc sockets are not saved directly; the
//! relay client and the matching engine reopen their own on load.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::config::NetConfig;
use crate::mac::MacAddr;
use crate::matching::{MatchingEngine, MatchingError, MatchingHandler, MatchingSnapshot};
use crate::peers::{Peer, PeerDirectory};
use crate::port::PortManager;
use crate::relay::{LoginParameters, RelayClient, RelayError, RelaySnapshot};
use crate::savestate::{self, SaveStateError};
use crate::socket::{PdpLayer, SocketError, SocketMeta, SocketOwner, SocketRegistry, SocketShim};
use crate::syscalls::{InetSyscalls, MatchingSyscalls};

/// Everything a save state records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetSnapshot {
    pub last_socket_id: i32,
    pub sockets: Vec<(i32, SocketMeta)>,
    pub peers: Vec<Peer>,
    pub relay: Option<RelaySnapshot>,
    pub matching: MatchingSnapshot,
}

#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error(transparent)]
    SaveState(#[from] SaveStateError),
    #[error("failed to restore socket: {0}")]
    Socket(#[from] SocketError),
    #[error("failed to restore relay session: {0}")]
    Relay(#[from] RelayError),
    #[error("failed to restore matching contexts: {0}")]
    Matching(#[from] MatchingError),
}

pub struct NetStack {
    login: LoginParameters,
    shim: Arc<SocketShim>,
    peers: Arc<PeerDirectory>,
    pdp: Arc<PdpLayer>,
    relay: RelayClient,
    matching: Arc<MatchingEngine>,
    inet: InetSyscalls,
    matching_calls: MatchingSyscalls,
    handler: Arc<dyn MatchingHandler>,
}

impl NetStack {
    /// Build the stack from configuration
    ///
    /// `handler` receives the events of every matching context, including
    /// those recreated by [`NetStack::load_state`].
    pub fn new(
        config: &NetConfig,
        ports: Arc<dyn PortManager>,
        clock: SharedClock,
        handler: Arc<dyn MatchingHandler>,
    ) -> Result<Self> {
        let login = config.login()?;
        let shim = Arc::new(SocketShim::new(
            Arc::new(SocketRegistry::new()),
            ports,
            config.shim_settings()?,
        ));
        let peers = Arc::new(PeerDirectory::new());
        let pdp = Arc::new(PdpLayer::new(
            Arc::clone(&shim),
            Arc::clone(&peers),
            login.mac,
            config.network.port_offset,
        ));
        let relay = RelayClient::new(
            Arc::clone(&shim),
            Arc::clone(&peers),
            Arc::clone(&clock),
            config.relay_settings(),
        );
        let matching = Arc::new(MatchingEngine::new(
            Arc::clone(&pdp),
            Arc::clone(&peers),
            clock,
            config.matching_settings(),
        ));
        let delays = config.syscall_delays();

        tracing::info!(
            mac = %login.mac,
            nickname = %login.nickname,
            port_offset = config.network.port_offset,
            "network stack ready"
        );
        Ok(Self {
            inet: InetSyscalls::new(Arc::clone(&shim), delays),
            matching_calls: MatchingSyscalls::new(Arc::clone(&matching), delays),
            login,
            shim,
            peers,
            pdp,
            relay,
            matching,
            handler,
        })
    }

    pub fn local_mac(&self) -> MacAddr {
        self.login.mac
    }

    pub fn shim(&self) -> &Arc<SocketShim> {
        &self.shim
    }

    pub fn peers(&self) -> &Arc<PeerDirectory> {
        &self.peers
    }

    pub fn pdp(&self) -> &Arc<PdpLayer> {
        &self.pdp
    }

    pub fn relay(&self) -> &RelayClient {
        &self.relay
    }

    pub fn relay_mut(&mut self) -> &mut RelayClient {
        &mut self.relay
    }

    pub fn matching(&self) -> &Arc<MatchingEngine> {
        &self.matching
    }

    pub fn inet(&self) -> &InetSyscalls {
        &self.inet
    }

    pub fn matching_syscalls(&self) -> &MatchingSyscalls {
        &self.matching_calls
    }

    pub fn handler(&self) -> &Arc<dyn MatchingHandler> {
        &self.handler
    }

    /// Log in to the relay server with the configured identity
    pub fn connect_relay(&mut self) -> Result<(), RelayError> {
        self.relay.init(self.login.clone())
    }

    /// Stop every worker and close every socket
    pub fn shutdown(&mut self) {
        self.matching.term();
        if self.relay.is_initialized() {
            self.relay.term();
        }
        let ids = self.shim.registry().ids();
        for id in &ids {
            let _ = self.shim.close(*id);
        }
        if !ids.is_empty() {
            tracing::debug!(count = ids.len(), "closed remaining sockets");
        }
    }

    // ========================================================================
    // Save states
    // ========================================================================

    pub fn snapshot(&self) -> NetSnapshot {
        let relay_socket = self.relay.socket_id();
        let sockets = self
            .shim
            .registry()
            .snapshot()
            .into_iter()
            .filter(|(id, meta)| meta.owner == SocketOwner::Inet && Some(*id) != relay_socket)
            .collect();
        NetSnapshot {
            last_socket_id: self.shim.registry().last_id(),
            sockets,
            peers: self.peers.snapshot(),
            relay: self.relay.snapshot(),
            matching: self.matching.snapshot(),
        }
    }

    pub fn save_state(&self) -> Result<Vec<u8>, SaveStateError> {
        let snapshot = self.snapshot();
        let blob = savestate::encode(&snapshot)?;
        tracing::info!(
            bytes = blob.len(),
            sockets = snapshot.sockets.len(),
            contexts = snapshot.matching.contexts.len(),
            "network state saved"
        );
        Ok(blob)
    }

    /// Replace the live state with a saved one
    ///
    /// The blob is validated before anything is torn down. A relay server
    /// that cannot be reached leaves the session logged out instead of
    /// failing the whole load.
    pub fn load_state(&mut self, data: &[u8]) -> Result<(), StackError> {
        let snapshot: NetSnapshot = savestate::decode(data)?;
        self.restore(snapshot)
    }

    pub fn restore(&mut self, snapshot: NetSnapshot) -> Result<(), StackError> {
        self.shutdown();

        for (id, meta) in snapshot.sockets {
            self.shim.restore(id, meta)?;
        }
        self.shim.registry().set_last_id(snapshot.last_socket_id);

        // Peers first, so replies to the relay's rejoin land on top of them
        self.peers.replace_all(snapshot.peers);
        if let Some(relay) = snapshot.relay {
            if let Err(e) = self.relay.restore(relay) {
                tracing::warn!(error = %e, "relay session not restored");
            }
        }

        self.matching
            .restore(snapshot.matching, Arc::clone(&self.handler))?;
        tracing::info!(
            sockets = self.shim.registry().len(),
            peers = self.peers.count(),
            "network state loaded"
        );
        Ok(())
    }
}

impl Drop for NetStack {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Duration;

    use super::*;
    use crate::clock::SystemClock;
    use crate::matching::{ContextParams, MatchingMode, NotificationQueue};
    use crate::relay::{AdhocctlState, RelayServer};
    use crate::test_utils::{RecordingPortManager, init_test_logging, wait_until};
    use crate::translate::guest;

    const WAIT: Duration = Duration::from_secs(3);

    fn config(relay_port: u16, port_offset: u16) -> NetConfig {
        let mut config = NetConfig::default();
        config.relay.server = "127.0.0.1".into();
        config.relay.port = relay_port;
        config.relay.keepalive_interval_ms = 50;
        config.identity.mac = Some("02:00:00:00:7e:01".into());
        config.network.route_probe = "127.0.0.1:9".into();
        config.network.port_offset = port_offset;
        config
    }

    fn stack(config: &NetConfig) -> NetStack {
        init_test_logging();
        NetStack::new(
            config,
            Arc::new(RecordingPortManager::default()),
            SystemClock::shared(),
            Arc::new(NotificationQueue::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_identity_from_config() {
        let stack = stack(&config(1, 0));
        assert_eq!(stack.local_mac(), "02:00:00:00:7e:01".parse().unwrap());
        assert_eq!(stack.pdp().local_mac(), stack.local_mac());
    }

    #[test]
    fn test_inet_sockets_survive_load() {
        let mut stack = stack(&config(1, 0));
        let id = stack
            .shim()
            .create(guest::AF_INET, guest::SOCK_DGRAM, guest::IPPROTO_UDP)
            .unwrap();
        let bound = stack
            .shim()
            .bind(id, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
            .unwrap();
        let blob = stack.save_state().unwrap();

        stack.shim().close(id).unwrap();
        let other = stack
            .shim()
            .create(guest::AF_INET, guest::SOCK_STREAM, guest::IPPROTO_TCP)
            .unwrap();

        stack.load_state(&blob).unwrap();
        assert_eq!(stack.shim().registry().ids(), vec![id]);
        assert!(!stack.shim().registry().contains(other));
        assert_eq!(stack.shim().local_addr(id).unwrap(), bound);

        // Ids keep counting from where the save left off
        let next = stack
            .shim()
            .create(guest::AF_INET, guest::SOCK_DGRAM, guest::IPPROTO_UDP)
            .unwrap();
        assert_eq!(next, id + 1);
    }

    #[test]
    fn test_damaged_state_leaves_stack_untouched() {
        let mut stack = stack(&config(1, 0));
        let id = stack
            .shim()
            .create(guest::AF_INET, guest::SOCK_DGRAM, guest::IPPROTO_UDP)
            .unwrap();
        let mut blob = stack.save_state().unwrap();
        blob[0] = 0;

        assert!(matches!(
            stack.load_state(&blob),
            Err(StackError::SaveState(SaveStateError::BadMagic))
        ));
        assert!(stack.shim().registry().contains(id));
    }

    #[test]
    fn test_relay_and_matching_survive_load() {
        let server = RelayServer::bind("127.0.0.1:0".parse().unwrap())
            .unwrap()
            .spawn()
            .unwrap();
        let offset = 52_000 + (std::process::id() % 400) as u16 * 10;
        let mut stack = stack(&config(server.local_addr().port(), offset));

        stack.connect_relay().unwrap();
        stack.relay().connect("SAVEGRP").unwrap();
        assert!(wait_until(WAIT, || stack.relay().state() == AdhocctlState::Connected));

        stack.matching().init(8192).unwrap();
        let ctx = stack
            .matching()
            .create(
                ContextParams {
                    mode: MatchingMode::Parent as i32,
                    max_peers: 4,
                    port: 7,
                    rx_buflen: 512,
                    hello_int_us: 200_000,
                    keepalive_int_us: 200_000,
                    init_count: 3,
                    rexmt_int_us: 100_000,
                },
                Arc::clone(stack.handler()),
            )
            .unwrap();
        stack.matching().start(ctx, b"room").unwrap();
        let remembered = Peer {
            nickname: "Away".into(),
            mac: "02:00:00:00:7e:09".parse().unwrap(),
            ip: Ipv4Addr::new(10, 0, 0, 9),
            port_offset: 0,
            last_recv_us: 1,
        };
        stack.peers().add(remembered.clone());

        let blob = stack.save_state().unwrap();
        let saved = savestate::decode::<NetSnapshot>(&blob).unwrap();
        // Only guest inet sockets are recorded
        assert!(saved.sockets.is_empty());

        stack.load_state(&blob).unwrap();
        assert!(stack.relay().is_initialized());
        assert_eq!(stack.relay().state(), AdhocctlState::Connected);
        assert_eq!(stack.relay().group().as_deref(), Some("SAVEGRP"));
        // The server never heard of this peer; the saved directory still wins
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(stack.peers().find_by_mac(remembered.mac), Some(remembered));
        assert_eq!(stack.matching().context_ids(), vec![ctx]);
        assert_eq!(stack.matching().get_hello_opt(ctx).unwrap(), b"room");
        assert_eq!(
            stack.matching().get_members(ctx).unwrap(),
            vec![stack.local_mac()]
        );

        stack.shutdown();
        assert!(stack.shim().registry().is_empty());
    }
}
