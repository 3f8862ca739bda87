//! Relay server
//!
//! Minimal lobby server for the relay protocol, used by the `adhoc-relay`
//! tool and by loopback tests. Every user holds one TCP control connection;
//! the server tracks which group each user joined and tells group members
//! about each other.
//!
//! ```text
//!  user A ──LOGIN──►┐
//!  user A ──CONNECT("GRP")──► server ──CONNECT_BSSID(founder)──► A
//!  user B ──CONNECT("GRP")──► server ──CONNECT(A)──► B
//!                                     ──CONNECT(B)──► A
//!                                     ──CONNECT_BSSID(A)──► B
//! ```

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use hashbrown::HashMap;

use super::packets::{self, ClientPacket, ServerPacket};
use crate::mac::MacAddr;

/// Users silent for this long are dropped
pub const USER_TIMEOUT: Duration = Duration::from_secs(15);

const TICK: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
struct Identity {
    mac: MacAddr,
    nickname: String,
    product: String,
}

struct User {
    stream: TcpStream,
    ip: Ipv4Addr,
    rx: Vec<u8>,
    tx: Vec<u8>,
    identity: Option<Identity>,
    group: Option<String>,
    last_seen: Instant,
}

/// Group key: product code plus group name
type GroupKey = (String, String);

/// Relay lobby state plus its listener
pub struct RelayServer {
    listener: TcpListener,
    users: HashMap<u64, User>,
    /// Founder MAC per group, reported as the group's BSSID
    groups: HashMap<GroupKey, MacAddr>,
    next_user: u64,
    timeout: Duration,
}

impl RelayServer {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        tracing::info!(addr = %listener.local_addr()?, "relay server listening");
        Ok(Self {
            listener,
            users: HashMap::new(),
            groups: HashMap::new(),
            next_user: 1,
            timeout: USER_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Serve until `running` is cleared
    pub fn run(&mut self, running: &AtomicBool) {
        while running.load(Ordering::SeqCst) {
            self.tick();
            thread::sleep(TICK);
        }
        tracing::info!(users = self.users.len(), "relay server stopped");
    }

    /// Move the server onto a background thread
    pub fn spawn(mut self) -> io::Result<RelayServerHandle> {
        let addr = self.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name("relay-server".into())
            .spawn(move || self.run(&flag))?;
        Ok(RelayServerHandle {
            addr,
            running,
            thread: Some(thread),
        })
    }

    /// One accept/read/dispatch/flush pass
    pub fn tick(&mut self) {
        self.accept_users();

        let ids: Vec<u64> = self.users.keys().copied().collect();
        for id in ids {
            if let Err(reason) = self.read_user(id) {
                self.drop_user(id, &reason);
            }
        }

        let now = Instant::now();
        let stale: Vec<u64> = self
            .users
            .iter()
            .filter(|(_, user)| now.duration_since(user.last_seen) > self.timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            self.drop_user(id, "timed out");
        }

        let mut broken = Vec::new();
        for (id, user) in self.users.iter_mut() {
            if let Err(e) = flush(user) {
                broken.push((*id, e.to_string()));
            }
        }
        for (id, reason) in broken {
            self.drop_user(id, &reason);
        }
    }

    fn accept_users(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let ip = match addr {
                        SocketAddr::V4(v4) => *v4.ip(),
                        SocketAddr::V6(_) => continue,
                    };
                    if let Err(e) = stream.set_nonblocking(true) {
                        tracing::warn!(%addr, error = %e, "rejecting connection");
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    let id = self.next_user;
                    self.next_user += 1;
                    tracing::debug!(id, %addr, "user connected");
                    self.users.insert(
                        id,
                        User {
                            stream,
                            ip,
                            rx: Vec::new(),
                            tx: Vec::new(),
                            identity: None,
                            group: None,
                            last_seen: Instant::now(),
                        },
                    );
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn read_user(&mut self, id: u64) -> Result<(), String> {
        let mut chunk = [0u8; 1024];
        let mut received = Vec::new();
        {
            let Some(user) = self.users.get_mut(&id) else {
                return Ok(());
            };
            loop {
                match user.stream.read(&mut chunk) {
                    Ok(0) => return Err("connection closed".into()),
                    Ok(n) => {
                        user.rx.extend_from_slice(&chunk[..n]);
                        user.last_seen = Instant::now();
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e.to_string()),
                }
            }

            let mut consumed = 0;
            while consumed < user.rx.len() {
                match ClientPacket::decode(&user.rx[consumed..]) {
                    Ok(Some((packet, len))) => {
                        received.push(packet);
                        consumed += len;
                    }
                    Ok(None) => break,
                    Err(e) => return Err(e.to_string()),
                }
            }
            user.rx.drain(..consumed);
        }

        for packet in received {
            self.handle(id, packet)?;
        }
        Ok(())
    }

    fn handle(&mut self, id: u64, packet: ClientPacket) -> Result<(), String> {
        match packet {
            ClientPacket::Ping => Ok(()),
            ClientPacket::Login {
                mac,
                nickname,
                product,
            } => {
                if !packets::is_valid_product_code(&product) {
                    return Err(format!("invalid product code '{}'", product));
                }
                if let Some(user) = self.users.get_mut(&id) {
                    tracing::info!(id, %mac, nickname = %nickname, product = %product, "user logged in");
                    user.identity = Some(Identity {
                        mac,
                        nickname,
                        product,
                    });
                }
                Ok(())
            }
            ClientPacket::Connect { group } => {
                if !packets::is_valid_group_name(&group) {
                    return Err(format!("invalid group name '{}'", group));
                }
                self.join_group(id, group);
                Ok(())
            }
            ClientPacket::Disconnect => {
                self.leave_group(id);
                Ok(())
            }
            ClientPacket::Scan => {
                self.scan(id);
                Ok(())
            }
            ClientPacket::Chat { message } => {
                self.chat(id, message);
                Ok(())
            }
        }
    }

    fn identity(&self, id: u64) -> Option<(Identity, Ipv4Addr, Option<String>)> {
        let user = self.users.get(&id)?;
        Some((user.identity.clone()?, user.ip, user.group.clone()))
    }

    /// Logged-in users sharing `id`'s product and group
    fn group_members(&self, id: u64, product: &str, group: &str) -> Vec<u64> {
        self.users
            .iter()
            .filter(|(other, user)| {
                **other != id
                    && user.group.as_deref() == Some(group)
                    && user
                        .identity
                        .as_ref()
                        .is_some_and(|identity| identity.product == product)
            })
            .map(|(other, _)| *other)
            .collect()
    }

    fn queue(&mut self, id: u64, packet: &ServerPacket) {
        if let Some(user) = self.users.get_mut(&id) {
            user.tx.extend_from_slice(&packet.to_bytes());
        }
    }

    fn join_group(&mut self, id: u64, group: String) {
        let Some((identity, ip, current)) = self.identity(id) else {
            tracing::warn!(id, "group join before login");
            return;
        };
        if current.is_some() {
            self.leave_group(id);
        }

        for other in self.group_members(id, &identity.product, &group) {
            let Some((other_identity, other_ip, _)) = self.identity(other) else {
                continue;
            };
            self.queue(
                id,
                &ServerPacket::Connect {
                    nickname: other_identity.nickname,
                    mac: other_identity.mac,
                    ip: other_ip,
                },
            );
            self.queue(
                other,
                &ServerPacket::Connect {
                    nickname: identity.nickname.clone(),
                    mac: identity.mac,
                    ip,
                },
            );
        }

        let founder = *self
            .groups
            .entry((identity.product.clone(), group.clone()))
            .or_insert(identity.mac);
        self.queue(id, &ServerPacket::ConnectBssid { mac: founder });
        if let Some(user) = self.users.get_mut(&id) {
            user.group = Some(group.clone());
        }
        tracing::info!(id, group = %group, bssid = %founder, "user joined group");
    }

    fn leave_group(&mut self, id: u64) {
        let Some((identity, ip, Some(group))) = self.identity(id) else {
            return;
        };
        let members = self.group_members(id, &identity.product, &group);
        for other in &members {
            self.queue(*other, &ServerPacket::Disconnect { ip });
        }
        if members.is_empty() {
            self.groups.remove(&(identity.product.clone(), group.clone()));
        }
        if let Some(user) = self.users.get_mut(&id) {
            user.group = None;
        }
        tracing::info!(id, group = %group, "user left group");
    }

    fn scan(&mut self, id: u64) {
        let Some((identity, _, _)) = self.identity(id) else {
            return;
        };
        let mut found: Vec<(String, MacAddr)> = self
            .groups
            .iter()
            .filter(|((product, _), _)| *product == identity.product)
            .map(|((_, group), mac)| (group.clone(), *mac))
            .collect();
        found.sort();
        for (group, mac) in found {
            self.queue(id, &ServerPacket::Scan { group, mac });
        }
        self.queue(id, &ServerPacket::ScanComplete);
    }

    fn chat(&mut self, id: u64, message: String) {
        let Some((identity, _, Some(group))) = self.identity(id) else {
            return;
        };
        let packet = ServerPacket::Chat {
            message,
            nickname: identity.nickname.clone(),
        };
        for other in self.group_members(id, &identity.product, &group) {
            self.queue(other, &packet);
        }
    }

    fn drop_user(&mut self, id: u64, reason: &str) {
        self.leave_group(id);
        if self.users.remove(&id).is_some() {
            tracing::debug!(id, reason, "user dropped");
        }
    }
}

fn flush(user: &mut User) -> io::Result<()> {
    while !user.tx.is_empty() {
        match user.stream.write(&user.tx) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => {
                user.tx.drain(..n);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Handle to a server running on its own thread; stops it on drop
pub struct RelayServerHandle {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RelayServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RelayServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
