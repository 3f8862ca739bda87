//! Matching context state
//!
//! Everything here is plain data plus the membership rules that the guest
//! API and the input worker share. Locks and threads live in
//! [`MatchingContext`]; [`ContextState`] itself is serializable so a running
//! room survives a save state.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::JoinHandle;

use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::handler::MatchingHandler;
use super::types::{MatchingEvent, MatchingMode, MatchingNotification, PeerState};
use crate::mac::MacAddr;

/// Fixed parameters of a context, validated at creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    pub mode: MatchingMode,
    pub max_peers: u32,
    pub port: u16,
    pub rx_buflen: usize,
    pub hello_int_us: u64,
    pub keepalive_int_us: u64,
    /// Send attempts before a command is given up
    pub resend_counter: u32,
    pub resend_int_us: u64,
    /// Silence after which an established member times out
    pub timeout_us: u64,
}

/// One member of the room as seen locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub mac: MacAddr,
    pub state: PeerState,
    /// A bulk transfer to this member is queued
    pub sending: bool,
    /// Last sign of life; 0 marks a member due for removal
    pub last_ping_us: u64,
}

fn established(mode: MatchingMode, state: PeerState) -> bool {
    matches!(
        (mode, state),
        (MatchingMode::Parent, PeerState::Child)
            | (MatchingMode::Child, PeerState::Parent)
            | (MatchingMode::P2P, PeerState::P2P)
    )
}

/// A command waiting for the input worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub opcode: u8,
    pub mac: MacAddr,
    pub payload: Vec<u8>,
    pub attempts: u32,
    pub last_attempt_us: u64,
}

impl ThreadMessage {
    pub fn new(opcode: u8, mac: MacAddr, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            mac,
            payload,
            attempts: 0,
            last_attempt_us: 0,
        }
    }
}

/// Mutable state of one context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextState {
    pub config: ContextConfig,
    pub local_mac: MacAddr,
    pub hello: Vec<u8>,
    /// Members in the order they became known
    pub members: Vec<Member>,
    /// Guest port each member last sent from
    pub peer_ports: HashMap<MacAddr, u16>,
    pub running: bool,
    /// PDP socket while running
    pub socket: Option<i32>,
}

impl ContextState {
    pub fn new(config: ContextConfig, local_mac: MacAddr) -> Self {
        Self {
            config,
            local_mac,
            hello: Vec::new(),
            members: Vec::new(),
            peer_ports: HashMap::new(),
            running: false,
            socket: None,
        }
    }

    pub fn mode(&self) -> MatchingMode {
        self.config.mode
    }

    pub fn find(&self, mac: MacAddr) -> Option<&Member> {
        self.members.iter().find(|m| m.mac == mac)
    }

    pub fn find_mut(&mut self, mac: MacAddr) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| m.mac == mac)
    }

    fn find_state(&self, state: PeerState) -> Option<&Member> {
        self.members.iter().find(|m| m.state == state)
    }

    pub fn parent(&self) -> Option<&Member> {
        self.find_state(PeerState::Parent)
    }

    pub fn p2p_partner(&self) -> Option<&Member> {
        self.find_state(PeerState::P2P)
    }

    pub fn outgoing_request(&self) -> Option<&Member> {
        self.find_state(PeerState::OutgoingRequest)
    }

    pub fn children(&self) -> usize {
        self.members
            .iter()
            .filter(|m| m.state == PeerState::Child)
            .count()
    }

    /// Room size including the local player
    pub fn connected_count(&self) -> usize {
        match self.mode() {
            MatchingMode::Parent => self.children() + 1,
            MatchingMode::Child => {
                if self.parent().is_some() {
                    1 + self.children() + 1
                } else {
                    1
                }
            }
            MatchingMode::P2P => 1 + usize::from(self.p2p_partner().is_some()),
        }
    }

    /// Whether the room still advertises itself
    pub fn has_free_slot(&self) -> bool {
        match self.mode() {
            MatchingMode::Parent => self.children() + 1 < self.config.max_peers as usize,
            MatchingMode::P2P => self.p2p_partner().is_none(),
            MatchingMode::Child => false,
        }
    }

    /// Whether this member is part of the established room
    pub fn is_established(&self, member: &Member) -> bool {
        established(self.mode(), member.state)
    }

    /// Insert a member, or reset the existing entry to `state`
    pub fn upsert(&mut self, mac: MacAddr, state: PeerState, now_us: u64) -> &mut Member {
        let index = match self.members.iter().position(|m| m.mac == mac) {
            Some(index) => {
                let member = &mut self.members[index];
                member.state = state;
                member.sending = false;
                member.last_ping_us = now_us;
                index
            }
            None => {
                self.members.push(Member {
                    mac,
                    state,
                    sending: false,
                    last_ping_us: now_us,
                });
                self.members.len() - 1
            }
        };
        &mut self.members[index]
    }

    pub fn remove(&mut self, mac: MacAddr) -> Option<Member> {
        let index = self.members.iter().position(|m| m.mac == mac)?;
        Some(self.members.remove(index))
    }

    /// Drop unfinished handshakes that went quiet and hand back the
    /// established members that did
    ///
    /// Returned members move to `CancelInProgress` with a fresh timestamp,
    /// so each silence is reported once and the member stays findable until
    /// the queued teardown runs.
    pub fn sweep_timeouts(&mut self, now_us: u64) -> Vec<MacAddr> {
        let timeout = self.config.timeout_us;
        let mode = self.mode();
        let mut expired = Vec::new();
        self.members.retain_mut(|member| {
            if now_us.saturating_sub(member.last_ping_us) <= timeout {
                return true;
            }
            if established(mode, member.state) {
                member.state = PeerState::CancelInProgress;
                member.last_ping_us = now_us;
                expired.push(member.mac);
                return true;
            }
            !matches!(
                member.state,
                PeerState::Offer
                    | PeerState::IncomingRequest
                    | PeerState::OutgoingRequest
                    | PeerState::CancelInProgress
            )
        });
        expired
    }

    pub fn clear_members(&mut self) {
        self.members.clear();
    }

    /// After an accept, forget everything that is not part of the room
    pub fn retain_established(&mut self) {
        self.members.retain(|m| {
            matches!(
                m.state,
                PeerState::Child | PeerState::P2P | PeerState::Parent | PeerState::Local
            )
        });
    }

    /// Guest port to address `mac` on
    pub fn port_for(&self, mac: MacAddr) -> u16 {
        self.peer_ports
            .get(&mac)
            .copied()
            .unwrap_or(self.config.port)
    }

    /// Children other than `except`, in join order
    pub fn children_except(&self, except: MacAddr) -> Vec<MacAddr> {
        self.members
            .iter()
            .filter(|m| m.state == PeerState::Child && m.mac != except)
            .map(|m| m.mac)
            .collect()
    }

    /// Member list as reported to the guest
    ///
    /// The local player comes first unless it is a child inside a room, then
    /// the parent or partner, then children in join order (a child's own
    /// entry sits among them at the position it joined).
    pub fn member_list(&self) -> Vec<MacAddr> {
        let count = self.connected_count();
        let mut list = Vec::with_capacity(count);
        if count == 1 || self.mode() != MatchingMode::Child {
            list.push(self.local_mac);
        }
        match self.mode() {
            MatchingMode::P2P => {
                if let Some(partner) = self.p2p_partner() {
                    list.push(partner.mac);
                }
            }
            mode => {
                if let Some(parent) = self.parent() {
                    list.push(parent.mac);
                }
                for member in &self.members {
                    let listed = match member.state {
                        PeerState::Child => true,
                        PeerState::Local => mode == MatchingMode::Child,
                        _ => false,
                    };
                    if listed {
                        list.push(member.mac);
                    }
                }
            }
        }
        list
    }
}

/// Snapshot of a context and both of its queues
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub id: i32,
    pub state: ContextState,
    pub inputs: Vec<ThreadMessage>,
    pub events: Vec<MatchingNotification>,
}

/// A context shared between the guest API and its two workers
///
/// Lock order is `state` before either queue; workers never hold a lock
/// across socket I/O.
pub struct MatchingContext {
    pub(crate) id: i32,
    pub(crate) state: Mutex<ContextState>,
    pub(crate) inputs: Mutex<VecDeque<ThreadMessage>>,
    pub(crate) events: Mutex<VecDeque<MatchingNotification>>,
    pub(crate) handler: Arc<dyn MatchingHandler>,
    pub(crate) input_running: AtomicBool,
    pub(crate) event_running: AtomicBool,
    pub(crate) workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MatchingContext {
    pub(crate) fn new(id: i32, state: ContextState, handler: Arc<dyn MatchingHandler>) -> Self {
        Self {
            id,
            state: Mutex::new(state),
            inputs: Mutex::new(VecDeque::new()),
            events: Mutex::new(VecDeque::new()),
            handler,
            input_running: AtomicBool::new(false),
            event_running: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub(crate) fn spawn_event(&self, event: MatchingEvent, mac: MacAddr, opt: Vec<u8>) {
        tracing::debug!(id = self.id, ?event, %mac, optlen = opt.len(), "matching event");
        self.events.lock().push_back(MatchingNotification {
            matching_id: self.id,
            event,
            mac,
            opt,
        });
    }

    pub(crate) fn enqueue(&self, opcode: u8, mac: MacAddr, payload: Vec<u8>) {
        self.inputs
            .lock()
            .push_back(ThreadMessage::new(opcode, mac, payload));
    }

    pub(crate) fn snapshot(&self) -> ContextSnapshot {
        let state = self.state.lock().clone();
        ContextSnapshot {
            id: self.id,
            state,
            inputs: self.inputs.lock().iter().cloned().collect(),
            events: self.events.lock().iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> MacAddr {
        MacAddr([0x02, 0, 0, 0, 0, last])
    }

    fn state(mode: MatchingMode) -> ContextState {
        ContextState::new(
            ContextConfig {
                mode,
                max_peers: 4,
                port: 1,
                rx_buflen: 512,
                hello_int_us: 100_000,
                keepalive_int_us: 100_000,
                resend_counter: 3,
                resend_int_us: 50_000,
                timeout_us: 1_000_000,
            },
            mac(0xaa),
        )
    }

    #[test]
    fn test_parent_counts_and_slots() {
        let mut s = state(MatchingMode::Parent);
        assert_eq!(s.connected_count(), 1);
        assert!(s.has_free_slot());
        for i in 1..=3 {
            s.upsert(mac(i), PeerState::Child, 10);
        }
        s.upsert(mac(9), PeerState::IncomingRequest, 10);
        assert_eq!(s.children(), 3);
        assert_eq!(s.connected_count(), 4);
        assert!(!s.has_free_slot());
        assert_eq!(s.member_list(), vec![mac(0xaa), mac(1), mac(2), mac(3)]);
        assert_eq!(s.children_except(mac(2)), vec![mac(1), mac(3)]);
    }

    #[test]
    fn test_child_member_list_order() {
        let mut s = state(MatchingMode::Child);
        assert_eq!(s.member_list(), vec![mac(0xaa)]);

        s.upsert(mac(1), PeerState::Parent, 10);
        s.upsert(mac(2), PeerState::Child, 10);
        s.upsert(mac(0xaa), PeerState::Local, 10);
        s.upsert(mac(3), PeerState::Child, 10);
        assert_eq!(s.connected_count(), 4);
        assert_eq!(s.member_list(), vec![mac(1), mac(2), mac(0xaa), mac(3)]);
    }

    #[test]
    fn test_p2p_partner() {
        let mut s = state(MatchingMode::P2P);
        s.upsert(mac(1), PeerState::Offer, 10);
        assert!(s.has_free_slot());
        assert_eq!(s.connected_count(), 1);
        s.upsert(mac(1), PeerState::P2P, 20);
        assert!(!s.has_free_slot());
        assert_eq!(s.member_list(), vec![mac(0xaa), mac(1)]);
        assert!(s.is_established(s.find(mac(1)).unwrap()));
    }

    #[test]
    fn test_retain_established_and_ports() {
        let mut s = state(MatchingMode::Child);
        s.upsert(mac(1), PeerState::Offer, 10);
        s.upsert(mac(2), PeerState::Parent, 10);
        s.upsert(mac(3), PeerState::CancelInProgress, 10);
        s.retain_established();
        assert_eq!(s.members.len(), 1);
        assert_eq!(s.parent().unwrap().mac, mac(2));

        assert_eq!(s.port_for(mac(2)), 1);
        s.peer_ports.insert(mac(2), 7);
        assert_eq!(s.port_for(mac(2)), 7);
    }

    #[test]
    fn test_sweep_reports_each_silent_member_once() {
        let mut s = state(MatchingMode::Parent);
        s.upsert(mac(1), PeerState::Child, 10);
        s.upsert(mac(2), PeerState::Child, 1_500_000);
        s.upsert(mac(3), PeerState::IncomingRequest, 10);

        assert_eq!(s.sweep_timeouts(2_000_000), vec![mac(1)]);
        assert_eq!(s.find(mac(1)).unwrap().state, PeerState::CancelInProgress);
        assert!(s.find(mac(3)).is_none());
        assert_eq!(s.children_except(mac(0xaa)), vec![mac(2)]);

        // Still silent on the next passes, but already being torn down
        assert!(s.sweep_timeouts(2_100_000).is_empty());
        assert!(s.sweep_timeouts(2_400_000).is_empty());
        assert!(s.find(mac(1)).is_some());

        // Left over once a full timeout passes without the teardown
        assert_eq!(s.sweep_timeouts(3_100_000), vec![mac(2)]);
        assert!(s.find(mac(1)).is_none());
    }
}
