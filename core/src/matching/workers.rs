//! Per-context worker threads
//!
//! ```text
//!  matching-input-{id}                        matching-event-{id}
//!  every iteration:                           every iteration:
//!   1. HELLO broadcast (hello_int)             drain events ──► handler
//!   2. timeout sweep + PING (keepalive_int)
//!   3. drain input queue (with resends)
//!   4. receive + act on datagrams
//!  on stop: flush queue, BYE to the room      on stop: deliver the rest
//! ```

use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

use super::context::{ContextState, MatchingContext, ThreadMessage};
use super::engine::MatchingSettings;
use super::packets::{
    MatchingPacket, OPCODE_ACCEPT, OPCODE_BIRTH, OPCODE_BULK, OPCODE_BULK_ABORT, OPCODE_CANCEL,
    OPCODE_DEATH, OPCODE_JOIN,
};
use super::types::{MatchingEvent, MatchingMode, PeerState};
use crate::clock::SharedClock;
use crate::mac::MacAddr;
use crate::peers::PeerDirectory;
use crate::socket::{AdhocError, PdpLayer};

/// Shared services every worker needs
#[derive(Clone)]
pub(crate) struct WorkerRuntime {
    pub pdp: Arc<PdpLayer>,
    pub peers: Arc<PeerDirectory>,
    pub clock: SharedClock,
    pub settings: MatchingSettings,
}

/// Launch the input and event workers of a started context
pub(crate) fn spawn(ctx: &Arc<MatchingContext>, runtime: &WorkerRuntime) -> io::Result<()> {
    let rx_buflen = ctx.state.lock().config.rx_buflen;
    ctx.input_running.store(true, Ordering::SeqCst);
    ctx.event_running.store(true, Ordering::SeqCst);

    let input = InputWorker {
        ctx: Arc::clone(ctx),
        rt: runtime.clone(),
        rx: vec![0u8; rx_buflen],
        last_hello_us: 0,
        last_ping_us: 0,
    };
    let input = thread::Builder::new()
        .name(format!("matching-input-{}", ctx.id))
        .spawn(move || input.run())?;

    let event = EventWorker {
        ctx: Arc::clone(ctx),
        rt: runtime.clone(),
    };
    let event = thread::Builder::new()
        .name(format!("matching-event-{}", ctx.id))
        .spawn(move || event.run());
    match event {
        Ok(event) => {
            ctx.workers.lock().extend([input, event]);
            Ok(())
        }
        Err(e) => {
            ctx.input_running.store(false, Ordering::SeqCst);
            ctx.event_running.store(false, Ordering::SeqCst);
            let _ = input.join();
            Err(e)
        }
    }
}

// ============================================================================
// Input worker
// ============================================================================

struct InputWorker {
    ctx: Arc<MatchingContext>,
    rt: WorkerRuntime,
    rx: Vec<u8>,
    last_hello_us: u64,
    last_ping_us: u64,
}

impl InputWorker {
    fn run(mut self) {
        tracing::debug!(id = self.ctx.id, "matching input worker started");
        while self.ctx.input_running.load(Ordering::SeqCst) {
            self.tick();
            thread::sleep(self.rt.settings.worker_sleep);
        }
        self.shutdown();
        tracing::debug!(id = self.ctx.id, "matching input worker stopped");
    }

    fn tick(&mut self) {
        let now = self.rt.clock.now_us();
        let (hello, keepalive_due) = {
            let state = self.ctx.state.lock();
            let hello_int = state.config.hello_int_us;
            let hello = (state.has_free_slot()
                && hello_int > 0
                && now.saturating_sub(self.last_hello_us) >= hello_int)
                .then(|| state.hello.clone());
            let keepalive_due =
                now.saturating_sub(self.last_ping_us) >= state.config.keepalive_int_us;
            (hello, keepalive_due)
        };

        if let Some(opt) = hello {
            self.broadcast(&MatchingPacket::Hello { opt });
            self.last_hello_us = now;
        }
        if keepalive_due {
            self.handle_timeouts(now);
            self.broadcast(&MatchingPacket::Ping);
            self.last_ping_us = now;
        }
        self.drain_inputs(now, false);
        self.receive(now);
    }

    fn socket(&self) -> Option<i32> {
        self.ctx.state.lock().socket
    }

    /// Send to every active peer in the directory
    fn broadcast(&self, packet: &MatchingPacket) {
        let targets: Vec<(MacAddr, u16)> = {
            let state = self.ctx.state.lock();
            self.rt
                .peers
                .active_snapshot()
                .into_iter()
                .map(|peer| (peer.mac, state.port_for(peer.mac)))
                .collect()
        };
        let Some(socket) = self.socket() else {
            return;
        };
        let bytes = packet.to_bytes();
        for (mac, port) in targets {
            if let Err(e) = self.rt.pdp.send(socket, mac, port, &bytes) {
                tracing::trace!(id = self.ctx.id, %mac, error = %e, "broadcast send failed");
            }
        }
    }

    fn send(&self, mac: MacAddr, packet: &MatchingPacket) -> Result<(), AdhocError> {
        let (socket, port) = {
            let state = self.ctx.state.lock();
            (state.socket, state.port_for(mac))
        };
        let socket = socket.ok_or(AdhocError::InvalidSocketId(-1))?;
        self.rt.pdp.send(socket, mac, port, &packet.to_bytes())?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Timeouts
    // ------------------------------------------------------------------------

    fn handle_timeouts(&self, now: u64) {
        let mut state = self.ctx.state.lock();
        let expired = state.sweep_timeouts(now);
        let mode = state.mode();
        drop(state);

        for mac in expired {
            tracing::info!(id = self.ctx.id, %mac, "member timed out");
            self.ctx.spawn_event(MatchingEvent::Timeout, mac, Vec::new());
            let opcode = if mode == MatchingMode::Parent {
                OPCODE_DEATH
            } else {
                OPCODE_CANCEL
            };
            self.ctx.enqueue(opcode, mac, Vec::new());
        }
    }

    // ------------------------------------------------------------------------
    // Outbound commands
    // ------------------------------------------------------------------------

    /// Run queued commands in order; `flushing` makes a single attempt each
    fn drain_inputs(&self, now: u64, flushing: bool) {
        let (resend_int, limit) = {
            let state = self.ctx.state.lock();
            (state.config.resend_int_us, state.config.resend_counter.max(1))
        };

        loop {
            let Some(mut msg) = self.ctx.inputs.lock().pop_front() else {
                break;
            };
            if !flushing && msg.attempts > 0 && now.saturating_sub(msg.last_attempt_us) < resend_int
            {
                self.ctx.inputs.lock().push_front(msg);
                break;
            }

            match self.execute(&msg, now) {
                Ok(()) => {}
                Err(AdhocError::InvalidSocketId(_)) => {
                    tracing::debug!(id = self.ctx.id, opcode = msg.opcode, "socket closed, command dropped");
                }
                Err(e) => {
                    msg.attempts += 1;
                    msg.last_attempt_us = now;
                    if flushing || msg.attempts >= limit {
                        tracing::warn!(
                            id = self.ctx.id,
                            mac = %msg.mac,
                            opcode = msg.opcode,
                            attempts = msg.attempts,
                            error = %e,
                            "giving up on matching command"
                        );
                        self.ctx.state.lock().remove(msg.mac);
                        self.ctx
                            .spawn_event(MatchingEvent::Error, msg.mac, Vec::new());
                    } else {
                        tracing::debug!(id = self.ctx.id, mac = %msg.mac, opcode = msg.opcode, error = %e, "matching send deferred");
                        self.ctx.inputs.lock().push_front(msg);
                        break;
                    }
                }
            }
        }
    }

    fn execute(&self, msg: &ThreadMessage, now: u64) -> Result<(), AdhocError> {
        let mac = msg.mac;
        match msg.opcode {
            OPCODE_JOIN => {
                let pending = self
                    .ctx
                    .state
                    .lock()
                    .find(mac)
                    .is_some_and(|m| m.state == PeerState::OutgoingRequest);
                if pending {
                    self.send(mac, &MatchingPacket::Join {
                        opt: msg.payload.clone(),
                    })?;
                }
            }
            OPCODE_ACCEPT => {
                let siblings = {
                    let state = self.ctx.state.lock();
                    let Some(member) = state.find(mac) else {
                        return Ok(());
                    };
                    if !matches!(member.state, PeerState::Child | PeerState::P2P) {
                        return Ok(());
                    }
                    match state.mode() {
                        // Newest sibling first on the wire
                        MatchingMode::Parent => {
                            state.children_except(mac).into_iter().rev().collect()
                        }
                        _ => Vec::new(),
                    }
                };
                self.send(mac, &MatchingPacket::Accept {
                    opt: msg.payload.clone(),
                    siblings,
                })?;
                self.ctx
                    .spawn_event(MatchingEvent::Established, mac, Vec::new());
            }
            OPCODE_CANCEL => {
                self.send(mac, &MatchingPacket::Cancel {
                    opt: msg.payload.clone(),
                })?;
                let mut state = self.ctx.state.lock();
                if state.mode() == MatchingMode::Child {
                    state.clear_members();
                } else if let Some(member) = state.find_mut(mac) {
                    // Linger briefly so a BYE can still reach it on stop
                    member.last_ping_us = now;
                }
            }
            OPCODE_BULK => {
                if self.ctx.state.lock().find(mac).is_none() {
                    return Ok(());
                }
                self.send(mac, &MatchingPacket::Bulk {
                    data: msg.payload.clone(),
                })?;
                if let Some(member) = self.ctx.state.lock().find_mut(mac) {
                    member.sending = false;
                }
                self.ctx.spawn_event(MatchingEvent::DataAck, mac, Vec::new());
            }
            OPCODE_BULK_ABORT => self.send(mac, &MatchingPacket::BulkAbort)?,
            OPCODE_BIRTH => {
                let children = {
                    let state = self.ctx.state.lock();
                    if state.find(mac).is_none() {
                        return Ok(());
                    }
                    state.children_except(mac)
                };
                let birth = MatchingPacket::Birth { mac };
                for child in children {
                    match self.send(child, &birth) {
                        Ok(()) => tracing::info!(id = self.ctx.id, newborn = %mac, to = %child, "BIRTH sent"),
                        Err(e) => tracing::warn!(id = self.ctx.id, newborn = %mac, to = %child, error = %e, "BIRTH send failed"),
                    }
                }
            }
            OPCODE_DEATH => {
                let children = {
                    let state = self.ctx.state.lock();
                    if state.find(mac).is_none() {
                        return Ok(());
                    }
                    state.children_except(mac)
                };
                if let Err(e) = self.send(mac, &MatchingPacket::Bye) {
                    tracing::debug!(id = self.ctx.id, %mac, error = %e, "BYE to dropped child failed");
                }
                let death = MatchingPacket::Death { mac };
                for child in children {
                    if let Err(e) = self.send(child, &death) {
                        tracing::warn!(id = self.ctx.id, dead = %mac, to = %child, error = %e, "DEATH send failed");
                    }
                }
                self.ctx.state.lock().remove(mac);
            }
            other => {
                tracing::warn!(id = self.ctx.id, opcode = other, "unexpected queued opcode");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Inbound datagrams
    // ------------------------------------------------------------------------

    fn receive(&mut self, now: u64) {
        let Some(socket) = self.socket() else {
            return;
        };
        loop {
            match self.rt.pdp.recv(socket, &mut self.rx) {
                Ok(packet) => {
                    let len = packet.len.min(self.rx.len());
                    if self
                        .rt
                        .peers
                        .find_by_mac(packet.from)
                        .is_some_and(|peer| peer.is_active())
                    {
                        self.rt.peers.touch(packet.from, now);
                    }
                    match MatchingPacket::decode(&self.rx[..len]) {
                        Ok(decoded) => self.act(packet.from, packet.port, decoded, now),
                        Err(e) => {
                            tracing::debug!(id = self.ctx.id, from = %packet.from, error = %e, "dropping matching datagram");
                        }
                    }
                }
                Err(AdhocError::WouldBlock) => break,
                Err(e) => {
                    tracing::debug!(id = self.ctx.id, error = %e, "matching receive failed");
                    break;
                }
            }
        }
    }

    fn act(&self, from: MacAddr, port: u16, packet: MatchingPacket, now: u64) {
        let mut state = self.ctx.state.lock();
        state.peer_ports.insert(from, port);
        if !matches!(packet, MatchingPacket::Ping) {
            tracing::trace!(id = self.ctx.id, %from, opcode = packet.opcode(), "matching packet");
        }
        match packet {
            MatchingPacket::Ping => {
                if let Some(member) = state.find_mut(from) {
                    member.last_ping_us = now;
                }
            }
            MatchingPacket::Hello { opt } => self.on_hello(&mut state, from, opt, now),
            MatchingPacket::Join { opt } => self.on_join(&mut state, from, opt, now),
            MatchingPacket::Accept { opt, siblings } => {
                self.on_accept(&mut state, from, opt, siblings, now)
            }
            MatchingPacket::Cancel { opt } => self.on_cancel(&mut state, from, opt),
            MatchingPacket::Bulk { data } => {
                let established = state.find(from).is_some_and(|m| {
                    matches!(
                        (state.mode(), m.state),
                        (MatchingMode::Parent, PeerState::Child)
                            | (MatchingMode::Child, PeerState::Child | PeerState::Parent)
                            | (MatchingMode::P2P, PeerState::P2P)
                    )
                });
                if established {
                    self.ctx.spawn_event(MatchingEvent::Data, from, data);
                }
            }
            MatchingPacket::BulkAbort => {}
            MatchingPacket::Birth { mac } => {
                if Self::from_parent(&state, from) && mac != state.local_mac {
                    state.upsert(mac, PeerState::Child, now);
                    tracing::debug!(id = self.ctx.id, sibling = %mac, "sibling joined");
                }
            }
            MatchingPacket::Death { mac } => {
                if Self::from_parent(&state, from)
                    && state.find(mac).is_some_and(|m| m.state == PeerState::Child)
                {
                    self.ctx.spawn_event(MatchingEvent::Leave, mac, Vec::new());
                    state.remove(mac);
                }
            }
            MatchingPacket::Bye => self.on_bye(&mut state, from),
        }
    }

    fn from_parent(state: &ContextState, from: MacAddr) -> bool {
        state.mode() == MatchingMode::Child && state.parent().is_some_and(|p| p.mac == from)
    }

    fn seeking_room(state: &ContextState) -> bool {
        match state.mode() {
            MatchingMode::Child => state.parent().is_none(),
            MatchingMode::P2P => state.p2p_partner().is_none(),
            MatchingMode::Parent => false,
        }
    }

    fn on_hello(&self, state: &mut ContextState, from: MacAddr, opt: Vec<u8>, now: u64) {
        if !Self::seeking_room(state) {
            return;
        }
        if state.find(from).is_none() {
            state.upsert(from, PeerState::Offer, now);
        }
        let joining = state.find(from).is_some_and(|m| {
            matches!(
                m.state,
                PeerState::OutgoingRequest | PeerState::IncomingRequest
            )
        });
        if !joining {
            self.ctx.spawn_event(MatchingEvent::Hello, from, opt);
        }
    }

    fn on_join(&self, state: &mut ContextState, from: MacAddr, opt: Vec<u8>, now: u64) {
        let room = match state.mode() {
            MatchingMode::Child => return,
            MatchingMode::Parent => state.children() + 1 < state.config.max_peers as usize,
            MatchingMode::P2P => state.p2p_partner().is_none(),
        };
        if room {
            let known = state.find(from).is_some_and(|m| m.last_ping_us != 0);
            if known && state.mode() == MatchingMode::Parent {
                tracing::debug!(id = self.ctx.id, %from, "duplicate join ignored");
                return;
            }
            state.upsert(from, PeerState::IncomingRequest, now);
            self.ctx.spawn_event(MatchingEvent::Request, from, opt);
            return;
        }
        tracing::debug!(id = self.ctx.id, %from, "join rejected, room full");
        self.ctx.enqueue(OPCODE_CANCEL, from, Vec::new());
    }

    fn on_accept(
        &self,
        state: &mut ContextState,
        from: MacAddr,
        opt: Vec<u8>,
        siblings: Vec<MacAddr>,
        now: u64,
    ) {
        if !Self::seeking_room(state) {
            return;
        }
        if state.outgoing_request().map(|m| m.mac) != Some(from) {
            return;
        }
        let mode = state.mode();
        let role = if mode == MatchingMode::Child {
            PeerState::Parent
        } else {
            PeerState::P2P
        };
        state.upsert(from, role, now);
        state.retain_established();
        if mode == MatchingMode::Child {
            let local = state.local_mac;
            for sibling in siblings.into_iter().rev().filter(|mac| *mac != local) {
                state.upsert(sibling, PeerState::Child, now);
            }
            state.upsert(local, PeerState::Local, now);
        }
        tracing::info!(id = self.ctx.id, %from, ?role, "join accepted");
        self.ctx.spawn_event(MatchingEvent::Accept, from, opt);
        self.ctx
            .spawn_event(MatchingEvent::Established, from, Vec::new());
    }

    fn on_cancel(&self, state: &mut ContextState, from: MacAddr, opt: Vec<u8>) {
        let Some(peer_state) = state.find(from).map(|m| m.state) else {
            return;
        };
        let requested = state.outgoing_request().map(|m| m.mac) == Some(from);
        let forget = |state: &mut ContextState| {
            if let Some(member) = state.find_mut(from) {
                member.state = PeerState::CancelInProgress;
                member.last_ping_us = 0;
            }
        };

        match state.mode() {
            MatchingMode::Child => {
                if requested {
                    self.ctx.spawn_event(MatchingEvent::Deny, from, opt);
                    forget(state);
                } else if peer_state == PeerState::Parent {
                    let room: Vec<MacAddr> = state
                        .members
                        .iter()
                        .filter(|m| matches!(m.state, PeerState::Child | PeerState::Parent))
                        .map(|m| m.mac)
                        .collect();
                    for mac in room {
                        self.ctx.spawn_event(MatchingEvent::Leave, mac, opt.clone());
                    }
                    state.clear_members();
                }
            }
            MatchingMode::Parent => match peer_state {
                PeerState::IncomingRequest => {
                    self.ctx.spawn_event(MatchingEvent::Cancel, from, opt);
                    forget(state);
                }
                PeerState::Child => {
                    self.ctx.spawn_event(MatchingEvent::Leave, from, opt);
                    if let Some(member) = state.find_mut(from) {
                        member.state = PeerState::CancelInProgress;
                    }
                    // Tell the remaining children, then drop the member
                    self.ctx.enqueue(OPCODE_DEATH, from, Vec::new());
                }
                _ => {}
            },
            MatchingMode::P2P => {
                if requested {
                    self.ctx.spawn_event(MatchingEvent::Deny, from, opt);
                    forget(state);
                } else if peer_state == PeerState::P2P {
                    self.ctx.spawn_event(MatchingEvent::Leave, from, opt);
                    forget(state);
                } else if peer_state == PeerState::IncomingRequest {
                    self.ctx.spawn_event(MatchingEvent::Cancel, from, opt);
                    forget(state);
                }
            }
        }
    }

    fn on_bye(&self, state: &mut ContextState, from: MacAddr) {
        let Some(peer_state) = state.find(from).map(|m| m.state) else {
            return;
        };
        let mode = state.mode();
        let leaves = matches!(
            (mode, peer_state),
            (MatchingMode::Parent, PeerState::Child)
                | (MatchingMode::Child, PeerState::Child)
                | (
                    MatchingMode::P2P,
                    PeerState::P2P
                        | PeerState::Offer
                        | PeerState::IncomingRequest
                        | PeerState::OutgoingRequest
                        | PeerState::CancelInProgress
                )
        );
        if leaves {
            if mode != MatchingMode::Child {
                self.ctx.spawn_event(MatchingEvent::Bye, from, Vec::new());
            }
            state.remove(from);
        } else if mode == MatchingMode::Child && peer_state == PeerState::Parent {
            self.ctx.spawn_event(MatchingEvent::Bye, from, Vec::new());
            state.clear_members();
        }
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    fn shutdown(&self) {
        let now = self.rt.clock.now_us();
        self.drain_inputs(now, true);
        self.ctx.inputs.lock().clear();

        let room: Vec<MacAddr> = self
            .ctx
            .state
            .lock()
            .members
            .iter()
            .filter(|m| {
                matches!(
                    m.state,
                    PeerState::Parent
                        | PeerState::Child
                        | PeerState::P2P
                        | PeerState::CancelInProgress
                )
            })
            .map(|m| m.mac)
            .collect();
        for mac in room {
            if let Err(e) = self.send(mac, &MatchingPacket::Bye) {
                tracing::debug!(id = self.ctx.id, %mac, error = %e, "BYE send failed");
            }
        }
        self.ctx.state.lock().clear_members();
    }
}

// ============================================================================
// Event worker
// ============================================================================

struct EventWorker {
    ctx: Arc<MatchingContext>,
    rt: WorkerRuntime,
}

impl EventWorker {
    fn run(self) {
        while self.ctx.event_running.load(Ordering::SeqCst) {
            self.deliver();
            thread::sleep(self.rt.settings.worker_sleep);
        }
        self.deliver();
    }

    fn deliver(&self) {
        loop {
            let Some(mut notification) = self.ctx.events.lock().pop_front() else {
                break;
            };
            let rx_buflen = self.ctx.state.lock().config.rx_buflen;
            notification.opt.truncate(rx_buflen);
            self.ctx.handler.on_event(notification);
        }
    }
}
