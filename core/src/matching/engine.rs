//! Matching engine: the guest-facing matching API

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::context::{ContextConfig, ContextSnapshot, ContextState, MatchingContext};
use super::handler::MatchingHandler;
use super::packets::{
    OPCODE_ACCEPT, OPCODE_BIRTH, OPCODE_BULK, OPCODE_BULK_ABORT, OPCODE_CANCEL, OPCODE_DEATH,
    OPCODE_JOIN,
};
use super::types::{MatchingError, MatchingMode, PeerState, PoolStat};
use super::workers::{self, WorkerRuntime};
use crate::clock::SharedClock;
use crate::mac::MacAddr;
use crate::peers::PeerDirectory;
use crate::socket::PdpLayer;

/// Largest room a context may describe
pub const MAX_MATCHING_PEERS: i32 = 16;

/// Keepalive used when the guest passes none
pub const DEFAULT_KEEPALIVE_US: u64 = 2_000_000;

/// Engine-wide tunables
#[derive(Debug, Clone)]
pub struct MatchingSettings {
    /// Pause between worker iterations
    pub worker_sleep: Duration,
    /// Added to every context's member timeout to absorb internet latency
    pub timeout_slack_us: u64,
}

impl Default for MatchingSettings {
    fn default() -> Self {
        Self {
            worker_sleep: Duration::from_millis(10),
            timeout_slack_us: 500_000,
        }
    }
}

/// Arguments of `create`, exactly as the guest passes them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    pub mode: i32,
    pub max_peers: i32,
    pub port: u16,
    pub rx_buflen: i32,
    pub hello_int_us: i32,
    pub keepalive_int_us: i32,
    pub init_count: i32,
    pub rexmt_int_us: i32,
}

/// Persisted engine state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchingSnapshot {
    pub pool_size: Option<u32>,
    pub contexts: Vec<ContextSnapshot>,
}

#[derive(Default)]
struct EngineState {
    /// Set between `init` and `term`
    pool_size: Option<u32>,
    contexts: BTreeMap<i32, Arc<MatchingContext>>,
}

pub struct MatchingEngine {
    runtime: WorkerRuntime,
    inner: Mutex<EngineState>,
}

impl MatchingEngine {
    pub fn new(
        pdp: Arc<PdpLayer>,
        peers: Arc<PeerDirectory>,
        clock: SharedClock,
        settings: MatchingSettings,
    ) -> Self {
        Self {
            runtime: WorkerRuntime {
                pdp,
                peers,
                clock,
                settings,
            },
            inner: Mutex::new(EngineState::default()),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().pool_size.is_some()
    }

    pub fn context_ids(&self) -> Vec<i32> {
        self.inner.lock().contexts.keys().copied().collect()
    }

    // ========================================================================
    // Library lifecycle
    // ========================================================================

    pub fn init(&self, pool_size: u32) -> Result<(), MatchingError> {
        let mut inner = self.inner.lock();
        if inner.pool_size.is_some() {
            return Err(MatchingError::AlreadyInitialized);
        }
        inner.pool_size = Some(pool_size);
        tracing::info!(pool_size, "matching library initialized");
        Ok(())
    }

    /// Delete every context and uninitialize; always succeeds
    pub fn term(&self) {
        let ids = self.context_ids();
        for id in ids {
            let _ = self.delete(id);
        }
        self.inner.lock().pool_size = None;
        tracing::info!("matching library terminated");
    }

    // ========================================================================
    // Context lifecycle
    // ========================================================================

    pub fn create(
        &self,
        params: ContextParams,
        handler: Arc<dyn MatchingHandler>,
    ) -> Result<i32, MatchingError> {
        let mut inner = self.inner.lock();
        if inner.pool_size.is_none() {
            return Err(MatchingError::NotInitialized);
        }
        if params.max_peers <= 1 || params.max_peers > MAX_MATCHING_PEERS {
            return Err(MatchingError::InvalidMaxnum(params.max_peers));
        }
        if params.rx_buflen < 1 {
            return Err(MatchingError::RxbufTooShort(params.rx_buflen));
        }
        let mode = MatchingMode::try_from(params.mode)?;
        if inner
            .contexts
            .values()
            .any(|ctx| ctx.state.lock().config.port == params.port)
        {
            return Err(MatchingError::PortInUse(params.port));
        }

        let non_negative = |v: i32| u64::try_from(v).unwrap_or(0);
        let keepalive_int_us = match params.keepalive_int_us {
            v if v < 1 => DEFAULT_KEEPALIVE_US,
            v => non_negative(v),
        };
        let init_count = non_negative(params.init_count);
        let timeout_us = (non_negative(params.keepalive_int_us) + non_negative(params.rexmt_int_us))
            * init_count
            + self.runtime.settings.timeout_slack_us;

        let config = ContextConfig {
            mode,
            max_peers: params.max_peers as u32,
            port: params.port,
            rx_buflen: params.rx_buflen as usize,
            hello_int_us: non_negative(params.hello_int_us),
            keepalive_int_us,
            resend_counter: init_count as u32,
            resend_int_us: non_negative(params.rexmt_int_us),
            timeout_us,
        };

        let id = (1..)
            .find(|id| !inner.contexts.contains_key(id))
            .ok_or(MatchingError::NoSpace)?;
        let state = ContextState::new(config, self.runtime.pdp.local_mac());
        inner
            .contexts
            .insert(id, Arc::new(MatchingContext::new(id, state, handler)));
        tracing::info!(id, ?mode, port = params.port, max_peers = params.max_peers, timeout_us, "matching context created");
        Ok(id)
    }

    fn context(&self, id: i32) -> Result<Arc<MatchingContext>, MatchingError> {
        let inner = self.inner.lock();
        if inner.pool_size.is_none() {
            return Err(MatchingError::NotInitialized);
        }
        inner
            .contexts
            .get(&id)
            .cloned()
            .ok_or(MatchingError::InvalidId(id))
    }

    /// Open the PDP socket and launch both workers
    pub fn start(&self, id: i32, hello: &[u8]) -> Result<(), MatchingError> {
        let ctx = self.context(id)?;
        let port = {
            let mut state = ctx.state.lock();
            if state.running {
                return Err(MatchingError::IsRunning);
            }
            if !hello.is_empty() {
                state.hello = hello.to_vec();
            }
            state.config.port
        };

        let socket = self
            .runtime
            .pdp
            .create(self.runtime.pdp.local_mac(), port)?;
        {
            let mut state = ctx.state.lock();
            state.socket = Some(socket);
            state.running = true;
        }
        if let Err(e) = workers::spawn(&ctx, &self.runtime) {
            tracing::error!(id, error = %e, "failed to spawn matching workers");
            self.halt(&ctx);
            return Err(MatchingError::NoSpace);
        }
        tracing::info!(id, port, socket, "matching context started");
        Ok(())
    }

    /// Stop the workers, flush pending commands and say goodbye to the room
    pub fn stop(&self, id: i32) -> Result<(), MatchingError> {
        let ctx = self.context(id)?;
        self.halt(&ctx);
        Ok(())
    }

    fn halt(&self, ctx: &Arc<MatchingContext>) {
        let handles: Vec<_> = ctx.workers.lock().drain(..).collect();
        let mut handles = handles.into_iter();

        // Input worker first so its final events still reach the handler.
        ctx.input_running.store(false, Ordering::SeqCst);
        if let Some(input) = handles.next() {
            if input.join().is_err() {
                tracing::error!(id = ctx.id, "matching input worker panicked");
            }
        }
        ctx.event_running.store(false, Ordering::SeqCst);
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!(id = ctx.id, "matching event worker panicked");
            }
        }

        let socket = {
            let mut state = ctx.state.lock();
            state.running = false;
            state.clear_members();
            state.socket.take()
        };
        if let Some(socket) = socket {
            if let Err(e) = self.runtime.pdp.delete(socket) {
                tracing::debug!(id = ctx.id, socket, error = %e, "matching socket already gone");
            }
        }
        tracing::info!(id = ctx.id, "matching context stopped");
    }

    /// Stop if needed and forget the context; unknown ids are ignored
    pub fn delete(&self, id: i32) -> Result<(), MatchingError> {
        let ctx = self.inner.lock().contexts.remove(&id);
        if let Some(ctx) = ctx {
            if ctx.state.lock().running {
                self.halt(&ctx);
            }
            ctx.inputs.lock().clear();
            ctx.events.lock().clear();
            tracing::info!(id, "matching context deleted");
        }
        Ok(())
    }

    // ========================================================================
    // Room management
    // ========================================================================

    fn running_context(&self, id: i32) -> Result<Arc<MatchingContext>, MatchingError> {
        let ctx = self.context(id)?;
        if !ctx.state.lock().running {
            return Err(MatchingError::NotRunning);
        }
        Ok(ctx)
    }

    /// Request to join `mac`'s room, or accept its request
    pub fn select_target(&self, id: i32, mac: MacAddr, opt: &[u8]) -> Result<(), MatchingError> {
        let ctx = self.running_context(id)?;
        let mut state = ctx.state.lock();
        let peer_state = state
            .find(mac)
            .map(|m| m.state)
            .ok_or(MatchingError::UnknownTarget(mac))?;

        match state.mode() {
            MatchingMode::Parent => {
                if peer_state == PeerState::Child {
                    return Err(MatchingError::AlreadyEstablished);
                }
                if state.children() + 1 >= state.config.max_peers as usize {
                    return Err(MatchingError::ExceedMaxnum);
                }
                if peer_state == PeerState::IncomingRequest {
                    if let Some(member) = state.find_mut(mac) {
                        member.state = PeerState::Child;
                    }
                    ctx.enqueue(OPCODE_BIRTH, mac, Vec::new());
                    ctx.enqueue(OPCODE_ACCEPT, mac, opt.to_vec());
                    tracing::debug!(id, %mac, "accepting child");
                    return Ok(());
                }
            }
            MatchingMode::Child | MatchingMode::P2P => {
                let established = match state.mode() {
                    MatchingMode::Child => state.parent().is_some(),
                    _ => state.p2p_partner().is_some(),
                };
                if established {
                    return Err(MatchingError::AlreadyEstablished);
                }
                if state.outgoing_request().is_some() {
                    return Err(MatchingError::RequestInProgress);
                }
                match peer_state {
                    PeerState::Offer => {
                        if let Some(member) = state.find_mut(mac) {
                            member.state = PeerState::OutgoingRequest;
                        }
                        ctx.enqueue(OPCODE_JOIN, mac, opt.to_vec());
                        tracing::debug!(id, %mac, "join requested");
                        return Ok(());
                    }
                    PeerState::IncomingRequest if state.mode() == MatchingMode::P2P => {
                        if let Some(member) = state.find_mut(mac) {
                            member.state = PeerState::P2P;
                        }
                        ctx.enqueue(OPCODE_ACCEPT, mac, opt.to_vec());
                        tracing::debug!(id, %mac, "accepting partner");
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }
        Err(MatchingError::TargetNotReady)
    }

    /// Reject, cancel or leave, depending on the relationship with `mac`
    pub fn cancel_target(&self, id: i32, mac: MacAddr, opt: &[u8]) -> Result<(), MatchingError> {
        let ctx = self.running_context(id)?;
        let mut state = ctx.state.lock();
        let peer_state = state
            .find(mac)
            .map(|m| m.state)
            .ok_or(MatchingError::UnknownTarget(mac))?;

        let cancellable = matches!(
            (state.mode(), peer_state),
            (MatchingMode::Child, PeerState::Parent | PeerState::OutgoingRequest)
                | (MatchingMode::Parent, PeerState::Child | PeerState::IncomingRequest)
                | (MatchingMode::P2P, PeerState::P2P | PeerState::IncomingRequest)
        );
        if cancellable {
            if state.mode() == MatchingMode::Parent
                && peer_state == PeerState::Child
                && state.connected_count() > 1
            {
                ctx.enqueue(OPCODE_DEATH, mac, Vec::new());
            }
            if let Some(member) = state.find_mut(mac) {
                member.state = PeerState::CancelInProgress;
                member.last_ping_us = 0;
            }
            ctx.enqueue(OPCODE_CANCEL, mac, opt.to_vec());
            tracing::debug!(id, %mac, ?peer_state, "target cancelled");
        }
        Ok(())
    }

    pub fn get_hello_opt(&self, id: i32) -> Result<Vec<u8>, MatchingError> {
        let ctx = self.context(id)?;
        let hello = ctx.state.lock().hello.clone();
        Ok(hello)
    }

    pub fn set_hello_opt(&self, id: i32, opt: &[u8]) -> Result<(), MatchingError> {
        let ctx = self.context(id)?;
        let mut state = ctx.state.lock();
        if state.mode() == MatchingMode::Child {
            return Err(MatchingError::InvalidModeForOperation);
        }
        if !state.running {
            return Err(MatchingError::NotRunning);
        }
        state.hello = opt.to_vec();
        Ok(())
    }

    /// Current room members, see [`ContextState::member_list`]
    pub fn get_members(&self, id: i32) -> Result<Vec<MacAddr>, MatchingError> {
        let ctx = self.running_context(id)?;
        let members = ctx.state.lock().member_list();
        Ok(members)
    }

    // ========================================================================
    // Data
    // ========================================================================

    pub fn send_data(&self, id: i32, mac: MacAddr, data: &[u8]) -> Result<(), MatchingError> {
        let ctx = self.running_context(id)?;
        if data.is_empty() {
            return Err(MatchingError::InvalidDatalen(0));
        }
        let mut state = ctx.state.lock();
        let member = state
            .find_mut(mac)
            .ok_or(MatchingError::UnknownTarget(mac))?;
        if !matches!(
            member.state,
            PeerState::Parent | PeerState::Child | PeerState::P2P
        ) {
            return Err(MatchingError::NotEstablished);
        }
        if member.sending {
            return Err(MatchingError::DataBusy);
        }
        member.sending = true;
        ctx.enqueue(OPCODE_BULK, mac, data.to_vec());
        Ok(())
    }

    pub fn abort_send_data(&self, id: i32, mac: MacAddr) -> Result<(), MatchingError> {
        let ctx = self.running_context(id)?;
        let mut state = ctx.state.lock();
        let member = state
            .find_mut(mac)
            .ok_or(MatchingError::UnknownTarget(mac))?;
        if member.sending {
            member.sending = false;
            ctx.inputs
                .lock()
                .retain(|msg| !(msg.opcode == OPCODE_BULK && msg.mac == mac));
            ctx.enqueue(OPCODE_BULK_ABORT, mac, Vec::new());
            tracing::debug!(id, %mac, "bulk transfer aborted");
        }
        Ok(())
    }

    // ========================================================================
    // Pool figures
    // ========================================================================

    pub fn pool_stat(&self) -> Result<PoolStat, MatchingError> {
        let pool = self
            .inner
            .lock()
            .pool_size
            .ok_or(MatchingError::NotInitialized)?;
        let max = pool / 2;
        Ok(PoolStat {
            pool,
            max,
            free: pool - max,
        })
    }

    pub fn pool_max_alloc(&self) -> u32 {
        self.inner.lock().pool_size.unwrap_or(0) / 2
    }

    // ========================================================================
    // Save states
    // ========================================================================

    pub fn snapshot(&self) -> MatchingSnapshot {
        let inner = self.inner.lock();
        MatchingSnapshot {
            pool_size: inner.pool_size,
            contexts: inner.contexts.values().map(|ctx| ctx.snapshot()).collect(),
        }
    }

    /// Replace every context with the saved ones and restart those that
    /// were running
    pub fn restore(
        &self,
        snapshot: MatchingSnapshot,
        handler: Arc<dyn MatchingHandler>,
    ) -> Result<(), MatchingError> {
        self.term();
        let mut restart = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.pool_size = snapshot.pool_size;
            for saved in snapshot.contexts {
                let was_running = saved.state.running;
                let mut state = saved.state;
                state.running = false;
                state.socket = None;
                let ctx = MatchingContext::new(saved.id, state, Arc::clone(&handler));
                ctx.inputs.lock().extend(saved.inputs);
                ctx.events.lock().extend(saved.events);
                if was_running {
                    restart.push(saved.id);
                }
                inner.contexts.insert(saved.id, Arc::new(ctx));
            }
        }

        for id in restart {
            let ctx = self.context(id)?;
            let port = ctx.state.lock().config.port;
            let socket = self
                .runtime
                .pdp
                .create(self.runtime.pdp.local_mac(), port)?;
            {
                let mut state = ctx.state.lock();
                state.socket = Some(socket);
                state.running = true;
            }
            workers::spawn(&ctx, &self.runtime).map_err(|e| {
                tracing::error!(id, error = %e, "failed to respawn matching workers");
                MatchingError::NoSpace
            })?;
            tracing::info!(id, "matching context restored");
        }
        Ok(())
    }
}

impl Drop for MatchingEngine {
    fn drop(&mut self) {
        self.term();
    }
}
