//! Matching: room formation on top of PDP sockets
//!
//! A context runs in one of three modes. A parent hosts a room and
//! advertises it with HELLO; children JOIN, the parent ACCEPTs (telling the
//! newcomer about its siblings and the siblings about the newcomer with
//! BIRTH). P2P pairs exactly two players. Every established member is kept
//! alive with PING and dropped after the keepalive timeout.
//!
//! ```text
//!   child                          parent
//!     │ ◄────────── HELLO ──────────── │   (every hello_int)
//!     │ ─────────── JOIN  ───────────► │   → REQUEST event
//!     │ ◄────────── ACCEPT ─────────── │   select_target(child)
//!     │   ACCEPT + ESTABLISHED events  │   ESTABLISHED event
//!     │ ◄──────────  PING  ──────────► │   (every keepalive_int)
//! ```
//!
//! - [`engine`] - the guest API: lifecycle, targets, data, pool stats
//! - [`context`] - per-context state and queues
//! - [`packets`] - wire codec
//! - [`handler`] - event delivery
//! - [`types`] - modes, member states, events, errors

pub mod context;
pub mod engine;
pub mod handler;
pub mod packets;
pub mod types;
mod workers;


pub use context::{ContextConfig, ContextSnapshot, ContextState, Member};
pub use engine::{
    ContextParams, DEFAULT_KEEPALIVE_US, MAX_MATCHING_PEERS, MatchingEngine, MatchingSettings,
    MatchingSnapshot,
};
pub use handler::{MatchingHandler, NotificationQueue};
pub use packets::{MatchingDecodeError, MatchingPacket};
pub use types::{
    MatchingError, MatchingEvent, MatchingMode, MatchingNotification, PeerState, PoolStat,
};
