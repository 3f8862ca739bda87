//! Matching modes, member states, events and errors

use serde::{Deserialize, Serialize};

use crate::mac::MacAddr;
use crate::socket::AdhocError;
use crate::translate::codes::matching;

/// Role of a matching context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum MatchingMode {
    /// Host of a room with up to `max_peers - 1` children
    Parent = 1,
    /// Joins a parent's room
    Child = 2,
    /// Two-player room without a host
    P2P = 3,
}

impl TryFrom<i32> for MatchingMode {
    type Error = MatchingError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Parent),
            2 => Ok(Self::Child),
            3 => Ok(Self::P2P),
            other => Err(MatchingError::InvalidMode(other)),
        }
    }
}

/// Relationship of a member to the local context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum PeerState {
    /// The local player's own entry in a child's member list
    Local = 0,
    /// Advertised a room through HELLO
    Offer = 1,
    Parent = 2,
    Child = 3,
    P2P = 4,
    IncomingRequest = 5,
    OutgoingRequest = 6,
    CancelInProgress = 7,
}

/// Events delivered to the guest matching handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum MatchingEvent {
    Hello = 1,
    Request = 2,
    Leave = 3,
    Deny = 4,
    Cancel = 5,
    Accept = 6,
    Established = 7,
    Timeout = 8,
    Error = 9,
    Bye = 10,
    Data = 11,
    DataAck = 12,
    DataTimeout = 13,
}

/// One guest callback invocation produced by the event worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchingNotification {
    pub matching_id: i32,
    pub event: MatchingEvent,
    pub mac: MacAddr,
    pub opt: Vec<u8>,
}

/// Memory pool figures reported to the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolStat {
    pub pool: u32,
    pub max: u32,
    pub free: u32,
}

/// Matching library failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchingError {
    #[error("matching library not initialized")]
    NotInitialized,
    #[error("matching library already initialized")]
    AlreadyInitialized,
    #[error("unknown matching context {0}")]
    InvalidId(i32),
    #[error("invalid matching mode {0}")]
    InvalidMode(i32),
    #[error("invalid member limit {0}")]
    InvalidMaxnum(i32),
    #[error("receive buffer too short ({0} bytes)")]
    RxbufTooShort(i32),
    #[error("invalid argument")]
    InvalidArg,
    #[error("port {0} already used by another context")]
    PortInUse(u16),
    #[error("matching context not running")]
    NotRunning,
    #[error("matching context already running")]
    IsRunning,
    #[error("unknown target {0}")]
    UnknownTarget(MacAddr),
    #[error("invalid option length {0}")]
    InvalidOptlen(i32),
    #[error("connection already established")]
    AlreadyEstablished,
    #[error("room is full")]
    ExceedMaxnum,
    #[error("a join request is already in progress")]
    RequestInProgress,
    #[error("target not ready")]
    TargetNotReady,
    #[error("target not established")]
    NotEstablished,
    #[error("a transfer to this target is already in progress")]
    DataBusy,
    #[error("invalid data length {0}")]
    InvalidDatalen(i32),
    #[error("no space for context")]
    NoSpace,
    #[error("operation not allowed in this mode")]
    InvalidModeForOperation,
    #[error("matching socket error: {0}")]
    Adhoc(#[from] AdhocError),
}

impl MatchingError {
    pub fn code(&self) -> u32 {
        match self {
            Self::NotInitialized => matching::NOT_INITIALIZED,
            Self::AlreadyInitialized => matching::ALREADY_INITIALIZED,
            Self::InvalidId(_) => matching::INVALID_ID,
            Self::InvalidMode(_) => matching::INVALID_ARG,
            Self::InvalidModeForOperation => matching::INVALID_MODE,
            Self::InvalidMaxnum(_) => matching::INVALID_MAXNUM,
            Self::RxbufTooShort(_) => matching::RXBUF_TOO_SHORT,
            Self::InvalidArg => matching::INVALID_ARG,
            Self::PortInUse(_) => matching::PORT_IN_USE,
            Self::NotRunning => matching::NOT_RUNNING,
            Self::IsRunning => matching::IS_RUNNING,
            Self::UnknownTarget(_) => matching::UNKNOWN_TARGET,
            Self::InvalidOptlen(_) => matching::INVALID_OPTLEN,
            Self::AlreadyEstablished => matching::ALREADY_ESTABLISHED,
            Self::ExceedMaxnum => matching::EXCEED_MAXNUM,
            Self::RequestInProgress => matching::REQUEST_IN_PROGRESS,
            Self::TargetNotReady => matching::TARGET_NOT_READY,
            Self::NotEstablished => matching::NOT_ESTABLISHED,
            Self::DataBusy => matching::DATA_BUSY,
            Self::InvalidDatalen(_) => matching::INVALID_DATALEN,
            Self::NoSpace => matching::NO_SPACE,
            Self::Adhoc(e) => e.code(),
        }
    }
}
