//! Relay session types

use serde::{Deserialize, Serialize};

use crate::mac::MacAddr;
use crate::socket::SocketError;
use crate::translate::codes::adhocctl;

/// Identity presented to the relay server at login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginParameters {
    pub mac: MacAddr,
    pub nickname: String,
    /// Nine-character game product code; players only meet within one game
    pub product_code: String,
}

/// Group state of the local player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum AdhocctlState {
    #[default]
    Disconnected = 0,
    Connected = 1,
    Scanning = 2,
    GameMode = 3,
    Discover = 4,
    Wol = 5,
}

/// Notification codes delivered to guest adhocctl handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum AdhocctlEvent {
    Error = 0,
    Connect = 1,
    Disconnect = 2,
    Scan = 3,
    Game = 4,
    Discover = 5,
    Wol = 6,
}

/// A pending guest callback produced by the relay worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdhocctlNotification {
    pub event: AdhocctlEvent,
    pub error: u32,
}

/// One group seen during a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub group: String,
    /// MAC of the group's host
    pub bssid: MacAddr,
}

/// Relay session failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("relay session already initialized")]
    AlreadyInitialized,
    #[error("relay session not initialized")]
    NotInitialized,
    #[error("invalid group name '{0}'")]
    InvalidGroupName(String),
    #[error("operation not allowed in state {0:?}")]
    Busy(AdhocctlState),
    #[error("cannot resolve relay server '{0}'")]
    Resolve(String),
    #[error("relay transport error: {0}")]
    Socket(#[from] SocketError),
    #[error("relay connection lost")]
    Disconnected,
}

impl RelayError {
    pub fn code(&self) -> u32 {
        match self {
            Self::AlreadyInitialized => adhocctl::ALREADY_INITIALIZED,
            Self::NotInitialized => adhocctl::NOT_INITIALIZED,
            Self::InvalidGroupName(_) => adhocctl::INVALID_ARG,
            Self::Busy(_) => adhocctl::BUSY,
            Self::Resolve(_) | Self::Socket(_) | Self::Disconnected => adhocctl::DISCONNECTED,
        }
    }
}
