//! Guest socket id table
//!
//! The registry is the only owner of native socket handles. Callers get an
//! `Arc<Socket>` clone for the duration of one operation; the table lock is
//! never held across native I/O.

use std::collections::BTreeMap;
use std::net::SocketAddrV4;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::Socket;

use super::SocketError;
use crate::port::PortProtocol;

/// First id handed to guest code
pub const MIN_SOCKET_ID: i32 = 61;

/// Last id that still fits in a guest fd_set
pub const MAX_SOCKET_ID: i32 = crate::translate::guest::FD_SETSIZE as i32 - 1;

/// Which guest API created a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SocketOwner {
    /// BSD-style inet socket API
    Inet,
    /// Ad-hoc library (PDP, relay control, matching)
    Adhoc,
}

/// Emulated per-socket state, all in guest numbering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketMeta {
    pub owner: SocketOwner,
    pub domain: i32,
    pub ty: i32,
    pub protocol: i32,
    /// Guest-visible blocking mode; the native socket is always non-blocking
    pub non_blocking: bool,
    /// Address reported to the guest after bind
    pub local_addr: Option<SocketAddrV4>,
    /// Address the native socket is bound to
    pub bound_addr: Option<SocketAddrV4>,
    /// Port announced to the port manager
    pub forwarded: Option<(PortProtocol, u16)>,
    pub recv_timeout_us: u32,
    pub send_timeout_us: u32,
}

impl SocketMeta {
    pub fn new(owner: SocketOwner, domain: i32, ty: i32, protocol: i32) -> Self {
        Self {
            owner,
            domain,
            ty,
            protocol,
            non_blocking: false,
            local_addr: None,
            bound_addr: None,
            forwarded: None,
            recv_timeout_us: 0,
            send_timeout_us: 0,
        }
    }
}

/// A registered socket: its id, a handle to the native socket, and a copy
/// of its emulated state
#[derive(Debug, Clone)]
pub struct GuestSocket {
    pub id: i32,
    pub native: Arc<Socket>,
    pub meta: SocketMeta,
}

struct Entry {
    native: Arc<Socket>,
    meta: SocketMeta,
}

struct Table {
    entries: BTreeMap<i32, Entry>,
    last_id: i32,
}

impl Table {
    fn next_free_id(&self) -> Option<i32> {
        let above = (self.last_id + 1).max(MIN_SOCKET_ID)..=MAX_SOCKET_ID;
        let wrapped = MIN_SOCKET_ID..=self.last_id.min(MAX_SOCKET_ID);
        above
            .chain(wrapped)
            .find(|id| !self.entries.contains_key(id))
    }
}

/// Thread-safe table of guest socket ids
pub struct SocketRegistry {
    table: Mutex<Table>,
}

impl Default for SocketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                entries: BTreeMap::new(),
                last_id: MIN_SOCKET_ID - 1,
            }),
        }
    }

    /// Register a native socket under a fresh id
    ///
    /// Ids increase strictly until the range is exhausted, then wrap to the
    /// lowest free id.
    pub fn insert(&self, native: Socket, meta: SocketMeta) -> Result<i32, SocketError> {
        let mut table = self.table.lock();
        let id = table.next_free_id().ok_or(SocketError::ResourceExhausted)?;
        table.entries.insert(
            id,
            Entry {
                native: Arc::new(native),
                meta,
            },
        );
        table.last_id = id;
        Ok(id)
    }

    /// Register a native socket under a specific id (save-state restore)
    pub fn insert_with_id(
        &self,
        id: i32,
        native: Socket,
        meta: SocketMeta,
    ) -> Result<(), SocketError> {
        if !(MIN_SOCKET_ID..=MAX_SOCKET_ID).contains(&id) {
            return Err(SocketError::InvalidArgument("socket id out of range"));
        }
        let mut table = self.table.lock();
        if table.entries.contains_key(&id) {
            return Err(SocketError::InvalidArgument("socket id already in use"));
        }
        table.entries.insert(
            id,
            Entry {
                native: Arc::new(native),
                meta,
            },
        );
        Ok(())
    }

    pub fn get(&self, id: i32) -> Result<GuestSocket, SocketError> {
        let table = self.table.lock();
        match table.entries.get(&id) {
            Some(entry) => Ok(GuestSocket {
                id,
                native: Arc::clone(&entry.native),
                meta: entry.meta.clone(),
            }),
            None => {
                tracing::warn!(id, "lookup of unknown socket id");
                Err(SocketError::UnknownHandle(id))
            }
        }
    }

    pub fn contains(&self, id: i32) -> bool {
        self.table.lock().entries.contains_key(&id)
    }

    /// Mutate a socket's emulated state
    pub fn update<R>(
        &self,
        id: i32,
        f: impl FnOnce(&mut SocketMeta) -> R,
    ) -> Result<R, SocketError> {
        let mut table = self.table.lock();
        match table.entries.get_mut(&id) {
            Some(entry) => Ok(f(&mut entry.meta)),
            None => {
                tracing::warn!(id, "update of unknown socket id");
                Err(SocketError::UnknownHandle(id))
            }
        }
    }

    /// Erase a socket; the native handle closes once the last clone drops
    pub fn remove(&self, id: i32) -> Result<GuestSocket, SocketError> {
        let mut table = self.table.lock();
        match table.entries.remove(&id) {
            Some(entry) => Ok(GuestSocket {
                id,
                native: entry.native,
                meta: entry.meta,
            }),
            None => {
                tracing::warn!(id, "close of unknown socket id");
                Err(SocketError::UnknownHandle(id))
            }
        }
    }

    /// Live ids in ascending order
    pub fn ids(&self) -> Vec<i32> {
        self.table.lock().entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_id(&self) -> i32 {
        self.table.lock().last_id
    }

    pub(crate) fn set_last_id(&self, id: i32) {
        self.table.lock().last_id = id.clamp(MIN_SOCKET_ID - 1, MAX_SOCKET_ID);
    }

    /// Copy of every entry's metadata, ordered by id
    pub fn snapshot(&self) -> Vec<(i32, SocketMeta)> {
        self.table
            .lock()
            .entries
            .iter()
            .map(|(id, e)| (*id, e.meta.clone()))
            .collect()
    }

    /// Remove every entry, returning them for cleanup
    pub fn drain(&self) -> Vec<GuestSocket> {
        let mut table = self.table.lock();
        let entries = std::mem::take(&mut table.entries);
        table.last_id = MIN_SOCKET_ID - 1;
        entries
            .into_iter()
            .map(|(id, e)| GuestSocket {
                id,
                native: e.native,
                meta: e.meta,
            })
            .collect()
    }
}
