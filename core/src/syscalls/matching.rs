//! Guest-memory side of `sceNetAdhocMatching*`
//!
//! Arguments that arrive as guest pointers are validated and copied here;
//! everything else is forwarded to the [`MatchingEngine`]. Results are `0`
//! or a matching library error code.

use std::sync::Arc;

use super::{SyscallDelays, SyscallResult};
use crate::mac::MacAddr;
use crate::matching::{MatchingEngine, MatchingError};
use crate::memory::GuestMemory;

/// Guest member list entry: `u32 next`, `mac[6]`, `pad[2]`
pub const MEMBER_INFO_SIZE: usize = 12;

/// Guest `SceNetMallocStat`: pool, maximum, free
const POOL_STAT_SIZE: usize = 12;

pub struct MatchingSyscalls {
    engine: Arc<MatchingEngine>,
    delays: SyscallDelays,
}

impl MatchingSyscalls {
    pub fn new(engine: Arc<MatchingEngine>, delays: SyscallDelays) -> Self {
        Self { engine, delays }
    }

    pub fn engine(&self) -> &Arc<MatchingEngine> {
        &self.engine
    }

    fn finish(op: &'static str, result: Result<(), MatchingError>) -> SyscallResult {
        match result {
            Ok(()) => SyscallResult::ok(0),
            Err(e) => {
                tracing::debug!(op, error = %e, code = format_args!("{:#010x}", e.code()), "matching call failed");
                SyscallResult::code(e.code())
            }
        }
    }

    fn read_mac(mem: &dyn GuestMemory, ptr: u32) -> Result<MacAddr, MatchingError> {
        let bytes = mem
            .read_bytes(ptr, MacAddr::LEN)
            .map_err(|_| MatchingError::InvalidArg)?;
        MacAddr::from_slice(&bytes).ok_or(MatchingError::InvalidArg)
    }

    /// Optional payload: `len == 0` is empty, a positive length needs a
    /// readable pointer
    fn read_opt(mem: &dyn GuestMemory, len: i32, ptr: u32) -> Result<Vec<u8>, MatchingError> {
        match len {
            0 => Ok(Vec::new()),
            len if len < 0 || ptr == 0 => Err(MatchingError::InvalidOptlen(len)),
            len => mem
                .read_bytes(ptr, len as usize)
                .map_err(|_| MatchingError::InvalidArg),
        }
    }

    // ========================================================================
    // Context lifecycle
    // ========================================================================

    pub fn start(&self, mem: &dyn GuestMemory, id: i32, hello_len: i32, hello_ptr: u32) -> SyscallResult {
        let result = Self::read_opt(mem, hello_len, hello_ptr)
            .and_then(|hello| self.engine.start(id, &hello));
        Self::finish("start", result)
    }

    // ========================================================================
    // Targets
    // ========================================================================

    pub fn select_target(
        &self,
        mem: &dyn GuestMemory,
        id: i32,
        mac_ptr: u32,
        opt_len: i32,
        opt_ptr: u32,
    ) -> SyscallResult {
        let result = Self::read_mac(mem, mac_ptr).and_then(|mac| {
            let opt = Self::read_opt(mem, opt_len, opt_ptr)?;
            self.engine.select_target(id, mac, &opt)
        });
        Self::finish("select_target", result)
    }

    pub fn cancel_target(
        &self,
        mem: &dyn GuestMemory,
        id: i32,
        mac_ptr: u32,
        opt_len: i32,
        opt_ptr: u32,
    ) -> SyscallResult {
        let result = Self::read_mac(mem, mac_ptr).and_then(|mac| {
            let opt = Self::read_opt(mem, opt_len, opt_ptr)?;
            self.engine.cancel_target(id, mac, &opt)
        });
        Self::finish("cancel_target", result)
    }

    // ========================================================================
    // Hello data
    // ========================================================================

    /// Writes the hello length, and the data when `opt_ptr` is valid
    pub fn get_hello_opt(&self, mem: &mut dyn GuestMemory, id: i32, len_ptr: u32, opt_ptr: u32) -> SyscallResult {
        let result = (|| -> Result<(), MatchingError> {
            if !mem.is_valid(len_ptr, 4) {
                return Err(MatchingError::InvalidArg);
            }
            let hello = self.engine.get_hello_opt(id)?;
            mem.write_i32(len_ptr, hello.len() as i32)
                .map_err(|_| MatchingError::InvalidArg)?;
            if !hello.is_empty() && mem.is_valid(opt_ptr, hello.len()) {
                mem.write(opt_ptr, &hello)
                    .map_err(|_| MatchingError::InvalidArg)?;
            }
            Ok(())
        })();
        Self::finish("get_hello_opt", result)
    }

    pub fn set_hello_opt(&self, mem: &dyn GuestMemory, id: i32, opt_len: i32, opt_ptr: u32) -> SyscallResult {
        let result = Self::read_opt(mem, opt_len, opt_ptr)
            .and_then(|opt| self.engine.set_hello_opt(id, &opt));
        Self::finish("set_hello_opt", result)
    }

    // ========================================================================
    // Members
    // ========================================================================

    /// Member list in the guest's linked layout
    ///
    /// With a null `buf_ptr` only the required size is stored. Otherwise as
    /// many entries as fit in `*size_ptr` bytes are written, each linked to
    /// the next, and `*size_ptr` is set to the bytes used.
    pub fn get_members(&self, mem: &mut dyn GuestMemory, id: i32, size_ptr: u32, buf_ptr: u32) -> SyscallResult {
        let result = (|| -> Result<(), MatchingError> {
            if !mem.is_valid(size_ptr, 4) {
                return Err(MatchingError::InvalidArg);
            }
            let members = self.engine.get_members(id)?;
            let available = members.len() * MEMBER_INFO_SIZE;

            if buf_ptr == 0 {
                return mem
                    .write_i32(size_ptr, available as i32)
                    .map_err(|_| MatchingError::InvalidArg);
            }

            let requested = mem
                .read_i32(size_ptr)
                .map_err(|_| MatchingError::InvalidArg)?
                .clamp(0, available as i32) as usize;
            let count = requested / MEMBER_INFO_SIZE;

            let mut out = vec![0u8; count * MEMBER_INFO_SIZE];
            for (i, (entry, mac)) in out
                .chunks_exact_mut(MEMBER_INFO_SIZE)
                .zip(&members)
                .enumerate()
            {
                let next = if i + 1 < count {
                    u32::try_from((i + 1) * MEMBER_INFO_SIZE)
                        .ok()
                        .and_then(|offset| buf_ptr.checked_add(offset))
                        .ok_or(MatchingError::InvalidArg)?
                } else {
                    0
                };
                entry[0..4].copy_from_slice(&next.to_le_bytes());
                entry[4..10].copy_from_slice(&mac.octets());
            }
            mem.write(buf_ptr, &out)
                .map_err(|_| MatchingError::InvalidArg)?;
            mem.write_i32(size_ptr, out.len() as i32)
                .map_err(|_| MatchingError::InvalidArg)
        })();
        let mut out = Self::finish("get_members", result);
        if out.value == 0 {
            out.delay_us = self.delays.members_us;
        }
        out
    }

    // ========================================================================
    // Data
    // ========================================================================

    pub fn send_data(
        &self,
        mem: &dyn GuestMemory,
        id: i32,
        mac_ptr: u32,
        data_len: i32,
        data_ptr: u32,
    ) -> SyscallResult {
        let result = Self::read_mac(mem, mac_ptr).and_then(|mac| {
            if data_len <= 0 || data_ptr == 0 {
                return Err(MatchingError::InvalidDatalen(data_len));
            }
            let data = mem
                .read_bytes(data_ptr, data_len as usize)
                .map_err(|_| MatchingError::InvalidArg)?;
            self.engine.send_data(id, mac, &data)
        });
        Self::finish("send_data", result)
    }

    pub fn abort_send_data(&self, mem: &dyn GuestMemory, id: i32, mac_ptr: u32) -> SyscallResult {
        let result =
            Self::read_mac(mem, mac_ptr).and_then(|mac| self.engine.abort_send_data(id, mac));
        Self::finish("abort_send_data", result)
    }

    // ========================================================================
    // Pool
    // ========================================================================

    pub fn get_pool_stat(&self, mem: &mut dyn GuestMemory, ptr: u32) -> SyscallResult {
        let result = (|| -> Result<(), MatchingError> {
            let stat = self.engine.pool_stat()?;
            if !mem.is_valid(ptr, POOL_STAT_SIZE) {
                return Err(MatchingError::InvalidArg);
            }
            let mut out = [0u8; POOL_STAT_SIZE];
            out[0..4].copy_from_slice(&stat.pool.to_le_bytes());
            out[4..8].copy_from_slice(&stat.max.to_le_bytes());
            out[8..12].copy_from_slice(&stat.free.to_le_bytes());
            mem.write(ptr, &out).map_err(|_| MatchingError::InvalidArg)
        })();
        Self::finish("get_pool_stat", result)
    }

    pub fn get_pool_max_alloc(&self) -> SyscallResult {
        SyscallResult::ok(self.engine.pool_max_alloc() as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::matching::{ContextParams, MatchingMode, MatchingSettings, NotificationQueue};
    use crate::memory::FlatMemory;
    use crate::peers::PeerDirectory;
    use crate::socket::PdpLayer;
    use crate::test_utils::{init_test_logging, test_shim};
    use crate::translate::codes::matching as codes;

    const BASE: u32 = 0x0890_0000;
    const LOCAL: MacAddr = MacAddr([0x02, 0, 0, 0, 0x5a, 0x01]);

    fn setup(port_offset: u16) -> (MatchingSyscalls, FlatMemory) {
        init_test_logging();
        let (shim, _) = test_shim();
        let peers = Arc::new(PeerDirectory::new());
        let pdp = Arc::new(PdpLayer::new(shim, peers.clone(), LOCAL, port_offset));
        let engine = Arc::new(MatchingEngine::new(
            pdp,
            peers,
            SystemClock::shared(),
            MatchingSettings::default(),
        ));
        (
            MatchingSyscalls::new(engine, SyscallDelays::default()),
            FlatMemory::new(BASE, 0x1000),
        )
    }

    fn params(mode: MatchingMode, port: u16) -> ContextParams {
        ContextParams {
            mode: mode as i32,
            max_peers: 4,
            port,
            rx_buflen: 512,
            hello_int_us: 200_000,
            keepalive_int_us: 200_000,
            init_count: 3,
            rexmt_int_us: 100_000,
        }
    }

    fn offset() -> u16 {
        56_000 + (std::process::id() % 400) as u16 * 10
    }

    #[test]
    fn test_hello_opt_through_memory() {
        let (sys, mut mem) = setup(offset());
        sys.engine().init(4096).unwrap();
        let id = sys
            .engine()
            .create(params(MatchingMode::Parent, 3), Arc::new(NotificationQueue::new()))
            .unwrap();

        mem.write(BASE + 0x100, b"lobby").unwrap();
        assert_eq!(sys.start(&mem, id, 5, BASE + 0x100), SyscallResult::ok(0));

        assert_eq!(sys.get_hello_opt(&mut mem, id, BASE, BASE + 0x10).value, 0);
        assert_eq!(mem.read_i32(BASE).unwrap(), 5);
        assert_eq!(mem.read_bytes(BASE + 0x10, 5).unwrap(), b"lobby");

        assert_eq!(
            sys.set_hello_opt(&mem, id, 4, 0),
            SyscallResult::code(codes::INVALID_OPTLEN)
        );
        mem.write(BASE + 0x100, b"open").unwrap();
        assert_eq!(sys.set_hello_opt(&mem, id, 4, BASE + 0x100).value, 0);
        assert_eq!(sys.engine().get_hello_opt(id).unwrap(), b"open");

        assert_eq!(
            sys.get_hello_opt(&mut mem, id, 0x10, 0).value as u32,
            codes::INVALID_ARG
        );
    }

    #[test]
    fn test_members_layout() {
        let (sys, mut mem) = setup(offset() + 5);
        sys.engine().init(4096).unwrap();
        let id = sys
            .engine()
            .create(params(MatchingMode::Parent, 2), Arc::new(NotificationQueue::new()))
            .unwrap();
        assert_eq!(
            sys.get_members(&mut mem, id, BASE, 0).value as u32,
            codes::NOT_RUNNING
        );
        sys.engine().start(id, b"").unwrap();

        let sized = sys.get_members(&mut mem, id, BASE, 0);
        assert_eq!(sized, SyscallResult::delayed(0, 100));
        assert_eq!(mem.read_i32(BASE).unwrap(), MEMBER_INFO_SIZE as i32);

        mem.write_i32(BASE, 64).unwrap();
        assert_eq!(sys.get_members(&mut mem, id, BASE, BASE + 0x20).value, 0);
        assert_eq!(mem.read_i32(BASE).unwrap(), 12);
        assert_eq!(mem.read_u32(BASE + 0x20).unwrap(), 0);
        assert_eq!(mem.read_bytes(BASE + 0x24, 6).unwrap(), LOCAL.octets());
    }

    #[test]
    fn test_argument_errors() {
        let (sys, mut mem) = setup(offset());
        assert_eq!(
            sys.get_pool_stat(&mut mem, BASE).value as u32,
            codes::NOT_INITIALIZED
        );
        sys.engine().init(8192).unwrap();
        assert_eq!(sys.get_pool_stat(&mut mem, 0x10).value as u32, codes::INVALID_ARG);
        assert_eq!(sys.get_pool_stat(&mut mem, BASE).value, 0);
        assert_eq!(mem.read_u32(BASE).unwrap(), 8192);
        assert_eq!(mem.read_u32(BASE + 4).unwrap(), 4096);
        assert_eq!(mem.read_u32(BASE + 8).unwrap(), 4096);
        assert_eq!(sys.get_pool_max_alloc().value, 4096);

        mem.write(BASE + 0x40, &[0x02, 1, 2, 3, 4, 5]).unwrap();
        assert_eq!(
            sys.select_target(&mem, 1, BASE + 0x40, 0, 0).value as u32,
            codes::INVALID_ID
        );
        assert_eq!(
            sys.select_target(&mem, 1, BASE + 0x40, -1, 0).value as u32,
            codes::INVALID_OPTLEN
        );
        assert_eq!(
            sys.select_target(&mem, 1, 0x10, 0, 0).value as u32,
            codes::INVALID_ARG
        );
        assert_eq!(
            sys.send_data(&mem, 1, BASE + 0x40, 0, BASE).value as u32,
            codes::INVALID_DATALEN
        );
    }
}
