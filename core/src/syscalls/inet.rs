//! `sceNetInet*` over guest memory
//!
//! Failures return `-1` and record the guest errno, which the guest reads
//! back (and clears) through [`InetSyscalls::get_errno`] or
//! [`InetSyscalls::get_psp_error`].

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use super::{SyscallDelays, SyscallResult};
use crate::memory::{GuestMemory, MemoryError};
use crate::socket::sockaddr::{self, FD_SET_SIZE, IOVEC_SIZE, MSGHDR_SIZE, POLLFD_SIZE, SOCKADDR_SIZE};
use crate::socket::{FdSet, GuestMsgHdr, GuestSockAddr, PollFd, SocketError, SocketShim};
use crate::translate::{self, MsgFlags, guest};

/// Largest single transfer staged through host memory
const MAX_TRANSFER: usize = 1 << 20;

/// Most iovec entries accepted in one message header
const MAX_IOVECS: usize = 1024;

fn fault(e: MemoryError) -> SocketError {
    tracing::debug!(error = %e, "guest pointer rejected");
    SocketError::Native {
        errno: guest::EFAULT,
    }
}

fn invalid() -> SocketError {
    SocketError::Native {
        errno: guest::EINVAL,
    }
}

/// Address of element `index` in a guest array, faulting instead of wrapping
fn element_addr(base: u32, index: usize, stride: usize) -> Result<u32, SocketError> {
    index
        .checked_mul(stride)
        .and_then(|offset| u32::try_from(offset).ok())
        .and_then(|offset| base.checked_add(offset))
        .ok_or_else(|| fault(MemoryError { addr: base, len: (index + 1) * stride }))
}

fn transfer_len(len: i32) -> Result<usize, SocketError> {
    usize::try_from(len)
        .map(|len| len.min(MAX_TRANSFER))
        .map_err(|_| invalid())
}

/// The inet socket API as seen by the guest
pub struct InetSyscalls {
    shim: Arc<SocketShim>,
    delays: SyscallDelays,
    last_errno: AtomicI32,
}

impl InetSyscalls {
    pub fn new(shim: Arc<SocketShim>, delays: SyscallDelays) -> Self {
        Self {
            shim,
            delays,
            last_errno: AtomicI32::new(0),
        }
    }

    pub fn shim(&self) -> &Arc<SocketShim> {
        &self.shim
    }

    /// Last recorded errno without clearing it
    pub fn last_errno(&self) -> i32 {
        self.last_errno.load(Ordering::SeqCst)
    }

    fn finish(&self, op: &'static str, result: Result<i32, SocketError>, delay_us: u32) -> SyscallResult {
        match result {
            Ok(value) => SyscallResult::delayed(value, delay_us),
            Err(e) => {
                let errno = e.guest_errno();
                self.last_errno.store(errno, Ordering::SeqCst);
                if e.is_would_block() {
                    tracing::trace!(op, "would block");
                } else {
                    tracing::debug!(op, errno = translate::render::errno_name(errno), error = %e, "inet call failed");
                }
                SyscallResult::delayed(-1, delay_us)
            }
        }
    }

    /// Delay for a would-block on a socket the guest believes is blocking
    fn would_block_delay<T>(&self, id: i32, result: &Result<T, SocketError>) -> u32 {
        match result {
            Err(e) if e.is_would_block() && !self.shim.is_non_blocking(id).unwrap_or(true) => {
                self.delays.blocking_us
            }
            _ => 0,
        }
    }

    // ========================================================================
    // Errno
    // ========================================================================

    pub fn get_errno(&self) -> SyscallResult {
        SyscallResult::ok(self.last_errno.swap(0, Ordering::SeqCst))
    }

    /// Last errno as a kernel error code
    pub fn get_psp_error(&self) -> SyscallResult {
        match self.last_errno.swap(0, Ordering::SeqCst) {
            0 => SyscallResult::ok(0),
            errno => SyscallResult::code(translate::guest_errno_to_kernel(errno)),
        }
    }

    // ========================================================================
    // Guest structures
    // ========================================================================

    fn read_sockaddr(
        mem: &dyn GuestMemory,
        ptr: u32,
        len: i32,
    ) -> Result<SocketAddrV4, SocketError> {
        if len < 8 {
            return Err(SocketError::InvalidArgument("sockaddr too short"));
        }
        let len = (len as usize).min(SOCKADDR_SIZE);
        let bytes = mem.read_bytes(ptr, len).map_err(fault)?;
        GuestSockAddr::decode_inet(&bytes)
    }

    /// Store `addr` honouring the guest's buffer length; a null pointer
    /// skips the write
    fn write_sockaddr(
        mem: &mut dyn GuestMemory,
        addr: SocketAddrV4,
        ptr: u32,
        len_ptr: u32,
    ) -> Result<(), SocketError> {
        if ptr == 0 {
            return Ok(());
        }
        let capacity = if len_ptr == 0 {
            SOCKADDR_SIZE
        } else {
            usize::try_from(mem.read_i32(len_ptr).map_err(fault)?).unwrap_or(0)
        };
        let encoded = GuestSockAddr::inet(addr).encode();
        let n = capacity.min(SOCKADDR_SIZE);
        mem.write(ptr, &encoded[..n]).map_err(fault)?;
        if len_ptr != 0 {
            mem.write_i32(len_ptr, SOCKADDR_SIZE as i32).map_err(fault)?;
        }
        Ok(())
    }

    fn read_fd_set(mem: &dyn GuestMemory, ptr: u32) -> Result<Option<FdSet>, SocketError> {
        if ptr == 0 {
            return Ok(None);
        }
        let bytes = mem.read_bytes(ptr, FD_SET_SIZE).map_err(fault)?;
        FdSet::decode(&bytes).map(Some)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn socket(&self, domain: i32, ty: i32, protocol: i32) -> SyscallResult {
        self.finish("socket", self.shim.create(domain, ty, protocol), 0)
    }

    pub fn close(&self, id: i32) -> SyscallResult {
        self.finish("close", self.shim.close(id).map(|()| 0), 0)
    }

    pub fn close_with_rst(&self, id: i32) -> SyscallResult {
        self.finish("close_with_rst", self.shim.close_with_rst(id).map(|()| 0), 0)
    }

    pub fn shutdown(&self, id: i32, how: i32) -> SyscallResult {
        self.finish("shutdown", self.shim.shutdown(id, how).map(|()| 0), 0)
    }

    // ========================================================================
    // Addressing
    // ========================================================================

    pub fn bind(&self, mem: &dyn GuestMemory, id: i32, addr_ptr: u32, addr_len: i32) -> SyscallResult {
        let result = Self::read_sockaddr(mem, addr_ptr, addr_len)
            .and_then(|addr| self.shim.bind(id, addr))
            .map(|_| 0);
        self.finish("bind", result, 0)
    }

    pub fn connect(&self, mem: &dyn GuestMemory, id: i32, addr_ptr: u32, addr_len: i32) -> SyscallResult {
        let result = Self::read_sockaddr(mem, addr_ptr, addr_len)
            .and_then(|addr| self.shim.connect(id, addr))
            .map(|()| 0);
        self.finish("connect", result, 0)
    }

    pub fn listen(&self, id: i32, backlog: i32) -> SyscallResult {
        self.finish("listen", self.shim.listen(id, backlog).map(|()| 0), 0)
    }

    pub fn accept(&self, mem: &mut dyn GuestMemory, id: i32, addr_ptr: u32, len_ptr: u32) -> SyscallResult {
        let accepted = self.shim.accept(id);
        let delay = self.would_block_delay(id, &accepted);
        let result = accepted.and_then(|(new_id, from)| {
            Self::write_sockaddr(mem, from, addr_ptr, len_ptr)?;
            Ok(new_id)
        });
        self.finish("accept", result, delay)
    }

    pub fn getsockname(&self, mem: &mut dyn GuestMemory, id: i32, addr_ptr: u32, len_ptr: u32) -> SyscallResult {
        let result = Self::check_out_ptrs(mem, addr_ptr, len_ptr)
            .and_then(|()| self.shim.local_addr(id))
            .and_then(|addr| Self::write_sockaddr(mem, addr, addr_ptr, len_ptr))
            .map(|()| 0);
        self.finish("getsockname", result, 0)
    }

    pub fn getpeername(&self, mem: &mut dyn GuestMemory, id: i32, addr_ptr: u32, len_ptr: u32) -> SyscallResult {
        let result = Self::check_out_ptrs(mem, addr_ptr, len_ptr)
            .and_then(|()| self.shim.peer_addr(id))
            .and_then(|addr| Self::write_sockaddr(mem, addr, addr_ptr, len_ptr))
            .map(|()| 0);
        self.finish("getpeername", result, 0)
    }

    fn check_out_ptrs(mem: &dyn GuestMemory, addr_ptr: u32, len_ptr: u32) -> Result<(), SocketError> {
        if mem.is_valid(addr_ptr, 8) && mem.is_valid(len_ptr, 4) {
            Ok(())
        } else {
            Err(SocketError::Native {
                errno: guest::EFAULT,
            })
        }
    }

    // ========================================================================
    // Data transfer
    // ========================================================================

    pub fn send(&self, mem: &dyn GuestMemory, id: i32, buf_ptr: u32, len: i32, flags: u32) -> SyscallResult {
        let result = transfer_len(len)
            .and_then(|len| mem.read_bytes(buf_ptr, len).map_err(fault))
            .and_then(|data| self.shim.send(id, &data, MsgFlags::from_bits_truncate(flags)));
        let delay = self.would_block_delay(id, &result);
        self.finish("send", result.map(|n| n as i32), delay)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn send_to(
        &self,
        mem: &dyn GuestMemory,
        id: i32,
        buf_ptr: u32,
        len: i32,
        flags: u32,
        to_ptr: u32,
        to_len: i32,
    ) -> SyscallResult {
        let flags = MsgFlags::from_bits_truncate(flags);
        let result = transfer_len(len)
            .and_then(|len| mem.read_bytes(buf_ptr, len).map_err(fault))
            .and_then(|data| {
                if to_ptr == 0 {
                    return self.shim.send(id, &data, flags);
                }
                let to = Self::read_sockaddr(mem, to_ptr, to_len)?;
                self.shim.send_to(id, &data, flags, to)
            });
        let delay = self.would_block_delay(id, &result);
        self.finish("sendto", result.map(|n| n as i32), delay)
    }

    pub fn recv(&self, mem: &mut dyn GuestMemory, id: i32, buf_ptr: u32, len: i32, flags: u32) -> SyscallResult {
        let result = transfer_len(len).and_then(|len| {
            let mut buf = vec![0u8; len];
            let n = self
                .shim
                .recv(id, &mut buf, MsgFlags::from_bits_truncate(flags))?;
            mem.write(buf_ptr, &buf[..n]).map_err(fault)?;
            Ok(n as i32)
        });
        self.finish("recv", result, self.delays.blocking_us)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn recv_from(
        &self,
        mem: &mut dyn GuestMemory,
        id: i32,
        buf_ptr: u32,
        len: i32,
        flags: u32,
        from_ptr: u32,
        from_len_ptr: u32,
    ) -> SyscallResult {
        let result = transfer_len(len).and_then(|len| {
            let mut buf = vec![0u8; len];
            let (n, from) = self
                .shim
                .recv_from(id, &mut buf, MsgFlags::from_bits_truncate(flags))?;
            mem.write(buf_ptr, &buf[..n]).map_err(fault)?;
            Self::write_sockaddr(mem, from, from_ptr, from_len_ptr)?;
            Ok(n as i32)
        });
        self.finish("recvfrom", result, self.delays.blocking_us)
    }

    // ========================================================================
    // Message headers
    // ========================================================================

    fn read_msghdr(mem: &dyn GuestMemory, ptr: u32) -> Result<GuestMsgHdr, SocketError> {
        let bytes = mem.read_bytes(ptr, MSGHDR_SIZE).map_err(fault)?;
        GuestMsgHdr::decode(&bytes)
    }

    /// Non-empty guest buffers named by the header's iovec array, capped to
    /// one transfer in total
    fn read_iovecs(mem: &dyn GuestMemory, hdr: &GuestMsgHdr) -> Result<Vec<(u32, usize)>, SocketError> {
        let count = usize::try_from(hdr.iov_len).map_err(|_| invalid())?;
        if count > MAX_IOVECS {
            return Err(invalid());
        }
        if count > 0 && hdr.iov == 0 {
            return Err(fault(MemoryError {
                addr: 0,
                len: count * IOVEC_SIZE,
            }));
        }
        let mut total = 0;
        let mut buffers = Vec::with_capacity(count);
        for i in 0..count {
            let bytes = mem
                .read_bytes(element_addr(hdr.iov, i, IOVEC_SIZE)?, IOVEC_SIZE)
                .map_err(fault)?;
            let (base, len) = sockaddr::decode_iovec(&bytes)?;
            let len = (len as usize).min(MAX_TRANSFER - total);
            if base == 0 || len == 0 {
                continue;
            }
            total += len;
            buffers.push((base, len));
        }
        Ok(buffers)
    }

    /// Gather the iovecs, translate the control messages and send
    pub fn send_msg(&self, mem: &dyn GuestMemory, id: i32, msghdr_ptr: u32, flags: u32) -> SyscallResult {
        let result = (|| -> Result<usize, SocketError> {
            let hdr = Self::read_msghdr(mem, msghdr_ptr)?;
            let mut data = Vec::new();
            for (base, len) in Self::read_iovecs(mem, &hdr)? {
                data.extend_from_slice(&mem.read_bytes(base, len).map_err(fault)?);
            }
            let control = if hdr.control == 0 || hdr.control_len == 0 {
                Vec::new()
            } else {
                let len = hdr.control_len as usize;
                if len > MAX_TRANSFER {
                    return Err(invalid());
                }
                sockaddr::decode_control(&mem.read_bytes(hdr.control, len).map_err(fault)?)?
            };
            let to = if hdr.name == 0 {
                None
            } else {
                let len = i32::try_from(hdr.name_len).map_err(|_| invalid())?;
                Some(Self::read_sockaddr(mem, hdr.name, len)?)
            };
            self.shim
                .send_msg(id, &data, &control, MsgFlags::from_bits_truncate(flags), to)
        })();
        let delay = self.would_block_delay(id, &result);
        self.finish("sendmsg", result.map(|n| n as i32), delay)
    }

    /// Receive into the iovecs and write the header back with the source
    /// address, control messages and result flags
    pub fn recv_msg(&self, mem: &mut dyn GuestMemory, id: i32, msghdr_ptr: u32, flags: u32) -> SyscallResult {
        let result = (|| -> Result<i32, SocketError> {
            let mut hdr = Self::read_msghdr(mem, msghdr_ptr)?;
            let buffers = Self::read_iovecs(mem, &hdr)?;
            let control_capacity = if hdr.control == 0 {
                0
            } else {
                (hdr.control_len as usize).min(MAX_TRANSFER)
            };
            let mut buf = vec![0u8; buffers.iter().map(|(_, len)| len).sum()];
            let message = self.shim.recv_msg(
                id,
                &mut buf,
                control_capacity,
                MsgFlags::from_bits_truncate(flags),
            )?;

            let mut rest = &buf[..message.len.min(buf.len())];
            for (base, len) in buffers {
                if rest.is_empty() {
                    break;
                }
                let n = len.min(rest.len());
                mem.write(base, &rest[..n]).map_err(fault)?;
                rest = &rest[n..];
            }

            let mut out_flags = message.flags;
            if hdr.name != 0 {
                hdr.name_len = match message.from {
                    Some(from) => {
                        let n = (hdr.name_len as usize).min(SOCKADDR_SIZE);
                        mem.write(hdr.name, &GuestSockAddr::inet(from).encode()[..n])
                            .map_err(fault)?;
                        n as u32
                    }
                    None => 0,
                };
            }
            hdr.control_len = 0;
            if control_capacity > 0 {
                let (bytes, truncated) = sockaddr::encode_control(&message.control, control_capacity);
                mem.write(hdr.control, &bytes).map_err(fault)?;
                hdr.control_len = bytes.len() as u32;
                if truncated {
                    out_flags |= MsgFlags::CTRUNC;
                }
            }
            hdr.flags = out_flags.bits() as i32;
            mem.write(msghdr_ptr, &hdr.encode()).map_err(fault)?;
            Ok(message.len as i32)
        })();
        self.finish("recvmsg", result, self.delays.blocking_us)
    }

    /// Shut a socket down in both directions; the id stays open
    pub fn socket_abort(&self, id: i32) -> SyscallResult {
        self.finish("socket_abort", self.shim.abort(id).map(|()| 0), 0)
    }

    // ========================================================================
    // Options
    // ========================================================================

    pub fn setsockopt(
        &self,
        mem: &dyn GuestMemory,
        id: i32,
        level: i32,
        name: i32,
        value_ptr: u32,
        value_len: i32,
    ) -> SyscallResult {
        let result = usize::try_from(value_len)
            .map_err(|_| invalid())
            .and_then(|len| mem.read_bytes(value_ptr, len).map_err(fault))
            .and_then(|value| self.shim.set_option(id, level, name, &value))
            .map(|()| 0);
        self.finish("setsockopt", result, 0)
    }

    pub fn getsockopt(
        &self,
        mem: &mut dyn GuestMemory,
        id: i32,
        level: i32,
        name: i32,
        value_ptr: u32,
        len_ptr: u32,
    ) -> SyscallResult {
        let result = (|| -> Result<i32, SocketError> {
            let capacity = usize::try_from(mem.read_i32(len_ptr).map_err(fault)?)
                .map_err(|_| invalid())?;
            let value = self.shim.get_option(id, level, name)?;
            let n = capacity.min(value.len());
            mem.write(value_ptr, &value[..n]).map_err(fault)?;
            mem.write_i32(len_ptr, n as i32).map_err(fault)?;
            Ok(0)
        })();
        self.finish("getsockopt", result, 0)
    }

    // ========================================================================
    // Readiness
    // ========================================================================

    pub fn select(
        &self,
        mem: &mut dyn GuestMemory,
        nfds: i32,
        read_ptr: u32,
        write_ptr: u32,
        except_ptr: u32,
        timeout_ptr: u32,
    ) -> SyscallResult {
        let result = (|| -> Result<i32, SocketError> {
            let mut read = Self::read_fd_set(mem, read_ptr)?;
            let mut write = Self::read_fd_set(mem, write_ptr)?;
            let mut except = Self::read_fd_set(mem, except_ptr)?;
            let timeout_us = if timeout_ptr == 0 {
                None
            } else {
                let bytes = mem
                    .read_bytes(timeout_ptr, sockaddr::TIMEVAL_SIZE)
                    .map_err(fault)?;
                Some(sockaddr::decode_timeval_us(&bytes)?)
            };

            let ready = self
                .shim
                .select(nfds, read.as_mut(), write.as_mut(), except.as_mut(), timeout_us)?;

            for (ptr, set) in [(read_ptr, read), (write_ptr, write), (except_ptr, except)] {
                if let Some(set) = set {
                    mem.write(ptr, &set.encode()).map_err(fault)?;
                }
            }
            Ok(ready as i32)
        })();
        self.finish("select", result, self.delays.blocking_us)
    }

    /// `timeout_us < 0` waits up to the configured maximum
    pub fn poll(&self, mem: &mut dyn GuestMemory, fds_ptr: u32, nfds: u32, timeout_us: i32) -> SyscallResult {
        let result = (|| -> Result<i32, SocketError> {
            if nfds as usize > guest::FD_SETSIZE {
                return Err(invalid());
            }
            let mut fds = Vec::with_capacity(nfds as usize);
            for i in 0..nfds as usize {
                let bytes = mem
                    .read_bytes(element_addr(fds_ptr, i, POLLFD_SIZE)?, POLLFD_SIZE)
                    .map_err(fault)?;
                fds.push(PollFd::decode(&bytes)?);
            }

            let timeout = u64::try_from(timeout_us).ok();
            let ready = self.shim.poll(&mut fds, timeout)?;

            for (i, fd) in fds.iter().enumerate() {
                mem.write(element_addr(fds_ptr, i, POLLFD_SIZE)?, &fd.encode())
                    .map_err(fault)?;
            }
            Ok(ready as i32)
        })();
        self.finish("poll", result, self.delays.poll_us)
    }

    // ========================================================================
    // Address conversion
    // ========================================================================

    /// Dotted quad to an address in network byte order; `-1` (INADDR_NONE)
    /// when malformed
    pub fn inet_addr(&self, text: &str) -> SyscallResult {
        match text.trim().parse::<Ipv4Addr>() {
            Ok(ip) => SyscallResult::ok(u32::from_le_bytes(ip.octets()) as i32),
            Err(_) => SyscallResult::ok(-1),
        }
    }

    /// Returns 1 and stores the address, or 0 when `text` is malformed
    pub fn inet_aton(&self, mem: &mut dyn GuestMemory, text: &str, out_ptr: u32) -> SyscallResult {
        let Ok(ip) = text.trim().parse::<Ipv4Addr>() else {
            return SyscallResult::ok(0);
        };
        let result = mem.write(out_ptr, &ip.octets()).map_err(fault).map(|()| 1);
        self.finish("inet_aton", result, 0)
    }

    pub fn inet_pton(&self, mem: &mut dyn GuestMemory, family: i32, text: &str, out_ptr: u32) -> SyscallResult {
        if family != guest::AF_INET {
            return self.finish("inet_pton", Err(SocketError::FamilyNotSupported(family)), 0);
        }
        self.inet_aton(mem, text, out_ptr)
    }

    /// Renders the address at `src_ptr` into `dst_ptr`; returns `dst_ptr`,
    /// or 0 with ENOSPC when the buffer is too small
    pub fn inet_ntop(
        &self,
        mem: &mut dyn GuestMemory,
        family: i32,
        src_ptr: u32,
        dst_ptr: u32,
        size: u32,
    ) -> SyscallResult {
        let result = (|| -> Result<i32, SocketError> {
            if family != guest::AF_INET {
                return Err(SocketError::FamilyNotSupported(family));
            }
            let mut octets = [0u8; 4];
            mem.read(src_ptr, &mut octets).map_err(fault)?;
            let mut text = Ipv4Addr::from(octets).to_string().into_bytes();
            text.push(0);
            if text.len() > size as usize {
                return Err(SocketError::Native {
                    errno: guest::ENOSPC,
                });
            }
            mem.write(dst_ptr, &text).map_err(fault)?;
            Ok(dst_ptr as i32)
        })();
        let failed = result.is_err();
        let mut out = self.finish("inet_ntop", result, 0);
        if failed {
            out.value = 0;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::memory::FlatMemory;
    use crate::test_utils::{init_test_logging, test_shim};
    use crate::socket::ControlMessage;
    use crate::translate::guest::PollEvents;

    const BASE: u32 = 0x0880_0000;

    fn setup() -> (InetSyscalls, FlatMemory) {
        init_test_logging();
        let (shim, _) = test_shim();
        (
            InetSyscalls::new(shim, SyscallDelays::default()),
            FlatMemory::new(BASE, 0x4000),
        )
    }

    fn write_addr(mem: &mut FlatMemory, ptr: u32, addr: SocketAddrV4) {
        mem.write(ptr, &GuestSockAddr::inet(addr).encode()).unwrap();
    }

    fn read_addr(mem: &FlatMemory, ptr: u32) -> SocketAddrV4 {
        GuestSockAddr::decode_inet(&mem.read_bytes(ptr, SOCKADDR_SIZE).unwrap()).unwrap()
    }

    /// UDP socket bound to an ephemeral loopback port
    fn bound_udp(inet: &InetSyscalls, mem: &mut FlatMemory, scratch: u32) -> (i32, SocketAddrV4) {
        let id = inet
            .socket(guest::AF_INET, guest::SOCK_DGRAM, guest::IPPROTO_UDP)
            .value;
        assert!(id >= 61);
        write_addr(mem, scratch, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        assert_eq!(inet.bind(mem, id, scratch, 16).value, 0);
        mem.write_i32(scratch + 16, 16).unwrap();
        assert_eq!(inet.getsockname(mem, id, scratch, scratch + 16).value, 0);
        (id, read_addr(mem, scratch))
    }

    #[test]
    fn test_errno_is_recorded_and_cleared() {
        let (inet, _) = setup();
        let id = inet
            .socket(guest::AF_INET, guest::SOCK_STREAM, guest::IPPROTO_TCP)
            .value;
        assert_eq!(inet.close(id), SyscallResult::ok(0));
        assert_eq!(inet.close(id).value, -1);
        assert_eq!(inet.get_errno().value, guest::EBADF);
        assert_eq!(inet.get_errno().value, 0);

        assert_eq!(inet.socket(guest::AF_INET6, guest::SOCK_DGRAM, 0).value, -1);
        assert_eq!(
            inet.get_psp_error().value,
            translate::guest_errno_to_kernel(guest::EAFNOSUPPORT) as i32
        );
        assert_eq!(inet.get_psp_error().value, 0);
    }

    #[test]
    fn test_udp_sendto_recvfrom() {
        let (inet, mut mem) = setup();
        let (a, addr_a) = bound_udp(&inet, &mut mem, BASE);
        let (b, addr_b) = bound_udp(&inet, &mut mem, BASE + 0x40);
        assert_ne!(addr_b.port(), 0);

        let recv = inet.recv(&mut mem, b, BASE + 0x200, 64, 0);
        assert_eq!(recv, SyscallResult::delayed(-1, 500));
        assert_eq!(inet.get_errno().value, guest::EAGAIN);

        mem.write(BASE + 0x100, b"ping").unwrap();
        write_addr(&mut mem, BASE + 0x80, addr_b);
        let sent = inet.send_to(&mem, a, BASE + 0x100, 4, 0, BASE + 0x80, 16);
        assert_eq!(sent.value, 4);
        thread::sleep(Duration::from_millis(20));

        mem.write_i32(BASE + 0x300, 16).unwrap();
        let got = inet.recv_from(&mut mem, b, BASE + 0x200, 64, 0, BASE + 0x310, BASE + 0x300);
        assert_eq!(got, SyscallResult::delayed(4, 500));
        assert_eq!(mem.read_bytes(BASE + 0x200, 4).unwrap(), b"ping");
        assert_eq!(read_addr(&mem, BASE + 0x310).port(), addr_a.port());
        assert_eq!(mem.read_i32(BASE + 0x300).unwrap(), 16);
    }

    #[test]
    fn test_bad_pointers_fault() {
        let (inet, mut mem) = setup();
        let id = inet
            .socket(guest::AF_INET, guest::SOCK_DGRAM, guest::IPPROTO_UDP)
            .value;
        assert_eq!(inet.send(&mem, id, 0x10, 4, 0).value, -1);
        assert_eq!(inet.get_errno().value, guest::EFAULT);
        assert_eq!(inet.getsockname(&mut mem, id, 0x10, 0x20).value, -1);
        assert_eq!(inet.get_errno().value, guest::EFAULT);
        assert_eq!(inet.bind(&mem, id, BASE, 4).value, -1);
        assert_eq!(inet.get_errno().value, guest::EINVAL);
    }

    fn write_msghdr(mem: &mut FlatMemory, ptr: u32, hdr: GuestMsgHdr) {
        mem.write(ptr, &hdr.encode()).unwrap();
    }

    fn write_iovecs(mem: &mut FlatMemory, ptr: u32, buffers: &[(u32, u32)]) {
        for (i, &(base, len)) in buffers.iter().enumerate() {
            mem.write(ptr + (i * IOVEC_SIZE) as u32, &sockaddr::encode_iovec(base, len))
                .unwrap();
        }
    }

    #[test]
    fn test_sendmsg_recvmsg_gather_and_scatter() {
        let (inet, mut mem) = setup();
        let (a, addr_a) = bound_udp(&inet, &mut mem, BASE);
        let (b, addr_b) = bound_udp(&inet, &mut mem, BASE + 0x40);

        mem.write(BASE + 0x100, b"hello ").unwrap();
        mem.write(BASE + 0x110, b"world").unwrap();
        write_iovecs(&mut mem, BASE + 0x200, &[(BASE + 0x100, 6), (0, 9), (BASE + 0x110, 5)]);
        write_addr(&mut mem, BASE + 0x240, addr_b);
        let (control, _) = sockaddr::encode_control(
            &[ControlMessage {
                level: guest::IPPROTO_IP,
                ty: guest::IP_TTL,
                data: 32i32.to_le_bytes().to_vec(),
            }],
            64,
        );
        mem.write(BASE + 0x280, &control).unwrap();
        write_msghdr(&mut mem, BASE + 0x300, GuestMsgHdr {
            name: BASE + 0x240,
            name_len: 16,
            iov: BASE + 0x200,
            iov_len: 3,
            control: BASE + 0x280,
            control_len: control.len() as u32,
            flags: 0,
        });
        assert_eq!(inet.send_msg(&mem, a, BASE + 0x300, 0).value, 11);
        thread::sleep(Duration::from_millis(20));

        write_iovecs(&mut mem, BASE + 0x500, &[(BASE + 0x400, 4), (BASE + 0x410, 16)]);
        write_msghdr(&mut mem, BASE + 0x600, GuestMsgHdr {
            name: BASE + 0x540,
            name_len: 16,
            iov: BASE + 0x500,
            iov_len: 2,
            control: 0,
            control_len: 0,
            flags: 0,
        });
        assert_eq!(inet.recv_msg(&mut mem, b, BASE + 0x600, 0).value, 11);
        assert_eq!(mem.read_bytes(BASE + 0x400, 4).unwrap(), b"hell");
        assert_eq!(mem.read_bytes(BASE + 0x410, 7).unwrap(), b"o world");
        assert_eq!(read_addr(&mem, BASE + 0x540).port(), addr_a.port());
        let hdr = GuestMsgHdr::decode(&mem.read_bytes(BASE + 0x600, MSGHDR_SIZE).unwrap()).unwrap();
        assert_eq!((hdr.name_len, hdr.control_len, hdr.flags), (16, 0, 0));

        // Nothing left to read
        assert_eq!(inet.recv_msg(&mut mem, b, BASE + 0x600, 0).value, -1);
        assert_eq!(inet.get_errno().value, guest::EAGAIN);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_recvmsg_control_messages() {
        let (inet, mut mem) = setup();
        let (a, _) = bound_udp(&inet, &mut mem, BASE);
        let (b, addr_b) = bound_udp(&inet, &mut mem, BASE + 0x40);
        mem.write_i32(BASE + 0x80, 1).unwrap();
        assert_eq!(
            inet.setsockopt(&mem, b, guest::SOL_SOCKET, guest::SO_TIMESTAMP, BASE + 0x80, 4)
                .value,
            0
        );

        mem.write(BASE + 0x100, b"ab").unwrap();
        write_addr(&mut mem, BASE + 0x140, addr_b);
        write_iovecs(&mut mem, BASE + 0x500, &[(BASE + 0x400, 16)]);
        for capacity in [64, 12] {
            inet.send_to(&mem, a, BASE + 0x100, 2, 0, BASE + 0x140, 16);
            thread::sleep(Duration::from_millis(20));
            write_msghdr(&mut mem, BASE + 0x600, GuestMsgHdr {
                iov: BASE + 0x500,
                iov_len: 1,
                control: BASE + 0x700,
                control_len: capacity,
                ..GuestMsgHdr::default()
            });
            assert_eq!(inet.recv_msg(&mut mem, b, BASE + 0x600, 0).value, 2);
            let hdr = GuestMsgHdr::decode(&mem.read_bytes(BASE + 0x600, MSGHDR_SIZE).unwrap())
                .unwrap();
            let flags = MsgFlags::from_bits_truncate(hdr.flags as u32);
            if capacity == 64 {
                assert_eq!(hdr.control_len, 20);
                assert!(!flags.contains(MsgFlags::CTRUNC));
                let control = mem.read_bytes(BASE + 0x700, 20).unwrap();
                let messages = sockaddr::decode_control(&control).unwrap();
                assert_eq!(messages.len(), 1);
                assert_eq!((messages[0].level, messages[0].ty), (guest::SOL_SOCKET, guest::SCM_TIMESTAMP));
            } else {
                assert_eq!(hdr.control_len, 0);
                assert!(flags.contains(MsgFlags::CTRUNC));
            }
        }
    }

    #[test]
    fn test_message_header_errors() {
        let (inet, mut mem) = setup();
        let (a, _) = bound_udp(&inet, &mut mem, BASE);
        assert_eq!(inet.send_msg(&mem, a, 0x10, 0).value, -1);
        assert_eq!(inet.get_errno().value, guest::EFAULT);

        write_msghdr(&mut mem, BASE + 0x300, GuestMsgHdr {
            iov_len: -1,
            ..GuestMsgHdr::default()
        });
        assert_eq!(inet.recv_msg(&mut mem, a, BASE + 0x300, 0).value, -1);
        assert_eq!(inet.get_errno().value, guest::EINVAL);

        write_msghdr(&mut mem, BASE + 0x300, GuestMsgHdr {
            iov_len: 1,
            ..GuestMsgHdr::default()
        });
        assert_eq!(inet.send_msg(&mem, a, BASE + 0x300, 0).value, -1);
        assert_eq!(inet.get_errno().value, guest::EFAULT);
    }

    #[test]
    fn test_socket_abort() {
        let (inet, mut mem) = setup();
        let (a, _) = bound_udp(&inet, &mut mem, BASE);
        assert_eq!(inet.socket_abort(a), SyscallResult::ok(0));
        assert!(inet.shim().registry().contains(a));
        assert_eq!(inet.close(a).value, 0);
        assert_eq!(inet.socket_abort(a).value, -1);
        assert_eq!(inet.get_errno().value, guest::EBADF);
    }

    #[test]
    fn test_select_reports_readable_socket() {
        let (inet, mut mem) = setup();
        let (a, _) = bound_udp(&inet, &mut mem, BASE);
        let (b, addr_b) = bound_udp(&inet, &mut mem, BASE + 0x40);

        let mut set = FdSet::new();
        set.insert(b);
        mem.write(BASE + 0x400, &set.encode()).unwrap();
        mem.write(BASE + 0x440, &sockaddr::encode_timeval(0)).unwrap();
        let idle = inet.select(&mut mem, b + 1, BASE + 0x400, 0, 0, BASE + 0x440);
        assert_eq!(idle, SyscallResult::delayed(0, 500));

        mem.write(BASE + 0x100, b"x").unwrap();
        write_addr(&mut mem, BASE + 0x80, addr_b);
        inet.send_to(&mem, a, BASE + 0x100, 1, 0, BASE + 0x80, 16);
        thread::sleep(Duration::from_millis(20));

        mem.write(BASE + 0x400, &set.encode()).unwrap();
        mem.write(BASE + 0x440, &sockaddr::encode_timeval(100_000)).unwrap();
        let ready = inet.select(&mut mem, b + 1, BASE + 0x400, 0, 0, BASE + 0x440);
        assert_eq!(ready.value, 1);
        let out = FdSet::decode(&mem.read_bytes(BASE + 0x400, FD_SET_SIZE).unwrap()).unwrap();
        assert!(out.contains(b));
        assert!(!out.contains(a));

        assert_eq!(inet.select(&mut mem, 300, BASE + 0x400, 0, 0, 0).value, -1);
        assert_eq!(inet.get_errno().value, guest::EINVAL);
    }

    #[test]
    fn test_poll_marks_unknown_ids() {
        let (inet, mut mem) = setup();
        let pfd = PollFd {
            fd: 250,
            events: PollEvents::IN,
            revents: PollEvents::empty(),
        };
        mem.write(BASE, &pfd.encode()).unwrap();
        let result = inet.poll(&mut mem, BASE, 1, 0);
        assert_eq!(result.delay_us, 1000);
        let out = PollFd::decode(&mem.read_bytes(BASE, POLLFD_SIZE).unwrap()).unwrap();
        assert!(out.revents.contains(PollEvents::NVAL));

        assert_eq!(inet.poll(&mut mem, BASE, 257, 0).value, -1);
        assert_eq!(inet.get_errno().value, guest::EINVAL);
    }

    #[test]
    fn test_poll_array_at_top_of_address_space() {
        let (inet, _) = setup();
        let mut mem = FlatMemory::new(0xFFFF_FF00, 0x100);
        assert_eq!(inet.poll(&mut mem, 0xFFFF_FFFC, 2, 0).value, -1);
        assert_eq!(inet.get_errno().value, guest::EFAULT);

        // The first entry is mapped, the second would wrap past the top
        let last = 0xFFFF_FFFF - POLLFD_SIZE as u32 + 1;
        let pfd = PollFd {
            fd: 250,
            events: PollEvents::IN,
            revents: PollEvents::empty(),
        };
        mem.write(last, &pfd.encode()).unwrap();
        assert_eq!(inet.poll(&mut mem, last, 2, 0).value, -1);
        assert_eq!(inet.get_errno().value, guest::EFAULT);

        assert_eq!(element_addr(0x100, 2, POLLFD_SIZE).ok(), Some(0x100 + 2 * POLLFD_SIZE as u32));
        assert!(element_addr(u32::MAX, 1, POLLFD_SIZE).is_err());
    }

    #[test]
    fn test_socket_options_through_memory() {
        let (inet, mut mem) = setup();
        let id = inet
            .socket(guest::AF_INET, guest::SOCK_DGRAM, guest::IPPROTO_UDP)
            .value;
        mem.write_u32(BASE, 16 * 1024 * 1024).unwrap();
        let set = inet.setsockopt(&mem, id, guest::SOL_SOCKET, guest::SO_RCVBUF, BASE, 4);
        assert_eq!(set.value, -1);
        assert_eq!(inet.get_errno().value, guest::ENOBUFS);

        mem.write_u32(BASE, 1).unwrap();
        assert_eq!(
            inet.setsockopt(&mem, id, guest::SOL_SOCKET, guest::SO_NBIO, BASE, 4).value,
            0
        );
        assert!(inet.shim().is_non_blocking(id).unwrap());

        mem.write_i32(BASE + 0x10, 4).unwrap();
        let got = inet.getsockopt(&mut mem, id, guest::SOL_SOCKET, guest::SO_RCVBUF, BASE + 0x20, BASE + 0x10);
        assert_eq!(got.value, 0);
        assert_eq!(mem.read_i32(BASE + 0x10).unwrap(), 4);
        assert!(mem.read_u32(BASE + 0x20).unwrap() > 0);
    }

    #[test]
    fn test_address_conversion() {
        let (inet, mut mem) = setup();
        assert_eq!(
            inet.inet_addr("10.0.0.5").value as u32,
            u32::from_le_bytes([10, 0, 0, 5])
        );
        assert_eq!(inet.inet_addr("10.0.0").value, -1);

        assert_eq!(inet.inet_aton(&mut mem, "192.168.1.2", BASE).value, 1);
        assert_eq!(mem.read_bytes(BASE, 4).unwrap(), [192, 168, 1, 2]);
        assert_eq!(inet.inet_aton(&mut mem, "bogus", BASE).value, 0);

        let out = inet.inet_ntop(&mut mem, guest::AF_INET, BASE, BASE + 0x10, 16);
        assert_eq!(out.value as u32, BASE + 0x10);
        assert_eq!(mem.read_bytes(BASE + 0x10, 12).unwrap(), b"192.168.1.2\0");

        assert_eq!(inet.inet_ntop(&mut mem, guest::AF_INET, BASE, BASE + 0x10, 4).value, 0);
        assert_eq!(inet.get_errno().value, guest::ENOSPC);
    }
}
