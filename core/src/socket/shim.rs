//! Guest-facing socket operations
//!
//! Every operation resolves the guest id through the [`SocketRegistry`],
//! translates arguments with [`crate::translate`], and forwards to the
//! native socket. Native sockets are always non-blocking: a call that would
//! block returns `EAGAIN` in guest numbering and is never retried here.

use std::io;
use std::mem::{self, MaybeUninit};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use smallvec::SmallVec;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use super::SocketError;
use super::options;
use super::registry::{GuestSocket, SocketMeta, SocketOwner, SocketRegistry};
use super::sockaddr::{self, ControlMessage, FdSet, PollFd};
use crate::port::{PortManager, PortProtocol};
use crate::translate::{self, MsgFlags, PollEvents, guest};

/// Tunables for the socket shim
#[derive(Debug, Clone)]
pub struct ShimSettings {
    /// External address used to discover the outbound interface
    pub route_probe: SocketAddr,
    /// Upper bound for a guest connect on a blocking socket
    pub connect_timeout: Duration,
    /// Cap applied to select/poll waits, including "wait forever"
    pub max_wait_us: u64,
    /// Announce bound ports to the port manager
    pub forward_ports: bool,
}

impl Default for ShimSettings {
    fn default() -> Self {
        Self {
            route_probe: SocketAddr::from(([8, 8, 8, 8], 80)),
            connect_timeout: Duration::from_secs(5),
            max_wait_us: 5_543_210,
            forward_ports: true,
        }
    }
}

/// Address of the interface that routes to `probe`, or loopback
///
/// Connecting a UDP socket sends nothing; it only asks the kernel for a
/// route.
pub fn routable_local_ip(probe: SocketAddr) -> Ipv4Addr {
    if let Ok(socket) = UdpSocket::bind("0.0.0.0:0") {
        if socket.connect(probe).is_ok() {
            if let Ok(SocketAddr::V4(addr)) = socket.local_addr() {
                if !addr.ip().is_unspecified() {
                    return *addr.ip();
                }
            }
        }
    }
    Ipv4Addr::LOCALHOST
}

fn as_uninit(buf: &mut [u8]) -> &mut [MaybeUninit<u8>] {
    // SAFETY: MaybeUninit<u8> has the same layout as u8, and the socket
    // only ever writes initialised bytes into the buffer.
    unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) }
}

fn sockaddr_v4(addr: &SockAddr) -> Result<SocketAddrV4, SocketError> {
    addr.as_socket_ipv4()
        .ok_or(SocketError::FamilyNotSupported(guest::AF_INET6))
}

#[allow(unused_unsafe)]
fn cmsg_space(len: usize) -> usize {
    // SAFETY: pure arithmetic on the length
    unsafe { libc::CMSG_SPACE(len as libc::c_uint) as usize }
}

#[allow(unused_unsafe)]
fn cmsg_len(len: usize) -> usize {
    // SAFETY: pure arithmetic on the length
    unsafe { libc::CMSG_LEN(len as libc::c_uint) as usize }
}

/// Guest form of a received host control message
///
/// Timestamps are narrowed to the guest `timeval`; anything without a guest
/// counterpart is dropped.
fn control_to_guest(message: ControlMessage) -> Option<ControlMessage> {
    let Some((level, ty)) = translate::cmsg_to_guest(message.level, message.ty) else {
        tracing::debug!(level = message.level, ty = message.ty, "dropping untranslatable control message");
        return None;
    };
    let data = if (level, ty) == (guest::SOL_SOCKET, guest::SCM_TIMESTAMP) {
        if message.data.len() < mem::size_of::<libc::timeval>() {
            return None;
        }
        // SAFETY: the length was checked and read_unaligned accepts any
        // alignment.
        let tv: libc::timeval = unsafe { std::ptr::read_unaligned(message.data.as_ptr().cast()) };
        let us = (tv.tv_sec.max(0) as u64) * 1_000_000 + tv.tv_usec.max(0) as u64;
        sockaddr::encode_timeval(us).to_vec()
    } else {
        message.data
    };
    Some(ControlMessage { level, ty, data })
}

/// Result of [`SocketShim::recv_msg`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub len: usize,
    /// Source address, when the socket reports one
    pub from: Option<SocketAddrV4>,
    /// Ancillary data in guest numbering
    pub control: Vec<ControlMessage>,
    pub flags: MsgFlags,
}

/// Guest socket API over native sockets
pub struct SocketShim {
    registry: Arc<SocketRegistry>,
    ports: Arc<dyn PortManager>,
    settings: ShimSettings,
}

impl SocketShim {
    pub fn new(
        registry: Arc<SocketRegistry>,
        ports: Arc<dyn PortManager>,
        settings: ShimSettings,
    ) -> Self {
        Self {
            registry,
            ports,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<SocketRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &ShimSettings {
        &self.settings
    }

    /// Routable address the guest sees instead of a wildcard
    pub fn local_ip(&self) -> Ipv4Addr {
        routable_local_ip(self.settings.route_probe)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// `socket()` for the inet API
    pub fn create(&self, domain: i32, ty: i32, protocol: i32) -> Result<i32, SocketError> {
        self.create_owned(SocketOwner::Inet, domain, ty, protocol)
    }

    pub fn create_owned(
        &self,
        owner: SocketOwner,
        domain: i32,
        ty: i32,
        protocol: i32,
    ) -> Result<i32, SocketError> {
        let (base_type, flags) = translate::split_socket_type(ty);
        if domain != guest::AF_INET {
            tracing::warn!(domain = %translate::render::domain_name(domain), "unsupported socket domain");
            return Err(SocketError::FamilyNotSupported(domain));
        }
        let host_domain = translate::DOMAINS
            .to_host(domain)
            .ok_or(SocketError::FamilyNotSupported(domain))?;
        let host_type = translate::SOCKET_TYPES
            .to_host(base_type)
            .ok_or(SocketError::TypeNotSupported(base_type))?;
        let host_protocol = match protocol {
            guest::IPPROTO_IP => None,
            p => Some(
                translate::PROTOCOLS
                    .to_host(p)
                    .ok_or(SocketError::ProtocolNotSupported(p))?,
            ),
        };

        let native = Socket::new(
            Domain::from(host_domain),
            Type::from(host_type),
            host_protocol.map(Protocol::from),
        )?;
        native.set_nonblocking(true)?;
        native.set_reuse_address(true)?;
        native.set_reuse_port(true)?;
        if owner == SocketOwner::Adhoc && base_type == guest::SOCK_DGRAM {
            native.set_broadcast(true)?;
        }

        let mut meta = SocketMeta::new(owner, domain, base_type, protocol);
        meta.non_blocking = flags.contains(translate::SocketTypeFlags::NONBLOCK);
        let id = self.registry.insert(native, meta)?;

        tracing::debug!(
            id,
            ?owner,
            ty = %translate::render::socket_type_name(ty),
            protocol = %translate::render::protocol_name(protocol),
            "socket created"
        );
        Ok(id)
    }

    /// Recreate a native socket for a saved registry entry
    pub(crate) fn restore(&self, id: i32, meta: SocketMeta) -> Result<(), SocketError> {
        let host_type = translate::SOCKET_TYPES
            .to_host(meta.ty)
            .ok_or(SocketError::TypeNotSupported(meta.ty))?;
        let host_protocol = match meta.protocol {
            guest::IPPROTO_IP => None,
            p => translate::PROTOCOLS.to_host(p),
        };
        let native = Socket::new(Domain::IPV4, Type::from(host_type), host_protocol.map(Protocol::from))?;
        native.set_nonblocking(true)?;
        native.set_reuse_address(true)?;
        native.set_reuse_port(true)?;
        if meta.owner == SocketOwner::Adhoc && meta.ty == guest::SOCK_DGRAM {
            native.set_broadcast(true)?;
        }
        if let Some(bound) = meta.bound_addr {
            native.bind(&SockAddr::from(bound))?;
        }
        if let Some((protocol, port)) = meta.forwarded {
            self.ports.add(protocol, port);
        }
        self.registry.insert_with_id(id, native, meta)
    }

    pub fn close(&self, id: i32) -> Result<(), SocketError> {
        let socket = self.registry.remove(id)?;
        if let Some((protocol, port)) = socket.meta.forwarded {
            self.ports.remove(protocol, port);
        }
        tracing::debug!(id, "socket closed");
        Ok(())
    }

    /// Close with an immediate reset instead of a graceful shutdown
    pub fn close_with_rst(&self, id: i32) -> Result<(), SocketError> {
        let socket = self.registry.get(id)?;
        if let Err(e) = socket.native.set_linger(Some(Duration::ZERO)) {
            tracing::debug!(id, error = %e, "failed to arm reset on close");
        }
        self.close(id)
    }

    // ========================================================================
    // Addressing
    // ========================================================================

    /// Bind, replacing wildcard/broadcast addresses with the routable local
    /// address; returns the address the guest observes
    pub fn bind(&self, id: i32, addr: SocketAddrV4) -> Result<SocketAddrV4, SocketError> {
        let socket = self.registry.get(id)?;
        let wildcard = addr.ip().is_unspecified() || addr.ip().is_broadcast();
        let reported_ip = if wildcard { self.local_ip() } else { *addr.ip() };

        // Ad-hoc datagram sockets stay on the wildcard address so broadcasts
        // still arrive.
        let native_ip = if wildcard && socket.meta.owner == SocketOwner::Adhoc {
            Ipv4Addr::UNSPECIFIED
        } else {
            reported_ip
        };
        let native_addr = SocketAddrV4::new(native_ip, addr.port());
        socket.native.bind(&SockAddr::from(native_addr)).map_err(|e| {
            tracing::warn!(id, %native_addr, error = %e, "bind failed");
            SocketError::from(e)
        })?;

        let bound = sockaddr_v4(&socket.native.local_addr()?)?;
        let reported = SocketAddrV4::new(reported_ip, bound.port());

        let forwarded = if self.settings.forward_ports {
            let protocol = match socket.meta.ty {
                guest::SOCK_STREAM => Some(PortProtocol::Tcp),
                guest::SOCK_DGRAM => Some(PortProtocol::Udp),
                _ => None,
            };
            protocol.map(|p| {
                self.ports.add(p, bound.port());
                (p, bound.port())
            })
        } else {
            None
        };

        self.registry.update(id, |meta| {
            meta.bound_addr = Some(bound);
            meta.local_addr = Some(reported);
            meta.forwarded = forwarded;
        })?;
        tracing::debug!(id, %reported, "socket bound");
        Ok(reported)
    }

    pub fn local_addr(&self, id: i32) -> Result<SocketAddrV4, SocketError> {
        let socket = self.registry.get(id)?;
        if let Some(addr) = socket.meta.local_addr {
            return Ok(addr);
        }
        sockaddr_v4(&socket.native.local_addr()?)
    }

    pub fn peer_addr(&self, id: i32) -> Result<SocketAddrV4, SocketError> {
        let socket = self.registry.get(id)?;
        sockaddr_v4(&socket.native.peer_addr()?)
    }

    // ========================================================================
    // Connection management
    // ========================================================================

    /// Connect; blocking guest sockets wait up to the configured timeout
    pub fn connect(&self, id: i32, addr: SocketAddrV4) -> Result<(), SocketError> {
        let socket = self.registry.get(id)?;
        let remote = SockAddr::from(addr);

        if socket.meta.non_blocking || socket.meta.ty != guest::SOCK_STREAM {
            return match socket.native.connect(&remote) {
                Ok(()) => Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Err(SocketError::Native {
                    errno: guest::EINPROGRESS,
                }),
                Err(e) => Err(e.into()),
            };
        }

        let result = socket
            .native
            .connect_timeout(&remote, self.settings.connect_timeout);
        // connect_timeout leaves the socket in blocking mode
        socket.native.set_nonblocking(true)?;
        result.map_err(|e| {
            tracing::debug!(id, %addr, error = %e, "connect failed");
            SocketError::from(e)
        })
    }

    pub fn listen(&self, id: i32, backlog: i32) -> Result<(), SocketError> {
        let socket = self.registry.get(id)?;
        socket.native.listen(translate::backlog_to_host(backlog))?;
        Ok(())
    }

    /// Accept a pending connection as a new inet socket
    pub fn accept(&self, id: i32) -> Result<(i32, SocketAddrV4), SocketError> {
        let socket = self.registry.get(id)?;
        let (native, from) = socket.native.accept()?;
        native.set_nonblocking(true)?;
        let from = sockaddr_v4(&from)?;

        let mut meta = SocketMeta::new(
            SocketOwner::Inet,
            socket.meta.domain,
            socket.meta.ty,
            socket.meta.protocol,
        );
        meta.non_blocking = socket.meta.non_blocking;
        meta.recv_timeout_us = socket.meta.recv_timeout_us;
        meta.send_timeout_us = socket.meta.send_timeout_us;
        let new_id = self.registry.insert(native, meta)?;
        tracing::debug!(listener = id, id = new_id, %from, "connection accepted");
        Ok((new_id, from))
    }

    pub fn shutdown(&self, id: i32, how: i32) -> Result<(), SocketError> {
        let socket = self.registry.get(id)?;
        let how = translate::shutdown_to_host(how)
            .ok_or(SocketError::InvalidArgument("invalid shutdown mode"))?;
        socket.native.shutdown(how)?;
        Ok(())
    }

    // ========================================================================
    // Data transfer
    // ========================================================================

    fn host_flags(flags: MsgFlags) -> libc::c_int {
        // The native socket never blocks, so DONTWAIT is implied.
        translate::msg_flags_to_host(flags - MsgFlags::DONTWAIT)
    }

    pub fn send(&self, id: i32, data: &[u8], flags: MsgFlags) -> Result<usize, SocketError> {
        let socket = self.registry.get(id)?;
        Ok(socket.native.send_with_flags(data, Self::host_flags(flags))?)
    }

    pub fn send_to(
        &self,
        id: i32,
        data: &[u8],
        flags: MsgFlags,
        addr: SocketAddrV4,
    ) -> Result<usize, SocketError> {
        let socket = self.registry.get(id)?;
        Ok(socket
            .native
            .send_to_with_flags(data, &SockAddr::from(addr), Self::host_flags(flags))?)
    }

    pub fn recv(&self, id: i32, buf: &mut [u8], flags: MsgFlags) -> Result<usize, SocketError> {
        let socket = self.registry.get(id)?;
        Ok(socket
            .native
            .recv_with_flags(as_uninit(buf), Self::host_flags(flags))?)
    }

    pub fn recv_from(
        &self,
        id: i32,
        buf: &mut [u8],
        flags: MsgFlags,
    ) -> Result<(usize, SocketAddrV4), SocketError> {
        let socket = self.registry.get(id)?;
        let (len, from) = socket
            .native
            .recv_from_with_flags(as_uninit(buf), Self::host_flags(flags))?;
        Ok((len, sockaddr_v4(&from)?))
    }

    /// `sendmsg()` with the payload already gathered
    ///
    /// `control` is in guest numbering and is translated message by message;
    /// an unknown level or type fails the whole call.
    pub fn send_msg(
        &self,
        id: i32,
        data: &[u8],
        control: &[ControlMessage],
        flags: MsgFlags,
        to: Option<SocketAddrV4>,
    ) -> Result<usize, SocketError> {
        let socket = self.registry.get(id)?;
        let host = control
            .iter()
            .map(|m| {
                let (level, ty) = translate::cmsg_to_host(m.level, m.ty).ok_or_else(|| {
                    tracing::debug!(
                        level = %translate::render::level_name(m.level),
                        ty = %translate::render::cmsg_name(m.ty),
                        "untranslatable control message"
                    );
                    SocketError::InvalidArgument("unsupported control message")
                })?;
                Ok(ControlMessage {
                    level,
                    ty,
                    data: m.data.clone(),
                })
            })
            .collect::<Result<Vec<_>, SocketError>>()?;

        let control_len: usize = host.iter().map(|m| cmsg_space(m.data.len())).sum();
        let mut control_buf = vec![0u64; control_len.div_ceil(8)];
        let to = to.map(SockAddr::from);
        let mut iov = libc::iovec {
            iov_base: data.as_ptr() as *mut libc::c_void,
            iov_len: data.len(),
        };

        // SAFETY: an all-zero msghdr is a valid empty header.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        if let Some(to) = &to {
            msg.msg_name = to.as_ptr() as *mut libc::c_void;
            msg.msg_namelen = to.len();
        }
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        if control_len > 0 {
            msg.msg_control = control_buf.as_mut_ptr().cast();
            msg.msg_controllen = control_len as _;
            // SAFETY: the buffer is u64-aligned and holds exactly one
            // CMSG_SPACE per message, so every header the macros hand out
            // lies inside it.
            unsafe {
                let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
                for m in &host {
                    if cmsg.is_null() {
                        break;
                    }
                    (*cmsg).cmsg_level = m.level;
                    (*cmsg).cmsg_type = m.ty;
                    (*cmsg).cmsg_len = cmsg_len(m.data.len()) as _;
                    std::ptr::copy_nonoverlapping(m.data.as_ptr(), libc::CMSG_DATA(cmsg), m.data.len());
                    cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
                }
            }
        }

        // SAFETY: every pointer in `msg` refers to a buffer that outlives
        // the call.
        let sent = unsafe { libc::sendmsg(socket.native.as_raw_fd(), &msg, Self::host_flags(flags)) };
        if sent < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(sent as usize)
    }

    /// `recvmsg()` into a single buffer, with up to `control_capacity` bytes
    /// of guest ancillary data in mind
    pub fn recv_msg(
        &self,
        id: i32,
        buf: &mut [u8],
        control_capacity: usize,
        flags: MsgFlags,
    ) -> Result<ReceivedMessage, SocketError> {
        let socket = self.registry.get(id)?;
        // Host headers are wider than the guest's
        let host_capacity = if control_capacity == 0 {
            0
        } else {
            control_capacity * 2 + cmsg_space(mem::size_of::<libc::timeval>())
        };
        let mut control_buf = vec![0u64; host_capacity.div_ceil(8)];
        // SAFETY: all-zero is a valid sockaddr_storage and msghdr.
        let mut from: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        msg.msg_name = (&mut from as *mut libc::sockaddr_storage).cast();
        msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        if host_capacity > 0 {
            msg.msg_control = control_buf.as_mut_ptr().cast();
            msg.msg_controllen = (control_buf.len() * 8) as _;
        }

        // SAFETY: every pointer in `msg` refers to a buffer that outlives
        // the call, with its true length alongside.
        let received = unsafe { libc::recvmsg(socket.native.as_raw_fd(), &mut msg, Self::host_flags(flags)) };
        if received < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let from = if msg.msg_namelen as usize >= mem::size_of::<libc::sockaddr_in>()
            && from.ss_family as i32 == libc::AF_INET
        {
            // SAFETY: the kernel stored a sockaddr_in at the start of `from`.
            let sin = unsafe { &*(&from as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
            Some(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            ))
        } else {
            None
        };

        let mut host = Vec::new();
        if host_capacity > 0 {
            // SAFETY: the kernel wrote well-formed headers into the first
            // `msg_controllen` bytes, and the macros stop at that bound.
            unsafe {
                let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
                while !cmsg.is_null() {
                    let header = &*cmsg;
                    let data_len = (header.cmsg_len as usize).saturating_sub(cmsg_len(0));
                    let data = std::slice::from_raw_parts(libc::CMSG_DATA(cmsg), data_len);
                    host.push(ControlMessage {
                        level: header.cmsg_level,
                        ty: header.cmsg_type,
                        data: data.to_vec(),
                    });
                    cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
                }
            }
        }

        Ok(ReceivedMessage {
            len: received as usize,
            from,
            control: host.into_iter().filter_map(control_to_guest).collect(),
            flags: translate::msg_flags_to_guest(msg.msg_flags),
        })
    }

    /// Stop all traffic on a socket without releasing its id
    pub fn abort(&self, id: i32) -> Result<(), SocketError> {
        let socket = self.registry.get(id)?;
        match socket.native.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // Nothing to stop on a socket that never connected
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ========================================================================
    // Options
    // ========================================================================

    pub fn set_option(
        &self,
        id: i32,
        level: i32,
        name: i32,
        value: &[u8],
    ) -> Result<(), SocketError> {
        let GuestSocket { native, mut meta, .. } = self.registry.get(id)?;
        options::set_option(&native, &mut meta, level, name, value)?;
        self.registry.update(id, |stored| {
            stored.non_blocking = meta.non_blocking;
            stored.recv_timeout_us = meta.recv_timeout_us;
            stored.send_timeout_us = meta.send_timeout_us;
        })
    }

    pub fn get_option(&self, id: i32, level: i32, name: i32) -> Result<Vec<u8>, SocketError> {
        let socket = self.registry.get(id)?;
        options::get_option(&socket.native, &socket.meta, level, name)
    }

    pub fn is_non_blocking(&self, id: i32) -> Result<bool, SocketError> {
        Ok(self.registry.get(id)?.meta.non_blocking)
    }

    // ========================================================================
    // Readiness
    // ========================================================================

    fn wait_ms(&self, timeout_us: Option<u64>) -> libc::c_int {
        let us = timeout_us
            .unwrap_or(self.settings.max_wait_us)
            .min(self.settings.max_wait_us);
        us.div_ceil(1000) as libc::c_int
    }

    fn native_poll(fds: &mut [libc::pollfd], timeout_ms: libc::c_int) -> Result<usize, SocketError> {
        // SAFETY: `fds` is a valid, exclusively borrowed slice of pollfd for
        // the duration of the call and its length is passed alongside it.
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(ret as usize)
    }

    /// `select()` over guest fd_sets; sets are rewritten with ready ids and
    /// the total number of set bits is returned
    pub fn select(
        &self,
        nfds: i32,
        mut read: Option<&mut FdSet>,
        mut write: Option<&mut FdSet>,
        mut except: Option<&mut FdSet>,
        timeout_us: Option<u64>,
    ) -> Result<usize, SocketError> {
        if nfds < 0 || nfds as usize > guest::FD_SETSIZE {
            tracing::warn!(nfds, "select set size exceeds guest maximum");
            return Err(SocketError::Native {
                errno: guest::EINVAL,
            });
        }
        let nfds = nfds as usize;

        let mut ids: SmallVec<[(i32, i16); 16]> = SmallVec::new();
        for id in 0..nfds as i32 {
            let mut events = 0;
            if read.as_deref().is_some_and(|s| s.contains(id)) {
                events |= libc::POLLIN;
            }
            if write.as_deref().is_some_and(|s| s.contains(id)) {
                events |= libc::POLLOUT;
            }
            if except.as_deref().is_some_and(|s| s.contains(id)) {
                events |= libc::POLLPRI;
            }
            if events != 0 {
                ids.push((id, events));
            }
        }

        let mut sockets = Vec::with_capacity(ids.len());
        let mut pollfds = Vec::with_capacity(ids.len());
        for &(id, events) in &ids {
            let socket = self.registry.get(id).map_err(|_| SocketError::Native {
                errno: guest::EBADF,
            })?;
            pollfds.push(libc::pollfd {
                fd: socket.native.as_raw_fd(),
                events,
                revents: 0,
            });
            sockets.push(socket);
        }

        Self::native_poll(&mut pollfds, self.wait_ms(timeout_us))?;

        for set in [read.as_deref_mut(), write.as_deref_mut(), except.as_deref_mut()]
            .into_iter()
            .flatten()
        {
            set.clear();
        }
        let mut count = 0;
        for ((id, _), pfd) in ids.iter().zip(&pollfds) {
            let r = pfd.revents;
            if let Some(set) = read.as_deref_mut() {
                if r & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                    set.insert(*id);
                    count += 1;
                }
            }
            if let Some(set) = write.as_deref_mut() {
                if r & (libc::POLLOUT | libc::POLLERR) != 0 {
                    set.insert(*id);
                    count += 1;
                }
            }
            if let Some(set) = except.as_deref_mut() {
                if r & libc::POLLPRI != 0 {
                    set.insert(*id);
                    count += 1;
                }
            }
        }
        drop(sockets);
        Ok(count)
    }

    /// `poll()` over guest pollfds; unknown ids report `NVAL`
    pub fn poll(&self, fds: &mut [PollFd], timeout_us: Option<u64>) -> Result<usize, SocketError> {
        if fds.len() > guest::FD_SETSIZE {
            tracing::warn!(count = fds.len(), "poll set size exceeds guest maximum");
            return Err(SocketError::Native {
                errno: guest::EINVAL,
            });
        }

        let mut sockets = Vec::with_capacity(fds.len());
        let mut pollfds = Vec::with_capacity(fds.len());
        for pfd in fds.iter_mut() {
            pfd.revents = PollEvents::empty();
            let native_fd = if pfd.fd < 0 {
                -1
            } else {
                match self.registry.get(pfd.fd) {
                    Ok(socket) => {
                        let fd = socket.native.as_raw_fd();
                        sockets.push(socket);
                        fd
                    }
                    Err(_) => {
                        pfd.revents = PollEvents::NVAL;
                        -1
                    }
                }
            };
            pollfds.push(libc::pollfd {
                fd: native_fd,
                events: translate::poll_events_to_host(pfd.events),
                revents: 0,
            });
        }

        let any_invalid = fds.iter().any(|p| !p.revents.is_empty());
        let timeout = if any_invalid { 0 } else { self.wait_ms(timeout_us) };
        Self::native_poll(&mut pollfds, timeout)?;

        let always = PollEvents::ERR | PollEvents::HUP | PollEvents::NVAL;
        let mut count = 0;
        for (pfd, native) in fds.iter_mut().zip(&pollfds) {
            if native.fd >= 0 {
                pfd.revents =
                    translate::poll_events_to_guest(native.revents) & (pfd.events | always);
            }
            if !pfd.revents.is_empty() {
                count += 1;
            }
        }
        drop(sockets);
        Ok(count)
    }
}
