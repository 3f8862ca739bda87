//! Socket option allow-lists and native application
//!
//! Options are checked against the allow-list of the socket's owner class
//! before anything reaches the host. A few options are emulated entirely:
//! `SO_NBIO`/`SO_BIO` toggle the guest-visible blocking flag, and the reuse
//! and `SO_NOSIGPIPE` options are accepted without forwarding since the
//! native socket is always configured that way.

use std::net::Ipv4Addr;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use socket2::Socket;

use super::SocketError;
use super::registry::{SocketMeta, SocketOwner};
use super::sockaddr;
use crate::translate::{self, guest};

/// Largest buffer size accepted by `SO_SNDBUF`/`SO_RCVBUF`
pub const MAX_BUFFER_SIZE: u32 = 8 * 1024 * 1024;

const INET_OPTIONS: &[(i32, i32)] = &[
    (guest::SOL_SOCKET, guest::SO_REUSEADDR),
    (guest::SOL_SOCKET, guest::SO_REUSEPORT),
    (guest::SOL_SOCKET, guest::SO_NOSIGPIPE),
    (guest::SOL_SOCKET, guest::SO_NBIO),
    (guest::SOL_SOCKET, guest::SO_BIO),
    (guest::SOL_SOCKET, guest::SO_BROADCAST),
    (guest::SOL_SOCKET, guest::SO_KEEPALIVE),
    (guest::SOL_SOCKET, guest::SO_SNDBUF),
    (guest::SOL_SOCKET, guest::SO_RCVBUF),
    (guest::SOL_SOCKET, guest::SO_SNDTIMEO),
    (guest::SOL_SOCKET, guest::SO_RCVTIMEO),
    (guest::SOL_SOCKET, guest::SO_ERROR),
    (guest::SOL_SOCKET, guest::SO_TYPE),
    (guest::SOL_SOCKET, guest::SO_TIMESTAMP),
    (guest::IPPROTO_TCP, guest::TCP_NODELAY),
    (guest::IPPROTO_IP, guest::IP_TTL),
];

const ADHOC_EXTRA_OPTIONS: &[(i32, i32)] = &[
    (guest::SOL_SOCKET, guest::SO_LINGER),
    (guest::SOL_SOCKET, guest::SO_OOBINLINE),
    (guest::SOL_SOCKET, guest::SO_DONTROUTE),
    (guest::IPPROTO_IP, guest::IP_TOS),
    (guest::IPPROTO_IP, guest::IP_MULTICAST_TTL),
    (guest::IPPROTO_IP, guest::IP_MULTICAST_LOOP),
    (guest::IPPROTO_IP, guest::IP_ADD_MEMBERSHIP),
    (guest::IPPROTO_IP, guest::IP_DROP_MEMBERSHIP),
];

/// Options that can be read but not written
const READ_ONLY: &[(i32, i32)] = &[
    (guest::SOL_SOCKET, guest::SO_ERROR),
    (guest::SOL_SOCKET, guest::SO_TYPE),
];

pub fn is_allowed(owner: SocketOwner, level: i32, name: i32) -> bool {
    let key = (level, name);
    INET_OPTIONS.contains(&key)
        || (owner == SocketOwner::Adhoc && ADHOC_EXTRA_OPTIONS.contains(&key))
}

fn check(owner: SocketOwner, level: i32, name: i32) -> Result<(), SocketError> {
    if is_allowed(owner, level, name) {
        Ok(())
    } else {
        tracing::warn!(
            level = %translate::render::level_name(level),
            name = %translate::render::option_name(level, name),
            ?owner,
            "rejecting socket option"
        );
        Err(SocketError::UnsupportedOption { level, name })
    }
}

fn read_int(value: &[u8]) -> Result<i32, SocketError> {
    match value.len() {
        0 => Err(SocketError::InvalidArgument("empty option value")),
        1 => Ok(value[0] as i32),
        2 | 3 => Ok(LittleEndian::read_u16(value) as i32),
        _ => Ok(LittleEndian::read_i32(value)),
    }
}

fn int_bytes(v: i32) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

fn timeout(us: u32) -> Option<Duration> {
    (us != 0).then(|| Duration::from_micros(us as u64))
}

/// Apply a guest `setsockopt`
///
/// Emulated options only touch `meta`; the caller stores it back.
pub fn set_option(
    native: &Socket,
    meta: &mut SocketMeta,
    level: i32,
    name: i32,
    value: &[u8],
) -> Result<(), SocketError> {
    check(meta.owner, level, name)?;
    if READ_ONLY.contains(&(level, name)) {
        return Err(SocketError::UnsupportedOption { level, name });
    }

    match (level, name) {
        (guest::SOL_SOCKET, guest::SO_NBIO) => {
            meta.non_blocking = read_int(value)? != 0;
        }
        (guest::SOL_SOCKET, guest::SO_BIO) => {
            if read_int(value)? != 0 {
                meta.non_blocking = false;
            }
        }
        (guest::SOL_SOCKET, guest::SO_REUSEADDR | guest::SO_REUSEPORT | guest::SO_NOSIGPIPE) => {
            tracing::trace!(name = %translate::render::option_name(level, name), "accepted without forwarding");
        }
        (guest::SOL_SOCKET, guest::SO_BROADCAST) => native.set_broadcast(read_int(value)? != 0)?,
        (guest::SOL_SOCKET, guest::SO_KEEPALIVE) => native.set_keepalive(read_int(value)? != 0)?,
        (guest::SOL_SOCKET, guest::SO_SNDBUF | guest::SO_RCVBUF) => {
            let size = read_int(value)?;
            if size < 0 {
                return Err(SocketError::InvalidArgument("negative buffer size"));
            }
            if size as u32 > MAX_BUFFER_SIZE {
                return Err(SocketError::Native {
                    errno: guest::ENOBUFS,
                });
            }
            if name == guest::SO_SNDBUF {
                native.set_send_buffer_size(size as usize)?;
            } else {
                native.set_recv_buffer_size(size as usize)?;
            }
        }
        (guest::SOL_SOCKET, guest::SO_SNDTIMEO) => {
            let us = read_int(value)? as u32;
            native.set_write_timeout(timeout(us))?;
            meta.send_timeout_us = us;
        }
        (guest::SOL_SOCKET, guest::SO_RCVTIMEO) => {
            let us = read_int(value)? as u32;
            native.set_read_timeout(timeout(us))?;
            meta.recv_timeout_us = us;
        }
        (guest::SOL_SOCKET, guest::SO_LINGER) => {
            let (on, secs) = sockaddr::decode_linger(value)?;
            native.set_linger(on.then(|| Duration::from_secs(secs as u64)))?;
        }
        (guest::SOL_SOCKET, guest::SO_OOBINLINE) => {
            native.set_out_of_band_inline(read_int(value)? != 0)?
        }
        (guest::IPPROTO_TCP, guest::TCP_NODELAY) => native.set_nodelay(read_int(value)? != 0)?,
        (guest::IPPROTO_IP, guest::IP_TTL) => native.set_ttl(read_int(value)? as u32)?,
        (guest::IPPROTO_IP, guest::IP_TOS) => native.set_tos(read_int(value)? as u32)?,
        (guest::IPPROTO_IP, guest::IP_MULTICAST_TTL) => {
            native.set_multicast_ttl_v4(read_int(value)? as u32)?
        }
        (guest::IPPROTO_IP, guest::IP_MULTICAST_LOOP) => {
            native.set_multicast_loop_v4(read_int(value)? != 0)?
        }
        (guest::IPPROTO_IP, guest::IP_ADD_MEMBERSHIP | guest::IP_DROP_MEMBERSHIP) => {
            if value.len() < 8 {
                return Err(SocketError::InvalidArgument("ip_mreq too short"));
            }
            let group = Ipv4Addr::new(value[0], value[1], value[2], value[3]);
            let iface = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
            if name == guest::IP_ADD_MEMBERSHIP {
                native.join_multicast_v4(&group, &iface)?;
            } else {
                native.leave_multicast_v4(&group, &iface)?;
            }
        }
        _ => {
            // Remaining plain integer options go through the translated
            // level/name pair.
            let (host_level, host_name) = translate::option_to_host(level, name)
                .ok_or(SocketError::UnsupportedOption { level, name })?;
            raw::set_int(native, host_level, host_name, read_int(value)?)?;
        }
    }
    Ok(())
}

/// Read a guest `getsockopt` value, encoded in guest layout
pub fn get_option(
    native: &Socket,
    meta: &SocketMeta,
    level: i32,
    name: i32,
) -> Result<Vec<u8>, SocketError> {
    check(meta.owner, level, name)?;

    let value = match (level, name) {
        (guest::SOL_SOCKET, guest::SO_NBIO) => int_bytes(meta.non_blocking as i32),
        (guest::SOL_SOCKET, guest::SO_BIO) => int_bytes(!meta.non_blocking as i32),
        (guest::SOL_SOCKET, guest::SO_NOSIGPIPE) => int_bytes(1),
        (guest::SOL_SOCKET, guest::SO_REUSEADDR) => int_bytes(native.reuse_address()? as i32),
        (guest::SOL_SOCKET, guest::SO_REUSEPORT) => int_bytes(native.reuse_port()? as i32),
        (guest::SOL_SOCKET, guest::SO_BROADCAST) => int_bytes(native.broadcast()? as i32),
        (guest::SOL_SOCKET, guest::SO_KEEPALIVE) => int_bytes(native.keepalive()? as i32),
        (guest::SOL_SOCKET, guest::SO_SNDBUF) => int_bytes(native.send_buffer_size()? as i32),
        (guest::SOL_SOCKET, guest::SO_RCVBUF) => int_bytes(native.recv_buffer_size()? as i32),
        (guest::SOL_SOCKET, guest::SO_SNDTIMEO) => int_bytes(meta.send_timeout_us as i32),
        (guest::SOL_SOCKET, guest::SO_RCVTIMEO) => int_bytes(meta.recv_timeout_us as i32),
        (guest::SOL_SOCKET, guest::SO_ERROR) => {
            let errno = native
                .take_error()?
                .map(|e| translate::io_error_to_guest(&e))
                .unwrap_or(0);
            int_bytes(errno)
        }
        (guest::SOL_SOCKET, guest::SO_TYPE) => int_bytes(meta.ty),
        (guest::SOL_SOCKET, guest::SO_LINGER) => {
            let linger = native.linger()?;
            sockaddr::encode_linger(linger.is_some(), linger.map_or(0, |d| d.as_secs() as u32))
                .to_vec()
        }
        (guest::SOL_SOCKET, guest::SO_OOBINLINE) => {
            int_bytes(native.out_of_band_inline()? as i32)
        }
        (guest::IPPROTO_TCP, guest::TCP_NODELAY) => int_bytes(native.nodelay()? as i32),
        (guest::IPPROTO_IP, guest::IP_TTL) => int_bytes(native.ttl()? as i32),
        (guest::IPPROTO_IP, guest::IP_TOS) => int_bytes(native.tos()? as i32),
        (guest::IPPROTO_IP, guest::IP_MULTICAST_TTL) => {
            int_bytes(native.multicast_ttl_v4()? as i32)
        }
        (guest::IPPROTO_IP, guest::IP_MULTICAST_LOOP) => {
            int_bytes(native.multicast_loop_v4()? as i32)
        }
        _ => {
            let (host_level, host_name) = translate::option_to_host(level, name)
                .ok_or(SocketError::UnsupportedOption { level, name })?;
            int_bytes(raw::get_int(native, host_level, host_name)?)
        }
    };
    Ok(value)
}

mod raw {
    use std::io;
    use std::os::fd::AsRawFd;

    use socket2::Socket;

    pub fn set_int(native: &Socket, level: i32, name: i32, value: i32) -> io::Result<()> {
        let value: libc::c_int = value;
        // SAFETY: the fd is owned by `native` and stays open for the call;
        // the option buffer is a live c_int and its exact size is passed.
        let ret = unsafe {
            libc::setsockopt(
                native.as_raw_fd(),
                level,
                name,
                (&value as *const libc::c_int).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn get_int(native: &Socket, level: i32, name: i32) -> io::Result<i32> {
        let mut value: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: `value` and `len` are valid for writes and `len` holds the
        // buffer size, as getsockopt requires.
        let ret = unsafe {
            libc::getsockopt(
                native.as_raw_fd(),
                level,
                name,
                (&mut value as *mut libc::c_int).cast(),
                &mut len,
            )
        };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(value)
    }
}
