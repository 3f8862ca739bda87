//! Bidirectional guest/host constant tables
//!
//! Each [`ConstantFamily`] pairs guest values with their host equivalent.
//! Values that only one side knows about are simply absent; lookups that
//! miss are logged and return `None`.

use std::net::Shutdown;

use super::guest::{self, MsgFlags, PollEvents};

/// One family of socket constants, translated in both directions
#[derive(Debug)]
pub struct ConstantFamily {
    name: &'static str,
    pairs: &'static [(i32, i32)],
}

impl ConstantFamily {
    const fn new(name: &'static str, pairs: &'static [(i32, i32)]) -> Self {
        Self { name, pairs }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// `(guest, host)` pairs supported on this platform
    pub fn pairs(&self) -> &'static [(i32, i32)] {
        self.pairs
    }

    pub fn to_host(&self, guest: i32) -> Option<i32> {
        let found = self.pairs.iter().find(|(g, _)| *g == guest).map(|(_, h)| *h);
        if found.is_none() {
            log::warn!("unmapped guest {} value {:#010x}", self.name, guest);
        }
        found
    }

    pub fn to_guest(&self, host: i32) -> Option<i32> {
        let found = self.pairs.iter().find(|(_, h)| *h == host).map(|(g, _)| *g);
        if found.is_none() {
            log::warn!("unmapped host {} value {:#010x}", self.name, host);
        }
        found
    }
}

pub static DOMAINS: ConstantFamily = ConstantFamily::new(
    "domain",
    &[
        (guest::AF_UNSPEC, libc::AF_UNSPEC),
        (guest::AF_LOCAL, libc::AF_UNIX),
        (guest::AF_INET, libc::AF_INET),
        (guest::AF_INET6, libc::AF_INET6),
    ],
);

pub static SOCKET_TYPES: ConstantFamily = ConstantFamily::new(
    "socket type",
    &[
        (guest::SOCK_STREAM, libc::SOCK_STREAM),
        (guest::SOCK_DGRAM, libc::SOCK_DGRAM),
        (guest::SOCK_RAW, libc::SOCK_RAW),
        (guest::SOCK_RDM, libc::SOCK_RDM),
        (guest::SOCK_SEQPACKET, libc::SOCK_SEQPACKET),
        #[cfg(target_os = "linux")]
        (guest::SOCK_DCCP, libc::SOCK_DCCP),
        #[cfg(target_os = "linux")]
        (guest::SOCK_PACKET, libc::SOCK_PACKET),
    ],
);

pub static PROTOCOLS: ConstantFamily = ConstantFamily::new(
    "protocol",
    &[
        (guest::IPPROTO_IP, libc::IPPROTO_IP),
        (guest::IPPROTO_ICMP, libc::IPPROTO_ICMP),
        #[cfg(target_os = "linux")]
        (guest::IPPROTO_IGMP, libc::IPPROTO_IGMP),
        (guest::IPPROTO_TCP, libc::IPPROTO_TCP),
        #[cfg(target_os = "linux")]
        (guest::IPPROTO_EGP, libc::IPPROTO_EGP),
        #[cfg(target_os = "linux")]
        (guest::IPPROTO_PUP, libc::IPPROTO_PUP),
        (guest::IPPROTO_UDP, libc::IPPROTO_UDP),
        #[cfg(target_os = "linux")]
        (guest::IPPROTO_IDP, libc::IPPROTO_IDP),
        (guest::IPPROTO_RAW, libc::IPPROTO_RAW),
    ],
);

pub static LEVELS: ConstantFamily = ConstantFamily::new(
    "option level",
    &[
        (guest::SOL_SOCKET, libc::SOL_SOCKET),
        (guest::IPPROTO_IP, libc::IPPROTO_IP),
        (guest::IPPROTO_TCP, libc::IPPROTO_TCP),
        (guest::IPPROTO_UDP, libc::IPPROTO_UDP),
    ],
);

/// `SOL_SOCKET` options with a native counterpart
///
/// `SO_NBIO`, `SO_BIO` and `SO_NOSIGPIPE` are emulated and have no entry.
pub static SOCKET_OPTIONS: ConstantFamily = ConstantFamily::new(
    "socket option",
    &[
        (guest::SO_DEBUG, libc::SO_DEBUG),
        (guest::SO_ACCEPTCONN, libc::SO_ACCEPTCONN),
        (guest::SO_REUSEADDR, libc::SO_REUSEADDR),
        (guest::SO_KEEPALIVE, libc::SO_KEEPALIVE),
        (guest::SO_DONTROUTE, libc::SO_DONTROUTE),
        (guest::SO_BROADCAST, libc::SO_BROADCAST),
        (guest::SO_LINGER, libc::SO_LINGER),
        (guest::SO_OOBINLINE, libc::SO_OOBINLINE),
        (guest::SO_REUSEPORT, libc::SO_REUSEPORT),
        (guest::SO_TIMESTAMP, libc::SO_TIMESTAMP),
        (guest::SO_SNDBUF, libc::SO_SNDBUF),
        (guest::SO_RCVBUF, libc::SO_RCVBUF),
        (guest::SO_SNDLOWAT, libc::SO_SNDLOWAT),
        (guest::SO_RCVLOWAT, libc::SO_RCVLOWAT),
        (guest::SO_SNDTIMEO, libc::SO_SNDTIMEO),
        (guest::SO_RCVTIMEO, libc::SO_RCVTIMEO),
        (guest::SO_ERROR, libc::SO_ERROR),
        (guest::SO_TYPE, libc::SO_TYPE),
    ],
);

pub static IP_OPTIONS: ConstantFamily = ConstantFamily::new(
    "IP option",
    &[
        (guest::IP_HDRINCL, libc::IP_HDRINCL),
        (guest::IP_TOS, libc::IP_TOS),
        (guest::IP_TTL, libc::IP_TTL),
        (guest::IP_MULTICAST_IF, libc::IP_MULTICAST_IF),
        (guest::IP_MULTICAST_TTL, libc::IP_MULTICAST_TTL),
        (guest::IP_MULTICAST_LOOP, libc::IP_MULTICAST_LOOP),
        (guest::IP_ADD_MEMBERSHIP, libc::IP_ADD_MEMBERSHIP),
        (guest::IP_DROP_MEMBERSHIP, libc::IP_DROP_MEMBERSHIP),
    ],
);

pub static TCP_OPTIONS: ConstantFamily = ConstantFamily::new(
    "TCP option",
    &[
        (guest::TCP_NODELAY, libc::TCP_NODELAY),
        (guest::TCP_MAXSEG, libc::TCP_MAXSEG),
    ],
);

pub static UDP_OPTIONS: ConstantFamily = ConstantFamily::new("UDP option", &[]);

pub static CMSG_TYPES: ConstantFamily = ConstantFamily::new(
    "control message type",
    &[
        (guest::SCM_RIGHTS, libc::SCM_RIGHTS),
        #[cfg(target_os = "linux")]
        (guest::SCM_CREDS, libc::SCM_CREDENTIALS),
        #[cfg(target_os = "linux")]
        (guest::SCM_TIMESTAMP, libc::SO_TIMESTAMP),
    ],
);

/// Option-name family for a guest option level
pub fn option_family(guest_level: i32) -> Option<&'static ConstantFamily> {
    match guest_level {
        guest::SOL_SOCKET => Some(&SOCKET_OPTIONS),
        guest::IPPROTO_IP => Some(&IP_OPTIONS),
        guest::IPPROTO_TCP => Some(&TCP_OPTIONS),
        guest::IPPROTO_UDP => Some(&UDP_OPTIONS),
        _ => None,
    }
}

/// Option-name family for a host option level
pub fn host_option_family(host_level: i32) -> Option<&'static ConstantFamily> {
    option_family(LEVELS.to_guest(host_level)?)
}

pub fn option_to_host(guest_level: i32, guest_name: i32) -> Option<(i32, i32)> {
    let level = LEVELS.to_host(guest_level)?;
    let name = option_family(guest_level)?.to_host(guest_name)?;
    Some((level, name))
}

pub fn option_to_guest(host_level: i32, host_name: i32) -> Option<(i32, i32)> {
    let level = LEVELS.to_guest(host_level)?;
    let name = option_family(level)?.to_guest(host_name)?;
    Some((level, name))
}

/// Type family of control messages at a guest level; socket-level messages
/// use the `SCM_*` names, protocol levels reuse their option names
fn cmsg_family(guest_level: i32) -> Option<&'static ConstantFamily> {
    if guest_level == guest::SOL_SOCKET {
        Some(&CMSG_TYPES)
    } else {
        option_family(guest_level)
    }
}

pub fn cmsg_to_host(guest_level: i32, guest_type: i32) -> Option<(i32, i32)> {
    let level = LEVELS.to_host(guest_level)?;
    let ty = cmsg_family(guest_level)?.to_host(guest_type)?;
    Some((level, ty))
}

pub fn cmsg_to_guest(host_level: i32, host_type: i32) -> Option<(i32, i32)> {
    let level = LEVELS.to_guest(host_level)?;
    let ty = cmsg_family(level)?.to_guest(host_type)?;
    Some((level, ty))
}

/// Split the `socket()` type argument into its base type and flag bits
pub fn split_socket_type(guest_type: i32) -> (i32, guest::SocketTypeFlags) {
    let flags = guest::SocketTypeFlags::from_bits_truncate(guest_type as u32);
    (guest_type & guest::SOCK_TYPE_MASK, flags)
}

// ============================================================================
// Bit sets
// ============================================================================

const MSG_FLAG_PAIRS: &[(MsgFlags, i32)] = &[
    (MsgFlags::OOB, libc::MSG_OOB),
    (MsgFlags::PEEK, libc::MSG_PEEK),
    (MsgFlags::DONTROUTE, libc::MSG_DONTROUTE),
    (MsgFlags::EOR, libc::MSG_EOR),
    (MsgFlags::TRUNC, libc::MSG_TRUNC),
    (MsgFlags::CTRUNC, libc::MSG_CTRUNC),
    (MsgFlags::WAITALL, libc::MSG_WAITALL),
    (MsgFlags::DONTWAIT, libc::MSG_DONTWAIT),
];

pub fn msg_flags_to_host(flags: MsgFlags) -> i32 {
    let mut host = 0;
    for (g, h) in MSG_FLAG_PAIRS {
        if flags.contains(*g) {
            host |= *h;
        }
    }
    let dropped = flags & (MsgFlags::BCAST | MsgFlags::MCAST);
    if !dropped.is_empty() {
        log::debug!("dropping guest-only message flags {:?}", dropped);
    }
    host
}

pub fn msg_flags_to_guest(host: i32) -> MsgFlags {
    let mut flags = MsgFlags::empty();
    for (g, h) in MSG_FLAG_PAIRS {
        if host & *h != 0 {
            flags |= *g;
        }
    }
    flags
}

const POLL_PAIRS: &[(PollEvents, libc::c_short)] = &[
    (PollEvents::IN, libc::POLLIN),
    (PollEvents::PRI, libc::POLLPRI),
    (PollEvents::OUT, libc::POLLOUT),
    (PollEvents::ERR, libc::POLLERR),
    (PollEvents::HUP, libc::POLLHUP),
    (PollEvents::NVAL, libc::POLLNVAL),
    (PollEvents::RDNORM, libc::POLLRDNORM),
    (PollEvents::RDBAND, libc::POLLRDBAND),
    (PollEvents::WRNORM, libc::POLLWRNORM),
    (PollEvents::WRBAND, libc::POLLWRBAND),
];

pub fn poll_events_to_host(events: PollEvents) -> libc::c_short {
    POLL_PAIRS
        .iter()
        .filter(|(g, _)| events.contains(*g))
        .fold(0, |acc, (_, h)| acc | *h)
}

pub fn poll_events_to_guest(host: libc::c_short) -> PollEvents {
    POLL_PAIRS
        .iter()
        .filter(|(_, h)| host & *h != 0)
        .fold(PollEvents::empty(), |acc, (g, _)| acc | *g)
}

pub fn shutdown_to_host(how: i32) -> Option<Shutdown> {
    match how {
        guest::SHUT_RD => Some(Shutdown::Read),
        guest::SHUT_WR => Some(Shutdown::Write),
        guest::SHUT_RDWR => Some(Shutdown::Both),
        other => {
            log::warn!("unmapped guest shutdown mode {}", other);
            None
        }
    }
}

/// Host listen backlog for a guest backlog value
pub fn backlog_to_host(backlog: i32) -> i32 {
    if backlog == guest::SOMAXCONN {
        libc::SOMAXCONN
    } else {
        backlog
    }
}
