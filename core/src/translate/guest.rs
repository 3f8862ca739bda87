//! Guest socket ABI constants
//!
//! Numeric values are part of the guest ABI and must stay bit-exact.

use bitflags::bitflags;

// ============================================================================
// Address families
// ============================================================================

pub const AF_UNSPEC: i32 = 0;
pub const AF_LOCAL: i32 = 1;
pub const AF_INET: i32 = 2;
pub const AF_INET6: i32 = 24;

// ============================================================================
// Socket types
// ============================================================================

pub const SOCK_STREAM: i32 = 1;
pub const SOCK_DGRAM: i32 = 2;
pub const SOCK_RAW: i32 = 3;
pub const SOCK_RDM: i32 = 4;
pub const SOCK_SEQPACKET: i32 = 5;
pub const SOCK_DCCP: i32 = 6;
pub const SOCK_PACKET: i32 = 10;
pub const SOCK_TYPE_MASK: i32 = 0x0f;

bitflags! {
    /// Flags OR-ed into the socket type argument of `socket()`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SocketTypeFlags: u32 {
        const CLOEXEC = 0x1000_0000;
        const NONBLOCK = 0x2000_0000;
        const NOSIGPIPE = 0x4000_0000;
    }
}

// ============================================================================
// Protocols
// ============================================================================

pub const IPPROTO_IP: i32 = 0;
pub const IPPROTO_ICMP: i32 = 1;
pub const IPPROTO_IGMP: i32 = 2;
pub const IPPROTO_TCP: i32 = 6;
pub const IPPROTO_EGP: i32 = 8;
pub const IPPROTO_PUP: i32 = 12;
pub const IPPROTO_UDP: i32 = 17;
pub const IPPROTO_IDP: i32 = 22;
pub const IPPROTO_RAW: i32 = 255;

// ============================================================================
// Option levels and names
// ============================================================================

pub const SOL_SOCKET: i32 = 0xffff;

pub const SO_DEBUG: i32 = 0x0001;
pub const SO_ACCEPTCONN: i32 = 0x0002;
pub const SO_REUSEADDR: i32 = 0x0004;
pub const SO_KEEPALIVE: i32 = 0x0008;
pub const SO_DONTROUTE: i32 = 0x0010;
pub const SO_BROADCAST: i32 = 0x0020;
pub const SO_USELOOPBACK: i32 = 0x0040;
pub const SO_LINGER: i32 = 0x0080;
pub const SO_OOBINLINE: i32 = 0x0100;
pub const SO_REUSEPORT: i32 = 0x0200;
pub const SO_TIMESTAMP: i32 = 0x0400;
pub const SO_SNDBUF: i32 = 0x1001;
pub const SO_RCVBUF: i32 = 0x1002;
pub const SO_SNDLOWAT: i32 = 0x1003;
pub const SO_RCVLOWAT: i32 = 0x1004;
pub const SO_SNDTIMEO: i32 = 0x1005;
pub const SO_RCVTIMEO: i32 = 0x1006;
pub const SO_ERROR: i32 = 0x1007;
pub const SO_TYPE: i32 = 0x1008;
pub const SO_NBIO: i32 = 0x1009;
pub const SO_BIO: i32 = 0x100a;
pub const SO_NOSIGPIPE: i32 = 0x1022;

pub const TCP_NODELAY: i32 = 1;
pub const TCP_MAXSEG: i32 = 2;

pub const IP_OPTIONS: i32 = 1;
pub const IP_HDRINCL: i32 = 2;
pub const IP_TOS: i32 = 3;
pub const IP_TTL: i32 = 4;
pub const IP_RECVOPTS: i32 = 5;
pub const IP_RECVRETOPTS: i32 = 6;
pub const IP_RECVDSTADDR: i32 = 7;
pub const IP_RETOPTS: i32 = 8;
pub const IP_MULTICAST_IF: i32 = 9;
pub const IP_MULTICAST_TTL: i32 = 10;
pub const IP_MULTICAST_LOOP: i32 = 11;
pub const IP_ADD_MEMBERSHIP: i32 = 12;
pub const IP_DROP_MEMBERSHIP: i32 = 13;
pub const IP_PORTRANGE: i32 = 19;
pub const IP_RECVIF: i32 = 20;
pub const IP_ERRORMTU: i32 = 21;
pub const IP_IPSEC_POLICY: i32 = 22;

// ============================================================================
// Control messages
// ============================================================================

pub const SCM_RIGHTS: i32 = 0x01;
pub const SCM_CREDS: i32 = 0x04;
pub const SCM_TIMESTAMP: i32 = 0x08;

// ============================================================================
// Message and poll flags
// ============================================================================

bitflags! {
    /// `send`/`recv` flags in guest numbering
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MsgFlags: u32 {
        const OOB = 0x1;
        const PEEK = 0x2;
        const DONTROUTE = 0x4;
        const EOR = 0x8;
        const TRUNC = 0x10;
        const CTRUNC = 0x20;
        const WAITALL = 0x40;
        const DONTWAIT = 0x80;
        const BCAST = 0x100;
        const MCAST = 0x200;
    }
}

bitflags! {
    /// `pollfd.events` / `pollfd.revents` bits in guest numbering
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PollEvents: u16 {
        const IN = 0x0001;
        const PRI = 0x0002;
        const OUT = 0x0004;
        const ERR = 0x0008;
        const HUP = 0x0010;
        const NVAL = 0x0020;
        const RDNORM = 0x0040;
        const RDBAND = 0x0080;
        const WRNORM = 0x0100;
        const WRBAND = 0x0200;
    }
}

pub const SHUT_RD: i32 = 0;
pub const SHUT_WR: i32 = 1;
pub const SHUT_RDWR: i32 = 2;

pub const SOMAXCONN: i32 = 128;

/// Maximum number of handles in a guest fd_set
pub const FD_SETSIZE: usize = 256;

// ============================================================================
// Errno values
// ============================================================================

pub const EINTR: i32 = 4;
pub const EBADF: i32 = 9;
pub const EAGAIN: i32 = 11;
pub const EWOULDBLOCK: i32 = EAGAIN;
pub const EACCES: i32 = 13;
pub const EFAULT: i32 = 14;
pub const EINVAL: i32 = 22;
pub const ENOSPC: i32 = 28;
pub const EPIPE: i32 = 32;
pub const ENOMSG: i32 = 35;
pub const ENOLINK: i32 = 67;
pub const EPROTO: i32 = 71;
pub const EBADMSG: i32 = 77;
pub const EOPNOTSUPP: i32 = 95;
pub const EPFNOSUPPORT: i32 = 96;
pub const ECONNRESET: i32 = 104;
pub const ENOBUFS: i32 = 105;
pub const EAFNOSUPPORT: i32 = 106;
pub const EPROTOTYPE: i32 = 107;
pub const ENOTSOCK: i32 = 108;
pub const ENOPROTOOPT: i32 = 109;
pub const ESHUTDOWN: i32 = 110;
pub const ECONNREFUSED: i32 = 111;
pub const EADDRINUSE: i32 = 112;
pub const ECONNABORTED: i32 = 113;
pub const ENETUNREACH: i32 = 114;
pub const ENETDOWN: i32 = 115;
pub const ETIMEDOUT: i32 = 116;
pub const EHOSTDOWN: i32 = 117;
pub const EHOSTUNREACH: i32 = 118;
pub const EINPROGRESS: i32 = 119;
pub const EALREADY: i32 = 120;
pub const EDESTADDRREQ: i32 = 121;
pub const EMSGSIZE: i32 = 122;
pub const EPROTONOSUPPORT: i32 = 123;
pub const ESOCKTNOSUPPORT: i32 = 124;
pub const EADDRNOTAVAIL: i32 = 125;
pub const ENETRESET: i32 = 126;
pub const EISCONN: i32 = 127;
pub const ENOTCONN: i32 = 128;
pub const ETOOMANYREFS: i32 = 129;
pub const ENOTSUP: i32 = 134;

// ============================================================================
// Display names
// ============================================================================

pub(crate) const DOMAIN_NAMES: &[(i32, &str)] = &[
    (AF_UNSPEC, "AF_UNSPEC"),
    (AF_LOCAL, "AF_LOCAL"),
    (AF_INET, "AF_INET"),
    (AF_INET6, "AF_INET6"),
];

pub(crate) const TYPE_NAMES: &[(i32, &str)] = &[
    (SOCK_STREAM, "SOCK_STREAM"),
    (SOCK_DGRAM, "SOCK_DGRAM"),
    (SOCK_RAW, "SOCK_RAW"),
    (SOCK_RDM, "SOCK_RDM"),
    (SOCK_SEQPACKET, "SOCK_SEQPACKET"),
    (SOCK_DCCP, "SOCK_DCCP"),
    (SOCK_PACKET, "SOCK_PACKET"),
];

pub(crate) const PROTOCOL_NAMES: &[(i32, &str)] = &[
    (IPPROTO_IP, "IPPROTO_IP"),
    (IPPROTO_ICMP, "IPPROTO_ICMP"),
    (IPPROTO_IGMP, "IPPROTO_IGMP"),
    (IPPROTO_TCP, "IPPROTO_TCP"),
    (IPPROTO_EGP, "IPPROTO_EGP"),
    (IPPROTO_PUP, "IPPROTO_PUP"),
    (IPPROTO_UDP, "IPPROTO_UDP"),
    (IPPROTO_IDP, "IPPROTO_IDP"),
    (IPPROTO_RAW, "IPPROTO_RAW"),
];

pub(crate) const LEVEL_NAMES: &[(i32, &str)] = &[
    (SOL_SOCKET, "SOL_SOCKET"),
    (IPPROTO_IP, "IPPROTO_IP"),
    (IPPROTO_TCP, "IPPROTO_TCP"),
    (IPPROTO_UDP, "IPPROTO_UDP"),
];

pub(crate) const SOCKET_OPTION_NAMES: &[(i32, &str)] = &[
    (SO_DEBUG, "SO_DEBUG"),
    (SO_ACCEPTCONN, "SO_ACCEPTCONN"),
    (SO_REUSEADDR, "SO_REUSEADDR"),
    (SO_KEEPALIVE, "SO_KEEPALIVE"),
    (SO_DONTROUTE, "SO_DONTROUTE"),
    (SO_BROADCAST, "SO_BROADCAST"),
    (SO_USELOOPBACK, "SO_USELOOPBACK"),
    (SO_LINGER, "SO_LINGER"),
    (SO_OOBINLINE, "SO_OOBINLINE"),
    (SO_REUSEPORT, "SO_REUSEPORT"),
    (SO_TIMESTAMP, "SO_TIMESTAMP"),
    (SO_SNDBUF, "SO_SNDBUF"),
    (SO_RCVBUF, "SO_RCVBUF"),
    (SO_SNDLOWAT, "SO_SNDLOWAT"),
    (SO_RCVLOWAT, "SO_RCVLOWAT"),
    (SO_SNDTIMEO, "SO_SNDTIMEO"),
    (SO_RCVTIMEO, "SO_RCVTIMEO"),
    (SO_ERROR, "SO_ERROR"),
    (SO_TYPE, "SO_TYPE"),
    (SO_NBIO, "SO_NBIO"),
    (SO_BIO, "SO_BIO"),
    (SO_NOSIGPIPE, "SO_NOSIGPIPE"),
];

pub(crate) const IP_OPTION_NAMES: &[(i32, &str)] = &[
    (IP_OPTIONS, "IP_OPTIONS"),
    (IP_HDRINCL, "IP_HDRINCL"),
    (IP_TOS, "IP_TOS"),
    (IP_TTL, "IP_TTL"),
    (IP_RECVOPTS, "IP_RECVOPTS"),
    (IP_RECVRETOPTS, "IP_RECVRETOPTS"),
    (IP_RECVDSTADDR, "IP_RECVDSTADDR"),
    (IP_RETOPTS, "IP_RETOPTS"),
    (IP_MULTICAST_IF, "IP_MULTICAST_IF"),
    (IP_MULTICAST_TTL, "IP_MULTICAST_TTL"),
    (IP_MULTICAST_LOOP, "IP_MULTICAST_LOOP"),
    (IP_ADD_MEMBERSHIP, "IP_ADD_MEMBERSHIP"),
    (IP_DROP_MEMBERSHIP, "IP_DROP_MEMBERSHIP"),
    (IP_PORTRANGE, "IP_PORTRANGE"),
    (IP_RECVIF, "IP_RECVIF"),
    (IP_ERRORMTU, "IP_ERRORMTU"),
    (IP_IPSEC_POLICY, "IP_IPSEC_POLICY"),
];

pub(crate) const TCP_OPTION_NAMES: &[(i32, &str)] = &[
    (TCP_NODELAY, "TCP_NODELAY"),
    (TCP_MAXSEG, "TCP_MAXSEG"),
];

pub(crate) const CMSG_NAMES: &[(i32, &str)] = &[
    (SCM_RIGHTS, "SCM_RIGHTS"),
    (SCM_CREDS, "SCM_CREDS"),
    (SCM_TIMESTAMP, "SCM_TIMESTAMP"),
];

pub(crate) const ERRNO_NAMES: &[(i32, &str)] = &[
    (EINTR, "EINTR"),
    (EBADF, "EBADF"),
    (EAGAIN, "EAGAIN"),
    (EACCES, "EACCES"),
    (EFAULT, "EFAULT"),
    (EINVAL, "EINVAL"),
    (ENOSPC, "ENOSPC"),
    (EPIPE, "EPIPE"),
    (ENOMSG, "ENOMSG"),
    (ENOLINK, "ENOLINK"),
    (EPROTO, "EPROTO"),
    (EBADMSG, "EBADMSG"),
    (EOPNOTSUPP, "EOPNOTSUPP"),
    (EPFNOSUPPORT, "EPFNOSUPPORT"),
    (ECONNRESET, "ECONNRESET"),
    (ENOBUFS, "ENOBUFS"),
    (EAFNOSUPPORT, "EAFNOSUPPORT"),
    (EPROTOTYPE, "EPROTOTYPE"),
    (ENOTSOCK, "ENOTSOCK"),
    (ENOPROTOOPT, "ENOPROTOOPT"),
    (ESHUTDOWN, "ESHUTDOWN"),
    (ECONNREFUSED, "ECONNREFUSED"),
    (EADDRINUSE, "EADDRINUSE"),
    (ECONNABORTED, "ECONNABORTED"),
    (ENETUNREACH, "ENETUNREACH"),
    (ENETDOWN, "ENETDOWN"),
    (ETIMEDOUT, "ETIMEDOUT"),
    (EHOSTDOWN, "EHOSTDOWN"),
    (EHOSTUNREACH, "EHOSTUNREACH"),
    (EINPROGRESS, "EINPROGRESS"),
    (EALREADY, "EALREADY"),
    (EDESTADDRREQ, "EDESTADDRREQ"),
    (EMSGSIZE, "EMSGSIZE"),
    (EPROTONOSUPPORT, "EPROTONOSUPPORT"),
    (ESOCKTNOSUPPORT, "ESOCKTNOSUPPORT"),
    (EADDRNOTAVAIL, "EADDRNOTAVAIL"),
    (ENETRESET, "ENETRESET"),
    (EISCONN, "EISCONN"),
    (ENOTCONN, "ENOTCONN"),
    (ETOOMANYREFS, "ETOOMANYREFS"),
    (ENOTSUP, "ENOTSUP"),
];
