//! Guest socket structure layouts
//!
//! Guest structures are serialised field by field; offsets and padding are
//! part of the ABI.
//!
//! ```text
//! sockaddr_in (16 bytes)
//! ┌─────┬────────┬──────────┬────────────┬──────────┐
//! │ len │ family │ port(BE) │ addr (BE)  │ zero[8]  │
//! │ u8  │ u8     │ u16      │ u32        │          │
//! └─────┴────────┴──────────┴────────────┴──────────┘
//!
//! fd_set (32 bytes): u32[8] little-endian, bit n = socket id n
//! pollfd (8 bytes):  i32 fd, i16 events, i16 revents
//! timeval (8 bytes): u32 sec, u32 usec
//! linger (8 bytes):  i32 onoff, i32 linger
//!
//! msghdr (28 bytes)
//! ┌──────┬─────────┬─────┬────────┬─────────┬────────────┬───────┐
//! │ name │ namelen │ iov │ iovlen │ control │ controllen │ flags │
//! │ u32  │ u32     │ u32 │ i32    │ u32     │ u32        │ i32   │
//! └──────┴─────────┴─────┴────────┴─────────┴────────────┴───────┘
//!
//! iovec (8 bytes):   u32 base, u32 len
//! cmsghdr (12 bytes): u32 len (header included), i32 level, i32 type,
//!                     then data padded to 4 bytes
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::SocketError;
use crate::translate::guest;
use crate::translate::guest::PollEvents;

pub const SOCKADDR_SIZE: usize = 16;
pub const FD_SET_SIZE: usize = guest::FD_SETSIZE / 8;
pub const POLLFD_SIZE: usize = 8;
pub const TIMEVAL_SIZE: usize = 8;
pub const LINGER_SIZE: usize = 8;
pub const MSGHDR_SIZE: usize = 28;
pub const IOVEC_SIZE: usize = 8;
pub const CMSGHDR_SIZE: usize = 12;

/// Guest `sockaddr_in`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestSockAddr {
    pub family: u8,
    pub addr: SocketAddrV4,
}

impl GuestSockAddr {
    pub fn inet(addr: SocketAddrV4) -> Self {
        Self {
            family: guest::AF_INET as u8,
            addr,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SocketError> {
        if bytes.len() < 8 {
            return Err(SocketError::InvalidArgument("sockaddr too short"));
        }
        let family = bytes[1];
        let port = BigEndian::read_u16(&bytes[2..4]);
        let ip = Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]);
        Ok(Self {
            family,
            addr: SocketAddrV4::new(ip, port),
        })
    }

    /// Decode and require `AF_INET`
    pub fn decode_inet(bytes: &[u8]) -> Result<SocketAddrV4, SocketError> {
        let sa = Self::decode(bytes)?;
        if sa.family as i32 != guest::AF_INET {
            return Err(SocketError::FamilyNotSupported(sa.family as i32));
        }
        Ok(sa.addr)
    }

    pub fn encode(&self) -> [u8; SOCKADDR_SIZE] {
        let mut out = [0u8; SOCKADDR_SIZE];
        out[0] = SOCKADDR_SIZE as u8;
        out[1] = self.family;
        BigEndian::write_u16(&mut out[2..4], self.addr.port());
        out[4..8].copy_from_slice(&self.addr.ip().octets());
        out
    }
}

/// Guest `fd_set`: a 256-bit mask indexed by socket id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FdSet {
    words: [u32; 8],
}

impl FdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SocketError> {
        if bytes.len() < FD_SET_SIZE {
            return Err(SocketError::InvalidArgument("fd_set too short"));
        }
        let mut words = [0u32; 8];
        LittleEndian::read_u32_into(&bytes[..FD_SET_SIZE], &mut words);
        Ok(Self { words })
    }

    pub fn encode(&self) -> [u8; FD_SET_SIZE] {
        let mut out = [0u8; FD_SET_SIZE];
        LittleEndian::write_u32_into(&self.words, &mut out);
        out
    }

    pub fn contains(&self, id: i32) -> bool {
        if !(0..guest::FD_SETSIZE as i32).contains(&id) {
            return false;
        }
        self.words[id as usize / 32] & (1 << (id as usize % 32)) != 0
    }

    pub fn insert(&mut self, id: i32) {
        if (0..guest::FD_SETSIZE as i32).contains(&id) {
            self.words[id as usize / 32] |= 1 << (id as usize % 32);
        }
    }

    pub fn clear(&mut self) {
        self.words = [0; 8];
    }

    /// Ids set below `nfds`
    pub fn ids(&self, nfds: usize) -> impl Iterator<Item = i32> + '_ {
        (0..nfds.min(guest::FD_SETSIZE) as i32).filter(move |id| self.contains(*id))
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Guest `pollfd`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollFd {
    pub fd: i32,
    pub events: PollEvents,
    pub revents: PollEvents,
}

impl PollFd {
    pub fn decode(bytes: &[u8]) -> Result<Self, SocketError> {
        if bytes.len() < POLLFD_SIZE {
            return Err(SocketError::InvalidArgument("pollfd too short"));
        }
        Ok(Self {
            fd: LittleEndian::read_i32(&bytes[0..4]),
            events: PollEvents::from_bits_truncate(LittleEndian::read_u16(&bytes[4..6])),
            revents: PollEvents::from_bits_truncate(LittleEndian::read_u16(&bytes[6..8])),
        })
    }

    pub fn encode(&self) -> [u8; POLLFD_SIZE] {
        let mut out = [0u8; POLLFD_SIZE];
        LittleEndian::write_i32(&mut out[0..4], self.fd);
        LittleEndian::write_u16(&mut out[4..6], self.events.bits());
        LittleEndian::write_u16(&mut out[6..8], self.revents.bits());
        out
    }
}

/// Guest `timeval`, converted to microseconds
pub fn decode_timeval_us(bytes: &[u8]) -> Result<u64, SocketError> {
    if bytes.len() < TIMEVAL_SIZE {
        return Err(SocketError::InvalidArgument("timeval too short"));
    }
    let sec = LittleEndian::read_u32(&bytes[0..4]) as u64;
    let usec = LittleEndian::read_u32(&bytes[4..8]) as u64;
    Ok(sec * 1_000_000 + usec)
}

pub fn encode_timeval(us: u64) -> [u8; TIMEVAL_SIZE] {
    let mut out = [0u8; TIMEVAL_SIZE];
    LittleEndian::write_u32(&mut out[0..4], (us / 1_000_000) as u32);
    LittleEndian::write_u32(&mut out[4..8], (us % 1_000_000) as u32);
    out
}

/// Guest `linger` as `(onoff, seconds)`
pub fn decode_linger(bytes: &[u8]) -> Result<(bool, u32), SocketError> {
    if bytes.len() < LINGER_SIZE {
        return Err(SocketError::InvalidArgument("linger too short"));
    }
    let onoff = LittleEndian::read_i32(&bytes[0..4]) != 0;
    let secs = LittleEndian::read_i32(&bytes[4..8]).max(0) as u32;
    Ok((onoff, secs))
}

pub fn encode_linger(onoff: bool, secs: u32) -> [u8; LINGER_SIZE] {
    let mut out = [0u8; LINGER_SIZE];
    LittleEndian::write_i32(&mut out[0..4], onoff as i32);
    LittleEndian::write_i32(&mut out[4..8], secs as i32);
    out
}

/// Guest `msghdr`; pointers are guest addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GuestMsgHdr {
    pub name: u32,
    pub name_len: u32,
    pub iov: u32,
    pub iov_len: i32,
    pub control: u32,
    pub control_len: u32,
    pub flags: i32,
}

impl GuestMsgHdr {
    pub fn decode(bytes: &[u8]) -> Result<Self, SocketError> {
        if bytes.len() < MSGHDR_SIZE {
            return Err(SocketError::InvalidArgument("msghdr too short"));
        }
        Ok(Self {
            name: LittleEndian::read_u32(&bytes[0..4]),
            name_len: LittleEndian::read_u32(&bytes[4..8]),
            iov: LittleEndian::read_u32(&bytes[8..12]),
            iov_len: LittleEndian::read_i32(&bytes[12..16]),
            control: LittleEndian::read_u32(&bytes[16..20]),
            control_len: LittleEndian::read_u32(&bytes[20..24]),
            flags: LittleEndian::read_i32(&bytes[24..28]),
        })
    }

    pub fn encode(&self) -> [u8; MSGHDR_SIZE] {
        let mut out = [0u8; MSGHDR_SIZE];
        LittleEndian::write_u32(&mut out[0..4], self.name);
        LittleEndian::write_u32(&mut out[4..8], self.name_len);
        LittleEndian::write_u32(&mut out[8..12], self.iov);
        LittleEndian::write_i32(&mut out[12..16], self.iov_len);
        LittleEndian::write_u32(&mut out[16..20], self.control);
        LittleEndian::write_u32(&mut out[20..24], self.control_len);
        LittleEndian::write_i32(&mut out[24..28], self.flags);
        out
    }
}

/// Guest `iovec` as `(base, len)`
pub fn decode_iovec(bytes: &[u8]) -> Result<(u32, u32), SocketError> {
    if bytes.len() < IOVEC_SIZE {
        return Err(SocketError::InvalidArgument("iovec too short"));
    }
    Ok((
        LittleEndian::read_u32(&bytes[0..4]),
        LittleEndian::read_u32(&bytes[4..8]),
    ))
}

pub fn encode_iovec(base: u32, len: u32) -> [u8; IOVEC_SIZE] {
    let mut out = [0u8; IOVEC_SIZE];
    LittleEndian::write_u32(&mut out[0..4], base);
    LittleEndian::write_u32(&mut out[4..8], len);
    out
}

/// One ancillary data item; level and type use whichever numbering the
/// holder is working in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub level: i32,
    pub ty: i32,
    pub data: Vec<u8>,
}

const fn cmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

/// Parse a guest control buffer
pub fn decode_control(bytes: &[u8]) -> Result<Vec<ControlMessage>, SocketError> {
    let mut messages = Vec::new();
    let mut offset = 0;
    while bytes.len() - offset >= CMSGHDR_SIZE {
        let header = &bytes[offset..offset + CMSGHDR_SIZE];
        let len = LittleEndian::read_u32(&header[0..4]) as usize;
        if len < CMSGHDR_SIZE || len > bytes.len() - offset {
            return Err(SocketError::InvalidArgument("malformed control message"));
        }
        messages.push(ControlMessage {
            level: LittleEndian::read_i32(&header[4..8]),
            ty: LittleEndian::read_i32(&header[8..12]),
            data: bytes[offset + CMSGHDR_SIZE..offset + len].to_vec(),
        });
        offset = (offset + cmsg_align(len)).min(bytes.len());
    }
    Ok(messages)
}

/// Lay out `messages` for the guest; returns the buffer and whether
/// anything was left out for lack of `capacity`
pub fn encode_control(messages: &[ControlMessage], capacity: usize) -> (Vec<u8>, bool) {
    let mut out = Vec::new();
    for message in messages {
        let len = CMSGHDR_SIZE + message.data.len();
        if out.len() + len > capacity {
            return (out, true);
        }
        let mut header = [0u8; CMSGHDR_SIZE];
        LittleEndian::write_u32(&mut header[0..4], len as u32);
        LittleEndian::write_i32(&mut header[4..8], message.level);
        LittleEndian::write_i32(&mut header[8..12], message.ty);
        out.extend_from_slice(&header);
        out.extend_from_slice(&message.data);
        let padded = cmsg_align(out.len()).min(capacity);
        out.resize(padded.max(out.len()), 0);
    }
    (out, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_layout() {
        let sa = GuestSockAddr::inet(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 0x1234));
        let bytes = sa.encode();
        assert_eq!(bytes[0], 16);
        assert_eq!(bytes[1], 2);
        assert_eq!(&bytes[2..4], &[0x12, 0x34]);
        assert_eq!(&bytes[4..8], &[10, 0, 0, 5]);
        assert_eq!(&bytes[8..], &[0; 8]);
        assert_eq!(GuestSockAddr::decode(&bytes).unwrap(), sa);
    }

    #[test]
    fn test_sockaddr_rejects_other_family() {
        let mut bytes = GuestSockAddr::inet(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1)).encode();
        bytes[1] = guest::AF_INET6 as u8;
        assert_eq!(
            GuestSockAddr::decode_inet(&bytes).unwrap_err(),
            SocketError::FamilyNotSupported(guest::AF_INET6)
        );
        assert!(GuestSockAddr::decode(&bytes[..4]).is_err());
    }

    #[test]
    fn test_fd_set_bits() {
        let mut set = FdSet::new();
        set.insert(61);
        set.insert(255);
        set.insert(300);
        assert!(set.contains(61));
        assert!(set.contains(255));
        assert!(!set.contains(62));
        assert_eq!(set.count(), 2);

        let bytes = set.encode();
        // id 61 -> word 1, bit 29
        assert_eq!(bytes[4..8], (1u32 << 29).to_le_bytes());
        assert_eq!(FdSet::decode(&bytes).unwrap(), set);
        assert_eq!(set.ids(256).collect::<Vec<_>>(), vec![61, 255]);
        assert_eq!(set.ids(100).collect::<Vec<_>>(), vec![61]);
    }

    #[test]
    fn test_pollfd_layout() {
        let pfd = PollFd {
            fd: 62,
            events: PollEvents::IN | PollEvents::OUT,
            revents: PollEvents::empty(),
        };
        let bytes = pfd.encode();
        assert_eq!(bytes, [62, 0, 0, 0, 5, 0, 0, 0]);
        assert_eq!(PollFd::decode(&bytes).unwrap(), pfd);
    }

    #[test]
    fn test_msghdr_layout() {
        let hdr = GuestMsgHdr {
            name: 0x0880_0100,
            name_len: 16,
            iov: 0x0880_0200,
            iov_len: 2,
            control: 0x0880_0300,
            control_len: 24,
            flags: 0,
        };
        let bytes = hdr.encode();
        assert_eq!(&bytes[0..4], &0x0880_0100u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &2i32.to_le_bytes());
        assert_eq!(&bytes[20..24], &24u32.to_le_bytes());
        assert_eq!(GuestMsgHdr::decode(&bytes).unwrap(), hdr);
        assert!(GuestMsgHdr::decode(&bytes[..20]).is_err());
        assert_eq!(decode_iovec(&encode_iovec(0x10, 0x20)).unwrap(), (0x10, 0x20));
    }

    #[test]
    fn test_control_messages_are_padded() {
        let messages = vec![
            ControlMessage {
                level: guest::IPPROTO_IP,
                ty: guest::IP_TTL,
                data: vec![1, 2, 3, 4, 5],
            },
            ControlMessage {
                level: guest::SOL_SOCKET,
                ty: guest::SCM_TIMESTAMP,
                data: vec![9; 8],
            },
        ];
        let (bytes, truncated) = encode_control(&messages, 64);
        assert!(!truncated);
        // 12 + 5 rounds up to 20, then 12 + 8
        assert_eq!(bytes.len(), 40);
        assert_eq!(&bytes[0..4], &17u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &20u32.to_le_bytes());
        assert_eq!(decode_control(&bytes).unwrap(), messages);

        let (short, truncated) = encode_control(&messages, 30);
        assert!(truncated);
        assert_eq!(decode_control(&short).unwrap(), messages[..1]);
    }

    #[test]
    fn test_control_rejects_bad_lengths() {
        let mut bytes = vec![0u8; 16];
        bytes[0..4].copy_from_slice(&40u32.to_le_bytes());
        assert!(decode_control(&bytes).is_err());
        bytes[0..4].copy_from_slice(&4u32.to_le_bytes());
        assert!(decode_control(&bytes).is_err());
        assert!(decode_control(&bytes[..8]).unwrap().is_empty());
    }

    #[test]
    fn test_timeval() {
        let bytes = encode_timeval(5_543_210);
        assert_eq!(decode_timeval_us(&bytes).unwrap(), 5_543_210);
        assert_eq!(&bytes[0..4], &5u32.to_le_bytes());
    }
}
