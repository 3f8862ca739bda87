//! Matching datagrams
//!
//! Carried over PDP. The first byte is the opcode; lengths are
//! little-endian `i32`.
//!
//! ```text
//! PING        [0]
//! HELLO       [1][optlen][opt]
//! JOIN        [2][optlen][opt]
//! ACCEPT      [3][optlen][siblingcount][opt][sibling mac * siblingcount]
//! CANCEL      [4][optlen][opt]
//! BULK        [5][datalen][data]
//! BULK_ABORT  [6]
//! BIRTH       [7][mac]
//! DEATH       [8][mac]
//! BYE         [9]
//! ```

use std::fmt;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::mac::MacAddr;

pub const OPCODE_PING: u8 = 0;
pub const OPCODE_HELLO: u8 = 1;
pub const OPCODE_JOIN: u8 = 2;
pub const OPCODE_ACCEPT: u8 = 3;
pub const OPCODE_CANCEL: u8 = 4;
pub const OPCODE_BULK: u8 = 5;
pub const OPCODE_BULK_ABORT: u8 = 6;
pub const OPCODE_BIRTH: u8 = 7;
pub const OPCODE_DEATH: u8 = 8;
pub const OPCODE_BYE: u8 = 9;

/// Malformed matching datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchingDecodeError {
    Empty,
    UnknownOpcode(u8),
    Truncated { opcode: u8, len: usize },
    InvalidLength { opcode: u8, declared: i32 },
}

impl fmt::Display for MatchingDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty datagram"),
            Self::UnknownOpcode(op) => write!(f, "unknown matching opcode {}", op),
            Self::Truncated { opcode, len } => {
                write!(f, "truncated packet (opcode {}, {} bytes)", opcode, len)
            }
            Self::InvalidLength { opcode, declared } => {
                write!(f, "invalid length {} in packet with opcode {}", declared, opcode)
            }
        }
    }
}

impl std::error::Error for MatchingDecodeError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchingPacket {
    Ping,
    Hello { opt: Vec<u8> },
    Join { opt: Vec<u8> },
    Accept { opt: Vec<u8>, siblings: Vec<MacAddr> },
    Cancel { opt: Vec<u8> },
    Bulk { data: Vec<u8> },
    BulkAbort,
    Birth { mac: MacAddr },
    Death { mac: MacAddr },
    Bye,
}

impl MatchingPacket {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Ping => OPCODE_PING,
            Self::Hello { .. } => OPCODE_HELLO,
            Self::Join { .. } => OPCODE_JOIN,
            Self::Accept { .. } => OPCODE_ACCEPT,
            Self::Cancel { .. } => OPCODE_CANCEL,
            Self::Bulk { .. } => OPCODE_BULK,
            Self::BulkAbort => OPCODE_BULK_ABORT,
            Self::Birth { .. } => OPCODE_BIRTH,
            Self::Death { .. } => OPCODE_DEATH,
            Self::Bye => OPCODE_BYE,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.opcode()];
        // Writes into a Vec cannot fail.
        let _ = self.write_body(&mut out);
        out
    }

    fn write_body(&self, out: &mut Vec<u8>) -> std::io::Result<()> {
        match self {
            Self::Hello { opt } | Self::Join { opt } | Self::Cancel { opt } => {
                out.write_i32::<LittleEndian>(opt.len() as i32)?;
                out.extend_from_slice(opt);
            }
            Self::Accept { opt, siblings } => {
                out.write_i32::<LittleEndian>(opt.len() as i32)?;
                out.write_i32::<LittleEndian>(siblings.len() as i32)?;
                out.extend_from_slice(opt);
                for mac in siblings {
                    out.extend_from_slice(&mac.0);
                }
            }
            Self::Bulk { data } => {
                out.write_i32::<LittleEndian>(data.len() as i32)?;
                out.extend_from_slice(data);
            }
            Self::Birth { mac } | Self::Death { mac } => out.extend_from_slice(&mac.0),
            Self::Ping | Self::BulkAbort | Self::Bye => {}
        }
        Ok(())
    }

    /// Decode one datagram; trailing bytes are ignored
    pub fn decode(buf: &[u8]) -> Result<Self, MatchingDecodeError> {
        let (&opcode, _) = buf.split_first().ok_or(MatchingDecodeError::Empty)?;
        let truncated = MatchingDecodeError::Truncated {
            opcode,
            len: buf.len(),
        };
        let mut cursor = Cursor::new(&buf[1..]);

        let read_len = |cursor: &mut Cursor<&[u8]>| -> Result<usize, MatchingDecodeError> {
            let declared = cursor.read_i32::<LittleEndian>().map_err(|_| truncated)?;
            usize::try_from(declared)
                .map_err(|_| MatchingDecodeError::InvalidLength { opcode, declared })
        };
        let remaining = |cursor: &Cursor<&[u8]>| {
            cursor.get_ref().len().saturating_sub(cursor.position() as usize)
        };
        // Declared lengths are checked against the datagram before allocating
        let read_bytes = |cursor: &mut Cursor<&[u8]>, len: usize| -> Result<Vec<u8>, MatchingDecodeError> {
            if len > remaining(cursor) {
                return Err(truncated);
            }
            let mut bytes = vec![0u8; len];
            cursor.read_exact(&mut bytes).map_err(|_| truncated)?;
            Ok(bytes)
        };
        let read_mac = |cursor: &mut Cursor<&[u8]>| -> Result<MacAddr, MatchingDecodeError> {
            let mut mac = [0u8; MacAddr::LEN];
            cursor.read_exact(&mut mac).map_err(|_| truncated)?;
            Ok(MacAddr(mac))
        };

        match opcode {
            OPCODE_PING => Ok(Self::Ping),
            OPCODE_HELLO | OPCODE_JOIN | OPCODE_CANCEL => {
                let len = read_len(&mut cursor)?;
                let opt = read_bytes(&mut cursor, len)?;
                Ok(match opcode {
                    OPCODE_HELLO => Self::Hello { opt },
                    OPCODE_JOIN => Self::Join { opt },
                    _ => Self::Cancel { opt },
                })
            }
            OPCODE_ACCEPT => {
                let len = read_len(&mut cursor)?;
                let count = read_len(&mut cursor)?;
                let opt = read_bytes(&mut cursor, len)?;
                if count > remaining(&cursor) / MacAddr::LEN {
                    return Err(truncated);
                }
                let siblings = (0..count)
                    .map(|_| read_mac(&mut cursor))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::Accept { opt, siblings })
            }
            OPCODE_BULK => {
                let len = read_len(&mut cursor)?;
                if len == 0 {
                    return Err(MatchingDecodeError::InvalidLength {
                        opcode,
                        declared: 0,
                    });
                }
                Ok(Self::Bulk {
                    data: read_bytes(&mut cursor, len)?,
                })
            }
            OPCODE_BULK_ABORT => Ok(Self::BulkAbort),
            OPCODE_BIRTH => Ok(Self::Birth {
                mac: read_mac(&mut cursor)?,
            }),
            OPCODE_DEATH => Ok(Self::Death {
                mac: read_mac(&mut cursor)?,
            }),
            OPCODE_BYE => Ok(Self::Bye),
            other => Err(MatchingDecodeError::UnknownOpcode(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: MacAddr = MacAddr([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);

    #[test]
    fn test_hello_layout() {
        let bytes = MatchingPacket::Hello { opt: vec![9, 8, 7] }.to_bytes();
        assert_eq!(bytes, vec![1, 3, 0, 0, 0, 9, 8, 7]);
    }

    #[test]
    fn test_accept_layout() {
        let packet = MatchingPacket::Accept {
            opt: vec![0xaa],
            siblings: vec![MAC],
        };
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), 9 + 1 + 6);
        assert_eq!(&bytes[1..5], &[1, 0, 0, 0]);
        assert_eq!(&bytes[5..9], &[1, 0, 0, 0]);
        assert_eq!(bytes[9], 0xaa);
        assert_eq!(&bytes[10..], &MAC.0);
        assert_eq!(MatchingPacket::decode(&bytes), Ok(packet));
    }

    #[test]
    fn test_birth_and_single_byte_frames() {
        assert_eq!(MatchingPacket::Birth { mac: MAC }.to_bytes().len(), 7);
        assert_eq!(MatchingPacket::Ping.to_bytes(), vec![0]);
        assert_eq!(MatchingPacket::Bye.to_bytes(), vec![9]);
        assert_eq!(MatchingPacket::decode(&[6, 1, 2]), Ok(MatchingPacket::BulkAbort));
    }

    #[test]
    fn test_malformed_packets_rejected() {
        assert_eq!(MatchingPacket::decode(&[]), Err(MatchingDecodeError::Empty));
        assert_eq!(
            MatchingPacket::decode(&[42]),
            Err(MatchingDecodeError::UnknownOpcode(42))
        );
        // optlen claims more bytes than present
        assert!(matches!(
            MatchingPacket::decode(&[1, 10, 0, 0, 0, 1]),
            Err(MatchingDecodeError::Truncated { opcode: 1, .. })
        ));
        // negative optlen
        assert!(matches!(
            MatchingPacket::decode(&[2, 0xff, 0xff, 0xff, 0xff]),
            Err(MatchingDecodeError::InvalidLength { opcode: 2, declared: -1 })
        ));
        // empty bulk payload
        assert!(matches!(
            MatchingPacket::decode(&[5, 0, 0, 0, 0]),
            Err(MatchingDecodeError::InvalidLength { opcode: 5, .. })
        ));
        // sibling array cut short
        assert!(matches!(
            MatchingPacket::decode(&[3, 0, 0, 0, 0, 2, 0, 0, 0, 1, 2, 3]),
            Err(MatchingDecodeError::Truncated { opcode: 3, .. })
        ));
        // lengths far beyond the datagram fail without reserving them
        for opcode in [OPCODE_HELLO, OPCODE_JOIN, OPCODE_CANCEL, OPCODE_BULK] {
            assert_eq!(
                MatchingPacket::decode(&[opcode, 0xff, 0xff, 0xff, 0x7f]),
                Err(MatchingDecodeError::Truncated { opcode, len: 5 })
            );
        }
        assert_eq!(
            MatchingPacket::decode(&[3, 0, 0, 0, 0, 0xff, 0xff, 0xff, 0x7f, 1]),
            Err(MatchingDecodeError::Truncated { opcode: 3, len: 10 })
        );
        assert!(matches!(
            MatchingPacket::decode(&[7, 1, 2]),
            Err(MatchingDecodeError::Truncated { opcode: 7, .. })
        ));
    }
}
