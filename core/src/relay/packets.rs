//! Relay protocol frames
//!
//! Every frame is a one-byte opcode followed by a fixed-layout payload.
//! There is no length field: the opcode alone determines the frame size, so
//! a reader buffers until the whole frame has arrived.
//!
//! ```text
//! C2S LOGIN         [1][mac:6][nickname:128][product:9]         144 bytes
//! C2S CONNECT       [2][group:8]                                  9 bytes
//! C2S CHAT          [7][message:64]                              65 bytes
//! C2S PING/DISCONNECT/SCAN                                        1 byte
//!
//! S2C CONNECT       [2][nickname:128][mac:6][ip:4 network order] 139 bytes
//! S2C DISCONNECT    [3][ip:4]                                     5 bytes
//! S2C SCAN          [4][group:8][mac:6]                          15 bytes
//! S2C SCAN_COMPLETE [5]                                           1 byte
//! S2C CONNECT_BSSID [6][mac:6]                                    7 bytes
//! S2C CHAT          [7][message:64][nickname:128]               193 bytes
//! ```

use std::fmt;
use std::net::Ipv4Addr;

use crate::mac::MacAddr;

/// Default relay server TCP port
pub const RELAY_PORT: u16 = 27312;

pub const OPCODE_PING: u8 = 0;
pub const OPCODE_LOGIN: u8 = 1;
pub const OPCODE_CONNECT: u8 = 2;
pub const OPCODE_DISCONNECT: u8 = 3;
pub const OPCODE_SCAN: u8 = 4;
pub const OPCODE_SCAN_COMPLETE: u8 = 5;
pub const OPCODE_CONNECT_BSSID: u8 = 6;
pub const OPCODE_CHAT: u8 = 7;

pub const NICKNAME_LEN: usize = 128;
pub const GROUP_NAME_LEN: usize = 8;
pub const PRODUCT_CODE_LEN: usize = 9;
pub const CHAT_MESSAGE_LEN: usize = 64;

const LOGIN_SIZE: usize = 1 + MacAddr::LEN + NICKNAME_LEN + PRODUCT_CODE_LEN;
const C2S_CONNECT_SIZE: usize = 1 + GROUP_NAME_LEN;
const C2S_CHAT_SIZE: usize = 1 + CHAT_MESSAGE_LEN;
const S2C_CONNECT_SIZE: usize = 1 + NICKNAME_LEN + MacAddr::LEN + 4;
const S2C_DISCONNECT_SIZE: usize = 1 + 4;
const S2C_SCAN_SIZE: usize = 1 + GROUP_NAME_LEN + MacAddr::LEN;
const S2C_CONNECT_BSSID_SIZE: usize = 1 + MacAddr::LEN;
const S2C_CHAT_SIZE: usize = C2S_CHAT_SIZE + NICKNAME_LEN;

/// Frame decode failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDecodeError {
    /// Opcode with no known frame layout; the stream cannot be resynchronised
    UnknownOpcode(u8),
}

impl fmt::Display for RelayDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOpcode(op) => write!(f, "unknown relay opcode {}", op),
        }
    }
}

impl std::error::Error for RelayDecodeError {}

// ============================================================================
// Fixed string helpers
// ============================================================================

fn put_fixed(out: &mut Vec<u8>, s: &str, len: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(len);
    out.extend_from_slice(&bytes[..n]);
    out.resize(out.len() + (len - n), 0);
}

/// Fixed string field, NUL-terminated if the message is shorter
fn put_cstr(out: &mut Vec<u8>, s: &str, len: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(len - 1);
    out.extend_from_slice(&bytes[..n]);
    out.resize(out.len() + (len - n), 0);
}

fn get_fixed(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn get_mac(bytes: &[u8]) -> MacAddr {
    MacAddr::from_slice(bytes).unwrap_or_default()
}

fn get_ip(bytes: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])
}

/// Group names are up to eight ASCII letters or digits
pub fn is_valid_group_name(name: &str) -> bool {
    name.len() <= GROUP_NAME_LEN && name.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Product codes are nine ASCII letters or digits
pub fn is_valid_product_code(code: &str) -> bool {
    code.len() == PRODUCT_CODE_LEN && code.bytes().all(|b| b.is_ascii_alphanumeric())
}

// ============================================================================
// Client → server
// ============================================================================

/// Frames sent by a relay client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPacket {
    Ping,
    Login {
        mac: MacAddr,
        nickname: String,
        product: String,
    },
    Connect {
        group: String,
    },
    Disconnect,
    Scan,
    Chat {
        message: String,
    },
}

impl ClientPacket {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LOGIN_SIZE);
        match self {
            Self::Ping => out.push(OPCODE_PING),
            Self::Login {
                mac,
                nickname,
                product,
            } => {
                out.push(OPCODE_LOGIN);
                out.extend_from_slice(&mac.0);
                put_cstr(&mut out, nickname, NICKNAME_LEN);
                put_fixed(&mut out, product, PRODUCT_CODE_LEN);
            }
            Self::Connect { group } => {
                out.push(OPCODE_CONNECT);
                put_fixed(&mut out, group, GROUP_NAME_LEN);
            }
            Self::Disconnect => out.push(OPCODE_DISCONNECT),
            Self::Scan => out.push(OPCODE_SCAN),
            Self::Chat { message } => {
                out.push(OPCODE_CHAT);
                put_cstr(&mut out, message, CHAT_MESSAGE_LEN);
            }
        }
        out
    }

    fn frame_len(opcode: u8) -> Option<usize> {
        match opcode {
            OPCODE_PING | OPCODE_DISCONNECT | OPCODE_SCAN => Some(1),
            OPCODE_LOGIN => Some(LOGIN_SIZE),
            OPCODE_CONNECT => Some(C2S_CONNECT_SIZE),
            OPCODE_CHAT => Some(C2S_CHAT_SIZE),
            _ => None,
        }
    }

    /// Decode one frame from the front of `buf`
    ///
    /// `Ok(None)` means the frame is still incomplete.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, RelayDecodeError> {
        let Some(&opcode) = buf.first() else {
            return Ok(None);
        };
        let len = Self::frame_len(opcode).ok_or(RelayDecodeError::UnknownOpcode(opcode))?;
        if buf.len() < len {
            return Ok(None);
        }
        let body = &buf[1..len];
        let packet = match opcode {
            OPCODE_PING => Self::Ping,
            OPCODE_LOGIN => Self::Login {
                mac: get_mac(&body[..6]),
                nickname: get_fixed(&body[6..6 + NICKNAME_LEN]),
                product: get_fixed(&body[6 + NICKNAME_LEN..]),
            },
            OPCODE_CONNECT => Self::Connect {
                group: get_fixed(body),
            },
            OPCODE_DISCONNECT => Self::Disconnect,
            OPCODE_SCAN => Self::Scan,
            _ => Self::Chat {
                message: get_fixed(body),
            },
        };
        Ok(Some((packet, len)))
    }
}

// ============================================================================
// Server → client
// ============================================================================

/// Frames sent by the relay server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPacket {
    /// A player joined the caller's group
    Connect {
        nickname: String,
        mac: MacAddr,
        ip: Ipv4Addr,
    },
    /// The player at `ip` left the group
    Disconnect { ip: Ipv4Addr },
    /// One group found by a scan
    Scan { group: String, mac: MacAddr },
    ScanComplete,
    /// Group joined; `mac` identifies the group host
    ConnectBssid { mac: MacAddr },
    Chat { message: String, nickname: String },
}

impl ServerPacket {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(S2C_CHAT_SIZE);
        match self {
            Self::Connect { nickname, mac, ip } => {
                out.push(OPCODE_CONNECT);
                put_cstr(&mut out, nickname, NICKNAME_LEN);
                out.extend_from_slice(&mac.0);
                out.extend_from_slice(&ip.octets());
            }
            Self::Disconnect { ip } => {
                out.push(OPCODE_DISCONNECT);
                out.extend_from_slice(&ip.octets());
            }
            Self::Scan { group, mac } => {
                out.push(OPCODE_SCAN);
                put_fixed(&mut out, group, GROUP_NAME_LEN);
                out.extend_from_slice(&mac.0);
            }
            Self::ScanComplete => out.push(OPCODE_SCAN_COMPLETE),
            Self::ConnectBssid { mac } => {
                out.push(OPCODE_CONNECT_BSSID);
                out.extend_from_slice(&mac.0);
            }
            Self::Chat { message, nickname } => {
                out.push(OPCODE_CHAT);
                put_cstr(&mut out, message, CHAT_MESSAGE_LEN);
                put_cstr(&mut out, nickname, NICKNAME_LEN);
            }
        }
        out
    }

    /// Frame size implied by an opcode
    pub fn frame_len(opcode: u8) -> Option<usize> {
        match opcode {
            OPCODE_CONNECT => Some(S2C_CONNECT_SIZE),
            OPCODE_DISCONNECT => Some(S2C_DISCONNECT_SIZE),
            OPCODE_SCAN => Some(S2C_SCAN_SIZE),
            OPCODE_SCAN_COMPLETE => Some(1),
            OPCODE_CONNECT_BSSID => Some(S2C_CONNECT_BSSID_SIZE),
            OPCODE_CHAT => Some(S2C_CHAT_SIZE),
            _ => None,
        }
    }

    /// Decode one frame from the front of `buf`
    ///
    /// `Ok(None)` means the frame is still incomplete.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, RelayDecodeError> {
        let Some(&opcode) = buf.first() else {
            return Ok(None);
        };
        let len = Self::frame_len(opcode).ok_or(RelayDecodeError::UnknownOpcode(opcode))?;
        if buf.len() < len {
            return Ok(None);
        }
        let body = &buf[1..len];
        let packet = match opcode {
            OPCODE_CONNECT => Self::Connect {
                nickname: get_fixed(&body[..NICKNAME_LEN]),
                mac: get_mac(&body[NICKNAME_LEN..NICKNAME_LEN + 6]),
                ip: get_ip(&body[NICKNAME_LEN + 6..]),
            },
            OPCODE_DISCONNECT => Self::Disconnect { ip: get_ip(body) },
            OPCODE_SCAN => Self::Scan {
                group: get_fixed(&body[..GROUP_NAME_LEN]),
                mac: get_mac(&body[GROUP_NAME_LEN..]),
            },
            OPCODE_SCAN_COMPLETE => Self::ScanComplete,
            OPCODE_CONNECT_BSSID => Self::ConnectBssid { mac: get_mac(body) },
            _ => Self::Chat {
                message: get_fixed(&body[..CHAT_MESSAGE_LEN]),
                nickname: get_fixed(&body[CHAT_MESSAGE_LEN..]),
            },
        };
        Ok(Some((packet, len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

    #[test]
    fn test_frame_sizes() {
        let login = ClientPacket::Login {
            mac: ALICE,
            nickname: "Alice".into(),
            product: "ULUS10000".into(),
        };
        assert_eq!(login.to_bytes().len(), 144);
        assert_eq!(
            ClientPacket::Connect {
                group: "ROOM1".into()
            }
            .to_bytes()
            .len(),
            9
        );
        assert_eq!(
            ClientPacket::Chat {
                message: "hi".into()
            }
            .to_bytes()
            .len(),
            65
        );
        assert_eq!(ClientPacket::Ping.to_bytes(), vec![0]);

        let connect = ServerPacket::Connect {
            nickname: "Alice".into(),
            mac: ALICE,
            ip: Ipv4Addr::new(10, 0, 0, 5),
        };
        assert_eq!(connect.to_bytes().len(), 139);
        assert_eq!(
            ServerPacket::Disconnect {
                ip: Ipv4Addr::LOCALHOST
            }
            .to_bytes()
            .len(),
            5
        );
        assert_eq!(
            ServerPacket::Scan {
                group: "ROOM1".into(),
                mac: ALICE
            }
            .to_bytes()
            .len(),
            15
        );
        assert_eq!(ServerPacket::ConnectBssid { mac: ALICE }.to_bytes().len(), 7);
        assert_eq!(
            ServerPacket::Chat {
                message: "m".into(),
                nickname: "n".into()
            }
            .to_bytes()
            .len(),
            193
        );
    }

    #[test]
    fn test_connect_layout_uses_network_order_ip() {
        let bytes = ServerPacket::Connect {
            nickname: "Alice".into(),
            mac: ALICE,
            ip: Ipv4Addr::new(10, 0, 0, 5),
        }
        .to_bytes();
        assert_eq!(bytes[0], OPCODE_CONNECT);
        assert_eq!(&bytes[1..6], b"Alice");
        assert_eq!(bytes[6], 0);
        assert_eq!(&bytes[129..135], &ALICE.0);
        assert_eq!(&bytes[135..139], &[10, 0, 0, 5]);
    }

    #[test]
    fn test_partial_frames_wait_for_more_data() {
        let bytes = ServerPacket::ConnectBssid { mac: ALICE }.to_bytes();
        for cut in 0..bytes.len() {
            assert_eq!(ServerPacket::decode(&bytes[..cut]).unwrap(), None);
        }
        let (pkt, len) = ServerPacket::decode(&bytes).unwrap().unwrap();
        assert_eq!(len, 7);
        assert_eq!(pkt, ServerPacket::ConnectBssid { mac: ALICE });
    }

    #[test]
    fn test_unknown_opcode() {
        assert_eq!(
            ServerPacket::decode(&[0x42, 0, 0]),
            Err(RelayDecodeError::UnknownOpcode(0x42))
        );
        assert_eq!(
            ClientPacket::decode(&[0x09]),
            Err(RelayDecodeError::UnknownOpcode(9))
        );
    }

    #[test]
    fn test_login_decode() {
        let login = ClientPacket::Login {
            mac: ALICE,
            nickname: "Alice".into(),
            product: "ULUS10000".into(),
        };
        let (decoded, len) = ClientPacket::decode(&login.to_bytes()).unwrap().unwrap();
        assert_eq!(len, 144);
        assert_eq!(decoded, login);
    }

    #[test]
    fn test_long_strings_are_truncated() {
        let message = "x".repeat(100);
        let bytes = ServerPacket::Chat {
            message: message.clone(),
            nickname: "n".into(),
        }
        .to_bytes();
        let (pkt, _) = ServerPacket::decode(&bytes).unwrap().unwrap();
        match pkt {
            ServerPacket::Chat { message: m, .. } => assert_eq!(m.len(), CHAT_MESSAGE_LEN - 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_group_and_product_validation() {
        assert!(is_valid_group_name("ROOM1"));
        assert!(is_valid_group_name(""));
        assert!(!is_valid_group_name("room-1"));
        assert!(!is_valid_group_name("TOOLONGNAME"));
        assert!(is_valid_product_code("ULUS10000"));
        assert!(!is_valid_product_code("ULUS1000"));
    }
}
