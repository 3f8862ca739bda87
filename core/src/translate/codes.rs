//! Kernel and network-library error codes
//!
//! Layout of a 32-bit error code:
//!
//! ```text
//!  31  30  29..28   27..16     15..0
//! ┌───┬───┬──────┬──────────┬──────────┐
//! │ E │ C │ rsvd │ facility │ code     │
//! └───┴───┴──────┴──────────┴──────────┘
//! ```
//!
//! For the networking facility (`0x041`) the high byte of `code` selects
//! the library module and the low byte is the error number.

/// Kernel error codes surfaced through the guest's error reporting path
pub mod kernel {
    pub const FILE_NOT_FOUND: u32 = 0x8001_0002;
    pub const INVALID_FILE_DESCRIPTOR: u32 = 0x8001_0009;
    pub const RESOURCE_UNAVAILABLE: u32 = 0x8001_000b;
    pub const NO_MEMORY: u32 = 0x8001_000c;
    pub const DEVICE_BUSY: u32 = 0x8001_0010;
    pub const FILE_ALREADY_EXISTS: u32 = 0x8001_0011;
    pub const DEVICE_NOT_FOUND: u32 = 0x8001_0013;
    pub const INVALID_ARGUMENT: u32 = 0x8001_0016;
    pub const FILE_IS_TOO_BIG: u32 = 0x8001_001b;
    pub const READ_ONLY: u32 = 0x8001_001e;
    pub const CLOSED: u32 = 0x8001_0020;
    pub const FILE_PROTOCOL: u32 = 0x8001_0047;
    pub const FILE_ADDR_IN_USE: u32 = 0x8001_0062;
    pub const CONNECTION_ABORTED: u32 = 0x8001_0067;
    pub const CONNECTION_RESET: u32 = 0x8001_0068;
    pub const NO_FREE_BUF_SPACE: u32 = 0x8001_0069;
    pub const FILE_TIMEOUT: u32 = 0x8001_006e;
    pub const IN_PROGRESS: u32 = 0x8001_0077;
    pub const ALREADY: u32 = 0x8001_0078;
    pub const NO_MEDIA: u32 = 0x8001_007b;
    pub const INVALID_MEDIUM: u32 = 0x8001_007c;
    pub const ADDRESS_NOT_AVAILABLE: u32 = 0x8001_007d;
    pub const NOT_CONNECTED: u32 = 0x8001_0080;
    pub const FUNCTION_NOT_SUPPORTED: u32 = 0x8001_b000;
    pub const ADDR_OUT_OF_MAIN_MEM: u32 = 0x8001_b001;
}

/// Inet library errors
pub mod inet {
    pub const ALREADY_INITIALIZED: u32 = 0x8041_0201;
    pub const SOCKET_BUSY: u32 = 0x8041_0202;
    pub const CLOSE_WAIT: u32 = 0x8041_0203;
    pub const NOT_INITIALIZED: u32 = 0x8041_0204;
    pub const INVALID_ARG: u32 = 0x8041_020b;
}

/// Ad-hoc PDP/PTP library errors
pub mod adhoc {
    pub const INVALID_SOCKET_ID: u32 = 0x8041_0701;
    pub const INVALID_ADDR: u32 = 0x8041_0702;
    pub const INVALID_PORT: u32 = 0x8041_0703;
    pub const INVALID_DATALEN: u32 = 0x8041_0705;
    pub const NOT_ENOUGH_SPACE: u32 = 0x8041_0706;
    pub const SOCKET_DELETED: u32 = 0x8041_0707;
    pub const SOCKET_ALERTED: u32 = 0x8041_0708;
    pub const WOULD_BLOCK: u32 = 0x8041_0709;
    pub const PORT_IN_USE: u32 = 0x8041_070a;
    pub const NOT_CONNECTED: u32 = 0x8041_070b;
    pub const DISCONNECTED: u32 = 0x8041_070c;
    pub const NOT_OPENED: u32 = 0x8041_070d;
    pub const NOT_LISTENED: u32 = 0x8041_070e;
    pub const SOCKET_ID_NOT_AVAIL: u32 = 0x8041_070f;
    pub const PORT_NOT_AVAIL: u32 = 0x8041_0710;
    pub const INVALID_ARG: u32 = 0x8041_0711;
    pub const NOT_INITIALIZED: u32 = 0x8041_0712;
    pub const ALREADY_INITIALIZED: u32 = 0x8041_0713;
    pub const BUSY: u32 = 0x8041_0714;
    pub const TIMEOUT: u32 = 0x8041_0715;
    pub const NO_ENTRY: u32 = 0x8041_0716;
    pub const EXCEPTION_EVENT: u32 = 0x8041_0717;
    pub const CONNECTION_REFUSED: u32 = 0x8041_0718;
    pub const THREAD_ABORTED: u32 = 0x8041_0719;
    pub const ALREADY_CREATED: u32 = 0x8041_071a;
    pub const NOT_IN_GAMEMODE: u32 = 0x8041_071b;
    pub const NOT_CREATED: u32 = 0x8041_071c;
}

/// Ad-hoc matching library errors
pub mod matching {
    pub const INVALID_MODE: u32 = 0x8041_0801;
    pub const INVALID_PORT: u32 = 0x8041_0802;
    pub const INVALID_MAXNUM: u32 = 0x8041_0803;
    pub const RXBUF_TOO_SHORT: u32 = 0x8041_0804;
    pub const INVALID_OPTLEN: u32 = 0x8041_0805;
    pub const INVALID_ARG: u32 = 0x8041_0806;
    pub const INVALID_ID: u32 = 0x8041_0807;
    pub const ID_NOT_AVAIL: u32 = 0x8041_0808;
    pub const NO_SPACE: u32 = 0x8041_0809;
    pub const IS_RUNNING: u32 = 0x8041_080a;
    pub const NOT_RUNNING: u32 = 0x8041_080b;
    pub const UNKNOWN_TARGET: u32 = 0x8041_080c;
    pub const TARGET_NOT_READY: u32 = 0x8041_080d;
    pub const EXCEED_MAXNUM: u32 = 0x8041_080e;
    pub const REQUEST_IN_PROGRESS: u32 = 0x8041_080f;
    pub const ALREADY_ESTABLISHED: u32 = 0x8041_0810;
    pub const BUSY: u32 = 0x8041_0811;
    pub const ALREADY_INITIALIZED: u32 = 0x8041_0812;
    pub const NOT_INITIALIZED: u32 = 0x8041_0813;
    pub const PORT_IN_USE: u32 = 0x8041_0814;
    pub const STACKSIZE_TOO_SHORT: u32 = 0x8041_0815;
    pub const INVALID_DATALEN: u32 = 0x8041_0816;
    pub const NOT_ESTABLISHED: u32 = 0x8041_0817;
    pub const DATA_BUSY: u32 = 0x8041_0818;
}

/// Ad-hoc control (relay session) errors
pub mod adhocctl {
    pub const INVALID_PARAMETER: u32 = 0x8041_0b01;
    pub const TIMEOUT: u32 = 0x8041_0b02;
    pub const ID_NOT_FOUND: u32 = 0x8041_0b03;
    pub const INVALID_ARG: u32 = 0x8041_0b04;
    pub const BUSY: u32 = 0x8041_0b05;
    pub const HANDLER_MAX: u32 = 0x8041_0b06;
    pub const STACKSIZE_TOO_SHORT: u32 = 0x8041_0b07;
    pub const NOT_INITIALIZED: u32 = 0x8041_0b08;
    pub const DISCONNECTED: u32 = 0x8041_0b09;
    pub const ALREADY_INITIALIZED: u32 = 0x8041_0b0a;
    pub const ALREADY_CONNECTED: u32 = 0x8041_0b0b;
    pub const WLAN_SWITCH_OFF: u32 = 0x8041_0b0c;
    pub const CHANNEL_NOT_AVAILABLE: u32 = 0x8041_0b0d;
    pub const NOT_ENTER_GAMEMODE: u32 = 0x8041_0b0e;
}

const FACILITY_NET: u32 = 0x041;

fn module_name(module: u32) -> &'static str {
    match module {
        0x00 => "COMMON",
        0x01 => "CORE",
        0x02 => "INET",
        0x03 => "POECLIENT",
        0x04 => "RESOLVER",
        0x05 => "DHCP",
        0x06 => "ADHOC_AUTH",
        0x07 => "ADHOC",
        0x08 => "ADHOC_MATCHING",
        0x09 => "NETCNF",
        0x0a => "APCTL",
        0x0b => "ADHOCCTL",
        0x0c => "UNKNOWN1",
        0x0d => "WLAN",
        0x0e => "EAPOL",
        0x0f => "8021x",
        0x10 => "WPA",
        0x11 => "UNKNOWN2",
        0x12 => "TRANSFER",
        0x13 => "ADHOC_DISCOVER",
        0x14 => "ADHOC_DIALOG",
        0x15 => "WISPR",
        _ => "UNKNOWN",
    }
}

/// Human readable breakdown of an error code for log lines
///
/// ```text
/// 0x80410701 -> "ERROR NET ADHOC #0x01"
/// ```
pub fn describe_net_error(code: u32) -> String {
    if code & 0x8000_0000 == 0 {
        return format!("{:#010x}", code);
    }
    let mut out = String::from("ERROR");
    if code & 0x4000_0000 != 0 {
        out.push_str(" CRITICAL");
    }
    let facility = (code >> 16) & 0x0fff;
    if facility == FACILITY_NET {
        let module = (code >> 8) & 0xff;
        out.push_str(" NET ");
        out.push_str(module_name(module));
        out.push_str(&format!(" #{:#04x}", code & 0xff));
    } else {
        out.push_str(&format!(" FACILITY {:#05x} #{:#06x}", facility, code & 0xffff));
    }
    out
}
