//! Diagnostic names for guest constants

use super::guest;

fn lookup(table: &[(i32, &'static str)], value: i32) -> Option<&'static str> {
    table.iter().find(|(v, _)| *v == value).map(|(_, n)| *n)
}

pub fn domain_name(domain: i32) -> String {
    lookup(guest::DOMAIN_NAMES, domain)
        .map(str::to_string)
        .unwrap_or_else(|| format!("AF_{:08x}", domain))
}

/// Socket type, including any `SOCK_CLOEXEC`/`SOCK_NONBLOCK` flags
pub fn socket_type_name(ty: i32) -> String {
    let (base, flags) = super::tables::split_socket_type(ty);
    let mut out = lookup(guest::TYPE_NAMES, base)
        .map(str::to_string)
        .unwrap_or_else(|| format!("SOCK_{:08x}", base));
    for (flag, name) in [
        (guest::SocketTypeFlags::CLOEXEC, "SOCK_CLOEXEC"),
        (guest::SocketTypeFlags::NONBLOCK, "SOCK_NONBLOCK"),
        (guest::SocketTypeFlags::NOSIGPIPE, "SOCK_NOSIGPIPE"),
    ] {
        if flags.contains(flag) {
            out.push_str(" | ");
            out.push_str(name);
        }
    }
    out
}

pub fn protocol_name(protocol: i32) -> String {
    lookup(guest::PROTOCOL_NAMES, protocol)
        .map(str::to_string)
        .unwrap_or_else(|| format!("IPPROTO_{:08x}", protocol))
}

pub fn level_name(level: i32) -> String {
    lookup(guest::LEVEL_NAMES, level)
        .map(str::to_string)
        .unwrap_or_else(|| format!("SOL_{:08x}", level))
}

pub fn option_name(level: i32, name: i32) -> String {
    let table = match level {
        guest::SOL_SOCKET => guest::SOCKET_OPTION_NAMES,
        guest::IPPROTO_IP => guest::IP_OPTION_NAMES,
        guest::IPPROTO_TCP => guest::TCP_OPTION_NAMES,
        _ => &[],
    };
    lookup(table, name)
        .map(str::to_string)
        .unwrap_or_else(|| format!("SO_{:08x} (Level = {:08x})", name, level))
}

pub fn cmsg_name(ty: i32) -> String {
    lookup(guest::CMSG_NAMES, ty)
        .map(str::to_string)
        .unwrap_or_else(|| format!("SCM_{:08x}", ty))
}

pub fn errno_name(errno: i32) -> &'static str {
    if errno == 0 {
        return "(0=no error)";
    }
    lookup(guest::ERRNO_NAMES, errno).unwrap_or("(unknown!)")
}

pub fn msg_flags_name(flags: guest::MsgFlags) -> String {
    if flags.is_empty() {
        return "0".to_string();
    }
    flags
        .iter_names()
        .map(|(name, _)| format!("MSG_{}", name))
        .collect::<Vec<_>>()
        .join(" | ")
}
