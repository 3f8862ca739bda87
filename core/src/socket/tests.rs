//! Socket shim tests over loopback

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::*;
use crate::mac::MacAddr;
use crate::peers::{Peer, PeerDirectory};
use crate::port::PortProtocol;
use crate::test_utils::{init_test_logging, test_shim, wait_until};
use crate::translate::{MsgFlags, PollEvents, guest};

fn localhost(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
}

fn udp(shim: &SocketShim) -> i32 {
    shim.create(guest::AF_INET, guest::SOCK_DGRAM, guest::IPPROTO_UDP)
        .unwrap()
}

fn int(v: i32) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

#[test]
fn test_create_ids_start_at_61() {
    let (shim, _) = test_shim();
    let a = udp(&shim);
    let b = udp(&shim);
    assert!(a >= 61);
    assert!(b > a);
}

#[test]
fn test_create_rejects_unsupported_arguments() {
    let (shim, _) = test_shim();
    assert_eq!(
        shim.create(guest::AF_INET6, guest::SOCK_DGRAM, 0).unwrap_err(),
        SocketError::FamilyNotSupported(guest::AF_INET6)
    );
    assert_eq!(
        shim.create(guest::AF_INET, 0x0e, 0).unwrap_err(),
        SocketError::TypeNotSupported(0x0e)
    );
    assert_eq!(
        shim.create(guest::AF_INET, guest::SOCK_DGRAM, 99).unwrap_err(),
        SocketError::ProtocolNotSupported(99)
    );
    assert!(shim.registry().is_empty());
}

#[test]
fn test_nonblock_type_flag() {
    let (shim, _) = test_shim();
    let id = shim
        .create(guest::AF_INET, guest::SOCK_DGRAM | 0x2000_0000, 0)
        .unwrap();
    assert!(shim.is_non_blocking(id).unwrap());
}

#[test]
fn test_abort_unconnected_socket() {
    let (shim, _) = test_shim();
    let id = udp(&shim);
    shim.abort(id).unwrap();
    shim.close(id).unwrap();
    assert_eq!(shim.abort(id), Err(SocketError::UnknownHandle(id)));
}

#[test]
fn test_operations_after_close_fail_with_unknown_handle() {
    let (shim, _) = test_shim();
    let id = udp(&shim);
    shim.close(id).unwrap();

    let unknown = SocketError::UnknownHandle(id);
    let mut buf = [0u8; 16];
    assert_eq!(shim.close(id).unwrap_err(), unknown);
    assert_eq!(shim.close_with_rst(id).unwrap_err(), unknown);
    assert_eq!(shim.bind(id, localhost(0)).unwrap_err(), unknown);
    assert_eq!(shim.connect(id, localhost(9)).unwrap_err(), unknown);
    assert_eq!(shim.listen(id, 1).unwrap_err(), unknown);
    assert_eq!(shim.accept(id).unwrap_err(), unknown);
    assert_eq!(shim.shutdown(id, guest::SHUT_RDWR).unwrap_err(), unknown);
    assert_eq!(shim.send(id, b"x", MsgFlags::empty()).unwrap_err(), unknown);
    assert_eq!(
        shim.send_to(id, b"x", MsgFlags::empty(), localhost(9)).unwrap_err(),
        unknown
    );
    assert_eq!(shim.recv(id, &mut buf, MsgFlags::empty()).unwrap_err(), unknown);
    assert_eq!(
        shim.recv_from(id, &mut buf, MsgFlags::empty()).unwrap_err(),
        unknown
    );
    assert_eq!(
        shim.set_option(id, guest::SOL_SOCKET, guest::SO_NBIO, &int(1)).unwrap_err(),
        unknown
    );
    assert_eq!(
        shim.get_option(id, guest::SOL_SOCKET, guest::SO_NBIO).unwrap_err(),
        unknown
    );
    assert_eq!(shim.local_addr(id).unwrap_err(), unknown);
    assert_eq!(shim.peer_addr(id).unwrap_err(), unknown);
    assert_eq!(unknown.guest_errno(), guest::EBADF);

    let mut set = FdSet::new();
    set.insert(id);
    let err = shim
        .select(id + 1, Some(&mut set), None, None, Some(0))
        .unwrap_err();
    assert_eq!(err.guest_errno(), guest::EBADF);

    let mut fds = [PollFd {
        fd: id,
        events: PollEvents::IN,
        revents: PollEvents::empty(),
    }];
    assert_eq!(shim.poll(&mut fds, Some(0)).unwrap(), 1);
    assert_eq!(fds[0].revents, PollEvents::NVAL);
}

#[test]
fn test_udp_send_recv_and_would_block() {
    init_test_logging();
    let (shim, _) = test_shim();
    let a = udp(&shim);
    let b = udp(&shim);
    shim.bind(a, localhost(0)).unwrap();
    let b_addr = shim.bind(b, localhost(0)).unwrap();

    let mut buf = [0u8; 64];
    let err = shim.recv(b, &mut buf, MsgFlags::empty()).unwrap_err();
    assert!(err.is_would_block());
    assert_eq!(err.guest_errno(), guest::EAGAIN);

    assert_eq!(
        shim.send_to(a, b"hello", MsgFlags::empty(), b_addr).unwrap(),
        5
    );
    let mut got = None;
    assert!(wait_until(Duration::from_secs(1), || {
        match shim.recv_from(b, &mut buf, MsgFlags::DONTWAIT) {
            Ok(r) => {
                got = Some(r);
                true
            }
            Err(_) => false,
        }
    }));
    let (len, from) = got.unwrap();
    assert_eq!(&buf[..len], b"hello");
    assert_eq!(*from.ip(), Ipv4Addr::LOCALHOST);
}

/// Poll `recv_msg` until a datagram shows up
fn recv_msg_within(shim: &SocketShim, id: i32, buf: &mut [u8], control: usize) -> ReceivedMessage {
    let mut got = None;
    assert!(wait_until(Duration::from_secs(1), || {
        match shim.recv_msg(id, buf, control, MsgFlags::empty()) {
            Ok(message) => {
                got = Some(message);
                true
            }
            Err(e) => {
                assert!(e.is_would_block());
                false
            }
        }
    }));
    got.unwrap()
}

#[test]
fn test_udp_sendmsg_recvmsg() {
    init_test_logging();
    let (shim, _) = test_shim();
    let a = udp(&shim);
    let b = udp(&shim);
    let a_addr = shim.bind(a, localhost(0)).unwrap();
    let b_addr = shim.bind(b, localhost(0)).unwrap();

    let ttl = ControlMessage {
        level: guest::IPPROTO_IP,
        ty: guest::IP_TTL,
        data: int(32),
    };
    assert_eq!(
        shim.send_msg(a, b"gathered", &[ttl], MsgFlags::empty(), Some(b_addr))
            .unwrap(),
        8
    );

    let mut buf = [0u8; 32];
    let message = recv_msg_within(&shim, b, &mut buf, 0);
    assert_eq!(&buf[..message.len], b"gathered");
    assert_eq!(message.from.map(|from| from.port()), Some(a_addr.port()));
    assert!(message.control.is_empty());

    let unknown = ControlMessage {
        level: guest::SOL_SOCKET,
        ty: 0x7777,
        data: Vec::new(),
    };
    assert_eq!(
        shim.send_msg(a, b"x", &[unknown], MsgFlags::empty(), Some(b_addr))
            .unwrap_err()
            .guest_errno(),
        guest::EINVAL
    );
}

#[cfg(target_os = "linux")]
#[test]
fn test_recvmsg_reports_timestamps_in_guest_layout() {
    init_test_logging();
    let (shim, _) = test_shim();
    let a = udp(&shim);
    let b = udp(&shim);
    shim.bind(a, localhost(0)).unwrap();
    let b_addr = shim.bind(b, localhost(0)).unwrap();
    shim.set_option(b, guest::SOL_SOCKET, guest::SO_TIMESTAMP, &int(1))
        .unwrap();

    shim.send_to(a, b"tick", MsgFlags::empty(), b_addr).unwrap();
    let mut buf = [0u8; 16];
    let message = recv_msg_within(&shim, b, &mut buf, 64);
    assert_eq!(&buf[..message.len], b"tick");
    assert_eq!(message.control.len(), 1);
    let stamp = &message.control[0];
    assert_eq!((stamp.level, stamp.ty), (guest::SOL_SOCKET, guest::SCM_TIMESTAMP));
    assert_eq!(stamp.data.len(), sockaddr::TIMEVAL_SIZE);
    assert!(sockaddr::decode_timeval_us(&stamp.data).unwrap() > 0);
}

#[test]
fn test_bind_reports_routable_address_and_forwards_port() {
    let (shim, ports) = test_shim();
    let id = udp(&shim);
    let reported = shim.bind(id, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).unwrap();
    assert!(!reported.ip().is_unspecified());
    assert_ne!(reported.port(), 0);
    assert_eq!(shim.local_addr(id).unwrap(), reported);
    assert_eq!(ports.added.lock().as_slice(), &[(PortProtocol::Udp, reported.port())]);

    shim.close(id).unwrap();
    assert_eq!(
        ports.removed.lock().as_slice(),
        &[(PortProtocol::Udp, reported.port())]
    );
}

#[test]
fn test_emulated_blocking_options() {
    let (shim, _) = test_shim();
    let id = udp(&shim);
    assert_eq!(
        shim.get_option(id, guest::SOL_SOCKET, guest::SO_NBIO).unwrap(),
        int(0)
    );
    shim.set_option(id, guest::SOL_SOCKET, guest::SO_NBIO, &int(1))
        .unwrap();
    assert!(shim.is_non_blocking(id).unwrap());
    assert_eq!(
        shim.get_option(id, guest::SOL_SOCKET, guest::SO_BIO).unwrap(),
        int(0)
    );
    shim.set_option(id, guest::SOL_SOCKET, guest::SO_BIO, &int(1))
        .unwrap();
    assert!(!shim.is_non_blocking(id).unwrap());
}

#[test]
fn test_option_allow_lists() {
    let (shim, _) = test_shim();
    let inet = udp(&shim);
    let adhoc = shim
        .create_owned(
            SocketOwner::Adhoc,
            guest::AF_INET,
            guest::SOCK_DGRAM,
            guest::IPPROTO_UDP,
        )
        .unwrap();

    let linger = super::sockaddr::encode_linger(true, 0);
    assert_eq!(
        shim.set_option(inet, guest::SOL_SOCKET, guest::SO_LINGER, &linger)
            .unwrap_err(),
        SocketError::UnsupportedOption {
            level: guest::SOL_SOCKET,
            name: guest::SO_LINGER
        }
    );
    shim.set_option(adhoc, guest::SOL_SOCKET, guest::SO_LINGER, &linger)
        .unwrap();

    shim.set_option(adhoc, guest::SOL_SOCKET, guest::SO_DONTROUTE, &int(1))
        .unwrap();
    assert_eq!(
        shim.get_option(adhoc, guest::SOL_SOCKET, guest::SO_DONTROUTE)
            .unwrap(),
        int(1)
    );

    assert!(matches!(
        shim.set_option(inet, guest::SOL_SOCKET, guest::SO_DEBUG, &int(1)),
        Err(SocketError::UnsupportedOption { .. })
    ));
    assert!(matches!(
        shim.set_option(inet, guest::SOL_SOCKET, guest::SO_TYPE, &int(1)),
        Err(SocketError::UnsupportedOption { .. })
    ));
}

#[test]
fn test_buffer_and_timeout_options() {
    let (shim, _) = test_shim();
    let id = udp(&shim);

    let err = shim
        .set_option(id, guest::SOL_SOCKET, guest::SO_RCVBUF, &int(9 * 1024 * 1024))
        .unwrap_err();
    assert_eq!(err.guest_errno(), guest::ENOBUFS);
    shim.set_option(id, guest::SOL_SOCKET, guest::SO_RCVBUF, &int(64 * 1024))
        .unwrap();

    shim.set_option(id, guest::SOL_SOCKET, guest::SO_RCVTIMEO, &int(250_000))
        .unwrap();
    assert_eq!(
        shim.get_option(id, guest::SOL_SOCKET, guest::SO_RCVTIMEO)
            .unwrap(),
        int(250_000)
    );
    assert_eq!(
        shim.get_option(id, guest::SOL_SOCKET, guest::SO_TYPE).unwrap(),
        int(guest::SOCK_DGRAM)
    );
    assert_eq!(
        shim.get_option(id, guest::SOL_SOCKET, guest::SO_ERROR).unwrap(),
        int(0)
    );
    shim.set_option(id, guest::SOL_SOCKET, guest::SO_REUSEADDR, &int(1))
        .unwrap();
}

#[test]
fn test_select_reports_readable() {
    let (shim, _) = test_shim();
    let a = udp(&shim);
    let b = udp(&shim);
    shim.bind(a, localhost(0)).unwrap();
    let b_addr = shim.bind(b, localhost(0)).unwrap();

    let mut read = FdSet::new();
    read.insert(b);
    assert_eq!(
        shim.select(b + 1, Some(&mut read), None, None, Some(0)).unwrap(),
        0
    );
    assert!(!read.contains(b));

    shim.send_to(a, b"ping", MsgFlags::empty(), b_addr).unwrap();
    let mut read = FdSet::new();
    read.insert(b);
    let mut write = FdSet::new();
    write.insert(a);
    let n = shim
        .select(b + 1, Some(&mut read), Some(&mut write), None, Some(500_000))
        .unwrap();
    assert!(n >= 1);
    assert!(write.contains(a));

    assert_eq!(
        shim.select(257, None, None, None, Some(0))
            .unwrap_err()
            .guest_errno(),
        guest::EINVAL
    );
}

#[test]
fn test_poll_masks_requested_events() {
    let (shim, _) = test_shim();
    let a = udp(&shim);
    shim.bind(a, localhost(0)).unwrap();

    let mut fds = [PollFd {
        fd: a,
        events: PollEvents::OUT,
        revents: PollEvents::empty(),
    }];
    assert_eq!(shim.poll(&mut fds, Some(100_000)).unwrap(), 1);
    assert!(fds[0].revents.contains(PollEvents::OUT));
    assert!(!fds[0].revents.contains(PollEvents::IN));
}

#[test]
fn test_tcp_listen_accept_connect() {
    let (shim, ports) = test_shim();
    let server = shim
        .create(guest::AF_INET, guest::SOCK_STREAM, guest::IPPROTO_TCP)
        .unwrap();
    let addr = shim.bind(server, localhost(0)).unwrap();
    shim.listen(server, guest::SOMAXCONN).unwrap();
    assert_eq!(ports.added.lock()[0].0, PortProtocol::Tcp);

    let client = shim
        .create(guest::AF_INET, guest::SOCK_STREAM, guest::IPPROTO_TCP)
        .unwrap();
    shim.connect(client, addr).unwrap();

    let mut accepted = None;
    assert!(wait_until(Duration::from_secs(1), || {
        match shim.accept(server) {
            Ok(r) => {
                accepted = Some(r);
                true
            }
            Err(e) => {
                assert!(e.is_would_block());
                false
            }
        }
    }));
    let (conn, from) = accepted.unwrap();
    assert!(conn > client);
    assert_eq!(*from.ip(), Ipv4Addr::LOCALHOST);
    assert_eq!(shim.peer_addr(client).unwrap(), addr);

    shim.send(client, b"abc", MsgFlags::empty()).unwrap();
    let mut buf = [0u8; 8];
    let mut n = 0;
    assert!(wait_until(Duration::from_secs(1), || {
        match shim.recv(conn, &mut buf, MsgFlags::empty()) {
            Ok(len) => {
                n = len;
                true
            }
            Err(_) => false,
        }
    }));
    assert_eq!(&buf[..n], b"abc");

    shim.shutdown(client, guest::SHUT_WR).unwrap();
    assert!(shim.shutdown(client, 7).is_err());

    // Aborted sockets keep their id but read end-of-stream
    shim.abort(conn).unwrap();
    assert!(shim.registry().contains(conn));
    assert_eq!(shim.recv(conn, &mut buf, MsgFlags::empty()).unwrap(), 0);
    shim.close_with_rst(conn).unwrap();
    shim.close(client).unwrap();
    shim.close(server).unwrap();
}

#[test]
fn test_nonblocking_connect_reports_in_progress_or_success() {
    let (shim, _) = test_shim();
    let server = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = server.local_addr().unwrap().port();

    let id = shim
        .create(guest::AF_INET, guest::SOCK_STREAM, guest::IPPROTO_TCP)
        .unwrap();
    shim.set_option(id, guest::SOL_SOCKET, guest::SO_NBIO, &int(1))
        .unwrap();
    match shim.connect(id, localhost(port)) {
        Ok(()) => {}
        Err(e) => assert_eq!(e.guest_errno(), guest::EINPROGRESS),
    }
}

// ============================================================================
// PDP
// ============================================================================

fn pdp_pair() -> (PdpLayer, PdpLayer, MacAddr, MacAddr) {
    let (shim_a, _) = test_shim();
    let (shim_b, _) = test_shim();
    let mac_a = MacAddr([0x02, 0, 0, 0, 0, 0xa1]);
    let mac_b = MacAddr([0x02, 0, 0, 0, 0, 0xb2]);
    let base = 20_000 + (std::process::id() % 5_000) as u16 * 2;

    let peers_a = Arc::new(PeerDirectory::new());
    let peers_b = Arc::new(PeerDirectory::new());
    peers_a.add(Peer {
        nickname: "B".into(),
        mac: mac_b,
        ip: Ipv4Addr::LOCALHOST,
        port_offset: base + 1,
        last_recv_us: 1,
    });
    peers_b.add(Peer {
        nickname: "A".into(),
        mac: mac_a,
        ip: Ipv4Addr::LOCALHOST,
        port_offset: base,
        last_recv_us: 1,
    });
    (
        PdpLayer::new(shim_a, peers_a, mac_a, base),
        PdpLayer::new(shim_b, peers_b, mac_b, base + 1),
        mac_a,
        mac_b,
    )
}

#[test]
fn test_pdp_unicast_and_broadcast() {
    let (a, b, mac_a, mac_b) = pdp_pair();
    let sa = a.create(mac_a, 7).unwrap();
    let sb = b.create(mac_b, 7).unwrap();
    assert_eq!(a.guest_port(sa).unwrap(), 7);

    assert_eq!(
        a.create(mac_b, 8).unwrap_err(),
        AdhocError::InvalidAddr(mac_b)
    );

    let mut buf = [0u8; 32];
    assert_eq!(b.recv(sb, &mut buf).unwrap_err(), AdhocError::WouldBlock);

    a.send(sa, mac_b, 7, b"unicast").unwrap();
    thread::sleep(Duration::from_millis(20));
    let pkt = b.recv(sb, &mut buf).unwrap();
    assert_eq!(pkt.from, mac_a);
    assert_eq!(pkt.port, 7);
    assert_eq!(&buf[..pkt.len], b"unicast");

    b.send(sb, MacAddr::BROADCAST, 7, b"all").unwrap();
    thread::sleep(Duration::from_millis(20));
    let pkt = a.recv(sa, &mut buf).unwrap();
    assert_eq!(pkt.from, mac_b);
    assert_eq!(&buf[..pkt.len], b"all");

    let unknown = MacAddr([0x02, 9, 9, 9, 9, 9]);
    assert_eq!(
        a.send(sa, unknown, 7, b"x").unwrap_err(),
        AdhocError::InvalidAddr(unknown)
    );

    a.delete(sa).unwrap();
    assert_eq!(a.delete(sa).unwrap_err(), AdhocError::InvalidSocketId(sa));
    assert_eq!(
        a.send(sa, mac_b, 7, b"x").unwrap_err().code(),
        crate::translate::codes::adhoc::INVALID_SOCKET_ID
    );
}

#[test]
fn test_pdp_port_in_use() {
    let (a, _b, mac_a, _) = pdp_pair();
    let first = a.create(mac_a, 9).unwrap();
    // Reuse-port lets a second bind succeed on some hosts; either outcome
    // must leave the registry consistent.
    match a.create(mac_a, 9) {
        Ok(second) => assert!(second > first),
        Err(e) => assert_eq!(e, AdhocError::PortInUse(9)),
    }
}
