use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::clock::SystemClock;
use crate::mac::MacAddr;
use crate::peers::{Peer, PeerDirectory};
use crate::socket::SocketShim;
use crate::test_utils::{init_test_logging, test_shim, wait_until};

const WAIT: Duration = Duration::from_secs(3);

fn login(last: u8, nickname: &str) -> LoginParameters {
    LoginParameters {
        mac: MacAddr([0x02, 0, 0, 0, 0, last]),
        nickname: nickname.to_string(),
        product_code: "ULUS10000".to_string(),
    }
}

fn settings_for(addr: SocketAddr) -> RelaySettings {
    RelaySettings {
        server: addr.ip().to_string(),
        port: addr.port(),
        keepalive_interval: Duration::from_millis(50),
        worker_sleep: Duration::from_millis(2),
        ..RelaySettings::default()
    }
}

fn client(shim: &Arc<SocketShim>, addr: SocketAddr) -> (RelayClient, Arc<PeerDirectory>) {
    let peers = Arc::new(PeerDirectory::new());
    let client = RelayClient::new(
        Arc::clone(shim),
        Arc::clone(&peers),
        SystemClock::shared(),
        settings_for(addr),
    );
    (client, peers)
}

/// Accept one connection and consume its LOGIN frame
fn accept_login(listener: &TcpListener) -> (TcpStream, Vec<u8>) {
    let (mut stream, _) = listener.accept().unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut frame = vec![0u8; 144];
    stream.read_exact(&mut frame).unwrap();
    (stream, frame)
}

#[test]
fn test_login_frame_sent_on_init() {
    init_test_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (shim, _) = test_shim();
    let (mut client, _) = client(&shim, listener.local_addr().unwrap());

    client.init(login(1, "Tester")).unwrap();
    let (_stream, frame) = accept_login(&listener);

    let (packet, len) = ClientPacket::decode(&frame).unwrap().unwrap();
    assert_eq!(len, 144);
    assert_eq!(
        packet,
        ClientPacket::Login {
            mac: MacAddr([0x02, 0, 0, 0, 0, 1]),
            nickname: "Tester".to_string(),
            product: "ULUS10000".to_string(),
        }
    );
    assert!(client.is_initialized());
    client.term();
    assert!(!client.is_initialized());
}

#[test]
fn test_connect_notification_adds_peer() {
    init_test_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (shim, _) = test_shim();
    let (mut client, peers) = client(&shim, listener.local_addr().unwrap());
    client.init(login(1, "Tester")).unwrap();
    let (mut stream, _) = accept_login(&listener);

    let before = peers.active_count();
    let frame = ServerPacket::Connect {
        nickname: "Alice".to_string(),
        mac: "AA:BB:CC:DD:EE:FF".parse().unwrap(),
        ip: Ipv4Addr::new(10, 0, 0, 5),
    }
    .to_bytes();
    // Split the frame to exercise reassembly
    stream.write_all(&frame[..50]).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    stream.write_all(&frame[50..]).unwrap();

    assert!(wait_until(WAIT, || peers.active_count() == before + 1));
    let alice = peers
        .find_by_mac("aa:bb:cc:dd:ee:ff".parse().unwrap())
        .unwrap();
    assert_eq!(alice.nickname, "Alice");
    assert_eq!(alice.ip, Ipv4Addr::new(10, 0, 0, 5));

    stream
        .write_all(
            &ServerPacket::Disconnect {
                ip: Ipv4Addr::new(10, 0, 0, 5),
            }
            .to_bytes(),
        )
        .unwrap();
    assert!(wait_until(WAIT, || peers.count() == 0));
    client.term();
}

#[test]
fn test_server_hangup_reports_error() {
    init_test_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (shim, _) = test_shim();
    let (mut client, _) = client(&shim, listener.local_addr().unwrap());
    client.init(login(1, "Tester")).unwrap();
    let (stream, _) = accept_login(&listener);
    drop(stream);

    let mut events = Vec::new();
    assert!(wait_until(WAIT, || {
        events.extend(client.take_events());
        !events.is_empty()
    }));
    assert_eq!(events[0].event, AdhocctlEvent::Error);
    assert_eq!(client.state(), AdhocctlState::Disconnected);
    assert_eq!(client.connect("GROUP"), Err(RelayError::Disconnected));
    client.term();
}

#[test]
fn test_session_argument_errors() {
    init_test_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (shim, _) = test_shim();
    let (mut client, _) = client(&shim, listener.local_addr().unwrap());

    assert_eq!(client.connect("GROUP"), Err(RelayError::NotInitialized));
    assert_eq!(client.scan(), Err(RelayError::NotInitialized));

    client.init(login(1, "Tester")).unwrap();
    let (_stream, _) = accept_login(&listener);
    assert_eq!(
        client.init(login(1, "Tester")),
        Err(RelayError::AlreadyInitialized)
    );
    assert!(matches!(
        client.connect("bad group!"),
        Err(RelayError::InvalidGroupName(_))
    ));
    assert!(matches!(client.chat("hi"), Err(RelayError::Busy(_))));
    client.term();
}

#[test]
fn test_unreachable_server_releases_socket() {
    init_test_logging();
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let (shim, _) = test_shim();
    let (mut client, _) = client(&shim, addr);

    assert!(matches!(
        client.init(login(1, "Tester")),
        Err(RelayError::Socket(_))
    ));
    assert!(!client.is_initialized());
    assert!(shim.registry().is_empty());
}

#[test]
fn test_two_players_join_group() {
    init_test_logging();
    let server = RelayServer::bind("127.0.0.1:0".parse().unwrap())
        .unwrap()
        .spawn()
        .unwrap();
    let (shim, _) = test_shim();
    let (mut host, host_peers) = client(&shim, server.local_addr());
    let (mut guest, guest_peers) = client(&shim, server.local_addr());

    host.init(login(1, "Host")).unwrap();
    host.connect("GROUP1").unwrap();
    assert!(wait_until(WAIT, || host.state() == AdhocctlState::Connected));
    assert_eq!(host.bssid(), Some(MacAddr([0x02, 0, 0, 0, 0, 1])));

    guest.init(login(2, "Guest")).unwrap();
    guest.connect("GROUP1").unwrap();
    assert!(wait_until(WAIT, || guest.state() == AdhocctlState::Connected));
    // The founder stays the group's BSSID
    assert_eq!(guest.bssid(), Some(MacAddr([0x02, 0, 0, 0, 0, 1])));

    assert!(wait_until(WAIT, || host_peers.active_count() == 1
        && guest_peers.active_count() == 1));
    assert_eq!(
        host_peers.snapshot()[0].mac,
        MacAddr([0x02, 0, 0, 0, 0, 2])
    );
    assert_eq!(guest_peers.snapshot()[0].nickname, "Host");
    assert_eq!(
        host.take_events(),
        vec![AdhocctlNotification {
            event: AdhocctlEvent::Connect,
            error: 0
        }]
    );

    guest.chat("hello").unwrap();
    assert!(wait_until(WAIT, || host.chat_log() == vec!["Guest: hello".to_string()]));

    guest.disconnect().unwrap();
    assert!(wait_until(WAIT, || host_peers.count() == 0));
    assert_eq!(guest_peers.count(), 0);

    host.term();
    guest.term();
}

#[test]
fn test_restore_rejoins_saved_group() {
    init_test_logging();
    let server = RelayServer::bind("127.0.0.1:0".parse().unwrap())
        .unwrap()
        .spawn()
        .unwrap();
    let (shim, _) = test_shim();
    let (mut host, host_peers) = client(&shim, server.local_addr());
    let (mut guest, guest_peers) = client(&shim, server.local_addr());

    host.init(login(1, "Host")).unwrap();
    host.connect("SAVED").unwrap();
    assert!(wait_until(WAIT, || host.state() == AdhocctlState::Connected));
    guest.init(login(2, "Guest")).unwrap();
    guest.connect("SAVED").unwrap();
    assert!(wait_until(WAIT, || guest.state() == AdhocctlState::Connected));
    assert!(wait_until(WAIT, || guest_peers.active_count() == 1));

    let snapshot = guest.snapshot().unwrap();
    let saved_peers = guest_peers.snapshot();
    guest.term();
    assert_eq!(guest_peers.count(), 0);
    assert!(wait_until(WAIT, || host_peers.count() == 0));

    // The embedder puts the saved directory back before the session
    let offline = Peer {
        nickname: "Offline".to_string(),
        mac: MacAddr([0x02, 0, 0, 0, 0, 7]),
        ip: Ipv4Addr::new(10, 0, 0, 7),
        port_offset: 0,
        last_recv_us: 5,
    };
    guest_peers.replace_all(saved_peers.into_iter().chain([offline.clone()]).collect());
    guest.restore(snapshot).unwrap();

    // Saved state is visible before the server answers
    assert!(guest.is_initialized());
    assert_eq!(guest.state(), AdhocctlState::Connected);
    assert_eq!(guest.group().as_deref(), Some("SAVED"));
    assert_eq!(guest_peers.find_by_mac(offline.mac), Some(offline.clone()));

    // The rejoin is announced to the room and the host is still known
    assert!(wait_until(WAIT, || host_peers.active_count() == 1));
    assert!(guest_peers.find_by_mac(MacAddr([0x02, 0, 0, 0, 0, 1])).is_some());
    assert_eq!(guest_peers.find_by_mac(offline.mac), Some(offline));

    host.term();
    guest.term();
}

#[test]
fn test_scan_lists_groups() {
    init_test_logging();
    let server = RelayServer::bind("127.0.0.1:0".parse().unwrap())
        .unwrap()
        .spawn()
        .unwrap();
    let (shim, _) = test_shim();
    let (mut host, _) = client(&shim, server.local_addr());
    let (mut scanner, _) = client(&shim, server.local_addr());

    host.init(login(1, "Host")).unwrap();
    host.connect("LOBBY").unwrap();
    assert!(wait_until(WAIT, || host.state() == AdhocctlState::Connected));

    scanner.init(login(3, "Scanner")).unwrap();
    scanner.scan().unwrap();
    assert!(wait_until(WAIT, || scanner
        .take_events()
        .iter()
        .any(|n| n.event == AdhocctlEvent::Scan)));
    assert_eq!(
        scanner.scan_results(),
        vec![ScanResult {
            group: "LOBBY".to_string(),
            bssid: MacAddr([0x02, 0, 0, 0, 0, 1]),
        }]
    );
    assert_eq!(scanner.state(), AdhocctlState::Disconnected);

    host.term();
    scanner.term();
}

#[test]
fn test_server_drops_silent_users() {
    init_test_logging();
    let mut server = RelayServer::bind("127.0.0.1:0".parse().unwrap())
        .unwrap()
        .with_timeout(Duration::from_millis(50));
    let mut stream = TcpStream::connect(server.local_addr().unwrap()).unwrap();
    stream
        .write_all(
            &ClientPacket::Login {
                mac: MacAddr([0x02, 0, 0, 0, 0, 9]),
                nickname: "Idle".to_string(),
                product: "ULUS10000".to_string(),
            }
            .to_bytes(),
        )
        .unwrap();

    assert!(wait_until(WAIT, || {
        server.tick();
        server.user_count() == 1
    }));
    std::thread::sleep(Duration::from_millis(80));
    server.tick();
    assert_eq!(server.user_count(), 0);
}
