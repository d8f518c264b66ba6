use std::net::{SocketAddr, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};
use umpbridge::midi::{EventLog, MockDevice};
use umpbridge::session::wire::{bye_reason, decode_datagram, encode_datagram, Command, Identity};
use umpbridge::session::UdpSessionFactory;
use umpbridge::{Bridge, BridgeOptions, StartRequest};

/// Reads datagrams until one carries a command `pick` accepts.
fn recv_command<T>(
    socket: &UdpSocket,
    mut pick: impl FnMut(&Command) -> Option<T>,
) -> (SocketAddr, T) {
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut buf = [0u8; 1500];
    while Instant::now() < deadline {
        let Ok((len, from)) = socket.recv_from(&mut buf) else {
            continue;
        };
        for command in decode_datagram(&buf[..len]).unwrap() {
            if let Some(found) = pick(&command) {
                return (from, found);
            }
        }
    }
    panic!("expected command never arrived");
}

/// Runs a bridge against `peer`, reached through `host`.
fn bridge_round_trip(peer: UdpSocket, host: &str) {
    let _ = env_logger::builder().is_test(true).try_init();

    peer.set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let peer_port = peer.local_addr().unwrap().port();

    // Answer the invitation from another thread while start blocks in the handshake
    let responder = {
        let peer = peer.try_clone().unwrap();
        thread::spawn(move || {
            let (from, name) = recv_command(&peer, |c| match c {
                Command::Invitation { identity, .. } => Some(identity.endpoint_name.clone()),
                _ => None,
            });
            let accepted = encode_datagram(&[Command::InvitationAccepted(Identity {
                endpoint_name: "Peer".into(),
                product_instance_id: "PEER_001".into(),
            })]);
            peer.send_to(&accepted, from).unwrap();
            (from, name)
        })
    };

    let options = BridgeOptions {
        local_port: 0,
        handshake_timeout: Duration::from_secs(3),
        ..BridgeOptions::default()
    };
    let bridge = Bridge::new(UdpSessionFactory, options);
    let (device, handle) = MockDevice::new(EventLog::new());
    bridge
        .start(
            device,
            StartRequest {
                output_port: 0,
                input_port: 0,
                host: host.into(),
                port: peer_port,
                endpoint_name: "TestEndpoint".into(),
            },
        )
        .unwrap();
    let (session_addr, name) = responder.join().unwrap();
    assert_eq!(name, "TestEndpoint");
    assert!(bridge.is_running());

    // Device to network
    handle.push_bytes(vec![0x90, 60, 100]);
    let (_, words) = recv_command(&peer, |c| match c {
        Command::UmpData { words, .. } => Some(words.clone()),
        _ => None,
    });
    assert_eq!(words, vec![0x2090_3C64]);

    // Network to device
    let data = encode_datagram(&[Command::UmpData {
        sequence: 0,
        words: vec![0x10F8_0000],
    }]);
    peer.send_to(&data, session_addr).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while handle.writes().is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(handle.writes(), vec![vec![0x00, 0x00, 0xF8, 0x10]]);

    bridge.stop().unwrap();
    let (_, reason) = recv_command(&peer, |c| match c {
        Command::Bye { reason } => Some(*reason),
        _ => None,
    });
    assert_eq!(reason, bye_reason::USER_TERMINATED);
}

#[test]
fn test_bridge_over_udp_session() {
    bridge_round_trip(UdpSocket::bind("127.0.0.1:0").unwrap(), "127.0.0.1");
}

#[test]
fn test_bridge_over_udp_session_ipv6() {
    // Hosts without an IPv6 loopback cannot run this
    let Ok(peer) = UdpSocket::bind("[::1]:0") else {
        return;
    };
    bridge_round_trip(peer, "::1");
}
