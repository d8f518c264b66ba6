use super::wire::{self, bye_reason, code, Command, Identity};
use super::{NetworkSession, Result, SessionError, SessionFactory, SessionParams, UmpSink};
use crate::ump::UmpPacket;
use log::{debug, info, trace, warn};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// How often an unanswered invitation is repeated
const INVITATION_RETRY: Duration = Duration::from_secs(1);
/// Silence after which the peer is pinged
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
/// Silence after which the session is given up
const PEER_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_DATAGRAM: usize = 1500;

/// Creates [`UdpSession`]s bound to the configured local port
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpSessionFactory;

impl SessionFactory for UdpSessionFactory {
    fn create(
        &self,
        params: &SessionParams,
        sink: Arc<dyn UmpSink>,
    ) -> Result<Arc<dyn NetworkSession>> {
        Ok(Arc::new(UdpSession::bind(params.clone(), sink)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Established,
    Closed,
}

struct SessionState {
    phase: Phase,
    peer: SocketAddr,
    tx_sequence: u16,
    rx_sequence: Option<u16>,
    last_heard: Instant,
    ping_id: u32,
    ping_sent: Option<Instant>,
}

/// Minimal Network MIDI 2.0 session over UDP.
///
/// Supports invitation (as initiator or responder), UMP data, ping, session reset and bye.
/// Lost packets are not retransmitted.
pub struct UdpSession {
    params: SessionParams,
    identity: Identity,
    socket: UdpSocket,
    sink: Arc<dyn UmpSink>,
    state: Mutex<SessionState>,
}

/// Wildcard address in the same family as `destination`.
fn wildcard_for(destination: &SocketAddr) -> IpAddr {
    match destination {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

impl UdpSession {
    pub fn bind(params: SessionParams, sink: Arc<dyn UmpSink>) -> Result<Self> {
        let socket = UdpSocket::bind((wildcard_for(&params.destination), params.local_port))?;
        // A zero read timeout is rejected by the OS
        socket.set_read_timeout(Some(params.service_timeout.max(Duration::from_millis(1))))?;
        info!(
            "Network session bound to {} for peer {}",
            socket.local_addr()?,
            params.destination
        );

        let identity = Identity {
            endpoint_name: params.endpoint_name.clone(),
            product_instance_id: params.product_instance_id.clone(),
        };
        let state = SessionState {
            phase: Phase::Idle,
            peer: params.destination,
            tx_sequence: 0,
            rx_sequence: None,
            last_heard: Instant::now(),
            ping_id: 0,
            ping_sent: None,
        };

        Ok(Self {
            params,
            identity,
            socket,
            sink,
            state: Mutex::new(state),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn state(&self) -> Result<MutexGuard<'_, SessionState>> {
        self.state
            .lock()
            .map_err(|_| SessionError::Failed("session state poisoned".into()))
    }

    fn send_to(&self, peer: SocketAddr, commands: &[Command]) -> Result<()> {
        let datagram = wire::encode_datagram(commands);
        self.socket.send_to(&datagram, peer)?;
        Ok(())
    }

    /// Waits up to the service timeout for one datagram.
    fn receive(&self) -> Result<Option<(SocketAddr, Vec<Command>)>> {
        let mut buf = [0u8; MAX_DATAGRAM];
        match self.socket.recv_from(&mut buf) {
            Ok((len, from)) => match wire::decode_datagram(&buf[..len]) {
                Ok(commands) => Ok(Some((from, commands))),
                Err(e) => {
                    debug!("Ignoring datagram from {}: {}", from, e);
                    Ok(None)
                }
            },
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn invite(&self) -> Result<()> {
        let peer = self.params.destination;
        let invitation = Command::Invitation {
            identity: self.identity.clone(),
            capabilities: 0,
        };
        let deadline = Instant::now() + self.params.handshake_timeout;
        let mut last_sent: Option<Instant> = None;

        while Instant::now() < deadline {
            if last_sent.map_or(true, |t| t.elapsed() >= INVITATION_RETRY) {
                debug!("Sending invitation to {}", peer);
                self.send_to(peer, &[invitation.clone()])?;
                last_sent = Some(Instant::now());
            }

            let Some((from, commands)) = self.receive()? else {
                continue;
            };
            if from != peer {
                trace!("Ignoring datagram from {} during handshake", from);
                continue;
            }

            for command in commands {
                match command {
                    Command::InvitationAccepted(remote) => {
                        info!(
                            "Session established with '{}' ({})",
                            remote.endpoint_name, remote.product_instance_id
                        );
                        return self.establish(peer);
                    }
                    Command::InvitationPending(remote) => {
                        info!("Invitation pending at '{}'", remote.endpoint_name);
                    }
                    Command::Bye { reason } => {
                        return Err(SessionError::Rejected(format!(
                            "bye reason {:#04x}",
                            reason
                        )));
                    }
                    Command::Other {
                        code: code::INVITATION_AUTH_REQUIRED | code::INVITATION_USER_AUTH_REQUIRED,
                    } => {
                        return Err(SessionError::Rejected(
                            "authentication is not supported".into(),
                        ));
                    }
                    other => trace!("Ignoring {:?} during handshake", other),
                }
            }
        }

        Err(SessionError::HandshakeTimeout(self.params.handshake_timeout))
    }

    fn accept(&self) -> Result<()> {
        let deadline = Instant::now() + self.params.handshake_timeout;
        while Instant::now() < deadline {
            let Some((from, commands)) = self.receive()? else {
                continue;
            };
            for command in commands {
                if let Command::Invitation { identity, .. } = command {
                    info!(
                        "Accepting invitation from '{}' at {}",
                        identity.endpoint_name, from
                    );
                    self.send_to(from, &[Command::InvitationAccepted(self.identity.clone())])?;
                    return self.establish(from);
                }
            }
        }

        Err(SessionError::HandshakeTimeout(self.params.handshake_timeout))
    }

    fn establish(&self, peer: SocketAddr) -> Result<()> {
        let mut state = self.state()?;
        state.phase = Phase::Established;
        state.peer = peer;
        state.last_heard = Instant::now();
        Ok(())
    }

    fn handle(&self, command: Command, peer: SocketAddr) -> Result<()> {
        match command {
            Command::UmpData { sequence, words } => {
                {
                    let mut state = self.state()?;
                    if let Some(last) = state.rx_sequence {
                        let expected = last.wrapping_add(1);
                        if sequence != expected {
                            debug!("UMP data sequence gap: expected {}, got {}", expected, sequence);
                        }
                    }
                    state.rx_sequence = Some(sequence);
                }

                let mut rest = words.as_slice();
                while let Some(packet) = UmpPacket::from_words(rest) {
                    self.sink.on_packet(&packet);
                    rest = &rest[packet.len()..];
                }
                if !rest.is_empty() {
                    debug!("Dropping {} words of incomplete UMP data", rest.len());
                }
            }
            Command::Ping { id } => self.send_to(peer, &[Command::PingReply { id }])?,
            Command::PingReply { .. } => self.state()?.ping_sent = None,
            Command::Invitation { .. } => {
                // Peer restarted its side; keep the session alive
                self.send_to(peer, &[Command::InvitationAccepted(self.identity.clone())])?;
            }
            Command::SessionReset => {
                self.state()?.rx_sequence = None;
                self.send_to(peer, &[Command::SessionResetReply])?;
            }
            Command::Bye { reason } => {
                info!("Peer ended the session, reason {:#04x}", reason);
                self.send_to(peer, &[Command::ByeReply])?;
                self.state()?.phase = Phase::Closed;
                return Err(SessionError::ClosedByPeer);
            }
            other => trace!("Ignoring {:?}", other),
        }
        Ok(())
    }

    fn keepalive(&self) -> Result<()> {
        let mut state = self.state()?;
        if state.phase != Phase::Established {
            return Ok(());
        }

        let silence = state.last_heard.elapsed();
        if silence >= PEER_TIMEOUT {
            warn!("No traffic from peer for {:?}, ending session", silence);
            state.phase = Phase::Closed;
            let peer = state.peer;
            drop(state);
            self.send_to(peer, &[Command::Bye {
                reason: bye_reason::TIMEOUT,
            }])?;
            return Err(SessionError::Failed("peer timed out".into()));
        }

        if silence >= KEEPALIVE_INTERVAL && state.ping_sent.is_none() {
            state.ping_id = state.ping_id.wrapping_add(1);
            state.ping_sent = Some(Instant::now());
            let (peer, id) = (state.peer, state.ping_id);
            drop(state);
            self.send_to(peer, &[Command::Ping { id }])?;
        }
        Ok(())
    }
}

impl NetworkSession for UdpSession {
    fn open(&self) -> Result<()> {
        if self.state()?.phase != Phase::Idle {
            return Err(SessionError::Failed("session already used".into()));
        }

        if self.params.initiator {
            self.invite()
        } else {
            self.accept()
        }
    }

    fn run_once(&self) -> Result<()> {
        let Some((from, commands)) = self.receive()? else {
            return self.keepalive();
        };

        let (phase, peer) = {
            let state = self.state()?;
            (state.phase, state.peer)
        };
        if from != peer {
            trace!("Ignoring datagram from {}", from);
            return Ok(());
        }
        if phase != Phase::Established {
            trace!("Ignoring datagram in phase {:?}", phase);
            return Ok(());
        }

        {
            let mut state = self.state()?;
            state.last_heard = Instant::now();
            state.ping_sent = None;
        }

        for command in commands {
            self.handle(command, peer)?;
        }
        Ok(())
    }

    fn send(&self, packet: &UmpPacket) -> Result<()> {
        let mut state = self.state()?;
        if state.phase != Phase::Established {
            return Err(SessionError::NotEstablished);
        }

        let command = Command::UmpData {
            sequence: state.tx_sequence,
            words: packet.words().to_vec(),
        };
        state.tx_sequence = state.tx_sequence.wrapping_add(1);
        let peer = state.peer;
        drop(state);

        self.send_to(peer, &[command])
    }

    fn close(&self) {
        let Ok(mut state) = self.state() else {
            return;
        };
        let was_established = state.phase == Phase::Established;
        state.phase = Phase::Closed;
        let peer = state.peer;
        drop(state);

        if was_established {
            info!("Closing network session with {}", peer);
            if let Err(e) = self.send_to(peer, &[Command::Bye {
                reason: bye_reason::USER_TERMINATED,
            }]) {
                warn!("Could not send bye to {}: {}", peer, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    struct Collect(Mutex<Vec<UmpPacket>>);

    impl UmpSink for Collect {
        fn on_packet(&self, packet: &UmpPacket) {
            self.0.lock().unwrap().push(*packet);
        }
    }

    fn params(destination: SocketAddr, initiator: bool) -> SessionParams {
        SessionParams {
            product_instance_id: "TEST_001".into(),
            endpoint_name: "Test Endpoint".into(),
            destination,
            local_port: 0,
            initiator,
            service_timeout: Duration::from_millis(5),
            handshake_timeout: Duration::from_secs(2),
        }
    }

    fn peer_socket() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        socket
    }

    fn recv_commands(socket: &UdpSocket) -> (SocketAddr, Vec<Command>) {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, from) = socket.recv_from(&mut buf).unwrap();
        (from, wire::decode_datagram(&buf[..len]).unwrap())
    }

    /// Session talking to a hand-driven peer socket, already established
    fn established() -> (Arc<UdpSession>, UdpSocket, Arc<Collect>) {
        let peer = peer_socket();
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        let session = Arc::new(
            UdpSession::bind(params(peer.local_addr().unwrap(), true), sink.clone()).unwrap(),
        );

        let opener = session.clone();
        let handshake = thread::spawn(move || opener.open());

        let (from, commands) = recv_commands(&peer);
        assert!(matches!(commands[0], Command::Invitation { .. }));
        let reply = wire::encode_datagram(&[Command::InvitationAccepted(Identity {
            endpoint_name: "Peer".into(),
            product_instance_id: "PEER_1".into(),
        })]);
        peer.send_to(&reply, from).unwrap();
        handshake.join().unwrap().unwrap();

        (session, peer, sink)
    }

    #[test]
    fn test_initiator_handshake_and_data() {
        let (session, peer, sink) = established();
        let session_addr = SocketAddr::from(([127, 0, 0, 1], session.local_addr().unwrap().port()));

        let data = wire::encode_datagram(&[Command::UmpData {
            sequence: 0,
            words: vec![0x2090_3C64, 0x4090_3C00, 0xFFFF_0000],
        }]);
        peer.send_to(&data, session_addr).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while sink.0.lock().unwrap().len() < 2 && Instant::now() < deadline {
            session.run_once().unwrap();
        }
        let received = sink.0.lock().unwrap().clone();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].words(), &[0x2090_3C64]);
        assert_eq!(received[1].words(), &[0x4090_3C00, 0xFFFF_0000]);

        session.send(&UmpPacket::single(0x20B0_0764).unwrap()).unwrap();
        let (_, commands) = recv_commands(&peer);
        assert_eq!(
            commands,
            vec![Command::UmpData {
                sequence: 0,
                words: vec![0x20B0_0764]
            }]
        );
    }

    #[test]
    fn test_close_sends_bye() {
        let (session, peer, _) = established();
        session.close();
        let (_, commands) = recv_commands(&peer);
        assert_eq!(
            commands,
            vec![Command::Bye {
                reason: bye_reason::USER_TERMINATED
            }]
        );
        assert!(matches!(
            session.send(&UmpPacket::single(0x10F8_0000).unwrap()),
            Err(SessionError::NotEstablished)
        ));
    }

    #[test]
    fn test_peer_bye_ends_session() {
        let (session, peer, _) = established();
        let session_addr = SocketAddr::from(([127, 0, 0, 1], session.local_addr().unwrap().port()));
        let bye = wire::encode_datagram(&[Command::Bye { reason: 0x02 }]);
        peer.send_to(&bye, session_addr).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let result = loop {
            match session.run_once() {
                Ok(()) if Instant::now() < deadline => continue,
                other => break other,
            }
        };
        assert!(matches!(result, Err(SessionError::ClosedByPeer)));
        let (_, commands) = recv_commands(&peer);
        assert_eq!(commands, vec![Command::ByeReply]);
    }

    #[test]
    fn test_handshake_timeout() {
        let peer = peer_socket();
        let mut p = params(peer.local_addr().unwrap(), true);
        p.handshake_timeout = Duration::from_millis(50);
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        let session = UdpSession::bind(p, sink).unwrap();
        assert!(matches!(
            session.open(),
            Err(SessionError::HandshakeTimeout(_))
        ));
    }

    #[test]
    fn test_responder_accepts_invitation() {
        let peer = peer_socket();
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        let session = Arc::new(
            UdpSession::bind(params(peer.local_addr().unwrap(), false), sink).unwrap(),
        );
        let session_addr = SocketAddr::from(([127, 0, 0, 1], session.local_addr().unwrap().port()));

        let opener = session.clone();
        let handshake = thread::spawn(move || opener.open());

        let invitation = wire::encode_datagram(&[Command::Invitation {
            identity: Identity {
                endpoint_name: "Remote".into(),
                product_instance_id: "R1".into(),
            },
            capabilities: 0,
        }]);
        peer.send_to(&invitation, session_addr).unwrap();

        let (_, commands) = recv_commands(&peer);
        handshake.join().unwrap().unwrap();
        assert_eq!(
            commands,
            vec![Command::InvitationAccepted(Identity {
                endpoint_name: "Test Endpoint".into(),
                product_instance_id: "TEST_001".into(),
            })]
        );
    }

    #[test]
    fn test_bind_family_follows_destination() {
        let v4: SocketAddr = "192.0.2.1:5504".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:5504".parse().unwrap();
        assert_eq!(wildcard_for(&v4), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(wildcard_for(&v6), IpAddr::V6(Ipv6Addr::UNSPECIFIED));
    }

    #[test]
    fn test_handshake_with_ipv6_peer() {
        // Hosts without an IPv6 loopback cannot run this
        let Ok(peer) = UdpSocket::bind("[::1]:0") else {
            return;
        };
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        let session = Arc::new(
            UdpSession::bind(params(peer.local_addr().unwrap(), true), sink).unwrap(),
        );
        assert!(session.local_addr().unwrap().is_ipv6());

        let opener = session.clone();
        let handshake = thread::spawn(move || opener.open());

        let (from, commands) = recv_commands(&peer);
        assert!(matches!(commands[0], Command::Invitation { .. }));
        let reply = wire::encode_datagram(&[Command::InvitationAccepted(Identity {
            endpoint_name: "Peer".into(),
            product_instance_id: "PEER_6".into(),
        })]);
        peer.send_to(&reply, from).unwrap();
        handshake.join().unwrap().unwrap();

        session.send(&UmpPacket::single(0x2090_3C64).unwrap()).unwrap();
        let (_, commands) = recv_commands(&peer);
        assert_eq!(
            commands,
            vec![Command::UmpData {
                sequence: 0,
                words: vec![0x2090_3C64]
            }]
        );
    }
}
