//! Scriptable in-process sessions for tests

use super::{NetworkSession, Result, SessionError, SessionFactory, SessionParams, UmpSink};
use crate::midi::EventLog;
use crate::ump::UmpPacket;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

enum Incoming {
    Packet(UmpPacket),
    Fail(String),
}

struct NetworkShared {
    log: EventLog,
    incoming_tx: Sender<Incoming>,
    incoming_rx: Receiver<Incoming>,
    sent: Mutex<Vec<UmpPacket>>,
    params: Mutex<Vec<SessionParams>>,
    fail_create: AtomicBool,
    fail_open: AtomicBool,
    sessions_created: AtomicUsize,
}

/// Builds [`MockSession`]s that all talk to one [`MockNetwork`]
pub struct MockSessionFactory {
    shared: Arc<NetworkShared>,
}

/// Test-side view of the peer: inject packets, inspect what was sent
#[derive(Clone)]
pub struct MockNetwork {
    shared: Arc<NetworkShared>,
}

impl MockSessionFactory {
    pub fn new(log: EventLog) -> (Self, MockNetwork) {
        let (incoming_tx, incoming_rx) = unbounded();
        let shared = Arc::new(NetworkShared {
            log,
            incoming_tx,
            incoming_rx,
            sent: Mutex::new(Vec::new()),
            params: Mutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
            fail_open: AtomicBool::new(false),
            sessions_created: AtomicUsize::new(0),
        });
        (
            MockSessionFactory {
                shared: shared.clone(),
            },
            MockNetwork { shared },
        )
    }
}

impl MockNetwork {
    /// Delivers a packet through the sink on the next service iteration.
    pub fn inject_packet(&self, packet: UmpPacket) {
        let _ = self.shared.incoming_tx.send(Incoming::Packet(packet));
    }

    /// Makes the next service iteration fail unrecoverably.
    pub fn inject_failure(&self, reason: &str) {
        let _ = self.shared.incoming_tx.send(Incoming::Fail(reason.to_string()));
    }

    pub fn fail_create(&self) {
        self.shared.fail_create.store(true, Ordering::SeqCst);
    }

    /// Makes the handshake of every later session fail.
    pub fn fail_open(&self) {
        self.shared.fail_open.store(true, Ordering::SeqCst);
    }

    /// Packets handed to any session for transmission.
    pub fn sent(&self) -> Vec<UmpPacket> {
        self.shared
            .sent
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn sessions_created(&self) -> usize {
        self.shared.sessions_created.load(Ordering::SeqCst)
    }

    /// Construction parameters of the most recent session.
    pub fn last_params(&self) -> Option<SessionParams> {
        self.shared
            .params
            .lock()
            .ok()
            .and_then(|p| p.last().cloned())
    }
}

impl SessionFactory for MockSessionFactory {
    fn create(
        &self,
        params: &SessionParams,
        sink: Arc<dyn UmpSink>,
    ) -> Result<Arc<dyn NetworkSession>> {
        if self.shared.fail_create.load(Ordering::SeqCst) {
            return Err(SessionError::Failed("mock session unavailable".into()));
        }
        self.shared.sessions_created.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut p) = self.shared.params.lock() {
            p.push(params.clone());
        }
        self.shared.log.record("session:create");

        Ok(Arc::new(MockSession {
            shared: self.shared.clone(),
            sink,
            params: params.clone(),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockSession {
    shared: Arc<NetworkShared>,
    sink: Arc<dyn UmpSink>,
    params: SessionParams,
    open: AtomicBool,
    closed: AtomicBool,
}

impl NetworkSession for MockSession {
    fn open(&self) -> Result<()> {
        self.shared.log.record("session:open");
        if self.shared.fail_open.load(Ordering::SeqCst) {
            return Err(SessionError::HandshakeTimeout(self.params.handshake_timeout));
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn run_once(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        match self
            .shared
            .incoming_rx
            .recv_timeout(self.params.service_timeout)
        {
            Ok(Incoming::Packet(packet)) => {
                self.sink.on_packet(&packet);
                Ok(())
            }
            Ok(Incoming::Fail(reason)) => Err(SessionError::Failed(reason)),
            Err(RecvTimeoutError::Timeout) => Ok(()),
            Err(RecvTimeoutError::Disconnected) => Err(SessionError::ClosedByPeer),
        }
    }

    fn send(&self, packet: &UmpPacket) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::NotEstablished);
        }
        if let Ok(mut sent) = self.shared.sent.lock() {
            sent.push(*packet);
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shared.log.record("session:close");
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.shared.log.record("session:destroy");
    }
}
