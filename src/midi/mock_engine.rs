//! Scriptable in-memory device for tests

use crate::midi::{DeviceInputPort, DeviceOutputPort, LocalDevice, MidiError, Received, Result};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Ordered record of lifecycle events, shared between mocks
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: impl Into<String>) {
        if let Ok(mut events) = self.0.lock() {
            events.push(event.into());
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.events().iter().any(|e| e == event)
    }
}

enum MockInput {
    Data(Vec<u8>),
    Fail(String),
}

struct MockShared {
    log: EventLog,
    created: Instant,
    input_tx: Sender<MockInput>,
    input_rx: Receiver<MockInput>,
    writes: Mutex<Vec<Vec<u8>>>,
    receive_delay: Mutex<Duration>,
    write_limit: Mutex<Option<usize>>,
    fail_output_open: AtomicBool,
    fail_input_open: AtomicBool,
    output_closed: AtomicBool,
    input_closed: AtomicBool,
    ports_opened: AtomicUsize,
    receive_calls: AtomicUsize,
    accesses_after_close: AtomicUsize,
}

/// In-memory [`LocalDevice`]; drive and inspect it through its [`MockDeviceHandle`]
pub struct MockDevice {
    shared: Arc<MockShared>,
}

/// Test-side view of a [`MockDevice`]
#[derive(Clone)]
pub struct MockDeviceHandle {
    shared: Arc<MockShared>,
}

impl MockDevice {
    pub fn new(log: EventLog) -> (Self, MockDeviceHandle) {
        let (input_tx, input_rx) = unbounded();
        let shared = Arc::new(MockShared {
            log,
            created: Instant::now(),
            input_tx,
            input_rx,
            writes: Mutex::new(Vec::new()),
            receive_delay: Mutex::new(Duration::ZERO),
            write_limit: Mutex::new(None),
            fail_output_open: AtomicBool::new(false),
            fail_input_open: AtomicBool::new(false),
            output_closed: AtomicBool::new(false),
            input_closed: AtomicBool::new(false),
            ports_opened: AtomicUsize::new(0),
            receive_calls: AtomicUsize::new(0),
            accesses_after_close: AtomicUsize::new(0),
        });
        (
            MockDevice {
                shared: shared.clone(),
            },
            MockDeviceHandle { shared },
        )
    }
}

impl MockDeviceHandle {
    /// Queues bytes for the next receive on the output port.
    pub fn push_bytes(&self, bytes: impl Into<Vec<u8>>) {
        let _ = self.shared.input_tx.send(MockInput::Data(bytes.into()));
    }

    /// Makes the next receive fail as a broken transport would.
    pub fn push_failure(&self, reason: &str) {
        let _ = self.shared.input_tx.send(MockInput::Fail(reason.to_string()));
    }

    /// Delays every receive before it looks for data.
    pub fn set_receive_delay(&self, delay: Duration) {
        if let Ok(mut d) = self.shared.receive_delay.lock() {
            *d = delay;
        }
    }

    /// Caps how many bytes a single write accepts.
    pub fn set_write_limit(&self, limit: Option<usize>) {
        if let Ok(mut l) = self.shared.write_limit.lock() {
            *l = limit;
        }
    }

    pub fn fail_output_open(&self) {
        self.shared.fail_output_open.store(true, Ordering::SeqCst);
    }

    pub fn fail_input_open(&self) {
        self.shared.fail_input_open.store(true, Ordering::SeqCst);
    }

    /// Bytes accepted by the input port, one entry per write.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.shared
            .writes
            .lock()
            .map(|w| w.clone())
            .unwrap_or_default()
    }

    pub fn ports_opened(&self) -> usize {
        self.shared.ports_opened.load(Ordering::SeqCst)
    }

    pub fn receive_calls(&self) -> usize {
        self.shared.receive_calls.load(Ordering::SeqCst)
    }

    /// Port operations that touched a port after it was closed.
    pub fn accesses_after_close(&self) -> usize {
        self.shared.accesses_after_close.load(Ordering::SeqCst)
    }
}

impl LocalDevice for MockDevice {
    fn name(&self) -> String {
        "Mock Device".to_string()
    }

    fn open_output_port(&mut self, index: usize) -> Result<Arc<dyn DeviceOutputPort>> {
        if self.shared.fail_output_open.load(Ordering::SeqCst) {
            return Err(MidiError::ConnectionError(format!(
                "mock output port {} unavailable",
                index
            )));
        }
        self.shared.ports_opened.fetch_add(1, Ordering::SeqCst);
        self.shared.log.record("device:open-output");
        Ok(Arc::new(MockOutputPort {
            shared: self.shared.clone(),
        }))
    }

    fn open_input_port(&mut self, index: usize) -> Result<Arc<dyn DeviceInputPort>> {
        if self.shared.fail_input_open.load(Ordering::SeqCst) {
            return Err(MidiError::ConnectionError(format!(
                "mock input port {} unavailable",
                index
            )));
        }
        self.shared.ports_opened.fetch_add(1, Ordering::SeqCst);
        self.shared.log.record("device:open-input");
        Ok(Arc::new(MockInputPort {
            shared: self.shared.clone(),
        }))
    }

    fn release(&mut self) {
        self.shared.log.record("device:release");
    }
}

struct MockOutputPort {
    shared: Arc<MockShared>,
}

impl MockOutputPort {
    fn check_open(&self) -> Result<()> {
        if self.shared.output_closed.load(Ordering::SeqCst) {
            self.shared
                .accesses_after_close
                .fetch_add(1, Ordering::SeqCst);
            return Err(MidiError::Closed);
        }
        Ok(())
    }
}

impl DeviceOutputPort for MockOutputPort {
    fn receive(&self, timeout: Duration) -> Result<Option<Received>> {
        self.check_open()?;
        self.shared.receive_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self
            .shared
            .receive_delay
            .lock()
            .map(|d| *d)
            .unwrap_or_default();
        if !delay.is_zero() {
            thread::sleep(delay);
            // A slow receive must still finish before the port goes away
            self.check_open()?;
        }

        match self.shared.input_rx.recv_timeout(timeout) {
            Ok(MockInput::Data(bytes)) => Ok(Some(Received {
                bytes,
                timestamp: self.shared.created.elapsed().as_micros() as u64,
            })),
            Ok(MockInput::Fail(reason)) => Err(MidiError::RecvError(reason)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(MidiError::RecvError("mock input disconnected".into()))
            }
        }
    }

    fn close(&self) {
        self.shared.output_closed.store(true, Ordering::SeqCst);
        self.shared.log.record("device:close-output");
    }
}

struct MockInputPort {
    shared: Arc<MockShared>,
}

impl DeviceInputPort for MockInputPort {
    fn send(&self, bytes: &[u8]) -> Result<usize> {
        if self.shared.input_closed.load(Ordering::SeqCst) {
            self.shared
                .accesses_after_close
                .fetch_add(1, Ordering::SeqCst);
            return Err(MidiError::Closed);
        }

        let limit = self
            .shared
            .write_limit
            .lock()
            .map(|l| *l)
            .unwrap_or_default();
        let accepted = limit.map_or(bytes.len(), |l| l.min(bytes.len()));
        if let Ok(mut writes) = self.shared.writes.lock() {
            writes.push(bytes[..accepted].to_vec());
        }
        Ok(accepted)
    }

    fn close(&self) {
        self.shared.input_closed.store(true, Ordering::SeqCst);
        self.shared.log.record("device:close-input");
    }
}
