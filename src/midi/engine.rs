use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors from the local MIDI transport
#[derive(Debug, Error)]
pub enum MidiError {
    /// Error when opening a port on the device
    #[error("MIDI connection error: {0}")]
    ConnectionError(String),
    /// Requested port index does not exist
    #[error("MIDI port {index} not found ({available} available)")]
    PortNotFound { index: usize, available: usize },
    /// Error when sending bytes to the device
    #[error("MIDI send error: {0}")]
    SendError(String),
    /// The transport failed while receiving; the port is unusable
    #[error("MIDI receive error: {0}")]
    RecvError(String),
    /// Operation on a port that has been closed
    #[error("MIDI port is closed")]
    Closed,
}

/// Result type for MIDI operations
pub type Result<T> = std::result::Result<T, MidiError>;

/// Bytes read from a device port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub bytes: Vec<u8>,
    /// Monotonic timestamp in microseconds, as reported by the transport
    pub timestamp: u64,
}

/// Port carrying data out of the device and into the bridge
pub trait DeviceOutputPort: Send + Sync {
    /// Waits up to `timeout` for the next message.
    ///
    /// `Ok(None)` means nothing arrived in time. An error means the transport itself failed.
    fn receive(&self, timeout: Duration) -> Result<Option<Received>>;

    fn close(&self);
}

/// Port carrying data from the bridge into the device
pub trait DeviceInputPort: Send + Sync {
    /// Writes bytes to the device, returning how many were accepted.
    fn send(&self, bytes: &[u8]) -> Result<usize>;

    fn close(&self);
}

/// A local MIDI device the bridge opens ports on
pub trait LocalDevice: Send {
    fn name(&self) -> String;

    /// Opens the port the device sends on (device to bridge).
    fn open_output_port(&mut self, index: usize) -> Result<Arc<dyn DeviceOutputPort>>;

    /// Opens the port the device listens on (bridge to device).
    fn open_input_port(&mut self, index: usize) -> Result<Arc<dyn DeviceInputPort>>;

    /// Releases the device handle. Called once, after every port is closed.
    fn release(&mut self);
}

impl<D: LocalDevice + ?Sized> LocalDevice for Box<D> {
    fn name(&self) -> String {
        (**self).name()
    }

    fn open_output_port(&mut self, index: usize) -> Result<Arc<dyn DeviceOutputPort>> {
        (**self).open_output_port(index)
    }

    fn open_input_port(&mut self, index: usize) -> Result<Arc<dyn DeviceInputPort>> {
        (**self).open_input_port(index)
    }

    fn release(&mut self) {
        (**self).release()
    }
}
