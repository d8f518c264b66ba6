use crate::midi::{DeviceInputPort, DeviceOutputPort, LocalDevice, MidiError, Received, Result};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, TrySendError};
use log::{debug, info, warn};
use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Messages buffered between the midir callback and the inbound pump
const PORT_BUFFER: usize = 256;

/// Names of the MIDI ports visible to midir
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortList {
    /// Ports the bridge can read from (device output ports)
    pub outputs: Vec<String>,
    /// Ports the bridge can write to (device input ports)
    pub inputs: Vec<String>,
}

/// Lists the system's MIDI ports by index.
pub fn list_ports(client_name: &str) -> Result<PortList> {
    let midi_in = MidiInput::new(&format!("{}-list", client_name))
        .map_err(|e| MidiError::ConnectionError(e.to_string()))?;
    let midi_out = MidiOutput::new(&format!("{}-list", client_name))
        .map_err(|e| MidiError::ConnectionError(e.to_string()))?;

    let outputs = midi_in
        .ports()
        .iter()
        .map(|p| midi_in.port_name(p).unwrap_or_else(|_| "<unknown>".into()))
        .collect();
    let inputs = midi_out
        .ports()
        .iter()
        .map(|p| midi_out.port_name(p).unwrap_or_else(|_| "<unknown>".into()))
        .collect();

    Ok(PortList { outputs, inputs })
}

/// Local device backed by the system MIDI API through midir.
///
/// Port indices refer to the lists returned by [`list_ports`].
pub struct MidirDevice {
    client_name: String,
}

impl MidirDevice {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
        }
    }
}

impl LocalDevice for MidirDevice {
    fn name(&self) -> String {
        self.client_name.clone()
    }

    fn open_output_port(&mut self, index: usize) -> Result<Arc<dyn DeviceOutputPort>> {
        let mut midi_in = MidiInput::new(&format!("{}-in", self.client_name))
            .map_err(|e| MidiError::ConnectionError(e.to_string()))?;
        midi_in.ignore(Ignore::None);

        let ports = midi_in.ports();
        let port = ports.get(index).ok_or(MidiError::PortNotFound {
            index,
            available: ports.len(),
        })?;
        let port_name = midi_in.port_name(port).unwrap_or_default();

        let (tx, rx) = bounded(PORT_BUFFER);
        let connection = midi_in
            .connect(
                port,
                &format!("{}-input", self.client_name),
                move |timestamp, message, _| {
                    let received = Received {
                        bytes: message.to_vec(),
                        timestamp,
                    };
                    if let Err(TrySendError::Full(_)) = tx.try_send(received) {
                        warn!("MIDI input buffer full, dropping message");
                    }
                },
                (),
            )
            .map_err(|e| MidiError::ConnectionError(e.to_string()))?;

        info!("Opened MIDI port {} ({}) for reading", index, port_name);
        Ok(Arc::new(MidirOutputPort {
            connection: Mutex::new(Some(connection)),
            rx,
        }))
    }

    fn open_input_port(&mut self, index: usize) -> Result<Arc<dyn DeviceInputPort>> {
        let midi_out = MidiOutput::new(&format!("{}-out", self.client_name))
            .map_err(|e| MidiError::ConnectionError(e.to_string()))?;

        let ports = midi_out.ports();
        let port = ports.get(index).ok_or(MidiError::PortNotFound {
            index,
            available: ports.len(),
        })?;
        let port_name = midi_out.port_name(port).unwrap_or_default();

        let connection = midi_out
            .connect(port, &format!("{}-output", self.client_name))
            .map_err(|e| MidiError::ConnectionError(e.to_string()))?;

        info!("Opened MIDI port {} ({}) for writing", index, port_name);
        Ok(Arc::new(MidirInputPort {
            connection: Mutex::new(Some(connection)),
        }))
    }

    fn release(&mut self) {
        debug!("Released MIDI client {}", self.client_name);
    }
}

struct MidirOutputPort {
    connection: Mutex<Option<MidiInputConnection<()>>>,
    rx: Receiver<Received>,
}

impl DeviceOutputPort for MidirOutputPort {
    fn receive(&self, timeout: Duration) -> Result<Option<Received>> {
        let open = self
            .connection
            .lock()
            .map(|c| c.is_some())
            .unwrap_or(false);
        if !open {
            return Err(MidiError::Closed);
        }

        match self.rx.recv_timeout(timeout) {
            Ok(received) => Ok(Some(received)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(MidiError::RecvError("input connection dropped".into()))
            }
        }
    }

    fn close(&self) {
        if let Ok(mut connection) = self.connection.lock() {
            if let Some(connection) = connection.take() {
                connection.close();
            }
        }
    }
}

struct MidirInputPort {
    connection: Mutex<Option<MidiOutputConnection>>,
}

impl DeviceInputPort for MidirInputPort {
    fn send(&self, bytes: &[u8]) -> Result<usize> {
        let mut connection = self
            .connection
            .lock()
            .map_err(|_| MidiError::SendError("port lock poisoned".into()))?;
        let connection = connection.as_mut().ok_or(MidiError::Closed)?;
        connection
            .send(bytes)
            .map_err(|e| MidiError::SendError(e.to_string()))?;
        Ok(bytes.len())
    }

    fn close(&self) {
        if let Ok(mut connection) = self.connection.lock() {
            if let Some(connection) = connection.take() {
                connection.close();
            }
        }
    }
}
