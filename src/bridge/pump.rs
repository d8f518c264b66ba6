//! The two forwarding loops and the sink that feeds the local port

use super::stats::BridgeStats;
use crate::midi::{DeviceInputPort, DeviceOutputPort};
use crate::session::{NetworkSession, UmpSink};
use crate::ump::{ToLocal, Transcoder, UmpPacket};
use crossbeam::channel::{Receiver, TryRecvError};
use log::{debug, error, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// True until the stop signal arrives.
///
/// The signal is the sender side of `shutdown` being dropped.
fn keep_running(shutdown: &Receiver<()>) -> bool {
    matches!(shutdown.try_recv(), Err(TryRecvError::Empty))
}

/// Clears a pump's liveness flag however the pump exits.
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Local device to network.
pub(super) struct Inbound {
    pub port: Arc<dyn DeviceOutputPort>,
    pub session: Arc<dyn NetworkSession>,
    pub transcoder: Transcoder,
    pub stats: Arc<BridgeStats>,
    pub poll_interval: Duration,
    pub shutdown: Receiver<()>,
    pub active: Arc<AtomicBool>,
}

impl Inbound {
    pub fn run(mut self) {
        let _guard = ActiveGuard(self.active.clone());
        info!("Inbound pump started");

        while keep_running(&self.shutdown) {
            let received = match self.port.receive(self.poll_interval) {
                Ok(Some(received)) => received,
                Ok(None) => continue,
                Err(e) => {
                    error!("Local port receive failed, inbound pump exiting: {}", e);
                    return;
                }
            };

            let packets = self.transcoder.local_to_ump(&received.bytes);
            if packets.is_empty() {
                trace!(
                    "Nothing to forward from {} bytes at {}us",
                    received.bytes.len(),
                    received.timestamp
                );
                continue;
            }

            for packet in &packets {
                match self.session.send(packet) {
                    Ok(()) => self.stats.record_to_network(),
                    Err(e) => {
                        warn!("Dropping packet {:08X?}: {}", packet.words(), e);
                        self.stats.record_dropped();
                    }
                }
            }
        }

        info!("Inbound pump stopped");
    }
}

/// Network to local device.
///
/// Packets reach the device through the [`DeviceSink`] the session was built with.
pub(super) struct Outbound {
    pub session: Arc<dyn NetworkSession>,
    pub shutdown: Receiver<()>,
    pub active: Arc<AtomicBool>,
}

impl Outbound {
    pub fn run(self) {
        let _guard = ActiveGuard(self.active.clone());
        info!("Outbound pump started");

        while keep_running(&self.shutdown) {
            if let Err(e) = self.session.run_once() {
                error!("Network session failed, outbound pump exiting: {}", e);
                return;
            }
        }

        info!("Outbound pump stopped");
    }
}

/// Writes packets arriving from the network to the local input port
pub(super) struct DeviceSink {
    port: Arc<dyn DeviceInputPort>,
    transcoder: Mutex<Transcoder>,
    stats: Arc<BridgeStats>,
}

impl DeviceSink {
    pub fn new(
        port: Arc<dyn DeviceInputPort>,
        transcoder: Transcoder,
        stats: Arc<BridgeStats>,
    ) -> Self {
        Self {
            port,
            transcoder: Mutex::new(transcoder),
            stats,
        }
    }
}

impl UmpSink for DeviceSink {
    fn on_packet(&self, packet: &UmpPacket) {
        let converted = self
            .transcoder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .ump_to_local(packet);
        let bytes = match converted {
            ToLocal::Bytes(bytes) => bytes,
            ToLocal::Held => {
                trace!("SysEx packet held until the message completes");
                return;
            }
            ToLocal::Filtered => {
                debug!("Filtered endpoint message {:08X?}", packet.words());
                self.stats.record_filtered();
                return;
            }
            ToLocal::Dropped => {
                debug!(
                    "Packet type {:X} has no local encoding, dropped",
                    packet.message_type()
                );
                self.stats.record_dropped();
                return;
            }
        };

        match self.port.send(&bytes) {
            Ok(written) if written < bytes.len() => {
                warn!("Partial write to local port: {} of {} bytes", written, bytes.len());
                self.stats.record_partial_write();
            }
            Ok(_) => self.stats.record_to_device(),
            Err(e) => {
                warn!("Local port write failed: {}", e);
                self.stats.record_dropped();
            }
        }
    }
}

/// A spawned pump thread and its liveness flag
pub(super) struct Pump {
    pub name: &'static str,
    pub handle: JoinHandle<()>,
    pub active: Arc<AtomicBool>,
}

impl Pump {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Waits for the thread to exit until `deadline`.
    ///
    /// Returns false if the thread is still running; it is then left detached.
    pub fn join_until(self, deadline: Instant) -> bool {
        while !self.handle.is_finished() {
            if Instant::now() >= deadline {
                error!("{} pump did not stop in time, abandoning it", self.name);
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }

        if self.handle.join().is_err() {
            error!("{} pump panicked", self.name);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::{EventLog, LocalDevice, MockDevice};
    use crate::ump::LocalFormat;

    #[test]
    fn test_sink_writes_and_filters() {
        let (mut device, handle) = MockDevice::new(EventLog::new());
        let stats = Arc::new(BridgeStats::new());
        let sink = DeviceSink::new(
            device.open_input_port(0).unwrap(),
            Transcoder::default(),
            stats.clone(),
        );

        sink.on_packet(&UmpPacket::single(0x10F8_0000).unwrap());
        sink.on_packet(&UmpPacket::from_words(&[0xF000_0101, 0, 0, 0]).unwrap());

        assert_eq!(handle.writes(), vec![vec![0x00, 0x00, 0xF8, 0x10]]);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.to_device, 1);
        assert_eq!(snapshot.filtered, 1);
    }

    #[test]
    fn test_sink_counts_partial_write_once() {
        let (mut device, handle) = MockDevice::new(EventLog::new());
        handle.set_write_limit(Some(2));
        let stats = Arc::new(BridgeStats::new());
        let sink = DeviceSink::new(
            device.open_input_port(0).unwrap(),
            Transcoder::default(),
            stats.clone(),
        );

        sink.on_packet(&UmpPacket::single(0x2090_3C64).unwrap());

        assert_eq!(handle.writes(), vec![vec![0x64, 0x3C]]);
        assert_eq!(stats.snapshot().partial_writes, 1);
        assert_eq!(stats.snapshot().to_device, 0);
    }

    #[test]
    fn test_sink_writes_sysex_once_complete() {
        let (mut device, handle) = MockDevice::new(EventLog::new());
        let stats = Arc::new(BridgeStats::new());
        let sink = DeviceSink::new(
            device.open_input_port(0).unwrap(),
            Transcoder::new(LocalFormat::Midi1, LocalFormat::Midi1),
            stats.clone(),
        );

        sink.on_packet(&UmpPacket::from_words(&[0x3016_0102, 0x0304_0506]).unwrap());
        assert!(handle.writes().is_empty());
        sink.on_packet(&UmpPacket::from_words(&[0x3031_0700, 0]).unwrap());

        assert_eq!(
            handle.writes(),
            vec![vec![0xF0, 1, 2, 3, 4, 5, 6, 7, 0xF7]]
        );
        assert_eq!(stats.snapshot().to_device, 1);
        assert_eq!(stats.snapshot().dropped, 0);
    }

    #[test]
    fn test_keep_running_stops_on_disconnect() {
        let (tx, rx) = crossbeam::channel::bounded::<()>(0);
        assert!(keep_running(&rx));
        drop(tx);
        assert!(!keep_running(&rx));
    }
}
