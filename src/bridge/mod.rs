//! Bridge lifecycle
//!
//! A [`Bridge`] owns at most one running forwarding setup at a time: the device and its two
//! ports, a network session and two pump threads.
//!
//! Resources are acquired in the order device output port, device input port, session
//! (create, then handshake), inbound pump, outbound pump. Stopping closes the session, signals
//! and joins both pumps, closes the input port then the output port, releases the device and
//! finally drops the session. A failed start unwinds whatever it acquired in the same order.

mod pump;
mod stats;

pub use stats::{BridgeStats, StatsSnapshot};

use crate::midi::{DeviceInputPort, DeviceOutputPort, LocalDevice, MidiError};
use crate::scheduler::{Scheduler, ThreadScheduler};
use crate::session::{
    resolve_destination, NetworkSession, SessionError, SessionFactory, SessionParams,
    PRODUCT_INSTANCE_ID, SESSION_PORT,
};
use crate::ump::{LocalFormat, Transcoder};
use crossbeam::channel::{bounded, Sender};
use log::{error, info, warn};
use pump::{DeviceSink, Inbound, Outbound, Pump};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge is already running")]
    AlreadyRunning,
    #[error("bridge is not running")]
    NotRunning,
    #[error("local device error: {0}")]
    Device(#[from] MidiError),
    #[error("network session error: {0}")]
    Session(#[from] SessionError),
    #[error("could not start pump thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("{pump} pump did not stop within the join deadline")]
    JoinTimeout { pump: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Tuning knobs fixed for the lifetime of a [`Bridge`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeOptions {
    /// Bounded wait of each pump iteration.
    ///
    /// Shorter values make stop react faster at the cost of idle wakeups; the port and the
    /// session both block with this timeout rather than sleeping.
    pub poll_interval: Duration,
    /// How long stop waits for both pumps together before abandoning the ones still running
    pub join_timeout: Duration,
    pub handshake_timeout: Duration,
    pub inbound_format: LocalFormat,
    pub outbound_format: LocalFormat,
    pub group: u8,
    pub product_instance_id: String,
    pub local_port: u16,
    pub initiator: bool,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
            join_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(5),
            inbound_format: LocalFormat::Midi1,
            outbound_format: LocalFormat::Ump,
            group: 0,
            product_instance_id: PRODUCT_INSTANCE_ID.to_string(),
            local_port: SESSION_PORT,
            initiator: true,
        }
    }
}

/// Per-start parameters supplied by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    /// Device port the bridge reads from
    pub output_port: usize,
    /// Device port the bridge writes to
    pub input_port: usize,
    pub host: String,
    pub port: u16,
    pub endpoint_name: String,
}

/// Everything one successful start acquired
struct ActiveBridge {
    device: Box<dyn LocalDevice>,
    output: Arc<dyn DeviceOutputPort>,
    input: Arc<dyn DeviceInputPort>,
    session: Arc<dyn NetworkSession>,
    shutdown: Sender<()>,
    inbound: Pump,
    outbound: Pump,
}

struct Inner {
    state: BridgeState,
    active: Option<ActiveBridge>,
}

pub struct Bridge<F: SessionFactory, S: Scheduler = ThreadScheduler> {
    factory: F,
    scheduler: S,
    options: BridgeOptions,
    inner: Mutex<Inner>,
    stats: Arc<BridgeStats>,
}

impl<F: SessionFactory> Bridge<F, ThreadScheduler> {
    pub fn new(factory: F, options: BridgeOptions) -> Self {
        Self::with_scheduler(factory, ThreadScheduler::new(), options)
    }
}

impl<F: SessionFactory, S: Scheduler> Bridge<F, S> {
    pub fn with_scheduler(factory: F, scheduler: S, options: BridgeOptions) -> Self {
        Self {
            factory,
            scheduler,
            options,
            inner: Mutex::new(Inner {
                state: BridgeState::Idle,
                active: None,
            }),
            stats: Arc::new(BridgeStats::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> BridgeState {
        self.lock().state
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    /// True while the bridge is Running and both pumps are still forwarding.
    pub fn is_running(&self) -> bool {
        let inner = self.lock();
        inner.state == BridgeState::Running
            && inner
                .active
                .as_ref()
                .is_some_and(|a| a.inbound.is_active() && a.outbound.is_active())
    }

    /// Opens the device ports, establishes the session and starts both pumps.
    ///
    /// On error nothing stays acquired and the bridge is Idle again.
    pub fn start(
        &self,
        device: impl LocalDevice + 'static,
        request: StartRequest,
    ) -> Result<(), BridgeError> {
        {
            let mut inner = self.lock();
            if inner.state != BridgeState::Idle {
                warn!("Start requested while bridge is {:?}", inner.state);
                return Err(BridgeError::AlreadyRunning);
            }
            inner.state = BridgeState::Starting;
        }

        match self.acquire(Box::new(device), &request) {
            Ok(active) => {
                let mut inner = self.lock();
                inner.active = Some(active);
                inner.state = BridgeState::Running;
                info!(
                    "Bridge running: '{}' <-> {}:{}",
                    request.endpoint_name, request.host, request.port
                );
                Ok(())
            }
            Err(e) => {
                error!("Bridge start failed: {}", e);
                self.lock().state = BridgeState::Idle;
                Err(e)
            }
        }
    }

    fn acquire(
        &self,
        mut device: Box<dyn LocalDevice>,
        request: &StartRequest,
    ) -> Result<ActiveBridge, BridgeError> {
        let destination = match resolve_destination(&request.host, request.port) {
            Ok(addr) => addr,
            Err(e) => {
                device.release();
                return Err(e.into());
            }
        };

        info!("Opening ports on {}", device.name());
        let output = match device.open_output_port(request.output_port) {
            Ok(port) => port,
            Err(e) => {
                device.release();
                return Err(e.into());
            }
        };
        let input = match device.open_input_port(request.input_port) {
            Ok(port) => port,
            Err(e) => {
                output.close();
                device.release();
                return Err(e.into());
            }
        };

        let release_ports = |device: &mut Box<dyn LocalDevice>| {
            input.close();
            output.close();
            device.release();
        };

        let sink = Arc::new(DeviceSink::new(
            input.clone(),
            Transcoder::new(self.options.inbound_format, self.options.outbound_format),
            self.stats.clone(),
        ));
        let params = SessionParams {
            product_instance_id: self.options.product_instance_id.clone(),
            endpoint_name: request.endpoint_name.clone(),
            destination,
            local_port: self.options.local_port,
            initiator: self.options.initiator,
            service_timeout: self.options.poll_interval,
            handshake_timeout: self.options.handshake_timeout,
        };
        let session = match self.factory.create(&params, sink) {
            Ok(session) => session,
            Err(e) => {
                release_ports(&mut device);
                return Err(e.into());
            }
        };

        let unwind = |device: &mut Box<dyn LocalDevice>, session: Arc<dyn NetworkSession>| {
            session.close();
            release_ports(device);
            drop(session);
        };

        if let Err(e) = session.open() {
            unwind(&mut device, session);
            return Err(e.into());
        }

        self.stats.reset();
        let (shutdown, shutdown_rx) = bounded::<()>(0);

        let inbound = Inbound {
            port: output.clone(),
            session: session.clone(),
            transcoder: Transcoder::new(
                self.options.inbound_format,
                self.options.outbound_format,
            )
            .with_group(self.options.group),
            stats: self.stats.clone(),
            poll_interval: self.options.poll_interval,
            shutdown: shutdown_rx.clone(),
            active: Arc::new(AtomicBool::new(true)),
        };
        let inbound = match self.spawn_pump("inbound", inbound.active.clone(), move || {
            inbound.run()
        }) {
            Ok(pump) => pump,
            Err(e) => {
                unwind(&mut device, session);
                return Err(e);
            }
        };

        let outbound = Outbound {
            session: session.clone(),
            shutdown: shutdown_rx,
            active: Arc::new(AtomicBool::new(true)),
        };
        let outbound = match self.spawn_pump("outbound", outbound.active.clone(), move || {
            outbound.run()
        }) {
            Ok(pump) => pump,
            Err(e) => {
                // Stop the inbound pump before its port goes away
                session.close();
                drop(shutdown);
                inbound.join_until(Instant::now() + self.options.join_timeout);
                release_ports(&mut device);
                drop(session);
                return Err(e);
            }
        };

        Ok(ActiveBridge {
            device,
            output,
            input,
            session,
            shutdown,
            inbound,
            outbound,
        })
    }

    fn spawn_pump<P>(
        &self,
        name: &'static str,
        active: Arc<AtomicBool>,
        pump: P,
    ) -> Result<Pump, BridgeError>
    where
        P: FnOnce() + Send + 'static,
    {
        let handle = self
            .scheduler
            .spawn(&format!("umpbridge-{}", name), pump)?;
        Ok(Pump {
            name,
            handle,
            active,
        })
    }

    /// Tears the bridge down and waits for both pumps.
    ///
    /// Every teardown step runs even when a pump misses the join deadline; the abandoned
    /// thread keeps its own references alive until it exits.
    pub fn stop(&self) -> Result<(), BridgeError> {
        let active = {
            let mut inner = self.lock();
            if inner.state != BridgeState::Running {
                warn!("Stop requested while bridge is {:?}", inner.state);
                return Err(BridgeError::NotRunning);
            }
            inner.state = BridgeState::Stopping;
            inner.active.take()
        };
        let Some(mut active) = active else {
            self.lock().state = BridgeState::Idle;
            return Err(BridgeError::NotRunning);
        };

        info!("Stopping bridge");
        active.session.close();
        drop(active.shutdown);

        let deadline = Instant::now() + self.options.join_timeout;
        let mut timed_out = None;
        for pump in [active.inbound, active.outbound] {
            let name = pump.name;
            if !pump.join_until(deadline) && timed_out.is_none() {
                timed_out = Some(name);
            }
        }

        active.input.close();
        active.output.close();
        active.device.release();
        drop(active.session);

        info!("Bridge stopped: {}", self.stats.snapshot());
        self.lock().state = BridgeState::Idle;

        match timed_out {
            Some(pump) => Err(BridgeError::JoinTimeout { pump }),
            None => Ok(()),
        }
    }
}

impl<F: SessionFactory, S: Scheduler> Drop for Bridge<F, S> {
    fn drop(&mut self) {
        if self.state() == BridgeState::Running {
            if let Err(e) = self.stop() {
                error!("Error stopping bridge on drop: {}", e);
            }
        }
    }
}
