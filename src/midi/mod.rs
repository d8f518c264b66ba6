//! Local MIDI transport for the bridge
//!
//! This module provides the device side of the bridge, including:
//! - Port traits with bounded-wait receive
//! - Real MIDI device communication via midir
//! - Mock implementations for testing
//!
//! The main components are:
//! - [`LocalDevice`] trait for opening the two ports of a device
//! - [`DeviceOutputPort`] and [`DeviceInputPort`] for moving bytes
//! - [`MidirDevice`] for real MIDI device communication
//! - [`MockDevice`] for testing
//!
mod engine;
pub mod midir_engine;
pub mod mock_engine;

pub use engine::{
    DeviceInputPort, DeviceOutputPort, LocalDevice, MidiError, Received, Result,
};

pub use midir_engine::{list_ports, MidirDevice, PortList};
pub use mock_engine::{EventLog, MockDevice, MockDeviceHandle};
