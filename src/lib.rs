pub mod bridge;
pub mod cli;
pub mod config;
pub mod logging;
pub mod midi;
pub mod scheduler;
pub mod session;
pub mod ui;
pub mod ump;

pub use bridge::{Bridge, BridgeError, BridgeOptions, BridgeState, StartRequest};
pub use scheduler::{Scheduler, ThreadScheduler};
