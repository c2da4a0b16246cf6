//! Device sessions and bus coordination for DIGIsens weight controllers.
//!
//! This crate puts the wire layer from `digisens-protocol` on an actual
//! half-duplex bus:
//!
//! - [`Transport`]: the byte stream (a [`SerialTransport`], a
//!   [`SimulatedBus`], or a [`ScriptedTransport`] in tests).
//! - [`Bus`]: owns one transport, enforces the settle delay between
//!   exchanges, and stops talking after a connection failure or a baud-rate
//!   change until the caller reopens it.
//! - [`DeviceSession`]: typed exchanges with one addressed device.
//! - [`BusCoordinator`]: polls every device of a [`BusPlan`] once per cycle,
//!   sequentially on a shared bus and in parallel across independent ones.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use digisens_bus::{Bus, BusConfig, BusCoordinator, BusPlan, DeviceSession, PollMode,
//!     SessionConfig, SimulatedBus, SimulatedDevice};
//! use digisens_protocol::DeviceAddress;
//!
//! let address = DeviceAddress::standard("001").unwrap();
//! let sim = SimulatedBus::new("sim0")
//!     .with_device(SimulatedDevice::new(address.clone(), 8).with_load(0, 2.5));
//! let bus = Bus::new(sim, BusConfig { settle_delay: Duration::from_millis(1) });
//!
//! let plan = BusPlan::shared(bus, vec![DeviceSession::new(address, SessionConfig::default())]);
//! let mut coordinator = BusCoordinator::new(plan, PollMode::default());
//!
//! let report = coordinator.poll_cycle();
//! assert_eq!(report.devices[0].readings.len(), 8);
//! assert!((report.devices[0].readings[0].weight - 2.5).abs() < 1e-9);
//! ```

mod bus;
mod coordinator;
mod error;
mod mock;
mod serial;
mod session;
mod sim;
mod transport;

pub use bus::{Bus, BusConfig, LinkState, DEFAULT_SETTLE_DELAY};
pub use coordinator::{
    BusCoordinator, BusPlan, CycleReport, DeviceOutcome, DeviceReport, Lane, PollMode, Precision,
    DEFAULT_CHANNELS,
};
pub use error::{SessionError, SessionResult, TransportError};
pub use mock::{EventKind, ExchangeSpan, RecordingLog, ScriptedReply, ScriptedTransport, TransportEvent};
pub use serial::SerialTransport;
pub use session::{detect_baudrate, discover_address, DeviceSession, SessionConfig, DEFAULT_TIMEOUT};
pub use sim::{SimulatedBus, SimulatedChannel, SimulatedDevice};
pub use transport::Transport;
