//! Command implementations behind the `digisens` binary.

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use digisens_bus::{
    detect_baudrate, discover_address, Bus, BusConfig, BusCoordinator, CycleReport, DeviceOutcome, DeviceSession,
    SerialTransport, SessionConfig, SessionError, SimulatedBus, SimulatedDevice, Transport,
    TransportError,
};
use digisens_protocol::{AddressMode, Baudrate, DeviceAddress, DeviceInfo, ProtocolError};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{BusEntry, ConfigError, PollConfig};

/// Errors surfaced by runner commands.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("failed to install Ctrl-C handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error("{0}")]
    Refused(String),
}

pub type RunnerResult<T> = Result<T, RunnerError>;

/// A transport chosen at runtime.
pub type DynTransport = Box<dyn Transport>;

/// Open the serial port named by `entry`.
pub fn open_serial(entry: &BusEntry) -> Result<DynTransport, TransportError> {
    Ok(Box::new(SerialTransport::open(&entry.port, entry.baud)?))
}

/// Build a simulator holding every device on `entry`'s roster.
///
/// Channel `n` of roster device `d` carries `d + n / 10` kg, so readings are
/// easy to tell apart in the log.
pub fn open_simulated(entry: &BusEntry, channels: usize) -> Result<DynTransport, TransportError> {
    let mut sim = SimulatedBus::new(entry.port.clone());
    if let Ok(baud) = Baudrate::try_from(entry.baud) {
        sim.set_baud_rate(baud.bps())?;
    }
    for (d, device) in entry.devices.iter().enumerate() {
        let mut simulated = SimulatedDevice::new(device.0.clone(), channels);
        if let Ok(baud) = Baudrate::try_from(entry.baud) {
            simulated = simulated.with_baud(baud);
        }
        for ch in 0..channels {
            simulated.set_load(ch, d as f64 + ch as f64 / 10.0);
        }
        sim.add_device(simulated);
    }
    Ok(Box::new(sim))
}

/// Poll according to `config` until the cycle limit or `stop`.
///
/// Returns the number of cycles run.
pub fn poll(
    config: &PollConfig,
    simulate: bool,
    max_cycles: Option<u64>,
    interval: Option<Duration>,
    stop: &AtomicBool,
) -> RunnerResult<u64> {
    let mode = config.poll_mode();
    let plan = if simulate {
        let channels = mode.channel_count();
        config.into_plan(|entry| open_simulated(entry, channels))?
    } else {
        config.into_plan(open_serial)?
    };

    let mut coordinator = BusCoordinator::new(plan, mode);
    info!(
        "polling {} device(s) on {} bus(es); worst-case cycle {:?}",
        coordinator.plan().device_count(),
        coordinator.plan().as_lanes().len(),
        coordinator.worst_case_cycle()
    );

    let ran = coordinator.run(
        max_cycles.or(config.cycles),
        interval.unwrap_or_else(|| config.interval()),
        stop,
        log_report,
    );
    Ok(ran)
}

/// One log line per device, plus a warning for each failure.
pub fn log_report(report: &CycleReport) {
    for device in &report.devices {
        let readings: Vec<String> = device.readings.iter().map(|r| r.to_string()).collect();
        info!(
            "cycle {} {} {}: {}",
            report.cycle,
            device.bus,
            device.address,
            readings.join(", ")
        );
        match &device.outcome {
            DeviceOutcome::Failed { message, .. } => {
                warn!("cycle {} {} {}: {}", report.cycle, device.bus, device.address, message)
            }
            DeviceOutcome::Partial { failed_channels } => warn!(
                "cycle {} {} {}: {} channel(s) failed",
                report.cycle, device.bus, device.address, failed_channels
            ),
            DeviceOutcome::Complete => {}
        }
        if device.truncated_bytes > 0 {
            warn!(
                "cycle {} {} {}: bulk reply truncated by {} character(s)",
                report.cycle, device.bus, device.address, device.truncated_bytes
            );
        }
    }
}

/// A bus with a single device on it.
pub fn single_device_bus<T: Transport>(transport: T, settle: Duration) -> Bus<T> {
    Bus::new(
        transport,
        BusConfig {
            settle_delay: settle,
        },
    )
}

pub fn device_info<T: Transport>(
    bus: &mut Bus<T>,
    address: DeviceAddress,
    config: SessionConfig,
) -> RunnerResult<DeviceInfo> {
    Ok(DeviceSession::new(address, config).read_info(bus)?)
}

/// Broadcast address query. Only meaningful on a bus with one device.
pub fn discover<T: Transport>(
    bus: &mut Bus<T>,
    extended: bool,
    config: SessionConfig,
) -> RunnerResult<DeviceAddress> {
    Ok(discover_address(bus, address_mode(extended), &config)?)
}

fn address_mode(extended: bool) -> AddressMode {
    if extended {
        AddressMode::Extended
    } else {
        AddressMode::Standard
    }
}

/// Try every supported rate until the only device on the bus answers `ag`.
pub fn scan<T: Transport>(
    bus: &mut Bus<T>,
    extended: bool,
    config: SessionConfig,
) -> RunnerResult<(Baudrate, DeviceAddress)> {
    Ok(detect_baudrate(bus, address_mode(extended), &config)?)
}

/// Store a zero reference. Refused unless the caller confirms the sensor is unloaded.
pub fn zero<T: Transport>(
    bus: &mut Bus<T>,
    address: DeviceAddress,
    channel: u8,
    confirmed_unloaded: bool,
    config: SessionConfig,
) -> RunnerResult<()> {
    if !confirmed_unloaded {
        return Err(RunnerError::Refused(
            "zeroing writes device EEPROM; pass --unloaded once the sensor carries no load".into(),
        ));
    }
    Ok(DeviceSession::new(address, config).zero_channel(bus, channel)?)
}

/// Switch the device and the local line to `baud`.
pub fn set_baud<T: Transport>(
    bus: &mut Bus<T>,
    address: DeviceAddress,
    baud: Baudrate,
    config: SessionConfig,
) -> RunnerResult<DeviceInfo> {
    let session = DeviceSession::new(address, config);
    session.set_baudrate(bus, baud)?;
    bus.apply_baudrate()?;
    // Confirms the device answers at the new rate.
    Ok(session.read_info(bus)?)
}
