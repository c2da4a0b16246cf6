//! Polling cycles over a [`BusPlan`].
//!
//! A plan is made of lanes. Each lane is one bus and the devices on it, and
//! is polled strictly in roster order. Lanes of an independent plan are
//! polled at the same time, one thread each, and report back over a channel.
//! A failing device or lane only ever turns its own readings invalid.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use digisens_metrics::metric_defs;
use digisens_protocol::{DeviceAddress, PrecisionMode, ReadingFault, WeightReading};
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::error::SessionError;
use crate::session::DeviceSession;
use crate::transport::Transport;

/// Channels per device assumed when nothing else is configured.
pub const DEFAULT_CHANNELS: usize = 8;

/// Which verb a per-channel poll uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    /// `gw`
    #[default]
    Standard,
    /// `gd` in weight mode
    High,
}

/// How one device is read in each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// One `gl` per device.
    Bulk {
        /// Size of the placeholder set when the read fails.
        expected_channels: usize,
    },
    /// One `gw`/`gd` per channel.
    PerChannel { channels: u8, precision: Precision },
}

impl Default for PollMode {
    fn default() -> Self {
        PollMode::Bulk {
            expected_channels: DEFAULT_CHANNELS,
        }
    }
}

impl PollMode {
    /// Readings each device yields per cycle.
    pub fn channel_count(&self) -> usize {
        match *self {
            PollMode::Bulk { expected_channels } => expected_channels,
            PollMode::PerChannel { channels, .. } => channels as usize,
        }
    }

    /// Exchanges each device costs per cycle.
    pub fn exchanges_per_device(&self) -> usize {
        match *self {
            PollMode::Bulk { .. } => 1,
            PollMode::PerChannel { channels, .. } => channels as usize,
        }
    }
}

/// One bus and the devices on it, in polling order.
pub struct Lane<T: Transport> {
    pub bus: Bus<T>,
    pub devices: Vec<DeviceSession>,
}

impl<T: Transport> Lane<T> {
    pub fn new(bus: Bus<T>, devices: Vec<DeviceSession>) -> Self {
        Lane { bus, devices }
    }

    /// Upper bound on one cycle over this lane.
    pub fn worst_case(&self, mode: &PollMode) -> Duration {
        let per_exchange = self
            .devices
            .iter()
            .map(|d| d.config().timeout + self.bus.config().settle_delay)
            .sum::<Duration>();
        per_exchange * mode.exchanges_per_device() as u32
    }
}

/// Which devices share a transport, and which transports run side by side.
pub enum BusPlan<T: Transport> {
    /// Every device on one bus; exchanges run strictly one after another.
    Shared(Lane<T>),
    /// Separate buses, polled in parallel.
    Independent(Vec<Lane<T>>),
}

impl<T: Transport> BusPlan<T> {
    /// Devices sharing one bus, polled in the given order.
    pub fn shared(bus: Bus<T>, devices: Vec<DeviceSession>) -> Self {
        BusPlan::Shared(Lane::new(bus, devices))
    }

    /// One device per bus.
    pub fn independent(pairs: impl IntoIterator<Item = (Bus<T>, DeviceSession)>) -> Self {
        BusPlan::Independent(
            pairs
                .into_iter()
                .map(|(bus, device)| Lane::new(bus, vec![device]))
                .collect(),
        )
    }

    /// Separate buses with any number of devices each.
    pub fn lanes(lanes: Vec<Lane<T>>) -> Self {
        BusPlan::Independent(lanes)
    }

    pub fn as_lanes(&self) -> &[Lane<T>] {
        match self {
            BusPlan::Shared(lane) => std::slice::from_ref(lane),
            BusPlan::Independent(lanes) => lanes,
        }
    }

    pub fn as_lanes_mut(&mut self) -> &mut [Lane<T>] {
        match self {
            BusPlan::Shared(lane) => std::slice::from_mut(lane),
            BusPlan::Independent(lanes) => lanes,
        }
    }

    pub fn into_lanes(self) -> Vec<Lane<T>> {
        match self {
            BusPlan::Shared(lane) => vec![lane],
            BusPlan::Independent(lanes) => lanes,
        }
    }

    pub fn device_count(&self) -> usize {
        self.as_lanes().iter().map(|l| l.devices.len()).sum()
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self, BusPlan::Independent(lanes) if lanes.len() > 1)
    }
}

/// How a device's poll ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOutcome {
    /// Every exchange produced a reply.
    Complete,
    /// Some per-channel exchanges failed.
    Partial { failed_channels: usize },
    /// No usable reply; every reading is a placeholder.
    Failed { fault: ReadingFault, message: String },
}

/// One device's readings for one cycle.
#[derive(Debug, Clone)]
pub struct DeviceReport {
    /// Index of the lane within the plan.
    pub lane: usize,
    /// Position of the device within its lane.
    pub index: usize,
    pub bus: String,
    pub address: DeviceAddress,
    pub outcome: DeviceOutcome,
    pub readings: Vec<WeightReading>,
    /// Characters dropped after the last complete bulk block.
    pub truncated_bytes: usize,
}

impl DeviceReport {
    fn failed(
        lane: usize,
        index: usize,
        bus: &str,
        device: &DeviceSession,
        channels: usize,
        fault: ReadingFault,
        message: String,
    ) -> Self {
        DeviceReport {
            lane,
            index,
            bus: bus.to_string(),
            address: device.address().clone(),
            outcome: DeviceOutcome::Failed { fault, message },
            readings: WeightReading::invalid_set(channels, fault),
            truncated_bytes: 0,
        }
    }

    pub fn valid_count(&self) -> usize {
        self.readings.iter().filter(|r| r.is_valid()).count()
    }
}

/// Everything one cycle produced.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Cycle number, starting at 1.
    pub cycle: u64,
    pub elapsed: Duration,
    /// Sorted by lane, then roster position.
    pub devices: Vec<DeviceReport>,
}

impl CycleReport {
    pub fn reading_count(&self) -> usize {
        self.devices.iter().map(|d| d.readings.len()).sum()
    }

    pub fn valid_count(&self) -> usize {
        self.devices.iter().map(|d| d.valid_count()).sum()
    }

    pub fn failed_devices(&self) -> impl Iterator<Item = &DeviceReport> {
        self.devices
            .iter()
            .filter(|d| matches!(d.outcome, DeviceOutcome::Failed { .. }))
    }
}

/// Runs polling cycles over a plan.
pub struct BusCoordinator<T: Transport> {
    plan: BusPlan<T>,
    mode: PollMode,
    cycles: u64,
}

impl<T: Transport> BusCoordinator<T> {
    pub fn new(plan: BusPlan<T>, mode: PollMode) -> Self {
        BusCoordinator {
            plan,
            mode,
            cycles: 0,
        }
    }

    pub fn plan(&self) -> &BusPlan<T> {
        &self.plan
    }

    pub fn plan_mut(&mut self) -> &mut BusPlan<T> {
        &mut self.plan
    }

    pub fn into_plan(self) -> BusPlan<T> {
        self.plan
    }

    pub fn mode(&self) -> &PollMode {
        &self.mode
    }

    /// Cycles completed so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Upper bound on one cycle: the slowest lane when lanes run in
    /// parallel, the single lane otherwise.
    pub fn worst_case_cycle(&self) -> Duration {
        self.plan
            .as_lanes()
            .iter()
            .map(|lane| lane.worst_case(&self.mode))
            .max()
            .unwrap_or_default()
    }

    /// Buses that will still run exchanges next cycle.
    pub fn ready_lanes(&self) -> usize {
        self.plan
            .as_lanes()
            .iter()
            .filter(|lane| lane.bus.is_ready())
            .count()
    }

    /// Poll every device once.
    pub fn poll_cycle(&mut self) -> CycleReport {
        let started = Instant::now();
        self.cycles += 1;
        let mode = self.mode;

        let devices = if self.plan.is_parallel() {
            poll_parallel(self.plan.as_lanes_mut(), &mode)
        } else {
            self.plan
                .as_lanes_mut()
                .iter_mut()
                .enumerate()
                .flat_map(|(i, lane)| poll_lane(i, lane, &mode))
                .collect()
        };

        let elapsed = started.elapsed();
        metrics::histogram!(metric_defs::CYCLE_DURATION.name).record(elapsed.as_secs_f64());
        metrics::gauge!(metric_defs::LANES_READY.name).set(self.ready_lanes() as f64);
        debug!(
            "cycle {}: {} device(s) in {:?}",
            self.cycles,
            devices.len(),
            elapsed
        );
        CycleReport {
            cycle: self.cycles,
            elapsed,
            devices,
        }
    }

    /// Poll repeatedly, `interval` apart, handing each report to `on_cycle`.
    ///
    /// Stops after `max_cycles` (if given) or once `stop` is set. A set flag
    /// only prevents the next cycle from starting; a cycle in progress runs
    /// to completion. Returns the number of cycles run.
    pub fn run<F>(
        &mut self,
        max_cycles: Option<u64>,
        interval: Duration,
        stop: &AtomicBool,
        mut on_cycle: F,
    ) -> u64
    where
        F: FnMut(&CycleReport),
    {
        let mut done = 0;
        loop {
            if stop.load(Ordering::SeqCst) || max_cycles.is_some_and(|max| done >= max) {
                break;
            }
            let report = self.poll_cycle();
            on_cycle(&report);
            done += 1;

            let resume = Instant::now() + interval;
            while !stop.load(Ordering::SeqCst) && Instant::now() < resume {
                thread::sleep((resume - Instant::now()).min(Duration::from_millis(50)));
            }
        }
        info!("stopped after {} cycle(s)", done);
        done
    }
}

fn poll_parallel<T: Transport>(lanes: &mut [Lane<T>], mode: &PollMode) -> Vec<DeviceReport> {
    let (tx, rx) = unbounded();

    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(lanes.len());
        for (i, lane) in lanes.iter_mut().enumerate() {
            let tx = tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("lane-{}", i))
                .spawn_scoped(scope, move || {
                    let reports = poll_lane(i, lane, mode);
                    // Receiver outlives the scope.
                    let _ = tx.send((i, reports));
                });
            match spawned {
                Ok(handle) => handles.push((i, handle)),
                Err(e) => warn!("lane {}: failed to start thread: {}", i, e),
            }
        }
        for (i, handle) in handles {
            if handle.join().is_err() {
                warn!("lane {} panicked during the cycle", i);
            }
        }
    });
    drop(tx);

    let mut by_lane: Vec<Option<Vec<DeviceReport>>> = vec![None; lanes.len()];
    for (i, reports) in rx.iter() {
        by_lane[i] = Some(reports);
    }

    by_lane
        .into_iter()
        .enumerate()
        .flat_map(|(i, reports)| {
            reports.unwrap_or_else(|| {
                let lane = &lanes[i];
                lane.devices
                    .iter()
                    .enumerate()
                    .map(|(index, device)| {
                        DeviceReport::failed(
                            i,
                            index,
                            lane.bus.name(),
                            device,
                            mode.channel_count(),
                            ReadingFault::ConnectionFailure,
                            "lane did not report".to_string(),
                        )
                    })
                    .collect()
            })
        })
        .collect()
}

fn poll_lane<T: Transport>(index: usize, lane: &mut Lane<T>, mode: &PollMode) -> Vec<DeviceReport> {
    let Lane { bus, devices } = lane;
    devices
        .iter()
        .enumerate()
        .map(|(i, device)| poll_device(index, i, bus, device, mode))
        .collect()
}

fn poll_device<T: Transport>(
    lane: usize,
    index: usize,
    bus: &mut Bus<T>,
    device: &DeviceSession,
    mode: &PollMode,
) -> DeviceReport {
    let bus_name = bus.name().to_string();
    match *mode {
        PollMode::Bulk { expected_channels } => match device.read_all_weights(bus) {
            Ok(bulk) => DeviceReport {
                lane,
                index,
                bus: bus_name,
                address: device.address().clone(),
                outcome: DeviceOutcome::Complete,
                readings: bulk.readings,
                truncated_bytes: bulk.trailing,
            },
            Err(e) => DeviceReport::failed(
                lane,
                index,
                &bus_name,
                device,
                expected_channels,
                e.fault(),
                e.to_string(),
            ),
        },
        PollMode::PerChannel {
            channels,
            precision,
        } => {
            let mut readings = Vec::with_capacity(channels as usize);
            let mut last_error: Option<SessionError> = None;
            let mut failed = 0;

            for channel in 0..channels {
                if last_error.as_ref().is_some_and(|e| e.halts_bus()) {
                    readings.push(WeightReading::invalid(
                        channel as usize,
                        ReadingFault::ConnectionFailure,
                    ));
                    failed += 1;
                    continue;
                }
                let result = match precision {
                    Precision::Standard => device.read_weight(bus, channel),
                    Precision::High => {
                        device.read_high_precision(bus, channel, PrecisionMode::Weight)
                    }
                };
                match result {
                    Ok(reading) => readings.push(reading),
                    Err(e) => {
                        readings.push(WeightReading::invalid(channel as usize, e.fault()));
                        failed += 1;
                        last_error = Some(e);
                    }
                }
            }

            let outcome = match last_error {
                Some(e) if failed == channels as usize => DeviceOutcome::Failed {
                    fault: e.fault(),
                    message: e.to_string(),
                },
                _ if failed > 0 => DeviceOutcome::Partial {
                    failed_channels: failed,
                },
                _ => DeviceOutcome::Complete,
            };
            DeviceReport {
                lane,
                index,
                bus: bus_name,
                address: device.address().clone(),
                outcome,
                readings,
                truncated_bytes: 0,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use crate::mock::{RecordingLog, ScriptedReply, ScriptedTransport};
    use crate::session::SessionConfig;
    use digisens_protocol::AddressMode;

    fn device(id: &str) -> DeviceSession {
        DeviceSession::new(
            DeviceAddress::standard(id).unwrap(),
            SessionConfig {
                timeout: Duration::from_millis(10),
                strict_checksum: false,
            },
        )
    }

    fn reply(text: &str) -> ScriptedReply {
        ScriptedReply::body(AddressMode::Standard, text).unwrap()
    }

    #[test]
    fn test_failed_device_degrades_to_placeholders() {
        let t = ScriptedTransport::new("bus0", RecordingLog::new())
            .with_reply(ScriptedReply::Silence)
            .with_reply(reply(" 0001.000  0002.000 "));
        let plan = BusPlan::shared(
            Bus::new(t, BusConfig { settle_delay: Duration::ZERO }),
            vec![device("001"), device("002")],
        );
        let mut coordinator = BusCoordinator::new(plan, PollMode::Bulk { expected_channels: 4 });
        let report = coordinator.poll_cycle();

        assert_eq!(report.devices.len(), 2);
        assert_eq!(report.devices[0].readings.len(), 4);
        assert!(report.devices[0].readings.iter().all(|r| r.fault == Some(ReadingFault::Timeout)));
        assert!(matches!(report.devices[0].outcome, DeviceOutcome::Failed { .. }));
        assert_eq!(report.devices[1].outcome, DeviceOutcome::Complete);
        assert_eq!(report.devices[1].valid_count(), 2);
        assert_eq!(coordinator.ready_lanes(), 1);
    }

    #[test]
    fn test_per_channel_partial_failure() {
        let t = ScriptedTransport::new("bus0", RecordingLog::new())
            .with_reply(reply(" 0001.000 "))
            .with_reply(ScriptedReply::Silence)
            .with_reply(reply(" 0003.000M"));
        let plan = BusPlan::shared(
            Bus::new(t, BusConfig { settle_delay: Duration::ZERO }),
            vec![device("001")],
        );
        let mut coordinator = BusCoordinator::new(
            plan,
            PollMode::PerChannel {
                channels: 3,
                precision: Precision::Standard,
            },
        );
        let report = coordinator.poll_cycle();
        let dev = &report.devices[0];
        assert_eq!(dev.outcome, DeviceOutcome::Partial { failed_channels: 1 });
        assert!(dev.readings[0].is_valid());
        assert_eq!(dev.readings[1].fault, Some(ReadingFault::Timeout));
        assert_eq!(dev.readings[2].channel, 2);
        assert!(!dev.readings[2].is_valid());
    }

    #[test]
    fn test_connection_loss_skips_remaining_channels() {
        let log = RecordingLog::new();
        let t = ScriptedTransport::new("bus0", log.clone())
            .with_reply(ScriptedReply::Disconnect);
        let plan = BusPlan::shared(
            Bus::new(t, BusConfig { settle_delay: Duration::ZERO }),
            vec![device("001")],
        );
        let mut coordinator = BusCoordinator::new(
            plan,
            PollMode::PerChannel {
                channels: 4,
                precision: Precision::High,
            },
        );
        let report = coordinator.poll_cycle();
        assert!(matches!(
            report.devices[0].outcome,
            DeviceOutcome::Failed { fault: ReadingFault::ConnectionFailure, .. }
        ));
        assert_eq!(log.writes("bus0").len(), 1);
        assert_eq!(coordinator.ready_lanes(), 0);
    }

    #[test]
    fn test_worst_case_cycle() {
        let t = ScriptedTransport::new("bus0", RecordingLog::new());
        let plan = BusPlan::shared(
            Bus::new(t, BusConfig { settle_delay: Duration::from_millis(5) }),
            vec![device("001"), device("002")],
        );
        let coordinator = BusCoordinator::new(
            plan,
            PollMode::PerChannel {
                channels: 8,
                precision: Precision::Standard,
            },
        );
        // 2 devices x 8 channels x (10 ms + 5 ms)
        assert_eq!(coordinator.worst_case_cycle(), Duration::from_millis(240));
    }

    #[test]
    fn test_run_honours_stop_flag() {
        let t = ScriptedTransport::new("bus0", RecordingLog::new());
        let plan = BusPlan::shared(
            Bus::new(t, BusConfig { settle_delay: Duration::ZERO }),
            vec![device("001")],
        );
        let mut coordinator = BusCoordinator::new(plan, PollMode::default());
        let stop = AtomicBool::new(false);
        let ran = coordinator.run(None, Duration::ZERO, &stop, |report| {
            if report.cycle == 2 {
                stop.store(true, Ordering::SeqCst);
            }
        });
        assert_eq!(ran, 2);
        assert_eq!(coordinator.cycles(), 2);
    }
}
