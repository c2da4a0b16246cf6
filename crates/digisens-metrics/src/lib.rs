//! Metrics infrastructure for the DIGIsens bus engine.
//!
//! This crate describes every metric the engine records. It re-exports the
//! `metrics` crate and declares each metric as a structured [`Metric`]
//! constant so names are never typed twice. Installing a recorder/exporter is
//! left to the application.
//!
//! # Example
//!
//! ```rust,ignore
//! use digisens_metrics::{describe_metrics, metric_defs, BusLabels};
//!
//! describe_metrics();
//!
//! let labels = BusLabels::new("/dev/ttyUSB0", "@123");
//! let tags = labels.with_verb("gl");
//! metrics::counter!(metric_defs::EXCHANGE_TOTAL.name, tags.as_slice()).increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// The kind of metric (counter, gauge, or histogram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A monotonically increasing counter.
    Counter,
    /// A gauge that can go up and down.
    Gauge,
    /// A histogram for recording distributions.
    Histogram,
}

impl MetricKind {
    /// Returns the kind as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric declaration with its metadata.
///
/// ```rust
/// use digisens_metrics::{Metric, MetricKind};
/// use metrics::Unit;
///
/// const FRAMES: Metric = Metric::counter("digisens.frames")
///     .with_description("Frames seen")
///     .with_unit(Unit::Count)
///     .with_labels(&["bus"]);
///
/// assert_eq!(FRAMES.name, "digisens.frames");
/// assert_eq!(FRAMES.kind, MetricKind::Counter);
/// ```
#[derive(Debug, Clone)]
pub struct Metric {
    /// The metric name.
    pub name: &'static str,
    /// The kind of metric.
    pub kind: MetricKind,
    /// Human-readable description.
    pub description: &'static str,
    /// The unit of measurement, if any.
    pub unit: Option<Unit>,
    /// Expected label keys.
    pub labels: &'static [&'static str],
}

impl Metric {
    const fn new(name: &'static str, kind: MetricKind) -> Self {
        Self {
            name,
            kind,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Creates a new counter metric with the given name.
    pub const fn counter(name: &'static str) -> Self {
        Self::new(name, MetricKind::Counter)
    }

    /// Creates a new gauge metric with the given name.
    pub const fn gauge(name: &'static str) -> Self {
        Self::new(name, MetricKind::Gauge)
    }

    /// Creates a new histogram metric with the given name.
    pub const fn histogram(name: &'static str) -> Self {
        Self::new(name, MetricKind::Histogram)
    }

    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    pub const fn with_labels(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = labels;
        self
    }

    /// Registers this metric's description with the installed recorder.
    pub fn describe(&self) {
        match (self.kind, self.unit) {
            (MetricKind::Counter, Some(unit)) => {
                describe_counter!(self.name, unit, self.description);
            }
            (MetricKind::Counter, None) => {
                describe_counter!(self.name, self.description);
            }
            (MetricKind::Gauge, Some(unit)) => {
                describe_gauge!(self.name, unit, self.description);
            }
            (MetricKind::Gauge, None) => {
                describe_gauge!(self.name, self.description);
            }
            (MetricKind::Histogram, Some(unit)) => {
                describe_histogram!(self.name, unit, self.description);
            }
            (MetricKind::Histogram, None) => {
                describe_histogram!(self.name, self.description);
            }
        }
    }
}

/// All metric definitions for the bus engine.
pub mod metric_defs {
    use super::{Metric, Unit};

    // ========================================================================
    // Exchanges
    // ========================================================================

    /// Request/response exchanges started.
    ///
    /// Labels: bus, device, verb
    pub const EXCHANGE_TOTAL: Metric = Metric::counter("digisens.exchange.total")
        .with_description("Request/response exchanges started")
        .with_unit(Unit::Count)
        .with_labels(&["bus", "device", "verb"]);

    /// Exchanges that ended without a usable reply.
    ///
    /// Labels: bus, device, verb, kind (timeout, short_response, checksum, connection, protocol)
    pub const EXCHANGE_FAILURES: Metric = Metric::counter("digisens.exchange.failures")
        .with_description("Exchanges that ended without a usable reply")
        .with_unit(Unit::Count)
        .with_labels(&["bus", "device", "verb", "kind"]);

    /// Time from writing the request to receiving the terminator.
    ///
    /// Labels: bus, device, verb
    pub const EXCHANGE_LATENCY: Metric = Metric::histogram("digisens.exchange.latency")
        .with_description("Time from request write to reply terminator")
        .with_unit(Unit::Seconds)
        .with_labels(&["bus", "device", "verb"]);

    // ========================================================================
    // Readings
    // ========================================================================

    /// Weight replies with characters left over after their last block.
    ///
    /// Labels: bus, device, verb
    pub const BULK_TRUNCATED: Metric = Metric::counter("digisens.bulk.truncated")
        .with_description("Weight replies that ended in a partial or surplus block")
        .with_unit(Unit::Count)
        .with_labels(&["bus", "device", "verb"]);

    /// Readings that came back invalid (non-OK status or placeholder).
    ///
    /// Labels: bus, device, verb
    pub const READINGS_INVALID: Metric = Metric::counter("digisens.readings.invalid")
        .with_description("Readings without an OK status")
        .with_unit(Unit::Count)
        .with_labels(&["bus", "device", "verb"]);

    // ========================================================================
    // Cycles
    // ========================================================================

    /// Wall time of one coordinator cycle across every lane.
    pub const CYCLE_DURATION: Metric = Metric::histogram("digisens.cycle.duration")
        .with_description("Wall time of one polling cycle")
        .with_unit(Unit::Seconds);

    /// Buses still accepting exchanges after the latest cycle.
    pub const LANES_READY: Metric = Metric::gauge("digisens.lanes.ready")
        .with_description("Buses accepting exchanges after the latest cycle")
        .with_unit(Unit::Count);

    /// Every metric, for [`describe_metrics`](super::describe_metrics).
    pub const ALL: &[&Metric] = &[
        &EXCHANGE_TOTAL,
        &EXCHANGE_FAILURES,
        &EXCHANGE_LATENCY,
        &BULK_TRUNCATED,
        &READINGS_INVALID,
        &CYCLE_DURATION,
        &LANES_READY,
    ];
}

/// Labels identifying one device on one bus.
#[derive(Debug, Clone)]
pub struct BusLabels {
    /// Bus (transport) name, e.g. the serial port path.
    pub bus: String,
    /// Device address as displayed, e.g. `@123`.
    pub device: String,
}

impl BusLabels {
    pub fn new(bus: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            bus: bus.into(),
            device: device.into(),
        }
    }

    /// Converts the labels to the metrics crate label format.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        vec![("bus", self.bus.clone()), ("device", self.device.clone())]
    }

    /// Labels plus the command verb.
    pub fn with_verb(&self, verb: &str) -> Vec<(&'static str, String)> {
        self.with(&[("verb", verb.to_string())])
    }

    /// Labels plus arbitrary extra pairs.
    pub fn with(&self, extra: &[(&'static str, String)]) -> Vec<(&'static str, String)> {
        let mut labels = self.to_labels();
        labels.extend_from_slice(extra);
        labels
    }
}

/// Describes all metrics with the installed recorder.
///
/// Call once at startup, after installing a recorder.
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_labels() {
        let labels = BusLabels::new("/dev/ttyUSB0", "@123");
        let label_vec = labels.to_labels();
        assert_eq!(label_vec.len(), 2);
        assert!(label_vec.contains(&("bus", "/dev/ttyUSB0".to_string())));
        assert!(label_vec.contains(&("device", "@123".to_string())));
    }

    #[test]
    fn test_with_verb() {
        let labels = BusLabels::new("bus0", "@001").with_verb("gl");
        assert_eq!(labels.len(), 3);
        assert!(labels.contains(&("verb", "gl".to_string())));
    }

    #[test]
    fn test_metric_definitions() {
        assert_eq!(metric_defs::EXCHANGE_TOTAL.name, "digisens.exchange.total");
        assert_eq!(metric_defs::EXCHANGE_TOTAL.kind, MetricKind::Counter);
        assert_eq!(metric_defs::EXCHANGE_LATENCY.kind, MetricKind::Histogram);
        assert_eq!(metric_defs::EXCHANGE_LATENCY.unit, Some(Unit::Seconds));
        assert_eq!(metric_defs::EXCHANGE_FAILURES.labels, &["bus", "device", "verb", "kind"]);
        assert_eq!(metric_defs::LANES_READY.kind, MetricKind::Gauge);
    }

    #[test]
    fn test_all_metrics_listed() {
        assert_eq!(metric_defs::ALL.len(), 7);
        let mut names: Vec<_> = metric_defs::ALL.iter().map(|m| m.name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 7);
    }

    #[test]
    fn test_describe_without_recorder() {
        // No recorder installed: describing is a no-op and must not panic.
        describe_metrics();
    }
}
