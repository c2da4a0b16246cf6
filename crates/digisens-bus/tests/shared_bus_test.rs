//! Shared-bus polling discipline tests.
//!
//! These tests drive a BusCoordinator over one recorded transport and check
//! the write/read ordering the bus actually saw.

use std::time::Duration;

use digisens_bus::{
    Bus, BusConfig, BusCoordinator, BusPlan, DeviceOutcome, DeviceSession, EventKind, PollMode,
    RecordingLog, ScriptedReply, ScriptedTransport, SessionConfig,
};
use digisens_protocol::{AddressMode, DeviceAddress, FrameCodec, ReadingFault};

// ============================================================================
// Helpers
// ============================================================================

const SETTLE: Duration = Duration::from_millis(25);

fn session(id: &str) -> DeviceSession {
    DeviceSession::new(
        DeviceAddress::standard(id).unwrap(),
        SessionConfig {
            timeout: Duration::from_millis(30),
            strict_checksum: false,
        },
    )
}

fn bulk_reply(channels: usize) -> ScriptedReply {
    let body: String = (0..channels)
        .map(|ch| format!(" {:08.3} ", ch as f64))
        .collect();
    ScriptedReply::body(AddressMode::Standard, &body).unwrap()
}

fn coordinator(
    ids: &[&str],
    replies: Vec<ScriptedReply>,
) -> (BusCoordinator<ScriptedTransport>, RecordingLog) {
    let log = RecordingLog::new();
    let mut transport = ScriptedTransport::new("rs485-0", log.clone());
    for reply in replies {
        transport.push_reply(reply);
    }
    let bus = Bus::new(transport, BusConfig { settle_delay: SETTLE });
    let devices = ids.iter().map(|id| session(id)).collect();
    let plan = BusPlan::shared(bus, devices);
    (
        BusCoordinator::new(plan, PollMode::Bulk { expected_channels: 8 }),
        log,
    )
}

fn request_address(request: &[u8]) -> String {
    let frame = FrameCodec::decode(request).unwrap();
    frame.body()[2..5].to_string()
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_devices_polled_in_roster_order() {
    let ids = ["003", "001", "002"];
    let (mut coordinator, log) = coordinator(&ids, (0..3).map(|_| bulk_reply(8)).collect());

    let report = coordinator.poll_cycle();

    let spans = log.exchanges();
    assert_eq!(spans.len(), 3, "exactly one write/read pair per device");
    let order: Vec<String> = spans.iter().map(|s| request_address(&s.request)).collect();
    assert_eq!(order, ids);

    let reported: Vec<String> = report
        .devices
        .iter()
        .map(|d| d.address.id().to_string())
        .collect();
    assert_eq!(reported, ids);
}

#[test]
fn test_exchanges_never_overlap_and_settle() {
    let ids = ["001", "002", "003", "004"];
    let (mut coordinator, log) = coordinator(&ids, (0..4).map(|_| bulk_reply(8)).collect());

    coordinator.poll_cycle();

    let spans = log.exchanges();
    assert_eq!(spans.len(), 4);
    for span in &spans {
        assert!(span.read_at >= span.written_at);
    }
    for pair in spans.windows(2) {
        let gap = pair[1].written_at.duration_since(pair[0].read_at);
        assert!(gap >= SETTLE, "gap {:?} shorter than settle delay", gap);
    }

    // No write happens between a write and its read.
    let events = log.events();
    let mut awaiting = false;
    for event in &events {
        match &event.kind {
            EventKind::Write(_) => {
                assert!(!awaiting, "write issued while a reply was outstanding");
                awaiting = true;
            }
            EventKind::Read(_) => awaiting = false,
            _ => {}
        }
    }
}

#[test]
fn test_settle_applies_after_timeout() {
    let (mut coordinator, log) = coordinator(
        &["001", "002"],
        vec![ScriptedReply::Silence, bulk_reply(8)],
    );

    let report = coordinator.poll_cycle();

    let spans = log.exchanges();
    assert_eq!(spans.len(), 2);
    assert!(spans[1].written_at.duration_since(spans[0].read_at) >= SETTLE);
    assert!(matches!(
        report.devices[0].outcome,
        DeviceOutcome::Failed { fault: ReadingFault::Timeout, .. }
    ));
    assert_eq!(report.devices[1].valid_count(), 8);
}

#[test]
fn test_stale_bytes_discarded_before_next_exchange() {
    let (mut coordinator, log) = coordinator(&["001"], vec![bulk_reply(8)]);
    coordinator.plan_mut().as_lanes_mut()[0]
        .bus
        .transport_mut()
        .push_stale(b" 0009.999 \r");

    let report = coordinator.poll_cycle();

    assert!(log
        .events()
        .iter()
        .any(|e| e.kind == EventKind::Discard(11)));
    let readings = &report.devices[0].readings;
    assert_eq!(readings.len(), 8);
    assert_eq!(readings[0].weight, 0.0);
    assert_eq!(readings[7].weight, 7.0);
}

#[test]
fn test_truncated_bulk_reply_is_observable() {
    let mut body: String = (0..7).map(|_| " 0001.000 ").collect();
    body.push_str(" 0001");
    let reply = ScriptedReply::body(AddressMode::Standard, &body).unwrap();
    let (mut coordinator, _) = coordinator(&["001"], vec![reply]);

    let report = coordinator.poll_cycle();

    let device = &report.devices[0];
    assert_eq!(device.outcome, DeviceOutcome::Complete);
    assert_eq!(device.readings.len(), 7);
    assert_eq!(device.truncated_bytes, 5);
}

#[test]
fn test_connection_failure_halts_only_this_bus() {
    let (mut coordinator, log) = coordinator(
        &["001", "002", "003"],
        vec![bulk_reply(8), ScriptedReply::Disconnect, bulk_reply(8)],
    );

    let report = coordinator.poll_cycle();

    assert_eq!(report.devices[0].outcome, DeviceOutcome::Complete);
    for device in &report.devices[1..] {
        assert!(matches!(
            device.outcome,
            DeviceOutcome::Failed { fault: ReadingFault::ConnectionFailure, .. }
        ));
        assert_eq!(device.readings.len(), 8);
    }
    // The third device was never addressed.
    assert_eq!(log.writes("rs485-0").len(), 2);
    assert_eq!(report.failed_devices().count(), 2);
}

#[test]
fn test_timeout_never_hangs() {
    let (mut coordinator, _) = coordinator(&["001"], vec![ScriptedReply::Raw(b"@23 0001".to_vec())]);
    let started = std::time::Instant::now();
    let report = coordinator.poll_cycle();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(report.devices[0]
        .readings
        .iter()
        .all(|r| r.fault == Some(ReadingFault::Timeout)));
}
