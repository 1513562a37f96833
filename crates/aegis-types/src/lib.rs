//! `aegis-types` – shared data model for the sensor-to-bus gateway.
//!
//! Every other crate in the workspace speaks in these types: the ingest-side
//! [`Sample`], the bus-ready [`Frame`], the active [`AttackMode`], the
//! [`Event`] envelope routed over the event bus, and the workspace-wide
//! [`GatewayError`].

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Well-known event bus topics.
pub mod topic {
    /// A sample was generated by the producer.
    pub const BLE_RX: &str = "ble.rx";
    /// A staged sample was forwarded towards the translator.
    pub const BLE_TX: &str = "ble.tx";
    /// A sample was dropped because a queue was full.
    pub const BLE_DROP: &str = "ble.drop";
    /// A frame was transmitted on the vehicle bus.
    pub const FRAME_SENT: &str = "frame.sent";
    /// A synthetic fault was injected.
    pub const ATTACK_EVENT: &str = "attack.event";
    /// Periodic host load and task count.
    pub const SYSTEM_METRICS: &str = "system.metrics";
}

/// Largest payload a classic CAN frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = 8;

/// Raw reading that maps to a zero steering angle.
pub const RAW_CENTER: u8 = 127;

/// Full-scale steering angle in tenths of a degree.
pub const ANGLE_FULL_SCALE: i32 = 900;

// ────────────────────────────────────────────────────────────────────────────
// Samples and frames
// ────────────────────────────────────────────────────────────────────────────

/// One ingest-side reading before translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sample {
    pub raw_value: u8,
    /// Lower numbers are dequeued first.
    pub priority: u8,
    /// Monotonic microseconds since the producer's clock origin.
    pub timestamp_us: u64,
}

impl Sample {
    pub fn new(raw_value: u8, priority: u8, timestamp_us: u64) -> Self {
        Self {
            raw_value,
            priority,
            timestamp_us,
        }
    }
}

/// One translated, bus-ready payload.
///
/// `queue_depth_at_send` and `send_latency_us` are filled in by the
/// translator around the transmission call; [`Frame::new`] leaves them at
/// zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub arbitration_id: u32,
    payload: Vec<u8>,
    pub send_latency_us: u64,
    pub queue_depth_at_send: u32,
}

impl Frame {
    /// Build a frame, rejecting payloads longer than [`MAX_FRAME_PAYLOAD`].
    pub fn new(arbitration_id: u32, payload: &[u8]) -> Result<Self, GatewayError> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(GatewayError::Codec(format!(
                "frame payload of {} bytes exceeds {MAX_FRAME_PAYLOAD}",
                payload.len()
            )));
        }
        Ok(Self {
            arbitration_id,
            payload: payload.to_vec(),
            send_latency_us: 0,
            queue_depth_at_send: 0,
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Map an 8-bit raw reading onto a signed steering angle in `[-900, 900]`.
///
/// The map is piecewise linear around [`RAW_CENTER`] so that both ends of the
/// input range land exactly on full scale: `0 → -900`, `127 → 0`,
/// `255 → 900`. It is monotonic non-decreasing over the whole input range.
pub fn scale(raw: u8) -> i16 {
    let offset = i32::from(raw) - i32::from(RAW_CENTER);
    let span = if offset < 0 {
        i32::from(RAW_CENTER)
    } else {
        i32::from(u8::MAX - RAW_CENTER)
    };
    // |offset * 900 / span| <= 900, always inside i16.
    (offset * ANGLE_FULL_SCALE / span) as i16
}

/// Monotonic microsecond clock anchored at construction time.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Microseconds elapsed since the clock was created.
    pub fn now_us(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Attack mode
// ────────────────────────────────────────────────────────────────────────────

/// The fault-simulation behaviour currently applied by the translator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackMode {
    /// Translate normally.
    #[default]
    None,
    /// Delay every frame before sending (degraded service under load).
    Flood,
    /// Negate the translated angle (sign-bit corruption).
    Corrupt,
    /// Discard every sample without emitting a frame.
    SuppressHeartbeat,
}

impl AttackMode {
    /// Control-surface name of the mode (`none`, `dos`, `flip`, `heart`).
    pub fn as_str(self) -> &'static str {
        match self {
            AttackMode::None => "none",
            AttackMode::Flood => "dos",
            AttackMode::Corrupt => "flip",
            AttackMode::SuppressHeartbeat => "heart",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            AttackMode::None => 0,
            AttackMode::Flood => 1,
            AttackMode::Corrupt => 2,
            AttackMode::SuppressHeartbeat => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => AttackMode::Flood,
            2 => AttackMode::Corrupt,
            3 => AttackMode::SuppressHeartbeat,
            _ => AttackMode::None,
        }
    }
}

impl fmt::Display for AttackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttackMode {
    type Err = GatewayError;

    /// Parse a control-surface mode name. Anything outside
    /// `none|dos|flip|heart` is rejected before it can reach the pipeline.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(AttackMode::None),
            "dos" => Ok(AttackMode::Flood),
            "flip" => Ok(AttackMode::Corrupt),
            "heart" => Ok(AttackMode::SuppressHeartbeat),
            _ => Err(GatewayError::InvalidAttackMode(s.to_string())),
        }
    }
}

/// Single-writer, many-reader holder for the active [`AttackMode`].
///
/// Backed by one atomic byte so every read is a single load and can never
/// observe an intermediate state.
#[derive(Debug, Default)]
pub struct AttackModeCell(AtomicU8);

impl AttackModeCell {
    pub fn new(mode: AttackMode) -> Self {
        Self(AtomicU8::new(mode.to_u8()))
    }

    pub fn load(&self) -> AttackMode {
        AttackMode::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Store `mode`, returning the previously active mode.
    pub fn store(&self, mode: AttackMode) -> AttackMode {
        AttackMode::from_u8(self.0.swap(mode.to_u8(), Ordering::AcqRel))
    }
}

/// Kind of synthetic fault reported on [`topic::ATTACK_EVENT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttackKind {
    Dos,
    BitFlip,
    HeartbeatLoss,
}

impl AttackKind {
    pub fn severity(self) -> Severity {
        match self {
            AttackKind::Dos => Severity::High,
            AttackKind::BitFlip => Severity::Medium,
            AttackKind::HeartbeatLoss => Severity::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

// ────────────────────────────────────────────────────────────────────────────
// Events
// ────────────────────────────────────────────────────────────────────────────

/// Unified event envelope routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"aegis-runtime::translator"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Wrap `payload` in a fresh envelope stamped with the current time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Why a sample never reached the translator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The producer's local staging queue was full.
    OutboxFull,
    /// The translator's input channel was full.
    ChannelFull,
}

/// Variants of data routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    SampleIngested {
        raw: u8,
        timestamp_us: u64,
    },
    SampleForwarded {
        priority: u8,
        timestamp_us: u64,
        data_len: usize,
    },
    SampleDropped {
        raw: u8,
        timestamp_us: u64,
        reason: DropReason,
    },
    FrameSent(FrameTelemetry),
    Attack(AttackEvent),
    Metrics(SystemMetrics),
}

/// Measurements taken by the translator around one transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameTelemetry {
    pub angle: i16,
    pub latency_us: u64,
    pub queue_depth: u32,
    pub source_timestamp_us: u64,
    /// Artificial delay applied before sending under [`AttackMode::Flood`];
    /// not part of `latency_us`.
    pub injected_delay_us: u64,
}

/// A synthetic fault notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackEvent {
    pub kind: AttackKind,
    pub severity: Severity,
    pub description: String,
    /// Position of this event within a burst (1-based); 1 for one-shots.
    pub event_count: u64,
    pub rate_hz: Option<f64>,
}

impl AttackEvent {
    pub fn new(kind: AttackKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            description: description.into(),
            event_count: 1,
            rate_hz: None,
        }
    }
}

/// Host load snapshot published on [`topic::SYSTEM_METRICS`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_percent: f32,
    pub ram_percent: f32,
    /// Usage of the filesystem mounted at `/` (or the largest one).
    pub disk_percent: f32,
    /// Supervised tasks still alive when the snapshot was taken.
    pub live_tasks: usize,
}

/// Record handed to the external telemetry sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Pipeline stage that produced the event, e.g. `"can"` or `"attack"`.
    pub stage: String,
    /// Upper-case record type, e.g. `"CAN_TX"` or `"ATTACK"`.
    pub kind: String,
    pub event: Event,
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Workspace-wide error taxonomy.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GatewayError {
    #[error("Channel full (capacity {capacity})")]
    ChannelFull { capacity: usize },

    #[error("Channel empty: no item before timeout")]
    Empty,

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Wire codec error: {0}")]
    Codec(String),

    #[error("Invalid attack mode '{0}': expected one of none, dos, flip, heart")]
    InvalidAttackMode(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error("Task '{task}' failed: {details}")]
    TaskFailed { task: String, details: String },

    #[error("Event handler failed: {0}")]
    Handler(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{} failures: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<GatewayError>),
}

impl GatewayError {
    /// `true` for conditions a steady-state loop absorbs and carries on from.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GatewayError::ChannelFull { .. }
                | GatewayError::Empty
                | GatewayError::Transport(_)
                | GatewayError::Codec(_)
                | GatewayError::Handler(_)
        )
    }

    /// Collapse a list of failures: `Ok` when empty, the error itself when
    /// there is exactly one, [`GatewayError::Multiple`] otherwise.
    pub fn aggregate(mut errors: Vec<GatewayError>) -> Result<(), GatewayError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(GatewayError::Multiple(errors)),
        }
    }
}

fn join_errors(errors: &[GatewayError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_hits_full_scale_and_zero() {
        assert_eq!(scale(0), -900);
        assert_eq!(scale(127), 0);
        assert_eq!(scale(255), 900);
    }

    #[test]
    fn scale_is_monotonic() {
        let mut prev = scale(0);
        for raw in 1..=u8::MAX {
            let cur = scale(raw);
            assert!(cur >= prev, "scale({raw}) = {cur} < {prev}");
            prev = cur;
        }
    }

    #[test]
    fn frame_rejects_oversized_payload() {
        assert!(Frame::new(0x100, &[0u8; 8]).is_ok());
        let err = Frame::new(0x100, &[0u8; 9]).unwrap_err();
        assert!(matches!(err, GatewayError::Codec(_)));
    }

    #[test]
    fn attack_mode_parses_control_names() {
        assert_eq!("none".parse::<AttackMode>().unwrap(), AttackMode::None);
        assert_eq!("dos".parse::<AttackMode>().unwrap(), AttackMode::Flood);
        assert_eq!(" FLIP ".parse::<AttackMode>().unwrap(), AttackMode::Corrupt);
        assert_eq!(
            "heart".parse::<AttackMode>().unwrap(),
            AttackMode::SuppressHeartbeat
        );
    }

    #[test]
    fn attack_mode_rejects_unknown_names() {
        let err = "meltdown".parse::<AttackMode>().unwrap_err();
        assert_eq!(err, GatewayError::InvalidAttackMode("meltdown".to_string()));
        assert!(err.to_string().contains("meltdown"));
    }

    #[test]
    fn attack_mode_display_matches_parse() {
        for mode in [
            AttackMode::None,
            AttackMode::Flood,
            AttackMode::Corrupt,
            AttackMode::SuppressHeartbeat,
        ] {
            assert_eq!(mode.to_string().parse::<AttackMode>().unwrap(), mode);
        }
    }

    #[test]
    fn attack_mode_cell_swaps_values() {
        let cell = AttackModeCell::default();
        assert_eq!(cell.load(), AttackMode::None);
        assert_eq!(cell.store(AttackMode::Corrupt), AttackMode::None);
        assert_eq!(cell.load(), AttackMode::Corrupt);
    }

    #[test]
    fn attack_kind_severity() {
        assert_eq!(AttackKind::Dos.severity(), Severity::High);
        assert_eq!(AttackKind::HeartbeatLoss.severity(), Severity::Critical);
        let ev = AttackEvent::new(AttackKind::BitFlip, "flip");
        assert_eq!(ev.severity, Severity::Medium);
        assert_eq!(ev.event_count, 1);
    }

    #[test]
    fn event_payload_is_tagged_by_type() {
        let event = Event::new(
            "aegis-runtime::translator",
            EventPayload::FrameSent(FrameTelemetry {
                angle: -450,
                latency_us: 12,
                queue_depth: 3,
                source_timestamp_us: 1_000,
                injected_delay_us: 0,
            }),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["type"], "frame_sent");
        assert_eq!(json["payload"]["angle"], -450);

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, event.id);
    }

    #[test]
    fn aggregate_collapses_errors() {
        assert!(GatewayError::aggregate(vec![]).is_ok());
        assert_eq!(
            GatewayError::aggregate(vec![GatewayError::Empty]),
            Err(GatewayError::Empty)
        );
        let err = GatewayError::aggregate(vec![
            GatewayError::Transport("a".into()),
            GatewayError::Transport("b".into()),
        ])
        .unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("2 failures"));
        assert!(text.contains("Transport failure: a"));
    }

    #[test]
    fn recoverable_classification() {
        assert!(GatewayError::ChannelFull { capacity: 1 }.is_recoverable());
        assert!(GatewayError::Empty.is_recoverable());
        assert!(!GatewayError::Cancelled.is_recoverable());
        assert!(!GatewayError::InvalidAttackMode("x".into()).is_recoverable());
    }

    #[test]
    fn monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let a = clock.now_us();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(clock.now_us() > a);
    }
}
