//! Wire format of the fleet channel.
//!
//! Inbound frames are JSON objects discriminated by an optional `type`
//! field. Outbound frames are the role handshake, liveness pings, and
//! whatever the operator sends.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::fleet::{Coordinates, RobotId, RobotStatus};

/// Discriminator of the backend's aggregate frame.
pub const STATUS_SUMMARY_TYPE: &str = "robot_status_summary";
/// Discriminator of the backend's reply to a ping.
pub const PONG_TYPE: &str = "pong";

/// Longest slice of a rejected frame that ends up in the logs.
const DIAGNOSTIC_PREVIEW_LEN: usize = 120;

/// Fleet-wide counts per status as reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusSummary {
    pub statuses: BTreeMap<RobotStatus, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_robots: Option<u64>,
}

/// A partial update of one robot. Absent fields leave the snapshot alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetryUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub robot_id: Option<RobotId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RobotStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl TelemetryUpdate {
    pub fn for_robot(id: impl Into<RobotId>) -> Self {
        Self {
            robot_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: RobotStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }

    /// True when the frame carried nothing that could be merged.
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none()
            && self.status.is_none()
            && self.coordinates.is_none()
            && self.metrics.is_empty()
            && self.attributes.is_empty()
    }
}

/// Every shape an inbound frame can decode to.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    StatusSummary(StatusSummary),
    Heartbeat,
    Telemetry(TelemetryUpdate),
}

impl InboundEvent {
    /// The part of the stream the reconciler cares about. Heartbeats stop here.
    pub fn into_fleet_event(self) -> Option<FleetEvent> {
        match self {
            Self::StatusSummary(summary) => Some(FleetEvent::StatusSummary(summary)),
            Self::Telemetry(update) => Some(FleetEvent::Telemetry(update)),
            Self::Heartbeat => None,
        }
    }
}

/// An event the fleet state reconciler applies.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FleetEvent {
    StatusSummary(StatusSummary),
    Telemetry(TelemetryUpdate),
}

/// Decode one inbound text frame.
///
/// Returns `None` for anything that is not a usable event; the reason is
/// logged and the frame is otherwise ignored.
pub fn decode_frame(text: &str) -> Option<InboundEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, frame = %preview(text), "discarding undecodable frame");
            return None;
        }
    };

    let Value::Object(object) = value else {
        tracing::warn!(frame = %preview(text), "discarding frame that is not a JSON object");
        return None;
    };

    match object.get("type").and_then(Value::as_str) {
        Some(STATUS_SUMMARY_TYPE) => match decode_summary(&object) {
            Some(summary) => Some(InboundEvent::StatusSummary(summary)),
            None => {
                tracing::warn!(frame = %preview(text), "discarding malformed status summary");
                None
            }
        },
        Some(PONG_TYPE) => Some(InboundEvent::Heartbeat),
        _ => {
            let Some(update) = decode_telemetry(object) else {
                tracing::warn!(frame = %preview(text), "discarding telemetry with unusable robot_id");
                return None;
            };
            if update.robot_id.is_none() && update.is_empty() {
                tracing::debug!(frame = %preview(text), "discarding frame with no telemetry");
                return None;
            }
            Some(InboundEvent::Telemetry(update))
        }
    }
}

fn decode_summary(object: &Map<String, Value>) -> Option<StatusSummary> {
    let raw = object.get("statuses")?.as_object()?;
    let mut statuses = BTreeMap::new();
    for (name, count) in raw {
        let count = count.as_u64()?;
        match RobotStatus::parse(name) {
            Some(status) => *statuses.entry(status).or_insert(0) += count,
            None => tracing::debug!(status = %name, count, "ignoring unknown status in summary"),
        }
    }
    let connected_robots = match object.get("connected_robots") {
        None | Some(Value::Null) => None,
        Some(v) => Some(v.as_u64()?),
    };
    Some(StatusSummary {
        statuses,
        connected_robots,
    })
}

/// `None` when `robot_id` is present but is neither a usable number nor a
/// non-empty string. Such a frame must not fall through to the current robot.
fn decode_telemetry(object: Map<String, Value>) -> Option<TelemetryUpdate> {
    let mut update = TelemetryUpdate::default();
    let mut lat = None;
    let mut lng = None;

    for (key, value) in object {
        match key.as_str() {
            "type" => {}
            "robot_id" => match value {
                Value::Null => {}
                value => update.robot_id = Some(RobotId::from_json(&value)?),
            },
            "deviceName" | "device_name" => {
                if let Value::String(name) = value {
                    update.display_name = Some(name);
                }
            }
            "status" => match value.as_str().and_then(RobotStatus::parse) {
                Some(status) => update.status = Some(status),
                None => tracing::debug!(status = %value, "ignoring unrecognised robot status"),
            },
            "coordinates" => match serde_json::from_value::<Coordinates>(value) {
                Ok(coords) => update.coordinates = Some(coords),
                Err(e) => tracing::debug!(error = %e, "ignoring malformed coordinates"),
            },
            "lat" => lat = Some((key, value)),
            "lng" | "lon" => lng = Some((key, value)),
            _ => merge_field(&mut update, key, value, true),
        }
    }

    // Top-level lat/lng only form a position as a pair; otherwise they are
    // kept as plain metrics.
    match (lat, lng) {
        (Some((_, lat_v)), Some((_, lng_v)))
            if update.coordinates.is_none() && lat_v.is_number() && lng_v.is_number() =>
        {
            update.coordinates = lat_v
                .as_f64()
                .zip(lng_v.as_f64())
                .map(|(lat, lng)| Coordinates { lat, lng });
        }
        (lat, lng) => {
            for (key, value) in lat.into_iter().chain(lng) {
                tracing::debug!(field = %key, "position component without a partner, keeping as metric");
                merge_field(&mut update, key, value, false);
            }
        }
    }
    Some(update)
}

fn merge_field(update: &mut TelemetryUpdate, key: String, value: Value, descend: bool) {
    match value {
        Value::Number(n) => {
            if let Some(v) = n.as_f64() {
                update.metrics.insert(key, v);
            }
        }
        Value::String(s) => {
            if !s.is_empty() {
                update.attributes.insert(key, s);
            }
        }
        Value::Bool(b) => {
            update.attributes.insert(key, b.to_string());
        }
        Value::Object(nested) if descend => {
            for (child, v) in nested {
                merge_field(update, format!("{key}.{child}"), v, false);
            }
        }
        Value::Object(_) | Value::Array(_) | Value::Null => {}
    }
}

fn preview(text: &str) -> &str {
    if text.len() <= DIAGNOSTIC_PREVIEW_LEN {
        return text;
    }
    let mut end = DIAGNOSTIC_PREVIEW_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

// ── Outbound frames ────────────────────────────────────────────────

/// First frame on every new channel.
#[derive(Debug, Serialize)]
pub struct Handshake<'a> {
    pub role: &'a str,
    pub id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Ping { timestamp: u64 },
}

impl ControlFrame {
    pub fn ping_now() -> Self {
        Self::Ping {
            timestamp: epoch_millis(SystemTime::now()),
        }
    }
}

/// An operator message headed for the backend. Strings go out verbatim,
/// anything else is serialised to JSON first.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Text(String),
    Json(Value),
}

impl OutboundMessage {
    pub fn into_text(self) -> Result<String, serde_json::Error> {
        match self {
            Self::Text(text) => Ok(text),
            Self::Json(value) => serde_json::to_string(&value),
        }
    }
}

impl From<String> for OutboundMessage {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for OutboundMessage {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Value> for OutboundMessage {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

pub fn epoch_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
