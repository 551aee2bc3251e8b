use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time::Instant;

/// Identifier of a robot as it appears on the wire.
///
/// Robots report their id either as a JSON number or a string; both are
/// canonicalised to the same string so `7` and `"7"` address one robot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RobotId(String);

impl RobotId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Build an id from a JSON value. Only strings and integers qualify.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(Self(s.trim().to_string())),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Self(i.to_string()))
                } else {
                    n.as_u64().map(|u| Self(u.to_string()))
                }
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for RobotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for RobotId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for RobotId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Operational status of a robot.
///
/// Wire names follow the backend: `AVAILABLE`, `CHARGING`, `IN_OPERATION`
/// and `BROKEN_CONNECT` (which is what the dashboard calls unreachable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RobotStatus {
    Available,
    Charging,
    InOperation,
    #[serde(rename = "BROKEN_CONNECT")]
    Unreachable,
}

impl RobotStatus {
    pub const ALL: [RobotStatus; 4] = [
        RobotStatus::Available,
        RobotStatus::Charging,
        RobotStatus::InOperation,
        RobotStatus::Unreachable,
    ];

    /// Parse a status string leniently: case-insensitive (Unicode), `-` and
    /// spaces are treated as `_`. Accepts the wire names, the operator
    /// console's display strings, and what field robots report while live.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized: String = raw
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == '-' || c == ' ' { '_' } else { c })
            .collect();
        match normalized.as_str() {
            "available" | "online" | "connected" | "в_сети" | "подключен" => {
                Some(Self::Available)
            }
            "charging" | "заряжается" => Some(Self::Charging),
            "in_operation" | "в_работе" => Some(Self::InOperation),
            "broken_connect" | "unreachable" | "offline" | "не_в_сети" => Some(Self::Unreachable),
            _ => None,
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Charging => "CHARGING",
            Self::InOperation => "IN_OPERATION",
            Self::Unreachable => "BROKEN_CONNECT",
        }
    }

    /// Whether a robot in this status is expected to keep reporting.
    /// Only these statuses are subject to staleness demotion.
    pub fn is_presumed_online(self) -> bool {
        !matches!(self, Self::Unreachable)
    }

    /// Presentation tone for this status.
    pub fn tone(self) -> StatusTone {
        match self {
            Self::Available => StatusTone::Online,
            Self::Charging => StatusTone::Charging,
            Self::InOperation => StatusTone::Busy,
            Self::Unreachable => StatusTone::Offline,
        }
    }
}

impl std::fmt::Display for RobotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// How a status should be rendered. Derived purely from [`RobotStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusTone {
    Online,
    Charging,
    Busy,
    Offline,
}

impl StatusTone {
    /// Hex colour used for map markers and status badges.
    pub fn color(self) -> &'static str {
        match self {
            Self::Online => "#007bff",
            Self::Charging => "#ffc107",
            Self::Busy => "#28a745",
            Self::Offline => "#dc3545",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Online => "Available",
            Self::Charging => "Charging",
            Self::Busy => "In operation",
            Self::Offline => "Unreachable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    #[serde(alias = "lon")]
    pub lng: f64,
}

/// Latest merged state of one robot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RobotSnapshot {
    pub id: RobotId,
    pub display_name: String,
    pub status: RobotStatus,
    pub telemetry: BTreeMap<String, f64>,
    pub attributes: BTreeMap<String, String>,
    pub coordinates: Option<Coordinates>,
    /// Monotonic time of the last telemetry applied to this robot. `None`
    /// for robots only known from the roster.
    #[serde(skip)]
    pub last_updated: Option<Instant>,
}

impl RobotSnapshot {
    /// A robot nobody has heard from yet.
    pub fn new(id: RobotId) -> Self {
        Self {
            display_name: format!("Robot {}", id),
            id,
            status: RobotStatus::Unreachable,
            telemetry: BTreeMap::new(),
            attributes: BTreeMap::new(),
            coordinates: None,
            last_updated: None,
        }
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.telemetry.get(name).copied()
    }
}
