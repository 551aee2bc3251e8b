use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::fleet::types::{Coordinates, RobotId, RobotSnapshot, RobotStatus};
use crate::protocol::{FleetEvent, StatusSummary, TelemetryUpdate};

/// What an event did to the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Aggregate counts were replaced from a backend summary.
    Summary,
    /// A robot snapshot was created or merged into.
    Merged { created: bool },
    /// Telemetry with no robot id arrived before any identified telemetry.
    Unattributed,
}

impl ApplyOutcome {
    pub fn changed(self) -> bool {
        !matches!(self, Self::Unattributed)
    }
}

/// A robot known only from the backend roster.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub id: RobotId,
    pub display_name: Option<String>,
    pub coordinates: Option<Coordinates>,
}

/// Mutable fleet state. Not synchronised on its own; [`FleetStore`] wraps
/// it in the lock shared by event application and staleness sweeps.
///
/// [`FleetStore`]: crate::fleet::FleetStore
#[derive(Debug, Clone, Default)]
pub struct FleetState {
    robots: BTreeMap<RobotId, RobotSnapshot>,
    status_counts: BTreeMap<RobotStatus, u64>,
    total_connected: u64,
    /// Robot that unaddressed telemetry frames are merged into.
    current_robot: Option<RobotId>,
}

impl FleetState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn robots(&self) -> &BTreeMap<RobotId, RobotSnapshot> {
        &self.robots
    }

    pub fn robot(&self, id: &RobotId) -> Option<&RobotSnapshot> {
        self.robots.get(id)
    }

    pub fn status_counts(&self) -> &BTreeMap<RobotStatus, u64> {
        &self.status_counts
    }

    pub fn total_connected(&self) -> u64 {
        self.total_connected
    }

    pub fn current_robot(&self) -> Option<&RobotId> {
        self.current_robot.as_ref()
    }

    /// Apply one decoded event as of `now`.
    pub fn apply(&mut self, event: &FleetEvent, now: Instant) -> ApplyOutcome {
        match event {
            FleetEvent::StatusSummary(summary) => {
                self.apply_summary(summary);
                ApplyOutcome::Summary
            }
            FleetEvent::Telemetry(update) => self.apply_telemetry(update, now),
        }
    }

    fn apply_summary(&mut self, summary: &StatusSummary) {
        self.status_counts = summary.statuses.clone();
        self.total_connected = summary
            .connected_robots
            .unwrap_or_else(|| self.status_counts.values().sum());
    }

    fn apply_telemetry(&mut self, update: &TelemetryUpdate, now: Instant) -> ApplyOutcome {
        let id = match (&update.robot_id, &self.current_robot) {
            (Some(id), _) => id.clone(),
            (None, Some(current)) => current.clone(),
            (None, None) => return ApplyOutcome::Unattributed,
        };
        self.current_robot = Some(id.clone());

        let created = !self.robots.contains_key(&id);
        let robot = self
            .robots
            .entry(id.clone())
            .or_insert_with(|| RobotSnapshot::new(id));

        if let Some(name) = &update.display_name {
            robot.display_name = name.clone();
        }
        if let Some(status) = update.status {
            robot.status = status;
        }
        if let Some(coords) = update.coordinates {
            robot.coordinates = Some(coords);
        }
        for (name, value) in &update.metrics {
            robot.telemetry.insert(name.clone(), *value);
        }
        for (name, value) in &update.attributes {
            robot.attributes.insert(name.clone(), value.clone());
        }
        robot.last_updated = Some(now);

        self.recount();
        ApplyOutcome::Merged { created }
    }

    /// Insert roster robots that are not known yet. Returns how many were added.
    pub fn seed(&mut self, roster: impl IntoIterator<Item = RosterEntry>) -> usize {
        let mut added = 0;
        for entry in roster {
            if self.robots.contains_key(&entry.id) {
                continue;
            }
            let mut robot = RobotSnapshot::new(entry.id.clone());
            if let Some(name) = entry.display_name {
                robot.display_name = name;
            }
            robot.coordinates = entry.coordinates;
            self.robots.insert(entry.id, robot);
            added += 1;
        }
        if added > 0 {
            self.recount();
        }
        added
    }

    /// Demote every presumed-online robot that has been silent for longer
    /// than `window` to `Unreachable`. Returns the demoted ids.
    pub fn demote_stale(&mut self, window: Duration, now: Instant) -> Vec<RobotId> {
        let mut demoted = Vec::new();
        for robot in self.robots.values_mut() {
            if !robot.status.is_presumed_online() {
                continue;
            }
            let stale = match robot.last_updated {
                Some(at) => now.saturating_duration_since(at) > window,
                None => true,
            };
            if stale {
                robot.status = RobotStatus::Unreachable;
                demoted.push(robot.id.clone());
            }
        }
        if !demoted.is_empty() {
            self.recount();
        }
        demoted
    }

    /// Status counts computed directly from `robots`.
    pub fn derived_counts(&self) -> BTreeMap<RobotStatus, u64> {
        let mut counts = BTreeMap::new();
        for robot in self.robots.values() {
            *counts.entry(robot.status).or_insert(0) += 1;
        }
        counts
    }

    fn recount(&mut self) {
        self.status_counts = self.derived_counts();
        self.total_connected = self.status_counts.values().sum();
    }

    /// Immutable copy for subscribers.
    pub fn snapshot(&self) -> FleetSnapshot {
        FleetSnapshot {
            robots: self.robots.clone(),
            status_counts: self.status_counts.clone(),
            total_connected: self.total_connected,
        }
    }
}

/// Point-in-time, read-only view of the fleet.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FleetSnapshot {
    pub robots: BTreeMap<RobotId, RobotSnapshot>,
    /// Per-status counts. After a backend summary these are the backend's
    /// figures; the next telemetry merge, demotion, or roster seed replaces
    /// them with a recount of `robots`.
    pub status_counts: BTreeMap<RobotStatus, u64>,
    /// Robots counted as connected. Holds the summary's `connected_robots`
    /// only until the next telemetry frame, after which it is the number of
    /// robots in `robots`.
    pub total_connected: u64,
}

impl FleetSnapshot {
    pub fn robot(&self, id: &RobotId) -> Option<&RobotSnapshot> {
        self.robots.get(id)
    }

    pub fn count(&self, status: RobotStatus) -> u64 {
        self.status_counts.get(&status).copied().unwrap_or(0)
    }
}
