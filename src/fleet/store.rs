use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use crate::fleet::state::{ApplyOutcome, FleetSnapshot, FleetState, RosterEntry};
use crate::fleet::types::RobotId;
use crate::protocol::{epoch_millis, FleetEvent};

/// Default number of events kept in the display log.
pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 1000;

const EVENT_BROADCAST_CAPACITY: usize = 256;

/// One entry of the event log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggedEvent {
    /// Monotonic sequence number, starting at 1.
    pub seq: u64,
    /// Wall-clock receive time in milliseconds since the Unix epoch.
    pub received_at_ms: u64,
    pub event: FleetEvent,
}

struct Inner {
    state: FleetState,
    log: VecDeque<LoggedEvent>,
    log_capacity: usize,
    next_seq: u64,
}

/// The shared fleet state.
///
/// Every mutation (event application, staleness sweep, roster seeding)
/// happens under one lock, and the resulting snapshot is published to
/// subscribers before the lock is released, so observers see snapshots in
/// the order mutations happened.
#[derive(Clone)]
pub struct FleetStore {
    inner: Arc<Mutex<Inner>>,
    snapshots: Arc<watch::Sender<Arc<FleetSnapshot>>>,
    events: broadcast::Sender<LoggedEvent>,
}

impl Default for FleetStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FleetStore {
    pub fn new() -> Self {
        Self::with_log_capacity(DEFAULT_EVENT_LOG_CAPACITY)
    }

    /// A store whose event log keeps at most `capacity` entries. Zero
    /// disables the log.
    pub fn with_log_capacity(capacity: usize) -> Self {
        let (snapshots, _) = watch::channel(Arc::new(FleetSnapshot::default()));
        let (events, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: FleetState::new(),
                log: VecDeque::with_capacity(capacity.min(DEFAULT_EVENT_LOG_CAPACITY)),
                log_capacity: capacity,
                next_seq: 1,
            })),
            snapshots: Arc::new(snapshots),
            events,
        }
    }

    /// Apply one event received now.
    pub fn apply(&self, event: FleetEvent) -> ApplyOutcome {
        self.apply_at(event, Instant::now())
    }

    /// Apply one event as of `now`.
    pub fn apply_at(&self, event: FleetEvent, now: Instant) -> ApplyOutcome {
        let mut inner = self.inner.lock();
        let outcome = inner.state.apply(&event, now);
        if !outcome.changed() {
            tracing::debug!("dropping telemetry with no robot to attribute it to");
            return outcome;
        }

        let entry = LoggedEvent {
            seq: inner.next_seq,
            received_at_ms: epoch_millis(SystemTime::now()),
            event,
        };
        inner.next_seq += 1;
        if inner.log_capacity > 0 {
            if inner.log.len() == inner.log_capacity {
                inner.log.pop_front();
            }
            inner.log.push_back(entry.clone());
        }

        self.publish(&inner.state);
        // No receivers is fine.
        let _ = self.events.send(entry);
        outcome
    }

    /// Demote robots silent for longer than `window`. Returns the demoted ids.
    pub fn sweep_stale(&self, window: Duration) -> Vec<RobotId> {
        self.sweep_stale_at(window, Instant::now())
    }

    pub fn sweep_stale_at(&self, window: Duration, now: Instant) -> Vec<RobotId> {
        let mut inner = self.inner.lock();
        let demoted = inner.state.demote_stale(window, now);
        if !demoted.is_empty() {
            self.publish(&inner.state);
        }
        demoted
    }

    /// Add roster robots that are not known yet.
    pub fn seed(&self, roster: impl IntoIterator<Item = RosterEntry>) -> usize {
        let mut inner = self.inner.lock();
        let added = inner.state.seed(roster);
        if added > 0 {
            self.publish(&inner.state);
        }
        added
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<FleetSnapshot> {
        self.snapshots.borrow().clone()
    }

    /// Receiver that is notified after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<Arc<FleetSnapshot>> {
        self.snapshots.subscribe()
    }

    /// Copy of the event log, oldest first.
    pub fn event_log(&self) -> Vec<LoggedEvent> {
        self.inner.lock().log.iter().cloned().collect()
    }

    /// Live feed of logged events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<LoggedEvent> {
        self.events.subscribe()
    }

    /// Run `f` against the locked state. Used to check aggregates against
    /// a recomputation.
    pub fn inspect<R>(&self, f: impl FnOnce(&FleetState) -> R) -> R {
        f(&self.inner.lock().state)
    }

    fn publish(&self, state: &FleetState) {
        self.snapshots.send_replace(Arc::new(state.snapshot()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::types::RobotStatus;
    use crate::protocol::{decode_frame, TelemetryUpdate};

    fn frame(text: &str) -> FleetEvent {
        decode_frame(text)
            .and_then(|e| e.into_fleet_event())
            .expect("frame should decode to a fleet event")
    }

    #[tokio::test]
    async fn subscribers_see_each_apply() {
        let store = FleetStore::new();
        let mut rx = store.subscribe();

        store.apply(frame(r#"{"robot_id":1,"status":"AVAILABLE"}"#));
        rx.changed().await.unwrap();
        let snap = rx.borrow_and_update().clone();
        assert_eq!(snap.count(RobotStatus::Available), 1);
        assert_eq!(snap.total_connected, 1);
    }

    #[tokio::test]
    async fn unattributed_telemetry_is_not_published() {
        let store = FleetStore::new();
        let rx = store.subscribe();
        let outcome = store.apply(FleetEvent::Telemetry(TelemetryUpdate::default().with_metric("x", 1.0)));
        assert_eq!(outcome, ApplyOutcome::Unattributed);
        assert!(!rx.has_changed().unwrap());
        assert!(store.event_log().is_empty());
    }

    #[test]
    fn event_log_is_bounded_and_ordered() {
        let store = FleetStore::with_log_capacity(2);
        for cpu in 1..=3 {
            store.apply(FleetEvent::Telemetry(
                TelemetryUpdate::for_robot(1u64).with_metric("cpu_usage", cpu as f64),
            ));
        }
        let log = store.event_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].seq, 2);
        assert_eq!(log[1].seq, 3);
    }

    #[test]
    fn zero_capacity_disables_log() {
        let store = FleetStore::with_log_capacity(0);
        store.apply(frame(r#"{"robot_id":1}"#));
        assert!(store.event_log().is_empty());
        assert_eq!(store.snapshot().robots.len(), 1);
    }

    #[tokio::test]
    async fn event_feed_receives_entries() {
        let store = FleetStore::new();
        let mut feed = store.subscribe_events();
        store.apply(frame(
            r#"{"type":"robot_status_summary","statuses":{"AVAILABLE":1}}"#,
        ));
        let entry = feed.recv().await.unwrap();
        assert_eq!(entry.seq, 1);
        assert!(matches!(entry.event, FleetEvent::StatusSummary(_)));
    }

    #[tokio::test]
    async fn sweep_publishes_only_on_change() {
        let store = FleetStore::new();
        let t0 = Instant::now();
        store.apply_at(frame(r#"{"robot_id":1,"status":"AVAILABLE"}"#), t0);
        let mut rx = store.subscribe();
        rx.borrow_and_update();

        assert!(store
            .sweep_stale_at(Duration::from_secs(10), t0 + Duration::from_secs(5))
            .is_empty());
        assert!(!rx.has_changed().unwrap());

        let demoted = store.sweep_stale_at(Duration::from_secs(10), t0 + Duration::from_secs(11));
        assert_eq!(demoted, vec![RobotId::from(1u64)]);
        assert!(rx.has_changed().unwrap());
        assert_eq!(
            store.snapshot().robot(&RobotId::from(1u64)).unwrap().status,
            RobotStatus::Unreachable
        );
    }

    #[test]
    fn aggregates_match_recomputation() {
        let store = FleetStore::new();
        for text in [
            r#"{"robot_id":1,"status":"AVAILABLE"}"#,
            r#"{"robot_id":2,"status":"IN_OPERATION"}"#,
            r#"{"robot_id":1,"status":"CHARGING"}"#,
        ] {
            store.apply(frame(text));
            store.inspect(|state| {
                assert_eq!(state.status_counts(), &state.derived_counts());
            });
        }
    }
}
