//! Serving-state machine: who the fan is following right now.
//!
//! ```text
//! idle ──detect──▶ tracking ──override start──▶ paused
//!   ▲                │  ▲ └─switch (end+start)─┘  │
//!   └── deselect / face lost / mode / shutdown ◀──┴── override end
//! ```
//!
//! All state lives behind one mutex. Every public method is a single
//! critical section, and events are handed to the sink before it is
//! released.
//!
//! A closed controller (manual control, shutdown) ignores detections until
//! it is reopened, so a frame still in flight when it closes cannot start a
//! new session.

use crate::events::{EndReason, Event, EventSink};
use crate::tracker::IdentifiedTrack;
use crate::types::{Point, UserId};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Longest gap without seeing the served user before it counts as lost.
    pub grace_period: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { grace_period: Duration::from_secs(5) }
    }
}

/// The externally selected set of users eligible for tracking.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Session {
    pub session_id: Option<String>,
    pub selected_user_ids: Vec<UserId>,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Tracking,
    Paused,
}

/// Details carried by a manual-override start.
#[derive(Debug, Clone, Default)]
pub struct OverrideRequest {
    pub user_id: Option<UserId>,
    pub rotation_angle: Option<f32>,
    pub duration_seconds: Option<f32>,
}

/// Position of the currently served user, reported while tracking.
#[derive(Debug, Clone, PartialEq)]
pub struct ServedFace {
    pub user_id: UserId,
    pub position: Point,
}

/// Serializable view of the controller.
#[derive(Debug, Clone, Serialize)]
pub struct TrackingSnapshot {
    pub state: Phase,
    pub current_user_id: Option<UserId>,
    pub current_event_id: Option<String>,
    pub session: Session,
    pub paused_for_seconds: Option<f64>,
}

#[derive(Debug, Clone)]
struct Serving {
    user_id: UserId,
    event_id: String,
    session_id: Option<String>,
    started_at: Instant,
}

/// The served user and its event id exist only inside the non-idle variants.
#[derive(Debug)]
enum ServingState {
    Idle,
    Tracking(Serving),
    Paused { serving: Serving, paused_at: Instant },
}

#[derive(Debug)]
struct TrackingState {
    serving: ServingState,
    last_detection: HashMap<UserId, Instant>,
    session: Session,
    closed: bool,
}

pub struct SessionController {
    config: SessionConfig,
    sink: Arc<dyn EventSink>,
    state: Mutex<TrackingState>,
}

impl SessionController {
    pub fn new(config: SessionConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            sink,
            state: Mutex::new(TrackingState {
                serving: ServingState::Idle,
                last_detection: HashMap::new(),
                session: Session::default(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the active session. An empty selection is a deselect.
    /// Ends the current tracking session if its user is no longer selected.
    /// Returns true when the selected-user set changed.
    pub fn select_session(
        &self,
        session_id: Option<String>,
        user_ids: Vec<UserId>,
    ) -> bool {
        let mut selected: Vec<UserId> = Vec::with_capacity(user_ids.len());
        for user in user_ids {
            if !selected.contains(&user) {
                selected.push(user);
            }
        }

        let mut st = self.lock();
        let changed = st.session.selected_user_ids != selected;
        let served_dropped = current_serving(&st.serving)
            .is_some_and(|s| !selected.contains(&s.user_id));

        let active = !selected.is_empty();
        st.last_detection.retain(|user, _| selected.contains(user));
        st.session = Session {
            session_id: if active { session_id } else { None },
            selected_user_ids: selected,
            active,
        };
        tracing::info!(
            session_id = ?st.session.session_id,
            users = ?st.session.selected_user_ids,
            "session selected"
        );

        if served_dropped {
            self.finish(&mut st, EndReason::SessionEnded);
        }
        changed
    }

    /// Clear the session and stop serving. Returns true if anything was selected.
    pub fn deselect(&self) -> bool {
        self.select_session(None, Vec::new())
    }

    pub fn session(&self) -> Session {
        self.lock().session.clone()
    }

    pub fn selected_users(&self) -> Vec<UserId> {
        self.lock().session.selected_user_ids.clone()
    }

    /// React to the currently identified tracks (ascending track id).
    ///
    /// Refreshes the liveness clock of every selected user seen, starts
    /// serving the first selected user when idle, and switches user when the
    /// served one is no longer among them. Paused sessions never transition.
    /// Returns the served user's position while tracking.
    pub fn on_detections(&self, tracks: &[IdentifiedTrack], now: Instant) -> Option<ServedFace> {
        let mut st = self.lock();
        if st.closed {
            return None;
        }
        let selected: Vec<&IdentifiedTrack> = tracks
            .iter()
            .filter(|t| st.session.selected_user_ids.contains(&t.user_id))
            .collect();

        for track in &selected {
            st.last_detection.insert(track.user_id.clone(), now);
        }

        let first = selected.first().copied();
        match &st.serving {
            ServingState::Paused { .. } => return None,
            ServingState::Idle => {
                if let Some(track) = first {
                    self.begin(&mut st, track, now);
                }
            }
            ServingState::Tracking(serving) => {
                let still_seen = selected.iter().any(|t| t.user_id == serving.user_id);
                if let (false, Some(track)) = (still_seen, first) {
                    self.finish(&mut st, EndReason::SwitchedUser);
                    self.begin(&mut st, track, now);
                }
            }
        }

        let ServingState::Tracking(serving) = &st.serving else {
            return None;
        };
        selected
            .iter()
            .find(|t| t.user_id == serving.user_id)
            .map(|t| ServedFace { user_id: t.user_id.clone(), position: t.center })
    }

    /// Manual override begins: tracking → paused. No-op in any other state.
    pub fn start_override(&self, request: &OverrideRequest, now: Instant) -> bool {
        let mut st = self.lock();
        let ServingState::Tracking(serving) = &st.serving else {
            tracing::debug!(requested_by = ?request.user_id, "override start ignored: not tracking");
            return false;
        };
        let serving = serving.clone();

        tracing::info!(
            user_id = %serving.user_id,
            event_id = %serving.event_id,
            requested_by = ?request.user_id,
            "tracking paused by manual override"
        );
        self.sink.emit(Event::ManualOverrideStart {
            event_id: serving.event_id.clone(),
            session_id: serving.session_id.clone(),
            user_id: serving.user_id.clone(),
            rotation_angle: request.rotation_angle,
            duration_seconds: request.duration_seconds,
            timestamp: Utc::now(),
        });
        st.serving = ServingState::Paused { serving, paused_at: now };
        true
    }

    /// Manual override ends: paused → tracking. Returns the paused duration,
    /// or `None` when not paused.
    pub fn end_override(&self, now: Instant) -> Option<Duration> {
        let mut st = self.lock();
        let ServingState::Paused { serving, paused_at } = &st.serving else {
            tracing::debug!("override end ignored: not paused");
            return None;
        };

        let paused_duration = now.saturating_duration_since(*paused_at);
        let serving = serving.clone();
        tracing::info!(
            user_id = %serving.user_id,
            paused_secs = paused_duration.as_secs_f64(),
            "tracking resumed after manual override"
        );
        self.sink.emit(Event::ManualOverrideEnd {
            event_id: serving.event_id.clone(),
            session_id: serving.session_id.clone(),
            user_id: serving.user_id.clone(),
            paused_duration,
            timestamp: Utc::now(),
        });
        st.serving = ServingState::Tracking(serving);
        Some(paused_duration)
    }

    /// Liveness check: end tracking with `face_lost` if the served user has
    /// not been seen for longer than the grace period. Returns true if it did.
    pub fn check_liveness(&self, now: Instant) -> bool {
        let mut st = self.lock();
        let ServingState::Tracking(serving) = &st.serving else {
            return false;
        };

        let expired = st
            .last_detection
            .get(&serving.user_id)
            .is_some_and(|last| now.saturating_duration_since(*last) > self.config.grace_period);
        if !expired {
            return false;
        }

        let user_id = serving.user_id.clone();
        let duration = now.saturating_duration_since(serving.started_at);
        tracing::info!(user_id = %user_id, "served face lost");
        self.sink.emit(Event::FaceLost { user_id, duration, timestamp: Utc::now() });
        self.finish(&mut st, EndReason::FaceLost)
    }

    /// End any tracking session with `reason` and ignore detections until
    /// [`reopen`](Self::reopen). Returns true if a session was ended.
    pub fn close(&self, reason: EndReason) -> bool {
        let mut st = self.lock();
        if !st.closed {
            tracing::debug!(%reason, "session controller closed");
        }
        st.closed = true;
        self.finish(&mut st, reason)
    }

    pub fn reopen(&self) {
        let mut st = self.lock();
        if st.closed {
            tracing::debug!("session controller reopened");
        }
        st.closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn phase(&self) -> Phase {
        phase_of(&self.lock().serving)
    }

    pub fn is_tracking(&self) -> bool {
        self.phase() == Phase::Tracking
    }

    pub fn is_paused(&self) -> bool {
        self.phase() == Phase::Paused
    }

    pub fn current_user(&self) -> Option<UserId> {
        current_serving(&self.lock().serving).map(|s| s.user_id.clone())
    }

    pub fn snapshot(&self, now: Instant) -> TrackingSnapshot {
        let st = self.lock();
        let serving = current_serving(&st.serving);
        let paused_for_seconds = match &st.serving {
            ServingState::Paused { paused_at, .. } => {
                Some(now.saturating_duration_since(*paused_at).as_secs_f64())
            }
            _ => None,
        };
        TrackingSnapshot {
            state: phase_of(&st.serving),
            current_user_id: serving.map(|s| s.user_id.clone()),
            current_event_id: serving.map(|s| s.event_id.clone()),
            session: st.session.clone(),
            paused_for_seconds,
        }
    }

    fn begin(&self, st: &mut TrackingState, track: &IdentifiedTrack, now: Instant) {
        let serving = Serving {
            user_id: track.user_id.clone(),
            event_id: Uuid::new_v4().to_string(),
            session_id: st.session.session_id.clone(),
            started_at: now,
        };
        st.last_detection.insert(serving.user_id.clone(), now);
        tracing::info!(
            user_id = %serving.user_id,
            event_id = %serving.event_id,
            session_id = ?serving.session_id,
            "tracking started"
        );
        self.sink.emit(Event::TrackingStart {
            event_id: serving.event_id.clone(),
            session_id: serving.session_id.clone(),
            user_id: serving.user_id.clone(),
            x: track.center.x,
            y: track.center.y,
            timestamp: Utc::now(),
        });
        st.serving = ServingState::Tracking(serving);
    }

    fn finish(&self, st: &mut TrackingState, reason: EndReason) -> bool {
        let serving = match std::mem::replace(&mut st.serving, ServingState::Idle) {
            ServingState::Tracking(serving) | ServingState::Paused { serving, .. } => serving,
            ServingState::Idle => return false,
        };
        tracing::info!(user_id = %serving.user_id, event_id = %serving.event_id, %reason, "tracking ended");
        self.sink.emit(Event::TrackingEnd {
            event_id: serving.event_id,
            session_id: serving.session_id,
            user_id: serving.user_id,
            reason,
            timestamp: Utc::now(),
        });
        true
    }
}

fn phase_of(serving: &ServingState) -> Phase {
    match serving {
        ServingState::Idle => Phase::Idle,
        ServingState::Tracking(_) => Phase::Tracking,
        ServingState::Paused { .. } => Phase::Paused,
    }
}

fn current_serving(serving: &ServingState) -> Option<&Serving> {
    match serving {
        ServingState::Idle => None,
        ServingState::Tracking(s) | ServingState::Paused { serving: s, .. } => Some(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;

    fn controller() -> (SessionController, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let ctl = SessionController::new(SessionConfig::default(), sink.clone());
        (ctl, sink)
    }

    fn seen(track_id: u64, user: &str, x: f32) -> IdentifiedTrack {
        IdentifiedTrack {
            track_id,
            user_id: user.to_string(),
            confidence: 0.5,
            center: Point::new(x, 100.0),
        }
    }

    fn end_reasons(events: &[Event]) -> Vec<EndReason> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::TrackingEnd { reason, .. } => Some(*reason),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_idle_starts_tracking_first_selected() {
        let (ctl, sink) = controller();
        let t0 = Instant::now();
        ctl.select_session(Some("s1".into()), vec!["alice".into(), "bob".into()]);

        let served = ctl.on_detections(&[seen(1, "carol", 10.0), seen(2, "bob", 20.0)], t0);
        assert_eq!(served.unwrap().user_id, "bob");
        assert_eq!(ctl.phase(), Phase::Tracking);

        let events = sink.take();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::TrackingStart { user_id, session_id, x, .. } => {
                assert_eq!(user_id, "bob");
                assert_eq!(session_id.as_deref(), Some("s1"));
                assert_eq!(*x, 20.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_no_session_no_tracking() {
        let (ctl, sink) = controller();
        assert!(ctl.on_detections(&[seen(1, "alice", 0.0)], Instant::now()).is_none());
        assert_eq!(ctl.phase(), Phase::Idle);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_same_user_keeps_session() {
        let (ctl, sink) = controller();
        let t0 = Instant::now();
        ctl.select_session(None, vec!["alice".into()]);
        ctl.on_detections(&[seen(1, "alice", 0.0)], t0);
        let first = ctl.snapshot(t0).current_event_id;
        ctl.on_detections(&[seen(1, "alice", 5.0)], t0 + Duration::from_secs(1));
        assert_eq!(ctl.snapshot(t0).current_event_id, first);
        assert_eq!(sink.kinds(), vec!["tracking_start"]);
    }

    #[test]
    fn test_switch_emits_one_end_then_one_start() {
        let (ctl, sink) = controller();
        let t0 = Instant::now();
        ctl.select_session(None, vec!["alice".into(), "bob".into()]);
        ctl.on_detections(&[seen(1, "alice", 0.0)], t0);
        let alice_event = ctl.snapshot(t0).current_event_id.unwrap();
        sink.take();

        ctl.on_detections(&[seen(2, "bob", 50.0)], t0 + Duration::from_secs(1));
        let events = sink.take();
        assert_eq!(events.len(), 2);
        match (&events[0], &events[1]) {
            (
                Event::TrackingEnd { event_id, user_id, reason, .. },
                Event::TrackingStart { event_id: new_id, user_id: new_user, .. },
            ) => {
                assert_eq!(event_id, &alice_event);
                assert_eq!(user_id, "alice");
                assert_eq!(*reason, EndReason::SwitchedUser);
                assert_eq!(new_user, "bob");
                assert_ne!(new_id, &alice_event);
            }
            other => panic!("unexpected events {other:?}"),
        }
        assert_eq!(ctl.current_user().as_deref(), Some("bob"));
    }

    #[test]
    fn test_empty_detections_do_not_switch() {
        let (ctl, sink) = controller();
        let t0 = Instant::now();
        ctl.select_session(None, vec!["alice".into()]);
        ctl.on_detections(&[seen(1, "alice", 0.0)], t0);
        assert!(ctl.on_detections(&[], t0 + Duration::from_secs(1)).is_none());
        assert_eq!(ctl.phase(), Phase::Tracking);
        assert_eq!(sink.kinds(), vec!["tracking_start"]);
    }

    #[test]
    fn test_deselect_ends_session() {
        let (ctl, sink) = controller();
        let t0 = Instant::now();
        ctl.select_session(Some("s1".into()), vec!["alice".into()]);
        ctl.on_detections(&[seen(1, "alice", 0.0)], t0);
        sink.take();

        assert!(ctl.deselect());
        assert_eq!(ctl.phase(), Phase::Idle);
        assert_eq!(end_reasons(&sink.take()), vec![EndReason::SessionEnded]);
        assert!(!ctl.session().active);

        // Already idle: nothing more to end.
        assert!(!ctl.deselect());
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_reselect_dropping_served_user_ends_session() {
        let (ctl, sink) = controller();
        let t0 = Instant::now();
        ctl.select_session(None, vec!["alice".into(), "bob".into()]);
        ctl.on_detections(&[seen(1, "alice", 0.0)], t0);
        sink.take();

        assert!(ctl.select_session(Some("s2".into()), vec!["bob".into()]));
        assert_eq!(ctl.phase(), Phase::Idle);
        assert_eq!(end_reasons(&sink.take()), vec![EndReason::SessionEnded]);
    }

    #[test]
    fn test_reselect_keeping_served_user_continues() {
        let (ctl, sink) = controller();
        let t0 = Instant::now();
        ctl.select_session(None, vec!["alice".into()]);
        ctl.on_detections(&[seen(1, "alice", 0.0)], t0);
        sink.take();

        assert!(ctl.select_session(None, vec!["alice".into(), "bob".into()]));
        assert!(!ctl.select_session(None, vec!["alice".into(), "bob".into(), "alice".into()]));
        assert_eq!(ctl.phase(), Phase::Tracking);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_override_pause_and_resume() {
        let (ctl, sink) = controller();
        let t0 = Instant::now();
        ctl.select_session(None, vec!["alice".into(), "bob".into()]);
        ctl.on_detections(&[seen(1, "alice", 0.0)], t0);
        let event_id = ctl.snapshot(t0).current_event_id.unwrap();
        sink.take();

        let request = OverrideRequest {
            user_id: Some("operator".into()),
            rotation_angle: Some(15.0),
            duration_seconds: Some(2.0),
        };
        assert!(ctl.start_override(&request, t0 + Duration::from_secs(1)));
        assert_eq!(ctl.phase(), Phase::Paused);

        // Paused: another selected user does not trigger a switch.
        assert!(ctl.on_detections(&[seen(2, "bob", 9.0)], t0 + Duration::from_secs(2)).is_none());
        assert_eq!(ctl.current_user().as_deref(), Some("alice"));

        let paused = ctl.end_override(t0 + Duration::from_secs(4)).unwrap();
        assert_eq!(paused, Duration::from_secs(3));
        assert_eq!(ctl.phase(), Phase::Tracking);

        let events = sink.take();
        assert_eq!(events.len(), 2);
        match &events[0] {
            Event::ManualOverrideStart { event_id: id, rotation_angle, .. } => {
                assert_eq!(id, &event_id);
                assert_eq!(*rotation_angle, Some(15.0));
            }
            other => panic!("unexpected event {other:?}"),
        }
        match &events[1] {
            Event::ManualOverrideEnd { event_id: id, paused_duration, .. } => {
                assert_eq!(id, &event_id);
                assert_eq!(*paused_duration, Duration::from_secs(3));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_invalid_override_transitions_are_noops() {
        let (ctl, sink) = controller();
        let t0 = Instant::now();
        assert!(!ctl.start_override(&OverrideRequest::default(), t0));
        assert!(ctl.end_override(t0).is_none());

        ctl.select_session(None, vec!["alice".into()]);
        ctl.on_detections(&[seen(1, "alice", 0.0)], t0);
        assert!(ctl.end_override(t0).is_none());
        assert!(ctl.start_override(&OverrideRequest::default(), t0));
        assert!(!ctl.start_override(&OverrideRequest::default(), t0));
        assert_eq!(ctl.phase(), Phase::Paused);
        assert_eq!(sink.kinds(), vec!["tracking_start", "manual_override_start"]);
    }

    #[test]
    fn test_liveness_ends_with_face_lost() {
        let (ctl, sink) = controller();
        let t0 = Instant::now();
        ctl.select_session(None, vec!["alice".into()]);
        ctl.on_detections(&[seen(1, "alice", 0.0)], t0);
        ctl.on_detections(&[seen(1, "alice", 0.0)], t0 + Duration::from_secs(2));
        sink.take();

        assert!(!ctl.check_liveness(t0 + Duration::from_secs(7)));
        assert!(ctl.check_liveness(t0 + Duration::from_secs(8)));
        assert_eq!(ctl.phase(), Phase::Idle);

        let events = sink.take();
        assert_eq!(events.len(), 2);
        match &events[0] {
            Event::FaceLost { user_id, duration, .. } => {
                assert_eq!(user_id, "alice");
                assert_eq!(*duration, Duration::from_secs(8));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(end_reasons(&events), vec![EndReason::FaceLost]);
    }

    #[test]
    fn test_liveness_ignores_paused() {
        let (ctl, sink) = controller();
        let t0 = Instant::now();
        ctl.select_session(None, vec!["alice".into()]);
        ctl.on_detections(&[seen(1, "alice", 0.0)], t0);
        ctl.start_override(&OverrideRequest::default(), t0);
        assert!(!ctl.check_liveness(t0 + Duration::from_secs(60)));
        assert_eq!(ctl.phase(), Phase::Paused);
        assert_eq!(sink.kinds(), vec!["tracking_start", "manual_override_start"]);
    }

    #[test]
    fn test_close_ends_paused_session() {
        let (ctl, sink) = controller();
        let t0 = Instant::now();
        ctl.select_session(None, vec!["alice".into()]);
        ctl.on_detections(&[seen(1, "alice", 0.0)], t0);
        ctl.start_override(&OverrideRequest::default(), t0);
        sink.take();

        assert!(ctl.close(EndReason::ModeChanged));
        assert!(!ctl.close(EndReason::ModeChanged));
        assert_eq!(end_reasons(&sink.take()), vec![EndReason::ModeChanged]);
    }

    #[test]
    fn test_closed_controller_ignores_detections() {
        let (ctl, sink) = controller();
        let t0 = Instant::now();
        ctl.select_session(None, vec!["alice".into()]);
        ctl.on_detections(&[seen(1, "alice", 0.0)], t0);
        sink.take();

        assert!(ctl.close(EndReason::ModeChanged));
        assert!(ctl.is_closed());
        assert!(ctl.on_detections(&[seen(1, "alice", 0.0)], t0 + Duration::from_secs(1)).is_none());
        assert_eq!(ctl.phase(), Phase::Idle);
        assert!(!ctl.close(EndReason::Shutdown));
        assert_eq!(end_reasons(&sink.take()), vec![EndReason::ModeChanged]);

        ctl.reopen();
        let served = ctl.on_detections(&[seen(1, "alice", 0.0)], t0 + Duration::from_secs(2));
        assert_eq!(served.unwrap().user_id, "alice");
        assert_eq!(sink.kinds(), vec!["tracking_start"]);
    }

    #[test]
    fn test_snapshot_serving_fields_set_together() {
        let (ctl, _sink) = controller();
        let t0 = Instant::now();
        let snap = ctl.snapshot(t0);
        assert!(snap.current_user_id.is_none() && snap.current_event_id.is_none());

        ctl.select_session(None, vec!["alice".into()]);
        ctl.on_detections(&[seen(1, "alice", 0.0)], t0);
        ctl.start_override(&OverrideRequest::default(), t0);
        let snap = ctl.snapshot(t0 + Duration::from_secs(2));
        assert_eq!(snap.state, Phase::Paused);
        assert!(snap.current_user_id.is_some() && snap.current_event_id.is_some());
        assert_eq!(snap.paused_for_seconds, Some(2.0));
    }
}
