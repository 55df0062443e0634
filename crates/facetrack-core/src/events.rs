use crate::types::UserId;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Why a tracking session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    SwitchedUser,
    SessionEnded,
    FaceLost,
    ModeChanged,
    Shutdown,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EndReason::SwitchedUser => "switched_user",
            EndReason::SessionEnded => "session_ended",
            EndReason::FaceLost => "face_lost",
            EndReason::ModeChanged => "mode_changed",
            EndReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

fn secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Everything the engine reports to the outside world.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum Event {
    FaceDetected {
        user_id: UserId,
        confidence: f32,
        x: f32,
        y: f32,
        timestamp: DateTime<Utc>,
    },
    FacePosition {
        user_id: UserId,
        x: f32,
        y: f32,
        timestamp: DateTime<Utc>,
    },
    FaceLost {
        user_id: UserId,
        #[serde(rename = "duration_seconds", serialize_with = "secs")]
        duration: Duration,
        timestamp: DateTime<Utc>,
    },
    TrackingStart {
        event_id: String,
        session_id: Option<String>,
        user_id: UserId,
        x: f32,
        y: f32,
        timestamp: DateTime<Utc>,
    },
    TrackingEnd {
        event_id: String,
        session_id: Option<String>,
        user_id: UserId,
        reason: EndReason,
        timestamp: DateTime<Utc>,
    },
    ManualOverrideStart {
        event_id: String,
        session_id: Option<String>,
        user_id: UserId,
        #[serde(skip_serializing_if = "Option::is_none")]
        rotation_angle: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_seconds: Option<f32>,
        timestamp: DateTime<Utc>,
    },
    ManualOverrideEnd {
        event_id: String,
        session_id: Option<String>,
        user_id: UserId,
        #[serde(rename = "paused_duration_seconds", serialize_with = "secs")]
        paused_duration: Duration,
        timestamp: DateTime<Utc>,
    },
    EmbeddingReady {
        user_id: UserId,
        username: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// Wire name of the variant (matches the JSON `event_type`).
    pub fn kind(&self) -> &'static str {
        match self {
            Event::FaceDetected { .. } => "face_detected",
            Event::FacePosition { .. } => "face_position",
            Event::FaceLost { .. } => "face_lost",
            Event::TrackingStart { .. } => "tracking_start",
            Event::TrackingEnd { .. } => "tracking_end",
            Event::ManualOverrideStart { .. } => "manual_override_start",
            Event::ManualOverrideEnd { .. } => "manual_override_end",
            Event::EmbeddingReady { .. } => "embedding_ready",
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, kind = self.kind(), "event serialization failed");
            String::new()
        })
    }
}

/// Receiver of engine events. Implementations must not block: events are
/// emitted while the session state lock is held, which is what keeps each
/// user's start/end and pause/resume in causal order.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Collects events in memory.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything emitted so far.
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Event kinds emitted so far, without draining.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(Event::kind)
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: Event) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}
