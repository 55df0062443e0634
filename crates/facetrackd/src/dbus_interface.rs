use crate::engine::{EngineError, EngineHandle};
use facetrack_core::{Signal, SignalError};
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.ambient.FaceTrack1";
pub const OBJECT_PATH: &str = "/org/ambient/FaceTrack1";

/// D-Bus interface for the face tracking daemon.
///
/// Bus name: org.ambient.FaceTrack1
/// Object path: /org/ambient/FaceTrack1
///
/// Every method takes a JSON payload and answers with a JSON acknowledgment.
/// Engine events are broadcast as `TrackingEvent` signals.
pub struct FaceTrackService {
    engine: EngineHandle,
}

impl FaceTrackService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }

    async fn apply(&self, parsed: Result<Signal, SignalError>) -> zbus::fdo::Result<String> {
        let signal = parsed.map_err(|e| {
            tracing::warn!(error = %e, "malformed signal ignored");
            to_fdo(EngineError::Signal(e))
        })?;
        tracing::info!(kind = signal.kind(), "signal received");
        let ack = self.engine.signal(signal).await.map_err(to_fdo)?;
        Ok(ack.to_json())
    }
}

fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    match err {
        EngineError::Signal(e @ SignalError::Malformed { .. }) => {
            zbus::fdo::Error::InvalidArgs(e.to_string())
        }
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

#[interface(name = "org.ambient.FaceTrack1")]
impl FaceTrackService {
    /// Replace the active session: `{session_id, selected_user_ids}` or
    /// `{session_id, user_list: [{user_id}]}`. An empty list deselects.
    async fn select_session(&self, payload: &str) -> zbus::fdo::Result<String> {
        self.apply(Signal::select_from_json(payload)).await
    }

    /// Clear the active session.
    async fn deselect(&self) -> zbus::fdo::Result<String> {
        self.apply(Ok(Signal::Deselect)).await
    }

    /// Manual override: `{action: start|end, user_id, rotation_angle?, duration_seconds?}`.
    async fn manual_control(&self, payload: &str) -> zbus::fdo::Result<String> {
        self.apply(Signal::override_from_json(payload)).await
    }

    /// Enroll or re-enroll a user: `{user_id, username, image_path}`.
    async fn register(&self, payload: &str) -> zbus::fdo::Result<String> {
        self.apply(Signal::enroll_from_json(payload)).await
    }

    /// Switch between `ai_tracking` and `manual_control`.
    async fn set_mode(&self, payload: &str) -> zbus::fdo::Result<String> {
        self.apply(Signal::mode_from_json(payload)).await
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "pipeline": status,
        })
        .to_string())
    }

    /// One engine event, serialized as JSON.
    #[zbus(signal)]
    pub async fn tracking_event(emitter: &SignalEmitter<'_>, payload: &str) -> zbus::Result<()>;
}
