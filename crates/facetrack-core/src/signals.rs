//! Inbound control signals, parsed from JSON at the process boundary.
//!
//! Everything that reaches the pipeline is one of the closed [`Signal`]
//! variants; anything else is rejected here with a [`SignalError`] and never
//! touches tracking state.

use crate::identity::EnrollError;
use crate::types::UserId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot read enrollment image {path}: {source}")]
    Image {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("enrollment failed: {0}")]
    Enroll(#[from] EnrollError),

    #[error("pipeline is shut down")]
    ShutDown,
}

/// Tracking mode. Frames are only processed in [`Mode::AiTracking`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    AiTracking,
    ManualControl,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::AiTracking => "ai_tracking",
            Mode::ManualControl => "manual_control",
        })
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ai_tracking" => Ok(Mode::AiTracking),
            "manual_control" => Ok(Mode::ManualControl),
            other => Err(format!("unknown mode {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct UserRef {
    user_id: UserId,
}

#[derive(Debug, Clone, Deserialize)]
struct RawSelection {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    selected_user_ids: Option<Vec<UserId>>,
    #[serde(default)]
    user_list: Option<Vec<UserRef>>,
}

/// A session selection. Accepts either `selected_user_ids: [..]` or the
/// companion-app shape `user_list: [{user_id, ..}]`. An empty list deselects.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawSelection")]
pub struct SessionSelection {
    pub session_id: Option<String>,
    pub user_ids: Vec<UserId>,
}

impl From<RawSelection> for SessionSelection {
    fn from(raw: RawSelection) -> Self {
        let user_ids = match (raw.selected_user_ids, raw.user_list) {
            (Some(ids), _) => ids,
            (None, Some(list)) => list.into_iter().map(|u| u.user_id).collect(),
            (None, None) => Vec::new(),
        };
        Self { session_id: raw.session_id, user_ids }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideAction {
    #[serde(alias = "pause")]
    Start,
    #[serde(alias = "resume")]
    End,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ManualOverride {
    pub action: OverrideAction,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub rotation_angle: Option<f32>,
    #[serde(default)]
    pub duration_seconds: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EnrollRequest {
    pub user_id: UserId,
    pub username: String,
    pub image_path: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    SelectSession(SessionSelection),
    Deselect,
    ManualOverride(ManualOverride),
    Enroll(EnrollRequest),
    SetMode { mode: Mode },
}

fn payload<T: DeserializeOwned>(kind: &'static str, json: &str) -> Result<T, SignalError> {
    serde_json::from_str(json).map_err(|source| SignalError::Malformed { kind, source })
}

impl Signal {
    /// Parse a self-describing signal: `{"type": "select_session", ...}`.
    pub fn parse(json: &str) -> Result<Self, SignalError> {
        payload("signal", json)
    }

    /// Session-select payload. A blank payload is a deselect.
    pub fn select_from_json(json: &str) -> Result<Self, SignalError> {
        if json.trim().is_empty() {
            return Ok(Signal::Deselect);
        }
        payload("session", json).map(Signal::SelectSession)
    }

    pub fn override_from_json(json: &str) -> Result<Self, SignalError> {
        payload("manual override", json).map(Signal::ManualOverride)
    }

    pub fn enroll_from_json(json: &str) -> Result<Self, SignalError> {
        payload("enrollment", json).map(Signal::Enroll)
    }

    /// Mode payload: `{"mode": "manual_control"}` or a bare mode name.
    pub fn mode_from_json(json: &str) -> Result<Self, SignalError> {
        #[derive(Deserialize)]
        struct ModePayload {
            mode: Mode,
        }

        if let Ok(mode) = json.trim().parse::<Mode>() {
            return Ok(Signal::SetMode { mode });
        }
        payload::<ModePayload>("mode", json).map(|p| Signal::SetMode { mode: p.mode })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Signal::SelectSession(_) => "select_session",
            Signal::Deselect => "deselect",
            Signal::ManualOverride(_) => "manual_override",
            Signal::Enroll(_) => "enroll",
            Signal::SetMode { .. } => "set_mode",
        }
    }
}

/// Positive acknowledgment of an applied signal. Invalid transitions are
/// still acknowledged; `applied` says whether anything changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "ack", rename_all = "snake_case")]
pub enum Ack {
    SessionSelected { selected: usize, candidates_loaded: usize },
    Deselected { changed: bool },
    OverrideStarted { applied: bool },
    OverrideEnded { applied: bool, paused_duration_seconds: Option<f64> },
    Enrolled { user_id: UserId },
    ModeSet { mode: Mode, changed: bool },
}

impl Ack {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_accepts_both_shapes() {
        let direct = Signal::select_from_json(
            r#"{"session_id": "s1", "selected_user_ids": ["a", "b"]}"#,
        )
        .unwrap();
        let companion = Signal::select_from_json(
            r#"{"session_id": "s1", "user_list": [{"user_id": "a", "username": "A"}, {"user_id": "b"}]}"#,
        )
        .unwrap();
        assert_eq!(direct, companion);
        match direct {
            Signal::SelectSession(sel) => {
                assert_eq!(sel.session_id.as_deref(), Some("s1"));
                assert_eq!(sel.user_ids, vec!["a", "b"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_blank_select_is_deselect() {
        assert_eq!(Signal::select_from_json("  ").unwrap(), Signal::Deselect);
        match Signal::select_from_json(r#"{"session_id": null, "user_list": []}"#).unwrap() {
            Signal::SelectSession(sel) => assert!(sel.user_ids.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_override_aliases() {
        let start = Signal::override_from_json(
            r#"{"action": "pause", "user_id": "op", "rotation_angle": 30.0}"#,
        )
        .unwrap();
        match start {
            Signal::ManualOverride(o) => {
                assert_eq!(o.action, OverrideAction::Start);
                assert_eq!(o.rotation_angle, Some(30.0));
                assert_eq!(o.duration_seconds, None);
            }
            other => panic!("unexpected {other:?}"),
        }
        match Signal::override_from_json(r#"{"action": "resume"}"#).unwrap() {
            Signal::ManualOverride(o) => assert_eq!(o.action, OverrideAction::End),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_override_action_rejected() {
        let err = Signal::override_from_json(r#"{"action": "spin"}"#).unwrap_err();
        assert!(matches!(err, SignalError::Malformed { kind: "manual override", .. }));
    }

    #[test]
    fn test_enroll_requires_all_fields() {
        assert!(Signal::enroll_from_json(r#"{"user_id": "a", "username": "A"}"#).is_err());
        let ok = Signal::enroll_from_json(
            r#"{"user_id": "a", "username": "A", "image_path": "/tmp/a.jpg"}"#,
        )
        .unwrap();
        assert_eq!(ok.kind(), "enroll");
    }

    #[test]
    fn test_mode_payload_forms() {
        assert_eq!(
            Signal::mode_from_json("manual_control").unwrap(),
            Signal::SetMode { mode: Mode::ManualControl }
        );
        assert_eq!(
            Signal::mode_from_json(r#"{"mode": "ai_tracking"}"#).unwrap(),
            Signal::SetMode { mode: Mode::AiTracking }
        );
        assert!(Signal::mode_from_json(r#"{"mode": "autopilot"}"#).is_err());
    }

    #[test]
    fn test_tagged_parse_rejects_unknown_variant() {
        assert_eq!(Signal::parse(r#"{"type": "deselect"}"#).unwrap(), Signal::Deselect);
        assert!(Signal::parse(r#"{"type": "reboot"}"#).is_err());
        assert!(Signal::parse("not json").is_err());
    }

    #[test]
    fn test_ack_json() {
        let ack = Ack::ModeSet { mode: Mode::ManualControl, changed: true };
        let value: serde_json::Value = serde_json::from_str(&ack.to_json()).unwrap();
        assert_eq!(value["ack"], "mode_set");
        assert_eq!(value["mode"], "manual_control");
    }
}
