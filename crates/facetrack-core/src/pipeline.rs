use crate::events::{EndReason, Event, EventSink};
use crate::identity::{Embedder, EmbeddingStore, IdentityResolver, ResolverConfig};
use crate::liveness::{LivenessConfig, LivenessMonitor};
use crate::merger::DetectionMerger;
use crate::session::{
    OverrideRequest, ServedFace, SessionConfig, SessionController, TrackingSnapshot,
};
use crate::signals::{Ack, EnrollRequest, Mode, OverrideAction, Signal, SignalError};
use crate::tracker::{TrackedDetection, Tracker, TrackerConfig};
use crate::types::{BoundingBox, UserId};
use chrono::Utc;
use image::{imageops, RgbImage};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub tracker: TrackerConfig,
    pub resolver: ResolverConfig,
    pub session: SessionConfig,
    pub liveness: LivenessConfig,
    /// Merger overlap threshold (intersection over smaller area).
    pub overlap_threshold: f32,
    /// Detections smaller than this (processing pixels²) are ignored.
    pub min_face_area: f32,
    pub identification_interval: Duration,
    /// Minimum spacing of `face_position` events.
    pub position_interval: Duration,
    pub initial_mode: Mode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            resolver: ResolverConfig::default(),
            session: SessionConfig::default(),
            liveness: LivenessConfig::default(),
            overlap_threshold: 0.3,
            min_face_area: 800.0,
            identification_interval: Duration::from_secs(1),
            position_interval: Duration::from_millis(100),
            initial_mode: Mode::AiTracking,
        }
    }
}

/// One captured frame with its raw detections.
///
/// Detections are in processing coordinates (`processing_width` ×
/// `processing_height`); `image` is the full-resolution frame that tracking
/// positions and face crops refer to.
#[derive(Debug, Clone)]
pub struct FrameInput {
    pub captured_at: Instant,
    pub image: RgbImage,
    pub processing_width: u32,
    pub processing_height: u32,
    pub detections: Vec<BoundingBox>,
}

/// What one call to [`FacePipeline::process_frame`] did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    pub skipped: bool,
    pub merged: usize,
    pub identified: usize,
    pub lost: usize,
    pub served: Option<ServedFace>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub mode: Mode,
    pub tracking: TrackingSnapshot,
    pub live_tracks: usize,
    pub candidates: Vec<UserId>,
    pub shut_down: bool,
}

#[derive(Debug, Default)]
struct Clocks {
    last_full_pass: Option<Instant>,
    last_position: Option<Instant>,
}

/// Owns every component and runs the detect, track, identify and react cycle.
///
/// The frame loop ([`process_frame`](Self::process_frame)), the signal
/// handler ([`handle_signal`](Self::handle_signal)) and the liveness tick
/// ([`liveness_tick`](Self::liveness_tick)) may run concurrently. Each
/// component serializes its own state; no two component locks are held at
/// once and none is held while an embedding is computed.
pub struct FacePipeline {
    config: PipelineConfig,
    merger: DetectionMerger,
    tracker: Tracker,
    resolver: IdentityResolver,
    session: Arc<SessionController>,
    liveness: LivenessMonitor,
    sink: Arc<dyn EventSink>,
    mode: Mutex<Mode>,
    clocks: Mutex<Clocks>,
    shut_down: AtomicBool,
}

impl FacePipeline {
    pub fn new(
        config: PipelineConfig,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn EmbeddingStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let session = Arc::new(SessionController::new(config.session, Arc::clone(&sink)));
        if config.initial_mode != Mode::AiTracking {
            session.close(EndReason::ModeChanged);
        }
        tracing::info!(
            mode = %config.initial_mode,
            max_match_distance = config.tracker.max_match_distance,
            similarity_threshold = config.resolver.similarity_threshold,
            grace_secs = config.session.grace_period.as_secs_f32(),
            "face pipeline created"
        );
        Self {
            merger: DetectionMerger::new(config.overlap_threshold),
            tracker: Tracker::new(config.tracker),
            resolver: IdentityResolver::new(config.resolver, embedder, store),
            liveness: LivenessMonitor::new(config.liveness, Arc::clone(&session)),
            session,
            sink,
            mode: Mutex::new(config.initial_mode),
            clocks: Mutex::new(Clocks::default()),
            shut_down: AtomicBool::new(false),
            config,
        }
    }

    pub fn mode(&self) -> Mode {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session(&self) -> &SessionController {
        &self.session
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    /// How often [`liveness_tick`](Self::liveness_tick) should run.
    pub fn liveness_interval(&self) -> Duration {
        self.liveness.interval()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Run one frame through merge, track, identify and session update.
    ///
    /// Shutdown or a switch to manual control may land while the frame is
    /// being identified; the session controller is closed by then and the
    /// frame cannot start tracking.
    pub fn process_frame(&self, frame: &FrameInput) -> FrameReport {
        if self.is_shut_down() || self.mode() != Mode::AiTracking {
            return FrameReport { skipped: true, ..FrameReport::default() };
        }
        let now = frame.captured_at;

        let candidates: Vec<BoundingBox> = frame
            .detections
            .iter()
            .filter(|b| b.area() >= self.config.min_face_area)
            .copied()
            .collect();
        let merged = self.merger.merge(candidates);

        let (sx, sy) = display_scale(frame);
        let detections: Vec<TrackedDetection> = merged
            .iter()
            .map(|b| TrackedDetection::from(b.scaled(sx, sy)))
            .collect();

        let update = self.tracker.update(&detections, now);
        for lost in &update.lost {
            self.sink.emit(Event::FaceLost {
                user_id: lost.user_id.clone(),
                duration: lost.duration,
                timestamp: Utc::now(),
            });
        }

        let identified = self.identification_pass(&frame.image, now);

        let seen: Vec<_> = self
            .tracker
            .identified_tracks()
            .into_iter()
            .filter(|t| update.touched.binary_search(&t.track_id).is_ok())
            .collect();
        let served = self.session.on_detections(&seen, now);

        if let Some(face) = &served {
            self.report_position(face, now);
        }

        tracing::trace!(
            raw = frame.detections.len(),
            merged = merged.len(),
            touched = update.touched.len(),
            identified,
            "frame processed"
        );

        FrameReport {
            skipped: false,
            merged: merged.len(),
            identified,
            lost: update.lost.len(),
            served,
        }
    }

    /// Identify every due track. Once per identification interval the pass
    /// is forced over all tracks.
    fn identification_pass(&self, image: &RgbImage, now: Instant) -> usize {
        let interval = self.config.identification_interval;
        let force = {
            let mut clocks = self.clocks.lock().unwrap_or_else(PoisonError::into_inner);
            let due = clocks
                .last_full_pass
                .map_or(true, |at| now.saturating_duration_since(at) >= interval);
            if due {
                clocks.last_full_pass = Some(now);
            }
            due
        };

        let mut identified = 0;
        for (track_id, bbox) in self.tracker.due_for_identification(now, interval, force) {
            let Some(crop) = crop_face(image, &bbox) else {
                tracing::debug!(track_id, "degenerate crop; identification skipped");
                continue;
            };
            let outcome = match self.resolver.identify(&crop) {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(track_id, error = %e, "identification failed");
                    continue;
                }
            };
            if let Some(track) = self.tracker.apply_identification(track_id, outcome, now) {
                identified += 1;
                self.sink.emit(Event::FaceDetected {
                    user_id: track.user_id,
                    confidence: track.confidence,
                    x: track.center.x,
                    y: track.center.y,
                    timestamp: Utc::now(),
                });
            }
        }
        identified
    }

    fn report_position(&self, face: &ServedFace, now: Instant) {
        {
            let mut clocks = self.clocks.lock().unwrap_or_else(PoisonError::into_inner);
            let due = clocks.last_position.map_or(true, |at| {
                now.saturating_duration_since(at) >= self.config.position_interval
            });
            if !due {
                return;
            }
            clocks.last_position = Some(now);
        }
        self.sink.emit(Event::FacePosition {
            user_id: face.user_id.clone(),
            x: face.position.x,
            y: face.position.y,
            timestamp: Utc::now(),
        });
    }

    /// Apply one inbound signal.
    pub fn handle_signal(&self, signal: Signal, now: Instant) -> Result<Ack, SignalError> {
        if self.is_shut_down() {
            return Err(SignalError::ShutDown);
        }
        tracing::debug!(kind = signal.kind(), "handling signal");

        match signal {
            Signal::SelectSession(selection) => {
                let changed = self.session.select_session(selection.session_id, selection.user_ids);
                let selected = self.session.selected_users();
                if changed {
                    self.resolver.load_candidates(&selected);
                }
                Ok(Ack::SessionSelected {
                    selected: selected.len(),
                    candidates_loaded: self.resolver.candidate_ids().len(),
                })
            }
            Signal::Deselect => {
                let changed = self.session.deselect();
                if changed {
                    self.resolver.load_candidates(&[]);
                }
                Ok(Ack::Deselected { changed })
            }
            Signal::ManualOverride(request) => match request.action {
                OverrideAction::Start => {
                    let details = OverrideRequest {
                        user_id: request.user_id,
                        rotation_angle: request.rotation_angle,
                        duration_seconds: request.duration_seconds,
                    };
                    let applied = self.session.start_override(&details, now);
                    Ok(Ack::OverrideStarted { applied })
                }
                OverrideAction::End => {
                    let paused = self.session.end_override(now);
                    Ok(Ack::OverrideEnded {
                        applied: paused.is_some(),
                        paused_duration_seconds: paused.map(|d| d.as_secs_f64()),
                    })
                }
            },
            Signal::Enroll(request) => self.enroll(request),
            Signal::SetMode { mode } => Ok(self.set_mode(mode)),
        }
    }

    fn enroll(&self, request: EnrollRequest) -> Result<Ack, SignalError> {
        let result = image::open(&request.image_path)
            .map_err(|source| SignalError::Image { path: request.image_path.clone(), source })
            .and_then(|img| {
                self.resolver
                    .enroll(
                        &request.user_id,
                        &request.username,
                        &img.to_rgb8(),
                        Some(request.image_path.clone()),
                    )
                    .map_err(SignalError::from)
            });

        let error = result.as_ref().err().map(|e| e.to_string());
        if let Some(e) = &error {
            tracing::warn!(user_id = %request.user_id, error = %e, "enrollment failed");
        }
        self.sink.emit(Event::EmbeddingReady {
            user_id: request.user_id.clone(),
            username: request.username,
            success: error.is_none(),
            error,
            timestamp: Utc::now(),
        });

        result.map(|_| Ack::Enrolled { user_id: request.user_id })
    }

    fn set_mode(&self, mode: Mode) -> Ack {
        let previous = {
            let mut current = self.mode.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, mode)
        };
        let changed = previous != mode;
        if changed {
            tracing::info!(from = %previous, to = %mode, "mode changed");
            self.tracker.reset();
            *self.clocks.lock().unwrap_or_else(PoisonError::into_inner) = Clocks::default();
            if mode == Mode::AiTracking {
                self.session.reopen();
            } else {
                self.session.close(EndReason::ModeChanged);
            }
        }
        Ack::ModeSet { mode, changed }
    }

    /// One liveness check. Returns true if tracking was ended.
    pub fn liveness_tick(&self, now: Instant) -> bool {
        if self.is_shut_down() {
            return false;
        }
        self.liveness.tick(now)
    }

    pub fn status(&self, now: Instant) -> PipelineStatus {
        PipelineStatus {
            mode: self.mode(),
            tracking: self.session.snapshot(now),
            live_tracks: self.tracker.len(),
            candidates: self.resolver.candidate_ids(),
            shut_down: self.is_shut_down(),
        }
    }

    /// Stop accepting frames and signals and end any active tracking session.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.session.close(EndReason::Shutdown);
        tracing::info!("face pipeline shut down");
    }
}

fn display_scale(frame: &FrameInput) -> (f32, f32) {
    let scale = |full: u32, processing: u32| {
        if processing == 0 {
            1.0
        } else {
            full as f32 / processing as f32
        }
    };
    (
        scale(frame.image.width(), frame.processing_width),
        scale(frame.image.height(), frame.processing_height),
    )
}

/// Crop `bbox` out of `image`, clamped to the frame. `None` if nothing is left.
fn crop_face(image: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
    let x0 = bbox.x.max(0.0).floor();
    let y0 = bbox.y.max(0.0).floor();
    let x1 = (bbox.x + bbox.width).min(image.width() as f32).ceil();
    let y1 = (bbox.y + bbox.height).min(image.height() as f32).ceil();
    if !(x1 > x0 && y1 > y0) {
        return None;
    }
    let (x, y) = (x0 as u32, y0 as u32);
    let (w, h) = ((x1 - x0) as u32, (y1 - y0) as u32);
    Some(imageops::crop_imm(image, x, y, w, h).to_image())
}
