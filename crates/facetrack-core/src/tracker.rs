//! Multi-face tracker: frame-to-frame association, identity bookkeeping and expiry.
//!
//! The track table is owned by [`Tracker`] and only reachable through its
//! methods; every method takes the table lock exactly once and never calls
//! out while holding it.

use crate::types::{BoundingBox, Point, UserId};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Increment applied to stored confidence when a track re-resolves to the same user.
pub const CONFIDENCE_STEP: f32 = 0.05;
/// Upper bound for stored track confidence.
pub const CONFIDENCE_CAP: f32 = 0.95;

pub type TrackId = u64;

#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    /// Maximum center distance (display pixels) for a detection to continue a track.
    pub max_match_distance: f32,
    /// A track unseen for longer than this is removed.
    pub lost_timeout: Duration,
    /// Unmatched detections closer than `ratio * max_match_distance` to a live
    /// track are treated as duplicate boxes and dropped. 0 disables.
    pub duplicate_suppression_ratio: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_match_distance: 300.0,
            lost_timeout: Duration::from_secs(8),
            duplicate_suppression_ratio: 0.5,
        }
    }
}

/// One physical face followed across frames.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    pub center: Point,
    pub bbox: BoundingBox,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub user_id: Option<UserId>,
    pub confidence: f32,
    pub last_identified: Option<Instant>,
}

/// A merged detection in display coordinates.
#[derive(Debug, Clone, Copy)]
pub struct TrackedDetection {
    pub center: Point,
    pub bbox: BoundingBox,
}

impl From<BoundingBox> for TrackedDetection {
    fn from(bbox: BoundingBox) -> Self {
        Self { center: bbox.center(), bbox }
    }
}

/// An identified track that expired.
#[derive(Debug, Clone, PartialEq)]
pub struct LostFace {
    pub user_id: UserId,
    /// Time from the track's creation to its removal.
    pub duration: Duration,
}

/// Result of one [`Tracker::update`].
#[derive(Debug, Default)]
pub struct TrackUpdate {
    /// Tracks matched or created this frame, ascending.
    pub touched: Vec<TrackId>,
    pub lost: Vec<LostFace>,
}

/// Outcome of one identification attempt for a track.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentifyOutcome {
    Matched { user_id: UserId, similarity: f32 },
    NoMatch,
}

/// Snapshot of a track with a resolved identity.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifiedTrack {
    pub track_id: TrackId,
    pub user_id: UserId,
    pub confidence: f32,
    pub center: Point,
}

#[derive(Default)]
struct TrackTable {
    tracks: BTreeMap<TrackId, Track>,
    next_id: TrackId,
}

pub struct Tracker {
    config: TrackerConfig,
    table: Mutex<TrackTable>,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self { config, table: Mutex::new(TrackTable::default()) }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, TrackTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Associate this frame's detections with live tracks, create tracks for
    /// the rest, then expire stale tracks.
    ///
    /// Association is greedy one-to-one: every (track, detection) pair within
    /// range is ranked by distance (ties: lower track id, then lower detection
    /// index) and accepted when neither side is taken yet.
    pub fn update(&self, detections: &[TrackedDetection], now: Instant) -> TrackUpdate {
        let mut table = self.lock();
        let max_distance = self.config.max_match_distance;

        let mut pairs: Vec<(f32, TrackId, usize)> = Vec::new();
        for (det_idx, det) in detections.iter().enumerate() {
            for (id, track) in &table.tracks {
                let dist = det.center.distance(&track.center);
                if dist < max_distance {
                    pairs.push((dist, *id, det_idx));
                }
            }
        }
        pairs.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(Ordering::Equal)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let mut touched = BTreeSet::new();
        let mut used_dets = vec![false; detections.len()];

        for (_, id, det_idx) in pairs {
            if used_dets[det_idx] || touched.contains(&id) {
                continue;
            }
            if let Some(track) = table.tracks.get_mut(&id) {
                let det = &detections[det_idx];
                track.center = det.center;
                track.bbox = det.bbox;
                track.last_seen = now;
                touched.insert(id);
                used_dets[det_idx] = true;
            }
        }

        let suppress_radius = max_distance * self.config.duplicate_suppression_ratio;
        for (det_idx, det) in detections.iter().enumerate() {
            if used_dets[det_idx] {
                continue;
            }
            let duplicate = table
                .tracks
                .values()
                .any(|t| det.center.distance(&t.center) < suppress_radius);
            if duplicate {
                tracing::trace!(x = det.center.x, y = det.center.y, "dropping duplicate detection");
                continue;
            }

            let id = table.next_id;
            table.next_id += 1;
            table.tracks.insert(
                id,
                Track {
                    id,
                    center: det.center,
                    bbox: det.bbox,
                    first_seen: now,
                    last_seen: now,
                    user_id: None,
                    confidence: 0.0,
                    last_identified: None,
                },
            );
            touched.insert(id);
            tracing::debug!(track_id = id, x = det.center.x, y = det.center.y, "track created");
        }

        let lost = self.remove_expired(&mut table, now);
        dedup_identities(&mut table.tracks);

        TrackUpdate { touched: touched.into_iter().collect(), lost }
    }

    fn remove_expired(&self, table: &mut TrackTable, now: Instant) -> Vec<LostFace> {
        let expired: Vec<TrackId> = table
            .tracks
            .values()
            .filter(|t| now.saturating_duration_since(t.last_seen) > self.config.lost_timeout)
            .map(|t| t.id)
            .collect();

        let mut lost = Vec::new();
        for id in expired {
            let Some(track) = table.tracks.remove(&id) else {
                continue;
            };
            tracing::debug!(track_id = id, user_id = ?track.user_id, "track expired");
            if let Some(user_id) = track.user_id {
                lost.push(LostFace {
                    user_id,
                    duration: now.saturating_duration_since(track.first_seen),
                });
            }
        }
        lost
    }

    /// Drop every track and restart id allocation.
    pub fn reset(&self) {
        let mut table = self.lock();
        let dropped = table.tracks.len();
        *table = TrackTable::default();
        tracing::info!(dropped, "tracker reset");
    }

    /// Tracks whose identity should be (re)checked now, with their latest box.
    pub fn due_for_identification(
        &self,
        now: Instant,
        interval: Duration,
        force: bool,
    ) -> Vec<(TrackId, BoundingBox)> {
        self.lock()
            .tracks
            .values()
            .filter(|t| {
                force
                    || t.last_identified
                        .map_or(true, |at| now.saturating_duration_since(at) >= interval)
            })
            .map(|t| (t.id, t.bbox))
            .collect()
    }

    /// Record an identification result for a track.
    ///
    /// A repeat match for the same user raises stored confidence by
    /// [`CONFIDENCE_STEP`] instead of taking the raw similarity; a different
    /// user overwrites it. Confidence never exceeds [`CONFIDENCE_CAP`].
    /// `NoMatch` leaves the identity untouched and only stamps the attempt.
    ///
    /// Returns the identified track, or `None` when the track is gone, was
    /// not matched, or lost the per-user dedup to another track.
    pub fn apply_identification(
        &self,
        id: TrackId,
        outcome: IdentifyOutcome,
        now: Instant,
    ) -> Option<IdentifiedTrack> {
        let mut table = self.lock();
        let track = table.tracks.get_mut(&id)?;
        track.last_identified = Some(now);

        let IdentifyOutcome::Matched { user_id, similarity } = outcome else {
            return None;
        };

        if track.user_id.as_deref() == Some(user_id.as_str()) {
            track.confidence = (track.confidence + CONFIDENCE_STEP).min(CONFIDENCE_CAP);
        } else {
            if let Some(prev) = &track.user_id {
                tracing::info!(track_id = id, from = %prev, to = %user_id, "track identity changed");
            }
            track.user_id = Some(user_id);
            track.confidence = similarity.min(CONFIDENCE_CAP);
        }

        dedup_identities(&mut table.tracks);

        let track = table.tracks.get(&id)?;
        Some(IdentifiedTrack {
            track_id: track.id,
            user_id: track.user_id.clone()?,
            confidence: track.confidence,
            center: track.center,
        })
    }

    /// Identified tracks in ascending id order (oldest first).
    pub fn identified_tracks(&self) -> Vec<IdentifiedTrack> {
        self.lock()
            .tracks
            .values()
            .filter_map(|t| {
                Some(IdentifiedTrack {
                    track_id: t.id,
                    user_id: t.user_id.clone()?,
                    confidence: t.confidence,
                    center: t.center,
                })
            })
            .collect()
    }

    /// Copy of the live track table in id order.
    pub fn snapshot(&self) -> Vec<Track> {
        self.lock().tracks.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keep one track per user: highest confidence, then most recently
/// identified, then lowest id.
fn dedup_identities(tracks: &mut BTreeMap<TrackId, Track>) {
    let mut best: HashMap<&str, &Track> = HashMap::new();
    let mut discard = Vec::new();

    for track in tracks.values() {
        let Some(user) = track.user_id.as_deref() else {
            continue;
        };
        match best.get(user) {
            None => {
                best.insert(user, track);
            }
            Some(kept) if outranks(track, kept) => {
                discard.push(kept.id);
                best.insert(user, track);
            }
            Some(_) => discard.push(track.id),
        }
    }

    for id in discard {
        tracing::debug!(track_id = id, "discarding duplicate track for identified user");
        tracks.remove(&id);
    }
}

fn outranks(candidate: &Track, kept: &Track) -> bool {
    match candidate.confidence.partial_cmp(&kept.confidence) {
        Some(Ordering::Greater) => true,
        Some(Ordering::Less) => false,
        _ => candidate.last_identified > kept.last_identified,
    }
}
