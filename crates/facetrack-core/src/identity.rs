use crate::tracker::IdentifyOutcome;
use crate::types::{EnrolledFace, Embedding, UserId};
use chrono::Utc;
use image::RgbImage;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("face crop is empty")]
    EmptyInput,
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid user id: {0:?}")]
    InvalidUserId(String),
    #[error("store I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt record {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("embedding failed: {0}")]
    Embed(#[from] EmbedError),
    #[error("store failed: {0}")]
    Store(#[from] StoreError),
}

/// External embedding model: face image in, fixed-length vector out.
pub trait Embedder: Send + Sync {
    fn embed(&self, face: &RgbImage) -> Result<Embedding, EmbedError>;
}

/// External enrollment store, keyed by user id.
pub trait EmbeddingStore: Send + Sync {
    fn load(&self, user_id: &str) -> Result<Option<EnrolledFace>, StoreError>;
    fn save(&self, face: &EnrolledFace) -> Result<(), StoreError>;
}

/// In-process store, used by tests and as a cache-less default.
#[derive(Default)]
pub struct MemoryStore {
    faces: RwLock<HashMap<UserId, EnrolledFace>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience insert for a bare embedding.
    pub fn insert(&self, user_id: &str, values: Vec<f32>) {
        let face = EnrolledFace {
            user_id: user_id.to_string(),
            username: user_id.to_string(),
            embedding: Embedding::new(values),
            created_at: Utc::now(),
            image_path: None,
        };
        self.faces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(face.user_id.clone(), face);
    }
}

impl EmbeddingStore for MemoryStore {
    fn load(&self, user_id: &str) -> Result<Option<EnrolledFace>, StoreError> {
        Ok(self
            .faces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned())
    }

    fn save(&self, face: &EnrolledFace) -> Result<(), StoreError> {
        self.faces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(face.user_id.clone(), face.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResolverConfig {
    /// Best similarity must exceed this to count as a match.
    pub similarity_threshold: f32,
    /// Best and runner-up closer than this are rejected as ambiguous.
    pub ambiguity_margin: f32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self { similarity_threshold: 0.3, ambiguity_margin: 0.05 }
    }
}

/// Threshold + margin decision over a probe's similarity scores.
#[derive(Debug, Clone, Copy)]
pub struct MarginMatcher {
    config: ResolverConfig,
}

impl MarginMatcher {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    /// Score the probe against every candidate, then [`decide`](Self::decide).
    pub fn compare(&self, probe: &Embedding, gallery: &[(UserId, Embedding)]) -> IdentifyOutcome {
        let scored: Vec<(&str, f32)> = gallery
            .iter()
            .map(|(user, emb)| (user.as_str(), probe.similarity(emb)))
            .collect();
        self.decide(&scored)
    }

    /// Pick the best candidate unless it is below threshold or too close to
    /// the runner-up. With a single candidate only the threshold applies.
    pub fn decide(&self, scored: &[(&str, f32)]) -> IdentifyOutcome {
        let mut best: Option<(&str, f32)> = None;
        let mut second = f32::NEG_INFINITY;

        for &(user, sim) in scored {
            match best {
                Some((_, best_sim)) if sim <= best_sim => second = second.max(sim),
                Some((_, best_sim)) => {
                    second = best_sim;
                    best = Some((user, sim));
                }
                None => best = Some((user, sim)),
            }
        }

        let Some((user, best_sim)) = best else {
            return IdentifyOutcome::NoMatch;
        };

        if scored.len() > 1 && best_sim - second < self.config.ambiguity_margin {
            tracing::debug!(best = best_sim, second, user, "ambiguous identification rejected");
            return IdentifyOutcome::NoMatch;
        }
        if !(best_sim > self.config.similarity_threshold) {
            tracing::trace!(best = best_sim, user, "best candidate below threshold");
            return IdentifyOutcome::NoMatch;
        }

        IdentifyOutcome::Matched { user_id: user.to_string(), similarity: best_sim }
    }
}

/// Candidate embeddings for one session scope. Replaced wholesale, never edited.
#[derive(Debug, Default)]
struct Gallery {
    requested: Vec<UserId>,
    entries: Vec<(UserId, Embedding)>,
}

/// Resolves face crops to users of the active session.
pub struct IdentityResolver {
    matcher: MarginMatcher,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn EmbeddingStore>,
    gallery: RwLock<Arc<Gallery>>,
}

impl IdentityResolver {
    pub fn new(
        config: ResolverConfig,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn EmbeddingStore>,
    ) -> Self {
        Self {
            matcher: MarginMatcher::new(config),
            embedder,
            store,
            gallery: RwLock::new(Arc::new(Gallery::default())),
        }
    }

    fn current(&self) -> Arc<Gallery> {
        Arc::clone(&self.gallery.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replace the candidate set with exactly the stored embeddings of
    /// `user_ids`. Users without a usable record are logged and skipped.
    /// Returns the number of candidates loaded.
    pub fn load_candidates(&self, user_ids: &[UserId]) -> usize {
        let mut entries = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            match self.store.load(user_id) {
                Ok(Some(face)) => entries.push((user_id.clone(), face.embedding)),
                Ok(None) => {
                    tracing::warn!(user_id = %user_id, "no stored embedding; user cannot be matched")
                }
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "failed to load embedding; user cannot be matched")
                }
            }
        }

        let loaded = entries.len();
        let gallery = Arc::new(Gallery { requested: user_ids.to_vec(), entries });
        *self.gallery.write().unwrap_or_else(PoisonError::into_inner) = gallery;
        tracing::info!(requested = user_ids.len(), loaded, "candidate embeddings loaded");
        loaded
    }

    /// Users whose embeddings are currently loaded.
    pub fn candidate_ids(&self) -> Vec<UserId> {
        self.current().entries.iter().map(|(u, _)| u.clone()).collect()
    }

    /// True if `user_id` belongs to the scope of the last load, whether or
    /// not an embedding was found for it.
    pub fn in_scope(&self, user_id: &str) -> bool {
        self.current().requested.iter().any(|u| u == user_id)
    }

    /// Identify a face crop. The embedding call runs without any lock held;
    /// the candidate set observed is the one current when the call started.
    pub fn identify(&self, face: &RgbImage) -> Result<IdentifyOutcome, EmbedError> {
        let gallery = self.current();
        if gallery.entries.is_empty() {
            return Ok(IdentifyOutcome::NoMatch);
        }
        if face.width() == 0 || face.height() == 0 {
            return Err(EmbedError::EmptyInput);
        }
        let probe = self.embedder.embed(face)?;
        Ok(self.matcher.compare(&probe, &gallery.entries))
    }

    /// Compute and persist a user's embedding from an enrollment image.
    /// Reloads the candidate set when the user is in the current scope.
    pub fn enroll(
        &self,
        user_id: &str,
        username: &str,
        image: &RgbImage,
        image_path: Option<String>,
    ) -> Result<EnrolledFace, EnrollError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(EmbedError::EmptyInput.into());
        }
        let embedding = self.embedder.embed(image)?;
        let face = EnrolledFace {
            user_id: user_id.to_string(),
            username: username.to_string(),
            embedding,
            created_at: Utc::now(),
            image_path,
        };
        self.store.save(&face)?;
        tracing::info!(user_id, username, "enrollment stored");

        if self.in_scope(user_id) {
            let scope = self.current().requested.clone();
            self.load_candidates(&scope);
        }
        Ok(face)
    }
}
