use facetrack_core::identity::{EmbeddingStore, StoreError};
use facetrack_core::EnrolledFace;
use std::path::{Path, PathBuf};

const RECORD_FILE: &str = "face.json";

/// Enrollment store on the local filesystem: one `<root>/<user_id>/face.json`
/// per user.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root)?;
        tracing::info!(path = %root.display(), "embedding store opened");
        Ok(Self { root: root.to_path_buf() })
    }

    fn record_path(&self, user_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !user_id.is_empty()
            && !user_id.starts_with('.')
            && !user_id.contains(['/', '\\', '\0']);
        if !valid {
            return Err(StoreError::InvalidUserId(user_id.to_string()));
        }
        Ok(self.root.join(user_id).join(RECORD_FILE))
    }
}

impl EmbeddingStore for DirStore {
    fn load(&self, user_id: &str) -> Result<Option<EnrolledFace>, StoreError> {
        let path = self.record_path(user_id)?;
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let face: EnrolledFace =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                path: path.display().to_string(),
                source,
            })?;
        tracing::debug!(user_id, dim = face.embedding.values.len(), "embedding loaded");
        Ok(Some(face))
    }

    /// Writes to a temporary file and renames it into place, so a reader
    /// never sees a half-written record.
    fn save(&self, face: &EnrolledFace) -> Result<(), StoreError> {
        let path = self.record_path(&face.user_id)?;
        let dir = path.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(dir)?;

        let json = serde_json::to_vec_pretty(face).map_err(|source| StoreError::Corrupt {
            path: path.display().to_string(),
            source,
        })?;
        let tmp = dir.join(format!("{RECORD_FILE}.tmp"));
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        tracing::info!(user_id = %face.user_id, path = %path.display(), "embedding saved");
        Ok(())
    }
}
