//! FaceNet-style face embedder via ONNX Runtime.
//!
//! Resizes a face crop to 160x160 RGB, normalizes to the model's input
//! distribution and returns an L2-normalized embedding.

use crate::identity::{EmbedError, Embedder};
use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

const FACENET_INPUT_SIZE: u32 = 160;
const FACENET_MEAN: f32 = 127.5;
const FACENET_STD: f32 = 128.0;
const FACENET_MODEL_VERSION: &str = "facenet";

/// ONNX-backed [`Embedder`]. The session is behind a mutex because
/// inference needs exclusive access; callers never hold tracker or session
/// locks while waiting on it.
pub struct OnnxEmbedder {
    session: Mutex<Session>,
}

impl OnnxEmbedder {
    /// Load the embedding model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbedError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self { session: Mutex::new(session) })
    }

    /// Resize and normalize an RGB crop into a NCHW float tensor.
    fn preprocess(face: &RgbImage) -> Array4<f32> {
        let size = FACENET_INPUT_SIZE;
        let resized = imageops::resize(face, size, size, FilterType::Triangle);
        let n = size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, n, n));

        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel.0[c] as f32 - FACENET_MEAN) / FACENET_STD;
            }
        }

        tensor
    }
}

impl Embedder for OnnxEmbedder {
    fn embed(&self, face: &RgbImage) -> Result<Embedding, EmbedError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(EmbedError::EmptyInput);
        }

        let input = Self::preprocess(face);
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();
        if raw.is_empty() {
            return Err(EmbedError::InferenceFailed("model returned an empty embedding".into()));
        }

        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw
        };

        Ok(Embedding {
            values,
            model_version: Some(FACENET_MODEL_VERSION.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_output_shape() {
        let face = RgbImage::from_pixel(37, 51, image::Rgb([128, 128, 128]));
        let tensor = OnnxEmbedder::preprocess(&face);
        let n = FACENET_INPUT_SIZE as usize;
        assert_eq!(tensor.shape(), &[1, 3, n, n]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let face = RgbImage::from_pixel(160, 160, image::Rgb([255, 128, 0]));
        let tensor = OnnxEmbedder::preprocess(&face);
        let expect = |p: f32| (p - FACENET_MEAN) / FACENET_STD;
        assert!((tensor[[0, 0, 10, 10]] - expect(255.0)).abs() < 1e-6);
        assert!((tensor[[0, 1, 10, 10]] - expect(128.0)).abs() < 1e-6);
        assert!((tensor[[0, 2, 10, 10]] - expect(0.0)).abs() < 1e-6);
    }

    #[test]
    fn test_load_missing_model() {
        let err = OnnxEmbedder::load("/nonexistent/facenet.onnx").err().unwrap();
        assert!(matches!(err, EmbedError::ModelNotFound(_)));
    }
}
