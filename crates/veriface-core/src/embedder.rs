//! Facenet512 face embedder via ONNX Runtime.
//!
//! Crops the detected face, standardizes the crop (Facenet prewhitening)
//! and produces a 512-dimensional embedding. The output dimensionality is
//! validated at extraction time so model/version drift cannot silently
//! corrupt stored comparisons.

use image::{imageops::FilterType, DynamicImage, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

use crate::provider::FaceRegion;
use crate::types::Embedding;

const FACENET_INPUT_SIZE: usize = 160;
const FACENET_EMBEDDING_DIM: usize = 512;
const FACENET_MODEL_VERSION: &str = "facenet512";

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0} — download facenet512.onnx and place it in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face region lies outside the image")]
    EmptyRegion,
    #[error("unexpected encoding dimension: expected {expected}, got {actual}")]
    UnexpectedDimension { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct FaceEmbedder {
    session: Session,
}

impl FaceEmbedder {
    /// Load the Facenet512 ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded Facenet512 model"
        );

        Ok(Self { session })
    }

    /// Extract an embedding for one detected face.
    pub fn extract(
        &mut self,
        image: &DynamicImage,
        face: &FaceRegion,
    ) -> Result<Embedding, EmbedderError> {
        let (x, y, w, h) = face
            .clamped(image.width(), image.height())
            .ok_or(EmbedderError::EmptyRegion)?;
        let crop = image
            .crop_imm(x, y, w, h)
            .resize_exact(
                FACENET_INPUT_SIZE as u32,
                FACENET_INPUT_SIZE as u32,
                FilterType::Triangle,
            )
            .to_rgb8();

        let input = preprocess(&crop);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;
        let raw: Vec<f32> = raw_data.to_vec();

        if raw.len() != FACENET_EMBEDDING_DIM {
            return Err(EmbedderError::UnexpectedDimension {
                expected: FACENET_EMBEDDING_DIM,
                actual: raw.len(),
            });
        }

        // L2-normalize; cosine comparisons are magnitude-insensitive either
        // way, but normalized vectors keep stored blobs comparable across
        // runtime versions.
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw
        };

        Ok(Embedding::new(
            values,
            Some(FACENET_MODEL_VERSION.to_string()),
        ))
    }
}

/// Facenet prewhitening: per-crop standardization to zero mean and unit
/// variance, NHWC layout.
fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let size = FACENET_INPUT_SIZE;
    let pixel_count = (size * size * 3) as f64;

    let mut sum = 0.0f64;
    for p in crop.pixels() {
        sum += p[0] as f64 + p[1] as f64 + p[2] as f64;
    }
    let mean = sum / pixel_count;

    let mut var = 0.0f64;
    for p in crop.pixels() {
        for c in 0..3 {
            let d = p[c] as f64 - mean;
            var += d * d;
        }
    }
    // Lower-bound the deviation so a flat crop cannot divide by zero.
    let std_dev = (var / pixel_count).sqrt().max(1.0 / (pixel_count).sqrt());

    let mut tensor = Array4::<f32>::zeros((1, size, size, 3));
    for (x, y, p) in crop.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, y as usize, x as usize, c]] = ((p[c] as f64 - mean) / std_dev) as f32;
        }
    }
    tensor
}
