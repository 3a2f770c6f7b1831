//! MiniFASNet-style liveness classifier via ONNX Runtime.
//!
//! Scores a widened face crop as live or spoofed. Class 1 of the softmax
//! output is the genuine-presentation class; everything else (print attack,
//! screen replay) counts as spoofed.

use image::{imageops::FilterType, DynamicImage, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

use crate::provider::FaceRegion;

const SPOOF_INPUT_SIZE: usize = 80;
/// MiniFASNet crops a widened box around the detection so background context
/// (moiré, bezels) reaches the classifier.
const SPOOF_CROP_SCALE: f32 = 1.5;
const SPOOF_LIVE_CLASS: usize = 1;

#[derive(Error, Debug)]
pub enum LivenessError {
    #[error("model file not found: {0} — download minifasnet_v2.onnx and place it in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face region lies outside the image")]
    EmptyRegion,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Classifier verdict for one face.
#[derive(Debug, Clone)]
pub struct LivenessScore {
    pub is_live: bool,
    /// Probability mass assigned to the winning class.
    pub confidence: f32,
}

pub struct LivenessClassifier {
    session: Session,
}

impl LivenessClassifier {
    pub fn load(model_path: &str) -> Result<Self, LivenessError> {
        if !Path::new(model_path).exists() {
            return Err(LivenessError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded liveness model");
        Ok(Self { session })
    }

    /// Classify one detected face.
    pub fn classify(
        &mut self,
        image: &DynamicImage,
        face: &FaceRegion,
    ) -> Result<LivenessScore, LivenessError> {
        let widened = face.widened(SPOOF_CROP_SCALE, image.width(), image.height());
        let (x, y, w, h) = widened
            .clamped(image.width(), image.height())
            .ok_or(LivenessError::EmptyRegion)?;
        let crop = image
            .crop_imm(x, y, w, h)
            .resize_exact(
                SPOOF_INPUT_SIZE as u32,
                SPOOF_INPUT_SIZE as u32,
                FilterType::Triangle,
            )
            .to_rgb8();

        let input = preprocess(&crop);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, logits) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| LivenessError::InferenceFailed(format!("liveness logits: {e}")))?;
        if logits.is_empty() {
            return Err(LivenessError::InferenceFailed(
                "empty liveness output".to_string(),
            ));
        }

        let probs = softmax(logits);
        let (winner, confidence) = argmax(&probs);

        Ok(LivenessScore {
            is_live: winner == SPOOF_LIVE_CLASS,
            confidence,
        })
    }
}

/// Scale to `[0, 1]` RGB, NCHW layout.
fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let size = SPOOF_INPUT_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, p) in crop.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = p[c] as f32 / 255.0;
        }
    }
    tensor
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|&e| e / sum).collect()
}

fn argmax(values: &[f32]) -> (usize, f32) {
    let mut best_idx = 0usize;
    let mut best = f32::NEG_INFINITY;
    for (idx, &v) in values.iter().enumerate() {
        if v > best {
            best = v;
            best_idx = idx;
        }
    }
    (best_idx, best)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn test_softmax_large_logits_stable() {
        let probs = softmax(&[1000.0, 1001.0, 999.0]);
        assert!(probs.iter().all(|p| p.is_finite()));
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_argmax_picks_winner() {
        assert_eq!(argmax(&[0.1, 0.7, 0.2]).0, 1);
        assert_eq!(argmax(&[0.9, 0.05, 0.05]).0, 0);
    }

    #[test]
    fn test_preprocess_shape_and_scale() {
        let crop = RgbImage::from_pixel(
            SPOOF_INPUT_SIZE as u32,
            SPOOF_INPUT_SIZE as u32,
            image::Rgb([255u8, 0, 128]),
        );
        let tensor = preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, 3, SPOOF_INPUT_SIZE, SPOOF_INPUT_SIZE]);
        assert!((tensor[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!(tensor[[0, 1, 0, 0]].abs() < 1e-6);
        assert!((tensor[[0, 2, 0, 0]] - 128.0 / 255.0).abs() < 1e-6);
    }
}
