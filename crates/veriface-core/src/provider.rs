//! Face provider seam.
//!
//! The orchestrator talks to faces through [`FaceProvider`] so the pipeline
//! and its tests never touch ONNX. [`OnnxFaceProvider`] is the production
//! implementation, composing the detector, embedder and (optionally) the
//! liveness classifier.

use image::DynamicImage;
use thiserror::Error;

use crate::detector::{DetectorError, FaceDetector};
use crate::embedder::{EmbedderError, FaceEmbedder};
use crate::liveness::{LivenessClassifier, LivenessError};
use crate::types::Embedding;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("liveness classifier: {0}")]
    Liveness(#[from] LivenessError),
}

/// Detected face in original-image pixel coordinates.
#[derive(Debug, Clone)]
pub struct FaceRegion {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl FaceRegion {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Clamp to image bounds, returning `(x, y, width, height)` suitable for
    /// cropping. `None` when the clamped region is empty.
    pub fn clamped(&self, img_width: u32, img_height: u32) -> Option<(u32, u32, u32, u32)> {
        let x1 = self.x1.max(0.0) as u32;
        let y1 = self.y1.max(0.0) as u32;
        let x2 = (self.x2.min(img_width as f32) as u32).min(img_width);
        let y2 = (self.y2.min(img_height as f32) as u32).min(img_height);
        if x2 > x1 && y2 > y1 {
            Some((x1, y1, x2 - x1, y2 - y1))
        } else {
            None
        }
    }

    /// The same region widened by `scale` around its center, clamped.
    pub fn widened(&self, scale: f32, img_width: u32, img_height: u32) -> FaceRegion {
        let cx = (self.x1 + self.x2) / 2.0;
        let cy = (self.y1 + self.y2) / 2.0;
        let half_w = self.width() * scale / 2.0;
        let half_h = self.height() * scale / 2.0;
        FaceRegion {
            x1: (cx - half_w).max(0.0),
            y1: (cy - half_h).max(0.0),
            x2: (cx + half_w).min(img_width as f32),
            y2: (cy + half_h).min(img_height as f32),
            confidence: self.confidence,
        }
    }
}

/// One detected face plus its liveness verdict, when the provider has one.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub region: FaceRegion,
    /// `None` when no liveness classifier is loaded.
    pub is_live: Option<bool>,
    pub liveness_confidence: Option<f32>,
}

/// Capability the pipeline consumes: detect faces with liveness verdicts and
/// extract one embedding for a detected face.
pub trait FaceProvider {
    fn detect_faces(&mut self, image: &DynamicImage) -> Result<Vec<DetectedFace>, ProviderError>;

    fn extract_embedding(
        &mut self,
        image: &DynamicImage,
        face: &FaceRegion,
    ) -> Result<Embedding, ProviderError>;
}

/// ONNX-backed provider: UltraFace detection, Facenet512 embeddings and an
/// optional MiniFASNet-style liveness classifier.
pub struct OnnxFaceProvider {
    detector: FaceDetector,
    embedder: FaceEmbedder,
    liveness: Option<LivenessClassifier>,
}

impl OnnxFaceProvider {
    /// Load all models up front (fail-fast). The liveness classifier is
    /// required only when the gate delegates to the provider.
    pub fn load(
        detector_path: &str,
        embedder_path: &str,
        liveness_path: Option<&str>,
    ) -> Result<Self, ProviderError> {
        let detector = FaceDetector::load(detector_path)?;
        let embedder = FaceEmbedder::load(embedder_path)?;
        let liveness = match liveness_path {
            Some(path) => Some(LivenessClassifier::load(path)?),
            None => None,
        };
        Ok(Self {
            detector,
            embedder,
            liveness,
        })
    }
}

impl FaceProvider for OnnxFaceProvider {
    fn detect_faces(&mut self, image: &DynamicImage) -> Result<Vec<DetectedFace>, ProviderError> {
        let regions = self.detector.detect(image)?;
        let mut faces = Vec::with_capacity(regions.len());
        for region in regions {
            let (is_live, liveness_confidence) = match self.liveness.as_mut() {
                Some(classifier) => {
                    let score = classifier.classify(image, &region)?;
                    (Some(score.is_live), Some(score.confidence))
                }
                None => (None, None),
            };
            faces.push(DetectedFace {
                region,
                is_live,
                liveness_confidence,
            });
        }
        Ok(faces)
    }

    fn extract_embedding(
        &mut self,
        image: &DynamicImage,
        face: &FaceRegion,
    ) -> Result<Embedding, ProviderError> {
        Ok(self.embedder.extract(image, face)?)
    }
}
