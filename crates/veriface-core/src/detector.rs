//! UltraFace face detector via ONNX Runtime.
//!
//! The RFB-320 UltraFace graph emits per-anchor class scores and corner
//! boxes already decoded to normalized `[0, 1]` coordinates, so
//! post-processing reduces to confidence filtering, rescaling and NMS.

use image::{imageops::FilterType, DynamicImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

use crate::provider::FaceRegion;

const ULTRAFACE_INPUT_WIDTH: usize = 320;
const ULTRAFACE_INPUT_HEIGHT: usize = 240;
const ULTRAFACE_MEAN: f32 = 127.0;
const ULTRAFACE_STD: f32 = 128.0;
const ULTRAFACE_CONFIDENCE_THRESHOLD: f32 = 0.7;
const ULTRAFACE_NMS_THRESHOLD: f32 = 0.5;
/// [background, face] per anchor.
const ULTRAFACE_CLASSES: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — download version-RFB-320.onnx and place it in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Output tensor positions, `(scores, boxes)`.
type OutputIndices = (usize, usize);

pub struct FaceDetector {
    session: Session,
    output_indices: OutputIndices,
}

impl FaceDetector {
    /// Load the UltraFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 2 {
            return Err(DetectorError::InferenceFailed(format!(
                "UltraFace model requires 2 outputs (scores, boxes), got {}",
                output_names.len()
            )));
        }

        tracing::info!(
            path = model_path,
            outputs = ?output_names,
            "loaded UltraFace model"
        );

        let output_indices = discover_output_indices(&output_names);
        Ok(Self {
            session,
            output_indices,
        })
    }

    /// Detect faces, returning regions sorted by descending confidence in
    /// original-image pixel coordinates.
    pub fn detect(&mut self, image: &DynamicImage) -> Result<Vec<FaceRegion>, DetectorError> {
        let input = preprocess(image);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (score_idx, box_idx) = self.output_indices;
        let (_, scores) = outputs[score_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("scores: {e}")))?;
        let (_, boxes) = outputs[box_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("boxes: {e}")))?;

        let detections = decode_detections(
            scores,
            boxes,
            image.width() as f32,
            image.height() as f32,
            ULTRAFACE_CONFIDENCE_THRESHOLD,
        );

        let mut result = nms(detections, ULTRAFACE_NMS_THRESHOLD);
        result.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(result)
    }
}

/// Resize to 320x240 RGB and normalize to the UltraFace input distribution,
/// NCHW layout.
fn preprocess(image: &DynamicImage) -> Array4<f32> {
    let resized = image
        .resize_exact(
            ULTRAFACE_INPUT_WIDTH as u32,
            ULTRAFACE_INPUT_HEIGHT as u32,
            FilterType::Triangle,
        )
        .to_rgb8();

    let mut tensor =
        Array4::<f32>::zeros((1, 3, ULTRAFACE_INPUT_HEIGHT, ULTRAFACE_INPUT_WIDTH));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] =
                (pixel[c] as f32 - ULTRAFACE_MEAN) / ULTRAFACE_STD;
        }
    }
    tensor
}

/// Map `(scores, boxes)` output names to tensor positions, falling back to
/// the standard positional ordering for graphs with generic names.
fn discover_output_indices(names: &[String]) -> OutputIndices {
    let scores = names.iter().position(|n| n == "scores");
    let boxes = names.iter().position(|n| n == "boxes");
    match (scores, boxes) {
        (Some(s), Some(b)) => (s, b),
        _ => {
            tracing::info!(
                ?names,
                "UltraFace output names not recognized, using positional mapping [0]=scores, [1]=boxes"
            );
            (0, 1)
        }
    }
}

/// Filter anchors by face-class confidence and rescale the normalized
/// corner boxes to pixel coordinates.
fn decode_detections(
    scores: &[f32],
    boxes: &[f32],
    img_width: f32,
    img_height: f32,
    threshold: f32,
) -> Vec<FaceRegion> {
    let num_anchors = scores.len() / ULTRAFACE_CLASSES;
    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let confidence = scores[idx * ULTRAFACE_CLASSES + 1];
        if confidence <= threshold {
            continue;
        }

        let off = idx * 4;
        if off + 3 >= boxes.len() {
            continue;
        }

        let x1 = (boxes[off] * img_width).clamp(0.0, img_width);
        let y1 = (boxes[off + 1] * img_height).clamp(0.0, img_height);
        let x2 = (boxes[off + 2] * img_width).clamp(0.0, img_width);
        let y2 = (boxes[off + 3] * img_height).clamp(0.0, img_height);
        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        detections.push(FaceRegion {
            x1,
            y1,
            x2,
            y2,
            confidence,
        });
    }

    detections
}

/// Non-maximum suppression over overlapping detections.
fn nms(mut detections: Vec<FaceRegion>, iou_threshold: f32) -> Vec<FaceRegion> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<FaceRegion> = Vec::new();
    for candidate in detections {
        if keep.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &FaceRegion, b: &FaceRegion) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width() * a.height() + b.width() * b.height() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
