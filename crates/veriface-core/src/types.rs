use serde::{Deserialize, Serialize};

/// Face embedding vector (512-dimensional for the default Facenet512 model).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "facenet512").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>, model_version: Option<String>) -> Self {
        Self {
            values,
            model_version,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean norm of the vector.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|x| x * x).sum::<f32>().sqrt()
    }
}

/// One enrolled embedding for an identity. Records are append-only: the
/// match pipeline reads and appends, never rewrites.
#[derive(Debug, Clone)]
pub struct EnrollmentRecord {
    pub id: String,
    pub identity_id: String,
    pub embedding: Embedding,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}

/// A candidate that scored below the match threshold.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateMatch {
    pub record_id: String,
    pub distance: f32,
}

/// The pipeline's output contract, emitted as one JSON record per attempt.
///
/// `matched` and `stored` are independent: a persistence failure after a
/// genuine match keeps `matched: true` with `stored: false`.
#[derive(Debug, Clone, Serialize)]
pub struct MatchOutcome {
    pub matched: bool,
    pub stored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_distance: Option<f32>,
    pub candidates_considered: usize,
    /// Every sub-threshold candidate, best first, for auditing ambiguous
    /// near-duplicate matches.
    pub matches: Vec<CandidateMatch>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MatchOutcome {
    /// Terminal failure record: no verdict was reached.
    pub fn failure(message: String, error: &str) -> Self {
        Self {
            matched: false,
            stored: false,
            best_distance: None,
            candidates_considered: 0,
            matches: Vec::new(),
            message,
            error: Some(error.to_string()),
        }
    }
}

/// Pixel statistics gathered by the heuristic anti-spoofing gate.
#[derive(Debug, Clone, Serialize)]
pub struct SpoofMetrics {
    /// Mean luma over the frame.
    pub brightness: f32,
    /// Variance of the Laplacian response.
    pub sharpness: f32,
    /// Sum of squared histogram bin probabilities; 1.0 for a flat frame.
    pub texture_uniformity: f32,
    /// Estimated axis-aligned rectangle count (screen bezels, photo borders).
    pub rectangle_count: usize,
}

/// Verdict of the anti-spoofing gate. Fail-closed: any failing check marks
/// the frame spoofed.
#[derive(Debug, Clone, Serialize)]
pub struct SpoofAssessment {
    pub is_spoofed: bool,
    pub failed_checks: Vec<&'static str>,
    pub metrics: SpoofMetrics,
}
