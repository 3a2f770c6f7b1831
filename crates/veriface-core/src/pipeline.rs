//! Match-and-enroll orchestrator.
//!
//! One attempt walks `decode → anti-spoofing gate → embedding extraction →
//! candidate fetch → compare-all → decide → conditional persist`, with every
//! step able to terminate the attempt. Nothing is retried; the caller gets
//! exactly one structured result per invocation.
//!
//! Persistence is asymmetric on purpose: only confirmed-genuine captures
//! enrich the enrollment history, while rejected attempts are discarded so
//! fraudulent or poor captures cannot pollute future matching.

use std::path::Path;

use image::DynamicImage;
use serde::Serialize;
use thiserror::Error;

use crate::antispoof;
use crate::config::{PipelineConfig, SpoofStrategy};
use crate::provider::{DetectedFace, FaceProvider, FaceRegion, ProviderError};
use crate::similarity;
use crate::store::{EnrollmentStore, StoreError};
use crate::types::{Embedding, MatchOutcome, SpoofAssessment};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("spoof detected: {detail}")]
    SpoofDetected { detail: String },
    #[error("no face detected in the captured image")]
    NoFaceDetected,
    #[error("{count} faces detected; verification requires exactly one")]
    MultipleFacesDetected { count: usize },
    #[error("unexpected encoding dimension: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("no enrollment history for identity {0}")]
    NoEnrollmentHistory(String),
    #[error("identity {0} is not registered")]
    UnknownIdentity(String),
    #[error(transparent)]
    Provider(ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// Machine-readable error code for the process-boundary record.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::InvalidImage(_) => "InvalidImage",
            PipelineError::SpoofDetected { .. } => "SpoofDetected",
            PipelineError::NoFaceDetected => "NoFaceDetected",
            PipelineError::MultipleFacesDetected { .. } => "MultipleFacesDetected",
            PipelineError::DimensionMismatch { .. } => "DimensionMismatch",
            PipelineError::NoEnrollmentHistory(_) => "NoEnrollmentHistory",
            PipelineError::UnknownIdentity(_) => "UnknownIdentity",
            PipelineError::Provider(_) => "ProviderFailed",
            PipelineError::Store(e) => e.code(),
        }
    }
}

/// Result of the companion registration flow.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationOutcome {
    pub identity_id: String,
    pub record_id: String,
    pub dim: usize,
    pub message: String,
}

/// Run one match-and-enroll attempt for an image on disk.
pub fn run_match<P: FaceProvider, S: EnrollmentStore>(
    provider: &mut P,
    store: &mut S,
    config: &PipelineConfig,
    image_path: &Path,
    identity_id: &str,
) -> Result<MatchOutcome, PipelineError> {
    let image = load_image(image_path)?;
    run_match_image(provider, store, config, &image, identity_id)
}

/// Run one match-and-enroll attempt for an already-decoded image.
pub fn run_match_image<P: FaceProvider, S: EnrollmentStore>(
    provider: &mut P,
    store: &mut S,
    config: &PipelineConfig,
    image: &DynamicImage,
    identity_id: &str,
) -> Result<MatchOutcome, PipelineError> {
    tracing::info!(identity = identity_id, "match attempt started");

    let embedding = screen_and_extract(provider, config, image)?;

    let candidates = store.fetch_recent(identity_id, config.max_candidates)?;
    if candidates.is_empty() {
        return Err(PipelineError::NoEnrollmentHistory(identity_id.to_string()));
    }
    tracing::debug!(
        identity = identity_id,
        candidates = candidates.len(),
        "candidate history fetched"
    );

    let report = similarity::compare_all(&embedding, &candidates, config.match_threshold);
    let matched = report.matched();
    tracing::info!(
        identity = identity_id,
        matched,
        best_distance = report.best.as_ref().map(|b| b.distance),
        considered = report.considered,
        skipped = report.skipped,
        "comparison complete"
    );

    // The verdict is final here; persistence can only degrade `stored`.
    let (stored, error, message) = if matched {
        match store.append(identity_id, &embedding) {
            Ok(record_id) => {
                tracing::info!(identity = identity_id, record_id = %record_id, "capture enrolled");
                (
                    true,
                    None,
                    "face matched enrollment history; capture enrolled".to_string(),
                )
            }
            Err(e) => {
                tracing::error!(identity = identity_id, error = %e, "enrollment append failed");
                (
                    false,
                    Some(e.code().to_string()),
                    "face matched enrollment history but the new capture could not be persisted"
                        .to_string(),
                )
            }
        }
    } else {
        (
            false,
            None,
            "face did not match enrollment history".to_string(),
        )
    };

    Ok(MatchOutcome {
        matched,
        stored,
        best_distance: report.best.as_ref().map(|b| b.distance),
        candidates_considered: report.considered,
        matches: report.matches,
        message,
        error,
    })
}

/// Companion registration flow: extract one embedding and append the first
/// (or another) record for an already-known identity. Append-only — the
/// match pipeline's history policy applies here too.
pub fn run_registration<P: FaceProvider, S: EnrollmentStore>(
    provider: &mut P,
    store: &mut S,
    config: &PipelineConfig,
    image_path: &Path,
    identity_id: &str,
) -> Result<RegistrationOutcome, PipelineError> {
    tracing::info!(identity = identity_id, "registration started");

    let image = load_image(image_path)?;
    let faces = provider.detect_faces(&image).map_err(PipelineError::Provider)?;
    let face = expect_single_face(&faces)?;
    let embedding = extract_checked(provider, config, &image, &face.region)?;

    if !store.identity_exists(identity_id)? {
        return Err(PipelineError::UnknownIdentity(identity_id.to_string()));
    }

    let record_id = store.append(identity_id, &embedding)?;
    tracing::info!(identity = identity_id, record_id = %record_id, "registration complete");

    Ok(RegistrationOutcome {
        identity_id: identity_id.to_string(),
        record_id,
        dim: embedding.dim(),
        message: "face registered".to_string(),
    })
}

fn load_image(path: &Path) -> Result<DynamicImage, PipelineError> {
    image::open(path).map_err(|e| PipelineError::InvalidImage(e.to_string()))
}

/// Steps 2–3: anti-spoofing gate and embedding extraction.
///
/// The gate is fail-closed. Under the provider strategy a detection failure
/// is a failed gate, not a system error; under the heuristic strategy the
/// gate runs on pixels before any model is consulted.
fn screen_and_extract<P: FaceProvider>(
    provider: &mut P,
    config: &PipelineConfig,
    image: &DynamicImage,
) -> Result<Embedding, PipelineError> {
    if config.spoof_strategy == SpoofStrategy::Heuristic {
        let assessment = antispoof::evaluate(&image.to_luma8(), &config.spoof_thresholds);
        if assessment.is_spoofed {
            return Err(spoof_error(&assessment));
        }
    }

    let faces = match provider.detect_faces(image) {
        Ok(faces) => faces,
        Err(e) if config.spoof_strategy == SpoofStrategy::Provider => {
            return Err(PipelineError::SpoofDetected {
                detail: format!("liveness evaluation failed: {e}"),
            });
        }
        Err(e) => return Err(PipelineError::Provider(e)),
    };

    let face = expect_single_face(&faces)?;

    if config.spoof_strategy == SpoofStrategy::Provider && face.is_live != Some(true) {
        let detail = match face.liveness_confidence {
            Some(confidence) => format!(
                "provider classified the face as not live (confidence {confidence:.3})"
            ),
            None => "provider returned no liveness verdict".to_string(),
        };
        return Err(PipelineError::SpoofDetected { detail });
    }

    extract_checked(provider, config, image, &face.region)
}

fn spoof_error(assessment: &SpoofAssessment) -> PipelineError {
    PipelineError::SpoofDetected {
        detail: format!("failed checks: {}", assessment.failed_checks.join(", ")),
    }
}

fn expect_single_face(faces: &[DetectedFace]) -> Result<&DetectedFace, PipelineError> {
    match faces.len() {
        0 => Err(PipelineError::NoFaceDetected),
        1 => Ok(&faces[0]),
        count => Err(PipelineError::MultipleFacesDetected { count }),
    }
}

fn extract_checked<P: FaceProvider>(
    provider: &mut P,
    config: &PipelineConfig,
    image: &DynamicImage,
    region: &FaceRegion,
) -> Result<Embedding, PipelineError> {
    let embedding = provider
        .extract_embedding(image, region)
        .map_err(PipelineError::Provider)?;

    if embedding.dim() != config.model_dimensionality {
        return Err(PipelineError::DimensionMismatch {
            expected: config.model_dimensionality,
            actual: embedding.dim(),
        });
    }
    Ok(embedding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EnrollmentRecord;
    use std::cell::Cell;

    struct FakeProvider {
        faces: Vec<DetectedFace>,
        embedding: Embedding,
        fail_detect: bool,
    }

    impl FakeProvider {
        fn single_live(embedding: Vec<f32>) -> Self {
            Self {
                faces: vec![live_face()],
                embedding: Embedding::new(embedding, None),
                fail_detect: false,
            }
        }
    }

    impl FaceProvider for FakeProvider {
        fn detect_faces(
            &mut self,
            _image: &DynamicImage,
        ) -> Result<Vec<DetectedFace>, ProviderError> {
            if self.fail_detect {
                return Err(ProviderError::Detector(
                    crate::detector::DetectorError::InferenceFailed("camera tensor".into()),
                ));
            }
            Ok(self.faces.clone())
        }

        fn extract_embedding(
            &mut self,
            _image: &DynamicImage,
            _face: &FaceRegion,
        ) -> Result<Embedding, ProviderError> {
            Ok(self.embedding.clone())
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        identities: Vec<String>,
        records: Vec<EnrollmentRecord>,
        fail_append: bool,
        fetch_calls: Cell<usize>,
    }

    impl MemoryStore {
        fn with_history(identity: &str, embeddings: Vec<Vec<f32>>) -> Self {
            let records = embeddings
                .into_iter()
                .enumerate()
                .map(|(i, values)| EnrollmentRecord {
                    id: format!("rec-{i}"),
                    identity_id: identity.to_string(),
                    embedding: Embedding::new(values, None),
                    created_at: String::new(),
                })
                .collect();
            Self {
                identities: vec![identity.to_string()],
                records,
                ..Default::default()
            }
        }
    }

    impl EnrollmentStore for MemoryStore {
        fn identity_exists(&self, identity_id: &str) -> Result<bool, StoreError> {
            Ok(self.identities.iter().any(|id| id == identity_id))
        }

        fn fetch_recent(
            &self,
            identity_id: &str,
            limit: usize,
        ) -> Result<Vec<EnrollmentRecord>, StoreError> {
            self.fetch_calls.set(self.fetch_calls.get() + 1);
            Ok(self
                .records
                .iter()
                .filter(|r| r.identity_id == identity_id)
                .take(limit)
                .cloned()
                .collect())
        }

        fn append(
            &mut self,
            identity_id: &str,
            embedding: &Embedding,
        ) -> Result<String, StoreError> {
            if self.fail_append {
                return Err(StoreError::WriteFailed("disk full".into()));
            }
            let id = format!("rec-{}", self.records.len());
            self.records.push(EnrollmentRecord {
                id: id.clone(),
                identity_id: identity_id.to_string(),
                embedding: embedding.clone(),
                created_at: String::new(),
            });
            Ok(id)
        }
    }

    fn live_face() -> DetectedFace {
        DetectedFace {
            region: FaceRegion {
                x1: 10.0,
                y1: 10.0,
                x2: 90.0,
                y2: 90.0,
                confidence: 0.95,
            },
            is_live: Some(true),
            liveness_confidence: Some(0.98),
        }
    }

    fn spoofed_face() -> DetectedFace {
        DetectedFace {
            is_live: Some(false),
            liveness_confidence: Some(0.91),
            ..live_face()
        }
    }

    fn provider_config() -> PipelineConfig {
        PipelineConfig {
            match_threshold: 0.25,
            model_dimensionality: 3,
            spoof_strategy: SpoofStrategy::Provider,
            ..PipelineConfig::default()
        }
    }

    fn test_image() -> DynamicImage {
        DynamicImage::new_rgb8(160, 120)
    }

    #[test]
    fn test_match_appends_exactly_one_record() {
        let mut provider = FakeProvider::single_live(vec![1.0, 0.0, 0.0]);
        let mut store = MemoryStore::with_history("emp-7", vec![vec![1.0, 0.05, 0.0]]);
        let config = provider_config();

        let outcome =
            run_match_image(&mut provider, &mut store, &config, &test_image(), "emp-7").unwrap();

        assert!(outcome.matched);
        assert!(outcome.stored);
        assert!(outcome.error.is_none());
        assert!(outcome.best_distance.unwrap() < 0.25);
        assert_eq!(outcome.candidates_considered, 1);
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(store.records.len(), 2);
    }

    #[test]
    fn test_no_match_appends_nothing() {
        let mut provider = FakeProvider::single_live(vec![1.0, 0.0, 0.0]);
        let mut store = MemoryStore::with_history("emp-7", vec![vec![0.0, 1.0, 0.0]]);
        let config = provider_config();

        let outcome =
            run_match_image(&mut provider, &mut store, &config, &test_image(), "emp-7").unwrap();

        assert!(!outcome.matched);
        assert!(!outcome.stored);
        assert!(outcome.matches.is_empty());
        assert!(outcome.best_distance.is_none());
        assert_eq!(store.records.len(), 1);
    }

    #[test]
    fn test_empty_history_is_an_error() {
        let mut provider = FakeProvider::single_live(vec![1.0, 0.0, 0.0]);
        let mut store = MemoryStore {
            identities: vec!["emp-7".to_string()],
            ..Default::default()
        };
        let config = provider_config();

        let err = run_match_image(&mut provider, &mut store, &config, &test_image(), "emp-7")
            .unwrap_err();
        assert_eq!(err.code(), "NoEnrollmentHistory");
        assert_eq!(store.records.len(), 0);
    }

    #[test]
    fn test_multiple_faces_rejected() {
        let mut provider = FakeProvider::single_live(vec![1.0, 0.0, 0.0]);
        provider.faces = vec![live_face(), live_face()];
        let mut store = MemoryStore::with_history("emp-7", vec![vec![1.0, 0.0, 0.0]]);
        let config = provider_config();

        let err = run_match_image(&mut provider, &mut store, &config, &test_image(), "emp-7")
            .unwrap_err();
        assert_eq!(err.code(), "MultipleFacesDetected");
    }

    #[test]
    fn test_zero_faces_rejected() {
        let mut provider = FakeProvider::single_live(vec![1.0, 0.0, 0.0]);
        provider.faces.clear();
        let mut store = MemoryStore::with_history("emp-7", vec![vec![1.0, 0.0, 0.0]]);
        let config = provider_config();

        let err = run_match_image(&mut provider, &mut store, &config, &test_image(), "emp-7")
            .unwrap_err();
        assert_eq!(err.code(), "NoFaceDetected");
    }

    #[test]
    fn test_provider_liveness_gate_fail_closed() {
        let mut provider = FakeProvider::single_live(vec![1.0, 0.0, 0.0]);
        provider.faces = vec![spoofed_face()];
        let mut store = MemoryStore::with_history("emp-7", vec![vec![1.0, 0.0, 0.0]]);
        let config = provider_config();

        let err = run_match_image(&mut provider, &mut store, &config, &test_image(), "emp-7")
            .unwrap_err();
        assert_eq!(err.code(), "SpoofDetected");
        assert_eq!(store.records.len(), 1);
    }

    #[test]
    fn test_missing_liveness_verdict_fails_closed() {
        let mut provider = FakeProvider::single_live(vec![1.0, 0.0, 0.0]);
        provider.faces = vec![DetectedFace {
            is_live: None,
            liveness_confidence: None,
            ..live_face()
        }];
        let mut store = MemoryStore::with_history("emp-7", vec![vec![1.0, 0.0, 0.0]]);
        let config = provider_config();

        let err = run_match_image(&mut provider, &mut store, &config, &test_image(), "emp-7")
            .unwrap_err();
        assert_eq!(err.code(), "SpoofDetected");
    }

    #[test]
    fn test_detection_failure_is_spoof_under_provider_gate() {
        let mut provider = FakeProvider::single_live(vec![1.0, 0.0, 0.0]);
        provider.fail_detect = true;
        let mut store = MemoryStore::with_history("emp-7", vec![vec![1.0, 0.0, 0.0]]);
        let config = provider_config();

        let err = run_match_image(&mut provider, &mut store, &config, &test_image(), "emp-7")
            .unwrap_err();
        assert_eq!(err.code(), "SpoofDetected");
    }

    #[test]
    fn test_heuristic_gate_rejects_flat_frame() {
        // A uniform frame fails sharpness and texture checks before any
        // model is consulted.
        let mut provider = FakeProvider::single_live(vec![1.0, 0.0, 0.0]);
        let mut store = MemoryStore::with_history("emp-7", vec![vec![1.0, 0.0, 0.0]]);
        let config = PipelineConfig {
            spoof_strategy: SpoofStrategy::Heuristic,
            model_dimensionality: 3,
            ..PipelineConfig::default()
        };

        let image = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(
            160,
            120,
            image::Luma([128u8]),
        ));
        let err =
            run_match_image(&mut provider, &mut store, &config, &image, "emp-7").unwrap_err();
        assert_eq!(err.code(), "SpoofDetected");
        assert_eq!(store.fetch_calls.get(), 0);
    }

    #[test]
    fn test_dimension_mismatch_before_comparison() {
        // Probe dimension 400 against a configured 512: rejected before any
        // candidate is fetched or compared.
        let mut provider = FakeProvider::single_live(vec![0.5f32; 400]);
        let mut store = MemoryStore::with_history("emp-7", vec![vec![1.0, 0.0, 0.0]]);
        let config = PipelineConfig {
            model_dimensionality: 512,
            spoof_strategy: SpoofStrategy::Provider,
            ..PipelineConfig::default()
        };

        let err = run_match_image(&mut provider, &mut store, &config, &test_image(), "emp-7")
            .unwrap_err();
        assert_eq!(err.code(), "DimensionMismatch");
        assert_eq!(store.fetch_calls.get(), 0);
    }

    #[test]
    fn test_append_failure_is_partial_success() {
        // Genuine match (distance ~0.0 < 0.25) with a failing append: the
        // verdict survives, persistence does not.
        let mut provider = FakeProvider::single_live(vec![1.0, 0.0, 0.0]);
        let mut store = MemoryStore::with_history("emp-7", vec![vec![1.0, 0.0, 0.0]]);
        store.fail_append = true;
        let config = provider_config();

        let outcome =
            run_match_image(&mut provider, &mut store, &config, &test_image(), "emp-7").unwrap();

        assert!(outcome.matched);
        assert!(!outcome.stored);
        assert_eq!(outcome.error.as_deref(), Some("StoreWriteFailed"));
        assert_eq!(store.records.len(), 1);
    }

    #[test]
    fn test_zero_norm_candidate_excluded_not_fatal() {
        let mut provider = FakeProvider::single_live(vec![1.0, 0.0, 0.0]);
        let mut store = MemoryStore::with_history(
            "emp-7",
            vec![vec![0.0, 0.0, 0.0], vec![1.0, 0.0, 0.0]],
        );
        let config = provider_config();

        let outcome =
            run_match_image(&mut provider, &mut store, &config, &test_image(), "emp-7").unwrap();

        assert!(outcome.matched);
        assert_eq!(outcome.candidates_considered, 2);
        assert_eq!(outcome.matches.len(), 1);
    }

    #[test]
    fn test_unreadable_image_is_invalid() {
        let mut provider = FakeProvider::single_live(vec![1.0, 0.0, 0.0]);
        let mut store = MemoryStore::with_history("emp-7", vec![vec![1.0, 0.0, 0.0]]);
        let config = provider_config();

        let err = run_match(
            &mut provider,
            &mut store,
            &config,
            Path::new("/nonexistent/capture.jpg"),
            "emp-7",
        )
        .unwrap_err();
        assert_eq!(err.code(), "InvalidImage");
    }

    #[test]
    fn test_registration_appends_for_known_identity() {
        let mut provider = FakeProvider::single_live(vec![1.0, 0.0, 0.0]);
        let mut store = MemoryStore {
            identities: vec!["emp-7".to_string()],
            ..Default::default()
        };
        let config = provider_config();

        let path = std::env::temp_dir().join("veriface-test-register.png");
        test_image().save(&path).unwrap();
        let outcome =
            run_registration(&mut provider, &mut store, &config, &path, "emp-7").unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(outcome.identity_id, "emp-7");
        assert_eq!(outcome.dim, 3);
        assert_eq!(store.records.len(), 1);
    }

    #[test]
    fn test_registration_requires_known_identity() {
        let mut provider = FakeProvider::single_live(vec![1.0, 0.0, 0.0]);
        let mut store = MemoryStore::default();
        let config = provider_config();

        let path = std::env::temp_dir().join("veriface-test-register-unknown.png");
        test_image().save(&path).unwrap();
        let err = run_registration(&mut provider, &mut store, &config, &path, "ghost")
            .unwrap_err();
        std::fs::remove_file(&path).ok();

        assert_eq!(err.code(), "UnknownIdentity");
        assert!(store.records.is_empty());
    }
}
