use std::path::PathBuf;

use veriface_core::{PipelineConfig, SpoofStrategy, SpoofThresholds};

/// Process configuration, loaded from `VERIFACE_*` environment variables.
pub struct Config {
    /// Path to the SQLite enrollment database.
    pub db_path: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Result<Self, String> {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("veriface");

        let db_path = std::env::var("VERIFACE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("enrollments.db"));

        let model_dir = std::env::var("VERIFACE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        let spoof_strategy = match std::env::var("VERIFACE_SPOOF_STRATEGY") {
            Ok(raw) => raw.parse::<SpoofStrategy>()?,
            Err(_) => SpoofStrategy::Heuristic,
        };

        let defaults = SpoofThresholds::default();
        let spoof_thresholds = SpoofThresholds {
            min_brightness: env_f32("VERIFACE_SPOOF_MIN_BRIGHTNESS", defaults.min_brightness),
            max_brightness: env_f32("VERIFACE_SPOOF_MAX_BRIGHTNESS", defaults.max_brightness),
            min_sharpness: env_f32("VERIFACE_SPOOF_MIN_SHARPNESS", defaults.min_sharpness),
            max_texture_uniformity: env_f32(
                "VERIFACE_SPOOF_MAX_UNIFORMITY",
                defaults.max_texture_uniformity,
            ),
            max_rectangles: env_usize("VERIFACE_SPOOF_MAX_RECTANGLES", defaults.max_rectangles),
        };

        let pipeline_defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            match_threshold: env_f32(
                "VERIFACE_MATCH_THRESHOLD",
                pipeline_defaults.match_threshold,
            ),
            max_candidates: env_usize("VERIFACE_MAX_CANDIDATES", pipeline_defaults.max_candidates),
            model_dimensionality: env_usize(
                "VERIFACE_EMBEDDING_DIM",
                pipeline_defaults.model_dimensionality,
            ),
            spoof_strategy,
            spoof_thresholds,
        };

        Ok(Self {
            db_path,
            model_dir,
            pipeline,
        })
    }

    /// Path to the UltraFace detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join("version-RFB-320.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the Facenet512 embedding model.
    pub fn embedder_model_path(&self) -> String {
        self.model_dir
            .join("facenet512.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the liveness classification model (provider gate only).
    pub fn liveness_model_path(&self) -> String {
        self.model_dir
            .join("minifasnet_v2.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
