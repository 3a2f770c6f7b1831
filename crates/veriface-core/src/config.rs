use std::str::FromStr;

/// How the anti-spoofing gate reaches its verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpoofStrategy {
    /// Delegate to the face provider's liveness classifier.
    Provider,
    /// Statistical heuristics over grayscale pixel data, no extra model.
    Heuristic,
}

impl FromStr for SpoofStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "provider" => Ok(SpoofStrategy::Provider),
            "heuristic" => Ok(SpoofStrategy::Heuristic),
            other => Err(format!(
                "unknown spoof strategy '{other}' (expected 'provider' or 'heuristic')"
            )),
        }
    }
}

/// Bounds for the heuristic gate. Empirically chosen; overridable, not
/// precise biometrics.
#[derive(Debug, Clone)]
pub struct SpoofThresholds {
    /// Accepted mean-luma range, inclusive.
    pub min_brightness: f32,
    pub max_brightness: f32,
    /// Minimum Laplacian variance; blurred print/replay frames fall below.
    pub min_sharpness: f32,
    /// Maximum histogram uniformity; flat screen/print textures exceed it.
    pub max_texture_uniformity: f32,
    /// Maximum detected rectangle count before a frame is presumed to
    /// contain a bezel or photo border.
    pub max_rectangles: usize,
}

impl Default for SpoofThresholds {
    fn default() -> Self {
        Self {
            min_brightness: 50.0,
            max_brightness: 200.0,
            min_sharpness: 100.0,
            max_texture_uniformity: 0.01,
            max_rectangles: 2,
        }
    }
}

/// Single parameter set for the match-and-enroll pipeline. One orchestrator,
/// configured — not parallel pipeline variants.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// A candidate matches iff its cosine distance is strictly below this.
    pub match_threshold: f32,
    /// Most-recent-first candidate window per attempt.
    pub max_candidates: usize,
    /// Expected embedding dimensionality of the configured model.
    pub model_dimensionality: usize,
    pub spoof_strategy: SpoofStrategy,
    pub spoof_thresholds: SpoofThresholds,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.40,
            max_candidates: 20,
            model_dimensionality: 512,
            spoof_strategy: SpoofStrategy::Heuristic,
            spoof_thresholds: SpoofThresholds::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "provider".parse::<SpoofStrategy>().unwrap(),
            SpoofStrategy::Provider
        );
        assert_eq!(
            "Heuristic".parse::<SpoofStrategy>().unwrap(),
            SpoofStrategy::Heuristic
        );
        assert!("passive".parse::<SpoofStrategy>().is_err());
    }

    #[test]
    fn test_default_config() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.max_candidates, 20);
        assert_eq!(cfg.model_dimensionality, 512);
        assert!(cfg.match_threshold > 0.0 && cfg.match_threshold < 1.0);
    }
}
