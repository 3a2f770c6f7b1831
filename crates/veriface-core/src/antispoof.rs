//! Heuristic anti-spoofing gate.
//!
//! Statistical screening of a grayscale frame for presentation-attack
//! artifacts: exposure extremes from screen replays, blur from printed
//! photos, flat texture from uniform media, and rectangular contours from
//! bezels and photo borders. All checks must pass for a frame to be
//! accepted as live; the verdict is fail-closed.
//!
//! Thresholds are empirically chosen and configurable — see
//! [`SpoofThresholds`](crate::config::SpoofThresholds).

use image::GrayImage;
use imageproc::edges::canny;
use imageproc::filter::laplacian_filter;
use imageproc::hough::{detect_lines, LineDetectionOptions, PolarLine};

use crate::config::SpoofThresholds;
use crate::types::{SpoofAssessment, SpoofMetrics};

const CANNY_LOW_THRESHOLD: f32 = 50.0;
const CANNY_HIGH_THRESHOLD: f32 = 100.0;
/// Hough lines within this many degrees of axis-aligned count toward the
/// rectangle estimate.
const AXIS_ANGLE_TOLERANCE: u32 = 10;
const HOUGH_SUPPRESSION_RADIUS: u32 = 8;

/// Gather pixel statistics for the heuristic ensemble.
///
/// Never fails for malformed-but-decodable input; degenerate frames simply
/// produce metrics that fail the checks.
pub fn measure(gray: &GrayImage) -> SpoofMetrics {
    SpoofMetrics {
        brightness: mean_brightness(gray),
        sharpness: laplacian_variance(gray),
        texture_uniformity: histogram_uniformity(gray),
        rectangle_count: estimate_rectangles(gray),
    }
}

/// Apply the threshold ensemble to measured metrics.
pub fn assess(metrics: SpoofMetrics, thresholds: &SpoofThresholds) -> SpoofAssessment {
    let mut failed_checks = Vec::new();

    if metrics.brightness < thresholds.min_brightness
        || metrics.brightness > thresholds.max_brightness
    {
        failed_checks.push("brightness");
    }
    if metrics.sharpness <= thresholds.min_sharpness {
        failed_checks.push("sharpness");
    }
    if metrics.texture_uniformity >= thresholds.max_texture_uniformity {
        failed_checks.push("texture_uniformity");
    }
    if metrics.rectangle_count > thresholds.max_rectangles {
        failed_checks.push("rectangle_count");
    }

    SpoofAssessment {
        is_spoofed: !failed_checks.is_empty(),
        failed_checks,
        metrics,
    }
}

/// Measure and assess in one step.
pub fn evaluate(gray: &GrayImage, thresholds: &SpoofThresholds) -> SpoofAssessment {
    let metrics = measure(gray);
    tracing::debug!(
        brightness = metrics.brightness,
        sharpness = metrics.sharpness,
        uniformity = metrics.texture_uniformity,
        rectangles = metrics.rectangle_count,
        "anti-spoofing metrics"
    );
    assess(metrics, thresholds)
}

fn mean_brightness(gray: &GrayImage) -> f32 {
    let total: u64 = gray.pixels().map(|p| p[0] as u64).sum();
    let count = (gray.width() as u64 * gray.height() as u64).max(1);
    total as f32 / count as f32
}

/// Variance of the Laplacian response; low values indicate blur.
fn laplacian_variance(gray: &GrayImage) -> f32 {
    let response = laplacian_filter(gray);
    let count = (response.width() as u64 * response.height() as u64).max(1) as f64;

    let mut sum = 0.0f64;
    for p in response.pixels() {
        sum += p[0] as f64;
    }
    let mean = sum / count;

    let mut var = 0.0f64;
    for p in response.pixels() {
        let d = p[0] as f64 - mean;
        var += d * d;
    }
    (var / count) as f32
}

/// Sum of squared histogram bin probabilities over the 256 luma levels.
/// A flat frame yields 1.0; rich natural texture stays well below 0.01.
fn histogram_uniformity(gray: &GrayImage) -> f32 {
    let mut bins = [0u64; 256];
    for p in gray.pixels() {
        bins[p[0] as usize] += 1;
    }
    let total = (gray.width() as u64 * gray.height() as u64).max(1) as f64;

    let mut uniformity = 0.0f64;
    for count in bins {
        let p = count as f64 / total;
        uniformity += p * p;
    }
    uniformity as f32
}

/// Estimate how many axis-aligned rectangles the frame contains.
///
/// Canny edges feed a Hough transform; near-vertical and near-horizontal
/// lines are paired off, and each rectangle needs two of each. This is an
/// estimate for bezel/border screening, not a contour tracer.
fn estimate_rectangles(gray: &GrayImage) -> usize {
    // Too small to host a bezel or border.
    if gray.width() < 16 || gray.height() < 16 {
        return 0;
    }

    let edges = canny(gray, CANNY_LOW_THRESHOLD, CANNY_HIGH_THRESHOLD);

    // A bezel edge spans a large fraction of the frame; demand a vote count
    // proportional to the short side so texture noise cannot form lines.
    let vote_threshold = (gray.width().min(gray.height()) / 4).max(40);
    let lines = detect_lines(
        &edges,
        LineDetectionOptions {
            vote_threshold,
            suppression_radius: HOUGH_SUPPRESSION_RADIUS,
        },
    );

    let (vertical, horizontal) = count_axis_aligned(&lines);
    vertical.min(horizontal) / 2
}

/// Split detected lines into near-vertical and near-horizontal counts.
/// In the Hough parameterization the angle is the line normal: 0° ≡
/// vertical line, 90° ≡ horizontal line.
fn count_axis_aligned(lines: &[PolarLine]) -> (usize, usize) {
    let mut vertical = 0usize;
    let mut horizontal = 0usize;
    for line in lines {
        let angle = line.angle_in_degrees % 180;
        if angle <= AXIS_ANGLE_TOLERANCE || angle >= 180 - AXIS_ANGLE_TOLERANCE {
            vertical += 1;
        } else if angle.abs_diff(90) <= AXIS_ANGLE_TOLERANCE {
            horizontal += 1;
        }
    }
    (vertical, horizontal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn metrics(
        brightness: f32,
        sharpness: f32,
        texture_uniformity: f32,
        rectangle_count: usize,
    ) -> SpoofMetrics {
        SpoofMetrics {
            brightness,
            sharpness,
            texture_uniformity,
            rectangle_count,
        }
    }

    fn passing_metrics() -> SpoofMetrics {
        metrics(120.0, 250.0, 0.004, 1)
    }

    #[test]
    fn test_all_checks_passing() {
        let verdict = assess(passing_metrics(), &SpoofThresholds::default());
        assert!(!verdict.is_spoofed);
        assert!(verdict.failed_checks.is_empty());
    }

    #[test]
    fn test_overexposed_frame_is_spoofed() {
        // Brightness 210 with every other metric passing.
        let mut m = passing_metrics();
        m.brightness = 210.0;
        let verdict = assess(m, &SpoofThresholds::default());
        assert!(verdict.is_spoofed);
        assert_eq!(verdict.failed_checks, vec!["brightness"]);
    }

    #[test]
    fn test_underexposed_frame_is_spoofed() {
        let mut m = passing_metrics();
        m.brightness = 30.0;
        assert!(assess(m, &SpoofThresholds::default()).is_spoofed);
    }

    #[test]
    fn test_brightness_bounds_inclusive() {
        for b in [50.0, 200.0] {
            let mut m = passing_metrics();
            m.brightness = b;
            let verdict = assess(m, &SpoofThresholds::default());
            assert!(!verdict.is_spoofed, "brightness {b} should pass");
        }
    }

    #[test]
    fn test_blurred_frame_is_spoofed() {
        let mut m = passing_metrics();
        m.sharpness = 100.0; // must be strictly above the bound
        let verdict = assess(m, &SpoofThresholds::default());
        assert_eq!(verdict.failed_checks, vec!["sharpness"]);
    }

    #[test]
    fn test_flat_texture_is_spoofed() {
        let mut m = passing_metrics();
        m.texture_uniformity = 0.01; // must be strictly below the bound
        let verdict = assess(m, &SpoofThresholds::default());
        assert_eq!(verdict.failed_checks, vec!["texture_uniformity"]);
    }

    #[test]
    fn test_rectangle_bound() {
        let mut m = passing_metrics();
        m.rectangle_count = 2;
        assert!(!assess(m, &SpoofThresholds::default()).is_spoofed);

        let mut m = passing_metrics();
        m.rectangle_count = 3;
        let verdict = assess(m, &SpoofThresholds::default());
        assert_eq!(verdict.failed_checks, vec!["rectangle_count"]);
    }

    #[test]
    fn test_multiple_failures_all_reported() {
        let verdict = assess(metrics(210.0, 5.0, 1.0, 4), &SpoofThresholds::default());
        assert!(verdict.is_spoofed);
        assert_eq!(
            verdict.failed_checks,
            vec![
                "brightness",
                "sharpness",
                "texture_uniformity",
                "rectangle_count"
            ]
        );
    }

    #[test]
    fn test_measure_uniform_frame() {
        // A flat gray frame: in-range brightness, zero sharpness, maximal
        // uniformity, no rectangles. The gate must reject it.
        let gray = GrayImage::from_pixel(160, 120, Luma([128u8]));
        let m = measure(&gray);
        assert!((m.brightness - 128.0).abs() < 1e-3);
        assert!(m.sharpness < 1e-6);
        assert!((m.texture_uniformity - 1.0).abs() < 1e-6);
        assert_eq!(m.rectangle_count, 0);

        let verdict = assess(m, &SpoofThresholds::default());
        assert!(verdict.is_spoofed);
    }

    #[test]
    fn test_measure_checkerboard() {
        // 1px checkerboard: strong Laplacian response, two-bin histogram.
        let gray = GrayImage::from_fn(64, 64, |x, y| {
            if (x + y) % 2 == 0 {
                Luma([0u8])
            } else {
                Luma([255u8])
            }
        });
        let m = measure(&gray);
        assert!((m.brightness - 127.5).abs() < 1.0);
        assert!(m.sharpness > 100.0);
        assert!((m.texture_uniformity - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_axis_aligned_line_counting() {
        let lines = vec![
            PolarLine {
                r: 10.0,
                angle_in_degrees: 0,
            },
            PolarLine {
                r: 50.0,
                angle_in_degrees: 175,
            },
            PolarLine {
                r: 30.0,
                angle_in_degrees: 88,
            },
            PolarLine {
                r: 70.0,
                angle_in_degrees: 95,
            },
            PolarLine {
                r: 20.0,
                angle_in_degrees: 45,
            },
        ];
        let (vertical, horizontal) = count_axis_aligned(&lines);
        assert_eq!(vertical, 2);
        assert_eq!(horizontal, 2);
    }

    #[test]
    fn test_evaluate_is_fail_closed_on_degenerate_input() {
        // One-pixel frame: no panic, spoofed verdict.
        let gray = GrayImage::from_pixel(1, 1, Luma([100u8]));
        let verdict = evaluate(&gray, &SpoofThresholds::default());
        assert!(verdict.is_spoofed);
    }
}
