//! Rig configuration with eager validation.
//!
//! Every tunable of the system lives here as an explicit typed field.
//! Configs are validated once, up front, via [`RigConfig::validate`];
//! downstream code assumes a validated config and does not re-check.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::pattern::PatternSpec;
use crate::types::{CameraId, MAX_SESSION_VIEWS, MIN_SESSION_VIEWS};

/// Pattern detection options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectOptions {
    /// Radius of the junction scoring ring, pixels.
    pub ring_radius_px: f64,
    /// Non-maximum suppression radius, pixels.
    pub nms_radius: usize,
    /// Response threshold relative to the strongest candidate.
    pub threshold_rel: f64,
    /// Half-width of the sub-pixel refinement window, pixels.
    pub refine_half_window: usize,
    /// Minimum fraction of the image area the detection must span.
    pub min_coverage: f64,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            ring_radius_px: 5.0,
            nms_radius: 3,
            threshold_rel: 0.3,
            refine_half_window: 5,
            min_coverage: 0.15,
        }
    }
}

/// Capture session bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOptions {
    pub min_views: usize,
    pub max_views: usize,
    /// Frames grouped into one view must lie within this window, milliseconds.
    pub sync_window_ms: f64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            min_views: MIN_SESSION_VIEWS,
            max_views: MAX_SESSION_VIEWS,
            sync_window_ms: 50.0,
        }
    }
}

/// Nonlinear optimization options shared by the refinement stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimOptions {
    pub max_iterations: usize,
    /// Huber loss scale in pixels; `None` disables robust weighting.
    pub huber_scale_px: Option<f64>,
    /// Residual above which a point is flagged as an outlier, pixels.
    pub outlier_threshold_px: f64,
    /// Wall-clock budget for the global adjustment, seconds.
    pub timeout_s: Option<f64>,
}

impl Default for OptimOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            huber_scale_px: Some(1.0),
            outlier_threshold_px: 2.0,
            timeout_s: Some(120.0),
        }
    }
}

/// Correspondence and triangulation options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasureOptions {
    /// Pairwise symmetric epipolar distance accepted as consistent, pixels.
    pub epipolar_tolerance_px: f64,
    /// Most electrode spots considered per camera frame.
    pub max_spots_per_frame: usize,
}

impl Default for MeasureOptions {
    fn default() -> Self {
        Self {
            epipolar_tolerance_px: 3.0,
            max_spots_per_frame: 8,
        }
    }
}

/// Quality thresholds that decide whether a calibration is usable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityThresholds {
    /// Per-camera RMS reprojection limit, millimetre-equivalent.
    pub per_camera_rms_mm: f64,
    /// Rig-wide RMS reprojection limit, millimetre-equivalent.
    pub global_rms_mm: f64,
    /// End-to-end positional accuracy budget, millimetres.
    pub end_to_end_mm: f64,
    /// Minimum per-camera image coverage over the whole session.
    pub min_session_coverage: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            per_camera_rms_mm: 0.2,
            global_rms_mm: 0.5,
            end_to_end_mm: 1.0,
            min_session_coverage: 0.15,
        }
    }
}

/// Accuracy validation options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateOptions {
    /// Largest timestamp gap still treated as the same instant, milliseconds.
    pub sync_tolerance_ms: f64,
    /// Number of recent records considered by the drift check.
    pub drift_window: usize,
    /// Mean discrepancy growth that triggers a drift advisory, millimetres.
    pub drift_advisory_mm: f64,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self {
            sync_tolerance_ms: 50.0,
            drift_window: 20,
            drift_advisory_mm: 0.5,
        }
    }
}

/// Complete configuration of the optical validation rig.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RigConfig {
    // ─────────────────────────────────────────────────────────────────────────
    // Rig geometry
    // ─────────────────────────────────────────────────────────────────────────
    pub camera_count: usize,
    /// Camera whose frame defines the world origin.
    pub reference_camera: CameraId,
    pub image_width: u32,
    pub image_height: u32,
    /// Nominal camera-to-volume-centre distance, millimetres.
    pub working_distance_mm: f64,

    // ─────────────────────────────────────────────────────────────────────────
    // Pattern
    // ─────────────────────────────────────────────────────────────────────────
    pub pattern: PatternSpec,

    // ─────────────────────────────────────────────────────────────────────────
    // Stage options
    // ─────────────────────────────────────────────────────────────────────────
    pub detect: DetectOptions,
    pub session: SessionOptions,
    pub optim: OptimOptions,
    pub measure: MeasureOptions,
    pub thresholds: QualityThresholds,
    pub validate: ValidateOptions,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            camera_count: 5,
            reference_camera: CameraId(0),
            image_width: 1920,
            image_height: 1080,
            working_distance_mm: 300.0,
            pattern: PatternSpec::default(),
            detect: DetectOptions::default(),
            session: SessionOptions::default(),
            optim: OptimOptions::default(),
            measure: MeasureOptions::default(),
            thresholds: QualityThresholds::default(),
            validate: ValidateOptions::default(),
        }
    }
}

impl RigConfig {
    /// Check every field for consistency.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.camera_count >= 2,
            "need at least 2 cameras (got {})",
            self.camera_count
        );
        ensure!(
            self.reference_camera.index() < self.camera_count,
            "reference camera {} is out of range (camera_count = {})",
            self.reference_camera,
            self.camera_count
        );
        ensure!(
            self.image_width > 0 && self.image_height > 0,
            "image dimensions must be positive"
        );
        ensure!(
            self.working_distance_mm > 0.0,
            "working_distance_mm must be positive"
        );

        self.pattern
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid pattern: {e}"))?;

        ensure!(
            self.detect.ring_radius_px >= 2.0,
            "ring_radius_px must be at least 2 (got {})",
            self.detect.ring_radius_px
        );
        ensure!(self.detect.nms_radius >= 1, "nms_radius must be positive");
        ensure!(
            self.detect.threshold_rel > 0.0 && self.detect.threshold_rel < 1.0,
            "threshold_rel must lie in (0, 1)"
        );
        ensure!(
            self.detect.refine_half_window >= 2,
            "refine_half_window must be at least 2 (got {})",
            self.detect.refine_half_window
        );
        ensure!(
            (0.0..=1.0).contains(&self.detect.min_coverage),
            "min_coverage must lie in [0, 1]"
        );

        ensure!(
            self.session.min_views >= MIN_SESSION_VIEWS,
            "min_views must be at least {} (got {})",
            MIN_SESSION_VIEWS,
            self.session.min_views
        );
        ensure!(
            self.session.max_views <= MAX_SESSION_VIEWS,
            "max_views must not exceed {} (got {})",
            MAX_SESSION_VIEWS,
            self.session.max_views
        );
        ensure!(
            self.session.min_views <= self.session.max_views,
            "min_views {} exceeds max_views {}",
            self.session.min_views,
            self.session.max_views
        );
        ensure!(
            self.session.sync_window_ms > 0.0,
            "sync_window_ms must be positive"
        );

        ensure!(
            self.optim.max_iterations > 0,
            "max_iterations must be positive"
        );
        if let Some(scale) = self.optim.huber_scale_px {
            ensure!(scale > 0.0, "huber_scale_px must be positive");
        }
        ensure!(
            self.optim.outlier_threshold_px > 0.0,
            "outlier_threshold_px must be positive"
        );
        if let Some(timeout) = self.optim.timeout_s {
            ensure!(timeout > 0.0, "timeout_s must be positive");
        }

        ensure!(
            self.measure.epipolar_tolerance_px > 0.0,
            "epipolar_tolerance_px must be positive"
        );
        ensure!(
            self.measure.max_spots_per_frame >= 1,
            "max_spots_per_frame must be positive"
        );

        ensure!(
            self.thresholds.per_camera_rms_mm > 0.0
                && self.thresholds.global_rms_mm > 0.0
                && self.thresholds.end_to_end_mm > 0.0,
            "quality thresholds must be positive"
        );
        ensure!(
            (0.0..=1.0).contains(&self.thresholds.min_session_coverage),
            "min_session_coverage must lie in [0, 1]"
        );

        ensure!(
            self.validate.sync_tolerance_ms > 0.0,
            "sync_tolerance_ms must be positive"
        );
        ensure!(
            self.validate.drift_window >= 2,
            "drift_window must be at least 2 (got {})",
            self.validate.drift_window
        );
        ensure!(
            self.validate.drift_advisory_mm > 0.0,
            "drift_advisory_mm must be positive"
        );

        Ok(())
    }

    /// Millimetres spanned by one pixel at the working distance.
    ///
    /// Uses the mean focal length of the supplied intrinsics. This is
    /// the scale that converts pixel reprojection errors into the
    /// millimetre-equivalent figures the quality thresholds are set in.
    pub fn mm_per_pixel(&self, mean_focal_px: f64) -> f64 {
        self.working_distance_mm / mean_focal_px
    }

    /// Identifiers of all rig cameras in index order.
    pub fn camera_ids(&self) -> Vec<CameraId> {
        (0..self.camera_count as u32).map(CameraId).collect()
    }
}
