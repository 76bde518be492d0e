//! Calibration result and quality-report types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::camera::CameraModel;
use crate::types::CameraId;

/// Schema version written into every exported result.
pub const RESULT_SCHEMA_VERSION: u32 = 1;

/// Quality figures for one camera of the rig.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerCameraQuality {
    pub camera: CameraId,
    /// RMS reprojection error over all views observing this camera, pixels.
    pub rms_px: f64,
    /// The same error expressed in millimetres at the working distance.
    pub rms_mm: f64,
    /// Largest single-point reprojection error, pixels.
    pub max_error_px: f64,
    pub views_used: usize,
}

/// Distance between one pair of camera centres.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BaselineEntry {
    pub from: CameraId,
    pub to: CameraId,
    pub distance_mm: f64,
}

/// How well the captured views covered the working volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoverageStats {
    /// Fraction of the image area touched by detections, per camera.
    pub image_coverage: Vec<f64>,
    /// Extent of pattern positions along each world axis, millimetres.
    pub volume_extent_mm: [f64; 3],
    /// Spread of pattern orientations, degrees.
    pub orientation_spread_deg: f64,
    /// Distinct (view, point) observations across the whole session.
    pub total_points: usize,
}

/// A quality threshold the calibration failed to meet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ThresholdFailure {
    PerCameraRms {
        camera: CameraId,
        rms_mm: f64,
        limit_mm: f64,
    },
    GlobalRms {
        rms_mm: f64,
        limit_mm: f64,
    },
    Coverage {
        camera: CameraId,
        coverage: f64,
        min_coverage: f64,
    },
}

impl fmt::Display for ThresholdFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PerCameraRms {
                camera,
                rms_mm,
                limit_mm,
            } => write!(
                f,
                "{camera}: RMS {rms_mm:.4} mm exceeds per-camera limit {limit_mm:.4} mm"
            ),
            Self::GlobalRms { rms_mm, limit_mm } => write!(
                f,
                "global RMS {rms_mm:.4} mm exceeds limit {limit_mm:.4} mm"
            ),
            Self::Coverage {
                camera,
                coverage,
                min_coverage,
            } => write!(
                f,
                "{camera}: coverage {coverage:.2} below minimum {min_coverage:.2}"
            ),
        }
    }
}

/// Complete outcome of a rig calibration.
///
/// Carries the estimated camera models together with the quality report
/// that decides whether the rig may be used for measurements. The
/// `valid` flag summarises `failures`: it is true exactly when the list
/// is empty. Consumers must check it before adopting the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationResult {
    /// Estimated camera models, indexed by `CameraId::index`.
    pub cameras: Vec<CameraModel>,
    pub per_camera: Vec<PerCameraQuality>,
    pub global_rms_px: f64,
    pub global_rms_mm: f64,
    pub baselines_mm: Vec<BaselineEntry>,
    pub coverage: CoverageStats,
    /// True when every configured quality threshold is met.
    pub valid: bool,
    pub failures: Vec<ThresholdFailure>,
    /// Unix timestamp of evaluation, seconds.
    pub created_unix: i64,
    pub version: u32,
}

impl CalibrationResult {
    pub fn camera(&self, id: CameraId) -> Option<&CameraModel> {
        self.cameras.iter().find(|c| c.id == id)
    }

    /// Baseline between two cameras, if both are part of the result.
    pub fn baseline_mm(&self, a: CameraId, b: CameraId) -> Option<f64> {
        self.baselines_mm
            .iter()
            .find(|e| (e.from == a && e.to == b) || (e.from == b && e.to == a))
            .map(|e| e.distance_mm)
    }
}
