//! Calibration observation types: detections, views, and session snapshots.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::math::Pt2;
use crate::pattern::PatternSpec;
use crate::types::TimestampUs;

/// Minimum number of cameras that must see the pattern in a view.
pub const MIN_CAMERAS_PER_VIEW: usize = 2;

/// Bounds on the number of views in a capture session.
pub const MIN_SESSION_VIEWS: usize = 2;
pub const MAX_SESSION_VIEWS: usize = 20;

/// Fraction of the frame area covered by the axis-aligned bounding box of
/// `points`.
pub fn bounding_box_coverage(points: &[Pt2], width: u32, height: u32) -> f64 {
    if points.is_empty() || width == 0 || height == 0 {
        return 0.0;
    }
    let (mut min_x, mut max_x) = (f64::INFINITY, f64::NEG_INFINITY);
    let (mut min_y, mut max_y) = (f64::INFINITY, f64::NEG_INFINITY);
    for p in points {
        min_x = min_x.min(p.x);
        max_x = max_x.max(p.x);
        min_y = min_y.min(p.y);
        max_y = max_y.max(p.y);
    }
    let area = (max_x - min_x).max(0.0) * (max_y - min_y).max(0.0);
    (area / (width as f64 * height as f64)).clamp(0.0, 1.0)
}

/// Sub-pixel feature points found in a single camera image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternDetection {
    /// Ordered (row-major) sub-pixel feature locations.
    pub points: Vec<Pt2>,
    /// Per-point confidence in `(0, 1]`.
    pub confidences: Vec<f64>,
    /// Fraction of the frame area spanned by the detected points.
    pub coverage: f64,
}

impl PatternDetection {
    /// Construct a detection, checking point/confidence agreement.
    pub fn new(points: Vec<Pt2>, confidences: Vec<f64>, coverage: f64) -> Result<Self> {
        ensure!(
            points.len() == confidences.len(),
            "point / confidence counts must match: {} vs {}",
            points.len(),
            confidences.len()
        );
        ensure!(!points.is_empty(), "detection must contain points");
        ensure!(
            confidences.iter().all(|c| *c > 0.0 && *c <= 1.0),
            "confidences must lie in (0, 1]"
        );
        ensure!(
            (0.0..=1.0).contains(&coverage),
            "coverage must lie in [0, 1], got {coverage}"
        );
        Ok(Self {
            points,
            confidences,
            coverage,
        })
    }

    /// Number of detected points.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when no points were detected.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// One capture instant: per-camera pattern detections at a shared timestamp.
///
/// Index in `detections` is the camera index; `None` marks cameras that did
/// not see the pattern (or whose frame fell outside the synchronization
/// window).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationView {
    pub timestamp_us: TimestampUs,
    pub detections: Vec<Option<PatternDetection>>,
}

impl CalibrationView {
    /// Construct a view, enforcing the cross-camera visibility rule.
    pub fn new(
        timestamp_us: TimestampUs,
        detections: Vec<Option<PatternDetection>>,
    ) -> Result<Self> {
        let present = detections.iter().filter(|d| d.is_some()).count();
        ensure!(
            present >= MIN_CAMERAS_PER_VIEW,
            "view needs detections from at least {} cameras, got {}",
            MIN_CAMERAS_PER_VIEW,
            present
        );
        Ok(Self {
            timestamp_us,
            detections,
        })
    }

    /// Number of cameras with a detection in this view.
    pub fn cameras_detected(&self) -> usize {
        self.detections.iter().filter(|d| d.is_some()).count()
    }
}

/// Immutable snapshot of a completed capture session.
///
/// Produced by the session manager's `finalize`; the bundle adjuster consumes
/// it by shared reference and never mutates it. Recalibration requires a new
/// session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSession {
    pub pattern: PatternSpec,
    pub camera_count: usize,
    pub views: Vec<CalibrationView>,
}

impl CaptureSession {
    /// Validate and freeze a sequence of accepted views.
    pub fn new(
        pattern: PatternSpec,
        camera_count: usize,
        views: Vec<CalibrationView>,
    ) -> Result<Self> {
        ensure!(camera_count >= MIN_CAMERAS_PER_VIEW, "session needs >= 2 cameras");
        ensure!(
            (MIN_SESSION_VIEWS..=MAX_SESSION_VIEWS).contains(&views.len()),
            "session needs {}..={} views, got {}",
            MIN_SESSION_VIEWS,
            MAX_SESSION_VIEWS,
            views.len()
        );
        let expected = pattern.point_count();
        for (i, view) in views.iter().enumerate() {
            ensure!(
                view.detections.len() == camera_count,
                "view {} has {} camera slots, expected {}",
                i,
                view.detections.len(),
                camera_count
            );
            ensure!(
                view.cameras_detected() >= MIN_CAMERAS_PER_VIEW,
                "view {} seen by {} cameras, need >= {}",
                i,
                view.cameras_detected(),
                MIN_CAMERAS_PER_VIEW
            );
            for (cam, det) in view.detections.iter().enumerate() {
                if let Some(det) = det {
                    ensure!(
                        det.len() == expected,
                        "view {} camera {} has {} points, pattern expects {}",
                        i,
                        cam,
                        det.len(),
                        expected
                    );
                }
            }
        }
        Ok(Self {
            pattern,
            camera_count,
            views,
        })
    }

    /// Number of views in the session.
    pub fn num_views(&self) -> usize {
        self.views.len()
    }

    /// Views in which the given camera has a detection.
    pub fn views_for_camera(&self, camera_idx: usize) -> usize {
        self.views
            .iter()
            .filter(|v| v.detections.get(camera_idx).is_some_and(|d| d.is_some()))
            .count()
    }
}
