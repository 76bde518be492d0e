//! Quality evaluation of a calibrated rig, and the activation gate.
//!
//! Every metric is computed from the final camera models against the
//! session observations, so the report reflects exactly the rig that
//! would be adopted. Pixel RMS values are converted to millimetre
//! equivalents at the working distance.
//!
//! An out-of-threshold result is never adopted silently: the operator
//! either retries the calibration or accepts it explicitly, and the
//! acceptance is logged with the failing metrics.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;
use thiserror::Error;

use optival_core::types::{
    bounding_box_coverage, CalibrationResult, CaptureSession, CoverageStats, PerCameraQuality,
    ThresholdFailure, RESULT_SCHEMA_VERSION,
};
use optival_core::types::BaselineEntry;
use optival_core::math::{rotation_angle_between, Pt2};
use optival_core::RigConfig;
use optival_optim::ObservationKey;

use crate::calibrate::RigCalibration;

/// Evaluate a calibrated rig against the session it was built from.
///
/// Observations flagged as outliers by the adjustment are excluded from
/// the RMS figures but still counted in coverage.
pub fn evaluate(
    config: &RigConfig,
    session: &CaptureSession,
    calibration: &RigCalibration,
) -> CalibrationResult {
    let outliers: HashSet<ObservationKey> = calibration.outliers.iter().copied().collect();
    let camera_count = calibration.cameras.len();

    let mut sum_sq = vec![0.0f64; camera_count];
    let mut counts = vec![0usize; camera_count];
    let mut max_err = vec![0.0f64; camera_count];
    let mut pixels_seen: Vec<Vec<Pt2>> = vec![Vec::new(); camera_count];
    let mut total_points = 0usize;

    for (v, view) in session.views.iter().enumerate() {
        let world = &calibration.world_points[v];
        total_points += world.len();
        for (c, camera) in calibration.cameras.iter().enumerate() {
            let Some(detection) = &view.detections[c] else {
                continue;
            };
            pixels_seen[c].extend_from_slice(&detection.points);
            for (p, (world_point, pixel)) in world.iter().zip(&detection.points).enumerate() {
                let key = ObservationKey {
                    view: v,
                    camera: c,
                    point: p,
                };
                if outliers.contains(&key) {
                    continue;
                }
                if let Some(predicted) = camera.project_point(world_point) {
                    let err = (predicted - pixel).norm();
                    sum_sq[c] += err * err;
                    counts[c] += 1;
                    max_err[c] = max_err[c].max(err);
                }
            }
        }
    }

    let per_camera: Vec<PerCameraQuality> = calibration
        .cameras
        .iter()
        .enumerate()
        .map(|(c, camera)| {
            let rms_px = if counts[c] > 0 {
                (sum_sq[c] / counts[c] as f64).sqrt()
            } else {
                f64::INFINITY
            };
            let mean_focal = (camera.intrinsics.fx + camera.intrinsics.fy) / 2.0;
            PerCameraQuality {
                camera: camera.id,
                rms_px,
                rms_mm: rms_px * config.mm_per_pixel(mean_focal),
                max_error_px: max_err[c],
                views_used: session.views_for_camera(c),
            }
        })
        .collect();

    let total_count: usize = counts.iter().sum();
    let global_rms_px = if total_count > 0 {
        (sum_sq.iter().sum::<f64>() / total_count as f64).sqrt()
    } else {
        f64::INFINITY
    };
    let rig_mean_focal = calibration
        .cameras
        .iter()
        .map(|cam| (cam.intrinsics.fx + cam.intrinsics.fy) / 2.0)
        .sum::<f64>()
        / camera_count as f64;
    let global_rms_mm = global_rms_px * config.mm_per_pixel(rig_mean_focal);

    let mut baselines_mm = Vec::new();
    for a in 0..camera_count {
        for b in (a + 1)..camera_count {
            baselines_mm.push(BaselineEntry {
                from: calibration.cameras[a].id,
                to: calibration.cameras[b].id,
                distance_mm: (calibration.cameras[a].center() - calibration.cameras[b].center())
                    .norm(),
            });
        }
    }

    let coverage = coverage_stats(config, calibration, &pixels_seen, total_points);
    let mut failures = Vec::new();
    for q in &per_camera {
        if q.rms_mm >= config.thresholds.per_camera_rms_mm {
            failures.push(ThresholdFailure::PerCameraRms {
                camera: q.camera,
                rms_mm: q.rms_mm,
                limit_mm: config.thresholds.per_camera_rms_mm,
            });
        }
    }
    if global_rms_mm >= config.thresholds.global_rms_mm {
        failures.push(ThresholdFailure::GlobalRms {
            rms_mm: global_rms_mm,
            limit_mm: config.thresholds.global_rms_mm,
        });
    }
    for (c, &image_coverage) in coverage.image_coverage.iter().enumerate() {
        if image_coverage < config.thresholds.min_session_coverage {
            failures.push(ThresholdFailure::Coverage {
                camera: calibration.cameras[c].id,
                coverage: image_coverage,
                min_coverage: config.thresholds.min_session_coverage,
            });
        }
    }

    let created_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    CalibrationResult {
        cameras: calibration.cameras.clone(),
        per_camera,
        global_rms_px,
        global_rms_mm,
        baselines_mm,
        coverage,
        valid: failures.is_empty(),
        failures,
        created_unix,
        version: RESULT_SCHEMA_VERSION,
    }
}

fn coverage_stats(
    config: &RigConfig,
    calibration: &RigCalibration,
    pixels_seen: &[Vec<Pt2>],
    total_points: usize,
) -> CoverageStats {
    let image_coverage = pixels_seen
        .iter()
        .map(|pixels| bounding_box_coverage(pixels, config.image_width, config.image_height))
        .collect();

    let mut min = [f64::INFINITY; 3];
    let mut max = [f64::NEG_INFINITY; 3];
    for points in &calibration.world_points {
        for p in points {
            for k in 0..3 {
                min[k] = min[k].min(p[k]);
                max[k] = max[k].max(p[k]);
            }
        }
    }
    let volume_extent_mm = if total_points > 0 {
        [max[0] - min[0], max[1] - min[1], max[2] - min[2]]
    } else {
        [0.0; 3]
    };

    let mut orientation_spread = 0.0f64;
    let placements = &calibration.world_se3_target;
    for a in 0..placements.len() {
        for b in (a + 1)..placements.len() {
            orientation_spread =
                orientation_spread.max(rotation_angle_between(&placements[a], &placements[b]));
        }
    }

    CoverageStats {
        image_coverage,
        volume_extent_mm,
        orientation_spread_deg: orientation_spread.to_degrees(),
        total_points,
    }
}

fn format_failures(failures: &[ThresholdFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum ActivationError {
    /// The result failed its thresholds and the operator has not
    /// accepted it explicitly.
    #[error("accuracy thresholds violated: {}", format_failures(failures))]
    AccuracyThresholdViolation { failures: Vec<ThresholdFailure> },
}

/// The calibration currently in force for measurements.
///
/// A failed or diverged run never reaches this gate, so the previous
/// result keeps serving until a new one is adopted.
#[derive(Debug, Default)]
pub struct ActiveCalibration {
    current: Option<CalibrationResult>,
}

impl ActiveCalibration {
    pub fn current(&self) -> Option<&CalibrationResult> {
        self.current.as_ref()
    }

    /// Adopt a result. An out-of-threshold result is rejected unless
    /// the operator accepts it explicitly, in which case the failing
    /// metrics are logged.
    pub fn adopt(
        &mut self,
        result: CalibrationResult,
        accept_out_of_threshold: bool,
    ) -> Result<(), ActivationError> {
        if !result.valid {
            if !accept_out_of_threshold {
                return Err(ActivationError::AccuracyThresholdViolation {
                    failures: result.failures.clone(),
                });
            }
            warn!(
                "adopting out-of-threshold calibration: {}",
                format_failures(&result.failures)
            );
        }
        self.current = Some(result);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use optival_core::synthetic::{
        default_intrinsics, pattern_placements, pattern_world_points, project_pattern_views,
        ring_cameras,
    };
    use optival_optim::{LmSummary, StopReason};

    fn exact_calibration() -> (RigConfig, CaptureSession, RigCalibration) {
        let config = RigConfig {
            camera_count: 3,
            ..RigConfig::default()
        };
        let cameras = ring_cameras(3, 300.0, 35.0, default_intrinsics(1920, 1080));
        let placements = pattern_placements(8, 0.1, 0.08, 5.0);
        let views = project_pattern_views(
            &cameras,
            &config.pattern,
            &placements,
            1920,
            1080,
            100_000,
        )
        .unwrap();
        let session = CaptureSession::new(config.pattern.clone(), 3, views).unwrap();

        let world_points = placements
            .iter()
            .map(|p| pattern_world_points(&config.pattern, p))
            .collect();
        let calibration = RigCalibration {
            cameras,
            world_se3_target: placements,
            world_points,
            outliers: Vec::new(),
            rig_rms_px: 0.0,
            summary: LmSummary {
                stop: StopReason::CostToleranceReached,
                initial_cost: 0.0,
                final_cost: 0.0,
                iterations: 0,
                accepted_steps: 0,
                rejected_steps: 0,
                final_damping: 1e-3,
                final_gradient_norm: 0.0,
                cost_history: vec![0.0],
                elapsed: Duration::ZERO,
            },
        };
        (config, session, calibration)
    }

    #[test]
    fn exact_rig_passes_all_thresholds() {
        let (config, session, calibration) = exact_calibration();
        let result = evaluate(&config, &session, &calibration);

        assert!(result.valid, "failures: {:?}", result.failures);
        assert!(result.global_rms_mm < 1e-9);
        assert_eq!(result.per_camera.len(), 3);
        for q in &result.per_camera {
            assert!(q.rms_px < 1e-9);
            assert_eq!(q.views_used, 8);
        }
        assert_eq!(result.baselines_mm.len(), 3);
        for b in &result.baselines_mm {
            assert!(b.distance_mm > 100.0, "ring cameras sit far apart");
        }
        assert_eq!(result.coverage.total_points, 8 * config.pattern.point_count());
        assert!(result.coverage.orientation_spread_deg > 5.0);
        assert!(result.coverage.volume_extent_mm[0] > 50.0);
    }

    #[test]
    fn tight_thresholds_mark_result_invalid() {
        let (mut config, session, mut calibration) = exact_calibration();
        config.thresholds.per_camera_rms_mm = 1e-15;
        config.thresholds.global_rms_mm = 1e-15;
        // Nudge one camera so residuals are nonzero.
        calibration.cameras[1].pose.translation.vector.x += 0.05;
        let result = evaluate(&config, &session, &calibration);

        assert!(!result.valid);
        assert!(result
            .failures
            .iter()
            .any(|f| matches!(f, ThresholdFailure::PerCameraRms { .. })));
        assert!(result
            .failures
            .iter()
            .any(|f| matches!(f, ThresholdFailure::GlobalRms { .. })));
    }

    #[test]
    fn outliers_are_excluded_from_rms() {
        let (config, mut session, mut calibration) = exact_calibration();
        // Corrupt one pixel badly, then flag it.
        let detection = session.views[0].detections[1].as_mut().unwrap();
        detection.points[5].x += 40.0;
        let clean = evaluate(&config, &session, &calibration);
        assert!(clean.per_camera[1].rms_px > 1.0);

        calibration.outliers.push(ObservationKey {
            view: 0,
            camera: 1,
            point: 5,
        });
        let masked = evaluate(&config, &session, &calibration);
        assert!(masked.per_camera[1].rms_px < 1e-9);
    }

    #[test]
    fn activation_gates_invalid_results() {
        let (config, session, calibration) = exact_calibration();
        let mut good = evaluate(&config, &session, &calibration);

        let mut active = ActiveCalibration::default();
        active.adopt(good.clone(), false).unwrap();
        assert!(active.current().is_some());

        good.valid = false;
        good.failures.push(ThresholdFailure::GlobalRms {
            rms_mm: 0.9,
            limit_mm: 0.5,
        });
        let err = active.adopt(good.clone(), false).unwrap_err();
        assert!(matches!(
            err,
            ActivationError::AccuracyThresholdViolation { .. }
        ));
        // The previous result stays in force after the rejection.
        assert!(active.current().map(|r| r.valid).unwrap_or(false));

        // Explicit operator acceptance adopts it anyway.
        active.adopt(good, true).unwrap();
        assert!(!active.current().map(|r| r.valid).unwrap_or(true));
    }
}
