//! Full-rig calibration from a finalized capture session.
//!
//! The run proceeds in four steps, each a free function over a
//! [`CalibrationRun`]:
//!
//! 1. [`step_init_cameras`]: per-camera linear initialization
//!    (homographies, Zhang intrinsics, distortion, pose seeds).
//! 2. [`step_refine_cameras`]: per-camera nonlinear refinement.
//! 3. [`step_seed_rig`]: chain refined target poses through the
//!    reference camera into a rig seed. The reference camera frame is
//!    the rig frame.
//! 4. [`step_adjust_rig`]: global bundle adjustment of the non-reference
//!    camera poses with outlier rejection.
//!
//! Steps record their outcome in the run log so an operator can see
//! where a failed run stopped. [`run_calibration`] drives all four.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::info;
use rayon::prelude::*;
use thiserror::Error;

use optival_core::config::OptimOptions;
use optival_core::math::{rotation_angle_between, Iso3, Pt2, Pt3, Real};
use optival_core::types::{CameraId, CaptureSession};
use optival_core::{CameraModel, RigConfig};
use optival_linear::{
    estimate_camera_init, estimate_rig_init, pose_from_homography, CameraInit,
    IntrinsicsInitOptions, PlanarObservations, RigInit, RigInitError,
};
use optival_optim::{
    adjust_rig, refine_camera, CameraRefineInit, CameraRefineOptions, CameraRefinement,
    CancelToken, LmOptions, LmSummary, ObservationKey, RigAdjustOptions, RigViewObservations,
    RobustLoss, SolveError,
};

/// Pose seeds closer than this in rotation count as one target
/// orientation; Zhang's method needs three distinct ones.
const MIN_ORIENTATION_SPREAD_DEG: Real = 2.0;

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CalibrateError {
    /// A camera's observations cannot support calibration: too few
    /// views, degenerate geometry, or no overlap with the reference.
    #[error("camera {camera}: insufficient calibration data ({reason})")]
    InsufficientCalibrationData { camera: CameraId, reason: String },
    #[error("rig seed failed: {0}")]
    RigSeed(RigInitError),
    #[error(transparent)]
    Optimization(#[from] SolveError),
    #[error("prerequisite step has not run: {0}")]
    NotReady(&'static str),
    #[error("run rejected: {0}")]
    Config(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Run state
// ─────────────────────────────────────────────────────────────────────────────

/// Linear estimate for one camera, before refinement.
#[derive(Debug, Clone)]
pub struct CameraSeed {
    pub camera: CameraId,
    /// Session view indices this camera has detections in.
    pub views_used: Vec<usize>,
    /// Correspondences per used view, raw pixels.
    pub views: Vec<PlanarObservations>,
    pub init: CameraInit,
    /// Pose seeds aligned with `views_used`.
    pub cam_se3_target: Vec<Iso3>,
}

/// Refined single-camera model.
#[derive(Debug, Clone)]
pub struct CameraSolution {
    pub camera: CameraId,
    pub views_used: Vec<usize>,
    pub refinement: CameraRefinement,
}

/// Calibrated rig: the output of a completed run.
#[derive(Debug, Clone)]
pub struct RigCalibration {
    /// Camera models with adjusted poses, rig frame = reference camera
    /// frame.
    pub cameras: Vec<CameraModel>,
    /// Target placement per session view, in the rig frame.
    pub world_se3_target: Vec<Iso3>,
    /// Pattern points per session view, in the rig frame.
    pub world_points: Vec<Vec<Pt3>>,
    /// Observations the adjustment excluded.
    pub outliers: Vec<ObservationKey>,
    /// Reprojection RMS over inlier observations of all cameras.
    pub rig_rms_px: f64,
    pub summary: LmSummary,
}

/// Intermediate artifacts, populated as the steps run. Re-running a
/// step clears everything downstream of it.
#[derive(Debug, Default)]
pub struct RunState {
    pub camera_seeds: Option<Vec<CameraSeed>>,
    pub camera_solutions: Option<Vec<CameraSolution>>,
    pub rig_seed: Option<RigInit>,
    pub calibration: Option<RigCalibration>,
}

/// One log line per executed step.
#[derive(Debug, Clone)]
pub struct RunRecord {
    /// Unix seconds when the step finished.
    pub timestamp: i64,
    pub operation: String,
    pub ok: bool,
    pub notes: String,
}

/// A calibration run over one finalized session.
#[derive(Debug)]
pub struct CalibrationRun {
    config: RigConfig,
    session: CaptureSession,
    pub state: RunState,
    log: Vec<RunRecord>,
}

impl CalibrationRun {
    pub fn new(config: RigConfig, session: CaptureSession) -> anyhow::Result<Self> {
        config.validate()?;
        anyhow::ensure!(
            session.camera_count == config.camera_count,
            "session has {} camera slots, rig configured for {}",
            session.camera_count,
            config.camera_count
        );
        Ok(Self {
            config,
            session,
            state: RunState::default(),
            log: Vec::new(),
        })
    }

    pub fn config(&self) -> &RigConfig {
        &self.config
    }

    pub fn session(&self) -> &CaptureSession {
        &self.session
    }

    pub fn log(&self) -> &[RunRecord] {
        &self.log
    }

    fn log_success_with_notes(&mut self, operation: &str, notes: String) {
        info!("{operation}: {notes}");
        self.log.push(RunRecord {
            timestamp: unix_now(),
            operation: operation.to_string(),
            ok: true,
            notes,
        });
    }

    fn log_failure(&mut self, operation: &str, notes: String) {
        self.log.push(RunRecord {
            timestamp: unix_now(),
            operation: operation.to_string(),
            ok: false,
            notes,
        });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helper functions
// ─────────────────────────────────────────────────────────────────────────────

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn lm_options(optim: &OptimOptions, timeout_s: Option<f64>) -> LmOptions {
    LmOptions {
        max_iterations: optim.max_iterations,
        loss: match optim.huber_scale_px {
            Some(scale) => RobustLoss::Huber { scale },
            None => RobustLoss::None,
        },
        timeout: timeout_s.map(Duration::from_secs_f64),
        ..LmOptions::default()
    }
}

/// Greedy count of pose seeds whose rotations differ pairwise by more
/// than the minimum spread.
fn distinct_orientations(poses: &[Iso3], min_angle_rad: Real) -> usize {
    let mut kept: Vec<&Iso3> = Vec::new();
    for pose in poses {
        if kept
            .iter()
            .all(|k| rotation_angle_between(k, pose) > min_angle_rad)
        {
            kept.push(pose);
        }
    }
    kept.len()
}

fn init_one_camera(
    config: &RigConfig,
    session: &CaptureSession,
    cam: usize,
) -> Result<CameraSeed, CalibrateError> {
    let camera = CameraId(cam as u32);
    let target_points: Vec<Pt2> = config
        .pattern
        .object_points()
        .iter()
        .map(|p| Pt2::new(p.x, p.y))
        .collect();

    let mut views_used = Vec::new();
    let mut views = Vec::new();
    for (v, view) in session.views.iter().enumerate() {
        if let Some(detection) = &view.detections[cam] {
            views_used.push(v);
            views.push(PlanarObservations {
                target_points: target_points.clone(),
                pixel_points: detection.points.clone(),
            });
        }
    }
    if views_used.len() < crate::capture::MIN_VIEWS_PER_CAMERA {
        return Err(CalibrateError::InsufficientCalibrationData {
            camera,
            reason: format!(
                "{} views with detections, need at least {}",
                views_used.len(),
                crate::capture::MIN_VIEWS_PER_CAMERA
            ),
        });
    }

    let init = estimate_camera_init(&views, IntrinsicsInitOptions::default()).map_err(|e| {
        CalibrateError::InsufficientCalibrationData {
            camera,
            reason: e.to_string(),
        }
    })?;

    let k = init.intrinsics.k_matrix();
    let cam_se3_target = init
        .homographies
        .iter()
        .map(|h| pose_from_homography(&k, h))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CalibrateError::InsufficientCalibrationData {
            camera,
            reason: e.to_string(),
        })?;

    let spread = MIN_ORIENTATION_SPREAD_DEG.to_radians();
    if distinct_orientations(&cam_se3_target, spread) < 3 {
        return Err(CalibrateError::InsufficientCalibrationData {
            camera,
            reason: format!(
                "target orientations span under {MIN_ORIENTATION_SPREAD_DEG} degrees"
            ),
        });
    }

    Ok(CameraSeed {
        camera,
        views_used,
        views,
        init,
        cam_se3_target,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Step functions
// ─────────────────────────────────────────────────────────────────────────────

/// Linear per-camera initialization: homographies, Zhang intrinsics
/// with distortion alternation, and planar pose seeds. Cameras are
/// processed in parallel.
pub fn step_init_cameras(run: &mut CalibrationRun) -> Result<(), CalibrateError> {
    let seeds: Result<Vec<CameraSeed>, CalibrateError> = (0..run.config.camera_count)
        .into_par_iter()
        .map(|cam| init_one_camera(&run.config, &run.session, cam))
        .collect();
    let seeds = match seeds {
        Ok(s) => s,
        Err(e) => {
            run.log_failure("init_cameras", e.to_string());
            return Err(e);
        }
    };

    let notes = seeds
        .iter()
        .map(|s| {
            format!(
                "{}: fx={:.1} fy={:.1} ({} views)",
                s.camera,
                s.init.intrinsics.fx,
                s.init.intrinsics.fy,
                s.views_used.len()
            )
        })
        .collect::<Vec<_>>()
        .join(", ");
    run.state.camera_seeds = Some(seeds);
    run.state.camera_solutions = None;
    run.state.rig_seed = None;
    run.state.calibration = None;
    run.log_success_with_notes("init_cameras", notes);
    Ok(())
}

/// Nonlinear per-camera refinement of intrinsics, distortion, and view
/// poses. Requires [`step_init_cameras`].
pub fn step_refine_cameras(
    run: &mut CalibrationRun,
    cancel: &CancelToken,
) -> Result<(), CalibrateError> {
    let seeds = run
        .state
        .camera_seeds
        .as_ref()
        .ok_or(CalibrateError::NotReady("init_cameras"))?;

    let opts = CameraRefineOptions {
        fit_k3: false,
        lm: lm_options(&run.config.optim, None),
    };
    let solutions: Result<Vec<CameraSolution>, SolveError> = seeds
        .par_iter()
        .map(|seed| {
            let init = CameraRefineInit {
                intrinsics: seed.init.intrinsics,
                distortion: seed.init.distortion,
                cam_se3_target: seed.cam_se3_target.clone(),
            };
            let refinement = refine_camera(&seed.views, &init, &opts, cancel)?;
            Ok(CameraSolution {
                camera: seed.camera,
                views_used: seed.views_used.clone(),
                refinement,
            })
        })
        .collect();
    let solutions = match solutions {
        Ok(s) => s,
        Err(e) => {
            run.log_failure("refine_cameras", e.to_string());
            return Err(e.into());
        }
    };

    let notes = solutions
        .iter()
        .map(|s| format!("{}: rms {:.4} px", s.camera, s.refinement.rms_px))
        .collect::<Vec<_>>()
        .join(", ");
    run.state.camera_solutions = Some(solutions);
    run.state.rig_seed = None;
    run.state.calibration = None;
    run.log_success_with_notes("refine_cameras", notes);
    Ok(())
}

/// Chain refined target poses through the reference camera into a rig
/// seed. Requires [`step_refine_cameras`].
pub fn step_seed_rig(run: &mut CalibrationRun) -> Result<(), CalibrateError> {
    let solutions = run
        .state
        .camera_solutions
        .as_ref()
        .ok_or(CalibrateError::NotReady("refine_cameras"))?;

    let num_views = run.session.num_views();
    let mut grid: Vec<Vec<Option<Iso3>>> =
        vec![vec![None; run.config.camera_count]; num_views];
    for solution in solutions {
        for (i, &v) in solution.views_used.iter().enumerate() {
            grid[v][solution.camera.index()] = Some(solution.refinement.cam_se3_target[i]);
        }
    }

    let reference = run.config.reference_camera.index();
    let seed = match estimate_rig_init(&grid, reference) {
        Ok(s) => s,
        Err(RigInitError::NoOverlap(cam)) => {
            let e = CalibrateError::InsufficientCalibrationData {
                camera: CameraId(cam as u32),
                reason: "no views shared with the reference camera".to_string(),
            };
            run.log_failure("seed_rig", e.to_string());
            return Err(e);
        }
        Err(e) => {
            let e = CalibrateError::RigSeed(e);
            run.log_failure("seed_rig", e.to_string());
            return Err(e);
        }
    };

    run.log_success_with_notes(
        "seed_rig",
        format!("{} cameras chained through {}", seed.cam_se3_world.len(), run.config.reference_camera),
    );
    run.state.rig_seed = Some(seed);
    run.state.calibration = None;
    Ok(())
}

/// Global bundle adjustment of the non-reference camera poses, with
/// post-convergence outlier rejection. Requires [`step_seed_rig`].
pub fn step_adjust_rig(
    run: &mut CalibrationRun,
    cancel: &CancelToken,
) -> Result<(), CalibrateError> {
    let solutions = run
        .state
        .camera_solutions
        .as_ref()
        .ok_or(CalibrateError::NotReady("refine_cameras"))?;
    let seed = run
        .state
        .rig_seed
        .as_ref()
        .ok_or(CalibrateError::NotReady("seed_rig"))?;

    let cameras: Vec<CameraModel> = solutions
        .iter()
        .zip(&seed.cam_se3_world)
        .map(|(s, pose)| CameraModel {
            id: s.camera,
            intrinsics: s.refinement.intrinsics,
            distortion: s.refinement.distortion,
            pose: *pose,
        })
        .collect();
    let world_se3_target = seed.world_se3_target.clone();

    let object_points = run.config.pattern.object_points();
    let world_points: Vec<Vec<Pt3>> = world_se3_target
        .iter()
        .map(|wt| object_points.iter().map(|p| wt.transform_point(p)).collect())
        .collect();
    let views: Vec<RigViewObservations> = run
        .session
        .views
        .iter()
        .zip(&world_points)
        .map(|(view, points)| RigViewObservations {
            world_points: points.clone(),
            pixels: view
                .detections
                .iter()
                .map(|d| d.as_ref().map(|det| det.points.clone()))
                .collect(),
        })
        .collect();

    let opts = RigAdjustOptions {
        outlier_threshold_px: run.config.optim.outlier_threshold_px,
        lm: lm_options(&run.config.optim, run.config.optim.timeout_s),
    };
    let reference = run.config.reference_camera.index();
    let adjustment = match adjust_rig(&cameras, &views, reference, &opts, cancel) {
        Ok(a) => a,
        Err(e) => {
            run.log_failure("adjust_rig", e.to_string());
            return Err(e.into());
        }
    };

    let mut cameras = cameras;
    for (camera, pose) in cameras.iter_mut().zip(&adjustment.cam_se3_world) {
        camera.pose = *pose;
    }
    run.log_success_with_notes(
        "adjust_rig",
        format!(
            "rms {:.4} px, {} outliers flagged",
            adjustment.rms_px,
            adjustment.outliers.len()
        ),
    );
    run.state.calibration = Some(RigCalibration {
        cameras,
        world_se3_target,
        world_points,
        outliers: adjustment.outliers,
        rig_rms_px: adjustment.rms_px,
        summary: adjustment.summary,
    });
    Ok(())
}

/// Drive all four steps over a finalized session.
pub fn run_calibration(
    config: RigConfig,
    session: CaptureSession,
    cancel: &CancelToken,
) -> Result<RigCalibration, CalibrateError> {
    let mut run = CalibrationRun::new(config, session)
        .map_err(|e| CalibrateError::Config(e.to_string()))?;
    step_init_cameras(&mut run)?;
    step_refine_cameras(&mut run, cancel)?;
    step_seed_rig(&mut run)?;
    step_adjust_rig(&mut run, cancel)?;
    run.state
        .calibration
        .take()
        .ok_or(CalibrateError::NotReady("adjust_rig"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Translation3, UnitQuaternion};
    use optival_core::math::Vec3;
    use optival_core::synthetic::{
        default_intrinsics, pattern_placements, project_pattern_views, ring_cameras,
    };

    fn test_scene() -> (RigConfig, Vec<CameraModel>, CaptureSession) {
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
        (config, cameras, session)
    }

    fn pose_gap_mm(a: &Iso3, b: &Iso3) -> f64 {
        let probes = [
            Pt3::origin(),
            Pt3::new(50.0, 0.0, 0.0),
            Pt3::new(0.0, 50.0, 0.0),
            Pt3::new(0.0, 0.0, 50.0),
        ];
        probes
            .iter()
            .map(|p| (a.transform_point(p) - b.transform_point(p)).norm())
            .fold(0.0, f64::max)
    }

    #[test]
    fn full_run_recovers_rig_from_exact_views() {
        let (config, truth, session) = test_scene();
        let calibration =
            run_calibration(config, session, &CancelToken::new()).unwrap();

        assert!(calibration.outliers.is_empty());
        assert!(calibration.rig_rms_px < 1e-5, "rms {}", calibration.rig_rms_px);
        for camera in &calibration.cameras {
            assert!((camera.intrinsics.fx - 1500.0).abs() < 1e-2);
            assert!((camera.intrinsics.fy - 1500.0).abs() < 1e-2);
        }
        // Recovered poses live in the reference camera frame.
        let reference = truth[0].pose;
        for (got, gt) in calibration.cameras.iter().zip(&truth) {
            let expected = gt.pose * reference.inverse();
            let gap = pose_gap_mm(&got.pose, &expected);
            assert!(gap < 1e-2, "pose gap {gap} mm for {}", got.id);
        }
    }

    #[test]
    fn steps_log_their_progress() {
        let (config, _, session) = test_scene();
        let mut run = CalibrationRun::new(config, session).unwrap();
        let cancel = CancelToken::new();

        step_init_cameras(&mut run).unwrap();
        step_refine_cameras(&mut run, &cancel).unwrap();
        step_seed_rig(&mut run).unwrap();
        step_adjust_rig(&mut run, &cancel).unwrap();

        let ops: Vec<&str> = run.log().iter().map(|r| r.operation.as_str()).collect();
        assert_eq!(
            ops,
            ["init_cameras", "refine_cameras", "seed_rig", "adjust_rig"]
        );
        assert!(run.log().iter().all(|r| r.ok));
        assert!(run.state.calibration.is_some());
    }

    #[test]
    fn steps_require_their_prerequisites() {
        let (config, _, session) = test_scene();
        let mut run = CalibrationRun::new(config, session).unwrap();
        assert!(matches!(
            step_refine_cameras(&mut run, &CancelToken::new()),
            Err(CalibrateError::NotReady("init_cameras"))
        ));
        assert!(matches!(
            step_seed_rig(&mut run),
            Err(CalibrateError::NotReady("refine_cameras"))
        ));
    }

    #[test]
    fn starved_camera_reports_insufficient_data() {
        let (config, _, session) = test_scene();
        let mut views = session.views.clone();
        // Camera 2 keeps detections in only two views.
        for view in views.iter_mut().skip(2) {
            view.detections[2] = None;
        }
        let session = CaptureSession::new(config.pattern.clone(), 3, views).unwrap();

        match run_calibration(config, session, &CancelToken::new()) {
            Err(CalibrateError::InsufficientCalibrationData { camera, .. }) => {
                assert_eq!(camera, CameraId(2));
            }
            other => panic!("expected InsufficientCalibrationData, got {other:?}"),
        }
    }

    #[test]
    fn coplanar_orientations_report_insufficient_data() {
        let config = RigConfig {
            camera_count: 3,
            ..RigConfig::default()
        };
        let cameras = ring_cameras(3, 300.0, 35.0, default_intrinsics(1920, 1080));
        // Same tilt in every view; only the translation changes.
        let tilt = UnitQuaternion::from_scaled_axis(Vec3::x() * 0.2);
        let placements: Vec<Iso3> = (0..4)
            .map(|i| {
                Iso3::from_parts(
                    Translation3::new(15.0 * i as f64 - 22.5, 0.0, 0.0),
                    tilt,
                )
            })
            .collect();
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

        assert!(matches!(
            run_calibration(config, session, &CancelToken::new()),
            Err(CalibrateError::InsufficientCalibrationData { .. })
        ));
    }

    #[test]
    fn cancelled_run_aborts_in_refinement() {
        let (config, _, session) = test_scene();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            run_calibration(config, session, &cancel),
            Err(CalibrateError::Optimization(SolveError::Cancelled(_)))
        ));
    }

    #[test]
    fn zero_budget_surfaces_divergence() {
        let (mut config, _, session) = test_scene();
        config.optim.timeout_s = Some(1e-9);

        match run_calibration(config, session, &CancelToken::new()) {
            Err(CalibrateError::Optimization(SolveError::OptimizationDivergence {
                ..
            })) => {}
            other => panic!("expected divergence, got {other:?}"),
        }
    }
}
