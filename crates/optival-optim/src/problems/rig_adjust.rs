//! Global pose adjustment for a multi-camera rig.
//!
//! Intrinsics, distortion, and the world-frame target points are held
//! fixed; the only free parameters are the poses of the non-reference
//! cameras. The reference camera keeps the pose it was handed, which
//! pins the gauge: with it fixed, the world frame is fully determined
//! and no gauge freedom is left in the problem.
//!
//! After the first solve, observations whose reprojection error exceeds
//! the outlier threshold are flagged and the remaining inliers are
//! refined once more from the first solution.

use log::{debug, info};
use nalgebra::DVector;

use optival_core::math::{Iso3, Pt2, Pt3, Real, Vec2};
use optival_core::{CameraModel, MIN_PROJECTION_DEPTH};

use crate::lm::{
    solve_lm, CancelToken, LeastSquaresProblem, LmOptions, LmSummary, SolveError,
};
use crate::pose::{read_pose, write_pose, POSE_DOF};

/// Identifies one camera's sighting of one target point in one view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObservationKey {
    pub view: usize,
    pub camera: usize,
    pub point: usize,
}

/// One captured view: target points in the world frame plus what each
/// camera saw. `pixels[c]` is `None` when camera `c` missed the view,
/// otherwise it is index-aligned with `world_points`.
#[derive(Debug, Clone)]
pub struct RigViewObservations {
    pub world_points: Vec<Pt3>,
    pub pixels: Vec<Option<Vec<Pt2>>>,
}

#[derive(Debug, Clone)]
pub struct RigAdjustOptions {
    /// Reprojection error above which an observation is flagged, pixels.
    pub outlier_threshold_px: Real,
    pub lm: LmOptions,
}

impl Default for RigAdjustOptions {
    fn default() -> Self {
        Self {
            outlier_threshold_px: 2.0,
            lm: LmOptions::default(),
        }
    }
}

/// Adjusted rig with the observations that were set aside.
#[derive(Debug, Clone)]
pub struct RigAdjustment {
    /// World-from-camera is the inverse; this is camera-from-world,
    /// one entry per camera, reference included unchanged.
    pub cam_se3_world: Vec<Iso3>,
    pub outliers: Vec<ObservationKey>,
    /// Root-mean-square 2D reprojection error over inliers of all
    /// cameras, reference included, pixels.
    pub rms_px: Real,
    pub summary: LmSummary,
}

struct Row {
    key: ObservationKey,
    world: Pt3,
    pixel: Pt2,
}

struct RigAdjustProblem<'a> {
    cameras: &'a [CameraModel],
    reference: usize,
    rows: Vec<Row>,
}

impl RigAdjustProblem<'_> {
    fn slot(&self, camera: usize) -> usize {
        if camera < self.reference {
            camera
        } else {
            camera - 1
        }
    }

    fn pose_of(&self, params: &DVector<Real>, camera: usize) -> Iso3 {
        if camera == self.reference {
            self.cameras[camera].pose
        } else {
            read_pose(params, POSE_DOF * self.slot(camera))
        }
    }
}

fn predict(camera: &CameraModel, pose: &Iso3, world: &Pt3) -> Option<Pt2> {
    let p_cam = pose * world;
    if p_cam.z <= MIN_PROJECTION_DEPTH {
        return None;
    }
    let n = Vec2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z);
    Some(
        camera
            .intrinsics
            .normalized_to_pixel(&camera.distortion.distort(&n)),
    )
}

impl LeastSquaresProblem for RigAdjustProblem<'_> {
    fn residual_count(&self) -> usize {
        2 * self.rows.len()
    }

    fn parameter_count(&self) -> usize {
        POSE_DOF * (self.cameras.len() - 1)
    }

    fn residuals(&self, params: &DVector<Real>, out: &mut DVector<Real>) -> bool {
        for (i, row) in self.rows.iter().enumerate() {
            let pose = self.pose_of(params, row.key.camera);
            let Some(predicted) = predict(&self.cameras[row.key.camera], &pose, &row.world)
            else {
                return false;
            };
            out[2 * i] = predicted.x - row.pixel.x;
            out[2 * i + 1] = predicted.y - row.pixel.y;
        }
        true
    }
}

fn validate(
    cameras: &[CameraModel],
    views: &[RigViewObservations],
    reference: usize,
) -> Result<(), SolveError> {
    if cameras.len() < 2 {
        return Err(SolveError::BadProblem(format!(
            "rig adjustment needs at least 2 cameras, got {}",
            cameras.len()
        )));
    }
    if reference >= cameras.len() {
        return Err(SolveError::BadProblem(format!(
            "reference camera {reference} out of range for {} cameras",
            cameras.len()
        )));
    }
    if views.is_empty() {
        return Err(SolveError::BadProblem("no views to adjust against".into()));
    }
    for (v, view) in views.iter().enumerate() {
        if view.pixels.len() != cameras.len() {
            return Err(SolveError::BadProblem(format!(
                "view {v} lists {} cameras, rig has {}",
                view.pixels.len(),
                cameras.len()
            )));
        }
        if view.world_points.is_empty() {
            return Err(SolveError::BadProblem(format!("view {v} has no points")));
        }
        for (c, pixels) in view.pixels.iter().enumerate() {
            if let Some(px) = pixels {
                if px.len() != view.world_points.len() {
                    return Err(SolveError::BadProblem(format!(
                        "view {v} camera {c}: {} pixels for {} points",
                        px.len(),
                        view.world_points.len()
                    )));
                }
            }
        }
    }
    Ok(())
}

fn collect_rows(
    views: &[RigViewObservations],
    cameras: usize,
    reference: usize,
    excluded: &[ObservationKey],
) -> Vec<Row> {
    let mut rows = Vec::new();
    for (v, view) in views.iter().enumerate() {
        for c in 0..cameras {
            if c == reference {
                continue;
            }
            let Some(pixels) = &view.pixels[c] else {
                continue;
            };
            for (p, pixel) in pixels.iter().enumerate() {
                let key = ObservationKey {
                    view: v,
                    camera: c,
                    point: p,
                };
                if excluded.contains(&key) {
                    continue;
                }
                rows.push(Row {
                    key,
                    world: view.world_points[p],
                    pixel: *pixel,
                });
            }
        }
    }
    rows
}

/// Reprojection error of every observation, reference camera included,
/// under the given poses. `None` marks a point that fails to project.
fn scan_errors(
    cameras: &[CameraModel],
    views: &[RigViewObservations],
    poses: &[Iso3],
) -> Vec<(ObservationKey, Option<Real>)> {
    let mut errors = Vec::new();
    for (v, view) in views.iter().enumerate() {
        for (c, pixels) in view.pixels.iter().enumerate() {
            let Some(pixels) = pixels else { continue };
            for (p, pixel) in pixels.iter().enumerate() {
                let key = ObservationKey {
                    view: v,
                    camera: c,
                    point: p,
                };
                let err = predict(&cameras[c], &poses[c], &view.world_points[p])
                    .map(|predicted| (predicted - pixel).norm());
                errors.push((key, err));
            }
        }
    }
    errors
}

fn solve_once(
    cameras: &[CameraModel],
    views: &[RigViewObservations],
    reference: usize,
    excluded: &[ObservationKey],
    seed: &[Iso3],
    lm: &LmOptions,
    cancel: &CancelToken,
) -> Result<(Vec<Iso3>, LmSummary), SolveError> {
    let rows = collect_rows(views, cameras.len(), reference, excluded);
    let problem = RigAdjustProblem {
        cameras,
        reference,
        rows,
    };

    let mut seen = vec![false; cameras.len()];
    for row in &problem.rows {
        seen[row.key.camera] = true;
    }
    for (c, seen) in seen.iter().enumerate() {
        if c != reference && !seen {
            return Err(SolveError::BadProblem(format!(
                "camera {c} has no usable observations"
            )));
        }
    }

    let mut x0 = DVector::zeros(problem.parameter_count());
    for (c, pose) in seed.iter().enumerate() {
        if c != reference {
            write_pose(&mut x0, POSE_DOF * problem.slot(c), pose);
        }
    }

    let result = solve_lm(&problem, x0, lm, cancel)?;
    let poses = (0..cameras.len())
        .map(|c| problem.pose_of(&result.parameters, c))
        .collect();
    Ok((poses, result.summary))
}

/// Adjust the non-reference camera poses against all views at once.
pub fn adjust_rig(
    cameras: &[CameraModel],
    views: &[RigViewObservations],
    reference: usize,
    opts: &RigAdjustOptions,
    cancel: &CancelToken,
) -> Result<RigAdjustment, SolveError> {
    validate(cameras, views, reference)?;

    let seed: Vec<Iso3> = cameras.iter().map(|c| c.pose).collect();
    let (poses, summary) = solve_once(cameras, views, reference, &[], &seed, &opts.lm, cancel)?;

    // Flag outliers against the converged solution, then refine the
    // surviving observations once more.
    let outliers: Vec<ObservationKey> = scan_errors(cameras, views, &poses)
        .into_iter()
        .filter(|(_, err)| err.is_none_or(|e| e > opts.outlier_threshold_px))
        .map(|(key, _)| key)
        .collect();

    let (poses, summary) = if outliers.is_empty() {
        (poses, summary)
    } else {
        info!(
            "rig adjustment: {} observations past {:.2} px, refining inliers",
            outliers.len(),
            opts.outlier_threshold_px
        );
        solve_once(cameras, views, reference, &outliers, &poses, &opts.lm, cancel)?
    };

    let mut sum_sq = 0.0;
    let mut inliers = 0usize;
    for (key, err) in scan_errors(cameras, views, &poses) {
        if outliers.contains(&key) {
            continue;
        }
        if let Some(err) = err {
            sum_sq += err * err;
            inliers += 1;
        }
    }
    if inliers == 0 {
        return Err(SolveError::BadProblem(
            "every observation was flagged as an outlier".into(),
        ));
    }
    let rms_px = (sum_sq / inliers as Real).sqrt();
    debug!(
        "rig adjustment: {} inliers, {} outliers, rms {:.4} px, {}",
        inliers,
        outliers.len(),
        rms_px,
        summary.stop
    );

    Ok(RigAdjustment {
        cam_se3_world: poses,
        outliers,
        rms_px,
        summary,
    })
}
