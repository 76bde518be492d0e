//! Single-camera nonlinear refinement.
//!
//! Polishes the closed-form initialization by minimizing pixel
//! reprojection error over focal lengths, principal point, distortion
//! coefficients, and one target pose per view. Skew stays at its
//! initial value.

use log::debug;
use nalgebra::DVector;

use optival_core::camera::{Distortion, Intrinsics};
use optival_core::math::{Iso3, Pt3, Real, Vec2};
use optival_core::MIN_PROJECTION_DEPTH;
use optival_linear::PlanarObservations;

use crate::lm::{
    solve_lm, CancelToken, LeastSquaresProblem, LmOptions, LmSummary, SolveError,
};
use crate::pose::{read_pose, write_pose, POSE_DOF};

/// Starting point, usually the output of the closed-form stage.
#[derive(Debug, Clone)]
pub struct CameraRefineInit {
    pub intrinsics: Intrinsics,
    pub distortion: Distortion,
    /// One target-from-camera pose per view, aligned with the views.
    pub cam_se3_target: Vec<Iso3>,
}

#[derive(Debug, Clone, Default)]
pub struct CameraRefineOptions {
    /// Also optimize the third radial coefficient.
    pub fit_k3: bool,
    pub lm: LmOptions,
}

/// Refined camera model with its per-view poses and fit quality.
#[derive(Debug, Clone)]
pub struct CameraRefinement {
    pub intrinsics: Intrinsics,
    pub distortion: Distortion,
    pub cam_se3_target: Vec<Iso3>,
    /// Root-mean-square 2D reprojection error over all points, pixels.
    pub rms_px: Real,
    pub summary: LmSummary,
}

struct CameraRefineProblem<'a> {
    views: &'a [PlanarObservations],
    skew: Real,
    fit_k3: bool,
    total_points: usize,
}

impl CameraRefineProblem<'_> {
    fn distortion_len(&self) -> usize {
        if self.fit_k3 {
            5
        } else {
            4
        }
    }

    fn pose_base(&self) -> usize {
        4 + self.distortion_len()
    }

    fn unpack(&self, p: &DVector<Real>) -> (Intrinsics, Distortion) {
        let intrinsics = Intrinsics {
            fx: p[0],
            fy: p[1],
            cx: p[2],
            cy: p[3],
            skew: self.skew,
        };
        let distortion = Distortion {
            k1: p[4],
            k2: p[5],
            p1: p[6],
            p2: p[7],
            k3: if self.fit_k3 { p[8] } else { 0.0 },
        };
        (intrinsics, distortion)
    }
}

impl LeastSquaresProblem for CameraRefineProblem<'_> {
    fn residual_count(&self) -> usize {
        2 * self.total_points
    }

    fn parameter_count(&self) -> usize {
        self.pose_base() + POSE_DOF * self.views.len()
    }

    fn residuals(&self, params: &DVector<Real>, out: &mut DVector<Real>) -> bool {
        let (intrinsics, distortion) = self.unpack(params);
        let mut row = 0;
        for (v, view) in self.views.iter().enumerate() {
            let pose = read_pose(params, self.pose_base() + POSE_DOF * v);
            for (target, pixel) in view.target_points.iter().zip(&view.pixel_points) {
                let p_cam = pose * Pt3::new(target.x, target.y, 0.0);
                if p_cam.z <= MIN_PROJECTION_DEPTH {
                    return false;
                }
                let n = Vec2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z);
                let predicted = intrinsics.normalized_to_pixel(&distortion.distort(&n));
                out[row] = predicted.x - pixel.x;
                out[row + 1] = predicted.y - pixel.y;
                row += 2;
            }
        }
        true
    }
}

/// Jointly refine intrinsics, distortion, and per-view poses.
pub fn refine_camera(
    views: &[PlanarObservations],
    init: &CameraRefineInit,
    opts: &CameraRefineOptions,
    cancel: &CancelToken,
) -> Result<CameraRefinement, SolveError> {
    if views.is_empty() {
        return Err(SolveError::BadProblem("no views to refine against".into()));
    }
    if init.cam_se3_target.len() != views.len() {
        return Err(SolveError::BadProblem(format!(
            "{} initial poses for {} views",
            init.cam_se3_target.len(),
            views.len()
        )));
    }
    let mut total_points = 0;
    for (v, view) in views.iter().enumerate() {
        if view.target_points.len() != view.pixel_points.len() {
            return Err(SolveError::BadProblem(format!(
                "view {v} pairs {} target points with {} pixels",
                view.target_points.len(),
                view.pixel_points.len()
            )));
        }
        if view.target_points.is_empty() {
            return Err(SolveError::BadProblem(format!("view {v} is empty")));
        }
        total_points += view.target_points.len();
    }

    let problem = CameraRefineProblem {
        views,
        skew: init.intrinsics.skew,
        fit_k3: opts.fit_k3,
        total_points,
    };

    let mut x0 = DVector::zeros(problem.parameter_count());
    x0[0] = init.intrinsics.fx;
    x0[1] = init.intrinsics.fy;
    x0[2] = init.intrinsics.cx;
    x0[3] = init.intrinsics.cy;
    x0[4] = init.distortion.k1;
    x0[5] = init.distortion.k2;
    x0[6] = init.distortion.p1;
    x0[7] = init.distortion.p2;
    if opts.fit_k3 {
        x0[8] = init.distortion.k3;
    }
    for (v, pose) in init.cam_se3_target.iter().enumerate() {
        write_pose(&mut x0, problem.pose_base() + POSE_DOF * v, pose);
    }

    let result = solve_lm(&problem, x0, &opts.lm, cancel)?;

    let (intrinsics, distortion) = problem.unpack(&result.parameters);
    let cam_se3_target = (0..views.len())
        .map(|v| read_pose(&result.parameters, problem.pose_base() + POSE_DOF * v))
        .collect();

    let mut residuals = DVector::zeros(problem.residual_count());
    if !problem.residuals(&result.parameters, &mut residuals) {
        return Err(SolveError::OptimizationDivergence {
            reason: crate::lm::DivergenceReason::NonFinite,
            iterations: result.summary.iterations,
            last_cost: result.summary.final_cost,
        });
    }
    let rms_px = (residuals.norm_squared() / total_points as Real).sqrt();
    debug!(
        "camera refinement: {} views, {} points, rms {:.4} px, {}",
        views.len(),
        total_points,
        rms_px,
        result.summary.stop
    );

    Ok(CameraRefinement {
        intrinsics,
        distortion,
        cam_se3_target,
        rms_px,
        summary: result.summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use optival_core::math::{Pt2, Vec3};

    fn truth() -> (Intrinsics, Distortion) {
        (
            Intrinsics {
                fx: 1400.0,
                fy: 1450.0,
                cx: 960.0,
                cy: 540.0,
                skew: 0.0,
            },
            Distortion {
                k1: -0.2,
                k2: 0.05,
                p1: 0.001,
                p2: -0.0015,
                k3: 0.0,
            },
        )
    }

    fn target_grid() -> Vec<Pt2> {
        let mut pts = Vec::new();
        for r in 0..6 {
            for c in 0..7 {
                pts.push(Pt2::new(c as Real * 12.0, r as Real * 12.0));
            }
        }
        pts
    }

    fn project(
        intrinsics: &Intrinsics,
        distortion: &Distortion,
        pose: &Iso3,
        target: &Pt2,
    ) -> Pt2 {
        let p_cam = pose * Pt3::new(target.x, target.y, 0.0);
        let n = Vec2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z);
        intrinsics.normalized_to_pixel(&distortion.distort(&n))
    }

    fn synthetic_views() -> (Vec<PlanarObservations>, Vec<Iso3>) {
        let (intrinsics, distortion) = truth();
        let target = target_grid();
        let poses = vec![
            Iso3::new(Vec3::new(-40.0, -30.0, 300.0), Vec3::new(0.1, 0.05, 0.0)),
            Iso3::new(Vec3::new(-20.0, -45.0, 320.0), Vec3::new(-0.15, 0.2, 0.05)),
            Iso3::new(Vec3::new(-55.0, -25.0, 280.0), Vec3::new(0.2, -0.1, -0.08)),
            Iso3::new(Vec3::new(-30.0, -35.0, 340.0), Vec3::new(-0.05, -0.18, 0.12)),
        ];
        let views = poses
            .iter()
            .map(|pose| PlanarObservations {
                target_points: target.clone(),
                pixel_points: target
                    .iter()
                    .map(|t| project(&intrinsics, &distortion, pose, t))
                    .collect(),
            })
            .collect();
        (views, poses)
    }

    #[test]
    fn recovers_model_from_perturbed_start() {
        let (intrinsics, distortion) = truth();
        let (views, poses) = synthetic_views();

        let init = CameraRefineInit {
            intrinsics: Intrinsics {
                fx: intrinsics.fx + 40.0,
                fy: intrinsics.fy - 25.0,
                cx: intrinsics.cx - 15.0,
                cy: intrinsics.cy + 10.0,
                skew: 0.0,
            },
            distortion: Distortion::default(),
            cam_se3_target: poses
                .iter()
                .map(|p| Iso3::new(Vec3::new(1.0, -0.5, 4.0), Vec3::new(0.01, -0.02, 0.015)) * p)
                .collect(),
        };

        let refined = refine_camera(
            &views,
            &init,
            &CameraRefineOptions::default(),
            &CancelToken::new(),
        )
        .unwrap();

        assert!(refined.rms_px < 1e-6, "rms {}", refined.rms_px);
        assert!((refined.intrinsics.fx - intrinsics.fx).abs() < 1e-3);
        assert!((refined.intrinsics.fy - intrinsics.fy).abs() < 1e-3);
        assert!((refined.intrinsics.cx - intrinsics.cx).abs() < 1e-3);
        assert!((refined.intrinsics.cy - intrinsics.cy).abs() < 1e-3);
        assert!((refined.distortion.k1 - distortion.k1).abs() < 1e-4);
        assert!((refined.distortion.p1 - distortion.p1).abs() < 1e-5);
    }

    #[test]
    fn reports_pose_count_mismatch() {
        let (views, poses) = synthetic_views();
        let (intrinsics, distortion) = truth();
        let init = CameraRefineInit {
            intrinsics,
            distortion,
            cam_se3_target: poses[..2].to_vec(),
        };
        assert!(matches!(
            refine_camera(
                &views,
                &init,
                &CameraRefineOptions::default(),
                &CancelToken::new()
            ),
            Err(SolveError::BadProblem(_))
        ));
    }

    #[test]
    fn exact_start_converges_immediately() {
        let (intrinsics, distortion) = truth();
        let (views, poses) = synthetic_views();
        let init = CameraRefineInit {
            intrinsics,
            distortion,
            cam_se3_target: poses,
        };

        let refined = refine_camera(
            &views,
            &init,
            &CameraRefineOptions::default(),
            &CancelToken::new(),
        )
        .unwrap();
        assert!(refined.summary.stop.converged());
        assert!(refined.rms_px < 1e-9);
    }
}
