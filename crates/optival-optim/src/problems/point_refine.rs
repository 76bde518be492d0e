//! Reprojection refinement of a triangulated point.
//!
//! Starting from the linear triangulation, the 3D position is polished
//! against the raw pixel observations of every sighting camera. The
//! Jacobian is analytic, differentiated through the full projection
//! chain including distortion, and doubles as the basis for the
//! reported position covariance.

use nalgebra::{DMatrix, DVector, Matrix2, Matrix2x3};

use optival_core::math::{Mat3, Pt2, Pt3, Real, Vec2};
use optival_core::{CameraModel, MIN_PROJECTION_DEPTH};

use crate::lm::{
    solve_lm, CancelToken, LeastSquaresProblem, LmOptions, LmSummary, SolveError,
};

#[derive(Debug, Clone)]
pub struct PointRefineOptions {
    /// Lower bound on the pixel noise assumed by the covariance. Keeps
    /// near-perfect fits from reporting implausibly tight uncertainty.
    pub sigma_floor_px: Real,
    pub lm: LmOptions,
}

impl Default for PointRefineOptions {
    fn default() -> Self {
        Self {
            sigma_floor_px: 0.1,
            lm: LmOptions::default(),
        }
    }
}

/// Refined position with its uncertainty description.
#[derive(Debug, Clone)]
pub struct RefinedPoint {
    pub position_mm: Pt3,
    /// Covariance of the position estimate, millimetres squared.
    pub covariance_mm2: Mat3,
    /// Root-mean-square 2D reprojection error over the sightings, pixels.
    pub rms_px: Real,
    /// Mean pairwise angle between observation rays, degrees. Small
    /// angles mean poorly conditioned depth.
    pub mean_ray_angle_deg: Real,
    pub summary: LmSummary,
}

struct PointRefineProblem<'a> {
    observations: &'a [(&'a CameraModel, Pt2)],
}

fn project(camera: &CameraModel, world: &Pt3) -> Option<Pt2> {
    let p_cam = camera.pose * world;
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

/// Derivative of the projected pixel with respect to the world point.
fn projection_jacobian(camera: &CameraModel, world: &Pt3) -> Option<Matrix2x3<Real>> {
    let p_cam = camera.pose * world;
    let z = p_cam.z;
    if z <= MIN_PROJECTION_DEPTH {
        return None;
    }
    let x = p_cam.x / z;
    let y = p_cam.y / z;

    let d = &camera.distortion;
    let r2 = x * x + y * y;
    let radial = 1.0 + d.k1 * r2 + d.k2 * r2 * r2 + d.k3 * r2 * r2 * r2;
    let a = d.k1 + 2.0 * d.k2 * r2 + 3.0 * d.k3 * r2 * r2;

    let dxd_dx = radial + 2.0 * x * x * a + 2.0 * d.p1 * y + 6.0 * d.p2 * x;
    let dxd_dy = 2.0 * x * y * a + 2.0 * d.p1 * x + 2.0 * d.p2 * y;
    let dyd_dx = dxd_dy;
    let dyd_dy = radial + 2.0 * y * y * a + 6.0 * d.p1 * y + 2.0 * d.p2 * x;

    let k = &camera.intrinsics;
    let pixel_from_normalized = Matrix2::new(
        k.fx * dxd_dx + k.skew * dyd_dx,
        k.fx * dxd_dy + k.skew * dyd_dy,
        k.fy * dyd_dx,
        k.fy * dyd_dy,
    );
    let normalized_from_cam = Matrix2x3::new(
        1.0 / z,
        0.0,
        -p_cam.x / (z * z),
        0.0,
        1.0 / z,
        -p_cam.y / (z * z),
    );
    let rotation = camera.pose.rotation.to_rotation_matrix();
    Some(pixel_from_normalized * normalized_from_cam * rotation.matrix())
}

impl LeastSquaresProblem for PointRefineProblem<'_> {
    fn residual_count(&self) -> usize {
        2 * self.observations.len()
    }

    fn parameter_count(&self) -> usize {
        3
    }

    fn residuals(&self, params: &DVector<Real>, out: &mut DVector<Real>) -> bool {
        let world = Pt3::new(params[0], params[1], params[2]);
        for (i, (camera, pixel)) in self.observations.iter().enumerate() {
            let Some(predicted) = project(camera, &world) else {
                return false;
            };
            out[2 * i] = predicted.x - pixel.x;
            out[2 * i + 1] = predicted.y - pixel.y;
        }
        true
    }

    fn jacobian(&self, params: &DVector<Real>, out: &mut DMatrix<Real>) -> bool {
        let world = Pt3::new(params[0], params[1], params[2]);
        for (i, (camera, _)) in self.observations.iter().enumerate() {
            let Some(j) = projection_jacobian(camera, &world) else {
                return false;
            };
            for col in 0..3 {
                out[(2 * i, col)] = j[(0, col)];
                out[(2 * i + 1, col)] = j[(1, col)];
            }
        }
        true
    }
}

fn mean_ray_angle_deg(observations: &[(&CameraModel, Pt2)], point: &Pt3) -> Real {
    let directions: Vec<_> = observations
        .iter()
        .map(|(camera, _)| (point - camera.center()).normalize())
        .collect();
    let mut sum = 0.0;
    let mut pairs = 0usize;
    for i in 0..directions.len() {
        for j in i + 1..directions.len() {
            sum += directions[i].dot(&directions[j]).clamp(-1.0, 1.0).acos();
            pairs += 1;
        }
    }
    if pairs == 0 {
        0.0
    } else {
        (sum / pairs as Real).to_degrees()
    }
}

/// Polish a triangulated point against its pixel observations.
pub fn refine_point(
    observations: &[(&CameraModel, Pt2)],
    seed: &Pt3,
    opts: &PointRefineOptions,
    cancel: &CancelToken,
) -> Result<RefinedPoint, SolveError> {
    if observations.len() < 2 {
        return Err(SolveError::BadProblem(format!(
            "point refinement needs at least 2 sightings, got {}",
            observations.len()
        )));
    }

    let problem = PointRefineProblem { observations };
    let x0 = DVector::from_vec(vec![seed.x, seed.y, seed.z]);
    let result = solve_lm(&problem, x0, &opts.lm, cancel)?;
    let position = Pt3::new(
        result.parameters[0],
        result.parameters[1],
        result.parameters[2],
    );

    let mut residuals = DVector::zeros(problem.residual_count());
    let mut jacobian = DMatrix::zeros(problem.residual_count(), 3);
    if !problem.residuals(&result.parameters, &mut residuals)
        || !problem.jacobian(&result.parameters, &mut jacobian)
    {
        return Err(SolveError::OptimizationDivergence {
            reason: crate::lm::DivergenceReason::NonFinite,
            iterations: result.summary.iterations,
            last_cost: result.summary.final_cost,
        });
    }

    let n = observations.len();
    let rms_px = (residuals.norm_squared() / n as Real).sqrt();

    // Unit-weight variance with a floor, scaled by the inverse normal
    // matrix. Near-parallel rays leave the matrix close to singular,
    // which surfaces as a large depth variance rather than an error.
    let dof = (2 * n).saturating_sub(3).max(1);
    let sigma2 = (residuals.norm_squared() / dof as Real).max(opts.sigma_floor_px.powi(2));
    let normal = (jacobian.transpose() * &jacobian).fixed_view::<3, 3>(0, 0).into_owned();
    let covariance = match normal.try_inverse() {
        Some(inv) => inv * sigma2,
        None => Mat3::from_diagonal_element(Real::INFINITY),
    };

    Ok(RefinedPoint {
        position_mm: position,
        covariance_mm2: covariance,
        rms_px,
        mean_ray_angle_deg: mean_ray_angle_deg(observations, &position),
        summary: result.summary,
    })
}
