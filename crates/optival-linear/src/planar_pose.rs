//! Target pose recovery from a calibrated homography.
//!
//! With intrinsics known, `K^-1 H` yields the first two rotation
//! columns and the translation up to a common scale. The rotation is
//! re-orthogonalized through an SVD projection.

use nalgebra::{Rotation3, Translation3, UnitQuaternion};
use thiserror::Error;

use optival_core::math::{Iso3, Mat3, Real, Vec3};

#[derive(Debug, Error)]
pub enum PlanarPoseError {
    #[error("intrinsic matrix is not invertible")]
    BadIntrinsics,
    #[error("homography has (near-)zero column scale")]
    DegenerateHomography,
    #[error("svd failed")]
    SvdFailed,
}

/// Decompose `H ~ K [r1 r2 t]` into the target-to-camera transform.
///
/// The sign of the scale is chosen so the target lies in front of the
/// camera (positive z).
pub fn pose_from_homography(k: &Mat3, h: &Mat3) -> Result<Iso3, PlanarPoseError> {
    let k_inv = k.try_inverse().ok_or(PlanarPoseError::BadIntrinsics)?;

    let a = k_inv * h;
    let h1 = a.column(0).into_owned();
    let h2 = a.column(1).into_owned();
    let h3 = a.column(2).into_owned();

    let scale = (h1.norm() + h2.norm()) / 2.0;
    if scale <= Real::EPSILON {
        return Err(PlanarPoseError::DegenerateHomography);
    }
    let mut lambda = 1.0 / scale;
    if lambda * h3.z < 0.0 {
        lambda = -lambda;
    }

    let r1 = lambda * h1;
    let r2 = lambda * h2;
    let r3 = r1.cross(&r2);
    let t: Vec3 = lambda * h3;

    let mut r = Mat3::zeros();
    r.set_column(0, &r1);
    r.set_column(1, &r2);
    r.set_column(2, &r3);

    // Project onto SO(3): nearest rotation in the Frobenius sense.
    let svd = r.svd(true, true);
    let u = svd.u.ok_or(PlanarPoseError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(PlanarPoseError::SvdFailed)?;
    let mut rot = u * v_t;
    if rot.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.column_mut(2).neg_mut();
        rot = u_fixed * v_t;
    }

    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rot));
    Ok(Iso3::from_parts(Translation3::from(t), rotation))
}
