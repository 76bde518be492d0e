//! Closed-form intrinsics from planar homographies (Zhang's method).
//!
//! Each homography of a planar target contributes two linear
//! constraints on the image of the absolute conic `B = K^-T K^-1`.
//! Three or more views in general position determine `B`, from which
//! the intrinsics are read off in closed form.

use nalgebra::{DMatrix, Vector6};
use thiserror::Error;

use optival_core::camera::Intrinsics;
use optival_core::math::{Mat3, Real};

/// A valid view set determines `B` up to scale, so exactly one singular
/// value of the constraint matrix vanishes. A second singular value
/// below this fraction of the largest means the target orientations
/// (nearly) coincide and `B` is underdetermined.
const RANK_TOL: Real = 1e-9;

/// Bound on the relative magnitude of the `B11 B22 - B12^2` term;
/// below it the conic cannot be decomposed.
const DEGENERACY_TOL: Real = 1e-6;

#[derive(Debug, Error)]
pub enum ZhangError {
    #[error("need at least 3 homographies, got {0}")]
    NotEnoughViews(usize),
    #[error("degenerate view configuration (views too similar in orientation)")]
    DegenerateViews,
    #[error("conic estimate is not positive definite")]
    NotPositiveDefinite,
    #[error("svd failed")]
    SvdFailed,
}

fn v_ij(h: &Mat3, i: usize, j: usize) -> Vector6<Real> {
    Vector6::new(
        h[(0, i)] * h[(0, j)],
        h[(0, i)] * h[(1, j)] + h[(1, i)] * h[(0, j)],
        h[(1, i)] * h[(1, j)],
        h[(2, i)] * h[(0, j)] + h[(0, i)] * h[(2, j)],
        h[(2, i)] * h[(1, j)] + h[(1, i)] * h[(2, j)],
        h[(2, i)] * h[(2, j)],
    )
}

/// Recover intrinsics from homographies of a planar target.
///
/// Requires at least three views with distinct target orientations.
/// `zero_skew` forces the skew coefficient to zero after extraction,
/// which is the appropriate model for rigid production lenses.
pub fn intrinsics_from_homographies(
    homographies: &[Mat3],
    zero_skew: bool,
) -> Result<Intrinsics, ZhangError> {
    let n = homographies.len();
    if n < 3 {
        return Err(ZhangError::NotEnoughViews(n));
    }

    let mut v = DMatrix::<Real>::zeros(2 * n, 6);
    for (k, h) in homographies.iter().enumerate() {
        let v12 = v_ij(h, 0, 1);
        let v11 = v_ij(h, 0, 0);
        let v22 = v_ij(h, 1, 1);
        v.row_mut(2 * k).copy_from(&v12.transpose());
        v.row_mut(2 * k + 1).copy_from(&(v11 - v22).transpose());
    }

    let svd = v.svd(true, true);
    let sv = &svd.singular_values;
    if sv[4] <= RANK_TOL * sv[0] {
        return Err(ZhangError::DegenerateViews);
    }
    let v_t = svd.v_t.ok_or(ZhangError::SvdFailed)?;
    let b = v_t.row(v_t.nrows() - 1);

    let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

    // B is recovered up to scale; all checks below are scale invariant.
    let denom = b11 * b22 - b12 * b12;
    let denom_rel = denom.abs() / (b11 * b11 + b22 * b22).max(Real::EPSILON);
    if denom_rel <= DEGENERACY_TOL {
        return Err(ZhangError::DegenerateViews);
    }

    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    if lambda.signum() != b11.signum() {
        return Err(ZhangError::NotPositiveDefinite);
    }

    let alpha2 = lambda / b11;
    let beta2 = lambda * b11 / denom;
    if alpha2 <= 0.0 || beta2 <= 0.0 {
        return Err(ZhangError::NotPositiveDefinite);
    }

    let alpha = alpha2.sqrt();
    let beta = beta2.sqrt();
    let gamma = if zero_skew {
        0.0
    } else {
        -b12 * alpha * alpha * beta / lambda
    };
    let u0 = gamma * v0 / beta - b13 * alpha * alpha / lambda;

    Ok(Intrinsics {
        fx: alpha,
        fy: beta,
        cx: u0,
        cy: v0,
        skew: gamma,
    })
}
