//! Plane-to-image homography estimation.
//!
//! Normalized DLT: the homography `H` maps planar target points to
//! pixels, `x' ~ H x`. Hartley-style normalization (zero mean, average
//! distance sqrt(2)) is applied internally and undone on output.

use nalgebra::DMatrix;
use thiserror::Error;

use optival_core::math::{Mat3, Pt2, Real};

#[derive(Debug, Error)]
pub enum HomographyError {
    #[error("need at least 4 point correspondences, got {0}")]
    NotEnoughPoints(usize),
    #[error("degenerate point configuration")]
    Degenerate,
    #[error("svd failed")]
    SvdFailed,
}

/// Normalize points to zero mean and average distance sqrt(2).
///
/// Returns the normalized points and the similarity `T` with
/// `x_n = T x`. Fails when all points coincide.
fn normalize_points(points: &[Pt2]) -> Option<(Vec<Pt2>, Mat3)> {
    let n = points.len() as Real;
    let cx = points.iter().map(|p| p.x).sum::<Real>() / n;
    let cy = points.iter().map(|p| p.y).sum::<Real>() / n;

    let mean_dist = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<Real>()
        / n;
    if mean_dist <= Real::EPSILON {
        return None;
    }

    let s = (2.0f64).sqrt() / mean_dist;
    let t = Mat3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized = points
        .iter()
        .map(|p| Pt2::new(s * (p.x - cx), s * (p.y - cy)))
        .collect();
    Some((normalized, t))
}

/// Estimate `H` such that `image ~ H * world` using normalized DLT.
///
/// The result is scaled so `H[2,2] == 1` when possible.
pub fn dlt_homography(world: &[Pt2], image: &[Pt2]) -> Result<Mat3, HomographyError> {
    let n = world.len();
    if n < 4 || image.len() != n {
        return Err(HomographyError::NotEnoughPoints(n.min(image.len())));
    }

    let (world_n, t_w) = normalize_points(world).ok_or(HomographyError::Degenerate)?;
    let (image_n, t_i) = normalize_points(image).ok_or(HomographyError::Degenerate)?;

    let mut a = DMatrix::<Real>::zeros(2 * n, 9);
    for (i, (pw, pi)) in world_n.iter().zip(image_n.iter()).enumerate() {
        let x = pw.x;
        let y = pw.y;
        let u = pi.x;
        let v = pi.y;

        let r0 = 2 * i;
        let r1 = 2 * i + 1;

        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    // Solve A h = 0: the singular vector of the smallest singular value.
    let svd = a.svd(true, true);
    let v_t = svd.v_t.ok_or(HomographyError::SvdFailed)?;
    let h_vec = v_t.row(v_t.nrows() - 1);

    let mut h = Mat3::zeros();
    for r in 0..3 {
        for c in 0..3 {
            h[(r, c)] = h_vec[3 * r + c];
        }
    }

    let t_i_inv = t_i.try_inverse().ok_or(HomographyError::Degenerate)?;
    h = t_i_inv * h * t_w;

    let scale = h[(2, 2)];
    if scale.abs() > Real::EPSILON {
        h /= scale;
    }
    Ok(h)
}

/// Apply a homography to a planar point.
pub fn apply_homography(h: &Mat3, p: &Pt2) -> Pt2 {
    let q = h * nalgebra::Vector3::new(p.x, p.y, 1.0);
    Pt2::new(q.x / q.z, q.y / q.z)
}
