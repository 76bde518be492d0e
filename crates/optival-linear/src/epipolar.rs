//! Epipolar geometry between calibrated camera pairs.
//!
//! With both cameras fully calibrated the fundamental matrix follows
//! directly from the relative pose, no eight-point estimation needed.
//! All distances operate on undistorted pixel coordinates.

use thiserror::Error;

use optival_core::camera::CameraModel;
use optival_core::math::{Mat3, Pt2, Real, Vec3};

#[derive(Debug, Error, Clone, Copy)]
pub enum EpipolarError {
    #[error("intrinsic matrix is not invertible")]
    BadIntrinsics,
}

fn skew_symmetric(t: &Vec3) -> Mat3 {
    Mat3::new(0.0, -t.z, t.y, t.z, 0.0, -t.x, -t.y, t.x, 0.0)
}

/// Fundamental matrix of an ordered pair, satisfying `x_b^T F x_a = 0`
/// for undistorted pixel observations `x_a`, `x_b` of the same point.
pub fn fundamental_between(a: &CameraModel, b: &CameraModel) -> Result<Mat3, EpipolarError> {
    let rel = b.pose * a.pose.inverse();
    let r = rel.rotation.to_rotation_matrix();
    let essential = skew_symmetric(&rel.translation.vector) * r.matrix();

    let ka_inv = a
        .intrinsics
        .k_matrix()
        .try_inverse()
        .ok_or(EpipolarError::BadIntrinsics)?;
    let kb_inv = b
        .intrinsics
        .k_matrix()
        .try_inverse()
        .ok_or(EpipolarError::BadIntrinsics)?;
    Ok(kb_inv.transpose() * essential * ka_inv)
}

/// Symmetric epipolar distance in pixels.
///
/// Averages the point-to-line distances in both images through the
/// usual normalization of the algebraic residual.
pub fn symmetric_epipolar_distance(f: &Mat3, pixel_a: &Pt2, pixel_b: &Pt2) -> Real {
    let xa = Vec3::new(pixel_a.x, pixel_a.y, 1.0);
    let xb = Vec3::new(pixel_b.x, pixel_b.y, 1.0);

    let line_b = f * xa;
    let line_a = f.transpose() * xb;

    let algebraic = xb.dot(&line_b).abs();
    let norm = (line_b.x * line_b.x
        + line_b.y * line_b.y
        + line_a.x * line_a.x
        + line_a.y * line_a.y)
        .sqrt()
        .max(Real::EPSILON);
    algebraic / norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use optival_core::math::Pt3;
    use optival_core::synthetic::{default_intrinsics, ring_cameras};

    #[test]
    fn corresponding_pixels_lie_on_epipolar_lines() {
        let cams = ring_cameras(3, 300.0, 35.0, default_intrinsics(1920, 1080));
        let f = fundamental_between(&cams[0], &cams[1]).unwrap();

        for p in [
            Pt3::new(0.0, 0.0, 0.0),
            Pt3::new(20.0, -15.0, 10.0),
            Pt3::new(-30.0, 25.0, -20.0),
        ] {
            let pa = cams[0].project_point(&p).unwrap();
            let pb = cams[1].project_point(&p).unwrap();
            assert!(symmetric_epipolar_distance(&f, &pa, &pb) < 1e-6);
        }
    }

    #[test]
    fn off_line_pixel_scores_its_offset() {
        let cams = ring_cameras(3, 300.0, 35.0, default_intrinsics(1920, 1080));
        let f = fundamental_between(&cams[0], &cams[2]).unwrap();

        let p = Pt3::new(10.0, 5.0, 0.0);
        let pa = cams[0].project_point(&p).unwrap();
        let pb = cams[2].project_point(&p).unwrap();

        // Push the second observation off its epipolar line.
        let line = f * Vec3::new(pa.x, pa.y, 1.0);
        let normal = optival_core::math::Vec2::new(line.x, line.y).normalize();
        let shifted = Pt2::new(pb.x + 5.0 * normal.x, pb.y + 5.0 * normal.y);

        let d = symmetric_epipolar_distance(&f, &pa, &shifted);
        assert!(d > 2.0 && d < 6.0);
    }
}
