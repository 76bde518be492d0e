//! DLT triangulation from two or more calibrated views.

use nalgebra::DMatrix;
use thiserror::Error;

use optival_core::camera::CameraModel;
use optival_core::math::{Mat34, Pt2, Pt3, Real, Vec2};

#[derive(Debug, Error, Clone, Copy)]
pub enum TriangulationError {
    #[error("need at least 2 observations, got {0}")]
    NotEnoughObservations(usize),
    #[error("{cameras} projection matrices but {points} observations")]
    MismatchedInputs { cameras: usize, points: usize },
    #[error("svd failed")]
    SvdFailed,
    #[error("triangulated point is at infinity")]
    PointAtInfinity,
}

/// Triangulate one 3D point from undistorted normalized observations.
///
/// `projections[i]` is the `[R | t]` matrix of camera `i`; each
/// observation contributes two homogeneous DLT rows.
pub fn triangulate_normalized(
    projections: &[Mat34],
    normalized: &[Vec2],
) -> Result<Pt3, TriangulationError> {
    let n = projections.len();
    if normalized.len() != n {
        return Err(TriangulationError::MismatchedInputs {
            cameras: n,
            points: normalized.len(),
        });
    }
    if n < 2 {
        return Err(TriangulationError::NotEnoughObservations(n));
    }

    let mut a = DMatrix::<Real>::zeros(2 * n, 4);
    for (i, (p, obs)) in projections.iter().zip(normalized).enumerate() {
        for c in 0..4 {
            a[(2 * i, c)] = obs.x * p[(2, c)] - p[(0, c)];
            a[(2 * i + 1, c)] = obs.y * p[(2, c)] - p[(1, c)];
        }
    }

    let svd = a.svd(true, true);
    let v_t = svd.v_t.ok_or(TriangulationError::SvdFailed)?;
    let h = v_t.row(v_t.nrows() - 1);
    // The solution is unit norm, so w below this is genuinely at infinity.
    if h[3].abs() <= Real::EPSILON {
        return Err(TriangulationError::PointAtInfinity);
    }
    Ok(Pt3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]))
}

/// Triangulate from raw pixel observations of calibrated cameras.
///
/// Each pixel is undistorted and normalized through its camera model
/// before the DLT solve.
pub fn triangulate_pixels(
    observations: &[(&CameraModel, Pt2)],
) -> Result<Pt3, TriangulationError> {
    let projections: Vec<Mat34> = observations
        .iter()
        .map(|(cam, _)| cam.normalized_projection_matrix())
        .collect();
    let normalized: Vec<Vec2> = observations
        .iter()
        .map(|(cam, pixel)| cam.pixel_to_normalized(pixel))
        .collect();
    triangulate_normalized(&projections, &normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use optival_core::camera::Distortion;
    use optival_core::synthetic::{default_intrinsics, ring_cameras};

    #[test]
    fn recovers_point_from_ring_projections() {
        let cams = ring_cameras(5, 300.0, 35.0, default_intrinsics(1920, 1080));
        let p = Pt3::new(12.0, -8.0, 20.0);

        let observations: Vec<(&CameraModel, Pt2)> = cams
            .iter()
            .map(|cam| (cam, cam.project_point(&p).unwrap()))
            .collect();

        let est = triangulate_pixels(&observations).unwrap();
        assert!((est - p).norm() < 1e-7);
    }

    #[test]
    fn undistorts_before_solving() {
        let mut cams = ring_cameras(2, 300.0, 35.0, default_intrinsics(1920, 1080));
        for cam in &mut cams {
            cam.distortion = Distortion {
                k1: -0.12,
                k2: 0.03,
                ..Distortion::default()
            };
        }
        let p = Pt3::new(-15.0, 10.0, 5.0);

        let observations: Vec<(&CameraModel, Pt2)> = cams
            .iter()
            .map(|cam| (cam, cam.project_point(&p).unwrap()))
            .collect();

        let est = triangulate_pixels(&observations).unwrap();
        assert!((est - p).norm() < 1e-5);
    }

    #[test]
    fn rejects_single_observation() {
        let cams = ring_cameras(1, 300.0, 35.0, default_intrinsics(1920, 1080));
        let uv = cams[0].project_point(&Pt3::origin()).unwrap();
        assert!(matches!(
            triangulate_pixels(&[(&cams[0], uv)]),
            Err(TriangulationError::NotEnoughObservations(1))
        ));
    }
}
