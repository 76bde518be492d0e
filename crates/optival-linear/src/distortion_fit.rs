//! Linear distortion estimation from homography residuals.
//!
//! The homography of each view predicts ideal pinhole pixels; the
//! offset of the observed pixels from those predictions is (to first
//! order) pure lens distortion. Stacking the Brown-Conrady basis over
//! all points gives an overdetermined linear system in the
//! coefficients.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

use optival_core::camera::Distortion;
use optival_core::math::{Mat3, Pt2, Real, Vec2, Vec3};

use crate::homography::apply_homography;

/// Minimum squared normalized radius the data must reach; below this
/// there is no radial signal to fit.
const MIN_RADIAL_SPREAD: Real = 1e-6;

#[derive(Debug, Error, Clone, Copy)]
pub enum DistortionFitError {
    #[error("need at least {needed} points for distortion estimation, got {got}")]
    NotEnoughPoints { needed: usize, got: usize },
    #[error("view has {board} target points but {pixels} pixels")]
    MismatchedView { board: usize, pixels: usize },
    #[error("intrinsic matrix is not invertible")]
    BadIntrinsics,
    #[error("all points near the principal point, no radial diversity")]
    NoRadialSpread,
    #[error("svd failed")]
    SvdFailed,
}

/// Fit configuration. The r^6 term overfits on ordinary data and the
/// tangential pair is negligible for rigidly mounted lenses, so both
/// default to off.
#[derive(Debug, Clone, Copy)]
pub struct DistortionFitOptions {
    pub fit_tangential: bool,
    pub fit_k3: bool,
}

impl Default for DistortionFitOptions {
    fn default() -> Self {
        Self {
            fit_tangential: false,
            fit_k3: false,
        }
    }
}

/// One view's correspondences with its DLT homography.
///
/// The homography must come from the raw (distorted) pixels so the
/// residuals still carry the distortion signal.
#[derive(Debug, Clone)]
pub struct DistortionView<'a> {
    pub homography: Mat3,
    pub target_points: &'a [Pt2],
    pub pixel_points: &'a [Pt2],
}

/// Estimate distortion coefficients given intrinsics and per-view
/// homographies.
pub fn fit_distortion(
    k: &Mat3,
    views: &[DistortionView<'_>],
    opts: DistortionFitOptions,
) -> Result<Distortion, DistortionFitError> {
    for view in views {
        if view.target_points.len() != view.pixel_points.len() {
            return Err(DistortionFitError::MismatchedView {
                board: view.target_points.len(),
                pixels: view.pixel_points.len(),
            });
        }
    }

    let total: usize = views.iter().map(|v| v.target_points.len()).sum();
    let n_params = 2 + usize::from(opts.fit_k3) + 2 * usize::from(opts.fit_tangential);
    let needed = n_params.div_ceil(2) + 2;
    if total < needed {
        return Err(DistortionFitError::NotEnoughPoints { needed, got: total });
    }

    let k_inv = k
        .try_inverse()
        .ok_or(DistortionFitError::BadIntrinsics)?;
    let normalize = |p: &Pt2| -> Vec2 {
        let v = k_inv * Vec3::new(p.x, p.y, 1.0);
        Vec2::new(v.x / v.z, v.y / v.z)
    };

    let mut a = DMatrix::<Real>::zeros(2 * total, n_params);
    let mut b = DVector::<Real>::zeros(2 * total);

    let mut row = 0;
    let mut max_r2: Real = 0.0;
    for view in views {
        for (target, pixel) in view.target_points.iter().zip(view.pixel_points) {
            let ideal = normalize(&apply_homography(&view.homography, target));
            let observed = normalize(pixel);
            let residual = observed - ideal;

            let (x, y) = (ideal.x, ideal.y);
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            max_r2 = max_r2.max(r2);

            let mut col = 0;
            a[(row, col)] = x * r2;
            a[(row + 1, col)] = y * r2;
            col += 1;
            a[(row, col)] = x * r4;
            a[(row + 1, col)] = y * r4;
            col += 1;
            if opts.fit_k3 {
                a[(row, col)] = x * r4 * r2;
                a[(row + 1, col)] = y * r4 * r2;
                col += 1;
            }
            if opts.fit_tangential {
                a[(row, col)] = 2.0 * x * y;
                a[(row + 1, col)] = r2 + 2.0 * y * y;
                col += 1;
                a[(row, col)] = r2 + 2.0 * x * x;
                a[(row + 1, col)] = 2.0 * x * y;
            }

            b[row] = residual.x;
            b[row + 1] = residual.y;
            row += 2;
        }
    }

    if max_r2 < MIN_RADIAL_SPREAD {
        return Err(DistortionFitError::NoRadialSpread);
    }

    let svd = a.svd(true, true);
    let x = svd
        .solve(&b, 1e-10)
        .map_err(|_| DistortionFitError::SvdFailed)?;

    let mut col = 0;
    let k1 = x[col];
    col += 1;
    let k2 = x[col];
    col += 1;
    let k3 = if opts.fit_k3 {
        let v = x[col];
        col += 1;
        v
    } else {
        0.0
    };
    let (p1, p2) = if opts.fit_tangential {
        (x[col], x[col + 1])
    } else {
        (0.0, 0.0)
    };

    Ok(Distortion { k1, k2, p1, p2, k3 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Rotation3, Translation3};
    use optival_core::math::Iso3;

    fn make_k() -> Mat3 {
        Mat3::new(1500.0, 0.0, 960.0, 0.0, 1500.0, 540.0, 0.0, 0.0, 1.0)
    }

    fn grid_points() -> Vec<Pt2> {
        let mut pts = Vec::new();
        for r in 0..7 {
            for c in 0..9 {
                pts.push(Pt2::new(c as Real * 25.0, r as Real * 25.0));
            }
        }
        pts
    }

    fn distorted_view(
        k: &Mat3,
        dist: &Distortion,
        rot: Rotation3<Real>,
        t: Vec3,
        target: &[Pt2],
    ) -> (Mat3, Vec<Pt2>) {
        let pose = Iso3::from_parts(Translation3::from(t), rot.into());
        let pixels: Vec<Pt2> = target
            .iter()
            .map(|p| {
                let p_cam = pose * optival_core::math::Pt3::new(p.x, p.y, 0.0);
                let n = Vec2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z);
                let d = dist.distort(&n);
                let h = k * Vec3::new(d.x, d.y, 1.0);
                Pt2::new(h.x / h.z, h.y / h.z)
            })
            .collect();

        // Distortion-free homography H = K [r1 r2 t].
        let r = rot.matrix();
        let mut h = Mat3::zeros();
        h.set_column(0, &(k * r.column(0)));
        h.set_column(1, &(k * r.column(1)));
        h.set_column(2, &(k * t));
        (h, pixels)
    }

    #[test]
    fn recovers_radial_coefficients() {
        let k = make_k();
        let truth = Distortion {
            k1: -0.18,
            k2: 0.04,
            ..Distortion::default()
        };
        let target = grid_points();

        let poses = [
            (Rotation3::from_euler_angles(0.15, 0.05, 0.0), Vec3::new(-90.0, -70.0, 420.0)),
            (Rotation3::from_euler_angles(-0.1, 0.2, 0.05), Vec3::new(-110.0, -60.0, 460.0)),
            (Rotation3::from_euler_angles(0.05, -0.15, -0.05), Vec3::new(-80.0, -90.0, 400.0)),
        ];

        let mut homographies = Vec::new();
        let mut pixel_sets = Vec::new();
        for (rot, t) in poses {
            let (h, pixels) = distorted_view(&k, &truth, rot, t, &target);
            homographies.push(h);
            pixel_sets.push(pixels);
        }
        let views: Vec<DistortionView<'_>> = homographies
            .iter()
            .zip(&pixel_sets)
            .map(|(h, pixels)| DistortionView {
                homography: *h,
                target_points: &target,
                pixel_points: pixels,
            })
            .collect();

        let est = fit_distortion(&k, &views, DistortionFitOptions::default()).unwrap();
        // Linearized fit: coarse agreement is all that is required here.
        assert!((est.k1 - truth.k1).abs() < 0.05);
        assert!((est.k2 - truth.k2).abs() < 0.05);
        assert_eq!(est.k3, 0.0);
        assert_eq!(est.p1, 0.0);
        assert_eq!(est.p2, 0.0);
    }

    #[test]
    fn rejects_mismatched_view() {
        let target = grid_points();
        let pixels = vec![Pt2::new(0.0, 0.0); 3];
        let views = [DistortionView {
            homography: Mat3::identity(),
            target_points: &target,
            pixel_points: &pixels,
        }];
        assert!(matches!(
            fit_distortion(&make_k(), &views, DistortionFitOptions::default()),
            Err(DistortionFitError::MismatchedView { .. })
        ));
    }

    #[test]
    fn rejects_centered_points() {
        // All observations collapse at the principal point.
        let k = make_k();
        let target: Vec<Pt2> = (0..8).map(|i| Pt2::new(i as Real * 1e-9, 0.0)).collect();
        let pixels = vec![Pt2::new(960.0, 540.0); 8];
        let views = [DistortionView {
            homography: k,
            target_points: &target,
            pixel_points: &pixels,
        }];
        assert!(matches!(
            fit_distortion(&k, &views, DistortionFitOptions::default()),
            Err(DistortionFitError::NoRadialSpread)
        ));
    }
}
