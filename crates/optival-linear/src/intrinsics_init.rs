//! Joint linear initialization of intrinsics and distortion.
//!
//! Zhang's method assumes distortion-free pixels, so applying it to raw
//! detections biases the intrinsics. This solver alternates: estimate K
//! ignoring distortion, fit distortion from the homography residuals,
//! undistort the raw pixels, re-estimate K. One or two rounds give an
//! initialization good enough for nonlinear refinement.

use log::debug;
use thiserror::Error;

use optival_core::camera::{Distortion, Intrinsics};
use optival_core::math::{Mat3, Pt2};

use crate::distortion_fit::{fit_distortion, DistortionFitError, DistortionFitOptions, DistortionView};
use crate::homography::{dlt_homography, HomographyError};
use crate::zhang::{intrinsics_from_homographies, ZhangError};

#[derive(Debug, Error)]
pub enum IntrinsicsInitError {
    #[error("need at least 3 views, got {0}")]
    NotEnoughViews(usize),
    #[error("homography estimation failed: {0}")]
    Homography(#[from] HomographyError),
    #[error("intrinsics extraction failed: {0}")]
    Zhang(#[from] ZhangError),
    #[error("distortion fit failed: {0}")]
    Distortion(#[from] DistortionFitError),
}

/// Target-to-pixel correspondences of one view, raw pixels as detected.
#[derive(Debug, Clone)]
pub struct PlanarObservations {
    /// Target coordinates on the z = 0 plane, in millimetres.
    pub target_points: Vec<Pt2>,
    /// Detected pixel coordinates, distortion included.
    pub pixel_points: Vec<Pt2>,
}

#[derive(Debug, Clone, Copy)]
pub struct IntrinsicsInitOptions {
    /// Distortion alternation rounds. Two rounds are usually enough; the
    /// nonlinear refinement absorbs what is left.
    pub rounds: usize,
    pub zero_skew: bool,
    pub distortion: DistortionFitOptions,
}

impl Default for IntrinsicsInitOptions {
    fn default() -> Self {
        Self {
            rounds: 2,
            zero_skew: true,
            distortion: DistortionFitOptions::default(),
        }
    }
}

/// Linear single-camera estimate before nonlinear refinement.
#[derive(Debug, Clone)]
pub struct CameraInit {
    pub intrinsics: Intrinsics,
    pub distortion: Distortion,
    /// Per-view homographies fitted on undistorted pixels; feed these to
    /// the planar pose decomposition for pose seeds.
    pub homographies: Vec<Mat3>,
}

fn undistort_pixel(intrinsics: &Intrinsics, distortion: &Distortion, p: &Pt2) -> Pt2 {
    let n = distortion.undistort(&intrinsics.pixel_to_normalized(p));
    intrinsics.normalized_to_pixel(&n)
}

/// Estimate intrinsics, distortion, and per-view homographies from raw
/// planar detections.
pub fn estimate_camera_init(
    views: &[PlanarObservations],
    opts: IntrinsicsInitOptions,
) -> Result<CameraInit, IntrinsicsInitError> {
    if views.len() < 3 {
        return Err(IntrinsicsInitError::NotEnoughViews(views.len()));
    }

    let mut homographies = views
        .iter()
        .map(|v| dlt_homography(&v.target_points, &v.pixel_points))
        .collect::<Result<Vec<_>, _>>()?;
    let mut intrinsics = intrinsics_from_homographies(&homographies, opts.zero_skew)?;
    let mut distortion = Distortion::default();

    for round in 0..opts.rounds {
        // Residuals against the current homographies carry the
        // distortion signal, so the fit sees the original raw pixels.
        let k = intrinsics.k_matrix();
        let dist_views: Vec<DistortionView<'_>> = views
            .iter()
            .zip(&homographies)
            .map(|(v, h)| DistortionView {
                homography: *h,
                target_points: &v.target_points,
                pixel_points: &v.pixel_points,
            })
            .collect();
        distortion = fit_distortion(&k, &dist_views, opts.distortion)?;

        homographies = views
            .iter()
            .map(|v| {
                let undistorted: Vec<Pt2> = v
                    .pixel_points
                    .iter()
                    .map(|p| undistort_pixel(&intrinsics, &distortion, p))
                    .collect();
                dlt_homography(&v.target_points, &undistorted)
            })
            .collect::<Result<Vec<_>, _>>()?;
        intrinsics = intrinsics_from_homographies(&homographies, opts.zero_skew)?;

        debug!(
            "linear init round {}: fx={:.1} fy={:.1} cx={:.1} cy={:.1} k1={:.4} k2={:.4}",
            round + 1,
            intrinsics.fx,
            intrinsics.fy,
            intrinsics.cx,
            intrinsics.cy,
            distortion.k1,
            distortion.k2
        );
    }

    Ok(CameraInit {
        intrinsics,
        distortion,
        homographies,
    })
}
