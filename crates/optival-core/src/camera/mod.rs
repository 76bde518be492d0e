//! Camera model: intrinsics, distortion, and world-frame pose.

mod distortion;
mod intrinsics;

pub use distortion::Distortion;
pub use intrinsics::Intrinsics;

use serde::{Deserialize, Serialize};

use crate::math::{Iso3, Mat34, Pt2, Pt3, Real, Vec2, Vec3};
use crate::types::CameraId;

pub const MIN_PROJECTION_DEPTH: Real = 1e-9;

/// A fully described camera: identity, intrinsics, distortion, and pose.
///
/// `pose` is `cam_se3_world`, the transform from the shared world frame into
/// the camera frame: `p_cam = pose * p_world`. The reference camera of a rig
/// has the identity pose. Intrinsics and distortion are frozen once
/// single-camera calibration completes; only the bundle adjuster replaces
/// poses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub id: CameraId,
    pub intrinsics: Intrinsics,
    pub distortion: Distortion,
    pub pose: Iso3,
}

impl CameraModel {
    /// Camera with identity pose, the state before bundle adjustment.
    pub fn at_origin(id: CameraId, intrinsics: Intrinsics, distortion: Distortion) -> Self {
        Self {
            id,
            intrinsics,
            distortion,
            pose: Iso3::identity(),
        }
    }

    /// Project a camera-frame point to pixel coordinates.
    ///
    /// Returns `None` for points at or behind the image plane.
    pub fn project_in_camera(&self, p_cam: &Vec3) -> Option<Pt2> {
        if p_cam.z <= MIN_PROJECTION_DEPTH {
            return None;
        }
        let n = Vec2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z);
        let nd = self.distortion.distort(&n);
        Some(self.intrinsics.normalized_to_pixel(&nd))
    }

    /// Project a world-frame point to pixel coordinates.
    pub fn project_point(&self, p_world: &Pt3) -> Option<Pt2> {
        let p_cam = self.pose.transform_point(p_world);
        self.project_in_camera(&p_cam.coords)
    }

    /// Undistorted normalized coordinates of an observed pixel.
    pub fn pixel_to_normalized(&self, pixel: &Pt2) -> Vec2 {
        let nd = self.intrinsics.pixel_to_normalized(pixel);
        self.distortion.undistort(&nd)
    }

    /// Ideal pinhole pixel for an observed (distorted) pixel.
    pub fn undistorted_pixel(&self, pixel: &Pt2) -> Pt2 {
        let n = self.pixel_to_normalized(pixel);
        self.intrinsics.normalized_to_pixel(&n)
    }

    /// Unit viewing ray through the given pixel, expressed in the world frame.
    pub fn ray_direction(&self, pixel: &Pt2) -> Vec3 {
        let n = self.pixel_to_normalized(pixel);
        let dir_cam = Vec3::new(n.x, n.y, 1.0);
        self.pose
            .rotation
            .inverse_transform_vector(&dir_cam)
            .normalize()
    }

    /// Camera center expressed in the world frame.
    pub fn center(&self) -> Pt3 {
        self.pose.inverse_transform_point(&Pt3::origin())
    }

    /// Normalized 3×4 projection matrix `[R | t]`.
    ///
    /// Applies to undistorted normalized observations; pair with
    /// [`CameraModel::pixel_to_normalized`].
    pub fn normalized_projection_matrix(&self) -> Mat34 {
        let r = self.pose.rotation.to_rotation_matrix();
        let t = self.pose.translation.vector;
        let mut p = Mat34::zeros();
        p.fixed_view_mut::<3, 3>(0, 0).copy_from(r.matrix());
        p.set_column(3, &t);
        p
    }

    /// Pixel reprojection residual against an observation, `None` behind the
    /// camera.
    pub fn reprojection_error(&self, p_world: &Pt3, observed: &Pt2) -> Option<Real> {
        self.project_point(p_world)
            .map(|proj| (proj - observed).norm())
    }
}
