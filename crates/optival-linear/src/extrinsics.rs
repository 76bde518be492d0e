//! Linear rig extrinsics initialization.
//!
//! Combines per-view target poses from several cameras into a single
//! rig estimate. The world frame is the reference camera frame, so the
//! reference camera pose is the identity by construction.

use nalgebra::{Quaternion, Translation3, UnitQuaternion, Vector4};
use thiserror::Error;

use optival_core::math::{Iso3, Real, Vec3};

#[derive(Debug, Error)]
pub enum RigInitError {
    #[error("need at least one view")]
    NoViews,
    #[error("view {view} has {got} camera slots, expected {expected}")]
    MismatchedView {
        view: usize,
        got: usize,
        expected: usize,
    },
    #[error("reference camera index {0} out of range for {1} cameras")]
    BadReference(usize, usize),
    #[error("camera {0} shares no view with the reference camera")]
    NoOverlap(usize),
    #[error("view {0} has no camera poses")]
    EmptyView(usize),
}

/// Rig seed produced by chaining planar target poses through the
/// reference camera.
#[derive(Debug, Clone)]
pub struct RigInit {
    /// Per-camera world-to-camera transforms; entry `ref_cam` is the
    /// identity.
    pub cam_se3_world: Vec<Iso3>,
    /// Per-view target-to-world transforms.
    pub world_se3_target: Vec<Iso3>,
}

/// Average rigid transforms: arithmetic translation mean plus a
/// quaternion mean with hemisphere correction. Only meaningful for
/// poses that already agree closely, which is the case for per-view
/// estimates of the same physical transform.
fn average_isometries(poses: &[Iso3]) -> Iso3 {
    let n = poses.len() as Real;
    let mut t_sum = Vec3::zeros();
    for iso in poses {
        t_sum += iso.translation.vector;
    }
    let t_avg = Translation3::from(t_sum / n);

    let q0 = poses[0].rotation;
    let mut acc = Vector4::<Real>::zeros();
    for iso in poses {
        let coords = iso.rotation.coords;
        // q and -q encode the same rotation; fold onto one hemisphere.
        let sign = if q0.coords.dot(&coords) < 0.0 { -1.0 } else { 1.0 };
        acc += coords * sign;
    }

    if acc.norm_squared() <= Real::EPSILON {
        return Iso3::from_parts(t_avg, UnitQuaternion::identity());
    }
    let q = Quaternion::from_vector(acc).normalize();
    Iso3::from_parts(t_avg, UnitQuaternion::from_quaternion(q))
}

/// Estimate rig extrinsics from per-view, per-camera target poses.
///
/// `cam_se3_target[view][cam]` holds the target-to-camera transform
/// where that camera detected the target in that view. Every camera
/// must share at least one view with the reference camera.
pub fn estimate_rig_init(
    cam_se3_target: &[Vec<Option<Iso3>>],
    ref_cam: usize,
) -> Result<RigInit, RigInitError> {
    let num_views = cam_se3_target.len();
    if num_views == 0 {
        return Err(RigInitError::NoViews);
    }
    let num_cameras = cam_se3_target[0].len();
    if ref_cam >= num_cameras {
        return Err(RigInitError::BadReference(ref_cam, num_cameras));
    }
    for (v, view) in cam_se3_target.iter().enumerate() {
        if view.len() != num_cameras {
            return Err(RigInitError::MismatchedView {
                view: v,
                got: view.len(),
                expected: num_cameras,
            });
        }
    }

    // Camera poses: chain each camera's target pose through the
    // reference camera seen in the same view, then average over views.
    let mut cam_se3_world = Vec::with_capacity(num_cameras);
    for cam in 0..num_cameras {
        if cam == ref_cam {
            cam_se3_world.push(Iso3::identity());
            continue;
        }

        let candidates: Vec<Iso3> = cam_se3_target
            .iter()
            .filter_map(|view| match (&view[cam], &view[ref_cam]) {
                (Some(ct_cam), Some(ct_ref)) => Some(ct_cam * ct_ref.inverse()),
                _ => None,
            })
            .collect();
        if candidates.is_empty() {
            return Err(RigInitError::NoOverlap(cam));
        }
        cam_se3_world.push(average_isometries(&candidates));
    }

    // Target poses: map each camera's estimate into the world frame,
    // then average over the cameras that saw the view.
    let mut world_se3_target = Vec::with_capacity(num_views);
    for (v, view) in cam_se3_target.iter().enumerate() {
        let candidates: Vec<Iso3> = view
            .iter()
            .enumerate()
            .filter_map(|(cam, pose)| {
                pose.as_ref()
                    .map(|ct| cam_se3_world[cam].inverse() * ct)
            })
            .collect();
        if candidates.is_empty() {
            return Err(RigInitError::EmptyView(v));
        }
        world_se3_target.push(average_isometries(&candidates));
    }

    Ok(RigInit {
        cam_se3_world,
        world_se3_target,
    })
}
