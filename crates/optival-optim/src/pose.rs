//! Minimal 6-vector pose parameterization for the optimizer.
//!
//! A pose occupies six consecutive slots in the flat parameter vector:
//! a scaled rotation axis followed by the translation, both in the
//! isometry's own convention (camera-from-world or world-from-target,
//! whichever the problem stores).

use nalgebra::DVector;

use optival_core::math::{Iso3, Real, Vec3};

/// Number of parameter slots one pose occupies.
pub const POSE_DOF: usize = 6;

/// Write `pose` into `params[offset..offset + 6]`.
pub fn write_pose(params: &mut DVector<Real>, offset: usize, pose: &Iso3) {
    let axis = pose.rotation.scaled_axis();
    let t = pose.translation.vector;
    params[offset] = axis.x;
    params[offset + 1] = axis.y;
    params[offset + 2] = axis.z;
    params[offset + 3] = t.x;
    params[offset + 4] = t.y;
    params[offset + 5] = t.z;
}

/// Rebuild an isometry from `params[offset..offset + 6]`.
pub fn read_pose(params: &DVector<Real>, offset: usize) -> Iso3 {
    let axis = Vec3::new(params[offset], params[offset + 1], params[offset + 2]);
    let t = Vec3::new(params[offset + 3], params[offset + 4], params[offset + 5]);
    Iso3::new(t, axis)
}
