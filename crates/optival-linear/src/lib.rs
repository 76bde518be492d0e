//! Closed-form estimation blocks: homographies, Zhang intrinsics,
//! planar poses, distortion fitting, rig chaining, triangulation, and
//! epipolar geometry. These seed the nonlinear refinement stage.

mod distortion_fit;
mod epipolar;
mod extrinsics;
mod homography;
mod intrinsics_init;
mod planar_pose;
mod triangulation;
mod zhang;

pub use distortion_fit::*;
pub use epipolar::*;
pub use extrinsics::*;
pub use homography::*;
pub use intrinsics_init::*;
pub use planar_pose::*;
pub use triangulation::*;
pub use zhang::*;
