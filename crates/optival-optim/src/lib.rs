//! Nonlinear least squares for rig calibration and measurement.
//!
//! A single dense Levenberg-Marquardt core serves three problems:
//! per-camera model refinement, rig-wide pose adjustment, and
//! triangulated point polishing. All of them share the same robust
//! loss, cancellation, and timeout machinery.

pub mod lm;
pub mod pose;
pub mod problems;
pub mod robust;

pub use lm::{
    solve_lm, CancelToken, DivergenceReason, LeastSquaresProblem, LmOptions, LmResult, LmSummary,
    SolveError, StopReason,
};
pub use problems::camera_refine::{
    refine_camera, CameraRefineInit, CameraRefineOptions, CameraRefinement,
};
pub use problems::point_refine::{refine_point, PointRefineOptions, RefinedPoint};
pub use problems::rig_adjust::{
    adjust_rig, ObservationKey, RigAdjustOptions, RigAdjustment, RigViewObservations,
};
pub use robust::RobustLoss;
