//! Core math, camera models, and data types for `optival`.
//!
//! This crate contains:
//! - linear algebra type aliases (`Real`, `Vec2`, `Pt3`, ...),
//! - the pinhole camera model with Brown-Conrady distortion,
//! - calibration pattern geometry,
//! - the shared data model (views, sessions, measurements, results),
//! - the validated rig configuration,
//! - seeded synthetic scene generators for tests and demos.
//!
//! # Conventions
//!
//! World units are millimetres. A camera pose is `cam_se3_world`: it maps
//! world-frame points into the camera frame, `p_cam = pose * p_world`.
//! The reference camera's frame is the world frame, so its pose is the
//! identity.

/// Validated rig configuration.
pub mod config;
/// Linear algebra type aliases and helpers.
pub mod math;
/// Pinhole camera with Brown-Conrady distortion.
pub mod camera;
/// Calibration pattern geometry.
pub mod pattern;
/// Synthetic rigs and scenes for tests.
pub mod synthetic;
/// Shared data model.
pub mod types;

pub use camera::{CameraModel, Distortion, Intrinsics, MIN_PROJECTION_DEPTH};
pub use config::{
    DetectOptions, MeasureOptions, OptimOptions, QualityThresholds, RigConfig, SessionOptions,
    ValidateOptions,
};
pub use math::*;
pub use pattern::PatternSpec;
pub use types::*;
