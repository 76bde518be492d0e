//! High-level entry crate for the `optival` measurement rig.
//!
//! This crate provides **two complementary APIs** for optical electrode
//! validation:
//!
//! ## 1. Pipeline API (Structured Workflows)
//!
//! Use when you want:
//! - The full capture → calibrate → quality gate → measure chain
//! - Cancellable background optimization on a worker thread
//! - The operator workflow state machine and device status tracking
//!
//! ```no_run
//! use optival::prelude::*;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RigConfig::default();
//! config.validate()?;
//!
//! let views: Vec<CalibrationView> = /* synchronized pattern detections */
//! # vec![];
//! let session = CaptureSession::new(config.pattern.clone(), config.camera_count, views)?;
//!
//! // Bundle adjustment runs on a worker thread and stays cancellable.
//! let run_config = config.clone();
//! let run_session = session.clone();
//! let handle = spawn_task(move |cancel| run_calibration(run_config, run_session, cancel));
//! let calibration = handle.wait().ok_or("calibration worker panicked")??;
//!
//! // Gate on the quality thresholds before anything uses the result.
//! let result = evaluate(&config, &session, &calibration);
//! println!("global RMS {:.3} mm (valid: {})", result.global_rms_mm, result.valid);
//! save_result(Path::new("calibration.json"), &result)?;
//!
//! let mut active = ActiveCalibration::default();
//! active.adopt(result, false)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## 2. Imperative Function API (Custom Workflows)
//!
//! Use when you need:
//! - Full control over the measurement loop
//! - Ability to inspect intermediate results
//! - Integration into a larger acquisition system
//!
//! ### Measuring and Validating Electrodes
//!
//! ```no_run
//! use optival::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RigConfig::default();
//! let cameras: Vec<CameraModel> = /* cameras from the adopted result */
//! # vec![];
//! let frames: Vec<FrameSet> = /* synchronized electrode candidates */
//! # vec![];
//! let navigation: Vec<NavigationSample> = /* navigation device stream */
//! # vec![];
//!
//! let cancel = CancelToken::new();
//! let refine = PointRefineOptions::default();
//! let mut validator =
//!     AccuracyValidator::new(config.validate.clone(), config.thresholds.end_to_end_mm);
//!
//! for set in &frames {
//!     for m in measure_frame_set(&cameras, set, &config.measure, &refine, &cancel)? {
//!         match validator.check(&m, &navigation) {
//!             ValidationOutcome::Compared(r) => {
//!                 println!("{}: {:.2} mm discrepancy", r.electrode, r.magnitude_mm);
//!             }
//!             ValidationOutcome::Misaligned(miss) => {
//!                 eprintln!("no synchronized sample for {}", miss.electrode);
//!             }
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Using Low-Level Building Blocks
//!
//! For maximum control, directly access the linear and optimization modules:
//!
//! ```no_run
//! use optival::core::{CameraModel, Pt2};
//! use optival::linear::triangulate_pixels;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cameras: Vec<CameraModel> = /* calibrated rig */
//! # vec![];
//! let pixels: Vec<Pt2> = /* matched electrode detections, one per camera */
//! # vec![];
//!
//! let observations: Vec<(&CameraModel, Pt2)> = cameras.iter().zip(pixels).collect();
//! let point = triangulate_pixels(&observations)?;
//! println!("electrode at ({:.2}, {:.2}, {:.2}) mm", point.x, point.y, point.z);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - **[`pipeline`]**: Capture sessions, calibration runs, quality gating,
//!   measurement, accuracy validation, persistence, and the operator workflow
//! - **[`core`]**: Math types, camera model, configuration, shared data model
//! - **[`detect`]**: Pattern and electrode detection on grayscale images
//! - **[`linear`]**: Closed-form initialization (homography, Zhang, PnP,
//!   triangulation, epipolar geometry)
//! - **[`optim`]**: Non-linear least-squares refinement and the rig adjustment
//! - **[`prelude`]**: Convenient re-exports for common use cases
//!
//! ## Stability
//!
//! The `optival` crate is the public compatibility boundary. Lower-level
//! crates are intended for advanced usage and may evolve more quickly.

/// Capture, calibration, measurement, and validation drivers.
///
/// Everything the acquisition host calls at runtime lives here, including the
/// operator workflow state machine and the background task handle.
pub mod pipeline {
    pub use optival_pipeline::{
        run_calibration, CalibrateError, CalibrationRun, RigCalibration,
    };
    pub use optival_pipeline::{
        CameraFrame, CaptureError, SessionManager, SessionProgress, SessionReadiness,
    };
    pub use optival_pipeline::{evaluate, ActivationError, ActiveCalibration};
    pub use optival_pipeline::{
        detect_electrodes, measure_frame_set, measure_frame_sets, FrameSet, MeasureError,
        MeasurementLedger,
    };
    pub use optival_pipeline::{
        AccuracyValidator, DiscrepancyStats, DriftAdvisory, TemporalMisalignment,
        ValidationOutcome,
    };
    pub use optival_pipeline::{
        load_report, load_result, save_report, save_result, ExportError, ValidationReport,
    };
    pub use optival_pipeline::{spawn_task, TaskHandle};
    pub use optival_pipeline::{DeviceError, DeviceStatusBoard};
    pub use optival_pipeline::{Workflow, WorkflowError, WorkflowEvent, WorkflowState};

    // Stage modules for qualified access.
    pub use optival_pipeline::{
        calibrate, capture, export, measure, quality, status, validate, worker, workflow,
    };
}

/// Core math types, camera model, configuration, and the shared data model.
///
/// This module contains the fundamental building blocks used throughout the
/// library.
pub mod core {
    pub use optival_core::*;
}

/// Pattern and electrode detection on grayscale images.
///
/// Junction scoring, blob extraction, grid ordering, and sub-pixel refinement.
pub mod detect {
    pub use optival_detect::*;
}

/// Closed-form initialization algorithms (homography, Zhang, PnP, etc.).
///
/// Use these for linear initialization before non-linear refinement, and for
/// epipolar matching and triangulation at measurement time.
pub mod linear {
    pub use optival_linear::*;
}

/// Non-linear least-squares refinement problems and the solver.
///
/// Includes per-camera refinement, point refinement, and the global rig
/// adjustment.
pub mod optim {
    pub use optival_optim::*;
}

/// Convenient re-exports for common use cases.
///
/// Import with `use optival::prelude::*;` to get started quickly.
pub mod prelude {
    // Math and camera types
    pub use crate::core::{
        CameraId, CameraModel, ElectrodeId, Intrinsics, Iso3, Mat3, Pt2, Pt3, Vec2, Vec3,
    };

    // Configuration and data model
    pub use crate::core::{
        CalibrationResult, CalibrationView, CaptureSession, ElectrodeMeasurement,
        ElectrodeObservation, NavigationSample, PatternSpec, RigConfig, ValidationRecord,
    };

    // Pipeline drivers
    pub use crate::pipeline::{
        evaluate, measure_frame_set, measure_frame_sets, run_calibration, spawn_task,
        AccuracyValidator, ActiveCalibration, FrameSet, RigCalibration, SessionManager,
        TaskHandle, ValidationOutcome, Workflow, WorkflowEvent, WorkflowState,
    };

    // Persistence
    pub use crate::pipeline::{
        load_report, load_result, save_report, save_result, ValidationReport,
    };

    // Optimizer controls
    pub use crate::optim::{CancelToken, LmOptions, PointRefineOptions};
}
