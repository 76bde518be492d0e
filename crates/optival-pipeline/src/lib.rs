//! Rig workflows: capture, calibration runs, measurement, validation.
//!
//! This crate assembles the lower layers into the operational system.
//! [`capture`] collects synchronized multi-camera views of the target,
//! [`calibrate`] drives the per-camera seeds and the rig-wide bundle
//! adjustment, [`quality`] turns a finished run into a thresholded
//! calibration result, [`measure`] triangulates electrode positions
//! with the adopted calibration, and [`validate`] compares them
//! against the magnetic navigation reference.
//!
//! [`workflow`], [`status`], [`worker`], and [`export`] carry the
//! operational glue: phase gating, device liveness, background
//! execution with cancellation, and versioned persistence.

pub mod calibrate;
pub mod capture;
pub mod export;
pub mod measure;
pub mod quality;
pub mod status;
pub mod validate;
pub mod worker;
pub mod workflow;

pub use calibrate::{run_calibration, CalibrateError, CalibrationRun, RigCalibration};
pub use capture::{
    CameraFrame, CaptureError, SessionManager, SessionProgress, SessionReadiness,
};
pub use export::{
    load_report, load_result, save_report, save_result, ExportError, ValidationReport,
};
pub use measure::{
    detect_electrodes, measure_frame_set, measure_frame_sets, FrameSet, MeasureError,
    MeasurementLedger,
};
pub use quality::{evaluate, ActivationError, ActiveCalibration};
pub use status::{DeviceError, DeviceStatusBoard};
pub use validate::{
    AccuracyValidator, DiscrepancyStats, DriftAdvisory, TemporalMisalignment, ValidationOutcome,
};
pub use worker::{spawn_task, TaskHandle};
pub use workflow::{Workflow, WorkflowError, WorkflowEvent, WorkflowState};
