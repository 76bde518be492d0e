//! Data model shared by the calibration and measurement paths.

mod measurement;
mod navigation;
mod observation;
mod result;

pub use measurement::{ElectrodeMeasurement, ElectrodeObservation};
pub use navigation::{NavigationSample, ValidationRecord};
pub use observation::{
    bounding_box_coverage, CalibrationView, CaptureSession, PatternDetection,
    MAX_SESSION_VIEWS, MIN_CAMERAS_PER_VIEW, MIN_SESSION_VIEWS,
};
pub use result::{
    BaselineEntry, CalibrationResult, CoverageStats, PerCameraQuality, ThresholdFailure,
    RESULT_SCHEMA_VERSION,
};

use serde::{Deserialize, Serialize};

/// Microseconds since the capture epoch.
pub type TimestampUs = i64;

/// Difference between two timestamps in milliseconds.
pub fn timestamp_delta_ms(a: TimestampUs, b: TimestampUs) -> f64 {
    (a - b) as f64 / 1000.0
}

/// Identifier of a physical camera in the rig.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CameraId(pub u32);

impl CameraId {
    /// Index into per-camera vectors.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for CameraId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cam{}", self.0)
    }
}

/// Identifier of a catheter electrode.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ElectrodeId(pub u32);

impl std::fmt::Display for ElectrodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "electrode{}", self.0)
    }
}
