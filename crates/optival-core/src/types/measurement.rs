//! Electrode observation and measurement records.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::math::{Mat3, Pt2, Pt3};
use crate::types::{CameraId, ElectrodeId, TimestampUs};

/// A single-camera sighting of one electrode marker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ElectrodeObservation {
    pub camera: CameraId,
    pub pixel: Pt2,
    /// Detector confidence in `(0, 1]`.
    pub confidence: f64,
    /// Capture timestamp of the source frame.
    pub timestamp_us: TimestampUs,
}

/// A triangulated 3D electrode position with its uncertainty.
///
/// Measurements are immutable once created; a later measurement of the same
/// electrode supersedes this one rather than mutating it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectrodeMeasurement {
    pub electrode: ElectrodeId,
    /// Position in the world frame, millimetres.
    pub position_mm: Pt3,
    /// 3×3 position covariance, mm².
    pub covariance_mm2: Mat3,
    /// Scalar uncertainty, `sqrt(trace(covariance))`, millimetres.
    pub uncertainty_mm: f64,
    /// Cameras whose observations contributed (always >= 2).
    pub cameras: Vec<CameraId>,
    /// Mean pairwise angle between contributing viewing rays, degrees.
    pub mean_ray_angle_deg: f64,
    pub timestamp_us: TimestampUs,
}

impl ElectrodeMeasurement {
    /// Construct a measurement, enforcing the two-camera minimum.
    pub fn new(
        electrode: ElectrodeId,
        position_mm: Pt3,
        covariance_mm2: Mat3,
        cameras: Vec<CameraId>,
        mean_ray_angle_deg: f64,
        timestamp_us: TimestampUs,
    ) -> Result<Self> {
        ensure!(
            cameras.len() >= 2,
            "measurement needs >= 2 contributing cameras, got {}",
            cameras.len()
        );
        let uncertainty_mm = covariance_mm2.trace().max(0.0).sqrt();
        ensure!(
            uncertainty_mm.is_finite(),
            "measurement covariance is not finite"
        );
        Ok(Self {
            electrode,
            position_mm,
            covariance_mm2,
            uncertainty_mm,
            cameras,
            mean_ray_angle_deg,
            timestamp_us,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measurement_requires_two_cameras() {
        let result = ElectrodeMeasurement::new(
            ElectrodeId(0),
            Pt3::new(1.0, 2.0, 3.0),
            Mat3::identity() * 0.01,
            vec![CameraId(0)],
            0.0,
            1000,
        );
        assert!(result.is_err());
    }

    #[test]
    fn uncertainty_is_sqrt_trace() {
        let m = ElectrodeMeasurement::new(
            ElectrodeId(1),
            Pt3::origin(),
            Mat3::identity() * 0.04,
            vec![CameraId(0), CameraId(1)],
            45.0,
            1000,
        )
        .unwrap();
        assert!((m.uncertainty_mm - 0.12f64.sqrt()).abs() < 1e-12);
    }
}
