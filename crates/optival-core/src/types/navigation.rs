//! Navigation-system samples and validation records.

use serde::{Deserialize, Serialize};

use crate::math::{Pt3, Vec3};
use crate::types::{ElectrodeId, TimestampUs};

/// One position report from the magnetic navigation device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationSample {
    /// Position in the shared world frame, millimetres.
    pub position_mm: Pt3,
    pub timestamp_us: TimestampUs,
    /// Source device identifier.
    pub device: String,
}

/// Outcome of comparing one measurement against its matched sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub electrode: ElectrodeId,
    pub measurement_timestamp_us: TimestampUs,
    pub sample_timestamp_us: TimestampUs,
    /// Optical position minus navigation position, millimetres.
    pub discrepancy_mm: Vec3,
    pub magnitude_mm: f64,
    /// True when `magnitude_mm` is within the end-to-end accuracy budget.
    pub within_threshold: bool,
}

impl ValidationRecord {
    /// Build a record from matched positions and the accuracy budget.
    pub fn from_match(
        electrode: ElectrodeId,
        measurement_timestamp_us: TimestampUs,
        sample_timestamp_us: TimestampUs,
        optical_mm: &Pt3,
        navigation_mm: &Pt3,
        budget_mm: f64,
    ) -> Self {
        let discrepancy_mm = optical_mm - navigation_mm;
        let magnitude_mm = discrepancy_mm.norm();
        Self {
            electrode,
            measurement_timestamp_us,
            sample_timestamp_us,
            discrepancy_mm,
            magnitude_mm,
            within_threshold: magnitude_mm <= budget_mm,
        }
    }
}
