//! End-to-end accuracy validation against the navigation device.
//!
//! Each electrode measurement is compared with the navigation sample
//! nearest in time. Samples further apart than the sync tolerance are
//! never compared; the mismatch is recorded instead, because comparing
//! positions captured at different instants of a moving catheter would
//! fabricate discrepancy.
//!
//! The validator is pure over the samples it is handed. When the
//! navigation device disconnects the caller simply stops handing it
//! samples and validation pauses; measurements continue independently.

use log::warn;
use serde::{Deserialize, Serialize};

use optival_core::config::ValidateOptions;
use optival_core::types::{
    timestamp_delta_ms, ElectrodeId, ElectrodeMeasurement, NavigationSample, TimestampUs,
    ValidationRecord,
};

/// A measurement that could not be validated: no navigation sample
/// close enough in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporalMisalignment {
    pub electrode: ElectrodeId,
    pub measurement_timestamp_us: TimestampUs,
    /// Signed gap to the nearest sample, or `None` when no sample was
    /// available at all.
    pub nearest_gap_ms: Option<f64>,
}

/// What became of one measurement handed to the validator.
#[derive(Debug, Clone)]
pub enum ValidationOutcome {
    Compared(ValidationRecord),
    Misaligned(TemporalMisalignment),
}

/// Aggregate discrepancy figures over a validation session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscrepancyStats {
    /// Measurements handed to the validator, compared or not.
    pub count: usize,
    /// Measurements that found a sample within the sync tolerance.
    pub matched: usize,
    /// Matched measurements within the accuracy budget.
    pub passed: usize,
    pub mean_mm: f64,
    pub max_mm: f64,
    pub rms_mm: f64,
}

/// Mean discrepancy growth over the recent record window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftAdvisory {
    pub early_mean_mm: f64,
    pub late_mean_mm: f64,
    pub window: usize,
}

impl std::fmt::Display for DriftAdvisory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "mean discrepancy grew from {:.3} mm to {:.3} mm over the last {} records",
            self.early_mean_mm, self.late_mean_mm, self.window
        )
    }
}

/// Compares optical measurements against navigation samples and keeps
/// the running validation history.
#[derive(Debug)]
pub struct AccuracyValidator {
    opts: ValidateOptions,
    budget_mm: f64,
    records: Vec<ValidationRecord>,
    misalignments: Vec<TemporalMisalignment>,
}

impl AccuracyValidator {
    pub fn new(opts: ValidateOptions, budget_mm: f64) -> Self {
        Self {
            opts,
            budget_mm,
            records: Vec::new(),
            misalignments: Vec::new(),
        }
    }

    /// Validate one measurement against the available samples.
    ///
    /// The outcome is recorded either way; a misalignment never aborts
    /// the validation session.
    pub fn check(
        &mut self,
        measurement: &ElectrodeMeasurement,
        samples: &[NavigationSample],
    ) -> ValidationOutcome {
        let nearest = samples.iter().min_by(|a, b| {
            let da = timestamp_delta_ms(measurement.timestamp_us, a.timestamp_us).abs();
            let db = timestamp_delta_ms(measurement.timestamp_us, b.timestamp_us).abs();
            da.total_cmp(&db)
        });

        let gap_ms =
            nearest.map(|s| timestamp_delta_ms(measurement.timestamp_us, s.timestamp_us));
        let sample = match (nearest, gap_ms) {
            (Some(s), Some(gap)) if gap.abs() <= self.opts.sync_tolerance_ms => s,
            _ => {
                let misalignment = TemporalMisalignment {
                    electrode: measurement.electrode,
                    measurement_timestamp_us: measurement.timestamp_us,
                    nearest_gap_ms: gap_ms,
                };
                warn!(
                    "{}: no navigation sample within {} ms (nearest {:?})",
                    measurement.electrode, self.opts.sync_tolerance_ms, gap_ms
                );
                self.misalignments.push(misalignment.clone());
                return ValidationOutcome::Misaligned(misalignment);
            }
        };

        let record = ValidationRecord::from_match(
            measurement.electrode,
            measurement.timestamp_us,
            sample.timestamp_us,
            &measurement.position_mm,
            &sample.position_mm,
            self.budget_mm,
        );
        self.records.push(record.clone());
        ValidationOutcome::Compared(record)
    }

    pub fn records(&self) -> &[ValidationRecord] {
        &self.records
    }

    pub fn misalignments(&self) -> &[TemporalMisalignment] {
        &self.misalignments
    }

    /// Number of compared records that exceeded the accuracy budget.
    pub fn out_of_budget(&self) -> usize {
        self.records.iter().filter(|r| !r.within_threshold).count()
    }

    /// Aggregate figures over everything validated so far.
    pub fn summary(&self) -> DiscrepancyStats {
        let matched = self.records.len();
        let mut stats = DiscrepancyStats {
            count: matched + self.misalignments.len(),
            matched,
            passed: matched - self.out_of_budget(),
            ..DiscrepancyStats::default()
        };
        if matched > 0 {
            let magnitudes: Vec<f64> = self.records.iter().map(|r| r.magnitude_mm).collect();
            stats.mean_mm = magnitudes.iter().sum::<f64>() / matched as f64;
            stats.max_mm = magnitudes.iter().cloned().fold(0.0, f64::max);
            stats.rms_mm =
                (magnitudes.iter().map(|m| m * m).sum::<f64>() / matched as f64).sqrt();
        }
        stats
    }

    /// Check the recent record window for growing discrepancy.
    ///
    /// Compares the mean magnitude of the older half of the window with
    /// the newer half; a growth past the advisory threshold suggests
    /// the calibration is drifting and a refresh is due.
    pub fn drift_advisory(&self) -> Option<DriftAdvisory> {
        let window = self.opts.drift_window;
        if window < 2 || self.records.len() < window {
            return None;
        }
        let recent = &self.records[self.records.len() - window..];
        let half = window / 2;
        let mean = |records: &[ValidationRecord]| {
            records.iter().map(|r| r.magnitude_mm).sum::<f64>() / records.len() as f64
        };
        let early_mean_mm = mean(&recent[..half]);
        let late_mean_mm = mean(&recent[half..]);
        if late_mean_mm - early_mean_mm > self.opts.drift_advisory_mm {
            Some(DriftAdvisory {
                early_mean_mm,
                late_mean_mm,
                window,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optival_core::math::{Mat3, Pt3};
    use optival_core::types::CameraId;

    fn measurement(x_mm: f64, timestamp_us: TimestampUs) -> ElectrodeMeasurement {
        ElectrodeMeasurement::new(
            ElectrodeId(0),
            Pt3::new(x_mm, 0.0, 0.0),
            Mat3::identity() * 1e-4,
            vec![CameraId(0), CameraId(1)],
            60.0,
            timestamp_us,
        )
        .unwrap()
    }

    fn sample(x_mm: f64, timestamp_us: TimestampUs) -> NavigationSample {
        NavigationSample {
            position_mm: Pt3::new(x_mm, 0.0, 0.0),
            timestamp_us,
            device: "nav-sim".to_string(),
        }
    }

    #[test]
    fn compares_against_nearest_sample_in_tolerance() {
        let mut validator = AccuracyValidator::new(ValidateOptions::default(), 1.0);
        let samples = [sample(10.0, 990_000), sample(50.0, 500_000)];

        match validator.check(&measurement(10.4, 1_000_000), &samples) {
            ValidationOutcome::Compared(record) => {
                assert_eq!(record.sample_timestamp_us, 990_000);
                assert!((record.magnitude_mm - 0.4).abs() < 1e-9);
                assert!(record.within_threshold);
            }
            other => panic!("expected comparison, got {other:?}"),
        }
        assert_eq!(validator.records().len(), 1);
        assert_eq!(validator.out_of_budget(), 0);
    }

    #[test]
    fn distant_sample_is_a_misalignment() {
        let mut validator = AccuracyValidator::new(ValidateOptions::default(), 1.0);
        // Nearest sample is 200 ms away; tolerance is 50 ms.
        let samples = [sample(10.0, 800_000)];

        match validator.check(&measurement(10.0, 1_000_000), &samples) {
            ValidationOutcome::Misaligned(m) => {
                assert_eq!(m.electrode, ElectrodeId(0));
                let gap = m.nearest_gap_ms.unwrap();
                assert!((gap - 200.0).abs() < 1e-9);
            }
            other => panic!("expected misalignment, got {other:?}"),
        }
        assert!(validator.records().is_empty());
        assert_eq!(validator.misalignments().len(), 1);
    }

    #[test]
    fn no_samples_is_a_misalignment_without_gap() {
        let mut validator = AccuracyValidator::new(ValidateOptions::default(), 1.0);
        match validator.check(&measurement(0.0, 0), &[]) {
            ValidationOutcome::Misaligned(m) => assert!(m.nearest_gap_ms.is_none()),
            other => panic!("expected misalignment, got {other:?}"),
        }
    }

    #[test]
    fn over_budget_comparison_is_recorded_not_dropped() {
        let mut validator = AccuracyValidator::new(ValidateOptions::default(), 1.0);
        let samples = [sample(10.0, 1_000_000)];

        match validator.check(&measurement(11.5, 1_000_000), &samples) {
            ValidationOutcome::Compared(record) => assert!(!record.within_threshold),
            other => panic!("expected comparison, got {other:?}"),
        }
        assert_eq!(validator.out_of_budget(), 1);
    }

    #[test]
    fn summary_aggregates_matched_and_misaligned() {
        let mut validator = AccuracyValidator::new(ValidateOptions::default(), 1.0);
        let samples = [sample(10.0, 1_000_000)];
        validator.check(&measurement(10.3, 1_000_000), &samples);
        validator.check(&measurement(10.4, 1_010_000), &samples);
        validator.check(&measurement(11.5, 1_020_000), &samples);
        // Nothing within tolerance of this one.
        validator.check(&measurement(10.0, 9_000_000), &samples);

        let stats = validator.summary();
        assert_eq!(stats.count, 4);
        assert_eq!(stats.matched, 3);
        assert_eq!(stats.passed, 2);
        assert!((stats.mean_mm - (0.3 + 0.4 + 1.5) / 3.0).abs() < 1e-9);
        assert!((stats.max_mm - 1.5).abs() < 1e-9);
        let expected_rms = ((0.09 + 0.16 + 2.25) / 3.0f64).sqrt();
        assert!((stats.rms_mm - expected_rms).abs() < 1e-9);
    }

    #[test]
    fn growing_discrepancy_raises_drift_advisory() {
        let mut validator = AccuracyValidator::new(ValidateOptions::default(), 1.0);
        for i in 0..20i64 {
            let discrepancy = if i < 10 { 0.1 } else { 0.8 };
            let t = i * 1_000_000;
            let samples = [sample(10.0, t)];
            validator.check(&measurement(10.0 + discrepancy, t), &samples);
        }

        let advisory = validator.drift_advisory().expect("drift expected");
        assert!((advisory.early_mean_mm - 0.1).abs() < 1e-9);
        assert!((advisory.late_mean_mm - 0.8).abs() < 1e-9);
        assert_eq!(advisory.window, 20);
    }

    #[test]
    fn stable_discrepancy_raises_no_advisory() {
        let mut validator = AccuracyValidator::new(ValidateOptions::default(), 1.0);
        for i in 0..25i64 {
            let t = i * 1_000_000;
            let samples = [sample(10.0, t)];
            validator.check(&measurement(10.2, t), &samples);
        }
        assert!(validator.drift_advisory().is_none());
    }
}
