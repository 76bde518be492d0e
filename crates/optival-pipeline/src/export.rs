//! Persistence of calibration results and validation reports.
//!
//! Files are pretty-printed JSON carrying a schema version
//! ([`RESULT_SCHEMA_VERSION`]). The loader accepts the current version
//! and older ones, and refuses files written by a newer schema so a
//! downgraded install never misreads fields it does not know about.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use optival_core::types::{
    CalibrationResult, ElectrodeMeasurement, NavigationSample, ValidationRecord,
    RESULT_SCHEMA_VERSION,
};

use crate::validate::{AccuracyValidator, DiscrepancyStats, DriftAdvisory, TemporalMisalignment};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode {}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed JSON in {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(
        "{} was written by schema version {found}, newer than the supported {supported}",
        path.display()
    )]
    NewerSchema {
        path: PathBuf,
        found: u32,
        supported: u32,
    },
}

/// Outcome of an accuracy validation run, exported next to the
/// calibration result it was produced under.
///
/// `measurements` and `samples` are the session's raw inputs; the
/// caller attaches them so the file stands on its own for offline
/// analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub measurements: Vec<ElectrodeMeasurement>,
    pub samples: Vec<NavigationSample>,
    pub records: Vec<ValidationRecord>,
    pub misalignments: Vec<TemporalMisalignment>,
    pub stats: DiscrepancyStats,
    pub drift: Option<DriftAdvisory>,
    pub version: u32,
}

impl ValidationReport {
    pub fn from_validator(validator: &AccuracyValidator) -> Self {
        Self {
            measurements: Vec::new(),
            samples: Vec::new(),
            records: validator.records().to_vec(),
            misalignments: validator.misalignments().to_vec(),
            stats: validator.summary(),
            drift: validator.drift_advisory(),
            version: RESULT_SCHEMA_VERSION,
        }
    }
}

pub fn save_result(path: &Path, result: &CalibrationResult) -> Result<(), ExportError> {
    save_json(path, result)?;
    info!(
        "exported calibration result ({} cameras, valid: {}) to {}",
        result.cameras.len(),
        result.valid,
        path.display()
    );
    Ok(())
}

/// Load a previously exported calibration result.
pub fn load_result(path: &Path) -> Result<CalibrationResult, ExportError> {
    load_json(path)
}

pub fn save_report(path: &Path, report: &ValidationReport) -> Result<(), ExportError> {
    save_json(path, report)
}

pub fn load_report(path: &Path) -> Result<ValidationReport, ExportError> {
    load_json(path)
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ExportError> {
    let json = serde_json::to_string_pretty(value).map_err(|source| ExportError::Encode {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, json).map_err(|source| ExportError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, ExportError> {
    let data = fs::read_to_string(path).map_err(|source| ExportError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let value: serde_json::Value =
        serde_json::from_str(&data).map_err(|source| ExportError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    // The version gate runs before field-level decoding: a newer
    // writer may have renamed or retyped anything else in the file.
    if let Some(found) = value.get("version").and_then(serde_json::Value::as_u64) {
        let found = found as u32;
        if found > RESULT_SCHEMA_VERSION {
            return Err(ExportError::NewerSchema {
                path: path.to_path_buf(),
                found,
                supported: RESULT_SCHEMA_VERSION,
            });
        }
    }

    serde_json::from_value(value).map_err(|source| ExportError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
