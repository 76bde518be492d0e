//! Electrode measurement against the active calibration.
//!
//! A measurement starts from per-camera spot detections, groups the
//! detections that belong to the same physical electrode, triangulates
//! each group, and refines the point with its covariance. Grouping uses
//! epipolar-consistency voting: a detection joins a group only when it
//! is consistent with every member under the pairwise fundamental
//! matrices of the calibrated rig.
//!
//! Measurements keep flowing while validation is paused; the two paths
//! are independent by design.

use std::collections::BTreeMap;

use log::debug;
use rayon::prelude::*;
use thiserror::Error;

use optival_core::config::MeasureOptions;
use optival_core::math::{Mat3, Pt2};
use optival_core::types::{
    ElectrodeId, ElectrodeMeasurement, ElectrodeObservation, TimestampUs,
};
use optival_core::{CameraId, CameraModel};
use optival_detect::{find_spots, GrayView};
use optival_linear::{
    fundamental_between, symmetric_epipolar_distance, triangulate_pixels, EpipolarError,
    TriangulationError,
};
use optival_optim::{refine_point, CancelToken, PointRefineOptions, SolveError};

#[derive(Debug, Error)]
pub enum MeasureError {
    #[error("usable detections from {seen} cameras, need at least {needed}")]
    InsufficientObservations { seen: usize, needed: usize },
    #[error("observation from camera {0} which is not part of the rig")]
    UnknownCamera(CameraId),
    #[error("camera {0} contributed more than one observation")]
    DuplicateObservation(CameraId),
    #[error(transparent)]
    Epipolar(#[from] EpipolarError),
    #[error(transparent)]
    Geometry(#[from] TriangulationError),
    #[error(transparent)]
    Optimization(#[from] SolveError),
    #[error("measurement rejected: {0}")]
    Rejected(String),
}

/// Detect bright electrode markers in one camera frame.
pub fn detect_electrodes(
    frame: &GrayView<'_>,
    camera: CameraId,
    timestamp_us: TimestampUs,
    opts: &MeasureOptions,
) -> Vec<ElectrodeObservation> {
    find_spots(frame, opts.max_spots_per_frame)
        .into_iter()
        .map(|spot| ElectrodeObservation {
            camera,
            pixel: spot.pixel,
            confidence: spot.confidence,
            timestamp_us,
        })
        .collect()
}

/// Near-simultaneous detections from every rig camera, one candidate
/// list per camera slot.
#[derive(Debug, Clone)]
pub struct FrameSet {
    pub timestamp_us: TimestampUs,
    pub candidates: Vec<Vec<ElectrodeObservation>>,
}

/// Measure one electrode from operator-matched observations.
///
/// The observations must come from distinct cameras; triangulation
/// seeds a nonlinear refinement that also yields the position
/// covariance and the mean ray angle.
pub fn measure_observations(
    cameras: &[CameraModel],
    electrode: ElectrodeId,
    observations: &[ElectrodeObservation],
    refine: &PointRefineOptions,
    cancel: &CancelToken,
) -> Result<ElectrodeMeasurement, MeasureError> {
    let mut seen = vec![false; cameras.len()];
    let mut sightings: Vec<(&CameraModel, Pt2)> = Vec::with_capacity(observations.len());
    for obs in observations {
        let idx = obs.camera.index();
        if idx >= cameras.len() {
            return Err(MeasureError::UnknownCamera(obs.camera));
        }
        if seen[idx] {
            return Err(MeasureError::DuplicateObservation(obs.camera));
        }
        seen[idx] = true;
        sightings.push((&cameras[idx], obs.pixel));
    }
    if sightings.len() < 2 {
        return Err(MeasureError::InsufficientObservations {
            seen: sightings.len(),
            needed: 2,
        });
    }

    let seed = triangulate_pixels(&sightings)?;
    let refined = refine_point(&sightings, &seed, refine, cancel)?;

    let contributing: Vec<CameraId> = observations.iter().map(|o| o.camera).collect();
    ElectrodeMeasurement::new(
        electrode,
        refined.position_mm,
        refined.covariance_mm2,
        contributing,
        refined.mean_ray_angle_deg,
        median_timestamp(observations),
    )
    .map_err(|e| MeasureError::Rejected(e.to_string()))
}

fn median_timestamp(observations: &[ElectrodeObservation]) -> TimestampUs {
    let mut stamps: Vec<TimestampUs> = observations.iter().map(|o| o.timestamp_us).collect();
    stamps.sort_unstable();
    stamps[stamps.len() / 2]
}

/// Pairwise fundamental matrices for the upper triangle of the rig.
struct PairGeometry {
    fundamental: Vec<Vec<Option<Mat3>>>,
}

impl PairGeometry {
    fn new(cameras: &[CameraModel]) -> Result<Self, EpipolarError> {
        let n = cameras.len();
        let mut fundamental = vec![vec![None; n]; n];
        for a in 0..n {
            for b in (a + 1)..n {
                fundamental[a][b] = Some(fundamental_between(&cameras[a], &cameras[b])?);
            }
        }
        Ok(Self { fundamental })
    }

    /// Symmetric epipolar distance between undistorted pixels of two
    /// cameras, order-insensitive.
    fn distance(&self, a: usize, pixel_a: &Pt2, b: usize, pixel_b: &Pt2) -> f64 {
        if a < b {
            match &self.fundamental[a][b] {
                Some(f) => symmetric_epipolar_distance(f, pixel_a, pixel_b),
                None => f64::INFINITY,
            }
        } else {
            self.distance(b, pixel_b, a, pixel_a)
        }
    }
}

/// Group per-camera candidate detections into per-electrode sets by
/// epipolar-consistency voting.
///
/// Seeds each group with the most consistent unused pair, then grows it
/// with at most one candidate per remaining camera, requiring
/// consistency with every current member. Detections that never reach
/// consistency with anything are left ungrouped.
pub fn group_candidates(
    cameras: &[CameraModel],
    candidates: &[Vec<ElectrodeObservation>],
    tolerance_px: f64,
) -> Result<Vec<Vec<ElectrodeObservation>>, MeasureError> {
    let geometry = PairGeometry::new(cameras)?;
    let undistorted: Vec<Vec<Pt2>> = candidates
        .iter()
        .enumerate()
        .map(|(c, list)| {
            list.iter()
                .map(|obs| cameras[c].undistorted_pixel(&obs.pixel))
                .collect()
        })
        .collect();
    let mut used: Vec<Vec<bool>> = candidates.iter().map(|l| vec![false; l.len()]).collect();
    let mut groups = Vec::new();

    loop {
        // Most consistent unused pair seeds the next group.
        let mut best: Option<(f64, (usize, usize), (usize, usize))> = None;
        for a in 0..cameras.len() {
            for i in 0..candidates[a].len() {
                if used[a][i] {
                    continue;
                }
                for b in (a + 1)..cameras.len() {
                    for j in 0..candidates[b].len() {
                        if used[b][j] {
                            continue;
                        }
                        let d = geometry.distance(a, &undistorted[a][i], b, &undistorted[b][j]);
                        if d < tolerance_px && best.is_none_or(|(bd, _, _)| d < bd) {
                            best = Some((d, (a, i), (b, j)));
                        }
                    }
                }
            }
        }
        let Some((_, (a, i), (b, j))) = best else {
            break;
        };

        let mut members = vec![(a, i), (b, j)];
        for c in 0..cameras.len() {
            if c == a || c == b {
                continue;
            }
            let mut best_k: Option<(f64, usize)> = None;
            for k in 0..candidates[c].len() {
                if used[c][k] {
                    continue;
                }
                let worst = members
                    .iter()
                    .map(|&(m, n)| geometry.distance(c, &undistorted[c][k], m, &undistorted[m][n]))
                    .fold(0.0f64, f64::max);
                if worst < tolerance_px && best_k.is_none_or(|(bd, _)| worst < bd) {
                    best_k = Some((worst, k));
                }
            }
            if let Some((_, k)) = best_k {
                members.push((c, k));
            }
        }

        for &(c, k) in &members {
            used[c][k] = true;
        }
        groups.push(members.into_iter().map(|(c, k)| candidates[c][k]).collect());
    }

    let stray: usize = used
        .iter()
        .map(|l| l.iter().filter(|u| !**u).count())
        .sum();
    if stray > 0 {
        debug!("{stray} detections left ungrouped");
    }
    Ok(groups)
}

/// Measure every electrode visible in one frame set.
///
/// Electrode indices follow group discovery order within the set;
/// associating them across sets is the caller's concern.
pub fn measure_frame_set(
    cameras: &[CameraModel],
    set: &FrameSet,
    measure: &MeasureOptions,
    refine: &PointRefineOptions,
    cancel: &CancelToken,
) -> Result<Vec<ElectrodeMeasurement>, MeasureError> {
    let cameras_with_detections = set.candidates.iter().filter(|l| !l.is_empty()).count();
    if cameras_with_detections < 2 {
        return Err(MeasureError::InsufficientObservations {
            seen: cameras_with_detections,
            needed: 2,
        });
    }

    let groups = group_candidates(cameras, &set.candidates, measure.epipolar_tolerance_px)?;
    groups
        .iter()
        .enumerate()
        .map(|(idx, group)| {
            measure_observations(cameras, ElectrodeId(idx as u32), group, refine, cancel)
        })
        .collect()
}

/// Measure a batch of frame sets in parallel, one result per set.
pub fn measure_frame_sets(
    cameras: &[CameraModel],
    sets: &[FrameSet],
    measure: &MeasureOptions,
    refine: &PointRefineOptions,
    cancel: &CancelToken,
) -> Vec<Result<Vec<ElectrodeMeasurement>, MeasureError>> {
    sets.par_iter()
        .map(|set| measure_frame_set(cameras, set, measure, refine, cancel))
        .collect()
}

/// Per-electrode measurement history. A newly recorded measurement
/// supersedes the previous one for display; the history is retained.
#[derive(Debug, Default)]
pub struct MeasurementLedger {
    entries: BTreeMap<ElectrodeId, Vec<ElectrodeMeasurement>>,
}

impl MeasurementLedger {
    pub fn record(&mut self, measurement: ElectrodeMeasurement) {
        self.entries
            .entry(measurement.electrode)
            .or_default()
            .push(measurement);
    }

    /// Most recent measurement of one electrode, by timestamp.
    pub fn latest(&self, electrode: ElectrodeId) -> Option<&ElectrodeMeasurement> {
        self.entries
            .get(&electrode)?
            .iter()
            .max_by_key(|m| m.timestamp_us)
    }

    pub fn history(&self, electrode: ElectrodeId) -> &[ElectrodeMeasurement] {
        self.entries
            .get(&electrode)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn electrodes(&self) -> Vec<ElectrodeId> {
        self.entries.keys().copied().collect()
    }
}
