//! Capture session management.
//!
//! The session manager accepts proposed views, runs pattern detection
//! against every camera frame of a view in parallel, and accumulates
//! the views that satisfy the cross-camera visibility rule. Rejecting
//! a view never disturbs the views already accepted: the operator
//! simply retakes it.
//!
//! Frames of one view must have been captured nearly simultaneously;
//! frames outside the synchronization window are dropped and the view
//! is treated as missing that camera's detection.

use log::{debug, info};
use rayon::prelude::*;
use thiserror::Error;

use optival_core::types::{CalibrationView, CaptureSession, CameraId, TimestampUs};
use optival_core::RigConfig;
use optival_detect::{DetectionFailure, GrayImage, PatternDetector};

/// Views each camera must appear in before calibration can start.
/// Intrinsic initialization needs three independent homographies.
pub const MIN_VIEWS_PER_CAMERA: usize = 3;

/// One camera's frame of a proposed view.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    pub camera: CameraId,
    pub timestamp_us: TimestampUs,
    pub image: GrayImage,
}

/// What happened to one camera's frame while adding a view.
#[derive(Debug, Clone)]
pub enum DetectionOutcome {
    Detected { points: usize, coverage: f64 },
    Failed(DetectionFailure),
    /// Frame fell outside the synchronization window and was dropped.
    OutOfSync { offset_ms: f64 },
    /// No frame was supplied for this camera.
    Missing,
}

impl DetectionOutcome {
    pub fn is_detected(&self) -> bool {
        matches!(self, DetectionOutcome::Detected { .. })
    }
}

/// Summary of one accepted view.
#[derive(Debug, Clone)]
pub struct ViewRecord {
    /// Index of the view within the session.
    pub index: usize,
    pub timestamp_us: TimestampUs,
    pub cameras_detected: usize,
    /// Per-camera outcome, indexed by camera.
    pub outcomes: Vec<DetectionOutcome>,
}

/// Errors raised by session operations. A view-level rejection
/// (`InsufficientViews`) leaves the session intact.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("pattern seen by {seen} of {total} cameras, need at least {needed}")]
    InsufficientViews {
        seen: usize,
        needed: usize,
        total: usize,
        outcomes: Vec<DetectionOutcome>,
    },
    #[error("session already holds the maximum of {0} views")]
    SessionFull(usize),
    #[error("session has no views")]
    NoViews,
    #[error("frame from camera {0} which is not part of the rig")]
    UnknownCamera(CameraId),
    #[error("more than one frame for camera {0}")]
    DuplicateFrame(CameraId),
    #[error("session is not ready: {0}")]
    NotReady(String),
    #[error("session snapshot rejected: {0}")]
    Snapshot(String),
}

/// Why the session cannot be finalized yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessBlocker {
    NeedMoreViews { have: usize, need: usize },
    CameraUnderObserved { camera: CameraId, views: usize, need: usize },
}

impl std::fmt::Display for ReadinessBlocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadinessBlocker::NeedMoreViews { have, need } => {
                write!(f, "{have} of {need} required views captured")
            }
            ReadinessBlocker::CameraUnderObserved { camera, views, need } => {
                write!(f, "{camera} appears in {views} views, needs {need}")
            }
        }
    }
}

/// Capture progress for operator display.
#[derive(Debug, Clone)]
pub struct SessionProgress {
    pub views_accepted: usize,
    pub min_views: usize,
    pub max_views: usize,
    /// Number of views each camera has a detection in.
    pub views_per_camera: Vec<usize>,
    pub ready: bool,
}

/// Outcome of the readiness check.
#[derive(Debug, Clone)]
pub struct SessionReadiness {
    pub ready: bool,
    pub blockers: Vec<ReadinessBlocker>,
}

/// Accepts views one at a time and produces the immutable
/// [`CaptureSession`] consumed by calibration.
pub struct SessionManager {
    config: RigConfig,
    detector: PatternDetector,
    views: Vec<CalibrationView>,
    records: Vec<ViewRecord>,
}

impl SessionManager {
    /// Create a manager for a validated configuration.
    pub fn new(config: RigConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let detector = PatternDetector::new(config.pattern.clone(), config.detect.clone());
        Ok(Self {
            config,
            detector,
            views: Vec::new(),
            records: Vec::new(),
        })
    }

    pub fn config(&self) -> &RigConfig {
        &self.config
    }

    /// Views accepted so far.
    pub fn views(&self) -> &[CalibrationView] {
        &self.views
    }

    /// Per-view records, aligned with [`SessionManager::views`].
    pub fn records(&self) -> &[ViewRecord] {
        &self.records
    }

    /// Run detection over the frames of a proposed view and accept it
    /// if at least two cameras see the pattern.
    pub fn add_view(&mut self, frames: &[CameraFrame]) -> Result<ViewRecord, CaptureError> {
        if self.views.len() >= self.config.session.max_views {
            return Err(CaptureError::SessionFull(self.config.session.max_views));
        }

        let slots = self.frame_slots(frames)?;
        let anchor = median_timestamp(frames).ok_or_else(|| CaptureError::InsufficientViews {
            seen: 0,
            needed: optival_core::MIN_CAMERAS_PER_VIEW,
            total: self.config.camera_count,
            outcomes: vec![DetectionOutcome::Missing; self.config.camera_count],
        })?;
        let half_window_ms = self.config.session.sync_window_ms / 2.0;

        // Detection is camera-local; run the frames in parallel.
        let results: Vec<(DetectionOutcome, Option<optival_core::PatternDetection>)> = slots
            .par_iter()
            .map(|slot| match slot {
                None => (DetectionOutcome::Missing, None),
                Some(frame) => {
                    let offset_ms =
                        optival_core::types::timestamp_delta_ms(frame.timestamp_us, anchor);
                    if offset_ms.abs() > half_window_ms {
                        return (DetectionOutcome::OutOfSync { offset_ms }, None);
                    }
                    match self.detector.detect(&frame.image.view()) {
                        Ok(detection) => (
                            DetectionOutcome::Detected {
                                points: detection.len(),
                                coverage: detection.coverage,
                            },
                            Some(detection),
                        ),
                        Err(failure) => (DetectionOutcome::Failed(failure), None),
                    }
                }
            })
            .collect();

        let (outcomes, detections): (Vec<_>, Vec<_>) = results.into_iter().unzip();
        let seen = detections.iter().filter(|d| d.is_some()).count();
        if seen < optival_core::MIN_CAMERAS_PER_VIEW {
            debug!("view rejected: {seen} cameras detected the pattern");
            return Err(CaptureError::InsufficientViews {
                seen,
                needed: optival_core::MIN_CAMERAS_PER_VIEW,
                total: self.config.camera_count,
                outcomes,
            });
        }

        let view = CalibrationView::new(anchor, detections)
            .map_err(|e| CaptureError::Snapshot(e.to_string()))?;
        let record = ViewRecord {
            index: self.views.len(),
            timestamp_us: anchor,
            cameras_detected: seen,
            outcomes,
        };
        info!(
            "view {} accepted: {seen}/{} cameras",
            record.index, self.config.camera_count
        );
        self.views.push(view);
        self.records.push(record.clone());
        Ok(record)
    }

    /// Drop the most recently accepted view.
    pub fn remove_last_view(&mut self) -> Result<(), CaptureError> {
        if self.views.pop().is_none() {
            return Err(CaptureError::NoViews);
        }
        self.records.pop();
        info!("view {} removed", self.views.len());
        Ok(())
    }

    /// Replace the most recently accepted view with a fresh capture.
    /// The old view is kept when the new frames are rejected.
    pub fn retake_last_view(
        &mut self,
        frames: &[CameraFrame],
    ) -> Result<ViewRecord, CaptureError> {
        if self.views.is_empty() {
            return Err(CaptureError::NoViews);
        }
        let old_view = self.views.pop().ok_or(CaptureError::NoViews)?;
        let old_record = self.records.pop().ok_or(CaptureError::NoViews)?;
        match self.add_view(frames) {
            Ok(record) => Ok(record),
            Err(e) => {
                self.views.push(old_view);
                self.records.push(old_record);
                Err(e)
            }
        }
    }

    /// Number of accepted views each camera has a detection in.
    pub fn views_per_camera(&self) -> Vec<usize> {
        (0..self.config.camera_count)
            .map(|c| {
                self.views
                    .iter()
                    .filter(|v| v.detections[c].is_some())
                    .count()
            })
            .collect()
    }

    pub fn progress(&self) -> SessionProgress {
        SessionProgress {
            views_accepted: self.views.len(),
            min_views: self.config.session.min_views,
            max_views: self.config.session.max_views,
            views_per_camera: self.views_per_camera(),
            ready: self.readiness().ready,
        }
    }

    /// Check whether the session can be finalized: enough views overall
    /// and enough views per camera for intrinsic initialization.
    pub fn readiness(&self) -> SessionReadiness {
        let mut blockers = Vec::new();
        if self.views.len() < self.config.session.min_views {
            blockers.push(ReadinessBlocker::NeedMoreViews {
                have: self.views.len(),
                need: self.config.session.min_views,
            });
        }
        for (c, views) in self.views_per_camera().into_iter().enumerate() {
            if views < MIN_VIEWS_PER_CAMERA {
                blockers.push(ReadinessBlocker::CameraUnderObserved {
                    camera: CameraId(c as u32),
                    views,
                    need: MIN_VIEWS_PER_CAMERA,
                });
            }
        }
        SessionReadiness {
            ready: blockers.is_empty(),
            blockers,
        }
    }

    /// Freeze the accepted views into an immutable snapshot.
    pub fn finalize(&self) -> Result<CaptureSession, CaptureError> {
        let readiness = self.readiness();
        if !readiness.ready {
            let text = readiness
                .blockers
                .iter()
                .map(|b| b.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(CaptureError::NotReady(text));
        }
        CaptureSession::new(
            self.config.pattern.clone(),
            self.config.camera_count,
            self.views.clone(),
        )
        .map_err(|e| CaptureError::Snapshot(e.to_string()))
    }

    /// Arrange frames into per-camera slots, rejecting strays.
    fn frame_slots<'a>(
        &self,
        frames: &'a [CameraFrame],
    ) -> Result<Vec<Option<&'a CameraFrame>>, CaptureError> {
        let mut slots: Vec<Option<&CameraFrame>> = vec![None; self.config.camera_count];
        for frame in frames {
            let idx = frame.camera.index();
            if idx >= self.config.camera_count {
                return Err(CaptureError::UnknownCamera(frame.camera));
            }
            if slots[idx].is_some() {
                return Err(CaptureError::DuplicateFrame(frame.camera));
            }
            slots[idx] = Some(frame);
        }
        Ok(slots)
    }
}

fn median_timestamp(frames: &[CameraFrame]) -> Option<TimestampUs> {
    if frames.is_empty() {
        return None;
    }
    let mut stamps: Vec<TimestampUs> = frames.iter().map(|f| f.timestamp_us).collect();
    stamps.sort_unstable();
    Some(stamps[stamps.len() / 2])
}
