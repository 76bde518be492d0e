//! Pattern detection entry point.

use log::debug;

use optival_core::config::DetectOptions;
use optival_core::math::Pt2;
use optival_core::pattern::PatternSpec;
use optival_core::types::{bounding_box_coverage, PatternDetection};

use crate::blobs::{find_blobs, BlobParams};
use crate::corners::{find_junctions, refine_subpixel};
use crate::grid::order_into_grid;
use crate::image::GrayView;
use crate::DetectionFailure;

/// Iteration cap and convergence step for sub-pixel refinement.
const REFINE_MAX_ITERATIONS: usize = 30;
const REFINE_EPS: f64 = 1e-3;

/// Detects one configured pattern in grayscale frames.
///
/// The same detector instance serves every camera of the rig; it is
/// immutable after construction and safe to share across worker
/// threads.
#[derive(Clone, Debug)]
pub struct PatternDetector {
    pattern: PatternSpec,
    opts: DetectOptions,
}

impl PatternDetector {
    pub fn new(pattern: PatternSpec, opts: DetectOptions) -> Self {
        Self { pattern, opts }
    }

    pub fn pattern(&self) -> &PatternSpec {
        &self.pattern
    }

    /// Detect the pattern, returning ordered sub-pixel points.
    ///
    /// Points come back in row-major grid order with per-point
    /// confidences and the frame coverage fraction.
    pub fn detect(&self, frame: &GrayView<'_>) -> Result<PatternDetection, DetectionFailure> {
        let (rows, cols) = self.pattern.grid_size();
        let expected = rows * cols;

        let (points, confidences) = match self.pattern {
            PatternSpec::Checkerboard { .. } | PatternSpec::RectangleGrid { .. } => {
                self.detect_junction_grid(frame, rows, cols)?
            }
            PatternSpec::CircleGrid { .. } => self.detect_circle_grid(frame, rows, cols)?,
        };
        debug_assert_eq!(points.len(), expected);

        let coverage = bounding_box_coverage(&points, frame.width as u32, frame.height as u32);
        if coverage < self.opts.min_coverage {
            return Err(DetectionFailure::LowCoverage {
                coverage,
                min_coverage: self.opts.min_coverage,
            });
        }

        Ok(PatternDetection {
            points,
            confidences,
            coverage,
        })
    }

    fn detect_junction_grid(
        &self,
        frame: &GrayView<'_>,
        rows: usize,
        cols: usize,
    ) -> Result<(Vec<Pt2>, Vec<f64>), DetectionFailure> {
        let expected = rows * cols;
        let mut candidates = find_junctions(
            frame,
            self.opts.ring_radius_px,
            self.opts.nms_radius,
            self.opts.threshold_rel,
        );
        debug!(
            "junction scan: {} candidates for {} expected",
            candidates.len(),
            expected
        );
        if candidates.len() < expected {
            return Err(DetectionFailure::NotEnoughPoints {
                expected,
                found: candidates.len(),
            });
        }

        candidates.sort_by(|a, b| b.response.total_cmp(&a.response));
        candidates.truncate(expected);
        let max_response = candidates[0].response.max(f64::MIN_POSITIVE);

        let refined: Vec<(Pt2, f64)> = candidates
            .iter()
            .map(|c| {
                let p = refine_subpixel(
                    frame,
                    Pt2::new(c.x as f64, c.y as f64),
                    self.opts.refine_half_window,
                    REFINE_MAX_ITERATIONS,
                    REFINE_EPS,
                );
                (p, (c.response / max_response).clamp(f64::MIN_POSITIVE, 1.0))
            })
            .collect();

        self.order(refined, rows, cols)
    }

    fn detect_circle_grid(
        &self,
        frame: &GrayView<'_>,
        rows: usize,
        cols: usize,
    ) -> Result<(Vec<Pt2>, Vec<f64>), DetectionFailure> {
        let expected = rows * cols;
        let mut blobs = find_blobs(frame, &BlobParams::default());
        debug!("blob scan: {} blobs for {} expected", blobs.len(), expected);
        if blobs.len() < expected {
            return Err(DetectionFailure::NotEnoughPoints {
                expected,
                found: blobs.len(),
            });
        }

        blobs.sort_by(|a, b| b.contrast.total_cmp(&a.contrast));
        blobs.truncate(expected);
        let scored: Vec<(Pt2, f64)> = blobs
            .into_iter()
            .map(|b| (b.centroid, b.contrast.max(f64::MIN_POSITIVE)))
            .collect();

        self.order(scored, rows, cols)
    }

    fn order(
        &self,
        scored: Vec<(Pt2, f64)>,
        rows: usize,
        cols: usize,
    ) -> Result<(Vec<Pt2>, Vec<f64>), DetectionFailure> {
        let points: Vec<_> = scored.iter().map(|(p, _)| *p).collect();
        let (width, height) = self.pattern.physical_size();
        let aspect = width / height.max(f64::MIN_POSITIVE);

        let ordered =
            order_into_grid(&points, rows, cols, aspect).ok_or(DetectionFailure::GridOrdering {
                found: points.len(),
                rows,
                cols,
            })?;

        // Carry each point's confidence through the reordering.
        let confidences = ordered
            .iter()
            .map(|p| {
                scored
                    .iter()
                    .map(|(q, conf)| ((p - q).norm(), *conf))
                    .min_by(|a, b| a.0.total_cmp(&b.0))
                    .map(|(_, conf)| conf)
                    .unwrap_or(f64::MIN_POSITIVE)
            })
            .collect();

        Ok((ordered, confidences))
    }
}
