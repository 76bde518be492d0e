//! Feature detection for `optival`.
//!
//! This crate turns grayscale camera frames into ordered sub-pixel
//! observations:
//! - checkerboard and rectangle-grid junctions via a ring response,
//! - circle-grid centres and electrode markers via contrast blobs,
//! - sub-pixel refinement by gradient orthogonality,
//! - supersampled synthetic frame renderers for tests and demos.
//!
//! Detection is camera-local and stateless; the capture pipeline runs
//! one [`PatternDetector`] per frame, in parallel across cameras.

pub mod blobs;
pub mod corners;
pub mod detector;
pub mod grid;
pub mod image;
pub mod render;

pub use blobs::{find_blobs, find_spots, Blob, BlobParams, BlobPolarity, SpotDetection};
pub use corners::{find_junctions, refine_subpixel, CornerCandidate};
pub use detector::PatternDetector;
pub use grid::order_into_grid;
pub use image::{sample_bilinear, sample_gradient, GrayImage, GrayView};
pub use render::{render_checkerboard, render_circle_grid, render_spots, RenderedTarget};

/// Why a frame yielded no usable pattern detection.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DetectionFailure {
    #[error("found {found} of {expected} pattern points")]
    NotEnoughPoints { expected: usize, found: usize },
    #[error("coverage {coverage:.3} below required {min_coverage:.3}")]
    LowCoverage { coverage: f64, min_coverage: f64 },
    #[error("could not order {found} points into a {rows}x{cols} grid")]
    GridOrdering {
        found: usize,
        rows: usize,
        cols: usize,
    },
}
