//! Synthetic frame renderers.
//!
//! Used by the detector tests and the demo pipeline to produce frames
//! with exactly known feature positions. Edges are antialiased by 4x4
//! supersampling so sub-pixel refinement has real gradients to work
//! with.

use optival_core::math::Pt2;

use crate::image::GrayImage;

const DARK: f64 = 20.0;
const LIGHT: f64 = 235.0;
const SUBSAMPLES: usize = 4;

/// A rendered frame together with the ground-truth feature positions.
#[derive(Clone, Debug)]
pub struct RenderedTarget {
    pub image: GrayImage,
    /// Feature positions in row-major grid order.
    pub corners: Vec<Pt2>,
}

fn supersample(width: usize, height: usize, shade: impl Fn(f64, f64) -> f64) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| {
        let mut acc = 0.0;
        for sy in 0..SUBSAMPLES {
            for sx in 0..SUBSAMPLES {
                let fx = x as f64 + (sx as f64 + 0.5) / SUBSAMPLES as f64;
                let fy = y as f64 + (sy as f64 + 0.5) / SUBSAMPLES as f64;
                acc += shade(fx, fy);
            }
        }
        (acc / (SUBSAMPLES * SUBSAMPLES) as f64).round().clamp(0.0, 255.0) as u8
    })
}

/// Render a checkerboard with `inner_rows x inner_cols` inner junctions.
///
/// The board of `(inner_rows + 1) x (inner_cols + 1)` squares starts at
/// `(x0, y0)`; the surrounding margin matches the light squares. The
/// returned corners are the inner junctions in row-major order, the
/// same ordering the detector reports.
pub fn render_checkerboard(
    width: usize,
    height: usize,
    inner_rows: usize,
    inner_cols: usize,
    cell_px: f64,
    x0: f64,
    y0: f64,
) -> RenderedTarget {
    let squares_x = inner_cols + 1;
    let squares_y = inner_rows + 1;

    let image = supersample(width, height, |fx, fy| {
        let u = (fx - x0) / cell_px;
        let v = (fy - y0) / cell_px;
        if u < 0.0 || v < 0.0 || u >= squares_x as f64 || v >= squares_y as f64 {
            return LIGHT;
        }
        if (u.floor() as i64 + v.floor() as i64) % 2 == 0 {
            DARK
        } else {
            LIGHT
        }
    });

    let mut corners = Vec::with_capacity(inner_rows * inner_cols);
    for r in 0..inner_rows {
        for c in 0..inner_cols {
            corners.push(Pt2::new(
                x0 + (c + 1) as f64 * cell_px,
                y0 + (r + 1) as f64 * cell_px,
            ));
        }
    }

    RenderedTarget { image, corners }
}

/// Render a grid of dark filled circles on a light background.
pub fn render_circle_grid(
    width: usize,
    height: usize,
    rows: usize,
    cols: usize,
    spacing_px: f64,
    radius_px: f64,
    x0: f64,
    y0: f64,
) -> RenderedTarget {
    let mut corners = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        for c in 0..cols {
            corners.push(Pt2::new(
                x0 + c as f64 * spacing_px,
                y0 + r as f64 * spacing_px,
            ));
        }
    }

    let centres = corners.clone();
    let image = supersample(width, height, |fx, fy| {
        let inside = centres.iter().any(|c| {
            let dx = fx - c.x;
            let dy = fy - c.y;
            dx * dx + dy * dy <= radius_px * radius_px
        });
        if inside {
            DARK
        } else {
            LIGHT
        }
    });

    RenderedTarget { image, corners }
}

/// Render bright Gaussian spots on a dark background.
///
/// Models electrode markers seen by the rig cameras; `sigma_px`
/// controls the spot footprint.
pub fn render_spots(width: usize, height: usize, centres: &[Pt2], sigma_px: f64) -> GrayImage {
    let centres = centres.to_vec();
    supersample(width, height, move |fx, fy| {
        let mut value = DARK / 2.0;
        for c in &centres {
            let dx = fx - c.x;
            let dy = fy - c.y;
            let g = (-(dx * dx + dy * dy) / (2.0 * sigma_px * sigma_px)).exp();
            value += (LIGHT - DARK / 2.0) * g;
        }
        value
    })
}
