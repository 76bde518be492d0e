//! Calibration target geometry.
//!
//! World units are millimetres throughout the workspace; pattern geometry is
//! defined on the z = 0 plane of the target frame in row-major point order.

use serde::{Deserialize, Serialize};

use crate::math::{Pt3, Real};

/// Supported calibration target families and their geometric parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PatternSpec {
    /// Inner-corner grid of a checkerboard.
    Checkerboard {
        rows: usize,
        cols: usize,
        spacing_mm: Real,
    },
    /// Symmetric grid of circular dots.
    CircleGrid {
        rows: usize,
        cols: usize,
        spacing_mm: Real,
        diameter_mm: Real,
    },
    /// Grid of rectangle corners with independent cell width and height.
    RectangleGrid {
        rows: usize,
        cols: usize,
        width_mm: Real,
        height_mm: Real,
    },
}

impl Default for PatternSpec {
    fn default() -> Self {
        PatternSpec::Checkerboard {
            rows: 6,
            cols: 9,
            spacing_mm: 25.5,
        }
    }
}

impl PatternSpec {
    /// Number of feature points the detector must find.
    pub fn point_count(&self) -> usize {
        let (rows, cols) = self.grid_size();
        rows * cols
    }

    /// Grid dimensions as `(rows, cols)`.
    pub fn grid_size(&self) -> (usize, usize) {
        match *self {
            PatternSpec::Checkerboard { rows, cols, .. }
            | PatternSpec::CircleGrid { rows, cols, .. }
            | PatternSpec::RectangleGrid { rows, cols, .. } => (rows, cols),
        }
    }

    /// Target-frame 3D coordinates of every feature point, row-major.
    pub fn object_points(&self) -> Vec<Pt3> {
        let (rows, cols) = self.grid_size();
        let (sx, sy) = self.cell_size();
        let mut points = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                points.push(Pt3::new(c as Real * sx, r as Real * sy, 0.0));
            }
        }
        points
    }

    /// Physical extent of the point grid as `(width, height)` in
    /// millimetres.
    pub fn physical_size(&self) -> (Real, Real) {
        let (rows, cols) = self.grid_size();
        let (sx, sy) = self.cell_size();
        (
            cols.saturating_sub(1) as Real * sx,
            rows.saturating_sub(1) as Real * sy,
        )
    }

    /// Cell pitch as `(x, y)` in millimetres.
    pub fn cell_size(&self) -> (Real, Real) {
        match *self {
            PatternSpec::Checkerboard { spacing_mm, .. }
            | PatternSpec::CircleGrid { spacing_mm, .. } => (spacing_mm, spacing_mm),
            PatternSpec::RectangleGrid {
                width_mm,
                height_mm,
                ..
            } => (width_mm, height_mm),
        }
    }

    /// Validate the geometric parameters.
    pub fn validate(&self) -> Result<(), String> {
        let (rows, cols) = self.grid_size();
        if rows < 2 || cols < 2 {
            return Err(format!("pattern grid must be at least 2x2, got {rows}x{cols}"));
        }
        let (sx, sy) = self.cell_size();
        if sx <= 0.0 || sy <= 0.0 {
            return Err(format!("pattern cell size must be positive, got {sx}x{sy}"));
        }
        if let PatternSpec::CircleGrid {
            diameter_mm,
            spacing_mm,
            ..
        } = *self
        {
            if diameter_mm <= 0.0 || diameter_mm >= spacing_mm {
                return Err(format!(
                    "circle diameter {diameter_mm} must be positive and below spacing {spacing_mm}"
                ));
            }
        }
        Ok(())
    }
}
