//! Ordering of scattered feature points into row-major grid order.

use nalgebra::{Matrix2, Vector2};

use optival_core::math::Pt2;

/// Arrange `rows * cols` scattered points into row-major grid order.
///
/// Principal axes of the point cloud give the row and column
/// directions; `expected_aspect` (physical grid width over height)
/// decides which axis carries the columns. Signs are canonicalized in
/// image space, columns increasing with +X and rows with +Y. Returns
/// `None` when the count is wrong or the banding into rows is
/// inconsistent.
///
/// Square grids are ambiguous under 90-degree rotation; use a
/// non-square pattern when ordering must be unique.
pub fn order_into_grid(
    points: &[Pt2],
    rows: usize,
    cols: usize,
    expected_aspect: f64,
) -> Option<Vec<Pt2>> {
    if rows == 0 || cols == 0 || points.len() != rows * cols {
        return None;
    }

    let n = points.len() as f64;
    let centroid = points
        .iter()
        .fold(Vector2::zeros(), |acc, p| acc + p.coords)
        / n;

    let mut cov = Matrix2::zeros();
    for p in points {
        let d = p.coords - centroid;
        cov += d * d.transpose();
    }
    cov /= n;

    let eigen = cov.symmetric_eigen();
    // Column 0 carries the larger eigenvalue after this ordering.
    let (major_idx, minor_idx) = if eigen.eigenvalues[0] >= eigen.eigenvalues[1] {
        (0, 1)
    } else {
        (1, 0)
    };
    let major = eigen.eigenvectors.column(major_idx).into_owned();
    let minor = eigen.eigenvectors.column(minor_idx).into_owned();

    let spread = |axis: &Vector2<f64>| -> f64 {
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for p in points {
            let t = (p.coords - centroid).dot(axis);
            lo = lo.min(t);
            hi = hi.max(t);
        }
        hi - lo
    };

    let ratio = spread(&major) / spread(&minor).max(f64::MIN_POSITIVE);
    let aspect = expected_aspect.max(f64::MIN_POSITIVE);
    // Pick the axis assignment whose spread ratio matches the physical
    // aspect better.
    let (mut col_axis, mut row_axis) =
        if (ratio.ln() - aspect.ln()).abs() <= (ratio.ln() + aspect.ln()).abs() {
            (major, minor)
        } else {
            (minor, major)
        };

    if col_axis.x < 0.0 || (col_axis.x == 0.0 && col_axis.y < 0.0) {
        col_axis = -col_axis;
    }
    if row_axis.y < 0.0 || (row_axis.y == 0.0 && row_axis.x < 0.0) {
        row_axis = -row_axis;
    }

    let mut indexed: Vec<(f64, f64, usize)> = points
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let d = p.coords - centroid;
            (d.dot(&row_axis), d.dot(&col_axis), i)
        })
        .collect();
    indexed.sort_by(|a, b| a.0.total_cmp(&b.0));

    // Rows must separate cleanly along the row axis.
    let row_pitch = (indexed[indexed.len() - 1].0 - indexed[0].0) / (rows.max(2) - 1) as f64;
    for band in 0..rows {
        let chunk = &indexed[band * cols..(band + 1) * cols];
        let lo = chunk.iter().map(|e| e.0).fold(f64::INFINITY, f64::min);
        let hi = chunk.iter().map(|e| e.0).fold(f64::NEG_INFINITY, f64::max);
        if rows > 1 && hi - lo > 0.6 * row_pitch {
            return None;
        }
    }

    let mut ordered = Vec::with_capacity(points.len());
    for band in 0..rows {
        let mut chunk: Vec<(f64, f64, usize)> =
            indexed[band * cols..(band + 1) * cols].to_vec();
        chunk.sort_by(|a, b| a.1.total_cmp(&b.1));
        ordered.extend(chunk.into_iter().map(|(_, _, i)| points[i]));
    }
    Some(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(rows: usize, cols: usize, pitch: f64) -> Vec<Pt2> {
        let mut pts = Vec::new();
        for r in 0..rows {
            for c in 0..cols {
                pts.push(Pt2::new(100.0 + c as f64 * pitch, 50.0 + r as f64 * pitch));
            }
        }
        pts
    }

    #[test]
    fn recovers_row_major_order_from_shuffled_points() {
        let truth = grid(3, 5, 20.0);
        let mut shuffled = truth.clone();
        shuffled.reverse();
        shuffled.swap(2, 9);

        let aspect = 4.0 * 20.0 / (2.0 * 20.0);
        let ordered = order_into_grid(&shuffled, 3, 5, aspect).unwrap();
        for (a, b) in ordered.iter().zip(&truth) {
            assert!((a - b).norm() < 1e-12);
        }
    }

    #[test]
    fn handles_rotated_grids() {
        let angle: f64 = 0.3;
        let (s, c) = angle.sin_cos();
        let rotated: Vec<Pt2> = grid(3, 5, 20.0)
            .iter()
            .map(|p| {
                let x = p.x - 140.0;
                let y = p.y - 70.0;
                Pt2::new(c * x - s * y + 140.0, s * x + c * y + 70.0)
            })
            .collect();

        let ordered = order_into_grid(&rotated, 3, 5, 2.0).unwrap();
        // Column coordinate must increase along each row after ordering.
        for band in 0..3 {
            for k in 1..5 {
                assert!(ordered[band * 5 + k].x > ordered[band * 5 + k - 1].x);
            }
        }
    }

    #[test]
    fn rejects_wrong_count() {
        let pts = grid(2, 3, 10.0);
        assert!(order_into_grid(&pts, 3, 3, 1.0).is_none());
    }
}
