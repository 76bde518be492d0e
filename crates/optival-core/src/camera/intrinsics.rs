//! Pinhole intrinsic parameters.

use serde::{Deserialize, Serialize};

use crate::math::{Mat3, Pt2, Real, Vec2};

/// Pinhole intrinsics: focal lengths, principal point, and skew.
///
/// Maps normalized camera coordinates `(x, y)` to pixel coordinates:
/// `u = fx * x + skew * y + cx`, `v = fy * y + cy`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: Real,
    pub fy: Real,
    pub cx: Real,
    pub cy: Real,
    #[serde(default)]
    pub skew: Real,
}

impl Intrinsics {
    /// Camera matrix `K` assembled from the parameters.
    pub fn k_matrix(&self) -> Mat3 {
        Mat3::new(
            self.fx, self.skew, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// Normalized camera coordinates to pixel coordinates.
    pub fn normalized_to_pixel(&self, n: &Vec2) -> Pt2 {
        Pt2::new(
            self.fx * n.x + self.skew * n.y + self.cx,
            self.fy * n.y + self.cy,
        )
    }

    /// Pixel coordinates to normalized camera coordinates.
    pub fn pixel_to_normalized(&self, p: &Pt2) -> Vec2 {
        let y = (p.y - self.cy) / self.fy;
        let x = (p.x - self.cx - self.skew * y) / self.fx;
        Vec2::new(x, y)
    }

    /// Mean focal length in pixels, used for pixel-to-metric conversions.
    pub fn mean_focal(&self) -> Real {
        0.5 * (self.fx + self.fy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample() -> Intrinsics {
        Intrinsics {
            fx: 1400.0,
            fy: 1390.0,
            cx: 960.0,
            cy: 540.0,
            skew: 0.0,
        }
    }

    #[test]
    fn pixel_normalized_roundtrip() {
        let k = sample();
        let n = Vec2::new(0.12, -0.08);
        let p = k.normalized_to_pixel(&n);
        let back = k.pixel_to_normalized(&p);
        assert_relative_eq!(back.x, n.x, epsilon = 1e-12);
        assert_relative_eq!(back.y, n.y, epsilon = 1e-12);
    }

    #[test]
    fn k_matrix_layout() {
        let k = sample().k_matrix();
        assert_relative_eq!(k[(0, 0)], 1400.0);
        assert_relative_eq!(k[(1, 1)], 1390.0);
        assert_relative_eq!(k[(0, 2)], 960.0);
        assert_relative_eq!(k[(1, 2)], 540.0);
        assert_relative_eq!(k[(2, 2)], 1.0);
    }

    #[test]
    fn serde_roundtrip_fills_default_skew() {
        let json = r#"{"fx":800.0,"fy":790.0,"cx":640.0,"cy":360.0}"#;
        let k: Intrinsics = serde_json::from_str(json).unwrap();
        assert_relative_eq!(k.skew, 0.0);
    }
}
