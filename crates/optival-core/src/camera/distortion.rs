//! Brown-Conrady lens distortion.

use serde::{Deserialize, Serialize};

use crate::math::{Real, Vec2};

const UNDISTORT_ITERS: u32 = 8;

/// Five-parameter Brown-Conrady distortion acting on normalized coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Distortion {
    pub k1: Real,
    pub k2: Real,
    pub p1: Real,
    pub p2: Real,
    #[serde(default)]
    pub k3: Real,
}

impl Distortion {
    fn distort_impl(&self, x: Real, y: Real) -> (Real, Real) {
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;

        let radial = 1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6;

        let x_tan = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let y_tan = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;

        (x * radial + x_tan, y * radial + y_tan)
    }

    /// Apply distortion to an undistorted normalized point.
    pub fn distort(&self, n_undist: &Vec2) -> Vec2 {
        let (xd, yd) = self.distort_impl(n_undist.x, n_undist.y);
        Vec2::new(xd, yd)
    }

    /// Invert the distortion by fixed-point iteration.
    pub fn undistort(&self, n_dist: &Vec2) -> Vec2 {
        let mut x = n_dist.x;
        let mut y = n_dist.y;

        for _ in 0..UNDISTORT_ITERS {
            let (xd, yd) = self.distort_impl(x, y);
            x -= xd - n_dist.x;
            y -= yd - n_dist.y;
        }
        Vec2::new(x, y)
    }

    /// True when every coefficient is zero.
    pub fn is_zero(&self) -> bool {
        self.k1 == 0.0 && self.k2 == 0.0 && self.k3 == 0.0 && self.p1 == 0.0 && self.p2 == 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn zero_distortion_is_identity() {
        let d = Distortion::default();
        let n = Vec2::new(0.3, -0.2);
        assert_relative_eq!(d.distort(&n), n);
        assert_relative_eq!(d.undistort(&n), n);
        assert!(d.is_zero());
    }

    #[test]
    fn undistort_inverts_distort() {
        let d = Distortion {
            k1: -0.25,
            k2: 0.08,
            p1: 0.001,
            p2: -0.001,
            k3: 0.0,
        };
        let n = Vec2::new(0.2, 0.15);
        let nd = d.distort(&n);
        let back = d.undistort(&nd);
        assert_relative_eq!(back.x, n.x, epsilon = 1e-8);
        assert_relative_eq!(back.y, n.y, epsilon = 1e-8);
    }
}
