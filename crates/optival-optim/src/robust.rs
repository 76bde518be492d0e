//! Robust loss kernels for iteratively re-weighted least squares.

use optival_core::math::Real;

/// Loss applied to squared residuals inside the solver.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum RobustLoss {
    /// Plain quadratic loss.
    #[default]
    None,
    /// Quadratic near zero, linear beyond `scale`.
    Huber { scale: Real },
    /// Heavy-tail suppression with scale parameter `scale`.
    Cauchy { scale: Real },
}

impl RobustLoss {
    /// Robust cost `rho(r^2)` and IRLS weight `w(r)` for one squared
    /// residual.
    ///
    /// The solver scales residuals and Jacobian rows by `sqrt(w)` before
    /// forming the normal equations, and sums `rho` for the cost it
    /// compares between steps.
    pub fn rho_and_weight(self, r2: Real) -> (Real, Real) {
        match self {
            RobustLoss::None => (r2, 1.0),
            RobustLoss::Huber { scale } => {
                let r = r2.sqrt();
                if r <= scale {
                    (r2, 1.0)
                } else {
                    (2.0 * scale * r - scale * scale, scale / r)
                }
            }
            RobustLoss::Cauchy { scale } => {
                let t = r2 / (scale * scale);
                (scale * scale * (1.0 + t).ln(), 1.0 / (1.0 + t))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn huber_is_quadratic_below_scale() {
        let loss = RobustLoss::Huber { scale: 1.0 };
        let (rho, w) = loss.rho_and_weight(0.25);
        assert!((rho - 0.25).abs() < 1e-12);
        assert!((w - 1.0).abs() < 1e-12);
    }

    #[test]
    fn huber_is_linear_above_scale() {
        let loss = RobustLoss::Huber { scale: 1.0 };
        let (rho, w) = loss.rho_and_weight(25.0);
        assert!((rho - 9.0).abs() < 1e-12);
        assert!((w - 0.2).abs() < 1e-12);
    }

    #[test]
    fn cauchy_weight_decays_with_residual() {
        let loss = RobustLoss::Cauchy { scale: 1.0 };
        let (_, w_small) = loss.rho_and_weight(0.01);
        let (_, w_large) = loss.rho_and_weight(100.0);
        assert!(w_small > 0.9);
        assert!(w_large < 0.02);
    }

    #[test]
    fn weighted_mean_shrugs_off_outliers() {
        let samples = [0.9, 1.0, 1.1, 0.95, 1.05, 6.0];
        let loss = RobustLoss::Huber { scale: 0.2 };

        let mut x = samples.iter().sum::<Real>() / samples.len() as Real;
        for _ in 0..10 {
            let mut num = 0.0;
            let mut den = 0.0;
            for &s in &samples {
                let r = x - s;
                let (_, w) = loss.rho_and_weight(r * r);
                num += w * s;
                den += w;
            }
            x = num / den;
        }
        assert!((x - 1.0).abs() < 0.05);
    }
}
