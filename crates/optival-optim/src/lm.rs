//! Dense Levenberg-Marquardt with robust re-weighting.
//!
//! The problems in this workspace are small (tens of parameters,
//! thousands of residuals), so the normal equations are formed densely
//! and solved by Cholesky. The damping schedule follows the classic
//! adaptive scheme: shrink on good gain ratios, grow on rejected steps,
//! declare divergence when damping saturates without a cost reduction.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};
use nalgebra::{DMatrix, DVector};
use thiserror::Error;

use optival_core::math::Real;

use crate::robust::RobustLoss;

const DAMPING_MIN: Real = 1e-12;
const DAMPING_MAX: Real = 1e12;
const DAMPING_INCREASE: Real = 10.0;
const DAMPING_DECREASE: Real = 0.3;
/// Gain ratio above which a step counts as good and damping shrinks.
const GOOD_STEP_QUALITY: Real = 0.75;

/// A nonlinear least-squares problem over a flat parameter vector.
///
/// `residuals` returns `false` when the model cannot be evaluated at
/// the given parameters (a point behind a camera, for instance); the
/// solver treats an invalid trial step as rejected and an invalid
/// current state as divergence.
pub trait LeastSquaresProblem {
    fn residual_count(&self) -> usize;
    fn parameter_count(&self) -> usize;
    fn residuals(&self, params: &DVector<Real>, out: &mut DVector<Real>) -> bool;

    /// Jacobian of the residual vector, central differences by default.
    fn jacobian(&self, params: &DVector<Real>, out: &mut DMatrix<Real>) -> bool {
        let m = self.residual_count();
        let mut p = params.clone();
        let mut plus = DVector::<Real>::zeros(m);
        let mut minus = DVector::<Real>::zeros(m);
        for j in 0..self.parameter_count() {
            let h = 1e-6 * params[j].abs().max(1.0);
            p[j] = params[j] + h;
            if !self.residuals(&p, &mut plus) {
                return false;
            }
            p[j] = params[j] - h;
            if !self.residuals(&p, &mut minus) {
                return false;
            }
            p[j] = params[j];
            let scale = 0.5 / h;
            for i in 0..m {
                out[(i, j)] = (plus[i] - minus[i]) * scale;
            }
        }
        true
    }
}

/// Cooperative cancellation flag shared with the caller.
///
/// Cancelling is a request: the solver notices at the next iteration
/// boundary and returns [`SolveError::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergenceReason {
    /// Damping saturated and the cost still would not decrease.
    CostIncreased,
    /// Parameters, residuals, or cost left the finite range.
    NonFinite,
    /// The wall-clock budget ran out before convergence.
    Timeout,
}

impl fmt::Display for DivergenceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DivergenceReason::CostIncreased => write!(f, "cost increased without recovery"),
            DivergenceReason::NonFinite => write!(f, "non-finite parameters"),
            DivergenceReason::Timeout => write!(f, "wall-clock budget exhausted"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SolveError {
    #[error("optimization diverged ({reason}) after {iterations} iterations, last cost {last_cost:.6e}")]
    OptimizationDivergence {
        reason: DivergenceReason,
        iterations: usize,
        last_cost: Real,
    },
    #[error("optimization cancelled after {0} iterations")]
    Cancelled(usize),
    #[error("misconfigured problem: {0}")]
    BadProblem(String),
}

/// Termination state of a run that produced usable parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    CostToleranceReached,
    ParameterToleranceReached,
    GradientToleranceReached,
    MaxIterationsReached,
}

impl StopReason {
    /// True for the tolerance-based terminations.
    pub fn converged(&self) -> bool {
        !matches!(self, StopReason::MaxIterationsReached)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::CostToleranceReached => write!(f, "cost tolerance reached"),
            StopReason::ParameterToleranceReached => write!(f, "parameter tolerance reached"),
            StopReason::GradientToleranceReached => write!(f, "gradient tolerance reached"),
            StopReason::MaxIterationsReached => write!(f, "maximum iterations reached"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LmOptions {
    pub max_iterations: usize,
    pub cost_tolerance: Real,
    pub parameter_tolerance: Real,
    pub gradient_tolerance: Real,
    pub initial_damping: Real,
    pub timeout: Option<Duration>,
    pub loss: RobustLoss,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            cost_tolerance: 1e-8,
            parameter_tolerance: 1e-8,
            gradient_tolerance: 1e-8,
            initial_damping: 1e-3,
            timeout: None,
            loss: RobustLoss::None,
        }
    }
}

/// Run statistics, kept for reporting and logs.
#[derive(Debug, Clone)]
pub struct LmSummary {
    pub stop: StopReason,
    pub initial_cost: Real,
    pub final_cost: Real,
    pub iterations: usize,
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    pub final_damping: Real,
    pub final_gradient_norm: Real,
    /// Cost after each accepted step, initial cost first.
    pub cost_history: Vec<Real>,
    pub elapsed: Duration,
}

impl fmt::Display for LmSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Levenberg-Marquardt summary ===")?;
        writeln!(f, "Stop reason:         {}", self.stop)?;
        writeln!(f, "Initial cost:        {:.6e}", self.initial_cost)?;
        writeln!(f, "Final cost:          {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "Iterations:          {} ({} accepted, {} rejected)",
            self.iterations, self.accepted_steps, self.rejected_steps
        )?;
        writeln!(f, "Final damping:       {:.3e}", self.final_damping)?;
        writeln!(f, "Final gradient norm: {:.3e}", self.final_gradient_norm)?;
        write!(f, "Elapsed:             {:?}", self.elapsed)
    }
}

#[derive(Debug, Clone)]
pub struct LmResult {
    pub parameters: DVector<Real>,
    pub summary: LmSummary,
}

fn robust_cost(loss: RobustLoss, residuals: &DVector<Real>) -> Real {
    0.5 * residuals
        .iter()
        .map(|&r| loss.rho_and_weight(r * r).0)
        .sum::<Real>()
}

/// Minimize the problem starting from `x0`.
///
/// Returns an error when the run cannot produce usable parameters:
/// divergence (including timeout) or cancellation. Hitting the
/// iteration cap is an `Ok` outcome with `MaxIterationsReached`.
pub fn solve_lm<P: LeastSquaresProblem>(
    problem: &P,
    x0: DVector<Real>,
    opts: &LmOptions,
    cancel: &CancelToken,
) -> Result<LmResult, SolveError> {
    let m = problem.residual_count();
    let n = problem.parameter_count();
    if n == 0 {
        return Err(SolveError::BadProblem("no free parameters".into()));
    }
    if m < n {
        return Err(SolveError::BadProblem(format!(
            "{m} residuals cannot constrain {n} parameters"
        )));
    }
    if x0.len() != n {
        return Err(SolveError::BadProblem(format!(
            "seed has {} entries, problem has {n} parameters",
            x0.len()
        )));
    }

    let start = Instant::now();
    let mut x = x0;
    let mut residuals = DVector::<Real>::zeros(m);
    if !problem.residuals(&x, &mut residuals) || residuals.iter().any(|r| !r.is_finite()) {
        return Err(SolveError::OptimizationDivergence {
            reason: DivergenceReason::NonFinite,
            iterations: 0,
            last_cost: Real::NAN,
        });
    }
    let mut cost = robust_cost(opts.loss, &residuals);
    let initial_cost = cost;
    let mut cost_history = vec![cost];

    let mut damping = opts.initial_damping;
    let mut jacobian = DMatrix::<Real>::zeros(m, n);
    let mut trial_residuals = DVector::<Real>::zeros(m);

    let mut iterations = 0usize;
    let mut accepted_steps = 0usize;
    let mut rejected_steps = 0usize;
    let mut gradient_norm = Real::INFINITY;

    debug!("lm start: {m} residuals, {n} parameters, cost {cost:.6e}");

    let finish = |stop: StopReason,
                  x: DVector<Real>,
                  cost: Real,
                  iterations: usize,
                  accepted_steps: usize,
                  rejected_steps: usize,
                  damping: Real,
                  gradient_norm: Real,
                  cost_history: Vec<Real>| {
        Ok(LmResult {
            parameters: x,
            summary: LmSummary {
                stop,
                initial_cost,
                final_cost: cost,
                iterations,
                accepted_steps,
                rejected_steps,
                final_damping: damping,
                final_gradient_norm: gradient_norm,
                cost_history,
                elapsed: start.elapsed(),
            },
        })
    };

    loop {
        if cancel.is_cancelled() {
            return Err(SolveError::Cancelled(iterations));
        }

        if !problem.jacobian(&x, &mut jacobian) || jacobian.iter().any(|j| !j.is_finite()) {
            return Err(SolveError::OptimizationDivergence {
                reason: DivergenceReason::NonFinite,
                iterations,
                last_cost: cost,
            });
        }

        // IRLS: weights at the linearization point scale residual and
        // Jacobian rows before the normal equations.
        let mut weighted_residuals = residuals.clone();
        let mut weighted_jacobian = jacobian.clone();
        if opts.loss != RobustLoss::None {
            for i in 0..m {
                let (_, w) = opts.loss.rho_and_weight(residuals[i] * residuals[i]);
                let sw = w.sqrt();
                weighted_residuals[i] *= sw;
                weighted_jacobian.row_mut(i).scale_mut(sw);
            }
        }

        let gradient = weighted_jacobian.transpose() * &weighted_residuals;
        gradient_norm = gradient.norm();
        if gradient_norm < opts.gradient_tolerance {
            return finish(
                StopReason::GradientToleranceReached,
                x,
                cost,
                iterations,
                accepted_steps,
                rejected_steps,
                damping,
                gradient_norm,
                cost_history,
            );
        }
        let hessian = weighted_jacobian.transpose() * &weighted_jacobian;

        // Inner loop: retry the step with stronger damping until a trial
        // is accepted or damping saturates.
        let (step, new_cost) = loop {
            if let Some(budget) = opts.timeout {
                if start.elapsed() >= budget {
                    return Err(SolveError::OptimizationDivergence {
                        reason: DivergenceReason::Timeout,
                        iterations,
                        last_cost: cost,
                    });
                }
            }

            let mut damped = hessian.clone();
            for d in 0..n {
                damped[(d, d)] += damping;
            }

            let trial = damped
                .cholesky()
                .map(|chol| chol.solve(&(-&gradient)))
                .and_then(|step| {
                    let x_trial = &x + &step;
                    if !problem.residuals(&x_trial, &mut trial_residuals) {
                        return None;
                    }
                    let trial_cost = robust_cost(opts.loss, &trial_residuals);
                    if !trial_cost.is_finite() || x_trial.iter().any(|v| !v.is_finite()) {
                        return None;
                    }

                    let predicted = 0.5 * step.dot(&(damping * &step - &gradient));
                    let actual = cost - trial_cost;
                    let rho = if predicted.abs() < 1e-15 {
                        if actual > 0.0 {
                            1.0
                        } else {
                            0.0
                        }
                    } else {
                        actual / predicted
                    };
                    trace!(
                        "lm iter {iterations}: trial cost {trial_cost:.6e}, rho {rho:.3}, damping {damping:.3e}"
                    );
                    (rho > 0.0).then(|| (step, trial_cost, rho))
                });

            match trial {
                Some((step, trial_cost, rho)) => {
                    if rho > GOOD_STEP_QUALITY {
                        damping = (damping * DAMPING_DECREASE).max(DAMPING_MIN);
                    }
                    break (step, trial_cost);
                }
                None => {
                    rejected_steps += 1;
                    iterations += 1;
                    if damping >= DAMPING_MAX {
                        return Err(SolveError::OptimizationDivergence {
                            reason: DivergenceReason::CostIncreased,
                            iterations,
                            last_cost: cost,
                        });
                    }
                    damping = (damping * DAMPING_INCREASE).min(DAMPING_MAX);
                    if iterations >= opts.max_iterations {
                        return finish(
                            StopReason::MaxIterationsReached,
                            x,
                            cost,
                            iterations,
                            accepted_steps,
                            rejected_steps,
                            damping,
                            gradient_norm,
                            cost_history,
                        );
                    }
                }
            }
        };

        let step_norm = step.norm();
        let cost_change = cost - new_cost;
        x += step;
        std::mem::swap(&mut residuals, &mut trial_residuals);
        cost = new_cost;
        cost_history.push(cost);
        accepted_steps += 1;
        iterations += 1;

        if let Some(budget) = opts.timeout {
            if start.elapsed() >= budget {
                return Err(SolveError::OptimizationDivergence {
                    reason: DivergenceReason::Timeout,
                    iterations,
                    last_cost: cost,
                });
            }
        }
        if iterations >= opts.max_iterations {
            return finish(
                StopReason::MaxIterationsReached,
                x,
                cost,
                iterations,
                accepted_steps,
                rejected_steps,
                damping,
                gradient_norm,
                cost_history,
            );
        }
        if cost_change.abs() < opts.cost_tolerance {
            return finish(
                StopReason::CostToleranceReached,
                x,
                cost,
                iterations,
                accepted_steps,
                rejected_steps,
                damping,
                gradient_norm,
                cost_history,
            );
        }
        if step_norm < opts.parameter_tolerance {
            return finish(
                StopReason::ParameterToleranceReached,
                x,
                cost,
                iterations,
                accepted_steps,
                rejected_steps,
                damping,
                gradient_norm,
                cost_history,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fit y = a * x + b over fixed samples.
    struct LineFit {
        xs: Vec<Real>,
        ys: Vec<Real>,
    }

    impl LeastSquaresProblem for LineFit {
        fn residual_count(&self) -> usize {
            self.xs.len()
        }
        fn parameter_count(&self) -> usize {
            2
        }
        fn residuals(&self, p: &DVector<Real>, out: &mut DVector<Real>) -> bool {
            for (i, (&x, &y)) in self.xs.iter().zip(&self.ys).enumerate() {
                out[i] = p[0] * x + p[1] - y;
            }
            true
        }
    }

    /// Fit y = exp(a * x + b), a mildly nonlinear classic.
    struct ExpFit {
        xs: Vec<Real>,
        ys: Vec<Real>,
    }

    impl LeastSquaresProblem for ExpFit {
        fn residual_count(&self) -> usize {
            self.xs.len()
        }
        fn parameter_count(&self) -> usize {
            2
        }
        fn residuals(&self, p: &DVector<Real>, out: &mut DVector<Real>) -> bool {
            for (i, (&x, &y)) in self.xs.iter().zip(&self.ys).enumerate() {
                out[i] = (p[0] * x + p[1]).exp() - y;
            }
            true
        }
    }

    fn line_data(a: Real, b: Real) -> LineFit {
        let xs: Vec<Real> = (0..20).map(|i| i as Real * 0.5).collect();
        let ys = xs.iter().map(|&x| a * x + b).collect();
        LineFit { xs, ys }
    }

    #[test]
    fn solves_linear_fit() {
        let problem = line_data(2.5, -1.0);
        let result = solve_lm(
            &problem,
            DVector::from_vec(vec![0.0, 0.0]),
            &LmOptions::default(),
            &CancelToken::new(),
        )
        .unwrap();

        assert!(result.summary.stop.converged());
        assert!((result.parameters[0] - 2.5).abs() < 1e-6);
        assert!((result.parameters[1] + 1.0).abs() < 1e-6);
        assert!(result.summary.final_cost < 1e-12);
    }

    #[test]
    fn solves_exponential_fit_from_offset_seed() {
        let xs: Vec<Real> = (0..30).map(|i| i as Real * 0.1).collect();
        let ys: Vec<Real> = xs.iter().map(|&x| (0.7 * x + 0.3).exp()).collect();
        let problem = ExpFit { xs, ys };

        let result = solve_lm(
            &problem,
            DVector::from_vec(vec![0.0, 0.0]),
            &LmOptions::default(),
            &CancelToken::new(),
        )
        .unwrap();

        assert!(result.summary.stop.converged());
        assert!((result.parameters[0] - 0.7).abs() < 1e-6);
        assert!((result.parameters[1] - 0.3).abs() < 1e-6);
        assert!(result.summary.cost_history.len() == result.summary.accepted_steps + 1);
    }

    #[test]
    fn huber_loss_limits_outlier_pull() {
        let mut problem = line_data(1.0, 0.0);
        problem.ys[10] += 40.0;

        let seed = DVector::from_vec(vec![0.5, 0.5]);
        let plain = solve_lm(&problem, seed.clone(), &LmOptions::default(), &CancelToken::new())
            .unwrap();
        let robust = solve_lm(
            &problem,
            seed,
            &LmOptions {
                loss: RobustLoss::Huber { scale: 1.0 },
                ..LmOptions::default()
            },
            &CancelToken::new(),
        )
        .unwrap();

        let err = |p: &DVector<Real>| (p[0] - 1.0).abs() + p[1].abs();
        assert!(err(&robust.parameters) < 0.1 * err(&plain.parameters));
    }

    #[test]
    fn cancelled_token_aborts_immediately() {
        let problem = line_data(1.0, 1.0);
        let cancel = CancelToken::new();
        cancel.cancel();

        let out = solve_lm(
            &problem,
            DVector::from_vec(vec![0.0, 0.0]),
            &LmOptions::default(),
            &cancel,
        );
        assert!(matches!(out, Err(SolveError::Cancelled(0))));
    }

    #[test]
    fn zero_budget_times_out() {
        let problem = line_data(1.0, 1.0);
        let out = solve_lm(
            &problem,
            DVector::from_vec(vec![0.0, 0.0]),
            &LmOptions {
                timeout: Some(Duration::ZERO),
                ..LmOptions::default()
            },
            &CancelToken::new(),
        );
        assert!(matches!(
            out,
            Err(SolveError::OptimizationDivergence {
                reason: DivergenceReason::Timeout,
                ..
            })
        ));
    }

    /// Valid only at the seed; every trial step fails to evaluate.
    struct Stuck;

    impl LeastSquaresProblem for Stuck {
        fn residual_count(&self) -> usize {
            2
        }
        fn parameter_count(&self) -> usize {
            1
        }
        fn residuals(&self, p: &DVector<Real>, out: &mut DVector<Real>) -> bool {
            if p[0] != 0.0 {
                return false;
            }
            out[0] = 1.0;
            out[1] = -1.0;
            true
        }
        fn jacobian(&self, _p: &DVector<Real>, out: &mut DMatrix<Real>) -> bool {
            out[(0, 0)] = 1.0;
            out[(1, 0)] = 2.0;
            true
        }
    }

    #[test]
    fn unrecoverable_steps_diverge() {
        let out = solve_lm(
            &Stuck,
            DVector::from_vec(vec![0.0]),
            &LmOptions {
                max_iterations: 1000,
                ..LmOptions::default()
            },
            &CancelToken::new(),
        );
        assert!(matches!(
            out,
            Err(SolveError::OptimizationDivergence {
                reason: DivergenceReason::CostIncreased,
                ..
            })
        ));
    }

    #[test]
    fn non_finite_seed_is_divergence() {
        let problem = line_data(1.0, 0.0);
        let out = solve_lm(
            &problem,
            DVector::from_vec(vec![Real::NAN, 0.0]),
            &LmOptions::default(),
            &CancelToken::new(),
        );
        assert!(matches!(
            out,
            Err(SolveError::OptimizationDivergence {
                reason: DivergenceReason::NonFinite,
                ..
            })
        ));
    }

    #[test]
    fn rejects_underdetermined_problem() {
        struct Tiny;
        impl LeastSquaresProblem for Tiny {
            fn residual_count(&self) -> usize {
                1
            }
            fn parameter_count(&self) -> usize {
                3
            }
            fn residuals(&self, _p: &DVector<Real>, out: &mut DVector<Real>) -> bool {
                out[0] = 0.0;
                true
            }
        }
        assert!(matches!(
            solve_lm(
                &Tiny,
                DVector::zeros(3),
                &LmOptions::default(),
                &CancelToken::new()
            ),
            Err(SolveError::BadProblem(_))
        ));
    }
}
