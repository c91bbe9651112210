//! Bounded nonlinear least squares shared by the temporal cycle models
//!
//! A projected Levenberg-Marquardt iteration with a forward-difference
//! Jacobian. Parameters are clamped to their box after every step.

use crate::types::{LstError, LstResult};
use chrono::NaiveDateTime;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const MIN_DAMPING: f64 = 1e-15;
const MAX_DAMPING: f64 = 1e16;
const DIAGONAL_FLOOR: f64 = 1e-12;

/// Parametric temperature cycle evaluated at a scalar time coordinate
pub trait CycleModel: Send + Sync {
    /// Short model name used in log and error messages
    fn name(&self) -> &'static str;

    /// Number of free parameters
    fn num_params(&self) -> usize;

    fn evaluate(&self, x: f64, params: &[f64]) -> f64;
}

/// Fits a cycle model to one pixel's observation series and predicts the baseline
pub trait TemporalBaselineFitter: Send + Sync {
    /// Baseline value at `target` from `(acquisition time, raw value)` pairs
    fn baseline(&self, series: &[(NaiveDateTime, f64)], target: NaiveDateTime) -> LstResult<f64>;
}

/// Solver stopping criteria
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// Maximum accepted steps before giving up
    pub max_iterations: usize,
    /// Relative cost reduction below which the fit is converged
    pub ftol: f64,
    /// Relative step size below which the fit is converged
    pub xtol: f64,
    /// Largest cosine between the residual and a Jacobian column at convergence
    pub gtol: f64,
    pub initial_damping: f64,
    /// Number of accepted steps over which stagnation is measured
    pub stall_window: usize,
    /// Relative cost reduction over `stall_window` accepted steps below which the fit has stalled
    pub stall_tolerance: f64,
    /// RMS residual at or below which a fit is accepted outright (0 disables)
    pub residual_floor: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 400,
            ftol: 1e-8,
            xtol: 1e-8,
            gtol: 1e-8,
            initial_damping: 1e-3,
            stall_window: 10,
            stall_tolerance: 1e-5,
            residual_floor: 0.0,
        }
    }
}

impl SolverOptions {
    /// Options for temperature series in kelvin, where sub-0.1 mK residuals are exact
    pub fn for_temperature() -> Self {
        Self {
            residual_floor: 1e-4,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> LstResult<()> {
        if self.max_iterations == 0 || self.stall_window == 0 {
            return Err(LstError::InvalidConfig(
                "solver needs at least one iteration and a non-empty stall window".to_string(),
            ));
        }
        let tolerances = [
            ("ftol", self.ftol),
            ("xtol", self.xtol),
            ("gtol", self.gtol),
            ("initial_damping", self.initial_damping),
            ("stall_tolerance", self.stall_tolerance),
            ("residual_floor", self.residual_floor),
        ];
        for (name, value) in tolerances {
            if !value.is_finite() || value < 0.0 {
                return Err(LstError::InvalidConfig(format!(
                    "solver {} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Box constraints on model parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterBounds {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl ParameterBounds {
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> LstResult<Self> {
        let bounds = Self { lower, upper };
        bounds.validate()?;
        Ok(bounds)
    }

    /// Check that both sides have the same length and every box is non-empty
    pub fn validate(&self) -> LstResult<()> {
        if self.lower.len() != self.upper.len() {
            return Err(LstError::InvalidConfig(format!(
                "{} lower bounds for {} upper bounds",
                self.lower.len(),
                self.upper.len()
            )));
        }
        let (lower, upper) = (&self.lower, &self.upper);
        if let Some(i) = (0..lower.len()).find(|&i| lower[i].is_nan() || upper[i].is_nan() || lower[i] > upper[i]) {
            return Err(LstError::InvalidConfig(format!(
                "parameter {} has empty bounds [{}, {}]",
                i, lower[i], upper[i]
            )));
        }
        Ok(())
    }

    pub fn unbounded(n: usize) -> Self {
        Self {
            lower: vec![f64::NEG_INFINITY; n],
            upper: vec![f64::INFINITY; n],
        }
    }

    pub fn len(&self) -> usize {
        self.lower.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lower.is_empty()
    }

    pub fn clamp(&self, params: &mut [f64]) {
        for (i, p) in params.iter_mut().enumerate() {
            *p = p.max(self.lower[i]).min(self.upper[i]);
        }
    }
}

/// Result of a successful fit
#[derive(Debug, Clone)]
pub struct FitOutcome {
    pub params: Vec<f64>,
    /// Half the sum of squared residuals
    pub cost: f64,
    pub iterations: usize,
}

impl FitOutcome {
    pub fn rmse(&self, num_observations: usize) -> f64 {
        (2.0 * self.cost / num_observations.max(1) as f64).sqrt()
    }
}

/// Least-squares fit of `model` to `(x, y)` starting from `initial`
pub fn curve_fit<M: CycleModel + ?Sized>(
    model: &M,
    x: &[f64],
    y: &[f64],
    initial: &[f64],
    bounds: Option<&ParameterBounds>,
    options: &SolverOptions,
) -> LstResult<FitOutcome> {
    let n_params = model.num_params();
    if x.len() != y.len() {
        return Err(LstError::Processing(format!(
            "{} x values for {} y values",
            x.len(),
            y.len()
        )));
    }
    if initial.len() != n_params {
        return Err(LstError::Processing(format!(
            "{} model expects {} parameters, initial guess has {}",
            model.name(),
            n_params,
            initial.len()
        )));
    }
    if let Some(b) = bounds {
        if b.len() != n_params {
            return Err(LstError::InvalidConfig(format!(
                "{} model expects {} bounds, got {}",
                model.name(),
                n_params,
                b.len()
            )));
        }
    }
    if x.len() < n_params {
        return Err(LstError::UnderdeterminedFit {
            required: n_params,
            available: x.len(),
        });
    }

    let mut params = initial.to_vec();
    if let Some(b) = bounds {
        b.clamp(&mut params);
    }

    let mut residuals = compute_residuals(model, x, y, &params).ok_or_else(|| {
        LstError::NonConvergentFit(format!(
            "{} model is not finite at the initial guess {:?}",
            model.name(),
            params
        ))
    })?;
    let mut cost = 0.5 * residuals.norm_squared();
    let cost_floor = (0.5 * x.len() as f64 * options.residual_floor * options.residual_floor).max(f64::MIN_POSITIVE);
    let mut damping = options.initial_damping;
    // Costs after the last `stall_window` accepted steps, oldest first
    let mut recent_costs = VecDeque::with_capacity(options.stall_window + 1);
    recent_costs.push_back(cost);

    for iteration in 1..=options.max_iterations {
        if cost <= cost_floor {
            return Ok(FitOutcome { params, cost, iterations: iteration - 1 });
        }

        let jacobian = forward_jacobian(model, x, &params, bounds);
        let mut gradient = jacobian.transpose() * &residuals;
        let mut hessian = jacobian.transpose() * &jacobian;

        let frozen = frozen_parameters(&jacobian, &gradient, &params, bounds);
        for (j, _) in frozen.iter().enumerate().filter(|(_, f)| **f) {
            hessian.row_mut(j).fill(0.0);
            hessian.column_mut(j).fill(0.0);
            hessian[(j, j)] = 1.0;
            gradient[j] = 0.0;
        }

        if scaled_gradient(&jacobian, &gradient, &residuals) <= options.gtol {
            return Ok(FitOutcome { params, cost, iterations: iteration - 1 });
        }

        // Inner loop raises damping until a step lowers the cost
        loop {
            if damping > MAX_DAMPING {
                log::trace!("{} fit stalled at cost {:.3e}", model.name(), cost);
                return Ok(FitOutcome { params, cost, iterations: iteration });
            }

            let mut system = hessian.clone();
            for i in 0..n_params {
                system[(i, i)] += damping * hessian[(i, i)].max(DIAGONAL_FLOOR);
            }

            let rhs = gradient.map(|g| -g);
            let step = match system.clone().cholesky() {
                Some(cholesky) => cholesky.solve(&rhs),
                None => match system.lu().solve(&rhs) {
                    Some(solution) => solution,
                    None => {
                        damping *= 10.0;
                        continue;
                    }
                },
            };

            let mut candidate: Vec<f64> = params.iter().zip(step.iter()).map(|(p, d)| p + d).collect();
            if let Some(b) = bounds {
                b.clamp(&mut candidate);
            }

            let new_residuals = match compute_residuals(model, x, y, &candidate) {
                Some(r) => r,
                None => {
                    damping *= 10.0;
                    continue;
                }
            };
            let new_cost = 0.5 * new_residuals.norm_squared();

            if new_cost < cost {
                let step_norm = params
                    .iter()
                    .zip(candidate.iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f64>()
                    .sqrt();
                let param_norm = params.iter().map(|p| p * p).sum::<f64>().sqrt();

                recent_costs.push_back(new_cost);
                if recent_costs.len() > options.stall_window + 1 {
                    recent_costs.pop_front();
                }
                let stalled = recent_costs.len() > options.stall_window
                    && recent_costs
                        .front()
                        .map_or(false, |&oldest| oldest - new_cost <= options.stall_tolerance * oldest);

                let converged = (cost - new_cost) <= options.ftol * cost
                    || step_norm <= options.xtol * (param_norm + options.xtol)
                    || stalled;

                params = candidate;
                residuals = new_residuals;
                cost = new_cost;
                damping = (damping / 10.0).max(MIN_DAMPING);

                if converged {
                    if stalled {
                        log::trace!("{} fit stopped improving at cost {:.3e}", model.name(), cost);
                    }
                    return Ok(FitOutcome { params, cost, iterations: iteration });
                }
                break;
            }

            damping *= 10.0;
        }
    }

    Err(LstError::NonConvergentFit(format!(
        "{} model did not converge after {} iterations (cost {:.3e})",
        model.name(),
        options.max_iterations,
        cost
    )))
}

/// Parameters held fixed for one iteration: those pinned at a bound with the
/// descent direction pointing outward, and those the model does not depend on
fn frozen_parameters(
    jacobian: &DMatrix<f64>,
    gradient: &DVector<f64>,
    params: &[f64],
    bounds: Option<&ParameterBounds>,
) -> Vec<bool> {
    (0..params.len())
        .map(|j| {
            if jacobian.column(j).amax() == 0.0 {
                return true;
            }
            match bounds {
                Some(b) => {
                    (params[j] <= b.lower[j] && gradient[j] > 0.0)
                        || (params[j] >= b.upper[j] && gradient[j] < 0.0)
                }
                None => false,
            }
        })
        .collect()
}

/// Largest cosine between the residual vector and a Jacobian column
fn scaled_gradient(jacobian: &DMatrix<f64>, gradient: &DVector<f64>, residuals: &DVector<f64>) -> f64 {
    let residual_norm = residuals.norm();
    if residual_norm == 0.0 {
        return 0.0;
    }
    (0..gradient.len())
        .filter_map(|j| {
            let column_norm = jacobian.column(j).norm();
            (column_norm > 0.0).then(|| gradient[j].abs() / (column_norm * residual_norm))
        })
        .fold(0.0, f64::max)
}

fn compute_residuals<M: CycleModel + ?Sized>(
    model: &M,
    x: &[f64],
    y: &[f64],
    params: &[f64],
) -> Option<DVector<f64>> {
    let mut residuals = DVector::zeros(x.len());
    for (i, (&xi, &yi)) in x.iter().zip(y.iter()).enumerate() {
        let r = model.evaluate(xi, params) - yi;
        if !r.is_finite() {
            return None;
        }
        residuals[i] = r;
    }
    Some(residuals)
}

fn forward_jacobian<M: CycleModel + ?Sized>(
    model: &M,
    x: &[f64],
    params: &[f64],
    bounds: Option<&ParameterBounds>,
) -> DMatrix<f64> {
    let eps = f64::EPSILON.sqrt();
    let base: Vec<f64> = x.iter().map(|&xi| model.evaluate(xi, params)).collect();
    let mut jacobian = DMatrix::zeros(x.len(), params.len());
    let mut shifted = params.to_vec();

    for j in 0..params.len() {
        let mut h = eps * params[j].abs().max(1.0);
        if let Some(b) = bounds {
            if params[j] + h > b.upper[j] {
                h = -h;
            }
        }
        shifted[j] = params[j] + h;

        for (i, &xi) in x.iter().enumerate() {
            let derivative = (model.evaluate(xi, &shifted) - base[i]) / h;
            jacobian[(i, j)] = if derivative.is_finite() { derivative } else { 0.0 };
        }
        shifted[j] = params[j];
    }

    jacobian
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    struct Exponential;

    impl CycleModel for Exponential {
        fn name(&self) -> &'static str {
            "exponential"
        }

        fn num_params(&self) -> usize {
            2
        }

        fn evaluate(&self, x: f64, p: &[f64]) -> f64 {
            p[0] * (p[1] * x).exp()
        }
    }

    #[test]
    fn test_recovers_exponential() {
        let x: Vec<f64> = (0..10).map(|i| i as f64 * 0.3).collect();
        let y: Vec<f64> = x.iter().map(|&xi| 2.5 * (-0.8 * xi).exp()).collect();

        let fit = curve_fit(&Exponential, &x, &y, &[1.0, -0.1], None, &SolverOptions::default()).unwrap();

        assert_abs_diff_eq!(fit.params[0], 2.5, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.params[1], -0.8, epsilon = 1e-6);
        assert!(fit.rmse(x.len()) < 1e-6);
    }

    #[test]
    fn test_bounds_are_respected() {
        let x: Vec<f64> = (0..10).map(|i| i as f64 * 0.3).collect();
        let y: Vec<f64> = x.iter().map(|&xi| 2.5 * (-0.8 * xi).exp()).collect();
        let bounds = ParameterBounds::new(vec![0.0, -0.5], vec![10.0, 0.0]).unwrap();

        let fit = curve_fit(&Exponential, &x, &y, &[1.0, -0.1], Some(&bounds), &SolverOptions::default()).unwrap();

        assert!(fit.params[1] >= -0.5);
        assert!(fit.params[1] <= 0.0);
    }

    #[test]
    fn test_optimum_on_bound_converges() {
        // unconstrained optimum is at -0.8, outside the box
        let x: Vec<f64> = (0..10).map(|i| i as f64 * 0.3).collect();
        let y: Vec<f64> = x.iter().map(|&xi| 2.5 * (-0.8 * xi).exp()).collect();
        let bounds = ParameterBounds::new(vec![0.0, -0.5], vec![10.0, 0.0]).unwrap();
        let options = SolverOptions::default();

        let fit = curve_fit(&Exponential, &x, &y, &[1.0, -0.1], Some(&bounds), &options).unwrap();

        assert_eq!(fit.params[1], -0.5);
        assert!(fit.iterations < options.max_iterations);
    }

    struct ExponentialWithSpare;

    impl CycleModel for ExponentialWithSpare {
        fn name(&self) -> &'static str {
            "exponential-spare"
        }

        fn num_params(&self) -> usize {
            3
        }

        fn evaluate(&self, x: f64, p: &[f64]) -> f64 {
            p[0] * (p[1] * x).exp()
        }
    }

    #[test]
    fn test_parameter_without_effect_is_left_alone() {
        let x: Vec<f64> = (0..10).map(|i| i as f64 * 0.3).collect();
        let y: Vec<f64> = x.iter().map(|&xi| 2.5 * (-0.8 * xi).exp()).collect();

        let fit = curve_fit(&ExponentialWithSpare, &x, &y, &[1.0, -0.1, 7.0], None, &SolverOptions::default()).unwrap();

        assert_eq!(fit.params[2], 7.0);
        assert_abs_diff_eq!(fit.params[0], 2.5, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.params[1], -0.8, epsilon = 1e-6);
    }

    #[test]
    fn test_stalled_cost_counts_as_converged() {
        let x: Vec<f64> = (0..10).map(|i| i as f64 * 0.3).collect();
        let y: Vec<f64> = x.iter().map(|&xi| 2.5 * (-0.8 * xi).exp() + 0.01 * xi.sin()).collect();
        // any accepted step satisfies a unit tolerance over a one-step window
        let options = SolverOptions {
            max_iterations: 1,
            stall_window: 1,
            stall_tolerance: 1.0,
            ..SolverOptions::default()
        };

        let fit = curve_fit(&Exponential, &x, &y, &[1.0, 0.5], None, &options).unwrap();
        assert_eq!(fit.iterations, 1);
    }

    #[test]
    fn test_residual_floor_accepts_exact_fit() {
        let x: Vec<f64> = (0..10).map(|i| i as f64 * 0.3).collect();
        let y: Vec<f64> = x.iter().map(|&xi| 2.5 * (-0.8 * xi).exp()).collect();
        let options = SolverOptions {
            residual_floor: 1e-3,
            ..SolverOptions::default()
        };

        let fit = curve_fit(&Exponential, &x, &y, &[2.5, -0.8], None, &options).unwrap();
        assert_eq!(fit.iterations, 0);
        assert_eq!(fit.params, vec![2.5, -0.8]);
    }

    #[test]
    fn test_solver_option_validation() {
        assert!(SolverOptions::default().validate().is_ok());
        assert!(SolverOptions::for_temperature().validate().is_ok());

        let options = SolverOptions {
            ftol: f64::NAN,
            ..SolverOptions::default()
        };
        assert!(matches!(options.validate(), Err(LstError::InvalidConfig(_))));

        let options = SolverOptions {
            stall_window: 0,
            ..SolverOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_too_few_observations() {
        let err = curve_fit(&Exponential, &[1.0], &[2.0], &[1.0, 1.0], None, &SolverOptions::default()).unwrap_err();
        assert!(matches!(err, LstError::UnderdeterminedFit { required: 2, available: 1 }));
    }

    #[test]
    fn test_iteration_cap_reports_non_convergence() {
        let x: Vec<f64> = (0..10).map(|i| i as f64 * 0.3).collect();
        let y: Vec<f64> = x.iter().map(|&xi| 2.5 * (-0.8 * xi).exp() + 0.01 * xi.sin()).collect();
        let options = SolverOptions {
            max_iterations: 1,
            ..SolverOptions::default()
        };

        let err = curve_fit(&Exponential, &x, &y, &[1.0, 0.5], None, &options).unwrap_err();
        assert!(matches!(err, LstError::NonConvergentFit(_)));
    }

    #[test]
    fn test_invalid_bounds() {
        assert!(ParameterBounds::new(vec![1.0], vec![0.0]).is_err());
        assert!(ParameterBounds::new(vec![1.0, 2.0], vec![3.0]).is_err());
        assert!(ParameterBounds::new(vec![f64::NAN], vec![1.0]).is_err());

        let inverted = ParameterBounds {
            lower: vec![0.0, 5.0],
            upper: vec![1.0, 4.0],
        };
        assert!(matches!(inverted.validate(), Err(LstError::InvalidConfig(_))));
        assert_eq!(ParameterBounds::unbounded(3).len(), 3);
    }
}
