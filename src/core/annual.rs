use crate::core::fitting::{curve_fit, CycleModel, FitOutcome, SolverOptions, TemporalBaselineFitter};
use crate::types::{LstError, LstResult, ValidityRange};
use chrono::{Datelike, NaiveDateTime};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Mean length of the calendar year in days
pub const DAYS_PER_YEAR: f64 = 365.25;

/// Annual temperature cycle: `A·sin(2π·doy/365.25 + B) + C·doy + D`
#[derive(Debug, Clone, Copy, Default)]
pub struct AnnualCycle;

impl CycleModel for AnnualCycle {
    fn name(&self) -> &'static str {
        "annual"
    }

    fn num_params(&self) -> usize {
        4
    }

    fn evaluate(&self, doy: f64, p: &[f64]) -> f64 {
        p[0] * (2.0 * PI * doy / DAYS_PER_YEAR + p[1]).sin() + p[2] * doy + p[3]
    }
}

/// Annual fitting parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnualFitParams {
    /// Observations outside this range are left out of the fit
    pub plausible_range: ValidityRange,
    pub solver: SolverOptions,
}

impl Default for AnnualFitParams {
    fn default() -> Self {
        Self {
            plausible_range: ValidityRange::new(265.0, 320.0),
            solver: SolverOptions::for_temperature(),
        }
    }
}

impl AnnualFitParams {
    pub fn validate(&self) -> LstResult<()> {
        let range = self.plausible_range;
        if range.min.is_nan() || range.max.is_nan() || range.min > range.max {
            return Err(LstError::InvalidConfig(format!(
                "annual plausible range [{}, {}] is empty",
                range.min, range.max
            )));
        }
        self.solver.validate()
    }
}

/// Fits the annual cycle to a pixel's day-of-year series
#[derive(Debug, Clone, Default)]
pub struct AnnualFitter {
    params: AnnualFitParams,
}

impl AnnualFitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(params: AnnualFitParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &AnnualFitParams {
        &self.params
    }

    /// Plausible observations as (day-of-year, value) pairs
    pub fn observations(&self, series: &[(NaiveDateTime, f64)]) -> (Vec<f64>, Vec<f64>) {
        series
            .iter()
            .filter(|(_, value)| self.params.plausible_range.contains(*value))
            .map(|(acquired, value)| (acquired.ordinal() as f64, *value))
            .unzip()
    }

    /// Fit `A, B, C, D` to (day-of-year, value) observations
    pub fn fit(&self, doy: &[f64], values: &[f64]) -> LstResult<FitOutcome> {
        let model = AnnualCycle;
        if doy.len() < model.num_params() {
            return Err(LstError::UnderdeterminedFit {
                required: model.num_params(),
                available: doy.len(),
            });
        }

        let initial = linear_initial_guess(doy, values).unwrap_or_else(|| moment_initial_guess(values));
        curve_fit(&model, doy, values, &initial, None, &self.params.solver)
    }
}

impl TemporalBaselineFitter for AnnualFitter {
    fn baseline(&self, series: &[(NaiveDateTime, f64)], target: NaiveDateTime) -> LstResult<f64> {
        let (doy, values) = self.observations(series);
        let fit = self.fit(&doy, &values)?;
        Ok(AnnualCycle.evaluate(target.ordinal() as f64, &fit.params))
    }
}

/// Solve the equivalent linear model `a·sin θ + b·cos θ + C·doy + D`
fn linear_initial_guess(doy: &[f64], values: &[f64]) -> Option<Vec<f64>> {
    let n = doy.len();
    let design = DMatrix::from_fn(n, 4, |i, j| {
        let theta = 2.0 * PI * doy[i] / DAYS_PER_YEAR;
        match j {
            0 => theta.sin(),
            1 => theta.cos(),
            2 => doy[i],
            _ => 1.0,
        }
    });
    let y = DVector::from_column_slice(values);

    let coeffs = design.svd(true, true).solve(&y, 1e-12).ok()?;
    if coeffs.iter().any(|c| !c.is_finite()) {
        return None;
    }

    let (a, b) = (coeffs[0], coeffs[1]);
    Some(vec![a.hypot(b), b.atan2(a), coeffs[2], coeffs[3]])
}

fn moment_initial_guess(values: &[f64]) -> Vec<f64> {
    let mean = values.iter().sum::<f64>() / values.len().max(1) as f64;
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    vec![((max - min) / 2.0).max(1.0), 0.0, 0.0, mean]
}
