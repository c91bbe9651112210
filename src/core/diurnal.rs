use crate::core::fitting::{
    curve_fit, CycleModel, FitOutcome, ParameterBounds, SolverOptions, TemporalBaselineFitter,
};
use crate::types::{LstError, LstResult};
use chrono::{Duration, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_1_SQRT_2, PI};

/// First hour (inclusive) of the daytime regime
pub const DAY_START_HOUR: f64 = 6.0;
/// First hour of the nighttime regime
pub const NIGHT_START_HOUR: f64 = 19.0;

/// No-data value written by the upstream LST products (f32::MIN rounded)
pub const NODATA_SENTINEL: f64 = -3.402823e38;

/// Largest accepted UTC offset magnitude
pub const MAX_UTC_OFFSET_HOURS: i64 = 24;

fn omega(tm: f64, tsr: f64) -> f64 {
    4.0 / 3.0 * (tm - tsr)
}

/// Daytime cosine model: `T0 + Ta·cos(π/ω·(t − tm))`
///
/// Parameters are `[T0, Ta, A, tm, tsr]`. `A` is carried for parity with the
/// nighttime parameter layout and does not enter the model.
#[derive(Debug, Clone, Copy, Default)]
pub struct DaytimeCycle;

impl CycleModel for DaytimeCycle {
    fn name(&self) -> &'static str {
        "daytime"
    }

    fn num_params(&self) -> usize {
        5
    }

    fn evaluate(&self, t: f64, p: &[f64]) -> f64 {
        let (t0, ta, tm, tsr) = (p[0], p[1], p[3], p[4]);
        t0 + ta * (PI / omega(tm, tsr) * (t - tm)).cos()
    }
}

/// Nighttime relaxation model continuing the daytime curve from `tsr`
///
/// Parameters are `[T0, Ta, A, tm, tsr, ΔT, B, C]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NighttimeCycle;

impl CycleModel for NighttimeCycle {
    fn name(&self) -> &'static str {
        "nighttime"
    }

    fn num_params(&self) -> usize {
        8
    }

    fn evaluate(&self, t: f64, p: &[f64]) -> f64 {
        let (t0, ta, tm, tsr, delta_t, b, c) = (p[0], p[1], p[3], p[4], p[5], p[6], p[7]);
        let w = omega(tm, tsr);
        let phase = PI / w * (tsr - tm);
        let k = w / PI * (1.0 / phase.tan() - (delta_t / ta) * (1.0 / phase.sin()));
        let dt = t - tsr;

        t0 + delta_t + (ta * phase.cos() - delta_t) * k / (k + dt) + b * dt + c * dt * dt
    }
}

/// Which sub-model a given hour belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiurnalPhase {
    Day,
    Night,
}

impl DiurnalPhase {
    /// Classify a (possibly +24 shifted) hour of day
    pub fn of_hour(hour: f64) -> Self {
        if (DAY_START_HOUR..NIGHT_START_HOUR).contains(&hour) {
            DiurnalPhase::Day
        } else {
            DiurnalPhase::Night
        }
    }
}

/// Hour of day with pre-dawn hours moved past midnight (0-5 become 24-29)
pub fn shifted_hour(local: NaiveDateTime) -> f64 {
    let hour = local.hour() as f64;
    if hour < DAY_START_HOUR {
        hour + 24.0
    } else {
        hour
    }
}

/// Diurnal fitting parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiurnalFitParams {
    /// Offset applied to UTC acquisition times to obtain local time
    pub utc_offset_hours: i64,
    /// Observations below this value are excluded
    pub validity_floor: f64,
    pub nodata_sentinel: f64,
    /// Bounds for `[T0, Ta, A, tm, tsr]`
    pub day_bounds: ParameterBounds,
    /// Bounds for `[T0, Ta, A, tm, tsr, ΔT, B, C]`
    pub night_bounds: ParameterBounds,
    pub solver: SolverOptions,
}

impl Default for DiurnalFitParams {
    fn default() -> Self {
        let inf = f64::INFINITY;
        Self {
            utc_offset_hours: 8,
            validity_floor: 260.0,
            nodata_sentinel: NODATA_SENTINEL,
            // tsr is effectively unbounded above
            day_bounds: ParameterBounds {
                lower: vec![-inf, -inf, -inf, 6.0, 5.0],
                upper: vec![inf, inf, inf, 18.0, 260.0],
            },
            night_bounds: ParameterBounds {
                lower: vec![-inf, -inf, -inf, 19.0, 5.0, 0.0, -inf, -inf],
                upper: vec![inf, inf, inf, 23.0, 260.0, 20.0, inf, inf],
            },
            solver: SolverOptions::for_temperature(),
        }
    }
}

impl DiurnalFitParams {
    pub fn validate(&self) -> LstResult<()> {
        if !(-MAX_UTC_OFFSET_HOURS..=MAX_UTC_OFFSET_HOURS).contains(&self.utc_offset_hours) {
            return Err(LstError::InvalidConfig(format!(
                "UTC offset of {} hours is outside +/-{} hours",
                self.utc_offset_hours, MAX_UTC_OFFSET_HOURS
            )));
        }
        if self.validity_floor.is_nan() {
            return Err(LstError::InvalidConfig("diurnal validity floor is NaN".to_string()));
        }
        if self.day_bounds.len() != DaytimeCycle.num_params() || self.night_bounds.len() != NighttimeCycle.num_params() {
            return Err(LstError::InvalidConfig(
                "diurnal bounds must cover 5 daytime and 8 nighttime parameters".to_string(),
            ));
        }
        self.day_bounds.validate()?;
        self.night_bounds.validate()?;
        self.solver.validate()
    }
}

/// Fits the day or night cycle to a pixel's hour-of-day series
#[derive(Debug, Clone, Default)]
pub struct DiurnalFitter {
    params: DiurnalFitParams,
}

impl DiurnalFitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(params: DiurnalFitParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &DiurnalFitParams {
        &self.params
    }

    pub fn to_local(&self, utc: NaiveDateTime) -> LstResult<NaiveDateTime> {
        let offset = self.params.utc_offset_hours;
        if !(-MAX_UTC_OFFSET_HOURS..=MAX_UTC_OFFSET_HOURS).contains(&offset) {
            return Err(LstError::InvalidConfig(format!("UTC offset of {} hours is out of range", offset)));
        }
        utc.checked_add_signed(Duration::hours(offset))
            .ok_or_else(|| LstError::InvalidTimestamp(format!("{} shifted by {} hours overflows", utc, offset)))
    }

    pub fn is_valid_observation(&self, value: f64) -> bool {
        let sentinel = self.params.nodata_sentinel;
        let is_sentinel = (value - sentinel).abs() <= sentinel.abs() * 1e-6;
        value.is_finite() && !is_sentinel && value >= self.params.validity_floor
    }

    /// Valid observations as (shifted local hour, value) pairs
    pub fn observations(&self, series: &[(NaiveDateTime, f64)]) -> LstResult<Vec<(f64, f64)>> {
        series
            .iter()
            .filter(|(_, value)| self.is_valid_observation(*value))
            .map(|(utc, value)| Ok((shifted_hour(self.to_local(*utc)?), *value)))
            .collect()
    }

    /// Fit the sub-model for `phase` using only the observations in that phase
    pub fn fit_phase(&self, phase: DiurnalPhase, observations: &[(f64, f64)]) -> LstResult<FitOutcome> {
        let (hours, values): (Vec<f64>, Vec<f64>) = observations
            .iter()
            .filter(|(hour, _)| DiurnalPhase::of_hour(*hour) == phase)
            .cloned()
            .unzip();

        match phase {
            DiurnalPhase::Day => {
                let model = DaytimeCycle;
                check_observation_count(&model, hours.len())?;
                let initial = daytime_initial_guess(&values);
                curve_fit(&model, &hours, &values, &initial, Some(&self.params.day_bounds), &self.params.solver)
            }
            DiurnalPhase::Night => {
                let model = NighttimeCycle;
                check_observation_count(&model, hours.len())?;
                let initial = nighttime_initial_guess(&values);
                curve_fit(&model, &hours, &values, &initial, Some(&self.params.night_bounds), &self.params.solver)
            }
        }
    }
}

impl TemporalBaselineFitter for DiurnalFitter {
    /// `series` carries UTC acquisition times, `target` is local time
    fn baseline(&self, series: &[(NaiveDateTime, f64)], target: NaiveDateTime) -> LstResult<f64> {
        let observations = self.observations(series)?;
        let hour = shifted_hour(target);
        let phase = DiurnalPhase::of_hour(hour);

        let fit = self.fit_phase(phase, &observations)?;
        let value = match phase {
            DiurnalPhase::Day => DaytimeCycle.evaluate(hour, &fit.params),
            DiurnalPhase::Night => NighttimeCycle.evaluate(hour, &fit.params),
        };

        if value.is_finite() {
            Ok(value)
        } else {
            Err(LstError::NonConvergentFit(format!(
                "diurnal model is not finite at hour {}",
                hour
            )))
        }
    }
}

fn check_observation_count<M: CycleModel>(model: &M, available: usize) -> LstResult<()> {
    if available < model.num_params() {
        return Err(LstError::UnderdeterminedFit {
            required: model.num_params(),
            available,
        });
    }
    Ok(())
}

fn half_range(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    ((max - min) / 2.0).max(1.0)
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len().max(1) as f64
}

fn daytime_initial_guess(values: &[f64]) -> Vec<f64> {
    // peak shortly after solar noon, sunrise at 06:00
    vec![mean(values), half_range(values), 0.0, 13.0, 6.0]
}

fn nighttime_initial_guess(values: &[f64]) -> Vec<f64> {
    // tm = 21, tsr = 18 puts the phase at -3π/4, where cos = -1/√2
    let ta = half_range(values);
    vec![mean(values) + FRAC_1_SQRT_2 * ta, ta, 0.0, 21.0, 18.0, 1.0, 0.0, 0.0]
}
