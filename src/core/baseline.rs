use crate::core::annual::AnnualFitter;
use crate::core::diurnal::DiurnalFitter;
use crate::core::fitting::TemporalBaselineFitter;
use crate::core::missing::MissingSet;
use crate::core::stack::RasterStack;
use crate::types::{BaselineArray, LstError, LstResult, PixelCoord};
use chrono::NaiveDateTime;
use std::time::{Duration, Instant};

/// Counts of how every baseline cell was produced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BaselineSummary {
    /// Cells with a fitted baseline value
    pub fitted: usize,
    /// Cells whose fit failed and hold no-data
    pub failed: usize,
    /// Cells outside the active region (annual mode zero fill)
    pub untouched: usize,
}

/// Builds the full-grid baseline from per-pixel temporal fits
pub struct BaselineArrayBuilder<'a> {
    stack: &'a RasterStack,
    deadline: Option<Instant>,
}

impl<'a> BaselineArrayBuilder<'a> {
    pub fn new(stack: &'a RasterStack) -> Self {
        Self { stack, deadline: None }
    }

    /// Abort fitting with `Cancelled` once `budget` has elapsed
    pub fn with_time_budget(mut self, budget: Option<Duration>) -> Self {
        self.deadline = budget.map(|b| Instant::now() + b);
        self
    }

    /// Annual baseline: only the active window set is fitted, the rest stays zero
    pub fn build_annual(
        &self,
        fitter: &AnnualFitter,
        missing: &MissingSet,
        target: NaiveDateTime,
    ) -> LstResult<(BaselineArray, BaselineSummary)> {
        log::info!(
            "Building annual baseline for {} active pixels at {}",
            missing.active.len(),
            target.date()
        );

        let mut baseline = BaselineArray::from_elem(self.stack.shape(), Some(0.0));
        let results = self.fit_coordinates(fitter, &missing.active, target)?;
        let summary = Self::assign(&mut baseline, results);

        Ok((baseline, summary))
    }

    /// Diurnal baseline: every pixel is fitted
    pub fn build_diurnal(
        &self,
        fitter: &DiurnalFitter,
        target: NaiveDateTime,
    ) -> LstResult<(BaselineArray, BaselineSummary)> {
        let (rows, cols) = self.stack.shape();
        log::info!("Building diurnal baseline for {}x{} pixels at {}", rows, cols, target);

        let coords: Vec<PixelCoord> = (0..rows)
            .flat_map(|i| (0..cols).map(move |j| (i, j)))
            .collect();

        let mut baseline = BaselineArray::from_elem((rows, cols), None);
        let results = self.fit_coordinates(fitter, &coords, target)?;
        let summary = Self::assign(&mut baseline, results);

        Ok((baseline, summary))
    }

    /// Fit each coordinate independently; pixel-level failures become no-data
    pub fn fit_coordinates<F: TemporalBaselineFitter>(
        &self,
        fitter: &F,
        coords: &[PixelCoord],
        target: NaiveDateTime,
    ) -> LstResult<Vec<(PixelCoord, Option<f64>)>> {
        let fit_one = |&(row, col): &PixelCoord| -> LstResult<(PixelCoord, Option<f64>)> {
            self.check_deadline()?;
            let series = self.stack.series_at(row, col);

            match fitter.baseline(&series, target) {
                Ok(value) if value.is_finite() => Ok(((row, col), Some(value))),
                Ok(value) => {
                    log::debug!("Pixel ({}, {}): non-finite baseline {}", row, col, value);
                    Ok(((row, col), None))
                }
                Err(e) if e.is_pixel_level() => {
                    log::debug!("Pixel ({}, {}): {}", row, col, e);
                    Ok(((row, col), None))
                }
                Err(e) => Err(e),
            }
        };

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            coords.par_iter().map(fit_one).collect()
        }

        #[cfg(not(feature = "parallel"))]
        {
            coords.iter().map(fit_one).collect()
        }
    }

    fn check_deadline(&self) -> LstResult<()> {
        match self.deadline {
            Some(deadline) if Instant::now() > deadline => Err(LstError::Cancelled(
                "baseline fitting exceeded its time budget".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn assign(baseline: &mut BaselineArray, results: Vec<(PixelCoord, Option<f64>)>) -> BaselineSummary {
        let total = baseline.len();
        let mut summary = BaselineSummary::default();

        for (coord, value) in results {
            match value {
                Some(_) => summary.fitted += 1,
                None => summary.failed += 1,
            }
            baseline[coord] = value;
        }
        summary.untouched = total - summary.fitted - summary.failed;

        if summary.failed > 0 {
            log::warn!(
                "{} of {} baseline fits failed and were set to no-data",
                summary.failed,
                summary.fitted + summary.failed
            );
        }
        log::info!(
            "Baseline complete: {} fitted, {} failed, {} untouched",
            summary.fitted,
            summary.failed,
            summary.untouched
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::annual::AnnualCycle;
    use crate::core::fitting::CycleModel;
    use crate::core::missing::MissingPixelLocator;
    use crate::types::Grid;
    use chrono::NaiveDate;
    use ndarray::Array2;

    const KNOWN: [f64; 4] = [12.0, -0.4, 0.005, 295.0];

    fn annual_stack(rows: usize, cols: usize) -> RasterStack {
        let mut timestamps = Vec::new();
        let mut grids = Vec::new();
        for m in 0..8u32 {
            let doy = 20 + m * 45;
            timestamps.push(NaiveDate::from_yo_opt(2021, doy).unwrap().and_hms_opt(0, 0, 0).unwrap());
            let value = AnnualCycle.evaluate(doy as f64, &KNOWN);
            grids.push(Array2::from_shape_fn((rows, cols), |(i, j)| value + (i + j) as f64 * 0.5));
        }
        RasterStack::new(timestamps, grids).unwrap()
    }

    fn target() -> NaiveDateTime {
        NaiveDate::from_yo_opt(2021, 150).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    #[test]
    fn test_annual_only_fills_active_region() {
        let stack = annual_stack(6, 6);
        let mut observed = Grid::from_elem((6, 6), Some(300.0));
        observed[[0, 0]] = None;
        let missing = MissingPixelLocator::new(1).locate(&observed);

        let (baseline, summary) = BaselineArrayBuilder::new(&stack)
            .build_annual(&AnnualFitter::new(), &missing, target())
            .unwrap();

        assert_eq!(summary.fitted, 4);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.untouched, 32);
        assert_eq!(baseline[[5, 5]], Some(0.0));

        let expected = AnnualCycle.evaluate(150.0, &KNOWN) + 0.5;
        let got = baseline[[1, 0]].unwrap();
        assert!((got - expected).abs() < 1e-6);
    }

    #[test]
    fn test_failed_fits_become_no_data() {
        let stack = annual_stack(3, 3);
        let coords = vec![(0, 0), (2, 2)];
        let fitter = AnnualFitter::with_params(crate::core::annual::AnnualFitParams {
            plausible_range: crate::types::ValidityRange::new(400.0, 500.0),
            ..Default::default()
        });

        let results = BaselineArrayBuilder::new(&stack)
            .fit_coordinates(&fitter, &coords, target())
            .unwrap();
        assert!(results.iter().all(|(_, v)| v.is_none()));
    }

    #[test]
    fn test_diurnal_without_valid_data_is_all_no_data() {
        let timestamps = (0..3)
            .map(|h| NaiveDate::from_ymd_opt(2022, 1, 1).unwrap().and_hms_opt(h, 0, 0).unwrap())
            .collect();
        let grids = vec![Array2::from_elem((2, 2), 100.0); 3];
        let stack = RasterStack::new(timestamps, grids).unwrap();
        let local = NaiveDate::from_ymd_opt(2022, 1, 1).unwrap().and_hms_opt(10, 0, 0).unwrap();

        let (baseline, summary) = BaselineArrayBuilder::new(&stack)
            .build_diurnal(&DiurnalFitter::new(), local)
            .unwrap();

        assert!(baseline.iter().all(|v| v.is_none()));
        assert_eq!(summary.failed, 4);
        assert_eq!(summary.untouched, 0);
    }

    #[test]
    fn test_expired_budget_cancels() {
        let stack = annual_stack(3, 3);
        let builder = BaselineArrayBuilder::new(&stack).with_time_budget(Some(Duration::ZERO));
        std::thread::sleep(Duration::from_millis(2));

        let err = builder
            .fit_coordinates(&AnnualFitter::new(), &[(0, 0)], target())
            .unwrap_err();
        assert!(matches!(err, LstError::Cancelled(_)));
    }
}
