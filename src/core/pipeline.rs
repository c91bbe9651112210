use crate::core::annual::{AnnualFitParams, AnnualFitter};
use crate::core::baseline::{BaselineArrayBuilder, BaselineSummary};
use crate::core::diurnal::{DiurnalFitParams, DiurnalFitter};
use crate::core::missing::MissingPixelLocator;
use crate::core::reconstruct::{ReconstructionSummary, SpatialParams, SpatialReconstructor};
use crate::core::stack::RasterStack;
use crate::types::{BaselineArray, Grid, LstError, LstResult, RawGrid, TempfillMode, ValidityRange};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[cfg(feature = "raster-io")]
use std::path::Path;

/// Everything needed to run one reconstruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionConfig {
    /// Half-width of the window for both the active region and interpolation
    pub window_radius: usize,
    pub stride: usize,
    /// Accept `stride > 1`, leaving skipped pixels as no-data
    pub allow_sparse_stride: bool,
    /// Trusted range for the observed (target) raster
    pub validity_range: ValidityRange,
    pub annual: AnnualFitParams,
    pub diurnal: DiurnalFitParams,
    /// Upper bound on the wall-clock time spent fitting baselines
    pub fit_deadline: Option<Duration>,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        let spatial = SpatialParams::default();
        Self {
            window_radius: spatial.window_radius,
            stride: spatial.stride,
            allow_sparse_stride: spatial.allow_sparse_stride,
            validity_range: ValidityRange::default(),
            annual: AnnualFitParams::default(),
            diurnal: DiurnalFitParams::default(),
            fit_deadline: None,
        }
    }
}

impl ReconstructionConfig {
    pub fn with_window_radius(window_radius: usize) -> Self {
        Self {
            window_radius,
            ..Self::default()
        }
    }

    pub fn spatial_params(&self) -> SpatialParams {
        SpatialParams {
            window_radius: self.window_radius,
            stride: self.stride,
            allow_sparse_stride: self.allow_sparse_stride,
        }
    }

    pub fn validate(&self) -> LstResult<()> {
        self.spatial_params().validate()?;
        let range = self.validity_range;
        if range.min.is_nan() || range.max.is_nan() || range.min > range.max {
            return Err(LstError::InvalidConfig(format!(
                "validity range [{}, {}] is empty",
                range.min, range.max
            )));
        }
        self.annual.validate()?;
        self.diurnal.validate()
    }
}

/// Result of a reconstruction run
#[derive(Debug, Clone)]
pub struct ReconstructionOutput {
    pub reconstructed: Grid,
    pub baseline: BaselineArray,
    pub baseline_summary: BaselineSummary,
    pub summary: ReconstructionSummary,
}

/// Sequences missing-pixel detection, baseline fitting and spatial filling
pub struct Reconstructor {
    config: ReconstructionConfig,
}

impl Reconstructor {
    pub fn new(config: ReconstructionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReconstructionConfig {
        &self.config
    }

    /// Reconstruct a raw observed raster (normalized with the validity range first)
    pub fn run_raw(
        &self,
        mode: TempfillMode,
        stack: &RasterStack,
        observed: &RawGrid,
        target: NaiveDateTime,
    ) -> LstResult<ReconstructionOutput> {
        let observed = self.config.validity_range.normalize(observed);
        self.run(mode, stack, &observed, target)
    }

    /// Reconstruct `observed` at `target` (a date for annual mode, local time for diurnal)
    pub fn run(
        &self,
        mode: TempfillMode,
        stack: &RasterStack,
        observed: &Grid,
        target: NaiveDateTime,
    ) -> LstResult<ReconstructionOutput> {
        let start = Instant::now();
        log::info!("Starting {} reconstruction with {} stack layers", mode, stack.len());
        log::debug!("Reconstruction config: {:?}", self.config);

        // Fatal preconditions are checked before any fitting
        self.config.validate()?;
        if stack.is_empty() {
            return Err(LstError::EmptyStack("no layers to fit".to_string()));
        }
        stack.check_shape(observed.dim(), "target grid")?;

        let builder = BaselineArrayBuilder::new(stack).with_time_budget(self.config.fit_deadline);
        let (baseline, baseline_summary) = match mode {
            TempfillMode::Annual => {
                let missing = MissingPixelLocator::new(self.config.window_radius).locate(observed);
                let fitter = AnnualFitter::with_params(self.config.annual.clone());
                builder.build_annual(&fitter, &missing, target)?
            }
            TempfillMode::Diurnal => {
                let fitter = DiurnalFitter::with_params(self.config.diurnal.clone());
                builder.build_diurnal(&fitter, target)?
            }
        };

        let reconstructor = SpatialReconstructor::with_params(self.config.spatial_params());
        let (reconstructed, summary) = reconstructor.reconstruct(observed, &baseline)?;

        log::info!("Processing time: {:.2} seconds", start.elapsed().as_secs_f64());
        Ok(ReconstructionOutput {
            reconstructed,
            baseline,
            baseline_summary,
            summary,
        })
    }
}

/// Parse the reconstruction time: `YYYY-MM-DD` (annual) or `YYYY-MM-DD_HHMM` (diurnal, local)
pub fn parse_target_time(mode: TempfillMode, value: &str) -> LstResult<NaiveDateTime> {
    let value = value.trim();
    let parsed = match mode {
        TempfillMode::Annual => NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0)),
        TempfillMode::Diurnal => NaiveDateTime::parse_from_str(value, "%Y-%m-%d_%H%M").ok(),
    };

    parsed.ok_or_else(|| {
        LstError::InvalidTimestamp(format!("'{}' is not a valid {} target time", value, mode))
    })
}

/// Reconstruct a raster from a folder of acquisitions with default settings
#[cfg(feature = "raster-io")]
pub fn reconstruct<P: AsRef<Path>, Q: AsRef<Path>>(
    mode: &str,
    stack_folder: P,
    target_grid_path: Q,
    target_time: &str,
    window_radius: usize,
) -> LstResult<Grid> {
    let mode: TempfillMode = mode.parse()?;
    let config = ReconstructionConfig::with_window_radius(window_radius);
    let output = reconstruct_with_config(&config, mode, stack_folder, target_grid_path, target_time)?;
    Ok(output.reconstructed)
}

/// Reconstruct from files using an explicit configuration
#[cfg(feature = "raster-io")]
pub fn reconstruct_with_config<P: AsRef<Path>, Q: AsRef<Path>>(
    config: &ReconstructionConfig,
    mode: TempfillMode,
    stack_folder: P,
    target_grid_path: Q,
    target_time: &str,
) -> LstResult<ReconstructionOutput> {
    use crate::io::{RasterReader, StackReader};

    config.validate()?;
    let target = parse_target_time(mode, target_time)?;

    let stack = StackReader::load(stack_folder, mode)?;
    let observed = RasterReader::read_grid(target_grid_path, &config.validity_range)?;

    Reconstructor::new(config.clone()).run(mode, &stack, &observed, target)
}

/// Reconstruct and write a GeoTIFF georeferenced like the target raster
#[cfg(feature = "raster-io")]
pub fn reconstruct_to_file<P: AsRef<Path>, Q: AsRef<Path>, R: AsRef<Path>>(
    mode: &str,
    stack_folder: P,
    target_grid_path: Q,
    target_time: &str,
    window_radius: usize,
    output_path: R,
) -> LstResult<ReconstructionSummary> {
    use crate::io::RasterWriter;

    let mode: TempfillMode = mode.parse()?;
    let config = ReconstructionConfig::with_window_radius(window_radius);
    let output = reconstruct_with_config(&config, mode, stack_folder, target_grid_path.as_ref(), target_time)?;

    RasterWriter::write_georeferenced_grid(target_grid_path, &output.reconstructed, output_path)?;
    log::info!("Missing LST pixels reconstructed successfully");
    Ok(output.summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_parse_target_time() {
        let annual = parse_target_time(TempfillMode::Annual, "2022-03-01").unwrap();
        assert_eq!(annual.date(), NaiveDate::from_ymd_opt(2022, 3, 1).unwrap());

        let diurnal = parse_target_time(TempfillMode::Diurnal, "2022-01-06_1000").unwrap();
        assert_eq!(diurnal.hour(), 10);

        assert!(matches!(
            parse_target_time(TempfillMode::Annual, "2022-01-06_1000"),
            Err(LstError::InvalidTimestamp(_))
        ));
        assert!(parse_target_time(TempfillMode::Diurnal, "2022-01-06").is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(ReconstructionConfig::default().validate().is_ok());

        let config = ReconstructionConfig {
            stride: 3,
            ..ReconstructionConfig::default()
        };
        assert!(matches!(config.validate(), Err(LstError::InvalidConfig(_))));

        let config = ReconstructionConfig {
            stride: 3,
            allow_sparse_stride: true,
            ..ReconstructionConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialized_fit_settings_are_checked() {
        let mut config = ReconstructionConfig::default();
        config.diurnal.night_bounds.lower[5] = 30.0;
        assert!(matches!(config.validate(), Err(LstError::InvalidConfig(_))));

        let mut config = ReconstructionConfig::default();
        config.diurnal.utc_offset_hours = 1_000_000_000_000;
        assert!(matches!(config.validate(), Err(LstError::InvalidConfig(_))));

        let mut config = ReconstructionConfig::default();
        config.annual.plausible_range = ValidityRange::new(320.0, 265.0);
        assert!(config.validate().is_err());

        let mut config = ReconstructionConfig::default();
        config.validity_range = ValidityRange::new(f64::NAN, 400.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_config_stops_before_fitting() {
        let timestamps = vec![NaiveDate::from_ymd_opt(2022, 1, 1).unwrap().and_hms_opt(2, 0, 0).unwrap()];
        let stack = RasterStack::new(timestamps, vec![RawGrid::from_elem((2, 2), 290.0)]).unwrap();
        let observed = Grid::from_elem((2, 2), Some(290.0));

        let mut config = ReconstructionConfig::default();
        config.diurnal.utc_offset_hours = i64::MIN;
        let err = Reconstructor::new(config)
            .run(TempfillMode::Diurnal, &stack, &observed, stack.timestamps()[0])
            .unwrap_err();
        assert!(matches!(err, LstError::InvalidConfig(_)));
    }
}
