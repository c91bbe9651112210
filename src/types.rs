use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Temperature grid where `None` marks a no-data cell
pub type Grid = Array2<Option<f64>>;

/// Raster values exactly as read from storage
pub type RawGrid = Array2<f64>;

/// Model-predicted baseline temperatures (same shape as the observed grid)
pub type BaselineArray = Grid;

/// Pixel coordinate as (row, col)
pub type PixelCoord = (usize, usize);

/// Temporal cycle used to build the baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TempfillMode {
    /// Annual temperature cycle over day-of-year
    Annual,
    /// Diurnal temperature cycle over hour-of-day
    Diurnal,
}

impl std::fmt::Display for TempfillMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TempfillMode::Annual => write!(f, "annual"),
            TempfillMode::Diurnal => write!(f, "diurnal"),
        }
    }
}

impl FromStr for TempfillMode {
    type Err = LstError;

    fn from_str(s: &str) -> LstResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "annual" => Ok(TempfillMode::Annual),
            "diurnal" => Ok(TempfillMode::Diurnal),
            _ => Err(LstError::InvalidMode(s.to_string())),
        }
    }
}

/// Inclusive range of physically plausible temperature values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidityRange {
    pub min: f64,
    pub max: f64,
}

impl ValidityRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Check whether a raw value is a trusted observation
    pub fn contains(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }

    /// Replace out-of-range and non-finite values with no-data
    pub fn normalize(&self, raw: &RawGrid) -> Grid {
        raw.mapv(|v| if self.contains(v) { Some(v) } else { None })
    }
}

impl Default for ValidityRange {
    fn default() -> Self {
        // Kelvin window applied to every observed raster
        Self::new(200.0, 400.0)
    }
}

/// Geospatial transformation parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }
}

/// Error types for LST reconstruction
#[derive(Debug, thiserror::Error)]
pub enum LstError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(String),

    #[error("Input shape mismatch: expected {expected:?}, found {found:?} ({context})")]
    InputShape {
        expected: (usize, usize),
        found: (usize, usize),
        context: String,
    },

    #[error("Raster stack is empty: {0}")]
    EmptyStack(String),

    #[error("Underdetermined fit: {available} valid observations for {required} free parameters")]
    UnderdeterminedFit { required: usize, available: usize },

    #[error("Fit did not converge: {0}")]
    NonConvergentFit(String),

    #[error("No candidate neighbors inside the window")]
    NoCandidateNeighbors,

    #[error("Invalid tempfill mode '{0}': supported values are 'annual' or 'diurnal'")]
    InvalidMode(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Processing cancelled: {0}")]
    Cancelled(String),

    #[error("Processing error: {0}")]
    Processing(String),
}

impl LstError {
    /// Per-pixel failures that are recorded as no-data instead of aborting a run
    pub fn is_pixel_level(&self) -> bool {
        matches!(
            self,
            LstError::UnderdeterminedFit { .. }
                | LstError::NonConvergentFit(_)
                | LstError::NoCandidateNeighbors
        )
    }
}

#[cfg(feature = "raster-io")]
impl From<gdal::errors::GdalError> for LstError {
    fn from(err: gdal::errors::GdalError) -> Self {
        LstError::Gdal(err.to_string())
    }
}

/// Result type for LST operations
pub type LstResult<T> = Result<T, LstError>;

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("annual".parse::<TempfillMode>().unwrap(), TempfillMode::Annual);
        assert_eq!(" Diurnal ".parse::<TempfillMode>().unwrap(), TempfillMode::Diurnal);

        let err = "weekly".parse::<TempfillMode>().unwrap_err();
        assert!(matches!(err, LstError::InvalidMode(ref m) if m == "weekly"));
    }

    #[test]
    fn test_validity_normalization() {
        let range = ValidityRange::default();
        let raw = array![[199.9, 200.0], [f64::NAN, 400.1]];
        let grid = range.normalize(&raw);

        assert_eq!(grid[[0, 0]], None);
        assert_eq!(grid[[0, 1]], Some(200.0));
        assert_eq!(grid[[1, 0]], None);
        assert_eq!(grid[[1, 1]], None);
    }

    #[test]
    fn test_pixel_level_errors() {
        assert!(LstError::UnderdeterminedFit { required: 4, available: 1 }.is_pixel_level());
        assert!(LstError::NonConvergentFit("x".into()).is_pixel_level());
        assert!(!LstError::InvalidMode("x".into()).is_pixel_level());
        assert!(!LstError::Cancelled("x".into()).is_pixel_level());
    }
}
