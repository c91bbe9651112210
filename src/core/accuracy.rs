use crate::types::{Grid, LstError, LstResult};
use serde::{Deserialize, Serialize};

/// Agreement between a reconstructed grid and a reference grid
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccuracyReport {
    pub rmse: f64,
    pub mae: f64,
    /// Undefined when the reference has no variance
    pub r_squared: Option<f64>,
    /// Pixels valid in both grids
    pub pixel_count: usize,
}

impl AccuracyReport {
    /// Compare `predicted` against `truth` over pixels valid in both
    pub fn compare(truth: &Grid, predicted: &Grid) -> LstResult<Self> {
        if truth.dim() != predicted.dim() {
            return Err(LstError::InputShape {
                expected: truth.dim(),
                found: predicted.dim(),
                context: "predicted grid".to_string(),
            });
        }

        let pairs: Vec<(f64, f64)> = truth
            .iter()
            .zip(predicted.iter())
            .filter_map(|(t, p)| Some(((*t)?, (*p)?)))
            .collect();

        if pairs.is_empty() {
            return Err(LstError::Processing(
                "No pixels are valid in both grids".to_string(),
            ));
        }

        let n = pairs.len() as f64;
        let truth_mean = pairs.iter().map(|(t, _)| t).sum::<f64>() / n;
        let ss_res: f64 = pairs.iter().map(|(t, p)| (t - p) * (t - p)).sum();
        let ss_tot: f64 = pairs.iter().map(|(t, _)| (t - truth_mean) * (t - truth_mean)).sum();
        let abs_err: f64 = pairs.iter().map(|(t, p)| (t - p).abs()).sum();

        let report = Self {
            rmse: (ss_res / n).sqrt(),
            mae: abs_err / n,
            r_squared: if ss_tot > 0.0 { Some(1.0 - ss_res / ss_tot) } else { None },
            pixel_count: pairs.len(),
        };

        log::info!(
            "Accuracy over {} pixels: RMSE {:.4}, MAE {:.4}, R² {}",
            report.pixel_count,
            report.rmse,
            report.mae,
            report
                .r_squared
                .map(|r| format!("{:.4}", r))
                .unwrap_or_else(|| "n/a".to_string())
        );
        Ok(report)
    }
}
