use crate::types::{BaselineArray, Grid, LstError, LstResult, PixelCoord};
use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// Spatial interpolation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialParams {
    /// Half-width of the square interpolation window
    pub window_radius: usize,
    /// Distance between processed pixels
    pub stride: usize,
    /// Must be set to accept `stride > 1`, which leaves skipped pixels as no-data
    pub allow_sparse_stride: bool,
}

impl Default for SpatialParams {
    fn default() -> Self {
        Self {
            window_radius: 10,
            stride: 1,
            allow_sparse_stride: false,
        }
    }
}

impl SpatialParams {
    pub fn validate(&self) -> LstResult<()> {
        if self.stride == 0 {
            return Err(LstError::InvalidConfig("stride must be at least 1".to_string()));
        }
        if self.stride > 1 && !self.allow_sparse_stride {
            return Err(LstError::InvalidConfig(format!(
                "stride {} skips pixels; set allow_sparse_stride to accept the approximation",
                self.stride
            )));
        }
        Ok(())
    }
}

/// How a single output pixel was obtained
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PixelEstimate {
    /// Valid observation passed through unchanged
    Observed(f64),
    /// Baseline plus weighted residuals of similar neighbors
    Interpolated { value: f64, candidates: usize },
    /// No usable neighbor, the baseline itself is returned
    BaselineFallback(f64),
    /// Neither an observation nor a baseline exists for the pixel
    NoData,
}

impl PixelEstimate {
    pub fn value(&self) -> Option<f64> {
        match *self {
            PixelEstimate::Observed(v) | PixelEstimate::BaselineFallback(v) => Some(v),
            PixelEstimate::Interpolated { value, .. } => Some(value),
            PixelEstimate::NoData => None,
        }
    }
}

/// Per-outcome pixel counts for one reconstruction pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconstructionSummary {
    pub observed: usize,
    pub interpolated: usize,
    pub baseline_fallback: usize,
    pub no_data: usize,
    /// Pixels not visited because of a sparse stride
    pub skipped: usize,
}

impl ReconstructionSummary {
    fn record(&mut self, estimate: &PixelEstimate) {
        match estimate {
            PixelEstimate::Observed(_) => self.observed += 1,
            PixelEstimate::Interpolated { .. } => self.interpolated += 1,
            PixelEstimate::BaselineFallback(_) => self.baseline_fallback += 1,
            PixelEstimate::NoData => self.no_data += 1,
        }
    }
}

/// Moving-window gap filler driven by baseline similarity
pub struct SpatialReconstructor {
    params: SpatialParams,
}

impl SpatialReconstructor {
    /// Dense reconstruction with the given window radius
    pub fn new(window_radius: usize) -> Self {
        Self {
            params: SpatialParams {
                window_radius,
                ..SpatialParams::default()
            },
        }
    }

    pub fn with_params(params: SpatialParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &SpatialParams {
        &self.params
    }

    /// Reconstruct every no-data pixel of `observed` using `baseline`
    pub fn reconstruct(
        &self,
        observed: &Grid,
        baseline: &BaselineArray,
    ) -> LstResult<(Grid, ReconstructionSummary)> {
        self.params.validate()?;
        if observed.dim() != baseline.dim() {
            return Err(LstError::InputShape {
                expected: observed.dim(),
                found: baseline.dim(),
                context: "baseline array".to_string(),
            });
        }

        let (rows, cols) = observed.dim();
        let radius = self.params.window_radius;
        let side = 2 * radius + 1;
        log::info!(
            "Reconstructing {}x{} grid with {}x{} window (stride {})",
            rows, cols, side, side, self.params.stride
        );

        let padded_observed = pad_reflect(observed, radius);
        let padded_baseline = pad_reflect(baseline, radius);

        let stride = self.params.stride;
        let coords: Vec<PixelCoord> = (0..rows)
            .step_by(stride)
            .flat_map(|i| (0..cols).step_by(stride).map(move |j| (i, j)))
            .collect();

        // Padded index (i + radius) is the window center, so the window starts at i
        let estimate_at = |&(i, j): &PixelCoord| -> (PixelCoord, PixelEstimate) {
            let obs_window = padded_observed.slice(s![i..i + side, j..j + side]);
            let base_window = padded_baseline.slice(s![i..i + side, j..j + side]);
            ((i, j), estimate_pixel(obs_window, base_window))
        };

        #[cfg(feature = "parallel")]
        let estimates: Vec<(PixelCoord, PixelEstimate)> = {
            use rayon::prelude::*;
            coords.par_iter().map(estimate_at).collect()
        };

        #[cfg(not(feature = "parallel"))]
        let estimates: Vec<(PixelCoord, PixelEstimate)> = coords.iter().map(estimate_at).collect();

        let mut output = Grid::from_elem((rows, cols), None);
        let mut summary = ReconstructionSummary {
            skipped: rows * cols - coords.len(),
            ..ReconstructionSummary::default()
        };
        for (coord, estimate) in estimates {
            summary.record(&estimate);
            output[coord] = estimate.value();
        }

        log::info!(
            "Reconstruction complete: {} observed, {} interpolated, {} baseline fallback, {} no-data, {} skipped",
            summary.observed,
            summary.interpolated,
            summary.baseline_fallback,
            summary.no_data,
            summary.skipped
        );
        Ok((output, summary))
    }
}

/// Estimate the center pixel of an odd-sized window
pub fn estimate_pixel(observed: ArrayView2<Option<f64>>, baseline: ArrayView2<Option<f64>>) -> PixelEstimate {
    let (wr, wc) = observed.dim();
    let center = (wr / 2, wc / 2);

    if let Some(value) = observed[center] {
        return PixelEstimate::Observed(value);
    }
    let base_center = match baseline[center] {
        Some(b) => b,
        None => return PixelEstimate::NoData,
    };

    match weighted_residuals(observed, baseline, base_center) {
        Ok(weighted) => {
            let correction: f64 = weighted.iter().map(|(residual, weight)| residual * weight).sum();
            PixelEstimate::Interpolated {
                value: base_center + correction,
                candidates: weighted.len(),
            }
        }
        Err(_) => PixelEstimate::BaselineFallback(base_center),
    }
}

/// Normalized `(residual, weight)` pairs of the candidates that carry weight
fn weighted_residuals(
    observed: ArrayView2<Option<f64>>,
    baseline: ArrayView2<Option<f64>>,
    base_center: f64,
) -> LstResult<Vec<(f64, f64)>> {
    let (wr, wc) = baseline.dim();
    let (ci, cj) = ((wr / 2) as f64, (wc / 2) as f64);
    let window_span = wr.max(wc) as f64;

    // Similarity radius from the baseline spread inside the window
    let values: Vec<f64> = baseline.iter().flatten().copied().collect();
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    let similarity_radius = 0.5 * variance.sqrt();

    let mut weighted = Vec::new();
    for ((i, j), base) in baseline.indexed_iter() {
        let base = match base {
            Some(b) => *b,
            None => continue,
        };
        let d2 = (base - base_center).abs();
        if d2 > similarity_radius {
            continue;
        }
        let obs = match observed[[i, j]] {
            Some(v) => v,
            None => continue,
        };
        // identical baselines make ln(1 + D2) zero
        if d2 == 0.0 {
            continue;
        }

        let distance = ((i as f64 - ci).powi(2) + (j as f64 - cj).powi(2)).sqrt();
        let d1 = 1.0 + 2.0 * distance / window_span;
        weighted.push((obs - base, 1.0 / (d1 * (1.0 + d2).ln())));
    }

    let weight_sum: f64 = weighted.iter().map(|(_, w)| w).sum();
    if weighted.is_empty() || weight_sum == 0.0 || !weight_sum.is_finite() {
        return Err(LstError::NoCandidateNeighbors);
    }

    for (_, w) in weighted.iter_mut() {
        *w /= weight_sum;
    }
    Ok(weighted)
}

/// Pad a grid by `pad` cells on every side, mirroring about the edge cells
pub fn pad_reflect<T: Clone>(grid: &Array2<T>, pad: usize) -> Array2<T> {
    let (rows, cols) = grid.dim();
    if rows == 0 || cols == 0 || pad == 0 {
        return grid.clone();
    }

    Array2::from_shape_fn((rows + 2 * pad, cols + 2 * pad), |(i, j)| {
        let src_i = reflect_index(i as isize - pad as isize, rows);
        let src_j = reflect_index(j as isize - pad as isize, cols);
        grid[[src_i, src_j]].clone()
    })
}

/// Map an out-of-range index back into `0..n` by repeated reflection
fn reflect_index(index: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let period = 2 * (n as isize - 1);
    let m = index.rem_euclid(period);
    if m >= n as isize {
        (period - m) as usize
    } else {
        m as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    fn grid_from(values: &Array2<f64>) -> Grid {
        values.mapv(Some)
    }

    #[test]
    fn test_reflect_index_matches_numpy_reflect() {
        // np.pad(np.arange(4), 5, 'reflect')
        let expected = [1, 2, 3, 2, 1, 0, 1, 2, 3, 2, 1, 0, 1, 2];
        for (k, &want) in expected.iter().enumerate() {
            assert_eq!(reflect_index(k as isize - 5, 4), want);
        }
        assert_eq!(reflect_index(-3, 1), 0);
    }

    #[test]
    fn test_pad_reflect_mirrors_without_new_extrema() {
        let grid = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let padded = pad_reflect(&grid, 1);

        assert_eq!(padded.dim(), (4, 5));
        assert_eq!(padded.row(0).to_vec(), vec![5.0, 4.0, 5.0, 6.0, 5.0]);
        assert_eq!(padded.row(1).to_vec(), vec![2.0, 1.0, 2.0, 3.0, 2.0]);

        let max = padded.iter().cloned().fold(f64::MIN, f64::max);
        let min = padded.iter().cloned().fold(f64::MAX, f64::min);
        assert_eq!((min, max), (1.0, 6.0));
    }

    #[test]
    fn test_constant_baseline_falls_back_to_baseline() {
        let mut observed = Grid::from_elem((5, 5), Some(300.0));
        observed[[2, 2]] = None;
        let baseline = Grid::from_elem((5, 5), Some(290.0));

        for radius in [1, 2] {
            let (output, summary) = SpatialReconstructor::new(radius)
                .reconstruct(&observed, &baseline)
                .unwrap();
            assert_eq!(output[[2, 2]], Some(290.0));
            assert_eq!(summary.baseline_fallback, 1);
            assert_eq!(summary.observed, 24);
        }
    }

    #[test]
    fn test_valid_pixels_pass_through() {
        let raw = Array2::from_shape_fn((6, 7), |(i, j)| 280.0 + (i * 7 + j) as f64 * 0.37);
        let mut observed = grid_from(&raw);
        observed[[0, 3]] = None;
        observed[[4, 4]] = None;
        let baseline = Grid::from_shape_fn((6, 7), |(i, j)| Some(279.0 + (i + 2 * j) as f64 * 0.5));

        let (output, _) = SpatialReconstructor::new(2).reconstruct(&observed, &baseline).unwrap();

        assert_eq!(output.dim(), observed.dim());
        for ((i, j), value) in observed.indexed_iter() {
            if value.is_some() {
                assert_eq!(output[[i, j]], *value);
            } else {
                assert!(output[[i, j]].is_some());
            }
        }
    }

    #[test]
    fn test_weights_are_normalized_and_estimate_is_bounded() {
        let observed = array![
            [Some(301.0), Some(303.5), Some(299.0)],
            [Some(302.0), None, Some(298.0)],
            [Some(300.0), Some(304.0), Some(297.5)]
        ];
        let baseline = array![
            [Some(299.0), Some(300.5), Some(301.0)],
            [Some(300.2), Some(300.0), Some(302.0)],
            [Some(299.5), Some(300.1), Some(303.0)]
        ];

        let weighted = weighted_residuals(observed.view(), baseline.view(), 300.0).unwrap();
        let total: f64 = weighted.iter().map(|(_, w)| w).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-12);

        let residuals: Vec<f64> = weighted.iter().map(|(r, _)| *r).collect();
        let lo = residuals.iter().cloned().fold(f64::MAX, f64::min);
        let hi = residuals.iter().cloned().fold(f64::MIN, f64::max);

        match estimate_pixel(observed.view(), baseline.view()) {
            PixelEstimate::Interpolated { value, candidates } => {
                assert_eq!(candidates, weighted.len());
                assert!(value >= 300.0 + lo - 1e-9 && value <= 300.0 + hi + 1e-9);
            }
            other => panic!("expected interpolation, got {:?}", other),
        }
    }

    #[test]
    fn test_closer_neighbors_weigh_more() {
        // equal baseline offsets, one neighbor adjacent and one in the corner
        let mut observed = Grid::from_elem((5, 5), None);
        observed[[2, 3]] = Some(310.0);
        observed[[0, 0]] = Some(290.0);
        let mut baseline = Grid::from_elem((5, 5), Some(300.0));
        baseline[[2, 3]] = Some(300.4);
        baseline[[0, 0]] = Some(300.4);
        // a warm bottom row widens the similarity radius to about 2 K
        baseline.row_mut(4).fill(Some(310.0));

        let weighted = weighted_residuals(observed.view(), baseline.view(), 300.0).unwrap();
        assert_eq!(weighted.len(), 2);
        let near = weighted.iter().find(|(r, _)| *r > 0.0).unwrap().1;
        let far = weighted.iter().find(|(r, _)| *r < 0.0).unwrap().1;
        assert!(near > far);
    }

    #[test]
    fn test_missing_center_baseline_is_no_data() {
        let mut observed = Grid::from_elem((3, 3), Some(300.0));
        observed[[1, 1]] = None;
        let mut baseline = Grid::from_elem((3, 3), Some(299.0));
        baseline[[1, 1]] = None;

        assert_eq!(estimate_pixel(observed.view(), baseline.view()), PixelEstimate::NoData);
    }

    #[test]
    fn test_sparse_stride_requires_opt_in() {
        let observed = Grid::from_elem((4, 4), None);
        let baseline = Grid::from_elem((4, 4), Some(290.0));

        let strict = SpatialReconstructor::with_params(SpatialParams {
            window_radius: 1,
            stride: 2,
            allow_sparse_stride: false,
        });
        assert!(matches!(
            strict.reconstruct(&observed, &baseline),
            Err(LstError::InvalidConfig(_))
        ));

        let sparse = SpatialReconstructor::with_params(SpatialParams {
            window_radius: 1,
            stride: 2,
            allow_sparse_stride: true,
        });
        let (output, summary) = sparse.reconstruct(&observed, &baseline).unwrap();
        assert_eq!(summary.skipped, 12);
        assert_eq!(output[[0, 0]], Some(290.0));
        assert_eq!(output[[0, 1]], None);
    }

    #[test]
    fn test_shape_preserved_for_radius_larger_than_grid() {
        let mut observed = Grid::from_elem((2, 3), Some(300.0));
        observed[[1, 2]] = None;
        let baseline = Grid::from_shape_fn((2, 3), |(i, j)| Some(298.0 + (i + j) as f64));

        let (output, _) = SpatialReconstructor::new(4).reconstruct(&observed, &baseline).unwrap();
        assert_eq!(output.dim(), (2, 3));
        assert!(output[[1, 2]].is_some());
    }

    #[test]
    fn test_mismatched_baseline_shape() {
        let observed = Grid::from_elem((3, 3), Some(300.0));
        let baseline = Grid::from_elem((3, 4), Some(300.0));
        assert!(matches!(
            SpatialReconstructor::new(1).reconstruct(&observed, &baseline),
            Err(LstError::InputShape { .. })
        ));
    }
}
