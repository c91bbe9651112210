use crate::types::{Grid, PixelCoord};
use ndarray::Array2;

/// Missing pixels and the window region that must be reconstructed around them
#[derive(Debug, Clone, Default)]
pub struct MissingSet {
    /// Pixels without a valid observation
    pub missing: Vec<PixelCoord>,
    /// Union of the square windows around every missing pixel, row-major order
    pub active: Vec<PixelCoord>,
}

impl MissingSet {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Locates no-data pixels in a normalized grid
pub struct MissingPixelLocator {
    window_radius: usize,
}

impl MissingPixelLocator {
    pub fn new(window_radius: usize) -> Self {
        Self { window_radius }
    }

    /// Find no-data pixels and dilate them by the window radius
    pub fn locate(&self, grid: &Grid) -> MissingSet {
        let (rows, cols) = grid.dim();
        let r = self.window_radius;
        let mut active_mask = Array2::from_elem((rows, cols), false);
        let mut missing = Vec::new();

        for ((i, j), value) in grid.indexed_iter() {
            if value.is_some() {
                continue;
            }
            missing.push((i, j));

            let row_end = (i + r + 1).min(rows);
            let col_end = (j + r + 1).min(cols);
            for x in i.saturating_sub(r)..row_end {
                for y in j.saturating_sub(r)..col_end {
                    active_mask[[x, y]] = true;
                }
            }
        }

        let active: Vec<PixelCoord> = active_mask
            .indexed_iter()
            .filter(|(_, flag)| **flag)
            .map(|(idx, _)| idx)
            .collect();

        log::info!(
            "Found {} missing pixels ({:.2}%), {} pixels in active windows",
            missing.len(),
            (missing.len() as f64 / (rows * cols).max(1) as f64) * 100.0,
            active.len()
        );

        MissingSet { missing, active }
    }
}
