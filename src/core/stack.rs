use crate::types::{LstError, LstResult, RawGrid};
use chrono::NaiveDateTime;
use ndarray::{s, Array3, ArrayView2, Axis};
use std::collections::HashMap;

/// In-memory stack of co-registered rasters (time x rows x cols)
#[derive(Debug, Clone)]
pub struct RasterStack {
    timestamps: Vec<NaiveDateTime>,
    data: Array3<f64>,
}

impl RasterStack {
    /// Build a stack from per-layer grids, rejecting mismatched shapes
    pub fn new(timestamps: Vec<NaiveDateTime>, grids: Vec<RawGrid>) -> LstResult<Self> {
        if grids.is_empty() {
            return Err(LstError::EmptyStack("no rasters supplied".to_string()));
        }
        if timestamps.len() != grids.len() {
            return Err(LstError::Processing(format!(
                "{} timestamps supplied for {} rasters",
                timestamps.len(),
                grids.len()
            )));
        }

        let shape = grids[0].dim();
        for (i, grid) in grids.iter().enumerate() {
            if grid.dim() != shape {
                return Err(LstError::InputShape {
                    expected: shape,
                    found: grid.dim(),
                    context: format!("stack layer {} acquired {}", i, timestamps[i]),
                });
            }
        }

        // One layer per acquisition time; a repeated time keeps the later layer
        let mut position: HashMap<NaiveDateTime, usize> = HashMap::with_capacity(timestamps.len());
        let mut kept: Vec<(NaiveDateTime, &RawGrid)> = Vec::with_capacity(timestamps.len());
        for (&acquired, grid) in timestamps.iter().zip(grids.iter()) {
            match position.get(&acquired) {
                Some(&index) => {
                    log::warn!("Duplicate acquisition time {}: keeping the later layer", acquired);
                    kept[index].1 = grid;
                }
                None => {
                    position.insert(acquired, kept.len());
                    kept.push((acquired, grid));
                }
            }
        }

        let (rows, cols) = shape;
        let mut data = Array3::zeros((kept.len(), rows, cols));
        for (mut layer, (_, grid)) in data.axis_iter_mut(Axis(0)).zip(kept.iter()) {
            layer.assign(*grid);
        }

        log::debug!("Raster stack: {} layers of {}x{}", kept.len(), rows, cols);
        Ok(Self {
            timestamps: kept.into_iter().map(|(acquired, _)| acquired).collect(),
            data,
        })
    }

    /// Grid shape shared by every layer
    pub fn shape(&self) -> (usize, usize) {
        let (_, rows, cols) = self.data.dim();
        (rows, cols)
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn timestamps(&self) -> &[NaiveDateTime] {
        &self.timestamps
    }

    pub fn layer(&self, index: usize) -> ArrayView2<'_, f64> {
        self.data.index_axis(Axis(0), index)
    }

    /// Observation series at one coordinate across every layer
    pub fn series_at(&self, row: usize, col: usize) -> Vec<(NaiveDateTime, f64)> {
        self.timestamps
            .iter()
            .copied()
            .zip(self.data.slice(s![.., row, col]).iter().copied())
            .collect()
    }

    /// Ensure another grid can be processed against this stack
    pub fn check_shape(&self, shape: (usize, usize), context: &str) -> LstResult<()> {
        if shape != self.shape() {
            return Err(LstError::InputShape {
                expected: self.shape(),
                found: shape,
                context: context.to_string(),
            });
        }
        Ok(())
    }
}
