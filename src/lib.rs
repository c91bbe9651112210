//! tempfill: spatiotemporal gap-filling of Land Surface Temperature rasters
//!
//! Missing pixels of a target LST raster are reconstructed from a stack of
//! co-registered acquisitions. A temporal cycle model (annual or diurnal) is
//! fitted per pixel to build a baseline, and the residual between observation
//! and baseline is interpolated from similar neighbours.

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    BaselineArray, GeoTransform, Grid, LstError, LstResult, PixelCoord, RawGrid, TempfillMode,
    ValidityRange,
};

pub use core::{
    AccuracyReport, AnnualFitter, DiurnalFitter, RasterStack, ReconstructionConfig,
    ReconstructionOutput, Reconstructor, SpatialReconstructor,
};

#[cfg(feature = "raster-io")]
pub use core::{reconstruct, reconstruct_to_file, reconstruct_with_config};

pub use io::{StackEntry, StackReader};

#[cfg(feature = "raster-io")]
pub use io::{RasterReader, RasterWriter};

#[cfg(feature = "python")]
mod python {
    use crate::core::SpatialReconstructor;
    use crate::types::LstError;
    use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
    use pyo3::prelude::*;

    fn to_py_err(err: LstError) -> PyErr {
        match err {
            LstError::InvalidMode(_)
            | LstError::InvalidConfig(_)
            | LstError::InvalidTimestamp(_)
            | LstError::InputShape { .. } => {
                PyErr::new::<pyo3::exceptions::PyValueError, _>(format!("{}", err))
            }
            LstError::Io(_) => PyErr::new::<pyo3::exceptions::PyIOError, _>(format!("{}", err)),
            _ => PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", err)),
        }
    }

    /// Fill NaN pixels of `observed` from a precomputed baseline (NaN = no-data)
    #[pyfunction]
    #[pyo3(signature = (observed, baseline, window_radius = 10))]
    fn reconstruct_arrays<'py>(
        py: Python<'py>,
        observed: PyReadonlyArray2<f64>,
        baseline: PyReadonlyArray2<f64>,
        window_radius: usize,
    ) -> PyResult<&'py PyArray2<f64>> {
        let to_grid = |v: &f64| if v.is_finite() { Some(*v) } else { None };
        let observed = observed.as_array().map(to_grid);
        let baseline = baseline.as_array().map(to_grid);

        let (filled, _) = py
            .allow_threads(|| SpatialReconstructor::new(window_radius).reconstruct(&observed, &baseline))
            .map_err(to_py_err)?;

        Ok(filled.map(|v| v.unwrap_or(f64::NAN)).into_pyarray(py))
    }

    /// Reconstruct `target_grid_path` from the rasters in `stack_folder`
    ///
    /// Returns the reconstructed grid with NaN for no-data, and writes a
    /// GeoTIFF when `output_path` is given.
    #[cfg(feature = "raster-io")]
    #[pyfunction]
    #[pyo3(signature = (mode, stack_folder, target_grid_path, target_time, window_radius = 10, output_path = None))]
    fn reconstruct<'py>(
        py: Python<'py>,
        mode: &str,
        stack_folder: String,
        target_grid_path: String,
        target_time: String,
        window_radius: usize,
        output_path: Option<String>,
    ) -> PyResult<&'py PyArray2<f64>> {
        let mode: crate::types::TempfillMode = mode.parse().map_err(to_py_err)?;
        let config = crate::core::ReconstructionConfig::with_window_radius(window_radius);

        let output = py
            .allow_threads(|| {
                crate::core::reconstruct_with_config(&config, mode, &stack_folder, &target_grid_path, &target_time)
            })
            .map_err(to_py_err)?;

        if let Some(path) = output_path {
            crate::io::RasterWriter::write_georeferenced_grid(&target_grid_path, &output.reconstructed, path)
                .map_err(to_py_err)?;
        }

        Ok(output.reconstructed.map(|v| v.unwrap_or(f64::NAN)).into_pyarray(py))
    }

    /// Python module definition
    #[pymodule]
    fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_function(wrap_pyfunction!(reconstruct_arrays, m)?)?;
        #[cfg(feature = "raster-io")]
        m.add_function(wrap_pyfunction!(reconstruct, m)?)?;
        Ok(())
    }
}
