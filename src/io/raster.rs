use crate::types::{GeoTransform, Grid, LstError, LstResult, RawGrid, ValidityRange};
use gdal::raster::Buffer;
use gdal::{Dataset, DriverManager};
use ndarray::Array2;
use std::path::Path;

/// Grid definition of a raster on disk
#[derive(Debug, Clone)]
pub struct RasterInfo {
    pub width: usize,
    pub height: usize,
    pub geo_transform: GeoTransform,
    /// Projection as WKT (empty when the raster is not georeferenced)
    pub projection: String,
}

/// Single-band LST raster reader
pub struct RasterReader;

impl RasterReader {
    /// Read size, geotransform and projection
    pub fn read_info<P: AsRef<Path>>(path: P) -> LstResult<RasterInfo> {
        let dataset = Dataset::open(path.as_ref())?;
        let (width, height) = dataset.raster_size();
        let geo_transform = GeoTransform::from_gdal(dataset.geo_transform()?);

        Ok(RasterInfo {
            width,
            height,
            geo_transform,
            projection: dataset.projection(),
        })
    }

    /// Read band 1 as raw values
    pub fn read_raw_grid<P: AsRef<Path>>(path: P) -> LstResult<RawGrid> {
        log::debug!("Reading raster: {}", path.as_ref().display());

        let dataset = Dataset::open(path.as_ref())?;
        let (width, height) = dataset.raster_size();

        let rasterband = dataset.rasterband(1)?;
        let band_data = rasterband.read_as::<f64>((0, 0), (width, height), (width, height), None)?;

        Array2::from_shape_vec((height, width), band_data.data)
            .map_err(|e| LstError::Processing(format!("Failed to reshape raster data: {}", e)))
    }

    /// Read band 1 and mark values outside `range` as no-data
    pub fn read_grid<P: AsRef<Path>>(path: P, range: &ValidityRange) -> LstResult<Grid> {
        log::info!("Reading target raster: {}", path.as_ref().display());
        let raw = Self::read_raw_grid(path)?;
        Ok(range.normalize(&raw))
    }
}

/// GeoTIFF writer for reconstructed grids
pub struct RasterWriter;

impl RasterWriter {
    /// Write `grid` with the geotransform and projection of `reference_path`
    ///
    /// No-data cells are written as NaN, which is also set as the band's
    /// no-data value.
    pub fn write_georeferenced_grid<P: AsRef<Path>, Q: AsRef<Path>>(
        reference_path: P,
        grid: &Grid,
        output_path: Q,
    ) -> LstResult<()> {
        log::info!("Saving reconstructed raster as GeoTIFF: {}", output_path.as_ref().display());

        let info = RasterReader::read_info(reference_path.as_ref())?;
        let (height, width) = grid.dim();
        if (height, width) != (info.height, info.width) {
            return Err(LstError::InputShape {
                expected: (info.height, info.width),
                found: (height, width),
                context: format!("reference raster {}", reference_path.as_ref().display()),
            });
        }

        Self::write_grid(grid, &info.geo_transform, &info.projection, output_path)
    }

    /// Write `grid` with an explicit grid definition
    pub fn write_grid<P: AsRef<Path>>(
        grid: &Grid,
        transform: &GeoTransform,
        projection: &str,
        output_path: P,
    ) -> LstResult<()> {
        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let (height, width) = grid.dim();

        let mut dataset = driver.create_with_band_type::<f64, _>(
            output_path.as_ref(),
            width as isize,
            height as isize,
            1,
        )?;

        dataset.set_geo_transform(&transform.to_gdal())?;
        if !projection.is_empty() {
            dataset.set_projection(projection)?;
        }

        let mut rasterband = dataset.rasterband(1)?;
        let flat_data: Vec<f64> = grid.iter().map(|v| v.unwrap_or(f64::NAN)).collect();
        let buffer = Buffer::new((width, height), flat_data);
        rasterband.write((0, 0), (width, height), &buffer)?;
        rasterband.set_no_data_value(Some(f64::NAN))?;

        log::info!("GeoTIFF saved successfully");
        Ok(())
    }
}
