use crate::types::{LstError, LstResult, TempfillMode};
use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use std::path::{Path, PathBuf};

#[cfg(feature = "raster-io")]
use crate::core::stack::RasterStack;

/// One raster of the acquisition folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackEntry {
    pub path: PathBuf,
    /// Acquisition time encoded in the file name (UTC for diurnal names)
    pub acquired: NaiveDateTime,
}

/// Reads a folder of co-registered rasters into a `RasterStack`
pub struct StackReader;

impl StackReader {
    /// Extract the acquisition time from a raster file name
    ///
    /// Annual names carry `YYYYMMDD` as the 4th underscore-delimited token
    /// (`LC08_L2SP_122044_20220115_02_T1_ST.tif`). Diurnal names carry a UTC
    /// `YYYYMMDD_HHMM` stamp before the extension (`Clip_20221224_1000.tif`).
    pub fn parse_acquisition_time(file_name: &str, mode: TempfillMode) -> LstResult<NaiveDateTime> {
        let stem = Path::new(file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(file_name);

        let invalid = || {
            LstError::InvalidTimestamp(format!(
                "cannot read {} acquisition time from '{}'",
                mode, file_name
            ))
        };

        match mode {
            TempfillMode::Annual => {
                let token = stem.split('_').nth(3).ok_or_else(invalid)?;
                NaiveDate::parse_from_str(token, "%Y%m%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .ok_or_else(invalid)
            }
            TempfillMode::Diurnal => {
                let re = Regex::new(r"(\d{8}_\d{4})")
                    .map_err(|e| LstError::Processing(format!("Invalid timestamp pattern: {}", e)))?;
                let stamp = re
                    .find_iter(stem)
                    .last()
                    .map(|m| m.as_str())
                    .ok_or_else(invalid)?;
                NaiveDateTime::parse_from_str(stamp, "%Y%m%d_%H%M").map_err(|_| invalid())
            }
        }
    }

    /// List GeoTIFF files in `folder`, sorted by acquisition time
    pub fn list<P: AsRef<Path>>(folder: P, mode: TempfillMode) -> LstResult<Vec<StackEntry>> {
        let folder = folder.as_ref();
        log::info!("Scanning {} acquisitions in: {}", mode, folder.display());

        let mut entries = Vec::new();
        for dir_entry in std::fs::read_dir(folder)? {
            let path = dir_entry?.path();
            if !path.is_file() || !is_geotiff(&path) {
                continue;
            }
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| LstError::InvalidTimestamp(format!("non UTF-8 file name: {}", path.display())))?
                .to_string();

            let acquired = Self::parse_acquisition_time(&file_name, mode)?;
            entries.push(StackEntry { path, acquired });
        }

        entries.sort_by(|a, b| a.acquired.cmp(&b.acquired).then_with(|| a.path.cmp(&b.path)));

        if entries.is_empty() {
            return Err(LstError::EmptyStack(format!(
                "no .tif files found in {}",
                folder.display()
            )));
        }

        log::info!("Found {} rasters from {} to {}", entries.len(), entries[0].acquired, entries[entries.len() - 1].acquired);
        Ok(entries)
    }

    /// Load every raster of the folder once, checking that shapes agree
    #[cfg(feature = "raster-io")]
    pub fn load<P: AsRef<Path>>(folder: P, mode: TempfillMode) -> LstResult<RasterStack> {
        use crate::io::raster::RasterReader;

        let entries = Self::list(folder, mode)?;
        let mut timestamps = Vec::with_capacity(entries.len());
        let mut grids = Vec::with_capacity(entries.len());

        for entry in &entries {
            log::debug!("Loading layer {} ({})", entry.path.display(), entry.acquired);
            grids.push(RasterReader::read_raw_grid(&entry.path)?);
            timestamps.push(entry.acquired);
        }

        RasterStack::new(timestamps, grids)
    }
}

fn is_geotiff(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("tif") || e.eq_ignore_ascii_case("tiff"))
        .unwrap_or(false)
}
