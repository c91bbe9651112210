//! Raster and acquisition-folder I/O

pub mod stack_reader;
#[cfg(feature = "raster-io")]
pub mod raster;

pub use stack_reader::{StackEntry, StackReader};
#[cfg(feature = "raster-io")]
pub use raster::{RasterInfo, RasterReader, RasterWriter};
