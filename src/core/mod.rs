//! Core reconstruction modules

pub mod stack;
pub mod missing;
pub mod fitting;
pub mod annual;
pub mod diurnal;
pub mod baseline;
pub mod reconstruct;
pub mod pipeline;
pub mod accuracy;

// Re-export main types
pub use stack::RasterStack;
pub use missing::{MissingPixelLocator, MissingSet};
pub use fitting::{curve_fit, CycleModel, FitOutcome, ParameterBounds, SolverOptions, TemporalBaselineFitter};
pub use annual::{AnnualCycle, AnnualFitParams, AnnualFitter};
pub use diurnal::{DaytimeCycle, DiurnalFitParams, DiurnalFitter, DiurnalPhase, NighttimeCycle};
pub use baseline::{BaselineArrayBuilder, BaselineSummary};
pub use reconstruct::{estimate_pixel, pad_reflect, PixelEstimate, ReconstructionSummary, SpatialParams, SpatialReconstructor};
pub use pipeline::{parse_target_time, ReconstructionConfig, ReconstructionOutput, Reconstructor};
pub use accuracy::AccuracyReport;

#[cfg(feature = "raster-io")]
pub use pipeline::{reconstruct, reconstruct_to_file, reconstruct_with_config};
