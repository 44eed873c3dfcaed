//! canasat-raster - raster compute for Sentinel-2 scene processing
//!
//! Everything here is synchronous and CPU-bound; async callers run it on a
//! blocking pool.
//!
//! - `grid` / `crs` / `reproject`: grid geometry and WGS84 <-> UTM transforms
//! - `raster`: f32 raster with NaN no-data and its deterministic file codec
//! - `resample`: warping onto a reference grid
//! - `radiometry`: digital number to reflectance
//! - `band`: the Sentinel-2 bands the pipeline knows
//! - `indices`: spectral index registry and kernel

pub mod band;
pub mod crs;
pub mod error;
pub mod grid;
pub mod indices;
pub mod radiometry;
pub mod raster;
pub mod reproject;
pub mod resample;

pub use band::Band;
pub use crs::{transform_point, Crs};
pub use error::{RasterError, Result};
pub use grid::{Bounds, GeoTransform, GridSpec};
pub use indices::{IndexDefinition, IndexFormula, IndexRegistry, DEFAULT_MASK_EPSILON};
pub use radiometry::{to_reflectance, Radiometry};
pub use raster::{Raster, RasterStatistics, RasterUnits, RASTER_EXTENSION, RASTER_MAGIC};
pub use resample::{resample_to_grid, ResamplingMethod};
