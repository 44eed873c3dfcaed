//! Digital number to surface reflectance conversion

use crate::error::{RasterError, Result};
use crate::raster::{Raster, RasterUnits};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Per-band radiometric scaling taken from product metadata.
///
/// `reflectance = (dn + offset) / quantification`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Radiometry {
    pub quantification: f64,
    pub offset: f64,
    /// DN marking missing data; defaults to 0 for Sentinel-2 L2A.
    pub nodata_dn: Option<f32>,
}

impl Radiometry {
    pub fn new(quantification: f64, offset: f64) -> Result<Self> {
        if !(quantification.is_finite() && quantification > 0.0) {
            return Err(RasterError::invalid_parameter(format!(
                "quantification value must be positive, got {}",
                quantification
            )));
        }
        if !offset.is_finite() {
            return Err(RasterError::invalid_parameter("offset must be finite"));
        }
        Ok(Self {
            quantification,
            offset,
            nodata_dn: Some(0.0),
        })
    }

    pub fn with_nodata(mut self, nodata_dn: Option<f32>) -> Self {
        self.nodata_dn = nodata_dn;
        self
    }

    /// Stable textual form used in cache fingerprints.
    pub fn cache_descriptor(&self) -> String {
        match self.nodata_dn {
            Some(nd) => format!("q={}:o={}:nd={}", self.quantification, self.offset, nd),
            None => format!("q={}:o={}:nd=none", self.quantification, self.offset),
        }
    }
}

impl Default for Radiometry {
    /// Sentinel-2 L2A before processing baseline 04.00.
    fn default() -> Self {
        Self {
            quantification: 10_000.0,
            offset: 0.0,
            nodata_dn: Some(0.0),
        }
    }
}

/// Convert a raster to reflectance.
///
/// Rasters already in reflectance pass through unchanged. Index rasters
/// are rejected.
pub fn to_reflectance(raster: Raster, radiometry: &Radiometry) -> Result<Raster> {
    match raster.units() {
        RasterUnits::Reflectance => Ok(raster),
        RasterUnits::Index => Err(RasterError::invalid_parameter(
            "index rasters have no reflectance",
        )),
        RasterUnits::DigitalNumber => {
            let grid = *raster.grid();
            let q = radiometry.quantification;
            let offset = radiometry.offset;
            let nodata = radiometry.nodata_dn;
            let mut data = raster.into_data();
            data.par_iter_mut().for_each(|v| {
                *v = if v.is_nan() || nodata == Some(*v) {
                    f32::NAN
                } else {
                    ((*v as f64 + offset) / q) as f32
                };
            });
            Raster::new(grid, RasterUnits::Reflectance, data)
        }
    }
}
