//! Warp rasters onto a target grid.
//!
//! Sources coarser than (or as fine as) the target are point-sampled at each
//! target pixel centre, transformed into the source CRS when they differ.
//! Sources strictly finer than the target in the same CRS are area-averaged.

use crate::crs::transform_point;
use crate::error::{RasterError, Result};
use crate::grid::GridSpec;
use crate::raster::Raster;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingMethod {
    Nearest,
    #[default]
    Bilinear,
}

impl ResamplingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResamplingMethod::Nearest => "nearest",
            ResamplingMethod::Bilinear => "bilinear",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nearest" => Ok(ResamplingMethod::Nearest),
            "bilinear" => Ok(ResamplingMethod::Bilinear),
            other => Err(RasterError::invalid_parameter(format!(
                "unknown resampling method '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ResamplingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Resample `src` onto `target`, keeping its units.
pub fn resample_to_grid(src: &Raster, target: &GridSpec, method: ResamplingMethod) -> Result<Raster> {
    if src.grid().matches(target) {
        return Raster::new(*target, src.units(), src.data().to_vec());
    }

    let finer = src.grid().crs == target.crs
        && src.grid().coarsest_resolution() < target.coarsest_resolution() * (1.0 - 1e-9);

    let mut data = vec![f32::NAN; target.len()];
    data.par_chunks_mut(target.width)
        .enumerate()
        .for_each(|(row, out)| {
            for (col, px) in out.iter_mut().enumerate() {
                *px = if finer {
                    area_average(src, target, col, row)
                } else {
                    point_sample(src, target, col, row, method)
                };
            }
        });

    Raster::new(*target, src.units(), data)
}

fn point_sample(src: &Raster, target: &GridSpec, col: usize, row: usize, method: ResamplingMethod) -> f32 {
    let (x, y) = target.transform.pixel_to_geo(col, row);
    let (sx, sy) = transform_point(target.crs, src.grid().crs, x, y);
    let (fc, fr) = src.grid().transform.geo_to_pixel(sx, sy);

    let w = src.width() as f64;
    let h = src.height() as f64;
    if !(fc >= 0.0 && fc < w && fr >= 0.0 && fr < h) {
        return f32::NAN;
    }

    match method {
        ResamplingMethod::Nearest => src
            .get(fc.floor() as usize, fr.floor() as usize)
            .unwrap_or(f32::NAN),
        ResamplingMethod::Bilinear => bilinear(src, fc - 0.5, fr - 0.5),
    }
}

/// Bilinear interpolation in centre-based pixel space, edges replicated.
/// NaN neighbours are dropped and the remaining weights renormalised.
fn bilinear(src: &Raster, u: f64, v: f64) -> f32 {
    let max_c = src.width() as i64 - 1;
    let max_r = src.height() as i64 - 1;
    let c0 = u.floor();
    let r0 = v.floor();
    let dx = u - c0;
    let dy = v - r0;
    let c0 = c0 as i64;
    let r0 = r0 as i64;

    let taps = [
        (c0, r0, (1.0 - dx) * (1.0 - dy)),
        (c0 + 1, r0, dx * (1.0 - dy)),
        (c0, r0 + 1, (1.0 - dx) * dy),
        (c0 + 1, r0 + 1, dx * dy),
    ];

    let mut sum = 0.0f64;
    let mut weight = 0.0f64;
    for (c, r, wgt) in taps {
        if wgt <= 0.0 {
            continue;
        }
        let c = c.clamp(0, max_c) as usize;
        let r = r.clamp(0, max_r) as usize;
        if let Some(value) = src.get(c, r).filter(|v| !v.is_nan()) {
            sum += value as f64 * wgt;
            weight += wgt;
        }
    }
    if weight > 0.0 {
        (sum / weight) as f32
    } else {
        f32::NAN
    }
}

/// Mean of the valid source pixels whose centres fall inside the target cell.
fn area_average(src: &Raster, target: &GridSpec, col: usize, row: usize) -> f32 {
    let t = &target.transform;
    let x0 = t.origin_x + col as f64 * t.pixel_width;
    let x1 = x0 + t.pixel_width;
    let y0 = t.origin_y + row as f64 * t.pixel_height;
    let y1 = y0 + t.pixel_height;

    let st = &src.grid().transform;
    let (ca, ra) = st.geo_to_pixel(x0, y0);
    let (cb, rb) = st.geo_to_pixel(x1, y1);

    // Centres at i + 0.5 inside [lo, hi)
    let span = |a: f64, b: f64, len: usize| {
        let lo = a.min(b);
        let hi = a.max(b);
        let first = (lo - 0.5).ceil().max(0.0) as usize;
        let last = ((hi - 0.5).ceil() as i64).clamp(0, len as i64) as usize;
        first..last
    };

    let mut sum = 0.0f64;
    let mut count = 0usize;
    for r in span(ra, rb, src.height()) {
        for c in span(ca, cb, src.width()) {
            if let Some(v) = src.get(c, r).filter(|v| !v.is_nan()) {
                sum += v as f64;
                count += 1;
            }
        }
    }
    if count > 0 {
        (sum / count as f64) as f32
    } else {
        f32::NAN
    }
}
