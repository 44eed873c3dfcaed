//! Grid geometry: affine transform, bounds and the full grid specification
//! every raster carries.

use crate::crs::{transform_point, Crs};
use crate::error::{RasterError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Relative tolerance when comparing grid coefficients.
const GRID_TOLERANCE: f64 = 1e-6;

/// North-up affine transform.
///
/// ```text
/// x = origin_x + col * pixel_width
/// y = origin_y + row * pixel_height   (pixel_height < 0)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    /// X of the upper-left corner
    pub origin_x: f64,
    /// Y of the upper-left corner
    pub origin_y: f64,
    pub pixel_width: f64,
    /// Usually negative
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn new(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            origin_x,
            origin_y,
            pixel_width,
            pixel_height,
        }
    }

    /// Square-pixel north-up transform anchored at the upper-left corner.
    pub fn north_up(origin_x: f64, origin_y: f64, resolution: f64) -> Self {
        Self::new(origin_x, origin_y, resolution, -resolution)
    }

    /// Geographic coordinates of a pixel centre.
    pub fn pixel_to_geo(&self, col: usize, row: usize) -> (f64, f64) {
        (
            self.origin_x + (col as f64 + 0.5) * self.pixel_width,
            self.origin_y + (row as f64 + 0.5) * self.pixel_height,
        )
    }

    /// Fractional pixel coordinates; `floor()` gives the containing pixel.
    pub fn geo_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.origin_x) / self.pixel_width,
            (y - self.origin_y) / self.pixel_height,
        )
    }

    pub fn is_valid(&self) -> bool {
        [self.origin_x, self.origin_y, self.pixel_width, self.pixel_height]
            .iter()
            .all(|v| v.is_finite())
            && self.pixel_width.abs() > 0.0
            && self.pixel_height.abs() > 0.0
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x: min_x.min(max_x),
            min_y: min_y.min(max_y),
            max_x: min_x.max(max_x),
            max_y: min_y.max(max_y),
        }
    }

    /// Envelope of a set of points. `None` when the iterator is empty.
    pub fn from_points(points: impl IntoIterator<Item = (f64, f64)>) -> Option<Self> {
        let mut iter = points.into_iter();
        let (x0, y0) = iter.next()?;
        let mut b = Bounds::new(x0, y0, x0, y0);
        for (x, y) in iter {
            b.min_x = b.min_x.min(x);
            b.min_y = b.min_y.min(y);
            b.max_x = b.max_x.max(x);
            b.max_y = b.max_y.max(y);
        }
        Some(b)
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Closed-interval intersection test; touching edges count.
    pub fn intersects(&self, other: &Bounds) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    /// Envelope after transforming the boundary into `to`.
    ///
    /// Samples each edge so the curvature of the projection is captured.
    pub fn transform(&self, from: Crs, to: Crs) -> Bounds {
        if from == to {
            return *self;
        }
        const STEPS: usize = 8;
        let mut points = Vec::with_capacity(4 * (STEPS + 1));
        for i in 0..=STEPS {
            let t = i as f64 / STEPS as f64;
            let x = self.min_x + t * self.width();
            let y = self.min_y + t * self.height();
            points.push((x, self.min_y));
            points.push((x, self.max_y));
            points.push((self.min_x, y));
            points.push((self.max_x, y));
        }
        let projected = points
            .into_iter()
            .map(|(x, y)| transform_point(from, to, x, y));
        Bounds::from_points(projected).unwrap_or(*self)
    }
}

/// Full grid definition: dimensions, transform and CRS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub width: usize,
    pub height: usize,
    pub transform: GeoTransform,
    pub crs: Crs,
}

impl GridSpec {
    pub fn new(width: usize, height: usize, transform: GeoTransform, crs: Crs) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(RasterError::InvalidDimensions(format!(
                "grid must be non-empty, got {}x{}",
                width, height
            )));
        }
        if !transform.is_valid() {
            return Err(RasterError::InvalidDimensions(format!(
                "degenerate transform {:?}",
                transform
            )));
        }
        Ok(Self {
            width,
            height,
            transform,
            crs,
        })
    }

    pub fn len(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Absolute pixel size `(x, y)`.
    pub fn resolution(&self) -> (f64, f64) {
        (
            self.transform.pixel_width.abs(),
            self.transform.pixel_height.abs(),
        )
    }

    /// Larger of the two pixel dimensions.
    pub fn coarsest_resolution(&self) -> f64 {
        let (rx, ry) = self.resolution();
        rx.max(ry)
    }

    pub fn bounds(&self) -> Bounds {
        let t = &self.transform;
        Bounds::new(
            t.origin_x,
            t.origin_y,
            t.origin_x + self.width as f64 * t.pixel_width,
            t.origin_y + self.height as f64 * t.pixel_height,
        )
    }

    /// Same dimensions, CRS and transform within a small relative tolerance.
    pub fn matches(&self, other: &GridSpec) -> bool {
        let tol = GRID_TOLERANCE * self.coarsest_resolution().max(1e-12);
        let close = |a: f64, b: f64| (a - b).abs() <= tol;
        self.width == other.width
            && self.height == other.height
            && self.crs == other.crs
            && close(self.transform.origin_x, other.transform.origin_x)
            && close(self.transform.origin_y, other.transform.origin_y)
            && close(self.transform.pixel_width, other.transform.pixel_width)
            && close(self.transform.pixel_height, other.transform.pixel_height)
    }

    pub fn ensure_matches(&self, other: &GridSpec) -> Result<()> {
        if self.matches(other) {
            Ok(())
        } else {
            Err(RasterError::GridMismatch {
                expected: self.to_string(),
                actual: other.to_string(),
            })
        }
    }

    /// Grid in `target` covering this grid's footprint at `resolution`.
    pub fn reprojected(&self, target: Crs, resolution: f64) -> Result<GridSpec> {
        if !(resolution.is_finite() && resolution > 0.0) {
            return Err(RasterError::invalid_parameter(format!(
                "resolution must be positive, got {}",
                resolution
            )));
        }
        let envelope = self.bounds().transform(self.crs, target);
        let width = (envelope.width() / resolution).ceil().max(1.0) as usize;
        let height = (envelope.height() / resolution).ceil().max(1.0) as usize;
        GridSpec::new(
            width,
            height,
            GeoTransform::north_up(envelope.min_x, envelope.max_y, resolution),
            target,
        )
    }

    /// Stable textual form used in cache fingerprints.
    pub fn cache_descriptor(&self) -> String {
        let t = &self.transform;
        format!(
            "{}x{}:{}:{:.6}:{:.6}:{:.6}:{:.6}",
            self.width,
            self.height,
            self.crs,
            t.origin_x,
            t.origin_y,
            t.pixel_width,
            t.pixel_height
        )
    }
}

impl fmt::Display for GridSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (rx, ry) = self.resolution();
        write!(
            f,
            "{}x{} @ {}x{} {} origin ({}, {})",
            self.width,
            self.height,
            rx,
            ry,
            self.crs,
            self.transform.origin_x,
            self.transform.origin_y
        )
    }
}
