//! In-memory raster and its on-disk codec.
//!
//! Files start with the `CNR1` magic followed by a bincode body
//! `{grid, units, data}`. The encoding is deterministic: equal rasters
//! produce byte-identical files.

use crate::error::{RasterError, Result};
use crate::grid::GridSpec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;

/// File magic for the raster codec.
pub const RASTER_MAGIC: &[u8; 4] = b"CNR1";

/// File extension used for raster artifacts.
pub const RASTER_EXTENSION: &str = "cnr";

/// What the pixel values mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RasterUnits {
    /// Raw quantized sensor values
    DigitalNumber,
    /// Surface reflectance, nominally 0..1
    Reflectance,
    /// Dimensionless spectral index
    Index,
}

impl RasterUnits {
    pub fn as_str(&self) -> &'static str {
        match self {
            RasterUnits::DigitalNumber => "digital_number",
            RasterUnits::Reflectance => "reflectance",
            RasterUnits::Index => "index",
        }
    }
}

/// Row-major f32 raster. NoData is NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Raster {
    grid: GridSpec,
    units: RasterUnits,
    data: Vec<f32>,
}

impl Raster {
    pub fn new(grid: GridSpec, units: RasterUnits, data: Vec<f32>) -> Result<Self> {
        if data.len() != grid.len() {
            return Err(RasterError::InvalidDimensions(format!(
                "{} values for a {}x{} grid",
                data.len(),
                grid.width,
                grid.height
            )));
        }
        Ok(Self { grid, units, data })
    }

    pub fn filled(grid: GridSpec, units: RasterUnits, value: f32) -> Self {
        Self {
            data: vec![value; grid.len()],
            grid,
            units,
        }
    }

    /// Build from a per-pixel function of `(col, row)`.
    pub fn from_fn(grid: GridSpec, units: RasterUnits, f: impl Fn(usize, usize) -> f32) -> Self {
        let mut data = Vec::with_capacity(grid.len());
        for row in 0..grid.height {
            for col in 0..grid.width {
                data.push(f(col, row));
            }
        }
        Self { grid, units, data }
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn units(&self) -> RasterUnits {
        self.units
    }

    pub fn width(&self) -> usize {
        self.grid.width
    }

    pub fn height(&self) -> usize {
        self.grid.height
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn get(&self, col: usize, row: usize) -> Option<f32> {
        if col < self.grid.width && row < self.grid.height {
            Some(self.data[row * self.grid.width + col])
        } else {
            None
        }
    }

    pub fn row(&self, row: usize) -> &[f32] {
        let start = row * self.grid.width;
        &self.data[start..start + self.grid.width]
    }

    /// Number of pixels holding data (not NaN).
    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| !v.is_nan()).count()
    }

    /// Min, max and mean over valid pixels.
    pub fn statistics(&self) -> Option<RasterStatistics> {
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        let mut sum = 0.0f64;
        let mut count = 0usize;
        for &v in self.data.iter().filter(|v| !v.is_nan()) {
            min = min.min(v);
            max = max.max(v);
            sum += v as f64;
            count += 1;
        }
        (count > 0).then(|| RasterStatistics {
            min,
            max,
            mean: sum / count as f64,
            valid: count,
        })
    }

    pub fn with_units(mut self, units: RasterUnits) -> Self {
        self.units = units;
        self
    }

    // ═══════════════════════════════════════════════════════════════════
    // Codec
    // ═══════════════════════════════════════════════════════════════════

    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let mut out = Vec::with_capacity(RASTER_MAGIC.len() + body.len());
        out.extend_from_slice(RASTER_MAGIC);
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let body = bytes
            .strip_prefix(RASTER_MAGIC.as_slice())
            .ok_or_else(|| RasterError::Codec("missing raster magic header".to_string()))?;
        let raster: Raster = bincode::deserialize(body)?;
        // Re-validate; the body may come from an untrusted archive.
        let g = raster.grid;
        let grid = GridSpec::new(g.width, g.height, g.transform, g.crs)
            .map_err(|e| RasterError::Codec(format!("corrupt raster grid: {}", e)))?;
        Raster::new(grid, raster.units, raster.data)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::decode(&bytes)
    }

    /// Write to `path` directly. Callers needing atomic replacement write
    /// the encoded bytes through the artifact cache instead.
    pub fn write(&self, path: &Path) -> Result<()> {
        let bytes = self.encode()?;
        let mut file = fs::File::create(path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(())
    }
}

/// Summary statistics over valid pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RasterStatistics {
    pub min: f32,
    pub max: f32,
    pub mean: f64,
    pub valid: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::Crs;
    use crate::grid::GeoTransform;

    fn grid(w: usize, h: usize) -> GridSpec {
        GridSpec::new(
            w,
            h,
            GeoTransform::north_up(500_000.0, 4_000_000.0, 10.0),
            Crs::from_epsg(32630).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_wrong_length() {
        let err = Raster::new(grid(2, 2), RasterUnits::Reflectance, vec![0.0; 3]);
        assert!(matches!(err, Err(RasterError::InvalidDimensions(_))));
    }

    #[test]
    fn test_from_fn_is_row_major() {
        let r = Raster::from_fn(grid(3, 2), RasterUnits::Index, |c, r| (r * 10 + c) as f32);
        assert_eq!(r.data(), &[0.0, 1.0, 2.0, 10.0, 11.0, 12.0]);
        assert_eq!(r.get(2, 1), Some(12.0));
        assert_eq!(r.get(3, 0), None);
        assert_eq!(r.row(1), &[10.0, 11.0, 12.0]);
    }

    #[test]
    fn test_statistics_skip_nodata() {
        let r = Raster::new(
            grid(2, 2),
            RasterUnits::Index,
            vec![0.5, f32::NAN, -0.5, 1.0],
        )
        .unwrap();
        let stats = r.statistics().unwrap();
        assert_eq!(stats.valid, 3);
        assert_eq!(stats.min, -0.5);
        assert_eq!(stats.max, 1.0);
        assert!((stats.mean - 1.0 / 3.0).abs() < 1e-9);

        let empty = Raster::filled(grid(2, 2), RasterUnits::Index, f32::NAN);
        assert!(empty.statistics().is_none());
        assert_eq!(empty.valid_count(), 0);
    }

    #[test]
    fn test_encode_is_deterministic_and_decodes() {
        let r = Raster::from_fn(grid(4, 3), RasterUnits::Reflectance, |c, r| {
            if c == r {
                f32::NAN
            } else {
                (c + r) as f32 * 0.01
            }
        });
        let a = r.encode().unwrap();
        let b = r.clone().encode().unwrap();
        assert_eq!(a, b);
        assert_eq!(&a[..4], RASTER_MAGIC);

        let back = Raster::decode(&a).unwrap();
        assert_eq!(back.grid(), r.grid());
        assert_eq!(back.units(), RasterUnits::Reflectance);
        assert_eq!(back.get(0, 0).map(f32::is_nan), Some(true));
        assert_eq!(back.get(1, 0), Some(0.01));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Raster::decode(b"nope"),
            Err(RasterError::Codec(_))
        ));
        let mut bytes = Raster::filled(grid(2, 2), RasterUnits::Index, 1.0)
            .encode()
            .unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(Raster::decode(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_degenerate_grid() {
        let empty = Raster {
            grid: GridSpec { width: 0, ..grid(2, 2) },
            units: RasterUnits::Index,
            data: Vec::new(),
        };
        match Raster::decode(&empty.encode().unwrap()) {
            Err(RasterError::Codec(msg)) => assert!(msg.contains("grid"), "unexpected message: {}", msg),
            other => panic!("Expected Codec error, got {:?}", other),
        }

        let mut flat = grid(2, 2);
        flat.transform.pixel_width = 0.0;
        let flat = Raster {
            grid: flat,
            units: RasterUnits::Index,
            data: vec![1.0; 4],
        };
        assert!(matches!(Raster::decode(&flat.encode().unwrap()), Err(RasterError::Codec(_))));
    }

    #[test]
    fn test_write_and_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("band.{}", RASTER_EXTENSION));
        let r = Raster::filled(grid(2, 2), RasterUnits::DigitalNumber, 1200.0);
        r.write(&path).unwrap();
        let back = Raster::read(&path).unwrap();
        assert_eq!(back, r);
    }
}
