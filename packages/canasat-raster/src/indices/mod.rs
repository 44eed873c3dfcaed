//! Spectral index registry and the raster kernel that applies a definition.
//!
//! An index is a small strategy record: a name, the bands it reads, a
//! formula version and a pure per-pixel function. Adding an index means
//! registering one more record.

pub mod formulas;

use crate::band::Band;
use crate::error::{RasterError, Result};
use crate::raster::{Raster, RasterUnits};
use once_cell::sync::Lazy;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fmt;

/// Default denominator magnitude below which a pixel is masked.
pub const DEFAULT_MASK_EPSILON: f64 = 1e-6;

/// Per-pixel formula: reflectances in band order, mask epsilon.
pub type IndexFormula = fn(&[f64], f64) -> f64;

#[derive(Clone)]
pub struct IndexDefinition {
    name: String,
    description: String,
    bands: Vec<Band>,
    version: u32,
    formula: IndexFormula,
}

impl IndexDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        bands: &[Band],
        version: u32,
        formula: IndexFormula,
    ) -> Self {
        Self {
            name: name.into().to_ascii_lowercase(),
            description: description.into(),
            bands: bands.to_vec(),
            version,
            formula,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn required_bands(&self) -> &[Band] {
        &self.bands
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Bands from `required_bands` that `available` does not contain.
    pub fn missing_bands(&self, available: impl Fn(Band) -> bool) -> Vec<Band> {
        self.bands.iter().copied().filter(|b| !available(*b)).collect()
    }

    /// Evaluate one pixel. NaN inputs and non-finite results yield NaN.
    #[inline]
    pub fn evaluate(&self, pixel: &[f64], mask_epsilon: f64) -> f32 {
        if pixel.iter().any(|v| v.is_nan()) {
            return f32::NAN;
        }
        let value = (self.formula)(pixel, mask_epsilon);
        if value.is_finite() {
            value as f32
        } else {
            f32::NAN
        }
    }

    /// Apply this definition to co-registered inputs given in band order.
    pub fn compute(&self, inputs: &[&Raster], mask_epsilon: f64) -> Result<Raster> {
        if inputs.is_empty() || inputs.len() != self.bands.len() {
            return Err(RasterError::invalid_parameter(format!(
                "index '{}' takes {} bands, got {}",
                self.name,
                self.bands.len(),
                inputs.len()
            )));
        }
        let first = inputs[0].grid();
        for raster in &inputs[1..] {
            first.ensure_matches(raster.grid())?;
        }

        let grid = *first;
        let width = grid.width;
        let mut data = vec![f32::NAN; grid.len()];
        data.par_chunks_mut(width).enumerate().for_each(|(row, out)| {
            let rows: Vec<&[f32]> = inputs.iter().map(|r| r.row(row)).collect();
            let mut pixel = vec![0.0f64; rows.len()];
            for (col, px) in out.iter_mut().enumerate() {
                for (slot, band_row) in pixel.iter_mut().zip(&rows) {
                    *slot = band_row[col] as f64;
                }
                *px = self.evaluate(&pixel, mask_epsilon);
            }
        });

        Raster::new(grid, RasterUnits::Index, data)
    }
}

impl fmt::Debug for IndexDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexDefinition")
            .field("name", &self.name)
            .field("bands", &self.bands)
            .field("version", &self.version)
            .finish()
    }
}

/// Name -> definition. Names are lowercase.
#[derive(Debug, Clone, Default)]
pub struct IndexRegistry {
    definitions: BTreeMap<String, IndexDefinition>,
}

static BUILTIN: Lazy<IndexRegistry> = Lazy::new(|| {
    let mut registry = IndexRegistry::default();
    for def in formulas::builtin_definitions() {
        registry.definitions.insert(def.name.clone(), def);
    }
    registry
});

impl IndexRegistry {
    /// Shared registry of the built-in indices.
    pub fn builtin() -> &'static IndexRegistry {
        &BUILTIN
    }

    /// Owned copy of the built-ins, for registering extra indices.
    pub fn with_builtins() -> Self {
        BUILTIN.clone()
    }

    /// Add a definition. Names are unique.
    pub fn register(&mut self, definition: IndexDefinition) -> Result<()> {
        if self.definitions.contains_key(definition.name()) {
            return Err(RasterError::invalid_parameter(format!(
                "index '{}' is already registered",
                definition.name()
            )));
        }
        if definition.required_bands().is_empty() {
            return Err(RasterError::invalid_parameter(format!(
                "index '{}' requires at least one band",
                definition.name()
            )));
        }
        self.definitions
            .insert(definition.name().to_string(), definition);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&IndexDefinition> {
        self.definitions.get(&name.trim().to_ascii_lowercase())
    }

    pub fn resolve(&self, name: &str) -> Result<&IndexDefinition> {
        self.get(name)
            .ok_or_else(|| RasterError::UnknownIndex(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.definitions.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::Crs;
    use crate::grid::{GeoTransform, GridSpec};

    fn grid(res: f64) -> GridSpec {
        GridSpec::new(
            3,
            2,
            GeoTransform::north_up(300_000.0, 8_300_000.0, res),
            Crs::from_epsg(32723).unwrap(),
        )
        .unwrap()
    }

    fn refl(values: Vec<f32>) -> Raster {
        Raster::new(grid(10.0), RasterUnits::Reflectance, values).unwrap()
    }

    #[test]
    fn test_builtin_registry_contents() {
        let reg = IndexRegistry::builtin();
        for name in ["ndvi", "ndwi", "ndmi", "msi", "evi", "savi", "ndre", "ci_rededge", "sipi"] {
            assert!(reg.get(name).is_some(), "missing {}", name);
        }
        assert_eq!(reg.get("NDVI").unwrap().required_bands(), &[Band::Nir, Band::Red]);
        assert!(matches!(
            reg.resolve("lai"),
            Err(RasterError::UnknownIndex(_))
        ));
    }

    #[test]
    fn test_register_custom_index() {
        fn red_ratio(px: &[f64], eps: f64) -> f64 {
            if px[1].abs() < eps {
                f64::NAN
            } else {
                px[0] / px[1]
            }
        }
        let mut reg = IndexRegistry::with_builtins();
        let before = reg.len();
        reg.register(IndexDefinition::new(
            "SR",
            "Simple Ratio",
            &[Band::Nir, Band::Red],
            1,
            red_ratio,
        ))
        .unwrap();
        assert_eq!(reg.len(), before + 1);
        assert!(reg.get("sr").is_some());
        // Built-in registry is untouched
        assert!(IndexRegistry::builtin().get("sr").is_none());

        let dup = IndexDefinition::new("ndvi", "again", &[Band::Nir], 2, red_ratio);
        assert!(reg.register(dup).is_err());
    }

    #[test]
    fn test_ndvi_kernel_masks_invalid_pixels() {
        let nir = refl(vec![0.5, 0.0, f32::NAN, 0.4, 0.3, 0.2]);
        let red = refl(vec![0.1, 0.0, 0.1, 0.4, 0.1, 0.6]);
        let ndvi = IndexRegistry::builtin().get("ndvi").unwrap();
        let out = ndvi.compute(&[&nir, &red], DEFAULT_MASK_EPSILON).unwrap();

        assert_eq!(out.units(), RasterUnits::Index);
        assert!((out.data()[0] - 0.4 / 0.6).abs() < 1e-6);
        assert!(out.data()[1].is_nan(), "zero denominator");
        assert!(out.data()[2].is_nan(), "no-data input");
        assert_eq!(out.data()[3], 0.0);
        assert!(out.data().iter().all(|v| !v.is_infinite()));
    }

    #[test]
    fn test_compute_rejects_mismatched_grids() {
        let nir = refl(vec![0.5; 6]);
        let red = Raster::filled(grid(20.0), RasterUnits::Reflectance, 0.1);
        let ndvi = IndexRegistry::builtin().get("ndvi").unwrap();
        assert!(matches!(
            ndvi.compute(&[&nir, &red], DEFAULT_MASK_EPSILON),
            Err(RasterError::GridMismatch { .. })
        ));
    }

    #[test]
    fn test_compute_rejects_wrong_arity() {
        let nir = refl(vec![0.5; 6]);
        let evi = IndexRegistry::builtin().get("evi").unwrap();
        assert!(evi.compute(&[&nir], DEFAULT_MASK_EPSILON).is_err());
    }

    #[test]
    fn test_compute_is_deterministic() {
        let nir = refl(vec![0.5, 0.45, 0.3, 0.6, 0.7, 0.2]);
        let red = refl(vec![0.1, 0.12, 0.2, 0.05, 0.08, 0.19]);
        let blue = refl(vec![0.05, 0.04, 0.1, 0.02, 0.03, 0.1]);
        let evi = IndexRegistry::builtin().get("evi").unwrap();
        let a = evi.compute(&[&nir, &red, &blue], DEFAULT_MASK_EPSILON).unwrap();
        let b = evi.compute(&[&nir, &red, &blue], DEFAULT_MASK_EPSILON).unwrap();
        assert_eq!(a.encode().unwrap(), b.encode().unwrap());
    }

    #[test]
    fn test_missing_bands() {
        let msi = IndexRegistry::builtin().get("msi").unwrap();
        let missing = msi.missing_bands(|b| b != Band::Swir1);
        assert_eq!(missing, vec![Band::Swir1]);
    }
}
