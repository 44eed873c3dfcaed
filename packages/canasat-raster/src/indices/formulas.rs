//! Closed-form spectral index formulas.
//!
//! Every formula receives reflectances in the order of its definition's
//! band list plus the denominator mask epsilon, and returns NaN for pixels
//! it cannot compute.

use super::IndexDefinition;
use crate::band::Band;

#[inline]
fn masked_div(num: f64, den: f64, eps: f64) -> f64 {
    if den.abs() < eps {
        f64::NAN
    } else {
        num / den
    }
}

#[inline]
fn normalized_difference(a: f64, b: f64, eps: f64) -> f64 {
    masked_div(a - b, a + b, eps)
}

/// `(a - b) / (a + b)` over the first two inputs.
pub fn nd(px: &[f64], eps: f64) -> f64 {
    normalized_difference(px[0], px[1], eps)
}

/// `swir1 / nir`
pub fn msi(px: &[f64], eps: f64) -> f64 {
    masked_div(px[0], px[1], eps)
}

/// `1.5 (nir - red) / (nir + red + 0.5)`
pub fn savi(px: &[f64], eps: f64) -> f64 {
    const L: f64 = 0.5;
    let (nir, red) = (px[0], px[1]);
    masked_div((1.0 + L) * (nir - red), nir + red + L, eps)
}

/// `2.5 (nir - red) / (nir + 6 red - 7.5 blue + 1)`
pub fn evi(px: &[f64], eps: f64) -> f64 {
    let (nir, red, blue) = (px[0], px[1], px[2]);
    masked_div(2.5 * (nir - red), nir + 6.0 * red - 7.5 * blue + 1.0, eps)
}

/// `nir / rededge1 - 1`
pub fn ci_rededge(px: &[f64], eps: f64) -> f64 {
    masked_div(px[0], px[1], eps) - 1.0
}

/// `(nir - blue) / (nir - red)`
pub fn sipi(px: &[f64], eps: f64) -> f64 {
    let (nir, blue, red) = (px[0], px[1], px[2]);
    masked_div(nir - blue, nir - red, eps)
}

pub(super) fn builtin_definitions() -> Vec<IndexDefinition> {
    use Band::*;
    vec![
        IndexDefinition::new("ndvi", "Normalized Difference Vegetation Index", &[Nir, Red], 1, nd),
        IndexDefinition::new("gndvi", "Green NDVI", &[Nir, Green], 1, nd),
        IndexDefinition::new("ndwi", "Normalized Difference Water Index (McFeeters)", &[Green, Nir], 1, nd),
        IndexDefinition::new("mndwi", "Modified NDWI (Xu)", &[Green, Swir1], 1, nd),
        IndexDefinition::new("ndmi", "Normalized Difference Moisture Index", &[Nir, Swir1], 1, nd),
        IndexDefinition::new("msi", "Moisture Stress Index", &[Swir1, Nir], 1, msi),
        IndexDefinition::new("nbr", "Normalized Burn Ratio", &[Nir, Swir2], 1, nd),
        IndexDefinition::new("savi", "Soil Adjusted Vegetation Index (L = 0.5)", &[Nir, Red], 1, savi),
        IndexDefinition::new("evi", "Enhanced Vegetation Index", &[Nir, Red, Blue], 1, evi),
        IndexDefinition::new("ndre", "Normalized Difference Red Edge", &[Nir, RedEdge1], 1, nd),
        IndexDefinition::new("ndre2", "Normalized Difference Red Edge (B06)", &[Nir, RedEdge2], 1, nd),
        IndexDefinition::new("ci_rededge", "Red Edge Chlorophyll Index", &[Nir, RedEdge1], 1, ci_rededge),
        IndexDefinition::new("sipi", "Structure Insensitive Pigment Index", &[Nir, Blue, Red], 1, sipi),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-6;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_normalized_difference() {
        assert!(close(nd(&[0.5, 0.1], EPS), 0.4 / 0.6));
        assert!(close(nd(&[0.3, 0.3], EPS), 0.0));
        assert!(nd(&[0.0, 0.0], EPS).is_nan());
    }

    #[test]
    fn test_evi_closed_form() {
        let v = evi(&[0.5, 0.1, 0.05], EPS);
        let expected = 2.5 * 0.4 / (0.5 + 0.6 - 0.375 + 1.0);
        assert!(close(v, expected));
    }

    #[test]
    fn test_savi_closed_form() {
        let v = savi(&[0.4, 0.1], EPS);
        assert!(close(v, 1.5 * 0.3 / 1.0));
    }

    #[test]
    fn test_ratio_indices_mask_zero_denominator() {
        assert!(msi(&[0.2, 0.0], EPS).is_nan());
        assert!(ci_rededge(&[0.4, 0.0], EPS).is_nan());
        assert!(sipi(&[0.3, 0.1, 0.3], EPS).is_nan());
        assert!(close(msi(&[0.2, 0.4], EPS), 0.5));
        assert!(close(ci_rededge(&[0.4, 0.2], EPS), 1.0));
        assert!(close(sipi(&[0.5, 0.1, 0.3], EPS), 2.0));
    }

    #[test]
    fn test_builtin_names_are_unique() {
        let defs = builtin_definitions();
        let mut names: Vec<_> = defs.iter().map(|d| d.name().to_string()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), defs.len());
    }
}
