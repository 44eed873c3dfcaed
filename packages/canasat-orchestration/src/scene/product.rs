//! On-disk product layout.
//!
//! A product is a directory (or a zip of one) holding `product.json` and band
//! rasters named `<anything>_<CODE>_<RES>m.cnr`. The metadata file may sit at
//! the root or one directory below it.

use crate::error::{OrchestratorError, Result};
use canasat_raster::{Band, Bounds, Crs, Radiometry, Raster, RASTER_EXTENSION};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const PRODUCT_METADATA_FILE: &str = "product.json";

fn default_quantification() -> f64 {
    10_000.0
}

fn default_nodata() -> Option<f32> {
    Some(0.0)
}

/// Metadata embedded in every product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductMetadata {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub acquired_at: DateTime<Utc>,
    pub cloud_cover: f64,
    /// Exterior ring, lon/lat
    pub footprint: Vec<[f64; 2]>,
    /// Native CRS of the band rasters
    pub crs: Crs,
    #[serde(default = "default_quantification")]
    pub quantification: f64,
    /// Additive DN offsets keyed by band name or sensor code
    #[serde(default)]
    pub band_offsets: BTreeMap<String, f64>,
    /// `null` disables no-data masking
    #[serde(default = "default_nodata")]
    pub nodata_dn: Option<f32>,
}

impl ProductMetadata {
    pub fn new(
        id: impl Into<String>,
        acquired_at: DateTime<Utc>,
        cloud_cover: f64,
        footprint: Vec<[f64; 2]>,
        crs: Crs,
    ) -> Self {
        Self {
            id: id.into(),
            title: None,
            acquired_at,
            cloud_cover,
            footprint,
            crs,
            quantification: default_quantification(),
            band_offsets: BTreeMap::new(),
            nodata_dn: default_nodata(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(OrchestratorError::corrupt_product("product id is empty"));
        }
        if !(self.cloud_cover.is_finite() && (0.0..=100.0).contains(&self.cloud_cover)) {
            return Err(OrchestratorError::corrupt_product(format!(
                "cloud cover {} is outside [0, 100]",
                self.cloud_cover
            )));
        }
        if self.footprint.len() < 3 {
            return Err(OrchestratorError::corrupt_product("footprint needs at least three positions"));
        }
        Ok(())
    }

    pub fn footprint_bounds(&self) -> Option<Bounds> {
        Bounds::from_points(self.footprint.iter().map(|p| (p[0], p[1])))
    }

    /// Scaling for `band` from the embedded quantification and offsets.
    pub fn radiometry(&self, band: Band) -> Result<Radiometry> {
        let offset = self
            .band_offsets
            .iter()
            .find(|(key, _)| {
                key.eq_ignore_ascii_case(band.as_str()) || key.eq_ignore_ascii_case(band.sensor_code())
            })
            .map(|(_, v)| *v)
            .unwrap_or(0.0);
        Ok(Radiometry::new(self.quantification, offset)
            .map_err(OrchestratorError::corrupt_product)?
            .with_nodata(self.nodata_dn))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let metadata: ProductMetadata = serde_json::from_slice(bytes).map_err(|e| {
            OrchestratorError::corrupt_product(format!("{} is not valid: {}", PRODUCT_METADATA_FILE, e))
        })?;
        metadata.validate()?;
        Ok(metadata)
    }
}

/// `T23KLP_20240807_B08_10m.cnr` -> (Nir, 10)
pub fn parse_band_file_name(name: &str) -> Option<(Band, u32)> {
    let stem = name.strip_suffix(&format!(".{}", RASTER_EXTENSION))?;
    let mut parts = stem.rsplit('_');
    let resolution: u32 = parts.next()?.strip_suffix('m')?.parse().ok()?;
    let code = parts.next()?;
    let band = Band::ALL
        .into_iter()
        .find(|b| b.sensor_code().eq_ignore_ascii_case(code))?;
    Some((band, resolution))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandFile {
    pub path: PathBuf,
    pub resolution: u32,
}

/// An unpacked product directory.
#[derive(Debug, Clone)]
pub struct LocalProduct {
    root: PathBuf,
    metadata: ProductMetadata,
    bands: BTreeMap<Band, BandFile>,
}

impl LocalProduct {
    /// Read metadata and index band files. Blocking.
    pub fn open(dir: &Path) -> Result<Self> {
        let root = find_product_root(dir)?;
        let bytes = fs::read(root.join(PRODUCT_METADATA_FILE))
            .map_err(|e| OrchestratorError::corrupt_product(format!("cannot read {}: {}", PRODUCT_METADATA_FILE, e)))?;
        let metadata = ProductMetadata::from_json(&bytes)?;

        let mut bands: BTreeMap<Band, BandFile> = BTreeMap::new();
        let mut files = Vec::new();
        collect_files(&root, &mut files)?;
        for path in files {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((band, resolution)) = parse_band_file_name(name) else {
                continue;
            };
            // Finest resolution wins.
            let finer = bands.get(&band).map_or(true, |existing| resolution < existing.resolution);
            if finer {
                bands.insert(band, BandFile { path, resolution });
            }
        }
        debug!(product = %metadata.id, bands = bands.len(), "opened product");

        Ok(Self {
            root,
            metadata,
            bands,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metadata(&self) -> &ProductMetadata {
        &self.metadata
    }

    pub fn locate_band(&self, band: Band) -> Option<&BandFile> {
        self.bands.get(&band)
    }

    pub fn available_bands(&self) -> impl Iterator<Item = Band> + '_ {
        self.bands.keys().copied()
    }
}

fn find_product_root(dir: &Path) -> Result<PathBuf> {
    if !dir.is_dir() {
        return Err(OrchestratorError::corrupt_product(format!(
            "{} is not a product directory",
            dir.display()
        )));
    }
    if dir.join(PRODUCT_METADATA_FILE).is_file() {
        return Ok(dir.to_path_buf());
    }
    let mut nested = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() && path.join(PRODUCT_METADATA_FILE).is_file() {
            nested.push(path);
        }
    }
    match nested.len() {
        1 => Ok(nested.remove(0)),
        0 => Err(OrchestratorError::corrupt_product(format!(
            "no {} in {}",
            PRODUCT_METADATA_FILE,
            dir.display()
        ))),
        n => Err(OrchestratorError::corrupt_product(format!(
            "{} candidate products in {}",
            n,
            dir.display()
        ))),
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Archives
// ═══════════════════════════════════════════════════════════════════════════

pub fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case("zip"))
}

fn open_archive(path: &Path) -> Result<ZipArchive<File>> {
    let file = File::open(path)
        .map_err(|e| OrchestratorError::corrupt_product(format!("cannot open archive: {}", e)))?;
    ZipArchive::new(file).map_err(|e| OrchestratorError::corrupt_product(format!("unreadable archive: {}", e)))
}

/// Read `product.json` from an archive without unpacking it. Blocking.
pub fn read_archive_metadata(path: &Path) -> Result<ProductMetadata> {
    let mut archive = open_archive(path)?;
    let mut found = None;
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| OrchestratorError::corrupt_product(format!("unreadable archive entry: {}", e)))?;
        let is_metadata = entry
            .enclosed_name()
            .map(|p| p.to_path_buf())
            .filter(|p| p.file_name().map_or(false, |n| n == PRODUCT_METADATA_FILE) && p.components().count() <= 2);
        if is_metadata.is_some() {
            found = Some(i);
            break;
        }
    }
    let index = found.ok_or_else(|| {
        OrchestratorError::corrupt_product(format!("archive has no {}", PRODUCT_METADATA_FILE))
    })?;
    let mut entry = archive
        .by_index(index)
        .map_err(|e| OrchestratorError::corrupt_product(format!("unreadable archive entry: {}", e)))?;
    let mut bytes = Vec::new();
    entry
        .read_to_end(&mut bytes)
        .map_err(|e| OrchestratorError::corrupt_product(format!("unreadable archive entry: {}", e)))?;
    ProductMetadata::from_json(&bytes)
}

/// Unpack every entry below `dest`. Entries escaping `dest` are rejected.
/// Blocking.
pub fn unpack_archive(path: &Path, dest: &Path) -> Result<()> {
    let mut archive = open_archive(path)?;
    fs::create_dir_all(dest)?;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| OrchestratorError::corrupt_product(format!("unreadable archive entry: {}", e)))?;
        let relative = entry.enclosed_name().map(|p| p.to_path_buf()).ok_or_else(|| {
            OrchestratorError::corrupt_product(format!("archive entry '{}' escapes the product", entry.name()))
        })?;
        let out = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&out)?;
        std::io::copy(&mut entry, &mut file)
            .map_err(|e| OrchestratorError::corrupt_product(format!("truncated archive entry: {}", e)))?;
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Writer
// ═══════════════════════════════════════════════════════════════════════════

/// Builds products in the layout `LocalProduct` reads. Used by fixtures,
/// offline mirrors and tests.
pub struct ProductWriter {
    metadata: ProductMetadata,
    bands: Vec<(Band, u32, Raster)>,
}

impl ProductWriter {
    pub fn new(metadata: ProductMetadata) -> Self {
        Self {
            metadata,
            bands: Vec::new(),
        }
    }

    pub fn band(mut self, band: Band, resolution: u32, raster: Raster) -> Self {
        self.bands.push((band, resolution, raster));
        self
    }

    fn band_entry(&self, band: Band, resolution: u32) -> String {
        format!(
            "IMG_DATA/R{}m/{}_{}_{}m.{}",
            resolution,
            self.metadata.id,
            band.sensor_code(),
            resolution,
            RASTER_EXTENSION
        )
    }

    /// Write `<parent>/<id>/...` and return the product directory.
    pub fn write_dir(&self, parent: &Path) -> Result<PathBuf> {
        let root = parent.join(&self.metadata.id);
        fs::create_dir_all(&root)?;
        let metadata = serde_json::to_vec_pretty(&self.metadata).map_err(OrchestratorError::serialization)?;
        fs::write(root.join(PRODUCT_METADATA_FILE), metadata)?;
        for (band, resolution, raster) in &self.bands {
            let path = root.join(self.band_entry(*band, *resolution));
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            raster.write(&path)?;
        }
        Ok(root)
    }

    /// Write a zip whose entries sit below `<id>/`.
    pub fn write_zip(&self, path: &Path) -> Result<PathBuf> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        let mut zip = ZipWriter::new(file);
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        let prefix = &self.metadata.id;

        let metadata = serde_json::to_vec_pretty(&self.metadata).map_err(OrchestratorError::serialization)?;
        zip.start_file(format!("{}/{}", prefix, PRODUCT_METADATA_FILE), options)
            .map_err(OrchestratorError::internal)?;
        zip.write_all(&metadata)?;

        for (band, resolution, raster) in &self.bands {
            zip.start_file(format!("{}/{}", prefix, self.band_entry(*band, *resolution)), options)
                .map_err(OrchestratorError::internal)?;
            zip.write_all(&raster.encode()?)?;
        }
        zip.finish().map_err(OrchestratorError::internal)?;
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canasat_raster::{GeoTransform, GridSpec, RasterUnits};
    use chrono::TimeZone;

    fn metadata() -> ProductMetadata {
        let mut m = ProductMetadata::new(
            "S2A_MSIL2A_20240807T131251_T23KLP",
            Utc.with_ymd_and_hms(2024, 8, 7, 13, 12, 51).unwrap(),
            8.0,
            vec![[-47.6, -22.6], [-46.9, -22.6], [-46.9, -21.9], [-47.6, -21.9]],
            Crs::from_epsg(32723).unwrap(),
        );
        m.band_offsets.insert("B04".to_string(), -1000.0);
        m
    }

    fn raster(res: f64) -> Raster {
        let grid = GridSpec::new(
            4,
            4,
            GeoTransform::north_up(200_000.0, 7_500_000.0, res),
            Crs::from_epsg(32723).unwrap(),
        )
        .unwrap();
        Raster::filled(grid, RasterUnits::DigitalNumber, 1500.0)
    }

    #[test]
    fn test_parse_band_file_name() {
        assert_eq!(parse_band_file_name("T23KLP_20240807_B08_10m.cnr"), Some((Band::Nir, 10)));
        assert_eq!(parse_band_file_name("x_B8A_20m.cnr"), Some((Band::RedEdge4, 20)));
        assert_eq!(parse_band_file_name("x_B08_10m.jp2"), None);
        assert_eq!(parse_band_file_name("x_SCL_20m.cnr"), None);
        assert_eq!(parse_band_file_name("x_nir_10m.cnr"), None);
    }

    #[test]
    fn test_radiometry_uses_offsets() {
        let m = metadata();
        assert_eq!(m.radiometry(Band::Red).unwrap().offset, -1000.0);
        assert_eq!(m.radiometry(Band::Nir).unwrap().offset, 0.0);
        assert_eq!(m.radiometry(Band::Nir).unwrap().nodata_dn, Some(0.0));
    }

    #[test]
    fn test_metadata_defaults_and_validation() {
        let json = r#"{
            "id": "P1",
            "acquired_at": "2024-08-07T13:12:51Z",
            "cloud_cover": 12.5,
            "footprint": [[0,0],[1,0],[1,1]],
            "crs": "EPSG:32723",
            "nodata_dn": null
        }"#;
        let m = ProductMetadata::from_json(json.as_bytes()).unwrap();
        assert_eq!(m.quantification, 10_000.0);
        assert_eq!(m.nodata_dn, None);

        let bad = json.replace("12.5", "120");
        assert!(matches!(
            ProductMetadata::from_json(bad.as_bytes()),
            Err(OrchestratorError::CorruptProduct(_))
        ));
    }

    #[test]
    fn test_written_dir_is_readable_and_prefers_finest_band() {
        let dir = tempfile::tempdir().unwrap();
        let root = ProductWriter::new(metadata())
            .band(Band::Nir, 10, raster(10.0))
            .band(Band::Nir, 20, raster(20.0))
            .band(Band::Swir1, 20, raster(20.0))
            .write_dir(dir.path())
            .unwrap();

        let product = LocalProduct::open(&root).unwrap();
        assert_eq!(product.metadata().id, "S2A_MSIL2A_20240807T131251_T23KLP");
        assert_eq!(product.locate_band(Band::Nir).unwrap().resolution, 10);
        assert_eq!(product.locate_band(Band::Swir1).unwrap().resolution, 20);
        assert!(product.locate_band(Band::Red).is_none());

        // The parent also resolves to the nested product.
        assert_eq!(LocalProduct::open(dir.path()).unwrap().root(), root.as_path());
    }

    #[test]
    fn test_zip_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ProductWriter::new(metadata())
            .band(Band::Red, 10, raster(10.0))
            .write_zip(&dir.path().join("product.zip"))
            .unwrap();

        assert_eq!(read_archive_metadata(&archive).unwrap(), metadata());

        let dest = dir.path().join("unpacked");
        unpack_archive(&archive, &dest).unwrap();
        let product = LocalProduct::open(&dest).unwrap();
        let red = Raster::read(&product.locate_band(Band::Red).unwrap().path).unwrap();
        assert_eq!(red.data()[0], 1500.0);
    }

    #[test]
    fn test_unpack_rejects_escaping_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evil.zip");
        {
            let mut zip = ZipWriter::new(File::create(&path).unwrap());
            zip.start_file("../escape.cnr", FileOptions::default()).unwrap();
            zip.write_all(b"x").unwrap();
            zip.finish().unwrap();
        }
        let err = unpack_archive(&path, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, OrchestratorError::CorruptProduct(_)));
        assert!(!dir.path().join("escape.cnr").exists());
    }

    #[test]
    fn test_garbage_archive_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.zip");
        fs::write(&path, b"definitely not a zip").unwrap();
        assert!(matches!(read_archive_metadata(&path), Err(OrchestratorError::CorruptProduct(_))));
    }
}
