//! Coordinate reference systems understood by the pipeline

use crate::error::{RasterError, Result};
use crate::reproject::{parse_utm_epsg, utm_to_wgs84, wgs84_to_utm};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A supported CRS, identified by its EPSG code.
///
/// Serialized as `"EPSG:<code>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Crs {
    /// Geographic lon/lat (EPSG:4326)
    Wgs84,
    /// UTM zone on WGS84 (EPSG:326xx north, EPSG:327xx south)
    Utm { zone: u32, north: bool },
}

impl Crs {
    pub fn from_epsg(epsg: u32) -> Result<Self> {
        if epsg == 4326 {
            return Ok(Crs::Wgs84);
        }
        parse_utm_epsg(epsg)
            .map(|(zone, north)| Crs::Utm { zone, north })
            .ok_or_else(|| RasterError::UnsupportedCrs(format!("EPSG:{}", epsg)))
    }

    pub fn epsg(&self) -> u32 {
        match self {
            Crs::Wgs84 => 4326,
            Crs::Utm { zone, north: true } => 32600 + zone,
            Crs::Utm { zone, north: false } => 32700 + zone,
        }
    }

    /// Parse `EPSG:32723`, `epsg:32723` or a bare `32723`.
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let code = trimmed
            .get(..5)
            .filter(|prefix| prefix.eq_ignore_ascii_case("epsg:"))
            .map(|_| &trimmed[5..])
            .unwrap_or(trimmed);
        let epsg: u32 = code
            .parse()
            .map_err(|_| RasterError::UnsupportedCrs(s.to_string()))?;
        Self::from_epsg(epsg)
    }

    /// UTM zone whose central meridian is closest to `lon`.
    pub fn utm_for_lonlat(lon: f64, lat: f64) -> Self {
        let zone = (((lon + 180.0) / 6.0).floor() as i64).clamp(0, 59) as u32 + 1;
        Crs::Utm {
            zone,
            north: lat >= 0.0,
        }
    }

    pub fn is_geographic(&self) -> bool {
        matches!(self, Crs::Wgs84)
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg())
    }
}

impl std::str::FromStr for Crs {
    type Err = RasterError;

    fn from_str(s: &str) -> Result<Self> {
        Crs::parse(s)
    }
}

impl Serialize for Crs {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Crs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Crs::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Transform a single point between two CRSs.
///
/// UTM to UTM across zones goes through geographic coordinates.
pub fn transform_point(from: Crs, to: Crs, x: f64, y: f64) -> (f64, f64) {
    if from == to {
        return (x, y);
    }
    let (lon, lat) = match from {
        Crs::Wgs84 => (x, y),
        Crs::Utm { zone, north } => utm_to_wgs84(x, y, zone, north),
    };
    match to {
        Crs::Wgs84 => (lon, lat),
        Crs::Utm { zone, north } => wgs84_to_utm(lon, lat, zone, north),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_variants() {
        assert_eq!(
            Crs::parse("EPSG:32723").unwrap(),
            Crs::Utm {
                zone: 23,
                north: false
            }
        );
        assert_eq!(Crs::parse("epsg:4326").unwrap(), Crs::Wgs84);
        assert_eq!(Crs::parse("32630").unwrap().epsg(), 32630);
        assert!(Crs::parse("EPSG:3857").is_err());
        assert!(Crs::parse("utm").is_err());
    }

    #[test]
    fn test_display_uses_epsg_prefix() {
        let crs = Crs::from_epsg(32723).unwrap();
        assert_eq!(crs.to_string(), "EPSG:32723");
    }

    #[test]
    fn test_serde_as_string() {
        let crs = Crs::from_epsg(32630).unwrap();
        assert_eq!(serde_json::to_string(&crs).unwrap(), "\"EPSG:32630\"");
        let back: Crs = serde_json::from_str("\"EPSG:32630\"").unwrap();
        assert_eq!(back, crs);
    }

    #[test]
    fn test_utm_for_lonlat() {
        assert_eq!(
            Crs::utm_for_lonlat(-47.0, -15.0),
            Crs::Utm {
                zone: 23,
                north: false
            }
        );
        assert_eq!(
            Crs::utm_for_lonlat(-3.7, 40.4),
            Crs::Utm {
                zone: 30,
                north: true
            }
        );
        assert_eq!(Crs::utm_for_lonlat(180.0, 0.0).epsg(), 32660);
    }

    #[test]
    fn test_transform_identity() {
        let crs = Crs::Wgs84;
        assert_eq!(transform_point(crs, crs, 1.5, 2.5), (1.5, 2.5));
    }

    #[test]
    fn test_transform_between_zones() {
        let z22 = Crs::from_epsg(32722).unwrap();
        let z23 = Crs::from_epsg(32723).unwrap();
        let (x, y) = transform_point(Crs::Wgs84, z23, -47.5, -15.5);
        let (x22, y22) = transform_point(z23, z22, x, y);
        let (lon, lat) = transform_point(z22, Crs::Wgs84, x22, y22);
        assert!((lon + 47.5).abs() < 1e-5);
        assert!((lat + 15.5).abs() < 1e-5);
    }
}
