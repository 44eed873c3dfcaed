//! Sentinel-2 MSI spectral bands used by the pipeline

use crate::error::{RasterError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Spectral band, named by what it measures rather than by sensor code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    Blue,
    Green,
    Red,
    #[serde(rename = "rededge1")]
    RedEdge1,
    #[serde(rename = "rededge2")]
    RedEdge2,
    #[serde(rename = "rededge3")]
    RedEdge3,
    Nir,
    #[serde(rename = "rededge4")]
    RedEdge4,
    Swir1,
    Swir2,
}

impl Band {
    pub const ALL: [Band; 10] = [
        Band::Blue,
        Band::Green,
        Band::Red,
        Band::RedEdge1,
        Band::RedEdge2,
        Band::RedEdge3,
        Band::Nir,
        Band::RedEdge4,
        Band::Swir1,
        Band::Swir2,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Band::Blue => "blue",
            Band::Green => "green",
            Band::Red => "red",
            Band::RedEdge1 => "rededge1",
            Band::RedEdge2 => "rededge2",
            Band::RedEdge3 => "rededge3",
            Band::Nir => "nir",
            Band::RedEdge4 => "rededge4",
            Band::Swir1 => "swir1",
            Band::Swir2 => "swir2",
        }
    }

    /// Accepts the band name (`nir`) or the sensor code (`B08`, `b8a`).
    pub fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        Band::ALL
            .into_iter()
            .find(|b| b.as_str() == lower || b.sensor_code().eq_ignore_ascii_case(&lower))
            .ok_or_else(|| RasterError::UnknownBand(s.to_string()))
    }

    /// Sentinel-2 MSI band code.
    pub fn sensor_code(&self) -> &'static str {
        match self {
            Band::Blue => "B02",
            Band::Green => "B03",
            Band::Red => "B04",
            Band::RedEdge1 => "B05",
            Band::RedEdge2 => "B06",
            Band::RedEdge3 => "B07",
            Band::Nir => "B08",
            Band::RedEdge4 => "B8A",
            Band::Swir1 => "B11",
            Band::Swir2 => "B12",
        }
    }

    /// Native ground sampling distance in metres.
    pub fn native_resolution(&self) -> u32 {
        match self {
            Band::Blue | Band::Green | Band::Red | Band::Nir => 10,
            _ => 20,
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
