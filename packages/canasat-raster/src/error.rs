//! Error types for canasat-raster

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RasterError>;

#[derive(Error, Debug)]
pub enum RasterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Grid mismatch: expected {expected}, found {actual}")]
    GridMismatch { expected: String, actual: String },

    #[error("Unsupported CRS: {0}")]
    UnsupportedCrs(String),

    #[error("Unknown band: {0}")]
    UnknownBand(String),

    #[error("Unknown index: {0}")]
    UnknownIndex(String),

    #[error("Missing input band '{band}' for index '{index}'")]
    MissingInput { index: String, band: String },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl RasterError {
    pub fn codec<E: std::fmt::Display>(e: E) -> Self {
        Self::Codec(e.to_string())
    }

    pub fn invalid_parameter<E: std::fmt::Display>(e: E) -> Self {
        Self::InvalidParameter(e.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for RasterError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        RasterError::codec(err)
    }
}
