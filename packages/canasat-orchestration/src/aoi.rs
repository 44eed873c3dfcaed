//! Request filters: area of interest, acquisition window, cloud-cover bounds.

use crate::error::{OrchestratorError, Result};
use canasat_raster::Bounds;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

// ═══════════════════════════════════════════════════════════════════════════
// Area of interest
// ═══════════════════════════════════════════════════════════════════════════

type Ring = Vec<(f64, f64)>;
type Polygon = Vec<Ring>;

/// Polygon or multipolygon in WGS84 lon/lat. Rings are always closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct AreaOfInterest {
    polygons: Vec<Polygon>,
}

impl AreaOfInterest {
    /// Accepts `Polygon`, `MultiPolygon`, `Feature` and `FeatureCollection`
    /// (first feature).
    pub fn from_geojson(value: &Value) -> Result<Self> {
        let geometry = extract_geometry(value)?;
        let gtype = geometry.get("type").and_then(Value::as_str).unwrap_or("");
        let coordinates = geometry
            .get("coordinates")
            .ok_or_else(|| OrchestratorError::invalid_request("GeoJSON geometry has no coordinates"))?;

        let polygons = match gtype {
            "Polygon" => vec![parse_polygon(coordinates)?],
            "MultiPolygon" => coordinates
                .as_array()
                .ok_or_else(|| OrchestratorError::invalid_request("MultiPolygon coordinates must be an array"))?
                .iter()
                .map(parse_polygon)
                .collect::<Result<Vec<_>>>()?,
            other => {
                return Err(OrchestratorError::invalid_request(format!(
                    "unsupported geometry type '{}'",
                    other
                )))
            }
        };
        if polygons.is_empty() {
            return Err(OrchestratorError::invalid_request("MultiPolygon has no polygons"));
        }
        Ok(Self { polygons })
    }

    pub fn from_geojson_str(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| OrchestratorError::invalid_request(format!("AOI is not valid JSON: {}", e)))?;
        Self::from_geojson(&value)
    }

    /// Rectangle from lon/lat corners.
    pub fn from_bbox(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Result<Self> {
        let b = Bounds::new(min_lon, min_lat, max_lon, max_lat);
        let ring = vec![
            (b.min_x, b.min_y),
            (b.max_x, b.min_y),
            (b.max_x, b.max_y),
            (b.min_x, b.max_y),
        ];
        Ok(Self {
            polygons: vec![vec![close_ring(ring)?]],
        })
    }

    /// Lon/lat envelope of every exterior ring.
    pub fn bounds(&self) -> Bounds {
        let points = self
            .polygons
            .iter()
            .filter_map(|p| p.first())
            .flat_map(|ring| ring.iter().copied());
        // Construction guarantees at least one ring with four points.
        Bounds::from_points(points).unwrap_or_else(|| Bounds::new(0.0, 0.0, 0.0, 0.0))
    }

    pub fn to_wkt(&self) -> String {
        let polygon_body = |polygon: &Polygon| {
            let rings: Vec<String> = polygon
                .iter()
                .map(|ring| {
                    let points: Vec<String> =
                        ring.iter().map(|(lon, lat)| format!("{} {}", lon, lat)).collect();
                    format!("({})", points.join(", "))
                })
                .collect();
            format!("({})", rings.join(", "))
        };

        if self.polygons.len() == 1 {
            format!("POLYGON {}", polygon_body(&self.polygons[0]))
        } else {
            let bodies: Vec<String> = self.polygons.iter().map(polygon_body).collect();
            format!("MULTIPOLYGON ({})", bodies.join(", "))
        }
    }

    pub fn to_geojson(&self) -> Value {
        let polygon_coords = |polygon: &Polygon| -> Value {
            Value::Array(
                polygon
                    .iter()
                    .map(|ring| Value::Array(ring.iter().map(|(x, y)| json!([x, y])).collect()))
                    .collect(),
            )
        };
        if self.polygons.len() == 1 {
            json!({ "type": "Polygon", "coordinates": polygon_coords(&self.polygons[0]) })
        } else {
            let coords: Vec<Value> = self.polygons.iter().map(polygon_coords).collect();
            json!({ "type": "MultiPolygon", "coordinates": coords })
        }
    }
}

impl TryFrom<Value> for AreaOfInterest {
    type Error = OrchestratorError;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_geojson(&value)
    }
}

impl From<AreaOfInterest> for Value {
    fn from(aoi: AreaOfInterest) -> Self {
        aoi.to_geojson()
    }
}

fn extract_geometry(value: &Value) -> Result<&Value> {
    match value.get("type").and_then(Value::as_str) {
        Some("FeatureCollection") => {
            let first = value
                .get("features")
                .and_then(Value::as_array)
                .and_then(|features| features.first())
                .ok_or_else(|| OrchestratorError::invalid_request("GeoJSON feature collection is empty"))?;
            extract_geometry(first)
        }
        Some("Feature") => value
            .get("geometry")
            .filter(|g| !g.is_null())
            .ok_or_else(|| OrchestratorError::invalid_request("GeoJSON feature has no geometry")),
        Some(_) => Ok(value),
        None => Err(OrchestratorError::invalid_request("GeoJSON object has no 'type'")),
    }
}

fn parse_polygon(coordinates: &Value) -> Result<Polygon> {
    let rings = coordinates
        .as_array()
        .ok_or_else(|| OrchestratorError::invalid_request("polygon coordinates must be an array of rings"))?;
    if rings.is_empty() {
        return Err(OrchestratorError::invalid_request("polygon has no rings"));
    }
    rings.iter().map(parse_ring).collect()
}

fn parse_ring(ring: &Value) -> Result<Ring> {
    let positions = ring
        .as_array()
        .ok_or_else(|| OrchestratorError::invalid_request("ring must be an array of positions"))?;
    let mut points = Vec::with_capacity(positions.len() + 1);
    for position in positions {
        let pair = position.as_array().filter(|p| p.len() >= 2);
        let (lon, lat) = match pair.map(|p| (p[0].as_f64(), p[1].as_f64())) {
            Some((Some(lon), Some(lat))) => (lon, lat),
            _ => {
                return Err(OrchestratorError::invalid_request(
                    "position must be [lon, lat] numbers",
                ))
            }
        };
        points.push((lon, lat));
    }
    close_ring(points)
}

fn close_ring(mut points: Ring) -> Result<Ring> {
    if points.is_empty() {
        return Err(OrchestratorError::invalid_request("polygon ring is empty"));
    }
    for &(lon, lat) in &points {
        if !(lon.is_finite() && lat.is_finite() && (-180.0..=180.0).contains(&lon) && (-90.0..=90.0).contains(&lat)) {
            return Err(OrchestratorError::invalid_request(format!(
                "coordinate ({}, {}) is outside lon/lat range",
                lon, lat
            )));
        }
    }
    if points.first() != points.last() {
        let first = points[0];
        points.push(first);
    }
    if points.len() < 4 {
        return Err(OrchestratorError::invalid_request(
            "polygon ring needs at least three distinct positions",
        ));
    }
    Ok(points)
}

// ═══════════════════════════════════════════════════════════════════════════
// Date window
// ═══════════════════════════════════════════════════════════════════════════

/// Inclusive acquisition date range (UTC days).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    /// Reversed bounds are swapped.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self { start: end, end: start }
        }
    }

    pub fn single(day: NaiveDate) -> Self {
        Self { start: day, end: day }
    }

    /// `start` alone selects a single day.
    pub fn parse(start: &str, end: Option<&str>) -> Result<Self> {
        let start = parse_date(start)?;
        match end {
            Some(end) => Ok(Self::new(start, parse_date(end)?)),
            None => Ok(Self::single(start)),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let day = at.date_naive();
        self.start <= day && day <= self.end
    }

    /// First instant of the window, `YYYY-MM-DDT00:00:00Z`.
    pub fn start_timestamp(&self) -> String {
        format!("{}T00:00:00Z", self.start.format("%Y-%m-%d"))
    }

    /// First instant after the window.
    pub fn end_exclusive_timestamp(&self) -> String {
        let next = self.end + Duration::days(1);
        format!("{}T00:00:00Z", next.format("%Y-%m-%d"))
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// `YYYY-MM-DD`, `YYYYMMDD`, or an RFC 3339 timestamp (date part kept).
pub fn parse_date(value: &str) -> Result<NaiveDate> {
    let value = value.trim();
    if value.is_empty() {
        return Err(OrchestratorError::invalid_request("date value cannot be empty"));
    }
    for fmt in ["%Y-%m-%d", "%Y%m%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(value, fmt) {
            return Ok(date);
        }
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc).date_naive());
    }
    Err(OrchestratorError::invalid_request(format!(
        "unsupported date format '{}', use YYYY-MM-DD or YYYYMMDD",
        value
    )))
}

// ═══════════════════════════════════════════════════════════════════════════
// Cloud bounds
// ═══════════════════════════════════════════════════════════════════════════

/// Inclusive cloud-cover percentage range within [0, 100].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CloudBounds {
    pub min: f64,
    pub max: f64,
}

impl CloudBounds {
    /// Reversed bounds are swapped.
    pub fn new(a: f64, b: f64) -> Result<Self> {
        for v in [a, b] {
            if !(v.is_finite() && (0.0..=100.0).contains(&v)) {
                return Err(OrchestratorError::invalid_request(format!(
                    "cloud cover bound {} is outside [0, 100]",
                    v
                )));
            }
        }
        Ok(Self {
            min: a.min(b),
            max: a.max(b),
        })
    }

    pub fn contains(&self, cloud_cover: f64) -> bool {
        self.min <= cloud_cover && cloud_cover <= self.max
    }
}

impl Default for CloudBounds {
    fn default() -> Self {
        Self { min: 0.0, max: 30.0 }
    }
}

impl fmt::Display for CloudBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_polygon_is_closed_and_exported_as_wkt() {
        let aoi = AreaOfInterest::from_geojson_str(
            r#"{"type":"Polygon","coordinates":[[[-47.5,-22.5],[-47.0,-22.5],[-47.0,-22.0],[-47.5,-22.0]]]}"#,
        )
        .unwrap();
        assert_eq!(
            aoi.to_wkt(),
            "POLYGON ((-47.5 -22.5, -47 -22.5, -47 -22, -47.5 -22, -47.5 -22.5))"
        );
        let b = aoi.bounds();
        assert_eq!((b.min_x, b.min_y, b.max_x, b.max_y), (-47.5, -22.5, -47.0, -22.0));
    }

    #[test]
    fn test_feature_collection_uses_first_feature() {
        let text = r#"{
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "properties": {}, "geometry":
                    {"type": "MultiPolygon", "coordinates": [
                        [[[0,0],[1,0],[1,1],[0,0]]],
                        [[[2,2],[3,2],[3,3],[2,2]]]
                    ]}},
                {"type": "Feature", "properties": {}, "geometry": null}
            ]
        }"#;
        let aoi = AreaOfInterest::from_geojson_str(text).unwrap();
        assert!(aoi.to_wkt().starts_with("MULTIPOLYGON (((0 0, 1 0"));
        assert_eq!(aoi.bounds().max_x, 3.0);
    }

    #[test]
    fn test_invalid_geometries_rejected() {
        assert!(AreaOfInterest::from_geojson_str(r#"{"type":"FeatureCollection","features":[]}"#).is_err());
        assert!(AreaOfInterest::from_geojson_str(r#"{"type":"Point","coordinates":[0,0]}"#).is_err());
        assert!(AreaOfInterest::from_geojson_str(r#"{"type":"Polygon","coordinates":[[[0,0],[1,1]]]}"#).is_err());
        assert!(AreaOfInterest::from_geojson_str(r#"{"type":"Polygon","coordinates":[[[0,0],[200,0],[1,1]]]}"#).is_err());
    }

    #[test]
    fn test_aoi_serde_roundtrip_as_geojson() {
        let aoi = AreaOfInterest::from_bbox(-47.5, -22.5, -47.0, -22.0).unwrap();
        let json = serde_json::to_value(&aoi).unwrap();
        assert_eq!(json["type"], "Polygon");
        let back: AreaOfInterest = serde_json::from_value(json).unwrap();
        assert_eq!(back, aoi);
    }

    #[test]
    fn test_date_parsing_formats() {
        assert_eq!(parse_date("2024-08-01").unwrap(), d(2024, 8, 1));
        assert_eq!(parse_date("20240815").unwrap(), d(2024, 8, 15));
        assert_eq!(parse_date("2024-08-15T13:45:00Z").unwrap(), d(2024, 8, 15));
        assert!(parse_date("15/08/2024").is_err());
        assert!(parse_date("").is_err());
    }

    #[test]
    fn test_date_window_swaps_and_contains() {
        let w = DateWindow::parse("20240815", Some("2024-08-01")).unwrap();
        assert_eq!(w.start, d(2024, 8, 1));
        assert_eq!(w.end, d(2024, 8, 15));
        assert!(w.contains(Utc.with_ymd_and_hms(2024, 8, 15, 23, 59, 59).unwrap()));
        assert!(!w.contains(Utc.with_ymd_and_hms(2024, 8, 16, 0, 0, 0).unwrap()));
        assert_eq!(w.start_timestamp(), "2024-08-01T00:00:00Z");
        assert_eq!(w.end_exclusive_timestamp(), "2024-08-16T00:00:00Z");
    }

    #[test]
    fn test_cloud_bounds() {
        let c = CloudBounds::new(30.0, 0.0).unwrap();
        assert_eq!((c.min, c.max), (0.0, 30.0));
        assert!(c.contains(8.0));
        assert!(c.contains(30.0));
        assert!(!c.contains(30.5));
        assert!(CloudBounds::new(-1.0, 20.0).is_err());
        assert!(CloudBounds::new(0.0, f64::NAN).is_err());
    }
}
