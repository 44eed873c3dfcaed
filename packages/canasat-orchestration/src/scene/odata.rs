//! Copernicus Data Space OData catalog client.

use super::catalog::{Candidate, CatalogClient, SceneQuery};
use crate::config::{CatalogConfig, NetworkConfig};
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use canasat_raster::Bounds;
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, LOCATION};
use reqwest::{redirect, Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// OData `Products` client with bearer authentication.
///
/// Redirects are followed by hand so the bearer token survives the hop to
/// the download host.
pub struct ODataCatalog {
    http: Client,
    api_url: Url,
    access_token: Option<String>,
    collection: String,
    product_type: String,
    max_candidates: usize,
    max_redirects: usize,
    download_timeout: Duration,
}

impl ODataCatalog {
    pub fn new(
        catalog: &CatalogConfig,
        network: &NetworkConfig,
        access_token: Option<String>,
    ) -> Result<Self> {
        let mut base = catalog.api_url.trim_end_matches('/').to_string();
        base.push('/');
        let api_url = Url::parse(&base)
            .map_err(|e| OrchestratorError::invalid_request(format!("invalid catalog URL: {}", e)))?;

        let http = Client::builder()
            .timeout(network.timeout())
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| OrchestratorError::internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_url,
            access_token,
            collection: catalog.collection.clone(),
            product_type: catalog.product_type.clone(),
            max_candidates: catalog.max_candidates,
            max_redirects: network.max_redirects,
            download_timeout: network.download_timeout(),
        })
    }

    /// Token taken from the variable named by `catalog.access_token_env`.
    pub fn from_env(catalog: &CatalogConfig, network: &NetworkConfig) -> Result<Self> {
        let token = std::env::var(&catalog.access_token_env)
            .ok()
            .filter(|t| !t.trim().is_empty());
        if token.is_none() {
            warn!(var = %catalog.access_token_env, "no catalog access token set; downloads will likely be rejected");
        }
        Self::new(catalog, network, token)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.api_url
            .join(path)
            .map_err(|e| OrchestratorError::invalid_request(format!("invalid catalog path '{}': {}", path, e)))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    /// `$filter` expression for `query`.
    pub fn build_filter(&self, query: &SceneQuery) -> String {
        let mut parts = vec![
            format!("Collection/Name eq '{}'", self.collection),
            format!("ContentDate/Start ge {}", query.window.start_timestamp()),
            format!("ContentDate/Start lt {}", query.window.end_exclusive_timestamp()),
            format!(
                "OData.CSC.Intersects(Footprint, geography'SRID=4326;{}')",
                query.aoi.to_wkt()
            ),
            format!(
                "Attributes/OData.CSC.StringAttribute/any(att:att/Name eq 'productType' \
                 and att/OData.CSC.StringAttribute/Value eq '{}')",
                self.product_type
            ),
        ];
        if query.cloud.min > 0.0 {
            parts.push(cloud_filter("ge", query.cloud.min));
        }
        parts.push(cloud_filter("le", query.cloud.max));
        parts.join(" and ")
    }
}

fn cloud_filter(op: &str, value: f64) -> String {
    format!(
        "Attributes/OData.CSC.DoubleAttribute/any(att:att/Name eq 'cloudCover' \
         and att/OData.CSC.DoubleAttribute/Value {} {:.2})",
        op, value
    )
}

fn request_error(context: &str, err: reqwest::Error) -> OrchestratorError {
    if err.is_timeout() {
        OrchestratorError::source_unavailable(format!("{} timed out", context))
    } else if err.is_connect() {
        OrchestratorError::source_unavailable(format!("{}: cannot connect to catalog", context))
    } else {
        OrchestratorError::source_unavailable(format!("{}: {}", context, err))
    }
}

fn status_error(context: &str, status: StatusCode) -> OrchestratorError {
    let reason = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => "authentication rejected",
        StatusCode::TOO_MANY_REQUESTS => "rate limited",
        s if s.is_server_error() => "catalog server error",
        _ => "request rejected",
    };
    OrchestratorError::source_unavailable(format!("{}: {} (HTTP {})", context, reason, status.as_u16()))
}

// ═══════════════════════════════════════════════════════════════════════════
// Response payloads
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct ProductPage {
    #[serde(default)]
    value: Vec<ODataProduct>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ODataProduct {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    content_date: Option<ContentDate>,
    #[serde(default)]
    geo_footprint: Option<Value>,
    #[serde(default)]
    attributes: Vec<ODataAttribute>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContentDate {
    start: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ODataAttribute {
    name: String,
    #[serde(default)]
    value: Value,
}

impl ODataProduct {
    fn into_candidate(self) -> Option<Candidate> {
        let acquired_at = self
            .content_date
            .as_ref()
            .and_then(|d| DateTime::parse_from_rfc3339(&d.start).ok())
            .map(|d| d.with_timezone(&Utc))?;
        let cloud_cover = self
            .attributes
            .iter()
            .find(|a| a.name == "cloudCover")
            .and_then(|a| a.value.as_f64())?;
        let footprint = self.geo_footprint.as_ref().and_then(footprint_bounds);
        let title = self.name.clone();
        let id = self
            .name
            .as_deref()
            .map(|n| n.trim_end_matches(".zip").trim_end_matches(".SAFE").to_string())
            .unwrap_or_else(|| self.id.clone());
        Some(Candidate {
            id,
            title,
            acquired_at,
            cloud_cover,
            footprint,
            source: self.id,
        })
    }
}

fn footprint_bounds(geometry: &Value) -> Option<Bounds> {
    let mut positions = Vec::new();
    collect_positions(geometry.get("coordinates")?, &mut positions);
    Bounds::from_points(positions)
}

fn collect_positions(value: &Value, out: &mut Vec<(f64, f64)>) {
    let Some(items) = value.as_array() else {
        return;
    };
    if let (Some(x), Some(y)) = (items.first().and_then(Value::as_f64), items.get(1).and_then(Value::as_f64)) {
        out.push((x, y));
        return;
    }
    for item in items {
        collect_positions(item, out);
    }
}

fn parse_page(bytes: &[u8]) -> Result<Vec<Candidate>> {
    let page: ProductPage = serde_json::from_slice(bytes)
        .map_err(|e| OrchestratorError::source_unavailable(format!("unexpected catalog response: {}", e)))?;
    let total = page.value.len();
    let candidates: Vec<Candidate> = page.value.into_iter().filter_map(ODataProduct::into_candidate).collect();
    if candidates.len() < total {
        debug!(skipped = total - candidates.len(), "catalog products without date or cloud cover");
    }
    Ok(candidates)
}

#[async_trait]
impl CatalogClient for ODataCatalog {
    fn name(&self) -> &str {
        "odata"
    }

    async fn query(&self, query: &SceneQuery) -> Result<Vec<Candidate>> {
        let url = self.endpoint("Products")?;
        let filter = self.build_filter(query);
        let top = self.max_candidates.to_string();
        debug!(url = %url, filter = %filter, "querying catalog");

        let response = self
            .authorized(self.http.get(url))
            .query(&[
                ("$filter", filter.as_str()),
                ("$orderby", "ContentDate/Start desc"),
                ("$top", top.as_str()),
                ("$expand", "Attributes"),
            ])
            .send()
            .await
            .map_err(|e| request_error("catalog query", e))?;

        if !response.status().is_success() {
            return Err(status_error("catalog query", response.status()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| request_error("catalog query", e))?;
        let candidates = parse_page(&bytes)?;
        info!(catalog = self.name(), count = candidates.len(), "catalog query returned");
        Ok(candidates)
    }

    async fn download(&self, candidate: &Candidate, dest_dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dest_dir).await?;
        let name = candidate.title.clone().unwrap_or_else(|| candidate.id.clone());
        let archive_name = if name.ends_with(".zip") { name } else { format!("{}.zip", name) };
        let target = dest_dir.join(&archive_name);

        let mut url = self.endpoint(&format!("Products({})/$value", candidate.source))?;
        let mut redirects = 0;
        let mut response = loop {
            let response = self
                .authorized(self.http.get(url.clone()))
                .timeout(self.download_timeout)
                .send()
                .await
                .map_err(|e| request_error("product download", e))?;

            if !response.status().is_redirection() {
                break response;
            }
            if redirects >= self.max_redirects {
                return Err(OrchestratorError::source_unavailable(format!(
                    "product download exceeded {} redirects",
                    self.max_redirects
                )));
            }
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| OrchestratorError::source_unavailable("redirect without a Location header"))?;
            url = url
                .join(location)
                .map_err(|e| OrchestratorError::source_unavailable(format!("invalid redirect target: {}", e)))?;
            redirects += 1;
            debug!(product = %candidate.id, hop = redirects, "following download redirect");
        };

        if !response.status().is_success() {
            return Err(status_error("product download", response.status()));
        }

        let partial = dest_dir.join(format!("{}.part", archive_name));
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| request_error("product download", e))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&partial, &target).await?;

        info!(product = %candidate.id, bytes = written, "downloaded product archive");
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aoi::{AreaOfInterest, CloudBounds, DateWindow};

    fn catalog() -> ODataCatalog {
        ODataCatalog::new(&CatalogConfig::default(), &NetworkConfig::default(), Some("t0ken".into())).unwrap()
    }

    fn query(min: f64, max: f64) -> SceneQuery {
        SceneQuery {
            aoi: AreaOfInterest::from_bbox(-47.5, -22.5, -47.0, -22.0).unwrap(),
            window: DateWindow::parse("20240801", Some("2024-08-15")).unwrap(),
            cloud: CloudBounds::new(min, max).unwrap(),
        }
    }

    #[test]
    fn test_filter_contains_every_clause() {
        let filter = catalog().build_filter(&query(0.0, 30.0));
        assert!(filter.starts_with("Collection/Name eq 'SENTINEL-2'"));
        assert!(filter.contains("ContentDate/Start ge 2024-08-01T00:00:00Z"));
        assert!(filter.contains("ContentDate/Start lt 2024-08-16T00:00:00Z"));
        assert!(filter.contains("OData.CSC.Intersects(Footprint, geography'SRID=4326;POLYGON (("));
        assert!(filter.contains("att/OData.CSC.StringAttribute/Value eq 'S2MSI2A'"));
        assert!(filter.contains("att/OData.CSC.DoubleAttribute/Value le 30.00"));
        assert!(!filter.contains("Value ge"));
    }

    #[test]
    fn test_filter_adds_lower_cloud_bound_when_positive() {
        let filter = catalog().build_filter(&query(5.0, 20.0));
        assert!(filter.contains("att/OData.CSC.DoubleAttribute/Value ge 5.00"));
        assert!(filter.contains("att/OData.CSC.DoubleAttribute/Value le 20.00"));
    }

    #[test]
    fn test_parse_page() {
        let body = r#"{
            "value": [
                {
                    "Id": "a1b2",
                    "Name": "S2A_MSIL2A_20240807T131251_N0511_R138_T23KLP_20240807T170000.SAFE",
                    "ContentDate": {"Start": "2024-08-07T13:12:51.024Z", "End": "2024-08-07T13:12:51.024Z"},
                    "GeoFootprint": {"type": "Polygon", "coordinates": [[[-47.6, -22.6], [-46.9, -22.6], [-46.9, -21.9], [-47.6, -22.6]]]},
                    "Attributes": [
                        {"Name": "productType", "Value": "S2MSI2A"},
                        {"Name": "cloudCover", "Value": 8.25}
                    ]
                },
                {"Id": "no-cloud", "Name": "X", "ContentDate": {"Start": "2024-08-07T00:00:00Z"}}
            ]
        }"#;
        let candidates = parse_page(body.as_bytes()).unwrap();
        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert_eq!(c.id, "S2A_MSIL2A_20240807T131251_N0511_R138_T23KLP_20240807T170000");
        assert_eq!(c.source, "a1b2");
        assert_eq!(c.cloud_cover, 8.25);
        let fp = c.footprint.unwrap();
        assert_eq!((fp.min_x, fp.max_y), (-47.6, -21.9));
    }

    #[test]
    fn test_malformed_page_is_source_unavailable() {
        assert!(matches!(parse_page(b"<html>"), Err(OrchestratorError::SourceUnavailable(_))));
    }

    #[test]
    fn test_status_errors_are_retryable() {
        for status in [StatusCode::UNAUTHORIZED, StatusCode::TOO_MANY_REQUESTS, StatusCode::BAD_GATEWAY] {
            let err = status_error("catalog query", status);
            assert!(err.is_retryable(), "{} should be retryable", status);
        }
    }

    #[test]
    fn test_invalid_api_url_is_rejected() {
        let config = CatalogConfig {
            api_url: "not a url".to_string(),
            ..CatalogConfig::default()
        };
        assert!(ODataCatalog::new(&config, &NetworkConfig::default(), None).is_err());
    }
}
