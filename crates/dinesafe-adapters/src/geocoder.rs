//! Geocoding provider contract and the Bing Maps Locations adapter.

use std::sync::Arc;

use async_trait::async_trait;
use dinesafe_core::GeocodedAddress;
use dinesafe_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const BING_LOCATIONS_ENDPOINT: &str = "https://dev.virtualearth.net/REST/v1/Locations";

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("geocoding `{address}` timed out")]
    Timeout { address: String },
    #[error("geocoding `{address}` failed")]
    Fetch {
        address: String,
        #[source]
        source: FetchError,
    },
    #[error("decoding geocoder response for `{address}`")]
    Decode {
        address: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid geocoder endpoint: {0}")]
    Endpoint(String),
}

impl GeocodeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, GeocodeError::Timeout { .. })
    }
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    fn provider(&self) -> &'static str;

    /// Resolve a free-form street address. `Ok(None)` means the provider has no match.
    async fn geocode(
        &self,
        run_id: Uuid,
        address: &str,
    ) -> Result<Option<GeocodedAddress>, GeocodeError>;
}

pub struct BingGeocoder {
    http: Arc<HttpFetcher>,
    api_key: String,
    endpoint: String,
}

impl BingGeocoder {
    pub fn new(http: Arc<HttpFetcher>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            endpoint: BING_LOCATIONS_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn request_url(&self, address: &str) -> Result<String, GeocodeError> {
        reqwest::Url::parse_with_params(
            &self.endpoint,
            &[
                ("query", address),
                ("inclnb", "1"),
                ("maxResults", "1"),
                ("key", self.api_key.as_str()),
            ],
        )
        .map(String::from)
        .map_err(|e| GeocodeError::Endpoint(e.to_string()))
    }
}

#[async_trait]
impl Geocoder for BingGeocoder {
    fn provider(&self) -> &'static str {
        "bing"
    }

    async fn geocode(
        &self,
        run_id: Uuid,
        address: &str,
    ) -> Result<Option<GeocodedAddress>, GeocodeError> {
        let url = self.request_url(address)?;
        let response = self
            .http
            .fetch_bytes(run_id, self.provider(), &url)
            .await
            .map_err(|source| {
                if source.is_timeout() {
                    GeocodeError::Timeout {
                        address: address.to_string(),
                    }
                } else {
                    GeocodeError::Fetch {
                        address: address.to_string(),
                        source,
                    }
                }
            })?;

        let result = parse_bing_response(address, &response.body).map_err(|source| {
            GeocodeError::Decode {
                address: address.to_string(),
                source,
            }
        })?;
        debug!(address, matched = result.is_some(), "bing geocode");
        Ok(result)
    }
}

#[derive(Debug, Deserialize)]
struct BingResponse {
    #[serde(rename = "resourceSets", default)]
    resource_sets: Vec<BingResourceSet>,
}

#[derive(Debug, Deserialize)]
struct BingResourceSet {
    #[serde(default)]
    resources: Vec<BingLocation>,
}

#[derive(Debug, Deserialize)]
struct BingLocation {
    point: Option<BingPoint>,
    #[serde(default)]
    address: BingAddress,
}

#[derive(Debug, Deserialize)]
struct BingPoint {
    #[serde(default)]
    coordinates: Vec<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct BingAddress {
    neighborhood: Option<String>,
    locality: Option<String>,
    #[serde(rename = "formattedAddress")]
    formatted_address: Option<String>,
    #[serde(rename = "postalCode")]
    postal_code: Option<String>,
}

/// Pick the first location of the first resource set; coordinates are `[lat, lon]`.
pub fn parse_bing_response(
    address: &str,
    body: &[u8],
) -> Result<Option<GeocodedAddress>, serde_json::Error> {
    let response: BingResponse = serde_json::from_slice(body)?;
    let Some(location) = response
        .resource_sets
        .into_iter()
        .next()
        .and_then(|set| set.resources.into_iter().next())
    else {
        return Ok(None);
    };

    let coordinates = location.point.map(|p| p.coordinates).unwrap_or_default();
    let (latitude, longitude) = match coordinates.as_slice() {
        [lat, lon, ..] => (Some(*lat), Some(*lon)),
        _ => (None, None),
    };

    Ok(Some(GeocodedAddress {
        address: address.to_string(),
        neighbourhood: location.address.neighborhood,
        locality: location.address.locality,
        formatted_address: location.address.formatted_address,
        postal_code: location.address.postal_code,
        latitude,
        longitude,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dinesafe_storage::HttpClientConfig;

    const BING_OK: &str = r#"{
        "resourceSets": [{
            "estimatedTotal": 1,
            "resources": [{
                "point": {"type": "Point", "coordinates": [43.65084, -79.38221]},
                "address": {
                    "addressLine": "100 Queen St W",
                    "neighborhood": "Financial District",
                    "locality": "Toronto",
                    "formattedAddress": "100 Queen St W, Toronto, ON M5H 2N2",
                    "postalCode": "M5H 2N2"
                }
            }]
        }],
        "statusCode": 200
    }"#;

    #[test]
    fn first_bing_location_is_used() {
        let result = parse_bing_response("100 Queen St W, Toronto, ON, Canada", BING_OK.as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(result.address, "100 Queen St W, Toronto, ON, Canada");
        assert_eq!(result.latitude, Some(43.65084));
        assert_eq!(result.longitude, Some(-79.38221));
        assert_eq!(result.neighbourhood.as_deref(), Some("Financial District"));
        assert_eq!(result.postal_code.as_deref(), Some("M5H 2N2"));
    }

    #[test]
    fn empty_resource_set_is_no_match() {
        let body = br#"{"resourceSets":[{"estimatedTotal":0,"resources":[]}]}"#;
        assert_eq!(parse_bing_response("nowhere", body).unwrap(), None);
        assert_eq!(parse_bing_response("nowhere", b"{}").unwrap(), None);
    }

    #[test]
    fn location_without_point_has_missing_coordinates() {
        let body = br#"{"resourceSets":[{"resources":[{"address":{"locality":"Toronto"}}]}]}"#;
        let result = parse_bing_response("x", body).unwrap().unwrap();
        assert_eq!(result.locality.as_deref(), Some("Toronto"));
        assert_eq!(result.latitude, None);
    }

    #[test]
    fn request_url_encodes_address_and_key() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let geocoder = BingGeocoder::new(http, "k3y");
        let url = geocoder.request_url("1 Main St & 2nd, Toronto").unwrap();
        assert!(url.starts_with(BING_LOCATIONS_ENDPOINT));
        assert!(url.contains("query=1+Main+St+%26+2nd%2C+Toronto"));
        assert!(url.contains("key=k3y"));
    }
}
