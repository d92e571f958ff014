//! HTTP geocoding clients: Nominatim-style reverse geocoding and
//! ipapi-style IP geolocation. One request per call, no retries.

use crate::location::{IpLocation, IpLocator, LocationError, ReverseGeocoder};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org";
pub const DEFAULT_IPAPI_URL: &str = "https://ipapi.co";
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);

const USER_AGENT: &str = concat!("likeness/", env!("CARGO_PKG_VERSION"));

/// Shared client with a request timeout and an identifying user agent.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, LocationError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| LocationError::Lookup(e.to_string()))
}

async fn get_text(client: &reqwest::Client, url: &str, query: &[(&str, String)]) -> Result<String, LocationError> {
    let response = client
        .get(url)
        .query(query)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                LocationError::TimedOut
            } else {
                LocationError::Lookup(e.to_string())
            }
        })?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| LocationError::Lookup(e.to_string()))?;
    if !status.is_success() {
        return Err(LocationError::Lookup(format!("HTTP {}: {body}", status.as_u16())));
    }
    Ok(body)
}

#[derive(Debug, Deserialize)]
struct ReverseResponse {
    display_name: Option<String>,
    error: Option<String>,
}

/// Extract the address from a `reverse?format=jsonv2` response body.
pub fn parse_reverse(body: &str) -> Result<String, LocationError> {
    let parsed: ReverseResponse =
        serde_json::from_str(body).map_err(|e| LocationError::Lookup(e.to_string()))?;
    if let Some(error) = parsed.error {
        return Err(LocationError::Lookup(error));
    }
    parsed
        .display_name
        .filter(|name| !name.trim().is_empty())
        .ok_or(LocationError::PositionUnavailable)
}

pub struct NominatimGeocoder {
    client: reqwest::Client,
    base_url: String,
}

impl NominatimGeocoder {
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ReverseGeocoder for NominatimGeocoder {
    async fn reverse(&self, latitude: f64, longitude: f64) -> Result<String, LocationError> {
        let body = get_text(
            &self.client,
            &format!("{}/reverse", self.base_url),
            &[
                ("format", "jsonv2".to_string()),
                ("lat", latitude.to_string()),
                ("lon", longitude.to_string()),
            ],
        )
        .await?;
        parse_reverse(&body)
    }
}

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    latitude: Option<f64>,
    longitude: Option<f64>,
    city: Option<String>,
    region: Option<String>,
    country_name: Option<String>,
    #[serde(default)]
    error: bool,
    reason: Option<String>,
}

/// Extract position and "city, region, country" from an ipapi `/json/` body.
pub fn parse_ipapi(body: &str) -> Result<IpLocation, LocationError> {
    let parsed: IpApiResponse =
        serde_json::from_str(body).map_err(|e| LocationError::Lookup(e.to_string()))?;
    if parsed.error {
        return Err(LocationError::Lookup(
            parsed.reason.unwrap_or_else(|| "ip lookup rejected".into()),
        ));
    }
    let (Some(latitude), Some(longitude)) = (parsed.latitude, parsed.longitude) else {
        return Err(LocationError::PositionUnavailable);
    };
    let parts: Vec<String> = [parsed.city, parsed.region, parsed.country_name]
        .into_iter()
        .flatten()
        .filter(|s| !s.trim().is_empty())
        .collect();
    Ok(IpLocation {
        latitude,
        longitude,
        address: (!parts.is_empty()).then(|| parts.join(", ")),
    })
}

pub struct IpApiLocator {
    client: reqwest::Client,
    base_url: String,
}

impl IpApiLocator {
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl IpLocator for IpApiLocator {
    async fn locate(&self) -> Result<IpLocation, LocationError> {
        let body = get_text(&self.client, &format!("{}/json/", self.base_url), &[]).await?;
        parse_ipapi(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reverse_display_name() {
        let body = r#"{"place_id":1,"lat":"52.5","lon":"13.4","display_name":"Alexanderplatz, Mitte, Berlin, Deutschland"}"#;
        assert_eq!(
            parse_reverse(body).unwrap(),
            "Alexanderplatz, Mitte, Berlin, Deutschland"
        );
    }

    #[test]
    fn test_parse_reverse_error() {
        let err = parse_reverse(r#"{"error":"Unable to geocode"}"#).unwrap_err();
        assert_eq!(err, LocationError::Lookup("Unable to geocode".into()));
    }

    #[test]
    fn test_parse_reverse_rejects_garbage() {
        assert!(matches!(parse_reverse("<html>"), Err(LocationError::Lookup(_))));
    }

    #[test]
    fn test_parse_ipapi_address() {
        let body = r#"{"ip":"203.0.113.7","city":"Berlin","region":"Land Berlin","country_name":"Germany","latitude":52.5196,"longitude":13.4069}"#;
        let found = parse_ipapi(body).unwrap();
        assert_eq!(found.latitude, 52.5196);
        assert_eq!(found.address.as_deref(), Some("Berlin, Land Berlin, Germany"));
    }

    #[test]
    fn test_parse_ipapi_partial_address() {
        let body = r#"{"latitude":1.5,"longitude":2.5,"city":"","country_name":"Chile"}"#;
        assert_eq!(parse_ipapi(body).unwrap().address.as_deref(), Some("Chile"));
    }

    #[test]
    fn test_parse_ipapi_error_flag() {
        let body = r#"{"error":true,"reason":"RateLimited"}"#;
        assert_eq!(
            parse_ipapi(body).unwrap_err(),
            LocationError::Lookup("RateLimited".into())
        );
    }

    #[test]
    fn test_parse_ipapi_missing_coordinates() {
        assert_eq!(
            parse_ipapi(r#"{"city":"Berlin"}"#).unwrap_err(),
            LocationError::PositionUnavailable
        );
    }
}
