//! Best-effort location through an ordered chain of sources.
//!
//! The chain never fails: when every source errors the resolver returns the
//! explicit "no location" record. The first source error travels with the
//! result so callers can tell the user why the position is missing or
//! approximate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use likeness_core::{LocationRecord, Provenance};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Accuracy radius reported for IP-derived positions, in meters.
pub const IP_FALLBACK_ACCURACY_M: f64 = 5000.0;

pub const DEFAULT_GEOLOCATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable")]
    PositionUnavailable,
    #[error("location request timed out")]
    TimedOut,
    #[error("geolocation not supported")]
    Unsupported,
    #[error("location lookup failed: {0}")]
    Lookup(String),
}

impl LocationError {
    /// Message suitable for showing to the person being registered.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "Location access was denied. Registration continues without it.",
            Self::PositionUnavailable => "Your position could not be determined.",
            Self::TimedOut => "Finding your location took too long.",
            Self::Unsupported => "This device cannot report its location.",
            Self::Lookup(_) => "Location lookup failed.",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PositionOptions {
    pub high_accuracy: bool,
    pub timeout: Duration,
    /// Oldest cached position the device may return; zero forces a fresh fix.
    pub maximum_age: Duration,
}

impl Default for PositionOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout: DEFAULT_GEOLOCATION_TIMEOUT,
            maximum_age: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub timestamp: DateTime<Utc>,
}

/// Device positioning.
#[async_trait]
pub trait Geolocation: Send + Sync {
    async fn get_current_position(&self, options: &PositionOptions)
        -> Result<Position, LocationError>;
}

/// Coordinates to a human-readable address.
#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    async fn reverse(&self, latitude: f64, longitude: f64) -> Result<String, LocationError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct IpLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub address: Option<String>,
}

/// Approximate position from the public IP address.
#[async_trait]
pub trait IpLocator: Send + Sync {
    async fn locate(&self) -> Result<IpLocation, LocationError>;
}

/// One step of the fallback chain. The returned record carries its
/// provenance.
#[async_trait]
pub trait LocationSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn locate(&self) -> Result<LocationRecord, LocationError>;
}

/// Fixed position configured for a stationary kiosk.
pub struct StaticGeolocation {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
}

#[async_trait]
impl Geolocation for StaticGeolocation {
    async fn get_current_position(
        &self,
        _options: &PositionOptions,
    ) -> Result<Position, LocationError> {
        Ok(Position {
            latitude: self.latitude,
            longitude: self.longitude,
            accuracy: self.accuracy,
            timestamp: Utc::now(),
        })
    }
}

/// Host without positioning hardware.
pub struct NoGeolocation;

#[async_trait]
impl Geolocation for NoGeolocation {
    async fn get_current_position(
        &self,
        _options: &PositionOptions,
    ) -> Result<Position, LocationError> {
        Err(LocationError::Unsupported)
    }
}

/// Device geolocation, with the address attached by reverse geocoding when
/// it succeeds.
pub struct DeviceSource {
    geolocation: Arc<dyn Geolocation>,
    geocoder: Option<Arc<dyn ReverseGeocoder>>,
    options: PositionOptions,
}

impl DeviceSource {
    pub fn new(
        geolocation: Arc<dyn Geolocation>,
        geocoder: Option<Arc<dyn ReverseGeocoder>>,
        options: PositionOptions,
    ) -> Self {
        Self {
            geolocation,
            geocoder,
            options,
        }
    }
}

#[async_trait]
impl LocationSource for DeviceSource {
    fn name(&self) -> &'static str {
        "device"
    }

    async fn locate(&self) -> Result<LocationRecord, LocationError> {
        let position = tokio::time::timeout(
            self.options.timeout,
            self.geolocation.get_current_position(&self.options),
        )
        .await
        .map_err(|_| LocationError::TimedOut)??;

        let mut record = LocationRecord::new(
            position.latitude,
            position.longitude,
            position.accuracy,
            position.timestamp,
            Provenance::DeviceGeolocation,
        );
        if let Some(geocoder) = &self.geocoder {
            record.address = reverse_best_effort(geocoder.as_ref(), &position).await;
        }
        Ok(record)
    }
}

/// IP-derived approximate position with a fixed accuracy radius.
pub struct IpSource {
    locator: Arc<dyn IpLocator>,
}

impl IpSource {
    pub fn new(locator: Arc<dyn IpLocator>) -> Self {
        Self { locator }
    }
}

#[async_trait]
impl LocationSource for IpSource {
    fn name(&self) -> &'static str {
        "ip"
    }

    async fn locate(&self) -> Result<LocationRecord, LocationError> {
        let found = self.locator.locate().await?;
        let mut record = LocationRecord::new(
            found.latitude,
            found.longitude,
            IP_FALLBACK_ACCURACY_M,
            Utc::now(),
            Provenance::IpGeolocationFallback,
        );
        record.address = found.address;
        Ok(record)
    }
}

async fn reverse_best_effort(geocoder: &dyn ReverseGeocoder, position: &Position) -> Option<String> {
    match geocoder.reverse(position.latitude, position.longitude).await {
        Ok(address) => Some(address),
        Err(e) => {
            tracing::warn!(error = %e, "reverse geocoding failed; keeping coordinates only");
            None
        }
    }
}

/// Outcome of one resolution. `error` is the first source failure, kept so
/// the person being registered can be told why the position is approximate
/// or missing.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub record: LocationRecord,
    pub error: Option<LocationError>,
}

impl From<LocationRecord> for Resolution {
    fn from(record: LocationRecord) -> Self {
        Self {
            record,
            error: None,
        }
    }
}

pub struct LocationResolver {
    sources: Vec<Box<dyn LocationSource>>,
    geocoder: Option<Arc<dyn ReverseGeocoder>>,
}

impl LocationResolver {
    pub fn new(sources: Vec<Box<dyn LocationSource>>) -> Self {
        Self {
            sources,
            geocoder: None,
        }
    }

    /// Geocoder used to attach addresses to caller-supplied coordinates.
    pub fn with_geocoder(mut self, geocoder: Arc<dyn ReverseGeocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    pub fn source_names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Try each source in order and return the first record produced,
    /// together with the error of the first source that failed.
    pub async fn resolve(&self) -> Resolution {
        let mut first_error = None;
        for source in &self.sources {
            match source.locate().await {
                Ok(record) => {
                    tracing::debug!(
                        source = source.name(),
                        provenance = ?record.provenance,
                        has_address = record.address.is_some(),
                        "location resolved"
                    );
                    return Resolution {
                        record,
                        error: first_error,
                    };
                }
                Err(e) => {
                    tracing::info!(source = source.name(), error = %e, "location source failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        tracing::info!("no location source succeeded");
        Resolution {
            record: LocationRecord::none(),
            error: first_error,
        }
    }

    /// Resolve with a caller-supplied hint.
    ///
    /// A hint with provenance is used unchanged. A hint with coordinates but
    /// no provenance is tagged `device-geolocation`, or `reverse-geocoded`
    /// when an address had to be looked up for it. Anything else falls back
    /// to [`Self::resolve`].
    pub async fn resolve_hint(&self, hint: Option<LocationRecord>) -> Resolution {
        let Some(mut hint) = hint else {
            return self.resolve().await;
        };
        if hint.is_none() {
            return Resolution::from(LocationRecord::none());
        }
        if hint.provenance.is_some() {
            return Resolution::from(hint);
        }
        let (Some(latitude), Some(longitude)) = (hint.latitude, hint.longitude) else {
            return self.resolve().await;
        };

        if hint.address.is_none() {
            if let Some(geocoder) = &self.geocoder {
                let position = Position {
                    latitude,
                    longitude,
                    accuracy: hint.accuracy.unwrap_or_default(),
                    timestamp: hint.timestamp,
                };
                hint.address = reverse_best_effort(geocoder.as_ref(), &position).await;
                if hint.address.is_some() {
                    hint.ensure_provenance(Provenance::ReverseGeocoded);
                }
            }
        }
        hint.ensure_provenance(Provenance::DeviceGeolocation);
        Resolution::from(hint)
    }
}
