//! Current-position address lookup for prefilling the client form
//!
//! A [`ReverseGeocoder`] asks a [`PositionSource`] for coordinates and turns
//! them into a postal address through a Nominatim-compatible `/reverse`
//! endpoint. Failures are plain [`Error::Geolocation`] values; the form keeps
//! working without them.

use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org";
pub const USER_AGENT: &str = "BloomMaterialsTracker/1.0";

/// Resolves the device's current location to an address string
#[async_trait]
pub trait Geolocator: Send + Sync {
    async fn get_address(&self) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Provides the device's current coordinates
#[async_trait]
pub trait PositionSource: Send + Sync {
    async fn current_position(&self) -> Result<Coordinates>;
}

/// A position source that always reports the same place
#[derive(Debug, Clone, Copy)]
pub struct FixedPosition(pub Coordinates);

#[async_trait]
impl PositionSource for FixedPosition {
    async fn current_position(&self) -> Result<Coordinates> {
        Ok(self.0)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ReverseResponse {
    #[serde(default)]
    address: Option<AddressParts>,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AddressParts {
    pub house_number: Option<String>,
    pub road: Option<String>,
    pub city: Option<String>,
    pub town: Option<String>,
    pub village: Option<String>,
    pub state: Option<String>,
}

/// `"<house> <road>, <city|town|village>, <state>"`, skipping empty parts.
pub fn compose_address(parts: &AddressParts) -> String {
    let road = parts.road.as_deref().unwrap_or_default();
    let street = match parts.house_number.as_deref() {
        Some(number) => format!("{} {}", number, road),
        None => road.to_string(),
    };
    let locality = parts
        .city
        .as_deref()
        .or(parts.town.as_deref())
        .or(parts.village.as_deref())
        .unwrap_or_default();
    let state = parts.state.as_deref().unwrap_or_default();

    [street.trim(), locality.trim(), state.trim()]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(", ")
}

pub struct ReverseGeocoder {
    position: Arc<dyn PositionSource>,
    base_url: String,
    http_client: Client,
}

impl ReverseGeocoder {
    /// Geocodes against the public Nominatim service.
    pub fn new(position: Arc<dyn PositionSource>) -> Result<Self> {
        Self::with_base_url(position, NOMINATIM_URL)
    }

    pub fn with_base_url(position: Arc<dyn PositionSource>, base_url: &str) -> Result<Self> {
        let http_client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            position,
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    /// Address for the given coordinates.
    pub async fn reverse(&self, coordinates: Coordinates) -> Result<String> {
        let url = format!("{}/reverse", self.base_url);
        debug!(lat = coordinates.latitude, lon = coordinates.longitude, "reverse geocoding");

        let response = self
            .http_client
            .get(&url)
            .query(&[
                ("lat", coordinates.latitude.to_string()),
                ("lon", coordinates.longitude.to_string()),
                ("format", "json".to_string()),
            ])
            .send()
            .await
            .map_err(Error::geolocation)?;

        if !response.status().is_success() {
            return Err(Error::geolocation(format!(
                "Failed to get address ({})",
                response.status()
            )));
        }

        let body: ReverseResponse = response.json().await.map_err(Error::geolocation)?;
        let composed = body
            .address
            .as_ref()
            .map(compose_address)
            .unwrap_or_default();
        if !composed.is_empty() {
            return Ok(composed);
        }
        Ok(body.display_name.unwrap_or_default())
    }
}

#[async_trait]
impl Geolocator for ReverseGeocoder {
    async fn get_address(&self) -> Result<String> {
        let coordinates = self.position.current_position().await?;
        self.reverse(coordinates).await
    }
}

/// Loading and error state around a [`Geolocator`]
pub struct AddressLookup {
    geolocator: Arc<dyn Geolocator>,
    loading: bool,
    error: Option<String>,
}

impl AddressLookup {
    pub fn new(geolocator: Arc<dyn Geolocator>) -> Self {
        Self {
            geolocator,
            loading: false,
            error: None,
        }
    }

    pub fn loading(&self) -> bool {
        self.loading
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Looks up the current address; on failure the message is kept for
    /// display and `None` is returned.
    pub async fn lookup(&mut self) -> Option<String> {
        self.loading = true;
        self.error = None;
        let result = self.geolocator.get_address().await;
        self.loading = false;

        match result {
            Ok(address) => Some(address),
            Err(e) => {
                warn!(error = %e, "address lookup failed");
                self.error = Some(match e {
                    Error::Geolocation(message) => message,
                    other => other.to_string(),
                });
                None
            }
        }
    }

    pub fn dismiss_error(&mut self) {
        self.error = None;
    }
}
