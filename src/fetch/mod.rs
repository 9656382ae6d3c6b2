// src/fetch/mod.rs
//! Fetch orchestration: one weather call and one places call per refresh,
//! run concurrently and joined. Either both succeed or the whole fetch fails.

pub mod places;
pub mod weather;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};

use crate::categories::CategorySet;
use crate::errors::ScoutError;
use crate::params::NORMAL_REFRESH_MS;
use crate::sensors::Position;

pub use places::HttpPlacesProvider;
pub use weather::HttpWeatherProvider;

/// Per-call budget floor: the shortest refresh interval divided by 10.
pub const MIN_REQUEST_TIMEOUT: Duration = Duration::from_millis(NORMAL_REFRESH_MS / 10);

/// Number of hourly temperatures kept from the forecast.
pub const HOURLY_POINTS: usize = 5;

/// Request dialect spoken to the upstream services.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiFlavor {
    /// The application backend (`/weather`, `/places`).
    #[default]
    Proxy,
    /// Open-Meteo forecast and Geoapify places directly.
    Direct,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    pub temperature_c: f64,
    pub wind_speed_kmh: f64,
    pub precipitation_mm: f64,
    /// First [`HOURLY_POINTS`] hourly temperatures.
    pub hourly_temperatures_c: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceRecord {
    pub id: String,
    pub name: String,
    pub categories: Vec<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub formatted_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opening_hours: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}

impl PlaceRecord {
    /// Second part of "street, city, country" style addresses.
    pub fn city(&self) -> Option<&str> {
        self.formatted_address
            .split(", ")
            .nth(1)
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }

    /// Map search link for the details view: place name plus city.
    pub fn maps_search_url(&self) -> String {
        let query = match self.city() {
            Some(city) => format!("{} {}", self.name, city),
            None => self.name.clone(),
        };
        reqwest::Url::parse_with_params(
            "https://www.google.com/maps/search/",
            &[("api", "1"), ("query", query.trim())],
        )
        .map(String::from)
        .unwrap_or_default()
    }
}

/// Outcome of one successful orchestrated fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    pub weather: WeatherSnapshot,
    pub places: Vec<PlaceRecord>,
    pub fetched_at: DateTime<Utc>,
    /// Inputs the result was fetched for.
    pub position: Position,
    pub radius_meters: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct PlacesQuery<'a> {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_meters: u32,
    pub categories: &'a CategorySet,
}

#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn current(&self, latitude: f64, longitude: f64) -> Result<WeatherSnapshot, ScoutError>;
    fn name(&self) -> &'static str;
}

#[async_trait]
pub trait PlacesProvider: Send + Sync {
    async fn nearby(&self, query: &PlacesQuery<'_>) -> Result<Vec<PlaceRecord>, ScoutError>;
    fn name(&self) -> &'static str;
}

/// Shared HTTP client for both providers. Total request time is bounded by
/// the orchestrator, only the connect phase is limited here.
pub fn http_client() -> anyhow::Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("nearby-scout/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(5))
        .build()?;
    Ok(client)
}

pub struct FetchOrchestrator {
    weather: Arc<dyn WeatherProvider>,
    places: Arc<dyn PlacesProvider>,
    timeout: Duration,
}

impl FetchOrchestrator {
    pub fn new(weather: Arc<dyn WeatherProvider>, places: Arc<dyn PlacesProvider>) -> Self {
        Self {
            weather,
            places,
            timeout: MIN_REQUEST_TIMEOUT,
        }
    }

    /// Override the per-call budget. Configuration enforces
    /// [`MIN_REQUEST_TIMEOUT`]; this setter does not, so tests can use short budgets.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn fetch(
        &self,
        position: &Position,
        radius_meters: u32,
        categories: &CategorySet,
    ) -> Result<FetchResult, ScoutError> {
        if categories.is_empty() {
            return Err(ScoutError::EmptyFilter);
        }

        let started = Instant::now();
        let query = PlacesQuery {
            latitude: position.latitude,
            longitude: position.longitude,
            radius_meters,
            categories,
        };

        let weather = bounded(
            self.weather.name(),
            self.timeout,
            self.weather.current(position.latitude, position.longitude),
        );
        let places = bounded(self.places.name(), self.timeout, self.places.nearby(&query));

        // Fails fast: the first error drops the other call.
        let joined = tokio::try_join!(weather, places);
        histogram!("scout_fetch_duration_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

        let (weather, places) = joined?;
        tracing::debug!(
            target: "fetch",
            places = places.len(),
            radius_meters,
            "fetch joined"
        );
        Ok(FetchResult {
            weather,
            places,
            fetched_at: Utc::now(),
            position: *position,
            radius_meters,
        })
    }
}

async fn bounded<T, F>(provider: &'static str, limit: Duration, call: F) -> Result<T, ScoutError>
where
    F: Future<Output = Result<T, ScoutError>>,
{
    let out = match tokio::time::timeout(limit, call).await {
        Ok(r) => r,
        Err(_) => Err(ScoutError::Timeout {
            provider: provider.to_string(),
            after_ms: limit.as_millis() as u64,
        }),
    };
    if let Err(e) = &out {
        tracing::warn!(target: "fetch", provider, error = %e, "provider call failed");
        counter!("scout_provider_errors_total", "provider" => provider).increment(1);
    }
    out
}
