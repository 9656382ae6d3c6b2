// src/fetch/weather.rs
use async_trait::async_trait;
use serde::Deserialize;

use super::{ApiFlavor, WeatherProvider, WeatherSnapshot, HOURLY_POINTS};
use crate::errors::ScoutError;

const PROVIDER: &str = "weather";

#[derive(Debug, Deserialize)]
struct Forecast {
    current: Current,
    hourly: Hourly,
}

#[derive(Debug, Deserialize)]
struct Current {
    temperature_2m: f64,
    wind_speed_10m: f64,
    precipitation: f64,
}

#[derive(Debug, Deserialize)]
struct Hourly {
    // Open-Meteo reports missing hours as null.
    temperature_2m: Vec<Option<f64>>,
}

/// Decode an Open-Meteo style forecast body. The backend proxy passes the
/// upstream payload through, so both flavors share this shape.
pub fn parse_forecast(body: &str) -> Result<WeatherSnapshot, ScoutError> {
    let f: Forecast = serde_json::from_str(body)
        .map_err(|e| ScoutError::transport(PROVIDER, format!("decode forecast: {e}")))?;

    let hourly: Vec<f64> = f
        .hourly
        .temperature_2m
        .iter()
        .take(HOURLY_POINTS)
        .map_while(|t| *t)
        .collect();
    if hourly.len() < HOURLY_POINTS {
        return Err(ScoutError::transport(
            PROVIDER,
            format!(
                "forecast has {} usable hourly points, need {HOURLY_POINTS}",
                hourly.len()
            ),
        ));
    }

    Ok(WeatherSnapshot {
        temperature_c: f.current.temperature_2m,
        wind_speed_kmh: f.current.wind_speed_10m,
        precipitation_mm: f.current.precipitation,
        hourly_temperatures_c: hourly,
    })
}

pub struct HttpWeatherProvider {
    base_url: String,
    flavor: ApiFlavor,
    client: reqwest::Client,
}

impl HttpWeatherProvider {
    pub fn new(base_url: impl Into<String>, flavor: ApiFlavor, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            flavor,
            client,
        }
    }

    fn request(&self, latitude: f64, longitude: f64) -> reqwest::RequestBuilder {
        match self.flavor {
            ApiFlavor::Proxy => self
                .client
                .get(format!("{}/weather", self.base_url))
                .query(&[("lat", latitude.to_string()), ("lon", longitude.to_string())]),
            ApiFlavor::Direct => self
                .client
                .get(format!("{}/v1/forecast", self.base_url))
                .query(&[
                    ("latitude", latitude.to_string()),
                    ("longitude", longitude.to_string()),
                    (
                        "current",
                        "temperature_2m,wind_speed_10m,precipitation".to_string(),
                    ),
                    ("hourly", "temperature_2m".to_string()),
                    ("timezone", "auto".to_string()),
                ]),
        }
    }
}

#[async_trait]
impl WeatherProvider for HttpWeatherProvider {
    async fn current(&self, latitude: f64, longitude: f64) -> Result<WeatherSnapshot, ScoutError> {
        let resp = self
            .request(latitude, longitude)
            .send()
            .await
            .map_err(|e| ScoutError::transport(PROVIDER, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ScoutError::transport(PROVIDER, format!("HTTP {status}")));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| ScoutError::transport(PROVIDER, e))?;
        parse_forecast(&body)
    }

    fn name(&self) -> &'static str {
        PROVIDER
    }
}
