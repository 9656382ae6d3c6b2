// src/alerts.rs
//! Advisories derived from the latest weather and battery readings.
//! Purely informational; they never influence scheduling.

use serde::{Deserialize, Serialize};

use crate::params::LOW_BATTERY_THRESHOLD;
use crate::scheduler::ControllerState;

fn default_wind_kmh() -> f64 {
    15.0
}
fn default_precipitation_mm() -> f64 {
    5.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Strictly above this wind speed is "high wind".
    #[serde(default = "default_wind_kmh")]
    pub wind_kmh: f64,
    #[serde(default = "default_precipitation_mm")]
    pub precipitation_mm: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            wind_kmh: default_wind_kmh(),
            precipitation_mm: default_precipitation_mm(),
        }
    }
}

impl AlertThresholds {
    /// Replace negative or non-finite thresholds with the defaults.
    pub fn sanitized(mut self) -> Self {
        if !self.wind_kmh.is_finite() || self.wind_kmh < 0.0 {
            self.wind_kmh = default_wind_kmh();
        }
        if !self.precipitation_mm.is_finite() || self.precipitation_mm < 0.0 {
            self.precipitation_mm = default_precipitation_mm();
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Alert {
    HighWind { wind_speed_kmh: f64 },
    HeavyPrecipitation { precipitation_mm: f64 },
    LowBattery { level: f32 },
}

impl Alert {
    pub fn message(&self) -> &'static str {
        match self {
            Alert::HighWind { .. } => "High wind conditions",
            Alert::HeavyPrecipitation { .. } => "Heavy precipitation",
            Alert::LowBattery { .. } => "Low device battery",
        }
    }
}

/// Weather alerts use the last successful result, stale or not.
pub fn evaluate(state: &ControllerState, thresholds: &AlertThresholds) -> Vec<Alert> {
    let mut out = Vec::new();
    if let Some(result) = &state.last_result {
        let w = &result.weather;
        if w.wind_speed_kmh > thresholds.wind_kmh {
            out.push(Alert::HighWind {
                wind_speed_kmh: w.wind_speed_kmh,
            });
        }
        if w.precipitation_mm > thresholds.precipitation_mm {
            out.push(Alert::HeavyPrecipitation {
                precipitation_mm: w.precipitation_mm,
            });
        }
    }
    if state.battery_level < LOW_BATTERY_THRESHOLD {
        out.push(Alert::LowBattery {
            level: state.battery_level,
        });
    }
    out
}
