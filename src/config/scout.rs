// src/config/scout.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use crate::alerts::AlertThresholds;
use crate::categories::{self, CategorySet};
use crate::controller::ControllerConfig;
use crate::fetch::places::DEFAULT_PLACES_LIMIT;
use crate::fetch::{ApiFlavor, MIN_REQUEST_TIMEOUT};
use crate::params::{ParameterAdapter, MAX_HYSTERESIS};
use crate::scheduler::RetryPolicy;
use crate::sensors::bridge::DEFAULT_FIRST_FIX_TIMEOUT;

pub const ENV_CONFIG_PATH: &str = "SCOUT_CONFIG_PATH";
pub const ENV_WEATHER_URL: &str = "SCOUT_WEATHER_URL";
pub const ENV_PLACES_URL: &str = "SCOUT_PLACES_URL";
pub const ENV_API_FLAVOR: &str = "SCOUT_API_FLAVOR";
pub const ENV_API_KEY: &str = "GEOAPIFY_KEY";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "SCOUT_REQUEST_TIMEOUT_MS";

pub const DEFAULT_CONFIG_PATH: &str = "config/scout.toml";
/// The application backend as seen from a local device or emulator.
pub const DEFAULT_PROXY_URL: &str = "http://localhost:5000";
pub const DEFAULT_DIRECT_WEATHER_URL: &str = "https://api.open-meteo.com";
pub const DEFAULT_DIRECT_PLACES_URL: &str = "https://api.geoapify.com";

const MAX_RETRY_ATTEMPTS: u32 = 10;
const MIN_RETRY_DELAY_MS: u64 = 100;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoutConfig {
    pub providers: ProvidersConfig,
    pub controller: ControllerSection,
    pub retry: RetryPolicy,
    pub alerts: AlertThresholds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub flavor: ApiFlavor,
    /// Unset means the flavor's default endpoint.
    pub weather_base_url: Option<String>,
    pub places_base_url: Option<String>,
    /// Only sent with the `direct` flavor.
    pub api_key: Option<String>,
    pub places_limit: usize,
    pub request_timeout_ms: u64,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            flavor: ApiFlavor::Proxy,
            weather_base_url: None,
            places_base_url: None,
            api_key: None,
            places_limit: DEFAULT_PLACES_LIMIT,
            request_timeout_ms: MIN_REQUEST_TIMEOUT.as_millis() as u64,
        }
    }
}

impl ProvidersConfig {
    pub fn weather_url(&self) -> &str {
        match (&self.weather_base_url, self.flavor) {
            (Some(url), _) => url,
            (None, ApiFlavor::Proxy) => DEFAULT_PROXY_URL,
            (None, ApiFlavor::Direct) => DEFAULT_DIRECT_WEATHER_URL,
        }
    }

    pub fn places_url(&self) -> &str {
        match (&self.places_base_url, self.flavor) {
            (Some(url), _) => url,
            (None, ApiFlavor::Proxy) => DEFAULT_PROXY_URL,
            (None, ApiFlavor::Direct) => DEFAULT_DIRECT_PLACES_URL,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSection {
    /// Raw codes; unsupported ones are dropped on load.
    pub default_categories: Vec<String>,
    pub battery_hysteresis: f32,
    pub first_fix_timeout_ms: u64,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            default_categories: vec![
                "commercial.supermarket".into(),
                "catering.restaurant".into(),
            ],
            battery_hysteresis: 0.0,
            first_fix_timeout_ms: DEFAULT_FIRST_FIX_TIMEOUT.as_millis() as u64,
        }
    }
}

impl ScoutConfig {
    /// Parse TOML, then apply env overrides and sanitize.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: ScoutConfig = toml::from_str(s).context("parsing scout config")?;
        Ok(cfg.with_env_overrides()?.sanitized())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading scout config from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// 1) $SCOUT_CONFIG_PATH (must exist)
    /// 2) config/scout.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
            return Self::load_from(&pb);
        }
        let fallback = PathBuf::from(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            return Self::load_from(&fallback);
        }
        Ok(ScoutConfig::default().with_env_overrides()?.sanitized())
    }

    fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(url) = env_nonempty(ENV_WEATHER_URL) {
            self.providers.weather_base_url = Some(url);
        }
        if let Some(url) = env_nonempty(ENV_PLACES_URL) {
            self.providers.places_base_url = Some(url);
        }
        if let Some(flavor) = env_nonempty(ENV_API_FLAVOR) {
            self.providers.flavor = match flavor.to_ascii_lowercase().as_str() {
                "proxy" => ApiFlavor::Proxy,
                "direct" => ApiFlavor::Direct,
                other => anyhow::bail!("unsupported {ENV_API_FLAVOR}: {other}"),
            };
        }
        if let Some(key) = env_nonempty(ENV_API_KEY) {
            self.providers.api_key = Some(key);
        }
        if let Some(ms) = env_nonempty(ENV_REQUEST_TIMEOUT_MS) {
            self.providers.request_timeout_ms = ms
                .parse()
                .with_context(|| format!("{ENV_REQUEST_TIMEOUT_MS} must be milliseconds"))?;
        }
        Ok(self)
    }

    fn sanitized(mut self) -> Self {
        let floor = MIN_REQUEST_TIMEOUT.as_millis() as u64;
        if self.providers.request_timeout_ms < floor {
            tracing::warn!(
                requested_ms = self.providers.request_timeout_ms,
                floor_ms = floor,
                "request timeout below floor, raised"
            );
            self.providers.request_timeout_ms = floor;
        }
        if self.providers.places_limit == 0 {
            self.providers.places_limit = DEFAULT_PLACES_LIMIT;
        }
        self.providers.api_key = self.providers.api_key.filter(|k| !k.trim().is_empty());

        let h = self.controller.battery_hysteresis;
        self.controller.battery_hysteresis = if h.is_nan() {
            0.0
        } else {
            h.clamp(0.0, MAX_HYSTERESIS)
        };
        self.controller.default_categories = self.categories().iter().map(String::from).collect();

        let r = &mut self.retry;
        r.max_attempts = r.max_attempts.min(MAX_RETRY_ATTEMPTS);
        r.base_delay_ms = r.base_delay_ms.max(MIN_RETRY_DELAY_MS);
        if r.max_delay_ms < r.base_delay_ms {
            r.max_delay_ms = r.base_delay_ms;
        }

        self.alerts = self.alerts.sanitized();
        self
    }

    pub fn categories(&self) -> CategorySet {
        categories::validate(&self.controller.default_categories)
    }

    pub fn first_fix_timeout(&self) -> Duration {
        Duration::from_millis(self.controller.first_fix_timeout_ms)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            categories: self.categories(),
            adapter: ParameterAdapter::with_hysteresis(self.controller.battery_hysteresis),
            retry: self.retry,
        }
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
