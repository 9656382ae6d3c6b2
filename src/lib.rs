// src/lib.rs
// Public library surface for the binary, integration tests and embedders.

pub mod alerts;
pub mod api;
pub mod categories;
pub mod config;
pub mod controller;
pub mod errors;
pub mod fetch;
pub mod metrics;
pub mod params;
pub mod scheduler;
pub mod sensors;

// ---- Re-exports for stable public API ----
pub use crate::categories::{validate as validate_categories, CategorySet};
pub use crate::config::ScoutConfig;
pub use crate::controller::{Controller, ControllerConfig, ControllerHandle};
pub use crate::errors::ScoutError;
pub use crate::fetch::{FetchOrchestrator, FetchResult, PlaceRecord, WeatherSnapshot};
pub use crate::params::{OperatingParameters, ParameterAdapter};
pub use crate::scheduler::{ControllerState, Phase, TriggerOutcome};
pub use crate::sensors::bridge::DeviceFeed;

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tracing::info;

use crate::fetch::{HttpPlacesProvider, HttpWeatherProvider};

/// A wired application: HTTP router, the running controller and the device
/// feed the sensors read from.
pub struct App {
    pub router: Router,
    pub controller: ControllerHandle,
    pub feed: DeviceFeed,
}

/// Build the HTTP providers and the orchestrator described by `cfg`.
pub fn build_orchestrator(cfg: &ScoutConfig) -> anyhow::Result<FetchOrchestrator> {
    let client = fetch::http_client().context("building http client")?;
    let p = &cfg.providers;
    let weather = HttpWeatherProvider::new(p.weather_url(), p.flavor, client.clone());
    let places = HttpPlacesProvider::new(p.places_url(), p.flavor, client)
        .with_api_key(p.api_key.clone())
        .with_limit(p.places_limit);
    Ok(FetchOrchestrator::new(Arc::new(weather), Arc::new(places)).with_timeout(p.request_timeout()))
}

/// Start the controller on top of `feed` and assemble the router.
/// Must be called from within a Tokio runtime.
pub fn build_app(cfg: &ScoutConfig, feed: DeviceFeed) -> anyhow::Result<App> {
    let orchestrator = build_orchestrator(cfg)?;
    let feed = feed.with_first_fix_timeout(cfg.first_fix_timeout());
    let prometheus = metrics::init()?;

    info!(
        flavor = ?cfg.providers.flavor,
        weather = cfg.providers.weather_url(),
        places = cfg.providers.places_url(),
        categories = cfg.categories().len(),
        "starting controller"
    );
    let controller = Controller::start(
        cfg.controller_config(),
        Box::new(feed.battery_monitor()),
        Box::new(feed.location_tracker()),
        Arc::new(orchestrator),
    );

    let state = api::AppState {
        controller: controller.clone(),
        feed: feed.clone(),
        alerts: cfg.alerts,
    };
    let router = api::router(state).merge(metrics::router(prometheus));

    Ok(App {
        router,
        controller,
        feed,
    })
}
