// src/api.rs
//! HTTP surface for the presentation layer and the device bridge.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::alerts::{self, Alert, AlertThresholds};
use crate::categories::CategorySet;
use crate::controller::ControllerHandle;
use crate::errors::ScoutError;
use crate::fetch::PlaceRecord;
use crate::scheduler::{ControllerState, TriggerOutcome};
use crate::sensors::bridge::DeviceFeed;

#[derive(Clone)]
pub struct AppState {
    pub controller: ControllerHandle,
    pub feed: DeviceFeed,
    pub alerts: AlertThresholds,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/state", get(get_state))
        .route("/places", get(get_places))
        .route("/alerts", get(get_alerts))
        .route("/refresh", post(refresh))
        .route("/categories", put(set_categories))
        .route("/categories/toggle", post(toggle_category))
        .route("/device/battery", post(device_battery))
        .route("/device/position", post(device_position))
        .route("/device/permission", post(device_permission))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// Domain error rendered as a JSON body with a matching status.
pub struct ApiError(ScoutError);

impl From<ScoutError> for ApiError {
    fn from(e: ScoutError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ScoutError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
            ScoutError::SensorUnavailable { .. } => StatusCode::CONFLICT,
            ScoutError::PositionUnavailable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ScoutError::PermissionDenied => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::debug!(target: "api", %status, error = %self.0, "request rejected");
        (status, Json(self.0)).into_response()
    }
}

async fn get_state(State(s): State<AppState>) -> Json<ControllerState> {
    Json(s.controller.state())
}

#[derive(Serialize)]
struct PlaceView {
    #[serde(flatten)]
    place: PlaceRecord,
    maps_url: String,
}

/// Places of the last successful fetch, with map links. Empty before the first.
async fn get_places(State(s): State<AppState>) -> Json<Vec<PlaceView>> {
    let places = s
        .controller
        .state()
        .last_result
        .map(|r| r.places)
        .unwrap_or_default();
    Json(
        places
            .into_iter()
            .map(|place| PlaceView {
                maps_url: place.maps_search_url(),
                place,
            })
            .collect(),
    )
}

#[derive(Serialize)]
struct AlertView {
    #[serde(flatten)]
    alert: Alert,
    message: &'static str,
}

async fn get_alerts(State(s): State<AppState>) -> Json<Vec<AlertView>> {
    let state = s.controller.state();
    Json(
        alerts::evaluate(&state, &s.alerts)
            .into_iter()
            .map(|alert| AlertView {
                message: alert.message(),
                alert,
            })
            .collect(),
    )
}

async fn refresh(State(s): State<AppState>) -> Result<Json<TriggerOutcome>, ApiError> {
    Ok(Json(s.controller.request_manual_refresh().await?))
}

#[derive(Deserialize)]
struct CategoriesReq {
    categories: Vec<String>,
}

#[derive(Serialize)]
struct CategoriesResp {
    categories: CategorySet,
}

async fn set_categories(
    State(s): State<AppState>,
    Json(body): Json<CategoriesReq>,
) -> Result<Json<CategoriesResp>, ApiError> {
    let categories = s.controller.set_categories(body.categories).await?;
    Ok(Json(CategoriesResp { categories }))
}

#[derive(Deserialize)]
struct ToggleReq {
    category: String,
}

async fn toggle_category(
    State(s): State<AppState>,
    Json(body): Json<ToggleReq>,
) -> Result<Json<CategoriesResp>, ApiError> {
    let categories = s.controller.toggle_category(&body.category).await?;
    Ok(Json(CategoriesResp { categories }))
}

#[derive(Deserialize)]
struct BatteryReq {
    level: f32,
}

async fn device_battery(
    State(s): State<AppState>,
    Json(body): Json<BatteryReq>,
) -> Result<StatusCode, ApiError> {
    s.feed.push_battery(body.level)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct PositionReq {
    latitude: f64,
    longitude: f64,
}

async fn device_position(
    State(s): State<AppState>,
    Json(body): Json<PositionReq>,
) -> Result<StatusCode, ApiError> {
    s.feed.push_fix(body.latitude, body.longitude)?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
struct PermissionReq {
    granted: bool,
}

async fn device_permission(
    State(s): State<AppState>,
    Json(body): Json<PermissionReq>,
) -> StatusCode {
    s.feed.set_permission(body.granted);
    StatusCode::NO_CONTENT
}
