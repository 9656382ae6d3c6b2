// src/fetch/places.rs
use std::collections::HashSet;

use async_trait::async_trait;
use metrics::counter;
use serde::Deserialize;

use super::{ApiFlavor, PlaceRecord, PlacesProvider, PlacesQuery};
use crate::errors::ScoutError;

const PROVIDER: &str = "places";

pub const DEFAULT_PLACES_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Option<Vec<serde_json::Value>>,
}

// Features are decoded one at a time so a single odd entry cannot sink
// the whole payload.
#[derive(Debug, Deserialize)]
struct Feature {
    geometry: Option<Geometry>,
    properties: Option<Properties>,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    #[serde(rename = "type")]
    kind: Option<String>,
    coordinates: Option<serde_json::Value>,
}

impl Geometry {
    /// `[lon, lat]` of a point geometry, if that is what this is.
    fn point(&self) -> Option<(f64, f64)> {
        if self.kind.as_deref().is_some_and(|k| k != "Point") {
            return None;
        }
        match self.coordinates.as_ref()?.as_array()?.as_slice() {
            [lon, lat, ..] => Some((lon.as_f64()?, lat.as_f64()?)),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct Properties {
    place_id: Option<String>,
    name: Option<String>,
    categories: Option<Vec<String>>,
    formatted: Option<String>,
    opening_hours: Option<String>,
    website: Option<String>,
}

fn to_record(value: serde_json::Value) -> Option<PlaceRecord> {
    let feature: Feature = serde_json::from_value(value).ok()?;
    let (longitude, latitude) = feature.geometry.as_ref().and_then(Geometry::point)?;
    let p = feature.properties?;
    let id = p.place_id.filter(|id| !id.is_empty())?;
    let formatted_address = p.formatted.unwrap_or_default();
    Some(PlaceRecord {
        id,
        name: p.name.unwrap_or_else(|| formatted_address.clone()),
        categories: p.categories.unwrap_or_default(),
        latitude,
        longitude,
        formatted_address,
        opening_hours: p.opening_hours,
        website: p.website,
    })
}

/// Decode a places payload into records.
///
/// Geometry is `[lon, lat]`; records carry latitude/longitude. Features
/// that do not decode, lack an id or are not points are skipped, repeated
/// ids keep the first occurrence, and at most `limit` records are returned.
pub fn normalize_features(body: &str, limit: usize) -> Result<Vec<PlaceRecord>, ScoutError> {
    let fc: FeatureCollection = serde_json::from_str(body)
        .map_err(|e| ScoutError::transport(PROVIDER, format!("decode places: {e}")))?;
    let features = fc.features.unwrap_or_default();

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(features.len().min(limit));
    let mut skipped = 0usize;

    for value in features {
        let Some(record) = to_record(value) else {
            skipped += 1;
            continue;
        };
        if !seen.insert(record.id.clone()) {
            continue;
        }
        out.push(record);
        if out.len() >= limit {
            break;
        }
    }

    if skipped > 0 {
        counter!("scout_places_skipped_total").increment(skipped as u64);
        tracing::warn!(target: "fetch", skipped, "malformed places features skipped");
    }
    Ok(out)
}

pub struct HttpPlacesProvider {
    base_url: String,
    flavor: ApiFlavor,
    api_key: Option<String>,
    limit: usize,
    client: reqwest::Client,
}

impl HttpPlacesProvider {
    pub fn new(base_url: impl Into<String>, flavor: ApiFlavor, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            flavor,
            api_key: None,
            limit: DEFAULT_PLACES_LIMIT,
            client,
        }
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key.filter(|k| !k.trim().is_empty());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    fn request(&self, q: &PlacesQuery<'_>) -> reqwest::RequestBuilder {
        match self.flavor {
            ApiFlavor::Proxy => self
                .client
                .get(format!("{}/places", self.base_url))
                .query(&[
                    ("lat", q.latitude.to_string()),
                    ("lon", q.longitude.to_string()),
                    ("radius", q.radius_meters.to_string()),
                    ("categories", q.categories.to_query()),
                ]),
            ApiFlavor::Direct => {
                let mut params = vec![
                    ("categories", q.categories.to_query()),
                    (
                        "filter",
                        format!("circle:{},{},{}", q.longitude, q.latitude, q.radius_meters),
                    ),
                    ("limit", self.limit.to_string()),
                ];
                if let Some(key) = &self.api_key {
                    params.push(("apiKey", key.clone()));
                }
                self.client
                    .get(format!("{}/v2/places", self.base_url))
                    .query(&params)
            }
        }
    }
}

#[async_trait]
impl PlacesProvider for HttpPlacesProvider {
    async fn nearby(&self, query: &PlacesQuery<'_>) -> Result<Vec<PlaceRecord>, ScoutError> {
        let resp = self
            .request(query)
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
        normalize_features(&body, self.limit)
    }

    fn name(&self) -> &'static str {
        PROVIDER
    }
}
