// src/sensors/mod.rs
//! Sensor boundary: battery gauge and location source.
//!
//! Sensors never touch controller state. They push readings into channels
//! handed to them by the controller, which consumes every signal from one
//! task.

pub mod bridge;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::ScoutError;

/// Minimum movement before the tracker emits a new fix.
pub const MIN_UPDATE_DISTANCE_M: f64 = 50.0;
/// Minimum spacing between two emitted fixes.
pub const MIN_UPDATE_INTERVAL_SECS: i64 = 30;

const EARTH_RADIUS_M: f64 = 6_371_008.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccuracyTier {
    High,
    Low,
}

/// One sampled device position. Superseded, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: AccuracyTier,
    pub captured_at: DateTime<Utc>,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64, accuracy: AccuracyTier) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
            captured_at: Utc::now(),
        }
    }

    pub fn with_captured_at(mut self, at: DateTime<Utc>) -> Self {
        self.captured_at = at;
        self
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Same fix delivered twice (e.g. around a tracker restart).
    pub fn same_fix(&self, other: &Position) -> bool {
        self.latitude == other.latitude
            && self.longitude == other.longitude
            && self.captured_at == other.captured_at
    }

    pub fn distance_m(&self, other: &Position) -> f64 {
        haversine_m(self.latitude, self.longitude, other.latitude, other.longitude)
    }
}

/// Great-circle distance in meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (p1, p2) = (lat1.to_radians(), lat2.to_radians());
    let dp = (lat2 - lat1).to_radians();
    let dl = (lon2 - lon1).to_radians();
    let a = (dp / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (dl / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Rate limiter for continuous tracking: a fix passes only when it is both
/// far enough and late enough after the last one that passed.
#[derive(Debug, Clone, Default)]
pub struct UpdateGate {
    last: Option<Position>,
}

impl UpdateGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<&Position> {
        self.last.as_ref()
    }

    /// Returns true and records the fix if it may be emitted.
    pub fn admit(&mut self, fix: &Position) -> bool {
        let pass = match &self.last {
            None => true,
            Some(prev) if prev.same_fix(fix) => false,
            Some(prev) => {
                let elapsed = fix.captured_at.signed_duration_since(prev.captured_at);
                elapsed >= ChronoDuration::seconds(MIN_UPDATE_INTERVAL_SECS)
                    && prev.distance_m(fix) >= MIN_UPDATE_DISTANCE_M
            }
        };
        if pass {
            self.last = Some(*fix);
        }
        pass
    }

    /// Seed the gate with a fix that reached the controller another way
    /// (the one-shot first fix), so tracking does not repeat it.
    pub fn record(&mut self, fix: &Position) {
        self.last = Some(*fix);
    }
}

/// Battery gauge contract.
#[async_trait]
pub trait BatteryMonitor: Send {
    /// Subscribe. The current level, when known, must be queued on `sink`
    /// before this returns; later changes follow as they happen.
    async fn start(&mut self, sink: mpsc::Sender<f32>) -> Result<(), ScoutError>;

    /// Release the subscription. Idempotent.
    fn stop(&mut self);

    fn name(&self) -> &'static str {
        "battery"
    }
}

/// What a running tracker reports to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationEvent {
    Fix(Position),
    /// Tracking can no longer deliver fixes, e.g. the grant was revoked.
    Fault(ScoutError),
    /// The last reported fault no longer applies.
    Restored,
}

/// Location source contract.
#[async_trait]
pub trait LocationTracker: Send {
    /// One fix, used before continuous tracking is established.
    async fn current_position(&mut self, tier: AccuracyTier) -> Result<Position, ScoutError>;

    /// Begin (or restart with a new tier) continuous tracking, gated by
    /// [`MIN_UPDATE_DISTANCE_M`] and [`MIN_UPDATE_INTERVAL_SECS`]. Faults
    /// that appear while tracking (and their recovery) go to `sink` too.
    async fn start(
        &mut self,
        tier: AccuracyTier,
        sink: mpsc::Sender<LocationEvent>,
    ) -> Result<(), ScoutError>;

    /// Stop tracking. Idempotent.
    fn stop(&mut self);

    fn name(&self) -> &'static str {
        "location"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fix(lat: f64, lon: f64, secs: i64) -> Position {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        Position::new(lat, lon, AccuracyTier::High).with_captured_at(t0 + ChronoDuration::seconds(secs))
    }

    #[test]
    fn haversine_known_distance() {
        // ~111.2 km per degree of latitude
        let d = haversine_m(37.0, -122.0, 38.0, -122.0);
        assert!((d - 111_195.0).abs() < 200.0, "{d}");
        assert_eq!(haversine_m(1.0, 2.0, 1.0, 2.0), 0.0);
    }

    #[test]
    fn gate_requires_distance_and_time() {
        let mut g = UpdateGate::new();
        assert!(g.admit(&fix(37.0, -122.0, 0)));
        // far but too soon
        assert!(!g.admit(&fix(37.01, -122.0, 10)));
        // late but too close (~11 m)
        assert!(!g.admit(&fix(37.0001, -122.0, 40)));
        // both bounds met (~1.1 km, 40 s)
        assert!(g.admit(&fix(37.01, -122.0, 40)));
    }

    #[test]
    fn gate_rejects_repeated_fix() {
        let mut g = UpdateGate::new();
        let f = fix(10.0, 10.0, 0);
        g.record(&f);
        assert!(!g.admit(&f));
    }

    #[test]
    fn validity_bounds() {
        assert!(fix(37.0, -122.0, 0).is_valid());
        assert!(!fix(91.0, 0.0, 0).is_valid());
        assert!(!fix(f64::NAN, 0.0, 0).is_valid());
    }
}
