// src/sensors/bridge.rs
//! Device bridge: the platform pushes raw readings into a [`DeviceFeed`],
//! and the bridge sensors turn them into the battery/location contracts.
//!
//! Readings are held in `watch` channels (latest value wins), so a slow
//! consumer only ever sees the newest sample.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    AccuracyTier, BatteryMonitor, LocationEvent, LocationTracker, Position, UpdateGate,
};
use crate::errors::ScoutError;
use crate::params::clamp_level;

pub const DEFAULT_FIRST_FIX_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw fix as reported by the platform, before an accuracy tier is attached.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawFix {
    pub latitude: f64,
    pub longitude: f64,
    pub captured_at: DateTime<Utc>,
}

impl RawFix {
    fn into_position(self, tier: AccuracyTier) -> Position {
        Position {
            latitude: self.latitude,
            longitude: self.longitude,
            accuracy: tier,
            captured_at: self.captured_at,
        }
    }
}

struct FeedInner {
    /// `None` when the device has no battery gauge.
    battery: Option<watch::Sender<Option<f32>>>,
    fixes: watch::Sender<Option<RawFix>>,
    permission: watch::Sender<bool>,
}

/// Handle the device side writes sensor readings into. Cheap to clone.
#[derive(Clone)]
pub struct DeviceFeed {
    inner: Arc<FeedInner>,
    first_fix_timeout: Duration,
}

impl Default for DeviceFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceFeed {
    /// Battery gauge present (level unknown until pushed), location permission granted.
    pub fn new() -> Self {
        Self::build(true)
    }

    /// A device without a battery gauge.
    pub fn without_battery() -> Self {
        Self::build(false)
    }

    fn build(has_battery: bool) -> Self {
        let battery = has_battery.then(|| watch::channel(None).0);
        Self {
            inner: Arc::new(FeedInner {
                battery,
                fixes: watch::channel(None).0,
                permission: watch::channel(true).0,
            }),
            first_fix_timeout: DEFAULT_FIRST_FIX_TIMEOUT,
        }
    }

    pub fn with_first_fix_timeout(mut self, timeout: Duration) -> Self {
        self.first_fix_timeout = timeout;
        self
    }

    pub fn has_battery(&self) -> bool {
        self.inner.battery.is_some()
    }

    pub fn push_battery(&self, level: f32) -> Result<(), ScoutError> {
        let tx = self
            .inner
            .battery
            .as_ref()
            .ok_or_else(|| ScoutError::sensor_unavailable("battery"))?;
        tx.send_replace(Some(clamp_level(level)));
        Ok(())
    }

    pub fn push_fix(&self, latitude: f64, longitude: f64) -> Result<(), ScoutError> {
        self.push_fix_at(latitude, longitude, Utc::now())
    }

    pub fn push_fix_at(
        &self,
        latitude: f64,
        longitude: f64,
        captured_at: DateTime<Utc>,
    ) -> Result<(), ScoutError> {
        let fix = RawFix {
            latitude,
            longitude,
            captured_at,
        };
        if !fix.into_position(AccuracyTier::High).is_valid() {
            return Err(ScoutError::position_unavailable(format!(
                "invalid coordinates ({latitude}, {longitude})"
            )));
        }
        self.inner.fixes.send_replace(Some(fix));
        Ok(())
    }

    pub fn set_permission(&self, granted: bool) {
        self.inner.permission.send_replace(granted);
    }

    pub fn permission_granted(&self) -> bool {
        *self.inner.permission.borrow()
    }

    pub fn battery_monitor(&self) -> BridgeBatteryMonitor {
        BridgeBatteryMonitor {
            feed: self.clone(),
            running: None,
        }
    }

    pub fn location_tracker(&self) -> BridgeLocationTracker {
        BridgeLocationTracker {
            feed: self.clone(),
            gate: Arc::new(Mutex::new(UpdateGate::new())),
            running: None,
        }
    }
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Running {
    fn cancel(self) {
        self.token.cancel();
        self.handle.abort();
    }
}

pub struct BridgeBatteryMonitor {
    feed: DeviceFeed,
    running: Option<Running>,
}

#[async_trait]
impl BatteryMonitor for BridgeBatteryMonitor {
    async fn start(&mut self, sink: mpsc::Sender<f32>) -> Result<(), ScoutError> {
        self.stop();
        let tx = self
            .feed
            .inner
            .battery
            .as_ref()
            .ok_or_else(|| ScoutError::sensor_unavailable("battery"))?;

        let mut rx = tx.subscribe();
        let mut last = *rx.borrow_and_update();
        if let Some(level) = last {
            sink.send(level).await.map_err(|_| ScoutError::Stopped)?;
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let level = *rx.borrow_and_update();
                        if level.is_none() || level == last {
                            continue;
                        }
                        last = level;
                        if let Some(level) = level {
                            if sink.send(level).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            tracing::debug!(target: "sensors", "battery subscription ended");
        });
        self.running = Some(Running { token, handle });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(r) = self.running.take() {
            r.cancel();
        }
    }

    fn name(&self) -> &'static str {
        "bridge-battery"
    }
}

impl Drop for BridgeBatteryMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct BridgeLocationTracker {
    feed: DeviceFeed,
    // Shared across restarts so a fix is never emitted twice.
    gate: Arc<Mutex<UpdateGate>>,
    running: Option<Running>,
}

fn lock(gate: &Mutex<UpdateGate>) -> MutexGuard<'_, UpdateGate> {
    gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn next_fix(rx: &mut watch::Receiver<Option<RawFix>>) -> Option<RawFix> {
    loop {
        if rx.changed().await.is_err() {
            return None;
        }
        if let Some(fix) = *rx.borrow_and_update() {
            return Some(fix);
        }
    }
}

#[async_trait]
impl LocationTracker for BridgeLocationTracker {
    async fn current_position(&mut self, tier: AccuracyTier) -> Result<Position, ScoutError> {
        if !self.feed.permission_granted() {
            return Err(ScoutError::PermissionDenied);
        }

        let mut fixes = self.feed.inner.fixes.subscribe();
        let latest = *fixes.borrow_and_update();
        let raw = match latest {
            Some(fix) => fix,
            None => match tokio::time::timeout(self.feed.first_fix_timeout, next_fix(&mut fixes))
                .await
            {
                Ok(Some(fix)) => fix,
                _ => {
                    return Err(ScoutError::position_unavailable(format!(
                        "no fix within {} ms",
                        self.feed.first_fix_timeout.as_millis()
                    )))
                }
            },
        };

        let pos = raw.into_position(tier);
        lock(&self.gate).record(&pos);
        Ok(pos)
    }

    async fn start(
        &mut self,
        tier: AccuracyTier,
        sink: mpsc::Sender<LocationEvent>,
    ) -> Result<(), ScoutError> {
        self.stop();

        let mut fixes = self.feed.inner.fixes.subscribe();
        let mut permission = self.feed.inner.permission.subscribe();
        // Grant as of start; only later transitions are reported.
        let mut granted = *permission.borrow();
        let gate = self.gate.clone();
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let handle = tokio::spawn(async move {
            // Evaluate the latest fix first: one that arrived while the
            // tracker was restarting must not be lost.
            let mut pending = true;
            loop {
                if pending {
                    pending = false;
                    let now_granted = *permission.borrow_and_update();
                    if now_granted != granted {
                        granted = now_granted;
                        let event = if granted {
                            tracing::info!(target: "sensors", "location permission restored");
                            LocationEvent::Restored
                        } else {
                            tracing::warn!(target: "sensors", "location permission revoked");
                            LocationEvent::Fault(ScoutError::PermissionDenied)
                        };
                        if sink.send(event).await.is_err() {
                            break;
                        }
                    }
                    let latest = *fixes.borrow_and_update();
                    if let (true, Some(raw)) = (granted, latest) {
                        let pos = raw.into_position(tier);
                        let admitted = lock(&gate).admit(&pos);
                        if admitted && sink.send(LocationEvent::Fix(pos)).await.is_err() {
                            break;
                        }
                    }
                }
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    r = fixes.changed() => {
                        if r.is_err() {
                            break;
                        }
                        pending = true;
                    }
                    r = permission.changed() => {
                        if r.is_err() {
                            break;
                        }
                        pending = true;
                    }
                }
            }
            tracing::debug!(target: "sensors", ?tier, "location tracking ended");
        });

        tracing::debug!(target: "sensors", ?tier, "location tracking started");
        self.running = Some(Running { token, handle });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(r) = self.running.take() {
            r.cancel();
        }
    }

    fn name(&self) -> &'static str {
        "bridge-location"
    }
}

impl Drop for BridgeLocationTracker {
    fn drop(&mut self) {
        self.stop();
    }
}
