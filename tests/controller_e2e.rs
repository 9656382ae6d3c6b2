// tests/controller_e2e.rs
//
// Controller scenarios on a paused Tokio clock, with in-process providers
// and the device bridge standing in for platform sensors.
//
// Covered:
// - battery crossing the breakpoint re-arms the timer and restarts tracking
// - empty category filter: tick issues no call and leaves state untouched
// - stop discards an in-flight fetch; later calls report Stopped
// - stale result survives a failure; success clears the error
// - manual refresh while fetching is a no-op
// - permission denied until a fix arrives
// - permission revoked mid-run blocks fetches until restored
// - commands answered while the first fix is pending
// - missing battery gauge degrades to a warning
// - randomized soak: never more than one fetch in flight

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, watch};

use nearby_scout::categories::validate;
use nearby_scout::controller::{Controller, ControllerConfig, ControllerHandle};
use nearby_scout::fetch::{
    FetchOrchestrator, PlaceRecord, PlacesProvider, PlacesQuery, WeatherProvider, WeatherSnapshot,
};
use nearby_scout::params::adapt;
use nearby_scout::scheduler::{ControllerState, Phase, TriggerOutcome};
use nearby_scout::sensors::bridge::{BridgeLocationTracker, DeviceFeed};
use nearby_scout::sensors::{AccuracyTier, LocationEvent, LocationTracker, Position};
use nearby_scout::ScoutError;

/// Shared knobs and counters for the fake providers.
#[derive(Default)]
struct Upstream {
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    fail: AtomicBool,
    delay_ms: AtomicUsize,
    last_radius: AtomicUsize,
}

impl Upstream {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let ms = self.delay_ms.load(Ordering::SeqCst) as u64;
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

struct FakeWeather(Arc<Upstream>);

#[async_trait]
impl WeatherProvider for FakeWeather {
    async fn current(&self, _lat: f64, _lon: f64) -> Result<WeatherSnapshot, ScoutError> {
        let u = &self.0;
        u.calls.fetch_add(1, Ordering::SeqCst);
        let now = u.active.fetch_add(1, Ordering::SeqCst) + 1;
        u.max_active.fetch_max(now, Ordering::SeqCst);
        u.pause().await;
        u.active.fetch_sub(1, Ordering::SeqCst);
        if u.fail.load(Ordering::SeqCst) {
            return Err(ScoutError::transport("weather", "HTTP 503 Service Unavailable"));
        }
        Ok(WeatherSnapshot {
            temperature_c: 18.0,
            wind_speed_kmh: 10.0,
            precipitation_mm: 0.0,
            hourly_temperatures_c: vec![18.0, 19.0, 20.0, 21.0, 22.0],
        })
    }

    fn name(&self) -> &'static str {
        "weather"
    }
}

struct FakePlaces(Arc<Upstream>);

#[async_trait]
impl PlacesProvider for FakePlaces {
    async fn nearby(&self, q: &PlacesQuery<'_>) -> Result<Vec<PlaceRecord>, ScoutError> {
        self.0
            .last_radius
            .store(q.radius_meters as usize, Ordering::SeqCst);
        self.0.pause().await;
        Ok(vec![PlaceRecord {
            id: "cafe-1".into(),
            name: "Corner Cafe".into(),
            categories: vec!["catering.cafe".into()],
            latitude: q.latitude,
            longitude: q.longitude,
            formatted_address: "1 Main St, Springfield, USA".into(),
            opening_hours: None,
            website: None,
        }])
    }

    fn name(&self) -> &'static str {
        "places"
    }
}

/// Bridge tracker that records every `start` tier.
struct RecordingTracker {
    inner: BridgeLocationTracker,
    starts: Arc<Mutex<Vec<AccuracyTier>>>,
}

#[async_trait]
impl LocationTracker for RecordingTracker {
    async fn current_position(&mut self, tier: AccuracyTier) -> Result<Position, ScoutError> {
        self.inner.current_position(tier).await
    }

    async fn start(
        &mut self,
        tier: AccuracyTier,
        sink: mpsc::Sender<LocationEvent>,
    ) -> Result<(), ScoutError> {
        self.starts.lock().unwrap().push(tier);
        self.inner.start(tier, sink).await
    }

    fn stop(&mut self) {
        self.inner.stop();
    }
}

struct Rig {
    handle: ControllerHandle,
    feed: DeviceFeed,
    upstream: Arc<Upstream>,
    starts: Arc<Mutex<Vec<AccuracyTier>>>,
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
}

fn start(feed: DeviceFeed, config: ControllerConfig) -> Rig {
    let upstream = Arc::new(Upstream::default());
    let orchestrator = FetchOrchestrator::new(
        Arc::new(FakeWeather(upstream.clone())),
        Arc::new(FakePlaces(upstream.clone())),
    )
    .with_timeout(Duration::from_secs(30));
    let starts = Arc::new(Mutex::new(Vec::new()));
    let tracker = RecordingTracker {
        inner: feed.location_tracker(),
        starts: starts.clone(),
    };
    let handle = Controller::start(
        config,
        Box::new(feed.battery_monitor()),
        Box::new(tracker),
        Arc::new(orchestrator),
    );
    Rig {
        handle,
        feed,
        upstream,
        starts,
    }
}

fn cafe_config() -> ControllerConfig {
    ControllerConfig {
        categories: validate(["catering.cafe"]),
        ..ControllerConfig::default()
    }
}

async fn wait_for(
    rx: &mut watch::Receiver<ControllerState>,
    pred: impl FnMut(&ControllerState) -> bool,
) -> ControllerState {
    tokio::time::timeout(Duration::from_secs(60), rx.wait_for(pred))
        .await
        .expect("state condition not reached")
        .expect("controller dropped its state")
        .clone()
}

#[tokio::test(start_paused = true)]
async fn battery_drop_switches_to_power_saver_cadence() {
    let feed = DeviceFeed::new();
    feed.push_battery(0.5).unwrap();
    feed.push_fix_at(37.0, -122.0, t0()).unwrap();
    let rig = start(feed, cafe_config());
    let mut rx = rig.handle.subscribe();

    let s = wait_for(&mut rx, |s| s.phase == Phase::Ready).await;
    assert_eq!(s.timer_interval_ms, Some(300_000));
    assert_eq!(s.current_parameters.radius_meters, 5_000);
    assert_eq!(rig.upstream.calls(), 1);
    assert_eq!(*rig.starts.lock().unwrap(), vec![AccuracyTier::High]);

    rig.feed.push_battery(0.2).unwrap();
    let s = wait_for(&mut rx, |s| s.timer_interval_ms == Some(600_000)).await;
    assert_eq!(s.current_parameters.radius_meters, 10_000);
    assert_eq!(s.current_parameters.accuracy, AccuracyTier::Low);
    assert_eq!(
        *rig.starts.lock().unwrap(),
        vec![AccuracyTier::High, AccuracyTier::Low]
    );

    // The 300 s timer was replaced, not stacked.
    tokio::time::sleep(Duration::from_secs(310)).await;
    assert_eq!(rig.upstream.calls(), 1);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(rig.upstream.calls(), 2);
    assert_eq!(rig.upstream.last_radius.load(Ordering::SeqCst), 10_000);

    rig.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn empty_filter_tick_is_a_silent_skip() {
    let feed = DeviceFeed::new();
    feed.push_fix_at(37.0, -122.0, t0()).unwrap();
    let rig = start(feed, cafe_config());
    let mut rx = rig.handle.subscribe();
    wait_for(&mut rx, |s| s.phase == Phase::Ready).await;

    let set = rig
        .handle
        .set_categories(Vec::<String>::new())
        .await
        .unwrap();
    assert!(set.is_empty());
    let before = rig.handle.state();

    tokio::time::sleep(Duration::from_secs(301)).await;
    assert_eq!(rig.upstream.calls(), 1);
    assert_eq!(rig.handle.state(), before);

    assert_eq!(
        rig.handle.request_manual_refresh().await.unwrap(),
        TriggerOutcome::EmptyFilter
    );
    rig.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_discards_in_flight_fetch() {
    let feed = DeviceFeed::new();
    feed.push_fix_at(37.0, -122.0, t0()).unwrap();
    let rig = start(feed, cafe_config());
    rig.upstream.delay_ms.store(5_000, Ordering::SeqCst);
    let mut rx = rig.handle.subscribe();
    wait_for(&mut rx, |s| s.is_fetching).await;

    rig.handle.stop().await;
    let stopped = rig.handle.state();
    assert_eq!(stopped.phase, Phase::Stopped);
    assert!(!stopped.is_fetching);
    assert!(stopped.last_result.is_none());
    assert_eq!(stopped.timer_interval_ms, None);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(rig.handle.state(), stopped);
    assert_eq!(
        rig.handle.request_manual_refresh().await,
        Err(ScoutError::Stopped)
    );
    // second stop is a no-op
    rig.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn failure_keeps_stale_result_until_next_success() {
    let feed = DeviceFeed::new();
    feed.push_fix_at(37.0, -122.0, t0()).unwrap();
    let rig = start(feed, cafe_config());
    let mut rx = rig.handle.subscribe();
    let ready = wait_for(&mut rx, |s| s.phase == Phase::Ready).await;

    rig.upstream.fail.store(true, Ordering::SeqCst);
    let out = rig.handle.request_manual_refresh().await.unwrap();
    assert!(matches!(out, TriggerOutcome::Started { .. }));
    let errored = wait_for(&mut rx, |s| s.phase == Phase::Errored).await;
    assert_eq!(errored.last_result, ready.last_result);
    assert!(matches!(
        errored.last_error,
        Some(ScoutError::Transport { .. })
    ));

    rig.upstream.fail.store(false, Ordering::SeqCst);
    rig.handle.request_manual_refresh().await.unwrap();
    let healed = wait_for(&mut rx, |s| s.phase == Phase::Ready).await;
    assert!(healed.last_error.is_none());
    assert_eq!(rig.upstream.calls(), 3);

    rig.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn manual_refresh_while_fetching_is_dropped() {
    let feed = DeviceFeed::new();
    feed.push_fix_at(37.0, -122.0, t0()).unwrap();
    let rig = start(feed, cafe_config());
    rig.upstream.delay_ms.store(2_000, Ordering::SeqCst);
    let mut rx = rig.handle.subscribe();
    wait_for(&mut rx, |s| s.is_fetching).await;

    assert_eq!(
        rig.handle.request_manual_refresh().await.unwrap(),
        TriggerOutcome::AlreadyFetching
    );
    wait_for(&mut rx, |s| s.phase == Phase::Ready).await;
    assert_eq!(rig.upstream.calls(), 1);

    rig.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn permission_denied_until_a_fix_arrives() {
    let feed = DeviceFeed::new();
    feed.set_permission(false);
    let rig = start(feed, cafe_config());
    let mut rx = rig.handle.subscribe();

    let denied = wait_for(&mut rx, |s| s.last_error.is_some()).await;
    assert_eq!(denied.last_error, Some(ScoutError::PermissionDenied));
    assert_eq!(denied.phase, Phase::Idle);
    assert_eq!(denied.timer_interval_ms, None);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(rig.upstream.calls(), 0);

    rig.feed.set_permission(true);
    rig.feed.push_fix_at(48.85, 2.35, t0()).unwrap();
    let ready = wait_for(&mut rx, |s| s.phase == Phase::Ready).await;
    assert!(ready.last_error.is_none());
    assert_eq!(ready.timer_interval_ms, Some(300_000));

    rig.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn revoked_permission_surfaces_and_pauses_fetching() {
    let feed = DeviceFeed::new();
    feed.push_fix_at(37.0, -122.0, t0()).unwrap();
    let rig = start(feed, cafe_config());
    let mut rx = rig.handle.subscribe();
    let ready = wait_for(&mut rx, |s| s.phase == Phase::Ready).await;
    assert_eq!(rig.upstream.calls(), 1);

    rig.feed.set_permission(false);
    let denied = wait_for(&mut rx, |s| s.last_error.is_some()).await;
    assert_eq!(denied.last_error, Some(ScoutError::PermissionDenied));
    assert_eq!(denied.phase, Phase::Errored);
    assert_eq!(denied.last_result, ready.last_result);
    assert_eq!(denied.timer_interval_ms, Some(300_000));

    tokio::time::sleep(Duration::from_secs(1_000)).await;
    assert_eq!(rig.upstream.calls(), 1);
    assert_eq!(
        rig.handle.request_manual_refresh().await.unwrap(),
        TriggerOutcome::LocationDenied
    );
    assert_eq!(rig.handle.state().last_error, Some(ScoutError::PermissionDenied));

    rig.feed.set_permission(true);
    wait_for(&mut rx, |s| s.last_error.is_none()).await;
    tokio::time::sleep(Duration::from_secs(310)).await;
    assert_eq!(rig.upstream.calls(), 2);
    let healed = wait_for(&mut rx, |s| s.phase == Phase::Ready).await;
    assert!(healed.last_error.is_none());

    rig.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn commands_are_answered_before_the_first_fix() {
    // Default first-fix wait is 10 s; answers must not wait for it.
    let rig = start(DeviceFeed::new(), cafe_config());
    let quick = Duration::from_secs(1);

    let out = tokio::time::timeout(quick, rig.handle.request_manual_refresh())
        .await
        .expect("refresh answered during bootstrap")
        .unwrap();
    assert_eq!(out, TriggerOutcome::NoPosition);
    let set = tokio::time::timeout(quick, rig.handle.set_categories(["catering.bar"]))
        .await
        .expect("categories answered during bootstrap")
        .unwrap();
    assert_eq!(set.to_query(), "catering.bar");

    rig.feed.push_fix_at(37.0, -122.0, t0()).unwrap();
    let mut rx = rig.handle.subscribe();
    let ready = wait_for(&mut rx, |s| s.phase == Phase::Ready).await;
    assert_eq!(ready.categories.to_query(), "catering.bar");
    assert_eq!(rig.upstream.calls(), 1);

    rig.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn missing_battery_gauge_runs_at_full_charge() {
    let feed = DeviceFeed::without_battery();
    feed.push_fix_at(37.0, -122.0, t0()).unwrap();
    let rig = start(feed, cafe_config());
    let mut rx = rig.handle.subscribe();

    let s = wait_for(&mut rx, |s| s.phase == Phase::Ready).await;
    assert_eq!(s.battery_level, 1.0);
    assert_eq!(s.current_parameters, adapt(1.0));
    assert!(matches!(
        s.warning,
        Some(ScoutError::SensorUnavailable { .. })
    ));
    assert!(s.last_error.is_none());

    rig.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn random_signal_storm_keeps_one_fetch_in_flight() {
    let mut rng = StdRng::seed_from_u64(0x5c07);
    let feed = DeviceFeed::new();
    feed.push_battery(0.8).unwrap();
    feed.push_fix_at(37.0, -122.0, t0()).unwrap();
    let rig = start(feed, cafe_config());
    rig.upstream.delay_ms.store(1_500, Ordering::SeqCst);

    let mut level = 0.8f32;
    for _ in 0..200 {
        match rng.random_range(0..4) {
            0 => {
                level = rng.random_range(0.0..1.0);
                rig.feed.push_battery(level).unwrap();
            }
            1 => {
                let _ = rig.handle.request_manual_refresh().await.unwrap();
            }
            2 => {
                let code = if rng.random_bool(0.5) {
                    "catering.bar"
                } else {
                    "healthcare.pharmacy"
                };
                rig.handle.toggle_category(code).await.unwrap();
            }
            _ => {
                let secs = rng.random_range(1..120);
                tokio::time::sleep(Duration::from_secs(secs)).await;
            }
        }
    }

    let want = adapt(level);
    let mut rx = rig.handle.subscribe();
    let s = wait_for(&mut rx, |s| s.current_parameters == want).await;
    assert_eq!(s.timer_interval_ms, Some(want.refresh_interval_ms));
    assert_eq!(rig.upstream.max_active.load(Ordering::SeqCst), 1);
    assert!(rig.upstream.calls() > 1);

    rig.handle.stop().await;
}
