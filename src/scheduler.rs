// src/scheduler.rs
//! # Refresh scheduler
//! The state machine behind the controller. It owns `ControllerState` and
//! decides, for every inbound signal, what the runtime must do next
//! (issue a fetch, re-arm the timer, restart the tracker, ...).
//!
//! It performs no I/O and holds no timers itself: each handler returns the
//! effects to apply. That keeps the at-most-one-fetch invariant checkable
//! without a runtime.
//!
//! ```text
//!   Idle ──first fix──▶ Fetching ──ok──▶ Ready
//!                          ▲  └──err──▶ Errored
//!                          └── tick / manual / retry / category change
//!   any ──stop──▶ Stopped
//! ```

use std::time::Duration;

use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::categories::CategorySet;
use crate::errors::ScoutError;
use crate::fetch::FetchResult;
use crate::params::{self, OperatingParameters, ParameterAdapter};
use crate::sensors::{AccuracyTier, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No position yet (or no fetch could be issued yet).
    Idle,
    Fetching,
    Ready,
    Errored,
    Stopped,
}

/// What caused a fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    FirstFix,
    Timer,
    Manual,
    Retry,
    CategoryChange,
}

impl Trigger {
    fn as_str(&self) -> &'static str {
        match self {
            Trigger::FirstFix => "first_fix",
            Trigger::Timer => "timer",
            Trigger::Manual => "manual",
            Trigger::Retry => "retry",
            Trigger::CategoryChange => "category_change",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Started { generation: u64 },
    /// A fetch is already in flight; the trigger was dropped.
    AlreadyFetching,
    NoPosition,
    /// Location permission is revoked; nothing is fetched until it returns.
    LocationDenied,
    EmptyFilter,
    Stopped,
}

/// Everything the runtime needs to run one fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub generation: u64,
    pub position: Position,
    pub radius_meters: u32,
    pub categories: CategorySet,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Fetch(FetchRequest),
    /// Replace the repeating refresh timer (the previous one is dropped first).
    ArmTimer(Duration),
    DisarmTimer,
    RestartTracker(AccuracyTier),
    /// One-shot backoff retry after a failed fetch.
    ArmRetry(Duration),
    CancelRetry,
    AbortFetch,
    ReleaseSensors,
}

/// Optional backoff after failed fetches. Disabled by default: a failure
/// then simply waits for the next tick or a manual refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            base_delay_ms: 5_000,
            max_delay_ms: 60_000,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), or `None` when no
    /// retry should be scheduled.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if !self.enabled || attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u64 << (attempt - 1).min(20);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Some(Duration::from_millis(ms))
    }
}

/// The externally visible aggregate handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerState {
    pub phase: Phase,
    /// Last successful fetch; kept (stale) across later failures.
    pub last_result: Option<FetchResult>,
    pub last_error: Option<ScoutError>,
    pub is_fetching: bool,
    pub current_parameters: OperatingParameters,
    pub battery_level: f32,
    pub position: Option<Position>,
    pub categories: CategorySet,
    /// Interval of the armed refresh timer, `None` while unarmed.
    pub timer_interval_ms: Option<u64>,
    /// Non-blocking degradation notice (e.g. missing battery gauge).
    pub warning: Option<ScoutError>,
}

#[derive(Debug)]
pub struct RefreshScheduler {
    state: ControllerState,
    adapter: ParameterAdapter,
    retry: RetryPolicy,
    in_flight: Option<u64>,
    next_generation: u64,
    consecutive_failures: u32,
    location_denied: bool,
}

impl RefreshScheduler {
    pub fn new(
        adapter: ParameterAdapter,
        retry: RetryPolicy,
        battery_level: f32,
        categories: CategorySet,
    ) -> Self {
        let battery_level = params::clamp_level(battery_level);
        Self {
            state: ControllerState {
                phase: Phase::Idle,
                last_result: None,
                last_error: None,
                is_fetching: false,
                current_parameters: params::adapt(battery_level),
                battery_level,
                position: None,
                categories,
                timer_interval_ms: None,
                warning: None,
            },
            adapter,
            retry,
            in_flight: None,
            next_generation: 1,
            consecutive_failures: 0,
            location_denied: false,
        }
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn in_flight(&self) -> Option<u64> {
        self.in_flight
    }

    fn stopped(&self) -> bool {
        self.state.phase == Phase::Stopped
    }

    pub fn on_battery(&mut self, level: f32) -> Vec<Effect> {
        if self.stopped() {
            return Vec::new();
        }
        let level = params::clamp_level(level);
        self.state.battery_level = level;
        gauge!("scout_battery_level").set(level as f64);

        let prev = self.state.current_parameters;
        let next = self.adapter.adapt(level, &prev);
        if next == prev {
            return Vec::new();
        }

        info!(
            target: "scheduler",
            level,
            radius = next.radius_meters,
            interval_ms = next.refresh_interval_ms,
            tier = ?next.accuracy,
            "operating parameters changed"
        );
        self.state.current_parameters = next;

        let mut effects = Vec::new();
        if next.accuracy != prev.accuracy {
            effects.push(Effect::RestartTracker(next.accuracy));
        }
        if self.state.timer_interval_ms.is_some()
            && next.refresh_interval_ms != prev.refresh_interval_ms
        {
            self.state.timer_interval_ms = Some(next.refresh_interval_ms);
            effects.push(Effect::ArmTimer(next.refresh_interval()));
        }
        effects
    }

    pub fn on_position(&mut self, position: Position) -> Vec<Effect> {
        if self.stopped() {
            return Vec::new();
        }
        if !position.is_valid() {
            warn!(target: "scheduler", ?position, "ignoring invalid position");
            return Vec::new();
        }
        if self
            .state
            .position
            .as_ref()
            .is_some_and(|prev| prev.same_fix(&position))
        {
            return Vec::new();
        }

        self.state.position = Some(position);
        self.location_denied = false;
        self.clear_location_faults();

        if self.state.timer_interval_ms.is_some() {
            // Picked up by the next tick or manual refresh.
            debug!(
                target: "scheduler",
                lat = round3(position.latitude),
                lon = round3(position.longitude),
                "position stored"
            );
            return Vec::new();
        }

        let params = self.state.current_parameters;
        self.state.timer_interval_ms = Some(params.refresh_interval_ms);
        let mut effects = vec![Effect::ArmTimer(params.refresh_interval())];
        effects.extend(self.on_trigger(Trigger::FirstFix).1);
        effects
    }

    pub fn on_trigger(&mut self, trigger: Trigger) -> (TriggerOutcome, Vec<Effect>) {
        if self.stopped() {
            return (TriggerOutcome::Stopped, Vec::new());
        }
        if self.in_flight.is_some() {
            counter!("scout_triggers_coalesced_total").increment(1);
            debug!(target: "scheduler", trigger = trigger.as_str(), "fetch in flight, trigger coalesced");
            return (TriggerOutcome::AlreadyFetching, Vec::new());
        }
        let Some(position) = self.state.position else {
            return (TriggerOutcome::NoPosition, Vec::new());
        };
        if self.location_denied {
            counter!("scout_fetch_skipped_total", "reason" => "location_denied").increment(1);
            debug!(target: "scheduler", trigger = trigger.as_str(), "location permission revoked, fetch skipped");
            return (TriggerOutcome::LocationDenied, Vec::new());
        }
        if self.state.categories.is_empty() {
            counter!("scout_fetch_skipped_total", "reason" => "empty_filter").increment(1);
            debug!(target: "scheduler", trigger = trigger.as_str(), "no categories selected, fetch skipped");
            return (TriggerOutcome::EmptyFilter, Vec::new());
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        self.in_flight = Some(generation);
        self.state.phase = Phase::Fetching;
        self.state.is_fetching = true;

        let params = self.state.current_parameters;
        info!(
            target: "scheduler",
            generation,
            trigger = trigger.as_str(),
            radius = params.radius_meters,
            categories = self.state.categories.len(),
            "fetch issued"
        );
        let request = FetchRequest {
            generation,
            position,
            radius_meters: params.radius_meters,
            categories: self.state.categories.clone(),
        };
        (
            TriggerOutcome::Started { generation },
            vec![Effect::Fetch(request)],
        )
    }

    /// Replace the category selection. A non-empty change refreshes right
    /// away when nothing is in flight.
    pub fn on_categories(&mut self, categories: CategorySet) -> Vec<Effect> {
        if self.stopped() || categories == self.state.categories {
            return Vec::new();
        }
        self.state.categories = categories;
        if self.state.categories.is_empty() {
            info!(target: "scheduler", "category filter empty, fetches paused");
            return Vec::new();
        }
        if self.in_flight.is_some() || self.state.position.is_none() {
            return Vec::new();
        }
        self.on_trigger(Trigger::CategoryChange).1
    }

    pub fn on_fetch_done(
        &mut self,
        generation: u64,
        outcome: Result<FetchResult, ScoutError>,
    ) -> Vec<Effect> {
        if self.in_flight != Some(generation) {
            counter!("scout_late_results_dropped_total").increment(1);
            debug!(target: "scheduler", generation, "dropping result of a superseded fetch");
            return Vec::new();
        }
        self.in_flight = None;
        self.state.is_fetching = false;

        match outcome {
            Ok(result) => {
                counter!("scout_fetch_total", "outcome" => "ok").increment(1);
                info!(
                    target: "scheduler",
                    generation,
                    places = result.places.len(),
                    "fetch succeeded"
                );
                self.state.phase = Phase::Ready;
                self.state.last_result = Some(result);
                self.state.last_error = None;
                let had_failures = self.consecutive_failures > 0;
                self.consecutive_failures = 0;
                if had_failures && self.retry.enabled {
                    vec![Effect::CancelRetry]
                } else {
                    Vec::new()
                }
            }
            Err(err) => {
                counter!("scout_fetch_total", "outcome" => "error").increment(1);
                warn!(target: "scheduler", generation, error = %err, "fetch failed, keeping last result");
                self.state.phase = Phase::Errored;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                let retry = if err.is_recoverable() {
                    self.retry.delay_for(self.consecutive_failures)
                } else {
                    None
                };
                self.state.last_error = Some(err);
                match retry {
                    Some(delay) => vec![Effect::ArmRetry(delay)],
                    None => Vec::new(),
                }
            }
        }
    }

    /// Sensor faults never stop the controller.
    ///
    /// A revoked location grant is persistent: it aborts the fetch in
    /// flight and blocks further fetches until the grant returns or a fix
    /// arrives.
    pub fn on_sensor_fault(&mut self, err: ScoutError) -> Vec<Effect> {
        if self.stopped() {
            return Vec::new();
        }
        warn!(target: "scheduler", error = %err, "sensor fault");
        if err == ScoutError::PermissionDenied {
            return self.deny_location();
        }
        if err.is_location_fault() && self.state.position.is_none() {
            // Persistent until a fix arrives; no timer is armed without one.
            self.state.last_error = Some(err);
        } else {
            self.state.warning = Some(err);
        }
        Vec::new()
    }

    /// The location grant came back. Faults clear now if a position is
    /// already known, otherwise with the next fix.
    pub fn on_location_restored(&mut self) {
        if self.stopped() || !self.location_denied {
            return;
        }
        info!(target: "scheduler", "location permission restored");
        self.location_denied = false;
        if self.state.position.is_some() {
            self.clear_location_faults();
        }
    }

    fn deny_location(&mut self) -> Vec<Effect> {
        self.location_denied = true;
        self.state.last_error = Some(ScoutError::PermissionDenied);
        let mut effects = Vec::new();
        if let Some(generation) = self.in_flight.take() {
            debug!(target: "scheduler", generation, "aborting fetch, location permission revoked");
            self.state.is_fetching = false;
            effects.push(Effect::AbortFetch);
        }
        if self.state.position.is_some() {
            self.state.phase = Phase::Errored;
        }
        if self.retry.enabled {
            self.consecutive_failures = 0;
            effects.push(Effect::CancelRetry);
        }
        effects
    }

    fn clear_location_faults(&mut self) {
        if self
            .state
            .last_error
            .as_ref()
            .is_some_and(ScoutError::is_location_fault)
        {
            self.state.last_error = None;
        }
        if self
            .state
            .warning
            .as_ref()
            .is_some_and(ScoutError::is_location_fault)
        {
            self.state.warning = None;
        }
    }

    pub fn stop(&mut self) -> Vec<Effect> {
        if self.stopped() {
            return Vec::new();
        }
        info!(target: "scheduler", in_flight = ?self.in_flight, "stopping");
        self.state.phase = Phase::Stopped;
        self.state.is_fetching = false;
        self.state.timer_interval_ms = None;
        self.in_flight = None;
        vec![
            Effect::DisarmTimer,
            Effect::CancelRetry,
            Effect::AbortFetch,
            Effect::ReleaseSensors,
        ]
    }
}

fn round3(v: f64) -> f64 {
    (v * 1_000.0).round() / 1_000.0
}
