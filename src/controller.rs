// src/controller.rs
//! Runtime side of the refresh controller.
//!
//! One task owns the [`RefreshScheduler`] and consumes every signal in turn:
//! battery samples, position fixes, timer ticks, retry wake-ups, commands
//! from handles and fetch completions. Observers only ever see
//! `ControllerState` snapshots through a `watch` channel.

use std::collections::VecDeque;
use std::future::pending;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::categories::{self, CategorySet};
use crate::errors::ScoutError;
use crate::fetch::{FetchOrchestrator, FetchResult};
use crate::params::{ParameterAdapter, DEFAULT_BATTERY_LEVEL};
use crate::scheduler::{
    ControllerState, Effect, FetchRequest, RefreshScheduler, RetryPolicy, Trigger, TriggerOutcome,
};
use crate::sensors::{BatteryMonitor, LocationEvent, LocationTracker};

const SIGNAL_BUFFER: usize = 32;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub categories: CategorySet,
    pub adapter: ParameterAdapter,
    pub retry: RetryPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            categories: categories::validate(["commercial.supermarket", "catering.restaurant"]),
            adapter: ParameterAdapter::default(),
            retry: RetryPolicy::default(),
        }
    }
}

enum Command {
    Refresh(oneshot::Sender<TriggerOutcome>),
    SetCategories(CategorySet, oneshot::Sender<CategorySet>),
    ToggleCategory(String, oneshot::Sender<CategorySet>),
}

/// Cheap, cloneable access to a running controller.
///
/// Commands are answered while the first fix is still pending; until it
/// arrives a refresh reports [`TriggerOutcome::NoPosition`].
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ControllerState>,
    shutdown: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ControllerHandle {
    pub fn state(&self) -> ControllerState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerState> {
        self.state.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn request_manual_refresh(&self) -> Result<TriggerOutcome, ScoutError> {
        self.call(Command::Refresh).await
    }

    /// Replace the category selection; returns the validated set in effect.
    pub async fn set_categories<I, S>(&self, requested: I) -> Result<CategorySet, ScoutError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set = categories::validate(requested);
        self.call(|reply| Command::SetCategories(set, reply)).await
    }

    pub async fn toggle_category(&self, code: &str) -> Result<CategorySet, ScoutError> {
        let code = code.to_string();
        self.call(|reply| Command::ToggleCategory(code, reply)).await
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ScoutError> {
        if self.shutdown.is_cancelled() {
            return Err(ScoutError::Stopped);
        }
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ScoutError::Stopped)?;
        rx.await.map_err(|_| ScoutError::Stopped)
    }

    /// Stop the controller and wait until timers, sensors and any in-flight
    /// fetch are released. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(target: "controller", error = %e, "controller task ended abnormally");
            }
        }
    }
}

pub struct Controller;

impl Controller {
    /// Spawn the controller task. Sensor start-up and the first fix happen
    /// inside the task; the handle is usable immediately.
    pub fn start(
        config: ControllerConfig,
        battery: Box<dyn BatteryMonitor>,
        tracker: Box<dyn LocationTracker>,
        orchestrator: Arc<FetchOrchestrator>,
    ) -> ControllerHandle {
        let scheduler = RefreshScheduler::new(
            config.adapter,
            config.retry,
            DEFAULT_BATTERY_LEVEL,
            config.categories,
        );
        let (state_tx, state_rx) = watch::channel(scheduler.state().clone());
        let (cmd_tx, cmd_rx) = mpsc::channel(SIGNAL_BUFFER);
        let (done_tx, done_rx) = mpsc::channel(1);
        let (location_tx, location_rx) = mpsc::channel(SIGNAL_BUFFER);
        let shutdown = CancellationToken::new();

        let actor = Actor {
            scheduler,
            battery,
            tracker,
            tracker_running: false,
            orchestrator,
            state_tx,
            timer: RefreshTimer::default(),
            retry: RetryTimer::default(),
            fetch_task: None,
            done_tx,
            location_tx,
        };
        let task = tokio::spawn(actor.run(shutdown.clone(), cmd_rx, done_rx, location_rx));

        ControllerHandle {
            commands: cmd_tx,
            state: state_rx,
            shutdown,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }
}

/// Repeating refresh timer. Arming replaces the previous interval, so there
/// is never more than one.
#[derive(Default)]
struct RefreshTimer {
    interval: Option<Interval>,
}

impl RefreshTimer {
    fn arm(&mut self, period: Duration) {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
    }

    fn disarm(&mut self) {
        self.interval = None;
    }

    async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => pending().await,
        }
    }
}

#[derive(Default)]
struct RetryTimer {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl RetryTimer {
    fn arm(&mut self, delay: Duration) {
        self.sleep = Some(Box::pin(tokio::time::sleep(delay)));
    }

    fn cancel(&mut self) {
        self.sleep = None;
    }

    async fn fire(&mut self) {
        match self.sleep.as_mut() {
            Some(sleep) => {
                sleep.as_mut().await;
                self.sleep = None;
            }
            None => pending().await,
        }
    }
}

type FetchDone = (u64, Result<FetchResult, ScoutError>);

struct Actor {
    scheduler: RefreshScheduler,
    battery: Box<dyn BatteryMonitor>,
    tracker: Box<dyn LocationTracker>,
    tracker_running: bool,
    orchestrator: Arc<FetchOrchestrator>,
    state_tx: watch::Sender<ControllerState>,
    timer: RefreshTimer,
    retry: RetryTimer,
    fetch_task: Option<JoinHandle<()>>,
    done_tx: mpsc::Sender<FetchDone>,
    location_tx: mpsc::Sender<LocationEvent>,
}

impl Actor {
    async fn run(
        mut self,
        shutdown: CancellationToken,
        mut commands: mpsc::Receiver<Command>,
        mut done: mpsc::Receiver<FetchDone>,
        mut locations: mpsc::Receiver<LocationEvent>,
    ) {
        let (battery_tx, mut battery_rx) = mpsc::channel(SIGNAL_BUFFER);

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                self.shut_down().await;
                return;
            }
            _ = self.bootstrap(battery_tx, &mut battery_rx, &mut commands) => {}
        }
        self.publish();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some((generation, outcome)) = done.recv() => {
                    let effects = self.scheduler.on_fetch_done(generation, outcome);
                    self.apply(effects).await;
                }
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        info!(target: "controller", "all handles dropped");
                        break;
                    }
                },
                Some(level) = battery_rx.recv() => {
                    let effects = self.scheduler.on_battery(level);
                    self.apply(effects).await;
                }
                Some(event) = locations.recv() => {
                    let effects = match event {
                        LocationEvent::Fix(position) => self.scheduler.on_position(position),
                        LocationEvent::Fault(err) => self.scheduler.on_sensor_fault(err),
                        LocationEvent::Restored => {
                            self.scheduler.on_location_restored();
                            Vec::new()
                        }
                    };
                    self.apply(effects).await;
                }
                _ = self.timer.tick() => self.trigger(Trigger::Timer).await,
                _ = self.retry.fire() => self.trigger(Trigger::Retry).await,
            }
            self.publish();
        }

        self.shut_down().await;
    }

    /// Battery first (it decides the accuracy tier), then the first fix,
    /// then continuous tracking. Commands are served while the first fix
    /// is pending.
    async fn bootstrap(
        &mut self,
        battery_tx: mpsc::Sender<f32>,
        battery_rx: &mut mpsc::Receiver<f32>,
        commands: &mut mpsc::Receiver<Command>,
    ) {
        match self.battery.start(battery_tx).await {
            Ok(()) => {
                // The monitor queues the current level before `start` returns.
                let level = battery_rx.try_recv().unwrap_or(DEFAULT_BATTERY_LEVEL);
                let effects = self.scheduler.on_battery(level);
                self.apply(effects).await;
            }
            Err(err) => {
                warn!(
                    target: "controller",
                    sensor = self.battery.name(),
                    error = %err,
                    "battery unavailable, assuming full charge"
                );
                let effects = self.scheduler.on_sensor_fault(err);
                self.apply(effects).await;
            }
        }
        self.publish();

        let tier = self.scheduler.state().current_parameters.accuracy;
        let mut deferred = Vec::new();
        let first_fix = {
            let fix = self.tracker.current_position(tier);
            tokio::pin!(fix);
            loop {
                tokio::select! {
                    r = &mut fix => break r,
                    Some(cmd) = commands.recv() => {
                        deferred.extend(answer(&mut self.scheduler, cmd));
                        publish(&self.state_tx, self.scheduler.state());
                    }
                }
            }
        };
        self.apply(deferred).await;
        let effects = match first_fix {
            Ok(position) => self.scheduler.on_position(position),
            Err(err) => self.scheduler.on_sensor_fault(err),
        };
        self.apply(effects).await;
        self.publish();

        let tier = self.scheduler.state().current_parameters.accuracy;
        match self.tracker.start(tier, self.location_tx.clone()).await {
            Ok(()) => self.tracker_running = true,
            Err(err) => {
                let effects = self.scheduler.on_sensor_fault(err);
                self.apply(effects).await;
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        let effects = answer(&mut self.scheduler, cmd);
        self.apply(effects).await;
    }

    async fn trigger(&mut self, trigger: Trigger) {
        let (_, effects) = self.scheduler.on_trigger(trigger);
        self.apply(effects).await;
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        let mut queue = VecDeque::from(effects);
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Fetch(request) => self.spawn_fetch(request),
                Effect::ArmTimer(period) => {
                    debug!(target: "controller", period_ms = period.as_millis() as u64, "refresh timer armed");
                    self.timer.arm(period);
                }
                Effect::DisarmTimer => self.timer.disarm(),
                Effect::ArmRetry(delay) => self.retry.arm(delay),
                Effect::CancelRetry => self.retry.cancel(),
                Effect::RestartTracker(tier) => {
                    if !self.tracker_running {
                        continue;
                    }
                    counter!("scout_tracker_restarts_total").increment(1);
                    info!(target: "controller", ?tier, "restarting location tracker");
                    if let Err(err) = self.tracker.start(tier, self.location_tx.clone()).await {
                        self.tracker_running = false;
                        queue.extend(self.scheduler.on_sensor_fault(err));
                    }
                }
                Effect::AbortFetch => {
                    if let Some(task) = self.fetch_task.take() {
                        task.abort();
                    }
                }
                Effect::ReleaseSensors => {
                    self.battery.stop();
                    self.tracker.stop();
                    self.tracker_running = false;
                }
            }
        }
    }

    fn spawn_fetch(&mut self, request: FetchRequest) {
        let orchestrator = self.orchestrator.clone();
        let done = self.done_tx.clone();
        self.fetch_task = Some(tokio::spawn(async move {
            let outcome = orchestrator
                .fetch(&request.position, request.radius_meters, &request.categories)
                .await;
            // The receiver is gone once the controller stopped.
            let _ = done.send((request.generation, outcome)).await;
        }));
    }

    async fn shut_down(&mut self) {
        let effects = self.scheduler.stop();
        self.apply(effects).await;
        self.publish();
        info!(target: "controller", "controller stopped");
    }

    fn publish(&self) {
        publish(&self.state_tx, self.scheduler.state());
    }
}

/// Run one command against the scheduler and reply to its caller. The
/// returned effects still have to be applied.
fn answer(scheduler: &mut RefreshScheduler, cmd: Command) -> Vec<Effect> {
    match cmd {
        Command::Refresh(reply) => {
            let (outcome, effects) = scheduler.on_trigger(Trigger::Manual);
            debug!(target: "controller", ?outcome, "manual refresh");
            let _ = reply.send(outcome);
            effects
        }
        Command::SetCategories(set, reply) => {
            let effects = scheduler.on_categories(set);
            let _ = reply.send(scheduler.state().categories.clone());
            effects
        }
        Command::ToggleCategory(code, reply) => {
            let next = scheduler.state().categories.toggled(&code);
            let effects = scheduler.on_categories(next);
            let _ = reply.send(scheduler.state().categories.clone());
            effects
        }
    }
}

fn publish(tx: &watch::Sender<ControllerState>, current: &ControllerState) {
    tx.send_if_modified(|shown| {
        if shown != current {
            *shown = current.clone();
            true
        } else {
            false
        }
    });
}
