// src/metrics.rs
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder once per process. Later calls (several
/// apps in one test binary) reuse the first handle.
pub fn init() -> anyhow::Result<PrometheusHandle> {
    let handle = HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| anyhow::anyhow!("prometheus: install recorder: {e}"))?;
        ensure_metrics_described();
        Ok::<_, anyhow::Error>(handle)
    })?;
    Ok(handle.clone())
}

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("scout_fetch_total", "Completed fetches by outcome.");
        describe_histogram!(
            "scout_fetch_duration_ms",
            "Wall time of one joined weather + places fetch."
        );
        describe_counter!(
            "scout_triggers_coalesced_total",
            "Ticks or manual refreshes dropped while a fetch was in flight."
        );
        describe_counter!(
            "scout_fetch_skipped_total",
            "Triggers that issued no fetch, by reason."
        );
        describe_counter!(
            "scout_tracker_restarts_total",
            "Location tracker restarts after an accuracy tier change."
        );
        describe_gauge!("scout_battery_level", "Last battery level seen, 0..1.");
        describe_counter!(
            "scout_late_results_dropped_total",
            "Fetch results discarded because they were superseded."
        );
        describe_counter!(
            "scout_provider_errors_total",
            "Weather/places call failures, by provider."
        );
        describe_counter!(
            "scout_places_skipped_total",
            "Places features dropped while decoding (no id, not a point, bad shape)."
        );
    });
}

/// Router exposing `/metrics` in the Prometheus exposition format.
pub fn router(handle: PrometheusHandle) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let h = handle.clone();
            async move { h.render() }
        }),
    )
}
