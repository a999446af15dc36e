use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and pre-register the pipeline metrics so
/// every series exists from the first scrape.
///
/// Safe to call more than once (tests): later calls get a standalone handle
/// instead of failing on the already-installed global recorder.
pub fn init_metrics() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    let handle = match builder.install_recorder() {
        Ok(h) => h,
        Err(_) => PrometheusBuilder::new().build_recorder().handle(),
    };

    // Pre-register counters so they appear even before the first increment.
    counter!("fills_ingested_total").absolute(0);
    counter!("fills_streamed_total").absolute(0);
    counter!("events_emitted_total").absolute(0);
    counter!("events_duplicate_total").absolute(0);
    counter!("ingest_poison_fills_total").absolute(0);
    counter!("ingest_backfill_failures_total").absolute(0);
    counter!("decision_rejections_total").absolute(0);
    counter!("intents_built_total").absolute(0);
    counter!("orders_submitted_total").absolute(0);
    counter!("orders_filled_total").absolute(0);
    counter!("orders_rejected_total").absolute(0);
    counter!("orders_duplicate_client_id_total").absolute(0);
    counter!("market_fallbacks_total").absolute(0);
    counter!("market_fallback_slippage_blocked_total").absolute(0);
    counter!("unknown_queries_total").absolute(0);
    counter!("execution_rate_limited_total").absolute(0);
    counter!("reconcile_runs_total").absolute(0);
    counter!("reconcile_failures_total").absolute(0);
    counter!("reconcile_warnings_total").absolute(0);
    counter!("safety_transitions_total").absolute(0);
    counter!("halt_auto_recoveries_total").absolute(0);

    gauge!("reconcile_max_drift").set(0.0);
    gauge!("safety_mode_level").set(0.0);

    histogram!("loop_tick_seconds").record(0.0);

    handle
}
