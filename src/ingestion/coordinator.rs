use std::collections::HashMap;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::mpsc;

use crate::db::{event_repo, get_system_state, safety_repo};
use crate::models::{LeaderFill, PositionDeltaEvent, SafetyMode, SafetyReason};

use super::aggregator;
use super::LeaderSource;

/// How often event-time gap warnings may repeat.
const EVENT_GAP_WARN_INTERVAL_MS: i64 = 300_000;
/// How often the dedup TTL sweep runs.
const DEDUP_SWEEP_INTERVAL_MS: i64 = 3_600_000;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub backfill_window_ms: i64,
    pub cursor_overlap_ms: i64,
    pub maintenance_skip_gap: bool,
    pub dedup_ttl_ms: i64,
    pub symbol_map: HashMap<String, String>,
}

/// Pulls fills from the REST source (and drains the stream buffer), collapses
/// them into position-delta events, and owns the gap guard around the cursor's
/// liveness clock.
pub struct IngestCoordinator {
    source: Arc<dyn LeaderSource>,
    stream_rx: Option<mpsc::Receiver<LeaderFill>>,
    config: IngestConfig,
    boot_ms: i64,
    last_event_gap_warn_ms: Option<i64>,
    last_sweep_ms: i64,
}

impl IngestCoordinator {
    pub fn new(
        source: Arc<dyn LeaderSource>,
        stream_rx: Option<mpsc::Receiver<LeaderFill>>,
        config: IngestConfig,
        boot_ms: i64,
    ) -> Self {
        Self {
            source,
            stream_rx,
            config,
            boot_ms,
            last_event_gap_warn_ms: None,
            last_sweep_ms: 0,
        }
    }

    /// One ingest tick: gap guard, bounded backfill, live drain. Returned
    /// events are ordered under the cursor key and pre-filtered against the
    /// dedup set; the authoritative dedup check happens when the pipeline
    /// commits each event.
    pub async fn run_once(
        &mut self,
        pool: &SqlitePool,
        live_poll: bool,
        now_ms: i64,
    ) -> anyhow::Result<Vec<PositionDeltaEvent>> {
        let safety = safety_repo::load_safety_state(pool).await?;
        if let Some(state) = &safety {
            if state.mode == SafetyMode::Halt {
                self.try_maintenance_skip(pool, state.reason_code, now_ms).await?;
                return Ok(Vec::new());
            }
        }

        let cursor = event_repo::load_cursor(pool).await?;

        // Liveness gap: a real outage longer than the backfill window means
        // we can no longer trust that backfill covers what we missed.
        if cursor.last_ingest_success_ms > 0
            && self.config.backfill_window_ms > 0
            && now_ms - cursor.last_ingest_success_ms > self.config.backfill_window_ms
        {
            if self.config.maintenance_skip_gap {
                self.try_maintenance_skip(pool, SafetyReason::BackfillWindowExceeded, now_ms)
                    .await?;
                return Ok(Vec::new());
            }
            tracing::error!(
                last_ingest_success_ms = cursor.last_ingest_success_ms,
                gap_ms = now_ms - cursor.last_ingest_success_ms,
                backfill_window_ms = self.config.backfill_window_ms,
                "Ingest gap exceeds backfill window"
            );
            safety_repo::set_safety_state(
                pool,
                SafetyMode::Halt,
                SafetyReason::BackfillWindowExceeded,
                "Ingest gap exceeds backfill window",
                now_ms,
            )
            .await?;
            return Ok(Vec::new());
        }

        // Event-time gap with a healthy source is just a quiet leader.
        if cursor.last_processed_timestamp_ms > 0
            && self.config.backfill_window_ms > 0
            && now_ms - cursor.last_processed_timestamp_ms > self.config.backfill_window_ms
        {
            self.warn_event_gap(cursor.last_processed_timestamp_ms, now_ms);
        } else {
            self.last_event_gap_warn_ms = None;
        }

        let mut fills = Vec::new();
        let mut replay_count = 0usize;

        let since_ms = self.backfill_since(cursor.last_processed_timestamp_ms);
        match self.source.fetch_fills(since_ms, now_ms).await {
            Ok(batch) => {
                event_repo::record_ingest_success(pool, now_ms).await?;
                replay_count = batch.len();
                fills.extend(batch);
            }
            Err(e) => {
                metrics::counter!("ingest_backfill_failures_total").increment(1);
                tracing::warn!(error = %e, since_ms, "Leader backfill fetch failed");
            }
        }

        if live_poll {
            let live = self.drain_stream();
            if !live.is_empty() {
                event_repo::record_ingest_success(pool, now_ms).await?;
            }
            fills.extend(live);
        }

        if self.config.dedup_ttl_ms > 0 && now_ms - self.last_sweep_ms > DEDUP_SWEEP_INTERVAL_MS {
            self.last_sweep_ms = now_ms;
            let swept = event_repo::sweep_dedup(pool, now_ms - self.config.dedup_ttl_ms).await?;
            if swept > 0 {
                tracing::debug!(swept, "Swept expired dedup records");
            }
        }

        if fills.is_empty() {
            return Ok(Vec::new());
        }
        metrics::counter!("fills_ingested_total").increment(fills.len() as u64);

        // Fills from backfill are replays; anything past that index came off
        // the live stream.
        let (deltas, stats) = aggregator::aggregate_fills(&fills[..replay_count], &self.config.symbol_map);
        let (live_deltas, live_stats) =
            aggregator::aggregate_fills(&fills[replay_count..], &self.config.symbol_map);
        if stats.fills_invalid + live_stats.fills_invalid > 0 {
            metrics::counter!("ingest_poison_fills_total")
                .increment(stats.fills_invalid + live_stats.fills_invalid);
        }

        let mut events = Vec::with_capacity(deltas.len() + live_deltas.len());
        for delta in &deltas {
            events.push(aggregator::build_event(delta, true));
        }
        for delta in &live_deltas {
            events.push(aggregator::build_event(delta, false));
        }

        let mut fresh = Vec::with_capacity(events.len());
        for event in events {
            if event_repo::has_processed(pool, &event.tx_hash, event.event_index, &event.symbol)
                .await?
            {
                metrics::counter!("events_duplicate_total").increment(1);
                continue;
            }
            fresh.push(event);
        }
        fresh.sort_by(|a, b| a.key().cmp(&b.key()));
        metrics::counter!("events_emitted_total").increment(fresh.len() as u64);
        Ok(fresh)
    }

    fn backfill_since(&self, last_processed_ms: i64) -> i64 {
        let overlapped = last_processed_ms - self.config.cursor_overlap_ms;
        let floor = if self.config.backfill_window_ms > 0 {
            self.boot_ms - self.config.backfill_window_ms
        } else {
            0
        };
        overlapped.max(floor).max(0)
    }

    fn drain_stream(&mut self) -> Vec<LeaderFill> {
        let mut fills = Vec::new();
        if let Some(rx) = &mut self.stream_rx {
            while let Ok(fill) = rx.try_recv() {
                fills.push(fill);
            }
        }
        fills
    }

    fn warn_event_gap(&mut self, last_ts: i64, now_ms: i64) {
        if let Some(warned) = self.last_event_gap_warn_ms {
            if now_ms - warned < EVENT_GAP_WARN_INTERVAL_MS {
                return;
            }
        }
        self.last_event_gap_warn_ms = Some(now_ms);
        tracing::warn!(
            last_processed_timestamp_ms = last_ts,
            gap_ms = now_ms - last_ts,
            "No events processed for longer than the backfill window (leader quiet)"
        );
    }

    /// The operator's one-shot bypass for a gap-exceeded HALT: jump the
    /// cursor to now, record the bypass in the audit log, and resume
    /// reduce-only. Other HALT reasons are not bypassable here.
    async fn try_maintenance_skip(
        &self,
        pool: &SqlitePool,
        reason: SafetyReason,
        now_ms: i64,
    ) -> anyhow::Result<bool> {
        if !self.config.maintenance_skip_gap {
            return Ok(false);
        }
        if reason != SafetyReason::BackfillWindowExceeded {
            return Ok(false);
        }
        if get_system_state(pool, "maintenance_skip_applied_ms").await?.is_some() {
            return Ok(false);
        }

        tracing::warn!(now_ms, "Applying maintenance skip: cursor jumps to now");
        event_repo::apply_maintenance_skip(pool, now_ms).await?;
        safety_repo::set_safety_state(
            pool,
            SafetyMode::ArmedSafe,
            SafetyReason::MaintenanceSkip,
            "Maintenance skip applied; resuming reduce-only",
            now_ms,
        )
        .await?;
        Ok(true)
    }
}
