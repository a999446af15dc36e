use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::clock::Clock;
use crate::db::{intent_repo, result_repo, safety_repo, set_system_state};
use crate::db::result_repo::UpsertOutcome;
use crate::models::{
    generate_nonce, sanitize_client_order_id, OrderIntent, OrderResult, OrderStatus, OrderType,
    SafetyMode, SafetyReason, CONTRACT_VERSION,
};
use crate::venue::{ExecutionVenue, SubmitOutcome, VenueError, VenueOrder};

use super::retry_budget::{BudgetStatus, RetryBudget};

const SLIPPAGE_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 9); // 1e-9

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// How long a LIMIT order may rest before cancel + fallback.
    pub tif_seconds: u64,
    pub order_poll_interval_sec: u64,
    pub unknown_poll_interval_sec: u64,
    pub retry_budget_max_attempts: u32,
    pub retry_budget_window_sec: u64,
    /// Mode entered when the UNKNOWN retry budget is exhausted.
    pub retry_budget_mode: SafetyMode,
    pub market_fallback_enabled: bool,
    /// Fallback only fires when remaining qty is at most this fraction of
    /// the original.
    pub market_fallback_threshold_pct: Decimal,
    pub market_slippage_cap_pct: Decimal,
    pub rate_limit_cooldown_sec: u64,
    /// dry-run / backfill-only: no venue writes, simulated FSM path.
    pub suppress_venue_writes: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            tif_seconds: 30,
            order_poll_interval_sec: 2,
            unknown_poll_interval_sec: 5,
            retry_budget_max_attempts: 3,
            retry_budget_window_sec: 60,
            retry_budget_mode: SafetyMode::ArmedSafe,
            market_fallback_enabled: true,
            market_fallback_threshold_pct: Decimal::new(5, 1), // 0.5
            market_slippage_cap_pct: Decimal::new(5, 3),       // 0.005
            rate_limit_cooldown_sec: 2,
            suppress_venue_writes: true,
        }
    }
}

/// Drives each intent through its venue lifecycle while staying idempotent
/// across retries, crashes, and restarts. The client order id is the
/// correlation id, so a resubmission after a crash collides on the venue and
/// adopts the original order instead of doubling exposure.
pub struct OrderExecutor<V> {
    venue: Arc<V>,
    config: ExecutionConfig,
    clock: Arc<dyn Clock>,
    /// Shared 429 backoff across submit and poll.
    cooldown_until_ms: AtomicI64,
    budgets: Mutex<HashMap<String, RetryBudget>>,
}

impl<V: ExecutionVenue> OrderExecutor<V> {
    pub fn new(venue: Arc<V>, config: ExecutionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            venue,
            config,
            clock,
            cooldown_until_ms: AtomicI64::new(0),
            budgets: Mutex::new(HashMap::new()),
        }
    }

    /// Execute one intent to the furthest reachable state. Terminal results
    /// are returned as-is; non-terminal stored results resume their
    /// lifecycle instead of resubmitting.
    pub async fn execute(&self, pool: &SqlitePool, intent: &OrderIntent) -> anyhow::Result<OrderResult> {
        if let Some(existing) = result_repo::get_result(pool, &intent.correlation_id).await? {
            if existing.status.is_terminal() {
                tracing::debug!(
                    correlation_id = %intent.correlation_id,
                    status = %existing.status,
                    "Intent already terminal, skipping"
                );
                return Ok(existing);
            }
            return self.resume(pool, intent, existing).await;
        }

        if let Some(result) = self.safety_precheck(pool, intent).await? {
            return Ok(result);
        }

        if self.config.suppress_venue_writes {
            return self.simulate(pool, intent).await;
        }

        let client_id = client_id_for(intent);
        self.submit_and_drive(pool, intent, &client_id).await
    }

    /// Re-query every stored non-terminal result against the venue. Run at
    /// startup before new events are processed.
    pub async fn recover_nonterminal(&self, pool: &SqlitePool) -> anyhow::Result<()> {
        let pending = result_repo::list_nonterminal(pool).await?;
        if pending.is_empty() {
            return Ok(());
        }
        tracing::info!(count = pending.len(), "Recovering non-terminal orders");
        for result in pending {
            match intent_repo::get_intent(pool, &result.correlation_id).await? {
                Some(intent) => {
                    if let Err(e) = self.execute(pool, &intent).await {
                        tracing::error!(
                            error = %e,
                            correlation_id = %result.correlation_id,
                            "Recovery execution failed"
                        );
                    }
                }
                None => {
                    tracing::warn!(
                        correlation_id = %result.correlation_id,
                        "Non-terminal result has no stored intent"
                    );
                }
            }
        }
        Ok(())
    }

    // -- lifecycle phases ---------------------------------------------------

    async fn resume(
        &self,
        pool: &SqlitePool,
        intent: &OrderIntent,
        existing: OrderResult,
    ) -> anyhow::Result<OrderResult> {
        let client_id = client_id_for(intent);
        tracing::info!(
            correlation_id = %intent.correlation_id,
            status = %existing.status,
            "Resuming in-flight order"
        );
        match existing.status {
            // Never reached the venue: safety gate applies again.
            OrderStatus::Pending => {
                if let Some(result) = self.safety_precheck(pool, intent).await? {
                    return Ok(result);
                }
                if self.config.suppress_venue_writes {
                    return self.simulate(pool, intent).await;
                }
                self.submit_and_drive(pool, intent, &client_id).await
            }
            OrderStatus::Unknown => self.unknown_recovery(pool, intent, &client_id, existing).await,
            // SUBMITTED / PARTIALLY_FILLED bypass pre-submit gates.
            _ => {
                if self.config.suppress_venue_writes {
                    return Ok(existing);
                }
                self.drive_open_order(pool, intent, &client_id, existing).await
            }
        }
    }

    async fn safety_precheck(
        &self,
        pool: &SqlitePool,
        intent: &OrderIntent,
    ) -> anyhow::Result<Option<OrderResult>> {
        let Some(state) = safety_repo::load_safety_state(pool).await? else {
            return Ok(None);
        };
        let blocked = match state.mode {
            SafetyMode::Halt => Some("safety mode HALT"),
            SafetyMode::ArmedSafe if !intent.reduce_only => {
                Some("ARMED_SAFE blocks exposure-increasing orders")
            }
            _ => None,
        };
        let Some(message) = blocked else {
            return Ok(None);
        };
        tracing::warn!(
            correlation_id = %intent.correlation_id,
            mode = %state.mode,
            "Safety gate rejected intent at execution"
        );
        let result = OrderResult::new(&intent.correlation_id, OrderStatus::Rejected, self.clock.now_ms())
            .with_error("SAFETY_REJECTED", message);
        self.record(pool, result).await.map(Some)
    }

    /// Deterministic simulated path for dry-run and backfill-only: the FSM
    /// still runs locally, no venue write ever happens.
    async fn simulate(&self, pool: &SqlitePool, intent: &OrderIntent) -> anyhow::Result<OrderResult> {
        tracing::info!(
            correlation_id = %intent.correlation_id,
            symbol = %intent.symbol,
            side = %intent.side,
            qty = %intent.qty,
            "[DRY-RUN] Would submit order"
        );
        let submitted = OrderResult::new(&intent.correlation_id, OrderStatus::Submitted, self.clock.now_ms());
        self.record(pool, submitted).await?;

        let mut filled = OrderResult::new(&intent.correlation_id, OrderStatus::Filled, self.clock.now_ms());
        filled.filled_qty = intent.qty;
        filled.avg_price = intent.price;
        metrics::counter!("orders_filled_total").increment(1);
        self.record(pool, filled).await
    }

    async fn submit_and_drive(
        &self,
        pool: &SqlitePool,
        intent: &OrderIntent,
        client_id: &str,
    ) -> anyhow::Result<OrderResult> {
        let pending = OrderResult::new(&intent.correlation_id, OrderStatus::Pending, self.clock.now_ms());
        let mut result = self.record(pool, pending).await?;

        let mut attempts = 0u32;
        let order = loop {
            attempts += 1;
            self.wait_cooldown().await;
            match self.venue.submit_order(intent, client_id).await {
                Ok(SubmitOutcome::Accepted(order)) => {
                    self.mark_adapter_success(pool).await?;
                    metrics::counter!("orders_submitted_total").increment(1);
                    break order;
                }
                Ok(SubmitOutcome::DuplicateClientId) => {
                    self.mark_adapter_success(pool).await?;
                    metrics::counter!("orders_duplicate_client_id_total").increment(1);
                    match self.venue.query_order(&intent.symbol, client_id).await {
                        Ok(order) => break order,
                        Err(e) => {
                            self.mark_adapter_error(pool).await?;
                            result = apply_unknown(result, &e, self.clock.now_ms());
                            result = self.record(pool, result).await?;
                            return self.unknown_recovery(pool, intent, client_id, result).await;
                        }
                    }
                }
                Ok(SubmitOutcome::Rejected { code, message }) => {
                    self.mark_adapter_success(pool).await?;
                    metrics::counter!("orders_rejected_total").increment(1);
                    let rejected =
                        OrderResult::new(&intent.correlation_id, OrderStatus::Rejected, self.clock.now_ms())
                            .with_error(&code, &message);
                    return self.record(pool, rejected).await;
                }
                Err(VenueError::RateLimited) => {
                    self.set_cooldown();
                    metrics::counter!("execution_rate_limited_total").increment(1);
                    if attempts >= 3 {
                        // Transient by taxonomy: no status change, retried on
                        // the next recovery pass.
                        let pending = OrderResult::new(
                            &intent.correlation_id,
                            OrderStatus::Pending,
                            self.clock.now_ms(),
                        )
                        .with_error("RATE_LIMITED", "submit deferred by venue rate limit");
                        return self.record(pool, pending).await;
                    }
                }
                Err(e) if e.is_unknown_outcome() => {
                    self.mark_adapter_error(pool).await?;
                    result = apply_unknown(result, &e, self.clock.now_ms());
                    result = self.record(pool, result).await?;
                    return self.unknown_recovery(pool, intent, client_id, result).await;
                }
                Err(e) => {
                    self.mark_adapter_error(pool).await?;
                    let rejected =
                        OrderResult::new(&intent.correlation_id, OrderStatus::Rejected, self.clock.now_ms())
                            .with_error("EXCHANGE_REJECTED", &e.to_string());
                    return self.record(pool, rejected).await;
                }
            }
        };

        result = apply_venue_order(result, &order, self.clock.now_ms());
        result = self.record(pool, result).await?;
        self.drive_open_order(pool, intent, client_id, result).await
    }

    /// Poll an accepted order through fills, TIF expiry, and fallback.
    async fn drive_open_order(
        &self,
        pool: &SqlitePool,
        intent: &OrderIntent,
        client_id: &str,
        mut result: OrderResult,
    ) -> anyhow::Result<OrderResult> {
        if result.status == OrderStatus::Unknown {
            return self.unknown_recovery(pool, intent, client_id, result).await;
        }

        let deadline = self.clock.now_ms() + self.config.tif_seconds as i64 * 1_000;
        while !result.status.is_terminal() && self.clock.now_ms() < deadline {
            sleep(Duration::from_secs(self.config.order_poll_interval_sec)).await;
            self.wait_cooldown().await;
            match self.venue.query_order(&intent.symbol, client_id).await {
                Ok(order) => {
                    self.mark_adapter_success(pool).await?;
                    result = apply_venue_order(result, &order, self.clock.now_ms());
                    result = self.record(pool, result).await?;
                }
                Err(VenueError::RateLimited) => {
                    self.set_cooldown();
                }
                Err(e) if e.is_unknown_outcome() => {
                    self.mark_adapter_error(pool).await?;
                    if self.count_unknown_attempt(pool, &intent.correlation_id).await? {
                        return Ok(result);
                    }
                }
                Err(e) => {
                    self.mark_adapter_error(pool).await?;
                    tracing::warn!(error = %e, correlation_id = %intent.correlation_id, "Order poll failed");
                }
            }
        }

        if result.status == OrderStatus::Filled || result.status == OrderStatus::Rejected {
            if result.status == OrderStatus::Filled {
                metrics::counter!("orders_filled_total").increment(1);
            }
            return Ok(result);
        }
        if result.status == OrderStatus::Unknown {
            return self.unknown_recovery(pool, intent, client_id, result).await;
        }

        // TIF expired with remaining qty (or the venue already closed the
        // order): cancel, confirm, and consider the market fallback.
        if intent.order_type == OrderType::Limit && !result.status.is_terminal() {
            result = self.cancel_after_tif(pool, intent, client_id, result).await?;
        }
        if intent.order_type == OrderType::Limit
            && matches!(result.status, OrderStatus::Expired | OrderStatus::Canceled)
        {
            result = self.maybe_market_fallback(pool, intent, result).await?;
        }
        Ok(result)
    }

    async fn cancel_after_tif(
        &self,
        pool: &SqlitePool,
        intent: &OrderIntent,
        client_id: &str,
        mut result: OrderResult,
    ) -> anyhow::Result<OrderResult> {
        tracing::info!(
            correlation_id = %intent.correlation_id,
            filled = %result.filled_qty,
            "TIF expired, canceling remainder"
        );
        self.wait_cooldown().await;
        match self.venue.cancel_order(&intent.symbol, client_id).await {
            Ok(_) => {
                self.mark_adapter_success(pool).await?;
            }
            Err(VenueError::RateLimited) => {
                self.set_cooldown();
                self.wait_cooldown().await;
                if let Err(e) = self.venue.cancel_order(&intent.symbol, client_id).await {
                    tracing::warn!(error = %e, "Cancel retry failed");
                }
            }
            Err(e) if e.is_unknown_outcome() => {
                self.mark_adapter_error(pool).await?;
                result = apply_unknown(result, &e, self.clock.now_ms());
                result = self.record(pool, result).await?;
                return self.unknown_recovery(pool, intent, client_id, result).await;
            }
            Err(e) => {
                self.mark_adapter_error(pool).await?;
                tracing::warn!(error = %e, "Cancel failed");
            }
        }

        // Await cancellation confirmation and capture any last fills.
        match self.venue.query_order(&intent.symbol, client_id).await {
            Ok(order) => {
                self.mark_adapter_success(pool).await?;
                let now = self.clock.now_ms();
                let mut expired = result.clone();
                expired.exchange_order_id = order.exchange_order_id.or(expired.exchange_order_id);
                expired.filled_qty = order.filled_qty.max(expired.filled_qty);
                expired.avg_price = order.avg_price.or(expired.avg_price);
                expired.status = if order.status == OrderStatus::Filled {
                    OrderStatus::Filled
                } else {
                    OrderStatus::Expired
                };
                expired.updated_at_ms = now;
                result = self.record(pool, expired).await?;
            }
            Err(e) => {
                self.mark_adapter_error(pool).await?;
                tracing::warn!(error = %e, "Post-cancel query failed");
                let mut expired = result.clone();
                expired.status = OrderStatus::Expired;
                expired.updated_at_ms = self.clock.now_ms();
                result = self.record(pool, expired).await?;
            }
        }
        Ok(result)
    }

    /// Bounded MARKET chase for the unfilled remainder of an expired LIMIT
    /// order. Re-checks slippage against the mark price at fallback time;
    /// fills merge into the original result volume-weighted.
    async fn maybe_market_fallback(
        &self,
        pool: &SqlitePool,
        intent: &OrderIntent,
        mut result: OrderResult,
    ) -> anyhow::Result<OrderResult> {
        if !self.config.market_fallback_enabled {
            return Ok(result);
        }
        let remaining = intent.qty - result.filled_qty;
        if remaining <= Decimal::ZERO {
            return Ok(result);
        }
        if remaining > self.config.market_fallback_threshold_pct * intent.qty {
            tracing::info!(
                correlation_id = %intent.correlation_id,
                remaining = %remaining,
                "Remainder above fallback threshold, leaving expired"
            );
            return Ok(result);
        }
        let Some(reference) = intent.price else {
            return Ok(result);
        };

        let mark = match self.venue.fetch_mark_price(&intent.symbol).await {
            Ok(snapshot) => {
                self.mark_adapter_success(pool).await?;
                snapshot.price
            }
            Err(e) => {
                self.mark_adapter_error(pool).await?;
                tracing::warn!(error = %e, "Mark price unavailable, skipping fallback");
                return Ok(result);
            }
        };
        if self.config.market_slippage_cap_pct > Decimal::ZERO {
            let slippage = (mark - reference).abs() / reference.max(SLIPPAGE_EPSILON);
            if slippage > self.config.market_slippage_cap_pct {
                tracing::warn!(
                    correlation_id = %intent.correlation_id,
                    slippage = %slippage,
                    cap = %self.config.market_slippage_cap_pct,
                    "Fallback slippage over cap, expired state stands"
                );
                metrics::counter!("market_fallback_slippage_blocked_total").increment(1);
                return Ok(result);
            }
        }

        let fallback_client = sanitize_client_order_id(&format!(
            "{}-{}",
            intent.correlation_id,
            generate_nonce()
        ));
        let fallback_intent = OrderIntent {
            order_type: OrderType::Market,
            qty: remaining,
            price: None,
            time_in_force: crate::models::TimeInForce::Ioc,
            client_order_id: Some(fallback_client.clone()),
            ..intent.clone()
        };
        tracing::info!(
            correlation_id = %intent.correlation_id,
            client_id = %fallback_client,
            qty = %remaining,
            "Submitting market fallback for remainder"
        );
        metrics::counter!("market_fallbacks_total").increment(1);

        self.wait_cooldown().await;
        let mut fallback_order = match self.venue.submit_order(&fallback_intent, &fallback_client).await {
            Ok(SubmitOutcome::Accepted(order)) => {
                self.mark_adapter_success(pool).await?;
                order
            }
            Ok(SubmitOutcome::DuplicateClientId) => {
                self.mark_adapter_success(pool).await?;
                match self.venue.query_order(&intent.symbol, &fallback_client).await {
                    Ok(order) => order,
                    Err(e) => {
                        tracing::warn!(error = %e, "Fallback duplicate query failed");
                        return Ok(result);
                    }
                }
            }
            Ok(SubmitOutcome::Rejected { code, message }) => {
                tracing::warn!(code = %code, message = %message, "Market fallback rejected");
                return Ok(result);
            }
            Err(e) => {
                self.mark_adapter_error(pool).await?;
                tracing::warn!(error = %e, "Market fallback submit failed");
                return Ok(result);
            }
        };

        let mut polls = 0u32;
        while !fallback_order.status.is_terminal() && polls < 10 {
            polls += 1;
            sleep(Duration::from_secs(self.config.order_poll_interval_sec)).await;
            self.wait_cooldown().await;
            match self.venue.query_order(&intent.symbol, &fallback_client).await {
                Ok(order) => {
                    self.mark_adapter_success(pool).await?;
                    fallback_order = order;
                }
                Err(e) => {
                    self.mark_adapter_error(pool).await?;
                    tracing::warn!(error = %e, "Fallback poll failed");
                    break;
                }
            }
        }

        if fallback_order.filled_qty > Decimal::ZERO {
            result.merge_fill(fallback_order.filled_qty, fallback_order.avg_price);
            result.updated_at_ms = self.clock.now_ms();
            result = self.record(pool, result).await?;
        }
        Ok(result)
    }

    /// Query loop for orders in UNKNOWN, bounded by the retry budget.
    async fn unknown_recovery(
        &self,
        pool: &SqlitePool,
        intent: &OrderIntent,
        client_id: &str,
        mut result: OrderResult,
    ) -> anyhow::Result<OrderResult> {
        loop {
            sleep(Duration::from_secs(self.config.unknown_poll_interval_sec)).await;
            self.wait_cooldown().await;
            metrics::counter!("unknown_queries_total").increment(1);
            match self.venue.query_order(&intent.symbol, client_id).await {
                Ok(order) => {
                    self.mark_adapter_success(pool).await?;
                    result = apply_venue_order(result, &order, self.clock.now_ms());
                    result = self.record(pool, result).await?;
                    if result.status.is_terminal() {
                        return Ok(result);
                    }
                    // Back on a known path: keep polling this loop until the
                    // venue reports a terminal state.
                }
                Err(VenueError::RateLimited) => {
                    self.set_cooldown();
                }
                Err(e) => {
                    self.mark_adapter_error(pool).await?;
                    tracing::warn!(
                        error = %e,
                        correlation_id = %intent.correlation_id,
                        "Unknown-order query failed"
                    );
                    if self.count_unknown_attempt(pool, &intent.correlation_id).await? {
                        return Ok(result);
                    }
                }
            }
        }
    }

    /// Returns true when the budget is exhausted and safety was escalated.
    async fn count_unknown_attempt(&self, pool: &SqlitePool, correlation_id: &str) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        let status = {
            let mut budgets = self.budgets.lock().await;
            budgets
                .entry(correlation_id.to_string())
                .or_insert_with(|| {
                    RetryBudget::new(
                        self.config.retry_budget_max_attempts,
                        self.config.retry_budget_window_sec as i64 * 1_000,
                    )
                })
                .record_attempt(now)
        };
        if status == BudgetStatus::Exhausted {
            tracing::error!(
                correlation_id,
                max_attempts = self.config.retry_budget_max_attempts,
                window_sec = self.config.retry_budget_window_sec,
                "UNKNOWN retry budget exhausted, escalating to safety"
            );
            safety_repo::set_safety_state(
                pool,
                self.config.retry_budget_mode,
                SafetyReason::ExecutionRetryBudgetExceeded,
                &format!("UNKNOWN retry budget exhausted for {correlation_id}"),
                now,
            )
            .await?;
            return Ok(true);
        }
        Ok(false)
    }

    // -- shared plumbing ----------------------------------------------------

    async fn record(&self, pool: &SqlitePool, result: OrderResult) -> anyhow::Result<OrderResult> {
        match result_repo::upsert_result(pool, &result, self.clock.now_ms()).await? {
            UpsertOutcome::Applied { .. } => Ok(result),
            UpsertOutcome::RejectedTransition { existing } => {
                tracing::warn!(
                    correlation_id = %result.correlation_id,
                    attempted = %result.status,
                    existing = %existing,
                    "Refused non-monotone result transition"
                );
                result_repo::get_result(pool, &result.correlation_id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("result vanished during transition refusal"))
            }
        }
    }

    fn set_cooldown(&self) {
        let until = self.clock.now_ms() + self.config.rate_limit_cooldown_sec as i64 * 1_000;
        self.cooldown_until_ms.fetch_max(until, Ordering::SeqCst);
    }

    async fn wait_cooldown(&self) {
        let until = self.cooldown_until_ms.load(Ordering::SeqCst);
        let now = self.clock.now_ms();
        if until > now {
            sleep(Duration::from_millis((until - now) as u64)).await;
        }
    }

    async fn mark_adapter_success(&self, pool: &SqlitePool) -> anyhow::Result<()> {
        let now = self.clock.now_ms();
        set_system_state(pool, "adapter_last_success_ms", &now.to_string(), now).await
    }

    async fn mark_adapter_error(&self, pool: &SqlitePool) -> anyhow::Result<()> {
        let now = self.clock.now_ms();
        set_system_state(pool, "adapter_last_error_ms", &now.to_string(), now).await
    }
}

fn client_id_for(intent: &OrderIntent) -> String {
    intent
        .client_order_id
        .clone()
        .unwrap_or_else(|| sanitize_client_order_id(&intent.correlation_id))
}

/// Fold a venue view into the stored result. Query responses carry the
/// cumulative filled quantity, so they replace rather than accumulate.
fn apply_venue_order(mut result: OrderResult, order: &VenueOrder, now_ms: i64) -> OrderResult {
    result.status = order.status;
    result.exchange_order_id = order
        .exchange_order_id
        .clone()
        .or(result.exchange_order_id);
    result.filled_qty = order.filled_qty.max(result.filled_qty);
    result.avg_price = order.avg_price.or(result.avg_price);
    result.error_code = None;
    result.error_message = None;
    result.contract_version = CONTRACT_VERSION.to_string();
    result.updated_at_ms = now_ms;
    result
}

fn apply_unknown(mut result: OrderResult, error: &VenueError, now_ms: i64) -> OrderResult {
    result.status = OrderStatus::Unknown;
    let code = match error {
        VenueError::Timeout => "TIMEOUT",
        VenueError::Network(_) => "NETWORK_ERROR",
        _ => "EXCHANGE_ERROR",
    };
    result.error_code = Some(code.to_string());
    result.error_message = Some(error.to_string());
    result.updated_at_ms = now_ms;
    result
}
