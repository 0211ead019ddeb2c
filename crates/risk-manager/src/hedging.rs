//! Defensive hedging of losing positions.
//!
//! A hedge is an opposite-side position sized as a percentage of the original
//! quantity. The hedge book keeps at most one active hedge per symbol; a
//! symbol is reserved before any exchange call so concurrent requests for the
//! same symbol cannot both place orders. Exchange calls never run while the
//! book lock is held.

use autopilot_core::types::{HedgeAdvisory, OrderRequest, Position, PositionSide};
use autopilot_core::{Error, ExchangeClient, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Reason a hedge was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HedgeTrigger {
    PriceDrop,
    UnrealizedLoss,
    AiRecommendation,
    Manual,
}

/// Hedging thresholds and sizing rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HedgeConfig {
    pub enabled: bool,
    /// Adverse move from entry (percent) that triggers a hedge.
    pub price_drop_trigger_pct: Decimal,
    /// Unrealized loss (currency) that triggers a hedge.
    pub unrealized_loss_trigger_usd: Decimal,
    pub ai_enabled: bool,
    /// Minimum advisory confidence (percent).
    pub ai_confidence_min: Decimal,
    /// Hedge size when no step schedule is configured.
    pub default_percent: Decimal,
    /// Graduated hedge sizes, ascending (e.g. 25/50/75/100).
    pub partial_steps: Vec<Decimal>,
    /// Allow growing an active hedge to the next step.
    pub allow_stepping: bool,
    pub max_hedge_size_percent: Decimal,
    /// Cap on (original + hedge) notional relative to original notional.
    pub max_total_exposure_multiplier: Decimal,
    pub max_simultaneous: usize,
    /// Close the hedge once it is this many percent in profit.
    pub profit_take_pct: Decimal,
    /// Close the hedge once the main position is within this many percent of entry.
    pub close_on_recovery_pct: Decimal,
    pub order_timeout_ms: u64,
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            price_drop_trigger_pct: Decimal::new(5, 0),
            unrealized_loss_trigger_usd: Decimal::new(50, 0),
            ai_enabled: false,
            ai_confidence_min: Decimal::new(70, 0),
            default_percent: Decimal::new(50, 0),
            partial_steps: vec![
                Decimal::new(25, 0),
                Decimal::new(50, 0),
                Decimal::new(75, 0),
                Decimal::new(100, 0),
            ],
            allow_stepping: true,
            max_hedge_size_percent: Decimal::new(100, 0),
            max_total_exposure_multiplier: Decimal::new(2, 0),
            max_simultaneous: 3,
            profit_take_pct: Decimal::new(3, 0),
            close_on_recovery_pct: Decimal::new(2, 0),
            order_timeout_ms: 10_000,
        }
    }
}

impl HedgeConfig {
    pub fn validate(&self) -> Result<()> {
        let pct_ok = |p: Decimal| p >= Decimal::ZERO && p <= Decimal::ONE_HUNDRED;
        if !pct_ok(self.max_hedge_size_percent) || !pct_ok(self.default_percent) {
            return Err(Error::Validation(
                "hedge percentages must be within 0-100".to_string(),
            ));
        }
        if self.partial_steps.iter().any(|s| !pct_ok(*s) || s.is_zero()) {
            return Err(Error::Validation(
                "partial steps must be within (0, 100]".to_string(),
            ));
        }
        if self.partial_steps.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::Validation(
                "partial steps must be strictly ascending".to_string(),
            ));
        }
        if self.max_total_exposure_multiplier < Decimal::ONE {
            return Err(Error::Validation(
                "max_total_exposure_multiplier must be at least 1".to_string(),
            ));
        }
        if self.price_drop_trigger_pct < Decimal::ZERO
            || self.unrealized_loss_trigger_usd < Decimal::ZERO
        {
            return Err(Error::Validation(
                "hedge triggers must be non-negative".to_string(),
            ));
        }
        if self.order_timeout_ms == 0 {
            return Err(Error::Validation(
                "order_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Hedge size for a given loss percent, following the step schedule.
    pub fn percent_for_loss(&self, loss_pct: Decimal) -> Decimal {
        let pct = if self.partial_steps.is_empty() {
            self.default_percent
        } else {
            // One step per multiple of the price-drop trigger, clamped to the last step.
            let mut idx = 0;
            while idx + 1 < self.partial_steps.len()
                && self.price_drop_trigger_pct > Decimal::ZERO
                && loss_pct >= self.price_drop_trigger_pct * Decimal::from(idx as u64 + 1)
            {
                idx += 1;
            }
            self.partial_steps[idx]
        };
        pct.min(self.max_hedge_size_percent)
    }
}

/// External signals considered alongside the position itself.
#[derive(Debug, Clone, Default)]
pub struct MarketContext {
    pub advisory: Option<HedgeAdvisory>,
}

/// Result of trigger evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HedgeDecision {
    pub should_hedge: bool,
    pub trigger: Option<HedgeTrigger>,
    pub recommended_percent: Decimal,
}

impl HedgeDecision {
    fn skip() -> Self {
        Self {
            should_hedge: false,
            trigger: None,
            recommended_percent: Decimal::ZERO,
        }
    }
}

/// One hedge from open to close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeRecord {
    pub id: Uuid,
    pub symbol: String,
    pub position_side: PositionSide,
    pub position_quantity: Decimal,
    pub position_entry_price: Decimal,
    pub hedge_side: PositionSide,
    pub hedge_quantity: Decimal,
    /// Volume-weighted entry across steps.
    pub hedge_entry_price: Decimal,
    /// Cumulative hedge size as percent of the original quantity.
    pub hedge_percent: Decimal,
    pub trigger: HedgeTrigger,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub exit_price: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    pub close_reason: Option<String>,
    pub dry_run: bool,
    pub last_mark_price: Decimal,
    pub unrealized_pnl: Decimal,
}

impl HedgeRecord {
    fn pnl_at(&self, price: Decimal) -> Decimal {
        (price - self.hedge_entry_price) * self.hedge_quantity * self.hedge_side.sign()
    }

    fn pnl_pct_at(&self, price: Decimal) -> Decimal {
        if self.hedge_entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.hedge_entry_price) / self.hedge_entry_price
            * Decimal::ONE_HUNDRED
            * self.hedge_side.sign()
    }
}

/// Snapshot of the hedge book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeStatus {
    pub enabled: bool,
    pub hedge_mode_confirmed: bool,
    pub active_hedges: Vec<HedgeRecord>,
    pub active_count: usize,
    pub max_simultaneous: usize,
    pub config: HedgeConfig,
}

#[derive(Debug, Default)]
struct HedgeBook {
    active: HashMap<String, HedgeRecord>,
    history: HashMap<String, Vec<HedgeRecord>>,
    /// Symbols with an exchange call in flight.
    reserved: HashSet<String>,
}

/// Manages hedge lifecycle for one autopilot instance.
pub struct HedgingManager {
    config: RwLock<HedgeConfig>,
    book: Mutex<HedgeBook>,
    exchange: RwLock<Option<Arc<dyn ExchangeClient>>>,
    hedge_mode_confirmed: AtomicBool,
}

impl HedgingManager {
    pub fn new(config: HedgeConfig) -> Self {
        Self {
            config: RwLock::new(config),
            book: Mutex::new(HedgeBook::default()),
            exchange: RwLock::new(None),
            hedge_mode_confirmed: AtomicBool::new(false),
        }
    }

    /// Bind (or unbind) the exchange used for live hedges.
    pub async fn bind_exchange(&self, exchange: Option<Arc<dyn ExchangeClient>>) {
        *self.exchange.write().await = exchange;
        self.reset_exchange_state();
    }

    /// Forget the cached hedge-mode confirmation.
    pub fn reset_exchange_state(&self) {
        self.hedge_mode_confirmed.store(false, Ordering::SeqCst);
    }

    pub async fn config(&self) -> HedgeConfig {
        self.config.read().await.clone()
    }

    pub async fn update_config(&self, config: HedgeConfig) -> Result<()> {
        config.validate()?;
        *self.config.write().await = config;
        info!("Hedge config updated");
        Ok(())
    }

    pub async fn is_hedged(&self, symbol: &str) -> bool {
        self.book.lock().await.active.contains_key(symbol)
    }

    pub async fn active_hedge(&self, symbol: &str) -> Option<HedgeRecord> {
        self.book.lock().await.active.get(symbol).cloned()
    }

    /// Decide whether a position should be hedged and by how much.
    pub async fn evaluate_triggers(
        &self,
        position: &Position,
        context: &MarketContext,
    ) -> HedgeDecision {
        let config = self.config.read().await.clone();
        if !config.enabled || !position.is_losing() {
            return HedgeDecision::skip();
        }

        let (current_percent, active_count) = {
            let book = self.book.lock().await;
            (
                book.active.get(&position.symbol).map(|h| h.hedge_percent),
                book.active.len(),
            )
        };
        if current_percent.is_none() && active_count >= config.max_simultaneous {
            return HedgeDecision::skip();
        }

        let loss_pct = position.loss_percent();
        let unrealized_loss = -position.unrealized_pnl();

        let advisory = match context.advisory.as_ref() {
            Some(a) if a.symbol == position.symbol => Some(a),
            Some(other) => {
                debug!(
                    symbol = %position.symbol,
                    advisory_symbol = %other.symbol,
                    "Ignoring hedge advisory for another symbol"
                );
                None
            }
            None => None,
        };

        let trigger = if config.ai_enabled
            && advisory.is_some_and(|a| a.confidence >= config.ai_confidence_min)
        {
            Some(HedgeTrigger::AiRecommendation)
        } else if config.unrealized_loss_trigger_usd > Decimal::ZERO
            && unrealized_loss >= config.unrealized_loss_trigger_usd
        {
            Some(HedgeTrigger::UnrealizedLoss)
        } else if config.price_drop_trigger_pct > Decimal::ZERO
            && loss_pct >= config.price_drop_trigger_pct
        {
            Some(HedgeTrigger::PriceDrop)
        } else {
            None
        };

        let Some(trigger) = trigger else {
            return HedgeDecision::skip();
        };
        let recommended = match (trigger, advisory.and_then(|a| a.recommended_percent)) {
            (HedgeTrigger::AiRecommendation, Some(pct)) if pct > Decimal::ZERO => {
                pct.min(config.max_hedge_size_percent)
            }
            _ => config.percent_for_loss(loss_pct),
        };

        // An existing hedge only grows when the schedule calls for a larger step.
        if let Some(current) = current_percent {
            if !config.allow_stepping || recommended <= current {
                return HedgeDecision::skip();
            }
        }

        debug!(
            symbol = %position.symbol,
            trigger = ?trigger,
            loss_pct = %loss_pct,
            recommended = %recommended,
            "Hedge trigger fired"
        );

        HedgeDecision {
            should_hedge: true,
            trigger: Some(trigger),
            recommended_percent: recommended,
        }
    }

    /// Open a hedge, or grow an active one to a larger step.
    pub async fn execute_hedge(
        &self,
        symbol: &str,
        position: &Position,
        percent: Decimal,
        trigger: HedgeTrigger,
        dry_run: bool,
    ) -> Result<HedgeRecord> {
        if percent <= Decimal::ZERO {
            return Err(Error::Validation(
                "hedge percent must be positive".to_string(),
            ));
        }
        if position.quantity <= Decimal::ZERO {
            return Err(Error::Validation(
                "cannot hedge an empty position".to_string(),
            ));
        }

        let config = self.config.read().await.clone();
        let add_quantity = {
            let mut book = self.book.lock().await;
            let add = Self::check_hedge_allowed(&book, &config, symbol, position, percent)?;
            book.reserved.insert(symbol.to_string());
            add
        };

        let entry_price = if dry_run {
            position.mark_price
        } else {
            match self
                .place_hedge_order(&config, symbol, position.side.opposite(), add_quantity)
                .await
            {
                Ok(price) => price,
                Err(e) => {
                    self.release(symbol).await;
                    warn!(symbol, error = %e, "Hedge order failed, reservation released");
                    return Err(e);
                }
            }
        };

        let mut book = self.book.lock().await;
        book.reserved.remove(symbol);
        let record = match book.active.get_mut(symbol) {
            Some(existing) => {
                let total = existing.hedge_quantity + add_quantity;
                existing.hedge_entry_price = (existing.hedge_entry_price
                    * existing.hedge_quantity
                    + entry_price * add_quantity)
                    / total;
                existing.hedge_quantity = total;
                existing.hedge_percent = percent;
                existing.last_mark_price = entry_price;
                existing.unrealized_pnl = existing.pnl_at(entry_price);
                existing.clone()
            }
            None => {
                let record = HedgeRecord {
                    id: Uuid::new_v4(),
                    symbol: symbol.to_string(),
                    position_side: position.side,
                    position_quantity: position.quantity,
                    position_entry_price: position.entry_price,
                    hedge_side: position.side.opposite(),
                    hedge_quantity: add_quantity,
                    hedge_entry_price: entry_price,
                    hedge_percent: percent,
                    trigger,
                    opened_at: Utc::now(),
                    closed_at: None,
                    exit_price: None,
                    realized_pnl: None,
                    close_reason: None,
                    dry_run,
                    last_mark_price: entry_price,
                    unrealized_pnl: Decimal::ZERO,
                };
                book.active.insert(symbol.to_string(), record.clone());
                record
            }
        };

        info!(
            symbol,
            trigger = ?trigger,
            hedge_side = %record.hedge_side,
            quantity = %record.hedge_quantity,
            percent = %record.hedge_percent,
            entry_price = %entry_price,
            dry_run,
            "Hedge executed"
        );

        Ok(record)
    }

    /// Update unrealized hedge pnl at `price` and report whether the hedge
    /// should be closed.
    pub async fn mark_to_market(
        &self,
        symbol: &str,
        main_position: &Position,
        price: Decimal,
    ) -> Option<String> {
        let config = self.config.read().await.clone();
        let mut book = self.book.lock().await;
        let hedge = book.active.get_mut(symbol)?;

        hedge.last_mark_price = price;
        hedge.unrealized_pnl = hedge.pnl_at(price);
        let hedge_pnl_pct = hedge.pnl_pct_at(price);

        if config.profit_take_pct > Decimal::ZERO && hedge_pnl_pct >= config.profit_take_pct {
            return Some(format!("hedge_profit_target_{}%", hedge_pnl_pct.round_dp(2)));
        }

        let main = main_position.clone().with_mark(price);
        let main_pnl_pct = -main.loss_percent();
        if main_pnl_pct >= -config.close_on_recovery_pct {
            return Some(format!("main_position_recovered_{}%", main_pnl_pct.round_dp(2)));
        }

        None
    }

    /// Close the active hedge for `symbol` and return its realized pnl.
    ///
    /// A hedge opened on the exchange is always closed on the exchange,
    /// whatever mode the instance is in now.
    pub async fn close_hedge(&self, symbol: &str, reason: &str) -> Result<Decimal> {
        let config = self.config.read().await.clone();
        let hedge = {
            let mut book = self.book.lock().await;
            if book.reserved.contains(symbol) {
                return Err(Error::Hedge(format!(
                    "hedge operation already in progress for {symbol}"
                )));
            }
            let hedge = book
                .active
                .get(symbol)
                .cloned()
                .ok_or_else(|| Error::Hedge(format!("no active hedge for {symbol}")))?;
            book.reserved.insert(symbol.to_string());
            hedge
        };

        let exit_price = if hedge.dry_run {
            hedge.last_mark_price
        } else {
            let exchange = self.bound_exchange().await;
            let result = match exchange {
                Some(exchange) => {
                    Self::with_timeout(
                        "close_position",
                        config.order_timeout_ms,
                        exchange.close_position(symbol, hedge.hedge_side, hedge.hedge_quantity),
                    )
                    .await
                }
                None => Err(Error::NotConfigured(
                    "no exchange client bound".to_string(),
                )),
            };
            match result {
                Ok(fill) => fill.avg_price,
                Err(e) => {
                    self.release(symbol).await;
                    warn!(symbol, error = %e, "Failed to close hedge");
                    return Err(e);
                }
            }
        };

        let pnl = hedge.pnl_at(exit_price);
        let mut book = self.book.lock().await;
        book.reserved.remove(symbol);
        if let Some(mut closed) = book.active.remove(symbol) {
            closed.closed_at = Some(Utc::now());
            closed.exit_price = Some(exit_price);
            closed.realized_pnl = Some(pnl);
            closed.close_reason = Some(reason.to_string());
            closed.last_mark_price = exit_price;
            closed.unrealized_pnl = Decimal::ZERO;
            book.history
                .entry(symbol.to_string())
                .or_default()
                .push(closed);
        }

        info!(
            symbol,
            reason,
            entry = %hedge.hedge_entry_price,
            exit = %exit_price,
            pnl = %pnl,
            dry_run = hedge.dry_run,
            "Hedge closed"
        );

        Ok(pnl)
    }

    /// Close every active hedge. Failures do not stop the sweep but are
    /// reported together.
    pub async fn clear_all_hedges(&self) -> Result<()> {
        let symbols: Vec<String> = self.book.lock().await.active.keys().cloned().collect();

        let mut failed = Vec::new();
        for symbol in symbols {
            if let Err(e) = self.close_hedge(&symbol, "clear_all").await {
                warn!(symbol = %symbol, error = %e, "Failed to clear hedge");
                failed.push(symbol);
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            failed.sort();
            Err(Error::external(
                "exchange",
                format!("failed to close hedges: {}", failed.join(", ")),
            ))
        }
    }

    pub async fn hedge_status(&self) -> HedgeStatus {
        let config = self.config.read().await.clone();
        let book = self.book.lock().await;
        let mut active: Vec<HedgeRecord> = book.active.values().cloned().collect();
        active.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        HedgeStatus {
            enabled: config.enabled,
            hedge_mode_confirmed: self.hedge_mode_confirmed.load(Ordering::SeqCst),
            active_count: active.len(),
            active_hedges: active,
            max_simultaneous: config.max_simultaneous,
            config,
        }
    }

    /// Closed hedges for `symbol`, oldest first, followed by the active one.
    pub async fn hedge_history(&self, symbol: &str) -> Vec<HedgeRecord> {
        let book = self.book.lock().await;
        let mut records = book.history.get(symbol).cloned().unwrap_or_default();
        if let Some(active) = book.active.get(symbol) {
            records.push(active.clone());
        }
        records
    }

    // Private methods

    /// Validate a request against the book. Returns the quantity to add.
    fn check_hedge_allowed(
        book: &HedgeBook,
        config: &HedgeConfig,
        symbol: &str,
        position: &Position,
        percent: Decimal,
    ) -> Result<Decimal> {
        if percent > config.max_hedge_size_percent {
            return Err(Error::Hedge(format!(
                "hedge of {percent}% exceeds max hedge size {}%",
                config.max_hedge_size_percent
            )));
        }
        if book.reserved.contains(symbol) {
            return Err(Error::Hedge(format!(
                "hedge operation already in progress for {symbol}"
            )));
        }

        let current = book.active.get(symbol);
        match current {
            Some(existing) => {
                let in_schedule =
                    config.partial_steps.is_empty() || config.partial_steps.contains(&percent);
                if !config.allow_stepping || percent <= existing.hedge_percent || !in_schedule {
                    return Err(Error::Hedge(format!(
                        "hedge already active for {symbol} at {}%",
                        existing.hedge_percent
                    )));
                }
            }
            None => {
                let in_use = book.active.len() + book.reserved.len();
                if in_use >= config.max_simultaneous {
                    return Err(Error::Hedge(format!(
                        "max simultaneous hedges reached ({})",
                        config.max_simultaneous
                    )));
                }
            }
        }

        let target_quantity = position.quantity * percent / Decimal::ONE_HUNDRED;
        let existing_quantity = current.map(|h| h.hedge_quantity).unwrap_or(Decimal::ZERO);
        let add_quantity = target_quantity - existing_quantity;

        let original_notional = position.notional();
        let hedge_notional = target_quantity * position.mark_price;
        let limit = original_notional * config.max_total_exposure_multiplier;
        if original_notional + hedge_notional > limit {
            return Err(Error::Hedge(format!(
                "total exposure {} would exceed {}x original notional {}",
                original_notional + hedge_notional,
                config.max_total_exposure_multiplier,
                original_notional
            )));
        }

        Ok(add_quantity)
    }

    async fn release(&self, symbol: &str) {
        self.book.lock().await.reserved.remove(symbol);
    }

    async fn bound_exchange(&self) -> Option<Arc<dyn ExchangeClient>> {
        self.exchange.read().await.clone()
    }

    async fn place_hedge_order(
        &self,
        config: &HedgeConfig,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
    ) -> Result<Decimal> {
        let exchange = self
            .bound_exchange()
            .await
            .ok_or_else(|| Error::NotConfigured("no exchange client bound".to_string()))?;

        self.ensure_hedge_mode(exchange.as_ref(), config.order_timeout_ms)
            .await?;

        let order = OrderRequest::market(symbol, side, quantity).hedge();
        let fill = Self::with_timeout(
            "place_order",
            config.order_timeout_ms,
            exchange.place_order(&order),
        )
        .await?;
        Ok(fill.avg_price)
    }

    async fn ensure_hedge_mode(&self, exchange: &dyn ExchangeClient, timeout_ms: u64) -> Result<()> {
        if self.hedge_mode_confirmed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let enabled =
            Self::with_timeout("hedge_mode_enabled", timeout_ms, exchange.hedge_mode_enabled())
                .await?;
        if !enabled {
            info!("Hedge position mode not active, enabling");
            Self::with_timeout("enable_hedge_mode", timeout_ms, exchange.enable_hedge_mode())
                .await
                .map_err(|e| {
                    Error::external(
                        "exchange",
                        format!("cannot execute hedge without hedge mode: {e}"),
                    )
                })?;
        }

        self.hedge_mode_confirmed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn with_timeout<T>(
        operation: &str,
        timeout_ms: u64,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: operation.to_string(),
                timeout_ms,
            }),
        }
    }
}

impl Default for HedgingManager {
    fn default() -> Self {
        Self::new(HedgeConfig::default())
    }
}
