//! A single autopilot controller.
//!
//! An instance owns its guards (circuit breaker, per-mode safety, capital
//! allocation) behind one mutex, a hedging manager with its own book lock,
//! the clients bound for its owner, and the trading loop task. Mutating
//! operations are gated on ownership; status reads are open to everyone.

use autopilot_core::types::{
    OrderRequest, Position, PositionSide, TradeIntent, TradeSettlement, TradingMode, Verdict,
};
use autopilot_core::{
    load_or_default, AppConfig, Error, ExchangeClient, Result, SettingsKey, SettingsStore,
    TradingSettings,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use risk_manager::circuit_breaker::CircuitBreakerState;
use risk_manager::{
    diff_allocation, diff_circuit_breaker, diff_hedge, diff_mode_safety, max_risk,
    AllocationPercentages, AllocationStatus, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerStatus, HedgeConfig, HedgeRecord, HedgeStatus, HedgeTrigger, HedgingManager,
    MarketContext, ModeAllocationConfig, ModeAllocationEngine, ModeSafetyConfig,
    ModeSafetyMonitor, ModeSafetyStatus, RiskLevel, SettingChange,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bindings::{BindAction, BindingOutcome, ClientBindings, ClientFactory};
use crate::persistence::PersistenceQueue;
use crate::trading_loop;

/// Terminal order tickets older than this are pruned.
const TICKET_RETENTION_HOURS: i64 = 24;

/// Runtime knobs shared by every instance of a manager.
#[derive(Debug, Clone)]
pub struct InstanceOptions {
    pub exchange_timeout: Duration,
    pub loop_interval: Duration,
    pub stop_timeout: Duration,
    /// Capital assumed until an exchange reports a balance.
    pub initial_capital: Decimal,
    /// Clear the owner when the instance stops (shared controller).
    pub release_owner_on_stop: bool,
}

impl InstanceOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            exchange_timeout: config.exchange_timeout(),
            loop_interval: config.loop_interval(),
            stop_timeout: config.stop_timeout(),
            initial_capital: Decimal::from(config.paper_balance),
            release_owner_on_stop: matches!(
                config.ownership_mode,
                autopilot_core::OwnershipMode::Shared
            ),
        }
    }
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            exchange_timeout: Duration::from_secs(10),
            loop_interval: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(15),
            initial_capital: Decimal::new(10_000, 0),
            release_owner_on_stop: false,
        }
    }
}

/// Collaborators injected into every instance.
#[derive(Clone)]
pub struct InstanceDeps {
    pub store: Arc<dyn SettingsStore>,
    pub persistence: Arc<PersistenceQueue>,
    pub factory: Arc<dyn ClientFactory>,
}

/// Stored circuit breaker document: the config plus the last known state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerRecord {
    #[serde(flatten)]
    pub config: CircuitBreakerConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<CircuitBreakerState>,
}

/// Guards evaluated for every intent, locked together.
pub struct GuardSet {
    pub breaker: CircuitBreaker,
    pub safety: ModeSafetyMonitor,
    pub allocation: ModeAllocationEngine,
}

impl GuardSet {
    /// Breaker first, then mode safety, then capacity.
    pub fn evaluate(&mut self, intent: &TradeIntent, now: DateTime<Utc>) -> Verdict {
        let verdict = self.breaker.evaluate_at(now);
        if !verdict.is_allowed() {
            return verdict;
        }
        let verdict = self.safety.evaluate_at(intent.mode, now);
        if !verdict.is_allowed() {
            return verdict;
        }
        self.allocation
            .check_capacity_verdict(intent.mode, intent.notional_usd)
    }

    fn breaker_record(&self) -> BreakerRecord {
        BreakerRecord {
            config: self.breaker.config().clone(),
            state: Some(self.breaker.state().clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    AlreadyRunning { owner: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    Filled,
    Aborted,
}

impl TicketStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TicketStatus::Pending)
    }
}

/// Tracks one order from submission to a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTicket {
    pub id: Uuid,
    pub intent_id: Uuid,
    pub symbol: String,
    pub mode: TradingMode,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub notional_usd: Decimal,
    pub dry_run: bool,
    pub status: TicketStatus,
    pub fill_price: Option<Decimal>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Work done by one trading-loop cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub intents: usize,
    pub allowed: usize,
    pub denied: usize,
    pub failed: usize,
    pub hedges_opened: usize,
    pub hedges_closed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub instance_id: String,
    pub owner: Option<String>,
    pub running: bool,
    pub dry_run: bool,
    pub auto_start: bool,
    pub exchange_bound: bool,
    pub exchange_provider: Option<String>,
    pub decision_bound: bool,
    pub trading_halted: bool,
    pub paused_modes: Vec<TradingMode>,
    pub open_positions: Vec<Position>,
    pub pending_orders: usize,
    pub active_hedges: usize,
    pub last_active: DateTime<Utc>,
}

struct LoopHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Counts intents between admission and a terminal ticket.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            tracker: self.clone(),
        }
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent exit cannot be missed.
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct InFlightGuard {
    tracker: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.tracker.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

pub struct AutopilotInstance {
    id: String,
    options: InstanceOptions,
    deps: InstanceDeps,
    guards: Mutex<GuardSet>,
    hedging: HedgingManager,
    owner: RwLock<Option<String>>,
    bindings: RwLock<ClientBindings>,
    running: AtomicBool,
    /// Set while stop drains; new intents are rejected.
    stopping: AtomicBool,
    in_flight: Arc<InFlight>,
    dry_run: AtomicBool,
    auto_start: AtomicBool,
    positions: DashMap<String, Position>,
    tickets: DashMap<Uuid, OrderTicket>,
    /// Serializes start and stop.
    lifecycle: Mutex<()>,
    /// Serializes settings that live outside the guard lock (trading flags,
    /// hedge config) so their writes reach storage in order.
    settings_write: Mutex<()>,
    loop_handle: Mutex<Option<LoopHandle>>,
    last_active_ms: AtomicI64,
}

impl AutopilotInstance {
    /// Build an instance, loading its settings from the store.
    ///
    /// Missing or invalid documents fall back to defaults.
    pub async fn load(
        id: impl Into<String>,
        owner: Option<String>,
        deps: InstanceDeps,
        options: InstanceOptions,
    ) -> Arc<Self> {
        let id = id.into();
        let store = deps.store.as_ref();

        let breaker_record: BreakerRecord =
            load_or_default(store, &id, SettingsKey::CircuitBreaker).await;
        let breaker_config = valid_or(
            &id,
            SettingsKey::CircuitBreaker,
            breaker_record.config,
            CircuitBreakerConfig::validate,
            CircuitBreakerConfig::default,
        );
        let breaker = match breaker_record.state {
            Some(state) => CircuitBreaker::restore(breaker_config, state),
            None => CircuitBreaker::new(breaker_config),
        };

        let allocation_config: ModeAllocationConfig =
            load_or_default(store, &id, SettingsKey::ModeAllocation).await;
        let allocation_config = valid_or(
            &id,
            SettingsKey::ModeAllocation,
            allocation_config,
            ModeAllocationConfig::validate,
            ModeAllocationConfig::default,
        );

        let mut safety_configs = BTreeMap::new();
        for mode in TradingMode::ALL {
            let key = SettingsKey::ModeSafety(mode);
            let stored: Option<ModeSafetyConfig> = load_or_default(store, &id, key).await;
            let config = match stored {
                Some(config) => valid_or(&id, key, config, ModeSafetyConfig::validate, || {
                    ModeSafetyConfig::for_mode(mode)
                }),
                None => ModeSafetyConfig::for_mode(mode),
            };
            safety_configs.insert(mode, config);
        }

        let hedge_config: HedgeConfig =
            load_or_default(store, &id, SettingsKey::Hedge).await;
        let hedge_config = valid_or(
            &id,
            SettingsKey::Hedge,
            hedge_config,
            HedgeConfig::validate,
            HedgeConfig::default,
        );

        let trading: TradingSettings =
            load_or_default(store, &id, SettingsKey::Trading).await;

        info!(
            instance = %id,
            owner = ?owner,
            dry_run = trading.dry_run,
            "Autopilot instance created"
        );

        Arc::new(Self {
            guards: Mutex::new(GuardSet {
                breaker,
                safety: ModeSafetyMonitor::new(safety_configs),
                allocation: ModeAllocationEngine::new(allocation_config, options.initial_capital),
            }),
            hedging: HedgingManager::new(hedge_config),
            owner: RwLock::new(owner),
            bindings: RwLock::new(ClientBindings::default()),
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            in_flight: Arc::new(InFlight::default()),
            dry_run: AtomicBool::new(trading.dry_run),
            auto_start: AtomicBool::new(trading.auto_start),
            positions: DashMap::new(),
            tickets: DashMap::new(),
            lifecycle: Mutex::new(()),
            settings_write: Mutex::new(()),
            loop_handle: Mutex::new(None),
            last_active_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            id,
            options,
            deps,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn owner(&self) -> Option<String> {
        self.owner.read().await.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Intents admitted but not yet resolved.
    pub fn in_flight_intents(&self) -> usize {
        self.in_flight.count()
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run.load(Ordering::SeqCst)
    }

    pub fn auto_start_enabled(&self) -> bool {
        self.auto_start.load(Ordering::SeqCst)
    }

    pub fn loop_interval(&self) -> Duration {
        self.options.loop_interval
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_active_ms.load(Ordering::SeqCst))
            .unwrap_or_else(Utc::now)
    }

    pub fn touch(&self) {
        self.last_active_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    // ==================== Ownership ====================

    async fn ensure_owner(&self, actor: &str) -> Result<()> {
        match self.owner.read().await.as_deref() {
            Some(owner) if owner != actor => {
                warn!(instance = %self.id, actor, owner, "Rejected mutation from non-owner");
                Err(Error::permission_denied(
                    "autopilot instance is owned by another user",
                ))
            }
            _ => Ok(()),
        }
    }

    /// Claim an unowned instance for `user_id`. Fails if someone else owns it.
    pub async fn set_owner(&self, user_id: &str) -> Result<()> {
        let mut owner = self.owner.write().await;
        match owner.as_deref() {
            Some(current) if current != user_id => Err(Error::permission_denied(
                "autopilot instance is owned by another user",
            )),
            Some(_) => Ok(()),
            None => {
                info!(instance = %self.id, owner = user_id, "Autopilot ownership claimed");
                *owner = Some(user_id.to_string());
                Ok(())
            }
        }
    }

    pub async fn clear_owner(&self) {
        let previous = self.owner.write().await.take();
        if previous.is_some() {
            info!(instance = %self.id, previous = ?previous, "Autopilot ownership cleared");
        }
    }

    // ==================== Lifecycle ====================

    /// Start the trading loop. The first caller on an unowned instance
    /// becomes its owner.
    pub async fn start(self: &Arc<Self>, actor: &str) -> Result<StartOutcome> {
        let _lifecycle = self.lifecycle.lock().await;
        self.touch();

        if self.is_running() {
            return Ok(StartOutcome::AlreadyRunning {
                owner: self.owner().await,
            });
        }

        self.ensure_owner(actor).await?;
        let claimed = {
            let mut owner = self.owner.write().await;
            if owner.is_none() {
                *owner = Some(actor.to_string());
                true
            } else {
                false
            }
        };

        if let Err(e) = self.prepare_start(actor).await {
            if claimed {
                self.owner.write().await.take();
            }
            return Err(e);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(trading_loop::run(self.clone(), stop_rx));
        *self.loop_handle.lock().await = Some(LoopHandle { stop_tx, task });
        self.running.store(true, Ordering::SeqCst);

        info!(
            instance = %self.id,
            owner = actor,
            dry_run = self.is_dry_run(),
            "Autopilot started"
        );
        Ok(StartOutcome::Started)
    }

    async fn prepare_start(&self, actor: &str) -> Result<()> {
        self.bind_clients(actor).await?;
        let bindings = self.bindings.read().await;
        if bindings.decision.is_none() {
            return Err(Error::NotConfigured(
                "no decision client is bound".to_string(),
            ));
        }
        if !self.is_dry_run() && bindings.exchange.is_none() {
            return Err(Error::NotConfigured(
                "live trading requires exchange credentials".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn stop(&self, actor: &str) -> Result<StopOutcome> {
        let _lifecycle = self.lifecycle.lock().await;
        self.ensure_owner(actor).await?;
        self.touch();
        Ok(self.stop_locked().await)
    }

    /// Stop without an ownership check. Used by eviction and shutdown.
    pub async fn force_stop(&self) -> StopOutcome {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_locked().await
    }

    /// Reject new intents, stop the loop, then give admitted intents until
    /// the stop deadline to resolve. Tickets still pending after that are
    /// marked aborted; a fill that lands later still moves them to filled.
    async fn stop_locked(&self) -> StopOutcome {
        if !self.is_running() {
            return StopOutcome::NotRunning;
        }

        self.stopping.store(true, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + self.options.stop_timeout;

        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.stop_tx.send(true);
            let mut task = handle.task;
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(instance = %self.id, error = %e, "Trading loop task failed"),
                Err(_) => {
                    warn!(
                        instance = %self.id,
                        timeout_ms = self.options.stop_timeout.as_millis() as u64,
                        "Trading loop did not stop in time, aborting"
                    );
                    task.abort();
                }
            }
        }

        if tokio::time::timeout_at(deadline, self.in_flight.wait_idle())
            .await
            .is_err()
        {
            warn!(
                instance = %self.id,
                in_flight = self.in_flight.count(),
                "Intents still awaiting the exchange at stop deadline"
            );
        }

        self.running.store(false, Ordering::SeqCst);
        let aborted = self.abort_pending_tickets("autopilot stopped");
        self.stopping.store(false, Ordering::SeqCst);

        if self.options.release_owner_on_stop {
            self.clear_owner().await;
        }

        info!(instance = %self.id, aborted_orders = aborted, "Autopilot stopped");
        StopOutcome::Stopped
    }

    // ==================== Client binding ====================

    /// Re-resolve the owner's clients. Bindings are only rebuilt when the
    /// stored credentials changed provider or key.
    pub async fn refresh_clients(&self, actor: &str) -> Result<BindingOutcome> {
        self.ensure_owner(actor).await?;
        self.touch();
        let user_id = self.owner().await.unwrap_or_else(|| actor.to_string());
        self.bind_clients(&user_id).await
    }

    async fn bind_clients(&self, user_id: &str) -> Result<BindingOutcome> {
        let factory = self.deps.factory.clone();
        let descriptor = factory.descriptor(user_id).await?;
        let current = self.bindings.read().await.descriptor().cloned();

        let exchange = match (descriptor, current) {
            (Some(wanted), Some(bound)) if wanted == bound => BindAction::Unchanged,
            (Some(wanted), _) => {
                let client = factory.build_exchange(user_id, &wanted).await?;
                info!(
                    instance = %self.id,
                    provider = %wanted.provider,
                    "Exchange client bound"
                );
                self.bindings.write().await.exchange = Some((wanted, client.clone()));
                self.hedging.bind_exchange(Some(client)).await;
                BindAction::Bound
            }
            (None, Some(_)) => {
                info!(instance = %self.id, "Exchange credentials removed, unbinding client");
                self.bindings.write().await.exchange = None;
                self.hedging.bind_exchange(None).await;
                BindAction::Unbound
            }
            (None, None) => BindAction::Unchanged,
        };

        let decision = if self.bindings.read().await.decision.is_some() {
            BindAction::Unchanged
        } else {
            let client = factory.build_decision_client(user_id).await?;
            self.bindings.write().await.decision = Some(client);
            debug!(instance = %self.id, "Decision client bound");
            BindAction::Bound
        };

        Ok(BindingOutcome { exchange, decision })
    }

    async fn exchange(&self) -> Option<Arc<dyn ExchangeClient>> {
        self.bindings.read().await.exchange()
    }

    // ==================== Order flow ====================

    /// Run an intent through the guard chain and place it when allowed.
    pub async fn submit_intent(
        self: &Arc<Self>,
        actor: &str,
        intent: &TradeIntent,
    ) -> Result<Verdict> {
        self.ensure_owner(actor).await?;
        self.touch();
        self.process_intent(intent).await
    }

    pub(crate) async fn process_intent(
        self: &Arc<Self>,
        intent: &TradeIntent,
    ) -> Result<Verdict> {
        if intent.notional_usd <= Decimal::ZERO || intent.reference_price <= Decimal::ZERO {
            return Err(Error::Validation(
                "intent notional and reference price must be positive".to_string(),
            ));
        }

        let in_flight = self.in_flight.enter();
        if self.is_stopping() {
            return Err(Error::Validation(
                "autopilot is stopping, intent rejected".to_string(),
            ));
        }

        // Detached so a dropped caller or an aborted loop cannot strand
        // booked capacity or a pending ticket.
        let instance = self.clone();
        let intent = intent.clone();
        let task = tokio::spawn(async move {
            let _in_flight = in_flight;
            instance.guard_and_execute(&intent).await
        });
        task.await
            .map_err(|e| Error::Internal(format!("intent task failed: {e}")))?
    }

    async fn guard_and_execute(&self, intent: &TradeIntent) -> Result<Verdict> {
        let verdict = {
            let mut guards = self.guards.lock().await;
            let verdict = guards.evaluate(intent, Utc::now());
            if verdict.is_allowed() {
                // Book capacity before releasing the lock so concurrent
                // intents cannot oversubscribe the mode.
                guards
                    .allocation
                    .open_position(intent.mode, intent.notional_usd);
            }
            verdict
        };

        if let Some(denial) = verdict.denial() {
            info!(
                instance = %self.id,
                symbol = %intent.symbol,
                mode = %intent.mode,
                guard = %denial.guard,
                code = %denial.code,
                "Intent denied"
            );
            self.notify_verdict(intent, &verdict).await;
            return Ok(verdict);
        }

        if let Err(e) = self.execute_intent(intent).await {
            self.guards
                .lock()
                .await
                .allocation
                .close_position(intent.mode, intent.notional_usd);
            return Err(e);
        }

        self.notify_verdict(intent, &verdict).await;
        Ok(verdict)
    }

    async fn execute_intent(&self, intent: &TradeIntent) -> Result<OrderTicket> {
        let dry_run = self.is_dry_run();
        let now = Utc::now();
        let quantity = intent.quantity();
        let ticket = OrderTicket {
            id: Uuid::new_v4(),
            intent_id: intent.id,
            symbol: intent.symbol.clone(),
            mode: intent.mode,
            side: intent.side,
            quantity,
            notional_usd: intent.notional_usd,
            dry_run,
            status: TicketStatus::Pending,
            fill_price: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        let ticket_id = ticket.id;
        self.tickets.insert(ticket_id, ticket);

        let fill_price = if dry_run {
            intent.reference_price
        } else {
            let placed = match self.exchange().await {
                Some(exchange) => {
                    let order = OrderRequest::market(&intent.symbol, intent.side, quantity);
                    self.with_timeout("place_order", exchange.place_order(&order))
                        .await
                }
                None => Err(Error::NotConfigured(
                    "live trading requires exchange credentials".to_string(),
                )),
            };
            match placed {
                Ok(fill) => fill.avg_price,
                Err(e) => {
                    warn!(
                        instance = %self.id,
                        symbol = %intent.symbol,
                        error = %e,
                        "Order placement failed"
                    );
                    self.finish_ticket(ticket_id, TicketStatus::Aborted, None, Some(e.to_string()));
                    return Err(e);
                }
            }
        };

        let ticket = self.finish_ticket(ticket_id, TicketStatus::Filled, Some(fill_price), None);
        self.apply_fill(intent, quantity, fill_price);

        info!(
            instance = %self.id,
            symbol = %intent.symbol,
            mode = %intent.mode,
            side = %intent.side,
            quantity = %quantity,
            price = %fill_price,
            dry_run,
            "Intent executed"
        );

        ticket.ok_or_else(|| Error::Internal(format!("order ticket {ticket_id} disappeared")))
    }

    fn finish_ticket(
        &self,
        id: Uuid,
        status: TicketStatus,
        fill_price: Option<Decimal>,
        error: Option<String>,
    ) -> Option<OrderTicket> {
        let mut ticket = self.tickets.get_mut(&id)?;
        let late_fill =
            ticket.status == TicketStatus::Aborted && status == TicketStatus::Filled;
        if late_fill {
            // The exchange filled it, so the ticket follows the exchange.
            warn!(instance = %self.id, ticket = %id, "Order filled after its ticket was aborted");
            ticket.status = status;
            ticket.fill_price = fill_price;
            ticket.error = None;
            ticket.updated_at = Utc::now();
        } else if ticket.status.is_terminal() {
            warn!(
                instance = %self.id,
                ticket = %id,
                current = ?ticket.status,
                requested = ?status,
                "Order resolved after ticket was closed"
            );
        } else {
            ticket.status = status;
            ticket.fill_price = fill_price;
            ticket.error = error;
            ticket.updated_at = Utc::now();
        }
        Some(ticket.clone())
    }

    fn abort_pending_tickets(&self, reason: &str) -> usize {
        let now = Utc::now();
        let mut aborted = 0;
        for mut ticket in self.tickets.iter_mut() {
            if ticket.status == TicketStatus::Pending {
                ticket.status = TicketStatus::Aborted;
                ticket.error = Some(reason.to_string());
                ticket.updated_at = now;
                aborted += 1;
            }
        }
        let cutoff = now - ChronoDuration::hours(TICKET_RETENTION_HOURS);
        self.tickets
            .retain(|_, t| !t.status.is_terminal() || t.updated_at > cutoff);
        aborted
    }

    /// Net a fill into the tracked position for its symbol.
    fn apply_fill(&self, intent: &TradeIntent, quantity: Decimal, price: Decimal) {
        let existing = self.positions.get(&intent.symbol).map(|p| p.clone());
        let updated = net_position(existing, intent, quantity, price);
        match updated {
            Some(position) => {
                self.positions.insert(intent.symbol.clone(), position);
            }
            None => {
                self.positions.remove(&intent.symbol);
            }
        }
    }

    async fn notify_verdict(&self, intent: &TradeIntent, verdict: &Verdict) {
        let decision = self.bindings.read().await.decision.clone();
        if let Some(decision) = decision {
            decision.on_verdict(intent, verdict).await;
        }
    }

    /// Feed a closed trade into the guards. No ownership check: this is the
    /// system's own fill feed.
    pub async fn record_settlement(&self, settlement: &TradeSettlement) {
        let trip = {
            let mut guards = self.guards.lock().await;
            let trip = guards
                .breaker
                .record_outcome_at(settlement.realized_pnl, settlement.settled_at);
            guards.safety.record_mode_outcome_at(
                settlement.mode,
                settlement.won(),
                settlement.pnl_percent,
                settlement.settled_at,
            );
            guards
                .allocation
                .close_position(settlement.mode, settlement.notional_usd);
            self.persist(SettingsKey::CircuitBreaker, &guards.breaker_record());
            trip
        };

        if let Some(reason) = trip {
            warn!(
                instance = %self.id,
                reason = reason.code(),
                "Circuit breaker tripped by settlement"
            );
        }

        debug!(
            instance = %self.id,
            symbol = %settlement.symbol,
            mode = %settlement.mode,
            pnl = %settlement.realized_pnl,
            "Settlement recorded"
        );

        self.positions.remove(&settlement.symbol);
        if self.hedging.is_hedged(&settlement.symbol).await {
            if let Err(e) = self
                .hedging
                .close_hedge(&settlement.symbol, "position_closed")
                .await
            {
                warn!(
                    instance = %self.id,
                    symbol = %settlement.symbol,
                    error = %e,
                    "Failed to close hedge for settled position"
                );
            }
        }
    }

    // ==================== Trading loop ====================

    /// One pass of the trading loop: refresh capital, manage hedges, then
    /// evaluate pending intents.
    pub async fn run_cycle(self: &Arc<Self>) -> CycleReport {
        let mut report = CycleReport::default();
        let exchange = self.exchange().await;
        let dry_run = self.is_dry_run();

        if let Some(exchange) = &exchange {
            self.refresh_capital(exchange.as_ref()).await;
            if self.hedging.config().await.enabled {
                self.manage_hedges(exchange.as_ref(), dry_run, &mut report)
                    .await;
            }
        }

        let decision = self.bindings.read().await.decision.clone();
        let Some(decision) = decision else {
            return report;
        };
        let user_id = self.owner().await.unwrap_or_else(|| self.id.clone());
        let intents = match self
            .with_timeout("next_intents", decision.next_intents(&user_id))
            .await
        {
            Ok(intents) => intents,
            Err(e) => {
                warn!(instance = %self.id, error = %e, "Failed to fetch intents");
                return report;
            }
        };

        for (i, intent) in intents.iter().enumerate() {
            if self.is_stopping() {
                warn!(
                    instance = %self.id,
                    skipped = intents.len() - i,
                    "Stop requested, leaving remaining intents unprocessed"
                );
                break;
            }
            report.intents += 1;
            match self.process_intent(intent).await {
                Ok(verdict) if verdict.is_allowed() => report.allowed += 1,
                Ok(_) => report.denied += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        instance = %self.id,
                        symbol = %intent.symbol,
                        error = %e,
                        "Intent failed"
                    );
                }
            }
        }

        if report.intents > 0 {
            self.touch();
        }
        report
    }

    async fn refresh_capital(&self, exchange: &dyn ExchangeClient) {
        match self
            .with_timeout("get_account_info", exchange.get_account_info())
            .await
        {
            Ok(account) => {
                let mut guards = self.guards.lock().await;
                if let Err(e) = guards.allocation.set_total_capital(account.total_balance) {
                    warn!(instance = %self.id, error = %e, "Exchange reported invalid balance");
                }
            }
            Err(e) => warn!(instance = %self.id, error = %e, "Failed to refresh account info"),
        }
    }

    async fn manage_hedges(
        &self,
        exchange: &dyn ExchangeClient,
        dry_run: bool,
        report: &mut CycleReport,
    ) {
        let symbols: Vec<String> = self.positions.iter().map(|p| p.key().clone()).collect();
        let decision = self.bindings.read().await.decision.clone();

        for symbol in symbols {
            let price = match self
                .with_timeout("mark_price", exchange.mark_price(&symbol))
                .await
            {
                Ok(price) => price,
                Err(e) => {
                    debug!(instance = %self.id, symbol = %symbol, error = %e, "No mark price");
                    continue;
                }
            };
            let Some(position) = self.positions.get_mut(&symbol).map(|mut p| {
                p.mark_price = price;
                p.clone()
            }) else {
                continue;
            };

            if let Some(reason) = self.hedging.mark_to_market(&symbol, &position, price).await {
                match self.hedging.close_hedge(&symbol, &reason).await {
                    Ok(pnl) => {
                        report.hedges_closed += 1;
                        info!(instance = %self.id, symbol = %symbol, reason = %reason, pnl = %pnl, "Hedge closed");
                    }
                    Err(e) => warn!(instance = %self.id, symbol = %symbol, error = %e, "Hedge close failed"),
                }
                continue;
            }

            let advisory = match &decision {
                Some(decision) => self
                    .with_timeout("hedge_advisory", decision.hedge_advisory(&position))
                    .await
                    .unwrap_or_else(|e| {
                        debug!(instance = %self.id, symbol = %symbol, error = %e, "Hedge advisory unavailable");
                        None
                    }),
                None => None,
            };
            let hedge = self
                .hedging
                .evaluate_triggers(&position, &MarketContext { advisory })
                .await;
            let Some(trigger) = hedge.trigger.filter(|_| hedge.should_hedge) else {
                continue;
            };
            match self
                .hedging
                .execute_hedge(&symbol, &position, hedge.recommended_percent, trigger, dry_run)
                .await
            {
                Ok(_) => report.hedges_opened += 1,
                Err(e) => warn!(instance = %self.id, symbol = %symbol, error = %e, "Automatic hedge failed"),
            }
        }
    }

    async fn with_timeout<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.options.exchange_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: operation.to_string(),
                timeout_ms: self.options.exchange_timeout.as_millis() as u64,
            }),
        }
    }

    // ==================== Owner-gated settings ====================

    pub async fn set_dry_run(&self, actor: &str, dry_run: bool) -> Result<()> {
        self.ensure_owner(actor).await?;
        if !dry_run && self.is_running() && self.exchange().await.is_none() {
            return Err(Error::NotConfigured(
                "live trading requires exchange credentials".to_string(),
            ));
        }
        let _write = self.settings_write.lock().await;
        let previous = self.dry_run.swap(dry_run, Ordering::SeqCst);
        if previous != dry_run {
            info!(
                instance = %self.id,
                "Autopilot switched to {}",
                if dry_run { "dry-run" } else { "live trading" }
            );
        }
        self.touch();
        self.persist_trading_settings();
        Ok(())
    }

    pub async fn set_auto_start(&self, actor: &str, auto_start: bool) -> Result<()> {
        self.ensure_owner(actor).await?;
        let _write = self.settings_write.lock().await;
        self.auto_start.store(auto_start, Ordering::SeqCst);
        self.touch();
        self.persist_trading_settings();
        Ok(())
    }

    pub async fn update_circuit_breaker_config(
        &self,
        actor: &str,
        config: CircuitBreakerConfig,
    ) -> Result<Vec<SettingChange>> {
        self.ensure_owner(actor).await?;
        let changes = {
            let mut guards = self.guards.lock().await;
            let changes = diff_circuit_breaker(guards.breaker.config(), &config);
            guards.breaker.update_config(config)?;
            self.persist(SettingsKey::CircuitBreaker, &guards.breaker_record());
            changes
        };
        self.log_changes(&changes);
        self.touch();
        Ok(changes)
    }

    pub async fn reset_circuit_breaker(&self, actor: &str) -> Result<()> {
        self.ensure_owner(actor).await?;
        {
            let mut guards = self.guards.lock().await;
            guards.breaker.reset();
            self.persist(SettingsKey::CircuitBreaker, &guards.breaker_record());
        }
        info!(instance = %self.id, actor, "Circuit breaker reset by owner");
        self.touch();
        Ok(())
    }

    /// Manual kill switch.
    pub async fn halt_trading(&self, actor: &str, reason: Option<String>) -> Result<()> {
        self.ensure_owner(actor).await?;
        {
            let mut guards = self.guards.lock().await;
            guards.breaker.trip_manual(reason);
            self.persist(SettingsKey::CircuitBreaker, &guards.breaker_record());
        }
        self.touch();
        Ok(())
    }

    pub async fn update_allocation(
        &self,
        actor: &str,
        percentages: &AllocationPercentages,
    ) -> Result<Vec<SettingChange>> {
        self.ensure_owner(actor).await?;
        let changes = {
            let mut guards = self.guards.lock().await;
            let before = guards.allocation.config().clone();
            guards.allocation.update_allocation(percentages)?;
            let after = guards.allocation.config();
            self.persist(SettingsKey::ModeAllocation, after);
            diff_allocation(&before, after)
        };
        self.log_changes(&changes);
        self.touch();
        Ok(changes)
    }

    pub async fn update_safety_config(
        &self,
        actor: &str,
        mode: TradingMode,
        config: ModeSafetyConfig,
    ) -> Result<Vec<SettingChange>> {
        self.ensure_owner(actor).await?;
        let changes = {
            let mut guards = self.guards.lock().await;
            let changes = diff_mode_safety(mode, &guards.safety.config(mode), &config);
            guards.safety.update_config(mode, config.clone())?;
            self.persist(SettingsKey::ModeSafety(mode), &config);
            changes
        };
        self.log_changes(&changes);
        self.touch();
        Ok(changes)
    }

    pub async fn resume_mode(&self, actor: &str, mode: TradingMode) -> Result<()> {
        self.ensure_owner(actor).await?;
        self.guards.lock().await.safety.resume(mode);
        self.touch();
        Ok(())
    }

    pub async fn update_hedge_config(
        &self,
        actor: &str,
        config: HedgeConfig,
    ) -> Result<Vec<SettingChange>> {
        self.ensure_owner(actor).await?;
        let changes = {
            let _write = self.settings_write.lock().await;
            let changes = diff_hedge(&self.hedging.config().await, &config);
            self.hedging.update_config(config.clone()).await?;
            self.persist(SettingsKey::Hedge, &config);
            changes
        };
        self.log_changes(&changes);
        self.touch();
        Ok(changes)
    }

    // ==================== Owner-gated hedge actions ====================

    /// Hedge the tracked position for `symbol` by `percent`.
    pub async fn execute_hedge(
        &self,
        actor: &str,
        symbol: &str,
        percent: Decimal,
    ) -> Result<HedgeRecord> {
        self.ensure_owner(actor).await?;
        self.touch();
        let position = self
            .positions
            .get(symbol)
            .map(|p| p.clone())
            .ok_or_else(|| Error::Validation(format!("no open position for {symbol}")))?;
        self.hedging
            .execute_hedge(symbol, &position, percent, HedgeTrigger::Manual, self.is_dry_run())
            .await
    }

    pub async fn close_hedge(&self, actor: &str, symbol: &str) -> Result<Decimal> {
        self.ensure_owner(actor).await?;
        self.touch();
        self.hedging.close_hedge(symbol, "manual").await
    }

    pub async fn clear_all_hedges(&self, actor: &str) -> Result<()> {
        self.ensure_owner(actor).await?;
        self.touch();
        self.hedging.clear_all_hedges().await
    }

    // ==================== Read-only ====================

    pub async fn status(&self) -> InstanceStatus {
        let (trading_halted, paused_modes) = {
            let mut guards = self.guards.lock().await;
            let now = Utc::now();
            let halted = guards.breaker.is_tripped();
            let paused: Vec<TradingMode> = TradingMode::ALL
                .into_iter()
                .filter(|mode| guards.safety.is_paused_at(*mode, now).paused)
                .collect();
            (halted, paused)
        };
        let (exchange_bound, exchange_provider, decision_bound) = {
            let bindings = self.bindings.read().await;
            (
                bindings.exchange.is_some(),
                bindings.descriptor().map(|d| d.provider.clone()),
                bindings.decision.is_some(),
            )
        };

        InstanceStatus {
            instance_id: self.id.clone(),
            owner: self.owner().await,
            running: self.is_running(),
            dry_run: self.is_dry_run(),
            auto_start: self.auto_start_enabled(),
            exchange_bound,
            exchange_provider,
            decision_bound,
            trading_halted,
            paused_modes,
            open_positions: self.open_positions(),
            pending_orders: self.pending_order_count(),
            active_hedges: self.hedging.hedge_status().await.active_count,
            last_active: self.last_active(),
        }
    }

    pub async fn circuit_breaker_status(&self) -> CircuitBreakerStatus {
        self.guards.lock().await.breaker.status()
    }

    pub async fn allocation_status(&self) -> AllocationStatus {
        self.guards.lock().await.allocation.allocation_status()
    }

    pub async fn safety_status(&self) -> Vec<ModeSafetyStatus> {
        self.guards.lock().await.safety.status()
    }

    pub async fn hedge_status(&self) -> HedgeStatus {
        self.hedging.hedge_status().await
    }

    pub async fn hedge_history(&self, symbol: &str) -> Vec<HedgeRecord> {
        self.hedging.hedge_history(symbol).await
    }

    /// Every setting that differs from its default.
    pub async fn config_drift(&self) -> Vec<SettingChange> {
        let mut changes = {
            let guards = self.guards.lock().await;
            let mut changes =
                diff_circuit_breaker(&CircuitBreakerConfig::default(), guards.breaker.config());
            changes.extend(diff_allocation(
                &ModeAllocationConfig::default(),
                guards.allocation.config(),
            ));
            for mode in TradingMode::ALL {
                changes.extend(diff_mode_safety(
                    mode,
                    &ModeSafetyConfig::for_mode(mode),
                    &guards.safety.config(mode),
                ));
            }
            changes
        };
        changes.extend(diff_hedge(&HedgeConfig::default(), &self.hedging.config().await));
        changes
    }

    pub fn open_positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.positions.iter().map(|p| p.clone()).collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    pub fn order_tickets(&self) -> Vec<OrderTicket> {
        let mut tickets: Vec<OrderTicket> = self.tickets.iter().map(|t| t.clone()).collect();
        tickets.sort_by_key(|t| t.created_at);
        tickets
    }

    pub fn pending_order_count(&self) -> usize {
        self.tickets
            .iter()
            .filter(|t| t.status == TicketStatus::Pending)
            .count()
    }

    // ==================== Persistence ====================

    fn persist<T: Serialize + ?Sized>(&self, key: SettingsKey, value: &T) {
        self.deps
            .persistence
            .enqueue_typed(&self.id, key, value);
    }

    fn persist_trading_settings(&self) {
        let settings = TradingSettings {
            dry_run: self.is_dry_run(),
            auto_start: self.auto_start_enabled(),
        };
        self.persist(SettingsKey::Trading, &settings);
    }

    fn log_changes(&self, changes: &[SettingChange]) {
        for change in changes {
            info!(
                instance = %self.id,
                path = %change.path,
                old = %change.old,
                new = %change.new,
                risk = ?change.risk_level,
                "Setting changed"
            );
        }
        if max_risk(changes) == Some(RiskLevel::High) {
            warn!(instance = %self.id, "Config update loosens risk limits");
        }
    }
}

fn valid_or<T>(
    settings_id: &str,
    key: SettingsKey,
    value: T,
    validate: impl Fn(&T) -> Result<()>,
    fallback: impl FnOnce() -> T,
) -> T {
    match validate(&value) {
        Ok(()) => value,
        Err(e) => {
            warn!(user_id = settings_id, key = %key, error = %e, "Stored settings invalid, using defaults");
            fallback()
        }
    }
}

/// Combine a fill with the existing position on the same symbol.
///
/// Same-side fills average the entry price; opposite-side fills reduce the
/// position and flip it when they exceed it. `None` means flat.
fn net_position(
    existing: Option<Position>,
    intent: &TradeIntent,
    quantity: Decimal,
    price: Decimal,
) -> Option<Position> {
    let fresh = || {
        Position::new(intent.symbol.clone(), intent.side, quantity, price).with_mode(intent.mode)
    };
    let Some(mut position) = existing else {
        return Some(fresh());
    };

    if position.side == intent.side {
        let total = position.quantity + quantity;
        if total > Decimal::ZERO {
            position.entry_price =
                (position.entry_price * position.quantity + price * quantity) / total;
        }
        position.quantity = total;
        position.mark_price = price;
        return Some(position);
    }

    if quantity < position.quantity {
        position.quantity -= quantity;
        position.mark_price = price;
        Some(position)
    } else if quantity == position.quantity {
        None
    } else {
        Some(
            Position::new(
                intent.symbol.clone(),
                intent.side,
                quantity - position.quantity,
                price,
            )
            .with_mode(intent.mode),
        )
    }
}
