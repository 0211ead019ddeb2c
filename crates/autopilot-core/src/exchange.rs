//! Collaborator traits for the exchange and the decision engine, plus
//! in-memory implementations used for paper trading and tests.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use crate::types::{
    AccountInfo, HedgeAdvisory, OrderFill, OrderRequest, Position, PositionSide, TradeIntent,
    Verdict,
};
use crate::{Error, Result};

/// Order placement and account access on a derivatives exchange.
#[async_trait::async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Place a market order.
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderFill>;

    /// Reduce the position held on `side` by `quantity` at market.
    async fn close_position(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
    ) -> Result<OrderFill>;

    /// Whether dual-side (hedge) position mode is active.
    async fn hedge_mode_enabled(&self) -> Result<bool>;

    async fn enable_hedge_mode(&self) -> Result<()>;

    async fn get_account_info(&self) -> Result<AccountInfo>;

    /// Current mark price for `symbol`.
    async fn mark_price(&self, symbol: &str) -> Result<Decimal>;
}

/// Source of trade intents and hedge advisories.
#[async_trait::async_trait]
pub trait DecisionClient: Send + Sync {
    /// Intents the strategy wants to act on now.
    async fn next_intents(&self, user_id: &str) -> Result<Vec<TradeIntent>>;

    /// Optional hedge recommendation for an open position.
    async fn hedge_advisory(&self, _position: &Position) -> Result<Option<HedgeAdvisory>> {
        Ok(None)
    }

    /// Feedback for each evaluated intent.
    async fn on_verdict(&self, _intent: &TradeIntent, _verdict: &Verdict) {}
}

#[derive(Debug)]
struct PaperState {
    prices: HashMap<String, Decimal>,
    balance: Decimal,
    hedge_mode: bool,
    orders: Vec<OrderRequest>,
}

/// Simulated exchange: fills every order at the configured price.
pub struct PaperExchange {
    state: Arc<RwLock<PaperState>>,
    fail_orders: AtomicBool,
    fail_enable_hedge_mode: AtomicBool,
    latency_ms: AtomicU64,
    next_order_id: AtomicU64,
}

impl PaperExchange {
    pub fn new(balance: Decimal) -> Self {
        Self {
            state: Arc::new(RwLock::new(PaperState {
                prices: HashMap::new(),
                balance,
                hedge_mode: false,
                orders: Vec::new(),
            })),
            fail_orders: AtomicBool::new(false),
            fail_enable_hedge_mode: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            next_order_id: AtomicU64::new(1),
        }
    }

    pub async fn set_price(&self, symbol: impl Into<String>, price: Decimal) {
        self.state.write().await.prices.insert(symbol.into(), price);
    }

    pub async fn set_balance(&self, balance: Decimal) {
        self.state.write().await.balance = balance;
    }

    pub async fn set_hedge_mode(&self, enabled: bool) {
        self.state.write().await.hedge_mode = enabled;
    }

    /// Make every order and close call fail.
    pub fn fail_orders(&self, fail: bool) {
        self.fail_orders.store(fail, Ordering::SeqCst);
    }

    pub fn fail_enable_hedge_mode(&self, fail: bool) {
        self.fail_enable_hedge_mode.store(fail, Ordering::SeqCst);
    }

    /// Delay applied to every order call.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub async fn orders(&self) -> Vec<OrderRequest> {
        self.state.read().await.orders.clone()
    }

    pub async fn order_count(&self) -> usize {
        self.state.read().await.orders.len()
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    async fn fill(&self, order: OrderRequest) -> Result<OrderFill> {
        self.simulate_latency().await;
        if self.fail_orders.load(Ordering::SeqCst) {
            return Err(Error::external("paper-exchange", "order rejected"));
        }

        let mut state = self.state.write().await;
        let price = *state.prices.get(&order.symbol).ok_or_else(|| {
            Error::external(
                "paper-exchange",
                format!("no price for symbol {}", order.symbol),
            )
        })?;
        let id = self.next_order_id.fetch_add(1, Ordering::SeqCst);

        debug!(
            symbol = %order.symbol,
            side = %order.side,
            quantity = %order.quantity,
            price = %price,
            "Paper order filled"
        );

        let fill = OrderFill {
            order_id: format!("paper-{id}"),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            avg_price: price,
            filled_at: Utc::now(),
        };
        state.orders.push(order);
        Ok(fill)
    }
}

#[async_trait::async_trait]
impl ExchangeClient for PaperExchange {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderFill> {
        self.fill(order.clone()).await
    }

    async fn close_position(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
    ) -> Result<OrderFill> {
        // Closing a position is a market order on the opposite side.
        self.fill(OrderRequest::market(symbol, side.opposite(), quantity))
            .await
    }

    async fn hedge_mode_enabled(&self) -> Result<bool> {
        Ok(self.state.read().await.hedge_mode)
    }

    async fn enable_hedge_mode(&self) -> Result<()> {
        if self.fail_enable_hedge_mode.load(Ordering::SeqCst) {
            return Err(Error::external(
                "paper-exchange",
                "position mode change rejected",
            ));
        }
        self.state.write().await.hedge_mode = true;
        Ok(())
    }

    async fn get_account_info(&self) -> Result<AccountInfo> {
        let state = self.state.read().await;
        Ok(AccountInfo {
            total_balance: state.balance,
            available_balance: state.balance,
        })
    }

    async fn mark_price(&self, symbol: &str) -> Result<Decimal> {
        self.state
            .read()
            .await
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| {
                Error::external("paper-exchange", format!("no price for symbol {symbol}"))
            })
    }
}

/// Decision client fed from an in-memory queue.
#[derive(Default)]
pub struct QueuedDecisionClient {
    intents: RwLock<VecDeque<TradeIntent>>,
    advisories: RwLock<HashMap<String, HedgeAdvisory>>,
    verdicts: RwLock<Vec<(TradeIntent, Verdict)>>,
}

impl QueuedDecisionClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_intent(&self, intent: TradeIntent) {
        self.intents.write().await.push_back(intent);
    }

    pub async fn set_advisory(&self, advisory: HedgeAdvisory) {
        self.advisories
            .write()
            .await
            .insert(advisory.symbol.clone(), advisory);
    }

    /// Verdicts reported back so far.
    pub async fn verdicts(&self) -> Vec<(TradeIntent, Verdict)> {
        self.verdicts.read().await.clone()
    }
}

#[async_trait::async_trait]
impl DecisionClient for QueuedDecisionClient {
    async fn next_intents(&self, _user_id: &str) -> Result<Vec<TradeIntent>> {
        Ok(self.intents.write().await.drain(..).collect())
    }

    async fn hedge_advisory(&self, position: &Position) -> Result<Option<HedgeAdvisory>> {
        Ok(self.advisories.read().await.get(&position.symbol).cloned())
    }

    async fn on_verdict(&self, intent: &TradeIntent, verdict: &Verdict) {
        self.verdicts
            .write()
            .await
            .push((intent.clone(), verdict.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TradingMode;

    #[tokio::test]
    async fn test_paper_exchange_fills_at_price() {
        let exchange = PaperExchange::new(Decimal::new(10_000, 0));
        exchange.set_price("BTCUSDT", Decimal::new(50_000, 0)).await;

        let fill = exchange
            .place_order(&OrderRequest::market(
                "BTCUSDT",
                PositionSide::Long,
                Decimal::new(1, 1),
            ))
            .await
            .unwrap();

        assert_eq!(fill.avg_price, Decimal::new(50_000, 0));
        assert_eq!(fill.quantity, Decimal::new(1, 1));
        assert_eq!(exchange.order_count().await, 1);
    }

    #[tokio::test]
    async fn test_paper_exchange_unknown_symbol() {
        let exchange = PaperExchange::new(Decimal::ZERO);
        let result = exchange
            .place_order(&OrderRequest::market("XRPUSDT", PositionSide::Long, Decimal::ONE))
            .await;
        assert!(result.is_err());
        assert_eq!(exchange.order_count().await, 0);
    }

    #[tokio::test]
    async fn test_paper_exchange_failure_injection() {
        let exchange = PaperExchange::new(Decimal::ZERO);
        exchange.set_price("BTCUSDT", Decimal::ONE).await;
        exchange.fail_orders(true);
        assert!(exchange
            .close_position("BTCUSDT", PositionSide::Long, Decimal::ONE)
            .await
            .is_err());

        exchange.fail_enable_hedge_mode(true);
        assert!(exchange.enable_hedge_mode().await.is_err());
        assert!(!exchange.hedge_mode_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_queued_decision_client_drains() {
        let client = QueuedDecisionClient::new();
        client
            .push_intent(TradeIntent::new(
                "ETHUSDT",
                TradingMode::Swing,
                PositionSide::Short,
                Decimal::new(100, 0),
                Decimal::new(2_000, 0),
            ))
            .await;

        assert_eq!(client.next_intents("user-1").await.unwrap().len(), 1);
        assert!(client.next_intents("user-1").await.unwrap().is_empty());
    }
}
