//! Trade intents, settlements, and guard verdicts.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{PositionSide, TradingMode};

/// A request from the decision engine to open a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    pub id: Uuid,
    pub symbol: String,
    pub mode: TradingMode,
    pub side: PositionSide,
    /// Capital the trade would consume.
    pub notional_usd: Decimal,
    /// Price the decision engine expects to enter at; sizes the order.
    pub reference_price: Decimal,
    pub requested_at: DateTime<Utc>,
}

impl TradeIntent {
    pub fn new(
        symbol: impl Into<String>,
        mode: TradingMode,
        side: PositionSide,
        notional_usd: Decimal,
        reference_price: Decimal,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            mode,
            side,
            notional_usd,
            reference_price,
            requested_at: Utc::now(),
        }
    }

    /// Order quantity implied by the notional and reference price.
    pub fn quantity(&self) -> Decimal {
        if self.reference_price.is_zero() {
            return Decimal::ZERO;
        }
        self.notional_usd / self.reference_price
    }
}

/// Realized result of a closed trade, fed back into the guards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSettlement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<Uuid>,
    pub symbol: String,
    pub mode: TradingMode,
    /// Capital released back to the mode.
    pub notional_usd: Decimal,
    pub realized_pnl: Decimal,
    pub pnl_percent: Decimal,
    pub settled_at: DateTime<Utc>,
}

impl TradeSettlement {
    pub fn won(&self) -> bool {
        self.realized_pnl > Decimal::ZERO
    }
}

/// Which guard produced a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardKind {
    CircuitBreaker,
    ModeSafety,
    Capacity,
}

impl fmt::Display for GuardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardKind::CircuitBreaker => f.write_str("circuit_breaker"),
            GuardKind::ModeSafety => f.write_str("mode_safety"),
            GuardKind::Capacity => f.write_str("capacity"),
        }
    }
}

/// Why a guard refused an intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denial {
    pub guard: GuardKind,
    /// Stable snake_case identifier, e.g. `max_daily_loss`.
    pub code: String,
    pub message: String,
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} denied ({}): {}", self.guard, self.code, self.message)
    }
}

/// Outcome of running an intent through a guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny(Denial),
}

impl Verdict {
    pub fn deny(guard: GuardKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Verdict::Deny(Denial {
            guard,
            code: code.into(),
            message: message.into(),
        })
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }

    pub fn denial(&self) -> Option<&Denial> {
        match self {
            Verdict::Allow => None,
            Verdict::Deny(d) => Some(d),
        }
    }

    /// Code of the denial, if any.
    pub fn code(&self) -> Option<&str> {
        self.denial().map(|d| d.code.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_quantity() {
        let intent = TradeIntent::new(
            "BTCUSDT",
            TradingMode::Scalp,
            PositionSide::Long,
            Decimal::new(500, 0),
            Decimal::new(250, 0),
        );
        assert_eq!(intent.quantity(), Decimal::new(2, 0));
    }

    #[test]
    fn test_verdict_accessors() {
        let v = Verdict::deny(GuardKind::CircuitBreaker, "max_daily_loss", "lost too much");
        assert!(!v.is_allowed());
        assert_eq!(v.code(), Some("max_daily_loss"));
        assert!(Verdict::Allow.denial().is_none());
    }

    #[test]
    fn test_verdict_serialization() {
        let v = Verdict::deny(GuardKind::Capacity, "mode_capacity", "full");
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["decision"], "deny");
        assert_eq!(json["guard"], "capacity");
        assert_eq!(json["code"], "mode_capacity");
    }
}
