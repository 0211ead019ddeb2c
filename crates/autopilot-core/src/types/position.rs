//! Open position tracking for hedge evaluation.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::TradingMode;

/// Direction of a position or order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// The side that offsets this one.
    pub fn opposite(&self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    /// +1 for long, -1 for short. Multiply a price move by this to get pnl per unit.
    pub fn sign(&self) -> Decimal {
        match self {
            PositionSide::Long => Decimal::ONE,
            PositionSide::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => f.write_str("long"),
            PositionSide::Short => f.write_str("short"),
        }
    }
}

/// A directional position held on the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    /// Last observed market price.
    pub mark_price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<TradingMode>,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn new(
        symbol: impl Into<String>,
        side: PositionSide,
        quantity: Decimal,
        entry_price: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            entry_price,
            mark_price: entry_price,
            mode: None,
            opened_at: Utc::now(),
        }
    }

    pub fn with_mark(mut self, mark_price: Decimal) -> Self {
        self.mark_price = mark_price;
        self
    }

    pub fn with_mode(mut self, mode: TradingMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Entry notional (quantity x entry price).
    pub fn notional(&self) -> Decimal {
        self.quantity * self.entry_price
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        (self.mark_price - self.entry_price) * self.quantity * self.side.sign()
    }

    /// Adverse move from entry as a positive percentage; zero or negative when in profit.
    pub fn loss_percent(&self) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (self.entry_price - self.mark_price) / self.entry_price
            * Decimal::ONE_HUNDRED
            * self.side.sign()
    }

    pub fn is_losing(&self) -> bool {
        self.unrealized_pnl() < Decimal::ZERO
    }
}
