//! Exchange-facing order and account records.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::PositionSide;

/// Market order sent to an exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: Uuid,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    /// Hedge legs are tagged so exchanges in hedge mode route them to the opposite book.
    #[serde(default)]
    pub is_hedge: bool,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, side: PositionSide, quantity: Decimal) -> Self {
        Self {
            client_order_id: Uuid::new_v4(),
            symbol: symbol.into(),
            side,
            quantity,
            is_hedge: false,
        }
    }

    pub fn hedge(mut self) -> Self {
        self.is_hedge = true;
        self
    }
}

/// Execution report for a filled order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub avg_price: Decimal,
    pub filled_at: DateTime<Utc>,
}

/// Balance snapshot used to size mode allocations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountInfo {
    pub total_balance: Decimal,
    pub available_balance: Decimal,
}

/// Advisory hedge signal from the decision engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeAdvisory {
    pub symbol: String,
    /// Confidence in percent (0-100).
    pub confidence: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_percent: Option<Decimal>,
}
