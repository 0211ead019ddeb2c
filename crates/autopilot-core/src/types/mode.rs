//! Trading mode buckets.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// A named trading style with its own capital slice and safety thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    UltraFast,
    Scalp,
    Swing,
    Position,
}

impl TradingMode {
    /// Every mode, in allocation order.
    pub const ALL: [TradingMode; 4] = [
        TradingMode::UltraFast,
        TradingMode::Scalp,
        TradingMode::Swing,
        TradingMode::Position,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TradingMode::UltraFast => "ultra_fast",
            TradingMode::Scalp => "scalp",
            TradingMode::Swing => "swing",
            TradingMode::Position => "position",
        }
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ultra_fast" | "ultrafast" | "ultra-fast" => Ok(TradingMode::UltraFast),
            "scalp" => Ok(TradingMode::Scalp),
            "swing" => Ok(TradingMode::Swing),
            "position" => Ok(TradingMode::Position),
            other => Err(Error::Validation(format!("unknown trading mode: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("scalp".parse::<TradingMode>().unwrap(), TradingMode::Scalp);
        assert_eq!(
            "Ultra-Fast".parse::<TradingMode>().unwrap(),
            TradingMode::UltraFast
        );
        assert!("momentum".parse::<TradingMode>().is_err());
    }

    #[test]
    fn test_mode_serde_matches_display() {
        for mode in TradingMode::ALL {
            let json = serde_json::to_string(&mode).unwrap();
            assert_eq!(json, format!("\"{}\"", mode));
        }
    }
}
