//! Depth book: an immutable-per-update ladder of price levels for one
//! symbol on one venue, and the depth-weighted price walk used by the
//! arbitrage calculator.
//!
//! Connectors replace the snapshot wholesale on every market update; this
//! module never patches a book incrementally.

use serde::{Deserialize, Serialize};

use crate::models::Side;

/// One price level of the ladder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub quantity: f64,
    pub order_count: u32,
}

impl DepthLevel {
    pub fn new(price: f64, quantity: f64, order_count: u32) -> Self {
        Self {
            price,
            quantity,
            order_count,
        }
    }
}

/// Full depth snapshot for one symbol on one venue. Bids and asks are
/// ordered best-first (highest bid, lowest ask).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DepthBook {
    pub symbol_key: String,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

impl DepthBook {
    pub fn new(symbol_key: impl Into<String>, bids: Vec<DepthLevel>, asks: Vec<DepthLevel>) -> Self {
        Self {
            symbol_key: symbol_key.into(),
            bids,
            asks,
        }
    }

    pub fn empty(symbol_key: impl Into<String>) -> Self {
        Self::new(symbol_key, Vec::new(), Vec::new())
    }

    /// Price at which `target_quantity` could be filled by walking the book.
    ///
    /// Walks the opposite-side ladder (asks for a buy, bids for a sell) from
    /// best price outward, accumulating quantity, and returns the price of
    /// the first level at which the cumulative quantity strictly exceeds the
    /// target. If the ladder runs out first, the last (worst) level's price
    /// is returned as a conservative estimate.
    ///
    /// Returns 0.0 for an empty ladder. Callers must treat 0.0 as "no price
    /// available" and abort their calculation.
    pub fn executable_price(&self, side: Side, target_quantity: f64) -> f64 {
        let ladder = match side {
            Side::Buy => &self.asks,
            Side::Sell => &self.bids,
        };

        let mut quantity_at_price = 0.0;
        for level in ladder {
            quantity_at_price += level.quantity;
            if quantity_at_price > target_quantity {
                return level.price;
            }
        }

        ladder.last().map(|level| level.price).unwrap_or(0.0)
    }

    /// Top-of-book ask: the level a maker sell would be priced against.
    pub fn best_ask(&self) -> Option<&DepthLevel> {
        self.asks.first()
    }

    /// Top-of-book bid: the level a maker buy would be priced against.
    pub fn best_bid(&self) -> Option<&DepthLevel> {
        self.bids.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(bids: &[(f64, f64)], asks: &[(f64, f64)]) -> DepthBook {
        DepthBook::new(
            "paper-XDCUSDT",
            bids.iter().map(|&(p, q)| DepthLevel::new(p, q, 1)).collect(),
            asks.iter().map(|&(p, q)| DepthLevel::new(p, q, 1)).collect(),
        )
    }

    #[test]
    fn sell_walk_returns_first_level_exceeding_target() {
        // Cumulative 50 at 100.0 is not > 80; cumulative 250 at 99.5 is.
        let book = book(&[(100.0, 50.0), (99.5, 200.0)], &[]);
        assert_eq!(book.executable_price(Side::Sell, 80.0), 99.5);
    }

    #[test]
    fn buy_walk_uses_ask_ladder() {
        let book = book(&[], &[(100.0, 10.0), (100.5, 20.0), (101.0, 100.0)]);
        assert_eq!(book.executable_price(Side::Buy, 5.0), 100.0);
        assert_eq!(book.executable_price(Side::Buy, 25.0), 101.0);
    }

    #[test]
    fn cumulative_must_strictly_exceed_target() {
        let book = book(&[], &[(10.0, 30.0), (11.0, 30.0)]);
        // Exactly 30 at the first level does not exceed 30.
        assert_eq!(book.executable_price(Side::Buy, 30.0), 11.0);
    }

    #[test]
    fn exhausted_ladder_returns_worst_level() {
        let book = book(&[(100.0, 50.0), (99.5, 200.0)], &[]);
        assert_eq!(book.executable_price(Side::Sell, 10_000.0), 99.5);
    }

    #[test]
    fn empty_ladder_returns_zero() {
        let book = DepthBook::empty("paper-XDCUSDT");
        assert_eq!(book.executable_price(Side::Sell, 1.0), 0.0);
        assert_eq!(book.executable_price(Side::Buy, 1.0), 0.0);
    }

    #[test]
    fn best_levels() {
        let book = book(&[(99.0, 5.0), (98.0, 5.0)], &[(101.0, 5.0), (102.0, 5.0)]);
        assert_eq!(book.best_bid().map(|l| l.price), Some(99.0));
        assert_eq!(book.best_ask().map(|l| l.price), Some(101.0));
        assert!(DepthBook::empty("k").best_ask().is_none());
    }
}
