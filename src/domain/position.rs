//! Position Ledger (C12): open/close semantics with long/short netting.
//! Grounded on `original_source/include/app/position_manager.hpp`.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::domain::order::{MarketDataSnapshot, Side};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub account_id: String,
    pub instrument_id: String,
    pub long_qty: i64,
    pub long_avg_px: f64,
    pub long_margin: f64,
    pub short_qty: i64,
    pub short_avg_px: f64,
    pub short_margin: f64,
    pub position_profit: f64,
}

impl Position {
    fn new(account_id: String, instrument_id: String) -> Self {
        Self {
            account_id,
            instrument_id,
            long_qty: 0,
            long_avg_px: 0.0,
            long_margin: 0.0,
            short_qty: 0,
            short_avg_px: 0.0,
            short_margin: 0.0,
            position_profit: 0.0,
        }
    }

    fn key(account_id: &str, instrument_id: &str) -> String {
        format!("{account_id}\u{0}{instrument_id}")
    }
}

#[derive(Default)]
pub struct PositionLedger {
    positions: Mutex<HashMap<String, Position>>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_position(&self, account_id: &str, instrument_id: &str) -> Option<Position> {
        self.positions
            .lock()
            .get(&Position::key(account_id, instrument_id))
            .cloned()
    }

    pub fn positions_by_account(&self, account_id: &str) -> Vec<Position> {
        self.positions
            .lock()
            .values()
            .filter(|p| p.account_id == account_id)
            .cloned()
            .collect()
    }

    /// Opens (increases) a position on the book matching `side`.
    /// `newAvg = (oldAvg*oldQty + price*qty) / (oldQty+qty)`.
    pub fn open_position(
        &self,
        account_id: &str,
        instrument_id: &str,
        side: Side,
        qty: i64,
        price: f64,
        margin: f64,
    ) {
        let mut guard = self.positions.lock();
        let pos = guard
            .entry(Position::key(account_id, instrument_id))
            .or_insert_with(|| Position::new(account_id.to_string(), instrument_id.to_string()));

        match side {
            Side::Buy => {
                let notional = pos.long_avg_px * pos.long_qty as f64 + price * qty as f64;
                pos.long_qty += qty;
                pos.long_avg_px = if pos.long_qty > 0 {
                    notional / pos.long_qty as f64
                } else {
                    0.0
                };
                pos.long_margin += margin;
            }
            Side::Sell => {
                let notional = pos.short_avg_px * pos.short_qty as f64 + price * qty as f64;
                pos.short_qty += qty;
                pos.short_avg_px = if pos.short_qty > 0 {
                    notional / pos.short_qty as f64
                } else {
                    0.0
                };
                pos.short_margin += margin;
            }
        }
    }

    /// Closes `qty` on the opposite book to `side` (a Buy closes Short, a
    /// Sell closes Long). Returns the realized close profit.
    pub fn close_position(
        &self,
        account_id: &str,
        instrument_id: &str,
        side: Side,
        qty: i64,
        price: f64,
        volume_multiple: i64,
    ) -> f64 {
        let mut guard = self.positions.lock();
        let pos = match guard.get_mut(&Position::key(account_id, instrument_id)) {
            Some(p) => p,
            None => return 0.0,
        };
        let multiplier = volume_multiple as f64;

        match side {
            // Buy closes Short.
            Side::Buy => {
                let profit = (pos.short_avg_px - price) * qty as f64 * multiplier;
                let released = if pos.short_qty > 0 {
                    pos.short_margin * (qty as f64 / pos.short_qty as f64)
                } else {
                    0.0
                };
                pos.short_qty -= qty;
                pos.short_margin -= released;
                if pos.short_qty == 0 {
                    pos.short_avg_px = 0.0;
                    pos.short_margin = 0.0;
                }
                profit
            }
            // Sell closes Long.
            Side::Sell => {
                let profit = (price - pos.long_avg_px) * qty as f64 * multiplier;
                let released = if pos.long_qty > 0 {
                    pos.long_margin * (qty as f64 / pos.long_qty as f64)
                } else {
                    0.0
                };
                pos.long_qty -= qty;
                pos.long_margin -= released;
                if pos.long_qty == 0 {
                    pos.long_avg_px = 0.0;
                    pos.long_margin = 0.0;
                }
                profit
            }
        }
    }

    /// Released margin for a prospective close of `qty` at the current book
    /// state, without mutating it — used by the gateway to prorate
    /// `confirmMargin` calls against fills.
    pub fn margin_to_release(
        &self,
        account_id: &str,
        instrument_id: &str,
        side: Side,
        qty: i64,
    ) -> f64 {
        let guard = self.positions.lock();
        match guard.get(&Position::key(account_id, instrument_id)) {
            Some(pos) => match side {
                Side::Buy if pos.short_qty > 0 => pos.short_margin * (qty as f64 / pos.short_qty as f64),
                Side::Sell if pos.long_qty > 0 => pos.long_margin * (qty as f64 / pos.long_qty as f64),
                _ => 0.0,
            },
            None => 0.0,
        }
    }

    /// How much of `qty` can close the opposite book before the remainder
    /// must open a new position on the same side.
    pub fn closable_quantity(&self, account_id: &str, instrument_id: &str, side: Side, qty: i64) -> i64 {
        let guard = self.positions.lock();
        let opposite_qty = guard
            .get(&Position::key(account_id, instrument_id))
            .map(|p| match side {
                Side::Buy => p.short_qty,
                Side::Sell => p.long_qty,
            })
            .unwrap_or(0);
        qty.min(opposite_qty)
    }

    /// Recomputes `positionProfit` for every position on `snapshot`'s
    /// instrument from the last-known top-of-book price.
    pub fn update_all_profits(&self, snapshot: &MarketDataSnapshot, volume_multiple: i64) {
        let mut guard = self.positions.lock();
        let multiplier = volume_multiple as f64;
        for pos in guard
            .values_mut()
            .filter(|p| p.instrument_id == snapshot.instrument_id)
        {
            pos.position_profit = (snapshot.last_price - pos.long_avg_px) * pos.long_qty as f64 * multiplier
                + (pos.short_avg_px - snapshot.last_price) * pos.short_qty as f64 * multiplier;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(instrument_id: &str, last_price: f64) -> MarketDataSnapshot {
        MarketDataSnapshot {
            instrument_id: instrument_id.to_string(),
            last_price,
            bid_price1: None,
            bid_vol1: 0,
            ask_price1: None,
            ask_vol1: 0,
            upper_limit: None,
            lower_limit: None,
            update_time: 0,
        }
    }

    #[test]
    fn open_then_close_realizes_weighted_profit() {
        let ledger = PositionLedger::new();
        ledger.open_position("A1", "TEST", Side::Buy, 1, 100.0, 10.0);
        ledger.open_position("A1", "TEST", Side::Buy, 1, 110.0, 11.0);
        // weighted avg = 105.0
        let profit = ledger.close_position("A1", "TEST", Side::Sell, 2, 120.0, 1);
        assert!((profit - ((120.0 - 105.0) * 2.0)).abs() < 1e-9);
    }

    #[test]
    fn long_zero_qty_resets_avg_px() {
        let ledger = PositionLedger::new();
        ledger.open_position("A1", "TEST", Side::Buy, 5, 100.0, 50.0);
        ledger.close_position("A1", "TEST", Side::Sell, 5, 100.0, 1);
        let pos = ledger.get_position("A1", "TEST").unwrap();
        assert_eq!(pos.long_qty, 0);
        assert_eq!(pos.long_avg_px, 0.0);
    }

    #[test]
    fn update_all_profits_matches_formula() {
        let ledger = PositionLedger::new();
        ledger.open_position("A1", "TEST", Side::Buy, 2, 100.0, 20.0);
        ledger.open_position("A1", "TEST", Side::Sell, 1, 90.0, 9.0);
        ledger.update_all_profits(&snapshot("TEST", 105.0), 1);
        let pos = ledger.get_position("A1", "TEST").unwrap();
        let expected = (105.0 - 100.0) * 2.0 + (90.0 - 105.0) * 1.0;
        assert!((pos.position_profit - expected).abs() < 1e-9);
    }
}
