//! Instrument Catalog (C10): static contract attributes plus the runtime
//! mutators market data drives. Grounded on
//! `original_source/include/app/instrument_manager.hpp`.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub instrument_id: String,
    pub exchange: String,
    pub product_id: String,
    pub price_tick: f64,
    pub volume_multiple: i64,
    pub margin_rate: f64,
    pub upper_limit: Option<f64>,
    pub lower_limit: Option<f64>,
    pub pre_settlement_price: Option<f64>,
}

impl Instrument {
    pub fn new(
        instrument_id: impl Into<String>,
        exchange: impl Into<String>,
        product_id: impl Into<String>,
        price_tick: f64,
        volume_multiple: i64,
        margin_rate: f64,
    ) -> Self {
        debug_assert!(price_tick > 0.0);
        debug_assert!(volume_multiple > 0);
        debug_assert!(margin_rate > 0.0 && margin_rate <= 1.0);
        Self {
            instrument_id: instrument_id.into(),
            exchange: exchange.into(),
            product_id: product_id.into(),
            price_tick,
            volume_multiple,
            margin_rate,
            upper_limit: None,
            lower_limit: None,
            pre_settlement_price: None,
        }
    }

    pub fn calculate_margin(&self, price: f64, qty: i64) -> f64 {
        price * qty as f64 * self.volume_multiple as f64 * self.margin_rate
    }
}

#[derive(Default)]
pub struct InstrumentCatalog {
    instruments: RwLock<HashMap<String, Instrument>>,
}

impl InstrumentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads static rows from a configuration source. The config loader
    /// itself is an out-of-scope external collaborator; this
    /// takes already-parsed rows.
    pub fn load_from_config(&self, rows: impl IntoIterator<Item = Instrument>) {
        let mut guard = self.instruments.write();
        for row in rows {
            guard.insert(row.instrument_id.clone(), row);
        }
    }

    pub fn get_instrument(&self, id: &str) -> Option<Instrument> {
        self.instruments.read().get(id).cloned()
    }

    pub fn update_limit_prices(&self, id: &str, upper: f64, lower: f64) -> bool {
        let mut guard = self.instruments.write();
        if let Some(inst) = guard.get_mut(id) {
            inst.upper_limit = Some(upper);
            inst.lower_limit = Some(lower);
            true
        } else {
            false
        }
    }

    pub fn update_pre_settlement_price(&self, id: &str, px: f64) -> bool {
        let mut guard = self.instruments.write();
        if let Some(inst) = guard.get_mut(id) {
            inst.pre_settlement_price = Some(px);
            true
        } else {
            false
        }
    }

    pub fn search_prefix(&self, prefix: &str, limit: usize) -> Vec<Instrument> {
        self.instruments
            .read()
            .values()
            .filter(|i| i.instrument_id.starts_with(prefix))
            .take(limit)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn margin_formula_matches_spec() {
        let inst = Instrument::new("TEST", "SIM", "TEST", 1.0, 1, 0.1);
        assert_eq!(inst.calculate_margin(100.0, 2), 20.0);
    }

    #[test]
    fn unknown_instrument_returns_none() {
        let catalog = InstrumentCatalog::new();
        assert!(catalog.get_instrument("NOPE").is_none());
    }
}
