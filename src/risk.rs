//! Risk Checker (C13): a stateless policy function over ledgers, the
//! instrument catalog and a market snapshot. Grounded on
//! `original_source/include/app/risk_manager.hpp`'s check ordering.

use crate::domain::account::Account;
use crate::domain::instrument::Instrument;
use crate::domain::order::{ExecRejReason, MarketDataSnapshot, Order, OrdType, Side};
use crate::domain::position::Position;

#[derive(Debug, Clone, PartialEq)]
pub enum RiskVerdict {
    Accept { required_margin: f64 },
    Reject { reason: ExecRejReason, text: String },
}

fn reject(reason: ExecRejReason, text: impl Into<String>) -> RiskVerdict {
    RiskVerdict::Reject {
        reason,
        text: text.into(),
    }
}

/// Runs checks (a)-(g) in order; the first failure
/// wins and the order is not retried.
pub fn check_order(
    order: &Order,
    account: &Account,
    position: Option<&Position>,
    instrument: Option<&Instrument>,
    snapshot: Option<&MarketDataSnapshot>,
) -> RiskVerdict {
    // (a) instrument exists
    let instrument = match instrument {
        Some(i) => i,
        None => return reject(ExecRejReason::UnknownInstrument, "unknown instrument"),
    };

    // (b) order qty is a positive integer
    if order.order_qty <= 0 {
        return reject(ExecRejReason::InvalidQuantity, "order quantity must be positive");
    }

    // (c) price is a positive multiple of priceTick for limit orders
    if order.ord_type == OrdType::Limit {
        if order.price <= 0.0 {
            return reject(ExecRejReason::InvalidPriceTick, "limit price must be positive");
        }
        let ticks = order.price / instrument.price_tick;
        if (ticks - ticks.round()).abs() > 1e-9 {
            return reject(
                ExecRejReason::InvalidPriceTick,
                format!("price {} is not a multiple of tick {}", order.price, instrument.price_tick),
            );
        }
    }

    // (d) price within [lowerLimit, upperLimit] if limits are known
    if order.ord_type == OrdType::Limit {
        if let Some(upper) = instrument.upper_limit {
            if order.price > upper {
                return reject(ExecRejReason::OutsidePriceLimits, "price above upper limit");
            }
        }
        if let Some(lower) = instrument.lower_limit {
            if order.price < lower {
                return reject(ExecRejReason::OutsidePriceLimits, "price below lower limit");
            }
        }
    }

    // (e) market order rejected if the relevant side of the snapshot is empty
    if order.ord_type == OrdType::Market {
        let has_counter = match (order.side, snapshot) {
            (Side::Buy, Some(s)) => s.ask_price1.is_some(),
            (Side::Sell, Some(s)) => s.bid_price1.is_some(),
            (_, None) => false,
        };
        if !has_counter {
            return reject(
                ExecRejReason::NoMarketForMarketOrder,
                "no counter-party quote for market order",
            );
        }
    }

    // (g) for closing intent, ledger has enough of the opposite side: an
    // order against a held opposite-side position is capped at that
    // position's size, not auto-opened past it.
    let opposite_qty = position
        .map(|p| match order.side {
            Side::Buy => p.short_qty,
            Side::Sell => p.long_qty,
        })
        .unwrap_or(0);
    if opposite_qty > 0 && order.order_qty > opposite_qty {
        return reject(
            ExecRejReason::InsufficientPosition,
            format!("order qty {} exceeds held opposite-side qty {}", order.order_qty, opposite_qty),
        );
    }
    let closing_qty = order.order_qty.min(opposite_qty);
    let opening_qty = order.order_qty - closing_qty;

    // (f) required margin <= account.available (only the opening portion
    // of the order consumes fresh margin; the closing portion releases it)
    let reference_price = if order.ord_type == OrdType::Limit {
        order.price
    } else {
        match (order.side, snapshot) {
            (Side::Buy, Some(s)) => s.ask_price1.unwrap_or(0.0),
            (Side::Sell, Some(s)) => s.bid_price1.unwrap_or(0.0),
            _ => 0.0,
        }
    };
    let required_margin = instrument.calculate_margin(reference_price, opening_qty);
    if required_margin > account.available {
        return reject(ExecRejReason::InsufficientMargin, "insufficient available margin");
    }

    RiskVerdict::Accept { required_margin }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrument() -> Instrument {
        Instrument::new("TEST", "SIM", "TEST", 1.0, 1, 0.1)
    }

    fn order(side: Side, ord_type: OrdType, price: f64, qty: i64) -> Order {
        Order::new(
            "ORD1".into(),
            "CLIENT1".into(),
            "TEST".into(),
            side,
            ord_type,
            crate::domain::order::TimeInForce::Day,
            price,
            qty,
            crate::session::fsm::SessionId::new("GATEWAY", "CLIENT1"),
            0,
        )
    }

    fn rich_account() -> crate::domain::account::Account {
        crate::domain::account::AccountLedger::new().get_or_create_account("CLIENT1", 1_000_000.0)
    }

    #[test]
    fn unknown_instrument_is_hard_reject() {
        let verdict = check_order(&order(Side::Buy, OrdType::Limit, 100.0, 1), &rich_account(), None, None, None);
        assert!(matches!(
            verdict,
            RiskVerdict::Reject {
                reason: ExecRejReason::UnknownInstrument,
                ..
            }
        ));
    }

    #[test]
    fn non_tick_price_is_rejected() {
        let inst = Instrument::new("TEST", "SIM", "TEST", 0.5, 1, 0.1);
        let verdict = check_order(
            &order(Side::Buy, OrdType::Limit, 100.3, 1),
            &rich_account(),
            None,
            Some(&inst),
            None,
        );
        assert!(matches!(
            verdict,
            RiskVerdict::Reject {
                reason: ExecRejReason::InvalidPriceTick,
                ..
            }
        ));
    }

    #[test]
    fn sufficient_margin_accepts() {
        let verdict = check_order(
            &order(Side::Buy, OrdType::Limit, 100.0, 2),
            &rich_account(),
            None,
            Some(&instrument()),
            None,
        );
        assert!(matches!(verdict, RiskVerdict::Accept { required_margin } if (required_margin - 20.0).abs() < 1e-9));
    }

    #[test]
    fn closing_more_than_held_is_rejected() {
        let position = Position {
            account_id: "CLIENT1".into(),
            instrument_id: "TEST".into(),
            long_qty: 0,
            long_avg_px: 0.0,
            long_margin: 0.0,
            short_qty: 3,
            short_avg_px: 100.0,
            short_margin: 30.0,
            position_profit: 0.0,
        };
        let verdict = check_order(
            &order(Side::Buy, OrdType::Limit, 100.0, 5),
            &rich_account(),
            Some(&position),
            Some(&instrument()),
            None,
        );
        assert!(matches!(
            verdict,
            RiskVerdict::Reject {
                reason: ExecRejReason::InsufficientPosition,
                ..
            }
        ));
    }

    #[test]
    fn closing_exactly_the_held_amount_is_accepted() {
        let position = Position {
            account_id: "CLIENT1".into(),
            instrument_id: "TEST".into(),
            long_qty: 0,
            long_avg_px: 0.0,
            long_margin: 0.0,
            short_qty: 3,
            short_avg_px: 100.0,
            short_margin: 30.0,
            position_profit: 0.0,
        };
        let verdict = check_order(
            &order(Side::Buy, OrdType::Limit, 100.0, 3),
            &rich_account(),
            Some(&position),
            Some(&instrument()),
            None,
        );
        assert!(matches!(verdict, RiskVerdict::Accept { required_margin } if required_margin == 0.0));
    }

    #[test]
    fn market_order_without_counter_quote_is_rejected() {
        let verdict = check_order(
            &order(Side::Buy, OrdType::Market, 0.0, 1),
            &rich_account(),
            None,
            Some(&instrument()),
            None,
        );
        assert!(matches!(
            verdict,
            RiskVerdict::Reject {
                reason: ExecRejReason::NoMarketForMarketOrder,
                ..
            }
        ));
    }
}
