//! Order, execution-report and market-data types.
//!
//! Grounded on `original_source/include/app/order.hpp` and
//! `order_event.hpp`, reshaped as plain Rust value types with the
//! invariants enforced by construction where practical.

use serde::{Deserialize, Serialize};

use crate::session::fsm::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn wire_code(self) -> &'static str {
        match self {
            Side::Buy => "1",
            Side::Sell => "2",
        }
    }

    pub fn from_wire(code: &str) -> Option<Self> {
        match code {
            "1" => Some(Side::Buy),
            "2" => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrdType {
    Market,
    Limit,
}

impl OrdType {
    pub fn wire_code(self) -> &'static str {
        match self {
            OrdType::Market => "1",
            OrdType::Limit => "2",
        }
    }

    pub fn from_wire(code: &str) -> Option<Self> {
        match code {
            "1" => Some(OrdType::Market),
            "2" => Some(OrdType::Limit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Day,
    Gtc,
    Ioc,
    Fok,
}

impl TimeInForce {
    pub fn wire_code(self) -> &'static str {
        match self {
            TimeInForce::Day => "0",
            TimeInForce::Gtc => "1",
            TimeInForce::Ioc => "3",
            TimeInForce::Fok => "4",
        }
    }

    pub fn from_wire(code: &str) -> Option<Self> {
        match code {
            "0" => Some(TimeInForce::Day),
            "1" => Some(TimeInForce::Gtc),
            "3" => Some(TimeInForce::Ioc),
            "4" => Some(TimeInForce::Fok),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrdStatus {
    PendingNew,
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    PendingCancel,
}

impl OrdStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrdStatus::Filled | OrdStatus::Canceled | OrdStatus::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecTransType {
    New,
    Cancel,
    Correct,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecRejReason {
    UnknownInstrument,
    InvalidQuantity,
    InvalidPriceTick,
    OutsidePriceLimits,
    NoMarketForMarketOrder,
    InsufficientMargin,
    InsufficientPosition,
    UnknownOrder,
    AlreadyTerminal,
    FillOrKillUnsatisfiable,
}

/// A live or historical order.
///
/// Invariants upheld by the matching engine and gateway, not by this
/// struct's constructor alone (mirrors the source of truth being the
/// engine's pending book, not this value type):
/// `cum_qty + leaves_qty == order_qty` while non-terminal;
/// `cum_qty > 0 => avg_px > 0`; `order_id` is set exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub cl_ord_id: String,
    pub order_id: Option<String>,
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    pub ord_type: OrdType,
    pub tif: TimeInForce,
    pub price: f64,
    pub order_qty: i64,
    pub cum_qty: i64,
    pub leaves_qty: i64,
    pub avg_px: f64,
    pub status: OrdStatus,
    pub create_time: i64,
    pub update_time: i64,
    pub session_id: SessionId,
}

impl Order {
    pub fn new(
        cl_ord_id: String,
        account_id: String,
        symbol: String,
        side: Side,
        ord_type: OrdType,
        tif: TimeInForce,
        price: f64,
        order_qty: i64,
        session_id: SessionId,
        now: i64,
    ) -> Self {
        Self {
            cl_ord_id,
            order_id: None,
            account_id,
            symbol,
            side,
            ord_type,
            tif,
            price,
            order_qty,
            cum_qty: 0,
            leaves_qty: order_qty,
            avg_px: 0.0,
            status: OrdStatus::PendingNew,
            create_time: now,
            update_time: now,
            session_id,
        }
    }

    /// Applies a fill of `qty` shares at `px`, updating `cum_qty`,
    /// `leaves_qty` and the volume-weighted `avg_px`.
    pub fn apply_fill(&mut self, qty: i64, px: f64, now: i64) {
        let prior_notional = self.avg_px * self.cum_qty as f64;
        self.cum_qty += qty;
        self.leaves_qty -= qty;
        self.avg_px = (prior_notional + px * qty as f64) / self.cum_qty as f64;
        self.status = if self.leaves_qty == 0 {
            OrdStatus::Filled
        } else {
            OrdStatus::PartiallyFilled
        };
        self.update_time = now;
    }

    pub fn cancel(&mut self, now: i64) {
        self.status = OrdStatus::Canceled;
        self.leaves_qty = 0;
        self.update_time = now;
    }

    pub fn reject(&mut self, now: i64) {
        self.status = OrdStatus::Rejected;
        self.leaves_qty = 0;
        self.update_time = now;
    }
}

/// A snapshot of an `Order` plus execution-specific fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub order: Order,
    pub exec_id: String,
    pub exec_trans_type: ExecTransType,
    pub last_shares: i64,
    pub last_px: f64,
    pub ord_rej_reason: Option<ExecRejReason>,
    pub text: Option<String>,
    pub transact_time: i64,
}

/// Last-known top-of-book for an instrument; last-writer-wins, no history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataSnapshot {
    pub instrument_id: String,
    pub last_price: f64,
    pub bid_price1: Option<f64>,
    pub bid_vol1: i64,
    pub ask_price1: Option<f64>,
    pub ask_vol1: i64,
    pub upper_limit: Option<f64>,
    pub lower_limit: Option<f64>,
    pub update_time: i64,
}

/// Tagged union of events the matching engine consumes.
#[derive(Debug, Clone)]
pub enum OrderEvent {
    NewOrder(Order),
    CancelRequest {
        orig_cl_ord_id: String,
        cl_ord_id: String,
        account_id: String,
        symbol: String,
        side: Side,
        session_id: SessionId,
    },
    SessionLogon(SessionId),
    SessionLogout(SessionId),
}
