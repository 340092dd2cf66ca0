//! Convenience constructors for standard session-layer and application
//! messages. Ported from `original_source/include/fix/fix_messages.hpp`.
//! The session sets `MsgSeqNum` atomically at send time, so these leave it
//! unset (or zero) by convention.

use crate::domain::account::Account;
use crate::domain::instrument::Instrument;
use crate::domain::order::{ExecRejReason, ExecTransType, ExecutionReport, Order, OrdStatus};
use crate::domain::position::Position;
use crate::fix::message::FixMessage;
use crate::fix::tags::{self, msg_type};

pub fn logon(sender: &str, target: &str, heart_bt: i64, reset_seq_num: bool) -> FixMessage {
    let mut msg = FixMessage::new();
    msg.set(tags::MSG_TYPE, msg_type::LOGON);
    msg.set(tags::SENDER_COMP_ID, sender);
    msg.set(tags::TARGET_COMP_ID, target);
    msg.set(tags::ENCRYPT_METHOD, "0");
    msg.set_int(tags::HEART_BT_INT, heart_bt);
    if reset_seq_num {
        msg.set(tags::RESET_SEQ_NUM_FLAG, "Y");
    }
    msg
}

pub fn heartbeat(sender: &str, target: &str, test_req_id: Option<&str>) -> FixMessage {
    let mut msg = FixMessage::new();
    msg.set(tags::MSG_TYPE, msg_type::HEARTBEAT);
    msg.set(tags::SENDER_COMP_ID, sender);
    msg.set(tags::TARGET_COMP_ID, target);
    if let Some(id) = test_req_id {
        msg.set(tags::TEST_REQ_ID, id);
    }
    msg
}

pub fn test_request(sender: &str, target: &str, test_req_id: &str) -> FixMessage {
    let mut msg = FixMessage::new();
    msg.set(tags::MSG_TYPE, msg_type::TEST_REQUEST);
    msg.set(tags::SENDER_COMP_ID, sender);
    msg.set(tags::TARGET_COMP_ID, target);
    msg.set(tags::TEST_REQ_ID, test_req_id);
    msg
}

pub fn logout(sender: &str, target: &str, reason: &str) -> FixMessage {
    let mut msg = FixMessage::new();
    msg.set(tags::MSG_TYPE, msg_type::LOGOUT);
    msg.set(tags::SENDER_COMP_ID, sender);
    msg.set(tags::TARGET_COMP_ID, target);
    if !reason.is_empty() {
        msg.set(tags::TEXT, reason);
    }
    msg
}

fn ord_status_code(status: OrdStatus) -> &'static str {
    match status {
        OrdStatus::PendingNew => "A",
        OrdStatus::New => "0",
        OrdStatus::PartiallyFilled => "1",
        OrdStatus::Filled => "2",
        OrdStatus::Canceled => "4",
        OrdStatus::Rejected => "8",
        OrdStatus::PendingCancel => "6",
    }
}

fn exec_trans_type_code(kind: ExecTransType) -> &'static str {
    match kind {
        ExecTransType::New => "0",
        ExecTransType::Cancel => "1",
        ExecTransType::Correct => "2",
        ExecTransType::Status => "3",
    }
}

fn rej_reason_code(reason: ExecRejReason) -> &'static str {
    match reason {
        ExecRejReason::UnknownInstrument => "1",
        ExecRejReason::InvalidQuantity => "2",
        ExecRejReason::InvalidPriceTick => "3",
        ExecRejReason::OutsidePriceLimits => "4",
        ExecRejReason::NoMarketForMarketOrder => "5",
        ExecRejReason::InsufficientMargin => "6",
        ExecRejReason::InsufficientPosition => "7",
        ExecRejReason::UnknownOrder => "8",
        ExecRejReason::AlreadyTerminal => "9",
        ExecRejReason::FillOrKillUnsatisfiable => "10",
    }
}

/// Renders an `ExecutionReport` (internal event) as an outbound FIX 8= message.
pub fn execution_report(sender: &str, target: &str, report: &ExecutionReport) -> FixMessage {
    let order = &report.order;
    let mut msg = FixMessage::new();
    msg.set(tags::MSG_TYPE, msg_type::EXECUTION_REPORT);
    msg.set(tags::SENDER_COMP_ID, sender);
    msg.set(tags::TARGET_COMP_ID, target);
    if let Some(id) = &order.order_id {
        msg.set(tags::ORDER_ID, id.as_str());
    }
    msg.set(tags::CL_ORD_ID, order.cl_ord_id.as_str());
    msg.set(tags::EXEC_ID, report.exec_id.as_str());
    msg.set(tags::EXEC_TRANS_TYPE, exec_trans_type_code(report.exec_trans_type));
    msg.set(tags::ORD_STATUS, ord_status_code(order.status));
    msg.set(tags::SYMBOL, order.symbol.as_str());
    msg.set_int(tags::CUM_QTY, order.cum_qty);
    msg.set(tags::AVG_PX, format!("{:.4}", order.avg_px));
    msg.set(tags::LAST_SHARES, report.last_shares.to_string());
    msg.set(tags::LAST_PX, format!("{:.4}", report.last_px));
    if let Some(reason) = report.ord_rej_reason {
        msg.set(tags::ORD_REJ_REASON, rej_reason_code(reason));
    }
    if let Some(text) = &report.text {
        msg.set(tags::TEXT, text.as_str());
    }
    msg
}

pub fn new_order_single(sender: &str, target: &str, order: &Order) -> FixMessage {
    let mut msg = FixMessage::new();
    msg.set(tags::MSG_TYPE, msg_type::NEW_ORDER_SINGLE);
    msg.set(tags::SENDER_COMP_ID, sender);
    msg.set(tags::TARGET_COMP_ID, target);
    msg.set(tags::CL_ORD_ID, order.cl_ord_id.as_str());
    msg.set(tags::SYMBOL, order.symbol.as_str());
    msg.set(tags::SIDE, order.side.wire_code());
    msg.set_int(tags::ORDER_QTY, order.order_qty);
    msg.set(tags::ORD_TYPE, order.ord_type.wire_code());
    msg.set(tags::PRICE, format!("{:.4}", order.price));
    msg.set(tags::TIME_IN_FORCE, order.tif.wire_code());
    msg
}

/// Serializes `payload` into tag 58, per spec's U10 guidance ("serialized
/// order list in tag 58") generalized to the rest of the custom U-message
/// family rather than inventing a custom tag per payload shape.
fn set_json_payload(msg: &mut FixMessage, payload: &(impl serde::Serialize + ?Sized)) {
    msg.set(tags::TEXT, serde_json::to_string(payload).unwrap_or_default());
}

fn custom_header(msg_type_code: &str, sender: &str, target: &str) -> FixMessage {
    let mut msg = FixMessage::new();
    msg.set(tags::MSG_TYPE, msg_type_code);
    msg.set(tags::SENDER_COMP_ID, sender);
    msg.set(tags::TARGET_COMP_ID, target);
    msg
}

pub fn balance_query(sender: &str, target: &str) -> FixMessage {
    custom_header(msg_type::BALANCE_QUERY, sender, target)
}

pub fn balance_response(sender: &str, target: &str, account: &Account) -> FixMessage {
    let mut msg = custom_header(msg_type::BALANCE_RESPONSE, sender, target);
    set_json_payload(&mut msg, account);
    msg
}

pub fn position_query(sender: &str, target: &str, symbol: Option<&str>) -> FixMessage {
    let mut msg = custom_header(msg_type::POSITION_QUERY, sender, target);
    if let Some(symbol) = symbol {
        msg.set(tags::SYMBOL, symbol);
    }
    msg
}

pub fn position_response(sender: &str, target: &str, positions: &[Position]) -> FixMessage {
    let mut msg = custom_header(msg_type::POSITION_RESPONSE, sender, target);
    set_json_payload(&mut msg, positions);
    msg
}

pub fn account_update(sender: &str, target: &str, account: &Account) -> FixMessage {
    let mut msg = custom_header(msg_type::ACCOUNT_UPDATE, sender, target);
    set_json_payload(&mut msg, account);
    msg
}

/// One position per message; a push must never clear a
/// client's remembered position" rule means callers only ever push this
/// for a position that actually exists, never an empty/zeroed one.
pub fn position_update(sender: &str, target: &str, position: &Position) -> FixMessage {
    let mut msg = custom_header(msg_type::POSITION_UPDATE, sender, target);
    set_json_payload(&mut msg, position);
    msg
}

pub fn instrument_search(sender: &str, target: &str, prefix: &str) -> FixMessage {
    let mut msg = custom_header(msg_type::INSTRUMENT_SEARCH, sender, target);
    msg.set(tags::SYMBOL, prefix);
    msg
}

pub fn instrument_search_response(sender: &str, target: &str, matches: &[Instrument]) -> FixMessage {
    let mut msg = custom_header(msg_type::INSTRUMENT_SEARCH_RESPONSE, sender, target);
    set_json_payload(&mut msg, matches);
    msg
}

pub fn order_history_query(sender: &str, target: &str) -> FixMessage {
    custom_header(msg_type::ORDER_HISTORY_QUERY, sender, target)
}

pub fn order_history_response(sender: &str, target: &str, orders: &[Order]) -> FixMessage {
    let mut msg = custom_header(msg_type::ORDER_HISTORY_RESPONSE, sender, target);
    set_json_payload(&mut msg, orders);
    msg
}

pub fn order_cancel_request(
    sender: &str,
    target: &str,
    orig_cl_ord_id: &str,
    cl_ord_id: &str,
    symbol: &str,
    side: &str,
) -> FixMessage {
    let mut msg = FixMessage::new();
    msg.set(tags::MSG_TYPE, msg_type::ORDER_CANCEL_REQUEST);
    msg.set(tags::SENDER_COMP_ID, sender);
    msg.set(tags::TARGET_COMP_ID, target);
    msg.set(tags::ORIG_CL_ORD_ID, orig_cl_ord_id);
    msg.set(tags::CL_ORD_ID, cl_ord_id);
    msg.set(tags::SYMBOL, symbol);
    msg.set(tags::SIDE, side);
    msg
}
