//! End-to-end coverage of the Trade Gateway wired to a live matching
//! engine: a FIX NewOrderSingle goes in, the engine crosses it against a
//! quote, and the resulting fill lands in the account/position ledgers
//! the way the gateway's fill-application order promises.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crossbeam::channel::unbounded;
use fix_futures_gateway::domain::account::AccountLedger;
use fix_futures_gateway::domain::instrument::{Instrument, InstrumentCatalog};
use fix_futures_gateway::domain::order::{ExecutionReport, MarketDataSnapshot, OrdStatus};
use fix_futures_gateway::domain::position::PositionLedger;
use fix_futures_gateway::fix::message::FixMessage;
use fix_futures_gateway::fix::tags::{self, msg_type};
use fix_futures_gateway::gateway::TradeGateway;
use fix_futures_gateway::matching::engine::MatchingEngine;
use fix_futures_gateway::net::worker_pool::WorkerPool;
use fix_futures_gateway::persistence::sqlite_store::SqliteStore;
use fix_futures_gateway::session::fsm::SessionId;
use fix_futures_gateway::session::registry::SessionRegistry;
use parking_lot::Mutex;

fn snapshot(bid: f64, bid_vol: i64, ask: f64, ask_vol: i64) -> MarketDataSnapshot {
    MarketDataSnapshot {
        instrument_id: "IF2401".into(),
        last_price: (bid + ask) / 2.0,
        bid_price1: Some(bid),
        bid_vol1: bid_vol,
        ask_price1: Some(ask),
        ask_vol1: ask_vol,
        upper_limit: None,
        lower_limit: None,
        update_time: 1,
    }
}

fn new_order_single(cl_ord_id: &str, side: &str, qty: i64, price: f64) -> FixMessage {
    let mut msg = FixMessage::new();
    msg.set(tags::MSG_TYPE, msg_type::NEW_ORDER_SINGLE);
    msg.set(tags::CL_ORD_ID, cl_ord_id);
    msg.set(tags::SYMBOL, "IF2401");
    msg.set(tags::SIDE, side);
    msg.set_int(tags::ORDER_QTY, qty);
    msg.set(tags::ORD_TYPE, "2"); // Limit
    msg.set(tags::PRICE, price.to_string());
    msg
}

fn cancel_request(orig_cl_ord_id: &str, cl_ord_id: &str, side: &str) -> FixMessage {
    let mut msg = FixMessage::new();
    msg.set(tags::MSG_TYPE, msg_type::ORDER_CANCEL_REQUEST);
    msg.set(tags::ORIG_CL_ORD_ID, orig_cl_ord_id);
    msg.set(tags::CL_ORD_ID, cl_ord_id);
    msg.set(tags::SYMBOL, "IF2401");
    msg.set(tags::SIDE, side);
    msg
}

struct Harness {
    gateway: Arc<TradeGateway>,
    engine: Arc<MatchingEngine>,
    account_ledger: Arc<AccountLedger>,
    position_ledger: Arc<PositionLedger>,
    session_id: SessionId,
    reports: Arc<StdMutex<Vec<ExecutionReport>>>,
}

fn build_harness() -> Harness {
    let account_ledger = Arc::new(AccountLedger::new());
    let position_ledger = Arc::new(PositionLedger::new());
    let instrument_catalog = Arc::new(InstrumentCatalog::new());
    instrument_catalog.load_from_config([Instrument::new("IF2401", "SIM", "IF", 1.0, 1, 0.1)]);
    let persistence = Arc::new(SqliteStore::open_in_memory().expect("in-memory sqlite"));
    let session_registry = Arc::new(SessionRegistry::new());
    let worker_pool = Arc::new(WorkerPool::new(1));

    let reports: Arc<StdMutex<Vec<ExecutionReport>>> = Arc::new(StdMutex::new(Vec::new()));
    let reports_sink = reports.clone();
    let gateway_slot: Arc<Mutex<Option<Arc<TradeGateway>>>> = Arc::new(Mutex::new(None));
    let gateway_slot_for_engine = gateway_slot.clone();

    let engine = MatchingEngine::new(
        account_ledger.clone(),
        position_ledger.clone(),
        instrument_catalog.clone(),
        Box::new(move |session_id, report| {
            reports_sink.lock().unwrap().push(report.clone());
            if let Some(gateway) = gateway_slot_for_engine.lock().clone() {
                gateway.on_execution_report(session_id, report);
            }
        }),
    );
    engine.start();

    let gateway = Arc::new(TradeGateway::new(
        "GATEWAY",
        1_000_000.0,
        account_ledger.clone(),
        position_ledger.clone(),
        instrument_catalog.clone(),
        session_registry.clone(),
        persistence,
        engine.order_sender(),
        worker_pool,
    ));
    *gateway_slot.lock() = Some(gateway.clone());

    let session_id = SessionId::new("GATEWAY", "CLIENT1");
    gateway.on_logon_success(&session_id);

    Harness {
        gateway,
        engine,
        account_ledger,
        position_ledger,
        session_id,
        reports,
    }
}

fn wait_for_reports(reports: &Arc<StdMutex<Vec<ExecutionReport>>>, at_least: usize) {
    for _ in 0..200 {
        if reports.lock().unwrap().len() >= at_least {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {at_least} execution report(s)");
}

#[test]
fn limit_buy_crosses_and_opens_a_position() {
    let h = build_harness();
    h.engine.submit_market_data(snapshot(99.0, 50, 100.0, 50));
    // Give the engine a beat to record the snapshot before the order arrives.
    std::thread::sleep(Duration::from_millis(50));

    h.gateway
        .handle_business_message(&h.session_id, &new_order_single("CL1", "1", 10, 100.0));
    wait_for_reports(&h.reports, 1);

    let reports = h.reports.lock().unwrap();
    assert_eq!(reports[0].order.status, OrdStatus::Filled);
    assert_eq!(reports[0].last_shares, 10);

    let position = h
        .position_ledger
        .get_position(h.session_id.target_comp_id.as_str(), "IF2401")
        .expect("position opened");
    assert_eq!(position.long_qty, 10);
    assert_eq!(position.long_avg_px, 100.0);

    let account = h.account_ledger.get_account(&h.session_id.target_comp_id).unwrap();
    assert!(account.balance_invariant_holds());
    assert_eq!(account.frozen_margin, 0.0);
    assert!(account.used_margin > 0.0);

    h.engine.stop();
}

#[test]
fn partial_fill_leaves_remainder_resting_and_margin_frozen() {
    let h = build_harness();
    h.engine.submit_market_data(snapshot(99.0, 50, 100.0, 4));
    std::thread::sleep(Duration::from_millis(50));

    h.gateway
        .handle_business_message(&h.session_id, &new_order_single("CL2", "1", 10, 100.0));
    wait_for_reports(&h.reports, 1);

    let reports = h.reports.lock().unwrap();
    assert_eq!(reports[0].order.status, OrdStatus::PartiallyFilled);
    assert_eq!(reports[0].order.leaves_qty, 6);
    drop(reports);

    let account = h.account_ledger.get_account(&h.session_id.target_comp_id).unwrap();
    // 6 lots' worth of margin is still frozen pending the rest of the fill.
    assert!(account.frozen_margin > 0.0);
    assert!(account.used_margin > 0.0);

    h.engine.stop();
}

#[test]
fn cancel_while_resting_unfreezes_margin() {
    let h = build_harness();
    // No crossable quote: the order rests untouched.
    h.gateway
        .handle_business_message(&h.session_id, &new_order_single("CL3", "1", 10, 100.0));
    wait_for_reports(&h.reports, 1);
    {
        let reports = h.reports.lock().unwrap();
        assert_eq!(reports[0].order.status, OrdStatus::New);
    }

    let account_before = h.account_ledger.get_account(&h.session_id.target_comp_id).unwrap();
    assert!(account_before.frozen_margin > 0.0);

    h.gateway
        .handle_business_message(&h.session_id, &cancel_request("CL3", "CL3-CXL", "1"));
    wait_for_reports(&h.reports, 2);

    let reports = h.reports.lock().unwrap();
    assert_eq!(reports[1].order.status, OrdStatus::Canceled);
    drop(reports);

    let account_after = h.account_ledger.get_account(&h.session_id.target_comp_id).unwrap();
    assert_eq!(account_after.frozen_margin, 0.0);
    assert!(account_after.balance_invariant_holds());

    h.engine.stop();
}
