//! Matching Engine (C14): single consumer thread over an order-event
//! queue and a market-data queue. Grounded on
//! `original_source/include/app/matching_engine.hpp`'s thread/queue shape
//! (own thread, `submit`, an ExecutionReport callback), but the matching
//! algorithm itself replaces that header's price-time order book with
//! quote-driven matching against a single external top-of-book snapshot,
//! since orders here only ever cross the simulated market, never each
//! other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Select, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::domain::account::AccountLedger;
use crate::domain::instrument::InstrumentCatalog;
use crate::domain::order::{
    ExecRejReason, ExecTransType, MarketDataSnapshot, OrdStatus, OrdType, Order, OrderEvent, Side,
    TimeInForce,
};
use crate::domain::order::ExecutionReport;
use crate::domain::position::PositionLedger;
use crate::risk::{self, RiskVerdict};
use crate::session::fsm::SessionId;

pub type ExecutionReportCallback = Box<dyn Fn(SessionId, ExecutionReport) + Send + Sync>;

/// Engine-thread-only bookkeeping; never touched off the engine thread,
/// so it needs no lock: ordinary traffic never touches it from another thread.
#[derive(Default)]
struct EngineState {
    /// Resting orders per instrument, in strict insertion order.
    pending: HashMap<String, Vec<Order>>,
    snapshots: HashMap<String, MarketDataSnapshot>,
    next_order_id: u64,
    next_exec_id: u64,
}

impl EngineState {
    fn alloc_order_id(&mut self) -> String {
        self.next_order_id += 1;
        format!("ORD{:012}", self.next_order_id)
    }

    fn alloc_exec_id(&mut self) -> String {
        self.next_exec_id += 1;
        format!("EXEC{:012}", self.next_exec_id)
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct MatchingEngine {
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    order_tx: Sender<OrderEvent>,
    order_rx: Mutex<Option<Receiver<OrderEvent>>>,
    market_data_tx: Sender<MarketDataSnapshot>,
    market_data_rx: Mutex<Option<Receiver<MarketDataSnapshot>>>,
    account_ledger: Arc<AccountLedger>,
    position_ledger: Arc<PositionLedger>,
    instrument_catalog: Arc<InstrumentCatalog>,
    exec_callback: ExecutionReportCallback,
}

impl MatchingEngine {
    pub fn new(
        account_ledger: Arc<AccountLedger>,
        position_ledger: Arc<PositionLedger>,
        instrument_catalog: Arc<InstrumentCatalog>,
        exec_callback: ExecutionReportCallback,
    ) -> Arc<Self> {
        let (order_tx, order_rx) = unbounded();
        let (market_data_tx, market_data_rx) = unbounded();
        Arc::new(Self {
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
            order_tx,
            order_rx: Mutex::new(Some(order_rx)),
            market_data_tx,
            market_data_rx: Mutex::new(Some(market_data_rx)),
            account_ledger,
            position_ledger,
            instrument_catalog,
            exec_callback,
        })
    }

    pub fn order_sender(&self) -> Sender<OrderEvent> {
        self.order_tx.clone()
    }

    pub fn market_data_sender(&self) -> Sender<MarketDataSnapshot> {
        self.market_data_tx.clone()
    }

    pub fn submit(&self, event: OrderEvent) {
        let _ = self.order_tx.send(event);
    }

    pub fn submit_market_data(&self, snapshot: MarketDataSnapshot) {
        let _ = self.market_data_tx.send(snapshot);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let order_rx = self
            .order_rx
            .lock()
            .take()
            .expect("matching engine already started");
        let market_data_rx = self
            .market_data_rx
            .lock()
            .take()
            .expect("matching engine already started");
        let engine = self.clone();
        let handle = std::thread::Builder::new()
            .name("matching-engine".into())
            .spawn(move || engine.run(order_rx, market_data_rx))
            .expect("failed to spawn matching engine thread");
        *self.handle.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Drains both queues with a small timeout so `stop()` is observed
    /// promptly even when idle.
    fn run(self: Arc<Self>, order_rx: Receiver<OrderEvent>, market_data_rx: Receiver<MarketDataSnapshot>) {
        let mut state = EngineState::default();
        while self.running.load(Ordering::SeqCst) {
            let mut select = Select::new();
            let order_idx = select.recv(&order_rx);
            let md_idx = select.recv(&market_data_rx);
            match select.ready_timeout(Duration::from_millis(200)) {
                Ok(idx) if idx == order_idx => {
                    if let Ok(event) = order_rx.try_recv() {
                        self.process_order_event(&mut state, event);
                    }
                }
                Ok(idx) if idx == md_idx => {
                    if let Ok(snapshot) = market_data_rx.try_recv() {
                        self.process_market_data(&mut state, snapshot);
                    }
                }
                _ => {}
            }
        }
    }

    fn emit(&self, session_id: SessionId, report: ExecutionReport) {
        (self.exec_callback)(session_id, report);
    }

    fn process_order_event(&self, state: &mut EngineState, event: OrderEvent) {
        match event {
            OrderEvent::NewOrder(order) => self.handle_new_order(state, order),
            OrderEvent::CancelRequest {
                orig_cl_ord_id,
                cl_ord_id: _,
                account_id,
                symbol,
                side,
                session_id,
            } => self.handle_cancel(state, &orig_cl_ord_id, &account_id, &symbol, side, session_id),
            OrderEvent::SessionLogon(id) => debug!(?id, "matching engine observed session logon"),
            OrderEvent::SessionLogout(id) => debug!(?id, "matching engine observed session logout"),
        }
    }

    /// `(crossable, fill_price, counter_volume)` against the instrument's
    /// last-known snapshot.
    fn match_params(order: &Order, snapshot: Option<&MarketDataSnapshot>) -> (bool, Option<f64>, i64) {
        let snap = match snapshot {
            Some(s) => s,
            None => return (false, None, 0),
        };
        match order.side {
            Side::Buy => {
                let crossable =
                    order.ord_type == OrdType::Market || snap.ask_price1.is_some_and(|ap| order.price >= ap);
                (crossable, snap.ask_price1, snap.ask_vol1)
            }
            Side::Sell => {
                let crossable =
                    order.ord_type == OrdType::Market || snap.bid_price1.is_some_and(|bp| order.price <= bp);
                (crossable, snap.bid_price1, snap.bid_vol1)
            }
        }
    }

    fn handle_new_order(&self, state: &mut EngineState, mut order: Order) {
        let now = now_millis();
        let account = match self.account_ledger.get_account(&order.account_id) {
            Some(a) => a,
            None => {
                self.emit_reject(state, &mut order, now, ExecRejReason::InsufficientMargin, "unknown account");
                return;
            }
        };
        let position = self.position_ledger.get_position(&order.account_id, &order.symbol);
        let instrument = self.instrument_catalog.get_instrument(&order.symbol);
        let snapshot = state.snapshots.get(&order.symbol).cloned();

        let required_margin = match risk::check_order(&order, &account, position.as_ref(), instrument.as_ref(), snapshot.as_ref()) {
            RiskVerdict::Reject { reason, text } => {
                self.emit_reject(state, &mut order, now, reason, text);
                return;
            }
            RiskVerdict::Accept { required_margin } => required_margin,
        };

        if !self.account_ledger.freeze_margin(&order.account_id, required_margin) {
            self.emit_reject(state, &mut order, now, ExecRejReason::InsufficientMargin, "margin freeze failed");
            return;
        }

        order.order_id = Some(state.alloc_order_id());
        order.status = OrdStatus::New;

        let (crossable, fill_price, counter_vol) = Self::match_params(&order, snapshot.as_ref());
        let would_fill_qty = if crossable { order.leaves_qty.min(counter_vol) } else { 0 };

        if order.tif == TimeInForce::Fok && would_fill_qty < order.leaves_qty {
            self.account_ledger.unfreeze_margin(&order.account_id, required_margin);
            order.reject(now);
            let report = ExecutionReport {
                order: order.clone(),
                exec_id: state.alloc_exec_id(),
                exec_trans_type: ExecTransType::New,
                last_shares: 0,
                last_px: 0.0,
                ord_rej_reason: Some(ExecRejReason::FillOrKillUnsatisfiable),
                text: Some("fill-or-kill could not be fully satisfied".into()),
                transact_time: now,
            };
            self.emit(order.session_id.clone(), report);
            return;
        }

        if would_fill_qty > 0 {
            let px = fill_price.expect("fill price present when crossable");
            order.apply_fill(would_fill_qty, px, now);
            let report = ExecutionReport {
                order: order.clone(),
                exec_id: state.alloc_exec_id(),
                exec_trans_type: ExecTransType::New,
                last_shares: would_fill_qty,
                last_px: px,
                ord_rej_reason: None,
                text: None,
                transact_time: now,
            };
            self.emit(order.session_id.clone(), report);
        }

        if order.leaves_qty == 0 {
            return;
        }

        match (order.ord_type, order.tif) {
            (OrdType::Market, _) | (_, TimeInForce::Ioc) => {
                order.cancel(now);
                let report = ExecutionReport {
                    order: order.clone(),
                    exec_id: state.alloc_exec_id(),
                    exec_trans_type: ExecTransType::Cancel,
                    last_shares: 0,
                    last_px: 0.0,
                    ord_rej_reason: None,
                    text: None,
                    transact_time: now,
                };
                self.emit(order.session_id.clone(), report);
            }
            (OrdType::Limit, TimeInForce::Day) | (OrdType::Limit, TimeInForce::Gtc) => {
                if would_fill_qty == 0 {
                    let report = ExecutionReport {
                        order: order.clone(),
                        exec_id: state.alloc_exec_id(),
                        exec_trans_type: ExecTransType::New,
                        last_shares: 0,
                        last_px: 0.0,
                        ord_rej_reason: None,
                        text: None,
                        transact_time: now,
                    };
                    self.emit(order.session_id.clone(), report);
                }
                state.pending.entry(order.symbol.clone()).or_default().push(order);
            }
            (_, TimeInForce::Fok) => unreachable!("FOK either fully fills above or is rejected before admission"),
        }
    }

    fn emit_reject(&self, state: &mut EngineState, order: &mut Order, now: i64, reason: ExecRejReason, text: impl Into<String>) {
        order.reject(now);
        let report = ExecutionReport {
            order: order.clone(),
            exec_id: state.alloc_exec_id(),
            exec_trans_type: ExecTransType::New,
            last_shares: 0,
            last_px: 0.0,
            ord_rej_reason: Some(reason),
            text: Some(text.into()),
            transact_time: now,
        };
        self.emit(order.session_id.clone(), report);
    }

    fn handle_cancel(
        &self,
        state: &mut EngineState,
        orig_cl_ord_id: &str,
        account_id: &str,
        symbol: &str,
        side: Side,
        session_id: SessionId,
    ) {
        let now = now_millis();
        let pending = state.pending.entry(symbol.to_string()).or_default();
        let found = pending
            .iter()
            .position(|o| o.cl_ord_id == orig_cl_ord_id && o.account_id == account_id && !o.status.is_terminal());

        match found {
            Some(idx) => {
                let mut order = pending.remove(idx);
                order.cancel(now);
                let report = ExecutionReport {
                    order: order.clone(),
                    exec_id: state.alloc_exec_id(),
                    exec_trans_type: ExecTransType::Cancel,
                    last_shares: 0,
                    last_px: 0.0,
                    ord_rej_reason: None,
                    text: None,
                    transact_time: now,
                };
                self.emit(session_id, report);
            }
            None => {
                let mut stub = Order::new(
                    orig_cl_ord_id.to_string(),
                    account_id.to_string(),
                    symbol.to_string(),
                    side,
                    OrdType::Limit,
                    TimeInForce::Day,
                    0.0,
                    0,
                    session_id.clone(),
                    now,
                );
                stub.status = OrdStatus::Rejected;
                let report = ExecutionReport {
                    order: stub,
                    exec_id: state.alloc_exec_id(),
                    exec_trans_type: ExecTransType::Cancel,
                    last_shares: 0,
                    last_px: 0.0,
                    ord_rej_reason: Some(ExecRejReason::UnknownOrder),
                    text: Some("order not found or already terminal".into()),
                    transact_time: now,
                };
                self.emit(session_id, report);
            }
        }
    }

    /// Updates the instrument's snapshot, then scans resting orders for
    /// that instrument in insertion order, filling against the snapshot's
    /// counter-volume until it is exhausted.
    fn process_market_data(&self, state: &mut EngineState, snapshot: MarketDataSnapshot) {
        let symbol = snapshot.instrument_id.clone();
        let now = snapshot.update_time;
        state.snapshots.insert(symbol.clone(), snapshot.clone());

        let mut remaining_ask_vol = snapshot.ask_vol1;
        let mut remaining_bid_vol = snapshot.bid_vol1;

        let orders = match state.pending.get_mut(&symbol) {
            Some(o) => std::mem::take(o),
            None => return,
        };

        let mut still_pending = Vec::with_capacity(orders.len());
        for mut order in orders {
            let (crossable, fill_price, remaining_vol) = match order.side {
                Side::Buy => (
                    order.ord_type == OrdType::Market || snapshot.ask_price1.is_some_and(|ap| order.price >= ap),
                    snapshot.ask_price1,
                    &mut remaining_ask_vol,
                ),
                Side::Sell => (
                    order.ord_type == OrdType::Market || snapshot.bid_price1.is_some_and(|bp| order.price <= bp),
                    snapshot.bid_price1,
                    &mut remaining_bid_vol,
                ),
            };

            if crossable && *remaining_vol > 0 {
                if let Some(px) = fill_price {
                    let fill_qty = order.leaves_qty.min(*remaining_vol);
                    if fill_qty > 0 {
                        order.apply_fill(fill_qty, px, now);
                        *remaining_vol -= fill_qty;
                        let report = ExecutionReport {
                            order: order.clone(),
                            exec_id: state.alloc_exec_id(),
                            exec_trans_type: ExecTransType::New,
                            last_shares: fill_qty,
                            last_px: px,
                            ord_rej_reason: None,
                            text: None,
                            transact_time: now,
                        };
                        self.emit(order.session_id.clone(), report);
                    }
                }
            }

            if order.leaves_qty > 0 {
                still_pending.push(order);
            }
        }

        state.pending.insert(symbol, still_pending);
    }

    /// Read-only view of an instrument's resting orders, for diagnostics
    /// and tests. Empty if the instrument has never been touched.
    #[cfg(test)]
    fn pending_count(state: &EngineState, symbol: &str) -> usize {
        state.pending.get(symbol).map(Vec::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::instrument::Instrument;
    use std::sync::Mutex as StdMutex;

    fn setup() -> (Arc<AccountLedger>, Arc<PositionLedger>, Arc<InstrumentCatalog>) {
        let accounts = Arc::new(AccountLedger::new());
        accounts.get_or_create_account("A1", 1_000_000.0);
        let positions = Arc::new(PositionLedger::new());
        let catalog = Arc::new(InstrumentCatalog::new());
        catalog.load_from_config([Instrument::new("IF2401", "SIM", "IF", 1.0, 1, 0.1)]);
        (accounts, positions, catalog)
    }

    fn session() -> SessionId {
        SessionId::new("CLIENT1", "GATEWAY")
    }

    fn snapshot(symbol: &str, bid: f64, bid_vol: i64, ask: f64, ask_vol: i64) -> MarketDataSnapshot {
        MarketDataSnapshot {
            instrument_id: symbol.to_string(),
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

    fn reports() -> (Arc<StdMutex<Vec<ExecutionReport>>>, ExecutionReportCallback) {
        let collected = Arc::new(StdMutex::new(Vec::new()));
        let sink = collected.clone();
        let cb: ExecutionReportCallback = Box::new(move |_sid, report| sink.lock().unwrap().push(report));
        (collected, cb)
    }

    #[test]
    fn limit_buy_crosses_and_fills_fully() {
        let (accounts, positions, catalog) = setup();
        let (reports, cb) = reports();
        let engine = MatchingEngine::new(accounts, positions, catalog, cb);
        let mut state = EngineState::default();
        state.snapshots.insert("IF2401".into(), snapshot("IF2401", 99.0, 50, 100.0, 50));

        let order = Order::new(
            "CL1".into(), "A1".into(), "IF2401".into(), Side::Buy, OrdType::Limit, TimeInForce::Day,
            100.0, 10, session(), 0,
        );
        engine.handle_new_order(&mut state, order);

        let recorded = reports.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].order.status, OrdStatus::Filled);
        assert_eq!(recorded[0].last_shares, 10);
        assert_eq!(recorded[0].last_px, 100.0);
    }

    #[test]
    fn partial_fill_leaves_remainder_resting() {
        let (accounts, positions, catalog) = setup();
        let (reports, cb) = reports();
        let engine = MatchingEngine::new(accounts, positions, catalog, cb);
        let mut state = EngineState::default();
        state.snapshots.insert("IF2401".into(), snapshot("IF2401", 99.0, 50, 100.0, 4));

        let order = Order::new(
            "CL2".into(), "A1".into(), "IF2401".into(), Side::Buy, OrdType::Limit, TimeInForce::Day,
            100.0, 10, session(), 0,
        );
        engine.handle_new_order(&mut state, order);

        let recorded = reports.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].order.status, OrdStatus::PartiallyFilled);
        assert_eq!(recorded[0].order.leaves_qty, 6);
        assert_eq!(MatchingEngine::pending_count(&state, "IF2401"), 1);
    }

    #[test]
    fn fok_rejects_whole_order_when_unsatisfiable() {
        let (accounts, positions, catalog) = setup();
        let (reports, cb) = reports();
        let engine = MatchingEngine::new(accounts.clone(), positions, catalog, cb);
        let mut state = EngineState::default();
        state.snapshots.insert("IF2401".into(), snapshot("IF2401", 99.0, 50, 100.0, 4));

        let order = Order::new(
            "CL3".into(), "A1".into(), "IF2401".into(), Side::Buy, OrdType::Limit, TimeInForce::Fok,
            100.0, 10, session(), 0,
        );
        engine.handle_new_order(&mut state, order);

        let recorded = reports.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].order.status, OrdStatus::Rejected);
        assert_eq!(recorded[0].ord_rej_reason, Some(ExecRejReason::FillOrKillUnsatisfiable));
        assert_eq!(MatchingEngine::pending_count(&state, "IF2401"), 0);
        let acc = accounts.get_account("A1").unwrap();
        assert_eq!(acc.frozen_margin, 0.0);
    }

    #[test]
    fn ioc_cancels_unfilled_remainder() {
        let (accounts, positions, catalog) = setup();
        let (reports, cb) = reports();
        let engine = MatchingEngine::new(accounts, positions, catalog, cb);
        let mut state = EngineState::default();
        state.snapshots.insert("IF2401".into(), snapshot("IF2401", 99.0, 50, 100.0, 4));

        let order = Order::new(
            "CL4".into(), "A1".into(), "IF2401".into(), Side::Buy, OrdType::Limit, TimeInForce::Ioc,
            100.0, 10, session(), 0,
        );
        engine.handle_new_order(&mut state, order);

        let recorded = reports.lock().unwrap();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].order.status, OrdStatus::PartiallyFilled);
        assert_eq!(recorded[1].order.status, OrdStatus::Canceled);
        assert_eq!(MatchingEngine::pending_count(&state, "IF2401"), 0);
    }

    #[test]
    fn cancel_removes_resting_order() {
        let (accounts, positions, catalog) = setup();
        let (reports, cb) = reports();
        let engine = MatchingEngine::new(accounts, positions, catalog, cb);
        let mut state = EngineState::default();

        let order = Order::new(
            "CL5".into(), "A1".into(), "IF2401".into(), Side::Buy, OrdType::Limit, TimeInForce::Gtc,
            100.0, 10, session(), 0,
        );
        engine.handle_new_order(&mut state, order);
        assert_eq!(MatchingEngine::pending_count(&state, "IF2401"), 1);

        engine.handle_cancel(&mut state, "CL5", "A1", "IF2401", Side::Buy, session());
        let recorded = reports.lock().unwrap();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[1].order.status, OrdStatus::Canceled);
        assert_eq!(MatchingEngine::pending_count(&state, "IF2401"), 0);
    }

    #[test]
    fn cancel_of_unknown_order_emits_reject() {
        let (accounts, positions, catalog) = setup();
        let (reports, cb) = reports();
        let engine = MatchingEngine::new(accounts, positions, catalog, cb);
        let mut state = EngineState::default();

        engine.handle_cancel(&mut state, "GHOST", "A1", "IF2401", Side::Buy, session());
        let recorded = reports.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].ord_rej_reason, Some(ExecRejReason::UnknownOrder));
    }

    #[test]
    fn market_data_update_fills_resting_orders_in_insertion_order() {
        let (accounts, positions, catalog) = setup();
        let (reports, cb) = reports();
        let engine = MatchingEngine::new(accounts, positions, catalog, cb);
        let mut state = EngineState::default();

        for (cl_ord_id, qty) in [("CL6", 5), ("CL7", 5)] {
            let order = Order::new(
                cl_ord_id.into(), "A1".into(), "IF2401".into(), Side::Buy, OrdType::Limit, TimeInForce::Gtc,
                100.0, qty, session(), 0,
            );
            engine.handle_new_order(&mut state, order);
        }
        assert_eq!(MatchingEngine::pending_count(&state, "IF2401"), 2);

        engine.process_market_data(&mut state, snapshot("IF2401", 99.0, 50, 100.0, 6));

        let recorded = reports.lock().unwrap();
        let fills: Vec<_> = recorded.iter().filter(|r| r.last_shares > 0).collect();
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[0].order.cl_ord_id, "CL6");
        assert_eq!(fills[0].last_shares, 5);
        assert_eq!(fills[1].order.cl_ord_id, "CL7");
        assert_eq!(fills[1].last_shares, 1);
        assert_eq!(MatchingEngine::pending_count(&state, "IF2401"), 1);
    }
}
