//! Trade Gateway (C15): FIX <-> internal event translation. This is the
//! one component that talks to every other collaborator — sessions,
//! ledgers, the instrument catalog, persistence and the matching engine —
//! and owns the margin confirm/release/close-profit steps
//! assigns to `Application.fromApp`'s fill handler. The matching engine
//! itself owns risk-check-and-freeze, since only the engine thread has a
//! consistent view of the accept/reject decision at admission time; this
//! gateway re-runs the same check informationally at submission time only
//! to remember how much margin a resting order's freeze corresponds to,
//! so fills against it can be prorated without asking the engine again.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam::channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::domain::account::AccountLedger;
use crate::domain::instrument::InstrumentCatalog;
use crate::domain::order::{
    ExecutionReport, MarketDataSnapshot, OrdStatus, Order, OrderEvent, OrdType, Side, TimeInForce,
};
use crate::domain::position::PositionLedger;
use crate::fix::message::FixMessage;
use crate::fix::messages;
use crate::fix::tags::{self, msg_type};
use crate::net::connection::{shared_codec, Connection};
use crate::net::worker_pool::WorkerPool;
use crate::persistence::port::PersistencePort;
use crate::risk;
use crate::session::fsm::SessionId;
use crate::session::registry::SessionRegistry;

/// What a gateway-side risk pre-check froze for one still-open order, so a
/// later fill (or terminal reject/cancel) can unwind the right amount
/// without re-deriving it from the order book.
#[derive(Debug, Clone)]
struct OrderMarginInfo {
    original_frozen: f64,
    original_qty: i64,
    released_so_far: f64,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct TradeGateway {
    own_comp_id: String,
    default_account_balance: f64,
    account_ledger: Arc<AccountLedger>,
    position_ledger: Arc<PositionLedger>,
    instrument_catalog: Arc<InstrumentCatalog>,
    session_registry: Arc<SessionRegistry>,
    persistence: Arc<dyn PersistencePort>,
    order_tx: Sender<OrderEvent>,
    worker_pool: Arc<WorkerPool>,
    connections: Mutex<HashMap<SessionId, Arc<Connection>>>,
    session_accounts: Mutex<HashMap<SessionId, String>>,
    order_margin: Mutex<HashMap<String, OrderMarginInfo>>,
}

impl TradeGateway {
    pub fn new(
        own_comp_id: impl Into<String>,
        default_account_balance: f64,
        account_ledger: Arc<AccountLedger>,
        position_ledger: Arc<PositionLedger>,
        instrument_catalog: Arc<InstrumentCatalog>,
        session_registry: Arc<SessionRegistry>,
        persistence: Arc<dyn PersistencePort>,
        order_tx: Sender<OrderEvent>,
        worker_pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            own_comp_id: own_comp_id.into(),
            default_account_balance,
            account_ledger,
            position_ledger,
            instrument_catalog,
            session_registry,
            persistence,
            order_tx,
            worker_pool,
            connections: Mutex::new(HashMap::new()),
            session_accounts: Mutex::new(HashMap::new()),
            order_margin: Mutex::new(HashMap::new()),
        }
    }

    /// Registers the socket backing `session_id`'s outbound writes. Called
    /// once the Connection and Session are both up for a peer.
    pub fn bind_connection(&self, session_id: SessionId, conn: Arc<Connection>) {
        self.connections.lock().insert(session_id, conn);
    }

    pub fn unbind_connection(&self, session_id: &SessionId) {
        self.connections.lock().remove(session_id);
        self.session_accounts.lock().remove(session_id);
    }

    /// Binds `sessionID.targetCompID` as the account identity on a
    /// successful Logon, creating the account on first sight.
    pub fn on_logon_success(&self, session_id: &SessionId) {
        let account_id = session_id.target_comp_id.clone();
        self.account_ledger
            .get_or_create_account(&account_id, self.default_account_balance);
        self.session_accounts.lock().insert(session_id.clone(), account_id);
    }

    fn account_for(&self, session_id: &SessionId) -> Option<String> {
        self.session_accounts.lock().get(session_id).cloned()
    }

    /// Entry point for every `Application.fromApp` message the Session FSM
    /// delivers for an established session.
    pub fn handle_business_message(&self, session_id: &SessionId, msg: &FixMessage) {
        let now = now_millis();
        let msg_type = match msg.msg_type() {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "business message missing MsgType");
                return;
            }
        };
        match msg_type {
            msg_type::NEW_ORDER_SINGLE => self.handle_new_order_single(session_id, msg, now),
            msg_type::ORDER_CANCEL_REQUEST => self.handle_cancel_request(session_id, msg, now),
            msg_type::BALANCE_QUERY => self.handle_balance_query(session_id, now),
            msg_type::POSITION_QUERY => self.handle_position_query(session_id, msg, now),
            msg_type::INSTRUMENT_SEARCH => self.handle_instrument_search(session_id, msg, now),
            msg_type::ORDER_HISTORY_QUERY => self.handle_order_history_query(session_id, now),
            other => debug!(msg_type = other, "ignoring unsupported business MsgType"),
        }
    }

    fn handle_new_order_single(&self, session_id: &SessionId, msg: &FixMessage, now: i64) {
        let account_id = match self.account_for(session_id) {
            Some(a) => a,
            None => {
                warn!("NewOrderSingle before Logon bound an account; dropping");
                return;
            }
        };
        let (cl_ord_id, symbol, side, qty, ord_type, price, tif) = match parse_new_order(msg) {
            Ok(fields) => fields,
            Err(e) => {
                warn!(error = %e, "malformed NewOrderSingle");
                return;
            }
        };

        let order = Order::new(
            cl_ord_id.clone(),
            account_id.clone(),
            symbol.clone(),
            side,
            ord_type,
            tif,
            price,
            qty,
            session_id.clone(),
            now,
        );

        // Informational only: the engine re-runs this check atomically
        // with admission and is the authority on accept/reject. This
        // result just tells us how much to expect to unwind later.
        if let Some(account) = self.account_ledger.get_account(&account_id) {
            let instrument = self.instrument_catalog.get_instrument(&symbol);
            let position = self.position_ledger.get_position(&account_id, &symbol);
            if let risk::RiskVerdict::Accept { required_margin } =
                risk::check_order(&order, &account, position.as_ref(), instrument.as_ref(), None)
            {
                self.order_margin.lock().insert(
                    cl_ord_id.clone(),
                    OrderMarginInfo {
                        original_frozen: required_margin,
                        original_qty: qty,
                        released_so_far: 0.0,
                    },
                );
            }
        }

        if let Err(e) = self.persistence.save_order(&order) {
            warn!(error = %e, "failed to persist new order");
        }

        if self.order_tx.send(OrderEvent::NewOrder(order)).is_err() {
            warn!("matching engine order channel closed");
        }
    }

    fn handle_cancel_request(&self, session_id: &SessionId, msg: &FixMessage, now: i64) {
        let _ = now;
        let account_id = match self.account_for(session_id) {
            Some(a) => a,
            None => return,
        };
        let orig_cl_ord_id = msg.get_string_opt(tags::ORIG_CL_ORD_ID).unwrap_or_default().to_string();
        let cl_ord_id = msg.get_string_opt(tags::CL_ORD_ID).unwrap_or_default().to_string();
        let symbol = msg.get_string_opt(tags::SYMBOL).unwrap_or_default().to_string();
        let side = msg
            .get_string_opt(tags::SIDE)
            .and_then(Side::from_wire)
            .unwrap_or(Side::Buy);

        let event = OrderEvent::CancelRequest {
            orig_cl_ord_id,
            cl_ord_id,
            account_id,
            symbol,
            side,
            session_id: session_id.clone(),
        };
        if self.order_tx.send(event).is_err() {
            warn!("matching engine order channel closed");
        }
    }

    fn handle_balance_query(&self, session_id: &SessionId, now: i64) {
        let account_id = match self.account_for(session_id) {
            Some(a) => a,
            None => return,
        };
        if let Some(account) = self.account_ledger.get_account(&account_id) {
            let wire = messages::balance_response(&self.own_comp_id, &session_id.target_comp_id, &account);
            self.send_to_session(session_id, wire, now);
        }
    }

    fn handle_position_query(&self, session_id: &SessionId, msg: &FixMessage, now: i64) {
        let account_id = match self.account_for(session_id) {
            Some(a) => a,
            None => return,
        };
        let positions = match msg.get_string_opt(tags::SYMBOL) {
            Some(symbol) => self
                .position_ledger
                .get_position(&account_id, symbol)
                .into_iter()
                .collect::<Vec<_>>(),
            None => self.position_ledger.positions_by_account(&account_id),
        };
        let wire = messages::position_response(&self.own_comp_id, &session_id.target_comp_id, &positions);
        self.send_to_session(session_id, wire, now);
    }

    fn handle_instrument_search(&self, session_id: &SessionId, msg: &FixMessage, now: i64) {
        let prefix = msg.get_string_opt(tags::SYMBOL).unwrap_or_default();
        let matches = self.instrument_catalog.search_prefix(prefix, 50);
        let wire = messages::instrument_search_response(&self.own_comp_id, &session_id.target_comp_id, &matches);
        self.send_to_session(session_id, wire, now);
    }

    fn handle_order_history_query(&self, session_id: &SessionId, now: i64) {
        let account_id = match self.account_for(session_id) {
            Some(a) => a,
            None => return,
        };
        let orders = self
            .persistence
            .load_orders_for_account(&account_id, 200)
            .unwrap_or_default();
        let wire = messages::order_history_response(&self.own_comp_id, &session_id.target_comp_id, &orders);
        self.send_to_session(session_id, wire, now);
    }

    /// The matching engine's `ExecutionReportCallback`: drives the
    /// ledger-side consequences of a fill/cancel/reject, then relays the
    /// wire `ExecutionReport` to the owning session.
    pub fn on_execution_report(&self, session_id: SessionId, report: ExecutionReport) {
        let now = now_millis();
        if let Err(e) = self.persistence.update_order(&report.order) {
            warn!(error = %e, "failed to persist execution report");
        }

        if report.last_shares > 0 {
            self.apply_fill(&report);
        }
        if matches!(report.order.status, OrdStatus::Rejected | OrdStatus::Canceled) {
            self.release_remaining_margin(&report.order.account_id, &report.order.cl_ord_id);
        }
        if report.order.status.is_terminal() {
            self.order_margin.lock().remove(&report.order.cl_ord_id);
        }

        let wire = messages::execution_report(&self.own_comp_id, &session_id.target_comp_id, &report);
        self.send_to_session(&session_id, wire, now);
    }

    /// Closes the opposite side first (realizing profit and releasing its
    /// margin), then opens any remainder on `order.side`'s own book, then
    /// prorates the gateway's tracked freeze into `confirm_margin`.
    fn apply_fill(&self, report: &ExecutionReport) {
        let order = &report.order;
        let instrument = match self.instrument_catalog.get_instrument(&order.symbol) {
            Some(i) => i,
            None => return,
        };
        let fill_qty = report.last_shares;
        let fill_px = report.last_px;

        let closing_qty = self
            .position_ledger
            .closable_quantity(&order.account_id, &order.symbol, order.side, fill_qty);
        let opening_qty = fill_qty - closing_qty;

        if closing_qty > 0 {
            let released = self.position_ledger.margin_to_release(
                &order.account_id,
                &order.symbol,
                order.side,
                closing_qty,
            );
            let profit = self.position_ledger.close_position(
                &order.account_id,
                &order.symbol,
                order.side,
                closing_qty,
                fill_px,
                instrument.volume_multiple,
            );
            self.account_ledger.release_margin(&order.account_id, released);
            self.account_ledger.add_close_profit(&order.account_id, profit);
        }

        let mut opening_margin = 0.0;
        if opening_qty > 0 {
            opening_margin = instrument.calculate_margin(fill_px, opening_qty);
            self.position_ledger.open_position(
                &order.account_id,
                &order.symbol,
                order.side,
                opening_qty,
                fill_px,
                opening_margin,
            );
        }

        let mut guard = self.order_margin.lock();
        if let Some(info) = guard.get_mut(&order.cl_ord_id) {
            let prorated = if info.original_qty > 0 {
                info.original_frozen * (fill_qty as f64 / info.original_qty as f64)
            } else {
                0.0
            };
            self.account_ledger.confirm_margin(&order.account_id, prorated, opening_margin);
            info.released_so_far += prorated;
        } else {
            // No gateway-side freeze on record (e.g. fill on a resting
            // order placed before this process restarted): confirm the
            // opening margin directly against whatever is frozen.
            self.account_ledger.confirm_margin(&order.account_id, opening_margin, opening_margin);
        }
    }

    /// Unfreezes whatever portion of a gateway-tracked pre-check's freeze
    /// a terminal reject/cancel leaves unconfirmed.
    fn release_remaining_margin(&self, account_id: &str, cl_ord_id: &str) {
        let remaining = {
            let guard = self.order_margin.lock();
            guard
                .get(cl_ord_id)
                .map(|info| (info.original_frozen - info.released_so_far).max(0.0))
        };
        if let Some(remaining) = remaining {
            if remaining > 0.0 {
                self.account_ledger.unfreeze_margin(account_id, remaining);
            }
        }
    }

    /// Pushes U5 (AccountUpdate) / U6 (PositionUpdate) for every
    /// currently-bound session holding a position on `snapshot`'s
    /// instrument, after refreshing `positionLedger`'s mark-to-market.
    pub fn on_market_data(&self, snapshot: &MarketDataSnapshot, volume_multiple: i64) {
        let now = now_millis();
        self.position_ledger.update_all_profits(snapshot, volume_multiple);

        let bound: Vec<(SessionId, String)> = self
            .session_accounts
            .lock()
            .iter()
            .map(|(s, a)| (s.clone(), a.clone()))
            .collect();

        for (session_id, account_id) in bound {
            let position = match self.position_ledger.get_position(&account_id, &snapshot.instrument_id) {
                Some(p) => p,
                // No position on this instrument: never push an update
                // that would read as "position cleared".
                None => continue,
            };

            let total_position_profit: f64 = self
                .position_ledger
                .positions_by_account(&account_id)
                .iter()
                .map(|p| p.position_profit)
                .sum();
            self.account_ledger.update_position_profit(&account_id, total_position_profit);

            if let Some(account) = self.account_ledger.get_account(&account_id) {
                let wire = messages::account_update(&self.own_comp_id, &session_id.target_comp_id, &account);
                self.send_to_session(&session_id, wire, now);
            }
            let wire = messages::position_update(&self.own_comp_id, &session_id.target_comp_id, &position);
            self.send_to_session(&session_id, wire, now);
        }
    }

    /// Drives every bound session's send-idle/recv-idle timers, called
    /// from a timing-wheel periodic task. Sessions that time out are
    /// force-disconnected and dropped from the registry.
    pub fn tick_sessions_heartbeats(&self, heart_bt_int_secs: i64, now: i64) {
        let bound: Vec<SessionId> = self.connections.lock().keys().cloned().collect();
        for session_id in bound {
            let session = match self.session_registry.get(&session_id) {
                Some(s) => s,
                None => continue,
            };
            if let Some(mut hb) = session.send_idle_tick(heart_bt_int_secs, now) {
                self.send_stamped(&session_id, &mut hb);
            }
            match session.recv_idle_tick(heart_bt_int_secs, now) {
                crate::session::fsm::RecvTimeoutOutcome::Ok => {}
                crate::session::fsm::RecvTimeoutOutcome::SendTestRequest(mut req) => {
                    self.send_stamped(&session_id, &mut req);
                }
                crate::session::fsm::RecvTimeoutOutcome::Shutdown(reason) => {
                    warn!(session = ?session_id, reason, "session timed out");
                    self.session_registry.unregister(&session_id);
                    self.unbind_connection(&session_id);
                }
            }
        }
    }

    /// Sends a message the session layer already stamped with a seq
    /// number (unlike `send_to_session`, which stamps business messages
    /// originating outside the FSM).
    fn send_stamped(&self, session_id: &SessionId, msg: &mut FixMessage) {
        let conn = self.connections.lock().get(session_id).cloned();
        if let Some(conn) = conn {
            let bytes = shared_codec().encode(msg);
            conn.send(bytes, &self.worker_pool);
        }
    }

    fn send_to_session(&self, session_id: &SessionId, mut msg: FixMessage, now: i64) {
        let session = match self.session_registry.get(session_id) {
            Some(s) => s,
            None => return,
        };
        session.stamp_outbound(&mut msg, now);
        let conn = self.connections.lock().get(session_id).cloned();
        if let Some(conn) = conn {
            let bytes = shared_codec().encode(&mut msg);
            conn.send(bytes, &self.worker_pool);
        }
    }
}

fn parse_new_order(
    msg: &FixMessage,
) -> Result<(String, String, Side, i64, OrdType, f64, TimeInForce), String> {
    let cl_ord_id = msg.get_string(tags::CL_ORD_ID).map_err(|e| e.to_string())?.to_string();
    let symbol = msg.get_string(tags::SYMBOL).map_err(|e| e.to_string())?.to_string();
    let side = Side::from_wire(msg.get_string(tags::SIDE).map_err(|e| e.to_string())?)
        .ok_or_else(|| "invalid Side".to_string())?;
    let qty = msg.get_int(tags::ORDER_QTY).map_err(|e| e.to_string())?;
    let ord_type = OrdType::from_wire(msg.get_string(tags::ORD_TYPE).map_err(|e| e.to_string())?)
        .ok_or_else(|| "invalid OrdType".to_string())?;
    let price = msg.get_f64(tags::PRICE).unwrap_or(0.0);
    let tif = msg
        .get_string_opt(tags::TIME_IN_FORCE)
        .and_then(TimeInForce::from_wire)
        .unwrap_or(TimeInForce::Day);
    Ok((cl_ord_id, symbol, side, qty, ord_type, price, tif))
}
