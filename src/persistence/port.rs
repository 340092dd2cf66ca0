//! Persistence Port (C9): the capability set the gateway needs for
//! orders, trades, session state and the resend-window message log.
//! Grounded on `original_source/include/storage/store.hpp`'s `IStore`.
//! All writes must be idempotent on primary key; the reference
//! implementation is `SqliteStore`.

use crate::domain::order::{Order, Side};
use crate::error::PersistenceError;
use crate::session::fsm::PersistedSessionState;

#[derive(Debug, Clone)]
pub struct StoredTrade {
    pub trade_id: String,
    pub cl_ord_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub quantity: i64,
    pub timestamp: i64,
    pub counterparty_order_id: String,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub seq_num: i64,
    pub sender_comp_id: String,
    pub target_comp_id: String,
    pub msg_type: String,
    pub raw_message: Vec<u8>,
    pub timestamp: i64,
}

pub type PersistResult<T> = Result<T, PersistenceError>;

/// Every method here returns `Result`, never panics or throws: decode
/// exceptions in the source become typed results everywhere in this
/// crate, and the persistence boundary is no exception.
pub trait PersistencePort: Send + Sync {
    fn save_order(&self, order: &Order) -> PersistResult<()>;
    fn update_order(&self, order: &Order) -> PersistResult<()>;
    fn load_order(&self, cl_ord_id: &str) -> PersistResult<Option<Order>>;
    fn load_orders_by_symbol(&self, symbol: &str) -> PersistResult<Vec<Order>>;
    fn load_active_orders(&self) -> PersistResult<Vec<Order>>;
    fn load_orders_for_account(&self, account_id: &str, limit: usize) -> PersistResult<Vec<Order>>;

    fn save_trade(&self, trade: &StoredTrade) -> PersistResult<()>;
    fn load_trades_by_order(&self, cl_ord_id: &str) -> PersistResult<Vec<StoredTrade>>;

    fn save_session_state(&self, state: &PersistedSessionState) -> PersistResult<()>;
    fn load_session_state(&self, sender: &str, target: &str) -> PersistResult<Option<PersistedSessionState>>;

    fn save_message(&self, msg: &StoredMessage) -> PersistResult<()>;
    fn load_messages(
        &self,
        sender: &str,
        target: &str,
        begin_seq: i64,
        end_seq: i64,
    ) -> PersistResult<Vec<StoredMessage>>;
    fn delete_messages_older_than(&self, timestamp: i64) -> PersistResult<usize>;
}
