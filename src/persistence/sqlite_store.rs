//! SQLite-backed `PersistencePort`. Minimal indexed columns plus a JSON
//! blob per row for the rest of each record's fields. The concrete
//! schema is an implementation detail; only the logical tables and their
//! primary keys are load-bearing for callers.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::domain::order::{Order, Side};
use crate::error::PersistenceError;
use crate::persistence::port::{PersistResult, PersistencePort, StoredMessage, StoredTrade};
use crate::session::fsm::PersistedSessionState;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> PersistResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> PersistResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> PersistResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS orders (
                cl_ord_id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                status TEXT NOT NULL,
                order_blob BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_orders_symbol ON orders(symbol);
            CREATE INDEX IF NOT EXISTS idx_orders_account ON orders(account_id);

            CREATE TABLE IF NOT EXISTS trades (
                trade_id TEXT PRIMARY KEY,
                cl_ord_id TEXT NOT NULL REFERENCES orders(cl_ord_id),
                symbol TEXT NOT NULL,
                trade_blob BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_cl_ord_id ON trades(cl_ord_id);
            CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol);

            CREATE TABLE IF NOT EXISTS session_states (
                sender TEXT NOT NULL,
                target TEXT NOT NULL,
                send_seq INTEGER NOT NULL,
                recv_seq INTEGER NOT NULL,
                last_update_time INTEGER NOT NULL,
                PRIMARY KEY (sender, target)
            );

            CREATE TABLE IF NOT EXISTS messages (
                sender TEXT NOT NULL,
                target TEXT NOT NULL,
                seq_num INTEGER NOT NULL,
                msg_type TEXT NOT NULL,
                raw_message BLOB NOT NULL,
                timestamp INTEGER NOT NULL,
                PRIMARY KEY (sender, target, seq_num)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);",
        )?;
        Ok(())
    }

    fn is_terminal_status(status: &str) -> bool {
        matches!(status, "\"Filled\"" | "\"Canceled\"" | "\"Rejected\"")
    }
}

fn order_from_row(blob: Vec<u8>) -> PersistResult<Order> {
    serde_json::from_slice(&blob).map_err(PersistenceError::from)
}

impl PersistencePort for SqliteStore {
    fn save_order(&self, order: &Order) -> PersistResult<()> {
        let blob = serde_json::to_vec(order)?;
        let status = serde_json::to_string(&order.status)?;
        self.conn.lock().execute(
            "INSERT INTO orders (cl_ord_id, account_id, symbol, status, order_blob)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(cl_ord_id) DO UPDATE SET
                account_id = excluded.account_id,
                symbol = excluded.symbol,
                status = excluded.status,
                order_blob = excluded.order_blob",
            params![order.cl_ord_id, order.account_id, order.symbol, status, blob],
        )?;
        Ok(())
    }

    fn update_order(&self, order: &Order) -> PersistResult<()> {
        self.save_order(order)
    }

    fn load_order(&self, cl_ord_id: &str) -> PersistResult<Option<Order>> {
        let conn = self.conn.lock();
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT order_blob FROM orders WHERE cl_ord_id = ?1",
                params![cl_ord_id],
                |row| row.get(0),
            )
            .optional()?;
        blob.map(order_from_row).transpose()
    }

    fn load_orders_by_symbol(&self, symbol: &str) -> PersistResult<Vec<Order>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT order_blob FROM orders WHERE symbol = ?1")?;
        let rows = stmt
            .query_map(params![symbol], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(order_from_row).collect()
    }

    fn load_active_orders(&self) -> PersistResult<Vec<Order>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT status, order_blob FROM orders")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .filter(|(status, _)| !Self::is_terminal_status(status))
            .map(|(_, blob)| order_from_row(blob))
            .collect()
    }

    fn load_orders_for_account(&self, account_id: &str, limit: usize) -> PersistResult<Vec<Order>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT order_blob FROM orders WHERE account_id = ?1 ORDER BY rowid DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![account_id, limit as i64], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(order_from_row).collect()
    }

    fn save_trade(&self, trade: &StoredTrade) -> PersistResult<()> {
        #[derive(serde::Serialize)]
        struct TradeBlob<'a> {
            price: f64,
            quantity: i64,
            timestamp: i64,
            counterparty_order_id: &'a str,
            side: Side,
        }
        let blob = serde_json::to_vec(&TradeBlob {
            price: trade.price,
            quantity: trade.quantity,
            timestamp: trade.timestamp,
            counterparty_order_id: &trade.counterparty_order_id,
            side: trade.side,
        })?;
        self.conn.lock().execute(
            "INSERT INTO trades (trade_id, cl_ord_id, symbol, trade_blob)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(trade_id) DO UPDATE SET trade_blob = excluded.trade_blob",
            params![trade.trade_id, trade.cl_ord_id, trade.symbol, blob],
        )?;
        Ok(())
    }

    fn load_trades_by_order(&self, cl_ord_id: &str) -> PersistResult<Vec<StoredTrade>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT trade_id, cl_ord_id, symbol, trade_blob FROM trades WHERE cl_ord_id = ?1",
        )?;
        #[derive(serde::Deserialize)]
        struct TradeBlob {
            price: f64,
            quantity: i64,
            timestamp: i64,
            counterparty_order_id: String,
            side: Side,
        }
        let rows = stmt
            .query_map(params![cl_ord_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(trade_id, cl_ord_id, symbol, blob)| {
                let parsed: TradeBlob = serde_json::from_slice(&blob)?;
                Ok(StoredTrade {
                    trade_id,
                    cl_ord_id,
                    symbol,
                    side: parsed.side,
                    price: parsed.price,
                    quantity: parsed.quantity,
                    timestamp: parsed.timestamp,
                    counterparty_order_id: parsed.counterparty_order_id,
                })
            })
            .collect()
    }

    fn save_session_state(&self, state: &PersistedSessionState) -> PersistResult<()> {
        self.conn.lock().execute(
            "INSERT INTO session_states (sender, target, send_seq, recv_seq, last_update_time)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(sender, target) DO UPDATE SET
                send_seq = excluded.send_seq,
                recv_seq = excluded.recv_seq,
                last_update_time = excluded.last_update_time",
            params![state.sender, state.target, state.send_seq, state.recv_seq, state.last_update_time],
        )?;
        Ok(())
    }

    fn load_session_state(&self, sender: &str, target: &str) -> PersistResult<Option<PersistedSessionState>> {
        self.conn
            .lock()
            .query_row(
                "SELECT sender, target, send_seq, recv_seq, last_update_time
                 FROM session_states WHERE sender = ?1 AND target = ?2",
                params![sender, target],
                |row| {
                    Ok(PersistedSessionState {
                        sender: row.get(0)?,
                        target: row.get(1)?,
                        send_seq: row.get(2)?,
                        recv_seq: row.get(3)?,
                        last_update_time: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(PersistenceError::from)
    }

    fn save_message(&self, msg: &StoredMessage) -> PersistResult<()> {
        self.conn.lock().execute(
            "INSERT INTO messages (sender, target, seq_num, msg_type, raw_message, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(sender, target, seq_num) DO UPDATE SET
                msg_type = excluded.msg_type,
                raw_message = excluded.raw_message,
                timestamp = excluded.timestamp",
            params![
                msg.sender_comp_id,
                msg.target_comp_id,
                msg.seq_num,
                msg.msg_type,
                msg.raw_message,
                msg.timestamp
            ],
        )?;
        Ok(())
    }

    fn load_messages(
        &self,
        sender: &str,
        target: &str,
        begin_seq: i64,
        end_seq: i64,
    ) -> PersistResult<Vec<StoredMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT seq_num, sender, target, msg_type, raw_message, timestamp
             FROM messages
             WHERE sender = ?1 AND target = ?2 AND seq_num BETWEEN ?3 AND ?4
             ORDER BY seq_num ASC",
        )?;
        let rows = stmt
            .query_map(params![sender, target, begin_seq, end_seq], |row| {
                Ok(StoredMessage {
                    seq_num: row.get(0)?,
                    sender_comp_id: row.get(1)?,
                    target_comp_id: row.get(2)?,
                    msg_type: row.get(3)?,
                    raw_message: row.get(4)?,
                    timestamp: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn delete_messages_older_than(&self, timestamp: i64) -> PersistResult<usize> {
        let deleted = self
            .conn
            .lock()
            .execute("DELETE FROM messages WHERE timestamp < ?1", params![timestamp])?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{OrdType, Side, TimeInForce};
    use crate::session::fsm::SessionId;

    fn sample_order(cl_ord_id: &str) -> Order {
        Order::new(
            cl_ord_id.to_string(),
            "CLIENT1".to_string(),
            "TEST".to_string(),
            Side::Buy,
            OrdType::Limit,
            TimeInForce::Day,
            100.0,
            5,
            SessionId::new("GATEWAY", "CLIENT1"),
            0,
        )
    }

    #[test]
    fn save_then_load_order_roundtrips() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save_order(&sample_order("ORD1")).unwrap();
        let loaded = store.load_order("ORD1").unwrap().unwrap();
        assert_eq!(loaded.cl_ord_id, "ORD1");
        assert_eq!(loaded.order_qty, 5);
    }

    #[test]
    fn update_order_is_idempotent_on_primary_key() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut order = sample_order("ORD1");
        store.save_order(&order).unwrap();
        order.apply_fill(5, 100.0, 1);
        store.update_order(&order).unwrap();
        let loaded = store.load_order("ORD1").unwrap().unwrap();
        assert_eq!(loaded.cum_qty, 5);

        let count: i64 = store
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM orders", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn active_orders_excludes_terminal_status() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut filled = sample_order("ORD1");
        filled.apply_fill(5, 100.0, 1);
        store.save_order(&filled).unwrap();
        store.save_order(&sample_order("ORD2")).unwrap();

        let active = store.load_active_orders().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].cl_ord_id, "ORD2");
    }

    #[test]
    fn session_state_roundtrips() {
        let store = SqliteStore::open_in_memory().unwrap();
        let state = PersistedSessionState {
            sender: "GATEWAY".to_string(),
            target: "CLIENT1".to_string(),
            send_seq: 20,
            recv_seq: 50,
            last_update_time: 123,
        };
        store.save_session_state(&state).unwrap();
        let loaded = store.load_session_state("GATEWAY", "CLIENT1").unwrap().unwrap();
        assert_eq!(loaded.send_seq, 20);
        assert_eq!(loaded.recv_seq, 50);
    }

    #[test]
    fn message_window_query_respects_bounds() {
        let store = SqliteStore::open_in_memory().unwrap();
        for seq in 1..=5 {
            store
                .save_message(&StoredMessage {
                    seq_num: seq,
                    sender_comp_id: "GATEWAY".to_string(),
                    target_comp_id: "CLIENT1".to_string(),
                    msg_type: "D".to_string(),
                    raw_message: b"raw".to_vec(),
                    timestamp: seq,
                })
                .unwrap();
        }
        let window = store.load_messages("GATEWAY", "CLIENT1", 2, 4).unwrap();
        assert_eq!(window.len(), 3);
        assert_eq!(window[0].seq_num, 2);
    }
}
