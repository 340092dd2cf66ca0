//! Mock market-data feed: a synthetic quote source for tests and demo runs
//! started behind `--mock-feed`. Grounded on
//! `original_source/src/market/mock_md_adapter.cpp` — same random-walk
//! price model and ±10% base-price clamp, reworked onto `rand`'s `StdRng`
//! and a `crossbeam::channel` sender instead of the source's
//! `BlockingConcurrentQueue`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::Sender;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::domain::order::MarketDataSnapshot;

const DEFAULT_BASE_PRICE: f64 = 5000.0;
const DEFAULT_VOLATILITY: f64 = 0.001;
const DEFAULT_TICK_INTERVAL_MS: u64 = 500;

struct State {
    subscribed: HashSet<String>,
    base_prices: HashMap<String, f64>,
    last_prices: HashMap<String, f64>,
}

/// Drives a background thread that emits a `MarketDataSnapshot` per
/// subscribed instrument on a fixed cadence, following a bounded random
/// walk around each instrument's base price.
pub struct MockFeed {
    state: Mutex<State>,
    running: Arc<AtomicBool>,
    tick_interval_ms: Arc<AtomicU64>,
    volatility_bps: Arc<AtomicU64>,
    sender: Sender<MarketDataSnapshot>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MockFeed {
    pub fn new(sender: Sender<MarketDataSnapshot>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                subscribed: HashSet::new(),
                base_prices: HashMap::new(),
                last_prices: HashMap::new(),
            }),
            running: Arc::new(AtomicBool::new(false)),
            tick_interval_ms: Arc::new(AtomicU64::new(DEFAULT_TICK_INTERVAL_MS)),
            volatility_bps: Arc::new(AtomicU64::new((DEFAULT_VOLATILITY * 1_000_000.0) as u64)),
            sender,
            handle: Mutex::new(None),
        })
    }

    pub fn set_tick_interval_ms(&self, ms: u64) {
        self.tick_interval_ms.store(ms, Ordering::Relaxed);
    }

    pub fn set_volatility(&self, fraction: f64) {
        self.volatility_bps.store((fraction * 1_000_000.0) as u64, Ordering::Relaxed);
    }

    pub fn set_base_price(&self, instrument_id: &str, base_price: f64) {
        let mut state = self.state.lock();
        state.base_prices.insert(instrument_id.to_string(), base_price);
        state.last_prices.entry(instrument_id.to_string()).or_insert(base_price);
    }

    pub fn subscribe(&self, instrument_id: &str) {
        let mut state = self.state.lock();
        state.subscribed.insert(instrument_id.to_string());
        state.base_prices.entry(instrument_id.to_string()).or_insert(DEFAULT_BASE_PRICE);
        let base = state.base_prices[instrument_id];
        state.last_prices.entry(instrument_id.to_string()).or_insert(base);
    }

    pub fn unsubscribe(&self, instrument_id: &str) {
        self.state.lock().subscribed.remove(instrument_id);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let feed = self.clone();
        let handle = std::thread::Builder::new()
            .name("mock-md-feed".into())
            .spawn(move || feed.run())
            .expect("failed to spawn mock feed thread");
        *self.handle.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn run(self: Arc<Self>) {
        let mut rng = StdRng::from_entropy();
        while self.running.load(Ordering::SeqCst) {
            let instruments: Vec<String> = self.state.lock().subscribed.iter().cloned().collect();
            for instrument_id in instruments {
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                if let Some(tick) = self.generate_tick(&instrument_id, &mut rng) {
                    if self.sender.send(tick).is_err() {
                        return;
                    }
                }
            }
            let interval = self.tick_interval_ms.load(Ordering::Relaxed);
            std::thread::sleep(Duration::from_millis(interval));
        }
    }

    fn generate_tick(&self, instrument_id: &str, rng: &mut StdRng) -> Option<MarketDataSnapshot> {
        let (base_price, last_price) = {
            let state = self.state.lock();
            let base = *state.base_prices.get(instrument_id)?;
            let last = *state.last_prices.get(instrument_id).unwrap_or(&base);
            (base, last)
        };

        let volatility = self.volatility_bps.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        let change: f64 = rng.gen_range(-volatility..=volatility);
        let upper_limit = base_price * 1.10;
        let lower_limit = base_price * 0.90;
        let new_price = (last_price * (1.0 + change)).clamp(lower_limit, upper_limit);

        self.state.lock().last_prices.insert(instrument_id.to_string(), new_price);

        let spread = base_price * 0.0002;
        let bid_vol: i64 = rng.gen_range(10..=500);
        let ask_vol: i64 = rng.gen_range(10..=500);

        Some(MarketDataSnapshot {
            instrument_id: instrument_id.to_string(),
            last_price: new_price,
            bid_price1: Some(new_price - spread),
            bid_vol1: bid_vol,
            ask_price1: Some(new_price + spread),
            ask_vol1: ask_vol,
            upper_limit: Some(upper_limit),
            lower_limit: Some(lower_limit),
            update_time: chrono::Utc::now().timestamp_millis(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsubscribed_instrument_produces_no_tick() {
        let (tx, _rx) = crossbeam::channel::unbounded();
        let feed = MockFeed::new(tx);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(feed.generate_tick("UNKNOWN", &mut rng).is_none());
    }

    #[test]
    fn subscribed_instrument_stays_within_base_price_band() {
        let (tx, _rx) = crossbeam::channel::unbounded();
        let feed = MockFeed::new(tx);
        feed.set_base_price("IF2401", 5000.0);
        feed.subscribe("IF2401");
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let tick = feed.generate_tick("IF2401", &mut rng).unwrap();
            assert!(tick.last_price >= 4500.0 && tick.last_price <= 5500.0);
            assert!(tick.bid_price1.unwrap() < tick.ask_price1.unwrap());
        }
    }

    #[test]
    fn start_and_stop_is_idempotent_and_joins_cleanly() {
        let (tx, rx) = crossbeam::channel::unbounded();
        let feed = MockFeed::new(tx);
        feed.set_tick_interval_ms(5);
        feed.set_base_price("IF2401", 5000.0);
        feed.subscribe("IF2401");
        feed.start();
        feed.start();
        std::thread::sleep(Duration::from_millis(50));
        feed.stop();
        assert!(rx.try_recv().is_ok());
    }
}
