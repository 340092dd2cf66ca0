//! Simulated futures trading gateway: FIX 4.0 over TCP, a Reactor/worker
//! pool networking layer, a hashed timing wheel, a FIX session state
//! machine with gap detection/replay, a single-threaded matching engine
//! fed by lock-free queues, and account/position ledgers with a
//! four-phase margin lifecycle.

pub mod config;
pub mod domain;
pub mod error;
pub mod fix;
pub mod gateway;
pub mod market_data;
pub mod matching;
pub mod net;
pub mod persistence;
pub mod risk;
pub mod session;
pub mod timing;
