//! Bookpulse backend library.
//!
//! Live order-book replication for spot and futures pairs, derived
//! liquidity metrics, and their time-series persistence. The binary wires
//! these together; integration tests drive them directly.

pub mod bus;
pub mod exchange;
pub mod metrics;
pub mod models;
pub mod orderbook;
pub mod storage;
pub mod stream;
