// twshist/src/lib.rs
// Long-range historical bars from an IB TWS / IB Gateway session

//! # twshist
//!
//! Blocking historical-data client for the Interactive Brokers TWS API:
//!
//! - one gateway session multiplexing many request ids
//! - bounded window fetches with timeouts and partial-data recovery
//! - long-range pagination that walks back window by window
//! - batch runs with a reconnect policy
//! - session recording and replay through sqlite

mod base;
mod min_server_ver;
mod protocol_encoder;
mod protocol_decoder;
mod protocol_dec_parser;
mod message_parser;
mod parser_client;
mod parser_data_market;
mod parser_data_fin;
pub mod conn_log;
mod conn_mock;
pub mod contract;
pub mod data;
pub mod error_class;
pub mod handler;
pub mod conn;
pub mod registry;
pub mod rate_limiter;
pub mod session;
pub mod fetcher;
pub mod paginator;
pub mod batch;
pub mod financial_report_parser;

pub use base::TwsError;
pub use conn_mock::MockConnection;
pub use contract::{BarSize, Contract, DateFormat, SecType, SecurityKind, WhatToShow};
pub use data::{Bar, DurationUnit, HistoryOptions, SymbolSeries, Window};
pub use session::{ConnectionState, GatewaySession, SessionConfig};
pub use fetcher::{fetch_fundamental_report, fetch_window, WindowSource};
pub use paginator::{fetch_long_range, LongRangeError, LongRangeResult, Pacing};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
