// twshist/src/handler.rs
// Callbacks for events parsed from the server.

use crate::data::RawBar;

/// Receives every decoded inbound message. The socket reader thread is
/// the only caller, so implementations see callbacks in wire order.
pub trait GatewayHandler: Send + Sync {
  /// Sent automatically once StartAPI is accepted; completes the handshake.
  fn next_valid_id(&self, id: i32);

  fn managed_accounts(&self, accounts: &str);

  /// `id` is the request id, or -1 for general notices.
  fn error(&self, id: i32, error_code: i32, error_msg: &str, advanced_order_reject_json: &str);

  fn current_time(&self, time_unix: i64);

  fn historical_data(&self, req_id: i32, bar: RawBar);

  fn historical_data_end(&self, req_id: i32, start: &str, end: &str);

  fn fundamental_data(&self, req_id: i32, data: &str);

  /// The transport went away without a local disconnect.
  fn connection_closed(&self);
}
