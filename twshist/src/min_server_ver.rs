// twshist/src/min_server_ver.rs
// Minimum server version constants for the fields this client reads and writes

/// Minimum server versions for specific functionality
#[allow(dead_code)]
pub mod min_server_ver {
  pub const FUNDAMENTAL_DATA: i32 = 40;
  pub const TRADING_CLASS: i32 = 68;
  pub const LINKING: i32 = 70;
  pub const SYNT_REALTIME_BARS: i32 = 124;
  pub const ADVANCED_ORDER_REJECT: i32 = 166;
  pub const ERROR_TIME: i32 = 194;
  pub const HISTORICAL_DATA_END: i32 = 196;

  /// Lowest version offered in the H1 handshake.
  pub const MIN_CLIENT_VERSION: i32 = 100;
  /// Highest version offered in the H1 handshake. The gateway picks the
  /// negotiated version at or below this, so the ERROR_TIME and
  /// HISTORICAL_DATA_END layouts are only seen once this is raised.
  pub const MAX_SUPPORTED_VERSION: i32 = 187;
}
