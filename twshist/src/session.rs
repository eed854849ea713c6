// twshist/src/session.rs
// One gateway connection, many logical requests over it.
//
// Callers allocate a request id, register it, issue the request and block
// on its gate. The transport's reader calls into `SessionCore` (the
// `GatewayHandler` impl) which routes fragments, completions and errors
// to the registry. Connection-fatal errors fail every pending request and
// move the session to `Failed`; reconnecting means a new session.

use crate::base::TwsError;
use crate::conn::{Connection, SocketConnection, SocketOptions};
use crate::conn_log::ConnectionLogger;
use crate::data::RawBar;
use crate::error_class::{classify, is_general_id, ErrorClass};
use crate::handler::GatewayHandler;
use crate::protocol_decoder::ClientErrorCode;
use crate::protocol_encoder::{Encoder, OutgoingMessageType};
use crate::rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterStatus};
use crate::registry::{Fragment, PendingRequest, RequestKind, RequestRegistry, WaitOutcome};

use log::{debug, error, info, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct SessionConfig {
  pub host: String,
  pub port: u16,
  pub client_id: i32,
  /// Bounds both the TCP connect and the wait for the handshake id.
  pub connect_timeout: Duration,
  pub disconnect_grace: Duration,
  pub rate_limits: RateLimiterConfig,
  /// Pin the first request id instead of seeding it from the clock.
  pub first_request_id: Option<i32>,
  /// Record traffic to this sqlite file under `session_name`.
  pub log_db: Option<PathBuf>,
  pub session_name: Option<String>,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      host: "127.0.0.1".to_string(),
      port: 4002,
      client_id: 1,
      connect_timeout: Duration::from_secs(10),
      disconnect_grace: Duration::from_secs(3),
      rate_limits: RateLimiterConfig::default(),
      first_request_id: None,
      log_db: None,
      session_name: None,
    }
  }
}

impl SessionConfig {
  pub fn new(host: &str, port: u16, client_id: i32) -> Self {
    Self { host: host.to_string(), port, client_id, ..Default::default() }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
  Disconnected,
  Connecting,
  Ready,
  Failed,
}

impl fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ConnectionState::Disconnected => "disconnected",
      ConnectionState::Connecting => "connecting",
      ConnectionState::Ready => "ready",
      ConnectionState::Failed => "failed",
    };
    write!(f, "{}", s)
  }
}

/// Seed request ids from the clock so consecutive runs against the same
/// gateway rarely reuse ids: tenths of a second modulo 10000, plus 500.
fn clock_seeded_request_id() -> i32 {
  let tenths = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() / 100)
    .unwrap_or(0);
  (tenths % 10_000) as i32 + 500
}

#[derive(Debug)]
struct Status {
  state: ConnectionState,
  handshake_id: Option<i32>,
  failure: Option<TwsError>,
}

/// Shared state the reader thread writes into.
struct SessionCore {
  registry: RequestRegistry,
  status: Mutex<Status>,
  status_cond: Condvar,
  rate_limiter: RateLimiter,
  // Current-time replies carry no request id; they answer probes in order.
  time_probes: Mutex<VecDeque<i32>>,
}

impl SessionCore {
  fn new(rate_limits: RateLimiterConfig) -> Self {
    Self {
      registry: RequestRegistry::new(),
      status: Mutex::new(Status { state: ConnectionState::Disconnected, handshake_id: None, failure: None }),
      status_cond: Condvar::new(),
      rate_limiter: RateLimiter::new(rate_limits),
      time_probes: Mutex::new(VecDeque::new()),
    }
  }

  fn set_state(&self, state: ConnectionState) {
    let mut status = self.status.lock();
    if status.state != state {
      debug!("Session state {} -> {}", status.state, state);
      status.state = state;
      self.status_cond.notify_all();
    }
  }

  /// Fail the session and every pending request.
  fn mark_failed(&self, err: TwsError) {
    {
      let mut status = self.status.lock();
      match status.state {
        // A local disconnect is final; only the pending requests are settled.
        ConnectionState::Disconnected => debug!("After disconnect: {}", err),
        ConnectionState::Failed => {}
        ConnectionState::Connecting | ConnectionState::Ready => {
          error!("Session failed: {}", err);
          status.state = ConnectionState::Failed;
          status.failure = Some(err.clone());
          self.status_cond.notify_all();
        }
      }
    }
    let failed = self.registry.fail_all(&err);
    if failed > 0 {
      warn!("Failed {} pending request(s): {}", failed, err);
    }
  }

  /// Fail one request from the caller side (send error, rate limit).
  fn fail_request(&self, req_id: i32, err: TwsError) {
    self.rate_limiter.release_historical(req_id);
    if !self.registry.fail(req_id, err) {
      trace!("Request {} already settled or gone", req_id);
    }
  }

  fn wait_ready(&self, timeout: Duration) -> Result<i32, TwsError> {
    let start = Instant::now();
    let mut status = self.status.lock();
    loop {
      match status.state {
        ConnectionState::Ready => {
          return status.handshake_id.ok_or_else(|| TwsError::InternalError("Ready without handshake id".into()));
        }
        ConnectionState::Failed => {
          let cause = status.failure.as_ref().map(|e| e.to_string()).unwrap_or_else(|| "unknown".into());
          return Err(TwsError::ConnectionFailed(format!("Handshake failed: {}", cause)));
        }
        ConnectionState::Disconnected => return Err(TwsError::NotConnected),
        ConnectionState::Connecting => {}
      }
      let elapsed = start.elapsed();
      if elapsed >= timeout {
        return Err(TwsError::ConnectionFailed(format!("No handshake id within {:?}", timeout)));
      }
      let _ = self.status_cond.wait_for(&mut status, timeout - elapsed);
    }
  }
}

impl GatewayHandler for SessionCore {
  fn next_valid_id(&self, id: i32) {
    let mut status = self.status.lock();
    debug!("Handshake id {}", id);
    status.handshake_id = Some(id);
    if status.state == ConnectionState::Connecting {
      status.state = ConnectionState::Ready;
      info!("Session ready (next valid id {})", id);
    }
    self.status_cond.notify_all();
  }

  fn managed_accounts(&self, accounts: &str) {
    info!("Managed accounts: {}", accounts);
  }

  fn error(&self, id: i32, error_code: i32, error_msg: &str, advanced_order_reject_json: &str) {
    if !advanced_order_reject_json.is_empty() {
      debug!("Error {} carries reject detail: {}", error_code, advanced_order_reject_json);
    }
    let general = is_general_id(id);
    match classify(error_code, general) {
      ErrorClass::Informational => {
        if general && classify(error_code, false) == ErrorClass::RequestFatal {
          error!("Error {} without a request id: {}", error_code, error_msg);
        } else {
          info!("TWS notice {} (id {}): {}", error_code, id, error_msg);
        }
      }
      ErrorClass::RequestFatal => {
        warn!("Request {} rejected: {} {}", id, error_code, error_msg);
        self.fail_request(id, TwsError::RequestFatal(error_code, error_msg.to_string()));
      }
      ErrorClass::ConnectionFatal => {
        self.mark_failed(TwsError::ConnectionFatal(error_code, error_msg.to_string()));
      }
    }
  }

  fn current_time(&self, time_unix: i64) {
    match self.time_probes.lock().pop_front() {
      Some(req_id) => {
        self.registry.append(req_id, Fragment::Text(time_unix.to_string()));
        self.registry.complete(req_id);
      }
      None => debug!("Unsolicited current time {}", time_unix),
    }
  }

  fn historical_data(&self, req_id: i32, bar: RawBar) {
    self.registry.append(req_id, Fragment::Bar(bar));
  }

  fn historical_data_end(&self, req_id: i32, start: &str, end: &str) {
    trace!("Historical data end for {}: {} - {}", req_id, start, end);
    self.rate_limiter.release_historical(req_id);
    self.registry.complete(req_id);
  }

  fn fundamental_data(&self, req_id: i32, data: &str) {
    if self.registry.append(req_id, Fragment::Text(data.to_string())) {
      self.registry.complete(req_id);
    }
  }

  fn connection_closed(&self) {
    let code = ClientErrorCode::BadLength;
    self.mark_failed(TwsError::ConnectionFatal(code.into(), code.message().to_string()));
  }
}

pub struct GatewaySession {
  config: SessionConfig,
  core: Arc<SessionCore>,
  conn: Mutex<Option<Box<dyn Connection>>>,
  next_id: AtomicI32,
  server_version: AtomicI32,
  connect_attempted: AtomicBool,
}

impl GatewaySession {
  pub fn new(config: SessionConfig) -> Arc<Self> {
    let first_id = config.first_request_id.unwrap_or_else(clock_seeded_request_id);
    Arc::new(Self {
      core: Arc::new(SessionCore::new(config.rate_limits.clone())),
      conn: Mutex::new(None),
      next_id: AtomicI32::new(first_id),
      server_version: AtomicI32::new(0),
      connect_attempted: AtomicBool::new(false),
      config,
    })
  }

  pub fn config(&self) -> &SessionConfig {
    &self.config
  }

  fn begin_connect(&self) -> Result<(), TwsError> {
    if self.connect_attempted.swap(true, Ordering::SeqCst) {
      return Err(TwsError::AlreadyConnected);
    }
    self.core.set_state(ConnectionState::Connecting);
    Ok(())
  }

  /// Open a socket to the configured gateway and block until the
  /// handshake id arrives. Returns the handshake id.
  pub fn connect(&self) -> Result<i32, TwsError> {
    self.begin_connect()?;
    let logger = match (&self.config.log_db, &self.config.session_name) {
      (Some(db), name) => {
        let name = name.clone().unwrap_or_else(|| format!("client-{}", self.config.client_id));
        match ConnectionLogger::new(db, &name, &self.config.host, self.config.port, self.config.client_id) {
          Ok(l) => Some(l),
          Err(e) => {
            self.core.set_state(ConnectionState::Failed);
            return Err(e);
          }
        }
      }
      (None, _) => None,
    };
    if let Some(logger) = &logger {
      logger.set_first_request_id(self.next_id.load(Ordering::SeqCst));
    }
    let options = SocketOptions {
      connect_timeout: self.config.connect_timeout,
      disconnect_grace: self.config.disconnect_grace,
    };
    match SocketConnection::connect(&self.config.host, self.config.port, self.config.client_id, options, logger) {
      Ok(conn) => self.attach(Box::new(conn)),
      Err(e) => {
        self.core.set_state(ConnectionState::Failed);
        Err(match e {
          TwsError::ConnectionFailed(_) | TwsError::ConfigurationError(_) => e,
          other => TwsError::ConnectionFailed(other.to_string()),
        })
      }
    }
  }

  /// Attach an already-open transport (a replay, or a test double) and
  /// block until the handshake id arrives.
  pub fn connect_with(&self, conn: Box<dyn Connection>) -> Result<i32, TwsError> {
    self.begin_connect()?;
    if let Some(first) = conn.replay_first_request_id() {
      debug!("Replay pins first request id to {}", first);
      self.next_id.store(first, Ordering::SeqCst);
    }
    self.attach(conn)
  }

  fn attach(&self, mut conn: Box<dyn Connection>) -> Result<i32, TwsError> {
    self.server_version.store(conn.get_server_version(), Ordering::SeqCst);
    // Installed before the connection is shared: replays deliver
    // messages from inside this call.
    conn.set_message_handler(self.core.clone());
    *self.conn.lock() = Some(conn);
    match self.core.wait_ready(self.config.connect_timeout) {
      Ok(id) => Ok(id),
      Err(e) => {
        error!("Connect failed: {}", e);
        self.shutdown_transport();
        self.core.set_state(ConnectionState::Failed);
        Err(e)
      }
    }
  }

  pub fn state(&self) -> ConnectionState {
    self.core.status.lock().state
  }

  /// Why the session failed, if it did.
  pub fn failure(&self) -> Option<TwsError> {
    self.core.status.lock().failure.clone()
  }

  pub fn handshake_id(&self) -> Option<i32> {
    self.core.status.lock().handshake_id
  }

  pub fn server_version(&self) -> i32 {
    self.server_version.load(Ordering::SeqCst)
  }

  pub fn encoder(&self) -> Encoder {
    Encoder::new(self.server_version())
  }

  pub fn rate_limit_status(&self) -> RateLimiterStatus {
    self.core.rate_limiter.status()
  }

  /// Allocate a fresh request id. Never reused within this session.
  pub fn next_request_id(&self) -> i32 {
    self.next_id.fetch_add(1, Ordering::SeqCst)
  }

  /// Allocate an id and register it in one step.
  pub fn register_request(&self, kind: RequestKind) -> Result<Arc<PendingRequest>, TwsError> {
    self.core.registry.register(self.next_request_id(), kind)
  }

  /// Tear down a request's registry entry. Later callbacks for it are dropped.
  pub fn remove_request(&self, req_id: i32) {
    self.core.time_probes.lock().retain(|id| *id != req_id);
    self.core.rate_limiter.release_historical(req_id);
    self.core.registry.remove(req_id);
  }

  pub fn pending_requests(&self) -> usize {
    self.core.registry.len()
  }

  /// Send one request body. Failures never return here: they reach the
  /// request through the same path as gateway errors.
  pub fn issue(&self, req_id: i32, payload: &[u8]) {
    // Checked after registration: `mark_failed` flips the state before
    // `fail_all`, so a request either sees Failed here or is in the fan-out.
    if let Some(err) = self.refusal() {
      debug!("Request {} not sent: {}", req_id, err);
      self.core.fail_request(req_id, err);
      return;
    }
    let is_historical = crate::conn_log::parse_message_type_id(payload)
      == Some(OutgoingMessageType::RequestHistoricalData.into());
    if is_historical {
      if let Err(e) = self.core.rate_limiter.acquire_historical(req_id) {
        self.core.fail_request(req_id, e);
        return;
      }
    }
    if let Err(e) = self.core.rate_limiter.acquire_message() {
      self.core.fail_request(req_id, e);
      return;
    }

    let result = {
      let mut guard = self.conn.lock();
      match guard.as_mut() {
        Some(conn) if conn.is_connected() => conn.send_message_body(payload).map_err(|e| (ClientErrorCode::FailSend, e.to_string())),
        _ => Err((ClientErrorCode::NotConnected, ClientErrorCode::NotConnected.message().to_string())),
      }
    };
    if let Err((code, msg)) = result {
      warn!("Issue of request {} failed: {}", req_id, msg);
      self.core.error(req_id, code.into(), &msg, "");
    }
  }

  fn refusal(&self) -> Option<TwsError> {
    let status = self.core.status.lock();
    let not_connected = || {
      let code = ClientErrorCode::NotConnected;
      TwsError::ConnectionFatal(code.into(), code.message().to_string())
    };
    match status.state {
      ConnectionState::Failed => Some(status.failure.clone().unwrap_or_else(not_connected)),
      ConnectionState::Disconnected => Some(not_connected()),
      ConnectionState::Connecting | ConnectionState::Ready => None,
    }
  }

  /// Best-effort stop of an in-flight request. Late data for it may still
  /// arrive and is dropped once the caller removes the entry.
  pub fn cancel(&self, req_id: i32) {
    let kind = match self.core.registry.get(req_id) {
      Some(p) => p.kind(),
      None => {
        debug!("Cancel: request {} is not pending", req_id);
        return;
      }
    };
    let encoded = match kind {
      RequestKind::HistoricalWindow => self.encoder().encode_cancel_historical_data(req_id),
      RequestKind::Fundamental => self.encoder().encode_cancel_fundamental_data(req_id),
      RequestKind::Other => {
        debug!("Cancel: request {} has no wire cancellation", req_id);
        return;
      }
    };
    self.core.rate_limiter.release_historical(req_id);
    let payload = match encoded {
      Ok(p) => p,
      Err(e) => {
        warn!("Cancel: encoding failed for {}: {}", req_id, e);
        return;
      }
    };
    if self.state() != ConnectionState::Ready {
      debug!("Cancel of request {} skipped: session is {}", req_id, self.state());
      return;
    }
    let mut guard = self.conn.lock();
    match guard.as_mut() {
      Some(conn) if conn.is_connected() => {
        if let Err(e) = conn.send_message_body(&payload) {
          warn!("Cancel of request {} not sent: {}", req_id, e);
        } else {
          debug!("Cancelled request {}", req_id);
        }
      }
      _ => debug!("Cancel of request {} skipped: not connected", req_id),
    }
  }

  /// Ask the gateway for its clock. Doubles as a liveness probe.
  pub fn request_current_time(&self, timeout: Duration) -> Result<i64, TwsError> {
    let pending = self.register_request(RequestKind::Other)?;
    let req_id = pending.req_id();
    let payload = self.encoder().encode_request_current_time();
    let outcome = match payload {
      Ok(payload) => {
        self.core.time_probes.lock().push_back(req_id);
        self.issue(req_id, &payload);
        pending.wait(timeout)
      }
      Err(e) => WaitOutcome::Failed(e, Vec::new()),
    };
    self.remove_request(req_id);
    match outcome {
      WaitOutcome::Completed(frags) => match frags.first() {
        Some(Fragment::Text(t)) => t.parse::<i64>().map_err(|e| TwsError::ParseError(format!("Current time '{}': {}", t, e))),
        _ => Err(TwsError::InternalError("Current time reply carried no value".into())),
      },
      WaitOutcome::Failed(e, _) => Err(e),
      WaitOutcome::TimedOut(_) => Err(TwsError::Timeout(format!("Current time request timed out after {:?}", timeout))),
    }
  }

  fn shutdown_transport(&self) {
    let conn = self.conn.lock().take();
    if let Some(mut conn) = conn {
      if let Err(e) = conn.disconnect() {
        warn!("Error during disconnect: {}", e);
      }
    }
  }

  /// Close the connection. Pending requests fail with `NotConnected`.
  /// Safe to call repeatedly.
  pub fn disconnect(&self) {
    self.shutdown_transport();
    let was = {
      let mut status = self.core.status.lock();
      let was = status.state;
      status.state = ConnectionState::Disconnected;
      self.core.status_cond.notify_all();
      was
    };
    if was != ConnectionState::Disconnected {
      info!("Session disconnected (was {})", was);
      self.core.registry.fail_all(&TwsError::NotConnected);
    }
  }
}

impl Drop for GatewaySession {
  fn drop(&mut self) {
    self.disconnect();
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::conn_log::LogDirection;
  use crate::conn_mock::MockConnection;
  use crate::message_parser::tests::body;

  pub(crate) const SERVER_VERSION: i32 = 187;
  pub(crate) const FIRST_ID: i32 = 500;

  /// StartAPI plus the usual post-handshake chatter.
  pub(crate) fn handshake_script(client_id: i32) -> Vec<(LogDirection, Vec<u8>)> {
    vec![
      (LogDirection::Send, Encoder::new(SERVER_VERSION).encode_start_api(client_id, "").unwrap()),
      (LogDirection::Recv, body(&["15", "1", "DU1234567"])),
      (LogDirection::Recv, body(&["9", "1", "1"])),
    ]
  }

  pub(crate) fn test_config() -> SessionConfig {
    SessionConfig {
      connect_timeout: Duration::from_millis(200),
      first_request_id: Some(FIRST_ID),
      ..Default::default()
    }
  }

  pub(crate) fn replay_session(script: Vec<(LogDirection, Vec<u8>)>) -> Arc<GatewaySession> {
    let session = GatewaySession::new(test_config());
    let conn = MockConnection::from_script(SERVER_VERSION, None, script);
    session.connect_with(Box::new(conn)).unwrap();
    session
  }

  #[test]
  fn handshake_reaches_ready_once() {
    let session = replay_session(handshake_script(1));
    assert_eq!(session.state(), ConnectionState::Ready);
    assert_eq!(session.handshake_id(), Some(1));
    assert_eq!(session.server_version(), SERVER_VERSION);
    let again = MockConnection::from_script(SERVER_VERSION, None, handshake_script(1));
    assert_eq!(session.connect_with(Box::new(again)), Err(TwsError::AlreadyConnected));
  }

  #[test]
  fn missing_handshake_id_is_a_connect_error() {
    let session = GatewaySession::new(test_config());
    let script = vec![(LogDirection::Send, Encoder::new(SERVER_VERSION).encode_start_api(1, "").unwrap())];
    let conn = MockConnection::from_script(SERVER_VERSION, None, script);
    assert!(matches!(session.connect_with(Box::new(conn)), Err(TwsError::ConnectionFailed(_))));
    assert_eq!(session.state(), ConnectionState::Failed);
  }

  #[test]
  fn client_id_in_use_fails_the_handshake() {
    let session = GatewaySession::new(test_config());
    let script = vec![
      (LogDirection::Send, Encoder::new(SERVER_VERSION).encode_start_api(1, "").unwrap()),
      (LogDirection::Recv, body(&["4", "2", "-1", "326", "Unable to connect as the client id is already in use.", ""])),
    ];
    let conn = MockConnection::from_script(SERVER_VERSION, None, script);
    match session.connect_with(Box::new(conn)) {
      Err(TwsError::ConnectionFailed(msg)) => assert!(msg.contains("326")),
      other => panic!("unexpected {:?}", other),
    }
    assert_eq!(session.failure().and_then(|e| e.code()), Some(326));
  }

  #[test]
  fn request_ids_increase_and_replay_can_pin_them() {
    let session = GatewaySession::new(test_config());
    let conn = MockConnection::from_script(SERVER_VERSION, Some(900), handshake_script(1));
    session.connect_with(Box::new(conn)).unwrap();
    assert_eq!(session.next_request_id(), 900);
    assert_eq!(session.next_request_id(), 901);
    let clock = GatewaySession::new(SessionConfig::default());
    let id = clock.next_request_id();
    assert!((500..10_500).contains(&id));
  }

  #[test]
  fn current_time_probe() {
    let mut script = handshake_script(1);
    script.push((LogDirection::Send, Encoder::new(SERVER_VERSION).encode_request_current_time().unwrap()));
    script.push((LogDirection::Recv, body(&["49", "1", "1705312800"])));
    let session = replay_session(script);
    assert_eq!(session.request_current_time(Duration::from_millis(100)).unwrap(), 1705312800);
    assert_eq!(session.pending_requests(), 0);
  }

  #[test]
  fn request_fatal_stays_scoped_to_its_request() {
    let session = replay_session(handshake_script(1));
    let a = session.register_request(RequestKind::HistoricalWindow).unwrap();
    let b = session.register_request(RequestKind::HistoricalWindow).unwrap();
    session.core.error(a.req_id(), 162, "Historical Market Data Service error message:No market data permissions", "");
    session.core.error(-1, 2106, "HMDS data farm connection is OK", "");
    assert!(matches!(a.wait(Duration::from_millis(10)), WaitOutcome::Failed(TwsError::RequestFatal(162, _), _)));
    assert!(matches!(b.wait(Duration::from_millis(10)), WaitOutcome::TimedOut(_)));
    assert_eq!(session.state(), ConnectionState::Ready);
  }

  #[test]
  fn connectivity_loss_fails_every_pending_request() {
    let session = replay_session(handshake_script(1));
    let pending: Vec<_> = (0..4).map(|_| session.register_request(RequestKind::HistoricalWindow).unwrap()).collect();
    session.core.error(-1, 1100, "Connectivity between IB and Trader Workstation has been lost.", "");
    for p in &pending {
      match p.wait(Duration::from_millis(10)) {
        WaitOutcome::Failed(e, _) => assert!(e.is_connection_fatal()),
        other => panic!("unexpected {:?}", other),
      }
    }
    assert_eq!(session.state(), ConnectionState::Failed);
  }

  #[test]
  fn issue_after_disconnect_is_refused() {
    let session = replay_session(handshake_script(1));
    session.disconnect();
    session.disconnect();
    assert_eq!(session.state(), ConnectionState::Disconnected);
    let p = session.register_request(RequestKind::Other).unwrap();
    session.issue(p.req_id(), b"49\x001\x00");
    assert!(matches!(p.wait(Duration::from_millis(10)), WaitOutcome::Failed(TwsError::ConnectionFatal(504, _), _)));
    // A local disconnect is final: the 504 does not flip the state to Failed.
    assert_eq!(session.state(), ConnectionState::Disconnected);
  }

  #[test]
  fn failed_session_refuses_new_windows() {
    use crate::contract::Contract;
    use crate::contract::WhatToShow;
    use crate::data::{DurationUnit, HistoryOptions, Window};
    use crate::fetcher::fetch_window;
    use chrono::{TimeZone, Utc};

    let session = replay_session(handshake_script(1));
    session.core.error(-1, 1100, "Connectivity between IB and Trader Workstation has been lost.", "");
    assert_eq!(session.state(), ConnectionState::Failed);

    let mut spy = Contract::stock_with_exchange("SPY", "SMART", "USD");
    spy.primary_exchange = Some("ARCA".to_string());
    let window = Window::ending_at(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(), DurationUnit::Month(1));
    let trades = HistoryOptions { what_to_show: Some(WhatToShow::Trades), ..Default::default() };
    let err = fetch_window(&session, &spy, &window, &trades, Duration::from_secs(5)).unwrap_err();
    assert!(matches!(err, TwsError::ConnectionFatal(1100, _)), "got {:?}", err);
    assert_eq!(session.pending_requests(), 0);
  }

  #[test]
  fn send_mismatch_fails_the_session() {
    let session = replay_session(handshake_script(1));
    let p = session.register_request(RequestKind::Other).unwrap();
    session.issue(p.req_id(), b"49\x001\x00");
    match p.wait(Duration::from_millis(10)) {
      WaitOutcome::Failed(TwsError::ConnectionFatal(509, _), _) => {}
      other => panic!("unexpected {:?}", other),
    }
  }
}
