// twshist/src/conn_log.rs
// Records a live session's traffic into sqlite so it can be replayed by
// `MockConnection`.

use crate::base::TwsError;
use crate::protocol_decoder::IncomingMessageType;
use crate::protocol_encoder;

use parking_lot::Mutex;
use rusqlite::{params, Connection as DbConnection};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Stored in place of NUL so payloads stay readable in a sqlite shell.
pub const CENTER_DOT: char = '\u{00B7}';

pub fn bytes_to_center_dot_string(bytes: &[u8]) -> String {
  let mut text = String::with_capacity(bytes.len());
  for chunk in bytes.split(|&b| b == 0).enumerate() {
    if chunk.0 > 0 {
      text.push(CENTER_DOT);
    }
    text.push_str(&String::from_utf8_lossy(chunk.1));
  }
  text
}

pub fn center_dot_string_to_bytes(s: &str) -> Vec<u8> {
  let mut bytes = Vec::with_capacity(s.len());
  for (i, part) in s.split(CENTER_DOT).enumerate() {
    if i > 0 {
      bytes.push(0);
    }
    bytes.extend_from_slice(part.as_bytes());
  }
  bytes
}

/// Leading message id of a payload, if it has one.
pub fn parse_message_type_id(payload: &[u8]) -> Option<i32> {
  let end = payload.iter().position(|&b| b == 0)?;
  std::str::from_utf8(&payload[..end]).ok()?.parse::<i32>().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDirection {
  Send,
  Recv,
}

impl fmt::Display for LogDirection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      LogDirection::Send => write!(f, "SEND"),
      LogDirection::Recv => write!(f, "RECV"),
    }
  }
}

impl FromStr for LogDirection {
  type Err = TwsError;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "SEND" => Ok(LogDirection::Send),
      "RECV" => Ok(LogDirection::Recv),
      _ => Err(TwsError::ParseError(format!("Invalid log direction: {}", s))),
    }
  }
}

struct ConnectionLoggerInner {
  db: DbConnection,
  session_id: i64,
  started: Instant,
}

/// Cheap to clone; clones share one database handle.
#[derive(Clone)]
pub struct ConnectionLogger {
  inner: Arc<Mutex<ConnectionLoggerInner>>,
}

impl ConnectionLogger {
  /// Opens (or creates) the database and starts a session named
  /// `session_name`, replacing any earlier session of that name.
  pub fn new<P: AsRef<Path>>(
    db_path: P,
    session_name: &str,
    host: &str,
    port: u16,
    client_id: i32,
  ) -> Result<Self, TwsError> {
    log::info!("Recording session '{}' to {:?}", session_name, db_path.as_ref());
    let mut db = DbConnection::open(db_path)
      .map_err(|e| TwsError::ConfigurationError(format!("Failed to open logger database: {}", e)))?;
    db.pragma_update(None, "journal_mode", "WAL")
      .map_err(|e| TwsError::ConfigurationError(format!("Failed to set WAL mode: {}", e)))?;
    db.execute_batch("PRAGMA foreign_keys = ON;")
      .map_err(|e| TwsError::ConfigurationError(format!("Failed to enable foreign keys: {}", e)))?;
    Self::create_tables(&db)?;

    let start_time_unix_ms = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map_err(|e| TwsError::InternalError(format!("System time error: {}", e)))?
      .as_millis() as i64;

    let tx = db.transaction()
      .map_err(|e| TwsError::LoggingError(format!("Failed to start logger transaction: {}", e)))?;
    let deleted = tx.execute("DELETE FROM sessions WHERE session_name = ?1", params![session_name])
      .map_err(|e| TwsError::LoggingError(format!("Failed to delete previous session '{}': {}", session_name, e)))?;
    if deleted > 0 {
      log::warn!("Replaced {} previous log session(s) named '{}'", deleted, session_name);
    }
    tx.execute(
      "INSERT INTO sessions (session_name, start_time_unix_ms, host, port, client_id) VALUES (?1, ?2, ?3, ?4, ?5)",
      params![session_name, start_time_unix_ms, host, port, client_id],
    ).map_err(|e| TwsError::LoggingError(format!("Failed to insert session '{}': {}", session_name, e)))?;
    let session_id = tx.last_insert_rowid();
    tx.commit()
      .map_err(|e| TwsError::LoggingError(format!("Failed to commit logger transaction: {}", e)))?;

    log::debug!("Logger session id {} for '{}'", session_id, session_name);
    Ok(Self {
      inner: Arc::new(Mutex::new(ConnectionLoggerInner { db, session_id, started: Instant::now() })),
    })
  }

  fn create_tables(db: &DbConnection) -> Result<(), TwsError> {
    db.execute_batch(
      "BEGIN;
       CREATE TABLE IF NOT EXISTS sessions (
           session_id          INTEGER PRIMARY KEY AUTOINCREMENT,
           session_name        TEXT NOT NULL UNIQUE,
           start_time_unix_ms  INTEGER NOT NULL,
           host                TEXT NOT NULL,
           port                INTEGER NOT NULL,
           client_id           INTEGER NOT NULL,
           server_version      INTEGER NULL,
           first_request_id    INTEGER NULL
       );
       CREATE TABLE IF NOT EXISTS messages (
           message_id            INTEGER PRIMARY KEY AUTOINCREMENT,
           session_id            INTEGER NOT NULL,
           direction             TEXT NOT NULL CHECK(direction IN ('SEND', 'RECV')),
           relative_timestamp_ms REAL NOT NULL,
           message_type_id       INTEGER NULL,
           message_type_name     TEXT NULL,
           payload_text          TEXT NOT NULL,
           FOREIGN KEY (session_id) REFERENCES sessions(session_id) ON DELETE CASCADE
       );
       CREATE INDEX IF NOT EXISTS idx_messages_session ON messages (session_id, message_id);
       COMMIT;"
    ).map_err(|e| TwsError::ConfigurationError(format!("Failed to create logger tables: {}", e)))
  }

  fn update_session_column(&self, column: &str, value: i32) {
    let guard = self.inner.lock();
    let sql = format!("UPDATE sessions SET {} = ?1 WHERE session_id = ?2", column);
    if let Err(e) = guard.db.execute(&sql, params![value, guard.session_id]) {
      log::error!("Failed to record {} for logger session: {}", column, e);
    }
  }

  /// Replay needs the negotiated version to decode version-gated fields.
  pub fn set_server_version(&self, server_version: i32) {
    self.update_session_column("server_version", server_version);
  }

  /// Replay must allocate the same request ids to produce matching sends.
  pub fn set_first_request_id(&self, first_request_id: i32) {
    self.update_session_column("first_request_id", first_request_id);
  }

  pub fn log_message(&self, direction: LogDirection, payload: &[u8]) {
    let message_type_id = parse_message_type_id(payload);
    let message_type_name = match direction {
      LogDirection::Send => protocol_encoder::identify_outgoing_type(payload),
      LogDirection::Recv => message_type_id.and_then(IncomingMessageType::name_of),
    };
    let payload_text = bytes_to_center_dot_string(payload);

    let guard = self.inner.lock();
    let relative_ms = guard.started.elapsed().as_secs_f64() * 1000.0;
    match guard.db.execute(
      "INSERT INTO messages (session_id, direction, relative_timestamp_ms, message_type_id, message_type_name, payload_text)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
      params![guard.session_id, direction.to_string(), relative_ms, message_type_id, message_type_name, payload_text],
    ) {
      Ok(_) => log::trace!(
        "Logged {} {} at {:.3}ms ({} bytes)",
        direction, message_type_name.unwrap_or("UNKNOWN"), relative_ms, payload.len()
      ),
      Err(e) => log::error!("Failed to log message to database: {}", e),
    }
  }
}
