// twshist/src/conn_mock.rs
// Replays a session recorded by `ConnectionLogger`.
//
// Every outgoing body must equal the next recorded SEND. After a match,
// the RECV messages that followed it are fed to the handler on the
// caller's thread, before `send_message_body` returns.

use crate::base::TwsError;
use crate::conn::Connection;
use crate::conn_log::{bytes_to_center_dot_string, center_dot_string_to_bytes, parse_message_type_id, LogDirection};
use crate::handler::GatewayHandler;
use crate::message_parser::process_message;
use crate::protocol_encoder::OutgoingMessageType;

use rusqlite::{params, Connection as DbConnection};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct LoggedMessage {
  direction: LogDirection,
  message_type_name: Option<String>,
  payload: Vec<u8>,
}

pub struct MockConnection {
  server_version: i32,
  first_request_id: Option<i32>,
  messages: Vec<LoggedMessage>,
  next_index: usize,
  handler: Option<Arc<dyn GatewayHandler>>,
  connected: bool,
}

impl MockConnection {
  /// Load the session named `session_name` from a logger database.
  pub fn new<P: AsRef<Path>>(db_path: P, session_name: &str) -> Result<Self, TwsError> {
    log::info!("Replaying session '{}' from {:?}", session_name, db_path.as_ref());
    let db = DbConnection::open(db_path)
      .map_err(|e| TwsError::ConfigurationError(format!("Mock: Failed to open logger DB: {}", e)))?;

    let (session_id, server_version, first_request_id): (i64, Option<i32>, Option<i32>) = db
      .query_row(
        "SELECT session_id, server_version, first_request_id FROM sessions WHERE session_name = ?1",
        params![session_name],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
          TwsError::ConfigurationError(format!("Mock: Log session '{}' not found", session_name))
        }
        _ => TwsError::LoggingError(format!("Mock: Failed to query session '{}': {}", session_name, e)),
      })?;
    let server_version = server_version.ok_or_else(|| {
      TwsError::ConfigurationError(format!("Mock: Log session '{}' has no server version", session_name))
    })?;

    let mut stmt = db
      .prepare(
        "SELECT direction, message_type_name, payload_text FROM messages
         WHERE session_id = ?1 ORDER BY message_id ASC",
      )
      .map_err(|e| TwsError::LoggingError(format!("Mock: Failed to prepare message query: {}", e)))?;
    let rows = stmt
      .query_map(params![session_id], |row| {
        let direction: String = row.get(0)?;
        let name: Option<String> = row.get(1)?;
        let text: String = row.get(2)?;
        Ok((direction, name, text))
      })
      .map_err(|e| TwsError::LoggingError(format!("Mock: Failed to query messages: {}", e)))?;

    let mut messages = Vec::new();
    for row in rows {
      let (direction, message_type_name, text) =
        row.map_err(|e| TwsError::LoggingError(format!("Mock: Failed to read message row: {}", e)))?;
      messages.push(LoggedMessage {
        direction: LogDirection::from_str(&direction)?,
        message_type_name,
        payload: center_dot_string_to_bytes(&text),
      });
    }
    log::info!("Mock: Loaded {} messages (server version {})", messages.len(), server_version);
    Ok(Self::build(server_version, first_request_id, messages))
  }

  /// Build a replay from an in-memory script of (direction, body) pairs.
  pub fn from_script(server_version: i32, first_request_id: Option<i32>, script: Vec<(LogDirection, Vec<u8>)>) -> Self {
    let messages = script
      .into_iter()
      .map(|(direction, payload)| LoggedMessage { direction, message_type_name: None, payload })
      .collect();
    Self::build(server_version, first_request_id, messages)
  }

  fn build(server_version: i32, first_request_id: Option<i32>, messages: Vec<LoggedMessage>) -> Self {
    Self { server_version, first_request_id, messages, next_index: 0, handler: None, connected: false }
  }

  /// Messages not yet consumed.
  pub fn remaining(&self) -> usize {
    self.messages.len() - self.next_index
  }

  fn label(message: &LoggedMessage) -> String {
    message
      .message_type_name
      .clone()
      .or_else(|| parse_message_type_id(&message.payload).map(|id| id.to_string()))
      .unwrap_or_else(|| "UNKNOWN".to_string())
  }

  // Feed RECV messages to the handler until the next SEND or the end.
  fn pump(&mut self) {
    let handler = match &self.handler {
      Some(h) => h.clone(),
      None => return,
    };
    while let Some(message) = self.messages.get(self.next_index) {
      if message.direction == LogDirection::Send {
        break;
      }
      log::trace!("Mock: RECV #{} {}", self.next_index + 1, Self::label(message));
      if let Err(e) = process_message(handler.as_ref(), self.server_version, &message.payload) {
        log::error!("Mock: Error processing RECV #{}: {}", self.next_index + 1, e);
      }
      self.next_index += 1;
    }
  }
}

impl Connection for MockConnection {
  fn is_connected(&self) -> bool {
    self.connected
  }

  fn disconnect(&mut self) -> Result<(), TwsError> {
    if self.connected {
      log::info!("Mock: disconnect with {} recorded messages unconsumed", self.remaining());
    }
    self.connected = false;
    self.handler = None;
    Ok(())
  }

  fn send_message_body(&mut self, data: &[u8]) -> Result<(), TwsError> {
    if !self.connected {
      return Err(TwsError::NotConnected);
    }
    let index = self.next_index;
    let expected = self
      .messages
      .get(index)
      .ok_or_else(|| TwsError::LoggingError("Unexpected send: end of recorded session".to_string()))?;
    if expected.direction != LogDirection::Send {
      return Err(TwsError::LoggingError(format!("Unexpected send: recorded message #{} is RECV", index + 1)));
    }
    if data != expected.payload.as_slice() {
      log::error!(" > Sent:     '{}'", bytes_to_center_dot_string(data));
      log::error!(" > Expected: '{}'", bytes_to_center_dot_string(&expected.payload));
      return Err(TwsError::LoggingError(format!(
        "Sent message does not match recorded SEND #{} ({})",
        index + 1,
        Self::label(expected)
      )));
    }
    log::debug!("Mock: SEND #{} matched", index + 1);
    self.next_index += 1;
    self.pump();
    Ok(())
  }

  /// Marks the replay connected, consumes the recorded StartAPI, and
  /// delivers the messages that followed it.
  fn set_message_handler(&mut self, handler: Arc<dyn GatewayHandler>) {
    self.handler = Some(handler);
    self.connected = true;
    if self.next_index == 0 {
      let start_api = i32::from(OutgoingMessageType::StartApi);
      match self.messages.first() {
        Some(m) if m.direction == LogDirection::Send && parse_message_type_id(&m.payload) == Some(start_api) => {
          self.next_index = 1;
        }
        Some(_) => log::warn!("Mock: recording does not start with StartAPI"),
        None => log::warn!("Mock: recording is empty"),
      }
    }
    self.pump();
  }

  fn get_server_version(&self) -> i32 {
    self.server_version
  }

  fn replay_first_request_id(&self) -> Option<i32> {
    self.first_request_id
  }
}
