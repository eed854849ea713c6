// twshist/src/message_parser.rs
//
// Parse the messages and dispatch to the appropriate handler.
use crate::base::TwsError;
use crate::handler::GatewayHandler;
use crate::protocol_dec_parser::FieldParser;
use crate::protocol_decoder::IncomingMessageType;

use crate::parser_client::*;
use crate::parser_data_fin::*;
use crate::parser_data_market::*;

/// Read the leading message id of a framed body.
pub fn peek_message_type(data: &[u8]) -> Result<i32, TwsError> {
  FieldParser::new(data).read_int()
}

/// Process a message based on its type. This is the entry point for message handling.
/// Messages this client has no use for are logged and skipped.
pub fn process_message(handler: &dyn GatewayHandler, server_version: i32, data: &[u8]) -> Result<(), TwsError> {
  let mut parser = FieldParser::new(data);
  let msg_type = parser.read_int()?;

  let known = match IncomingMessageType::try_from(msg_type) {
    Ok(t) => t,
    Err(_) => {
      log::warn!("Unhandled message type: {}", msg_type);
      return Ok(());
    }
  };

  match known {
    IncomingMessageType::ErrorMessage => process_error_message(handler, &mut parser, server_version)?,
    IncomingMessageType::NextValidId => process_next_valid_id(handler, &mut parser)?,
    IncomingMessageType::ManagedAccounts => process_managed_accounts(handler, &mut parser)?,
    IncomingMessageType::HistoricalData => process_historical_data(handler, &mut parser, server_version)?,
    IncomingMessageType::CurrentTime => process_current_time(handler, &mut parser)?,
    IncomingMessageType::FundamentalData => process_fundamental_data(handler, &mut parser)?,
    IncomingMessageType::HistoricalDataEnd => process_historical_data_end(handler, &mut parser)?,
  }

  Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::data::RawBar;
  use parking_lot::Mutex;

  #[derive(Debug, Clone, PartialEq)]
  pub(crate) enum Event {
    NextValidId(i32),
    Accounts(String),
    Error(i32, i32, String),
    Time(i64),
    Bar(i32, RawBar),
    BarsEnd(i32, String, String),
    Fundamental(i32, String),
    Closed,
  }

  #[derive(Default)]
  pub(crate) struct RecordingHandler {
    pub events: Mutex<Vec<Event>>,
  }

  impl RecordingHandler {
    pub fn take(&self) -> Vec<Event> {
      std::mem::take(&mut *self.events.lock())
    }
  }

  impl GatewayHandler for RecordingHandler {
    fn next_valid_id(&self, id: i32) { self.events.lock().push(Event::NextValidId(id)); }
    fn managed_accounts(&self, accounts: &str) { self.events.lock().push(Event::Accounts(accounts.to_string())); }
    fn error(&self, id: i32, code: i32, msg: &str, _json: &str) {
      self.events.lock().push(Event::Error(id, code, msg.to_string()));
    }
    fn current_time(&self, t: i64) { self.events.lock().push(Event::Time(t)); }
    fn historical_data(&self, req_id: i32, bar: RawBar) { self.events.lock().push(Event::Bar(req_id, bar)); }
    fn historical_data_end(&self, req_id: i32, start: &str, end: &str) {
      self.events.lock().push(Event::BarsEnd(req_id, start.to_string(), end.to_string()));
    }
    fn fundamental_data(&self, req_id: i32, data: &str) {
      self.events.lock().push(Event::Fundamental(req_id, data.to_string()));
    }
    fn connection_closed(&self) { self.events.lock().push(Event::Closed); }
  }

  pub(crate) fn body(fields: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    for f in fields {
      out.extend_from_slice(f.as_bytes());
      out.push(0);
    }
    out
  }

  #[test]
  fn error_layout_follows_server_version() {
    let h = RecordingHandler::default();
    // Pre-ERROR_TIME: version field, then id/code/msg/json.
    process_message(&h, 187, &body(&["4", "2", "7", "162", "pacing violation", ""])).unwrap();
    // ERROR_TIME and later: no version, trailing timestamp.
    process_message(&h, 194, &body(&["4", "-1", "2104", "farm ok", "", "1700000000000"])).unwrap();
    assert_eq!(h.take(), vec![
      Event::Error(7, 162, "pacing violation".into()),
      Event::Error(-1, 2104, "farm ok".into()),
    ]);
  }

  #[test]
  fn historical_bars_then_end_message() {
    let h = RecordingHandler::default();
    let msg = body(&[
      "17", "5", "2",
      "20240115", "10", "11", "9.5", "10.5", "1200", "10.2", "30",
      "20240116", "10.5", "12", "10", "11.5", "", "", "0",
    ]);
    process_message(&h, 187, &msg).unwrap();
    process_message(&h, 187, &body(&["108", "5", "20240101 00:00:00", "20240117 00:00:00"])).unwrap();
    let events = h.take();
    assert_eq!(events.len(), 3);
    match &events[0] {
      Event::Bar(5, bar) => {
        assert_eq!(bar.date, "20240115");
        assert_eq!(bar.volume, 1200.0);
        assert_eq!(bar.count, 30);
      }
      other => panic!("unexpected {:?}", other),
    }
    match &events[1] {
      Event::Bar(5, bar) => assert_eq!(bar.volume, 0.0),
      other => panic!("unexpected {:?}", other),
    }
    assert_eq!(events[2], Event::BarsEnd(5, "20240101 00:00:00".into(), "20240117 00:00:00".into()));
  }

  #[test]
  fn old_servers_bundle_the_end_marker() {
    let h = RecordingHandler::default();
    let msg = body(&[
      "17", "3", "9", "20240101", "20240102", "1",
      "20240101", "1", "2", "0.5", "1.5", "100", "1.1", "false", "4",
    ]);
    process_message(&h, 120, &msg).unwrap();
    let events = h.take();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], Event::Bar(9, _)));
    assert_eq!(events[1], Event::BarsEnd(9, "20240101".into(), "20240102".into()));
  }

  #[test]
  fn session_messages_and_unknown_ids() {
    let h = RecordingHandler::default();
    process_message(&h, 187, &body(&["9", "1", "4200"])).unwrap();
    process_message(&h, 187, &body(&["15", "1", "DU123,DU456"])).unwrap();
    process_message(&h, 187, &body(&["49", "1", "1705312800"])).unwrap();
    process_message(&h, 187, &body(&["51", "1", "12", "<xml/>"])).unwrap();
    process_message(&h, 187, &body(&["1", "6", "1", "1", "1.0"])).unwrap();
    assert_eq!(h.take(), vec![
      Event::NextValidId(4200),
      Event::Accounts("DU123,DU456".into()),
      Event::Time(1705312800),
      Event::Fundamental(12, "<xml/>".into()),
    ]);
    assert_eq!(peek_message_type(&body(&["108", "1"])).unwrap(), 108);
  }

  #[test]
  fn truncated_message_is_an_error() {
    let h = RecordingHandler::default();
    assert!(process_message(&h, 187, &body(&["17", "5", "1", "20240115", "10"])).is_err());
  }
}
