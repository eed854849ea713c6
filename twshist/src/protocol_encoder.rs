// twshist/src/protocol_encoder.rs
// Encoder for the outgoing TWS API messages this client sends

use crate::base::TwsError;
use crate::contract::{Contract, WhatToShow};
use crate::data::{HistoryOptions, Window};
use crate::min_server_ver::min_server_ver;
use chrono::{DateTime, Utc};
use log::{debug, trace, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::io::{Cursor, Write};

/// Message tags for outgoing messages
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum OutgoingMessageType {
  RequestHistoricalData = 20,
  CancelHistoricalData = 25,
  RequestCurrentTime = 49,
  RequestFundamentalData = 52,
  CancelFundamentalData = 53,
  StartApi = 71,
}

impl OutgoingMessageType {
  pub fn name(&self) -> &'static str {
    match self {
      OutgoingMessageType::RequestHistoricalData => "REQ_HISTORICAL_DATA",
      OutgoingMessageType::CancelHistoricalData => "CANCEL_HISTORICAL_DATA",
      OutgoingMessageType::RequestCurrentTime => "REQ_CURRENT_TIME",
      OutgoingMessageType::RequestFundamentalData => "REQ_FUNDAMENTAL_DATA",
      OutgoingMessageType::CancelFundamentalData => "CANCEL_FUNDAMENTAL_DATA",
      OutgoingMessageType::StartApi => "START_API",
    }
  }
}

/// Identifies an outgoing message type from its raw body prefix.
///
/// Bodies start with the numeric type id followed by a NUL. Returns
/// `None` when the id is missing, unparseable or unknown.
pub fn identify_outgoing_type(msg_data: &[u8]) -> Option<&'static str> {
  if msg_data.starts_with(b"API\0") {
    return Some("H1_CLIENT_VERSION");
  }
  let end_pos = msg_data.iter().position(|&b| b == 0)?;
  let type_id: i32 = std::str::from_utf8(&msg_data[..end_pos]).ok()?.parse().ok()?;
  OutgoingMessageType::try_from(type_id).ok().map(|t| t.name())
}

/// Body of the H1 client-version announcement (without the `API\0` prefix).
pub fn client_version_string() -> String {
  format!("v{}..{}", min_server_ver::MIN_CLIENT_VERSION, min_server_ver::MAX_SUPPORTED_VERSION)
}

pub struct Encoder {
  server_version: i32,
}

impl Encoder {
  /// Create a new message encoder for a specific server version.
  pub fn new(server_version: i32) -> Self {
    Self { server_version }
  }

  fn start_encoding(&self, msg_type: OutgoingMessageType) -> Result<Cursor<Vec<u8>>, TwsError> {
    let mut cursor = Cursor::new(Vec::new());
    self.write_int_to_cursor(&mut cursor, msg_type.into())?;
    Ok(cursor)
  }

  fn finish_encoding(&self, cursor: Cursor<Vec<u8>>) -> Vec<u8> {
    cursor.into_inner()
  }

  fn write_str_to_cursor(&self, cursor: &mut Cursor<Vec<u8>>, s: &str) -> Result<(), TwsError> {
    trace!("Encoding string: {}", s);
    cursor.write_all(s.as_bytes()).map_err(|e| TwsError::InternalError(format!("Buffer write failed: {}", e)))?;
    cursor.write_all(&[0]).map_err(|e| TwsError::InternalError(format!("Buffer write failed: {}", e)))?;
    Ok(())
  }

  fn write_optional_str_to_cursor(&self, cursor: &mut Cursor<Vec<u8>>, s: Option<&str>) -> Result<(), TwsError> {
    self.write_str_to_cursor(cursor, s.unwrap_or(""))
  }

  fn write_int_to_cursor(&self, cursor: &mut Cursor<Vec<u8>>, val: i32) -> Result<(), TwsError> {
    self.write_str_to_cursor(cursor, &val.to_string())
  }

  fn write_double_to_cursor(&self, cursor: &mut Cursor<Vec<u8>>, val: f64) -> Result<(), TwsError> {
    if !val.is_finite() {
      warn!("Attempting to encode non-finite double value. Sending 0.0.");
      return self.write_str_to_cursor(cursor, "0.0");
    }
    self.write_str_to_cursor(cursor, &val.to_string())
  }

  fn write_bool_to_cursor(&self, cursor: &mut Cursor<Vec<u8>>, val: bool) -> Result<(), TwsError> {
    self.write_int_to_cursor(cursor, if val { 1 } else { 0 })
  }

  // TWS accepts "YYYYMMDD-HH:MM:SS" in UTC; an empty end means "now".
  fn format_end_date_time(&self, dt: Option<DateTime<Utc>>) -> String {
    dt.map(|d| format!("{} UTC", d.format("%Y%m%d-%H:%M:%S")))
      .unwrap_or_default()
  }

  /// StartAPI (H3 of the handshake).
  pub fn encode_start_api(&self, client_id: i32, optional_capabilities: &str) -> Result<Vec<u8>, TwsError> {
    debug!("Encoding StartAPI: ClientID={}", client_id);
    let mut cursor = self.start_encoding(OutgoingMessageType::StartApi)?;
    self.write_int_to_cursor(&mut cursor, 2)?; // Version
    self.write_int_to_cursor(&mut cursor, client_id)?;
    self.write_str_to_cursor(&mut cursor, optional_capabilities)?;
    Ok(self.finish_encoding(cursor))
  }

  pub fn encode_request_current_time(&self) -> Result<Vec<u8>, TwsError> {
    debug!("Encoding request current time message");
    let mut cursor = self.start_encoding(OutgoingMessageType::RequestCurrentTime)?;
    self.write_int_to_cursor(&mut cursor, 1)?; // Version
    Ok(self.finish_encoding(cursor))
  }

  /// Request one bounded window of bars. `what_to_show` must already be
  /// resolved; `options.what_to_show` is ignored here.
  pub fn encode_request_historical_data(
    &self,
    req_id: i32,
    contract: &Contract,
    window: &Window,
    options: &HistoryOptions,
    what_to_show: WhatToShow,
  ) -> Result<Vec<u8>, TwsError> {
    debug!("Encoding request historical data: ReqID={}, Symbol={}, Window={}", req_id, contract.symbol, window);
    let mut cursor = self.start_encoding(OutgoingMessageType::RequestHistoricalData)?;

    if self.server_version < min_server_ver::SYNT_REALTIME_BARS {
      self.write_int_to_cursor(&mut cursor, 6)?; // Version
    }
    self.write_int_to_cursor(&mut cursor, req_id)?;

    if self.server_version >= min_server_ver::TRADING_CLASS {
      self.write_int_to_cursor(&mut cursor, contract.con_id)?;
    }
    self.write_str_to_cursor(&mut cursor, &contract.symbol)?;
    self.write_str_to_cursor(&mut cursor, &contract.sec_type.to_string())?;
    self.write_optional_str_to_cursor(&mut cursor, contract.last_trade_date_or_contract_month.as_deref())?;
    self.write_double_to_cursor(&mut cursor, contract.strike.unwrap_or(0.0))?;
    self.write_str_to_cursor(&mut cursor, "")?; // Right
    self.write_optional_str_to_cursor(&mut cursor, contract.multiplier.as_deref())?;
    self.write_str_to_cursor(&mut cursor, &contract.exchange)?;
    self.write_optional_str_to_cursor(&mut cursor, contract.primary_exchange.as_deref())?;
    self.write_str_to_cursor(&mut cursor, &contract.currency)?;
    self.write_optional_str_to_cursor(&mut cursor, contract.local_symbol.as_deref())?;
    if self.server_version >= min_server_ver::TRADING_CLASS {
      self.write_optional_str_to_cursor(&mut cursor, contract.trading_class.as_deref())?;
    }
    self.write_bool_to_cursor(&mut cursor, contract.include_expired)?;

    self.write_str_to_cursor(&mut cursor, &self.format_end_date_time(window.end))?;
    self.write_str_to_cursor(&mut cursor, &options.bar_size.to_string())?;
    self.write_str_to_cursor(&mut cursor, &window.duration.to_string())?;
    self.write_bool_to_cursor(&mut cursor, options.use_rth)?;
    self.write_str_to_cursor(&mut cursor, &what_to_show.to_string())?;
    self.write_int_to_cursor(&mut cursor, options.date_format.wire_value())?;

    if self.server_version >= min_server_ver::SYNT_REALTIME_BARS {
      self.write_bool_to_cursor(&mut cursor, false)?; // keepUpToDate
    }
    if self.server_version >= min_server_ver::LINKING {
      self.write_str_to_cursor(&mut cursor, "")?; // chartOptions
    }

    Ok(self.finish_encoding(cursor))
  }

  pub fn encode_cancel_historical_data(&self, req_id: i32) -> Result<Vec<u8>, TwsError> {
    debug!("Encoding cancel historical data: ReqID={}", req_id);
    let mut cursor = self.start_encoding(OutgoingMessageType::CancelHistoricalData)?;
    self.write_int_to_cursor(&mut cursor, 1)?; // Version
    self.write_int_to_cursor(&mut cursor, req_id)?;
    Ok(self.finish_encoding(cursor))
  }

  pub fn encode_request_fundamental_data(&self, req_id: i32, contract: &Contract, report_type: &str) -> Result<Vec<u8>, TwsError> {
    debug!("Encoding request fundamental data: ReqID={}, Symbol={}, Report={}", req_id, contract.symbol, report_type);
    if self.server_version < min_server_ver::FUNDAMENTAL_DATA {
      return Err(TwsError::InvalidParameter("Server version too low for fundamental data".to_string()));
    }
    let mut cursor = self.start_encoding(OutgoingMessageType::RequestFundamentalData)?;
    self.write_int_to_cursor(&mut cursor, 2)?; // Version
    self.write_int_to_cursor(&mut cursor, req_id)?;
    if self.server_version >= min_server_ver::TRADING_CLASS {
      self.write_int_to_cursor(&mut cursor, contract.con_id)?;
    }
    self.write_str_to_cursor(&mut cursor, &contract.symbol)?;
    self.write_str_to_cursor(&mut cursor, &contract.sec_type.to_string())?;
    self.write_str_to_cursor(&mut cursor, &contract.exchange)?;
    self.write_optional_str_to_cursor(&mut cursor, contract.primary_exchange.as_deref())?;
    self.write_str_to_cursor(&mut cursor, &contract.currency)?;
    self.write_optional_str_to_cursor(&mut cursor, contract.local_symbol.as_deref())?;
    self.write_str_to_cursor(&mut cursor, report_type)?;
    if self.server_version >= min_server_ver::LINKING {
      self.write_int_to_cursor(&mut cursor, 0)?; // Option count
      self.write_str_to_cursor(&mut cursor, "")?; // Options
    }
    Ok(self.finish_encoding(cursor))
  }

  pub fn encode_cancel_fundamental_data(&self, req_id: i32) -> Result<Vec<u8>, TwsError> {
    debug!("Encoding cancel fundamental data: ReqID={}", req_id);
    let mut cursor = self.start_encoding(OutgoingMessageType::CancelFundamentalData)?;
    self.write_int_to_cursor(&mut cursor, 1)?; // Version
    self.write_int_to_cursor(&mut cursor, req_id)?;
    Ok(self.finish_encoding(cursor))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::contract::BarSize;
  use crate::data::DurationUnit;
  use chrono::TimeZone;

  fn fields(body: &[u8]) -> Vec<String> {
    let mut v: Vec<String> = body.split(|&b| b == 0).map(|s| String::from_utf8_lossy(s).into_owned()).collect();
    assert_eq!(v.pop().as_deref(), Some(""), "body must end with NUL");
    v
  }

  #[test]
  fn historical_request_on_modern_server() {
    let enc = Encoder::new(187);
    let mut contract = Contract::stock("AAPL");
    contract.primary_exchange = Some("NASDAQ".to_string());
    let end = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
    let window = Window::ending_at(end, DurationUnit::Month(1));
    let body = enc.encode_request_historical_data(
      612, &contract, &window, &HistoryOptions::default(), WhatToShow::Trades,
    ).unwrap();
    assert_eq!(fields(&body), vec![
      "20", "612", "0", "AAPL", "STK", "", "0", "", "", "SMART", "NASDAQ", "USD", "", "", "0",
      "20240201-00:00:00 UTC", "1 day", "1 M", "1", "TRADES", "1", "0", "",
    ]);
  }

  #[test]
  fn historical_request_on_old_server_carries_version() {
    let enc = Encoder::new(100);
    let window = Window::ending_now(DurationUnit::Year(2));
    let options = HistoryOptions { bar_size: BarSize::OneHour, use_rth: false, ..Default::default() };
    let f = fields(&enc.encode_request_historical_data(
      7, &Contract::forex("EUR", "USD"), &window, &options, WhatToShow::Midpoint,
    ).unwrap());
    assert_eq!(&f[..3], &["20", "6", "7"]);
    assert_eq!(&f[f.len() - 8..], &["0", "", "1 hour", "2 Y", "0", "MIDPOINT", "1", ""][..]);
  }

  #[test]
  fn cancel_and_start_api() {
    let enc = Encoder::new(187);
    assert_eq!(enc.encode_cancel_historical_data(42).unwrap(), b"25\01\042\0".to_vec());
    assert_eq!(enc.encode_start_api(101, "").unwrap(), b"71\02\0101\0\0".to_vec());
    assert_eq!(enc.encode_request_current_time().unwrap(), b"49\01\0".to_vec());
  }

  #[test]
  fn fundamental_request_layout() {
    let enc = Encoder::new(187);
    let f = fields(&enc.encode_request_fundamental_data(9, &Contract::stock("IBM"), "ReportSnapshot").unwrap());
    assert_eq!(f, vec!["52", "2", "9", "0", "IBM", "STK", "SMART", "", "USD", "", "ReportSnapshot", "0", ""]);
  }

  #[test]
  fn identifies_outgoing_messages() {
    assert_eq!(identify_outgoing_type(b"20\0612\0"), Some("REQ_HISTORICAL_DATA"));
    assert_eq!(identify_outgoing_type(b"API\0\0\0\0\x09v100..187"), Some("H1_CLIENT_VERSION"));
    assert_eq!(identify_outgoing_type(b"999\0"), None);
    assert_eq!(identify_outgoing_type(b"abc"), None);
    assert_eq!(client_version_string(), "v100..187");
  }
}
