// twshist/src/protocol_decoder.rs
// Incoming message identifiers

use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt;

/// Message tags for the incoming messages this client understands.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum IncomingMessageType {
  ErrorMessage = 4,
  NextValidId = 9,
  ManagedAccounts = 15,
  HistoricalData = 17,
  CurrentTime = 49,
  FundamentalData = 51,
  HistoricalDataEnd = 108,
}

impl IncomingMessageType {
  pub fn name(&self) -> &'static str {
    match self {
      IncomingMessageType::ErrorMessage => "ERROR_MSG",
      IncomingMessageType::NextValidId => "NEXT_VALID_ID",
      IncomingMessageType::ManagedAccounts => "MANAGED_ACCTS",
      IncomingMessageType::HistoricalData => "HISTORICAL_DATA",
      IncomingMessageType::CurrentTime => "CURRENT_TIME",
      IncomingMessageType::FundamentalData => "FUNDAMENTAL_DATA",
      IncomingMessageType::HistoricalDataEnd => "HISTORICAL_DATA_END",
    }
  }

  /// Name for a raw message id, if known.
  pub fn name_of(id: i32) -> Option<&'static str> {
    IncomingMessageType::try_from(id).ok().map(|t| t.name())
  }
}

impl fmt::Display for IncomingMessageType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.name())
  }
}

/// Error codes the client itself raises, mirroring the gateway's numbering.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum ClientErrorCode {
  NotConnected = 504,
  BadLength = 507,
  FailSend = 509,
}

impl ClientErrorCode {
  pub fn message(&self) -> &'static str {
    match self {
      ClientErrorCode::NotConnected => "Not connected",
      ClientErrorCode::BadLength => "Bad message length / connection closed",
      ClientErrorCode::FailSend => "Failed to send message",
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn known_and_unknown_ids() {
    assert_eq!(IncomingMessageType::try_from(17).ok(), Some(IncomingMessageType::HistoricalData));
    assert_eq!(IncomingMessageType::name_of(108), Some("HISTORICAL_DATA_END"));
    assert_eq!(IncomingMessageType::name_of(1), None);
    assert_eq!(i32::from(ClientErrorCode::FailSend), 509);
  }
}
