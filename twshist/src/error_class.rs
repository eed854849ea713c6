// twshist/src/error_class.rs
// Static classification of gateway error codes.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;

/// What an error callback means for pending requests and the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
  /// Routine status; never terminates a request.
  Informational,
  /// Terminates only the request it names.
  RequestFatal,
  /// Terminates every pending request and fails the session.
  ConnectionFatal,
}

impl fmt::Display for ErrorClass {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ErrorClass::Informational => "informational",
      ErrorClass::RequestFatal => "request-fatal",
      ErrorClass::ConnectionFatal => "connection-fatal",
    };
    write!(f, "{}", s)
  }
}

const CONNECTION_FATAL_CODES: &[i32] = &[
  326,  // client id already in use
  502,  // couldn't connect to TWS
  504,  // not connected
  507,  // bad message length / socket EOF
  509,  // exception caught while sending
  522,
  1100, // connectivity between IB and TWS lost
  1101, // connectivity restored, data lost
  1300, // socket port reset
  2105, // HMDS data farm connection broken
  2110, // connectivity between TWS and server broken
  2150,
  2157, // sec-def data farm connection broken
];

const REQUEST_FATAL_CODES: &[i32] = &[
  100, 101, 102, 103, 110,
  162, // historical market data service error (includes "no data" and pacing violations)
  165,
  200, // no security definition found
  203, 300, 309, 317, 320, 321, 322,
  325, // fundamental data subscription
  354, // not subscribed
  366, 388, 400, 404, 430, 501, 503, 505,
  10089, 10090, 10168, 10187, 10197, 10299,
];

const INFORMATIONAL_CODES: &[i32] = &[
  1102, // connectivity restored, data maintained
  2100, 2101,
  2103, // market data farm connection broken (auto-reconnects)
  2104, // market data farm connection OK
  2106, // HMDS data farm connection OK
  2107, // HMDS data farm connection inactive
  2108, // market data farm connection inactive
  2119, // market data farm is connecting
  2158, // sec-def data farm connection OK
  2168, 2169, 2174, 2176,
  10167, // delayed market data displayed
];

static ERROR_TABLE: Lazy<HashMap<i32, ErrorClass>> = Lazy::new(|| {
  let mut m = HashMap::new();
  for &code in REQUEST_FATAL_CODES {
    m.insert(code, ErrorClass::RequestFatal);
  }
  for &code in INFORMATIONAL_CODES {
    m.insert(code, ErrorClass::Informational);
  }
  for &code in CONNECTION_FATAL_CODES {
    m.insert(code, ErrorClass::ConnectionFatal);
  }
  m
});

/// Classify a gateway error code.
///
/// `is_general` is true when the callback carried no request id (the
/// gateway sends -1 for connection-scoped notices). A request-fatal code
/// that names no request cannot terminate anything and is reported as
/// informational.
pub fn classify(code: i32, is_general: bool) -> ErrorClass {
  match ERROR_TABLE.get(&code) {
    Some(ErrorClass::ConnectionFatal) => ErrorClass::ConnectionFatal,
    Some(ErrorClass::Informational) => ErrorClass::Informational,
    Some(ErrorClass::RequestFatal) if is_general => ErrorClass::Informational,
    Some(ErrorClass::RequestFatal) => ErrorClass::RequestFatal,
    None if (2000..3000).contains(&code) => ErrorClass::Informational,
    None if is_general => ErrorClass::Informational,
    None => ErrorClass::RequestFatal,
  }
}

/// True when the request id on an error callback marks a general notice.
pub fn is_general_id(id: i32) -> bool {
  id <= 0
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn farm_status_is_informational() {
    for code in [2104, 2106, 2107, 2158, 2103, 2119] {
      assert_eq!(classify(code, true), ErrorClass::Informational, "code {}", code);
      assert_eq!(classify(code, false), ErrorClass::Informational, "code {}", code);
    }
  }

  #[test]
  fn connectivity_loss_is_connection_fatal_regardless_of_scope() {
    for code in [502, 504, 1100, 1300, 2110, 326] {
      assert_eq!(classify(code, true), ErrorClass::ConnectionFatal, "code {}", code);
      assert_eq!(classify(code, false), ErrorClass::ConnectionFatal, "code {}", code);
    }
  }

  #[test]
  fn request_codes_need_a_request() {
    assert_eq!(classify(200, false), ErrorClass::RequestFatal);
    assert_eq!(classify(354, false), ErrorClass::RequestFatal);
    assert_eq!(classify(162, false), ErrorClass::RequestFatal);
    assert_eq!(classify(200, true), ErrorClass::Informational);
  }

  #[test]
  fn unknown_codes_fall_back_by_range_and_scope() {
    assert_eq!(classify(2999, false), ErrorClass::Informational);
    assert_eq!(classify(777, false), ErrorClass::RequestFatal);
    assert_eq!(classify(777, true), ErrorClass::Informational);
  }

  #[test]
  fn general_marker() {
    assert!(is_general_id(-1));
    assert!(is_general_id(0));
    assert!(!is_general_id(501));
  }
}
