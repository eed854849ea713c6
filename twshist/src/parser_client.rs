// twshist/src/parser_client.rs
// Session-level messages: errors, handshake id, accounts, time.

use crate::base::TwsError;
use crate::handler::GatewayHandler;
use crate::min_server_ver::min_server_ver;
use crate::protocol_dec_parser::FieldParser;
use log::debug;

/// Process error message (Type 4)
pub fn process_error_message(handler: &dyn GatewayHandler, parser: &mut FieldParser, server_version: i32) -> Result<(), TwsError> {
  if server_version < min_server_ver::ERROR_TIME {
    let version = parser.read_int()?;
    if version < 2 {
      // Very old format, just a single message string
      let error_msg = parser.read_string()?;
      handler.error(-1, 0, &error_msg, "");
      return Ok(());
    }
  }

  let id = parser.read_int()?;
  let error_code = parser.read_int()?;
  let error_msg = parser.read_string()?;
  let mut advanced_order_reject_json = String::new();
  if server_version >= min_server_ver::ADVANCED_ORDER_REJECT {
    advanced_order_reject_json = parser.read_string()?;
  }
  if server_version >= min_server_ver::ERROR_TIME {
    let error_time = parser.read_i64()?;
    debug!("Error time: {}", error_time);
  }

  handler.error(id, error_code, &error_msg, &advanced_order_reject_json);
  Ok(())
}

/// Process next valid id message (Type 9)
pub fn process_next_valid_id(handler: &dyn GatewayHandler, parser: &mut FieldParser) -> Result<(), TwsError> {
  let _version = parser.read_int()?;
  let id = parser.read_int()?;
  debug!("Parsed Next valid ID: {}", id);
  handler.next_valid_id(id);
  Ok(())
}

/// Process managed accounts message (Type 15)
pub fn process_managed_accounts(handler: &dyn GatewayHandler, parser: &mut FieldParser) -> Result<(), TwsError> {
  let _version = parser.read_int()?;
  let accounts = parser.read_string()?;
  handler.managed_accounts(&accounts);
  Ok(())
}

/// Process current time message (Type 49)
pub fn process_current_time(handler: &dyn GatewayHandler, parser: &mut FieldParser) -> Result<(), TwsError> {
  let _version = parser.read_int()?;
  let time_unix = parser.read_i64()?;
  handler.current_time(time_unix);
  Ok(())
}
