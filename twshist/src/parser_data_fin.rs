// twshist/src/parser_data_fin.rs
// Fundamental data messages.

use crate::base::TwsError;
use crate::handler::GatewayHandler;
use crate::protocol_dec_parser::FieldParser;
use log::debug;

/// Process fundamental data message (Type 51)
pub fn process_fundamental_data(handler: &dyn GatewayHandler, parser: &mut FieldParser) -> Result<(), TwsError> {
  let _version = parser.read_int()?;
  let req_id = parser.read_int()?;
  let data = parser.read_string()?;
  debug!("Fundamental Data: ReqID={}, Data length={}", req_id, data.len());
  handler.fundamental_data(req_id, &data);
  Ok(())
}
