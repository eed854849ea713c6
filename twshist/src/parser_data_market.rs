// twshist/src/parser_data_market.rs
// Historical bar messages.

use crate::base::TwsError;
use crate::data::RawBar;
use crate::handler::GatewayHandler;
use crate::min_server_ver::min_server_ver;
use crate::protocol_dec_parser::FieldParser;
use log::trace;

/// Process historical data message (Type 17)
///
/// Servers older than HISTORICAL_DATA_END bundle the completion notice
/// (start/end strings) into this message; newer ones send Type 108.
pub fn process_historical_data(handler: &dyn GatewayHandler, parser: &mut FieldParser, server_version: i32) -> Result<(), TwsError> {
  if server_version < min_server_ver::SYNT_REALTIME_BARS {
    let _version = parser.read_int()?;
  }
  let req_id = parser.read_int()?;

  let mut range = None;
  if server_version < min_server_ver::HISTORICAL_DATA_END {
    let start = parser.read_string()?;
    let end = parser.read_string()?;
    range = Some((start, end));
  }

  let item_count = parser.read_int()?;
  trace!("Historical data: ReqID={}, Bars={}", req_id, item_count);
  for _ in 0..item_count {
    let date = parser.read_string()?;
    let open = parser.read_double()?;
    let high = parser.read_double()?;
    let low = parser.read_double()?;
    let close = parser.read_double()?;
    let volume = parser.read_decimal()?;
    let wap = parser.read_decimal()?;
    if server_version < min_server_ver::SYNT_REALTIME_BARS {
      let _has_gaps = parser.read_string()?;
    }
    let count = parser.read_int()?;
    handler.historical_data(req_id, RawBar { date, open, high, low, close, volume, wap, count });
  }

  if let Some((start, end)) = range {
    handler.historical_data_end(req_id, &start, &end);
  }
  Ok(())
}

/// Process historical data end message (Type 108)
pub fn process_historical_data_end(handler: &dyn GatewayHandler, parser: &mut FieldParser) -> Result<(), TwsError> {
  let req_id = parser.read_int()?;
  let start = parser.read_string()?;
  let end = parser.read_string()?;
  handler.historical_data_end(req_id, &start, &end);
  Ok(())
}
