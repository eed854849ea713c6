// twshist/src/fetcher.rs
// Blocking fetches of one bounded window (or one fundamental report)
// over a shared session.

use crate::base::TwsError;
use crate::contract::{Contract, DateFormat, SecType, WhatToShow};
use crate::data::{Bar, HistoryOptions, Window};
use crate::registry::{Fragment, RequestKind, WaitOutcome};
use crate::session::GatewaySession;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Data kind used when the caller does not pick one.
pub fn default_what_to_show(sec_type: SecType) -> WhatToShow {
  match sec_type {
    SecType::Stock => WhatToShow::AdjustedLast,
    SecType::Crypto => WhatToShow::AggTrades,
    SecType::Forex => WhatToShow::Midpoint,
    _ => WhatToShow::Trades,
  }
}

/// A window request after per-security adjustments.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
  pub contract: Contract,
  pub options: HistoryOptions,
  pub what_to_show: WhatToShow,
}

/// Apply the gateway's per-security rules to a window request.
pub fn prepare_request(contract: &Contract, window: &Window, options: &HistoryOptions) -> Result<PreparedRequest, TwsError> {
  let mut contract = contract.clone();
  let mut options = *options;
  let mut what_to_show = options.what_to_show.unwrap_or_else(|| default_what_to_show(contract.sec_type));

  match contract.sec_type {
    SecType::Forex => {
      if contract.exchange != "IDEALPRO" {
        debug!("{}: currency pairs route to IDEALPRO (was {})", contract.symbol, contract.exchange);
        contract.exchange = "IDEALPRO".to_string();
      }
      if options.bar_size.is_intraday() && options.date_format != DateFormat::Epoch {
        info!("{}: intraday currency bars requested with epoch timestamps", contract.symbol);
        options.date_format = DateFormat::Epoch;
      }
    }
    SecType::Crypto => {
      if contract.exchange == "SMART" {
        return Err(TwsError::InvalidParameter(format!(
          "{}: SMART routing is not valid for crypto; name the venue (PAXOS, ...)",
          contract.symbol
        )));
      }
      if what_to_show == WhatToShow::Trades {
        info!("{}: crypto uses AGGTRADES instead of TRADES", contract.symbol);
        what_to_show = WhatToShow::AggTrades;
      }
    }
    SecType::Stock => {
      if contract.exchange == "SMART" && contract.primary_exchange.is_none() {
        warn!("{}: SMART routing without a primary exchange may be ambiguous", contract.symbol);
      }
    }
    _ => {}
  }

  if what_to_show == WhatToShow::AdjustedLast && window.end.is_some() {
    return Err(TwsError::InvalidParameter(format!(
      "{}: ADJUSTED_LAST cannot be combined with an explicit end time ({})",
      contract.symbol, window
    )));
  }
  options.what_to_show = Some(what_to_show);
  Ok(PreparedRequest { contract, options, what_to_show })
}

/// Normalize buffered fragments into time-ordered bars. Bars that fail to
/// normalize are dropped; a window where every bar fails comes back empty.
fn collect_bars(req_id: i32, fragments: Vec<Fragment>) -> Vec<Bar> {
  let total = fragments.len();
  let mut bars = Vec::with_capacity(total);
  for fragment in fragments {
    match fragment {
      Fragment::Bar(raw) => match raw.normalize() {
        Ok(bar) => bars.push(bar),
        Err(e) => warn!("Request {}: dropping bar: {}", req_id, e),
      },
      Fragment::Text(t) => warn!("Request {}: unexpected text fragment ({} bytes)", req_id, t.len()),
    }
  }
  if bars.is_empty() && total > 0 {
    warn!("Request {}: none of {} bars could be normalized; treating window as empty", req_id, total);
  }
  bars.sort_by_key(|b| b.time);
  bars
}

/// Fetch one bounded window.
///
/// Returns the bars on completion (possibly none). A gateway rejection
/// comes back as its error. When `timeout` elapses the request is
/// cancelled; bars already received are returned as a success, and with
/// nothing received the result is `TwsError::Timeout`. The registry entry
/// is removed before returning in every case.
pub fn fetch_window(
  session: &GatewaySession,
  contract: &Contract,
  window: &Window,
  options: &HistoryOptions,
  timeout: Duration,
) -> Result<Vec<Bar>, TwsError> {
  let prepared = prepare_request(contract, window, options)?;
  let pending = session.register_request(RequestKind::HistoricalWindow)?;
  let req_id = pending.req_id();
  debug!("Request {}: {} {} {}", req_id, prepared.contract.symbol, window, prepared.what_to_show);

  let outcome = match session.encoder().encode_request_historical_data(
    req_id,
    &prepared.contract,
    window,
    &prepared.options,
    prepared.what_to_show,
  ) {
    Ok(payload) => {
      session.issue(req_id, &payload);
      pending.wait(timeout)
    }
    Err(e) => WaitOutcome::Failed(e, Vec::new()),
  };

  let result = match outcome {
    WaitOutcome::Completed(fragments) => Ok(collect_bars(req_id, fragments)),
    WaitOutcome::Failed(e, _) => Err(e),
    WaitOutcome::TimedOut(fragments) => {
      session.cancel(req_id);
      if fragments.is_empty() {
        Err(TwsError::Timeout(format!("{} {} received nothing within {:?}", contract.symbol, window, timeout)))
      } else {
        warn!(
          "Request {}: no end marker within {:?}; keeping {} partial bars",
          req_id, timeout, fragments.len()
        );
        Ok(collect_bars(req_id, fragments))
      }
    }
  };
  session.remove_request(req_id);
  result
}

/// Fetch a fundamental report (XML) such as "ReportSnapshot".
pub fn fetch_fundamental_report(
  session: &GatewaySession,
  contract: &Contract,
  report_type: &str,
  timeout: Duration,
) -> Result<String, TwsError> {
  if contract.sec_type != SecType::Stock {
    warn!("{}: fundamental reports are only published for stocks (got {})", contract.symbol, contract.sec_type);
  }
  let pending = session.register_request(RequestKind::Fundamental)?;
  let req_id = pending.req_id();
  info!("Request {}: {} report for {}", req_id, report_type, contract.symbol);

  let outcome = match session.encoder().encode_request_fundamental_data(req_id, contract, report_type) {
    Ok(payload) => {
      session.issue(req_id, &payload);
      pending.wait(timeout)
    }
    Err(e) => WaitOutcome::Failed(e, Vec::new()),
  };
  let result = match outcome {
    WaitOutcome::Completed(fragments) => fragments
      .into_iter()
      .find_map(|f| match f {
        Fragment::Text(xml) => Some(xml),
        Fragment::Bar(_) => None,
      })
      .ok_or_else(|| TwsError::InternalError(format!("Request {}: report completed without data", req_id))),
    WaitOutcome::Failed(e, _) => Err(e),
    WaitOutcome::TimedOut(_) => {
      session.cancel(req_id);
      Err(TwsError::Timeout(format!("{} report for {} not received within {:?}", report_type, contract.symbol, timeout)))
    }
  };
  session.remove_request(req_id);
  result
}

/// Anything that can serve bounded windows. The paginator only needs this.
#[cfg_attr(test, mockall::automock)]
pub trait WindowSource {
  fn fetch_window(
    &self,
    contract: &Contract,
    window: &Window,
    options: &HistoryOptions,
    timeout: Duration,
  ) -> Result<Vec<Bar>, TwsError>;
}

impl WindowSource for GatewaySession {
  fn fetch_window(
    &self,
    contract: &Contract,
    window: &Window,
    options: &HistoryOptions,
    timeout: Duration,
  ) -> Result<Vec<Bar>, TwsError> {
    fetch_window(self, contract, window, options, timeout)
  }
}

impl<T: WindowSource + ?Sized> WindowSource for Arc<T> {
  fn fetch_window(
    &self,
    contract: &Contract,
    window: &Window,
    options: &HistoryOptions,
    timeout: Duration,
  ) -> Result<Vec<Bar>, TwsError> {
    (**self).fetch_window(contract, window, options, timeout)
  }
}
