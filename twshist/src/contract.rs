// twshist/src/contract.rs
// Contract and request-vocabulary types for historical data requests

use crate::base::TwsError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Security type as sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecType {
  Stock,     // STK
  Future,    // FUT
  Forex,     // CASH
  Index,     // IND
  Commodity, // CMDTY
  Crypto,    // CRYPTO
}

impl fmt::Display for SecType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      SecType::Stock => "STK",
      SecType::Future => "FUT",
      SecType::Forex => "CASH",
      SecType::Index => "IND",
      SecType::Commodity => "CMDTY",
      SecType::Crypto => "CRYPTO",
    };
    write!(f, "{}", s)
  }
}

impl FromStr for SecType {
  type Err = TwsError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_uppercase().as_str() {
      "STK" => Ok(SecType::Stock),
      "FUT" => Ok(SecType::Future),
      "CASH" => Ok(SecType::Forex),
      "IND" => Ok(SecType::Index),
      "CMDTY" => Ok(SecType::Commodity),
      "CRYPTO" => Ok(SecType::Crypto),
      _ => Err(TwsError::InvalidParameter(format!("Unknown security type: {}", s))),
    }
  }
}

/// What a caller asks for. ETFs trade as stocks on the wire but keep
/// their own kind so defaults can differ later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityKind {
  Equity,
  Etf,
  CurrencyPair,
  Crypto,
  Index,
}

impl SecurityKind {
  pub fn sec_type(&self) -> SecType {
    match self {
      SecurityKind::Equity | SecurityKind::Etf => SecType::Stock,
      SecurityKind::CurrencyPair => SecType::Forex,
      SecurityKind::Crypto => SecType::Crypto,
      SecurityKind::Index => SecType::Index,
    }
  }
}

impl fmt::Display for SecurityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      SecurityKind::Equity => "equity",
      SecurityKind::Etf => "etf",
      SecurityKind::CurrencyPair => "currency-pair",
      SecurityKind::Crypto => "crypto",
      SecurityKind::Index => "index",
    };
    write!(f, "{}", s)
  }
}

impl FromStr for SecurityKind {
  type Err = TwsError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "equity" | "stock" | "stk" => Ok(SecurityKind::Equity),
      "etf" => Ok(SecurityKind::Etf),
      "currency-pair" | "fx" | "forex" | "cash" => Ok(SecurityKind::CurrencyPair),
      "crypto" => Ok(SecurityKind::Crypto),
      "index" | "ind" => Ok(SecurityKind::Index),
      _ => Err(TwsError::InvalidParameter(format!("Unknown security kind: {}", s))),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Contract {
  pub con_id: i32,
  pub symbol: String,
  pub sec_type: SecType,
  pub last_trade_date_or_contract_month: Option<String>,
  pub strike: Option<f64>,
  pub multiplier: Option<String>,
  pub exchange: String,
  pub primary_exchange: Option<String>,
  pub currency: String,
  pub local_symbol: Option<String>,
  pub trading_class: Option<String>,
  pub include_expired: bool,
}

impl Default for Contract {
  fn default() -> Self {
    Self {
      con_id: 0,
      symbol: String::new(),
      sec_type: SecType::Stock,
      last_trade_date_or_contract_month: None,
      strike: None,
      multiplier: None,
      exchange: "SMART".to_string(),
      primary_exchange: None,
      currency: "USD".to_string(),
      local_symbol: None,
      trading_class: None,
      include_expired: false,
    }
  }
}

impl Contract {
  /// Create a new stock contract routed through SMART in USD.
  pub fn stock(symbol: &str) -> Self {
    Self::stock_with_exchange(symbol, "SMART", "USD")
  }

  pub fn stock_with_exchange(symbol: &str, exchange: &str, currency: &str) -> Self {
    Contract {
      symbol: symbol.to_string(),
      sec_type: SecType::Stock,
      exchange: exchange.to_string(),
      currency: currency.to_string(),
      ..Default::default()
    }
  }

  /// Currency pair, e.g. `forex("EUR", "USD")`.
  pub fn forex(base: &str, quote: &str) -> Self {
    Contract {
      symbol: base.to_string(),
      sec_type: SecType::Forex,
      exchange: "IDEALPRO".to_string(),
      currency: quote.to_string(),
      ..Default::default()
    }
  }

  pub fn crypto(symbol: &str, exchange: &str, currency: &str) -> Self {
    Contract {
      symbol: symbol.to_string(),
      sec_type: SecType::Crypto,
      exchange: exchange.to_string(),
      currency: currency.to_string(),
      ..Default::default()
    }
  }

  pub fn index(symbol: &str, exchange: &str, currency: &str) -> Self {
    Contract {
      symbol: symbol.to_string(),
      sec_type: SecType::Index,
      exchange: exchange.to_string(),
      currency: currency.to_string(),
      ..Default::default()
    }
  }

  /// Build a contract from caller-facing fields.
  pub fn from_kind(
    symbol: &str,
    kind: SecurityKind,
    exchange: &str,
    primary_exchange: Option<&str>,
    currency: &str,
  ) -> Self {
    Contract {
      symbol: symbol.to_string(),
      sec_type: kind.sec_type(),
      exchange: exchange.to_string(),
      primary_exchange: primary_exchange.filter(|p| !p.is_empty()).map(|p| p.to_string()),
      currency: currency.to_string(),
      ..Default::default()
    }
  }
}

/// Bar size for historical data requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarSize {
  OneSecond,
  FiveSeconds,
  FifteenSeconds,
  ThirtySeconds,
  OneMinute,
  TwoMinutes,
  ThreeMinutes,
  FiveMinutes,
  FifteenMinutes,
  ThirtyMinutes,
  OneHour,
  FourHours,
  OneDay,
  OneWeek,
  OneMonth,
}

impl BarSize {
  /// Bars smaller than a day carry a time of day.
  pub fn is_intraday(&self) -> bool {
    !matches!(self, BarSize::OneDay | BarSize::OneWeek | BarSize::OneMonth)
  }
}

impl fmt::Display for BarSize {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      BarSize::OneSecond => "1 secs",
      BarSize::FiveSeconds => "5 secs",
      BarSize::FifteenSeconds => "15 secs",
      BarSize::ThirtySeconds => "30 secs",
      BarSize::OneMinute => "1 min",
      BarSize::TwoMinutes => "2 mins",
      BarSize::ThreeMinutes => "3 mins",
      BarSize::FiveMinutes => "5 mins",
      BarSize::FifteenMinutes => "15 mins",
      BarSize::ThirtyMinutes => "30 mins",
      BarSize::OneHour => "1 hour",
      BarSize::FourHours => "4 hours",
      BarSize::OneDay => "1 day",
      BarSize::OneWeek => "1 week",
      BarSize::OneMonth => "1 month",
    };
    write!(f, "{}", s)
  }
}

impl FromStr for BarSize {
  type Err = TwsError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    match normalized.as_str() {
      "1 secs" | "1 sec" => Ok(BarSize::OneSecond),
      "5 secs" => Ok(BarSize::FiveSeconds),
      "15 secs" => Ok(BarSize::FifteenSeconds),
      "30 secs" => Ok(BarSize::ThirtySeconds),
      "1 min" => Ok(BarSize::OneMinute),
      "2 mins" => Ok(BarSize::TwoMinutes),
      "3 mins" => Ok(BarSize::ThreeMinutes),
      "5 mins" => Ok(BarSize::FiveMinutes),
      "15 mins" => Ok(BarSize::FifteenMinutes),
      "30 mins" => Ok(BarSize::ThirtyMinutes),
      "1 hour" => Ok(BarSize::OneHour),
      "4 hours" => Ok(BarSize::FourHours),
      "1 day" => Ok(BarSize::OneDay),
      "1 week" => Ok(BarSize::OneWeek),
      "1 month" => Ok(BarSize::OneMonth),
      _ => Err(TwsError::InvalidParameter(format!("Unknown bar size: '{}'", s))),
    }
  }
}

/// What to show for historical data requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WhatToShow {
  Trades,
  Midpoint,
  Bid,
  Ask,
  BidAsk,
  AdjustedLast,
  AggTrades,
  HistoricalVolatility,
}

impl fmt::Display for WhatToShow {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      WhatToShow::Trades => "TRADES",
      WhatToShow::Midpoint => "MIDPOINT",
      WhatToShow::Bid => "BID",
      WhatToShow::Ask => "ASK",
      WhatToShow::BidAsk => "BID_ASK",
      WhatToShow::AdjustedLast => "ADJUSTED_LAST",
      WhatToShow::AggTrades => "AGGTRADES",
      WhatToShow::HistoricalVolatility => "HISTORICAL_VOLATILITY",
    };
    write!(f, "{}", s)
  }
}

impl FromStr for WhatToShow {
  type Err = TwsError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_uppercase().as_str() {
      "TRADES" => Ok(WhatToShow::Trades),
      "MIDPOINT" => Ok(WhatToShow::Midpoint),
      "BID" => Ok(WhatToShow::Bid),
      "ASK" => Ok(WhatToShow::Ask),
      "BID_ASK" => Ok(WhatToShow::BidAsk),
      "ADJUSTED_LAST" => Ok(WhatToShow::AdjustedLast),
      "AGGTRADES" => Ok(WhatToShow::AggTrades),
      "HISTORICAL_VOLATILITY" => Ok(WhatToShow::HistoricalVolatility),
      _ => Err(TwsError::InvalidParameter(format!("Unknown data kind: {}", s))),
    }
  }
}

/// Timestamp representation requested from the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DateFormat {
  /// `YYYYMMDD` or `YYYYMMDD HH:MM:SS [zone]`.
  Text = 1,
  /// Epoch seconds.
  Epoch = 2,
}

impl DateFormat {
  pub fn wire_value(&self) -> i32 {
    *self as i32
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn etf_goes_out_as_stock() {
    let c = Contract::from_kind("SPY", SecurityKind::Etf, "SMART", Some("ARCA"), "USD");
    assert_eq!(c.sec_type, SecType::Stock);
    assert_eq!(c.sec_type.to_string(), "STK");
    assert_eq!(c.primary_exchange.as_deref(), Some("ARCA"));

    let c = Contract::from_kind("EUR", SecurityKind::CurrencyPair, "IDEALPRO", Some(""), "USD");
    assert_eq!(c.sec_type.to_string(), "CASH");
    assert_eq!(c.primary_exchange, None);
  }

  #[test]
  fn bar_size_vocabulary() {
    assert_eq!("1  day".parse::<BarSize>().unwrap(), BarSize::OneDay);
    assert_eq!(BarSize::ThirtyMinutes.to_string(), "30 mins");
    assert!(BarSize::OneHour.is_intraday());
    assert!(!BarSize::OneDay.is_intraday());
    assert!("7 days".parse::<BarSize>().is_err());
  }

  #[test]
  fn data_kind_vocabulary() {
    assert_eq!("adjusted_last".parse::<WhatToShow>().unwrap(), WhatToShow::AdjustedLast);
    assert_eq!(WhatToShow::AggTrades.to_string(), "AGGTRADES");
    assert_eq!(DateFormat::Epoch.wire_value(), 2);
    assert_eq!("fx".parse::<SecurityKind>().unwrap(), SecurityKind::CurrencyPair);
  }
}
