// twshist/src/batch.rs
// Several symbols, one after another, with a reconnect policy on top.

use crate::base::TwsError;
use crate::contract::{BarSize, Contract, SecurityKind, WhatToShow};
use crate::data::{years_span, DurationUnit, HistoryOptions};
use crate::fetcher::WindowSource;
use crate::paginator::{fetch_long_range, fetch_range, LongRangeError, LongRangeResult, Pacing};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::thread;

fn default_kind() -> SecurityKind {
  SecurityKind::Equity
}

fn default_exchange() -> String {
  "SMART".to_string()
}

fn default_currency() -> String {
  "USD".to_string()
}

fn default_years() -> f64 {
  1.0
}

fn default_chunk() -> String {
  "1 M".to_string()
}

fn default_bar_size() -> String {
  "1 day".to_string()
}

fn default_true() -> bool {
  true
}

/// One symbol of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolJob {
  pub symbol: String,
  #[serde(default = "default_kind")]
  pub kind: SecurityKind,
  #[serde(default = "default_exchange")]
  pub exchange: String,
  #[serde(default)]
  pub primary_exchange: Option<String>,
  #[serde(default = "default_currency")]
  pub currency: String,
}

impl SymbolJob {
  pub fn new(symbol: &str, kind: SecurityKind) -> Self {
    SymbolJob {
      symbol: symbol.to_string(),
      kind,
      exchange: default_exchange(),
      primary_exchange: None,
      currency: default_currency(),
    }
  }

  pub fn contract(&self) -> Contract {
    Contract::from_kind(&self.symbol, self.kind, &self.exchange, self.primary_exchange.as_deref(), &self.currency)
  }
}

/// A batch described in JSON:
///
/// ```json
/// { "years": 2, "chunk": "1 M", "bar_size": "1 day",
///   "symbols": [ { "symbol": "SPY", "kind": "etf", "exchange": "ARCA" } ] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
  #[serde(default = "default_years")]
  pub years: f64,
  #[serde(default = "default_chunk")]
  pub chunk: String,
  #[serde(default = "default_bar_size")]
  pub bar_size: String,
  #[serde(default)]
  pub what_to_show: Option<String>,
  #[serde(default = "default_true")]
  pub use_rth: bool,
  pub symbols: Vec<SymbolJob>,
}

impl BatchJob {
  pub fn from_json(text: &str) -> Result<Self, TwsError> {
    let job: BatchJob =
      serde_json::from_str(text).map_err(|e| TwsError::ConfigurationError(format!("Invalid batch job: {}", e)))?;
    if let Err(e) = years_span(job.years) {
      return Err(TwsError::ConfigurationError(format!("Batch years: {}", e)));
    }
    Ok(job)
  }

  pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, TwsError> {
    let text = fs::read_to_string(path.as_ref())
      .map_err(|e| TwsError::ConfigurationError(format!("Cannot read {:?}: {}", path.as_ref(), e)))?;
    Self::from_json(&text)
  }

  pub fn chunk_duration(&self) -> Result<DurationUnit, TwsError> {
    self.chunk.parse()
  }

  pub fn total_span(&self) -> Result<ChronoDuration, TwsError> {
    years_span(self.years)
  }

  pub fn options(&self) -> Result<HistoryOptions, TwsError> {
    let bar_size: BarSize = self.bar_size.parse()?;
    let what_to_show = self.what_to_show.as_deref().map(str::parse::<WhatToShow>).transpose()?;
    Ok(HistoryOptions { bar_size, what_to_show, use_rth: self.use_rth, ..Default::default() })
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolFailure {
  pub symbol: String,
  pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
  pub results: Vec<LongRangeResult>,
  pub failures: Vec<SymbolFailure>,
  pub reconnects: u32,
}

impl BatchReport {
  fn fail(&mut self, symbol: &str, reason: String) {
    warn!("{}: {}", symbol, reason);
    self.failures.push(SymbolFailure { symbol: symbol.to_string(), reason });
  }

  fn finish(&mut self, symbol: &str, result: LongRangeResult) {
    if result.series.is_empty() {
      self.fail(symbol, format!("no bars in {} windows", result.windows_requested));
    } else {
      info!("{}: {} bars", symbol, result.series.len());
      self.results.push(result);
    }
  }

  fn abandon(&mut self, rest: &[SymbolJob], why: &str) {
    for job in rest {
      self.fail(&job.symbol, format!("not attempted: {}", why));
    }
  }
}

fn pause_between(index: usize, pacing: &Pacing) {
  if index > 0 && !pacing.inter_symbol.is_zero() {
    thread::sleep(pacing.inter_symbol);
  }
}

/// Fetch each symbol over one source. A lost connection stops the batch;
/// the interrupted and remaining symbols are reported as failures.
pub fn fetch_symbols<S: WindowSource + ?Sized>(
  source: &S,
  jobs: &[SymbolJob],
  total_span: ChronoDuration,
  chunk: DurationUnit,
  options: &HistoryOptions,
  pacing: &Pacing,
  now: DateTime<Utc>,
) -> BatchReport {
  let mut report = BatchReport::default();
  for (index, job) in jobs.iter().enumerate() {
    pause_between(index, pacing);
    match fetch_long_range(source, &job.contract(), total_span, chunk, options, pacing, now) {
      Ok(result) => report.finish(&job.symbol, result),
      Err(LongRangeError::Setup(e)) => report.fail(&job.symbol, e.to_string()),
      Err(e @ LongRangeError::Interrupted { .. }) => {
        error!("Batch stopped at {}: {}", job.symbol, e);
        report.fail(&job.symbol, e.to_string());
        report.abandon(&jobs[index + 1..], "session lost");
        break;
      }
    }
  }
  report
}

/// Runs a batch, reconnecting with a fresh client id when the session is lost.
///
/// `connect` is called with the client id to use and returns a ready
/// source. After a connection-fatal error the interrupted symbol resumes
/// from the first window that did not complete.
pub struct BatchRunner<F> {
  connect: F,
  client_id: i32,
  max_reconnects: u32,
  pacing: Pacing,
}

impl<S, F> BatchRunner<F>
where
  S: WindowSource,
  F: FnMut(i32) -> Result<S, TwsError>,
{
  pub fn new(connect: F, client_id: i32, max_reconnects: u32, pacing: Pacing) -> Self {
    BatchRunner { connect, client_id, max_reconnects, pacing }
  }

  /// Client id the next connection would use.
  pub fn client_id(&self) -> i32 {
    self.client_id
  }

  pub fn run(
    &mut self,
    jobs: &[SymbolJob],
    total_span: ChronoDuration,
    chunk: DurationUnit,
    options: &HistoryOptions,
    now: DateTime<Utc>,
  ) -> Result<BatchReport, TwsError> {
    let target_start = now
      .checked_sub_signed(total_span)
      .ok_or_else(|| TwsError::InvalidParameter(format!("Span {} back from {} is out of range", total_span, now)))?;
    let mut source = (self.connect)(self.client_id)?;
    let mut report = BatchReport::default();

    for (index, job) in jobs.iter().enumerate() {
      pause_between(index, &self.pacing);
      let contract = job.contract();
      let mut collected: Option<LongRangeResult> = None;
      let mut end = now;
      loop {
        match fetch_range(&source, &contract, target_start, end, chunk, options, &self.pacing) {
          Ok(result) => {
            let merged = match collected.take() {
              Some(mut acc) => {
                acc.absorb(result);
                acc
              }
              None => result,
            };
            report.finish(&job.symbol, merged);
            break;
          }
          Err(LongRangeError::Setup(e)) => {
            report.fail(&job.symbol, e.to_string());
            break;
          }
          Err(LongRangeError::Interrupted { error, progress }) => {
            let progress = *progress;
            match collected.as_mut() {
              Some(acc) => acc.absorb(progress.partial),
              None => collected = Some(progress.partial),
            }
            if report.reconnects >= self.max_reconnects {
              error!("{}: giving up after {} reconnects: {}", job.symbol, report.reconnects, error);
              report.fail(&job.symbol, error.to_string());
              report.abandon(&jobs[index + 1..], "reconnect limit reached");
              return Ok(report);
            }
            report.reconnects += 1;
            self.client_id += 1;
            warn!(
              "{}: {}; reconnecting as client {} and resuming at {}",
              job.symbol,
              error,
              self.client_id,
              progress.resume_end.format("%Y-%m-%d %H:%M:%S")
            );
            source = match (self.connect)(self.client_id) {
              Ok(s) => s,
              Err(e) => {
                error!("Reconnect failed: {}", e);
                report.fail(&job.symbol, format!("reconnect failed: {}", e));
                report.abandon(&jobs[index + 1..], "reconnect failed");
                return Ok(report);
              }
            };
            end = progress.resume_end;
          }
        }
      }
    }
    Ok(report)
  }
}
