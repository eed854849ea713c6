// tws_history.rs
// Command-line front end for twshist. Results go to stdout as JSON.
//
//   tws_history probe
//   tws_history window SPY --kind etf --exchange ARCA --duration "1 M"
//   tws_history long EUR --kind currency-pair --years 2 --chunk "2 W" --bar-size "1 hour"
//   tws_history batch jobs.json --max-reconnects 3
//   tws_history --log-db rec.db --session-name spy long SPY --years 1
//   tws_history --replay-db rec.db --session-name spy --end 2024-03-01 long SPY --years 1

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use log::{info, warn};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use twshist::{
  batch::{BatchJob, BatchRunner, SymbolJob},
  data::years_span,
  fetch_fundamental_report, fetch_long_range, fetch_window,
  financial_report_parser::parse_snapshot,
  Bar, DurationUnit, GatewaySession, HistoryOptions, LongRangeError, MockConnection, Pacing, SecurityKind,
  SessionConfig, TwsError, WhatToShow, Window,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Historical bars from TWS / IB Gateway", long_about = None)]
struct Cli {
  #[command(flatten)]
  global: GlobalArgs,

  #[command(subcommand)]
  command: Command,
}

#[derive(Args, Debug, Clone)]
struct GlobalArgs {
  /// TWS/Gateway host address.
  #[arg(long, global = true, default_value = "127.0.0.1")]
  host: String,

  /// TWS/Gateway port.
  #[arg(long, global = true, default_value_t = 4002)]
  port: u16,

  /// Client ID for the connection.
  #[arg(long, global = true, default_value_t = 1)]
  client_id: i32,

  /// Record the session's traffic into this SQLite database.
  #[arg(long, global = true, conflicts_with = "replay_db")]
  log_db: Option<PathBuf>,

  /// Session name used for recording and replay.
  #[arg(long, global = true)]
  session_name: Option<String>,

  /// Replay a recorded session instead of connecting.
  #[arg(long, global = true)]
  replay_db: Option<PathBuf>,

  /// Treat this instant as "now" (YYYY-MM-DD, "YYYY-MM-DD HH:MM:SS" or RFC 3339, UTC).
  #[arg(long, global = true)]
  end: Option<String>,

  /// Skip the pauses between windows and symbols.
  #[arg(long, global = true)]
  no_pacing: bool,

  /// Seconds to wait for one window before cancelling it.
  #[arg(long, global = true, default_value_t = 90)]
  timeout: u64,
}

#[derive(Args, Debug, Clone)]
struct SymbolArgs {
  symbol: String,

  /// equity, etf, currency-pair, crypto or index.
  #[arg(long, default_value = "equity")]
  kind: String,

  #[arg(long, default_value = "SMART")]
  exchange: String,

  #[arg(long)]
  primary_exchange: Option<String>,

  #[arg(long, default_value = "USD")]
  currency: String,
}

impl SymbolArgs {
  fn job(&self) -> Result<SymbolJob> {
    let kind: SecurityKind = self.kind.parse()?;
    Ok(SymbolJob {
      symbol: self.symbol.clone(),
      kind,
      exchange: self.exchange.clone(),
      primary_exchange: self.primary_exchange.clone(),
      currency: self.currency.clone(),
    })
  }
}

#[derive(Args, Debug, Clone)]
struct BarArgs {
  #[arg(long, default_value = "1 day")]
  bar_size: String,

  /// TRADES, MIDPOINT, ADJUSTED_LAST, AGGTRADES, ... (default depends on the kind).
  #[arg(long)]
  what_to_show: Option<String>,

  /// Include bars outside regular trading hours.
  #[arg(long)]
  all_hours: bool,
}

impl BarArgs {
  fn options(&self) -> Result<HistoryOptions> {
    Ok(HistoryOptions {
      bar_size: self.bar_size.parse()?,
      what_to_show: self.what_to_show.as_deref().map(str::parse::<WhatToShow>).transpose()?,
      use_rth: !self.all_hours,
      ..Default::default()
    })
  }
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Connect, ask for the gateway clock, and disconnect.
  Probe,
  /// Fetch one bounded window.
  Window {
    #[command(flatten)]
    symbol: SymbolArgs,
    #[command(flatten)]
    bars: BarArgs,
    /// Window length ("30 D", "1 M", "1 Y", ...).
    #[arg(long, default_value = "1 M")]
    duration: String,
  },
  /// Walk back over several years, one chunk at a time.
  Long {
    #[command(flatten)]
    symbol: SymbolArgs,
    #[command(flatten)]
    bars: BarArgs,
    #[arg(long, default_value_t = 1.0)]
    years: f64,
    #[arg(long, default_value = "1 M")]
    chunk: String,
  },
  /// Run a JSON batch job, reconnecting when the session is lost.
  Batch {
    job: PathBuf,
    #[arg(long, default_value_t = 2)]
    max_reconnects: u32,
  },
  /// Fetch a fundamental report.
  Fundamental {
    #[command(flatten)]
    symbol: SymbolArgs,
    #[arg(long, default_value = "ReportSnapshot")]
    report: String,
    /// Print the extracted snapshot fields instead of the raw XML.
    #[arg(long)]
    parse: bool,
  },
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
  if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
    return Ok(dt.with_timezone(&Utc));
  }
  if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
    return Ok(Utc.from_utc_datetime(&naive));
  }
  let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").with_context(|| format!("Unrecognized instant '{}'", raw))?;
  Ok(Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN)))
}

fn open_session(global: &GlobalArgs, client_id: i32) -> Result<Arc<GatewaySession>, TwsError> {
  let config = SessionConfig {
    log_db: global.log_db.clone(),
    session_name: global.session_name.clone(),
    ..SessionConfig::new(&global.host, global.port, client_id)
  };
  let session = GatewaySession::new(config);
  match &global.replay_db {
    Some(db) => {
      let name = global.session_name.as_deref().unwrap_or("default");
      session.connect_with(Box::new(MockConnection::new(db, name)?))?;
    }
    None => {
      session.connect()?;
    }
  }
  info!("Connected as client {} (server version {})", client_id, session.server_version());
  Ok(session)
}

fn pacing(global: &GlobalArgs) -> Pacing {
  let base = if global.no_pacing { Pacing::none() } else { Pacing::default() };
  Pacing { chunk_timeout: Duration::from_secs(global.timeout), ..base }
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

#[derive(Serialize)]
struct ProbeReport {
  handshake_id: Option<i32>,
  server_version: i32,
  gateway_time: i64,
}

#[derive(Serialize)]
struct WindowReport<'a> {
  symbol: &'a str,
  window: String,
  bars: Vec<Bar>,
}

fn main() -> Result<()> {
  env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
  let cli = Cli::parse();
  let global = &cli.global;
  let now = match &global.end {
    Some(raw) => parse_instant(raw)?,
    None => Utc::now(),
  };

  match &cli.command {
    Command::Probe => {
      let session = open_session(global, global.client_id)?;
      let gateway_time = session.request_current_time(Duration::from_secs(5))?;
      emit(&ProbeReport { handshake_id: session.handshake_id(), server_version: session.server_version(), gateway_time })?;
      session.disconnect();
    }

    Command::Window { symbol, bars, duration } => {
      let job = symbol.job()?;
      let duration: DurationUnit = duration.parse()?;
      let options = bars.options()?;
      // ADJUSTED_LAST only works with an open end.
      let window = match &global.end {
        Some(_) => Window::ending_at(now, duration),
        None => Window::ending_now(duration),
      };
      let session = open_session(global, global.client_id)?;
      let fetched = fetch_window(&session, &job.contract(), &window, &options, Duration::from_secs(global.timeout))?;
      emit(&WindowReport { symbol: &job.symbol, window: window.to_string(), bars: fetched })?;
      session.disconnect();
    }

    Command::Long { symbol, bars, years, chunk } => {
      let job = symbol.job()?;
      let chunk: DurationUnit = chunk.parse()?;
      let options = bars.options()?;
      let span = years_span(*years)?;
      let session = open_session(global, global.client_id)?;
      let outcome = fetch_long_range(&session, &job.contract(), span, chunk, &options, &pacing(global), now);
      session.disconnect();
      match outcome {
        Ok(result) => emit(&result)?,
        Err(LongRangeError::Interrupted { error, progress }) => {
          warn!("Emitting partial result; resume with --end {}", progress.resume_end.to_rfc3339());
          emit(&progress.partial)?;
          return Err(anyhow!("Interrupted: {}", error));
        }
        Err(e) => return Err(e.into()),
      }
    }

    Command::Batch { job, max_reconnects } => {
      let job = BatchJob::load(job)?;
      let chunk = job.chunk_duration()?;
      let options = job.options()?;
      let connect = |client_id: i32| open_session(global, client_id);
      let mut runner = BatchRunner::new(connect, global.client_id, *max_reconnects, pacing(global));
      let report = runner.run(&job.symbols, job.total_span()?, chunk, &options, now)?;
      info!("{} symbols done, {} failed, {} reconnects", report.results.len(), report.failures.len(), report.reconnects);
      emit(&report)?;
    }

    Command::Fundamental { symbol, report, parse } => {
      let job = symbol.job()?;
      let session = open_session(global, global.client_id)?;
      let xml = fetch_fundamental_report(&session, &job.contract(), report, Duration::from_secs(global.timeout))?;
      session.disconnect();
      if *parse {
        emit(&parse_snapshot(&xml)?)?;
      } else {
        println!("{}", xml);
      }
    }
  }
  Ok(())
}
