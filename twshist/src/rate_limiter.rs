// twshist/src/rate_limiter.rs
//! Outgoing traffic limits.
//!
//! The gateway enforces, independently of each other:
//! - a cap on messages per second (token bucket),
//! - a cap on historical requests in flight at once (counter),
//! - a cap on historical requests started within a rolling window
//!   (sliding window; the classic "60 requests per 10 minutes" pacing rule).
//!
//! Limiting is disabled by default. When disabled every acquire succeeds
//! immediately and nothing is tracked.

use crate::base::TwsError;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub struct RateLimiterConfig {
  pub enabled: bool,
  /// Messages per second (default: 50)
  pub max_messages_per_second: u32,
  /// Token bucket capacity (default: 100)
  pub max_message_burst: u32,
  /// Simultaneous historical requests (default: 50)
  pub max_historical_requests: u32,
  /// Historical requests per `historical_window` (default: 60)
  pub max_historical_per_window: u32,
  /// Rolling window for `max_historical_per_window` (default: 10 minutes)
  pub historical_window: Duration,
  /// How long an acquire may block before giving up (default: 5s)
  pub rate_limit_wait_timeout: Duration,
}

impl Default for RateLimiterConfig {
  fn default() -> Self {
    Self {
      enabled: false,
      max_messages_per_second: 50,
      max_message_burst: 100,
      max_historical_requests: 50,
      max_historical_per_window: 60,
      historical_window: Duration::from_secs(600),
      rate_limit_wait_timeout: Duration::from_secs(5),
    }
  }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RateLimiterStatus {
  pub enabled: bool,
  pub available_message_tokens: u32,
  pub active_historical_requests: u32,
  pub historical_requests_in_window: u32,
  pub messages_delayed: u64,
  pub requests_rejected: u64,
}

// Sleep between retries, doubling up to a ceiling.
fn poll_until<F: FnMut() -> bool>(timeout: Duration, mut attempt: F) -> bool {
  let start = Instant::now();
  let mut pause = Duration::from_millis(1);
  loop {
    if attempt() {
      return true;
    }
    let elapsed = start.elapsed();
    if elapsed >= timeout {
      return false;
    }
    std::thread::sleep(pause.min(timeout - elapsed));
    pause = (pause * 2).min(Duration::from_millis(100));
  }
}

struct Bucket {
  tokens: f64,
  last_refill: Instant,
}

/// Token bucket for messages per second.
pub struct TokenBucketRateLimiter {
  capacity: f64,
  per_second: f64,
  bucket: Mutex<Bucket>,
}

impl TokenBucketRateLimiter {
  pub fn new(capacity: u32, per_second: u32) -> Self {
    Self {
      capacity: capacity as f64,
      per_second: per_second as f64,
      bucket: Mutex::new(Bucket { tokens: capacity as f64, last_refill: Instant::now() }),
    }
  }

  pub fn try_acquire(&self) -> bool {
    let mut bucket = self.bucket.lock();
    let now = Instant::now();
    let refill = now.duration_since(bucket.last_refill).as_secs_f64() * self.per_second;
    bucket.tokens = (bucket.tokens + refill).min(self.capacity);
    bucket.last_refill = now;
    if bucket.tokens >= 1.0 {
      bucket.tokens -= 1.0;
      true
    } else {
      false
    }
  }

  pub fn acquire(&self, timeout: Duration) -> bool {
    poll_until(timeout, || self.try_acquire())
  }

  pub fn available(&self) -> u32 {
    self.bucket.lock().tokens.floor() as u32
  }
}

/// Caps how many tracked request ids may be active at once.
pub struct CounterRateLimiter {
  max_count: usize,
  active: Mutex<HashSet<i32>>,
}

impl CounterRateLimiter {
  pub fn new(max_count: u32) -> Self {
    Self { max_count: max_count as usize, active: Mutex::new(HashSet::new()) }
  }

  pub fn try_acquire(&self, req_id: i32) -> bool {
    let mut active = self.active.lock();
    if active.contains(&req_id) {
      return true;
    }
    if active.len() >= self.max_count {
      return false;
    }
    active.insert(req_id);
    true
  }

  /// Returns whether the id held a slot.
  pub fn release(&self, req_id: i32) -> bool {
    self.active.lock().remove(&req_id)
  }

  pub fn active_count(&self) -> u32 {
    self.active.lock().len() as u32
  }
}

/// Caps how many events may start within a rolling window.
pub struct SlidingWindowRateLimiter {
  max_events: usize,
  window: Duration,
  events: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowRateLimiter {
  pub fn new(max_events: u32, window: Duration) -> Self {
    Self { max_events: max_events as usize, window, events: Mutex::new(VecDeque::new()) }
  }

  fn prune(&self, events: &mut VecDeque<Instant>, now: Instant) {
    while let Some(&oldest) = events.front() {
      if now.duration_since(oldest) >= self.window {
        events.pop_front();
      } else {
        break;
      }
    }
  }

  pub fn try_acquire(&self) -> bool {
    let now = Instant::now();
    let mut events = self.events.lock();
    self.prune(&mut events, now);
    if events.len() >= self.max_events {
      return false;
    }
    events.push_back(now);
    true
  }

  pub fn in_window(&self) -> u32 {
    let mut events = self.events.lock();
    self.prune(&mut events, Instant::now());
    events.len() as u32
  }
}

/// All limits applied to one session's outgoing traffic.
pub struct RateLimiter {
  config: RateLimiterConfig,
  messages: TokenBucketRateLimiter,
  historical_active: CounterRateLimiter,
  historical_window: SlidingWindowRateLimiter,
  messages_delayed: AtomicU64,
  requests_rejected: AtomicU64,
}

impl RateLimiter {
  pub fn new(config: RateLimiterConfig) -> Self {
    info!(
      "Rate limiting {} (msg/sec: {}, burst: {}, hist active: {}, hist per {:?}: {})",
      if config.enabled { "enabled" } else { "disabled" },
      config.max_messages_per_second, config.max_message_burst, config.max_historical_requests,
      config.historical_window, config.max_historical_per_window
    );
    Self {
      messages: TokenBucketRateLimiter::new(config.max_message_burst, config.max_messages_per_second),
      historical_active: CounterRateLimiter::new(config.max_historical_requests),
      historical_window: SlidingWindowRateLimiter::new(config.max_historical_per_window, config.historical_window),
      messages_delayed: AtomicU64::new(0),
      requests_rejected: AtomicU64::new(0),
      config,
    }
  }

  pub fn enabled(&self) -> bool {
    self.config.enabled
  }

  /// Wait for a message token.
  pub fn acquire_message(&self) -> Result<(), TwsError> {
    if !self.config.enabled || self.messages.try_acquire() {
      return Ok(());
    }
    self.messages_delayed.fetch_add(1, Ordering::Relaxed);
    if self.messages.acquire(self.config.rate_limit_wait_timeout) {
      Ok(())
    } else {
      self.requests_rejected.fetch_add(1, Ordering::Relaxed);
      warn!("Message rate limit: no token within {:?}", self.config.rate_limit_wait_timeout);
      Err(TwsError::RateLimitExceeded)
    }
  }

  /// Wait for a historical request slot. Both the in-flight cap and the
  /// rolling-window cap must admit the request.
  pub fn acquire_historical(&self, req_id: i32) -> Result<(), TwsError> {
    if !self.config.enabled {
      return Ok(());
    }
    let timeout = self.config.rate_limit_wait_timeout;
    if !poll_until(timeout, || self.historical_active.try_acquire(req_id)) {
      self.requests_rejected.fetch_add(1, Ordering::Relaxed);
      warn!("Historical request {}: {} already in flight", req_id, self.config.max_historical_requests);
      return Err(TwsError::RateLimitExceeded);
    }
    if !poll_until(timeout, || self.historical_window.try_acquire()) {
      self.historical_active.release(req_id);
      self.requests_rejected.fetch_add(1, Ordering::Relaxed);
      warn!(
        "Historical request {}: {} requests already started in the last {:?}",
        req_id, self.config.max_historical_per_window, self.config.historical_window
      );
      return Err(TwsError::RateLimitExceeded);
    }
    Ok(())
  }

  /// Free the in-flight slot held by `req_id`, if any.
  pub fn release_historical(&self, req_id: i32) {
    if self.config.enabled && self.historical_active.release(req_id) {
      debug!("Released historical slot for request {}", req_id);
    }
  }

  pub fn status(&self) -> RateLimiterStatus {
    RateLimiterStatus {
      enabled: self.config.enabled,
      available_message_tokens: self.messages.available(),
      active_historical_requests: self.historical_active.active_count(),
      historical_requests_in_window: self.historical_window.in_window(),
      messages_delayed: self.messages_delayed.load(Ordering::Relaxed),
      requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
    }
  }
}
