// twshist/src/registry.rs
// Pending-request bookkeeping shared by the reader thread and callers.
//
// The reader thread is the only writer of fragments and terminal signals.
// Callers register an id, issue the request, block in `wait`, and remove
// their own entry afterwards. Callbacks for ids no longer registered are
// dropped.

use crate::base::TwsError;
use crate::data::RawBar;
use log::{debug, trace};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
  HistoricalWindow,
  Fundamental,
  /// Cannot be cancelled on the wire (e.g. the current-time probe).
  Other,
}

/// One piece of data delivered for a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
  Bar(RawBar),
  Text(String),
}

/// How a wait ended. Every variant carries what was buffered.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
  Completed(Vec<Fragment>),
  Failed(TwsError, Vec<Fragment>),
  TimedOut(Vec<Fragment>),
}

#[derive(Debug, Clone, PartialEq)]
enum Terminal {
  Done,
  Error(TwsError),
}

#[derive(Debug, Default)]
struct RequestState {
  fragments: Vec<Fragment>,
  terminal: Option<Terminal>,
}

#[derive(Debug)]
pub struct PendingRequest {
  req_id: i32,
  kind: RequestKind,
  state: Mutex<RequestState>,
  gate: Condvar,
}

impl PendingRequest {
  fn new(req_id: i32, kind: RequestKind) -> Self {
    PendingRequest {
      req_id,
      kind,
      state: Mutex::new(RequestState::default()),
      gate: Condvar::new(),
    }
  }

  pub fn req_id(&self) -> i32 {
    self.req_id
  }

  pub fn kind(&self) -> RequestKind {
    self.kind
  }

  pub fn is_terminal(&self) -> bool {
    self.state.lock().terminal.is_some()
  }

  pub fn fragment_count(&self) -> usize {
    self.state.lock().fragments.len()
  }

  fn push(&self, fragment: Fragment) -> bool {
    let mut state = self.state.lock();
    if state.terminal.is_some() {
      trace!("Dropping fragment for request {} after terminal signal", self.req_id);
      return false;
    }
    state.fragments.push(fragment);
    true
  }

  fn finish(&self, terminal: Terminal) -> bool {
    let mut state = self.state.lock();
    if state.terminal.is_some() {
      debug!("Request {} already terminal, ignoring {:?}", self.req_id, terminal);
      return false;
    }
    state.terminal = Some(terminal);
    self.gate.notify_all();
    true
  }

  /// Block until a terminal signal arrives or `timeout` elapses. The
  /// buffered fragments are moved out; a second call sees none.
  pub fn wait(&self, timeout: Duration) -> WaitOutcome {
    let start_time = Instant::now();
    let mut state = self.state.lock();
    loop {
      match state.terminal.clone() {
        Some(Terminal::Done) => return WaitOutcome::Completed(std::mem::take(&mut state.fragments)),
        Some(Terminal::Error(e)) => return WaitOutcome::Failed(e, std::mem::take(&mut state.fragments)),
        None => {}
      }

      let elapsed = start_time.elapsed();
      if elapsed >= timeout {
        return WaitOutcome::TimedOut(std::mem::take(&mut state.fragments));
      }
      // Spurious wakeups and timeouts both loop back to re-check.
      let _ = self.gate.wait_for(&mut state, timeout - elapsed);
    }
  }
}

/// Map from request id to its pending state.
#[derive(Debug, Default)]
pub struct RequestRegistry {
  requests: Mutex<HashMap<i32, Arc<PendingRequest>>>,
}

impl RequestRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&self, req_id: i32, kind: RequestKind) -> Result<Arc<PendingRequest>, TwsError> {
    let mut requests = self.requests.lock();
    if requests.contains_key(&req_id) {
      return Err(TwsError::DuplicateRequestId(req_id));
    }
    let pending = Arc::new(PendingRequest::new(req_id, kind));
    requests.insert(req_id, pending.clone());
    trace!("Registered request {} ({:?})", req_id, kind);
    Ok(pending)
  }

  pub fn get(&self, req_id: i32) -> Option<Arc<PendingRequest>> {
    self.requests.lock().get(&req_id).cloned()
  }

  fn lookup(&self, req_id: i32) -> Option<Arc<PendingRequest>> {
    let found = self.get(req_id);
    if found.is_none() {
      trace!("No pending request {}, dropping callback", req_id);
    }
    found
  }

  /// Buffer a fragment. Returns false if the id is unknown or already terminal.
  pub fn append(&self, req_id: i32, fragment: Fragment) -> bool {
    self.lookup(req_id).map_or(false, |p| p.push(fragment))
  }

  /// Signal successful completion. Returns false if another terminal won.
  pub fn complete(&self, req_id: i32) -> bool {
    self.lookup(req_id).map_or(false, |p| p.finish(Terminal::Done))
  }

  /// Signal failure. Returns false if another terminal won.
  pub fn fail(&self, req_id: i32, error: TwsError) -> bool {
    self.lookup(req_id).map_or(false, |p| p.finish(Terminal::Error(error)))
  }

  /// Fail every registered request. Returns how many were newly failed.
  pub fn fail_all(&self, error: &TwsError) -> usize {
    // Snapshot first so the map lock is not held while notifying.
    let pending: Vec<Arc<PendingRequest>> = self.requests.lock().values().cloned().collect();
    pending.iter().filter(|p| p.finish(Terminal::Error(error.clone()))).count()
  }

  pub fn remove(&self, req_id: i32) -> Option<Arc<PendingRequest>> {
    self.requests.lock().remove(&req_id)
  }

  pub fn contains(&self, req_id: i32) -> bool {
    self.requests.lock().contains_key(&req_id)
  }

  pub fn len(&self) -> usize {
    self.requests.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread;

  fn raw(date: &str) -> Fragment {
    Fragment::Bar(RawBar {
      date: date.to_string(),
      open: 1.0,
      high: 2.0,
      low: 0.5,
      close: 1.5,
      volume: 10.0,
      wap: 1.2,
      count: 3,
    })
  }

  #[test]
  fn duplicate_registration_is_rejected() {
    let reg = RequestRegistry::new();
    reg.register(7, RequestKind::HistoricalWindow).unwrap();
    assert_eq!(reg.register(7, RequestKind::Other).unwrap_err(), TwsError::DuplicateRequestId(7));
    assert_eq!(reg.len(), 1);
  }

  #[test]
  fn fragments_then_done() {
    let reg = RequestRegistry::new();
    let p = reg.register(1, RequestKind::HistoricalWindow).unwrap();
    assert!(reg.append(1, raw("20240102")));
    assert!(reg.append(1, raw("20240103")));
    assert!(reg.complete(1));
    assert!(!reg.append(1, raw("20240104")));
    match p.wait(Duration::from_millis(10)) {
      WaitOutcome::Completed(frags) => assert_eq!(frags, vec![raw("20240102"), raw("20240103")]),
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn unknown_and_removed_ids_are_dropped() {
    let reg = RequestRegistry::new();
    assert!(!reg.append(99, raw("20240102")));
    assert!(!reg.complete(99));
    reg.register(5, RequestKind::Other).unwrap();
    assert!(reg.remove(5).is_some());
    assert!(!reg.contains(5));
    assert!(!reg.fail(5, TwsError::Timeout("late".into())));
    assert!(reg.is_empty());
  }

  #[test]
  fn timeout_keeps_partial_fragments() {
    let reg = RequestRegistry::new();
    let p = reg.register(3, RequestKind::HistoricalWindow).unwrap();
    for d in ["20240102", "20240103", "20240104", "20240105", "20240108"] {
      reg.append(3, raw(d));
    }
    match p.wait(Duration::from_millis(20)) {
      WaitOutcome::TimedOut(frags) => assert_eq!(frags.len(), 5),
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn first_terminal_wins_under_contention() {
    for round in 0..50 {
      let reg = RequestRegistry::new();
      let p = reg.register(round, RequestKind::HistoricalWindow).unwrap();
      let mut wins = Vec::new();
      crossbeam::scope(|s| {
        let h1 = s.spawn(|_| reg.complete(round));
        let h2 = s.spawn(|_| reg.fail(round, TwsError::RequestFatal(162, "rejected".into())));
        let h3 = s.spawn(|_| {
          for _ in 0..10 {
            reg.append(round, raw("20240102"));
          }
          false
        });
        wins.push(h1.join().unwrap());
        wins.push(h2.join().unwrap());
        wins.push(h3.join().unwrap());
      })
      .unwrap();
      assert_eq!(wins.iter().filter(|w| **w).count(), 1);

      let outcome = p.wait(Duration::from_millis(10));
      let completed_won = wins[0];
      match outcome {
        WaitOutcome::Completed(_) => assert!(completed_won),
        WaitOutcome::Failed(TwsError::RequestFatal(162, _), _) => assert!(!completed_won),
        other => panic!("unexpected {:?}", other),
      }
      // Later terminals never change the recorded outcome.
      assert!(!reg.complete(round));
      assert!(p.is_terminal());
    }
  }

  #[test]
  fn connection_fatal_fans_out_to_every_waiter() {
    let reg = Arc::new(RequestRegistry::new());
    let waiters: Vec<_> = (0..8)
      .map(|id| {
        let p = reg.register(100 + id, RequestKind::HistoricalWindow).unwrap();
        thread::spawn(move || p.wait(Duration::from_secs(10)))
      })
      .collect();

    // One request already finished must not be overwritten.
    reg.register(200, RequestKind::Other).unwrap();
    reg.complete(200);

    thread::sleep(Duration::from_millis(20));
    let err = TwsError::ConnectionFatal(1100, "Connectivity between IB and TWS has been lost".into());
    assert_eq!(reg.fail_all(&err), 8);

    for w in waiters {
      match w.join().unwrap() {
        WaitOutcome::Failed(TwsError::ConnectionFatal(1100, _), _) => {}
        other => panic!("unexpected {:?}", other),
      }
    }
  }
}
