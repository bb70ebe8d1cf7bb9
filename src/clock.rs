//! Time source for TTL bookkeeping.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

/// Wall-clock time in epoch milliseconds.
pub trait Clock: Send + Sync {
  fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now_millis(&self) -> i64 {
    Utc::now().timestamp_millis()
  }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
  now: AtomicI64,
}

impl ManualClock {
  pub fn new(start_millis: i64) -> Self {
    Self {
      now: AtomicI64::new(start_millis),
    }
  }

  pub fn advance(&self, millis: i64) {
    self.now.fetch_add(millis, Ordering::SeqCst);
  }

  pub fn set(&self, millis: i64) {
    self.now.store(millis, Ordering::SeqCst);
  }
}

impl Clock for ManualClock {
  fn now_millis(&self) -> i64 {
    self.now.load(Ordering::SeqCst)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn manual_clock_moves_only_on_request() {
    let clock = ManualClock::new(1_000);
    assert_eq!(clock.now_millis(), 1_000);
    clock.advance(500);
    assert_eq!(clock.now_millis(), 1_500);
    clock.set(10);
    assert_eq!(clock.now_millis(), 10);
  }
}
