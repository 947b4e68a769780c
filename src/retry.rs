//! Failure backoff for downloads.
//!
//! Failures are counted per (mirror, target) pair. After the n-th failure
//! the pair must wait the n-th configured delay (the last delay repeats)
//! before it is tried again. A count is forgotten once the reset period
//! has passed without a new failure.

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use crate::config::ScheduleConfig;
use crate::schedule::{Mirror, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FailureRecord {
    count: u32,
    /// Time of the most recent failure.
    last: i64,
}

/// Backoff bookkeeping for every (mirror, target) pair that has failed.
#[derive(Debug, Clone)]
pub struct Backoff {
    delays: Vec<Duration>,
    reset: Duration,
    records: HashMap<(Mirror, Target), FailureRecord>,
}

fn secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

impl Backoff {
    pub fn new(config: &ScheduleConfig) -> Self {
        Backoff {
            delays: config.retry_delays.clone(),
            reset: config.failure_reset,
            records: HashMap::new(),
        }
    }

    /// The wait imposed after `failures` consecutive failures.
    pub fn delay_after(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let idx = (failures as usize - 1).min(self.delays.len().saturating_sub(1));
        self.delays.get(idx).copied().unwrap_or(Duration::ZERO)
    }

    fn live_record(&self, key: &(Mirror, Target), now: i64) -> Option<FailureRecord> {
        self.records
            .get(key)
            .copied()
            .filter(|r| now - r.last < secs(self.reset))
    }

    /// Note a failure; returns the pair's failure count including this one.
    pub fn record_failure(&mut self, mirror: &Mirror, target: &Target, now: i64) -> u32 {
        let key = (mirror.clone(), target.clone());
        let count = self.live_record(&key, now).map_or(0, |r| r.count) + 1;
        self.records.insert(key, FailureRecord { count, last: now });
        debug!(
            mirror = %mirror,
            target = %target,
            failures = count,
            delay = ?self.delay_after(count),
            "download failed"
        );
        count
    }

    /// Forget the failures of a pair that just succeeded.
    pub fn record_success(&mut self, mirror: &Mirror, target: &Target) {
        self.records.remove(&(mirror.clone(), target.clone()));
    }

    /// Current failure count of a pair.
    pub fn failures(&self, mirror: &Mirror, target: &Target, now: i64) -> u32 {
        self.live_record(&(mirror.clone(), target.clone()), now)
            .map_or(0, |r| r.count)
    }

    /// Earliest time the pair may be tried again.
    pub fn ready_at(&self, mirror: &Mirror, target: &Target, now: i64) -> i64 {
        match self.live_record(&(mirror.clone(), target.clone()), now) {
            Some(r) => r.last + secs(self.delay_after(r.count)),
            None => now,
        }
    }

    pub fn is_ready(&self, mirror: &Mirror, target: &Target, now: i64) -> bool {
        self.ready_at(mirror, target, now) <= now
    }

    /// Earliest time any of `mirrors` may be tried for `target`; `None` if
    /// there are no mirrors.
    pub fn first_ready_at<'a, I>(&self, mirrors: I, target: &Target, now: i64) -> Option<i64>
    where
        I: IntoIterator<Item = &'a Mirror>,
    {
        mirrors
            .into_iter()
            .map(|m| self.ready_at(m, target, now))
            .min()
    }

    /// Drop records whose reset period has passed.
    pub fn expire(&mut self, now: i64) {
        let reset = secs(self.reset);
        self.records.retain(|_, r| now - r.last < reset);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
