//! Latency and outcome accounting for a dispatcher run.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::protocol::{AbortReason, Outcome};
use crate::types::{Action, UserId};

/// Final record of one request after its last attempt settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Completion {
    /// Position of the request in the input stream.
    pub sequence: u64,
    pub action: Action,
    pub user_id: UserId,
    pub outcome: Outcome,
    /// Prepare/execute rounds spent, including retries.
    pub attempts: u32,
    /// Messages returned; always zero for posts.
    pub messages: usize,
}

impl Completion {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

/// Counters for one action kind.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ActionStats {
    pub requests: u64,
    pub committed: u64,
    pub failed: u64,
    pub stale: u64,
    pub capacity_exhausted: u64,
    pub faults: u64,
    pub retries: u64,
    pub attempts: u64,
    pub prepare_nanos: u64,
    pub execute_nanos: u64,
    pub messages: u64,
}

impl ActionStats {
    /// Mean prepare plus execute time per attempt.
    pub fn average_latency(&self) -> Duration {
        if self.attempts == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((self.prepare_nanos + self.execute_nanos) / self.attempts)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub fetch: ActionStats,
    pub post: ActionStats,
}

impl Stats {
    pub fn action(&self, action: Action) -> &ActionStats {
        match action {
            Action::Fetch => &self.fetch,
            Action::Post => &self.post,
        }
    }

    fn action_mut(&mut self, action: Action) -> &mut ActionStats {
        match action {
            Action::Fetch => &mut self.fetch,
            Action::Post => &mut self.post,
        }
    }

    pub fn record_prepare(&mut self, action: Action, elapsed: Duration) {
        let stats = self.action_mut(action);
        stats.attempts += 1;
        stats.prepare_nanos += saturating_nanos(elapsed);
    }

    pub fn record_execute(&mut self, action: Action, elapsed: Duration) {
        self.action_mut(action).execute_nanos += saturating_nanos(elapsed);
    }

    pub fn record_retry(&mut self, action: Action) {
        self.action_mut(action).retries += 1;
    }

    pub fn record_completion(&mut self, completion: &Completion) {
        let stats = self.action_mut(completion.action);
        stats.requests += 1;
        stats.messages += completion.messages as u64;
        match completion.outcome {
            Outcome::Committed => stats.committed += 1,
            Outcome::Aborted(reason) => {
                stats.failed += 1;
                match reason {
                    AbortReason::Stale => stats.stale += 1,
                    AbortReason::CapacityExhausted => stats.capacity_exhausted += 1,
                    AbortReason::Fault => stats.faults += 1,
                }
            }
        }
    }
}

fn saturating_nanos(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
}

/// Everything a dispatcher run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub elapsed_nanos: u64,
    pub stats: Stats,
    #[serde(skip)]
    pub completions: Vec<Completion>,
}

impl RunReport {
    pub fn new(elapsed: Duration, stats: Stats, completions: Vec<Completion>) -> Self {
        Self {
            elapsed_nanos: saturating_nanos(elapsed),
            stats,
            completions,
        }
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_nanos)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Stats { fetch, post } = &self.stats;
        writeln!(f, "Time: {} ns", self.elapsed_nanos)?;
        writeln!(
            f,
            "Fetch: {} ns average, {}/{} failed, {} messages",
            fetch.average_latency().as_nanos(),
            fetch.failed,
            fetch.requests,
            fetch.messages
        )?;
        write!(
            f,
            "Post: {} ns average, {}/{} failed",
            post.average_latency().as_nanos(),
            post.failed,
            post.requests
        )
    }
}
