// ABOUTME: Utilities for working with times and wall-clock budgets.
// ABOUTME: Provides UTC timestamps and the deadline type used by job drivers.
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// Get the current UTC time
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// A wall-clock budget for a batch of work.
///
/// The deadline splits time into three phases: while `expired` is false new
/// work may be submitted; after that, in-flight work gets `grace` more time
/// before `grace_expired` reports it as abandoned.
#[derive(Debug, Clone)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
    grace: Duration,
}

impl Deadline {
    /// Start a deadline timer covering `budget` from now
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
            grace: Duration::from_secs(30),
        }
    }

    /// Override the grace window granted to in-flight work
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Whether the budget has elapsed; no new work may start past this point
    pub fn expired(&self) -> bool {
        self.started.elapsed() >= self.budget
    }

    /// Whether budget plus grace has elapsed; in-flight work is abandoned
    pub fn grace_expired(&self) -> bool {
        self.started.elapsed() >= self.budget + self.grace
    }

    /// Time left in the budget itself, zero once it has elapsed
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    /// Time left before the grace window closes, zero once it has
    pub fn remaining_with_grace(&self) -> Duration {
        (self.budget + self.grace).saturating_sub(self.started.elapsed())
    }
}
