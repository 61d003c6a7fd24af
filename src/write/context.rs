use crate::config::WriterConfig;
use crate::error::StoreError;
use std::time::{Duration, Instant};
use tracing::debug;

/// Remaining-time accounting for one request.
#[derive(Debug, Clone, Copy)]
pub struct TimeBudget {
    deadline: Instant,
    ceiling: Duration,
    floor: Duration,
    margin: Duration,
}

impl TimeBudget {
    pub fn new(deadline: Instant, config: &WriterConfig) -> Self {
        Self {
            deadline,
            ceiling: config.statement_timeout_ceiling,
            floor: config.min_remaining_for_retry,
            margin: config.timeout_safety_margin,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether enough time is left to start another statement or attempt.
    pub fn is_sufficient(&self) -> bool {
        self.remaining() > self.floor
    }

    /// Timeout for the next statement: `min(remaining, ceiling) - margin`.
    /// Fails with a no-time-left error instead of issuing a doomed statement.
    pub fn statement_timeout(&self) -> Result<Duration, StoreError> {
        if !self.is_sufficient() {
            debug!(
                remaining_ms = self.remaining().as_millis() as u64,
                "no time left to execute query"
            );
            return Err(StoreError::no_time_left());
        }
        let timeout = self
            .remaining()
            .min(self.ceiling)
            .saturating_sub(self.margin);
        if timeout.is_zero() {
            return Err(StoreError::no_time_left());
        }
        debug!(timeout_ms = timeout.as_millis() as u64, "statement timeout set");
        Ok(timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    NotAttempted,
    Attempted,
}

/// Immutable per-attempt state threaded through every stage of a write.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub stream_id: String,
    pub budget: TimeBudget,
    pub retry: RetryState,
    pub nowait: bool,
    pub max_batch_rows: usize,
}

impl RequestContext {
    pub fn new(stream_id: impl Into<String>, deadline: Instant, config: &WriterConfig) -> Self {
        Self {
            stream_id: stream_id.into(),
            budget: TimeBudget::new(deadline, config),
            retry: RetryState::NotAttempted,
            nowait: config.enable_nowait,
            max_batch_rows: config.max_batch_rows,
        }
    }

    pub fn retry_attempted(&self) -> bool {
        self.retry == RetryState::Attempted
    }

    /// The context of the single permitted retry.
    pub fn for_retry(&self) -> Self {
        Self {
            retry: RetryState::Attempted,
            ..self.clone()
        }
    }

    pub fn statement_timeout(&self) -> Result<Duration, StoreError> {
        self.budget.statement_timeout()
    }
}
