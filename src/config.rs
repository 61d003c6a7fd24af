use crate::error::WriteError;
use std::time::Duration;

/// Runtime configuration for a [`crate::SpaceWriter`].
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Upper bound for any single statement, regardless of the request budget.
    pub statement_timeout_ceiling: Duration,
    /// Below this much remaining request time no statement is issued and no
    /// retry is attempted.
    pub min_remaining_for_retry: Duration,
    /// Subtracted from every statement timeout so the caller still has time to
    /// assemble a response.
    pub timeout_safety_margin: Duration,
    /// Fail row updates immediately instead of waiting on rows locked by
    /// another writer.
    pub enable_nowait: bool,
    /// Rows per operation kind accepted in one request.
    pub max_batch_rows: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            statement_timeout_ceiling: Duration::from_secs(23),
            min_remaining_for_retry: Duration::from_secs(3),
            timeout_safety_margin: Duration::from_secs(2),
            enable_nowait: false,
            max_batch_rows: 10_000,
        }
    }
}

impl WriterConfig {
    /// Profile for short-lived invocations with a hard execution limit.
    pub fn serverless() -> Self {
        Self::default()
    }

    /// Profile for long-running service processes that can afford slow statements.
    pub fn long_running() -> Self {
        Self {
            statement_timeout_ceiling: Duration::from_secs(300),
            min_remaining_for_retry: Duration::from_secs(5),
            ..Self::default()
        }
    }

    pub fn with_statement_timeout_ceiling(mut self, ceiling: Duration) -> Self {
        self.statement_timeout_ceiling = ceiling;
        self
    }

    pub fn with_min_remaining_for_retry(mut self, floor: Duration) -> Self {
        self.min_remaining_for_retry = floor;
        self
    }

    pub fn with_timeout_safety_margin(mut self, margin: Duration) -> Self {
        self.timeout_safety_margin = margin;
        self
    }

    pub fn with_nowait(mut self, enabled: bool) -> Self {
        self.enable_nowait = enabled;
        self
    }

    pub fn with_max_batch_rows(mut self, rows: usize) -> Self {
        self.max_batch_rows = rows;
        self
    }

    pub fn validate(&self) -> Result<(), WriteError> {
        if self.statement_timeout_ceiling.is_zero() {
            return Err(WriteError::IllegalArgument(
                "statement timeout ceiling must be positive".into(),
            ));
        }
        if self.timeout_safety_margin >= self.statement_timeout_ceiling {
            return Err(WriteError::IllegalArgument(format!(
                "timeout safety margin {:?} must be below the statement ceiling {:?}",
                self.timeout_safety_margin, self.statement_timeout_ceiling
            )));
        }
        if self.max_batch_rows == 0 {
            return Err(WriteError::IllegalArgument(
                "max batch rows must be positive".into(),
            ));
        }
        Ok(())
    }
}
