pub mod config;
pub mod error;
pub mod memory;
pub mod model;
pub mod statement;
pub mod store;
pub mod write;

use crate::config::WriterConfig;
use crate::error::WriteError;
use crate::model::{ModificationRequest, ModificationResult};
use crate::statement::{PsqlStatementBuilder, StatementBuilder};
use crate::store::ConnectionProvider;
use crate::write::{Dispatcher, RequestContext, run_with_retry};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

pub use crate::error::{ErrorClass, StoreError};
pub use crate::model::{Feature, Geometry, Space};

/// Write engine for one feature store: applies modification requests through
/// the connections handed out by `P`.
pub struct SpaceWriter<P: ConnectionProvider> {
    provider: P,
    config: WriterConfig,
    builder: Box<dyn StatementBuilder + Send + Sync>,
}

impl<P: ConnectionProvider> SpaceWriter<P> {
    pub fn new(provider: P, config: WriterConfig) -> Result<Self, WriteError> {
        config.validate()?;
        Ok(Self {
            provider,
            config,
            builder: Box::new(PsqlStatementBuilder::default()),
        })
    }

    pub fn with_statement_builder(
        mut self,
        builder: impl StatementBuilder + Send + Sync + 'static,
    ) -> Self {
        self.builder = Box::new(builder);
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Applies `request`, which must complete before `deadline`.
    ///
    /// Per-row failures are reported in the result; an `Err` means nothing
    /// reliable can be said about the request beyond its error class. An
    /// all-or-nothing request with failed rows returns [`WriteError::Conflict`]
    /// carrying them.
    pub fn modify_features(
        &self,
        request: ModificationRequest,
        deadline: Instant,
    ) -> Result<ModificationResult, WriteError> {
        if request.is_empty() {
            return Ok(ModificationResult::default());
        }
        let stream_id = request
            .stream_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let ctx = RequestContext::new(stream_id, deadline, &self.config);
        let started = Instant::now();
        let dispatcher = Dispatcher::new(&self.provider, self.builder.as_ref());

        let result = run_with_retry(&dispatcher, &request, ctx.clone());
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(done) => info!(
                stream_id = %ctx.stream_id,
                table = %request.space.table,
                inserted = done.inserted.len(),
                updated = done.updated.len(),
                deleted = done.deleted.len(),
                failed = done.failed.len(),
                version = ?done.version,
                elapsed_ms,
                "modify features finished"
            ),
            Err(err) => warn!(
                stream_id = %ctx.stream_id,
                table = %request.space.table,
                class = err.class_str(),
                error = %err,
                elapsed_ms,
                "modify features failed"
            ),
        }
        result
    }

    /// [`Self::modify_features`] with a deadline `budget` from now.
    pub fn modify_features_within(
        &self,
        request: ModificationRequest,
        budget: Duration,
    ) -> Result<ModificationResult, WriteError> {
        self.modify_features(request, Instant::now() + budget)
    }
}
