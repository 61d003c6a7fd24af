use crate::error::WriteError;
use crate::model::{ModificationRequest, ModificationResult, Space};
use crate::store::{ConnectionProvider, ReadConnection, WriteConnection};
use crate::write::context::RequestContext;
use crate::write::dispatch::{AttemptError, Dispatcher, RetryReason};
use tracing::{info, warn};

/// Attempts beyond the first one.
pub const MAX_RETRIES: usize = 1;

/// Runs `request` through the dispatcher, restarting it from scratch once
/// when the first attempt fails in a retryable way and time remains.
pub fn run_with_retry<P: ConnectionProvider>(
    dispatcher: &Dispatcher<'_, P>,
    request: &ModificationRequest,
    ctx: RequestContext,
) -> Result<ModificationResult, WriteError> {
    let mut ctx = ctx;
    let mut last_error = None;
    for attempt in 0..=MAX_RETRIES {
        let (error, reason) = match dispatcher.run(request.clone(), &ctx) {
            Ok(result) => return Ok(result),
            Err(AttemptError::Fatal(error)) => return Err(error.surface()),
            Err(AttemptError::Retryable { error, reason }) => (error, reason),
        };

        if ctx.retry_attempted() {
            warn!(
                stream_id = %ctx.stream_id,
                attempt,
                reason = reason.as_str(),
                error = %error,
                "write failed after retry"
            );
            return Err(error.surface());
        }
        if !ctx.budget.is_sufficient() {
            warn!(
                stream_id = %ctx.stream_id,
                remaining_ms = ctx.budget.remaining().as_millis() as u64,
                reason = reason.as_str(),
                error = %error,
                "no time left to retry write"
            );
            return Err(WriteError::Timeout(
                "No time for retry left for database query.".into(),
            ));
        }

        match reason {
            RetryReason::Transient => {
                warn!(stream_id = %ctx.stream_id, error = %error, "transient failure, retrying");
            }
            RetryReason::MissingTable | RetryReason::Unexpected => {
                info!(
                    stream_id = %ctx.stream_id,
                    reason = reason.as_str(),
                    error = %error,
                    "write failed, ensuring table before retry"
                );
                ensure_space(dispatcher.provider(), &request.space, &ctx)
                    .map_err(WriteError::surface)?;
            }
        }
        last_error = Some(error);
        ctx = ctx.for_retry();
    }
    Err(last_error
        .map(WriteError::surface)
        .unwrap_or_else(|| WriteError::Exception("write attempts exhausted".into())))
}

fn ensure_space<P: ConnectionProvider>(
    provider: &P,
    space: &Space,
    ctx: &RequestContext,
) -> Result<(), WriteError> {
    let mut conn = provider.primary()?;
    if conn.table_exists(&space.table, ctx.statement_timeout()?)? {
        return Ok(());
    }
    if conn.ensure_table(space, ctx.statement_timeout()?)? {
        info!(stream_id = %ctx.stream_id, table = %space.table, "created missing space table");
    }
    Ok(())
}
