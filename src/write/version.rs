use crate::error::{StoreError, WriteError};
use crate::store::WriteConnection;
use crate::write::context::RequestContext;
use tracing::debug;

/// Fetches the next global version for `table`.
///
/// Always runs on the primary connection: a replica may serve a stale
/// sequence value.
pub fn allocate_version<C: WriteConnection + ?Sized>(
    primary: &mut C,
    table: &str,
    ctx: &RequestContext,
) -> Result<i64, WriteError> {
    let version = primary.next_version(table, ctx.statement_timeout()?)?;
    if version <= 0 {
        return Err(StoreError::without_state(format!(
            "version sequence of '{table}' returned {version}"
        ))
        .into());
    }
    debug!(stream_id = %ctx.stream_id, table, version, "allocated version");
    Ok(version)
}
