use crate::error::WriteError;
use crate::model::Feature;
use crate::store::ReadConnection;
use crate::write::context::RequestContext;
use std::collections::HashSet;

/// Splits upserts into `(inserts, updates)` by probing which ids already exist
/// in `table`.
pub fn classify_upserts<R: ReadConnection + ?Sized>(
    replica: &mut R,
    table: &str,
    upserts: Vec<Feature>,
    ctx: &RequestContext,
) -> Result<(Vec<Feature>, Vec<Feature>), WriteError> {
    if upserts.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }
    let ids: Vec<String> = upserts.iter().filter_map(|f| f.id.clone()).collect();
    let existing = if ids.is_empty() {
        HashSet::new()
    } else {
        replica.existing_ids(table, &ids, ctx.statement_timeout()?)?
    };
    Ok(partition_upserts(upserts, &existing))
}

/// Features without an id are always inserts. Order within each side follows
/// the input.
pub fn partition_upserts(
    upserts: Vec<Feature>,
    existing: &HashSet<String>,
) -> (Vec<Feature>, Vec<Feature>) {
    upserts
        .into_iter()
        .partition(|f| f.id().is_none_or(|id| !existing.contains(id)))
}
