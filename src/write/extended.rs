use crate::error::WriteError;
use crate::model::{Feature, ModificationRequest};
use crate::store::ReadConnection;
use crate::write::context::RequestContext;
use std::collections::HashSet;
use tracing::debug;

/// Rewrites deletes and updates aimed at a space that overlays a base space.
///
/// A physical delete in the extension cannot hide an inherited base row, so a
/// delete of an id present in the base becomes a tombstone upsert. Updates
/// become upserts because the row may so far only exist in the base.
pub fn resolve_extending_space<R: ReadConnection + ?Sized>(
    replica: &mut R,
    request: &mut ModificationRequest,
    ctx: &RequestContext,
) -> Result<(), WriteError> {
    let Some(base) = request.space.base.clone() else {
        return Err(WriteError::IllegalArgument(format!(
            "space '{}' is written as an extension but names no base table",
            request.space.table
        )));
    };

    let in_base = if request.deletes.is_empty() {
        HashSet::new()
    } else {
        let ids: Vec<String> = request.deletes.keys().cloned().collect();
        replica.existing_ids(&base, &ids, ctx.statement_timeout()?)?
    };
    rewrite_for_extension(request, &in_base);
    Ok(())
}

/// The pure rewrite, given the delete targets found in the base layer.
pub fn rewrite_for_extension(request: &mut ModificationRequest, in_base: &HashSet<String>) {
    let tombstoned: Vec<String> = request
        .deletes
        .keys()
        .filter(|id| in_base.contains(*id))
        .cloned()
        .collect();
    let tombstones = tombstoned.len();
    for id in tombstoned {
        if let Some(puuid) = request.deletes.remove(&id) {
            request.upserts.push(Feature::tombstone(id, puuid));
        }
    }

    let converted = request.updates.len();
    request.upserts.append(&mut request.updates);
    debug!(
        tombstones,
        converted_updates = converted,
        "rewrote extension request"
    );
}
