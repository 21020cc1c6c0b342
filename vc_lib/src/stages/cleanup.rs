//! Delete the scratch objects of a run, keeping the final artifact.

use crate::context::RunContext;
use anyhow::{Context, Result};
use log::info;

/// Most keys a single batch delete accepts.
const DELETE_BATCH: usize = 1000;

/// Returns the number of deleted keys.
pub fn clean_scratch(ctx: &RunContext) -> Result<usize> {
    let prefix = ctx.keys.scratch_prefix();
    let keep = ctx.keys.final_artifact();
    let keys: Vec<String> = ctx
        .store()
        .list(ctx.bucket(), &prefix)?
        .into_iter()
        .filter(|k| *k != keep)
        .collect();
    for batch in keys.chunks(DELETE_BATCH) {
        ctx.store()
            .delete_many(ctx.bucket(), batch)
            .with_context(|| format!("deleting scratch objects under {prefix}"))?;
    }
    info!("deleted {} scratch objects under {prefix}", keys.len());
    Ok(keys.len())
}
