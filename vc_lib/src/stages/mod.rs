//! Pipeline stages, in execution order.

pub mod align_map1;
pub mod align_map2;
pub mod cleanup;
pub mod fasta_partition;
pub mod fastq_partition;
pub mod final_assembly;
pub mod index_correction;
pub mod prepare_gem;
pub mod range_partition;
pub mod reduce_mpileup;

use crate::context::RunContext;
use anyhow::{Context, Result};
use std::path::Path;
use vc_store::Metadata;
use vc_tools::compress::{compress_file, decompress_to_file};
use vc_tools::ToolError;
use vc_types::PipelineError;

/// Turn a tool that ran and failed into the pipeline error kind of its call
/// site; other tool errors pass through.
pub(crate) fn tool_failure(
    err: ToolError,
    kind: impl FnOnce(Option<i32>, String) -> PipelineError,
) -> anyhow::Error {
    match err.exit_status() {
        Some((code, stderr)) => kind(code, stderr.to_string()).into(),
        None => err.into(),
    }
}

/// bz2-compress `path` and upload it to `key` in the run bucket.
pub(crate) fn upload_bz2(ctx: &RunContext, path: &Path, key: &str) -> Result<()> {
    let compressed = path.with_extension("bz2");
    compress_file(path, &compressed)?;
    ctx.store()
        .put_file(ctx.bucket(), key, &compressed, &Metadata::new())
        .with_context(|| format!("uploading {key}"))?;
    Ok(())
}

/// Download the `.bz2` object `key` of the run bucket, decompressed, into
/// `dest`.
pub(crate) fn download_bz2(ctx: &RunContext, key: &str, dest: &Path) -> Result<u64> {
    let body = ctx
        .store()
        .get_stream(ctx.bucket(), key, None)
        .with_context(|| format!("downloading {key}"))?;
    decompress_to_file(body, dest).with_context(|| format!("decompressing {key}"))
}
