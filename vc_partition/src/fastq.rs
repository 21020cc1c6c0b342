//! Shared FASTQ chunk planning and fetching.

use crate::{fastq_gzip, fastq_sra};
use anyhow::Result;
use std::path::{Path, PathBuf};
use vc_store::ObjectStore;
use vc_tools::ToolPaths;
use vc_types::{FastqChunk, FastqChunkSource};

/// Local FASTQ files of one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedReads {
    pub mate1: PathBuf,
    pub mate2: Option<PathBuf>,
}

/// Split `units` into at most `k` contiguous runs of `⌈units/k⌉`, as 0-based
/// half-open ranges. Runs that would start past the end are dropped, so fewer
/// than `k` runs come back when `units < k`.
pub(crate) fn split_even(units: u64, k: usize) -> Vec<(u64, u64)> {
    if units == 0 || k == 0 {
        return Vec::new();
    }
    let per_chunk = units.div_ceil(k as u64);
    (0..k as u64)
        .map(|i| (i * per_chunk, ((i + 1) * per_chunk).min(units)))
        .take_while(|(start, _)| *start < units)
        .collect()
}

/// Materialize the reads of `chunk` under `dir`.
pub fn fetch_fastq_chunk(
    store: &dyn ObjectStore,
    tools: &ToolPaths,
    chunk: &FastqChunk,
    dir: &Path,
) -> Result<FetchedReads> {
    match &chunk.source {
        FastqChunkSource::Gzip {
            line_0,
            line_1,
            mate1,
            mate2,
        } => {
            let first = fastq_gzip::fetch_lines(
                store,
                tools,
                chunk.chunk_id,
                mate1,
                *line_0,
                *line_1,
                &dir.join(format!("chunk{}_1.fastq", chunk.chunk_id)),
            )?;
            let second = match mate2 {
                Some(window) => Some(fastq_gzip::fetch_lines(
                    store,
                    tools,
                    chunk.chunk_id,
                    window,
                    *line_0,
                    *line_1,
                    &dir.join(format!("chunk{}_2.fastq", chunk.chunk_id)),
                )?),
                None => None,
            };
            Ok(FetchedReads {
                mate1: first,
                mate2: second,
            })
        }
        FastqChunkSource::Sra {
            accession,
            read_0,
            read_1,
        } => fastq_sra::fetch_reads(tools, chunk.chunk_id, accession, *read_0, *read_1, dir),
    }
}
