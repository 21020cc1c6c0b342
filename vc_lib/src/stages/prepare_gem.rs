//! Index every fasta chunk with `gem-indexer`, caching the `.gem` under a key
//! derived from the reference and the chunk count so later runs reuse it.

use super::tool_failure;
use crate::context::RunContext;
use crate::stage::PipelineStage;
use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use vc_partition::fasta_chunks::fetch_fasta_chunk;
use vc_store::Metadata;
use vc_tools::names;
use vc_types::keys::gem_chunk_key;
use vc_types::{FastaChunk, PipelineError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GemChunk {
    pub fasta_chunk: usize,
    pub key: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PrepareGem;

impl PipelineStage for PrepareGem {
    const NAME: &'static str = "prepare_gem";
    type StageInputs = Vec<FastaChunk>;
    type StageOutputs = Vec<GemChunk>;
    type ChunkInputs = FastaChunk;
    type ChunkOutputs = GemChunk;

    fn split(&self, _ctx: &RunContext, chunks: &Vec<FastaChunk>) -> Result<Vec<FastaChunk>> {
        Ok(chunks.clone())
    }

    fn main(&self, ctx: &RunContext, chunk: FastaChunk) -> Result<GemChunk> {
        let key = gem_chunk_key(&ctx.fasta_key, ctx.params.fasta_chunks, chunk.chunk_id);
        let gem = GemChunk {
            fasta_chunk: chunk.chunk_id,
            key,
        };
        if ctx.all_exist(&[&*gem.key])? {
            debug!("{} exists", gem.key);
            return Ok(gem);
        }

        let dir = ctx.scratch_dir(&format!("gem{}", chunk.chunk_id))?;
        let fasta = dir.path().join("chunk.fasta");
        fetch_fasta_chunk(ctx.store(), &ctx.params.fasta_path, &chunk, &fasta)?;
        ctx.tools
            .command(names::GEM_INDEXER)
            .current_dir(dir.path())
            .arg("--input")
            .arg(&fasta)
            .arg("--threads")
            .arg(ctx.params.gem_mapper_threads.to_string())
            .arg("-o")
            .arg("chunk")
            .success_codes(&[0, 1])
            .run()
            .map_err(|e| {
                tool_failure(e, |code, stderr| PipelineError::IndexerFailed {
                    chunk_id: chunk.chunk_id,
                    code,
                    stderr,
                })
            })?;
        ctx.store()
            .put_file(
                ctx.bucket(),
                &gem.key,
                &dir.path().join("chunk.gem"),
                &Metadata::new(),
            )
            .with_context(|| format!("uploading the index of fasta chunk {}", chunk.chunk_id))?;
        Ok(gem)
    }

    fn join(
        &self,
        _ctx: &RunContext,
        _args: Vec<FastaChunk>,
        _chunk_defs: Vec<FastaChunk>,
        gems: Vec<GemChunk>,
    ) -> Result<Vec<GemChunk>> {
        Ok(gems)
    }
}
