//! Build (or reuse) the faidx of the reference and cut it into chunks.
//!
//! Each task scans one byte span of the FASTA; the join stitches the span
//! summaries into the index, caches it next to the FASTA, and snaps the
//! chunk boundaries to headers.

use crate::context::RunContext;
use crate::stage::PipelineStage;
use anyhow::{anyhow, Result};
use log::info;
use vc_partition::faidx::{
    faidx_object, load_faidx, save_faidx, scan_remote_span, spans, stitch, ByteSpan, SpanSummary,
};
use vc_partition::fasta_chunks::plan_fasta_chunks;
use vc_types::FastaChunk;

#[derive(Debug, Clone, Copy, Default)]
pub struct FastaPartition;

fn fasta_size(ctx: &RunContext) -> Result<u64> {
    let fasta = &ctx.params.fasta_path;
    Ok(ctx
        .store()
        .head(&fasta.bucket, &fasta.key)?
        .ok_or_else(|| anyhow!("reference {fasta} does not exist"))?
        .size)
}

impl PipelineStage for FastaPartition {
    const NAME: &'static str = "fasta_partition";
    type StageInputs = ();
    type StageOutputs = Vec<FastaChunk>;
    type ChunkInputs = ByteSpan;
    type ChunkOutputs = SpanSummary;

    fn split(&self, ctx: &RunContext, _args: &()) -> Result<Vec<ByteSpan>> {
        let n = ctx.params.fasta_chunks;
        let faidx = faidx_object(&ctx.params.fasta_path, n);
        if ctx.store().exists(&faidx.bucket, &faidx.key)? {
            info!("reusing faidx {faidx}");
            return Ok(Vec::new());
        }
        Ok(spans(fasta_size(ctx)?, n))
    }

    fn main(&self, ctx: &RunContext, span: ByteSpan) -> Result<SpanSummary> {
        scan_remote_span(ctx.store(), &ctx.params.fasta_path, span)
    }

    fn join(
        &self,
        ctx: &RunContext,
        _args: (),
        _chunk_defs: Vec<ByteSpan>,
        summaries: Vec<SpanSummary>,
    ) -> Result<Vec<FastaChunk>> {
        let n = ctx.params.fasta_chunks;
        let faidx = faidx_object(&ctx.params.fasta_path, n);
        let records = if summaries.is_empty() {
            load_faidx(ctx.store(), &faidx.bucket, &faidx.key)?
        } else {
            let records = stitch(&summaries)?;
            save_faidx(ctx.store(), &faidx.bucket, &faidx.key, &records)?;
            records
        };
        let chunks = plan_fasta_chunks(&records, fasta_size(ctx)?, n)?;
        info!(
            "{} sequences in {} fasta chunks",
            records.len(),
            chunks.len()
        );
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageRunner;
    use crate::testing::{minimal_params, Fixture, BUCKET};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use vc_invoker::LocalExecutor;
    use vc_store::ObjectStore;

    fn chunk(chunk_id: usize, offset_head: u64, offset_base: u64, last_byte: u64) -> FastaChunk {
        FastaChunk {
            chunk_id,
            offset_head,
            offset_base,
            last_byte,
        }
    }

    #[test]
    fn test_tiny_fasta_two_chunks() {
        let fixture = Fixture::new();
        let ctx = Arc::new(fixture.context(minimal_params()));
        let executor = LocalExecutor::new(2);
        let mut runner = StageRunner::new(Arc::clone(&ctx), &executor);
        let chunks = runner.run(&FastaPartition, ()).unwrap();
        assert_eq!(chunks, vec![chunk(0, 0, 3, 12), chunk(1, 13, 16, 35)]);
        let meta = fixture
            .store
            .head(BUCKET, "faidx/tiny.2.bz2")
            .unwrap()
            .unwrap();
        assert_eq!(meta.metadata["num_sequences"], "2");

        // a later run reuses the cached faidx without scanning
        let mut params = minimal_params();
        params.run_id = "other-run".into();
        let ctx = fixture.context(params);
        assert!(FastaPartition.split(&ctx, &()).unwrap().is_empty());
        assert_eq!(
            FastaPartition.join(&ctx, (), vec![], vec![]).unwrap(),
            vec![chunk(0, 0, 3, 12), chunk(1, 13, 16, 35)]
        );
    }

    #[test]
    fn test_missing_reference() {
        let fixture = Fixture::new();
        let mut params = minimal_params();
        params.fasta_path = "b1/f/missing.fa".parse().unwrap();
        let ctx = fixture.context(params);
        let err = FastaPartition.split(&ctx, &()).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
