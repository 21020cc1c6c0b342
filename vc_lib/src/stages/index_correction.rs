//! Merge the map indexes of every fasta chunk of one fastq chunk into the
//! corrected index the second alignment wave filters with.
//!
//! This stage is the barrier between the two waves: it only starts once every
//! map-1 task has returned, and refuses to run a fastq chunk whose shards are
//! not all present.

use super::align_map1::MapperResult;
use super::{download_bz2, tool_failure, upload_bz2};
use crate::context::RunContext;
use crate::plan::Plan;
use crate::stage::PipelineStage;
use anyhow::{bail, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use vc_tools::names;
use vc_types::PipelineError;

/// Metric columns summed by the merge script.
const MERGED_METRIC_COLUMNS: &str = "4";

#[derive(Debug, Clone)]
pub struct CorrectionInputs {
    pub plan: Plan,
    pub map1: Vec<MapperResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrectionTask {
    pub fastq_chunk: usize,
    /// Map index shards, in fasta chunk order.
    pub shards: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectedIndex {
    pub fastq_chunk: usize,
    pub key: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IndexCorrection;

impl PipelineStage for IndexCorrection {
    const NAME: &'static str = "index_correction";
    type StageInputs = CorrectionInputs;
    type StageOutputs = Vec<CorrectedIndex>;
    type ChunkInputs = CorrectionTask;
    type ChunkOutputs = CorrectedIndex;

    fn split(&self, ctx: &RunContext, args: &CorrectionInputs) -> Result<Vec<CorrectionTask>> {
        let results: HashMap<_, _> = args.map1.iter().map(|r| (r.mapper_id, r)).collect();
        let mut tasks = Vec::with_capacity(args.plan.num_chunks());
        for fastq in &args.plan.fastq_chunks {
            let mut shards = Vec::new();
            for task in args.plan.tasks_for_fastq(fastq.chunk_id) {
                let mid = task.mapper_id;
                let key = match results.get(&mid) {
                    Some(r) => r.map_index_key.clone(),
                    None => ctx.keys.map_index(mid, &ctx.acc),
                };
                if !results.contains_key(&mid) || !ctx.all_exist(&[&*key])? {
                    bail!(PipelineError::BarrierIncomplete {
                        fastq_chunk: fastq.chunk_id,
                        key,
                    });
                }
                shards.push(key);
            }
            tasks.push(CorrectionTask {
                fastq_chunk: fastq.chunk_id,
                shards,
            });
        }
        Ok(tasks)
    }

    fn main(&self, ctx: &RunContext, task: CorrectionTask) -> Result<CorrectedIndex> {
        let j = task.fastq_chunk;
        let out = CorrectedIndex {
            fastq_chunk: j,
            key: ctx.keys.corrected_index(j),
        };
        if ctx.all_exist(&[&*out.key])? {
            debug!("fq{j}: corrected index exists");
            return Ok(out);
        }

        let dir = ctx.scratch_dir(&format!("fq{j}"))?;
        let mut shard_files = Vec::with_capacity(task.shards.len());
        for (n, key) in task.shards.iter().enumerate() {
            let name = format!("{n}_map.index.txt");
            download_bz2(ctx, key, &dir.path().join(&name))?;
            shard_files.push(name);
        }

        let merge_failed = |code, stderr| PipelineError::MergeFailed {
            what: format!("map indexes of fq{j}"),
            code,
            stderr,
        };
        ctx.tools
            .command(names::BINARY_REDUCER)
            .current_dir(dir.path())
            .arg(names::MERGE_ALIGNMENT_METRICS)
            .arg(MERGED_METRIC_COLUMNS)
            .args(&shard_files)
            .stdout_file(&dir.path().join("intermediate.txt"))
            .run()
            .map_err(|e| tool_failure(e, merge_failed))?;
        ctx.tools
            .command(names::FILTER_MERGED_INDEX)
            .current_dir(dir.path())
            .arg("intermediate.txt")
            .arg("merged_filtered_index.txt")
            .run()
            .map_err(|e| tool_failure(e, merge_failed))?;
        upload_bz2(ctx, &dir.path().join("merged_filtered_index.txt"), &out.key)?;
        debug!("fq{j}: merged {} map indexes", task.shards.len());
        Ok(out)
    }

    fn join(
        &self,
        _ctx: &RunContext,
        _args: CorrectionInputs,
        _chunk_defs: Vec<CorrectionTask>,
        corrected: Vec<CorrectedIndex>,
    ) -> Result<Vec<CorrectedIndex>> {
        Ok(corrected)
    }
}
