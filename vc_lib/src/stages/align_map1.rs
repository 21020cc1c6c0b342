//! First alignment wave: map every fastq chunk against every GEM chunk and
//! keep the map index and the filtered map for index correction.

use super::prepare_gem::GemChunk;
use super::{tool_failure, upload_bz2};
use crate::context::RunContext;
use crate::plan::{MapperTask, Plan};
use crate::stage::PipelineStage;
use anyhow::{anyhow, Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use vc_partition::fetch_fastq_chunk;
use vc_tools::names;
use vc_types::{MapperId, PipelineError};

const NOT_USED: &str = "not-used";

#[derive(Debug, Clone)]
pub struct Map1Inputs {
    pub plan: Plan,
    pub gems: Vec<GemChunk>,
}

#[derive(Debug, Clone)]
pub struct Map1Task {
    pub task: MapperTask,
    pub gem_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapperResult {
    pub mapper_id: MapperId,
    pub map_index_key: String,
    pub filtered_map_key: String,
}

impl MapperResult {
    pub fn for_task(ctx: &RunContext, mapper_id: MapperId) -> Self {
        MapperResult {
            mapper_id,
            map_index_key: ctx.keys.map_index(mapper_id, &ctx.acc),
            filtered_map_key: ctx.keys.filtered_map(mapper_id, &ctx.acc),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlignMap1;

impl PipelineStage for AlignMap1 {
    const NAME: &'static str = "align_map1";
    type StageInputs = Map1Inputs;
    type StageOutputs = Vec<MapperResult>;
    type ChunkInputs = Map1Task;
    type ChunkOutputs = MapperResult;

    fn split(&self, _ctx: &RunContext, args: &Map1Inputs) -> Result<Vec<Map1Task>> {
        let gems: HashMap<usize, &str> = args
            .gems
            .iter()
            .map(|g| (g.fasta_chunk, g.key.as_str()))
            .collect();
        args.plan
            .tasks
            .iter()
            .map(|task| {
                let gem_key = gems
                    .get(&task.mapper_id.fasta_chunk)
                    .ok_or_else(|| anyhow!("no GEM index for fasta chunk {}", task.fasta.chunk_id))?;
                Ok(Map1Task {
                    task: task.clone(),
                    gem_key: gem_key.to_string(),
                })
            })
            .collect()
    }

    fn main(&self, ctx: &RunContext, chunk: Map1Task) -> Result<MapperResult> {
        let Map1Task { task, gem_key } = chunk;
        let mid = task.mapper_id;
        let result = MapperResult::for_task(ctx, mid);
        if ctx.all_exist(&[&*result.map_index_key, &*result.filtered_map_key])? {
            debug!("{mid}: map-1 outputs exist");
            return Ok(result);
        }

        let dir = ctx.scratch_dir(&mid.to_string())?;
        let reads = fetch_fastq_chunk(ctx.store(), &ctx.tools, &task.fastq, dir.path())?;
        let gem = dir.path().join("chunk.gem");
        ctx.store()
            .get_to_file(ctx.bucket(), &gem_key, None, &gem)
            .with_context(|| format!("{mid}: fetching {gem_key}"))?;

        let base = mid.to_string();
        let params = &ctx.params;
        ctx.tools
            .command(names::ALIGNER)
            .current_dir(dir.path())
            .arg(&gem)
            .arg(&reads.mate1)
            .arg(reads.mate2.map_or_else(|| OsString::from(NOT_USED), Into::into))
            .arg(&base)
            .arg(task.fastq.source_label())
            .arg(params.seq_type.to_string())
            .arg(params.gem_mapper_threads.to_string())
            .run()
            .map_err(|e| {
                tool_failure(e, |code, stderr| PipelineError::AlignerFailed {
                    mapper_id: base.clone(),
                    code,
                    stderr,
                })
            })?;

        for (produced, key) in [
            ("map.index.txt", &result.map_index_key),
            ("filt_wline_no.map", &result.filtered_map_key),
        ] {
            let from = dir.path().join(format!("{base}_{produced}"));
            let to = dir.path().join(format!("{}_{produced}", ctx.acc));
            fs::rename(&from, &to).with_context(|| {
                format!("{mid}: the aligner did not write {}", from.display())
            })?;
            upload_bz2(ctx, &to, key)?;
        }
        debug!("{mid}: aligned {} reads", task.fastq.num_reads());
        Ok(result)
    }

    fn join(
        &self,
        _ctx: &RunContext,
        _args: Map1Inputs,
        _chunk_defs: Vec<Map1Task>,
        results: Vec<MapperResult>,
    ) -> Result<Vec<MapperResult>> {
        Ok(results)
    }
}
