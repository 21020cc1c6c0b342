//! Second alignment wave: correct each filtered map with the merged index of
//! its fastq chunk, pileup against the fasta chunk, and store the mpileup
//! shard with its histogram.

use super::align_map1::MapperResult;
use super::index_correction::CorrectedIndex;
use super::{download_bz2, tool_failure};
use crate::context::RunContext;
use crate::mpileup;
use crate::plan::{MapperTask, Plan};
use crate::stage::PipelineStage;
use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use vc_partition::fasta_chunks::fetch_fasta_chunk;
use vc_store::Metadata;
use vc_tools::names;
use vc_types::{MapperId, PipelineError};

#[derive(Debug, Clone)]
pub struct Map2Inputs {
    pub plan: Plan,
    pub map1: Vec<MapperResult>,
    pub corrected: Vec<CorrectedIndex>,
}

#[derive(Debug, Clone)]
pub struct Map2Task {
    pub task: MapperTask,
    pub filtered_map_key: String,
    pub corrected_index_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Map2Result {
    pub mapper_id: MapperId,
    pub mpileup_key: String,
    pub histogram_key: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlignMap2;

impl PipelineStage for AlignMap2 {
    const NAME: &'static str = "align_map2";
    type StageInputs = Map2Inputs;
    type StageOutputs = Vec<Map2Result>;
    type ChunkInputs = Map2Task;
    type ChunkOutputs = Map2Result;

    fn split(&self, _ctx: &RunContext, args: &Map2Inputs) -> Result<Vec<Map2Task>> {
        let maps: HashMap<MapperId, &str> = args
            .map1
            .iter()
            .map(|r| (r.mapper_id, r.filtered_map_key.as_str()))
            .collect();
        let corrected: HashMap<usize, &str> = args
            .corrected
            .iter()
            .map(|c| (c.fastq_chunk, c.key.as_str()))
            .collect();
        args.plan
            .tasks
            .iter()
            .map(|task| {
                let mid = task.mapper_id;
                Ok(Map2Task {
                    task: task.clone(),
                    filtered_map_key: maps
                        .get(&mid)
                        .ok_or_else(|| anyhow!("{mid}: no map-1 result"))?
                        .to_string(),
                    corrected_index_key: corrected
                        .get(&mid.fastq_chunk)
                        .ok_or_else(|| anyhow!("{mid}: fq{} was not corrected", mid.fastq_chunk))?
                        .to_string(),
                })
            })
            .collect()
    }

    fn main(&self, ctx: &RunContext, chunk: Map2Task) -> Result<Map2Result> {
        let mid = chunk.task.mapper_id;
        let params = &ctx.params;
        let result = Map2Result {
            mapper_id: mid,
            mpileup_key: ctx.keys.mpileup(mid, &ctx.acc, params.file_format),
            histogram_key: ctx.keys.histogram(mid, &ctx.acc),
        };
        if ctx.all_exist(&[&*result.mpileup_key, &*result.histogram_key])? {
            debug!("{mid}: mpileup exists");
            return Ok(result);
        }
        if !ctx.all_exist(&[&*chunk.corrected_index_key])? {
            bail!(PipelineError::BarrierIncomplete {
                fastq_chunk: mid.fastq_chunk,
                key: chunk.corrected_index_key,
            });
        }

        let dir = ctx.scratch_dir(&mid.to_string())?;
        let path = |name: &str| dir.path().join(name);
        download_bz2(ctx, &chunk.corrected_index_key, &path("corrected_index.txt"))?;
        download_bz2(ctx, &chunk.filtered_map_key, &path("filt_wline_no.map"))?;
        fetch_fasta_chunk(
            ctx.store(),
            &params.fasta_path,
            &chunk.task.fasta,
            &path("chunk.fasta"),
        )?;

        ctx.tools
            .command(names::INDEX_CORRECTION)
            .current_dir(dir.path())
            .arg("corrected_index.txt")
            .arg("filt_wline_no.map")
            .arg(params.tolerance.to_string())
            .stdout_file(&path("corrected.map"))
            .run()
            .map_err(|e| {
                tool_failure(e, |code, stderr| PipelineError::AlignerFailed {
                    mapper_id: mid.to_string(),
                    code,
                    stderr,
                })
            })?;
        ctx.tools
            .command(names::PILEUP)
            .current_dir(dir.path())
            .arg("corrected.map")
            .arg("chunk.fasta")
            .stdout_file(&path("raw.mpileup"))
            .run()
            .map_err(|e| {
                tool_failure(e, |code, stderr| PipelineError::PileupFailed {
                    mapper_id: mid.to_string(),
                    code,
                    stderr,
                })
            })?;

        let shard = path(&format!("shard.{}", params.file_format.extension()));
        let hist = mpileup::convert(
            &path("raw.mpileup"),
            &shard,
            params.file_format,
            params.tunables.histogram_stride,
        )
        .with_context(|| format!("{mid}: converting the pileup"))?;
        ctx.store()
            .put_file(ctx.bucket(), &result.mpileup_key, &shard, &Metadata::new())?;
        // the histogram goes last: its presence marks the shard complete
        ctx.store().put(
            ctx.bucket(),
            &result.histogram_key,
            hist.to_text().as_bytes(),
            &Metadata::new(),
        )?;
        debug!("{mid}: {} pileup rows", hist.rows());
        Ok(result)
    }

    fn join(
        &self,
        _ctx: &RunContext,
        _args: Map2Inputs,
        _chunk_defs: Vec<Map2Task>,
        results: Vec<Map2Result>,
    ) -> Result<Vec<Map2Result>> {
        Ok(results)
    }
}
