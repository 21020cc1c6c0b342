//! Plan the fastq chunks: one task per gzip mate builds (or reuses) its
//! gztool index, or a single task asks the SRA for the spot count.

use crate::context::RunContext;
use crate::stage::PipelineStage;
use anyhow::{bail, Result};
use log::info;
use std::sync::Arc;
use vc_partition::fastq_gzip::{self, GzipIndex};
use vc_partition::fastq_sra::{self, SpotCounter};
use vc_types::{FastqChunk, FastqSource, ObjectPath, PipelineError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadSourceTask {
    /// Index one gzipped mate.
    Index(ObjectPath),
    /// Count the spots of an accession.
    Spots(String),
}

#[derive(Debug)]
pub enum ReadSourceInfo {
    Index(GzipIndex),
    Spots(u64),
}

#[derive(Clone)]
pub struct FastqPartition {
    spot_counter: Arc<dyn SpotCounter + Send + Sync>,
}

impl FastqPartition {
    pub fn new(spot_counter: Arc<dyn SpotCounter + Send + Sync>) -> Self {
        FastqPartition { spot_counter }
    }
}

impl PipelineStage for FastqPartition {
    const NAME: &'static str = "fastq_partition";
    type StageInputs = ();
    type StageOutputs = Vec<FastqChunk>;
    type ChunkInputs = ReadSourceTask;
    type ChunkOutputs = ReadSourceInfo;

    fn split(&self, ctx: &RunContext, _args: &()) -> Result<Vec<ReadSourceTask>> {
        Ok(match ctx.params.fastq_source()? {
            FastqSource::Gzip { mate1, mate2 } => std::iter::once(mate1)
                .chain(mate2)
                .map(ReadSourceTask::Index)
                .collect(),
            FastqSource::Sra { accession } => vec![ReadSourceTask::Spots(accession)],
        })
    }

    fn main(&self, ctx: &RunContext, task: ReadSourceTask) -> Result<ReadSourceInfo> {
        Ok(match task {
            ReadSourceTask::Index(fastq) => {
                ReadSourceInfo::Index(fastq_gzip::ensure_index(ctx.store(), &ctx.tools, &fastq)?)
            }
            ReadSourceTask::Spots(accession) => {
                ReadSourceInfo::Spots(self.spot_counter.total_spots(&accession)?)
            }
        })
    }

    fn join(
        &self,
        ctx: &RunContext,
        _args: (),
        tasks: Vec<ReadSourceTask>,
        infos: Vec<ReadSourceInfo>,
    ) -> Result<Vec<FastqChunk>> {
        let k = ctx.params.fastq_chunks;
        let mut indexes = Vec::new();
        let mut chunks = Vec::new();
        for (task, info) in tasks.into_iter().zip(infos) {
            match (task, info) {
                (_, ReadSourceInfo::Index(index)) => indexes.push(index),
                (ReadSourceTask::Spots(accession), ReadSourceInfo::Spots(total)) => {
                    info!("{accession} has {total} spots");
                    chunks = fastq_sra::plan_chunks(&accession, total, k);
                }
                (task, ReadSourceInfo::Spots(_)) => bail!("unexpected spot count for {task:?}"),
            }
        }
        if let Some(mate1) = indexes.first() {
            chunks = fastq_gzip::plan_chunks(mate1, indexes.get(1), k)?;
        }
        if chunks.is_empty() {
            bail!(PipelineError::PartitionFailed {
                chunk_id: 0,
                reason: format!("the read set {} is empty", ctx.acc),
            });
        }
        info!("{} fastq chunks", chunks.len());
        Ok(chunks)
    }
}
