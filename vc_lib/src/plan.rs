//! The (fasta chunk × fastq chunk) product the alignment waves run over.

use anyhow::Result;
use itertools::iproduct;
use serde::{Deserialize, Serialize};
use vc_types::{ChunkRange, FastaChunk, FastqChunk, MapperId, PipelineError};

/// One alignment task pairing a fasta chunk with a fastq chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapperTask {
    pub mapper_id: MapperId,
    pub fasta: FastaChunk,
    pub fastq: FastqChunk,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Ordered by fasta chunk, then fastq chunk.
    pub tasks: Vec<MapperTask>,
    pub fasta_chunks: Vec<FastaChunk>,
    pub fastq_chunks: Vec<FastqChunk>,
}

impl Plan {
    /// Number of index-correction tasks.
    pub fn num_chunks(&self) -> usize {
        self.fastq_chunks.len()
    }

    /// Tasks sharing fastq chunk `fastq_chunk`, in fasta order.
    pub fn tasks_for_fastq(&self, fastq_chunk: usize) -> impl Iterator<Item = &MapperTask> {
        self.tasks
            .iter()
            .filter(move |t| t.mapper_id.fastq_chunk == fastq_chunk)
    }
}

fn select<T: Clone>(
    items: &[T],
    id: impl Fn(&T) -> usize,
    range: Option<ChunkRange>,
    what: &str,
) -> Result<Vec<T>, PipelineError> {
    let selected: Vec<T> = items
        .iter()
        .filter(|c| range.map_or(true, |r| r.contains(id(c))))
        .cloned()
        .collect();
    if selected.is_empty() {
        return Err(PipelineError::config(format!(
            "no {what} chunk selected: {} chunks were planned, range is {range:?}",
            items.len()
        )));
    }
    Ok(selected)
}

/// Build the iteration data, optionally restricted to chunk id ranges.
pub fn build_plan(
    fasta: &[FastaChunk],
    fastq: &[FastqChunk],
    fasta_range: Option<ChunkRange>,
    fastq_range: Option<ChunkRange>,
) -> Result<Plan> {
    let fasta_chunks = select(fasta, |c| c.chunk_id, fasta_range, "fasta")?;
    let fastq_chunks = select(fastq, |c| c.chunk_id, fastq_range, "fastq")?;
    let tasks = iproduct!(&fasta_chunks, &fastq_chunks)
        .map(|(fa, fq)| MapperTask {
            mapper_id: MapperId::new(fa.chunk_id, fq.chunk_id),
            fasta: *fa,
            fastq: fq.clone(),
        })
        .collect();
    Ok(Plan {
        tasks,
        fasta_chunks,
        fastq_chunks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use vc_types::FastqChunkSource;

    fn fasta(n: usize) -> Vec<FastaChunk> {
        (0..n)
            .map(|i| FastaChunk {
                chunk_id: i,
                offset_head: 0,
                offset_base: 3,
                last_byte: 10,
            })
            .collect()
    }

    fn fastq(n: usize) -> Vec<FastqChunk> {
        (0..n)
            .map(|i| FastqChunk {
                chunk_id: i,
                source: FastqChunkSource::Sra {
                    accession: "SRR1".into(),
                    read_0: 1 + 10 * i as u64,
                    read_1: 10 * (i as u64 + 1),
                },
            })
            .collect()
    }

    fn ids(plan: &Plan) -> Vec<String> {
        plan.tasks.iter().map(|t| t.mapper_id.to_string()).collect()
    }

    #[test]
    fn test_product_order() {
        let plan = build_plan(&fasta(2), &fastq(2), None, None).unwrap();
        assert_eq!(ids(&plan), vec!["fa0-fq0", "fa0-fq1", "fa1-fq0", "fa1-fq1"]);
        assert_eq!(plan.num_chunks(), 2);
        assert_eq!(
            plan.tasks_for_fastq(1)
                .map(|t| t.mapper_id.fasta_chunk)
                .collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    #[test]
    fn test_ranges_subset_the_product() {
        let plan = build_plan(
            &fasta(3),
            &fastq(4),
            Some(ChunkRange { start: 1, end: 2 }),
            Some(ChunkRange { start: 2, end: 4 }),
        )
        .unwrap();
        assert_eq!(ids(&plan), vec!["fa1-fq2", "fa1-fq3"]);
        assert_eq!(plan.num_chunks(), 2);
    }

    #[test]
    fn test_empty_selection_is_a_config_error() {
        let err = build_plan(&fasta(1), &fastq(1), Some(ChunkRange { start: 2, end: 3 }), None)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::ConfigInvalid(_))
        ));
    }
}
