//! Fatal error kinds raised by the pipeline engine.
//!
//! Storage and invoker failures have their own error types in `vc_store` and
//! `vc_invoker`; the kinds here describe failures of the pipeline itself.
//! Stage code wraps them in `anyhow::Error`, so callers that need to branch on
//! the kind use `downcast_ref::<PipelineError>()`.

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("partitioning failed for chunk {chunk_id}: {reason}")]
    PartitionFailed { chunk_id: usize, reason: String },

    #[error("gem-indexer failed on fasta chunk {chunk_id} (exit code {code:?}):\n{stderr}")]
    IndexerFailed {
        chunk_id: usize,
        code: Option<i32>,
        stderr: String,
    },

    #[error("aligner failed for {mapper_id} (exit code {code:?}):\n{stderr}")]
    AlignerFailed {
        mapper_id: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("pileup failed for {mapper_id} (exit code {code:?}):\n{stderr}")]
    PileupFailed {
        mapper_id: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("merge failed for {what} (exit code {code:?}):\n{stderr}")]
    MergeFailed {
        what: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error(
        "map index shard {key} for fastq chunk {fastq_chunk} is missing although every \
         map-1 task reported success"
    )]
    BarrierIncomplete { fastq_chunk: usize, key: String },
}

impl PipelineError {
    /// Shorthand for a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        PipelineError::ConfigInvalid(msg.into())
    }

    /// True if retrying the task that produced this error could succeed.
    ///
    /// External tool failures are retried by the stage policy; configuration,
    /// partitioning and barrier errors are deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::AlignerFailed { .. }
                | PipelineError::PileupFailed { .. }
                | PipelineError::MergeFailed { .. }
                | PipelineError::IndexerFailed { .. }
        )
    }
}
