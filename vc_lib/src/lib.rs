// Warning groups (as of rust 1.55)
#![deny(
    future_incompatible,
    nonstandard_style,
    rust_2018_compatibility,
    rust_2021_compatibility,
    rust_2018_idioms
)]
#![warn(unused)]

//! The variant-calling pipeline engine.
//!
//! A run partitions the reference FASTA and the reads, aligns every
//! (fasta chunk, fastq chunk) pair in two waves separated by a per-fastq-chunk
//! index correction, pileups the alignments, and reduces the per-pair
//! mpileups into one coordinate-sorted artifact with multipart uploads.
//! [`Pipeline`] drives the stages in order on an [`vc_invoker::Executor`].

pub mod context;
pub mod mpileup;
pub mod parquet_file;
pub mod pipeline;
pub mod plan;
pub mod stage;
pub mod stages;
pub mod summary;
pub mod uploads;

#[cfg(test)]
pub(crate) mod testing;

pub use context::RunContext;
pub use pipeline::{Pipeline, PipelineOutputs};
pub use plan::{build_plan, MapperTask, Plan};
pub use stage::{PipelineStage, StageRunner};
pub use summary::RunSummary;
