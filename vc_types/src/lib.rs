// Warning groups (as of rust 1.55)
#![deny(
    future_incompatible,
    nonstandard_style,
    rust_2018_compatibility,
    rust_2021_compatibility,
    rust_2018_idioms
)]
#![warn(unused)]

//! Shared types for the serverless variant-calling pipeline: run parameters,
//! chunk records, the object-store key layout and the pipeline error kinds.

pub mod chunks;
pub mod errors;
pub mod keys;
pub mod parameters;

pub use chunks::{
    FaidxRecord, FastaChunk, FastqChunk, FastqChunkSource, GzipWindowRange, MapperId,
};
pub use errors::PipelineError;
pub use keys::{ObjectPath, RunKeys};
pub use parameters::{
    ChunkRange, FastqSource, FileFormat, LogLevel, PipelineParameters, RangePlanning, SeqType,
    Tunables,
};
