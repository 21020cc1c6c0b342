// Warning groups (as of rust 1.55)
#![deny(
    future_incompatible,
    nonstandard_style,
    rust_2018_compatibility,
    rust_2021_compatibility,
    rust_2018_idioms
)]
#![warn(unused)]

//! Random-access partitioning of the pipeline inputs.
//!
//! Neither input is ever materialized locally. A gzipped FASTQ is split by
//! line ranges using a gztool access-window index, an SRA accession by read
//! numbers, and a FASTA by byte ranges snapped to header boundaries using a
//! faidx built with a map/reduce over byte spans.

pub mod faidx;
pub mod fasta_chunks;
pub mod fastq;
pub mod fastq_gzip;
pub mod fastq_sra;

pub use fastq::{fetch_fastq_chunk, FetchedReads};
