//! Partition records for the two pipeline inputs.

use crate::keys::ObjectPath;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One sequence of a FASTA file as described by the faidx.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaidxRecord {
    pub name_id: String,
    /// Offset of the `>` that starts the header line.
    pub offset_head: u64,
    /// Offset of the first byte after the header line.
    pub offset_base: u64,
    /// Number of bases, newlines excluded.
    pub length_bases: u64,
}

impl FaidxRecord {
    /// True if `offset` lies inside the header line of this record.
    pub fn header_contains(&self, offset: u64) -> bool {
        self.offset_head <= offset && offset < self.offset_base
    }
}

/// A header-aware slice of a FASTA file.
///
/// The chunk is the header `[offset_head, offset_base)` followed by the base
/// region `[offset_base, last_byte]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastaChunk {
    pub chunk_id: usize,
    pub offset_head: u64,
    pub offset_base: u64,
    pub last_byte: u64,
}

impl FastaChunk {
    /// Inclusive byte range of the header line.
    pub fn header_range(&self) -> (u64, u64) {
        (self.offset_head, self.offset_base - 1)
    }

    /// Inclusive byte range of the bases.
    pub fn base_range(&self) -> (u64, u64) {
        (self.offset_base, self.last_byte)
    }

    pub fn base_len(&self) -> u64 {
        self.last_byte + 1 - self.offset_base
    }
}

/// Compressed window range of one gzipped FASTQ file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GzipWindowRange {
    pub fastq: ObjectPath,
    /// Key of the gztool index in the fastq bucket.
    pub index_key: String,
    pub range_0: u64,
    pub range_1: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FastqChunkSource {
    /// Lines `[line_0, line_1)` (1-based) of a gzipped FASTQ; `mate2` is
    /// present for paired-end input and covers the same lines.
    Gzip {
        line_0: u64,
        line_1: u64,
        mate1: GzipWindowRange,
        mate2: Option<GzipWindowRange>,
    },
    /// Spots `[read_0, read_1]` (1-based, inclusive) of an SRA accession.
    Sra {
        accession: String,
        read_0: u64,
        read_1: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastqChunk {
    pub chunk_id: usize,
    pub source: FastqChunkSource,
}

impl FastqChunk {
    pub fn num_reads(&self) -> u64 {
        match &self.source {
            FastqChunkSource::Gzip { line_0, line_1, .. } => (line_1 - line_0) / 4,
            FastqChunkSource::Sra { read_0, read_1, .. } => read_1 + 1 - read_0,
        }
    }

    /// The `source` argument handed to the aligner script.
    pub fn source_label(&self) -> &'static str {
        match self.source {
            FastqChunkSource::Gzip { .. } => "s3",
            FastqChunkSource::Sra { .. } => "SRA",
        }
    }
}

/// Identifies one (fasta chunk, fastq chunk) pair; renders as `fa{i}-fq{j}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MapperId {
    pub fasta_chunk: usize,
    pub fastq_chunk: usize,
}

impl MapperId {
    pub fn new(fasta_chunk: usize, fastq_chunk: usize) -> Self {
        MapperId {
            fasta_chunk,
            fastq_chunk,
        }
    }
}

impl fmt::Display for MapperId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fa{}-fq{}", self.fasta_chunk, self.fastq_chunk)
    }
}
