//! Object-store key layout.
//!
//! Cacheable per-input artifacts (gzip index, faidx, GEM chunks) live at the
//! bucket root under content-derived keys; everything a run produces lives
//! under `tmp/{run_id}/`.

use crate::chunks::MapperId;
use crate::parameters::FileFormat;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Characters removed from the fasta file stem to keep keys URL-safe.
const DISALLOWED_KEY_CHARS: &[char] = &['.', '_', '-', '!', '/', '·', '¡'];

/// A `bucket/key` reference to an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectPath {
    pub bucket: String,
    pub key: String,
}

impl ObjectPath {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        ObjectPath {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// The last path component of the key.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

impl FromStr for ObjectPath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.strip_prefix("s3://").unwrap_or(s);
        match s.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                Ok(ObjectPath::new(bucket, key))
            }
            _ => bail!("expected an object path of the form bucket/key, got '{s}'"),
        }
    }
}

impl TryFrom<String> for ObjectPath {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ObjectPath> for String {
    fn from(path: ObjectPath) -> String {
        path.to_string()
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// The fasta key: the file stem with disallowed characters removed.
pub fn fasta_key(fasta: &ObjectPath) -> String {
    let name = fasta.file_name();
    let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
    stem.chars()
        .filter(|c| !DISALLOWED_KEY_CHARS.contains(c))
        .collect()
}

/// The fastq key: the file name without its `.gz` and `.fastq`/`.fq` suffixes.
pub fn fastq_key(fastq: &ObjectPath) -> String {
    let name = fastq.file_name();
    let name = name.strip_suffix(".gz").unwrap_or(name);
    let name = name
        .strip_suffix(".fastq")
        .or_else(|| name.strip_suffix(".fq"))
        .unwrap_or(name);
    name.to_string()
}

pub fn gem_chunk_key(fasta_key: &str, fasta_chunks: usize, chunk_id: usize) -> String {
    format!("gem/{fasta_key}/{fasta_chunks}-chunks/chunk{chunk_id:04}.gem")
}

pub fn fastq_index_key(fastq_key: &str) -> String {
    format!("fastqgz_idx/{fastq_key}.idx")
}

pub fn fastq_table_key(fastq_key: &str) -> String {
    format!("fastqgz_idx/{fastq_key}.tab")
}

pub fn faidx_key(fasta_key: &str, fasta_chunks: usize) -> String {
    format!("faidx/{fasta_key}.{fasta_chunks}.bz2")
}

/// Keys owned by a single run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunKeys {
    run_id: String,
}

impl RunKeys {
    pub fn new(run_id: impl Into<String>) -> Self {
        RunKeys {
            run_id: run_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// `tmp/{run}/`, the prefix cleaned up at the end of a run.
    pub fn scratch_prefix(&self) -> String {
        format!("tmp/{}/", self.run_id)
    }

    pub fn map_index(&self, mapper_id: MapperId, acc: &str) -> String {
        format!(
            "tmp/{}/align_map1/{mapper_id}/{acc}_map.index.txt.bz2",
            self.run_id
        )
    }

    pub fn filtered_map(&self, mapper_id: MapperId, acc: &str) -> String {
        format!(
            "tmp/{}/align_map1/{mapper_id}/{acc}_filt_wline_no.map.bz2",
            self.run_id
        )
    }

    pub fn corrected_index(&self, fastq_chunk: usize) -> String {
        format!(
            "tmp/{}/index_correction/fq{fastq_chunk}/merged_filtered_index.txt.bz2",
            self.run_id
        )
    }

    pub fn mpileup(&self, mapper_id: MapperId, acc: &str, format: FileFormat) -> String {
        format!(
            "{}{mapper_id}/{acc}_{mapper_id}.mpileup.{}",
            self.mpileup_prefix(),
            format.extension()
        )
    }

    pub fn histogram(&self, mapper_id: MapperId, acc: &str) -> String {
        format!(
            "{}{mapper_id}/{acc}_{mapper_id}_histogram.txt",
            self.mpileup_prefix()
        )
    }

    pub fn mpileup_prefix(&self) -> String {
        format!("tmp/{}/filtered_index_to_mpileup/", self.run_id)
    }

    /// Prefix shared by every map-2 output of one fasta chunk.
    pub fn mpileup_group_prefix(&self, fasta_chunk: usize) -> String {
        format!("{}fa{fasta_chunk}-", self.mpileup_prefix())
    }

    pub fn group_upload(&self, fasta_chunk: usize) -> String {
        format!(
            "tmp/{}/multipart_uploads/fa{fasta_chunk}.sinple",
            self.run_id
        )
    }

    pub fn final_artifact(&self) -> String {
        format!("tmp/{}/final.alignment", self.run_id)
    }
}
