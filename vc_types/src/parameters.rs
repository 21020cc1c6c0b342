//! Run parameters.
//!
//! A run is configured by one [`PipelineParameters`] value, usually loaded from
//! a TOML file and then overridden from the command line. The value is passed
//! explicitly to every stage; there is no global configuration.

use crate::errors::PipelineError;
use crate::keys::ObjectPath;
use anyhow::{bail, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SeqType {
    #[default]
    #[serde(rename = "single-end")]
    SingleEnd,
    #[serde(rename = "paired-end")]
    PairedEnd,
}

impl SeqType {
    pub fn is_paired(self) -> bool {
        self == SeqType::PairedEnd
    }
}

impl fmt::Display for SeqType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SeqType::SingleEnd => "single-end",
            SeqType::PairedEnd => "paired-end",
        };
        write!(f, "{s}")
    }
}

impl FromStr for SeqType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "single-end" | "single" => Ok(SeqType::SingleEnd),
            "paired-end" | "paired" => Ok(SeqType::PairedEnd),
            _ => bail!("invalid sequencing type: {s}"),
        }
    }
}

/// Storage format of the per-chunk mpileup tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    #[default]
    Csv,
    Parquet,
}

impl FileFormat {
    pub fn extension(self) -> &'static str {
        match self {
            FileFormat::Csv => "csv",
            FileFormat::Parquet => "parquet",
        }
    }
}

impl FromStr for FileFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(FileFormat::Csv),
            "parquet" => Ok(FileFormat::Parquet),
            _ => bail!("invalid mpileup file format: {s}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => bail!("invalid log level: {s}"),
        }
    }
}

/// How the range planner obtains per-coordinate row counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangePlanning {
    /// Read the histogram side-index written next to every mpileup.
    #[default]
    Histogram,
    /// Query the coordinate column of every mpileup.
    Select,
}

impl FromStr for RangePlanning {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "histogram" => Ok(RangePlanning::Histogram),
            "select" => Ok(RangePlanning::Select),
            _ => bail!("invalid range planning mode: {s}"),
        }
    }
}

/// Half-open range `[start, end)` of chunk ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(usize, usize)", into = "(usize, usize)")]
pub struct ChunkRange {
    pub start: usize,
    pub end: usize,
}

impl ChunkRange {
    pub fn contains(&self, id: usize) -> bool {
        self.start <= id && id < self.end
    }
}

impl From<(usize, usize)> for ChunkRange {
    fn from((start, end): (usize, usize)) -> Self {
        ChunkRange { start, end }
    }
}

impl From<ChunkRange> for (usize, usize) {
    fn from(r: ChunkRange) -> Self {
        (r.start, r.end)
    }
}

impl FromStr for ChunkRange {
    type Err = anyhow::Error;

    /// Parse `lo:hi` or `lo-hi`.
    fn from_str(s: &str) -> Result<Self> {
        let (lo, hi) = s
            .split_once(':')
            .or_else(|| s.split_once('-'))
            .with_context(|| format!("expected a chunk range lo:hi, got '{s}'"))?;
        Ok(ChunkRange {
            start: lo.trim().parse()?,
            end: hi.trim().parse()?,
        })
    }
}

/// Where the reads come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FastqSource {
    Gzip {
        mate1: ObjectPath,
        mate2: Option<ObjectPath>,
    },
    Sra {
        accession: String,
    },
}

fn new_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn default_threads() -> usize {
    num_cpus::get()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineParameters {
    #[serde(default = "new_run_id")]
    pub run_id: String,
    /// Bucket receiving every artifact of the run.
    pub bucket: String,
    pub fasta_path: ObjectPath,
    #[serde(default)]
    pub fastq_path: Option<ObjectPath>,
    /// Second mate for paired-end gzip input.
    #[serde(default)]
    pub fastq2_path: Option<ObjectPath>,
    #[serde(default)]
    pub sra_accession: Option<String>,
    pub fasta_chunks: usize,
    pub fastq_chunks: usize,
    #[serde(default)]
    pub seq_type: SeqType,
    #[serde(default)]
    pub file_format: FileFormat,
    #[serde(default)]
    pub tolerance: u32,
    #[serde(default = "default_threads")]
    pub gem_mapper_threads: usize,
    #[serde(default)]
    pub fasta_chunk_range: Option<ChunkRange>,
    #[serde(default)]
    pub fastq_chunk_range: Option<ChunkRange>,
    /// Persist stage results in the local resume cache.
    #[serde(default = "default_true")]
    pub checkpoints: bool,
    #[serde(default)]
    pub log_level: LogLevel,
    /// Backend-specific FaaS settings, passed through untouched.
    #[serde(default)]
    pub faas_settings: serde_json::Value,
    #[serde(default)]
    pub tunables: Tunables,
}

impl PipelineParameters {
    /// Load parameters from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| path.display().to_string())?;
        toml::from_str(&s).with_context(|| path.display().to_string())
    }

    /// The validated read source.
    pub fn fastq_source(&self) -> Result<FastqSource, PipelineError> {
        match (&self.fastq_path, &self.sra_accession) {
            (Some(mate1), None) => Ok(FastqSource::Gzip {
                mate1: mate1.clone(),
                mate2: self.fastq2_path.clone(),
            }),
            (None, Some(accession)) => Ok(FastqSource::Sra {
                accession: accession.clone(),
            }),
            (Some(_), Some(_)) => Err(PipelineError::config(
                "fastq_path and sra_accession are mutually exclusive",
            )),
            (None, None) => Err(PipelineError::config(
                "one of fastq_path or sra_accession is required",
            )),
        }
    }

    /// Check the parameters before any I/O happens.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let fail = |msg: String| Err(PipelineError::ConfigInvalid(msg));
        if self.bucket.is_empty() {
            return fail("bucket must not be empty".into());
        }
        if self.run_id.is_empty()
            || !self
                .run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return fail(format!(
                "run_id '{}' must be non-empty and contain only letters, digits, '-' and '_'",
                self.run_id
            ));
        }
        if self.fasta_chunks == 0 {
            return fail("fasta_chunks must be >= 1".into());
        }
        if self.fastq_chunks == 0 {
            return fail("fastq_chunks must be >= 1".into());
        }
        if self.gem_mapper_threads == 0 {
            return fail("gem_mapper_threads must be >= 1".into());
        }
        match self.fastq_source()? {
            FastqSource::Gzip { mate2, .. } => match (self.seq_type, mate2) {
                (SeqType::PairedEnd, None) => {
                    return fail("paired-end gzip input requires fastq2_path".into())
                }
                (SeqType::SingleEnd, Some(_)) => {
                    return fail("fastq2_path is only valid for paired-end input".into())
                }
                _ => {}
            },
            FastqSource::Sra { accession } => {
                if accession.is_empty() {
                    return fail("sra_accession must not be empty".into());
                }
                if self.fastq2_path.is_some() {
                    return fail("fastq2_path cannot be combined with sra_accession".into());
                }
            }
        }
        for (name, range, total) in [
            ("fasta_chunk_range", self.fasta_chunk_range, self.fasta_chunks),
            ("fastq_chunk_range", self.fastq_chunk_range, self.fastq_chunks),
        ] {
            if let Some(r) = range {
                if r.start >= r.end || r.end > total {
                    return fail(format!(
                        "{name} [{}, {}) must be non-empty and within [0, {total})",
                        r.start, r.end
                    ));
                }
            }
        }
        self.tunables.validate()
    }
}

/// Engine knobs. Every field has a default; values that differ from the
/// default are reported by [`Tunables::warn_non_default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// Row budget of one reducer.
    pub max_rows_per_reducer: u64,
    /// Bucket width in bp of the mpileup histogram side-index.
    pub histogram_stride: u64,
    pub range_planning: RangePlanning,
    pub map_timeout_secs: u64,
    pub reduce_timeout_secs: u64,
    /// Retries per task after the first attempt.
    pub stage_retries: usize,
    /// Maximum number of tasks running at once.
    pub max_workers: usize,
    /// Attempts per storage operation on transient errors.
    pub storage_attempts: u32,
    pub storage_backoff_ms: u64,
    /// Delete `tmp/{run}/` except the final artifact once the run succeeds.
    pub clean_scratch: bool,
    /// Directory holding the external binaries; `PATH` is used when unset.
    pub tools_dir: Option<PathBuf>,
    /// Local directory of the resume cache and run summaries.
    pub cache_dir: PathBuf,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            max_rows_per_reducer: 20_000_000,
            histogram_stride: 100_000,
            range_planning: RangePlanning::Histogram,
            map_timeout_secs: 2400,
            reduce_timeout_secs: 2400,
            stage_retries: 1,
            max_workers: 1000,
            storage_attempts: 5,
            storage_backoff_ms: 200,
            clean_scratch: true,
            tools_dir: None,
            cache_dir: PathBuf::from(".vc_cache"),
        }
    }
}

macro_rules! warn_non_default {
    ($self:ident, $defaults:ident, $($field:ident),+) => {
        $(
            if $self.$field != $defaults.$field {
                warn!("using non-default {} = {:?}", stringify!($field), $self.$field);
            }
        )+
    };
}

impl Tunables {
    pub fn map_timeout(&self) -> Duration {
        Duration::from_secs(self.map_timeout_secs)
    }

    pub fn reduce_timeout(&self) -> Duration {
        Duration::from_secs(self.reduce_timeout_secs)
    }

    pub fn warn_non_default(&self) {
        let defaults = Tunables::default();
        warn_non_default!(
            self,
            defaults,
            max_rows_per_reducer,
            histogram_stride,
            range_planning,
            map_timeout_secs,
            reduce_timeout_secs,
            stage_retries,
            max_workers,
            storage_attempts,
            storage_backoff_ms,
            clean_scratch
        );
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.max_rows_per_reducer == 0 {
            return Err(PipelineError::config("max_rows_per_reducer must be > 0"));
        }
        if self.histogram_stride == 0 {
            return Err(PipelineError::config("histogram_stride must be > 0"));
        }
        if self.max_workers == 0 {
            return Err(PipelineError::config("max_workers must be >= 1"));
        }
        if self.storage_attempts == 0 {
            return Err(PipelineError::config("storage_attempts must be >= 1"));
        }
        Ok(())
    }
}
