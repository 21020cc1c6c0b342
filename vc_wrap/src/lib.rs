// Warning groups (as of rust 1.55)
#![deny(
    future_incompatible,
    nonstandard_style,
    rust_2018_compatibility,
    rust_2021_compatibility,
    rust_2018_idioms
)]
#![warn(unused)]

//! Command-line driver for the variant-calling pipeline.

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use env_logger::Builder;
use itertools::Itertools;
use log::{info, LevelFilter};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use vc_invoker::LocalExecutor;
use vc_lib::{Pipeline, PipelineOutputs, RunContext};
use vc_store::{LocalObjectStore, ObjectStore, RetryPolicy, Retrying};
use vc_types::{ChunkRange, FileFormat, LogLevel, PipelineParameters, RangePlanning, Tunables};

/// Align reads against a reference and produce a per-base pileup.
#[derive(Parser, Debug, Clone)]
#[clap(name = "variant-call", version)]
pub struct Args {
    /// TOML file with the run parameters.
    pub params: PathBuf,

    /// Identifier of the run; defaults to the file value or a fresh uuid.
    #[clap(long)]
    pub run_id: Option<String>,

    #[clap(long)]
    pub bucket: Option<String>,

    #[clap(long)]
    pub fasta_chunks: Option<usize>,

    #[clap(long)]
    pub fastq_chunks: Option<usize>,

    /// Only process fasta chunks in `lo:hi`.
    #[clap(long, value_name = "LO:HI")]
    pub fasta_chunk_range: Option<ChunkRange>,

    /// Only process fastq chunks in `lo:hi`.
    #[clap(long, value_name = "LO:HI")]
    pub fastq_chunk_range: Option<ChunkRange>,

    /// csv or parquet.
    #[clap(long)]
    pub file_format: Option<FileFormat>,

    /// histogram or select.
    #[clap(long)]
    pub range_planning: Option<RangePlanning>,

    /// error, warn, info, debug or trace. `RUST_LOG` takes precedence.
    #[clap(long)]
    pub log_level: Option<LogLevel>,

    #[clap(long)]
    pub max_workers: Option<usize>,

    /// Directory holding the external binaries.
    #[clap(long)]
    pub tools_dir: Option<PathBuf>,

    /// Directory of the resume cache and run summaries.
    #[clap(long)]
    pub cache_dir: Option<PathBuf>,

    /// Do not read or write the resume cache.
    #[clap(long)]
    pub no_checkpoints: bool,

    /// Keep the scratch objects of the run.
    #[clap(long)]
    pub keep_scratch: bool,

    /// Serve buckets from subdirectories of this directory instead of S3.
    #[clap(long, value_name = "DIR")]
    pub local_store: Option<PathBuf>,

    /// Endpoint of an S3-compatible service.
    #[cfg(feature = "s3")]
    #[clap(long)]
    pub endpoint_url: Option<String>,
}

impl Args {
    /// Load the parameter file and apply the command-line overrides.
    pub fn parameters(&self) -> Result<PipelineParameters> {
        let mut params = PipelineParameters::from_toml_file(&self.params)
            .context("loading the run parameters")?;
        self.apply(&mut params);
        params.validate()?;
        Ok(params)
    }

    fn apply(&self, p: &mut PipelineParameters) {
        if let Some(run_id) = &self.run_id {
            p.run_id.clone_from(run_id);
        }
        if let Some(bucket) = &self.bucket {
            p.bucket.clone_from(bucket);
        }
        if let Some(n) = self.fasta_chunks {
            p.fasta_chunks = n;
        }
        if let Some(n) = self.fastq_chunks {
            p.fastq_chunks = n;
        }
        if self.fasta_chunk_range.is_some() {
            p.fasta_chunk_range = self.fasta_chunk_range;
        }
        if self.fastq_chunk_range.is_some() {
            p.fastq_chunk_range = self.fastq_chunk_range;
        }
        if let Some(format) = self.file_format {
            p.file_format = format;
        }
        if let Some(level) = self.log_level {
            p.log_level = level;
        }
        if self.no_checkpoints {
            p.checkpoints = false;
        }
        let t = &mut p.tunables;
        if let Some(planning) = self.range_planning {
            t.range_planning = planning;
        }
        if let Some(n) = self.max_workers {
            t.max_workers = n;
        }
        if self.tools_dir.is_some() {
            t.tools_dir.clone_from(&self.tools_dir);
        }
        if let Some(dir) = &self.cache_dir {
            t.cache_dir.clone_from(dir);
        }
        if self.keep_scratch {
            t.clean_scratch = false;
        }
    }

    fn open_store(&self, tunables: &Tunables) -> Result<Arc<dyn ObjectStore>> {
        let policy = RetryPolicy {
            attempts: tunables.storage_attempts,
            initial_backoff: Duration::from_millis(tunables.storage_backoff_ms),
        };
        if let Some(root) = &self.local_store {
            let store = LocalObjectStore::new(root)
                .with_context(|| format!("opening the local store at {}", root.display()))?;
            return Ok(Arc::new(Retrying::new(store, policy)));
        }
        self.open_s3(policy)
    }

    #[cfg(feature = "s3")]
    fn open_s3(&self, policy: RetryPolicy) -> Result<Arc<dyn ObjectStore>> {
        let store = vc_store::S3ObjectStore::from_env(self.endpoint_url.as_deref())?;
        Ok(Arc::new(Retrying::new(store, policy)))
    }

    #[cfg(not(feature = "s3"))]
    fn open_s3(&self, _policy: RetryPolicy) -> Result<Arc<dyn ObjectStore>> {
        anyhow::bail!("built without S3 support, pass --local-store")
    }
}

/// Timestamped stderr logging at `level`, unless `RUST_LOG` says otherwise.
pub fn setup_logging(level: LogLevel) {
    Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {} - {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .filter(None, LevelFilter::from(level))
        .parse_default_env()
        .init();
}

pub fn print_error_chain(err: &anyhow::Error) {
    eprintln!("ERROR: {}", err.chain().join("\n\tCaused by: "));
}

pub fn run(args: &Args) -> Result<PipelineOutputs> {
    let params = args.parameters()?;
    setup_logging(params.log_level);
    info!("loaded {}", args.params.display());
    let store = args.open_store(&params.tunables)?;
    let executor = LocalExecutor::new(params.tunables.max_workers);
    let ctx = RunContext::new(params, store)?;
    Pipeline::new(ctx, executor)?.run()
}
