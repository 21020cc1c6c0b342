use anyhow::Result;
use std::sync::Arc;
use tempfile::TempDir;
use vc_store::ObjectStore;
use vc_tools::ToolPaths;
use vc_types::keys::{fasta_key, fastq_key};
use vc_types::{FastqSource, PipelineParameters, RunKeys};

/// Everything a task needs, shared read-only by all tasks of a run.
pub struct RunContext {
    pub params: PipelineParameters,
    pub keys: RunKeys,
    pub store: Arc<dyn ObjectStore>,
    pub tools: ToolPaths,
    /// Sanitized fasta file stem used in cached keys.
    pub fasta_key: String,
    /// Read-set name used in run keys: the first mate's fastq key or the SRA
    /// accession.
    pub acc: String,
}

impl RunContext {
    /// Validate `params` and derive the run-wide names.
    pub fn new(params: PipelineParameters, store: Arc<dyn ObjectStore>) -> Result<Self> {
        params.validate()?;
        let acc = match params.fastq_source()? {
            FastqSource::Gzip { mate1, .. } => fastq_key(&mate1),
            FastqSource::Sra { accession } => accession,
        };
        Ok(RunContext {
            keys: RunKeys::new(params.run_id.clone()),
            tools: ToolPaths::new(params.tunables.tools_dir.clone()),
            fasta_key: fasta_key(&params.fasta_path),
            acc,
            params,
            store,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.params.bucket
    }

    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    /// True if every key exists in the run bucket.
    pub fn all_exist(&self, keys: &[&str]) -> Result<bool> {
        for key in keys {
            if !self.store.exists(self.bucket(), key)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// A scratch directory for one task, removed when dropped.
    pub fn scratch_dir(&self, label: &str) -> Result<TempDir> {
        Ok(tempfile::Builder::new()
            .prefix(&format!("vc-{}-{label}-", self.params.run_id))
            .tempdir()?)
    }
}
