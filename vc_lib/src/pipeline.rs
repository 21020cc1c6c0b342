//! The controller: runs the stages of one pipeline run in order.

use crate::context::RunContext;
use crate::plan::build_plan;
use crate::stage::{PipelineStage, StageRunner};
use crate::stages::align_map1::{AlignMap1, Map1Inputs};
use crate::stages::align_map2::{AlignMap2, Map2Inputs};
use crate::stages::cleanup::clean_scratch;
use crate::stages::fasta_partition::FastaPartition;
use crate::stages::fastq_partition::FastqPartition;
use crate::stages::final_assembly::{FinalArtifact, FinalAssembly};
use crate::stages::index_correction::{CorrectionInputs, IndexCorrection};
use crate::stages::prepare_gem::PrepareGem;
use crate::stages::range_partition::RangePartition;
use crate::stages::reduce_mpileup::ReduceMpileup;
use crate::summary::RunSummary;
use crate::uploads::UploadRegistry;
use anyhow::Result;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Instant;
use vc_invoker::Executor;
use vc_partition::fastq_sra::{EutilsSpotCounter, SpotCounter};

#[derive(Debug, Clone)]
pub struct PipelineOutputs {
    pub final_artifact: String,
    pub size: u64,
    pub summary: RunSummary,
}

pub struct Pipeline<E: Executor> {
    ctx: Arc<RunContext>,
    executor: E,
    spot_counter: Arc<dyn SpotCounter + Send + Sync>,
}

impl<E: Executor> Pipeline<E> {
    pub fn new(ctx: RunContext, executor: E) -> Result<Self> {
        Ok(Pipeline {
            ctx: Arc::new(ctx),
            executor,
            spot_counter: Arc::new(EutilsSpotCounter::new()?),
        })
    }

    pub fn with_spot_counter(mut self, spot_counter: Arc<dyn SpotCounter + Send + Sync>) -> Self {
        self.spot_counter = spot_counter;
        self
    }

    pub fn ctx(&self) -> &RunContext {
        &self.ctx
    }

    /// Run every stage. On failure the open multipart uploads are aborted and
    /// the summary is still written.
    pub fn run(&self) -> Result<PipelineOutputs> {
        let ctx = &self.ctx;
        info!("starting run {} for {}", ctx.params.run_id, ctx.acc);
        ctx.params.tunables.warn_non_default();

        let uploads = UploadRegistry::default();
        let mut runner = StageRunner::new(Arc::clone(ctx), &self.executor);
        let result = self.run_stages(&mut runner, &uploads);
        let summary_dir = runner.cache().dir().to_path_buf();
        match result {
            Ok(artifact) => {
                let summary = runner.summary_mut();
                summary.finish(Some(artifact.key.clone()));
                summary.log();
                summary.write(&summary_dir)?;
                info!(
                    "run {} finished: {}/{} ({} bytes)",
                    ctx.params.run_id,
                    ctx.bucket(),
                    artifact.key,
                    artifact.size
                );
                Ok(PipelineOutputs {
                    final_artifact: artifact.key,
                    size: artifact.size,
                    summary: summary.clone(),
                })
            }
            Err(e) => {
                if uploads.abort_all(ctx.store(), ctx.bucket()) > 0 {
                    // the reducer parts went with the aborted uploads
                    runner.cache().remove(ReduceMpileup::NAME)?;
                }
                let summary = runner.summary_mut();
                summary.finish(None);
                summary.log();
                if let Err(write_err) = summary.write(&summary_dir) {
                    warn!("could not write the run summary: {write_err:#}");
                }
                error!("run {} failed", ctx.params.run_id);
                Err(e)
            }
        }
    }

    fn run_stages(
        &self,
        runner: &mut StageRunner<'_, E>,
        uploads: &UploadRegistry,
    ) -> Result<FinalArtifact> {
        let params = &self.ctx.params;
        let fasta = runner.run(&FastaPartition, ())?;
        let fastq = runner.run(&FastqPartition::new(Arc::clone(&self.spot_counter)), ())?;
        let plan = build_plan(
            &fasta,
            &fastq,
            params.fasta_chunk_range,
            params.fastq_chunk_range,
        )?;
        info!(
            "{} fasta x {} fastq chunks: {} mapper tasks",
            plan.fasta_chunks.len(),
            plan.fastq_chunks.len(),
            plan.tasks.len()
        );

        let gems = runner.run(&PrepareGem, plan.fasta_chunks.clone())?;
        let map1 = runner.run(
            &AlignMap1,
            Map1Inputs {
                plan: plan.clone(),
                gems,
            },
        )?;
        let corrected = runner.run(
            &IndexCorrection,
            CorrectionInputs {
                plan: plan.clone(),
                map1: map1.clone(),
            },
        )?;
        runner.run(
            &AlignMap2,
            Map2Inputs {
                plan: plan.clone(),
                map1,
                corrected,
            },
        )?;

        let groups = runner.run(&RangePartition, plan)?;
        let reduced = runner.run(&ReduceMpileup::new(uploads.clone()), groups)?;
        let artifact = runner.run(&FinalAssembly::new(uploads.clone()), reduced)?;

        if params.tunables.clean_scratch {
            let started = Instant::now();
            clean_scratch(&self.ctx)?;
            runner
                .summary_mut()
                .record("cleanup", 1, false, started.elapsed());
        }
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{minimal_params, Fixture, BUCKET};
    use pretty_assertions::assert_eq;
    use vc_invoker::LocalExecutor;
    use vc_store::ObjectStore;
    use vc_tools::names;
    use vc_types::{ChunkRange, FileFormat};

    fn pipeline(fixture: &Fixture, params: vc_types::PipelineParameters) -> Pipeline<LocalExecutor> {
        let executor = LocalExecutor::new(params.tunables.max_workers);
        Pipeline::new(fixture.context(params), executor).unwrap()
    }

    fn coords_of(body: &[u8]) -> Vec<(String, u64)> {
        String::from_utf8_lossy(body)
            .lines()
            .map(|l| {
                let mut fields = l.split('\t');
                let chrom = fields.next().unwrap().to_string();
                (chrom, fields.next().unwrap().parse().unwrap())
            })
            .collect()
    }

    #[test]
    fn test_end_to_end() {
        let fixture = Fixture::new();
        let outputs = pipeline(&fixture, minimal_params()).run().unwrap();
        assert_eq!(outputs.final_artifact, "tmp/test-run/final.alignment");

        // 2 fasta x 2 fastq chunks
        assert_eq!(fixture.calls(names::GEM_INDEXER), 2);
        assert_eq!(fixture.calls(names::ALIGNER), 4);
        assert_eq!(fixture.calls(names::BINARY_REDUCER), 2);
        assert_eq!(fixture.calls(names::PILEUP), 4);

        // each base is piled up once per fastq chunk, groups in fasta order
        let body = fixture.store.get(BUCKET, &outputs.final_artifact, None).unwrap();
        assert_eq!(body.len() as u64, outputs.size);
        let coords = coords_of(&body);
        assert_eq!(coords.len(), 2 * (10 + 20));
        assert!(coords[..20].iter().all(|(c, _)| c == "A"));
        assert!(coords[20..].iter().all(|(c, _)| c == "B"));
        assert!(coords[..20].windows(2).all(|w| w[0].1 <= w[1].1));
        assert!(coords[20..].windows(2).all(|w| w[0].1 <= w[1].1));

        // scratch is gone, the cached inputs stay
        assert_eq!(
            fixture.store.list(BUCKET, "tmp/").unwrap(),
            vec!["tmp/test-run/final.alignment"]
        );
        assert!(fixture.store.exists(BUCKET, "faidx/tiny.2.bz2").unwrap());
        assert!(fixture
            .store
            .exists(BUCKET, "gem/tiny/2-chunks/chunk0000.gem")
            .unwrap());
        assert!(fixture.store.open_uploads().unwrap().is_empty());

        let stages: Vec<&str> = outputs.summary.stages.iter().map(|s| &*s.stage).collect();
        assert_eq!(
            stages,
            vec![
                "fasta_partition",
                "fastq_partition",
                "prepare_gem",
                "align_map1",
                "index_correction",
                "align_map2",
                "range_partition",
                "reduce_mpileup",
                "final_assembly",
                "cleanup",
            ]
        );
        assert!(fixture
            .dir
            .path()
            .join("cache/test-run/summary.json")
            .exists());
    }

    #[test]
    fn test_parquet_with_small_reducers() {
        let fixture = Fixture::new();
        let mut params = minimal_params();
        params.file_format = FileFormat::Parquet;
        params.tunables.histogram_stride = 5;
        params.tunables.max_rows_per_reducer = 10;
        params.tunables.clean_scratch = false;
        let outputs = pipeline(&fixture, params).run().unwrap();
        let body = fixture.store.get(BUCKET, &outputs.final_artifact, None).unwrap();
        let coords = coords_of(&body);
        assert_eq!(coords.len(), 60);
        assert!(coords[..20].windows(2).all(|w| w[0].1 <= w[1].1));
        assert!(coords[20..].windows(2).all(|w| w[0].1 <= w[1].1));
        // 10 rows per bucket of 5 bases: A in 2 ranges, B in 4
        let reducers = outputs
            .summary
            .stages
            .iter()
            .find(|s| s.stage == "reduce_mpileup")
            .unwrap();
        assert_eq!(reducers.tasks, 6);
        assert!(fixture
            .store
            .list(BUCKET, "tmp/test-run/filtered_index_to_mpileup/")
            .unwrap()
            .iter()
            .any(|k| k.ends_with(".mpileup.parquet")));
    }

    #[test]
    fn test_chunk_range_selects_one_task() {
        let fixture = Fixture::new();
        let mut params = minimal_params();
        params.fasta_chunk_range = Some(ChunkRange { start: 1, end: 2 });
        params.fastq_chunk_range = Some(ChunkRange { start: 0, end: 1 });
        let outputs = pipeline(&fixture, params).run().unwrap();
        assert_eq!(fixture.calls(names::ALIGNER), 1);
        let body = fixture.store.get(BUCKET, &outputs.final_artifact, None).unwrap();
        let coords = coords_of(&body);
        assert_eq!(coords.len(), 20);
        assert!(coords.iter().all(|(c, _)| c == "B"));
    }

    #[test]
    fn test_failure_aborts_uploads_and_resumes() {
        let fixture = Fixture::new();
        // a merge that fails once the first reducer has run
        let flag = fixture.dir.path().join("merge-ran");
        fixture.install_tool(
            names::MPILEUP_MERGE,
            &format!(
                r#"if [ -e '{flag}' ]; then exit 3; fi
touch '{flag}'
sort -k2,2n "$1""#,
                flag = flag.display()
            ),
        );
        let mut params = minimal_params();
        params.tunables.max_workers = 1;
        let err = pipeline(&fixture, params.clone()).run().unwrap_err();
        assert!(format!("{err:#}").contains("reduce_mpileup"));
        assert!(fixture.store.open_uploads().unwrap().is_empty());
        let summary = std::fs::read_to_string(fixture.dir.path().join("cache/test-run/summary.json"))
            .unwrap();
        assert!(summary.contains("\"succeeded\": false"));

        // the second attempt resumes after the alignment stages
        fixture.install_tool(names::MPILEUP_MERGE, r#"sort -k2,2n "$1""#);
        let outputs = pipeline(&fixture, params).run().unwrap();
        assert_eq!(fixture.calls(names::ALIGNER), 4);
        let cached: Vec<&str> = outputs
            .summary
            .stages
            .iter()
            .filter(|s| s.cached)
            .map(|s| &*s.stage)
            .collect();
        assert!(cached.contains(&"align_map2"));
        assert!(!cached.contains(&"reduce_mpileup"));
        assert!(fixture.store.exists(BUCKET, &outputs.final_artifact).unwrap());
    }

    #[test]
    fn test_invalid_configuration_fails_before_any_io() {
        let fixture = Fixture::new();
        let mut params = minimal_params();
        params.fasta_chunks = 0;
        let store: Arc<dyn ObjectStore> = fixture.store.clone();
        let err = RunContext::new(params, store).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<vc_types::PipelineError>(),
            Some(vc_types::PipelineError::ConfigInvalid(_))
        ));
    }
}
