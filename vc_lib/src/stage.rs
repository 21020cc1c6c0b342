//! The split / main / join stage model.
//!
//! A stage splits its inputs into independent chunks, runs `main` once per
//! chunk on the executor, and joins the chunk outputs into the stage output.
//! The controller only ever sees stage outputs, which are what the resume
//! cache stores.

use crate::context::RunContext;
use crate::summary::RunSummary;
use anyhow::{Context, Result};
use log::info;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use vc_invoker::{Executor, ResumeCache, TaskPolicy};
use vc_store::StoreError;
use vc_types::{PipelineError, Tunables};

/// Whether a failed task attempt is worth another try.
///
/// Pipeline error kinds decide for themselves; storage errors are only
/// retried when transient (they were already retried inside the store);
/// anything else, such as a local I/O error, is retried.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<PipelineError>() {
            return e.is_retryable();
        }
        if let Some(e) = cause.downcast_ref::<StoreError>() {
            return e.is_transient();
        }
    }
    true
}

pub trait PipelineStage: Clone + Send + Sync + 'static {
    const NAME: &'static str;

    type StageInputs;
    type StageOutputs: Serialize + DeserializeOwned;
    type ChunkInputs: Clone + Send + 'static;
    type ChunkOutputs: Send + 'static;

    fn split(&self, ctx: &RunContext, args: &Self::StageInputs) -> Result<Vec<Self::ChunkInputs>>;

    fn main(&self, ctx: &RunContext, chunk: Self::ChunkInputs) -> Result<Self::ChunkOutputs>;

    fn join(
        &self,
        ctx: &RunContext,
        args: Self::StageInputs,
        chunk_defs: Vec<Self::ChunkInputs>,
        chunk_outs: Vec<Self::ChunkOutputs>,
    ) -> Result<Self::StageOutputs>;

    fn timeout(&self, tunables: &Tunables) -> Duration {
        tunables.map_timeout()
    }

    fn policy(&self, tunables: &Tunables) -> TaskPolicy {
        TaskPolicy::new(self.timeout(tunables), tunables.stage_retries).with_retry_if(is_retryable)
    }
}

/// Runs stages in order against one executor, consulting the resume cache.
pub struct StageRunner<'a, E: Executor> {
    ctx: Arc<RunContext>,
    executor: &'a E,
    cache: ResumeCache,
    summary: RunSummary,
}

impl<'a, E: Executor> StageRunner<'a, E> {
    pub fn new(ctx: Arc<RunContext>, executor: &'a E) -> Self {
        let params = &ctx.params;
        let cache = ResumeCache::new(
            &params.tunables.cache_dir,
            &params.run_id,
            params.checkpoints,
        );
        let summary = RunSummary::new(&params.run_id);
        StageRunner {
            ctx,
            executor,
            cache,
            summary,
        }
    }

    pub fn ctx(&self) -> &RunContext {
        &self.ctx
    }

    pub fn cache(&self) -> &ResumeCache {
        &self.cache
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    pub fn summary_mut(&mut self) -> &mut RunSummary {
        &mut self.summary
    }

    pub fn run<S: PipelineStage>(&mut self, stage: &S, args: S::StageInputs) -> Result<S::StageOutputs> {
        if let Some(outs) = self.cache.load::<S::StageOutputs>(S::NAME) {
            self.summary.record(S::NAME, 0, true, Duration::ZERO);
            return Ok(outs);
        }

        let started = Instant::now();
        let chunk_defs = stage
            .split(&self.ctx, &args)
            .with_context(|| format!("splitting stage {}", S::NAME))?;
        let tasks = chunk_defs.len();
        info!("{}: running {tasks} tasks", S::NAME);

        let policy = stage.policy(&self.ctx.params.tunables);
        let (ctx, worker) = (Arc::clone(&self.ctx), stage.clone());
        let chunk_outs = self
            .executor
            .map(
                S::NAME,
                &policy,
                move |chunk| worker.main(&ctx, chunk),
                chunk_defs.clone(),
            )
            .with_context(|| format!("stage {} failed", S::NAME))?;

        let outs = stage
            .join(&self.ctx, args, chunk_defs, chunk_outs)
            .with_context(|| format!("joining stage {}", S::NAME))?;
        self.cache.save(S::NAME, &outs)?;
        let wall = started.elapsed();
        info!("{}: done in {:.1}s", S::NAME, wall.as_secs_f64());
        self.summary.record(S::NAME, tasks, false, wall);
        Ok(outs)
    }
}
