//! Reduce every coordinate range of a fasta group into one part of the
//! group's multipart upload.
//!
//! Parts are numbered from 1 in ascending coordinate order, so completing the
//! upload yields a group object sorted on the coordinate column.

use super::range_partition::GroupRanges;
use super::tool_failure;
use crate::context::RunContext;
use crate::mpileup;
use crate::stage::PipelineStage;
use crate::uploads::UploadRegistry;
use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::time::Duration;
use vc_store::{CompletedPart, SelectQuery};
use vc_tools::names;
use vc_types::{PipelineError, Tunables};

/// One reducer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReducerRange {
    pub fasta_chunk: usize,
    pub keys: Vec<String>,
    /// Inclusive coordinate bounds.
    pub start: u64,
    pub end: u64,
    pub mpu_key: String,
    pub mpu_id: String,
    pub part_number: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReducerResult {
    pub fasta_chunk: usize,
    pub mpu_key: String,
    pub mpu_id: String,
    pub part: CompletedPart,
}

#[derive(Debug, Clone, Default)]
pub struct ReduceMpileup {
    uploads: UploadRegistry,
}

impl ReduceMpileup {
    pub fn new(uploads: UploadRegistry) -> Self {
        ReduceMpileup { uploads }
    }
}

impl PipelineStage for ReduceMpileup {
    const NAME: &'static str = "reduce_mpileup";
    type StageInputs = Vec<GroupRanges>;
    type StageOutputs = Vec<ReducerResult>;
    type ChunkInputs = ReducerRange;
    type ChunkOutputs = ReducerResult;

    /// Opens one multipart upload per non-empty group.
    fn split(&self, ctx: &RunContext, groups: &Vec<GroupRanges>) -> Result<Vec<ReducerRange>> {
        let mut ranges = Vec::new();
        for group in groups.iter().filter(|g| !g.ends.is_empty()) {
            let mpu_key = ctx.keys.group_upload(group.fasta_chunk);
            let mpu_id = ctx.store().mpu_create(ctx.bucket(), &mpu_key)?;
            self.uploads.register(&mpu_key, &mpu_id);
            for (part, (start, end)) in group.ranges().enumerate() {
                ranges.push(ReducerRange {
                    fasta_chunk: group.fasta_chunk,
                    keys: group.keys.clone(),
                    start,
                    end,
                    mpu_key: mpu_key.clone(),
                    mpu_id: mpu_id.clone(),
                    part_number: i32::try_from(part + 1)?,
                });
            }
        }
        Ok(ranges)
    }

    fn main(&self, ctx: &RunContext, range: ReducerRange) -> Result<ReducerResult> {
        let label = format!("fa{} [{}, {}]", range.fasta_chunk, range.start, range.end);
        let dir = ctx.scratch_dir(&format!("reduce-fa{}-{}", range.fasta_chunk, range.part_number))?;
        let reduce = dir.path().join("reduce.mpileup");
        let merged = dir.path().join("merged.mpileup");

        let query = SelectQuery::rows_between(
            mpileup::coord_column(),
            i64::try_from(range.start)?,
            i64::try_from(range.end)?,
            mpileup::input_format(ctx.params.file_format),
        );
        let mut out = BufWriter::new(File::create(&reduce)?);
        let mut rows = 0u64;
        for key in &range.keys {
            for record in ctx.store().select(ctx.bucket(), key, &query)? {
                writeln!(out, "{}", record?)?;
                rows += 1;
            }
        }
        out.flush()?;
        drop(out);

        ctx.tools
            .command(names::MPILEUP_MERGE)
            .current_dir(dir.path())
            .arg(&reduce)
            .stdout_file(&merged)
            .run()
            .map_err(|e| {
                tool_failure(e, |code, stderr| PipelineError::MergeFailed {
                    what: label.clone(),
                    code,
                    stderr,
                })
            })?;
        let body = fs::read(&merged).with_context(|| merged.display().to_string())?;
        let part = ctx.store().mpu_part_upload(
            ctx.bucket(),
            &range.mpu_key,
            &range.mpu_id,
            range.part_number,
            &body,
        )?;
        debug!(
            "{label}: {rows} rows, {} merged bytes as part {}",
            body.len(),
            range.part_number
        );
        Ok(ReducerResult {
            fasta_chunk: range.fasta_chunk,
            mpu_key: range.mpu_key,
            mpu_id: range.mpu_id,
            part,
        })
    }

    fn join(
        &self,
        _ctx: &RunContext,
        _groups: Vec<GroupRanges>,
        _chunk_defs: Vec<ReducerRange>,
        results: Vec<ReducerResult>,
    ) -> Result<Vec<ReducerResult>> {
        info!("reduced {} ranges", results.len());
        Ok(results)
    }

    fn timeout(&self, tunables: &Tunables) -> Duration {
        tunables.reduce_timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{minimal_params, Fixture, BUCKET};
    use pretty_assertions::assert_eq;
    use vc_store::{Metadata, ObjectStore};

    fn groups(fixture: &Fixture) -> Vec<GroupRanges> {
        let prefix = "tmp/test-run/filtered_index_to_mpileup";
        let shards = [
            ("fa0-fq0", "A\t1\tA\t1\t.\tI\nA\t3\tA\t1\t.\tI\nA\t5\tA\t1\t.\tI\n"),
            ("fa0-fq1", "A\t2\tA\t1\t.\tI\nA\t4\tA\t1\t.\tI\nA\t6\tA\t1\t.\tI\n"),
        ];
        let keys = shards
            .iter()
            .map(|(mid, body)| {
                let key = format!("{prefix}/{mid}/r_{mid}.mpileup.csv");
                fixture
                    .store
                    .put(BUCKET, &key, body.as_bytes(), &Metadata::new())
                    .unwrap();
                key
            })
            .collect();
        vec![
            GroupRanges {
                fasta_chunk: 0,
                keys,
                ends: vec![3, 6],
            },
            GroupRanges {
                fasta_chunk: 1,
                keys: vec![],
                ends: vec![],
            },
        ]
    }

    #[test]
    fn test_parts_follow_coordinate_order() {
        let fixture = Fixture::new();
        let ctx = fixture.context(minimal_params());
        let registry = UploadRegistry::default();
        let stage = ReduceMpileup::new(registry.clone());
        let ranges = stage.split(&ctx, &groups(&fixture)).unwrap();
        assert_eq!(
            ranges
                .iter()
                .map(|r| (r.start, r.end, r.part_number))
                .collect::<Vec<_>>(),
            vec![(1, 3, 1), (4, 6, 2)]
        );
        assert_eq!(ranges[0].mpu_key, "tmp/test-run/multipart_uploads/fa0.sinple");
        // only the non-empty group opened an upload
        assert_eq!(registry.open().len(), 1);

        // parts can finish in any order
        let second = stage.main(&ctx, ranges[1].clone()).unwrap();
        let first = stage.main(&ctx, ranges[0].clone()).unwrap();
        assert_eq!(first.part.part_number, 1);
        fixture
            .store
            .mpu_complete(
                BUCKET,
                &first.mpu_key,
                &first.mpu_id,
                &[first.part.clone(), second.part.clone()],
            )
            .unwrap();
        let body = fixture.store.get(BUCKET, &first.mpu_key, None).unwrap();
        let coords: Vec<u64> = String::from_utf8(body)
            .unwrap()
            .lines()
            .map(|l| l.split('\t').nth(1).unwrap().parse().unwrap())
            .collect();
        assert_eq!(coords, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_merge_failure() {
        let fixture = Fixture::new();
        fixture.install_tool(names::MPILEUP_MERGE, "exit 1");
        let ctx = fixture.context(minimal_params());
        let stage = ReduceMpileup::default();
        let ranges = stage.split(&ctx, &groups(&fixture)).unwrap();
        let err = stage.main(&ctx, ranges[0].clone()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MergeFailed { .. })
        ));
    }
}
