//! Complete the per-group uploads, then concatenate the group objects into
//! the final artifact with a server-side part copy.

use super::reduce_mpileup::ReducerResult;
use crate::context::RunContext;
use crate::stage::PipelineStage;
use crate::uploads::UploadRegistry;
use anyhow::{anyhow, Context, Result};
use itertools::Itertools;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use vc_store::{ByteRange, CompletedPart, Metadata, StoreError, MAX_PART_SIZE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupUpload {
    pub fasta_chunk: usize,
    pub mpu_key: String,
    pub mpu_id: String,
    /// In ascending part number.
    pub parts: Vec<CompletedPart>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupObject {
    pub fasta_chunk: usize,
    pub key: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalArtifact {
    pub key: String,
    pub size: u64,
    /// Number of groups copied in.
    pub groups: usize,
}

/// Bytes of one group object; `None` is the whole object.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    key: String,
    range: Option<ByteRange>,
}

impl Segment {
    fn new(group: &GroupObject, first: u64, last: u64) -> Self {
        let whole = first == 0 && last + 1 == group.size;
        Segment {
            key: group.key.clone(),
            range: (!whole).then(|| ByteRange::new(first, last)),
        }
    }
}

/// How one part of the final upload is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PartPlan {
    /// Server-side copy.
    Copy(Segment),
    /// Read back and uploaded as one body.
    Upload(Vec<Segment>),
}

/// Lay the groups out as parts of at least `min` bytes, except the last,
/// and at most `max` bytes. Groups below `min` are gathered with the head of
/// the following group; everything else is copied server-side.
fn plan_parts(groups: &[GroupObject], min: u64, max: u64) -> Vec<PartPlan> {
    let mut parts = Vec::new();
    let mut pending = Vec::new();
    let mut buffered = 0;
    for group in groups.iter().filter(|g| g.size > 0) {
        let mut offset = 0;
        if buffered > 0 || group.size < min {
            // take just enough when the rest can stand as a part of its own
            let need = min - buffered;
            let take = if group.size.saturating_sub(need) >= min {
                need
            } else {
                group.size
            };
            pending.push(Segment::new(group, 0, take - 1));
            buffered += take;
            offset = take;
            if buffered >= min {
                parts.push(PartPlan::Upload(std::mem::take(&mut pending)));
                buffered = 0;
            }
        }
        let rest = group.size - offset;
        if rest == 0 {
            continue;
        }
        let piece = rest.div_ceil(rest.div_ceil(max));
        let mut first = offset;
        while first < group.size {
            let last = (first + piece).min(group.size) - 1;
            parts.push(PartPlan::Copy(Segment::new(group, first, last)));
            first = last + 1;
        }
    }
    if !pending.is_empty() {
        parts.push(PartPlan::Upload(pending));
    }
    parts
}

#[derive(Debug, Clone, Default)]
pub struct FinalAssembly {
    uploads: UploadRegistry,
}

impl FinalAssembly {
    pub fn new(uploads: UploadRegistry) -> Self {
        FinalAssembly { uploads }
    }

    fn concatenate(&self, ctx: &RunContext, groups: &[GroupObject]) -> Result<()> {
        let (store, bucket) = (ctx.store(), ctx.bucket());
        let key = ctx.keys.final_artifact();
        let upload_id = store.mpu_create(bucket, &key)?;
        self.uploads.register(&key, &upload_id);
        let plan = plan_parts(groups, store.min_part_size(), MAX_PART_SIZE);
        let mut parts = Vec::with_capacity(plan.len());
        for (n, part) in plan.into_iter().enumerate() {
            let part_number = i32::try_from(n + 1)?;
            parts.push(match part {
                PartPlan::Copy(seg) => store.mpu_part_copy(
                    bucket,
                    &key,
                    &upload_id,
                    part_number,
                    bucket,
                    &seg.key,
                    seg.range,
                )?,
                PartPlan::Upload(segs) => {
                    let mut body = Vec::new();
                    for seg in segs {
                        body.extend(store.get(bucket, &seg.key, seg.range)?);
                    }
                    store.mpu_part_upload(bucket, &key, &upload_id, part_number, &body)?
                }
            });
        }
        store.mpu_complete(bucket, &key, &upload_id, &parts)?;
        self.uploads.forget(&key, &upload_id);
        Ok(())
    }
}

impl PipelineStage for FinalAssembly {
    const NAME: &'static str = "final_assembly";
    type StageInputs = Vec<ReducerResult>;
    type StageOutputs = FinalArtifact;
    type ChunkInputs = GroupUpload;
    type ChunkOutputs = GroupObject;

    fn split(&self, _ctx: &RunContext, results: &Vec<ReducerResult>) -> Result<Vec<GroupUpload>> {
        let groups = results
            .iter()
            .into_group_map_by(|r| (r.fasta_chunk, r.mpu_key.clone(), r.mpu_id.clone()));
        Ok(groups
            .into_iter()
            .sorted_by_key(|((fasta_chunk, _, _), _)| *fasta_chunk)
            .map(|((fasta_chunk, mpu_key, mpu_id), results)| {
                // uploads opened by an earlier process are aborted on failure too
                self.uploads.register(&mpu_key, &mpu_id);
                GroupUpload {
                    fasta_chunk,
                    mpu_key,
                    mpu_id,
                    parts: results
                        .into_iter()
                        .map(|r| r.part.clone())
                        .sorted_by_key(|p| p.part_number)
                        .collect(),
                }
            })
            .collect())
    }

    fn main(&self, ctx: &RunContext, group: GroupUpload) -> Result<GroupObject> {
        let (store, bucket) = (ctx.store(), ctx.bucket());
        match store.mpu_complete(bucket, &group.mpu_key, &group.mpu_id, &group.parts) {
            Ok(()) => {}
            // completed by an earlier attempt
            Err(StoreError::NoSuchUpload { .. }) if store.exists(bucket, &group.mpu_key)? => {
                warn!("upload {} of {} was already completed", group.mpu_id, group.mpu_key);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("completing {}", group.mpu_key));
            }
        }
        self.uploads.forget(&group.mpu_key, &group.mpu_id);
        let size = store
            .head(bucket, &group.mpu_key)?
            .ok_or_else(|| anyhow!("{} vanished after completion", group.mpu_key))?
            .size;
        Ok(GroupObject {
            fasta_chunk: group.fasta_chunk,
            key: group.mpu_key,
            size,
        })
    }

    fn join(
        &self,
        ctx: &RunContext,
        _results: Vec<ReducerResult>,
        _chunk_defs: Vec<GroupUpload>,
        groups: Vec<GroupObject>,
    ) -> Result<FinalArtifact> {
        let key = ctx.keys.final_artifact();
        let non_empty: Vec<GroupObject> = groups
            .into_iter()
            .filter(|g| g.size > 0)
            .sorted_by_key(|g| g.fasta_chunk)
            .collect();
        if non_empty.is_empty() {
            warn!("no pileup rows in any group, writing an empty artifact");
            ctx.store()
                .put(ctx.bucket(), &key, &[], &Metadata::new())?;
        } else {
            self.concatenate(ctx, &non_empty)
                .with_context(|| format!("assembling {key}"))?;
        }
        let size = ctx
            .store()
            .head(ctx.bucket(), &key)?
            .ok_or_else(|| anyhow!("{key} is missing after assembly"))?
            .size;
        info!(
            "wrote {}/{key}: {size} bytes from {} groups",
            ctx.bucket(),
            non_empty.len()
        );
        Ok(FinalArtifact {
            key,
            size,
            groups: non_empty.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{minimal_params, Fixture, BUCKET};
    use pretty_assertions::assert_eq;
    use vc_store::ObjectStore;

    /// Open an upload per group with the given part bodies, in reverse part
    /// order.
    fn reduced(fixture: &Fixture, groups: &[(usize, &[&str])]) -> Vec<ReducerResult> {
        let mut results = Vec::new();
        for (fasta_chunk, bodies) in groups {
            let key = format!("tmp/test-run/multipart_uploads/fa{fasta_chunk}.sinple");
            let id = fixture.store.mpu_create(BUCKET, &key).unwrap();
            for (n, body) in bodies.iter().enumerate().rev() {
                let part = fixture
                    .store
                    .mpu_part_upload(BUCKET, &key, &id, n as i32 + 1, body.as_bytes())
                    .unwrap();
                results.push(ReducerResult {
                    fasta_chunk: *fasta_chunk,
                    mpu_key: key.clone(),
                    mpu_id: id.clone(),
                    part,
                });
            }
        }
        results
    }

    fn assemble(fixture: &Fixture, results: Vec<ReducerResult>) -> (FinalArtifact, Vec<GroupObject>) {
        let ctx = fixture.context(minimal_params());
        let registry = UploadRegistry::default();
        let stage = FinalAssembly::new(registry.clone());
        let defs = stage.split(&ctx, &results).unwrap();
        let objects: Vec<GroupObject> = defs
            .iter()
            .map(|d| stage.main(&ctx, d.clone()).unwrap())
            .collect();
        let artifact = stage
            .join(&ctx, results, defs, objects.clone())
            .unwrap();
        assert!(registry.is_empty());
        (artifact, objects)
    }

    #[test]
    fn test_final_size_is_sum_of_groups() {
        let fixture = Fixture::new();
        let results = reduced(
            &fixture,
            &[
                (1, &["B\t1\nB\t9\n"]),
                (0, &["A\t1\nA\t2\nA\t3\nA\t4\n", "A\t7\n"]),
            ],
        );
        let (artifact, objects) = assemble(&fixture, results);
        assert_eq!(artifact.key, "tmp/test-run/final.alignment");
        assert_eq!(artifact.groups, 2);
        assert_eq!(artifact.size, objects.iter().map(|g| g.size).sum::<u64>());
        assert_eq!(
            fixture.store.get(BUCKET, &artifact.key, None).unwrap(),
            b"A\t1\nA\t2\nA\t3\nA\t4\nA\t7\nB\t1\nB\t9\n"
        );
        assert!(fixture.store.open_uploads().unwrap().is_empty());
    }

    #[test]
    fn test_empty_groups_are_skipped() {
        let fixture = Fixture::new();
        let results = reduced(&fixture, &[(0, &[""]), (1, &["B\t3\n"])]);
        let (artifact, _) = assemble(&fixture, results);
        assert_eq!(artifact.groups, 1);
        assert_eq!(
            fixture.store.get(BUCKET, &artifact.key, None).unwrap(),
            b"B\t3\n"
        );

        let fixture = Fixture::new();
        let (artifact, _) = assemble(&fixture, vec![]);
        assert_eq!((artifact.size, artifact.groups), (0, 0));
    }

    #[test]
    fn test_small_group_before_a_large_one() {
        let fixture = Fixture::new();
        let large = "B\t1\nB\t2\nB\t3\nB\t4\nB\t5\nB\t6\nB\t7\nB\t8\n";
        let results = reduced(&fixture, &[(0, &["A\t1\n"]), (1, &[large])]);
        let (artifact, _) = assemble(&fixture, results);
        assert_eq!(
            fixture.store.get(BUCKET, &artifact.key, None).unwrap(),
            format!("A\t1\n{large}").as_bytes()
        );
        assert!(fixture.store.open_uploads().unwrap().is_empty());
    }

    fn object(key: &str, size: u64) -> GroupObject {
        GroupObject {
            fasta_chunk: 0,
            key: key.to_string(),
            size,
        }
    }

    fn seg(key: &str, range: Option<(u64, u64)>) -> Segment {
        Segment {
            key: key.to_string(),
            range: range.map(|(a, b)| ByteRange::new(a, b)),
        }
    }

    #[test]
    fn test_plan_parts() {
        use PartPlan::{Copy, Upload};
        // large groups are copied whole
        assert_eq!(
            plan_parts(&[object("a", 20), object("b", 3)], 16, 100),
            vec![Copy(seg("a", None)), Upload(vec![seg("b", None)])]
        );
        // a small group borrows the head of the next one
        assert_eq!(
            plan_parts(&[object("a", 4), object("b", 32)], 16, 100),
            vec![
                Upload(vec![seg("a", None), seg("b", Some((0, 11)))]),
                Copy(seg("b", Some((12, 31)))),
            ]
        );
        // unless the rest would be too small to stand alone
        assert_eq!(
            plan_parts(&[object("a", 4), object("b", 20), object("c", 16)], 16, 100),
            vec![
                Upload(vec![seg("a", None), seg("b", None)]),
                Copy(seg("c", None)),
            ]
        );
        // oversized groups are split evenly
        assert_eq!(
            plan_parts(&[object("a", 250), object("e", 0)], 16, 100),
            vec![
                Copy(seg("a", Some((0, 83)))),
                Copy(seg("a", Some((84, 167)))),
                Copy(seg("a", Some((168, 249)))),
            ]
        );
    }

    #[test]
    fn test_plan_parts_respects_sizes() {
        let sizes = [0, 1, 3, 15, 16, 17, 31, 40, 99, 100, 101, 250];
        for a in sizes {
            for b in sizes {
                for c in sizes {
                    let groups = [object("a", a), object("b", b), object("c", c)];
                    let plan = plan_parts(&groups, 16, 100);
                    let len = |p: &PartPlan| -> u64 {
                        let segs = match p {
                            PartPlan::Copy(s) => std::slice::from_ref(s),
                            PartPlan::Upload(s) => s.as_slice(),
                        };
                        segs.iter()
                            .map(|s| {
                                s.range.map_or_else(
                                    || groups.iter().find(|g| g.key == s.key).unwrap().size,
                                    |r| r.len(),
                                )
                            })
                            .sum()
                    };
                    let lens: Vec<u64> = plan.iter().map(len).collect();
                    assert_eq!(lens.iter().sum::<u64>(), a + b + c);
                    if let Some((_, init)) = lens.split_last() {
                        assert!(init.iter().all(|&n| n >= 16), "{a} {b} {c}: {lens:?}");
                    }
                    assert!(plan.iter().all(|p| match p {
                        PartPlan::Copy(_) => len(p) <= 100,
                        PartPlan::Upload(_) => true,
                    }));
                }
            }
        }
    }

    #[test]
    fn test_completion_is_idempotent() {
        let fixture = Fixture::new();
        let ctx = fixture.context(minimal_params());
        let results = reduced(&fixture, &[(0, &["A\t1\n"])]);
        let stage = FinalAssembly::default();
        let defs = stage.split(&ctx, &results).unwrap();
        let first = stage.main(&ctx, defs[0].clone()).unwrap();
        assert_eq!(stage.main(&ctx, defs[0].clone()).unwrap(), first);
    }
}
