//! Cut the coordinate axis of every fasta group into reducer ranges of at
//! most `max_rows_per_reducer` mpileup rows.

use crate::context::RunContext;
use crate::mpileup::{self, Histogram};
use crate::plan::Plan;
use crate::stage::PipelineStage;
use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use vc_store::SelectQuery;
use vc_types::RangePlanning;

const MPILEUP_MARKER: &str = ".mpileup.";
const HISTOGRAM_SUFFIX: &str = "_histogram.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupShards {
    pub fasta_chunk: usize,
    pub keys: Vec<String>,
}

/// The reducer ranges of one fasta group: `[1, ends[0]]`,
/// `[ends[0]+1, ends[1]]`, and so on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRanges {
    pub fasta_chunk: usize,
    pub keys: Vec<String>,
    pub ends: Vec<u64>,
}

impl GroupRanges {
    /// Inclusive `(start, end)` coordinate pairs.
    pub fn ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        let starts = std::iter::once(1).chain(self.ends.iter().map(|e| e + 1));
        starts.zip(self.ends.iter().copied())
    }
}

fn histogram_key(mpileup_key: &str) -> Option<String> {
    let (stem, _) = mpileup_key.rsplit_once(MPILEUP_MARKER)?;
    Some(format!("{stem}{HISTOGRAM_SUFFIX}"))
}

/// Sweep the counts in coordinate order, closing a range before the count
/// that would push it past `max_rows`. A single coordinate above the limit
/// gets a range of its own. The last range ends at the last coordinate.
pub fn sweep(counts: &BTreeMap<u64, u64>, max_rows: u64) -> Vec<u64> {
    let mut ends = Vec::new();
    let mut running = 0;
    let mut last = 0;
    for (&coord, &n) in counts {
        if running > 0 && running + n > max_rows {
            ends.push(last);
            running = 0;
        }
        running += n;
        last = coord;
    }
    if running > 0 {
        ends.push(last);
    }
    ends
}

fn exact_counts(ctx: &RunContext, keys: &[String]) -> Result<BTreeMap<u64, u64>> {
    let query = SelectQuery::column(
        mpileup::coord_column(),
        mpileup::input_format(ctx.params.file_format),
    );
    let mut counts = BTreeMap::new();
    for key in keys {
        for record in ctx.store().select(ctx.bucket(), key, &query)? {
            let record = record?;
            let coord: u64 = record
                .trim()
                .parse()
                .with_context(|| format!("bad coordinate '{record}' in {key}"))?;
            *counts.entry(coord).or_default() += 1;
        }
    }
    Ok(counts)
}

fn histogram_counts(ctx: &RunContext, keys: &[String]) -> Result<BTreeMap<u64, u64>> {
    let mut total = Histogram::default();
    for key in keys {
        let hist_key = histogram_key(key).with_context(|| format!("{key} is not an mpileup"))?;
        let body = ctx.store().get(ctx.bucket(), &hist_key, None)?;
        let hist = Histogram::parse(&String::from_utf8_lossy(&body))
            .with_context(|| format!("parsing {hist_key}"))?;
        total.merge(&hist);
    }
    Ok(total.coord_counts())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RangePartition;

impl PipelineStage for RangePartition {
    const NAME: &'static str = "range_partition";
    type StageInputs = Plan;
    type StageOutputs = Vec<GroupRanges>;
    type ChunkInputs = GroupShards;
    type ChunkOutputs = GroupRanges;

    fn split(&self, ctx: &RunContext, plan: &Plan) -> Result<Vec<GroupShards>> {
        plan.fasta_chunks
            .iter()
            .map(|fa| {
                let keys = ctx
                    .store()
                    .list(ctx.bucket(), &ctx.keys.mpileup_group_prefix(fa.chunk_id))?
                    .into_iter()
                    .filter(|k| k.contains(MPILEUP_MARKER))
                    .collect();
                Ok(GroupShards {
                    fasta_chunk: fa.chunk_id,
                    keys,
                })
            })
            .collect()
    }

    fn main(&self, ctx: &RunContext, group: GroupShards) -> Result<GroupRanges> {
        let tunables = &ctx.params.tunables;
        let counts = match tunables.range_planning {
            RangePlanning::Histogram => histogram_counts(ctx, &group.keys)?,
            RangePlanning::Select => exact_counts(ctx, &group.keys)?,
        };
        let ends = sweep(&counts, tunables.max_rows_per_reducer);
        debug!(
            "fa{}: {} rows in {} ranges",
            group.fasta_chunk,
            counts.values().sum::<u64>(),
            ends.len()
        );
        Ok(GroupRanges {
            fasta_chunk: group.fasta_chunk,
            keys: group.keys,
            ends,
        })
    }

    fn join(
        &self,
        _ctx: &RunContext,
        _plan: Plan,
        _chunk_defs: Vec<GroupShards>,
        groups: Vec<GroupRanges>,
    ) -> Result<Vec<GroupRanges>> {
        info!(
            "{} reducer ranges over {} fasta groups",
            groups.iter().map(|g| g.ends.len()).sum::<usize>(),
            groups.len()
        );
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{minimal_params, Fixture, BUCKET};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use vc_store::{Metadata, ObjectStore};

    #[test]
    fn test_sweep_three_ranges() {
        // 45M rows in 450 buckets of 100k
        let counts: BTreeMap<u64, u64> = (1..=450).map(|b| (b * 100_000, 100_000)).collect();
        let ends = sweep(&counts, 20_000_000);
        assert_eq!(ends, vec![20_000_000, 40_000_000, 45_000_000]);
    }

    #[test]
    fn test_sweep_edges() {
        assert!(sweep(&BTreeMap::new(), 10).is_empty());
        // a single oversized coordinate is not split
        let counts = BTreeMap::from([(5, 3), (7, 30), (9, 1)]);
        assert_eq!(sweep(&counts, 10), vec![5, 7, 9]);
        assert_eq!(sweep(&counts, 100), vec![9]);
    }

    #[test]
    fn test_ranges() {
        let group = GroupRanges {
            fasta_chunk: 0,
            keys: vec![],
            ends: vec![10, 25, 40],
        };
        assert_eq!(
            group.ranges().collect::<Vec<_>>(),
            vec![(1, 10), (11, 25), (26, 40)]
        );
    }

    #[test]
    fn test_histogram_key() {
        assert_eq!(
            histogram_key("tmp/r/filtered_index_to_mpileup/fa0-fq1/s_fa0-fq1.mpileup.csv").unwrap(),
            "tmp/r/filtered_index_to_mpileup/fa0-fq1/s_fa0-fq1_histogram.txt"
        );
        assert_eq!(histogram_key("x_histogram.txt"), None);
    }

    fn put_group(fixture: &Fixture) {
        let put = |key: &str, body: &str| {
            fixture
                .store
                .put(BUCKET, key, body.as_bytes(), &Metadata::new())
                .unwrap()
        };
        let prefix = "tmp/test-run/filtered_index_to_mpileup";
        put(
            &format!("{prefix}/fa1-fq0/r_fa1-fq0.mpileup.csv"),
            "B\t1\tC\t1\t.\tI\nB\t2\tC\t1\t.\tI\nB\t150000\tG\t1\t.\tI\n",
        );
        put(
            &format!("{prefix}/fa1-fq0/r_fa1-fq0_histogram.txt"),
            "100000:2\n200000:1\nmax:150000\n",
        );
        put(
            &format!("{prefix}/fa1-fq1/r_fa1-fq1.mpileup.csv"),
            "B\t2\tC\t1\t.\tI\nB\t150001\tG\t1\t.\tI\n",
        );
        put(
            &format!("{prefix}/fa1-fq1/r_fa1-fq1_histogram.txt"),
            "100000:1\n200000:1\nmax:150001\n",
        );
        // another group sharing the digit prefix
        put(&format!("{prefix}/fa10-fq0/r_fa10-fq0.mpileup.csv"), "Z\t1\tA\t1\t.\tI\n");
    }

    fn group(ctx: &RunContext) -> GroupShards {
        let plan = Plan {
            tasks: vec![],
            fasta_chunks: vec![vc_types::FastaChunk {
                chunk_id: 1,
                offset_head: 13,
                offset_base: 16,
                last_byte: 35,
            }],
            fastq_chunks: vec![],
        };
        let mut groups = RangePartition.split(ctx, &plan).unwrap();
        assert_eq!(groups.len(), 1);
        groups.remove(0)
    }

    #[test]
    fn test_histogram_planning() {
        let fixture = Fixture::new();
        put_group(&fixture);
        let mut params = minimal_params();
        params.tunables.max_rows_per_reducer = 3;
        let ctx = fixture.context(params);
        let shards = group(&ctx);
        assert_eq!(shards.keys.len(), 2);
        let ranges = RangePartition.main(&ctx, shards).unwrap();
        // the last range ends at the largest coordinate, not the bucket bound
        assert_eq!(ranges.ends, vec![100_000, 150_001]);
    }

    #[test]
    fn test_single_range_ends_at_max_coord() {
        let mut hist = Histogram::default();
        for pos in [1, 2, 150_001] {
            hist.add(pos, 100_000);
        }
        assert_eq!(sweep(&hist.coord_counts(), 20_000_000), vec![150_001]);
    }

    #[test]
    fn test_select_planning() {
        let fixture = Fixture::new();
        put_group(&fixture);
        let mut params = minimal_params();
        params.tunables.max_rows_per_reducer = 3;
        params.tunables.range_planning = RangePlanning::Select;
        let ctx = fixture.context(params);
        let ranges = RangePartition.main(&ctx, group(&ctx)).unwrap();
        // counts: 1 -> 1, 2 -> 2, 150000 -> 1, 150001 -> 1
        assert_eq!(ranges.ends, vec![2, 150_001]);
    }

    proptest! {
        #[test]
        fn prop_ranges_cover_all_rows(
            counts in proptest::collection::btree_map(1u64..10_000, 1u64..50, 0..200),
            max_rows in 1u64..200,
        ) {
            let ends = sweep(&counts, max_rows);
            let group = GroupRanges { fasta_chunk: 0, keys: vec![], ends: ends.clone() };
            let ranges: Vec<(u64, u64)> = group.ranges().collect();
            prop_assert_eq!(ends.last().copied(), counts.keys().last().copied());
            let mut covered = 0;
            for (start, end) in ranges {
                prop_assert!(start <= end);
                let rows: u64 = counts.range(start..=end).map(|(_, n)| n).sum();
                let single = counts.range(start..=end).count() == 1;
                prop_assert!(rows <= max_rows || single);
                covered += rows;
            }
            prop_assert_eq!(covered, counts.values().sum::<u64>());
        }
    }
}
