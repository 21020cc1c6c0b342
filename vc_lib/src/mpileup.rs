//! Tabular mpileup shards and their histogram side-index.
//!
//! `gempileup` writes headerless tab-delimited rows
//! `chrom pos ref depth bases quals`. A CSV shard keeps that text unchanged;
//! a Parquet shard stores the same six columns with `pos` and `depth` as
//! int64. Next to every shard sits a histogram of row counts per
//! fixed-width coordinate bucket, which the range planner reads instead of
//! scanning the shard.

use crate::parquet_file::ParquetFile;
use anyhow::{bail, Context, Result};
use parquet_derive::ParquetRecordWriter;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use vc_store::{ColumnRef, InputFormat};
use vc_types::FileFormat;

const ROW_GROUP_SIZE: usize = 1 << 20;

/// The coordinate column: second field of a CSV row, `pos` in Parquet.
pub fn coord_column() -> ColumnRef {
    ColumnRef {
        position: 2,
        name: "pos".to_string(),
    }
}

pub fn input_format(format: FileFormat) -> InputFormat {
    match format {
        FileFormat::Csv => InputFormat::TSV,
        FileFormat::Parquet => InputFormat::Parquet,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, ParquetRecordWriter)]
pub struct PileupRow {
    pub chrom: String,
    pub pos: i64,
    pub ref_base: String,
    pub depth: i64,
    pub bases: String,
    pub quals: String,
}

impl PileupRow {
    pub fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split('\t').collect();
        if !(4..=6).contains(&fields.len()) {
            bail!("mpileup row has {} fields, expected 6: '{line}'", fields.len());
        }
        let field = |i: usize| fields.get(i).copied().unwrap_or_default().to_string();
        Ok(PileupRow {
            chrom: field(0),
            pos: fields[1]
                .parse()
                .with_context(|| format!("bad coordinate in mpileup row '{line}'"))?,
            ref_base: field(2),
            depth: fields[3]
                .parse()
                .with_context(|| format!("bad depth in mpileup row '{line}'"))?,
            bases: field(4),
            quals: field(5),
        })
    }
}

const MAX_COORD_TAG: &str = "max";

/// Row counts per coordinate bucket, keyed by the bucket's inclusive upper
/// coordinate, plus the largest coordinate seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Histogram {
    pub counts: BTreeMap<u64, u64>,
    pub max_coord: Option<u64>,
}

impl Histogram {
    pub fn add(&mut self, pos: u64, stride: u64) {
        *self.counts.entry(pos.div_ceil(stride) * stride).or_default() += 1;
        self.max_coord = self.max_coord.max(Some(pos));
    }

    pub fn merge(&mut self, other: &Histogram) {
        for (&upper, &n) in &other.counts {
            *self.counts.entry(upper).or_default() += n;
        }
        self.max_coord = self.max_coord.max(other.max_coord);
    }

    /// Counts keyed by the largest coordinate each bucket can hold. This is
    /// the bucket upper bound except for the last bucket, which ends at the
    /// largest coordinate seen.
    pub fn coord_counts(&self) -> BTreeMap<u64, u64> {
        let mut counts = self.counts.clone();
        if let (Some(max), Some((&last, &n))) = (self.max_coord, self.counts.iter().next_back()) {
            if max < last {
                counts.remove(&last);
                *counts.entry(max).or_default() += n;
            }
        }
        counts
    }

    pub fn rows(&self) -> u64 {
        self.counts.values().sum()
    }

    /// `bucket_upper:row_count` lines, then `max:coord`.
    pub fn to_text(&self) -> String {
        let mut text: String = self
            .counts
            .iter()
            .map(|(upper, n)| format!("{upper}:{n}\n"))
            .collect();
        if let Some(max) = self.max_coord {
            text.push_str(&format!("{MAX_COORD_TAG}:{max}\n"));
        }
        text
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut hist = Histogram::default();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (upper, n) = line
                .split_once(':')
                .with_context(|| format!("bad histogram line '{line}'"))?;
            if upper == MAX_COORD_TAG {
                hist.max_coord = hist.max_coord.max(Some(n.parse()?));
            } else {
                *hist.counts.entry(upper.parse()?).or_default() += n.parse::<u64>()?;
            }
        }
        Ok(hist)
    }
}

/// Convert the raw pileup output at `src` into a shard at `dest` and return
/// its histogram.
pub fn convert(src: &Path, dest: &Path, format: FileFormat, stride: u64) -> Result<Histogram> {
    let reader = BufReader::new(File::open(src).with_context(|| src.display().to_string())?);
    let mut hist = Histogram::default();
    match format {
        FileFormat::Csv => {
            let mut out =
                BufWriter::new(File::create(dest).with_context(|| dest.display().to_string())?);
            for line in reader.lines() {
                let line = line?;
                if line.is_empty() {
                    continue;
                }
                let row = PileupRow::parse(&line)?;
                hist.add(row.pos.max(0) as u64, stride);
                writeln!(out, "{line}")?;
            }
            out.flush()?;
        }
        FileFormat::Parquet => {
            let mut writer = ParquetFile::new(dest).writer::<PileupRow>(ROW_GROUP_SIZE)?;
            for line in reader.lines() {
                let line = line?;
                if line.is_empty() {
                    continue;
                }
                let row = PileupRow::parse(&line)?;
                hist.add(row.pos.max(0) as u64, stride);
                writer.push(row)?;
            }
            writer.close()?;
        }
    }
    Ok(hist)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use vc_store::select::evaluate;
    use vc_store::SelectQuery;

    const PILEUP: &str = "chr1\t5\tA\t3\t...\tIII\nchr1\t100000\tC\t1\t,\tI\nchr1\t100001\tG\t2\t.,\tII\n";

    #[test]
    fn test_histogram_buckets() {
        let mut hist = Histogram::default();
        for pos in [1, 5, 100_000, 100_001, 250_000] {
            hist.add(pos, 100_000);
        }
        assert_eq!(hist.to_text(), "100000:3\n200000:1\n300000:1\nmax:250000\n");
        assert_eq!(Histogram::parse(&hist.to_text()).unwrap(), hist);
        assert_eq!(hist.rows(), 5);
        assert!(Histogram::parse("nonsense").is_err());
    }

    #[test]
    fn test_parse_row() {
        let row = PileupRow::parse("chrX\t42\tT\t0").unwrap();
        assert_eq!(row.pos, 42);
        assert_eq!(row.bases, "");
        assert!(PileupRow::parse("chrX\tx\tT\t0").is_err());
        assert!(PileupRow::parse("chrX\t42").is_err());
    }

    #[test]
    fn test_extra_columns_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("raw.mpileup");
        std::fs::write(&src, "chr1\t5\tA\t3\t...\tIII\t60,60,60\n").unwrap();
        let err = convert(&src, &dir.path().join("out.parquet"), FileFormat::Parquet, 100)
            .unwrap_err();
        assert!(format!("{err:#}").contains("7 fields"));
        assert!(convert(&src, &dir.path().join("out.csv"), FileFormat::Csv, 100).is_err());
    }

    #[test]
    fn test_last_bucket_ends_at_max_coord() {
        let mut hist = Histogram::default();
        for pos in [1, 2, 150_001] {
            hist.add(pos, 100_000);
        }
        assert_eq!(
            hist.coord_counts(),
            BTreeMap::from([(100_000, 2), (150_001, 1)])
        );
        let mut other = Histogram::default();
        other.add(180_000, 100_000);
        hist.merge(&other);
        assert_eq!(hist.max_coord, Some(180_000));
        assert_eq!(Histogram::parse(&hist.to_text()).unwrap(), hist);
        // side-indexes without a max line keep the bucket bounds
        let old = Histogram::parse("100000:2\n").unwrap();
        assert_eq!(old.coord_counts(), BTreeMap::from([(100_000, 2)]));
    }

    #[test]
    fn test_convert_csv_and_parquet() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("raw.mpileup");
        std::fs::write(&src, PILEUP).unwrap();

        let csv = dir.path().join("out.csv");
        let hist = convert(&src, &csv, FileFormat::Csv, 100_000).unwrap();
        assert_eq!(std::fs::read_to_string(&csv).unwrap(), PILEUP);
        assert_eq!(hist.to_text(), "100000:2\n200000:1\nmax:100001\n");

        let pq = dir.path().join("out.parquet");
        let hist_pq = convert(&src, &pq, FileFormat::Parquet, 100_000).unwrap();
        assert_eq!(hist_pq, hist);
        let rows: Vec<String> = evaluate(
            &pq,
            "b",
            "k",
            &SelectQuery::rows_between(coord_column(), 6, 100_001, InputFormat::Parquet),
        )
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
        assert_eq!(rows, vec!["chr1\t100000\tC\t1\t,\tI", "chr1\t100001\tG\t2\t.,\tII"]);
    }
}
