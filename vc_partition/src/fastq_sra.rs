//! Read-number partitioning of an SRA accession.

use crate::fastq::{split_even, FetchedReads};
use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use regex::Regex;
use std::path::Path;
use std::time::Duration;
use vc_tools::{names, ToolPaths};
use vc_types::{FastqChunk, FastqChunkSource, PipelineError};

const EUTILS_EFETCH: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/efetch.fcgi";

/// Source of the number of spots (reads) in an accession.
pub trait SpotCounter {
    fn total_spots(&self, accession: &str) -> Result<u64>;
}

/// Queries the NCBI E-utilities run metadata.
pub struct EutilsSpotCounter {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl EutilsSpotCounter {
    pub fn new() -> Result<Self> {
        Self::with_base_url(EUTILS_EFETCH)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("building the E-utilities HTTP client")?;
        Ok(EutilsSpotCounter {
            client,
            base_url: base_url.to_string(),
        })
    }
}

impl SpotCounter for EutilsSpotCounter {
    fn total_spots(&self, accession: &str) -> Result<u64> {
        debug!("querying spot count of {accession}");
        let body = self
            .client
            .get(&self.base_url)
            .query(&[("db", "sra"), ("id", accession), ("retmode", "xml")])
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .with_context(|| format!("fetching run metadata of {accession}"))?
            .text()?;
        parse_total_spots(&body)
            .ok_or_else(|| anyhow!("no total_spots in the run metadata of {accession}"))
    }
}

/// Sum of the `total_spots` attributes of the runs in an efetch document.
pub fn parse_total_spots(xml: &str) -> Option<u64> {
    let re = Regex::new(r#"total_spots="(\d+)""#).ok()?;
    let mut found = false;
    let mut total = 0u64;
    for caps in re.captures_iter(xml) {
        total += caps[1].parse::<u64>().ok()?;
        found = true;
    }
    found.then_some(total)
}

/// Cut `accession` into at most `fastq_chunks` chunks of consecutive spots.
pub fn plan_chunks(accession: &str, total_spots: u64, fastq_chunks: usize) -> Vec<FastqChunk> {
    split_even(total_spots, fastq_chunks)
        .into_iter()
        .enumerate()
        .map(|(chunk_id, (start, end))| FastqChunk {
            chunk_id,
            source: FastqChunkSource::Sra {
                accession: accession.to_string(),
                read_0: start + 1,
                read_1: end,
            },
        })
        .collect()
}

/// Dump spots `[read_0, read_1]` of `accession` into `dir`.
pub fn fetch_reads(
    tools: &ToolPaths,
    chunk_id: usize,
    accession: &str,
    read_0: u64,
    read_1: u64,
    dir: &Path,
) -> Result<FetchedReads> {
    let out_dir = dir.join(format!("sra_chunk{chunk_id}"));
    std::fs::create_dir_all(&out_dir).with_context(|| out_dir.display().to_string())?;
    tools
        .command(names::FASTQ_DUMP)
        .arg("--split-files")
        .arg(accession)
        .arg("-N")
        .arg(read_0.to_string())
        .arg("-X")
        .arg(read_1.to_string())
        .arg("-O")
        .arg(&out_dir)
        .run()
        .map_err(|e| PipelineError::PartitionFailed {
            chunk_id,
            reason: format!("{e}"),
        })?;

    let split = out_dir.join(format!("{accession}_1.fastq"));
    let single = out_dir.join(format!("{accession}.fastq"));
    let mate1 = if split.exists() {
        split
    } else if single.exists() {
        single
    } else {
        return Err(PipelineError::PartitionFailed {
            chunk_id,
            reason: format!("fastq-dump wrote no reads for {accession} into {}", out_dir.display()),
        }
        .into());
    };
    let mate2 = Some(out_dir.join(format!("{accession}_2.fastq"))).filter(|p| p.exists());
    info!(
        "dumped spots {read_0}..={read_1} of {accession} ({})",
        if mate2.is_some() { "paired" } else { "single" }
    );
    Ok(FetchedReads { mate1, mate2 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use vc_tools::testing::write_script;

    struct FixedSpots(u64);

    impl SpotCounter for FixedSpots {
        fn total_spots(&self, _accession: &str) -> Result<u64> {
            Ok(self.0)
        }
    }

    fn read_ranges(chunks: &[FastqChunk]) -> Vec<(u64, u64)> {
        chunks
            .iter()
            .map(|c| match &c.source {
                FastqChunkSource::Sra { read_0, read_1, .. } => (*read_0, *read_1),
                FastqChunkSource::Gzip { .. } => unreachable!(),
            })
            .collect()
    }

    #[test]
    fn test_plan_chunks() {
        let counter = FixedSpots(10);
        let chunks = plan_chunks("SRR1", counter.total_spots("SRR1").unwrap(), 3);
        assert_eq!(read_ranges(&chunks), vec![(1, 4), (5, 8), (9, 10)]);
        assert_eq!(chunks.iter().map(FastqChunk::num_reads).sum::<u64>(), 10);
        assert_eq!(chunks[2].chunk_id, 2);

        assert_eq!(read_ranges(&plan_chunks("SRR1", 2, 4)), vec![(1, 1), (2, 2)]);
        assert!(plan_chunks("SRR1", 0, 4).is_empty());
    }

    #[test]
    fn test_parse_total_spots() {
        let xml = r#"<EXPERIMENT_PACKAGE_SET><RUN_SET runs="2" bases="1" spots="3">
            <RUN accession="SRR6052133" total_spots="1200" total_bases="240000"/>
            <RUN accession="SRR6052134" total_spots="34" total_bases="100"/>
            </RUN_SET></EXPERIMENT_PACKAGE_SET>"#;
        assert_eq!(parse_total_spots(xml), Some(1234));
        assert_eq!(parse_total_spots("<ERROR>not found</ERROR>"), None);
    }

    #[test]
    fn test_fetch_reads() {
        let tools_dir = tempfile::tempdir().unwrap();
        // --split-files ACC -N r0 -X r1 -O dir
        write_script(
            tools_dir.path(),
            "fastq-dump",
            r#"echo "@$2.$4" > "$8/$2_1.fastq"; echo "@$2.$6" > "$8/$2_2.fastq""#,
        )
        .unwrap();
        let tools = ToolPaths::new(Some(tools_dir.path().to_path_buf()));
        let work = tempfile::tempdir().unwrap();
        let reads = fetch_reads(&tools, 1, "SRR9", 5, 8, work.path()).unwrap();
        assert_eq!(std::fs::read_to_string(&reads.mate1).unwrap(), "@SRR9.5\n");
        let mate2 = reads.mate2.unwrap();
        assert_eq!(std::fs::read_to_string(mate2).unwrap(), "@SRR9.8\n");
    }

    #[test]
    fn test_fetch_reads_single_end_and_failure() {
        let tools_dir = tempfile::tempdir().unwrap();
        write_script(tools_dir.path(), "fastq-dump", r#"echo "@r" > "$8/$2.fastq""#).unwrap();
        let tools = ToolPaths::new(Some(tools_dir.path().to_path_buf()));
        let work = tempfile::tempdir().unwrap();
        let reads = fetch_reads(&tools, 0, "SRR9", 1, 4, work.path()).unwrap();
        assert!(reads.mate1.ends_with("SRR9.fastq"));
        assert_eq!(reads.mate2, None);

        write_script(tools_dir.path(), "fastq-dump", "echo 'no such run' >&2; exit 3").unwrap();
        let err = fetch_reads(&tools, 2, "SRR9", 1, 4, work.path()).unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::PartitionFailed { chunk_id, reason }) => {
                assert_eq!(*chunk_id, 2);
                assert!(reason.contains("no such run"), "{reason}");
            }
            _ => panic!("unexpected error {err:#}"),
        }
    }
}
