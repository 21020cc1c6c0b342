//! Fixtures shared by the stage tests: a local bucket holding a tiny
//! reference and read set, and shell stand-ins for the external tools.

use crate::context::RunContext;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use vc_store::{LocalObjectStore, Metadata, ObjectStore};
use vc_tools::names;
use vc_tools::testing::write_script;
use vc_types::PipelineParameters;

/// Two sequences; the second header follows the first bases without a newline.
pub(crate) const TINY_FA: &[u8] = b">A\nAAAAAAAAAA>B\nCCCCCCCCCCGGGGGGGGGG";

pub(crate) const BUCKET: &str = "b1";

const GZTOOL_LISTING: &str = "\
Checking index file 'r.idx' ...
\tNumber of index points   : 2
\tNumber of lines          : 32 (32)
\tList of points:
#1: @ 10 / 0 L1 ( 0 @56 ), #2: @ 12 / 300 L17 ( 120 @80 )
";

fn fake_tools() -> Vec<(&'static str, String)> {
    vec![
        (
            names::GZTOOL,
            format!(
                r#"case "$1" in
  -i) cat > /dev/null; echo index > "$4" ;;
  -ll) cat <<'EOF'
{GZTOOL_LISTING}EOF
  ;;
  -I) i=$6
      while [ "$i" -le 32 ]; do echo "line$i"; i=$((i+1)); done ;;
esac"#
            ),
        ),
        // --input chunk.fasta --threads T -o chunk; exits 1 on success
        (names::GEM_INDEXER, r#"cp "$2" "$6.gem"; exit 1"#.to_string()),
        // gem fastq1 fastq2 base source seq_type threads
        (
            names::ALIGNER,
            r#"echo "$1 $(wc -l < "$2") $5 $6" > "${4}_map.index.txt"
cat "$2" > "${4}_filt_wline_no.map""#
                .to_string(),
        ),
        (names::BINARY_REDUCER, r#"shift 2; cat "$@""#.to_string()),
        (names::FILTER_MERGED_INDEX, r#"cp "$1" "$2""#.to_string()),
        (names::INDEX_CORRECTION, r#"cat "$2""#.to_string()),
        // one row per base, positions restart at every header
        (
            names::PILEUP,
            r#"awk -v OFS='\t' '/^>/ { chrom = substr($1, 2); pos = 0; next }
{ for (i = 1; i <= length($0); i++) { pos++; print chrom, pos, substr($0, i, 1), 1, ".", "I" } }' "$2""#
                .to_string(),
        ),
        (names::MPILEUP_MERGE, r#"sort -k2,2n "$1""#.to_string()),
    ]
}

pub(crate) fn gz_reads(lines: u64) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    for i in 1..=lines {
        writeln!(enc, "line{i}").unwrap();
    }
    enc.finish().unwrap()
}

pub(crate) fn minimal_params() -> PipelineParameters {
    toml::from_str(
        r#"
        run_id = "test-run"
        bucket = "b1"
        fasta_path = "b1/f/tiny.fa"
        fastq_path = "b1/reads/r.fastq.gz"
        fasta_chunks = 2
        fastq_chunks = 2
        gem_mapper_threads = 2

        [tunables]
        stage_retries = 0
        max_workers = 4
        "#,
    )
    .unwrap()
}

pub(crate) struct Fixture {
    pub dir: TempDir,
    pub store: Arc<LocalObjectStore>,
    pub tools_dir: PathBuf,
}

/// Smallest non-last multipart part in the fixture store.
pub const MIN_PART_SIZE: u64 = 16;

impl Fixture {
    /// A bucket with `tiny.fa` and a 32-line read file, and every fake tool
    /// installed. Each tool appends its name to `calls.log` when run.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let tools_dir = dir.path().join("tools");
        std::fs::create_dir_all(&tools_dir).unwrap();
        let store = Arc::new(
            LocalObjectStore::new(dir.path().join("store"))
                .unwrap()
                .with_min_part_size(MIN_PART_SIZE),
        );
        let fixture = Fixture {
            dir,
            store,
            tools_dir,
        };
        for (name, body) in fake_tools() {
            fixture.install_tool(name, &body);
        }
        fixture.put("f/tiny.fa", TINY_FA);
        fixture.put("reads/r.fastq.gz", &gz_reads(32));
        fixture
    }

    pub fn put(&self, key: &str, body: &[u8]) {
        self.store.put(BUCKET, key, body, &Metadata::new()).unwrap();
    }

    /// Install (or replace) a fake tool.
    pub fn install_tool(&self, name: &str, body: &str) {
        let log = self.tools_dir.join("calls.log");
        let body = format!("echo {name} >> '{}'\n{body}", log.display());
        write_script(&self.tools_dir, name, &body).unwrap();
    }

    /// How many times `name` ran.
    pub fn calls(&self, name: &str) -> usize {
        std::fs::read_to_string(self.tools_dir.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .filter(|l| *l == name)
            .count()
    }

    pub fn context(&self, mut params: PipelineParameters) -> RunContext {
        params.tunables.tools_dir = Some(self.tools_dir.clone());
        params.tunables.cache_dir = self.dir.path().join("cache");
        let store: Arc<dyn ObjectStore> = self.store.clone();
        RunContext::new(params, store).unwrap()
    }
}
