//! Line-range partitioning of a gzipped FASTQ through a gztool index.
//!
//! The index is a pair of objects next to the read file's bucket root:
//! `fastqgz_idx/{key}.idx`, the gztool binary index, and
//! `fastqgz_idx/{key}.tab`, a table of its access windows with the total line
//! count in the object metadata. A chunk is a range of whole reads; fetching
//! it decompresses only the compressed bytes between the two access windows
//! bracketing the range.

use crate::fastq::split_even;
use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use vc_store::{ByteRange, Metadata, ObjectStore};
use vc_tools::{names, ToolPaths};
use vc_types::keys::{fastq_index_key, fastq_key, fastq_table_key};
use vc_types::{FastqChunk, FastqChunkSource, GzipWindowRange, ObjectPath, PipelineError};

const TOTAL_LINES_META: &str = "total_lines";

/// One gztool access window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessWindow {
    pub window: u64,
    pub compressed_byte: u64,
    pub uncompressed_byte: u64,
    pub line_number: u64,
    pub window_size: u64,
    pub window_offset: u64,
}

/// A loaded gzip index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GzipIndex {
    pub fastq: ObjectPath,
    pub index_key: String,
    pub table_key: String,
    pub total_lines: u64,
    /// Size of the compressed FASTQ object.
    pub file_size: u64,
    /// Sorted by line number.
    pub windows: Vec<AccessWindow>,
}

/// Parse the output of `gztool -ll`.
pub fn parse_window_listing(listing: &str) -> Result<(Vec<AccessWindow>, u64)> {
    let point = Regex::new(
        r"#(\d+):\s*@\s*(\d+)\s*/\s*(\d+)\s+L(\d+)\s*\(\s*(\d+)\s*@\s*(\d+)\s*\)",
    )?;
    let lines = Regex::new(r"Number of lines\s*:\s*(\d+)")?;

    let total_lines = lines
        .captures(listing)
        .ok_or_else(|| anyhow!("gztool listing has no line count"))?[1]
        .parse()?;
    let mut windows = point
        .captures_iter(listing)
        .map(|c| -> Result<AccessWindow> {
            Ok(AccessWindow {
                window: c[1].parse()?,
                compressed_byte: c[2].parse()?,
                uncompressed_byte: c[3].parse()?,
                line_number: c[4].parse()?,
                window_size: c[5].parse()?,
                window_offset: c[6].parse()?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    windows.sort_by_key(|w| (w.line_number, w.window));
    Ok((windows, total_lines))
}

fn table_bytes(windows: &[AccessWindow]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for w in windows {
        writer.serialize(w)?;
    }
    Ok(writer.into_inner()?)
}

fn parse_table(body: &[u8]) -> Result<Vec<AccessWindow>> {
    let mut windows = csv::Reader::from_reader(body)
        .deserialize()
        .collect::<Result<Vec<AccessWindow>, _>>()?;
    windows.sort_by_key(|w| (w.line_number, w.window));
    Ok(windows)
}

/// Load a previously built index.
pub fn load_index(store: &dyn ObjectStore, fastq: &ObjectPath) -> Result<GzipIndex> {
    let key = fastq_key(fastq);
    let (index_key, table_key) = (fastq_index_key(&key), fastq_table_key(&key));
    let table_meta = store
        .head(&fastq.bucket, &table_key)?
        .ok_or_else(|| anyhow!("gzip index table {}/{table_key} is missing", fastq.bucket))?;
    let total_lines = table_meta
        .metadata
        .get(TOTAL_LINES_META)
        .ok_or_else(|| anyhow!("{}/{table_key} has no {TOTAL_LINES_META}", fastq.bucket))?
        .parse()
        .with_context(|| format!("{}/{table_key}", fastq.bucket))?;
    let windows = parse_table(&store.get(&fastq.bucket, &table_key, None)?)
        .with_context(|| format!("parsing {}/{table_key}", fastq.bucket))?;
    let file_size = store
        .head(&fastq.bucket, &fastq.key)?
        .ok_or_else(|| anyhow!("{fastq} does not exist"))?
        .size;
    Ok(GzipIndex {
        fastq: fastq.clone(),
        index_key,
        table_key,
        total_lines,
        file_size,
        windows,
    })
}

/// Return the index of `fastq`, building and uploading it first when either
/// half is missing.
pub fn ensure_index(
    store: &dyn ObjectStore,
    tools: &ToolPaths,
    fastq: &ObjectPath,
) -> Result<GzipIndex> {
    let key = fastq_key(fastq);
    let (index_key, table_key) = (fastq_index_key(&key), fastq_table_key(&key));
    if store.exists(&fastq.bucket, &index_key)? && store.exists(&fastq.bucket, &table_key)? {
        debug!("reusing gzip index {}/{index_key}", fastq.bucket);
        return load_index(store, fastq);
    }

    info!("building gzip index for {fastq}");
    let dir = tempfile::tempdir()?;
    let idx_path = dir.path().join(format!("{key}.idx"));

    let body = store.get_stream(&fastq.bucket, &fastq.key, None)?;
    let mut proc = tools
        .command(names::GZTOOL)
        .arg("-i")
        .arg("-x")
        .arg("-I")
        .arg(&idx_path)
        .spawn_piped()?;
    let feeder = feed(body, &mut proc)?;
    proc.wait()
        .with_context(|| format!("indexing {fastq}"))?;
    feeder
        .join()
        .map_err(|_| anyhow!("stream feeding gztool panicked"))?
        .with_context(|| format!("streaming {fastq} into gztool"))?;

    let listing = tools
        .command(names::GZTOOL)
        .arg("-ll")
        .arg(&idx_path)
        .run()?
        .stdout_str();
    let (windows, total_lines) = parse_window_listing(&listing)?;

    store.put_file(&fastq.bucket, &index_key, &idx_path, &Metadata::new())?;
    let mut meta = Metadata::new();
    meta.insert(TOTAL_LINES_META.to_string(), total_lines.to_string());
    store.put(&fastq.bucket, &table_key, &table_bytes(&windows)?, &meta)?;
    info!(
        "indexed {fastq}: {total_lines} lines, {} access windows",
        windows.len()
    );
    load_index(store, fastq)
}

/// Pump `body` into the tool's stdin on a helper thread. A broken pipe is
/// expected when the tool stops reading early.
fn feed(
    mut body: Box<dyn io::Read + Send>,
    proc: &mut vc_tools::ToolProcess,
) -> Result<thread::JoinHandle<io::Result<()>>> {
    let mut stdin = proc
        .take_stdin()
        .ok_or_else(|| anyhow!("tool stdin is not piped"))?;
    Ok(thread::spawn(move || match io::copy(&mut body, &mut stdin) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        Err(e) => Err(e),
    }))
}

/// Wait for a feeder whose reader may have stopped early. The line count
/// already decides the outcome, so failures here are only logged.
fn reap_feeder(feeder: thread::JoinHandle<io::Result<()>>, fastq: &ObjectPath) {
    match feeder.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("streaming {fastq} into gztool: {e}"),
        Err(_) => warn!("thread streaming {fastq} into gztool panicked"),
    }
}

/// Line ranges `[line_0, line_1)` (1-based) of the chunks.
pub fn plan_line_ranges(total_lines: u64, fastq_chunks: usize) -> Vec<(u64, u64)> {
    split_even(total_lines / 4, fastq_chunks)
        .into_iter()
        .map(|(r0, r1)| (1 + 4 * r0, 1 + 4 * r1))
        .collect()
}

/// Compressed byte offsets of the access windows bracketing `[line_0, line_1)`.
pub fn window_range(windows: &[AccessWindow], line_0: u64, line_1: u64, file_size: u64) -> (u64, u64) {
    let range_0 = windows
        .iter()
        .filter(|w| w.line_number <= line_0)
        .last()
        .or_else(|| windows.first())
        .map_or(0, |w| w.compressed_byte);
    let range_1 = windows
        .iter()
        .find(|w| w.line_number >= line_1)
        .map_or(file_size, |w| w.compressed_byte);
    (range_0, range_1)
}

fn window_for(index: &GzipIndex, line_0: u64, line_1: u64) -> GzipWindowRange {
    let (range_0, range_1) = window_range(&index.windows, line_0, line_1, index.file_size);
    GzipWindowRange {
        fastq: index.fastq.clone(),
        index_key: index.index_key.clone(),
        range_0,
        range_1,
    }
}

/// Cut the read file (and its mate) into at most `fastq_chunks` chunks.
pub fn plan_chunks(
    mate1: &GzipIndex,
    mate2: Option<&GzipIndex>,
    fastq_chunks: usize,
) -> Result<Vec<FastqChunk>> {
    if let Some(m2) = mate2 {
        if m2.total_lines != mate1.total_lines {
            bail!(PipelineError::config(format!(
                "mates have different line counts: {} has {}, {} has {}",
                mate1.fastq, mate1.total_lines, m2.fastq, m2.total_lines
            )));
        }
    }
    if mate1.total_lines % 4 != 0 {
        bail!(PipelineError::PartitionFailed {
            chunk_id: 0,
            reason: format!(
                "{} has {} lines, not a whole number of reads",
                mate1.fastq, mate1.total_lines
            ),
        });
    }
    Ok(plan_line_ranges(mate1.total_lines, fastq_chunks)
        .into_iter()
        .enumerate()
        .map(|(chunk_id, (line_0, line_1))| FastqChunk {
            chunk_id,
            source: FastqChunkSource::Gzip {
                line_0,
                line_1,
                mate1: window_for(mate1, line_0, line_1),
                mate2: mate2.map(|m| window_for(m, line_0, line_1)),
            },
        })
        .collect())
}

/// Decompress lines `[line_0, line_1)` of one mate into `out`.
pub fn fetch_lines(
    store: &dyn ObjectStore,
    tools: &ToolPaths,
    chunk_id: usize,
    window: &GzipWindowRange,
    line_0: u64,
    line_1: u64,
    out: &Path,
) -> Result<PathBuf> {
    let fastq = &window.fastq;
    let idx_path = out.with_extension("idx");
    store.get_to_file(&fastq.bucket, &window.index_key, None, &idx_path)?;

    let range = ByteRange::new(
        window.range_0.saturating_sub(1),
        window.range_1.saturating_sub(1),
    );
    let body = store.get_stream(&fastq.bucket, &fastq.key, Some(range))?;
    let mut proc = tools
        .command(names::GZTOOL)
        .arg("-I")
        .arg(&idx_path)
        .arg("-n")
        .arg(window.range_0.to_string())
        .arg("-L")
        .arg(line_0.to_string())
        .spawn_piped()?;
    let feeder = feed(body, &mut proc)?;
    let stdout = proc
        .take_stdout()
        .ok_or_else(|| anyhow!("gztool stdout is not piped"))?;

    let wanted = line_1 - line_0;
    let mut reader = BufReader::new(stdout);
    let mut writer =
        BufWriter::new(File::create(out).with_context(|| out.display().to_string())?);
    let mut line = Vec::new();
    let mut written = 0;
    while written < wanted {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        writer.write_all(&line)?;
        if !line.ends_with(b"\n") {
            writer.write_all(b"\n")?;
        }
        written += 1;
    }
    writer.flush()?;
    drop(reader);

    let result = if written == wanted {
        proc.kill();
        Ok(out.to_path_buf())
    } else {
        let reason = match proc.wait() {
            Err(e) => format!("gztool stopped after {written} of {wanted} lines: {e}"),
            Ok(_) => format!("{fastq} ended after {written} of {wanted} lines"),
        };
        Err(PipelineError::PartitionFailed { chunk_id, reason }.into())
    };
    reap_feeder(feeder, fastq);
    debug!("fetched lines [{line_0}, {line_1}) of {fastq} into {}", out.display());
    result
}
