//! FASTA index built remotely with a map/reduce over byte spans.
//!
//! Each mapper scans one span of the FASTA object and summarizes what it saw
//! in a [`SpanSummary`]: the tail of a line started in an earlier span, the
//! bases before its first header, and every header starting inside it. A
//! header can be split at a span boundary, so [`stitch`] walks the summaries
//! in order, completing the open record from the next span's leading
//! fragment.

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use vc_store::{ByteRange, Metadata, ObjectStore};
use vc_tools::compress::{compress_bytes, decompress_bytes};
use vc_types::keys::{faidx_key, fasta_key};
use vc_types::{FaidxRecord, ObjectPath, PipelineError};

const NUM_SEQUENCES_META: &str = "num_sequences";

/// Half-open byte span `[start, end)` scanned by one mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteSpan {
    pub start: u64,
    pub end: u64,
}

/// A header line starting inside a span.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderObs {
    pub offset_head: u64,
    /// Leading name token, possibly cut at the end of the span.
    pub name: String,
    /// Whitespace or a newline followed the name inside the span.
    pub name_terminated: bool,
    /// Set when the header line ends inside the span.
    pub offset_base: Option<u64>,
    /// Bases after the header line up to the next header or the span end.
    pub bases: u64,
}

/// What one mapper observed in its span.
///
/// A span that does not start right after a newline may start inside a
/// header line or inside a base region, and the mapper cannot tell which. It
/// therefore describes its leading fragment (up to and including the first
/// newline) both ways; after that newline the scan is unambiguous.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanSummary {
    pub start: u64,
    pub leading_len: u64,
    pub leading_has_newline: bool,
    /// The fragment read as the rest of a header line.
    pub leading_name: String,
    pub leading_name_terminated: bool,
    /// The fragment read as bases: the bases before any `>`, and the header
    /// that `>` starts.
    pub leading_bases: u64,
    pub leading_header: Option<HeaderObs>,
    pub bases_before_first_header: u64,
    pub headers: Vec<HeaderObs>,
}

fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n')
}

fn count_bases(bytes: &[u8]) -> u64 {
    bytes.iter().filter(|&&b| b != b'\n' && b != b'\r').count() as u64
}

fn name_token(bytes: &[u8]) -> (String, bool) {
    let end = bytes.iter().position(|&b| is_space(b));
    let name = &bytes[..end.unwrap_or(bytes.len())];
    (String::from_utf8_lossy(name).into_owned(), end.is_some())
}

/// Cut `[0, size)` into `n` spans of `max(1, size/n)` bytes; the last span
/// runs to the end of the object.
pub fn spans(size: u64, n: usize) -> Vec<ByteSpan> {
    if size == 0 || n == 0 {
        return Vec::new();
    }
    let stride = (size / n as u64).max(1);
    let mut spans: Vec<ByteSpan> = (0..n as u64)
        .map(|i| i * stride)
        .take_while(|&start| start < size)
        .map(|start| ByteSpan {
            start,
            end: (start + stride).min(size),
        })
        .collect();
    if let Some(last) = spans.last_mut() {
        last.end = size;
    }
    spans
}

/// Scan `bytes` (at absolute `offset`) starting inside a base region. A `>`
/// anywhere in a base region starts a header, which runs to the next newline.
fn scan_bases(bytes: &[u8], offset: u64) -> (u64, Vec<HeaderObs>) {
    let mut headers: Vec<HeaderObs> = Vec::new();
    let mut bases_before_first_header = 0;
    let mut pos = 0;
    while pos < bytes.len() {
        let gt = bytes[pos..].iter().position(|&b| b == b'>').map(|i| pos + i);
        let bases = count_bases(&bytes[pos..gt.unwrap_or(bytes.len())]);
        match headers.last_mut() {
            Some(header) => header.bases += bases,
            None => bases_before_first_header += bases,
        }
        let Some(head) = gt else { break };
        let newline = bytes[head..].iter().position(|&b| b == b'\n').map(|i| head + i);
        let (name, name_terminated) = name_token(&bytes[head + 1..]);
        headers.push(HeaderObs {
            offset_head: offset + head as u64,
            name,
            name_terminated,
            offset_base: newline.map(|nl| offset + nl as u64 + 1),
            bases: 0,
        });
        pos = newline.map_or(bytes.len(), |nl| nl + 1);
    }
    (bases_before_first_header, headers)
}

/// Summarize `bytes`, found at absolute offset `offset` of the file.
/// `after_newline` is true when the span starts the file or follows a newline.
pub fn scan_span(bytes: &[u8], offset: u64, after_newline: bool) -> SpanSummary {
    let mut summary = SpanSummary {
        start: offset,
        ..SpanSummary::default()
    };
    let mut pos = 0;
    if !after_newline {
        let newline = bytes.iter().position(|&b| b == b'\n');
        let fragment = &bytes[..newline.map_or(bytes.len(), |e| e + 1)];
        let (name, terminated) = name_token(fragment);
        let (bases, mut headers) = scan_bases(fragment, offset);
        summary.leading_len = fragment.len() as u64;
        summary.leading_has_newline = newline.is_some();
        summary.leading_name = name;
        summary.leading_name_terminated = terminated;
        summary.leading_bases = bases;
        summary.leading_header = headers.pop();
        pos = fragment.len();
    }
    let (bases, headers) = scan_bases(&bytes[pos..], offset + pos as u64);
    summary.bases_before_first_header = bases;
    summary.headers = headers;
    summary
}

/// Fetch and summarize one span of `fasta`. The byte before the span is
/// fetched too, to tell whether the span starts on a line boundary.
pub fn scan_remote_span(
    store: &dyn ObjectStore,
    fasta: &ObjectPath,
    span: ByteSpan,
) -> Result<SpanSummary> {
    let first = span.start.saturating_sub(1);
    let bytes = store
        .get(&fasta.bucket, &fasta.key, Some(ByteRange::new(first, span.end - 1)))
        .with_context(|| format!("fetching bytes [{}, {}) of {fasta}", span.start, span.end))?;
    let summary = if span.start == 0 {
        scan_span(&bytes, 0, true)
    } else {
        let (prev, rest) = bytes
            .split_first()
            .ok_or_else(|| anyhow!("empty read of {fasta} at {}", span.start))?;
        scan_span(rest, span.start, *prev == b'\n')
    };
    debug!(
        "span [{}, {}) of {fasta}: {} headers",
        span.start,
        span.end,
        summary.headers.len()
    );
    Ok(summary)
}

struct Open {
    name: String,
    name_terminated: bool,
    offset_head: u64,
    offset_base: Option<u64>,
    bases: u64,
}

impl Open {
    fn from_header(h: &HeaderObs) -> Self {
        Open {
            name: h.name.clone(),
            name_terminated: h.name_terminated,
            offset_head: h.offset_head,
            offset_base: h.offset_base,
            bases: h.bases,
        }
    }

    fn close(self) -> Result<FaidxRecord> {
        let offset_base = self.offset_base.ok_or_else(|| {
            anyhow!(
                "header '{}' at byte {} has no sequence line",
                self.name,
                self.offset_head
            )
        })?;
        Ok(FaidxRecord {
            name_id: self.name,
            offset_head: self.offset_head,
            offset_base,
            length_bases: self.bases,
        })
    }
}

/// Reduce the span summaries, in file order, into the index.
pub fn stitch(summaries: &[SpanSummary]) -> Result<Vec<FaidxRecord>> {
    let mut records = Vec::new();
    let mut open: Option<Open> = None;
    let mut start_header = |open: &mut Option<Open>, header: &HeaderObs| -> Result<()> {
        if let Some(rec) = open.replace(Open::from_header(header)) {
            records.push(rec.close()?);
        }
        Ok(())
    };
    for summary in summaries {
        if summary.leading_len > 0 {
            let in_header_line = open.as_ref().is_some_and(|rec| rec.offset_base.is_none());
            match open.as_mut() {
                Some(rec) if in_header_line => {
                    if !rec.name_terminated {
                        rec.name.push_str(&summary.leading_name);
                        rec.name_terminated = summary.leading_name_terminated;
                    }
                    if summary.leading_has_newline {
                        rec.offset_base = Some(summary.start + summary.leading_len);
                    }
                }
                rec => {
                    if let Some(rec) = rec {
                        rec.bases += summary.leading_bases;
                    }
                    if let Some(header) = &summary.leading_header {
                        start_header(&mut open, header)?;
                    }
                }
            }
        }
        if let Some(rec) = open.as_mut() {
            rec.bases += summary.bases_before_first_header;
        }
        for header in &summary.headers {
            start_header(&mut open, header)?;
        }
    }
    if let Some(rec) = open {
        records.push(rec.close()?);
    }
    Ok(records)
}

fn to_bytes(records: &[FaidxRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_writer(Vec::new());
    for rec in records {
        writer.serialize(rec)?;
    }
    Ok(writer.into_inner()?)
}

fn from_bytes(body: &[u8]) -> Result<Vec<FaidxRecord>> {
    csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_reader(body)
        .deserialize()
        .collect::<Result<Vec<FaidxRecord>, _>>()
        .map_err(Into::into)
}

/// Upload the index bz2-compressed, with its record count in the metadata.
pub fn save_faidx(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    records: &[FaidxRecord],
) -> Result<()> {
    let mut meta = Metadata::new();
    meta.insert(NUM_SEQUENCES_META.to_string(), records.len().to_string());
    store.put(bucket, key, &compress_bytes(&to_bytes(records)?)?, &meta)?;
    info!("wrote faidx {bucket}/{key} with {} sequences", records.len());
    Ok(())
}

pub fn load_faidx(store: &dyn ObjectStore, bucket: &str, key: &str) -> Result<Vec<FaidxRecord>> {
    let body = decompress_bytes(&store.get(bucket, key, None)?)
        .with_context(|| format!("decompressing {bucket}/{key}"))?;
    let records = from_bytes(&body).with_context(|| format!("parsing {bucket}/{key}"))?;
    if records.is_empty() {
        bail!(PipelineError::PartitionFailed {
            chunk_id: 0,
            reason: format!("faidx {bucket}/{key} has no sequences"),
        });
    }
    Ok(records)
}

/// Key of the cached faidx of `fasta` built with `fasta_chunks` spans.
pub fn faidx_object(fasta: &ObjectPath, fasta_chunks: usize) -> ObjectPath {
    ObjectPath::new(
        fasta.bucket.clone(),
        faidx_key(&fasta_key(fasta), fasta_chunks),
    )
}
