//! Header-aware FASTA chunking on top of the faidx.

use anyhow::{bail, Context, Result};
use log::debug;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use vc_store::{ByteRange, ObjectStore};
use vc_types::{FaidxRecord, FastaChunk, ObjectPath, PipelineError};

/// The record whose header or bases contain `offset`.
fn owner(records: &[FaidxRecord], offset: u64) -> &FaidxRecord {
    let idx = records.partition_point(|r| r.offset_head <= offset);
    &records[idx.saturating_sub(1)]
}

/// Cut the FASTA into at most `fasta_chunks` chunks.
///
/// Chunk `j` starts right after chunk `j-1` and nominally ends at
/// `(j+1)·S/N - 1`. The end is moved back before the last header starting
/// in its base region, so a header is never cut; a chunk may still carry
/// whole short sequences inside its base region. The last chunk runs to the
/// end of the file.
pub fn plan_fasta_chunks(
    records: &[FaidxRecord],
    file_size: u64,
    fasta_chunks: usize,
) -> Result<Vec<FastaChunk>> {
    if records.is_empty() || file_size == 0 {
        bail!(PipelineError::PartitionFailed {
            chunk_id: 0,
            reason: "the fasta has no sequences".to_string(),
        });
    }
    if fasta_chunks == 0 {
        bail!(PipelineError::config("fasta_chunks must be at least 1"));
    }
    let last = file_size - 1;
    let stride = (file_size / fasta_chunks as u64).max(1);
    let mut chunks: Vec<FastaChunk> = Vec::with_capacity(fasta_chunks);
    let mut start = records[0].offset_head;

    for chunk_id in 0..fasta_chunks {
        if start > last {
            break;
        }
        let rec = owner(records, start);
        let (offset_head, offset_base) = if rec.header_contains(start) {
            (rec.offset_head, rec.offset_base)
        } else {
            (rec.offset_head, start)
        };
        if offset_base > last {
            // a trailing header without bases stays in the previous chunk
            match chunks.last_mut() {
                Some(prev) => prev.last_byte = last,
                None => bail!(PipelineError::PartitionFailed {
                    chunk_id,
                    reason: format!("sequence '{}' has no bases", rec.name_id),
                }),
            }
            break;
        }

        let mut last_byte = if chunk_id + 1 == fasta_chunks {
            last
        } else {
            let span_end = ((chunk_id as u64 + 1) * stride).max(offset_base + 1);
            let cut = records
                .iter()
                .filter(|r| r.offset_head > offset_base && r.offset_head < span_end)
                .filter(|r| r.offset_base <= last)
                .last();
            match cut {
                Some(r) => r.offset_head - 1,
                None => (span_end - 1).min(last),
            }
        };
        // never end inside a header line
        let straddled = owner(records, last_byte);
        if straddled.offset_head > offset_base && last_byte + 1 < straddled.offset_base {
            last_byte = straddled.offset_base - 1;
        }

        chunks.push(FastaChunk {
            chunk_id,
            offset_head,
            offset_base,
            last_byte,
        });
        start = last_byte + 1;
    }
    if let Some(tail) = chunks.last_mut() {
        tail.last_byte = last;
    }
    debug!("cut {file_size} fasta bytes into {} chunks", chunks.len());
    Ok(chunks)
}

/// Write the chunk (its header line then its bases) as a FASTA file.
pub fn fetch_fasta_chunk(
    store: &dyn ObjectStore,
    fasta: &ObjectPath,
    chunk: &FastaChunk,
    path: &Path,
) -> Result<u64> {
    let (head_0, head_1) = chunk.header_range();
    let (base_0, base_1) = chunk.base_range();
    let header = store
        .get(&fasta.bucket, &fasta.key, Some(ByteRange::new(head_0, head_1)))
        .with_context(|| format!("fetching the header of fasta chunk {}", chunk.chunk_id))?;
    let bases = store
        .get(&fasta.bucket, &fasta.key, Some(ByteRange::new(base_0, base_1)))
        .with_context(|| format!("fetching the bases of fasta chunk {}", chunk.chunk_id))?;

    let mut out = BufWriter::new(File::create(path).with_context(|| path.display().to_string())?);
    out.write_all(&header)?;
    if !header.ends_with(b"\n") {
        out.write_all(b"\n")?;
    }
    out.write_all(&bases)?;
    let mut written = (header.len() + bases.len()) as u64;
    if !bases.ends_with(b"\n") {
        out.write_all(b"\n")?;
        written += 1;
    }
    out.flush()?;
    Ok(written)
}
