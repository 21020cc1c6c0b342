//! bzip2 helpers for the `.bz2` artifacts.

use anyhow::{Context, Result};
use bzip2::read::MultiBzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

pub fn compress_file(src: &Path, dest: &Path) -> Result<u64> {
    let mut reader =
        BufReader::new(File::open(src).with_context(|| src.display().to_string())?);
    let out = File::create(dest).with_context(|| dest.display().to_string())?;
    let mut encoder = BzEncoder::new(BufWriter::new(out), Compression::default());
    let n = io::copy(&mut reader, &mut encoder)
        .with_context(|| format!("compressing {}", src.display()))?;
    encoder.finish()?.flush()?;
    Ok(n)
}

pub fn decompress_file(src: &Path, dest: &Path) -> Result<u64> {
    let file = File::open(src).with_context(|| src.display().to_string())?;
    decompress_to_file(BufReader::new(file), dest)
        .with_context(|| format!("decompressing {}", src.display()))
}

/// Decompress a `.bz2` stream into `dest`.
pub fn decompress_to_file(reader: impl Read, dest: &Path) -> Result<u64> {
    let mut decoder = MultiBzDecoder::new(reader);
    let mut out = BufWriter::new(File::create(dest).with_context(|| dest.display().to_string())?);
    let n = io::copy(&mut decoder, &mut out)?;
    out.flush()?;
    Ok(n)
}

pub fn compress_bytes(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn decompress_bytes(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    MultiBzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}
