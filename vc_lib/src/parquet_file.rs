use anyhow::{anyhow, Context, Result};
use log::warn;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use parquet::file::writer::SerializedFileWriter;
use parquet::record::RecordWriter;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// A parquet file on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParquetFile(PathBuf);

impl ParquetFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ParquetFile(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Instantiate a writer that flushes a row group every `row_group_size`
    /// rows.
    pub fn writer<T>(&self, row_group_size: usize) -> Result<ParquetWriter<T>>
    where
        for<'a> &'a [T]: RecordWriter<T>,
    {
        if row_group_size == 0 {
            return Err(anyhow!("row group size must be positive"));
        }
        // the schema comes from the record writer of an empty slice
        let empty: &[T] = &[];
        let file = File::create(&self.0).with_context(|| self.0.display().to_string())?;
        Ok(ParquetWriter {
            writer: Some(SerializedFileWriter::new(
                BufWriter::new(file),
                empty.schema()?,
                WriterProperties::builder()
                    .set_compression(Compression::ZSTD(ZstdLevel::try_new(3)?))
                    .build()
                    .into(),
            )?),
            row_group_size,
            cache: Vec::with_capacity(row_group_size),
        })
    }
}

pub struct ParquetWriter<T>
where
    for<'a> &'a [T]: RecordWriter<T>,
{
    writer: Option<SerializedFileWriter<BufWriter<File>>>,
    row_group_size: usize,
    cache: Vec<T>,
}

impl<T> ParquetWriter<T>
where
    for<'a> &'a [T]: RecordWriter<T>,
{
    pub fn push(&mut self, item: T) -> Result<()> {
        self.cache.push(item);
        if self.cache.len() >= self.row_group_size {
            self.write_and_clear_cache()?;
        }
        Ok(())
    }

    fn write_and_clear_cache(&mut self) -> Result<()> {
        if self.cache.is_empty() {
            return Ok(());
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("parquet writer already closed"))?;
        let mut row_group = writer.next_row_group()?;
        self.cache.as_slice().write_to_row_group(&mut row_group)?;
        row_group.close()?;
        self.cache.clear();
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.write_and_clear_cache()?;
        if let Some(writer) = self.writer.take() {
            writer.close()?;
        }
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.finish()
    }
}

impl<T> Drop for ParquetWriter<T>
where
    for<'a> &'a [T]: RecordWriter<T>,
{
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("failed to finish parquet file: {e:#}");
        }
    }
}
