// Warning groups (as of rust 1.55)
#![deny(
    future_incompatible,
    nonstandard_style,
    rust_2018_compatibility,
    rust_2021_compatibility,
    rust_2018_idioms
)]
#![warn(unused)]

//! Object-store client.
//!
//! Every artifact of a pipeline run lives in an S3-compatible object store.
//! [`ObjectStore`] is the single seam the engine talks to; [`LocalObjectStore`]
//! emulates it on a local directory and `S3ObjectStore` (feature `s3`) talks
//! to S3. [`Retrying`] adds exponential backoff on transient errors to any
//! backend.

mod error;
mod local;
mod retry;
#[cfg(feature = "s3")]
mod s3;
pub mod select;

pub use error::StoreError;
pub use local::LocalObjectStore;
pub use retry::{RetryPolicy, Retrying};
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;
pub use select::{ColumnRef, InputFormat, Projection, RangeFilter, SelectQuery};

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use error::IoContext;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// User metadata attached to an object.
pub type Metadata = BTreeMap<String, String>;

/// Records streamed back by [`ObjectStore::select`], one line each without
/// the trailing newline.
pub type RecordIter = Box<dyn Iterator<Item = Result<String>> + Send>;

/// S3 rejects every part of an upload but the last below this size.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Largest part S3 accepts, copied or uploaded.
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    pub etag: String,
    pub metadata: Metadata,
}

/// Inclusive byte range `[first, last]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub first: u64,
    pub last: u64,
}

impl ByteRange {
    pub fn new(first: u64, last: u64) -> Self {
        ByteRange { first, last }
    }

    pub fn len(&self) -> u64 {
        self.last + 1 - self.first
    }

    pub fn is_empty(&self) -> bool {
        self.last < self.first
    }

    /// The value of an HTTP `Range` header.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.first, self.last)
    }
}

/// A completed multipart part.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
}

/// Operations the pipeline needs from an object store.
///
/// Missing objects are reported as `Ok(None)` by [`ObjectStore::head`] and as
/// [`StoreError::NotFound`] elsewhere.
pub trait ObjectStore: Send + Sync {
    fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>>;

    /// Smallest size of every part of a multipart upload but the last.
    fn min_part_size(&self) -> u64 {
        MIN_PART_SIZE
    }

    fn get(&self, bucket: &str, key: &str, range: Option<ByteRange>) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        self.get_stream(bucket, key, range)?
            .read_to_end(&mut body)
            .io_context(|| format!("reading {bucket}/{key}"))?;
        Ok(body)
    }

    fn get_stream(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<Box<dyn Read + Send>>;

    fn put(&self, bucket: &str, key: &str, body: &[u8], metadata: &Metadata) -> Result<()>;

    /// Keys under `prefix`, in lexicographic order.
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    /// Delete `keys`; keys that do not exist are ignored.
    fn delete_many(&self, bucket: &str, keys: &[String]) -> Result<()>;

    /// Start a multipart upload and return its id.
    fn mpu_create(&self, bucket: &str, key: &str) -> Result<String>;

    fn mpu_part_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: &[u8],
    ) -> Result<CompletedPart>;

    /// Copy an existing object, or the inclusive `source_range` of it, into
    /// part `part_number`.
    #[allow(clippy::too_many_arguments)]
    fn mpu_part_copy(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        source_bucket: &str,
        source_key: &str,
        source_range: Option<ByteRange>,
    ) -> Result<CompletedPart>;

    /// Assemble the parts, which must be given in ascending part number.
    fn mpu_complete(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()>;

    fn mpu_abort(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()>;

    fn select(&self, bucket: &str, key: &str, query: &SelectQuery) -> Result<RecordIter>;

    fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self.head(bucket, key)?.is_some())
    }

    fn put_file(&self, bucket: &str, key: &str, path: &Path, metadata: &Metadata) -> Result<()> {
        let body = std::fs::read(path).io_context(|| format!("reading {}", path.display()))?;
        self.put(bucket, key, &body, metadata)
    }

    /// Stream an object (or a range of it) into a local file.
    fn get_to_file(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
        path: &Path,
    ) -> Result<u64> {
        let mut reader = self.get_stream(bucket, key, range)?;
        let file = File::create(path).io_context(|| format!("creating {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        let n = io::copy(&mut reader, &mut writer)
            .io_context(|| format!("downloading {bucket}/{key} to {}", path.display()))?;
        writer
            .flush()
            .io_context(|| format!("writing {}", path.display()))?;
        Ok(n)
    }
}

impl<S: ObjectStore + ?Sized> ObjectStore for std::sync::Arc<S> {
    fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>> {
        (**self).head(bucket, key)
    }

    fn min_part_size(&self) -> u64 {
        (**self).min_part_size()
    }

    fn get(&self, bucket: &str, key: &str, range: Option<ByteRange>) -> Result<Vec<u8>> {
        (**self).get(bucket, key, range)
    }

    fn get_stream(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<Box<dyn Read + Send>> {
        (**self).get_stream(bucket, key, range)
    }

    fn put(&self, bucket: &str, key: &str, body: &[u8], metadata: &Metadata) -> Result<()> {
        (**self).put(bucket, key, body, metadata)
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        (**self).list(bucket, prefix)
    }

    fn delete_many(&self, bucket: &str, keys: &[String]) -> Result<()> {
        (**self).delete_many(bucket, keys)
    }

    fn mpu_create(&self, bucket: &str, key: &str) -> Result<String> {
        (**self).mpu_create(bucket, key)
    }

    fn mpu_part_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: &[u8],
    ) -> Result<CompletedPart> {
        (**self).mpu_part_upload(bucket, key, upload_id, part_number, body)
    }

    fn mpu_part_copy(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        source_bucket: &str,
        source_key: &str,
        source_range: Option<ByteRange>,
    ) -> Result<CompletedPart> {
        (**self).mpu_part_copy(
            bucket,
            key,
            upload_id,
            part_number,
            source_bucket,
            source_key,
            source_range,
        )
    }

    fn mpu_complete(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        (**self).mpu_complete(bucket, key, upload_id, parts)
    }

    fn mpu_abort(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        (**self).mpu_abort(bucket, key, upload_id)
    }

    fn select(&self, bucket: &str, key: &str, query: &SelectQuery) -> Result<RecordIter> {
        (**self).select(bucket, key, query)
    }

    fn put_file(&self, bucket: &str, key: &str, path: &Path, metadata: &Metadata) -> Result<()> {
        (**self).put_file(bucket, key, path, metadata)
    }

    fn get_to_file(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
        path: &Path,
    ) -> Result<u64> {
        (**self).get_to_file(bucket, key, range, path)
    }
}
