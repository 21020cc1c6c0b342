use crate::{
    ByteRange, CompletedPart, Metadata, ObjectMeta, ObjectStore, RecordIter, Result, SelectQuery,
};
use log::warn;
use std::io::Read;
use std::path::Path;
use std::thread;
use std::time::Duration;

/// Exponential backoff: `initial_backoff * 2^(attempt-1)`, at most `attempts`
/// tries in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 5,
            initial_backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(6);
        self.initial_backoff.saturating_mul(1 << shift)
    }
}

/// Wraps a backend and retries operations that fail with a transient error.
///
/// Streaming operations retry only the request that opens the stream.
pub struct Retrying<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: ObjectStore> Retrying<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Retrying { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn retry<T>(&self, op: &str, target: &str, mut f: impl FnMut(&S) -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match f(&self.inner) {
                Err(e) if e.is_transient() && attempt < self.policy.attempts => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        "{op} {target} failed (attempt {attempt}/{}), retrying in {delay:?}: {e}",
                        self.policy.attempts
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

impl<S: ObjectStore> ObjectStore for Retrying<S> {
    fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>> {
        self.retry("HEAD", key, |s| s.head(bucket, key))
    }

    fn min_part_size(&self) -> u64 {
        self.inner.min_part_size()
    }

    fn get(&self, bucket: &str, key: &str, range: Option<ByteRange>) -> Result<Vec<u8>> {
        self.retry("GET", key, |s| s.get(bucket, key, range))
    }

    fn get_stream(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<Box<dyn Read + Send>> {
        self.retry("GET", key, |s| s.get_stream(bucket, key, range))
    }

    fn put(&self, bucket: &str, key: &str, body: &[u8], metadata: &Metadata) -> Result<()> {
        self.retry("PUT", key, |s| s.put(bucket, key, body, metadata))
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        self.retry("LIST", prefix, |s| s.list(bucket, prefix))
    }

    fn delete_many(&self, bucket: &str, keys: &[String]) -> Result<()> {
        self.retry("DELETE", bucket, |s| s.delete_many(bucket, keys))
    }

    fn mpu_create(&self, bucket: &str, key: &str) -> Result<String> {
        self.retry("CreateMultipartUpload", key, |s| s.mpu_create(bucket, key))
    }

    fn mpu_part_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: &[u8],
    ) -> Result<CompletedPart> {
        self.retry("UploadPart", key, |s| {
            s.mpu_part_upload(bucket, key, upload_id, part_number, body)
        })
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
        self.retry("UploadPartCopy", key, |s| {
            s.mpu_part_copy(
                bucket,
                key,
                upload_id,
                part_number,
                source_bucket,
                source_key,
                source_range,
            )
        })
    }

    fn mpu_complete(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        self.retry("CompleteMultipartUpload", key, |s| {
            s.mpu_complete(bucket, key, upload_id, parts)
        })
    }

    fn mpu_abort(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        self.retry("AbortMultipartUpload", key, |s| {
            s.mpu_abort(bucket, key, upload_id)
        })
    }

    fn select(&self, bucket: &str, key: &str, query: &SelectQuery) -> Result<RecordIter> {
        self.retry("SELECT", key, |s| s.select(bucket, key, query))
    }

    fn put_file(&self, bucket: &str, key: &str, path: &Path, metadata: &Metadata) -> Result<()> {
        self.retry("PUT", key, |s| s.put_file(bucket, key, path, metadata))
    }

    fn get_to_file(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
        path: &Path,
    ) -> Result<u64> {
        self.retry("GET", key, |s| s.get_to_file(bucket, key, range, path))
    }
}
