//! S3 backend.
//!
//! The SDK is async; every call is driven to completion on a private tokio
//! runtime. Response bodies and SELECT event streams are pumped by a helper
//! thread into a bounded channel so callers get a plain blocking reader.

use crate::error::IoContext;
use crate::select::{InputFormat, SelectQuery};
use crate::{
    ByteRange, CompletedPart, Metadata, ObjectMeta, ObjectStore, RecordIter, Result, StoreError,
};
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart as S3CompletedPart, CsvInput, CsvOutput, Delete,
    ExpressionType, FileHeaderInfo, InputSerialization, ObjectIdentifier, OutputSerialization,
    ParquetInput, QuoteFields, SelectObjectContentEventStream,
};
use aws_sdk_s3::Client;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::debug;
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use tokio::runtime::Runtime;

/// Maximum number of keys per DeleteObjects request.
const DELETE_BATCH: usize = 1000;

/// Chunks buffered between the pump thread and the reader.
const CHANNEL_DEPTH: usize = 16;

pub struct S3ObjectStore {
    client: Client,
    runtime: Runtime,
}

impl S3ObjectStore {
    /// Build a client from the ambient AWS configuration. `endpoint_url`
    /// selects an S3-compatible service and switches to path-style addressing.
    pub fn from_env(endpoint_url: Option<&str>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .io_context(|| "starting the S3 client runtime")?;
        let shared = runtime.block_on(aws_config::load_defaults(
            aws_config::BehaviorVersion::latest(),
        ));
        let mut config = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(url) = endpoint_url {
            config = config.endpoint_url(url).force_path_style(true);
        }
        Ok(S3ObjectStore {
            client: Client::from_conf(config.build()),
            runtime,
        })
    }
}

/// Quote, escape and comment character for S3 Select. Quality strings use
/// every printable character, so the CSV reader and writer must never treat
/// one as special.
const INERT_CHAR: &str = "\u{1}";

/// Rows pass through S3 Select byte for byte: no quoting, no comments.
fn serialization(query: &SelectQuery) -> (InputSerialization, OutputSerialization) {
    let input = match query.input {
        InputFormat::Csv { delimiter } => InputSerialization::builder()
            .csv(
                CsvInput::builder()
                    .file_header_info(FileHeaderInfo::None)
                    .field_delimiter(char::from(delimiter).to_string())
                    .quote_character(INERT_CHAR)
                    .quote_escape_character(INERT_CHAR)
                    .comments(INERT_CHAR)
                    .build(),
            )
            .build(),
        InputFormat::Parquet => InputSerialization::builder()
            .parquet(ParquetInput::builder().build())
            .build(),
    };
    let output = OutputSerialization::builder()
        .csv(
            CsvOutput::builder()
                .field_delimiter(char::from(query.output_delimiter).to_string())
                .record_delimiter("\n")
                .quote_fields(QuoteFields::Asneeded)
                .quote_character(INERT_CHAR)
                .quote_escape_character(INERT_CHAR)
                .build(),
        )
        .build();
    (input, output)
}

fn classify<E>(bucket: &str, key: &str, err: SdkError<E, HttpResponse>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = format!("{bucket}/{key}: {}", DisplayErrorContext(&err));
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StoreError::Transient(message)
        }
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            match service.err().code() {
                Some("NoSuchKey" | "NotFound") => StoreError::not_found(bucket, key),
                Some("NoSuchUpload") => StoreError::NoSuchUpload {
                    upload_id: key.to_string(),
                },
                Some("SlowDown" | "Throttling" | "RequestTimeout") => {
                    StoreError::Transient(message)
                }
                _ if status == 404 => StoreError::not_found(bucket, key),
                _ if status >= 500 || status == 429 => StoreError::Transient(message),
                _ => StoreError::Backend(message),
            }
        }
        _ => StoreError::Backend(message),
    }
}

/// Blocking reader over chunks produced by a pump thread.
struct ChannelReader {
    rx: Receiver<Result<Vec<u8>>>,
    buf: Vec<u8>,
    pos: usize,
}

impl Read for ChannelReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.buf.len() {
            match self.rx.recv() {
                Ok(Ok(chunk)) => {
                    self.buf = chunk;
                    self.pos = 0;
                }
                Ok(Err(e)) => return Err(io::Error::new(io::ErrorKind::Other, e)),
                // the pump finished
                Err(_) => return Ok(0),
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl S3ObjectStore {
    fn pump<F, Fut>(&self, f: F) -> ChannelReader
    where
        F: FnOnce(Sender<Result<Vec<u8>>>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()>,
    {
        let (tx, rx) = bounded(CHANNEL_DEPTH);
        let handle = self.runtime.handle().clone();
        std::thread::spawn(move || handle.block_on(f(tx)));
        ChannelReader {
            rx,
            buf: Vec::new(),
            pos: 0,
        }
    }
}

impl ObjectStore for S3ObjectStore {
    fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>> {
        let resp = self
            .runtime
            .block_on(self.client.head_object().bucket(bucket).key(key).send());
        match resp {
            Ok(out) => Ok(Some(ObjectMeta {
                size: out.content_length().unwrap_or(0).max(0) as u64,
                etag: out.e_tag().unwrap_or_default().to_string(),
                metadata: out
                    .metadata()
                    .map(|m| m.clone().into_iter().collect())
                    .unwrap_or_default(),
            })),
            Err(SdkError::ServiceError(e)) if e.err().is_not_found() => Ok(None),
            Err(e) => match classify(bucket, key, e) {
                StoreError::NotFound { .. } => Ok(None),
                e => Err(e),
            },
        }
    }

    fn get_stream(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<Box<dyn Read + Send>> {
        let out = self
            .runtime
            .block_on(
                self.client
                    .get_object()
                    .bucket(bucket)
                    .key(key)
                    .set_range(range.map(|r| r.header_value()))
                    .send(),
            )
            .map_err(|e| classify(bucket, key, e))?;
        let mut body = out.body;
        let what = format!("{bucket}/{key}");
        let reader = self.pump(move |tx| async move {
            loop {
                match body.next().await {
                    Some(Ok(bytes)) => {
                        if tx.send(Ok(bytes.to_vec())).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Err(StoreError::Transient(format!("{what}: {e}"))));
                        break;
                    }
                    None => break,
                }
            }
        });
        Ok(Box::new(reader))
    }

    fn put(&self, bucket: &str, key: &str, body: &[u8], metadata: &Metadata) -> Result<()> {
        let metadata: HashMap<String, String> = metadata.clone().into_iter().collect();
        self.runtime
            .block_on(
                self.client
                    .put_object()
                    .bucket(bucket)
                    .key(key)
                    .body(ByteStream::from(body.to_vec()))
                    .set_metadata(Some(metadata))
                    .send(),
            )
            .map_err(|e| classify(bucket, key, e))?;
        debug!("put s3://{bucket}/{key} ({} bytes)", body.len());
        Ok(())
    }

    fn put_file(&self, bucket: &str, key: &str, path: &Path, metadata: &Metadata) -> Result<()> {
        let metadata: HashMap<String, String> = metadata.clone().into_iter().collect();
        self.runtime.block_on(async {
            let body = ByteStream::from_path(path).await.map_err(|e| {
                StoreError::io(
                    format!("reading {}", path.display()),
                    io::Error::new(io::ErrorKind::Other, e),
                )
            })?;
            self.client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(body)
                .set_metadata(Some(metadata))
                .send()
                .await
                .map_err(|e| classify(bucket, key, e))
        })?;
        debug!("put s3://{bucket}/{key} from {}", path.display());
        Ok(())
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let out = self
                .runtime
                .block_on(
                    self.client
                        .list_objects_v2()
                        .bucket(bucket)
                        .prefix(prefix)
                        .set_continuation_token(token.take())
                        .send(),
                )
                .map_err(|e| classify(bucket, prefix, e))?;
            keys.extend(
                out.contents()
                    .iter()
                    .filter_map(|o| o.key().map(str::to_string)),
            );
            match out.next_continuation_token() {
                Some(next) if out.is_truncated() == Some(true) => token = Some(next.to_string()),
                _ => break,
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn delete_many(&self, bucket: &str, keys: &[String]) -> Result<()> {
        for batch in keys.chunks(DELETE_BATCH) {
            let objects = batch
                .iter()
                .map(|k| ObjectIdentifier::builder().key(k).build())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| StoreError::InvalidRequest(e.to_string()))?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| StoreError::InvalidRequest(e.to_string()))?;
            self.runtime
                .block_on(
                    self.client
                        .delete_objects()
                        .bucket(bucket)
                        .delete(delete)
                        .send(),
                )
                .map_err(|e| classify(bucket, "<batch delete>", e))?;
        }
        debug!("deleted {} keys from s3://{bucket}", keys.len());
        Ok(())
    }

    fn mpu_create(&self, bucket: &str, key: &str) -> Result<String> {
        let out = self
            .runtime
            .block_on(
                self.client
                    .create_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .send(),
            )
            .map_err(|e| classify(bucket, key, e))?;
        out.upload_id()
            .map(str::to_string)
            .ok_or_else(|| StoreError::Backend(format!("no upload id returned for {bucket}/{key}")))
    }

    fn mpu_part_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: &[u8],
    ) -> Result<CompletedPart> {
        let out = self
            .runtime
            .block_on(
                self.client
                    .upload_part()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(body.to_vec()))
                    .send(),
            )
            .map_err(|e| classify(bucket, key, e))?;
        Ok(CompletedPart {
            part_number,
            etag: out.e_tag().unwrap_or_default().to_string(),
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
        let out = self
            .runtime
            .block_on(
                self.client
                    .upload_part_copy()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .copy_source(format!("{source_bucket}/{source_key}"))
                    .set_copy_source_range(source_range.map(|r| r.header_value()))
                    .send(),
            )
            .map_err(|e| classify(bucket, key, e))?;
        let etag = out
            .copy_part_result()
            .and_then(|r| r.e_tag())
            .unwrap_or_default()
            .to_string();
        Ok(CompletedPart { part_number, etag })
    }

    fn mpu_complete(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let parts = parts
            .iter()
            .map(|p| {
                S3CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();
        let upload = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();
        self.runtime
            .block_on(
                self.client
                    .complete_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .multipart_upload(upload)
                    .send(),
            )
            .map_err(|e| classify(bucket, key, e))?;
        Ok(())
    }

    fn mpu_abort(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        self.runtime
            .block_on(
                self.client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .send(),
            )
            .map_err(|e| classify(bucket, key, e))?;
        Ok(())
    }

    fn select(&self, bucket: &str, key: &str, query: &SelectQuery) -> Result<RecordIter> {
        let (input, output) = serialization(query);
        let out = self
            .runtime
            .block_on(
                self.client
                    .select_object_content()
                    .bucket(bucket)
                    .key(key)
                    .expression(query.to_sql())
                    .expression_type(ExpressionType::Sql)
                    .input_serialization(input)
                    .output_serialization(output)
                    .send(),
            )
            .map_err(|e| classify(bucket, key, e))?;
        let mut events = out.payload;
        let (b, k) = (bucket.to_string(), key.to_string());
        let reader = self.pump(move |tx| async move {
            loop {
                match events.recv().await {
                    Ok(Some(SelectObjectContentEventStream::Records(records))) => {
                        if let Some(payload) = records.payload() {
                            if tx.send(Ok(payload.as_ref().to_vec())).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Some(SelectObjectContentEventStream::End(_))) | Ok(None) => break,
                    Ok(Some(_)) => {}
                    Err(e) => {
                        let _ = tx.send(Err(StoreError::Select {
                            bucket: b.clone(),
                            key: k.clone(),
                            reason: DisplayErrorContext(&e).to_string(),
                        }));
                        break;
                    }
                }
            }
        });
        let what = format!("{bucket}/{key}");
        let lines = BufReader::new(reader).lines().filter_map(move |line| match line {
            Ok(line) if line.is_empty() => None,
            Ok(line) => Some(Ok(line)),
            Err(e) => Some(Err(StoreError::io(format!("select on {what}"), e))),
        });
        Ok(Box::new(lines))
    }
}
