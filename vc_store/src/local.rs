//! Object store emulated on a local directory.
//!
//! ```text
//! {root}/objects/{bucket}/{key}         object bodies
//! {root}/meta/{bucket}/{key}.json       etag and user metadata
//! {root}/uploads/{upload_id}/           multipart staging
//! {root}/staging/                       temp files, renamed into place
//! ```
//!
//! Every write lands in `staging/` first and is renamed into place, so readers
//! never observe a partial object.

use crate::error::IoContext;
use crate::select::{self, SelectQuery};
use crate::{
    ByteRange, CompletedPart, Metadata, ObjectMeta, ObjectStore, RecordIter, Result, StoreError,
    MIN_PART_SIZE,
};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const MAX_PART_NUMBER: i32 = 10_000;

#[derive(Serialize, Deserialize)]
struct Sidecar {
    etag: String,
    metadata: Metadata,
}

#[derive(Serialize, Deserialize)]
struct UploadTarget {
    bucket: String,
    key: String,
}

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    min_part_size: u64,
}

impl LocalObjectStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for sub in ["objects", "meta", "uploads", "staging"] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir).io_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(LocalObjectStore {
            root,
            min_part_size: MIN_PART_SIZE,
        })
    }

    /// Smallest size accepted for every part of an upload but the last.
    /// Defaults to the S3 limit.
    pub fn with_min_part_size(mut self, min_part_size: u64) -> Self {
        self.min_part_size = min_part_size;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ids of multipart uploads that were neither completed nor aborted.
    pub fn open_uploads(&self) -> Result<Vec<String>> {
        let dir = self.root.join("uploads");
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir).io_context(|| format!("reading {}", dir.display()))? {
            let entry = entry.io_context(|| format!("reading {}", dir.display()))?;
            ids.push(entry.file_name().to_string_lossy().into_owned());
        }
        ids.sort();
        Ok(ids)
    }

    fn check_key(bucket: &str, key: &str) -> Result<()> {
        let bad_bucket = bucket.is_empty() || bucket.contains('/') || bucket.starts_with('.');
        let bad_key = key.is_empty()
            || key.starts_with('/')
            || key.ends_with('/')
            || key.split('/').any(|c| c.is_empty() || c == "." || c == "..");
        if bad_bucket || bad_key {
            return Err(StoreError::InvalidRequest(format!(
                "invalid object reference {bucket}/{key}"
            )));
        }
        Ok(())
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        Self::check_key(bucket, key)?;
        Ok(self.root.join("objects").join(bucket).join(key))
    }

    fn sidecar_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root
            .join("meta")
            .join(bucket)
            .join(format!("{key}.json"))
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join("uploads").join(upload_id)
    }

    fn part_path(&self, upload_id: &str, part_number: i32) -> PathBuf {
        self.upload_dir(upload_id).join(format!("{part_number:05}"))
    }

    fn staging_file(&self) -> Result<NamedTempFile> {
        let dir = self.root.join("staging");
        NamedTempFile::new_in(&dir).io_context(|| format!("creating temp file in {}", dir.display()))
    }

    /// Atomically move a finished temp file to `dest`.
    fn persist(tmp: NamedTempFile, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
        }
        tmp.persist(dest)
            .map_err(|e| StoreError::io(format!("renaming into {}", dest.display()), e.error))?;
        Ok(())
    }

    fn write_atomic(&self, dest: &Path, body: &[u8]) -> Result<()> {
        let mut tmp = self.staging_file()?;
        tmp.write_all(body)
            .io_context(|| format!("writing {}", dest.display()))?;
        Self::persist(tmp, dest)
    }

    fn write_sidecar(&self, bucket: &str, key: &str, metadata: &Metadata) -> Result<String> {
        let etag = uuid::Uuid::new_v4().simple().to_string();
        let sidecar = Sidecar {
            etag: etag.clone(),
            metadata: metadata.clone(),
        };
        let body = serde_json::to_vec(&sidecar)
            .map_err(|e| StoreError::Backend(format!("encoding metadata: {e}")))?;
        self.write_atomic(&self.sidecar_path(bucket, key), &body)?;
        Ok(etag)
    }

    fn read_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        let path = self.upload_dir(upload_id).join("upload.json");
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NoSuchUpload {
                    upload_id: upload_id.to_string(),
                })
            }
            Err(e) => return Err(StoreError::io(format!("reading {}", path.display()), e)),
        };
        let target: UploadTarget = serde_json::from_slice(&body)
            .map_err(|e| StoreError::Backend(format!("decoding {}: {e}", path.display())))?;
        if target.bucket != bucket || target.key != key {
            return Err(StoreError::InvalidRequest(format!(
                "upload {upload_id} belongs to {}/{}, not {bucket}/{key}",
                target.bucket, target.key
            )));
        }
        Ok(())
    }

    fn stage_part(
        &self,
        upload_id: &str,
        part_number: i32,
        mut body: impl Read,
    ) -> Result<CompletedPart> {
        if !(1..=MAX_PART_NUMBER).contains(&part_number) {
            return Err(StoreError::InvalidRequest(format!(
                "part number {part_number} outside [1, {MAX_PART_NUMBER}]"
            )));
        }
        let dest = self.part_path(upload_id, part_number);
        let mut tmp = self.staging_file()?;
        io::copy(&mut body, &mut tmp).io_context(|| format!("writing {}", dest.display()))?;
        Self::persist(tmp, &dest)?;
        let etag = uuid::Uuid::new_v4().simple().to_string();
        self.write_atomic(&dest.with_extension("etag"), etag.as_bytes())?;
        Ok(CompletedPart { part_number, etag })
    }

    fn collect_keys(dir: &Path, rel: &str, out: &mut Vec<String>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::io(format!("listing {}", dir.display()), e)),
        };
        for entry in entries {
            let entry = entry.io_context(|| format!("listing {}", dir.display()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let key = if rel.is_empty() {
                name
            } else {
                format!("{rel}/{name}")
            };
            let file_type = entry
                .file_type()
                .io_context(|| format!("listing {}", dir.display()))?;
            if file_type.is_dir() {
                Self::collect_keys(&entry.path(), &key, out)?;
            } else {
                out.push(key);
            }
        }
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(format!("removing {}", path.display()), e)),
    }
}

impl ObjectStore for LocalObjectStore {
    fn min_part_size(&self) -> u64 {
        self.min_part_size
    }

    fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>> {
        let path = self.object_path(bucket, key)?;
        let size = match fs::metadata(&path) {
            Ok(m) if m.is_file() => m.len(),
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(format!("stat {}", path.display()), e)),
        };
        let (etag, metadata) = match fs::read(self.sidecar_path(bucket, key)) {
            Ok(body) => {
                let sidecar: Sidecar = serde_json::from_slice(&body).map_err(|e| {
                    StoreError::Backend(format!("decoding metadata of {bucket}/{key}: {e}"))
                })?;
                (sidecar.etag, sidecar.metadata)
            }
            Err(_) => (String::new(), Metadata::new()),
        };
        Ok(Some(ObjectMeta {
            size,
            etag,
            metadata,
        }))
    }

    fn get_stream(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<Box<dyn Read + Send>> {
        let path = self.object_path(bucket, key)?;
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::not_found(bucket, key))
            }
            Err(e) => return Err(StoreError::io(format!("opening {}", path.display()), e)),
        };
        let Some(range) = range else {
            return Ok(Box::new(file));
        };
        let size = file
            .metadata()
            .io_context(|| format!("stat {}", path.display()))?
            .len();
        if range.is_empty() || range.first >= size {
            return Err(StoreError::InvalidRequest(format!(
                "range {} not satisfiable for {bucket}/{key} of {size} bytes",
                range.header_value()
            )));
        }
        let last = range.last.min(size - 1);
        file.seek(SeekFrom::Start(range.first))
            .io_context(|| format!("seeking {}", path.display()))?;
        Ok(Box::new(file.take(last + 1 - range.first)))
    }

    fn put(&self, bucket: &str, key: &str, body: &[u8], metadata: &Metadata) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        self.write_atomic(&path, body)?;
        self.write_sidecar(bucket, key, metadata)?;
        debug!("put {bucket}/{key} ({} bytes)", body.len());
        Ok(())
    }

    fn put_file(&self, bucket: &str, key: &str, path: &Path, metadata: &Metadata) -> Result<()> {
        let dest = self.object_path(bucket, key)?;
        let mut src = File::open(path).io_context(|| format!("opening {}", path.display()))?;
        let mut tmp = self.staging_file()?;
        let n = io::copy(&mut src, &mut tmp).io_context(|| format!("copying {}", path.display()))?;
        Self::persist(tmp, &dest)?;
        self.write_sidecar(bucket, key, metadata)?;
        debug!("put {bucket}/{key} from {} ({n} bytes)", path.display());
        Ok(())
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        Self::collect_keys(&self.root.join("objects").join(bucket), "", &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn delete_many(&self, bucket: &str, keys: &[String]) -> Result<()> {
        for key in keys {
            remove_if_exists(&self.object_path(bucket, key)?)?;
            remove_if_exists(&self.sidecar_path(bucket, key))?;
        }
        debug!("deleted {} keys from {bucket}", keys.len());
        Ok(())
    }

    fn mpu_create(&self, bucket: &str, key: &str) -> Result<String> {
        Self::check_key(bucket, key)?;
        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        let target = UploadTarget {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };
        let body = serde_json::to_vec(&target)
            .map_err(|e| StoreError::Backend(format!("encoding upload target: {e}")))?;
        self.write_atomic(&self.upload_dir(&upload_id).join("upload.json"), &body)?;
        Ok(upload_id)
    }

    fn mpu_part_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: &[u8],
    ) -> Result<CompletedPart> {
        self.read_upload(bucket, key, upload_id)?;
        self.stage_part(upload_id, part_number, body)
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
        self.read_upload(bucket, key, upload_id)?;
        let source = self.get_stream(source_bucket, source_key, source_range)?;
        self.stage_part(upload_id, part_number, source)
    }

    fn mpu_complete(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        self.read_upload(bucket, key, upload_id)?;
        if parts.is_empty() {
            return Err(StoreError::InvalidRequest(format!(
                "upload {upload_id} completed without parts"
            )));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(StoreError::InvalidRequest(format!(
                "parts of upload {upload_id} are not in ascending order"
            )));
        }
        let dest = self.object_path(bucket, key)?;
        let mut tmp = self.staging_file()?;
        for (i, part) in parts.iter().enumerate() {
            let path = self.part_path(upload_id, part.part_number);
            let etag = fs::read_to_string(path.with_extension("etag")).map_err(|_| {
                StoreError::InvalidRequest(format!(
                    "part {} of upload {upload_id} was never uploaded",
                    part.part_number
                ))
            })?;
            if etag != part.etag {
                return Err(StoreError::InvalidRequest(format!(
                    "etag mismatch for part {} of upload {upload_id}",
                    part.part_number
                )));
            }
            let mut src = File::open(&path).io_context(|| format!("opening {}", path.display()))?;
            let size = src
                .metadata()
                .io_context(|| format!("reading {}", path.display()))?
                .len();
            if i + 1 < parts.len() && size < self.min_part_size {
                return Err(StoreError::InvalidRequest(format!(
                    "EntityTooSmall: part {} of upload {upload_id} is {size} bytes, below {}",
                    part.part_number, self.min_part_size
                )));
            }
            io::copy(&mut src, &mut tmp).io_context(|| format!("assembling {}", dest.display()))?;
        }
        Self::persist(tmp, &dest)?;
        self.write_sidecar(bucket, key, &Metadata::new())?;
        let dir = self.upload_dir(upload_id);
        fs::remove_dir_all(&dir).io_context(|| format!("removing {}", dir.display()))?;
        debug!("completed {bucket}/{key} from {} parts", parts.len());
        Ok(())
    }

    fn mpu_abort(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        self.read_upload(bucket, key, upload_id)?;
        let dir = self.upload_dir(upload_id);
        fs::remove_dir_all(&dir).io_context(|| format!("removing {}", dir.display()))?;
        debug!("aborted upload {upload_id} of {bucket}/{key}");
        Ok(())
    }

    fn select(&self, bucket: &str, key: &str, query: &SelectQuery) -> Result<RecordIter> {
        let path = self.object_path(bucket, key)?;
        if !path.is_file() {
            return Err(StoreError::not_found(bucket, key));
        }
        select::evaluate(&path, bucket, key, query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::select::{ColumnRef, InputFormat};
    use pretty_assertions::assert_eq;

    fn store() -> (tempfile::TempDir, LocalObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_put_head_get() {
        let (_dir, s) = store();
        assert_eq!(s.head("b", "a/b/c.txt").unwrap(), None);
        let mut meta = Metadata::new();
        meta.insert("total_lines".into(), "32".into());
        s.put("b", "a/b/c.txt", b"0123456789", &meta).unwrap();
        let head = s.head("b", "a/b/c.txt").unwrap().unwrap();
        assert_eq!(head.size, 10);
        assert_eq!(head.metadata["total_lines"], "32");
        assert_eq!(s.get("b", "a/b/c.txt", None).unwrap(), b"0123456789");
        assert_eq!(
            s.get("b", "a/b/c.txt", Some(ByteRange::new(2, 4))).unwrap(),
            b"234"
        );
        // the end of the range is clamped to the object
        assert_eq!(
            s.get("b", "a/b/c.txt", Some(ByteRange::new(8, 100))).unwrap(),
            b"89"
        );
        assert!(matches!(
            s.get("b", "a/b/c.txt", Some(ByteRange::new(10, 12))),
            Err(StoreError::InvalidRequest(_))
        ));
        assert!(s.get("b", "missing", None).unwrap_err().is_not_found());
    }

    #[test]
    fn test_rejects_bad_keys() {
        let (_dir, s) = store();
        for key in ["", "/abs", "a/../b", "dir/"] {
            assert!(matches!(
                s.put("b", key, b"x", &Metadata::new()),
                Err(StoreError::InvalidRequest(_))
            ));
        }
    }

    #[test]
    fn test_list_and_delete() {
        let (_dir, s) = store();
        for key in ["tmp/r1/x/1", "tmp/r1/x/2", "tmp/r1/final.alignment", "gem/g.gem"] {
            s.put("b", key, b"x", &Metadata::new()).unwrap();
        }
        assert_eq!(
            s.list("b", "tmp/r1/").unwrap(),
            vec!["tmp/r1/final.alignment", "tmp/r1/x/1", "tmp/r1/x/2"]
        );
        assert_eq!(s.list("other", "").unwrap(), Vec::<String>::new());
        s.delete_many("b", &["tmp/r1/x/1".into(), "tmp/r1/nope".into()])
            .unwrap();
        assert_eq!(s.list("b", "tmp/").unwrap().len(), 2);
        assert_eq!(s.head("b", "tmp/r1/x/1").unwrap(), None);
    }

    #[test]
    fn test_multipart_upload() {
        let (_dir, s) = store();
        let s = s.with_min_part_size(6);
        s.put("b", "src/one", b"..first-", &Metadata::new()).unwrap();
        let id = s.mpu_create("b", "out/final").unwrap();
        let p1 = s
            .mpu_part_copy("b", "out/final", &id, 1, "b", "src/one", Some(ByteRange::new(2, 7)))
            .unwrap();
        let p2 = s.mpu_part_upload("b", "out/final", &id, 2, b"second").unwrap();
        assert_eq!(s.open_uploads().unwrap(), vec![id.clone()]);

        // parts must be ascending
        assert!(s
            .mpu_complete("b", "out/final", &id, &[p2.clone(), p1.clone()])
            .is_err());
        s.mpu_complete("b", "out/final", &id, &[p1, p2]).unwrap();
        assert_eq!(s.get("b", "out/final", None).unwrap(), b"first-second");
        assert!(s.open_uploads().unwrap().is_empty());
        assert!(matches!(
            s.mpu_abort("b", "out/final", &id),
            Err(StoreError::NoSuchUpload { .. })
        ));
    }

    #[test]
    fn test_short_parts_only_at_the_end() {
        let (_dir, s) = store();
        let s = s.with_min_part_size(4);
        let id = s.mpu_create("b", "k").unwrap();
        let parts = [
            s.mpu_part_upload("b", "k", &id, 1, b"abc").unwrap(),
            s.mpu_part_upload("b", "k", &id, 2, b"de").unwrap(),
        ];
        let err = s.mpu_complete("b", "k", &id, &parts).unwrap_err();
        assert!(matches!(&err, StoreError::InvalidRequest(m) if m.contains("EntityTooSmall")));
        s.mpu_abort("b", "k", &id).unwrap();

        let id = s.mpu_create("b", "k").unwrap();
        let parts = [
            s.mpu_part_upload("b", "k", &id, 1, b"abcd").unwrap(),
            s.mpu_part_upload("b", "k", &id, 2, b"e").unwrap(),
        ];
        s.mpu_complete("b", "k", &id, &parts).unwrap();
        assert_eq!(s.get("b", "k", None).unwrap(), b"abcde");

        // the default is the S3 limit
        let (_dir, s) = store();
        assert_eq!(s.min_part_size(), MIN_PART_SIZE);
    }

    #[test]
    fn test_multipart_abort() {
        let (_dir, s) = store();
        let id = s.mpu_create("b", "k").unwrap();
        s.mpu_part_upload("b", "k", &id, 1, b"x").unwrap();
        assert!(s.mpu_part_upload("b", "k", &id, 0, b"x").is_err());
        assert!(s.mpu_part_upload("b", "other", &id, 2, b"x").is_err());
        s.mpu_abort("b", "k", &id).unwrap();
        assert!(s.open_uploads().unwrap().is_empty());
        assert_eq!(s.head("b", "k").unwrap(), None);
    }

    #[test]
    fn test_select_missing_object() {
        let (_dir, s) = store();
        let q = SelectQuery::column(ColumnRef::new(2, "pos").unwrap(), InputFormat::TSV);
        assert!(matches!(
            s.select("b", "nope.csv", &q),
            Err(StoreError::NotFound { .. })
        ));
        s.put("b", "x.csv", b"c\t1\nc\t2\n", &Metadata::new()).unwrap();
        let rows: Vec<String> = s
            .select("b", "x.csv", &q)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(rows, vec!["1", "2"]);
    }
}
