//! Multipart uploads opened during a run, so a failed run can abort them.

use log::{info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use vc_store::ObjectStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenUpload {
    pub key: String,
    pub upload_id: String,
}

/// Shared between the stages that open and complete uploads and the
/// controller that aborts whatever is left on failure.
#[derive(Debug, Clone, Default)]
pub struct UploadRegistry {
    open: Arc<Mutex<Vec<OpenUpload>>>,
}

impl UploadRegistry {
    fn lock(&self) -> MutexGuard<'_, Vec<OpenUpload>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, key: &str, upload_id: &str) {
        let upload = OpenUpload {
            key: key.to_string(),
            upload_id: upload_id.to_string(),
        };
        let mut open = self.lock();
        if !open.contains(&upload) {
            open.push(upload);
        }
    }

    /// The upload was completed or aborted.
    pub fn forget(&self, key: &str, upload_id: &str) {
        self.lock()
            .retain(|u| !(u.key == key && u.upload_id == upload_id));
    }

    pub fn open(&self) -> Vec<OpenUpload> {
        self.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Abort every open upload and return how many were aborted. Failures are
    /// logged, not returned: the upload may already be gone.
    pub fn abort_all(&self, store: &dyn ObjectStore, bucket: &str) -> usize {
        let open = std::mem::take(&mut *self.lock());
        let mut aborted = 0;
        for upload in &open {
            match store.mpu_abort(bucket, &upload.key, &upload.upload_id) {
                Ok(()) => aborted += 1,
                Err(e) => warn!(
                    "could not abort upload {} of {bucket}/{}: {e}",
                    upload.upload_id, upload.key
                ),
            }
        }
        if aborted > 0 {
            info!("aborted {aborted} open multipart upload(s)");
        }
        aborted
    }
}
