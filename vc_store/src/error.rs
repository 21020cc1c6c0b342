use std::io;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object {bucket}/{key} does not exist")]
    NotFound { bucket: String, key: String },

    #[error("multipart upload {upload_id} does not exist")]
    NoSuchUpload { upload_id: String },

    /// Throttling, 5xx responses and dropped connections.
    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("invalid storage request: {0}")]
    InvalidRequest(String),

    #[error("select on {bucket}/{key} failed: {reason}")]
    Select {
        bucket: String,
        key: String,
        reason: String,
    },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(bucket: &str, key: &str) -> Self {
        StoreError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        StoreError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// True for errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Transient(_) => true,
            StoreError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

/// Extension for turning io results into [`StoreError::Io`] with a context.
pub(crate) trait IoContext<T> {
    fn io_context<F, S>(self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context<F, S>(self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| StoreError::io(f(), e))
    }
}
