//! Upload module
//!
//! Bridges an ordinary blocking write handle to a background worker that
//! materializes the bytes into a named destination object.
//!
//! # Flow
//!
//! 1. [`begin_upload`] creates a [`handoff`](crate::handoff) pipe, wraps the
//!    producer end in a [`BlockingWriteCloser`] and spawns an [`UploadWorker`]
//!    on the consumer end
//! 2. The caller writes into the handle; every write blocks until the worker
//!    has read it
//! 3. [`BlockingWriteCloser::close`] blocks until the worker has finalized
//!    (or failed) the destination and reports the outcome
//!
//! # Example
//!
//! ```no_run
//! use putbridge::storage::fs::FsDestination;
//! use putbridge::upload::{begin_upload, TransferOptions, UploadRequest};
//! use std::io::Write;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let destination = Arc::new(FsDestination::new("/var/lib/putbridge"));
//! let request = UploadRequest::new("b", "o.txt", 5);
//!
//! let mut handle = begin_upload(destination, request, TransferOptions::default())?;
//! handle.write_all(b"hello")?;
//! handle.close()?;
//! # Ok(())
//! # }
//! ```

use crate::config::Config;
use crate::handoff;
use crate::storage::Destination;
use std::fmt;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub mod blocking;
pub mod copy;
pub mod worker;

pub use blocking::{BlockingWriteCloser, DoubleRelease, Releaser};
pub use copy::{copy_exactly, CopyOutcome};
pub use worker::{UploadWorker, WorkerStage};

/// Default chunk size for the worker's copy loop
pub const DEFAULT_BUFFER_SIZE: usize = 65536; // 64KB

/// Upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Object already exists: {bucket}/{object}")]
    AlreadyExists { bucket: String, object: String },

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Short transfer: expected {expected} bytes, copied {copied}")]
    ShortTransfer { expected: u64, copied: u64 },

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Upload worker exited without releasing the write handle")]
    WorkerLost,

    #[error("Failed to spawn upload worker: {0}")]
    Spawn(#[source] io::Error),
}

impl UploadError {
    /// The `io::ErrorKind` this error surfaces as when it crosses the pipe
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            UploadError::InvalidArgument(_) => io::ErrorKind::InvalidInput,
            UploadError::AlreadyExists { .. } => io::ErrorKind::AlreadyExists,
            UploadError::IoError(e) => e.kind(),
            UploadError::ShortTransfer { .. } => io::ErrorKind::UnexpectedEof,
            UploadError::DigestMismatch { .. } => io::ErrorKind::InvalidData,
            UploadError::WorkerLost | UploadError::Spawn(_) => io::ErrorKind::Other,
        }
    }

    /// Build an `io::Error` carrying this error's kind and message
    pub fn to_io_error(&self) -> io::Error {
        io::Error::new(self.kind(), self.to_string())
    }

    /// Short label used for metrics and log fields
    pub fn label(&self) -> &'static str {
        match self {
            UploadError::InvalidArgument(_) => "invalid_argument",
            UploadError::AlreadyExists { .. } => "already_exists",
            UploadError::IoError(_) => "io",
            UploadError::ShortTransfer { .. } => "short_transfer",
            UploadError::DigestMismatch { .. } => "digest_mismatch",
            UploadError::WorkerLost => "worker_lost",
            UploadError::Spawn(_) => "spawn",
        }
    }
}

/// Identity of a destination object: `join(bucket, object)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectIdentity {
    pub bucket: String,
    pub object: String,
}

impl ObjectIdentity {
    /// Relative path of the object, `bucket/object`
    pub fn join(&self) -> PathBuf {
        Path::new(&self.bucket).join(&self.object)
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.object)
    }
}

/// A single upload request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub bucket: String,
    pub object: String,
    /// Exact number of bytes the caller will write; negative is rejected
    pub size: i64,
    /// Optional lowercase hex SHA-256 of the content
    pub digest: Option<String>,
}

impl UploadRequest {
    pub fn new(bucket: impl Into<String>, object: impl Into<String>, size: i64) -> Self {
        Self {
            bucket: bucket.into(),
            object: object.into(),
            size,
            digest: None,
        }
    }

    /// Attach an expected SHA-256 (hex) to verify after the copy
    pub fn with_digest(mut self, sha256_hex: impl Into<String>) -> Self {
        self.digest = Some(sha256_hex.into());
        self
    }

    /// Validate the request before any destination is touched.
    ///
    /// Checks run in a fixed order: empty names, negative size, unsafe
    /// object paths, malformed digest.
    pub fn validate(&self) -> Result<(ObjectIdentity, u64), UploadError> {
        if self.bucket.is_empty() || self.object.is_empty() {
            return Err(UploadError::InvalidArgument(
                "bucket and object names must not be empty".into(),
            ));
        }

        let size = u64::try_from(self.size).map_err(|_| {
            UploadError::InvalidArgument(format!("declared size {} is negative", self.size))
        })?;

        if !is_single_component(&self.bucket) {
            return Err(UploadError::InvalidArgument(format!(
                "invalid bucket name '{}'",
                self.bucket
            )));
        }
        if !is_relative_key(&self.object) {
            return Err(UploadError::InvalidArgument(format!(
                "invalid object name '{}'",
                self.object
            )));
        }

        if let Some(ref digest) = self.digest {
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(UploadError::InvalidArgument(format!(
                    "digest '{}' is not a hex SHA-256",
                    digest
                )));
            }
        }

        Ok((
            ObjectIdentity {
                bucket: self.bucket.clone(),
                object: self.object.clone(),
            },
            size,
        ))
    }

    /// Compare the copied content's hash against the expected digest
    pub fn verify_digest(&self, outcome: &CopyOutcome) -> Result<(), UploadError> {
        match self.digest {
            Some(ref expected) if !expected.eq_ignore_ascii_case(&outcome.sha256) => {
                Err(UploadError::DigestMismatch {
                    expected: expected.clone(),
                    actual: outcome.sha256.clone(),
                })
            }
            _ => Ok(()),
        }
    }
}

fn is_single_component(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn is_relative_key(name: &str) -> bool {
    Path::new(name)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
}

/// Knobs for the worker side of an upload
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Copy chunk size
    pub buffer_size: usize,
    /// Leave a partially written destination in place on failure
    pub keep_partial: bool,
    /// Record prometheus metrics for this upload
    pub record_metrics: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            keep_partial: false,
            record_metrics: true,
        }
    }
}

impl TransferOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            buffer_size: config.transfer.buffer_size,
            keep_partial: config.storage.keep_partial,
            record_metrics: config.metrics.enabled,
        }
    }
}

/// Start an upload and return its write handle immediately.
///
/// The worker runs concurrently. Validation and destination errors are not
/// reported here; they surface from the handle's `write` or `close`. The
/// only immediate error is a failure to spawn the worker thread.
pub fn begin_upload<D: Destination>(
    destination: Arc<D>,
    request: UploadRequest,
    options: TransferOptions,
) -> Result<BlockingWriteCloser, UploadError> {
    let (reader, writer) = handoff::pipe();
    let (handle, releaser) = BlockingWriteCloser::new(writer);

    UploadWorker::new(destination, request, reader, releaser, options).spawn()?;
    Ok(handle)
}

/// A destination plus transfer options, for issuing many uploads
pub struct Uploader<D: Destination> {
    destination: Arc<D>,
    options: TransferOptions,
}

impl<D: Destination> Uploader<D> {
    pub fn new(destination: Arc<D>, options: TransferOptions) -> Self {
        Self {
            destination,
            options,
        }
    }

    /// Begin an upload of `size` bytes to `bucket/object`
    pub fn put(
        &self,
        bucket: &str,
        object: &str,
        size: i64,
    ) -> Result<BlockingWriteCloser, UploadError> {
        self.put_request(UploadRequest::new(bucket, object, size))
    }

    pub fn put_request(&self, request: UploadRequest) -> Result<BlockingWriteCloser, UploadError> {
        begin_upload(Arc::clone(&self.destination), request, self.options.clone())
    }

    /// Stream `source` through a write handle and wait for the worker.
    ///
    /// Reads at most `request.size` bytes from `source`; anything past the
    /// declared size is left unread. Returns the number of bytes handed off.
    /// A read error on `source` aborts the upload so the worker discards the
    /// partial object.
    pub fn put_reader<R: Read>(
        &self,
        request: UploadRequest,
        source: &mut R,
    ) -> Result<u64, UploadError> {
        // A negative size fails validation; hand the worker nothing.
        let limit = u64::try_from(request.size).unwrap_or(0);
        let mut handle = self.put_request(request)?;
        match io::copy(&mut source.by_ref().take(limit), &mut handle) {
            Ok(n) => {
                handle.close()?;
                Ok(n)
            }
            Err(e) => Err(handle.abort(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_ok() {
        let (identity, size) = UploadRequest::new("b", "dir/o.txt", 5).validate().unwrap();
        assert_eq!(identity.to_string(), "b/dir/o.txt");
        assert_eq!(identity.join(), PathBuf::from("b/dir/o.txt"));
        assert_eq!(size, 5);
    }

    #[test]
    fn test_validate_empty_names() {
        for (bucket, object) in [("", "o"), ("b", ""), ("", "")] {
            let err = UploadRequest::new(bucket, object, 1).validate().unwrap_err();
            assert!(matches!(err, UploadError::InvalidArgument(_)));
        }
    }

    #[test]
    fn test_validate_empty_name_checked_before_size() {
        let err = UploadRequest::new("", "o", -1).validate().unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_validate_negative_size() {
        let err = UploadRequest::new("b", "o", -1).validate().unwrap_err();
        assert!(matches!(err, UploadError::InvalidArgument(_)));
        assert!(err.to_string().contains("negative"));
    }

    #[test]
    fn test_validate_rejects_traversal() {
        for object in ["../escape", "/etc/passwd", "a/../../b", "./o"] {
            let err = UploadRequest::new("b", object, 1).validate().unwrap_err();
            assert!(
                matches!(err, UploadError::InvalidArgument(_)),
                "{object} should be rejected"
            );
        }
        let err = UploadRequest::new("a/b", "o", 1).validate().unwrap_err();
        assert!(matches!(err, UploadError::InvalidArgument(_)));
    }

    #[test]
    fn test_validate_digest_format() {
        let err = UploadRequest::new("b", "o", 1)
            .with_digest("not-hex")
            .validate()
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidArgument(_)));

        let ok = UploadRequest::new("b", "o", 1).with_digest("a".repeat(64));
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            UploadError::InvalidArgument("x".into()).kind(),
            io::ErrorKind::InvalidInput
        );
        assert_eq!(
            UploadError::ShortTransfer {
                expected: 5,
                copied: 3
            }
            .kind(),
            io::ErrorKind::UnexpectedEof
        );
        let io_err = UploadError::from(io::Error::new(io::ErrorKind::PermissionDenied, "no"));
        assert_eq!(io_err.to_io_error().kind(), io::ErrorKind::PermissionDenied);
        assert_eq!(io_err.label(), "io");
    }
}
