//! Upload worker
//!
//! One worker thread per upload. It drives a linear state machine:
//!
//! ```text
//! Validate -> CreateDestination -> CopyBytes -> Finalize
//!     \              \                  \           \
//!      +--------------+------------------+-----------+--> Failed
//! ```
//!
//! Every exit path performs exactly one [`Releaser::release`] and exactly
//! one close of the pipe's consumer end. On failure the pipe is closed with
//! the error first, so a blocked `write` unblocks with it, then the handle
//! is released. On success the handle is released first, then the pipe is
//! closed cleanly.

use super::copy::{copy_exactly, CopyOutcome};
use super::{DoubleRelease, ObjectIdentity, Releaser, TransferOptions, UploadError, UploadRequest};
use crate::handoff::PipeReader;
use crate::storage::{Destination, Sink};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Stage of the worker state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStage {
    Validate,
    CreateDestination,
    CopyBytes,
    Finalize,
}

impl fmt::Display for WorkerStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerStage::Validate => "validate",
            WorkerStage::CreateDestination => "create_destination",
            WorkerStage::CopyBytes => "copy_bytes",
            WorkerStage::Finalize => "finalize",
        };
        f.write_str(name)
    }
}

/// Background task that owns the destination and the pipe's consumer end
pub struct UploadWorker<D: Destination> {
    destination: Arc<D>,
    request: UploadRequest,
    reader: PipeReader,
    releaser: Releaser,
    options: TransferOptions,
    stage: WorkerStage,
}

impl<D: Destination> UploadWorker<D> {
    pub fn new(
        destination: Arc<D>,
        request: UploadRequest,
        reader: PipeReader,
        releaser: Releaser,
        options: TransferOptions,
    ) -> Self {
        Self {
            destination,
            request,
            reader,
            releaser,
            options,
            stage: WorkerStage::Validate,
        }
    }

    /// Run the worker on its own thread
    ///
    /// A panic inside the worker ends only this thread, and the waiting
    /// handle sees [`UploadError::WorkerLost`]. A double release is the
    /// exception: it aborts the process.
    pub fn spawn(self) -> Result<JoinHandle<()>, UploadError> {
        thread::Builder::new()
            .name("putbridge-upload".into())
            .spawn(move || {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.run())) {
                    if DoubleRelease::matches(payload.as_ref()) {
                        error!("{}; aborting", DoubleRelease::MESSAGE);
                        std::process::abort();
                    }
                    panic::resume_unwind(payload);
                }
            })
            .map_err(UploadError::Spawn)
    }

    /// Run the worker to completion on the current thread
    pub fn run(mut self) {
        let span = tracing::debug_span!(
            "upload.worker",
            bucket = %self.request.bucket,
            object = %self.request.object,
            size = self.request.size,
        );
        let _enter = span.enter();
        let started = Instant::now();

        match self.transfer() {
            Ok(outcome) => {
                let elapsed = started.elapsed();
                info!(
                    bytes = outcome.bytes,
                    sha256 = %outcome.sha256,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Upload complete"
                );
                self.record_success(outcome.bytes, elapsed.as_secs_f64());

                self.releaser.release(Ok(()));
                self.reader.close();
            }
            Err(err) => {
                warn!(stage = %self.stage, error = %err, "Upload failed");
                self.record_failure(&err);

                self.reader.close_with_error(err.to_io_error());
                self.releaser.release(Err(err));
            }
        }
    }

    fn transfer(&mut self) -> Result<CopyOutcome, UploadError> {
        let (identity, size) = self.request.validate()?;

        self.stage = WorkerStage::CreateDestination;
        debug!(stage = %self.stage, "Creating destination");
        let mut sink = self.destination.create_exclusive(&identity, size)?;

        // From here on the destination exists and is ours to clean up.
        self.stage = WorkerStage::CopyBytes;
        debug!(stage = %self.stage, "Copying bytes");
        let copied = copy_exactly(&mut sink, &mut self.reader, size, self.options.buffer_size)
            .and_then(|outcome| self.request.verify_digest(&outcome).map(|()| outcome));
        let outcome = match copied {
            Ok(outcome) => outcome,
            Err(err) => {
                drop(sink);
                self.discard_partial(&identity);
                return Err(err);
            }
        };

        self.stage = WorkerStage::Finalize;
        debug!(stage = %self.stage, bytes = outcome.bytes, "Finalizing destination");
        if let Err(err) = sink.finalize() {
            self.discard_partial(&identity);
            return Err(err);
        }

        Ok(outcome)
    }

    fn discard_partial(&self, identity: &ObjectIdentity) {
        if self.options.keep_partial {
            debug!(object = %identity, "Keeping partial destination");
            return;
        }
        if let Err(e) = self.destination.discard(identity) {
            warn!(object = %identity, error = %e, "Failed to discard partial destination");
        }
    }

    #[cfg(feature = "metrics")]
    fn record_success(&self, bytes: u64, duration_secs: f64) {
        if self.options.record_metrics {
            crate::metrics::record_upload_success(&self.request.bucket, bytes);
            crate::metrics::record_upload_duration(&self.request.bucket, duration_secs);
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn record_success(&self, _bytes: u64, _duration_secs: f64) {}

    #[cfg(feature = "metrics")]
    fn record_failure(&self, err: &UploadError) {
        if self.options.record_metrics {
            crate::metrics::record_upload_failure(&self.request.bucket);
            crate::metrics::record_error(err.label());
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn record_failure(&self, _err: &UploadError) {}
}
